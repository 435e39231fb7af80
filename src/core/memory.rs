//! Memory - Traced process memory access
//!
//! Raw byte reads and writes against another process's address space.
//! On Linux this goes through `/proc/<pid>/mem`, which works on any mapping
//! the tracer is allowed to ptrace, including read-only text pages.

use thiserror::Error;

/// Memory operation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MemoryError {
    #[error("Failed to read memory at {address:#x}: {reason}")]
    ReadFailed { address: u64, reason: String },

    #[error("Failed to write memory at {address:#x}: {reason}")]
    WriteFailed { address: u64, reason: String },

    #[error("Short transfer at {address:#x}: {done} of {wanted} bytes")]
    ShortTransfer {
        address: u64,
        wanted: usize,
        done: usize,
    },

    #[error("Address {address:#x} is not mapped")]
    Unmapped { address: u64 },
}

/// Handle on `/proc/<pid>/mem` for one traced process.
#[derive(Debug, Clone)]
pub struct ProcMem {
    pid: i32,
}

impl ProcMem {
    pub fn new(pid: i32) -> Self {
        Self { pid }
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    fn mem_path(&self) -> String {
        format!("/proc/{}/mem", self.pid)
    }

    /// Read exactly `len` bytes at `address`
    pub fn read(&self, address: u64, len: usize) -> Result<Vec<u8>, MemoryError> {
        let mut buffer = vec![0u8; len];
        let done = self.read_into(address, &mut buffer)?;
        if done != len {
            return Err(MemoryError::ShortTransfer {
                address,
                wanted: len,
                done,
            });
        }
        Ok(buffer)
    }

    /// Write all of `data` at `address`
    pub fn write(&self, address: u64, data: &[u8]) -> Result<(), MemoryError> {
        let done = self.write_from(address, data)?;
        if done != data.len() {
            return Err(MemoryError::ShortTransfer {
                address,
                wanted: data.len(),
                done,
            });
        }
        Ok(())
    }

    fn read_into(&self, address: u64, buffer: &mut [u8]) -> Result<usize, MemoryError> {
        use std::fs::File;
        use std::io::{Read, Seek, SeekFrom};

        let fail = |e: std::io::Error| MemoryError::ReadFailed {
            address,
            reason: e.to_string(),
        };

        let mut file = File::open(self.mem_path()).map_err(fail)?;
        file.seek(SeekFrom::Start(address)).map_err(fail)?;

        let mut done = 0;
        while done < buffer.len() {
            match file.read(&mut buffer[done..]) {
                Ok(0) => break,
                Ok(n) => done += n,
                Err(e) if is_unmapped(&e) && done == 0 => {
                    return Err(MemoryError::Unmapped { address })
                }
                Err(e) => return Err(fail(e)),
            }
        }
        Ok(done)
    }

    fn write_from(&self, address: u64, data: &[u8]) -> Result<usize, MemoryError> {
        use std::fs::OpenOptions;
        use std::io::{Seek, SeekFrom, Write};

        let fail = |e: std::io::Error| MemoryError::WriteFailed {
            address,
            reason: e.to_string(),
        };

        let mut file = OpenOptions::new()
            .write(true)
            .open(self.mem_path())
            .map_err(fail)?;
        file.seek(SeekFrom::Start(address)).map_err(fail)?;

        let mut done = 0;
        while done < data.len() {
            match file.write(&data[done..]) {
                Ok(0) => break,
                Ok(n) => done += n,
                Err(e) if is_unmapped(&e) && done == 0 => {
                    return Err(MemoryError::Unmapped { address })
                }
                Err(e) => return Err(fail(e)),
            }
        }
        Ok(done)
    }
}

/// EIO from `/proc/<pid>/mem` means the page is not mapped
#[cfg(target_os = "linux")]
fn is_unmapped(e: &std::io::Error) -> bool {
    e.raw_os_error() == Some(nix::libc::EIO)
}

#[cfg(not(target_os = "linux"))]
fn is_unmapped(_e: &std::io::Error) -> bool {
    false
}
