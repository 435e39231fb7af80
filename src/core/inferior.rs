//! Inferior - the traced process as seen by the breakpoint core
//!
//! The control loop owns the actual process; breakpoints only need byte-level
//! memory access and the handful of execution primitives used to step past a
//! trap. Everything here is blocking: a call either completes or fails.

use thiserror::Error;

use super::memory::MemoryError;

/// Execution control errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InferiorError {
    #[error("ptrace request {request} failed for pid {pid}: {reason}")]
    Ptrace {
        pid: i32,
        request: &'static str,
        reason: String,
    },

    #[error("Unexpected stop of pid {pid}: {status}")]
    UnexpectedStop { pid: i32, status: String },

    #[error("Process {pid} is gone")]
    Gone { pid: i32 },
}

/// Synchronous access to one stopped, traced process.
///
/// Implementations must be object safe; the breakpoint core only ever sees
/// `&mut dyn Inferior`.
pub trait Inferior {
    /// OS process id, used for diagnostics
    fn pid(&self) -> i32;

    /// Read exactly `len` bytes at `address`
    fn read_memory(&self, address: u64, len: usize) -> Result<Vec<u8>, MemoryError>;

    /// Write all of `data` at `address`
    fn write_memory(&mut self, address: u64, data: &[u8]) -> Result<(), MemoryError>;

    fn instruction_pointer(&mut self) -> Result<u64, InferiorError>;

    fn set_instruction_pointer(&mut self, pc: u64) -> Result<(), InferiorError>;

    /// Execute one instruction and wait until the inferior stops again
    fn single_step(&mut self) -> Result<(), InferiorError>;

    /// Let the inferior run until its next stop
    fn resume(&mut self) -> Result<(), InferiorError>;

    /// Reserve a hardware debug-register slot for `address`.
    ///
    /// Returns `None` when the platform has no free slot or no hardware
    /// breakpoint support at all.
    fn claim_debug_slot(&mut self, _address: u64) -> Option<u8> {
        None
    }

    fn release_debug_slot(&mut self, _slot: u8) {}
}
