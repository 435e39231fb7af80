//! ptrace-backed `Inferior` for one stopped Linux process.

use nix::errno::Errno;
use nix::sys::ptrace;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

use crate::core::{Inferior, InferiorError, MemoryError, ProcMem};

/// A traced Linux process. Memory goes through `/proc/<pid>/mem`, registers
/// and execution control through ptrace.
#[derive(Debug)]
pub struct LinuxInferior {
    pid: Pid,
    mem: ProcMem,
    /// Signals intercepted while single-stepping, owed to the process
    pending_signals: Vec<Signal>,
}

impl LinuxInferior {
    pub fn new(pid: Pid) -> Self {
        Self {
            pid,
            mem: ProcMem::new(pid.as_raw()),
            pending_signals: Vec::new(),
        }
    }

    pub fn raw_pid(&self) -> Pid {
        self.pid
    }

    pub fn pending_signals(&self) -> &[Signal] {
        &self.pending_signals
    }

    /// Hand back the signals held during stepping. The first one is returned
    /// for injection by the next restarting request; the others are queued
    /// on the process again.
    pub fn take_pending_signal(&mut self) -> Option<Signal> {
        let mut signals = std::mem::take(&mut self.pending_signals).into_iter();
        let first = signals.next();
        for sig in signals {
            if let Err(e) = signal::kill(self.pid, sig) {
                log::warn!("pid {}: could not re-raise {}: {}", self.pid, sig, e);
            }
        }
        first
    }

    fn ptrace_error(&self, request: &'static str, errno: Errno) -> InferiorError {
        if errno == Errno::ESRCH {
            return InferiorError::Gone {
                pid: self.pid.as_raw(),
            };
        }
        InferiorError::Ptrace {
            pid: self.pid.as_raw(),
            request,
            reason: errno.desc().to_string(),
        }
    }
}

impl Inferior for LinuxInferior {
    fn pid(&self) -> i32 {
        self.pid.as_raw()
    }

    fn read_memory(&self, address: u64, len: usize) -> Result<Vec<u8>, MemoryError> {
        self.mem.read(address, len)
    }

    fn write_memory(&mut self, address: u64, data: &[u8]) -> Result<(), MemoryError> {
        self.mem.write(address, data)
    }

    #[cfg(target_arch = "x86_64")]
    fn instruction_pointer(&mut self) -> Result<u64, InferiorError> {
        let regs = ptrace::getregs(self.pid).map_err(|e| self.ptrace_error("GETREGS", e))?;
        Ok(regs.rip)
    }

    #[cfg(target_arch = "x86_64")]
    fn set_instruction_pointer(&mut self, pc: u64) -> Result<(), InferiorError> {
        let mut regs = ptrace::getregs(self.pid).map_err(|e| self.ptrace_error("GETREGS", e))?;
        regs.rip = pc;
        ptrace::setregs(self.pid, regs).map_err(|e| self.ptrace_error("SETREGS", e))
    }

    #[cfg(any(target_arch = "aarch64", target_arch = "riscv64"))]
    fn instruction_pointer(&mut self) -> Result<u64, InferiorError> {
        let regs = ptrace::getregs(self.pid).map_err(|e| self.ptrace_error("GETREGS", e))?;
        Ok(regs.pc)
    }

    #[cfg(any(target_arch = "aarch64", target_arch = "riscv64"))]
    fn set_instruction_pointer(&mut self, pc: u64) -> Result<(), InferiorError> {
        let mut regs = ptrace::getregs(self.pid).map_err(|e| self.ptrace_error("GETREGS", e))?;
        regs.pc = pc;
        ptrace::setregs(self.pid, regs).map_err(|e| self.ptrace_error("SETREGS", e))
    }

    // nix has no register-set helpers for ppc64
    #[cfg(target_arch = "powerpc64")]
    fn instruction_pointer(&mut self) -> Result<u64, InferiorError> {
        Err(self.ptrace_error("GETREGS", Errno::ENOTSUP))
    }

    #[cfg(target_arch = "powerpc64")]
    fn set_instruction_pointer(&mut self, _pc: u64) -> Result<(), InferiorError> {
        Err(self.ptrace_error("SETREGS", Errno::ENOTSUP))
    }

    fn single_step(&mut self) -> Result<(), InferiorError> {
        loop {
            ptrace::step(self.pid, None).map_err(|e| self.ptrace_error("SINGLESTEP", e))?;
            let status = loop {
                match waitpid(self.pid, Some(WaitPidFlag::__WALL)) {
                    Err(Errno::EINTR) => continue,
                    other => break other,
                }
            };
            match status {
                Ok(WaitStatus::Stopped(_, Signal::SIGTRAP)) => return Ok(()),
                // Delivery stop before the instruction ran: hold the signal
                // and step again.
                Ok(WaitStatus::Stopped(_, sig)) => {
                    log::debug!("pid {}: holding {} during single-step", self.pid, sig);
                    self.pending_signals.push(sig);
                }
                Ok(WaitStatus::Exited(..)) | Ok(WaitStatus::Signaled(..)) => {
                    return Err(InferiorError::Gone {
                        pid: self.pid.as_raw(),
                    })
                }
                Ok(other) => {
                    return Err(InferiorError::UnexpectedStop {
                        pid: self.pid.as_raw(),
                        status: format!("{:?}", other),
                    })
                }
                Err(e) => return Err(self.ptrace_error("waitpid", e)),
            }
        }
    }

    fn resume(&mut self) -> Result<(), InferiorError> {
        let sig = self.take_pending_signal();
        ptrace::cont(self.pid, sig).map_err(|e| self.ptrace_error("CONT", e))
    }
}
