//! Breakpoint - one patched code location
//!
//! A breakpoint owns the bytes its trap instruction displaced and a nesting
//! counter. Only the 0 -> 1 and 1 -> 0 transitions of that counter touch the
//! inferior's memory, so independent users can turn the same breakpoint on and
//! off without coordinating.

pub mod table;


use std::fmt;
use std::sync::{Arc, Weak};

use thiserror::Error;

use crate::arch::{Arch, ArchData};
use crate::core::{Inferior, InferiorError, MemoryError};
use crate::symbol::{Library, LibrarySymbol};

pub use table::BreakpointTable;

/// Breakpoint errors
#[derive(Error, Debug)]
pub enum BreakpointError {
    #[error("Invalid breakpoint address {address:#x}")]
    InvalidAddress { address: u64 },

    #[error("Out of memory registering breakpoint at {address:#x}")]
    Allocation { address: u64 },

    #[error("Memory access failed for breakpoint at {address:#x}")]
    MemoryAccess {
        address: u64,
        #[source]
        source: MemoryError,
    },

    #[error("Breakpoint at {address:#x}: {reason}")]
    InvalidState { address: u64, reason: &'static str },

    #[error("Cannot clone breakpoint at {address:#x}: {reason}")]
    CloneFailure { address: u64, reason: String },

    #[error("Execution control failed at breakpoint {address:#x}")]
    Inferior {
        address: u64,
        #[source]
        source: InferiorError,
    },

    #[error("Process {pid} has no breakpoint table")]
    NoTable { pid: i32 },
}

impl BreakpointError {
    /// Activation may succeed later, e.g. once the enclosing library is mapped.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, BreakpointError::MemoryAccess { .. })
    }
}

/// Behavior attached to a breakpoint.
///
/// Both methods have defaults, so an implementor only overrides what it
/// needs. Whatever `on_continue` does, it must leave the inferior running.
pub trait BreakpointCallbacks: Send + Sync {
    /// The inferior stopped on this breakpoint; PC already points at it.
    fn on_hit(&self, _bp: &Breakpoint, _inferior: &mut dyn Inferior) -> Result<(), BreakpointError> {
        Ok(())
    }

    /// Get the inferior going again.
    fn on_continue(&self, bp: &Breakpoint, inferior: &mut dyn Inferior) -> Result<(), BreakpointError> {
        bp.continue_after_breakpoint(inferior)
    }
}

pub struct Breakpoint {
    address: u64,
    arch: Arch,
    /// Bytes displaced by the trap; empty while inactive
    orig_value: Vec<u8>,
    enabled: u32,
    /// Count taken away by `suspend`, given back by `reactivate`
    suspended: u32,
    callbacks: Option<Arc<dyn BreakpointCallbacks>>,
    symbol: Option<Weak<LibrarySymbol>>,
    arch_data: ArchData,
}

impl Breakpoint {
    /// Create an inactive breakpoint. Nothing is written until [`turn_on`].
    ///
    /// [`turn_on`]: Breakpoint::turn_on
    pub fn new(
        arch: Arch,
        address: u64,
        symbol: Option<&Arc<LibrarySymbol>>,
    ) -> Result<Self, BreakpointError> {
        if address == 0 {
            return Err(BreakpointError::InvalidAddress { address });
        }
        Ok(Self {
            address,
            arch,
            orig_value: Vec::new(),
            enabled: 0,
            suspended: 0,
            callbacks: None,
            symbol: symbol.map(Arc::downgrade),
            arch_data: ArchData::new(arch),
        })
    }

    pub fn address(&self) -> u64 {
        self.address
    }

    pub fn arch(&self) -> Arch {
        self.arch
    }

    pub fn enable_count(&self) -> u32 {
        self.enabled
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled > 0
    }

    /// Code displaced by the trap, available while the breakpoint is active
    pub fn original_bytes(&self) -> Option<&[u8]> {
        if self.enabled > 0 {
            Some(&self.orig_value)
        } else {
            None
        }
    }

    pub fn arch_data(&self) -> &ArchData {
        &self.arch_data
    }

    pub fn symbol(&self) -> Option<Arc<LibrarySymbol>> {
        self.symbol.as_ref().and_then(Weak::upgrade)
    }

    /// Name of the associated symbol. `None` for service breakpoints.
    pub fn name(&self) -> Option<String> {
        self.symbol().map(|sym| sym.name.clone())
    }

    pub fn library(&self) -> Option<Arc<Library>> {
        self.symbol().map(|sym| Arc::clone(&sym.library))
    }

    /// Internal bookkeeping breakpoint with no symbol attached
    pub fn is_service(&self) -> bool {
        self.symbol.is_none()
    }

    pub fn has_callbacks(&self) -> bool {
        self.callbacks.is_some()
    }

    /// Attach behavior. Replacing existing callbacks is refused.
    pub fn set_callbacks(&mut self, cbs: Arc<dyn BreakpointCallbacks>) -> Result<(), BreakpointError> {
        if self.callbacks.is_some() {
            log::error!("{:#x}: callbacks already set", self.address);
            return Err(BreakpointError::InvalidState {
                address: self.address,
                reason: "callbacks already set",
            });
        }
        self.callbacks = Some(cbs);
        Ok(())
    }

    /// Count saved by the last [`suspend`](Self::suspend), zero if none
    pub fn suspended_count(&self) -> u32 {
        self.suspended
    }

    /// Activate once more. Only the first activation writes the trap; an
    /// explicit activation also forgets any count saved by `suspend`.
    pub fn turn_on(&mut self, inferior: &mut dyn Inferior) -> Result<(), BreakpointError> {
        self.enabled = self.enabled.saturating_add(1);
        if self.enabled == 1 {
            if let Err(err) = self.enable(inferior) {
                self.enabled = 0;
                log::warn!(
                    "{:#x}: activation in pid {} failed: {}",
                    self.address,
                    inferior.pid(),
                    err
                );
                return Err(err);
            }
            self.suspended = 0;
        }
        Ok(())
    }

    pub fn turn_off(&mut self, inferior: &mut dyn Inferior) -> Result<(), BreakpointError> {
        match self.enabled {
            0 => {
                log::error!("{:#x}: turned off while inactive", self.address);
                Err(BreakpointError::InvalidState {
                    address: self.address,
                    reason: "turned off more often than turned on",
                })
            }
            1 => {
                self.disable(inferior)?;
                self.enabled = 0;
                self.orig_value.clear();
                Ok(())
            }
            _ => {
                self.enabled -= 1;
                Ok(())
            }
        }
    }

    /// Deactivate regardless of how many times the breakpoint was turned on.
    pub fn turn_off_all(&mut self, inferior: &mut dyn Inferior) -> Result<(), BreakpointError> {
        if self.enabled > 0 {
            self.disable(inferior)?;
            self.enabled = 0;
            self.orig_value.clear();
        }
        self.suspended = 0;
        Ok(())
    }

    /// Like [`turn_off_all`](Self::turn_off_all), but remember the count so
    /// that [`reactivate`](Self::reactivate) can restore it.
    pub fn suspend(&mut self, inferior: &mut dyn Inferior) -> Result<(), BreakpointError> {
        if self.enabled == 0 {
            return Ok(());
        }
        self.disable(inferior)?;
        self.suspended = self.enabled;
        self.enabled = 0;
        self.orig_value.clear();
        Ok(())
    }

    /// Bring an inactive breakpoint back: to its suspended count if it has
    /// one, to 1 otherwise. Active breakpoints are left alone.
    pub fn reactivate(&mut self, inferior: &mut dyn Inferior) -> Result<(), BreakpointError> {
        if self.enabled > 0 {
            return Ok(());
        }
        self.enable(inferior)?;
        self.enabled = self.suspended.max(1);
        self.suspended = 0;
        Ok(())
    }

    pub fn on_hit(&self, inferior: &mut dyn Inferior) -> Result<(), BreakpointError> {
        match &self.callbacks {
            Some(cbs) => cbs.on_hit(self, inferior),
            None => Ok(()),
        }
    }

    pub fn on_continue(&self, inferior: &mut dyn Inferior) -> Result<(), BreakpointError> {
        match &self.callbacks {
            Some(cbs) => cbs.on_continue(self, inferior),
            None => self.continue_after_breakpoint(inferior),
        }
    }

    /// Step over the original instruction with the trap lifted, re-arm, resume.
    ///
    /// Expects the inferior's PC to already point at the breakpoint address.
    pub fn continue_after_breakpoint(&self, inferior: &mut dyn Inferior) -> Result<(), BreakpointError> {
        let address = self.address;
        let armed = self.enabled > 0;
        let memory_error = |source| BreakpointError::MemoryAccess { address, source };

        if armed {
            inferior
                .write_memory(address, &self.orig_value)
                .map_err(memory_error)?;
        }

        let stepped = inferior.single_step();

        if armed {
            if let Err(source) = inferior.write_memory(address, self.arch.trap_bytes()) {
                if stepped.is_ok() {
                    return Err(memory_error(source));
                }
                log::warn!("{:#x}: could not re-arm after failed step: {}", address, source);
            }
        }

        stepped.map_err(|source| BreakpointError::Inferior { address, source })?;
        inferior
            .resume()
            .map_err(|source| BreakpointError::Inferior { address, source })
    }

    /// Make an equivalent breakpoint for `new`, a fresh copy of `old`'s
    /// address space. Counter and saved bytes carry over since the copied
    /// memory already holds the same traps.
    pub fn clone_into(
        &self,
        old: &dyn Inferior,
        new: &mut dyn Inferior,
    ) -> Result<Breakpoint, BreakpointError> {
        let arch_data = self.arch_data.clone_for(self.address, new)?;
        log::debug!(
            "{:#x}: cloned from pid {} into pid {}",
            self.address,
            old.pid(),
            new.pid()
        );
        Ok(Breakpoint {
            address: self.address,
            arch: self.arch,
            orig_value: self.orig_value.clone(),
            enabled: self.enabled,
            suspended: self.suspended,
            callbacks: self.callbacks.clone(),
            symbol: self.symbol.clone(),
            arch_data,
        })
    }

    /// Give back process resources held by the payload of a breakpoint that
    /// is being thrown away without ever being registered.
    pub(crate) fn discard(mut self, inferior: &mut dyn Inferior) {
        self.arch_data.teardown(inferior);
    }

    fn enable(&mut self, inferior: &mut dyn Inferior) -> Result<(), BreakpointError> {
        let address = self.address;
        let trap = self.arch.trap_bytes();

        let orig = inferior
            .read_memory(address, trap.len())
            .map_err(|source| BreakpointError::MemoryAccess { address, source })?;

        if let Err(source) = inferior.write_memory(address, trap) {
            if !matches!(source, MemoryError::Unmapped { .. }) {
                restore_after_failure(inferior, address, &orig);
            }
            return Err(BreakpointError::MemoryAccess { address, source });
        }

        if let Err(err) = self.arch_data.init(address, inferior) {
            restore_after_failure(inferior, address, &orig);
            return Err(err);
        }

        log::debug!(
            "{:#x}: trap installed in pid {}, saved {}",
            address,
            inferior.pid(),
            hex::encode(&orig)
        );
        self.orig_value = orig;
        Ok(())
    }

    fn disable(&mut self, inferior: &mut dyn Inferior) -> Result<(), BreakpointError> {
        let address = self.address;
        inferior
            .write_memory(address, &self.orig_value)
            .map_err(|source| BreakpointError::MemoryAccess { address, source })?;
        self.arch_data.teardown(inferior);
        log::debug!("{:#x}: original code restored in pid {}", address, inferior.pid());
        Ok(())
    }
}

fn restore_after_failure(inferior: &mut dyn Inferior, address: u64, orig: &[u8]) {
    if let Err(err) = inferior.write_memory(address, orig) {
        log::error!("{:#x}: could not restore original code: {}", address, err);
    }
}

impl fmt::Debug for Breakpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Breakpoint")
            .field("address", &format_args!("{:#x}", self.address))
            .field("arch", &self.arch)
            .field("enabled", &self.enabled)
            .field("suspended", &self.suspended)
            .field("orig_value", &hex::encode(&self.orig_value))
            .field("name", &self.name())
            .field("has_callbacks", &self.callbacks.is_some())
            .field("arch_data", &self.arch_data)
            .finish()
    }
}
