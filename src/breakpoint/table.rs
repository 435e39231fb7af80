//! Per-process breakpoint table, keyed by address.

use std::collections::hash_map::{Entry, HashMap};
use std::sync::Arc;

use super::{Breakpoint, BreakpointError};
use crate::arch::Arch;
use crate::core::Inferior;
use crate::symbol::LibrarySymbol;

/// Owns every breakpoint of one traced process.
///
/// Callers only ever borrow entries, so removing one cannot leave a dangling
/// handle behind.
#[derive(Debug)]
pub struct BreakpointTable {
    arch: Arch,
    entries: HashMap<u64, Breakpoint>,
}

impl BreakpointTable {
    pub fn new(arch: Arch) -> Self {
        Self {
            arch,
            entries: HashMap::new(),
        }
    }

    pub fn arch(&self) -> Arch {
        self.arch
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, address: u64) -> bool {
        self.entries.contains_key(&address)
    }

    pub fn get(&self, address: u64) -> Option<&Breakpoint> {
        self.entries.get(&address)
    }

    pub fn get_mut(&mut self, address: u64) -> Option<&mut Breakpoint> {
        self.entries.get_mut(&address)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Breakpoint> {
        self.entries.values()
    }

    /// Registered breakpoints whose activation has not succeeded yet
    pub fn pending_count(&self) -> usize {
        self.entries.values().filter(|bp| !bp.is_enabled()).count()
    }

    /// Register a breakpoint at `address` (if there is none yet) and turn it on.
    ///
    /// An existing breakpoint is turned on once more and returned as is. A new
    /// breakpoint whose activation fails stays registered, inactive, so that
    /// [`enable_all`](Self::enable_all) can retry it.
    pub fn insert(
        &mut self,
        inferior: &mut dyn Inferior,
        address: u64,
        symbol: Option<&Arc<LibrarySymbol>>,
    ) -> Result<&Breakpoint, BreakpointError> {
        if !self.entries.contains_key(&address) {
            self.reserve(address, 1)?;
        }

        let arch = self.arch;
        let bp = match self.entries.entry(address) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let bp = Breakpoint::new(arch, address, symbol)?;
                log::debug!(
                    "{:#x}: new breakpoint {} in pid {}",
                    address,
                    bp.name().as_deref().unwrap_or("<service>"),
                    inferior.pid()
                );
                entry.insert(bp)
            }
        };

        bp.turn_on(inferior)?;
        Ok(&*bp)
    }

    /// Force the breakpoint off and drop it. Absent addresses are ignored.
    pub fn delete(&mut self, inferior: &mut dyn Inferior, address: u64) -> Result<(), BreakpointError> {
        let Some(bp) = self.entries.get_mut(&address) else {
            return Ok(());
        };
        bp.turn_off_all(inferior)?;
        self.entries.remove(&address);
        log::debug!("{:#x}: breakpoint deleted from pid {}", address, inferior.pid());
        Ok(())
    }

    /// Activate every inactive entry: back to the count `disable_all` took
    /// from it, or to 1. Active entries keep their count.
    pub fn enable_all(&mut self, inferior: &mut dyn Inferior) -> Result<(), BreakpointError> {
        let mut first_err = None;
        for bp in self.entries.values_mut().filter(|bp| !bp.is_enabled()) {
            if let Err(err) = bp.reactivate(inferior) {
                if first_err.is_none() {
                    first_err = Some(err);
                }
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Force every entry to 0 and restore the original code.
    pub fn disable_all(&mut self, inferior: &mut dyn Inferior) -> Result<(), BreakpointError> {
        let mut first_err = None;
        for bp in self.entries.values_mut() {
            if let Err(err) = bp.suspend(inferior) {
                log::warn!("{:#x}: {}", bp.address(), err);
                if first_err.is_none() {
                    first_err = Some(err);
                }
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    pub(crate) fn reserve(&mut self, address: u64, additional: usize) -> Result<(), BreakpointError> {
        self.entries
            .try_reserve(additional)
            .map_err(|_| BreakpointError::Allocation { address })
    }

    /// Register an already built breakpoint. The caller has checked the
    /// address is free.
    pub(crate) fn adopt(&mut self, bp: Breakpoint) -> &Breakpoint {
        match self.entries.entry(bp.address()) {
            Entry::Occupied(entry) => {
                log::error!("{:#x}: adopting over an existing breakpoint", bp.address());
                &*entry.into_mut()
            }
            Entry::Vacant(entry) => &*entry.insert(bp),
        }
    }
}
