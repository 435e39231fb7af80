//! Process - a traced process and its breakpoints
//!
//! Pairs the inferior handle with the process's breakpoint table and exposes
//! the operations the control loop calls at attach, stop, fork and detach.

use std::sync::Arc;

use crate::arch::Arch;
use crate::breakpoint::{Breakpoint, BreakpointCallbacks, BreakpointError, BreakpointTable};
use crate::core::Inferior;
use crate::symbol::LibrarySymbol;

pub struct Process<I: Inferior> {
    inferior: I,
    arch: Arch,
    breakpoints: Option<BreakpointTable>,
}

impl<I: Inferior> Process<I> {
    /// Wrap an inferior. Call [`init_table`](Self::init_table) before
    /// inserting breakpoints.
    pub fn new(inferior: I, arch: Arch) -> Self {
        Self {
            inferior,
            arch,
            breakpoints: None,
        }
    }

    pub fn pid(&self) -> i32 {
        self.inferior.pid()
    }

    pub fn arch(&self) -> Arch {
        self.arch
    }

    pub fn inferior(&self) -> &I {
        &self.inferior
    }

    pub fn inferior_mut(&mut self) -> &mut I {
        &mut self.inferior
    }

    /// Install an empty breakpoint table. Any previous table is discarded
    /// without touching memory, as after an exec.
    pub fn init_table(&mut self) {
        if let Some(old) = self.breakpoints.replace(BreakpointTable::new(self.arch)) {
            log::info!(
                "pid {}: discarding {} breakpoints with the old table",
                self.pid(),
                old.len()
            );
        }
    }

    pub fn table(&self) -> Option<&BreakpointTable> {
        self.breakpoints.as_ref()
    }

    /// Drop the table without restoring anything. Use after the process is
    /// gone, or after [`disable_all`](Self::disable_all).
    pub fn take_table(&mut self) -> Option<BreakpointTable> {
        self.breakpoints.take()
    }

    pub fn breakpoint_count(&self) -> usize {
        self.breakpoints.as_ref().map_or(0, BreakpointTable::len)
    }

    pub fn pending_count(&self) -> usize {
        self.breakpoints
            .as_ref()
            .map_or(0, BreakpointTable::pending_count)
    }

    fn parts(&mut self) -> Result<(&mut BreakpointTable, &mut I), BreakpointError> {
        let pid = self.inferior.pid();
        match self.breakpoints.as_mut() {
            Some(table) => Ok((table, &mut self.inferior)),
            None => Err(BreakpointError::NoTable { pid }),
        }
    }

    pub fn insert_breakpoint(
        &mut self,
        address: u64,
        symbol: Option<&Arc<LibrarySymbol>>,
    ) -> Result<&Breakpoint, BreakpointError> {
        let (table, inferior) = self.parts()?;
        table.insert(inferior, address, symbol)
    }

    pub fn delete_breakpoint(&mut self, address: u64) -> Result<(), BreakpointError> {
        let (table, inferior) = self.parts()?;
        table.delete(inferior, address)
    }

    pub fn lookup(&self, address: u64) -> Option<&Breakpoint> {
        self.breakpoints.as_ref()?.get(address)
    }

    /// Undo one [`insert_breakpoint`](Self::insert_breakpoint) without
    /// removing the entry.
    pub fn turn_off_breakpoint(&mut self, address: u64) -> Result<(), BreakpointError> {
        let (table, inferior) = self.parts()?;
        match table.get_mut(address) {
            Some(bp) => bp.turn_off(inferior),
            None => Err(no_breakpoint(address)),
        }
    }

    pub fn set_callbacks(
        &mut self,
        address: u64,
        cbs: Arc<dyn BreakpointCallbacks>,
    ) -> Result<(), BreakpointError> {
        let (table, _) = self.parts()?;
        match table.get_mut(address) {
            Some(bp) => bp.set_callbacks(cbs),
            None => Err(no_breakpoint(address)),
        }
    }

    pub fn enable_all(&mut self) -> Result<(), BreakpointError> {
        let (table, inferior) = self.parts()?;
        table.enable_all(inferior)
    }

    pub fn disable_all(&mut self) -> Result<(), BreakpointError> {
        let (table, inferior) = self.parts()?;
        table.disable_all(inferior)
    }

    /// Dispatch a trap at `address`. Returns `false` when no breakpoint of
    /// this process lives there.
    pub fn on_hit(&mut self, address: u64) -> Result<bool, BreakpointError> {
        let Some(bp) = self.breakpoints.as_ref().and_then(|t| t.get(address)) else {
            return Ok(false);
        };
        bp.on_hit(&mut self.inferior)?;
        Ok(true)
    }

    /// Resume past the breakpoint at `address`.
    pub fn on_continue(&mut self, address: u64) -> Result<(), BreakpointError> {
        let Some(bp) = self.breakpoints.as_ref().and_then(|t| t.get(address)) else {
            return Err(no_breakpoint(address));
        };
        bp.on_continue(&mut self.inferior)
    }

    /// Clone the breakpoint at `address` of `parent` into this process, a
    /// freshly forked copy of it.
    pub fn clone_breakpoint<J: Inferior>(
        &mut self,
        parent: &Process<J>,
        address: u64,
    ) -> Result<&Breakpoint, BreakpointError> {
        let bp = parent.lookup(address).ok_or_else(|| no_breakpoint(address))?;
        let (table, inferior) = self.parts()?;
        if table.contains(address) {
            return Err(BreakpointError::InvalidState {
                address,
                reason: "already present in the new process",
            });
        }
        table.reserve(address, 1)?;
        let clone = bp.clone_into(&parent.inferior, inferior)?;
        Ok(table.adopt(clone))
    }

    /// Clone every breakpoint of `parent`. Either all of them land in this
    /// process's table or none do.
    pub fn inherit_breakpoints<J: Inferior>(&mut self, parent: &Process<J>) -> Result<(), BreakpointError> {
        let parent_table = parent
            .breakpoints
            .as_ref()
            .ok_or(BreakpointError::NoTable { pid: parent.pid() })?;
        let (table, inferior) = self.parts()?;

        if let Some(bp) = parent_table.iter().find(|bp| table.contains(bp.address())) {
            return Err(BreakpointError::InvalidState {
                address: bp.address(),
                reason: "already present in the new process",
            });
        }
        let first = parent_table.iter().next().map_or(0, Breakpoint::address);
        table.reserve(first, parent_table.len())?;

        let mut cloned = Vec::with_capacity(parent_table.len());
        for bp in parent_table.iter() {
            match bp.clone_into(&parent.inferior, &mut *inferior) {
                Ok(clone) => cloned.push(clone),
                Err(err) => {
                    for clone in cloned {
                        clone.discard(&mut *inferior);
                    }
                    return Err(err);
                }
            }
        }

        log::info!(
            "pid {}: inherited {} breakpoints from pid {}",
            inferior.pid(),
            cloned.len(),
            parent.pid()
        );
        for clone in cloned {
            table.adopt(clone);
        }
        Ok(())
    }

    /// Put back the original code under every trap this process got by
    /// copying `parent`'s memory. Used on a fork child that will not be
    /// traced. All traps are attempted; the first error is returned.
    pub fn scrub_inherited_traps<J: Inferior>(&mut self, parent: &Process<J>) -> Result<(), BreakpointError> {
        let Some(parent_table) = parent.breakpoints.as_ref() else {
            return Ok(());
        };
        let mut first_err = None;
        for bp in parent_table.iter() {
            let Some(orig) = bp.original_bytes() else {
                continue;
            };
            if let Err(source) = self.inferior.write_memory(bp.address(), orig) {
                log::warn!("pid {}: {:#x}: {}", self.pid(), bp.address(), source);
                first_err.get_or_insert(BreakpointError::MemoryAccess {
                    address: bp.address(),
                    source,
                });
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Try to activate pending breakpoints again. Returns how many are still
    /// pending.
    pub fn retry_pending(&mut self) -> usize {
        if self.pending_count() == 0 {
            return 0;
        }
        if let Err(err) = self.enable_all() {
            log::trace!("pid {}: {}", self.pid(), err);
        }
        self.pending_count()
    }
}

fn no_breakpoint(address: u64) -> BreakpointError {
    BreakpointError::InvalidState {
        address,
        reason: "no breakpoint at this address",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::testing::{Event, FakeInferior};
    use crate::symbol::Library;

    const BASE: u64 = 0x40_0000;

    fn process(arch: Arch) -> Process<FakeInferior> {
        let mut proc = Process::new(FakeInferior::new(100, BASE, 0x1000), arch);
        proc.init_table();
        proc
    }

    #[test]
    fn table_required() {
        let mut proc = Process::new(FakeInferior::new(100, BASE, 0x1000), Arch::X86_64);
        let err = proc.insert_breakpoint(BASE, None).unwrap_err();
        assert!(matches!(err, BreakpointError::NoTable { pid: 100 }));
        assert!(proc.lookup(BASE).is_none());
    }

    #[test]
    fn insert_and_lookup() {
        let mut proc = process(Arch::X86_64);
        let lib = Arc::new(Library::new("libc.so.6", "/lib/libc.so.6", 0));
        let sym = Arc::new(LibrarySymbol::new("puts", BASE + 0x10, lib));

        let bp = proc.insert_breakpoint(BASE + 0x10, Some(&sym)).unwrap();
        assert_eq!(bp.enable_count(), 1);
        assert_eq!(bp.name().as_deref(), Some("puts"));
        assert_eq!(bp.library().unwrap().soname, "libc.so.6");

        assert!(proc.lookup(BASE + 0x10).is_some());
        assert!(proc.lookup(BASE + 0x11).is_none());
        assert_eq!(proc.inferior().bytes(BASE + 0x10, 1), vec![0xcc]);
    }

    #[test]
    fn lookup_follows_insert_and_delete() {
        let mut proc = process(Arch::Aarch64);
        let addrs = [BASE, BASE + 0x20, BASE + 0x40];

        for addr in addrs {
            proc.insert_breakpoint(addr, None).unwrap();
        }
        proc.delete_breakpoint(BASE + 0x20).unwrap();
        proc.insert_breakpoint(BASE + 0x60, None).unwrap();
        proc.delete_breakpoint(BASE).unwrap();

        assert!(proc.lookup(BASE).is_none());
        assert!(proc.lookup(BASE + 0x20).is_none());
        assert!(proc.lookup(BASE + 0x40).is_some());
        assert!(proc.lookup(BASE + 0x60).is_some());
        assert!(proc.lookup(BASE + 0x44).is_none());
        assert_eq!(proc.breakpoint_count(), 2);
    }

    #[test]
    fn insert_twice_nests() {
        let mut proc = process(Arch::X86_64);
        proc.insert_breakpoint(BASE, None).unwrap();
        let bp = proc.insert_breakpoint(BASE, None).unwrap();
        assert_eq!(bp.enable_count(), 2);
        assert_eq!(proc.inferior().writes_to(BASE), 1);
    }

    #[test]
    fn delete_forces_restore() {
        let mut proc = process(Arch::Riscv64);
        let before = proc.inferior().snapshot();
        for _ in 0..3 {
            proc.insert_breakpoint(BASE + 8, None).unwrap();
        }

        proc.delete_breakpoint(BASE + 8).unwrap();
        assert!(proc.lookup(BASE + 8).is_none());
        assert_eq!(proc.inferior().snapshot(), before);
        assert_eq!(proc.inferior().writes_to(BASE + 8), 2);
    }

    #[test]
    fn delete_absent_is_noop() {
        let mut proc = process(Arch::X86_64);
        proc.delete_breakpoint(BASE).unwrap();
        assert!(proc.inferior().events.is_empty());
    }

    #[test]
    fn bulk_disable_then_enable() {
        let mut proc = process(Arch::X86_64);
        let before = proc.inferior().snapshot();
        let (a, b, c) = (BASE, BASE + 0x10, BASE + 0x20);

        proc.insert_breakpoint(a, None).unwrap();
        proc.turn_off_breakpoint(a).unwrap();
        proc.insert_breakpoint(b, None).unwrap();
        for _ in 0..3 {
            proc.insert_breakpoint(c, None).unwrap();
        }

        proc.disable_all().unwrap();
        for addr in [a, b, c] {
            assert_eq!(proc.lookup(addr).unwrap().enable_count(), 0);
        }
        assert_eq!(proc.inferior().snapshot(), before);

        proc.enable_all().unwrap();
        assert_eq!(proc.lookup(a).unwrap().enable_count(), 1);
        assert_eq!(proc.lookup(b).unwrap().enable_count(), 1);
        assert_eq!(proc.lookup(c).unwrap().enable_count(), 3);
        for addr in [a, b, c] {
            assert_eq!(proc.inferior().bytes(addr, 1), vec![0xcc]);
        }
    }

    #[test]
    fn enable_all_leaves_active_entries_alone() {
        let mut proc = process(Arch::X86_64);
        proc.insert_breakpoint(BASE, None).unwrap();
        proc.turn_off_breakpoint(BASE).unwrap();
        proc.insert_breakpoint(BASE + 0x10, None).unwrap();
        for _ in 0..3 {
            proc.insert_breakpoint(BASE + 0x20, None).unwrap();
        }

        proc.enable_all().unwrap();
        assert_eq!(proc.lookup(BASE).unwrap().enable_count(), 1);
        assert_eq!(proc.lookup(BASE + 0x10).unwrap().enable_count(), 1);
        assert_eq!(proc.lookup(BASE + 0x20).unwrap().enable_count(), 3);
    }

    #[test]
    fn pending_breakpoint_retried_by_enable_all() {
        let mut proc = process(Arch::X86_64);
        proc.inferior_mut().unmap(BASE + 0x800..BASE + 0x900);

        let err = proc.insert_breakpoint(BASE + 0x810, None).unwrap_err();
        assert!(err.is_recoverable());
        assert_eq!(proc.pending_count(), 1);
        assert_eq!(proc.lookup(BASE + 0x810).unwrap().enable_count(), 0);

        assert!(proc.enable_all().is_err());

        proc.inferior_mut().map_all();
        proc.enable_all().unwrap();
        assert_eq!(proc.pending_count(), 0);
        assert_eq!(proc.inferior().bytes(BASE + 0x810, 1), vec![0xcc]);
    }

    #[test]
    fn dispatch_unknown_address() {
        let mut proc = process(Arch::X86_64);
        assert!(!proc.on_hit(BASE).unwrap());
        assert!(proc.on_continue(BASE).is_err());
    }

    #[test]
    fn default_continue_steps_over() {
        let mut proc = process(Arch::X86_64);
        let orig = proc.inferior().bytes(BASE, 1);
        proc.insert_breakpoint(BASE, None).unwrap();
        proc.inferior_mut().events.clear();

        assert!(proc.on_hit(BASE).unwrap());
        assert!(proc.inferior().events.is_empty());

        proc.on_continue(BASE).unwrap();
        assert_eq!(
            proc.inferior().events,
            vec![
                Event::Write {
                    address: BASE,
                    data: orig
                },
                Event::Step,
                Event::Write {
                    address: BASE,
                    data: vec![0xcc]
                },
                Event::Resume,
            ]
        );
    }

    #[test]
    fn clone_is_independent() {
        let mut parent = process(Arch::X86_64);
        let before = parent.inferior().snapshot();
        parent.insert_breakpoint(BASE, None).unwrap();
        parent.insert_breakpoint(BASE, None).unwrap();

        let mut child = Process::new(parent.inferior().fork(101), Arch::X86_64);
        child.init_table();
        let clone = child.clone_breakpoint(&parent, BASE).unwrap();
        assert_eq!(clone.enable_count(), 2);

        child.turn_off_breakpoint(BASE).unwrap();
        child.turn_off_breakpoint(BASE).unwrap();
        assert_eq!(child.inferior().snapshot(), before);

        assert_eq!(parent.lookup(BASE).unwrap().enable_count(), 2);
        assert_eq!(parent.inferior().bytes(BASE, 1), vec![0xcc]);
    }

    #[test]
    fn clone_into_occupied_address_rejected() {
        let mut parent = process(Arch::X86_64);
        parent.insert_breakpoint(BASE, None).unwrap();
        let mut child = Process::new(parent.inferior().fork(101), Arch::X86_64);
        child.init_table();
        child.clone_breakpoint(&parent, BASE).unwrap();

        let err = child.clone_breakpoint(&parent, BASE).unwrap_err();
        assert!(matches!(err, BreakpointError::InvalidState { .. }));
    }

    #[test]
    fn inherit_shares_callbacks_and_symbol() {
        struct Nop;
        impl BreakpointCallbacks for Nop {}

        let lib = Arc::new(Library::new("a.out", "/bin/a.out", 0));
        let sym = Arc::new(LibrarySymbol::new("main", BASE, lib));
        let mut parent = process(Arch::X86_64);
        parent.insert_breakpoint(BASE, Some(&sym)).unwrap();
        parent.insert_breakpoint(BASE + 0x40, None).unwrap();
        parent.set_callbacks(BASE, Arc::new(Nop)).unwrap();

        let mut child = Process::new(parent.inferior().fork(101), Arch::X86_64);
        child.init_table();
        child.inherit_breakpoints(&parent).unwrap();

        assert_eq!(child.breakpoint_count(), 2);
        let bp = child.lookup(BASE).unwrap();
        assert!(bp.has_callbacks());
        assert_eq!(bp.name().as_deref(), Some("main"));
        assert!(child.lookup(BASE + 0x40).unwrap().is_service());
    }

    #[test]
    fn inherit_is_all_or_nothing() {
        let mut parent = Process::new(
            FakeInferior::new(100, BASE, 0x1000).with_debug_slots(2),
            Arch::X86_64,
        );
        parent.init_table();
        parent.insert_breakpoint(BASE, None).unwrap();
        parent.insert_breakpoint(BASE + 0x10, None).unwrap();

        let mut child = Process::new(
            parent.inferior().fork(101).with_debug_slots(1),
            Arch::X86_64,
        );
        child.init_table();

        let err = child.inherit_breakpoints(&parent).unwrap_err();
        assert!(matches!(err, BreakpointError::CloneFailure { .. }));
        assert_eq!(child.breakpoint_count(), 0);
        assert_eq!(child.inferior().free_slots(), 1);
    }

    #[test]
    fn untraced_child_gets_original_code_back() {
        let mut parent = Process::new(
            FakeInferior::new(100, BASE, 0x1000).with_debug_slots(2),
            Arch::X86_64,
        );
        parent.init_table();
        let pristine = parent.inferior().snapshot();
        parent.insert_breakpoint(BASE, None).unwrap();
        parent.insert_breakpoint(BASE + 0x10, None).unwrap();
        parent.insert_breakpoint(BASE + 0x20, None).unwrap();
        parent.turn_off_breakpoint(BASE + 0x20).unwrap();

        let mut child = Process::new(
            parent.inferior().fork(101).with_debug_slots(1),
            Arch::X86_64,
        );
        child.init_table();
        assert!(child.inherit_breakpoints(&parent).is_err());
        assert_ne!(child.inferior().snapshot(), pristine);

        child.scrub_inherited_traps(&parent).unwrap();
        assert_eq!(child.inferior().snapshot(), pristine);
        assert_eq!(child.inferior().events.len(), 2);
        assert_eq!(parent.inferior().bytes(BASE, 1), vec![0xcc]);
        assert_eq!(parent.inferior().bytes(BASE + 0x10, 1), vec![0xcc]);
    }

    #[test]
    fn scrub_reports_unwritable_traps() {
        let mut parent = process(Arch::X86_64);
        parent.insert_breakpoint(BASE + 0x100, None).unwrap();
        parent.insert_breakpoint(BASE + 0x200, None).unwrap();

        let mut child = Process::new(parent.inferior().fork(101), Arch::X86_64);
        child.inferior_mut().unmap(BASE + 0x100..BASE + 0x101);

        let err = child.scrub_inherited_traps(&parent).unwrap_err();
        assert!(matches!(err, BreakpointError::MemoryAccess { address, .. } if address == BASE + 0x100));
        assert_eq!(child.inferior().bytes(BASE + 0x200, 1), parent.lookup(BASE + 0x200).unwrap().original_bytes().unwrap());
    }

    #[test]
    fn retry_pending_activates_once_mapped() {
        let mut proc = process(Arch::X86_64);
        assert_eq!(proc.retry_pending(), 0);

        proc.inferior_mut().unmap(BASE + 0x800..BASE + 0x900);
        assert!(proc.insert_breakpoint(BASE + 0x810, None).is_err());
        proc.insert_breakpoint(BASE + 0x10, None).unwrap();
        proc.insert_breakpoint(BASE + 0x10, None).unwrap();

        assert_eq!(proc.retry_pending(), 1);
        proc.inferior_mut().map_all();
        assert_eq!(proc.retry_pending(), 0);
        assert_eq!(proc.lookup(BASE + 0x810).unwrap().enable_count(), 1);
        assert_eq!(proc.lookup(BASE + 0x10).unwrap().enable_count(), 2);
        assert_eq!(proc.inferior().bytes(BASE + 0x810, 1), vec![0xcc]);
    }

    #[test]
    fn exec_reset_drops_breakpoints_without_writing() {
        let mut proc = process(Arch::X86_64);
        proc.insert_breakpoint(BASE, None).unwrap();
        let writes = proc.inferior().events.len();

        proc.init_table();
        assert_eq!(proc.breakpoint_count(), 0);
        assert_eq!(proc.inferior().events.len(), writes);
        assert!(proc.lookup(BASE).is_none());
    }

    #[test]
    fn set_callbacks_on_missing_breakpoint() {
        struct Nop;
        impl BreakpointCallbacks for Nop {}

        let mut proc = process(Arch::X86_64);
        assert!(proc.set_callbacks(BASE, Arc::new(Nop)).is_err());
    }

    #[test]
    fn init_table_discards_old_entries() {
        let mut proc = process(Arch::X86_64);
        proc.insert_breakpoint(BASE, None).unwrap();
        proc.init_table();
        assert_eq!(proc.breakpoint_count(), 0);
        assert!(proc.take_table().is_some());
        assert!(proc.take_table().is_none());
    }
}
