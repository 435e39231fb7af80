//! Linux tracer - ptrace stop loop driving the breakpoint core
//!
//! Each traced process gets its own `Process` with a breakpoint table.
//! Forked children inherit a copy of the parent's table; exec starts over
//! with an empty one.

mod inferior;

pub use inferior::LinuxInferior;

use std::collections::{HashMap, HashSet};
use std::ffi::CString;

use anyhow::{bail, Context, Result};
use nix::errno::Errno;
use nix::libc;
use nix::sys::ptrace::{self, Options};
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{execvp, fork, ForkResult, Pid};

use super::types::TraceOutcome;
use crate::arch::Arch;
use crate::core::Inferior;
use crate::process::Process;

/// Drives every process descending from one leader.
pub struct Tracer {
    arch: Arch,
    leader: Pid,
    processes: HashMap<Pid, Process<LinuxInferior>>,
    /// Children whose initial stop arrived before the parent's fork event
    early_stops: HashSet<Pid>,
    /// Traced process currently sitting in a ptrace stop
    stopped: Option<Pid>,
    outcome: Option<TraceOutcome>,
}

impl Tracer {
    /// Start `program` under ptrace. Returns with the child stopped right
    /// after exec, before its first instruction.
    pub fn spawn(program: &str, args: &[String]) -> Result<Self> {
        let path = CString::new(program).context("program name contains a NUL byte")?;
        let mut argv = vec![path.clone()];
        for arg in args {
            argv.push(CString::new(arg.as_str()).context("argument contains a NUL byte")?);
        }

        // SAFETY: the child only calls async-signal-safe functions before exec.
        match unsafe { fork() }.context("fork failed")? {
            ForkResult::Child => {
                if ptrace::traceme().is_err() {
                    std::process::exit(126);
                }
                let _ = execvp(&path, &argv);
                std::process::exit(127);
            }
            ForkResult::Parent { child } => {
                match waitpid(child, Some(WaitPidFlag::__WALL)) {
                    Ok(WaitStatus::Stopped(_, Signal::SIGTRAP)) => {}
                    Ok(WaitStatus::Exited(_, code)) => {
                        bail!("{} exited with code {} before it could be traced", program, code)
                    }
                    Ok(other) => bail!("unexpected status after exec of {}: {:?}", program, other),
                    Err(e) => return Err(e).context("waitpid failed"),
                }
                log::info!("Spawned {} as pid {}", program, child);
                Self::with_leader(child)
            }
        }
    }

    /// Attach to a running process and wait for it to stop.
    pub fn attach(pid: i32) -> Result<Self> {
        let pid = Pid::from_raw(pid);
        ptrace::attach(pid).with_context(|| format!("failed to attach to process {}", pid))?;
        match waitpid(pid, Some(WaitPidFlag::__WALL)) {
            Ok(WaitStatus::Stopped(..)) => {}
            Ok(other) => bail!("unexpected status after attaching to {}: {:?}", pid, other),
            Err(e) => return Err(e).context("waitpid failed"),
        }
        log::info!("Attached to process {}", pid);
        Self::with_leader(pid)
    }

    fn with_leader(leader: Pid) -> Result<Self> {
        let options =
            Options::PTRACE_O_TRACEFORK | Options::PTRACE_O_TRACEVFORK | Options::PTRACE_O_TRACEEXEC;
        ptrace::setoptions(leader, options).context("PTRACE_SETOPTIONS failed")?;

        let arch = Arch::host();
        let mut process = Process::new(LinuxInferior::new(leader), arch);
        process.init_table();

        let mut processes = HashMap::new();
        processes.insert(leader, process);
        Ok(Self {
            arch,
            leader,
            processes,
            early_stops: HashSet::new(),
            stopped: Some(leader),
            outcome: None,
        })
    }

    pub fn leader_pid(&self) -> i32 {
        self.leader.as_raw()
    }

    /// The leader while it is still traced. Breakpoints inserted here before
    /// [`run`](Self::run) are inherited by every child it forks.
    pub fn leader_mut(&mut self) -> Option<&mut Process<LinuxInferior>> {
        self.processes.get_mut(&self.leader)
    }

    /// Resume the leader and handle stops until every traced process is gone.
    ///
    /// `should_detach` is polled after each breakpoint hit; once it returns
    /// true all breakpoints are removed and every process is let go. On
    /// error the same happens before the error is returned.
    pub fn run<F: FnMut() -> bool>(&mut self, mut should_detach: F) -> Result<TraceOutcome> {
        let result = self.trace(&mut should_detach);
        if let Err(err) = &result {
            log::error!("Tracing failed: {:#}", err);
            self.release();
        }
        result
    }

    fn trace<F: FnMut() -> bool>(&mut self, should_detach: &mut F) -> Result<TraceOutcome> {
        resume(self.leader, None)?;
        self.stopped = None;

        while !self.processes.is_empty() {
            let status = match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::__WALL)) {
                Ok(status) => status,
                Err(Errno::ECHILD) => break,
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e).context("waitpid failed"),
            };
            log::trace!("{:?}", status);
            self.stopped = status.pid().filter(|pid| self.processes.contains_key(pid));

            match status {
                WaitStatus::Exited(pid, code) => {
                    self.reap(pid, TraceOutcome::Exited(code));
                }
                WaitStatus::Signaled(pid, sig, _) => {
                    self.reap(pid, TraceOutcome::Killed(sig as i32));
                }
                WaitStatus::PtraceEvent(pid, _, event) => {
                    match event {
                        libc::PTRACE_EVENT_FORK | libc::PTRACE_EVENT_VFORK => self.handle_fork(pid)?,
                        libc::PTRACE_EVENT_EXEC => self.handle_exec(pid),
                        _ => {}
                    }
                    self.retry_pending(pid);
                    resume(pid, None)?;
                }
                WaitStatus::Stopped(pid, Signal::SIGTRAP) => {
                    if self.handle_trap(pid, should_detach)? {
                        return Ok(TraceOutcome::Detached);
                    }
                }
                WaitStatus::Stopped(pid, Signal::SIGSTOP) if !self.processes.contains_key(&pid) => {
                    self.early_stops.insert(pid);
                }
                WaitStatus::Stopped(pid, sig) => {
                    self.retry_pending(pid);
                    resume(pid, Some(sig))?;
                }
                _ => {}
            }
            self.stopped = None;
        }

        Ok(self.outcome.unwrap_or(TraceOutcome::Detached))
    }

    /// Best-effort `detach_all` for failure paths.
    fn release(&mut self) {
        if self.processes.is_empty() {
            return;
        }
        if let Err(err) = self.detach_all(self.stopped) {
            log::error!("Could not release traced processes: {:#}", err);
        }
    }

    fn retry_pending(&mut self, pid: Pid) {
        if let Some(process) = self.processes.get_mut(&pid) {
            if process.retry_pending() > 0 {
                log::trace!("pid {}: {} breakpoints still pending", pid, process.pending_count());
            }
        }
    }

    fn reap(&mut self, pid: Pid, outcome: TraceOutcome) {
        if self.processes.remove(&pid).is_some() {
            log::info!("Process {} {}", pid, outcome);
        }
        if pid == self.leader {
            self.outcome = Some(outcome);
        }
    }

    /// Returns true when the session detached.
    fn handle_trap<F: FnMut() -> bool>(&mut self, pid: Pid, should_detach: &mut F) -> Result<bool> {
        let decr = self.arch.decr_pc_after_break();
        let Some(process) = self.processes.get_mut(&pid) else {
            resume(pid, None)?;
            return Ok(false);
        };

        process.retry_pending();

        let address = process.inferior_mut().instruction_pointer()?.wrapping_sub(decr);
        if process.lookup(address).is_none() {
            log::debug!("pid {}: SIGTRAP at {:#x} is not ours, forwarding", pid, address);
            resume(pid, Some(Signal::SIGTRAP))?;
            return Ok(false);
        }

        process.inferior_mut().set_instruction_pointer(address)?;
        process.on_hit(address)?;

        if should_detach() {
            self.detach_all(Some(pid))?;
            return Ok(true);
        }

        if let Some(process) = self.processes.get_mut(&pid) {
            process.on_continue(address)?;
        }
        Ok(false)
    }

    fn handle_fork(&mut self, parent_pid: Pid) -> Result<()> {
        let raw = ptrace::getevent(parent_pid).context("PTRACE_GETEVENTMSG failed")?;
        let child = Pid::from_raw(raw as i32);

        if !self.early_stops.remove(&child) {
            match waitpid(child, Some(WaitPidFlag::__WALL)) {
                Ok(WaitStatus::Stopped(..)) => {}
                Ok(other) => {
                    log::warn!("Child {} did not stop after fork: {:?}", child, other);
                    return Ok(());
                }
                Err(e) => return Err(e).context("waitpid failed"),
            }
        }

        let Some(parent) = self.processes.get(&parent_pid) else {
            log::warn!("Fork from untracked process {}", parent_pid);
            return Ok(());
        };

        let mut process = Process::new(LinuxInferior::new(child), self.arch);
        process.init_table();
        match process.inherit_breakpoints(parent) {
            Ok(()) => {
                log::info!(
                    "Process {} forked {} ({} breakpoints inherited)",
                    parent_pid,
                    child,
                    process.breakpoint_count()
                );
                self.processes.insert(child, process);
                resume(child, None)?;
            }
            Err(err) => {
                log::warn!("Cannot trace child {}: {}; detaching", child, err);
                if let Err(err) = process.scrub_inherited_traps(parent) {
                    log::warn!("Child {} keeps stray traps: {}", child, err);
                }
                detach(child, None);
            }
        }
        Ok(())
    }

    fn handle_exec(&mut self, pid: Pid) {
        if let Some(process) = self.processes.get_mut(&pid) {
            log::info!(
                "Process {} called exec, dropping {} breakpoints",
                pid,
                process.breakpoint_count()
            );
            process.init_table();
        }
    }

    /// Remove every breakpoint and detach from all traced processes.
    ///
    /// `stopped` names a process already in a ptrace stop; every other one
    /// is stopped with SIGSTOP first.
    pub fn detach_all(&mut self, stopped: Option<Pid>) -> Result<()> {
        let pids: Vec<Pid> = self.processes.keys().copied().collect();
        for pid in pids {
            let Some(mut process) = self.processes.remove(&pid) else {
                continue;
            };
            if Some(pid) != stopped {
                match stop_for_detach(&mut process, self.arch) {
                    Ok(true) => {}
                    Ok(false) => continue,
                    Err(err) => log::warn!("Process {} did not stop: {:#}", pid, err),
                }
            }
            if let Err(err) = process.disable_all() {
                log::warn!("Process {}: {}", pid, err);
            }
            process.take_table();
            let sig = process.inferior_mut().take_pending_signal();
            detach(pid, sig);
            log::info!("Detached from process {}", pid);
        }
        self.stopped = None;
        Ok(())
    }
}

impl Drop for Tracer {
    fn drop(&mut self) {
        self.release();
    }
}

fn resume(pid: Pid, sig: Option<Signal>) -> Result<()> {
    match ptrace::cont(pid, sig) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(e).with_context(|| format!("PTRACE_CONT failed for {}", pid)),
    }
}

fn detach(pid: Pid, sig: Option<Signal>) {
    match ptrace::detach(pid, sig) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => log::warn!("Failed to detach from {}: {}", pid, e),
    }
}

/// Bring a running process to a halt. Returns false if it went away.
fn stop_for_detach(process: &mut Process<LinuxInferior>, arch: Arch) -> Result<bool> {
    let pid = process.inferior().raw_pid();
    match signal::kill(pid, Signal::SIGSTOP) {
        Ok(()) => {}
        Err(Errno::ESRCH) => return Ok(false),
        Err(e) => return Err(e).context("kill failed"),
    }

    loop {
        match waitpid(pid, Some(WaitPidFlag::__WALL)) {
            Ok(WaitStatus::Stopped(_, Signal::SIGSTOP)) => return Ok(true),
            Ok(WaitStatus::Stopped(_, Signal::SIGTRAP)) => {
                // Hit a breakpoint on the way: back up and let it run the
                // original instruction until the SIGSTOP arrives.
                let address = process
                    .inferior_mut()
                    .instruction_pointer()?
                    .wrapping_sub(arch.decr_pc_after_break());
                if process.lookup(address).is_some() {
                    process.inferior_mut().set_instruction_pointer(address)?;
                    if let Err(err) = process.disable_all() {
                        log::warn!("Process {}: {}", pid, err);
                    }
                }
                resume(pid, None)?;
            }
            Ok(WaitStatus::Stopped(_, sig)) => resume(pid, Some(sig))?,
            Ok(WaitStatus::Exited(..)) | Ok(WaitStatus::Signaled(..)) => return Ok(false),
            Ok(_) => resume(pid, None)?,
            Err(Errno::ECHILD) => return Ok(false),
            Err(e) => return Err(e).context("waitpid failed"),
        }
    }
}
