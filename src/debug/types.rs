//! Common types for process control.

use std::fmt;

/// How a tracing session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceOutcome {
    /// Leader process exited with this code
    Exited(i32),
    /// Leader process was killed by this signal number
    Killed(i32),
    /// Breakpoints were removed and the tracer let go of every process
    Detached,
}

impl TraceOutcome {
    /// Exit status to hand back to the shell, following the usual 128 + signal
    /// convention for killed processes.
    pub fn exit_code(self) -> i32 {
        match self {
            TraceOutcome::Exited(code) => code,
            TraceOutcome::Killed(signal) => 128 + signal,
            TraceOutcome::Detached => 0,
        }
    }
}

impl fmt::Display for TraceOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TraceOutcome::Exited(code) => write!(f, "exited with code {}", code),
            TraceOutcome::Killed(signal) => write!(f, "killed by signal {}", signal),
            TraceOutcome::Detached => write!(f, "detached"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes() {
        assert_eq!(TraceOutcome::Exited(3).exit_code(), 3);
        assert_eq!(TraceOutcome::Killed(9).exit_code(), 137);
        assert_eq!(TraceOutcome::Detached.exit_code(), 0);
        assert_eq!(TraceOutcome::Killed(11).to_string(), "killed by signal 11");
    }
}
