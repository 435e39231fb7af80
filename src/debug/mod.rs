//! Debug module - Process control around the breakpoint core
//!
//! Provides the pieces the core treats as external collaborators:
//! - Spawning and attaching to traced processes
//! - The stop/continue loop that dispatches breakpoint hits
//! - Fork and exec handling
//! - Hit reporting

pub mod report;
pub mod types;

#[cfg(target_os = "linux")]
pub mod linux;

#[cfg(target_os = "linux")]
pub use linux::{LinuxInferior, Tracer};

pub use report::HitReporter;
pub use types::TraceOutcome;
