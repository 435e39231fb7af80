//! bptrace - Breakpoint core of a dynamic call tracer
//!
//! Software breakpoints with reference-counted activation, per-process
//! breakpoint tables, and the clone protocol used when a traced process
//! forks. The Linux tracer in [`debug`] drives it with ptrace.

pub mod analysis;
pub mod arch;
pub mod breakpoint;
pub mod core;
pub mod debug;
pub mod process;
pub mod symbol;

pub use arch::{Arch, ArchData};
pub use breakpoint::{Breakpoint, BreakpointCallbacks, BreakpointError, BreakpointTable};
pub use crate::core::{Inferior, InferiorError, MemoryError};
pub use process::Process;
pub use symbol::{Library, LibrarySymbol};
