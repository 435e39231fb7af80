//! Core module - Traced process access
//!
//! The narrow interface the breakpoint core consumes from the process
//! collaborator, plus the `/proc/<pid>/mem` memory backend.

pub mod inferior;
pub mod memory;

#[cfg(test)]
pub(crate) mod testing;

// Re-export common types
pub use inferior::{Inferior, InferiorError};
pub use memory::{MemoryError, ProcMem};
