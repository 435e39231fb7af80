//! Analysis Module - Static information about traced binaries
//!
//! Currently just ELF symbol loading for breakpoint placement.

pub mod loader;

pub use loader::{load_bias, FunctionInfo, LoadedBinary};
