//! Symbol and library descriptors.
//!
//! These are owned by whoever discovered them (the loader, a library
//! registry). Breakpoints only keep a `Weak` reference and use it for
//! attribution in diagnostics.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// A mapped object: the main executable or a shared library
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Library {
    /// Short name (soname or file name)
    pub soname: String,
    pub path: PathBuf,
    /// Difference between link-time and run-time addresses
    pub bias: u64,
}

impl Library {
    pub fn new(soname: impl Into<String>, path: impl Into<PathBuf>, bias: u64) -> Self {
        Self {
            soname: soname.into(),
            path: path.into(),
            bias,
        }
    }
}

/// A traceable function entry point
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LibrarySymbol {
    pub name: String,
    /// Run-time address (bias already applied)
    pub address: u64,
    pub library: Arc<Library>,
}

impl LibrarySymbol {
    pub fn new(name: impl Into<String>, address: u64, library: Arc<Library>) -> Self {
        Self {
            name: name.into(),
            address,
            library,
        }
    }
}

impl fmt::Display for LibrarySymbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.library.soname)
    }
}
