//! Hit reporting callbacks used by the command-line front end.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use colored::Colorize;

use crate::breakpoint::{Breakpoint, BreakpointCallbacks, BreakpointError};
use crate::core::Inferior;

/// Prints one line per hit and keeps count.
///
/// `total` is shared between all reporters of a session so the tracer can
/// stop after a global number of hits.
#[derive(Debug)]
pub struct HitReporter {
    label: String,
    hits: AtomicU64,
    total: Arc<AtomicU64>,
}

impl HitReporter {
    pub fn new(label: impl Into<String>, total: Arc<AtomicU64>) -> Self {
        Self {
            label: label.into(),
            hits: AtomicU64::new(0),
            total,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }
}

impl BreakpointCallbacks for HitReporter {
    fn on_hit(&self, bp: &Breakpoint, inferior: &mut dyn Inferior) -> Result<(), BreakpointError> {
        let count = self.hits.fetch_add(1, Ordering::Relaxed) + 1;
        self.total.fetch_add(1, Ordering::Relaxed);

        let origin = bp
            .library()
            .map(|lib| format!(" ({})", lib.soname))
            .unwrap_or_default();
        println!(
            "[{}] {}{} at {} {}",
            inferior.pid().to_string().dimmed(),
            self.label.green().bold(),
            origin,
            format!("{:#x}", bp.address()).yellow(),
            format!("#{}", count).cyan()
        );
        Ok(())
    }
}
