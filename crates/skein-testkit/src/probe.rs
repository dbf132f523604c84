//! Probes for asserting ordering and cleanup in tests.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared, ordered action log. Middlewares, handlers, and callbacks push
/// labels; the test asserts the exact sequence.
#[derive(Clone, Default)]
pub struct ActionLog {
    entries: Arc<Mutex<Vec<String>>>,
}

impl ActionLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, entry: impl Into<String>) {
        self.entries.lock().push(entry.into());
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.entries.lock().clone()
    }
}

/// Observes whether a guard's owner ran its cleanup (was dropped).
#[derive(Clone, Default)]
pub struct CleanupProbe {
    triggered: Arc<AtomicBool>,
}

impl CleanupProbe {
    pub fn new() -> Self {
        Self::default()
    }

    /// A guard to move into the producer/handler under test; dropping it
    /// marks the probe.
    pub fn guard(&self) -> CleanupGuard {
        CleanupGuard {
            triggered: Arc::clone(&self.triggered),
        }
    }

    pub fn triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }
}

/// See [`CleanupProbe::guard`].
pub struct CleanupGuard {
    triggered: Arc<AtomicBool>,
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        self.triggered.store(true, Ordering::SeqCst);
    }
}
