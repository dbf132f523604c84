//! Latched cancellation signals.
//!
//! An [`AbortController`] owns the abort flag; any number of [`AbortSignal`]
//! clones observe it. The flag is edge-triggered then latched: it
//! transitions to aborted exactly once and never resets. Waiters are woken
//! by the underlying `tokio::sync::watch` channel, so cancellation unblocks
//! suspension points without polling.

use std::sync::Arc;
use std::sync::OnceLock;
use tokio::sync::watch;

/// Why a call was aborted. The first cause wins; later aborts are no-ops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortCause {
    /// The peer tore the call down.
    Peer,
    /// The call's deadline elapsed.
    Deadline,
    /// Local shutdown (terminator or forced server stop).
    Shutdown,
    /// A locally supplied signal fired (client-side external abort).
    Local,
}

/// Owner side of an abort flag.
#[derive(Debug)]
pub struct AbortController {
    tx: watch::Sender<bool>,
    cause: Arc<OnceLock<AbortCause>>,
}

impl AbortController {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            tx,
            cause: Arc::new(OnceLock::new()),
        }
    }

    /// A signal observing this controller.
    pub fn signal(&self) -> AbortSignal {
        AbortSignal {
            rx: self.tx.subscribe(),
            cause: Arc::clone(&self.cause),
            hold: None,
        }
    }

    /// Fire the signal. Idempotent; the first cause is kept.
    pub fn abort(&self, cause: AbortCause) {
        let _ = self.cause.set(cause);
        self.tx.send_replace(true);
    }

    pub fn is_aborted(&self) -> bool {
        *self.tx.borrow()
    }
}

impl Default for AbortController {
    fn default() -> Self {
        Self::new()
    }
}

/// Observer side of an abort flag. Cheap to clone.
#[derive(Debug, Clone)]
pub struct AbortSignal {
    rx: watch::Receiver<bool>,
    cause: Arc<OnceLock<AbortCause>>,
    // Keeps the channel alive for signals that can never fire.
    hold: Option<Arc<watch::Sender<bool>>>,
}

impl AbortSignal {
    /// A signal that never fires. Stands in when a caller supplies no
    /// external abort.
    pub fn never() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            rx,
            cause: Arc::new(OnceLock::new()),
            hold: Some(Arc::new(tx)),
        }
    }

    /// Whether the signal has fired. Monotonic.
    pub fn is_aborted(&self) -> bool {
        *self.rx.borrow()
    }

    /// The cause recorded at the first `abort`, once fired.
    pub fn cause(&self) -> Option<AbortCause> {
        self.cause.get().copied()
    }

    /// Resolve once the signal fires. If the controller is dropped without
    /// firing, the future never resolves (the call can no longer be
    /// aborted).
    pub async fn aborted(&self) {
        let mut rx = self.rx.clone();
        let fired = rx.wait_for(|fired| *fired).await.is_ok();
        if !fired && !self.is_aborted() {
            std::future::pending::<()>().await;
        }
    }
}
