//! Per-call options.

use skein_core::{AbortSignal, Metadata};
use std::time::Duration;

type MetadataCallback = Box<dyn FnOnce(&Metadata) + Send>;

/// Options for a single call: request metadata, header/trailer observers,
/// an external abort signal, and a deadline.
pub struct CallOptions {
    pub(crate) metadata: Metadata,
    pub(crate) on_header: Option<MetadataCallback>,
    pub(crate) on_trailer: Option<MetadataCallback>,
    pub(crate) signal: AbortSignal,
    pub(crate) deadline: Option<Duration>,
}

impl CallOptions {
    pub fn new() -> Self {
        Self {
            metadata: Metadata::new(),
            on_header: None,
            on_trailer: None,
            signal: AbortSignal::never(),
            deadline: None,
        }
    }

    /// Request metadata, sent as the call's initial headers.
    pub fn metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Observe the response header metadata. Invoked exactly once, strictly
    /// before any response is observable and before the trailer observer.
    pub fn on_header(mut self, f: impl FnOnce(&Metadata) + Send + 'static) -> Self {
        self.on_header = Some(Box::new(f));
        self
    }

    /// Observe the trailer metadata. Invoked exactly once when the trailer
    /// arrives, whatever its status.
    pub fn on_trailer(mut self, f: impl FnOnce(&Metadata) + Send + 'static) -> Self {
        self.on_trailer = Some(Box::new(f));
        self
    }

    /// External abort signal. When it fires before completion, the call is
    /// cancelled at the transport and fails with `CallError::Aborted`.
    pub fn signal(mut self, signal: AbortSignal) -> Self {
        self.signal = signal;
        self
    }

    /// Relative deadline for the whole call.
    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

impl Default for CallOptions {
    fn default() -> Self {
        Self::new()
    }
}

/// Defaults a [`crate::Client`] applies to every call. Per-call options
/// win; default metadata is merged underneath the per-call entries.
#[derive(Clone, Default)]
pub struct CallDefaults {
    pub metadata: Metadata,
    pub deadline: Option<Duration>,
}
