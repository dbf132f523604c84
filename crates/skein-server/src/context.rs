//! Per-call server context.
//!
//! One [`CallContext`] is built per accepted call and handed down the
//! middleware chain to the handler. Clones share the same underlying call
//! state (request metadata, header/trailer cells, extensions); only the
//! abort signal is per-layer, so a middleware can derive a child context
//! with [`CallContext::with_signal`] without hiding the shared cells.

use parking_lot::Mutex;
use skein_core::{AbortSignal, Metadata};
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::time::Instant;

enum HeaderState {
    /// Mutable; nothing sent yet.
    Pending(Metadata),
    /// `send_header` was called; the dispatcher flushes it next.
    Requested(Metadata),
    /// On the wire. Mutations are rejected from here on.
    Sent,
}

struct CallShared {
    metadata: Metadata,
    peer: String,
    deadline: Option<Instant>,
    header: Mutex<HeaderState>,
    header_nudge: Notify,
    trailer: Mutex<Metadata>,
    extensions: Mutex<HashMap<TypeId, Box<dyn Any + Send + Sync>>>,
}

/// Context of one in-flight call.
#[derive(Clone)]
pub struct CallContext {
    shared: Arc<CallShared>,
    signal: AbortSignal,
}

impl CallContext {
    pub(crate) fn new(
        metadata: Metadata,
        peer: String,
        deadline: Option<Instant>,
        signal: AbortSignal,
    ) -> Self {
        Self {
            shared: Arc::new(CallShared {
                metadata,
                peer,
                deadline,
                header: Mutex::new(HeaderState::Pending(Metadata::new())),
                header_nudge: Notify::new(),
                trailer: Mutex::new(Metadata::new()),
                extensions: Mutex::new(HashMap::new()),
            }),
            signal,
        }
    }

    /// Incoming request metadata, frozen at accept time.
    pub fn metadata(&self) -> &Metadata {
        &self.shared.metadata
    }

    /// Textual peer address.
    pub fn peer(&self) -> &str {
        &self.shared.peer
    }

    /// Absolute deadline, if the caller set one.
    pub fn deadline(&self) -> Option<Instant> {
        self.shared.deadline
    }

    /// This layer's abort signal.
    pub fn signal(&self) -> &AbortSignal {
        &self.signal
    }

    /// Derive a context with a different abort signal. The shared call
    /// state stays shared; only downstream layers see the replacement.
    pub fn with_signal(&self, signal: AbortSignal) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            signal,
        }
    }

    /// Mutate the outgoing response header. Returns `None` without running
    /// `f` once `send_header` has been called or the header is on the wire.
    pub fn edit_header<R>(&self, f: impl FnOnce(&mut Metadata) -> R) -> Option<R> {
        let mut guard = self.shared.header.lock();
        match &mut *guard {
            HeaderState::Pending(md) => Some(f(md)),
            HeaderState::Requested(_) | HeaderState::Sent => None,
        }
    }

    /// Mutate the outgoing trailer. Allowed until the call ends; the
    /// snapshot taken at trailer time is what goes out.
    pub fn edit_trailer<R>(&self, f: impl FnOnce(&mut Metadata) -> R) -> R {
        f(&mut self.shared.trailer.lock())
    }

    /// Request that the response header go out now, ahead of any response
    /// message. Idempotent; later header mutations are rejected.
    pub fn send_header(&self) {
        let mut guard = self.shared.header.lock();
        if let HeaderState::Pending(md) = &mut *guard {
            let md = std::mem::take(md);
            *guard = HeaderState::Requested(md);
            self.shared.header_nudge.notify_one();
        }
    }

    /// Whether the header has already gone out.
    pub fn header_sent(&self) -> bool {
        matches!(&*self.shared.header.lock(), HeaderState::Sent)
    }

    /// Attach a typed extension slot, visible to every layer sharing this
    /// call (middleware below and above, and the handler).
    pub fn set_extension<T: Send + Sync + 'static>(&self, value: T) {
        self.shared
            .extensions
            .lock()
            .insert(TypeId::of::<T>(), Box::new(value));
    }

    /// Fetch a typed extension slot.
    pub fn extension<T: Clone + Send + Sync + 'static>(&self) -> Option<T> {
        self.shared
            .extensions
            .lock()
            .get(&TypeId::of::<T>())
            .and_then(|boxed| boxed.downcast_ref::<T>())
            .cloned()
    }

    /// Dispatcher side: the header metadata to flush, transitioning the
    /// cell to `Sent`. `None` if it already went out.
    pub(crate) fn take_header(&self) -> Option<Metadata> {
        let mut guard = self.shared.header.lock();
        match std::mem::replace(&mut *guard, HeaderState::Sent) {
            HeaderState::Pending(md) | HeaderState::Requested(md) => Some(md),
            HeaderState::Sent => None,
        }
    }

    /// Dispatcher side: wait for an explicit `send_header` request.
    pub(crate) async fn header_requested(&self) {
        self.shared.header_nudge.notified().await;
    }

    /// Dispatcher side: the trailer metadata as of now.
    pub(crate) fn trailer_snapshot(&self) -> Metadata {
        self.shared.trailer.lock().clone()
    }
}
