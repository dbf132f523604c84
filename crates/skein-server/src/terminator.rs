//! Graceful-drain coordination for long-lived calls.
//!
//! A [`Terminator`] lets handlers opt into being forcibly aborted when the
//! server begins graceful shutdown, so open-ended streams don't block the
//! drain. Its middleware gives every call a child abort signal; a handler
//! that calls [`TerminatorHandle::abort_on_terminate`] joins the set that
//! [`Terminator::terminate`] aborts.

use crate::context::CallContext;
use crate::middleware::{abort_when, CallFault, Middleware, ResponseStream, ServerCall};
use futures::StreamExt;
use parking_lot::Mutex;
use skein_core::{AbortCause, AbortController, ServerError, Status};
use std::collections::HashMap;
use std::sync::Arc;

struct TerminatorState {
    /// Once true, no further registrations are accepted.
    closed: bool,
    registered: HashMap<u64, Arc<AbortController>>,
    next_id: u64,
}

/// Shutdown-abort coordinator. Clones share one registration set.
#[derive(Clone)]
pub struct Terminator {
    state: Arc<Mutex<TerminatorState>>,
}

impl Terminator {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(TerminatorState {
                closed: false,
                registered: HashMap::new(),
                next_id: 0,
            })),
        }
    }

    /// The middleware wiring calls up to this terminator. Register it
    /// early (outermost) so inner layers and the handler see the child
    /// signal.
    pub fn middleware(&self) -> TerminatorMiddleware {
        TerminatorMiddleware {
            terminator: self.clone(),
        }
    }

    /// Abort every registered call and close the set. Idempotent: a second
    /// invocation finds the set empty and closed. Calls that try to
    /// register afterwards abort immediately.
    pub fn terminate(&self) {
        let drained: Vec<Arc<AbortController>> = {
            let mut state = self.state.lock();
            state.closed = true;
            state.registered.drain().map(|(_, c)| c).collect()
        };
        if !drained.is_empty() {
            tracing::info!(calls = drained.len(), "terminating registered calls");
        }
        for controller in drained {
            controller.abort(AbortCause::Shutdown);
        }
    }

    fn allocate_id(&self) -> u64 {
        let mut state = self.state.lock();
        let id = state.next_id;
        state.next_id += 1;
        id
    }

    /// True if registered; false if terminate already ran.
    fn register(&self, id: u64, controller: Arc<AbortController>) -> bool {
        let mut state = self.state.lock();
        if state.closed {
            return false;
        }
        state.registered.insert(id, controller);
        true
    }

    fn deregister(&self, id: u64) {
        self.state.lock().registered.remove(&id);
    }
}

impl Default for Terminator {
    fn default() -> Self {
        Self::new()
    }
}

/// Context extension installed by the terminator middleware.
#[derive(Clone)]
pub struct TerminatorHandle {
    terminator: Terminator,
    controller: Arc<AbortController>,
    id: u64,
}

impl TerminatorHandle {
    /// Opt this call into shutdown aborts. If shutdown already started,
    /// the call's signal fires immediately.
    pub fn abort_on_terminate(&self) {
        if !self
            .terminator
            .register(self.id, Arc::clone(&self.controller))
        {
            self.controller.abort(AbortCause::Shutdown);
        }
    }
}

/// Detaches the outer-signal forward and drops the registration on every
/// exit path.
struct CallCleanup {
    forward: tokio::task::JoinHandle<()>,
    terminator: Terminator,
    id: u64,
}

impl Drop for CallCleanup {
    fn drop(&mut self) {
        self.forward.abort();
        self.terminator.deregister(self.id);
    }
}

/// Middleware produced by [`Terminator::middleware`].
pub struct TerminatorMiddleware {
    terminator: Terminator,
}

impl Middleware for TerminatorMiddleware {
    fn call(&self, mut call: ServerCall, ctx: CallContext) -> ResponseStream {
        let terminator = self.terminator.clone();
        let outer = ctx.signal().clone();

        let controller = Arc::new(AbortController::new());
        let inner = controller.signal();
        let id = terminator.allocate_id();

        let inner_ctx = ctx.with_signal(inner.clone());
        inner_ctx.set_extension(TerminatorHandle {
            terminator: terminator.clone(),
            controller: Arc::clone(&controller),
            id,
        });

        // Cascade outer aborts (peer, deadline, force) into the child.
        let forward = tokio::spawn({
            let outer = outer.clone();
            let controller = Arc::clone(&controller);
            async move {
                outer.aborted().await;
                controller.abort(outer.cause().unwrap_or(AbortCause::Shutdown));
            }
        });
        let cleanup = CallCleanup {
            forward,
            terminator,
            id,
        };

        let request = call.take_request();
        let delegated = abort_when(call.next(request, inner_ctx), inner.clone());

        Box::pin(async_stream::stream! {
            let _cleanup = cleanup;
            let mut delegated = delegated;
            while let Some(item) = delegated.next().await {
                match item {
                    Err(_) if inner.is_aborted() && !outer.is_aborted() => {
                        yield Err(CallFault::Server(ServerError::new(
                            Status::Unavailable,
                            "Server shutting down",
                        )));
                        break;
                    }
                    Err(fault) => {
                        yield Err(fault);
                        break;
                    }
                    ok => yield ok,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_terminate_aborts_registered_calls() {
        let terminator = Terminator::new();
        let controller = Arc::new(AbortController::new());
        let id = terminator.allocate_id();
        assert!(terminator.register(id, Arc::clone(&controller)));

        terminator.terminate();
        assert!(controller.is_aborted());
        assert_eq!(controller.signal().cause(), Some(AbortCause::Shutdown));
    }

    #[tokio::test]
    async fn test_register_after_terminate_is_refused() {
        let terminator = Terminator::new();
        terminator.terminate();
        let controller = Arc::new(AbortController::new());
        let id = terminator.allocate_id();
        assert!(!terminator.register(id, Arc::clone(&controller)));
    }

    #[tokio::test]
    async fn test_terminate_twice_is_noop() {
        let terminator = Terminator::new();
        let controller = Arc::new(AbortController::new());
        let id = terminator.allocate_id();
        terminator.register(id, Arc::clone(&controller));
        terminator.terminate();
        terminator.terminate();
        assert!(controller.is_aborted());
    }

    #[tokio::test]
    async fn test_handle_aborts_immediately_when_closed() {
        let terminator = Terminator::new();
        terminator.terminate();
        let controller = Arc::new(AbortController::new());
        let handle = TerminatorHandle {
            terminator: terminator.clone(),
            controller: Arc::clone(&controller),
            id: terminator.allocate_id(),
        };
        handle.abort_on_terminate();
        assert!(controller.is_aborted());
    }

    #[tokio::test]
    async fn test_deregister_shrinks_set() {
        let terminator = Terminator::new();
        let controller = Arc::new(AbortController::new());
        let id = terminator.allocate_id();
        terminator.register(id, Arc::clone(&controller));
        terminator.deregister(id);
        terminator.terminate();
        assert!(!controller.is_aborted());
    }
}
