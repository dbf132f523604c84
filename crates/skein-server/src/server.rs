//! Server lifecycle: accept loop, in-flight accounting, shutdown.

use crate::dispatch::dispatch;
use crate::middleware::Middleware;
use crate::service::{MethodEntry, Service};
use crate::terminator::Terminator;
use skein_core::{AbortCause, AbortController, BoxError};
use skein_transport::Listener;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Notify};

/// Receives errors that must not leak to peers (unexpected handler
/// failures, cleanup errors after the call already failed).
pub type ErrorHook = Arc<dyn Fn(&BoxError) + Send + Sync>;

fn default_error_hook() -> ErrorHook {
    Arc::new(|err| tracing::error!(error = %err, "unhandled call error"))
}

/// In-flight call accounting for graceful drain.
struct Inflight {
    count: AtomicUsize,
    drained: Notify,
}

impl Inflight {
    fn new() -> Self {
        Self {
            count: AtomicUsize::new(0),
            drained: Notify::new(),
        }
    }

    fn start(self: &Arc<Self>) -> InflightPermit {
        self.count.fetch_add(1, Ordering::SeqCst);
        InflightPermit {
            inner: Arc::clone(self),
        }
    }

    async fn wait_drained(&self) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            // Register before checking, so a permit dropped in between
            // still wakes us.
            notified.as_mut().enable();
            if self.count.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

struct InflightPermit {
    inner: Arc<Inflight>,
}

impl Drop for InflightPermit {
    fn drop(&mut self) {
        if self.inner.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.inner.drained.notify_waiters();
        }
    }
}

struct ServerState {
    force: AbortController,
    inflight: Arc<Inflight>,
    terminators: Vec<Terminator>,
}

/// Entry point for building a server.
pub struct Server;

impl Server {
    pub fn builder() -> ServerBuilder {
        ServerBuilder {
            middlewares: Vec::new(),
            methods: HashMap::new(),
            error_hook: default_error_hook(),
            terminators: Vec::new(),
        }
    }
}

/// Accumulates middleware, services, and hooks, then binds a listener.
pub struct ServerBuilder {
    middlewares: Vec<Arc<dyn Middleware>>,
    methods: HashMap<String, Arc<MethodEntry>>,
    error_hook: ErrorHook,
    terminators: Vec<Terminator>,
}

impl ServerBuilder {
    /// Add a middleware layer. The first added is outermost: it sees every
    /// call first and its post-delegation work runs last.
    pub fn use_middleware(mut self, middleware: impl Middleware) -> Self {
        self.middlewares.push(Arc::new(middleware));
        self
    }

    /// Add a terminator's middleware and have graceful shutdown run its
    /// `terminate`.
    pub fn use_terminator(mut self, terminator: &Terminator) -> Self {
        self.terminators.push(terminator.clone());
        self.middlewares.push(Arc::new(terminator.middleware()));
        self
    }

    /// Register a service's handlers.
    pub fn add_service(mut self, service: Service) -> Self {
        for (path, entry) in service.into_methods() {
            if self.methods.insert(path.clone(), entry).is_some() {
                tracing::warn!(%path, "replacing an existing handler");
            }
        }
        self
    }

    /// Replace the local error hook. The default logs at error level.
    pub fn error_hook(mut self, hook: impl Fn(&BoxError) + Send + Sync + 'static) -> Self {
        self.error_hook = Arc::new(hook);
        self
    }

    /// Bind the listener and start serving. Calls run until the returned
    /// handle is shut down.
    pub fn serve(self, listener: impl Listener) -> ServerHandle {
        let local_addr = listener.local_addr();
        let state = Arc::new(ServerState {
            force: AbortController::new(),
            inflight: Arc::new(Inflight::new()),
            terminators: self.terminators,
        });
        let (stop_tx, stop_rx) = watch::channel(false);

        let accept = tokio::spawn(accept_loop(
            listener,
            Arc::new(self.methods),
            self.middlewares.into(),
            self.error_hook,
            Arc::clone(&state),
            stop_rx,
        ));

        ServerHandle {
            local_addr,
            stop: stop_tx,
            state,
            accept,
        }
    }
}

async fn accept_loop(
    mut listener: impl Listener,
    methods: Arc<HashMap<String, Arc<MethodEntry>>>,
    middlewares: Arc<[Arc<dyn Middleware>]>,
    error_hook: ErrorHook,
    state: Arc<ServerState>,
    mut stop: watch::Receiver<bool>,
) {
    tracing::info!(addr = %listener.local_addr(), "server listening");
    loop {
        tokio::select! {
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
            }
            accepted = listener.accept() => match accepted {
                Some(call) => {
                    let permit = state.inflight.start();
                    let methods = Arc::clone(&methods);
                    let middlewares = Arc::clone(&middlewares);
                    let error_hook = Arc::clone(&error_hook);
                    let force = state.force.signal();
                    tokio::spawn(async move {
                        dispatch(call, methods, middlewares, error_hook, force).await;
                        drop(permit);
                    });
                }
                None => break,
            }
        }
    }
    tracing::info!("server stopped accepting calls");
}

/// Handle to a serving server.
pub struct ServerHandle {
    local_addr: String,
    stop: watch::Sender<bool>,
    state: Arc<ServerState>,
    accept: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    /// The address the listener reported at bind time.
    pub fn local_addr(&self) -> &str {
        &self.local_addr
    }

    /// Graceful drain: stop accepting, run every registered terminator,
    /// then wait for in-flight calls to finish. Idempotent.
    pub async fn shutdown(&self) {
        tracing::info!("server shutting down");
        self.stop.send_replace(true);
        for terminator in &self.state.terminators {
            terminator.terminate();
        }
        self.state.inflight.wait_drained().await;
        tracing::info!("server drained");
    }

    /// Abort in-flight calls, then drain. Idempotent.
    pub async fn force_shutdown(&self) {
        tracing::info!("server force shutdown");
        self.stop.send_replace(true);
        self.state.force.abort(AbortCause::Shutdown);
        for terminator in &self.state.terminators {
            terminator.terminate();
        }
        self.state.inflight.wait_drained().await;
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.accept.abort();
    }
}
