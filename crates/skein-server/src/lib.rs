//! skein-server: the server side of the skein RPC framework.
//!
//! Turns accepted transport calls into handler invocations with context
//! propagation, header/trailer negotiation, error mapping, cancellation,
//! and a composable middleware chain:
//!
//! ```ignore
//! let terminator = Terminator::new();
//! let service = Service::builder("example.Echo")
//!     .unary(&methods::ECHO, |req: EchoRequest, _ctx| async move {
//!         Ok(EchoResponse { id: req.id })
//!     })
//!     .build();
//!
//! let (connector, listener) = skein_transport::mem::pair("echo");
//! let server = Server::builder()
//!     .use_middleware(LoggingMiddleware)
//!     .use_terminator(&terminator)
//!     .add_service(service)
//!     .serve(listener);
//! // ... later
//! server.shutdown().await;
//! ```

pub mod context;
mod dispatch;
pub mod logging;
pub mod middleware;
pub mod server;
pub mod service;
pub mod terminator;

pub use context::CallContext;
pub use logging::LoggingMiddleware;
pub use middleware::{
    abort_when, fault_stream, middleware_fn, AnyMessage, CallFault, CallRequest, Middleware,
    MiddlewareFn, RequestFrames, ResponseStream, ServerCall,
};
pub use server::{ErrorHook, Server, ServerBuilder, ServerHandle};
pub use service::{RequestStream, Service, ServiceBuilder};
pub use terminator::{Terminator, TerminatorHandle, TerminatorMiddleware};
