//! The middleware chain.
//!
//! A middleware wraps every call as a lazy response stream: it may observe
//! the call start, transform the request(s), transform or inject responses,
//! observe completion, and hand a modified context downstream. Composition
//! nests: the first middleware registered is outermost and sees the call
//! first; the innermost layer is the handler adapter itself.
//!
//! Messages cross the chain decoded but type-erased ([`AnyMessage`]);
//! codecs apply only at the transport boundary, so a chain of pass-through
//! middlewares costs no re-serialization.

use crate::context::CallContext;
use futures::stream::{Stream, StreamExt};
use skein_core::{AbortSignal, BoxError, MethodDescriptor, ServerError};
use std::any::Any;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;

/// A decoded message moving through the chain.
pub type AnyMessage = Box<dyn Any + Send>;

/// Failure modes that travel down a call's response stream.
#[derive(Debug, Error)]
pub enum CallFault {
    /// A handler or middleware raised; becomes the trailer.
    #[error(transparent)]
    Server(#[from] ServerError),

    /// The layer's abort signal fired before completion.
    #[error("call aborted")]
    Aborted,

    /// Anything else. Mapped to an `UNKNOWN` trailer with a sanitized
    /// message; the original only reaches the local error hook.
    #[error("unexpected call failure: {0}")]
    Unexpected(#[source] BoxError),
}

/// Lazy response sequence produced by a handler or middleware layer.
///
/// The stream ends after its terminal item: either running to completion
/// (status OK) or yielding one `Err` (the terminal fault).
pub type ResponseStream = Pin<Box<dyn Stream<Item = Result<AnyMessage, CallFault>> + Send>>;

/// Lazy request sequence for input-streaming calls, decoded and erased.
pub type RequestFrames = Pin<Box<dyn Stream<Item = Result<AnyMessage, CallFault>> + Send>>;

/// The request side of a call as a middleware sees it.
pub enum CallRequest {
    /// Unary / server-streaming input: the single decoded message.
    Single(AnyMessage),
    /// Client-streaming / duplex input: the lazy request sequence.
    Stream(RequestFrames),
}

/// Handler erased over its message types; the chain's innermost layer.
pub(crate) type ErasedHandler =
    Arc<dyn Fn(CallRequest, CallContext) -> ResponseStream + Send + Sync>;

/// One layer of the chain.
///
/// Implementations either delegate via [`ServerCall::next`] (transforming
/// the request, context, or the returned stream) or short-circuit by
/// producing a response stream of their own.
pub trait Middleware: Send + Sync + 'static {
    fn call(&self, call: ServerCall, ctx: CallContext) -> ResponseStream;
}

/// Adapt a closure into a [`Middleware`].
pub fn middleware_fn<F>(f: F) -> MiddlewareFn<F>
where
    F: Fn(ServerCall, CallContext) -> ResponseStream + Send + Sync + 'static,
{
    MiddlewareFn { f }
}

/// See [`middleware_fn`].
pub struct MiddlewareFn<F> {
    f: F,
}

impl<F> Middleware for MiddlewareFn<F>
where
    F: Fn(ServerCall, CallContext) -> ResponseStream + Send + Sync + 'static,
{
    fn call(&self, call: ServerCall, ctx: CallContext) -> ResponseStream {
        (self.f)(call, ctx)
    }
}

/// A call paused at one layer of the chain.
pub struct ServerCall {
    method: Arc<MethodDescriptor>,
    request: Option<CallRequest>,
    middlewares: Arc<[Arc<dyn Middleware>]>,
    index: usize,
    handler: ErasedHandler,
}

impl ServerCall {
    pub(crate) fn new(
        method: Arc<MethodDescriptor>,
        request: CallRequest,
        middlewares: Arc<[Arc<dyn Middleware>]>,
        handler: ErasedHandler,
    ) -> Self {
        Self {
            method,
            request: Some(request),
            middlewares,
            index: 0,
            handler,
        }
    }

    /// The method under call, with its streaming flags.
    pub fn method(&self) -> &MethodDescriptor {
        &self.method
    }

    /// Take the request out of the call for inspection or transformation.
    ///
    /// May only be taken once; taking it and then delegating with
    /// [`ServerCall::next`] is the normal pattern.
    pub fn take_request(&mut self) -> CallRequest {
        self.request
            .take()
            .expect("call request already taken")
    }

    /// Delegate to the next layer (or the handler, at the end of the
    /// chain) with the given request and context.
    pub fn next(self, request: CallRequest, ctx: CallContext) -> ResponseStream {
        match self.middlewares.get(self.index) {
            Some(layer) => {
                let layer = Arc::clone(layer);
                let inner = Self {
                    method: self.method,
                    request: Some(request),
                    middlewares: self.middlewares,
                    index: self.index + 1,
                    handler: self.handler,
                };
                layer.call(inner, ctx)
            }
            None => (self.handler)(request, ctx),
        }
    }

    /// Enter the chain from the outside.
    pub(crate) fn run(mut self, ctx: CallContext) -> ResponseStream {
        let request = self.take_request();
        self.next(request, ctx)
    }
}

/// A single-fault response stream.
pub fn fault_stream(fault: CallFault) -> ResponseStream {
    Box::pin(futures::stream::iter([Err(fault)]))
}

/// Race a response stream against an abort signal.
///
/// Once the signal fires, the inner stream is dropped (running its cleanup)
/// and the stream terminates with [`CallFault::Aborted`]; items the inner
/// layer produces after the signal are discarded.
pub fn abort_when(stream: ResponseStream, signal: AbortSignal) -> ResponseStream {
    Box::pin(async_stream::stream! {
        let mut stream = stream;
        loop {
            tokio::select! {
                biased;
                _ = signal.aborted() => {
                    drop(stream);
                    yield Err(CallFault::Aborted);
                    break;
                }
                item = stream.next() => match item {
                    Some(item) => {
                        let terminal = item.is_err();
                        yield item;
                        if terminal {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use skein_core::{AbortCause, AbortController, Metadata, Status};

    fn unary_method() -> Arc<MethodDescriptor> {
        Arc::new(MethodDescriptor::new("test.Test", "Unary", false, false))
    }

    fn echo_handler() -> ErasedHandler {
        Arc::new(|request, _ctx| match request {
            CallRequest::Single(msg) => Box::pin(futures::stream::iter([Ok(msg)])),
            CallRequest::Stream(_) => fault_stream(CallFault::Unexpected(
                "unexpected stream request".into(),
            )),
        })
    }

    fn test_ctx() -> CallContext {
        CallContext::new(
            Metadata::new(),
            "test-peer".to_string(),
            None,
            AbortSignal::never(),
        )
    }

    #[tokio::test]
    async fn test_empty_chain_reaches_handler() {
        let call = ServerCall::new(
            unary_method(),
            CallRequest::Single(Box::new(7u32)),
            Vec::<Arc<dyn Middleware>>::new().into(),
            echo_handler(),
        );
        let items: Vec<_> = call.run(test_ctx()).collect().await;
        assert_eq!(items.len(), 1);
        let msg = items.into_iter().next().unwrap().unwrap();
        assert_eq!(*msg.downcast::<u32>().unwrap(), 7);
    }

    #[tokio::test]
    async fn test_middleware_transforms_request_and_response() {
        let doubler: Arc<dyn Middleware> = Arc::new(middleware_fn(
            |mut call: ServerCall, ctx: CallContext| -> ResponseStream {
                let request = match call.take_request() {
                    CallRequest::Single(msg) => {
                        let value = *msg.downcast::<u32>().unwrap();
                        CallRequest::Single(Box::new(value * 2) as AnyMessage)
                    }
                    other => other,
                };
                let inner = call.next(request, ctx);
                Box::pin(inner.map(|item| {
                    item.map(|msg| {
                        let value = *msg.downcast::<u32>().unwrap();
                        Box::new(value + 1) as AnyMessage
                    })
                }))
            },
        ));

        let call = ServerCall::new(
            unary_method(),
            CallRequest::Single(Box::new(10u32)),
            vec![doubler].into(),
            echo_handler(),
        );
        let items: Vec<_> = call.run(test_ctx()).collect().await;
        let msg = items.into_iter().next().unwrap().unwrap();
        assert_eq!(*msg.downcast::<u32>().unwrap(), 21);
    }

    #[tokio::test]
    async fn test_fault_passes_through_chain() {
        let passthrough: Arc<dyn Middleware> = Arc::new(middleware_fn(
            |mut call: ServerCall, ctx: CallContext| -> ResponseStream {
                let request = call.take_request();
                call.next(request, ctx)
            },
        ));
        let failing: ErasedHandler = Arc::new(|_request, _ctx| {
            fault_stream(CallFault::Server(ServerError::new(
                Status::NotFound,
                "missing",
            )))
        });
        let call = ServerCall::new(
            unary_method(),
            CallRequest::Single(Box::new(0u32)),
            vec![passthrough].into(),
            failing,
        );
        let items: Vec<_> = call.run(test_ctx()).collect().await;
        let fault = items
            .into_iter()
            .next()
            .unwrap()
            .err()
            .expect("expected a fault");
        match fault {
            CallFault::Server(err) => assert_eq!(err.status(), Status::NotFound),
            other => panic!("expected server fault, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_abort_when_cuts_pending_stream() {
        let ctrl = AbortController::new();
        let pending: ResponseStream = Box::pin(futures::stream::pending());
        let mut wrapped = abort_when(pending, ctrl.signal());
        ctrl.abort(AbortCause::Shutdown);
        let item = wrapped.next().await.unwrap();
        assert!(matches!(item, Err(CallFault::Aborted)));
        assert!(wrapped.next().await.is_none());
    }
}
