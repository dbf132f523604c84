//! Service registration.
//!
//! A [`Service`] binds a service descriptor to one handler per method.
//! Handlers are registered with their typed signatures and erased behind
//! the chain's [`AnyMessage`] representation; the codec pair comes from the
//! same [`MethodSpec`] the client uses, so both sides share one schema
//! definition.

use crate::context::CallContext;
use crate::middleware::{
    fault_stream, AnyMessage, CallFault, CallRequest, ErasedHandler, RequestFrames,
    ResponseStream,
};
use bytes::Bytes;
use futures::stream::{Stream, StreamExt};
use skein_core::{
    Codec, CodecError, MethodDescriptor, MethodSpec, ServerError, ServiceDescriptor, Status,
};
use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

/// Typed view of an input-streaming call's requests, as handlers see it.
///
/// Yields one decoded request per item. Ends cleanly when the peer
/// half-closes; yields an error item if the call is torn down mid-stream or
/// a frame fails to decode.
pub struct RequestStream<Req> {
    inner: RequestFrames,
    _marker: PhantomData<fn() -> Req>,
}

impl<Req: Send + 'static> RequestStream<Req> {
    pub(crate) fn new(inner: RequestFrames) -> Self {
        Self {
            inner,
            _marker: PhantomData,
        }
    }
}

impl<Req: Send + 'static> Stream for RequestStream<Req> {
    type Item = Result<Req, ServerError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match this.inner.as_mut().poll_next(cx) {
            Poll::Ready(Some(Ok(msg))) => Poll::Ready(Some(match msg.downcast::<Req>() {
                Ok(req) => Ok(*req),
                Err(_) => Err(ServerError::new(
                    Status::Internal,
                    "request message type mismatch",
                )),
            })),
            Poll::Ready(Some(Err(fault))) => Poll::Ready(Some(Err(match fault {
                CallFault::Server(err) => err,
                CallFault::Aborted => ServerError::new(Status::Cancelled, "call aborted"),
                CallFault::Unexpected(err) => {
                    ServerError::new(Status::Unknown, err.to_string())
                }
            }))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// One registered method: descriptor, erased handler, boundary codecs.
pub(crate) struct MethodEntry {
    pub descriptor: Arc<MethodDescriptor>,
    pub handler: ErasedHandler,
    decode: Arc<dyn Fn(Bytes) -> Result<AnyMessage, CodecError> + Send + Sync>,
    encode: Arc<dyn Fn(AnyMessage) -> Result<Bytes, CodecError> + Send + Sync>,
}

impl MethodEntry {
    pub fn decode(&self, frame: Bytes) -> Result<AnyMessage, CodecError> {
        (self.decode)(frame)
    }

    pub fn encode(&self, message: AnyMessage) -> Result<Bytes, CodecError> {
        (self.encode)(message)
    }
}

/// A service implementation: descriptor plus per-method handlers.
pub struct Service {
    descriptor: ServiceDescriptor,
    methods: HashMap<String, Arc<MethodEntry>>,
}

impl Service {
    /// Start registering handlers for the fully qualified service `name`
    /// (`package.Service`).
    pub fn builder(name: impl Into<String>) -> ServiceBuilder {
        ServiceBuilder {
            descriptor: ServiceDescriptor::new(name),
            methods: HashMap::new(),
        }
    }

    pub fn descriptor(&self) -> &ServiceDescriptor {
        &self.descriptor
    }

    pub(crate) fn into_methods(self) -> HashMap<String, Arc<MethodEntry>> {
        self.methods
    }
}

/// Builder for a [`Service`]. One registration call per method kind.
pub struct ServiceBuilder {
    descriptor: ServiceDescriptor,
    methods: HashMap<String, Arc<MethodEntry>>,
}

impl ServiceBuilder {
    /// Register a unary handler.
    pub fn unary<Req, Res, H, Fut>(self, spec: &MethodSpec<Req, Res>, handler: H) -> Self
    where
        Req: Send + 'static,
        Res: Send + 'static,
        H: Fn(Req, CallContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Res, ServerError>> + Send + 'static,
    {
        self.check_flags(spec.descriptor(), false, false);
        let handler = Arc::new(handler);
        let erased: ErasedHandler = Arc::new(move |request, ctx| {
            let handler = Arc::clone(&handler);
            match single_request::<Req>(request) {
                Ok(req) => Box::pin(futures::stream::once(async move {
                    let res = handler(req, ctx).await?;
                    Ok(Box::new(res) as AnyMessage)
                })),
                Err(fault) => fault_stream(fault),
            }
        });
        self.insert(spec, erased)
    }

    /// Register a server-streaming handler. The handler returns the lazy
    /// response sequence; yielding an `Err` terminates the call with that
    /// error's status.
    pub fn server_streaming<Req, Res, H, S>(
        self,
        spec: &MethodSpec<Req, Res>,
        handler: H,
    ) -> Self
    where
        Req: Send + 'static,
        Res: Send + 'static,
        H: Fn(Req, CallContext) -> S + Send + Sync + 'static,
        S: Stream<Item = Result<Res, ServerError>> + Send + 'static,
    {
        self.check_flags(spec.descriptor(), false, true);
        let handler = Arc::new(handler);
        let erased: ErasedHandler = Arc::new(move |request, ctx| {
            match single_request::<Req>(request) {
                Ok(req) => erase_responses(handler(req, ctx)),
                Err(fault) => fault_stream(fault),
            }
        });
        self.insert(spec, erased)
    }

    /// Register a client-streaming handler.
    pub fn client_streaming<Req, Res, H, Fut>(
        self,
        spec: &MethodSpec<Req, Res>,
        handler: H,
    ) -> Self
    where
        Req: Send + 'static,
        Res: Send + 'static,
        H: Fn(RequestStream<Req>, CallContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Res, ServerError>> + Send + 'static,
    {
        self.check_flags(spec.descriptor(), true, false);
        let handler = Arc::new(handler);
        let erased: ErasedHandler = Arc::new(move |request, ctx| {
            let handler = Arc::clone(&handler);
            match stream_request::<Req>(request) {
                Ok(reqs) => Box::pin(futures::stream::once(async move {
                    let res = handler(reqs, ctx).await?;
                    Ok(Box::new(res) as AnyMessage)
                })),
                Err(fault) => fault_stream(fault),
            }
        });
        self.insert(spec, erased)
    }

    /// Register a bidirectional-streaming handler.
    pub fn duplex_streaming<Req, Res, H, S>(
        self,
        spec: &MethodSpec<Req, Res>,
        handler: H,
    ) -> Self
    where
        Req: Send + 'static,
        Res: Send + 'static,
        H: Fn(RequestStream<Req>, CallContext) -> S + Send + Sync + 'static,
        S: Stream<Item = Result<Res, ServerError>> + Send + 'static,
    {
        self.check_flags(spec.descriptor(), true, true);
        let handler = Arc::new(handler);
        let erased: ErasedHandler = Arc::new(move |request, ctx| {
            match stream_request::<Req>(request) {
                Ok(reqs) => erase_responses(handler(reqs, ctx)),
                Err(fault) => fault_stream(fault),
            }
        });
        self.insert(spec, erased)
    }

    pub fn build(self) -> Service {
        Service {
            descriptor: self.descriptor,
            methods: self.methods,
        }
    }

    fn check_flags(
        &self,
        descriptor: &MethodDescriptor,
        client_streaming: bool,
        server_streaming: bool,
    ) {
        assert_eq!(
            (descriptor.client_streaming(), descriptor.server_streaming()),
            (client_streaming, server_streaming),
            "method {} registered under the wrong streaming kind",
            descriptor.path(),
        );
        assert!(
            descriptor
                .path()
                .starts_with(&format!("/{}/", self.descriptor.name())),
            "method {} does not belong to service {}",
            descriptor.path(),
            self.descriptor.name(),
        );
    }

    fn insert<Req, Res>(mut self, spec: &MethodSpec<Req, Res>, handler: ErasedHandler) -> Self
    where
        Req: Send + 'static,
        Res: Send + 'static,
    {
        let descriptor = spec.descriptor().clone();
        self.descriptor.add_method(
            descriptor.client_streaming(),
            descriptor.server_streaming(),
            descriptor.name(),
        );

        let request_codec: Arc<dyn Codec<Req>> = Arc::clone(spec.request_codec());
        let response_codec: Arc<dyn Codec<Res>> = Arc::clone(spec.response_codec());
        let entry = MethodEntry {
            descriptor: Arc::new(descriptor.clone()),
            handler,
            decode: Arc::new(move |frame| {
                request_codec
                    .decode(frame)
                    .map(|req| Box::new(req) as AnyMessage)
            }),
            encode: Arc::new(move |message| match message.downcast::<Res>() {
                Ok(res) => response_codec.encode(&res),
                Err(_) => Err(CodecError::Encode {
                    reason: "response message type mismatch".to_string(),
                }),
            }),
        };
        self.methods
            .insert(descriptor.path().to_string(), Arc::new(entry));
        self
    }
}

fn single_request<Req: Send + 'static>(request: CallRequest) -> Result<Req, CallFault> {
    match request {
        CallRequest::Single(msg) => match msg.downcast::<Req>() {
            Ok(req) => Ok(*req),
            Err(_) => Err(CallFault::Unexpected(
                "request message type mismatch".into(),
            )),
        },
        CallRequest::Stream(_) => Err(CallFault::Unexpected(
            "streaming request for a single-input method".into(),
        )),
    }
}

fn stream_request<Req: Send + 'static>(
    request: CallRequest,
) -> Result<RequestStream<Req>, CallFault> {
    match request {
        CallRequest::Stream(frames) => Ok(RequestStream::new(frames)),
        CallRequest::Single(_) => Err(CallFault::Unexpected(
            "single request for a streaming-input method".into(),
        )),
    }
}

fn erase_responses<Res, S>(stream: S) -> ResponseStream
where
    Res: Send + 'static,
    S: Stream<Item = Result<Res, ServerError>> + Send + 'static,
{
    Box::pin(stream.map(|item| {
        item.map(|res| Box::new(res) as AnyMessage)
            .map_err(CallFault::from)
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use skein_core::BincodeCodec;

    fn spec() -> MethodSpec<String, String> {
        MethodSpec::unary(
            "test.Test",
            "Echo",
            BincodeCodec::<String>::new(),
            BincodeCodec::<String>::new(),
        )
    }

    #[test]
    fn test_builder_registers_method() {
        let service = Service::builder("test.Test")
            .unary(&spec(), |req: String, _ctx| async move { Ok(req) })
            .build();
        assert!(service.descriptor().method("Echo").is_some());
        let methods = service.into_methods();
        assert!(methods.contains_key("/test.Test/Echo"));
    }

    #[test]
    #[should_panic(expected = "wrong streaming kind")]
    fn test_builder_rejects_kind_mismatch() {
        let streaming = MethodSpec::<String, String>::server_streaming(
            "test.Test",
            "Watch",
            BincodeCodec::new(),
            BincodeCodec::new(),
        );
        let _ = Service::builder("test.Test")
            .unary(&streaming, |req: String, _ctx| async move { Ok(req) });
    }

    #[test]
    #[should_panic(expected = "does not belong to service")]
    fn test_builder_rejects_foreign_method() {
        let foreign = MethodSpec::<String, String>::unary(
            "other.Service",
            "Echo",
            BincodeCodec::new(),
            BincodeCodec::new(),
        );
        let _ = Service::builder("test.Test")
            .unary(&foreign, |req: String, _ctx| async move { Ok(req) });
    }

    #[tokio::test]
    async fn test_entry_decode_encode_roundtrip() {
        let service = Service::builder("test.Test")
            .unary(&spec(), |req: String, _ctx| async move { Ok(req) })
            .build();
        let methods = service.into_methods();
        let entry = methods.get("/test.Test/Echo").unwrap();

        let codec = BincodeCodec::<String>::new();
        let frame = codec.encode(&"hello".to_string()).unwrap();
        let msg = entry.decode(frame).unwrap();
        let bytes = entry.encode(msg).unwrap();
        assert_eq!(codec.decode(bytes).unwrap(), "hello");
    }

    #[tokio::test]
    async fn test_entry_encode_rejects_wrong_type() {
        let service = Service::builder("test.Test")
            .unary(&spec(), |req: String, _ctx| async move { Ok(req) })
            .build();
        let methods = service.into_methods();
        let entry = methods.get("/test.Test/Echo").unwrap();
        let err = entry.encode(Box::new(17u64)).unwrap_err();
        assert!(matches!(err, CodecError::Encode { .. }));
    }
}
