//! Transport contract for the skein RPC framework.
//!
//! The framework above this crate is transport-agnostic: it drives any
//! implementation of the traits defined here. A call is a bidirectional,
//! byte-framed exchange:
//!
//! - client to server: zero or more message frames, then half-close;
//! - server to client: one headers frame, zero or more message frames, then
//!   exactly one trailer frame.
//!
//! Either side may cancel. Deadlines travel out of band as a duration
//! (an HTTP/2 transport would render them as the `grpc-timeout` header).
//!
//! The [`mem`] module ships an in-memory implementation over bounded
//! channels, used by the test suites and by in-process embedding.

pub mod mem;

use async_trait::async_trait;
use bytes::Bytes;
use skein_core::{AbortSignal, Metadata, Status};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Transport-level failures. These carry no application detail; the layers
/// above map them onto status codes.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The connection or channel is closed; no further exchange is possible.
    #[error("transport closed")]
    Closed,

    /// The call was torn down (by either side) before completing.
    #[error("call cancelled")]
    Cancelled,

    /// No listener is reachable at the dialed address.
    #[error("unreachable: {addr}")]
    Unreachable { addr: String },
}

/// Terminal frame of every completed call.
#[derive(Debug, Clone)]
pub struct Trailer {
    pub status: Status,
    pub details: String,
    pub metadata: Metadata,
}

/// Server-to-client events observed by a call's reader.
#[derive(Debug)]
pub enum CallEvent {
    /// Initial response metadata. Exactly one, before any message.
    Headers(Metadata),
    /// One response message frame.
    Message(Bytes),
    /// Terminal status. Exactly one, after all messages.
    Trailer(Trailer),
}

/// Write half of an opened client call.
#[async_trait]
pub trait CallWriter: Send {
    /// Send one request frame. Blocks when the transport's write buffer is
    /// full (backpressure).
    async fn send(&mut self, frame: Bytes) -> Result<(), TransportError>;

    /// Signal that no further request frames follow.
    async fn half_close(&mut self) -> Result<(), TransportError>;
}

/// Read half of an opened client call.
#[async_trait]
pub trait CallEvents: Send {
    /// Next event. After the trailer has been yielded, returns
    /// `Err(TransportError::Closed)`.
    async fn next(&mut self) -> Result<CallEvent, TransportError>;
}

/// Cancels a call from any holder. Clone-cheap and idempotent.
pub trait CancelCall: Send + Sync {
    fn cancel(&self);
}

/// An opened client call, split so the two halves can be driven
/// concurrently.
pub struct OpenCall {
    pub writer: Box<dyn CallWriter>,
    pub events: Box<dyn CallEvents>,
    pub canceller: Arc<dyn CancelCall>,
}

impl std::fmt::Debug for OpenCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenCall").finish_non_exhaustive()
    }
}

/// Client half of the transport: opens calls against a remote.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Open a call to `path`, sending `metadata` as the request headers.
    async fn open(
        &self,
        path: &str,
        metadata: Metadata,
        deadline: Option<Duration>,
    ) -> Result<OpenCall, TransportError>;
}

/// Inbound request frames of an accepted call.
#[async_trait]
pub trait InboundFrames: Send {
    /// Next request frame. `Ok(None)` once the peer half-closes;
    /// `Err(Cancelled)` if the peer tore the call down.
    async fn next(&mut self) -> Result<Option<Bytes>, TransportError>;
}

/// Outbound response sink of an accepted call.
#[async_trait]
pub trait OutboundSink: Send {
    async fn send_headers(&mut self, metadata: Metadata) -> Result<(), TransportError>;

    /// Send one response frame. Blocks when the peer is not pulling
    /// (backpressure).
    async fn send_message(&mut self, frame: Bytes) -> Result<(), TransportError>;

    async fn send_trailer(
        &mut self,
        status: Status,
        details: String,
        metadata: Metadata,
    ) -> Result<(), TransportError>;
}

/// One call accepted by a listener.
pub struct AcceptedCall {
    /// Fully qualified method path, `/package.Service/Method`.
    pub path: String,
    /// Request metadata, frozen at open time.
    pub metadata: Metadata,
    /// Textual peer address.
    pub peer: String,
    /// Deadline negotiated at open time, if any.
    pub deadline: Option<Duration>,
    pub reader: Box<dyn InboundFrames>,
    pub writer: Box<dyn OutboundSink>,
    /// Fires (cause `Peer`) when the peer cancels the call.
    pub cancelled: AbortSignal,
}

/// Server half of the transport: a bound listener yielding accepted calls.
#[async_trait]
pub trait Listener: Send + 'static {
    /// The address this listener is bound to.
    fn local_addr(&self) -> String;

    /// Next accepted call. `None` once the listener is closed.
    async fn accept(&mut self) -> Option<AcceptedCall>;
}
