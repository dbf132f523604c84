//! Per-call dispatch: transport in, chain through, transport out.
//!
//! One `dispatch` runs per accepted call, in its own task. It owns the
//! call's abort controller (fed by peer cancellation, the deadline timer,
//! and forced shutdown), builds the [`CallContext`], feeds the middleware
//! chain, and drives the composed response stream back to the transport
//! with the header/trailer bookkeeping the lifecycle invariants demand:
//! header exactly once before any response frame, trailer exactly once
//! after all of them, and neither after a peer cancellation.

use crate::context::CallContext;
use crate::middleware::{
    abort_when, CallFault, CallRequest, Middleware, RequestFrames, ResponseStream, ServerCall,
};
use crate::server::ErrorHook;
use crate::service::MethodEntry;
use futures::StreamExt;
use skein_core::{AbortCause, AbortController, AbortSignal, Metadata, ServerError, Status};
use skein_transport::{AcceptedCall, InboundFrames, OutboundSink, TransportError};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::Instant;

/// How the composed response stream ended.
enum Outcome {
    /// Clean completion: trailer `OK`.
    Complete,
    /// Terminal fault: trailer per the error table.
    Fault(CallFault),
    /// The transport rejected a write; the peer is gone. No trailer.
    PeerGone,
}

pub(crate) async fn dispatch(
    accepted: AcceptedCall,
    methods: Arc<HashMap<String, Arc<MethodEntry>>>,
    middlewares: Arc<[Arc<dyn Middleware>]>,
    error_hook: ErrorHook,
    force: AbortSignal,
) {
    let AcceptedCall {
        path,
        metadata,
        peer,
        deadline,
        mut reader,
        mut writer,
        cancelled,
    } = accepted;
    tracing::debug!(%path, %peer, "call accepted");

    let Some(entry) = methods.get(&path).map(Arc::clone) else {
        tracing::debug!(%path, "no handler registered");
        let _ = writer.send_headers(Metadata::new()).await;
        let _ = writer
            .send_trailer(
                Status::Unimplemented,
                format!("unknown method: {path}"),
                Metadata::new(),
            )
            .await;
        return;
    };

    let controller = Arc::new(AbortController::new());
    let deadline_at = deadline.map(|timeout| Instant::now() + timeout);
    let sources = tokio::spawn(abort_sources(
        Arc::clone(&controller),
        cancelled,
        force,
        deadline_at,
    ));
    let ctx = CallContext::new(metadata, peer, deadline_at, controller.signal());

    let request = if entry.descriptor.client_streaming() {
        CallRequest::Stream(request_frames(reader, Arc::clone(&entry)))
    } else {
        match read_single_request(&mut reader, &entry, ctx.signal()).await {
            SingleRequest::Message(msg) => CallRequest::Single(msg),
            SingleRequest::Fault(fault) => {
                finish(&mut writer, &ctx, &error_hook, Outcome::Fault(fault)).await;
                sources.abort();
                return;
            }
            SingleRequest::PeerGone => {
                sources.abort();
                return;
            }
        }
    };

    let call = ServerCall::new(
        Arc::clone(&entry.descriptor),
        request,
        middlewares,
        Arc::clone(&entry.handler),
    );
    let stream = abort_when(call.run(ctx.clone()), ctx.signal().clone());
    let outcome = drive(stream, &mut writer, &entry, &ctx).await;

    finish(&mut writer, &ctx, &error_hook, outcome).await;
    sources.abort();
}

/// Feed the call's abort controller from its three server-side sources.
async fn abort_sources(
    controller: Arc<AbortController>,
    peer_cancel: AbortSignal,
    force: AbortSignal,
    deadline: Option<Instant>,
) {
    let deadline_elapsed = async {
        match deadline {
            Some(at) => tokio::time::sleep_until(at).await,
            None => std::future::pending().await,
        }
    };
    tokio::select! {
        _ = peer_cancel.aborted() => controller.abort(AbortCause::Peer),
        _ = force.aborted() => controller.abort(AbortCause::Shutdown),
        _ = deadline_elapsed => controller.abort(AbortCause::Deadline),
    }
}

enum SingleRequest {
    Message(crate::middleware::AnyMessage),
    Fault(CallFault),
    PeerGone,
}

/// Read and decode the one request message of a single-input call.
async fn read_single_request(
    reader: &mut Box<dyn InboundFrames>,
    entry: &MethodEntry,
    signal: &AbortSignal,
) -> SingleRequest {
    let frame = tokio::select! {
        biased;
        _ = signal.aborted() => return SingleRequest::Fault(CallFault::Aborted),
        frame = reader.next() => frame,
    };
    match frame {
        Ok(Some(frame)) => match entry.decode(frame) {
            Ok(msg) => SingleRequest::Message(msg),
            Err(err) => {
                tracing::debug!(error = %err, "request decode failed");
                SingleRequest::Fault(CallFault::Server(ServerError::new(
                    Status::Internal,
                    "message decode failed",
                )))
            }
        },
        Ok(None) => SingleRequest::Fault(CallFault::Server(ServerError::new(
            Status::Internal,
            "missing request message",
        ))),
        Err(TransportError::Cancelled) | Err(TransportError::Closed) => SingleRequest::PeerGone,
        Err(err) => {
            tracing::debug!(error = %err, "request read failed");
            SingleRequest::PeerGone
        }
    }
}

/// The lazy request sequence of an input-streaming call. Ends cleanly on
/// half-close; surfaces teardown and decode failures as error items so the
/// handler's iteration observes them.
fn request_frames(mut reader: Box<dyn InboundFrames>, entry: Arc<MethodEntry>) -> RequestFrames {
    Box::pin(async_stream::stream! {
        loop {
            match reader.next().await {
                Ok(Some(frame)) => match entry.decode(frame) {
                    Ok(msg) => yield Ok(msg),
                    Err(err) => {
                        tracing::debug!(error = %err, "request decode failed");
                        yield Err(CallFault::Server(ServerError::new(
                            Status::Internal,
                            "message decode failed",
                        )));
                        break;
                    }
                },
                Ok(None) => break,
                Err(_) => {
                    yield Err(CallFault::Aborted);
                    break;
                }
            }
        }
    })
}

/// Pump the composed response stream to the transport, flushing the header
/// at the first response frame or an explicit `send_header` request,
/// whichever comes first.
async fn drive(
    mut stream: ResponseStream,
    writer: &mut Box<dyn OutboundSink>,
    entry: &MethodEntry,
    ctx: &CallContext,
) -> Outcome {
    loop {
        tokio::select! {
            _ = ctx.header_requested() => {
                if flush_header(writer, ctx).await.is_err() {
                    return Outcome::PeerGone;
                }
            }
            item = stream.next() => match item {
                Some(Ok(msg)) => {
                    let frame = match entry.encode(msg) {
                        Ok(frame) => frame,
                        Err(err) => {
                            tracing::debug!(error = %err, "response encode failed");
                            return Outcome::Fault(CallFault::Server(ServerError::new(
                                Status::Internal,
                                "message encode failed",
                            )));
                        }
                    };
                    if flush_header(writer, ctx).await.is_err() {
                        return Outcome::PeerGone;
                    }
                    if writer.send_message(frame).await.is_err() {
                        return Outcome::PeerGone;
                    }
                }
                Some(Err(fault)) => return Outcome::Fault(fault),
                None => return Outcome::Complete,
            }
        }
    }
}

async fn flush_header(
    writer: &mut Box<dyn OutboundSink>,
    ctx: &CallContext,
) -> Result<(), TransportError> {
    match ctx.take_header() {
        Some(header) => writer.send_headers(header).await,
        None => Ok(()),
    }
}

/// Close the call out per the error table. Sends the trailer exactly once;
/// skips it entirely when the peer already tore the call down.
async fn finish(
    writer: &mut Box<dyn OutboundSink>,
    ctx: &CallContext,
    error_hook: &ErrorHook,
    outcome: Outcome,
) {
    let (status, details) = match outcome {
        Outcome::Complete => (Status::Ok, String::new()),
        Outcome::Fault(CallFault::Server(err)) => {
            tracing::debug!(status = %err.status(), "call failed");
            (err.status(), err.details().to_string())
        }
        Outcome::Fault(CallFault::Aborted) => {
            if ctx.signal().cause() == Some(AbortCause::Peer) {
                tracing::debug!("peer cancelled; releasing call without trailer");
                return;
            }
            (Status::Cancelled, "call aborted".to_string())
        }
        Outcome::Fault(CallFault::Unexpected(err)) => {
            error_hook(&err);
            (Status::Unknown, "internal error".to_string())
        }
        Outcome::PeerGone => {
            tracing::debug!("peer went away mid-call");
            return;
        }
    };

    if flush_header(writer, ctx).await.is_err() {
        return;
    }
    let trailer = ctx.trailer_snapshot();
    if let Err(err) = writer.send_trailer(status, details, trailer).await {
        tracing::debug!(error = %err, "trailer send failed");
    }
}
