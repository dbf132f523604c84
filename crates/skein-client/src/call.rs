//! The four call drivers.
//!
//! Each driver bridges a typed request (or request stream) and a typed
//! response (or response stream) with the underlying transport call,
//! honoring the ordering contract: `on_header` exactly once, strictly
//! before any response and before `on_trailer`; `on_trailer` exactly once;
//! a non-OK trailer replaces any pending completion value.
//!
//! Cancellation is Drop-driven: every driver holds a [`CancelGuard`] that
//! tears the transport call down unless the call ran to its trailer, so an
//! abandoned future or an early-dropped response stream releases its
//! resources, and the caller's request producer is dropped (running its
//! cleanup) on every exit path.

use crate::channel::{channel_closed, transport_failure, Channel};
use crate::error::CallError;
use crate::options::CallOptions;
use bytes::Bytes;
use futures::stream::{Stream, StreamExt};
use skein_core::{
    AbortSignal, BoxError, ClientError, Codec, CodecError, Metadata, MethodSpec, Status,
};
use skein_transport::{CallEvent, CallEvents, CallWriter, CancelCall, OpenCall, TransportError};
use std::pin::Pin;
use std::sync::Arc;
use tokio::time::Instant;

/// Boxed response stream of an output-streaming call.
pub type Responses<Res> = Pin<Box<dyn Stream<Item = Result<Res, CallError>> + Send>>;

/// Cancels the transport call on drop unless the call reached its trailer.
struct CancelGuard {
    canceller: Option<Arc<dyn CancelCall>>,
}

impl CancelGuard {
    fn new(canceller: Arc<dyn CancelCall>) -> Self {
        Self {
            canceller: Some(canceller),
        }
    }

    fn disarm(&mut self) {
        self.canceller = None;
    }
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        if let Some(canceller) = self.canceller.take() {
            canceller.cancel();
        }
    }
}

fn codec_failure(path: &str, err: CodecError) -> CallError {
    ClientError::new(path, Status::Unknown, err.to_string(), Metadata::new()).into()
}

fn deadline_exceeded(path: &str) -> CallError {
    ClientError::new(
        path,
        Status::DeadlineExceeded,
        "deadline exceeded",
        Metadata::new(),
    )
    .into()
}

fn protocol_violation(path: &str, what: &str) -> CallError {
    ClientError::new(path, Status::Internal, what, Metadata::new()).into()
}

fn remote_failure(path: &str, trailer: skein_transport::Trailer) -> CallError {
    ClientError::new(
        path,
        trailer.status,
        trailer.details,
        trailer.metadata,
    )
    .into()
}

async fn deadline_elapsed(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Resolves with the right error as soon as any local interrupt fires:
/// the caller's abort signal, channel closure, or the deadline.
async fn watch_interrupts(
    signal: &AbortSignal,
    closed: &AbortSignal,
    deadline: Option<Instant>,
    path: &str,
) -> CallError {
    tokio::select! {
        biased;
        _ = signal.aborted() => CallError::Aborted,
        _ = closed.aborted() => channel_closed(path),
        _ = deadline_elapsed(deadline) => deadline_exceeded(path),
    }
}

enum PumpError {
    Producer(BoxError),
    Codec(CodecError),
    Transport(TransportError),
}

/// Serialize and write every request the producer yields, then half-close.
/// A producer error stops the pump; the caller cancels and rethrows.
async fn pump_requests<Req, S>(
    requests: S,
    codec: Arc<dyn Codec<Req>>,
    mut writer: Box<dyn CallWriter>,
) -> Result<(), PumpError>
where
    Req: Send + 'static,
    S: Stream<Item = Result<Req, BoxError>> + Send + 'static,
{
    futures::pin_mut!(requests);
    while let Some(item) = requests.next().await {
        let request = item.map_err(PumpError::Producer)?;
        let frame = codec.encode(&request).map_err(PumpError::Codec)?;
        writer.send(frame).await.map_err(PumpError::Transport)?;
    }
    writer.half_close().await.map_err(PumpError::Transport)
}

/// Send the one request of a single-input call and half-close, bailing out
/// if an interrupt fires while the write buffer is full.
async fn send_single_request(
    writer: &mut Box<dyn CallWriter>,
    frame: Bytes,
    signal: &AbortSignal,
    closed: &AbortSignal,
    deadline: Option<Instant>,
    path: &str,
) -> Result<(), CallError> {
    tokio::select! {
        biased;
        err = watch_interrupts(signal, closed, deadline, path) => Err(err),
        res = async {
            writer.send(frame).await?;
            writer.half_close().await
        } => res.map_err(|err| transport_failure(path, err)),
    }
}

/// One step of a driver loop.
enum Step {
    Interrupt(CallError),
    Pump(Result<(), PumpError>),
    Event(Result<CallEvent, TransportError>),
}

pub(crate) async fn unary<Req, Res>(
    channel: &Channel,
    method: &MethodSpec<Req, Res>,
    request: Req,
    opts: CallOptions,
) -> Result<Res, CallError>
where
    Req: Send + 'static,
    Res: Send + 'static,
{
    let path = method.path().to_string();
    let CallOptions {
        metadata,
        mut on_header,
        mut on_trailer,
        signal,
        deadline,
    } = opts;
    let deadline_at = deadline.map(|timeout| Instant::now() + timeout);
    let closed = channel.closed_signal();

    let OpenCall {
        mut writer,
        mut events,
        canceller,
    } = channel.open(&path, metadata, deadline).await?;
    let mut guard = CancelGuard::new(canceller);

    let frame = method
        .request_codec()
        .encode(&request)
        .map_err(|err| codec_failure(&path, err))?;
    send_single_request(&mut writer, frame, &signal, &closed, deadline_at, &path).await?;

    let mut response: Option<Res> = None;
    loop {
        let step = tokio::select! {
            biased;
            err = watch_interrupts(&signal, &closed, deadline_at, &path) => Step::Interrupt(err),
            event = events.next() => Step::Event(event),
        };
        match step {
            Step::Interrupt(err) => return Err(err),
            Step::Pump(_) => unreachable!("unary calls do not pump"),
            Step::Event(Ok(CallEvent::Headers(md))) => {
                if let Some(observe) = on_header.take() {
                    observe(&md);
                }
            }
            Step::Event(Ok(CallEvent::Message(frame))) => {
                if response.is_some() {
                    return Err(protocol_violation(&path, "more than one response message"));
                }
                let msg = method
                    .response_codec()
                    .decode(frame)
                    .map_err(|err| codec_failure(&path, err))?;
                response = Some(msg);
            }
            Step::Event(Ok(CallEvent::Trailer(trailer))) => {
                if let Some(observe) = on_trailer.take() {
                    observe(&trailer.metadata);
                }
                guard.disarm();
                return if trailer.status.is_ok() {
                    response.ok_or_else(|| protocol_violation(&path, "missing response message"))
                } else {
                    Err(remote_failure(&path, trailer))
                };
            }
            Step::Event(Err(err)) => return Err(transport_failure(&path, err)),
        }
    }
}

pub(crate) async fn server_streaming<Req, Res>(
    channel: &Channel,
    method: &MethodSpec<Req, Res>,
    request: Req,
    opts: CallOptions,
) -> Result<Responses<Res>, CallError>
where
    Req: Send + 'static,
    Res: Send + 'static,
{
    let path = method.path().to_string();
    let CallOptions {
        metadata,
        mut on_header,
        on_trailer,
        signal,
        deadline,
    } = opts;
    let deadline_at = deadline.map(|timeout| Instant::now() + timeout);
    let closed = channel.closed_signal();

    let OpenCall {
        mut writer,
        mut events,
        canceller,
    } = channel.open(&path, metadata, deadline).await?;
    let mut guard = CancelGuard::new(canceller);

    let frame = method
        .request_codec()
        .encode(&request)
        .map_err(|err| codec_failure(&path, err))?;
    send_single_request(&mut writer, frame, &signal, &closed, deadline_at, &path).await?;

    // Headers first; only then is the lazy response sequence handed out.
    loop {
        let step = tokio::select! {
            biased;
            err = watch_interrupts(&signal, &closed, deadline_at, &path) => Step::Interrupt(err),
            event = events.next() => Step::Event(event),
        };
        match step {
            Step::Interrupt(err) => return Err(err),
            Step::Pump(_) => unreachable!("single-input calls do not pump"),
            Step::Event(Ok(CallEvent::Headers(md))) => {
                if let Some(observe) = on_header.take() {
                    observe(&md);
                }
                break;
            }
            Step::Event(Ok(CallEvent::Trailer(trailer))) => {
                if let Some(observe) = on_trailer {
                    observe(&trailer.metadata);
                }
                guard.disarm();
                return if trailer.status.is_ok() {
                    Ok(Box::pin(futures::stream::empty()))
                } else {
                    Err(remote_failure(&path, trailer))
                };
            }
            Step::Event(Ok(CallEvent::Message(_))) => {
                return Err(protocol_violation(&path, "response message before headers"));
            }
            Step::Event(Err(err)) => return Err(transport_failure(&path, err)),
        }
    }

    let response_codec = Arc::clone(method.response_codec());
    Ok(Box::pin(response_stream(
        events,
        guard,
        on_trailer,
        response_codec,
        signal,
        closed,
        deadline_at,
        path,
    )))
}

type TrailerObserver = Option<Box<dyn FnOnce(&Metadata) + Send>>;

/// The shared tail of an output-streaming call: yield decoded messages
/// until the trailer, mapping every failure mode onto one terminal error
/// item. Dropping it early cancels the call through the guard.
fn response_stream<Res: Send + 'static>(
    mut events: Box<dyn CallEvents>,
    mut guard: CancelGuard,
    mut on_trailer: TrailerObserver,
    response_codec: Arc<dyn Codec<Res>>,
    signal: AbortSignal,
    closed: AbortSignal,
    deadline_at: Option<Instant>,
    path: String,
) -> impl Stream<Item = Result<Res, CallError>> + Send {
    async_stream::stream! {
        loop {
            let step = tokio::select! {
                biased;
                err = watch_interrupts(&signal, &closed, deadline_at, &path) => Step::Interrupt(err),
                event = events.next() => Step::Event(event),
            };
            match step {
                Step::Interrupt(err) => {
                    yield Err(err);
                    return;
                }
                Step::Pump(_) => unreachable!("response tail does not pump"),
                Step::Event(Ok(CallEvent::Message(frame))) => {
                    match response_codec.decode(frame) {
                        Ok(msg) => yield Ok(msg),
                        Err(err) => {
                            yield Err(codec_failure(&path, err));
                            return;
                        }
                    }
                }
                Step::Event(Ok(CallEvent::Trailer(trailer))) => {
                    if let Some(observe) = on_trailer.take() {
                        observe(&trailer.metadata);
                    }
                    guard.disarm();
                    if !trailer.status.is_ok() {
                        yield Err(remote_failure(&path, trailer));
                    }
                    return;
                }
                Step::Event(Ok(CallEvent::Headers(_))) => {
                    yield Err(protocol_violation(&path, "duplicate headers"));
                    return;
                }
                Step::Event(Err(err)) => {
                    yield Err(transport_failure(&path, err));
                    return;
                }
            }
        }
    }
}

pub(crate) async fn client_streaming<Req, Res, S>(
    channel: &Channel,
    method: &MethodSpec<Req, Res>,
    requests: S,
    opts: CallOptions,
) -> Result<Res, CallError>
where
    Req: Send + 'static,
    Res: Send + 'static,
    S: Stream<Item = Result<Req, BoxError>> + Send + 'static,
{
    let path = method.path().to_string();
    let CallOptions {
        metadata,
        mut on_header,
        mut on_trailer,
        signal,
        deadline,
    } = opts;
    let deadline_at = deadline.map(|timeout| Instant::now() + timeout);
    let closed = channel.closed_signal();

    let OpenCall {
        writer,
        mut events,
        canceller,
    } = channel.open(&path, metadata, deadline).await?;
    let mut guard = CancelGuard::new(canceller);

    let mut pump = Box::pin(pump_requests(
        requests,
        Arc::clone(method.request_codec()),
        writer,
    ));
    let mut pump_done = false;
    let mut response: Option<Res> = None;

    loop {
        let step = tokio::select! {
            biased;
            err = watch_interrupts(&signal, &closed, deadline_at, &path) => Step::Interrupt(err),
            res = &mut pump, if !pump_done => Step::Pump(res),
            event = events.next() => Step::Event(event),
        };
        match step {
            Step::Interrupt(err) => return Err(err),
            Step::Pump(res) => {
                pump_done = true;
                match res {
                    Ok(()) => {}
                    Err(PumpError::Producer(err)) => return Err(CallError::Request(err)),
                    Err(PumpError::Codec(err)) => return Err(codec_failure(&path, err)),
                    Err(PumpError::Transport(err)) => {
                        // The server may have completed early; the event
                        // side carries the verdict.
                        tracing::debug!(error = %err, "request write interrupted");
                    }
                }
            }
            Step::Event(Ok(CallEvent::Headers(md))) => {
                if let Some(observe) = on_header.take() {
                    observe(&md);
                }
            }
            Step::Event(Ok(CallEvent::Message(frame))) => {
                if response.is_some() {
                    return Err(protocol_violation(&path, "more than one response message"));
                }
                let msg = method
                    .response_codec()
                    .decode(frame)
                    .map_err(|err| codec_failure(&path, err))?;
                response = Some(msg);
            }
            Step::Event(Ok(CallEvent::Trailer(trailer))) => {
                if let Some(observe) = on_trailer.take() {
                    observe(&trailer.metadata);
                }
                guard.disarm();
                return if trailer.status.is_ok() {
                    response.ok_or_else(|| protocol_violation(&path, "missing response message"))
                } else {
                    Err(remote_failure(&path, trailer))
                };
            }
            Step::Event(Err(err)) => return Err(transport_failure(&path, err)),
        }
    }
}

pub(crate) async fn duplex_streaming<Req, Res, S>(
    channel: &Channel,
    method: &MethodSpec<Req, Res>,
    requests: S,
    opts: CallOptions,
) -> Result<Responses<Res>, CallError>
where
    Req: Send + 'static,
    Res: Send + 'static,
    S: Stream<Item = Result<Req, BoxError>> + Send + 'static,
{
    let path = method.path().to_string();
    let CallOptions {
        metadata,
        mut on_header,
        on_trailer,
        signal,
        deadline,
    } = opts;
    let deadline_at = deadline.map(|timeout| Instant::now() + timeout);
    let closed = channel.closed_signal();

    let OpenCall {
        writer,
        mut events,
        canceller,
    } = channel.open(&path, metadata, deadline).await?;
    let mut guard = CancelGuard::new(canceller);

    let mut pump = Box::pin(pump_requests(
        requests,
        Arc::clone(method.request_codec()),
        writer,
    ));
    let mut pump_done = false;

    // Pump requests while waiting for headers; the server may need input
    // before it produces anything.
    let mut on_trailer = on_trailer;
    loop {
        let step = tokio::select! {
            biased;
            err = watch_interrupts(&signal, &closed, deadline_at, &path) => Step::Interrupt(err),
            res = &mut pump, if !pump_done => Step::Pump(res),
            event = events.next() => Step::Event(event),
        };
        match step {
            Step::Interrupt(err) => return Err(err),
            Step::Pump(res) => {
                pump_done = true;
                match res {
                    Ok(()) => {}
                    Err(PumpError::Producer(err)) => return Err(CallError::Request(err)),
                    Err(PumpError::Codec(err)) => return Err(codec_failure(&path, err)),
                    Err(PumpError::Transport(err)) => {
                        tracing::debug!(error = %err, "request write interrupted");
                    }
                }
            }
            Step::Event(Ok(CallEvent::Headers(md))) => {
                if let Some(observe) = on_header.take() {
                    observe(&md);
                }
                break;
            }
            Step::Event(Ok(CallEvent::Trailer(trailer))) => {
                if let Some(observe) = on_trailer.take() {
                    observe(&trailer.metadata);
                }
                guard.disarm();
                return if trailer.status.is_ok() {
                    Ok(Box::pin(futures::stream::empty()))
                } else {
                    Err(remote_failure(&path, trailer))
                };
            }
            Step::Event(Ok(CallEvent::Message(_))) => {
                return Err(protocol_violation(&path, "response message before headers"));
            }
            Step::Event(Err(err)) => return Err(transport_failure(&path, err)),
        }
    }

    let response_codec = Arc::clone(method.response_codec());
    Ok(Box::pin(async_stream::stream! {
        loop {
            let step = tokio::select! {
                biased;
                err = watch_interrupts(&signal, &closed, deadline_at, &path) => Step::Interrupt(err),
                res = &mut pump, if !pump_done => Step::Pump(res),
                event = events.next() => Step::Event(event),
            };
            match step {
                Step::Interrupt(err) => {
                    yield Err(err);
                    return;
                }
                Step::Pump(res) => {
                    pump_done = true;
                    match res {
                        Ok(()) => {}
                        Err(PumpError::Producer(err)) => {
                            yield Err(CallError::Request(err));
                            return;
                        }
                        Err(PumpError::Codec(err)) => {
                            yield Err(codec_failure(&path, err));
                            return;
                        }
                        Err(PumpError::Transport(err)) => {
                            tracing::debug!(error = %err, "request write interrupted");
                        }
                    }
                }
                Step::Event(Ok(CallEvent::Message(frame))) => {
                    match response_codec.decode(frame) {
                        Ok(msg) => yield Ok(msg),
                        Err(err) => {
                            yield Err(codec_failure(&path, err));
                            return;
                        }
                    }
                }
                Step::Event(Ok(CallEvent::Trailer(trailer))) => {
                    if let Some(observe) = on_trailer.take() {
                        observe(&trailer.metadata);
                    }
                    guard.disarm();
                    if !trailer.status.is_ok() {
                        yield Err(remote_failure(&path, trailer));
                    }
                    return;
                }
                Step::Event(Ok(CallEvent::Headers(_))) => {
                    yield Err(protocol_violation(&path, "duplicate headers"));
                    return;
                }
                Step::Event(Err(err)) => {
                    yield Err(transport_failure(&path, err));
                    return;
                }
            }
        }
    }))
}
