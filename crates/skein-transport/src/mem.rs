//! In-memory transport over bounded channels.
//!
//! [`pair`] wires a [`MemConnector`] to a [`MemListener`]. Each opened call
//! gets one bounded channel per direction, so both sides observe
//! backpressure, and a shared abort flag so cancellation unblocks any
//! pending read or write on the other side.

use crate::{
    AcceptedCall, CallEvent, CallEvents, CallWriter, CancelCall, Connector, InboundFrames,
    Listener, OpenCall, OutboundSink, Trailer, TransportError,
};
use async_trait::async_trait;
use bytes::Bytes;
use skein_core::{AbortCause, AbortController, AbortSignal, Metadata, Status};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Per-direction frame buffer. Small, so tests exercise backpressure.
const FRAME_BUFFER: usize = 8;

/// Pending-accept queue depth.
const ACCEPT_BUFFER: usize = 16;

#[derive(Debug)]
enum ClientFrame {
    Message(Bytes),
    HalfClose,
}

/// Create a connected connector/listener pair for `addr`.
///
/// `addr` is a logical name; it only shows up in peer strings and errors.
pub fn pair(addr: &str) -> (MemConnector, MemListener) {
    let (accept_tx, accept_rx) = mpsc::channel(ACCEPT_BUFFER);
    let connector = MemConnector {
        addr: addr.to_string(),
        accept_tx: Mutex::new(Some(accept_tx)),
        next_call: AtomicU64::new(0),
    };
    let listener = MemListener {
        addr: addr.to_string(),
        accept_rx,
    };
    (connector, listener)
}

/// Client half of the in-memory transport.
pub struct MemConnector {
    addr: String,
    accept_tx: Mutex<Option<mpsc::Sender<AcceptedCall>>>,
    next_call: AtomicU64,
}

impl MemConnector {
    /// Stop accepting new opens. In-flight calls are unaffected at this
    /// layer; the channel above decides their fate.
    pub fn close(&self) {
        self.accept_tx.lock().take();
    }
}

#[async_trait]
impl Connector for MemConnector {
    async fn open(
        &self,
        path: &str,
        metadata: Metadata,
        deadline: Option<Duration>,
    ) -> Result<OpenCall, TransportError> {
        let accept_tx = self
            .accept_tx
            .lock()
            .clone()
            .ok_or(TransportError::Closed)?;

        let (c2s_tx, c2s_rx) = mpsc::channel(FRAME_BUFFER);
        let (s2c_tx, s2c_rx) = mpsc::channel(FRAME_BUFFER);
        let controller = Arc::new(AbortController::new());
        let signal = controller.signal();

        let call_id = self.next_call.fetch_add(1, Ordering::Relaxed);
        let accepted = AcceptedCall {
            path: path.to_string(),
            metadata,
            peer: format!("mem://{}/{}", self.addr, call_id),
            deadline,
            reader: Box::new(MemInbound {
                rx: c2s_rx,
                cancelled: signal.clone(),
                half_closed: false,
            }),
            writer: Box::new(MemOutbound {
                tx: s2c_tx,
                cancelled: signal.clone(),
            }),
            cancelled: signal.clone(),
        };

        accept_tx
            .send(accepted)
            .await
            .map_err(|_| TransportError::Unreachable {
                addr: self.addr.clone(),
            })?;

        Ok(OpenCall {
            writer: Box::new(MemWriter {
                tx: c2s_tx,
                cancelled: signal,
            }),
            events: Box::new(MemEvents {
                rx: s2c_rx,
                done: false,
            }),
            canceller: Arc::new(MemCanceller { controller }),
        })
    }
}

/// Server half of the in-memory transport.
pub struct MemListener {
    addr: String,
    accept_rx: mpsc::Receiver<AcceptedCall>,
}

#[async_trait]
impl Listener for MemListener {
    fn local_addr(&self) -> String {
        self.addr.clone()
    }

    async fn accept(&mut self) -> Option<AcceptedCall> {
        self.accept_rx.recv().await
    }
}

struct MemWriter {
    tx: mpsc::Sender<ClientFrame>,
    cancelled: AbortSignal,
}

impl MemWriter {
    async fn push(&mut self, frame: ClientFrame) -> Result<(), TransportError> {
        tokio::select! {
            _ = self.cancelled.aborted() => Err(TransportError::Cancelled),
            res = self.tx.send(frame) => res.map_err(|_| TransportError::Cancelled),
        }
    }
}

#[async_trait]
impl CallWriter for MemWriter {
    async fn send(&mut self, frame: Bytes) -> Result<(), TransportError> {
        self.push(ClientFrame::Message(frame)).await
    }

    async fn half_close(&mut self) -> Result<(), TransportError> {
        self.push(ClientFrame::HalfClose).await
    }
}

struct MemEvents {
    rx: mpsc::Receiver<CallEvent>,
    done: bool,
}

#[async_trait]
impl CallEvents for MemEvents {
    async fn next(&mut self) -> Result<CallEvent, TransportError> {
        if self.done {
            return Err(TransportError::Closed);
        }
        match self.rx.recv().await {
            Some(event) => {
                if matches!(event, CallEvent::Trailer(_)) {
                    self.done = true;
                }
                Ok(event)
            }
            // Server side went away without a trailer.
            None => Err(TransportError::Closed),
        }
    }
}

struct MemCanceller {
    controller: Arc<AbortController>,
}

impl CancelCall for MemCanceller {
    fn cancel(&self) {
        self.controller.abort(AbortCause::Peer);
    }
}

struct MemInbound {
    rx: mpsc::Receiver<ClientFrame>,
    cancelled: AbortSignal,
    half_closed: bool,
}

#[async_trait]
impl InboundFrames for MemInbound {
    async fn next(&mut self) -> Result<Option<Bytes>, TransportError> {
        if self.half_closed {
            return Ok(None);
        }
        tokio::select! {
            _ = self.cancelled.aborted() => Err(TransportError::Cancelled),
            frame = self.rx.recv() => match frame {
                Some(ClientFrame::Message(bytes)) => Ok(Some(bytes)),
                Some(ClientFrame::HalfClose) => {
                    self.half_closed = true;
                    Ok(None)
                }
                // Client went away without half-closing.
                None => Err(TransportError::Cancelled),
            },
        }
    }
}

struct MemOutbound {
    tx: mpsc::Sender<CallEvent>,
    cancelled: AbortSignal,
}

impl MemOutbound {
    async fn push(&mut self, event: CallEvent) -> Result<(), TransportError> {
        tokio::select! {
            _ = self.cancelled.aborted() => Err(TransportError::Cancelled),
            res = self.tx.send(event) => res.map_err(|_| TransportError::Cancelled),
        }
    }
}

#[async_trait]
impl OutboundSink for MemOutbound {
    async fn send_headers(&mut self, metadata: Metadata) -> Result<(), TransportError> {
        self.push(CallEvent::Headers(metadata)).await
    }

    async fn send_message(&mut self, frame: Bytes) -> Result<(), TransportError> {
        self.push(CallEvent::Message(frame)).await
    }

    async fn send_trailer(
        &mut self,
        status: Status,
        details: String,
        metadata: Metadata,
    ) -> Result<(), TransportError> {
        self.push(CallEvent::Trailer(Trailer {
            status,
            details,
            metadata,
        }))
        .await
    }
}
