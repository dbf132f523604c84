//! Channels: shared handles to a client transport.

use crate::error::CallError;
use skein_core::{AbortCause, AbortController, AbortSignal, ClientError, Metadata, Status};
use skein_transport::{Connector, OpenCall, TransportError};
use std::sync::Arc;
use std::time::Duration;

/// A reference-shared handle to a client transport. Closing it fails new
/// opens and makes in-flight calls complete with `UNAVAILABLE`.
#[derive(Clone)]
pub struct Channel {
    connector: Arc<dyn Connector>,
    closed: Arc<AbortController>,
}

impl Channel {
    pub fn new(connector: impl Connector) -> Self {
        Self {
            connector: Arc::new(connector),
            closed: Arc::new(AbortController::new()),
        }
    }

    /// Close the channel. Idempotent.
    pub fn close(&self) {
        tracing::debug!("channel closed");
        self.closed.abort(AbortCause::Local);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_aborted()
    }

    /// Fires when the channel is closed; in-flight drivers race against it.
    pub(crate) fn closed_signal(&self) -> AbortSignal {
        self.closed.signal()
    }

    pub(crate) async fn open(
        &self,
        path: &str,
        metadata: Metadata,
        deadline: Option<Duration>,
    ) -> Result<OpenCall, CallError> {
        if self.is_closed() {
            return Err(channel_closed(path));
        }
        self.connector
            .open(path, metadata, deadline)
            .await
            .map_err(|err| transport_failure(path, err))
    }
}

/// Transport failures surface to callers as `UNAVAILABLE`.
pub(crate) fn transport_failure(path: &str, err: TransportError) -> CallError {
    ClientError::new(path, Status::Unavailable, err.to_string(), Metadata::new()).into()
}

pub(crate) fn channel_closed(path: &str) -> CallError {
    ClientError::new(path, Status::Unavailable, "channel closed", Metadata::new()).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use skein_transport::mem;

    #[tokio::test]
    async fn test_closed_channel_rejects_open() {
        let (connector, _listener) = mem::pair("chan");
        let channel = Channel::new(connector);
        channel.close();
        assert!(channel.is_closed());
        let err = channel
            .open("/t.T/M", Metadata::new(), None)
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(Status::Unavailable));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (connector, _listener) = mem::pair("chan2");
        let channel = Channel::new(connector);
        channel.close();
        channel.close();
        assert!(channel.is_closed());
    }
}
