//! The two user-visible error kinds.
//!
//! `ServerError` originates inside handlers and middleware and becomes the
//! call's trailer. `ClientError` is what a client observes when the call's
//! terminal status is non-OK.

use crate::metadata::Metadata;
use crate::status::Status;
use thiserror::Error;

/// Boxed error for the unexpected-failure boundary.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// An error raised by a handler or middleware, carried to the peer as the
/// call's trailer.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{status}: {details}")]
pub struct ServerError {
    status: Status,
    details: String,
}

impl ServerError {
    /// Build a handler error. `Status::Ok` is coerced to `Unknown`: a
    /// raised error must never produce an OK trailer.
    pub fn new(status: Status, details: impl Into<String>) -> Self {
        let status = if status.is_ok() {
            Status::Unknown
        } else {
            status
        };
        Self {
            status,
            details: details.into(),
        }
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn details(&self) -> &str {
        &self.details
    }
}

/// The terminal error a client observes for a failed call.
///
/// Read-only: constructed by the call driver from the peer's trailer (or
/// synthesized for transport, codec, and deadline failures).
#[derive(Debug, Clone, Error)]
#[error("{path}: {status}: {details}")]
pub struct ClientError {
    path: String,
    status: Status,
    details: String,
    trailer: Metadata,
}

impl ClientError {
    pub fn new(
        path: impl Into<String>,
        status: Status,
        details: impl Into<String>,
        trailer: Metadata,
    ) -> Self {
        Self {
            path: path.into(),
            status,
            details: details.into(),
            trailer,
        }
    }

    /// Fully qualified method path, `/package.Service/Method`.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn details(&self) -> &str {
        &self.details
    }

    /// Trailer metadata that accompanied the failure.
    pub fn trailer(&self) -> &Metadata {
        &self.trailer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_error_display() {
        let err = ServerError::new(Status::NotFound, "no such thing");
        assert_eq!(err.to_string(), "NOT_FOUND: no such thing");
    }

    #[test]
    fn test_server_error_never_ok() {
        let err = ServerError::new(Status::Ok, "oops");
        assert_eq!(err.status(), Status::Unknown);
    }

    #[test]
    fn test_client_error_carries_trailer() {
        let mut trailer = Metadata::new();
        trailer.set("x-reason", "gone").unwrap();
        let err = ClientError::new("/test.Test/Get", Status::NotFound, "missing", trailer);
        assert_eq!(err.path(), "/test.Test/Get");
        assert_eq!(err.trailer().get_text("x-reason"), Some("gone"));
    }
}
