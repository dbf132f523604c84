//! Client-facing call errors.

use skein_core::{BoxError, ClientError, Status};
use thiserror::Error;

/// How a client call can fail.
#[derive(Debug, Error)]
pub enum CallError {
    /// The call's terminal status was non-OK (or a transport/codec failure
    /// was mapped onto one).
    #[error(transparent)]
    Remote(#[from] ClientError),

    /// The caller's abort signal fired before the call completed.
    #[error("call aborted")]
    Aborted,

    /// The caller's own request stream yielded an error; the call was
    /// cancelled at the transport and the error is rethrown here.
    #[error("request stream failed: {0}")]
    Request(#[source] BoxError),
}

impl CallError {
    /// Whether this is a local abort (the `AbortError` of the call model).
    pub fn is_abort(&self) -> bool {
        matches!(self, CallError::Aborted)
    }

    /// The remote status, when one exists.
    pub fn status(&self) -> Option<Status> {
        match self {
            CallError::Remote(err) => Some(err.status()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skein_core::Metadata;

    #[test]
    fn test_is_abort() {
        assert!(CallError::Aborted.is_abort());
        let remote: CallError =
            ClientError::new("/t.T/M", Status::NotFound, "gone", Metadata::new()).into();
        assert!(!remote.is_abort());
        assert_eq!(remote.status(), Some(Status::NotFound));
    }
}
