//! skein-testkit: shared plumbing for the workspace test suites.
//!
//! A small test service (messages, codecs, method specs), probes for
//! asserting cleanup and ordering, and tracing setup. The end-to-end suite
//! over the in-memory transport lives in this crate's `tests/` directory.

pub mod message;
pub mod probe;

pub use message::{methods, TestRequest, TestResponse, SERVICE_NAME};
pub use probe::{ActionLog, CleanupGuard, CleanupProbe};

use futures::stream::Stream;
use skein_core::BoxError;

/// An infallible request producer over the given messages.
pub fn requests(
    items: Vec<TestRequest>,
) -> impl Stream<Item = Result<TestRequest, BoxError>> + Send + 'static {
    futures::stream::iter(items.into_iter().map(Ok))
}

/// Initialize test-writer tracing. Safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}
