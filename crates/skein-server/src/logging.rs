//! Call logging middleware.

use crate::context::CallContext;
use crate::middleware::{Middleware, ResponseStream, ServerCall};
use futures::StreamExt;
use std::time::Instant;

/// Logs each call's start, outcome, and timing through `tracing`.
///
/// Pass-through: requests, responses, and context flow unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingMiddleware;

impl Middleware for LoggingMiddleware {
    fn call(&self, mut call: ServerCall, ctx: CallContext) -> ResponseStream {
        let path = call.method().path().to_string();
        let peer = ctx.peer().to_string();
        let request = call.take_request();
        let delegated = call.next(request, ctx);

        Box::pin(async_stream::stream! {
            tracing::debug!(%path, %peer, "call started");
            let started = Instant::now();
            let mut responses = 0usize;
            let mut failed = false;
            let mut delegated = delegated;
            while let Some(item) = delegated.next().await {
                match &item {
                    Ok(_) => responses += 1,
                    Err(fault) => {
                        failed = true;
                        tracing::debug!(
                            %path,
                            %fault,
                            elapsed_ms = started.elapsed().as_millis() as u64,
                            "call failed"
                        );
                    }
                }
                let terminal = item.is_err();
                yield item;
                if terminal {
                    break;
                }
            }
            if !failed {
                tracing::debug!(
                    %path,
                    responses,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "call completed"
                );
            }
        })
    }
}
