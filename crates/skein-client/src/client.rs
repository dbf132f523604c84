//! Typed client facade.

use crate::call;
use crate::call::Responses;
use crate::channel::Channel;
use crate::error::CallError;
use crate::options::{CallDefaults, CallOptions};
use futures::stream::Stream;
use skein_core::{BoxError, MethodSpec};

/// A client for one service over one channel.
///
/// Each call takes the method's typed [`MethodSpec`] handle, whose
/// streaming flags must match the call kind used.
#[derive(Clone)]
pub struct Client {
    channel: Channel,
    defaults: CallDefaults,
}

impl Client {
    pub fn new(channel: Channel) -> Self {
        Self::with_defaults(channel, CallDefaults::default())
    }

    /// A client whose calls start from the given defaults. Per-call
    /// options win; default metadata merges underneath per-call entries.
    pub fn with_defaults(channel: Channel, defaults: CallDefaults) -> Self {
        Self { channel, defaults }
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    fn merge(&self, mut opts: CallOptions) -> CallOptions {
        if !self.defaults.metadata.is_empty() {
            let mut merged = self.defaults.metadata.clone();
            merged.merge(std::mem::take(&mut opts.metadata));
            opts.metadata = merged;
        }
        if opts.deadline.is_none() {
            opts.deadline = self.defaults.deadline;
        }
        opts
    }

    pub async fn unary<Req, Res>(
        &self,
        method: &MethodSpec<Req, Res>,
        request: Req,
        opts: CallOptions,
    ) -> Result<Res, CallError>
    where
        Req: Send + 'static,
        Res: Send + 'static,
    {
        debug_assert!(
            !method.descriptor().client_streaming() && !method.descriptor().server_streaming(),
            "{} is not a unary method",
            method.path(),
        );
        call::unary(&self.channel, method, request, self.merge(opts)).await
    }

    pub async fn server_streaming<Req, Res>(
        &self,
        method: &MethodSpec<Req, Res>,
        request: Req,
        opts: CallOptions,
    ) -> Result<Responses<Res>, CallError>
    where
        Req: Send + 'static,
        Res: Send + 'static,
    {
        debug_assert!(
            !method.descriptor().client_streaming() && method.descriptor().server_streaming(),
            "{} is not a server-streaming method",
            method.path(),
        );
        call::server_streaming(&self.channel, method, request, self.merge(opts)).await
    }

    pub async fn client_streaming<Req, Res, S>(
        &self,
        method: &MethodSpec<Req, Res>,
        requests: S,
        opts: CallOptions,
    ) -> Result<Res, CallError>
    where
        Req: Send + 'static,
        Res: Send + 'static,
        S: Stream<Item = Result<Req, BoxError>> + Send + 'static,
    {
        debug_assert!(
            method.descriptor().client_streaming() && !method.descriptor().server_streaming(),
            "{} is not a client-streaming method",
            method.path(),
        );
        call::client_streaming(&self.channel, method, requests, self.merge(opts)).await
    }

    pub async fn duplex_streaming<Req, Res, S>(
        &self,
        method: &MethodSpec<Req, Res>,
        requests: S,
        opts: CallOptions,
    ) -> Result<Responses<Res>, CallError>
    where
        Req: Send + 'static,
        Res: Send + 'static,
        S: Stream<Item = Result<Req, BoxError>> + Send + 'static,
    {
        debug_assert!(
            method.descriptor().client_streaming() && method.descriptor().server_streaming(),
            "{} is not a duplex-streaming method",
            method.path(),
        );
        call::duplex_streaming(&self.channel, method, requests, self.merge(opts)).await
    }
}
