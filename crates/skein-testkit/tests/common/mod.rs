//! Shared setup for the end-to-end suite.
#![allow(dead_code)]

use skein_client::{Channel, Client};
use skein_server::{Server, ServerBuilder, ServerHandle, Service};
use skein_transport::mem;
use std::future::Future;
use std::time::Duration;

/// Serve `service` over a fresh in-memory transport.
pub fn serve(service: Service) -> (ServerHandle, Client, Channel) {
    serve_with(service, |builder| builder)
}

/// Serve with extra builder configuration (middleware, terminators).
pub fn serve_with(
    service: Service,
    configure: impl FnOnce(ServerBuilder) -> ServerBuilder,
) -> (ServerHandle, Client, Channel) {
    skein_testkit::init_tracing();
    let (connector, listener) = mem::pair("e2e");
    let server = configure(Server::builder()).add_service(service).serve(listener);
    let channel = Channel::new(connector);
    let client = Client::new(channel.clone());
    (server, client, channel)
}

/// Await with the suite-wide patience limit; panics on a hang.
pub async fn within<T>(fut: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), fut)
        .await
        .expect("test future timed out")
}

/// Poll `check` until it holds or the patience limit passes.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
