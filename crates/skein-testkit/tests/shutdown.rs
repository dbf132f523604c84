//! Shutdown paths: terminator-driven drain, graceful and forced shutdown,
//! idempotence.

mod common;

use common::{serve, serve_with, within};
use skein_client::{CallError, CallOptions};
use skein_core::{ServerError, Status};
use skein_server::{CallContext, Service, Terminator, TerminatorHandle};
use skein_testkit::{methods, TestRequest, TestResponse, SERVICE_NAME};
use std::time::Duration;

fn hanging_terminator_service() -> Service {
    Service::builder(SERVICE_NAME)
        .unary(&methods::unary(), |_req: TestRequest, ctx: CallContext| async move {
            ctx.extension::<TerminatorHandle>()
                .expect("terminator middleware installed")
                .abort_on_terminate();
            std::future::pending::<Result<TestResponse, ServerError>>().await
        })
        .build()
}

#[tokio::test(flavor = "multi_thread")]
async fn test_terminate_aborts_opted_in_call() {
    let terminator = Terminator::new();
    let (server, client, _channel) = serve_with(hanging_terminator_service(), |builder| {
        builder.use_terminator(&terminator)
    });

    let call = tokio::spawn({
        let client = client.clone();
        async move {
            client
                .unary(&methods::unary(), TestRequest::new("t"), CallOptions::new())
                .await
        }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    terminator.terminate();
    let err = within(call).await.unwrap().unwrap_err();
    match err {
        CallError::Remote(err) => {
            assert_eq!(err.status(), Status::Unavailable);
            assert_eq!(err.details(), "Server shutting down");
        }
        other => panic!("expected remote error, got {other:?}"),
    }

    // Idempotent: nothing left to abort.
    terminator.terminate();

    // A call registering after terminate aborts immediately.
    let err = within(client.unary(&methods::unary(), TestRequest::new("t"), CallOptions::new()))
        .await
        .unwrap_err();
    assert_eq!(err.status(), Some(Status::Unavailable));

    within(server.shutdown()).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_graceful_shutdown_drains_via_terminator() {
    let terminator = Terminator::new();
    let (server, client, _channel) = serve_with(hanging_terminator_service(), |builder| {
        builder.use_terminator(&terminator)
    });

    let call = tokio::spawn({
        let client = client.clone();
        async move {
            client
                .unary(&methods::unary(), TestRequest::new("t"), CallOptions::new())
                .await
        }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    within(server.shutdown()).await;
    let err = within(call).await.unwrap().unwrap_err();
    assert_eq!(err.status(), Some(Status::Unavailable));
}

#[tokio::test]
async fn test_shutdown_is_idempotent() {
    let service = Service::builder(SERVICE_NAME)
        .unary(&methods::unary(), |req: TestRequest, _ctx| async move {
            Ok(TestResponse::new(req.id))
        })
        .build();
    let (server, client, _channel) = serve(service);

    within(client.unary(&methods::unary(), TestRequest::new("t"), CallOptions::new()))
        .await
        .unwrap();

    within(server.shutdown()).await;
    within(server.shutdown()).await;

    // The listener is gone; new calls fail rather than hang.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let err = within(client.unary(&methods::unary(), TestRequest::new("t"), CallOptions::new()))
        .await
        .unwrap_err();
    assert_eq!(err.status(), Some(Status::Unavailable));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_force_shutdown_aborts_inflight() {
    let service = Service::builder(SERVICE_NAME)
        .unary(&methods::unary(), |_req: TestRequest, _ctx| async move {
            std::future::pending::<Result<TestResponse, ServerError>>().await
        })
        .build();
    let (server, client, _channel) = serve(service);

    let call = tokio::spawn({
        let client = client.clone();
        async move {
            client
                .unary(&methods::unary(), TestRequest::new("t"), CallOptions::new())
                .await
        }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    within(server.force_shutdown()).await;
    let err = within(call).await.unwrap().unwrap_err();
    assert_eq!(err.status(), Some(Status::Cancelled));
}
