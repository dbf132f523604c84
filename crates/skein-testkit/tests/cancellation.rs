//! Cancellation paths: external aborts, producer failures, deadlines,
//! consumer early-stop, channel closure.

mod common;

use common::{eventually, serve, within};
use futures::StreamExt;
use parking_lot::Mutex;
use skein_client::{CallError, CallOptions};
use skein_core::{AbortCause, AbortController, AbortSignal, ServerError, Status};
use skein_server::{CallContext, RequestStream, Service};
use skein_testkit::{methods, CleanupProbe, TestRequest, TestResponse, SERVICE_NAME};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

type SignalCell = Arc<Mutex<Option<AbortSignal>>>;

#[tokio::test(flavor = "multi_thread")]
async fn test_external_abort_rejects_and_reaches_server() {
    let seen_signal: SignalCell = Arc::new(Mutex::new(None));
    let handler_signal = Arc::clone(&seen_signal);
    let service = Service::builder(SERVICE_NAME)
        .client_streaming(
            &methods::client_stream(),
            move |_reqs: RequestStream<TestRequest>, ctx: CallContext| {
                handler_signal.lock().replace(ctx.signal().clone());
                async move {
                    std::future::pending::<Result<TestResponse, ServerError>>().await
                }
            },
        )
        .build();
    let (server, client, _channel) = serve(service);

    let probe = CleanupProbe::new();
    let guard = probe.guard();
    let producer = async_stream::stream! {
        let _guard = guard;
        yield Ok::<TestRequest, skein_core::BoxError>(TestRequest::new("test-0"));
        std::future::pending::<()>().await;
    };

    let controller = AbortController::new();
    let opts = CallOptions::new().signal(controller.signal());
    let call = tokio::spawn({
        let client = client.clone();
        async move {
            client
                .client_streaming(&methods::client_stream(), producer, opts)
                .await
        }
    });

    // Let the call reach the handler, then pull the plug.
    eventually(|| seen_signal.lock().is_some()).await;
    controller.abort(AbortCause::Local);

    let err = within(call).await.unwrap().unwrap_err();
    assert!(err.is_abort(), "expected abort, got {err:?}");
    assert!(probe.triggered(), "producer cleanup must run");

    let signal = seen_signal.lock().clone().unwrap();
    eventually(|| signal.is_aborted()).await;

    within(server.force_shutdown()).await;
}

#[tokio::test]
async fn test_request_producer_error_rejects_call() {
    let stream_ended = Arc::new(AtomicBool::new(false));
    let handler_flag = Arc::clone(&stream_ended);
    let service = Service::builder(SERVICE_NAME)
        .client_streaming(&methods::client_stream(), move |mut reqs: RequestStream<TestRequest>, _ctx| {
            let flag = Arc::clone(&handler_flag);
            async move {
                let mut ids = Vec::new();
                while let Some(item) = reqs.next().await {
                    match item {
                        Ok(req) => ids.push(req.id),
                        Err(_) => break,
                    }
                }
                flag.store(true, Ordering::SeqCst);
                Ok(TestResponse::new(ids.join(" ")))
            }
        })
        .build();
    let (server, client, _channel) = serve(service);

    let producer = async_stream::stream! {
        yield Ok::<TestRequest, skein_core::BoxError>(TestRequest::new("test-0"));
        yield Err("test".into());
    };

    let err = within(client.client_streaming(
        &methods::client_stream(),
        producer,
        CallOptions::new(),
    ))
    .await
    .unwrap_err();
    match err {
        CallError::Request(err) => assert_eq!(err.to_string(), "test"),
        other => panic!("expected request error, got {other:?}"),
    }

    // The handler observes the stream ending, by half-close or cancel.
    eventually(|| stream_ended.load(Ordering::SeqCst)).await;

    within(server.force_shutdown()).await;
}

#[tokio::test]
async fn test_client_deadline_exceeded() {
    let service = Service::builder(SERVICE_NAME)
        .unary(&methods::unary(), |_req: TestRequest, _ctx| async move {
            std::future::pending::<Result<TestResponse, ServerError>>().await
        })
        .build();
    let (server, client, _channel) = serve(service);

    let opts = CallOptions::new().deadline(Duration::from_millis(50));
    let err = within(client.unary(&methods::unary(), TestRequest::new("t"), opts))
        .await
        .unwrap_err();
    assert_eq!(err.status(), Some(Status::DeadlineExceeded));

    within(server.force_shutdown()).await;
}

#[tokio::test]
async fn test_consumer_early_stop_cancels_call() {
    let seen_signal: SignalCell = Arc::new(Mutex::new(None));
    let handler_signal = Arc::clone(&seen_signal);
    let service = Service::builder(SERVICE_NAME)
        .server_streaming(
            &methods::server_stream(),
            move |req: TestRequest, ctx: CallContext| {
                handler_signal.lock().replace(ctx.signal().clone());
                async_stream::stream! {
                    let mut seq = 0u64;
                    loop {
                        yield Ok::<TestResponse, ServerError>(TestResponse::new(format!(
                            "{}-{seq}",
                            req.id
                        )));
                        seq += 1;
                    }
                }
            },
        )
        .build();
    let (server, client, _channel) = serve(service);

    let mut responses = within(client.server_streaming(
        &methods::server_stream(),
        TestRequest::new("test"),
        CallOptions::new(),
    ))
    .await
    .unwrap();
    let first = within(responses.next()).await.unwrap().unwrap();
    assert_eq!(first.id, "test-0");
    let second = within(responses.next()).await.unwrap().unwrap();
    assert_eq!(second.id, "test-1");
    drop(responses);

    let signal = seen_signal.lock().clone().unwrap();
    eventually(|| signal.is_aborted()).await;
    assert_eq!(signal.cause(), Some(AbortCause::Peer));

    within(server.force_shutdown()).await;
}

#[tokio::test]
async fn test_channel_close_fails_inflight_calls() {
    let service = Service::builder(SERVICE_NAME)
        .unary(&methods::unary(), |_req: TestRequest, _ctx| async move {
            std::future::pending::<Result<TestResponse, ServerError>>().await
        })
        .build();
    let (server, client, channel) = serve(service);

    let call = tokio::spawn({
        let client = client.clone();
        async move {
            client
                .unary(&methods::unary(), TestRequest::new("t"), CallOptions::new())
                .await
        }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    channel.close();

    let err = within(call).await.unwrap().unwrap_err();
    assert_eq!(err.status(), Some(Status::Unavailable));

    within(server.force_shutdown()).await;
}
