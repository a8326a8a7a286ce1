#![cfg(feature = "_async")]

mod support;

use std::pin::pin;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{StreamExt, stream};
use reqx_session::prelude::{AsyncSession, ErrorCode, RetryState, SessionConfig};
use reqx_session::{AsyncRequestData, CancelHandle, HistoryEntry};
use serde_json::{Value, json};

use support::{AsyncMockTransport, MockResponse, MockTransport, Step, gzip_bytes, init_tracing};

fn session_with(transport: &MockTransport, retry: RetryState) -> AsyncSession {
    let config = SessionConfig::builder()
        .memory_store()
        .metrics_enabled(true)
        .retry(retry)
        .build()
        .expect("config should build");
    AsyncSession::new(config, AsyncMockTransport(transport.clone())).expect("session should build")
}

fn quick_retry(total: u32) -> RetryState {
    RetryState::standard()
        .total_retries(total)
        .backoff_factor(Duration::ZERO)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn retries_connect_errors_then_succeeds() {
    init_tracing();
    let transport = MockTransport::new(vec![
        Step::ConnectError,
        Step::Respond(MockResponse::new(
            200,
            vec![("content-type", "application/json")],
            r#"{"id":7}"#,
        )),
    ]);
    let session = session_with(&transport, quick_retry(2));

    let mut response = session
        .get("http://example.com/items/7")
        .send()
        .await
        .expect("second attempt should succeed");
    assert_eq!(response.history().len(), 1);
    assert!(matches!(response.history()[0], HistoryEntry::Failed(_)));
    let body: Value = serde_json::from_slice(&response.data().await.expect("body should read"))
        .expect("body should be json");
    assert_eq!(body["id"], 7);

    let metrics = session.metrics_snapshot();
    assert_eq!(metrics.attempts, 2);
    assert_eq!(metrics.retries, 1);
    assert_eq!(metrics.requests_succeeded, 1);
    assert_eq!(metrics.in_flight, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn retry_after_status_is_honored_for_idempotent_requests() {
    let transport = MockTransport::responding(vec![
        MockResponse::new(429, vec![("retry-after", "0")], "slow down"),
        MockResponse::ok("ok"),
    ]);
    let session = session_with(&transport, quick_retry(1));

    let mut response = session
        .get("http://example.com/rate-limited")
        .send()
        .await
        .expect("retry should succeed");
    assert_eq!(response.text().await.expect("body should read"), "ok");
    assert_eq!(
        response.history()[0].status(),
        Some(http::StatusCode::TOO_MANY_REQUESTS)
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn decodes_gzip_while_streaming_chunks() {
    let payload = "0123456789".repeat(1_000);
    let transport = MockTransport::responding(vec![MockResponse::new(
        200,
        vec![("content-encoding", "gzip")],
        gzip_bytes(payload.as_bytes()),
    )]);
    let session = session_with(&transport, quick_retry(0));

    let mut response = session
        .get("http://example.com/archive")
        .send()
        .await
        .expect("request should succeed");
    let mut decoded = Vec::new();
    {
        let mut chunks = pin!(response.chunks(256));
        while let Some(chunk) = chunks.next().await {
            decoded.extend_from_slice(&chunk.expect("chunk should decode"));
        }
    }
    assert_eq!(decoded, payload.as_bytes());
    assert_eq!(transport.closed(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stream_body_is_uploaded_chunked() {
    let transport = MockTransport::responding(vec![MockResponse::ok("")]);
    let session = session_with(&transport, quick_retry(0));
    let body = stream::iter(vec![
        Ok::<_, std::io::Error>(Bytes::from_static(b"alpha,")),
        Ok(Bytes::from_static(b"beta")),
    ]);

    session
        .put("http://example.com/upload")
        .body(AsyncRequestData::stream(body))
        .send()
        .await
        .expect("upload should succeed");

    let captured = transport.captured();
    assert_eq!(captured[0].body, b"alpha,beta");
    assert_eq!(captured[0].header("transfer-encoding"), Some("chunked"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn json_body_and_json_response_round_trip_through_the_session() {
    let transport = MockTransport::responding(vec![MockResponse::new(
        201,
        vec![("content-type", "application/json")],
        r#"{"created":true}"#,
    )]);
    let session = session_with(&transport, quick_retry(0));

    let created: Value = session
        .post("http://example.com/items")
        .json(&json!({ "name": "widget" }))
        .expect("json should serialize")
        .send_json()
        .await
        .expect("request should succeed");
    assert_eq!(created, json!({ "created": true }));
    assert_eq!(
        transport.captured()[0].header("content-type"),
        Some("application/json")
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancel_interrupts_a_backoff_wait() {
    let transport = MockTransport::new(vec![Step::ConnectError, Step::ConnectError]);
    let retry = RetryState::standard()
        .total_retries(1)
        .backoff_factor(Duration::from_secs(30));
    let session = session_with(&transport, retry);
    let cancel = CancelHandle::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });

    let error = tokio::time::timeout(
        Duration::from_secs(5),
        session
            .get("http://example.com/")
            .cancel_handle(cancel)
            .send(),
    )
    .await
    .expect("cancel should cut the backoff short")
    .expect_err("canceled request should fail");
    assert_eq!(error.code(), ErrorCode::Canceled);
    assert_eq!(transport.started(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_requests_share_learned_cookies() {
    let transport = MockTransport::responding(vec![MockResponse::new(
        200,
        vec![("set-cookie", "sid=42; Path=/")],
        "",
    )]);
    let session = session_with(&transport, quick_retry(0));
    session
        .get("http://example.com/login")
        .send()
        .await
        .expect("login should succeed");

    transport.push(vec![
        Step::Respond(MockResponse::ok("a")),
        Step::Respond(MockResponse::ok("b")),
    ]);
    let (first, second) = tokio::join!(
        session.get("http://example.com/a").send(),
        session.get("http://example.com/b").send(),
    );
    first.expect("first request should succeed");
    second.expect("second request should succeed");

    let captured = transport.captured();
    assert_eq!(captured.len(), 3);
    for request in &captured[1..] {
        assert_eq!(request.header("cookie"), Some("sid=42"));
        assert!(
            request
                .key
                .as_ref()
                .is_some_and(|key| key.session_id() == session.id())
        );
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn preferred_cache_serves_without_a_transport_call() {
    let transport = MockTransport::responding(vec![MockResponse::new(
        200,
        vec![
            ("cache-control", "max-age=300"),
            ("content-type", "text/plain"),
        ],
        "cached copy",
    )]);
    let session = session_with(&transport, quick_retry(0));

    let mut first = session
        .get("https://example.com/doc")
        .send()
        .await
        .expect("first request should succeed");
    assert_eq!(first.text().await.expect("body should read"), "cached copy");

    let mut second = session
        .get("https://example.com/doc")
        .prefer_cache()
        .send()
        .await
        .expect("cached request should succeed");
    assert_eq!(
        second.text().await.expect("body should read"),
        "cached copy"
    );
    assert_eq!(second.content_type(), "text/plain");
    assert_eq!(transport.started(), 1);
    assert_eq!(session.metrics_snapshot().cache_hits, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dropping_a_response_mid_stream_releases_the_lifecycle() {
    let transport = MockTransport::responding(vec![MockResponse::ok(vec![b'z'; 8192])]);
    let session = session_with(&transport, quick_retry(0));

    let mut response = session
        .get("http://example.com/large")
        .send()
        .await
        .expect("request should succeed");
    let first = response
        .chunk(1024)
        .await
        .expect("first chunk should read")
        .expect("first chunk should exist");
    assert_eq!(first.len(), 1024);
    assert_eq!(transport.closed(), 0);
    drop(response);
    assert_eq!(transport.closed(), 1);
}
