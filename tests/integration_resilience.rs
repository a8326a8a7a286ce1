#![cfg(feature = "_blocking")]

mod support;

use std::time::Duration;

use bytes::Bytes;
use reqx_session::prelude::{Session, SessionConfig};
use reqx_session::{
    CertFingerprint, ErrorCode, HistoryEntry, RedirectPolicy, RequestData, RetryState, TlsSettings,
};

use support::{MockResponse, MockTransport, Step};

fn quick_retry(total: u32) -> RetryState {
    RetryState::standard()
        .total_retries(total)
        .backoff_factor(Duration::ZERO)
}

fn session_with(transport: &MockTransport, retry: RetryState) -> Session {
    let config = SessionConfig::builder()
        .memory_store()
        .metrics_enabled(true)
        .retry(retry)
        .build()
        .expect("config should build");
    Session::new(config, transport.clone()).expect("session should build")
}

#[test]
fn connect_errors_use_every_retry_then_surface_history() {
    let transport = MockTransport::new(vec![Step::ConnectError; 4]);
    let session = session_with(&transport, quick_retry(3));

    let error = session
        .get("http://example.com/")
        .send()
        .expect_err("every attempt fails to connect");

    assert_eq!(transport.started(), 4);
    assert_eq!(error.code(), ErrorCode::Transport);
    assert_eq!(error.history().len(), 3);
    assert!(
        error
            .history()
            .iter()
            .all(|entry| matches!(entry, HistoryEntry::Failed(_)))
    );
    assert!(error.retries_exhausted());
    let failed = error.failed_request().expect("failure carries context");
    assert_eq!(failed.attempts(), 4);
    assert!(failed.response().is_none());

    let metrics = session.metrics_snapshot();
    assert_eq!(metrics.attempts, 4);
    assert_eq!(metrics.retries, 3);
    assert_eq!(metrics.requests_failed, 1);
}

#[test]
fn zero_budget_never_retries() {
    let transport = MockTransport::new(vec![Step::ConnectError, Step::ConnectError]);
    let session = session_with(&transport, quick_retry(0));

    let error = session
        .get("http://example.com/")
        .send()
        .expect_err("first failure is final");
    assert_eq!(transport.started(), 1);
    assert!(error.history().is_empty());
}

#[test]
fn connect_budget_is_independent_of_total() {
    let transport = MockTransport::new(vec![Step::ConnectError; 5]);
    let session = session_with(&transport, quick_retry(5).connect_retries(1));

    let error = session
        .get("http://example.com/")
        .send()
        .expect_err("connect budget runs out first");
    assert_eq!(transport.started(), 2);
    assert!(error.retries_exhausted());
}

#[test]
fn retryable_status_is_retried_and_kept_in_history() {
    let transport = MockTransport::responding(vec![
        MockResponse::new(503, vec![("retry-after", "0")], "busy"),
        MockResponse::ok("done"),
    ]);
    let session = session_with(&transport, quick_retry(2));

    let mut response = session
        .get("http://example.com/jobs")
        .send()
        .expect("second attempt succeeds");
    assert_eq!(response.status(), http::StatusCode::OK);
    assert_eq!(response.text().expect("body should read"), "done");
    let statuses: Vec<_> = response
        .history()
        .iter()
        .filter_map(HistoryEntry::status)
        .collect();
    assert_eq!(statuses, vec![http::StatusCode::SERVICE_UNAVAILABLE]);
    assert_eq!(transport.closed(), 2);
}

#[test]
fn non_idempotent_post_gets_the_retryable_status_back() {
    let transport = MockTransport::responding(vec![
        MockResponse::new(503, Vec::new(), "busy"),
        MockResponse::ok("unused"),
    ]);
    let session = session_with(&transport, quick_retry(2));

    let response = session
        .post("http://example.com/jobs")
        .body("job")
        .send()
        .expect("the 503 is surfaced as a response");
    assert_eq!(response.status(), http::StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(transport.started(), 1);
}

#[test]
fn read_errors_rewind_a_buffered_body_before_resending() {
    let transport = MockTransport::new(vec![
        Step::ReadError,
        Step::Respond(MockResponse::ok("stored")),
    ]);
    let session = session_with(&transport, quick_retry(1));

    session
        .put("http://example.com/doc")
        .body("payload")
        .send()
        .expect("retry succeeds");

    let captured = transport.captured();
    assert_eq!(captured.len(), 2);
    assert_eq!(captured[0].body, b"payload");
    assert_eq!(captured[1].body, b"payload");
}

#[test]
fn seekable_body_is_rewound_for_each_attempt() {
    let file = tempfile::tempfile().expect("tempfile should open");
    let mut file = std::io::BufWriter::new(file);
    std::io::Write::write_all(&mut file, b"header|file contents").expect("write should succeed");
    let mut file = file.into_inner().expect("flush should succeed");
    std::io::Seek::seek(&mut file, std::io::SeekFrom::Start(7)).expect("seek should succeed");

    let transport = MockTransport::new(vec![
        Step::ReadError,
        Step::ReadError,
        Step::Respond(MockResponse::ok("")),
    ]);
    let session = session_with(&transport, quick_retry(2));

    session
        .put("http://example.com/file")
        .body(RequestData::file(file).expect("file should measure"))
        .send()
        .expect("third attempt succeeds");

    let captured = transport.captured();
    assert_eq!(captured.len(), 3);
    for request in &captured {
        assert_eq!(request.body, b"file contents");
        assert_eq!(request.header("content-length"), Some("13"));
    }
}

#[test]
fn unrewindable_stream_fails_instead_of_retrying() {
    let transport = MockTransport::new(vec![
        Step::ReadError,
        Step::Respond(MockResponse::ok("unused")),
    ]);
    let session = session_with(&transport, quick_retry(3));

    let error = session
        .put("http://example.com/stream")
        .body(RequestData::chunks(vec![Ok(Bytes::from_static(b"once"))]))
        .send()
        .expect_err("the stream cannot be resent");

    assert_eq!(error.code(), ErrorCode::UnrewindableBody);
    assert_eq!(transport.started(), 1);
    assert_eq!(error.history().len(), 1);
}

#[test]
fn connect_error_retry_resends_an_untouched_stream() {
    let transport = MockTransport::new(vec![
        Step::ConnectError,
        Step::Respond(MockResponse::ok("")),
    ]);
    let session = session_with(&transport, quick_retry(1));

    session
        .put("http://example.com/stream")
        .body(RequestData::chunks(vec![Ok(Bytes::from_static(b"once"))]))
        .send()
        .expect("nothing was read before the connect failure");
    assert_eq!(transport.captured()[0].body, b"once");
}

#[test]
fn connect_error_after_the_body_was_read_resends_it_in_full() {
    let transport = MockTransport::new(vec![
        Step::SendConnectError,
        Step::Respond(MockResponse::ok("")),
    ]);
    let session = session_with(&transport, quick_retry(1));

    session
        .put("http://example.com/blob")
        .body(RequestData::bytes("payload"))
        .send()
        .expect("retry should resend the whole body");

    let captured = transport.captured();
    assert_eq!(captured.len(), 1);
    assert_eq!(captured[0].body, b"payload");
    assert_eq!(captured[0].header("content-length"), Some("7"));
    assert_eq!(transport.started(), 2);
}

#[test]
fn connect_error_after_a_stream_was_read_is_unrewindable() {
    let transport = MockTransport::new(vec![
        Step::SendConnectError,
        Step::Respond(MockResponse::ok("unused")),
    ]);
    let session = session_with(&transport, quick_retry(3));

    let error = session
        .put("http://example.com/stream")
        .body(RequestData::chunks(vec![Ok(Bytes::from_static(b"once"))]))
        .send()
        .expect_err("part of the stream is already gone");

    assert_eq!(error.code(), ErrorCode::UnrewindableBody);
    assert_eq!(transport.started(), 1);
}

#[test]
fn pin_mismatch_is_fatal_even_with_budget_left() {
    let transport = MockTransport::responding(vec![MockResponse::ok(""), MockResponse::ok("")]);
    transport.present_certificate(b"impostor certificate");
    let pinned = CertFingerprint::sha256_of(b"genuine certificate").to_string();
    let tls = TlsSettings::default()
        .pin_certificate("secure.example", &pinned)
        .expect("sha-256 pin should parse");
    let config = SessionConfig::builder()
        .retry(quick_retry(3))
        .tls(tls)
        .build()
        .expect("config should build");
    let session = Session::new(config, transport.clone()).expect("session should build");

    let error = session
        .get("https://secure.example/")
        .send()
        .expect_err("pin mismatch should fail");
    assert_eq!(error.code(), ErrorCode::TrustVerification);
    assert_eq!(transport.started(), 1);
    assert_eq!(transport.closed(), 1);
}

#[test]
fn matching_pin_is_recorded_in_the_connection_key() {
    let transport = MockTransport::responding(vec![MockResponse::ok("")]);
    transport.present_certificate(b"genuine certificate");
    let pinned = CertFingerprint::sha256_of(b"genuine certificate");
    let tls = TlsSettings::default()
        .pin_certificate("secure.example", &pinned.to_string())
        .expect("sha-256 pin should parse");
    let config = SessionConfig::builder()
        .tls(tls)
        .build()
        .expect("config should build");
    let session = Session::new(config, transport.clone()).expect("session should build");

    session
        .get("https://secure.example/")
        .send()
        .expect("pinned request should succeed");
    let captured = transport.captured();
    let key = captured[0].key.clone().expect("key should be assigned");
    assert_eq!(key.pinned_cert(), Some(&pinned));
}

#[test]
fn too_many_redirects_carries_the_last_response() {
    let transport = MockTransport::responding(vec![
        MockResponse::new(302, vec![("location", "/b")], ""),
        MockResponse::new(302, vec![("location", "/c")], ""),
        MockResponse::new(302, vec![("location", "/d")], ""),
    ]);
    let session = session_with(&transport, quick_retry(0));

    let error = session
        .get("http://example.com/a")
        .redirect_policy(RedirectPolicy::limited(2))
        .send()
        .expect_err("third redirect exceeds the limit");
    assert_eq!(error.code(), ErrorCode::TooManyRedirects);
    let last = error.response().expect("last response is attached");
    assert_eq!(last.status(), http::StatusCode::FOUND);
    assert_eq!(last.url().path(), "/c");
    assert_eq!(error.history().len(), 2);
}

#[test]
fn followed_redirect_resets_backoff_growth() {
    let transport = MockTransport::new(vec![
        Step::ConnectError,
        Step::Respond(MockResponse::new(307, vec![("location", "/next")], "")),
        Step::ConnectError,
        Step::Respond(MockResponse::ok("arrived")),
    ]);
    let retry = RetryState::standard()
        .total_retries(3)
        .backoff_factor(Duration::from_millis(5))
        .max_backoff(Some(Duration::from_millis(5)));
    let session = session_with(&transport, retry);

    let mut response = session
        .get("http://example.com/start")
        .send()
        .expect("redirected request succeeds");
    assert_eq!(response.text().expect("body should read"), "arrived");
    assert_eq!(response.url().path(), "/next");
    assert_eq!(response.history().len(), 3);
    assert_eq!(transport.started(), 4);
}
