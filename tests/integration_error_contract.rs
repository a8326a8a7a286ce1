#![cfg(any(feature = "_async", feature = "_blocking"))]

mod support;

use std::time::Duration;

use reqx_session::prelude::{Error, ErrorCode, RetryState, SessionConfig};
use reqx_session::{HistoryEntry, TlsSettings};

use support::{MockResponse, MockTransport, Step};

fn config(retry: RetryState) -> SessionConfig {
    SessionConfig::builder()
        .memory_store()
        .retry(retry.backoff_factor(Duration::ZERO))
        .build()
        .expect("config should build")
}

fn assert_error_contract(error: &Error, expected: ErrorCode, expected_code: &str) {
    assert_eq!(error.code(), expected);
    assert_eq!(error.code().as_str(), expected_code);
    assert_eq!(error.root().code(), expected);
}

#[cfg(feature = "_blocking")]
fn blocking_error(steps: Vec<Step>, url: &str, retry: RetryState) -> Error {
    use reqx_session::Session;

    let session =
        Session::new(config(retry), MockTransport::new(steps)).expect("session should build");
    session
        .get(url)
        .send()
        .expect_err("request should return an error for this scenario")
}

#[cfg(feature = "_async")]
async fn async_error(steps: Vec<Step>, url: &str, retry: RetryState) -> Error {
    use reqx_session::AsyncSession;
    use support::AsyncMockTransport;

    let session = AsyncSession::new(config(retry), AsyncMockTransport(MockTransport::new(steps)))
        .expect("session should build");
    session
        .get(url)
        .send()
        .await
        .expect_err("request should return an error for this scenario")
}

fn redirect(location: &str) -> Step {
    Step::Respond(MockResponse::new(302, vec![("location", location)], ""))
}

fn redirect_loop() -> Vec<Step> {
    vec![redirect("/b"), redirect("/a")]
}

#[test]
fn error_codes_have_stable_names() {
    let cases = [
        (ErrorCode::InvalidUri, "invalid_uri"),
        (ErrorCode::Transport, "transport"),
        (ErrorCode::TrustVerification, "trust_verification"),
        (ErrorCode::UnsupportedFingerprint, "unsupported_fingerprint"),
        (ErrorCode::UnrewindableBody, "unrewindable_body"),
        (ErrorCode::TooManyRedirects, "too_many_redirects"),
        (ErrorCode::RedirectLoop, "redirect_loop"),
        (ErrorCode::Store, "store"),
        (ErrorCode::Canceled, "canceled"),
    ];
    for (code, name) in cases {
        assert_eq!(code.as_str(), name);
        assert_eq!(code.to_string(), name);
    }
}

#[test]
fn sha1_pins_are_rejected_at_configuration_time() {
    let sha1 = "AB".repeat(20);
    let error = TlsSettings::default()
        .pin_certificate("example.com", &sha1)
        .expect_err("sha1 pins are not accepted");
    assert_error_contract(
        &error,
        ErrorCode::UnsupportedFingerprint,
        "unsupported_fingerprint",
    );
    assert!(error.failed_request().is_none());
}

#[cfg(feature = "_blocking")]
#[test]
fn blocking_invalid_uri_fails_before_any_attempt() {
    let error = blocking_error(Vec::new(), "not a url", RetryState::standard());
    assert_error_contract(&error, ErrorCode::InvalidUri, "invalid_uri");
    assert!(error.history().is_empty());
}

#[cfg(feature = "_blocking")]
#[test]
fn blocking_transport_error_carries_request_context() {
    let error = blocking_error(
        vec![Step::ConnectError, Step::ConnectError],
        "http://example.com/case",
        RetryState::standard().total_retries(1),
    );
    assert_error_contract(&error, ErrorCode::Transport, "transport");

    let failed = error.failed_request().expect("context should be attached");
    assert_eq!(failed.request().url().as_str(), "http://example.com/case");
    assert_eq!(failed.attempts(), 2);
    assert!(failed.retries_exhausted());
    assert!(matches!(
        failed.history(),
        [HistoryEntry::Failed(attempt)] if attempt.code() == ErrorCode::Transport
    ));
    assert!(error.to_string().contains("http://example.com/case"));
}

#[cfg(feature = "_blocking")]
#[test]
fn blocking_redirect_loop_reports_the_chain() {
    let error = blocking_error(
        redirect_loop(),
        "http://example.com/a",
        RetryState::standard(),
    );
    assert_error_contract(&error, ErrorCode::RedirectLoop, "redirect_loop");
    match error.root() {
        Error::RedirectLoop { chain, .. } => {
            assert_eq!(
                chain,
                &[
                    "http://example.com/a".to_owned(),
                    "http://example.com/b".to_owned(),
                    "http://example.com/a".to_owned(),
                ]
            );
        }
        other => panic!("unexpected error variant: {other}"),
    }
    assert_eq!(error.history().len(), 1);
    assert_eq!(
        error.response().map(|response| response.url().path()),
        Some("/b")
    );
}

#[cfg(feature = "_blocking")]
#[test]
fn blocking_status_error_comes_from_raise_for_status() {
    use reqx_session::Session;

    let transport = MockTransport::responding(vec![MockResponse::new(
        503,
        vec![("retry-after", "3")],
        "unavailable",
    )]);
    let session =
        Session::new(config(RetryState::disabled()), transport).expect("session should build");

    let response = session
        .get("http://example.com/case")
        .send()
        .expect("non-success should be returned as response");
    assert_eq!(response.status().as_u16(), 503);
    assert_eq!(
        response
            .headers()
            .get("retry-after")
            .and_then(|value| value.to_str().ok()),
        Some("3")
    );
    let error = response
        .raise_for_status()
        .expect_err("503 should be flagged");
    match &error {
        Error::HttpStatus { status, uri, .. } => {
            assert_eq!(*status, 503);
            assert_eq!(uri, "http://example.com/case");
        }
        other => panic!("unexpected error variant: {other}"),
    }
    assert_error_contract(&error, ErrorCode::HttpStatus, "http_status");
}

#[cfg(feature = "_async")]
#[tokio::test(flavor = "current_thread")]
async fn async_transport_error_carries_request_context() {
    let error = async_error(
        vec![Step::ConnectError, Step::ConnectError],
        "http://example.com/case",
        RetryState::standard().total_retries(1),
    )
    .await;
    assert_error_contract(&error, ErrorCode::Transport, "transport");
    let failed = error.failed_request().expect("context should be attached");
    assert_eq!(failed.attempts(), 2);
    assert_eq!(failed.history().len(), 1);
}

#[cfg(feature = "_async")]
#[tokio::test(flavor = "current_thread")]
async fn async_too_many_redirects_keeps_the_last_response() {
    use reqx_session::{AsyncSession, RedirectPolicy};
    use support::AsyncMockTransport;

    let transport = MockTransport::new(vec![redirect("/b"), redirect("/c")]);
    let session = AsyncSession::new(
        config(RetryState::standard()),
        AsyncMockTransport(transport),
    )
    .expect("session should build");
    let error = session
        .get("http://example.com/a")
        .redirect_policy(RedirectPolicy::limited(1))
        .send()
        .await
        .expect_err("second redirect exceeds the limit");
    assert_error_contract(&error, ErrorCode::TooManyRedirects, "too_many_redirects");
    assert_eq!(
        error.response().map(|response| response.status().as_u16()),
        Some(302)
    );
    assert_eq!(error.history().len(), 1);
}

#[cfg(all(feature = "_async", feature = "_blocking"))]
#[tokio::test(flavor = "current_thread")]
async fn async_and_blocking_error_codes_are_consistent() {
    let scenarios: Vec<(Vec<Step>, &str)> = vec![
        (Vec::new(), "not a url"),
        (vec![Step::ConnectError], "http://example.com/"),
        (redirect_loop(), "http://example.com/a"),
    ];
    for (steps, url) in scenarios {
        let retry = RetryState::standard().total_retries(0);
        let async_code = async_error(steps.clone(), url, retry.clone()).await.code();
        let blocking_code = blocking_error(steps, url, retry).code();
        assert_eq!(async_code, blocking_code, "scenario {url}");
    }
}
