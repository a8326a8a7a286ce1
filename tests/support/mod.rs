#![allow(dead_code)]

use std::collections::{BTreeMap, VecDeque};
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use flate2::Compression;
use flate2::write::GzEncoder;
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, StatusCode};
use reqx_session::{
    ConnectionConfig, ConnectionKey, Error, Negotiated, Origin, ReceivedResponse, RequestHead,
    TlsVersion, TransportErrorKind,
};

#[derive(Clone, Debug)]
pub struct MockResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl MockResponse {
    pub fn new(status: u16, headers: Vec<(&str, &str)>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers: headers
                .into_iter()
                .map(|(name, value)| (name.to_owned(), value.to_owned()))
                .collect(),
            body: body.into(),
        }
    }

    pub fn ok(body: impl Into<Vec<u8>>) -> Self {
        Self::new(200, Vec::new(), body)
    }

    fn received(&self) -> ReceivedResponse {
        let mut headers = HeaderMap::new();
        for (name, value) in &self.headers {
            headers.append(
                HeaderName::from_bytes(name.as_bytes()).expect("mock header name should parse"),
                HeaderValue::from_str(value).expect("mock header value should parse"),
            );
        }
        ReceivedResponse::new(
            StatusCode::from_u16(self.status).expect("mock status should be valid"),
            headers,
        )
    }
}

/// One scripted outcome, consumed per started lifecycle.
#[derive(Clone, Debug)]
pub enum Step {
    Respond(MockResponse),
    ConnectError,
    /// Connects, accepts the request, then fails before response headers.
    ReadError,
    /// Connects, then drops the connection on the first body write with a
    /// connect-kind error, as a refused stream on a reused connection does.
    SendConnectError,
}

#[derive(Clone, Debug)]
pub struct CapturedRequest {
    pub method: String,
    pub url: String,
    pub target: String,
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
    pub origin: Origin,
    pub hostname: String,
    pub key: Option<ConnectionKey>,
}

impl CapturedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}

#[derive(Default)]
struct Shared {
    script: Mutex<VecDeque<Step>>,
    captured: Mutex<Vec<CapturedRequest>>,
    assigned: Mutex<Vec<ConnectionKey>>,
    configs: Mutex<Vec<ConnectionConfig>>,
    peer_certificate: Mutex<Option<Bytes>>,
    started: AtomicUsize,
    closed: AtomicUsize,
}

/// Replays a script of outcomes and records every attempt it sees.
#[derive(Clone, Default)]
pub struct MockTransport {
    shared: Arc<Shared>,
}

impl MockTransport {
    pub fn new(steps: Vec<Step>) -> Self {
        let transport = Self::default();
        transport.push(steps);
        transport
    }

    pub fn responding(responses: Vec<MockResponse>) -> Self {
        Self::new(responses.into_iter().map(Step::Respond).collect())
    }

    pub fn push(&self, steps: Vec<Step>) {
        self.shared
            .script
            .lock()
            .expect("script lock")
            .extend(steps);
    }

    pub fn present_certificate(&self, certificate: &'static [u8]) {
        *self.shared.peer_certificate.lock().expect("certificate") =
            Some(Bytes::from_static(certificate));
    }

    pub fn captured(&self) -> Vec<CapturedRequest> {
        self.shared.captured.lock().expect("captured lock").clone()
    }

    pub fn assigned_keys(&self) -> Vec<ConnectionKey> {
        self.shared.assigned.lock().expect("assigned lock").clone()
    }

    pub fn configs(&self) -> Vec<ConnectionConfig> {
        self.shared.configs.lock().expect("configs lock").clone()
    }

    pub fn started(&self) -> usize {
        self.shared.started.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.shared.closed.load(Ordering::SeqCst)
    }

    fn start(
        &self,
        request: &RequestHead,
        config: &ConnectionConfig,
    ) -> reqx_session::Result<MockLifecycle> {
        self.shared.started.fetch_add(1, Ordering::SeqCst);
        self.shared
            .configs
            .lock()
            .expect("configs lock")
            .push(config.clone());
        let step = self
            .shared
            .script
            .lock()
            .expect("script lock")
            .pop_front()
            .unwrap_or(Step::ConnectError);
        let fail_send = matches!(step, Step::SendConnectError);
        let response = match step {
            Step::ConnectError => {
                return Err(Error::transport(
                    TransportErrorKind::Connect,
                    request,
                    "connection refused",
                ));
            }
            Step::ReadError | Step::SendConnectError => None,
            Step::Respond(response) => Some(response),
        };
        let negotiated = Negotiated {
            tls_version: config.origin().is_tls().then_some(TlsVersion::Tls1_3),
            peer_certificate: self
                .shared
                .peer_certificate
                .lock()
                .expect("certificate lock")
                .clone(),
            ..Negotiated::default()
        };
        Ok(MockLifecycle {
            shared: Arc::clone(&self.shared),
            request: request.clone(),
            origin: config.origin().clone(),
            hostname: config.hostname().to_owned(),
            negotiated,
            response,
            body: Vec::new(),
            key: None,
            position: 0,
            fail_send,
        })
    }
}

pub struct MockLifecycle {
    shared: Arc<Shared>,
    request: RequestHead,
    origin: Origin,
    hostname: String,
    negotiated: Negotiated,
    response: Option<MockResponse>,
    body: Vec<u8>,
    key: Option<ConnectionKey>,
    position: usize,
    fail_send: bool,
}

impl MockLifecycle {
    fn assign(&mut self, key: ConnectionKey) {
        self.shared
            .assigned
            .lock()
            .expect("assigned lock")
            .push(key.clone());
        self.key = Some(key);
    }

    fn finish_request(&mut self) {
        let headers = self
            .request
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_owned(),
                    value.to_str().unwrap_or_default().to_owned(),
                )
            })
            .collect();
        self.shared
            .captured
            .lock()
            .expect("captured lock")
            .push(CapturedRequest {
                method: self.request.method().to_string(),
                url: self.request.url().to_string(),
                target: self.request.target(),
                headers,
                body: std::mem::take(&mut self.body),
                origin: self.origin.clone(),
                hostname: self.hostname.clone(),
                key: self.key.clone(),
            });
    }

    fn accept(&mut self, data: &[u8]) -> reqx_session::Result<()> {
        if self.fail_send {
            return Err(Error::transport(
                TransportErrorKind::Connect,
                &self.request,
                "stream refused",
            ));
        }
        self.body.extend_from_slice(data);
        Ok(())
    }

    fn headers(&mut self) -> reqx_session::Result<ReceivedResponse> {
        match &self.response {
            Some(response) => Ok(response.received()),
            None => Err(Error::transport(
                TransportErrorKind::Read,
                &self.request,
                "connection reset by peer",
            )),
        }
    }

    fn data(&mut self, max: usize) -> Bytes {
        let Some(response) = &self.response else {
            return Bytes::new();
        };
        let end = (self.position + max).min(response.body.len());
        let chunk = Bytes::copy_from_slice(&response.body[self.position..end]);
        self.position = end;
        chunk
    }

    fn close_once(&mut self) {
        self.shared.closed.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(feature = "_blocking")]
impl reqx_session::Transport for MockTransport {
    fn start_lifecycle(
        &self,
        request: &RequestHead,
        config: &ConnectionConfig,
    ) -> reqx_session::Result<Box<dyn reqx_session::Lifecycle>> {
        Ok(Box::new(self.start(request, config)?))
    }
}

#[cfg(feature = "_blocking")]
impl reqx_session::Lifecycle for MockLifecycle {
    fn negotiated(&self) -> Negotiated {
        self.negotiated.clone()
    }

    fn assign_key(&mut self, key: ConnectionKey) {
        self.assign(key);
    }

    fn send_request_data(&mut self, data: Bytes) -> reqx_session::Result<()> {
        self.accept(&data)
    }

    fn send_eof(&mut self, _trailers: Option<HeaderMap>) -> reqx_session::Result<()> {
        self.finish_request();
        Ok(())
    }

    fn receive_response_headers(&mut self) -> reqx_session::Result<ReceivedResponse> {
        self.headers()
    }

    fn receive_response_data(&mut self, max: usize) -> reqx_session::Result<Bytes> {
        Ok(self.data(max))
    }

    fn close(&mut self) {
        self.close_once();
    }
}

#[cfg(feature = "_async")]
mod async_impl {
    use bytes::Bytes;
    use futures_util::future::BoxFuture;
    use http::HeaderMap;
    use reqx_session::{
        AsyncLifecycle, AsyncTransport, ConnectionConfig, ConnectionKey, Negotiated,
        ReceivedResponse, RequestHead,
    };

    use super::{MockLifecycle, MockTransport};

    /// Async twin of the blocking mock; it yields once per operation.
    #[derive(Clone, Default)]
    pub struct AsyncMockTransport(pub MockTransport);

    impl AsyncTransport for AsyncMockTransport {
        fn start_lifecycle<'a>(
            &'a self,
            request: &'a RequestHead,
            config: &'a ConnectionConfig,
        ) -> BoxFuture<'a, reqx_session::Result<Box<dyn AsyncLifecycle>>> {
            Box::pin(async move {
                tokio::task::yield_now().await;
                let lifecycle = self.0.start(request, config)?;
                Ok(Box::new(lifecycle) as Box<dyn AsyncLifecycle>)
            })
        }
    }

    impl AsyncLifecycle for MockLifecycle {
        fn negotiated(&self) -> Negotiated {
            self.negotiated.clone()
        }

        fn assign_key(&mut self, key: ConnectionKey) {
            self.assign(key);
        }

        fn send_request_data(&mut self, data: Bytes) -> BoxFuture<'_, reqx_session::Result<()>> {
            Box::pin(async move { self.accept(&data) })
        }

        fn send_eof(
            &mut self,
            _trailers: Option<HeaderMap>,
        ) -> BoxFuture<'_, reqx_session::Result<()>> {
            Box::pin(async move {
                self.finish_request();
                Ok(())
            })
        }

        fn receive_response_headers(
            &mut self,
        ) -> BoxFuture<'_, reqx_session::Result<ReceivedResponse>> {
            Box::pin(async move {
                tokio::task::yield_now().await;
                self.headers()
            })
        }

        fn receive_response_data(
            &mut self,
            max: usize,
        ) -> BoxFuture<'_, reqx_session::Result<Bytes>> {
            Box::pin(async move { Ok(self.data(max)) })
        }

        fn close(&mut self) {
            self.close_once();
        }
    }
}

#[cfg(feature = "_async")]
pub use async_impl::AsyncMockTransport;

pub fn gzip_bytes(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).expect("gzip write should succeed");
    encoder.finish().expect("gzip finish should succeed")
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}
