use std::sync::Arc;

use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Method};
use serde::Serialize;
use serde::de::DeserializeOwned;
use url::Url;

use crate::core::auth::{Authenticator, BasicAuth, BearerAuth};
use crate::core::cancel::CancelHandle;
use crate::core::orchestrator::RequestOptions;
use crate::core::policy::{CacheMode, RedirectPolicy};
use crate::core::request::RequestHead;
use crate::core::retry::RetryState;
use crate::core::util::{parse_header_name, parse_header_value};

use super::body::RequestData;
use super::response::Response;
use super::Session;

pub struct RequestBuilder<'a> {
    session: &'a Session,
    method: Method,
    url: crate::Result<Url>,
    headers: HeaderMap,
    target: Option<String>,
    body: RequestData,
    options: RequestOptions,
}

impl<'a> RequestBuilder<'a> {
    pub(crate) fn new(session: &'a Session, method: Method, url: crate::Result<Url>) -> Self {
        Self {
            session,
            method,
            url,
            headers: HeaderMap::new(),
            target: None,
            body: RequestData::empty(),
            options: RequestOptions::default(),
        }
    }

    /// Appends; repeated names are sent as separate header lines.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn try_header(self, name: &str, value: &str) -> crate::Result<Self> {
        let name = parse_header_name(name)?;
        let value = parse_header_value(name.as_str(), value)?;
        Ok(self.header(name, value))
    }

    pub fn headers(mut self, headers: HeaderMap) -> Self {
        self.headers.extend(headers);
        self
    }

    pub fn body(mut self, body: impl Into<RequestData>) -> Self {
        self.body = body.into();
        self
    }

    pub fn json<T>(self, payload: &T) -> crate::Result<Self>
    where
        T: Serialize + ?Sized,
    {
        Ok(self.body(RequestData::json(payload)?))
    }

    pub fn form<I, K, V>(self, pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        self.body(RequestData::form(pairs))
    }

    /// Request-line target, e.g. `*` for `OPTIONS *`.
    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn retry(mut self, retry: RetryState) -> Self {
        self.options.retry = Some(retry);
        self
    }

    pub fn redirect_policy(mut self, redirect_policy: RedirectPolicy) -> Self {
        self.options.redirect_policy = Some(redirect_policy);
        self
    }

    pub fn cache_mode(mut self, cache_mode: CacheMode) -> Self {
        self.options.cache_mode = cache_mode;
        self
    }

    pub fn prefer_cache(self) -> Self {
        self.cache_mode(CacheMode::PreferCache)
    }

    pub fn authenticator<A>(mut self, authenticator: A) -> Self
    where
        A: Authenticator + 'static,
    {
        self.options.authenticator = Some(Arc::new(authenticator));
        self
    }

    pub fn basic_auth(self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.authenticator(BasicAuth::new(username, password))
    }

    pub fn bearer_auth(self, token: impl Into<String>) -> Self {
        self.authenticator(BearerAuth::new(token))
    }

    pub fn cancel_handle(mut self, cancel: CancelHandle) -> Self {
        self.options.cancel = Some(cancel);
        self
    }

    pub fn send(self) -> crate::Result<Response> {
        let url = self.url?;
        let mut head = RequestHead::new(self.method, url).with_headers(self.headers);
        if let Some(target) = self.target {
            head.set_target(target);
        }
        self.session.execute(head, self.body, self.options)
    }

    pub fn send_json<T>(self) -> crate::Result<T>
    where
        T: DeserializeOwned,
    {
        self.send()?.json()
    }
}
