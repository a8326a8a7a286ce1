use http::header::PROXY_AUTHORIZATION;
use url::Url;

use crate::core::error::Error;
use crate::core::origin::{Origin, Scheme};
use crate::core::util::parse_url;

/// Proxy endpoint chosen for one origin, part of the connection identity.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ProxyTarget {
    url: String,
    headers: Vec<(String, String)>,
}

impl ProxyTarget {
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }
}

#[derive(Clone, Debug, Default)]
pub struct ProxyConfig {
    http: Option<Url>,
    https: Option<Url>,
    authorization: Option<String>,
    no_proxy_rules: Vec<NoProxyRule>,
}

impl ProxyConfig {
    /// Uses the same proxy for both schemes.
    pub fn all(proxy: &str) -> crate::Result<Self> {
        let url = parse_url(proxy)?;
        Ok(Self {
            http: Some(url.clone()),
            https: Some(url),
            ..Self::default()
        })
    }

    pub fn http(mut self, proxy: &str) -> crate::Result<Self> {
        self.http = Some(parse_url(proxy)?);
        Ok(self)
    }

    pub fn https(mut self, proxy: &str) -> crate::Result<Self> {
        self.https = Some(parse_url(proxy)?);
        Ok(self)
    }

    pub fn authorization(mut self, value: impl Into<String>) -> Self {
        self.authorization = Some(value.into());
        self
    }

    pub fn no_proxy<I, S>(mut self, rules: I) -> crate::Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.no_proxy_rules = parse_no_proxy_rules(rules)?;
        Ok(self)
    }

    /// Reads `HTTP_PROXY`, `HTTPS_PROXY`, `ALL_PROXY` and `NO_PROXY`, upper or lower case.
    pub fn from_env() -> Option<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Option<Self> {
        let read = |name: &str| {
            lookup(name)
                .or_else(|| lookup(&name.to_ascii_lowercase()))
                .filter(|value| !value.trim().is_empty())
        };
        let all = read("ALL_PROXY").and_then(|value| Url::parse(value.trim()).ok());
        let http = read("HTTP_PROXY")
            .and_then(|value| Url::parse(value.trim()).ok())
            .or_else(|| all.clone());
        let https = read("HTTPS_PROXY")
            .and_then(|value| Url::parse(value.trim()).ok())
            .or(all);
        if http.is_none() && https.is_none() {
            return None;
        }
        let no_proxy_rules = read("NO_PROXY")
            .map(|value| value.split(',').filter_map(NoProxyRule::parse).collect())
            .unwrap_or_default();
        Some(Self {
            http,
            https,
            authorization: None,
            no_proxy_rules,
        })
    }

    pub(crate) fn target_for(&self, origin: &Origin) -> Option<ProxyTarget> {
        if should_bypass_proxy(&self.no_proxy_rules, origin) {
            return None;
        }
        let proxy = match origin.scheme() {
            Scheme::Http => self.http.as_ref(),
            Scheme::Https => self.https.as_ref(),
        }?;
        let headers = self
            .authorization
            .iter()
            .map(|value| (PROXY_AUTHORIZATION.as_str().to_owned(), value.clone()))
            .collect();
        Some(ProxyTarget {
            url: proxy.to_string(),
            headers,
        })
    }
}

#[derive(Clone, Debug)]
pub(crate) enum NoProxyRule {
    Any,
    Domain { host: String, port: Option<u16> },
}

impl NoProxyRule {
    pub(crate) fn parse(text: &str) -> Option<Self> {
        let mut candidate = text.trim().to_owned();
        let mut port = None;
        if candidate.is_empty() {
            return None;
        }
        if candidate == "*" {
            return Some(Self::Any);
        }
        if let Ok(url) = Url::parse(&candidate)
            && let Some(host) = url.host_str()
        {
            candidate = host.to_owned();
            port = url.port();
        }
        candidate = candidate.trim_start_matches('.').to_owned();
        if let Some(stripped) = candidate.strip_prefix('[') {
            let end = stripped.find(']')?;
            let host = &stripped[..end];
            let suffix = &stripped[end + 1..];
            if let Some(raw_port) = suffix.strip_prefix(':') {
                port = Some(raw_port.parse::<u16>().ok()?);
            } else if !suffix.is_empty() {
                return None;
            }
            candidate = host.to_owned();
        } else if candidate.matches(':').count() == 1 {
            let (host, raw_port) = candidate.rsplit_once(':')?;
            port = Some(raw_port.parse::<u16>().ok()?);
            candidate = host.to_owned();
        }
        if candidate.is_empty() {
            return None;
        }
        Some(Self::Domain {
            host: candidate.to_ascii_lowercase(),
            port,
        })
    }

    pub(crate) fn matches(&self, host: &str, port: u16) -> bool {
        match self {
            Self::Any => true,
            Self::Domain {
                host: domain,
                port: rule_port,
            } => {
                let host = host.trim_start_matches('[').trim_end_matches(']');
                let host_matches = host == domain || host.ends_with(&format!(".{domain}"));
                host_matches && rule_port.is_none_or(|rule_port| rule_port == port)
            }
        }
    }
}

pub(crate) fn should_bypass_proxy(no_proxy_rules: &[NoProxyRule], origin: &Origin) -> bool {
    no_proxy_rules
        .iter()
        .any(|rule| rule.matches(origin.host(), origin.port()))
}

pub(crate) fn parse_no_proxy_rules<I, S>(rules: I) -> crate::Result<Vec<NoProxyRule>>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    rules
        .into_iter()
        .map(|rule| {
            NoProxyRule::parse(rule.as_ref()).ok_or_else(|| Error::InvalidNoProxyRule {
                rule: rule.as_ref().to_owned(),
            })
        })
        .collect()
}
