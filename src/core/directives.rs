//! Parsers for the response headers that feed the session store.

use std::time::SystemTime;

use http::HeaderMap;
use http::header::{AGE, CACHE_CONTROL, DATE, EXPIRES};

use crate::core::tls::Alpn;
use crate::core::util::{percent_decode, unix_seconds};

/// `Cache-Control` directives relevant to storing and reusing responses.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CacheDirectives {
    pub no_store: bool,
    pub no_cache: bool,
    pub private: bool,
    pub public: bool,
    pub must_revalidate: bool,
    pub max_age: Option<u64>,
    pub s_maxage: Option<u64>,
}

impl CacheDirectives {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let mut directives = Self::default();
        let values = headers
            .get_all(CACHE_CONTROL)
            .iter()
            .filter_map(|value| value.to_str().ok());
        for item in values.flat_map(|value| value.split(',')) {
            let (name, argument) = match item.split_once('=') {
                Some((name, argument)) => (name, Some(unquote(argument))),
                None => (item, None),
            };
            match name.trim().to_ascii_lowercase().as_str() {
                "no-store" => directives.no_store = true,
                "no-cache" => directives.no_cache = true,
                "private" => directives.private = true,
                "public" => directives.public = true,
                "must-revalidate" => directives.must_revalidate = true,
                "max-age" => directives.max_age = argument.and_then(|value| value.parse().ok()),
                "s-maxage" => directives.s_maxage = argument.and_then(|value| value.parse().ok()),
                _ => {}
            }
        }
        directives
    }

    pub fn forbids_caching(&self) -> bool {
        self.no_store || self.no_cache || self.private
    }
}

/// Seconds a response stays fresh from `now`, if it declares freshness at all.
pub(crate) fn freshness_lifetime(
    directives: &CacheDirectives,
    headers: &HeaderMap,
    now: SystemTime,
) -> Option<u64> {
    let age = header_text(headers, &AGE)
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or(0);
    if let Some(lifetime) = directives.s_maxage.or(directives.max_age) {
        return Some(lifetime.saturating_sub(age));
    }
    let expires = header_text(headers, &EXPIRES)
        .and_then(|value| httpdate::parse_http_date(value).ok())?;
    let date = header_text(headers, &DATE)
        .and_then(|value| httpdate::parse_http_date(value).ok())
        .unwrap_or(now);
    Some(unix_seconds(expires).saturating_sub(unix_seconds(date)))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct StrictTransportSecurity {
    pub(crate) max_age: u64,
    pub(crate) include_subdomains: bool,
    pub(crate) preload: bool,
}

pub(crate) fn parse_strict_transport_security(value: &str) -> Option<StrictTransportSecurity> {
    let mut max_age = None;
    let mut include_subdomains = false;
    let mut preload = false;
    for directive in value.split(';') {
        let (name, argument) = match directive.split_once('=') {
            Some((name, argument)) => (name, Some(unquote(argument))),
            None => (directive, None),
        };
        match name.trim().to_ascii_lowercase().as_str() {
            "max-age" => max_age = argument.and_then(|value| value.parse::<u64>().ok()),
            "includesubdomains" => include_subdomains = true,
            "preload" => preload = true,
            _ => {}
        }
    }
    Some(StrictTransportSecurity {
        max_age: max_age?,
        include_subdomains,
        preload,
    })
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct AltSvcAdvert {
    pub(crate) alpn: Alpn,
    pub(crate) host: Option<String>,
    pub(crate) port: u16,
    pub(crate) max_age: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum AltSvcHeader {
    Clear,
    Adverts(Vec<AltSvcAdvert>),
}

const DEFAULT_ALT_SVC_MAX_AGE: u64 = 24 * 60 * 60;

/// Parses an `Alt-Svc` field value (RFC 7838). Alternatives with protocols we
/// cannot speak are skipped.
pub(crate) fn parse_alt_svc(value: &str) -> AltSvcHeader {
    if value.trim().eq_ignore_ascii_case("clear") {
        return AltSvcHeader::Clear;
    }
    let adverts = split_outside_quotes(value, ',')
        .into_iter()
        .filter_map(|alternative| parse_alternative(&alternative))
        .collect();
    AltSvcHeader::Adverts(adverts)
}

fn parse_alternative(text: &str) -> Option<AltSvcAdvert> {
    let mut parts = split_outside_quotes(text, ';').into_iter();
    let first = parts.next()?;
    let (protocol, authority) = first.split_once('=')?;
    let alpn = Alpn::parse(&percent_decode(protocol.trim()))?;
    let authority = unquote(authority);
    let (host, port) = authority.rsplit_once(':')?;
    let port = port.parse::<u16>().ok()?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    let host = (!host.is_empty()).then(|| host.to_ascii_lowercase());

    let mut max_age = DEFAULT_ALT_SVC_MAX_AGE;
    for parameter in parts {
        if let Some((name, argument)) = parameter.split_once('=')
            && name.trim().eq_ignore_ascii_case("ma")
            && let Ok(parsed) = unquote(argument).parse::<u64>()
        {
            max_age = parsed;
        }
    }
    Some(AltSvcAdvert {
        alpn,
        host,
        port,
        max_age,
    })
}

fn split_outside_quotes(text: &str, separator: char) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    for character in text.chars() {
        match character {
            '"' => {
                quoted = !quoted;
                current.push(character);
            }
            _ if character == separator && !quoted => {
                parts.push(std::mem::take(&mut current));
            }
            _ => current.push(character),
        }
    }
    parts.push(current);
    parts
        .into_iter()
        .map(|part| part.trim().to_owned())
        .filter(|part| !part.is_empty())
        .collect()
}

fn unquote(text: &str) -> String {
    text.trim().trim_matches('"').to_owned()
}

fn header_text<'a>(headers: &'a HeaderMap, name: &http::header::HeaderName) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}
