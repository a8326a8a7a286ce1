use cookie::Cookie;
use url::Url;

use super::StoredCookie;

/// Effect of one `Set-Cookie` value on the jar.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum CookieUpdate {
    Set(StoredCookie),
    Remove { name: String, path: String },
}

/// Parses a `Set-Cookie` value received for `url`. Cookies whose `Domain`
/// attribute does not cover the request host are rejected.
pub(crate) fn parse_set_cookie(value: &str, url: &Url, now: u64) -> Option<CookieUpdate> {
    let parsed = Cookie::parse(value.to_owned()).ok()?;
    let host = url.host_str()?.to_ascii_lowercase();
    if let Some(domain) = parsed.domain()
        && !domain_matches(&host, &domain.to_ascii_lowercase())
    {
        return None;
    }

    let path = parsed
        .path()
        .filter(|path| path.starts_with('/'))
        .map(ToOwned::to_owned)
        .unwrap_or_else(|| default_path(url.path()));

    let expires_at = match parsed.max_age() {
        Some(max_age) => Some(now.saturating_add_signed(max_age.whole_seconds())),
        None => parsed
            .expires_datetime()
            .map(|expires| u64::try_from(expires.unix_timestamp()).unwrap_or(0)),
    };
    if expires_at.is_some_and(|expires_at| expires_at <= now) {
        return Some(CookieUpdate::Remove {
            name: parsed.name().to_owned(),
            path,
        });
    }

    Some(CookieUpdate::Set(StoredCookie {
        name: parsed.name().to_owned(),
        value: parsed.value().to_owned(),
        path,
        secure: parsed.secure().unwrap_or(false),
        expires_at,
    }))
}

/// Applies `update`, replacing any cookie with the same name and path.
pub(crate) fn merge_cookie(jar: &mut Vec<StoredCookie>, update: CookieUpdate) {
    match update {
        CookieUpdate::Set(cookie) => {
            jar.retain(|existing| !(existing.name == cookie.name && existing.path == cookie.path));
            jar.push(cookie);
        }
        CookieUpdate::Remove { name, path } => {
            jar.retain(|existing| !(existing.name == name && existing.path == path));
        }
    }
}

pub(crate) fn prune_expired(jar: &mut Vec<StoredCookie>, now: u64) -> bool {
    let before = jar.len();
    jar.retain(|cookie| cookie.expires_at.is_none_or(|expires_at| expires_at > now));
    jar.len() != before
}

/// `Cookie` header value for a request to `url`, longest paths first.
pub(crate) fn cookie_header(jar: &[StoredCookie], url: &Url, now: u64) -> Option<String> {
    let secure_transport = url.scheme() == "https";
    let mut matching: Vec<&StoredCookie> = jar
        .iter()
        .filter(|cookie| cookie.expires_at.is_none_or(|expires_at| expires_at > now))
        .filter(|cookie| secure_transport || !cookie.secure)
        .filter(|cookie| path_matches(url.path(), &cookie.path))
        .collect();
    if matching.is_empty() {
        return None;
    }
    matching.sort_by(|left, right| right.path.len().cmp(&left.path.len()));
    Some(
        matching
            .iter()
            .map(|cookie| format!("{}={}", cookie.name, cookie.value))
            .collect::<Vec<_>>()
            .join("; "),
    )
}

fn domain_matches(host: &str, domain: &str) -> bool {
    host == domain
        || (host.len() > domain.len()
            && host.ends_with(domain)
            && host.as_bytes()[host.len() - domain.len() - 1] == b'.')
}

/// RFC 6265 default-path: the request path up to, not including, its last `/`.
fn default_path(request_path: &str) -> String {
    if !request_path.starts_with('/') {
        return "/".to_owned();
    }
    match request_path.rfind('/') {
        Some(0) | None => "/".to_owned(),
        Some(index) => request_path[..index].to_owned(),
    }
}

fn path_matches(request_path: &str, cookie_path: &str) -> bool {
    if request_path == cookie_path {
        return true;
    }
    request_path.starts_with(cookie_path)
        && (cookie_path.ends_with('/')
            || request_path.as_bytes().get(cookie_path.len()) == Some(&b'/'))
}
