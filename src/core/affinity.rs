//! Connection identity: the requested shape of a connection, the exact key it
//! resolves to once negotiated, and whether it may be shared between sessions.

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use http::HeaderMap;
use http::header::{AUTHORIZATION, COOKIE, PROXY_AUTHORIZATION, SET_COOKIE};

use crate::core::error::Error;
use crate::core::origin::Origin;
use crate::core::proxy::ProxyTarget;
use crate::core::tls::{
    Alpn, CaTrust, CertFingerprint, ClientIdentity, TlsSessionTicket, TlsVersion,
};
use crate::core::util::lock_unpoisoned;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Owner of a physical connection. `SHARED` connections may serve any caller.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId(u64);

impl SessionId {
    pub const SHARED: Self = Self(0);

    pub(crate) fn next() -> Self {
        Self(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    pub const fn is_shared(self) -> bool {
        self.0 == 0
    }

    /// Claims a shared id for `owner`. Private ids are never reassigned.
    pub const fn escalate(self, owner: SessionId) -> SessionId {
        if self.is_shared() { owner } else { self }
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(formatter, "{}", self.0)
    }
}

/// Requested connection shape. Version range, pin set and ALPN list are
/// acceptable alternatives; everything else must match exactly.
#[derive(Clone, Debug)]
pub struct ConnectionConfig {
    origin: Origin,
    server_hostname: String,
    ca_trust: CaTrust,
    pinned_certs: BTreeSet<CertFingerprint>,
    client_identity: Option<ClientIdentity>,
    min_tls_version: TlsVersion,
    max_tls_version: TlsVersion,
    alpn_protocols: Vec<Alpn>,
    proxy: Option<ProxyTarget>,
    session_id: SessionId,
    session_ticket: Option<TlsSessionTicket>,
}

impl ConnectionConfig {
    pub fn new(origin: Origin) -> Self {
        Self {
            server_hostname: origin.host().to_owned(),
            origin,
            ca_trust: CaTrust::default(),
            pinned_certs: BTreeSet::new(),
            client_identity: None,
            min_tls_version: TlsVersion::Tls1_2,
            max_tls_version: TlsVersion::Tls1_3,
            alpn_protocols: vec![Alpn::H2, Alpn::Http11],
            proxy: None,
            session_id: SessionId::SHARED,
            session_ticket: None,
        }
    }

    pub fn server_hostname(mut self, server_hostname: impl Into<String>) -> Self {
        self.server_hostname = server_hostname.into();
        self
    }

    pub fn ca_trust(mut self, ca_trust: CaTrust) -> Self {
        self.ca_trust = ca_trust;
        self
    }

    pub fn pinned_certs(mut self, pinned_certs: BTreeSet<CertFingerprint>) -> Self {
        self.pinned_certs = pinned_certs;
        self
    }

    pub fn client_identity(mut self, client_identity: Option<ClientIdentity>) -> Self {
        self.client_identity = client_identity;
        self
    }

    pub fn tls_versions(mut self, min_version: TlsVersion, max_version: TlsVersion) -> Self {
        self.min_tls_version = min_version;
        self.max_tls_version = max_version;
        self
    }

    pub fn alpn_protocols(mut self, protocols: impl IntoIterator<Item = Alpn>) -> Self {
        self.alpn_protocols = protocols.into_iter().collect();
        self
    }

    pub fn proxy(mut self, proxy: Option<ProxyTarget>) -> Self {
        self.proxy = proxy;
        self
    }

    pub fn session_id(mut self, session_id: SessionId) -> Self {
        self.session_id = session_id;
        self
    }

    pub fn session_ticket(mut self, session_ticket: Option<TlsSessionTicket>) -> Self {
        self.session_ticket = session_ticket;
        self
    }

    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    /// Name used for SNI and certificate hostname checks.
    pub fn hostname(&self) -> &str {
        &self.server_hostname
    }

    pub fn trust(&self) -> &CaTrust {
        &self.ca_trust
    }

    pub fn pins(&self) -> &BTreeSet<CertFingerprint> {
        &self.pinned_certs
    }

    pub fn identity(&self) -> Option<&ClientIdentity> {
        self.client_identity.as_ref()
    }

    pub fn tls_version_range(&self) -> (TlsVersion, TlsVersion) {
        (self.min_tls_version, self.max_tls_version)
    }

    pub fn alpn(&self) -> &[Alpn] {
        &self.alpn_protocols
    }

    pub fn proxy_target(&self) -> Option<&ProxyTarget> {
        self.proxy.as_ref()
    }

    pub fn session(&self) -> SessionId {
        self.session_id
    }

    pub fn ticket(&self) -> Option<&TlsSessionTicket> {
        self.session_ticket.as_ref()
    }

    /// Whether an existing connection with `key` satisfies this request.
    pub fn matches(&self, key: &ConnectionKey) -> bool {
        if self.origin != key.origin
            || self.server_hostname != key.server_hostname
            || self.ca_trust != key.ca_trust
            || self.client_identity != key.client_identity
            || self.proxy != key.proxy
            || self.session_id != key.session_id
        {
            return false;
        }

        let version_ok = match key.tls_version {
            Some(version) => (self.min_tls_version..=self.max_tls_version).contains(&version),
            None => !self.origin.is_tls(),
        };
        let pin_ok = match &key.pinned_cert {
            Some(pin) => self.pinned_certs.contains(pin),
            None => self.pinned_certs.is_empty() || !self.origin.is_tls(),
        };
        let alpn_ok = self.alpn_protocols.contains(&key.alpn)
            || (key.alpn == Alpn::Http11 && !self.origin.is_tls());

        version_ok && pin_ok && alpn_ok
    }

    /// Collapses this config into the exact key of a negotiated connection,
    /// verifying pins, version and protocol on the way.
    pub fn resolve(&self, negotiated: &Negotiated) -> crate::Result<ConnectionKey> {
        let (tls_version, pinned_cert) = if self.origin.is_tls() {
            let version = negotiated
                .tls_version
                .ok_or_else(|| Error::TlsVersionMismatch {
                    host: self.server_hostname.clone(),
                    negotiated: "none".to_owned(),
                })?;
            if !(self.min_tls_version..=self.max_tls_version).contains(&version) {
                return Err(Error::TlsVersionMismatch {
                    host: self.server_hostname.clone(),
                    negotiated: version.to_string(),
                });
            }
            (Some(version), self.verify_pins(negotiated.peer_certificate.as_deref())?)
        } else {
            (None, None)
        };

        let alpn = match negotiated.alpn {
            Some(selected) if self.alpn_protocols.contains(&selected) => selected,
            Some(selected) => {
                return Err(Error::AlpnMismatch {
                    host: self.server_hostname.clone(),
                    selected: selected.to_string(),
                });
            }
            None => Alpn::Http11,
        };

        Ok(ConnectionKey {
            origin: self.origin.clone(),
            server_hostname: self.server_hostname.clone(),
            ca_trust: self.ca_trust.clone(),
            pinned_cert,
            client_identity: self.client_identity.clone(),
            tls_version,
            alpn,
            proxy: self.proxy.clone(),
            session_id: self.session_id,
        })
    }

    fn verify_pins(
        &self,
        peer_certificate: Option<&[u8]>,
    ) -> crate::Result<Option<CertFingerprint>> {
        if self.pinned_certs.is_empty() {
            return Ok(None);
        }
        let certificate = peer_certificate.ok_or_else(|| Error::TrustVerification {
            host: self.server_hostname.clone(),
            message: "no peer certificate presented for pinned host".to_owned(),
        })?;
        self.pinned_certs
            .iter()
            .find(|pin| pin.matches(certificate))
            .cloned()
            .map(Some)
            .ok_or_else(|| Error::TrustVerification {
                host: self.server_hostname.clone(),
                message: format!(
                    "certificate fingerprint {} matched none of the pinned certificates",
                    CertFingerprint::sha256_of(certificate)
                ),
            })
    }
}

/// Exact identity of a physical connection.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    origin: Origin,
    server_hostname: String,
    ca_trust: CaTrust,
    pinned_cert: Option<CertFingerprint>,
    client_identity: Option<ClientIdentity>,
    tls_version: Option<TlsVersion>,
    alpn: Alpn,
    proxy: Option<ProxyTarget>,
    session_id: SessionId,
}

impl ConnectionKey {
    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    pub fn pinned_cert(&self) -> Option<&CertFingerprint> {
        self.pinned_cert.as_ref()
    }

    pub fn tls_version(&self) -> Option<TlsVersion> {
        self.tls_version
    }

    pub fn alpn(&self) -> Alpn {
        self.alpn
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Same key owned by `owner` if it was shared; private keys stay as they are.
    pub fn escalate(&self, owner: SessionId) -> Self {
        let mut key = self.clone();
        key.session_id = self.session_id.escalate(owner);
        key
    }
}

/// What the TLS layer actually agreed on for a connection.
#[derive(Clone, Debug, Default)]
pub struct Negotiated {
    pub tls_version: Option<TlsVersion>,
    pub alpn: Option<Alpn>,
    pub peer_certificate: Option<Bytes>,
    pub resumed: bool,
    pub new_session_ticket: Option<TlsSessionTicket>,
}

impl Default for SessionId {
    fn default() -> Self {
        Self::SHARED
    }
}

/// Facts about an exchange that force its connection to become private.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SensitivitySignals {
    pub client_identity: bool,
    pub tls_resumed: bool,
    pub request_credentials: bool,
    pub response_sets_cookie: bool,
    pub authenticated: bool,
}

impl SensitivitySignals {
    pub fn before_dispatch(
        client_identity: Option<&ClientIdentity>,
        request_headers: &HeaderMap,
        authenticated: bool,
    ) -> Self {
        Self {
            client_identity: client_identity.is_some_and(ClientIdentity::is_configured),
            tls_resumed: false,
            request_credentials: request_headers.contains_key(COOKIE)
                || request_headers.contains_key(AUTHORIZATION)
                || request_headers.contains_key(PROXY_AUTHORIZATION),
            response_sets_cookie: false,
            authenticated,
        }
    }

    pub fn with_negotiation(mut self, negotiated: &Negotiated) -> Self {
        self.tls_resumed = negotiated.resumed;
        self
    }

    pub fn with_response(mut self, response_headers: &HeaderMap) -> Self {
        self.response_sets_cookie = response_headers.contains_key(SET_COOKIE);
        self
    }

    pub fn requires_private(&self) -> bool {
        self.client_identity
            || self.tls_resumed
            || self.request_credentials
            || self.response_sets_cookie
            || self.authenticated
    }

    /// Session id a connection should carry given these signals.
    pub fn session_for(&self, current: SessionId, owner: SessionId) -> SessionId {
        if self.requires_private() {
            current.escalate(owner)
        } else {
            current
        }
    }
}

/// Idle connection index for Connection Manager implementations.
pub trait PoolEntry: Send + Sized {
    fn is_reusable(&self) -> bool {
        true
    }

    /// Another handle onto the same connection, for multiplexed protocols.
    fn share(&self) -> Option<Self> {
        None
    }
}

/// Lookup-or-remove of idle connections keyed by [`ConnectionKey`].
///
/// Checkout happens under a single lock so two callers never receive the same
/// exclusive connection.
pub struct ConnectionRegistry<C> {
    idle: Mutex<HashMap<ConnectionKey, Vec<C>>>,
    max_idle_per_key: usize,
}

impl<C: PoolEntry> ConnectionRegistry<C> {
    pub fn new(max_idle_per_key: usize) -> Self {
        Self {
            idle: Mutex::new(HashMap::new()),
            max_idle_per_key: max_idle_per_key.max(1),
        }
    }

    pub fn checkout(&self, config: &ConnectionConfig) -> Option<(ConnectionKey, C)> {
        let mut idle = lock_unpoisoned(&self.idle);
        let mut found = None;
        for (key, entries) in idle.iter_mut() {
            if !config.matches(key) {
                continue;
            }
            entries.retain(PoolEntry::is_reusable);
            if let Some(shared) = entries.iter().find_map(PoolEntry::share) {
                found = Some((key.clone(), shared));
                break;
            }
            if let Some(entry) = entries.pop() {
                found = Some((key.clone(), entry));
                break;
            }
        }
        idle.retain(|_, entries| !entries.is_empty());
        found
    }

    /// Returns `false` when the connection was dropped instead of pooled.
    pub fn checkin(&self, key: ConnectionKey, connection: C) -> bool {
        if !connection.is_reusable() {
            return false;
        }
        let mut idle = lock_unpoisoned(&self.idle);
        let entries = idle.entry(key).or_default();
        if entries.len() >= self.max_idle_per_key {
            return false;
        }
        entries.push(connection);
        true
    }

    pub fn idle_count(&self) -> usize {
        lock_unpoisoned(&self.idle).values().map(Vec::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Barrier};
    use std::thread;

    use bytes::Bytes;
    use http::header::{COOKIE, SET_COOKIE};
    use http::{HeaderMap, HeaderValue};

    use super::{
        ConnectionConfig, ConnectionRegistry, Negotiated, PoolEntry, SensitivitySignals, SessionId,
    };
    use crate::core::error::ErrorCode;
    use crate::core::origin::{Origin, Scheme};
    use crate::core::tls::{Alpn, CertFingerprint, TlsVersion};

    fn https_config() -> ConnectionConfig {
        ConnectionConfig::new(Origin::new(Scheme::Https, "example.com", 443))
    }

    fn negotiated(alpn: Alpn) -> Negotiated {
        Negotiated {
            tls_version: Some(TlsVersion::Tls1_3),
            alpn: Some(alpn),
            peer_certificate: Some(Bytes::from_static(b"leaf-der")),
            ..Negotiated::default()
        }
    }

    #[test]
    fn resolve_collapses_ranges_to_negotiated_values() {
        let config = https_config();
        let key = config
            .resolve(&negotiated(Alpn::H2))
            .expect("key should resolve");
        assert_eq!(key.tls_version(), Some(TlsVersion::Tls1_3));
        assert_eq!(key.alpn(), Alpn::H2);
        assert_eq!(key.pinned_cert(), None);
        assert!(config.matches(&key));
    }

    #[test]
    fn resolve_rejects_version_outside_range() {
        let config = https_config().tls_versions(TlsVersion::Tls1_2, TlsVersion::Tls1_2);
        let error = config
            .resolve(&negotiated(Alpn::H2))
            .expect_err("tls 1.3 should be rejected");
        assert_eq!(error.code(), ErrorCode::TlsVersionMismatch);
    }

    #[test]
    fn resolve_picks_the_pin_that_matched() {
        let matching = CertFingerprint::sha256_of(b"leaf-der");
        let other = CertFingerprint::sha256_of(b"backup-der");
        let pins = BTreeSet::from([matching.clone(), other]);
        let key = https_config()
            .pinned_certs(pins)
            .resolve(&negotiated(Alpn::Http11))
            .expect("pin should match");
        assert_eq!(key.pinned_cert(), Some(&matching));
    }

    #[test]
    fn pin_mismatch_is_a_trust_failure() {
        let pins = BTreeSet::from([CertFingerprint::sha256_of(b"someone-else")]);
        let error = https_config()
            .pinned_certs(pins)
            .resolve(&negotiated(Alpn::Http11))
            .expect_err("pin mismatch should fail");
        assert_eq!(error.code(), ErrorCode::TrustVerification);
        assert!(error.is_fatal());
    }

    #[test]
    fn unoffered_alpn_is_rejected() {
        let error = https_config()
            .alpn_protocols([Alpn::Http11])
            .resolve(&negotiated(Alpn::H2))
            .expect_err("h2 was not offered");
        assert_eq!(error.code(), ErrorCode::AlpnMismatch);
    }

    #[test]
    fn cookie_header_makes_the_key_private() {
        let owner = SessionId::next();
        let plain_headers = HeaderMap::new();
        let mut cookie_headers = HeaderMap::new();
        cookie_headers.insert(COOKIE, HeaderValue::from_static("sid=1"));

        let shared_session = SensitivitySignals::before_dispatch(None, &plain_headers, false)
            .session_for(SessionId::SHARED, owner);
        let private_session = SensitivitySignals::before_dispatch(None, &cookie_headers, false)
            .session_for(SessionId::SHARED, owner);

        let shared = https_config()
            .session_id(shared_session)
            .resolve(&negotiated(Alpn::H2))
            .expect("key should resolve");
        let private = https_config()
            .session_id(private_session)
            .resolve(&negotiated(Alpn::H2))
            .expect("key should resolve");

        assert_ne!(shared, private);
        assert!(shared.session_id().is_shared());
        assert_eq!(private.session_id(), owner);
    }

    #[test]
    fn escalation_is_one_directional() {
        let first = SessionId::next();
        let second = SessionId::next();
        let escalated = SessionId::SHARED.escalate(first);
        assert_eq!(escalated, first);
        assert_eq!(escalated.escalate(second), first);

        let mut response_headers = HeaderMap::new();
        response_headers.insert(SET_COOKIE, HeaderValue::from_static("a=b"));
        let signals = SensitivitySignals::default().with_response(&response_headers);
        assert!(signals.requires_private());
    }

    #[test]
    fn resumption_signal_escalates_a_shared_key() {
        let owner = SessionId::next();
        let mut negotiated = negotiated(Alpn::H2);
        negotiated.resumed = true;
        let key = https_config()
            .resolve(&negotiated)
            .expect("key should resolve");
        assert!(key.session_id().is_shared());

        let signals = SensitivitySignals::default().with_negotiation(&negotiated);
        assert_eq!(signals.session_for(key.session_id(), owner), owner);
        assert_eq!(
            SensitivitySignals::default().session_for(key.session_id(), owner),
            SessionId::SHARED
        );
    }

    struct FakeConnection {
        alive: Arc<AtomicBool>,
        multiplexed: bool,
    }

    impl PoolEntry for FakeConnection {
        fn is_reusable(&self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }

        fn share(&self) -> Option<Self> {
            self.multiplexed.then(|| FakeConnection {
                alive: Arc::clone(&self.alive),
                multiplexed: true,
            })
        }
    }

    #[test]
    fn registry_hands_exclusive_connections_out_once() {
        let registry = ConnectionRegistry::new(4);
        let config = https_config();
        let key = config
            .resolve(&negotiated(Alpn::Http11))
            .expect("key should resolve");
        registry.checkin(
            key,
            FakeConnection {
                alive: Arc::new(AtomicBool::new(true)),
                multiplexed: false,
            },
        );

        assert!(registry.checkout(&config).is_some());
        assert!(registry.checkout(&config).is_none());
    }

    #[test]
    fn concurrent_checkouts_never_share_an_exclusive_connection() {
        let registry = Arc::new(ConnectionRegistry::new(4));
        let config = https_config();
        let key = config
            .resolve(&negotiated(Alpn::Http11))
            .expect("key should resolve");
        registry.checkin(
            key,
            FakeConnection {
                alive: Arc::new(AtomicBool::new(true)),
                multiplexed: false,
            },
        );

        let barrier = Arc::new(Barrier::new(8));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let barrier = Arc::clone(&barrier);
                let config = config.clone();
                thread::spawn(move || {
                    barrier.wait();
                    registry.checkout(&config).is_some()
                })
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|handle| handle.join().expect("checkout thread"))
            .filter(|won| *won)
            .count();

        assert_eq!(winners, 1);
        assert_eq!(registry.idle_count(), 0);
    }

    #[test]
    fn registry_shares_multiplexed_connections_and_drops_dead_ones() {
        let registry = ConnectionRegistry::new(4);
        let config = https_config();
        let key = config
            .resolve(&negotiated(Alpn::H2))
            .expect("key should resolve");
        let alive = Arc::new(AtomicBool::new(true));
        registry.checkin(
            key,
            FakeConnection {
                alive: Arc::clone(&alive),
                multiplexed: true,
            },
        );

        assert!(registry.checkout(&config).is_some());
        assert!(registry.checkout(&config).is_some());
        assert_eq!(registry.idle_count(), 1);

        alive.store(false, Ordering::SeqCst);
        assert!(registry.checkout(&config).is_none());
        assert_eq!(registry.idle_count(), 0);
    }

    #[test]
    fn private_connections_do_not_match_shared_configs() {
        let registry = ConnectionRegistry::new(4);
        let config = https_config();
        let key = config
            .resolve(&negotiated(Alpn::Http11))
            .expect("key should resolve")
            .escalate(SessionId::next());
        registry.checkin(
            key,
            FakeConnection {
                alive: Arc::new(AtomicBool::new(true)),
                multiplexed: false,
            },
        );
        assert!(registry.checkout(&config).is_none());
    }
}
