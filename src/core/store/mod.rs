//! Cross-request session state and the backends that hold it.

mod coordinator;
mod cookies;
mod file;
mod memory;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::core::origin::Origin;
use crate::core::tls::{Alpn, TlsSessionTicket};

pub(crate) use coordinator::{CachePlan, StoreCoordinator, cached_status};
pub use file::FileStore;
pub use memory::MemoryStore;

/// Alternate endpoint advertised for an origin.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AltSvc {
    pub alpn: Alpn,
    pub host: String,
    pub port: u16,
    pub expires_at: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hsts {
    pub host: String,
    pub include_subdomains: bool,
    /// Unix seconds; `None` never expires (preload entries).
    pub expires_at: Option<u64>,
    pub preload: bool,
}

impl Hsts {
    pub fn preloaded(host: impl Into<String>, include_subdomains: bool) -> Self {
        Self {
            host: host.into().to_ascii_lowercase(),
            include_subdomains,
            expires_at: None,
            preload: true,
        }
    }

    /// An entry that expired at the epoch. Stored for a host whose policy was
    /// explicitly withdrawn, it keeps a preload entry for that host from
    /// applying again.
    pub fn revoked(host: impl Into<String>) -> Self {
        Self {
            host: host.into().to_ascii_lowercase(),
            include_subdomains: false,
            expires_at: Some(0),
            preload: false,
        }
    }

    pub fn is_revoked(&self) -> bool {
        self.expires_at == Some(0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredCookie {
    pub name: String,
    pub value: String,
    pub path: String,
    pub secure: bool,
    pub expires_at: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    #[serde(with = "base64_body")]
    pub body: Vec<u8>,
    pub stored_at: u64,
    pub expires_at: u64,
}

/// Everything persisted for one origin.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OriginRecord {
    #[serde(default)]
    pub alt_svc: Vec<AltSvc>,
    #[serde(default)]
    pub cookies: Vec<StoredCookie>,
    #[serde(default)]
    pub redirects: BTreeMap<String, String>,
    #[serde(default)]
    pub tls_session_ticket: Option<TlsSessionTicket>,
    #[serde(default)]
    pub responses: BTreeMap<String, CachedResponse>,
}

impl OriginRecord {
    pub fn is_empty(&self) -> bool {
        self.alt_svc.is_empty()
            && self.cookies.is_empty()
            && self.redirects.is_empty()
            && self.tls_session_ticket.is_none()
            && self.responses.is_empty()
    }

    pub fn clear_category(&mut self, category: StoreCategory) {
        match category {
            StoreCategory::AltSvc => self.alt_svc.clear(),
            StoreCategory::Cookies => self.cookies.clear(),
            StoreCategory::Redirects => self.redirects.clear(),
            StoreCategory::TlsSessionTickets => self.tls_session_ticket = None,
            StoreCategory::Responses => self.responses.clear(),
            StoreCategory::Hsts => {}
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StoreCategory {
    AltSvc,
    Cookies,
    Redirects,
    Hsts,
    TlsSessionTickets,
    Responses,
}

impl StoreCategory {
    pub const ALL: [Self; 6] = [
        Self::AltSvc,
        Self::Cookies,
        Self::Redirects,
        Self::Hsts,
        Self::TlsSessionTickets,
        Self::Responses,
    ];
}

/// Backing storage for session state.
///
/// Implementations provide whole-record load and save; single calls must be
/// atomic with respect to each other. Read-modify-write sequences are
/// serialized per origin by the session, not by the backend.
pub trait SessionStore: Send + Sync {
    fn load_origin(&self, origin: &Origin) -> crate::Result<OriginRecord>;

    fn save_origin(&self, origin: &Origin, record: OriginRecord) -> crate::Result<()>;

    /// Deletes everything held for `origin`, including durable copies.
    fn remove_origin(&self, origin: &Origin) -> crate::Result<()>;

    fn load_hsts(&self, host: &str) -> crate::Result<Option<Hsts>>;

    fn save_hsts(&self, host: &str, entry: Option<Hsts>) -> crate::Result<()>;

    fn get_altsvc(&self, origin: &Origin) -> crate::Result<Vec<AltSvc>> {
        Ok(self.load_origin(origin)?.alt_svc)
    }

    fn get_cookies(&self, origin: &Origin) -> crate::Result<Vec<StoredCookie>> {
        Ok(self.load_origin(origin)?.cookies)
    }

    fn get_redirect(&self, url: &Url) -> crate::Result<Option<String>> {
        let origin = Origin::from_url(url)?;
        Ok(self.load_origin(&origin)?.redirects.remove(url.as_str()))
    }

    fn get_hsts(&self, host: &str) -> crate::Result<Option<Hsts>> {
        self.load_hsts(host)
    }

    fn get_tls_session_ticket(&self, origin: &Origin) -> crate::Result<Option<TlsSessionTicket>> {
        Ok(self.load_origin(origin)?.tls_session_ticket)
    }

    fn get_cached_response(
        &self,
        origin: &Origin,
        key: &str,
    ) -> crate::Result<Option<CachedResponse>> {
        Ok(self.load_origin(origin)?.responses.remove(key))
    }

    /// Removes every category for `origin`, or only `categories` when given.
    fn clear(&self, origin: &Origin, categories: Option<&[StoreCategory]>) -> crate::Result<()> {
        let categories = categories.unwrap_or(&StoreCategory::ALL);
        if categories.contains(&StoreCategory::Hsts) {
            self.save_hsts(origin.host(), None)?;
        }
        if StoreCategory::ALL
            .iter()
            .filter(|category| **category != StoreCategory::Hsts)
            .all(|category| categories.contains(category))
        {
            return self.remove_origin(origin);
        }
        let mut record = self.load_origin(origin)?;
        for category in categories {
            record.clear_category(*category);
        }
        if record.is_empty() {
            self.remove_origin(origin)
        } else {
            self.save_origin(origin, record)
        }
    }
}

/// Store that declines to persist anything.
#[derive(Debug, Default)]
pub struct NoStore;

impl SessionStore for NoStore {
    fn load_origin(&self, _origin: &Origin) -> crate::Result<OriginRecord> {
        Ok(OriginRecord::default())
    }

    fn save_origin(&self, _origin: &Origin, _record: OriginRecord) -> crate::Result<()> {
        Ok(())
    }

    fn remove_origin(&self, _origin: &Origin) -> crate::Result<()> {
        Ok(())
    }

    fn load_hsts(&self, _host: &str) -> crate::Result<Option<Hsts>> {
        Ok(None)
    }

    fn save_hsts(&self, _host: &str, _entry: Option<Hsts>) -> crate::Result<()> {
        Ok(())
    }
}

/// How a session chooses its store, resolved once when the session is built.
#[derive(Clone, Default)]
pub enum StoreSelection {
    #[default]
    None,
    Memory,
    Path(PathBuf),
    Custom(Arc<dyn SessionStore>),
}

impl std::fmt::Debug for StoreSelection {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => formatter.write_str("StoreSelection::None"),
            Self::Memory => formatter.write_str("StoreSelection::Memory"),
            Self::Path(path) => write!(formatter, "StoreSelection::Path({})", path.display()),
            Self::Custom(_) => formatter.write_str("StoreSelection::Custom(..)"),
        }
    }
}

impl From<PathBuf> for StoreSelection {
    fn from(path: PathBuf) -> Self {
        Self::Path(path)
    }
}

impl From<Arc<dyn SessionStore>> for StoreSelection {
    fn from(store: Arc<dyn SessionStore>) -> Self {
        Self::Custom(store)
    }
}

impl<S: Into<StoreSelection>> From<Option<S>> for StoreSelection {
    fn from(selection: Option<S>) -> Self {
        selection.map(Into::into).unwrap_or(Self::None)
    }
}

pub fn select_store(selection: StoreSelection) -> crate::Result<Arc<dyn SessionStore>> {
    Ok(match selection {
        StoreSelection::None => Arc::new(NoStore),
        StoreSelection::Memory => Arc::new(MemoryStore::default()),
        StoreSelection::Path(path) => Arc::new(FileStore::open(path)?),
        StoreSelection::Custom(store) => store,
    })
}

mod base64_body {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(body: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(body))
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD.decode(text).map_err(serde::de::Error::custom)
    }
}
