use std::collections::HashMap;
use std::sync::Mutex;

use super::{Hsts, OriginRecord, SessionStore};
use crate::core::origin::Origin;
use crate::core::util::lock_unpoisoned;

#[derive(Debug, Default)]
struct MemoryState {
    origins: HashMap<Origin, OriginRecord>,
    hsts: HashMap<String, Hsts>,
}

/// Process-local store; state is lost when the session is dropped.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn origin_count(&self) -> usize {
        lock_unpoisoned(&self.state).origins.len()
    }
}

impl SessionStore for MemoryStore {
    fn load_origin(&self, origin: &Origin) -> crate::Result<OriginRecord> {
        Ok(lock_unpoisoned(&self.state)
            .origins
            .get(origin)
            .cloned()
            .unwrap_or_default())
    }

    fn save_origin(&self, origin: &Origin, record: OriginRecord) -> crate::Result<()> {
        lock_unpoisoned(&self.state)
            .origins
            .insert(origin.clone(), record);
        Ok(())
    }

    fn remove_origin(&self, origin: &Origin) -> crate::Result<()> {
        lock_unpoisoned(&self.state).origins.remove(origin);
        Ok(())
    }

    fn load_hsts(&self, host: &str) -> crate::Result<Option<Hsts>> {
        Ok(lock_unpoisoned(&self.state).hsts.get(host).cloned())
    }

    fn save_hsts(&self, host: &str, entry: Option<Hsts>) -> crate::Result<()> {
        let mut state = lock_unpoisoned(&self.state);
        match entry {
            Some(entry) => {
                state.hsts.insert(host.to_owned(), entry);
            }
            None => {
                state.hsts.remove(host);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::MemoryStore;
    use crate::core::origin::{Origin, Scheme};
    use crate::core::store::{AltSvc, Hsts, OriginRecord, SessionStore, StoreCategory, StoredCookie};
    use crate::core::tls::{Alpn, TlsSessionTicket};

    fn populated(store: &MemoryStore, origin: &Origin) {
        let mut record = OriginRecord::default();
        record.alt_svc.push(AltSvc {
            alpn: Alpn::H3,
            host: "example.com".to_owned(),
            port: 443,
            expires_at: u64::MAX,
        });
        record.cookies.push(StoredCookie {
            name: "sid".to_owned(),
            value: "1".to_owned(),
            path: "/".to_owned(),
            secure: false,
            expires_at: None,
        });
        record.redirects.insert(
            "https://example.com/old".to_owned(),
            "https://example.com/new".to_owned(),
        );
        record.tls_session_ticket = Some(TlsSessionTicket(vec![1, 2, 3]));
        store
            .save_origin(origin, record)
            .expect("memory save should succeed");
        store
            .save_hsts(origin.host(), Some(Hsts::preloaded("example.com", false)))
            .expect("memory save should succeed");
    }

    #[test]
    fn clear_without_categories_empties_every_category() {
        let store = MemoryStore::new();
        let origin = Origin::new(Scheme::Https, "example.com", 443);
        populated(&store, &origin);

        store.clear(&origin, None).expect("clear should succeed");

        assert!(store.get_altsvc(&origin).expect("read").is_empty());
        assert!(store.get_cookies(&origin).expect("read").is_empty());
        let old = url::Url::parse("https://example.com/old").expect("url should parse");
        assert!(store.get_redirect(&old).expect("read").is_none());
        assert!(store.get_hsts("example.com").expect("read").is_none());
        assert!(store.get_tls_session_ticket(&origin).expect("read").is_none());
        assert_eq!(store.origin_count(), 0);
    }

    #[test]
    fn clear_with_categories_keeps_the_rest() {
        let store = MemoryStore::new();
        let origin = Origin::new(Scheme::Https, "example.com", 443);
        populated(&store, &origin);

        store
            .clear(
                &origin,
                Some(&[StoreCategory::Cookies, StoreCategory::Hsts]),
            )
            .expect("clear should succeed");

        assert!(store.get_cookies(&origin).expect("read").is_empty());
        assert!(store.get_hsts("example.com").expect("read").is_none());
        assert_eq!(store.get_altsvc(&origin).expect("read").len(), 1);
        assert!(store.get_tls_session_ticket(&origin).expect("read").is_some());
    }
}
