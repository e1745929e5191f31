//! Trust stores: which peer certificates this device accepts
//!
//! Two independent stores exist, one per role. A client consults the
//! "servers I trust" store, a server the "clients I trust" store. Each store
//! is an observable snapshot: every mutation publishes a fresh immutable map
//! so live sessions can re-derive their trust without polling.

pub mod backend;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tracing::info;

use crate::crypto::Certificate;
use crate::{Error, Result};

pub use backend::{JsonFileBackend, MemoryBackend, TrustBackend};

/// Immutable view of a store's entries
pub type TrustSnapshot = Arc<BTreeMap<String, Certificate>>;

/// Which role a trust store serves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrustScope {
    /// Servers this device, acting as a client, accepts
    Servers,
    /// Clients this device, acting as a server, accepts
    Clients,
}

impl TrustScope {
    pub fn file_name(self) -> &'static str {
        match self {
            TrustScope::Servers => "trusted_servers.json",
            TrustScope::Clients => "trusted_clients.json",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TrustScope::Servers => "servers",
            TrustScope::Clients => "clients",
        }
    }
}

impl std::str::FromStr for TrustScope {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "servers" | "server" => Ok(TrustScope::Servers),
            "clients" | "client" => Ok(TrustScope::Clients),
            other => Err(Error::Config(format!("unknown trust scope: {}", other))),
        }
    }
}

struct Inner {
    scope: TrustScope,
    backend: Box<dyn TrustBackend>,
    snapshot: watch::Sender<TrustSnapshot>,
    // Serializes add/remove so each persisted map contains every earlier write
    write_lock: Mutex<()>,
}

/// Persistent, observable name → certificate mapping
#[derive(Clone)]
pub struct TrustStore {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for TrustStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrustStore")
            .field("scope", &self.inner.scope)
            .field("entries", &self.inner.snapshot.borrow().len())
            .finish()
    }
}

impl TrustStore {
    /// Open a store, loading whatever the backend already holds
    pub fn open(scope: TrustScope, backend: impl TrustBackend + 'static) -> Result<Self> {
        let entries = backend.load()?;
        let (snapshot, _) = watch::channel(Arc::new(entries));
        Ok(Self {
            inner: Arc::new(Inner {
                scope,
                backend: Box::new(backend),
                snapshot,
                write_lock: Mutex::new(()),
            }),
        })
    }

    /// Open the file-backed store for `scope` inside `data_dir`
    pub fn open_in(data_dir: &Path, scope: TrustScope) -> Result<Self> {
        Self::open(scope, JsonFileBackend::new(data_dir.join(scope.file_name())))
    }

    pub fn in_memory(scope: TrustScope) -> Self {
        let (snapshot, _) = watch::channel(Arc::new(BTreeMap::new()));
        Self {
            inner: Arc::new(Inner {
                scope,
                backend: Box::new(MemoryBackend::new()),
                snapshot,
                write_lock: Mutex::new(()),
            }),
        }
    }

    pub fn scope(&self) -> TrustScope {
        self.inner.scope
    }

    pub fn list(&self) -> TrustSnapshot {
        self.inner.snapshot.borrow().clone()
    }

    pub fn get(&self, name: &str) -> Option<Certificate> {
        self.inner.snapshot.borrow().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.snapshot.borrow().contains_key(name)
    }

    /// True only if `name` is stored with exactly this certificate
    pub fn is_trusted(&self, name: &str, certificate: &Certificate) -> bool {
        matches_entry(&self.inner.snapshot.borrow(), name, certificate)
    }

    /// Insert or replace the entry for `name`
    pub fn add(&self, name: &str, certificate: Certificate) -> Result<()> {
        self.mutate(|entries| {
            entries.insert(name.to_string(), certificate);
            true
        })?;
        info!(scope = self.inner.scope.as_str(), peer = %name, "trusted peer added");
        Ok(())
    }

    /// Remove the entry for `name`; returns whether one existed
    pub fn remove(&self, name: &str) -> Result<bool> {
        let removed = self.mutate(|entries| entries.remove(name).is_some())?;
        if removed {
            info!(scope = self.inner.scope.as_str(), peer = %name, "trusted peer removed");
        }
        Ok(removed)
    }

    /// Receive every future snapshot; the current one is marked as seen
    pub fn subscribe(&self) -> watch::Receiver<TrustSnapshot> {
        self.inner.snapshot.subscribe()
    }

    fn mutate(&self, f: impl FnOnce(&mut BTreeMap<String, Certificate>) -> bool) -> Result<bool> {
        let _guard = self
            .inner
            .write_lock
            .lock()
            .map_err(|_| Error::Certificate("trust store lock poisoned".to_string()))?;

        let mut entries = (**self.inner.snapshot.borrow()).clone();
        if !f(&mut entries) {
            return Ok(false);
        }
        self.inner.backend.save(&entries)?;
        self.inner.snapshot.send_replace(Arc::new(entries));
        Ok(true)
    }
}

/// Exact DER comparison against a snapshot
pub fn matches_entry(
    entries: &BTreeMap<String, Certificate>,
    name: &str,
    certificate: &Certificate,
) -> bool {
    entries.get(name).is_some_and(|stored| stored == certificate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::fixtures;

    #[test]
    fn test_is_trusted_requires_exact_certificate() {
        let store = TrustStore::in_memory(TrustScope::Servers);
        store.add("alpha", fixtures::cert_a().clone()).unwrap();

        assert!(store.contains("alpha"));
        assert!(store.is_trusted("alpha", fixtures::cert_a()));
        // Present by name but a different certificate
        assert!(!store.is_trusted("alpha", fixtures::cert_b()));
        assert!(!store.is_trusted("beta", fixtures::cert_b()));
    }

    #[test]
    fn test_add_replaces_by_name() {
        let store = TrustStore::in_memory(TrustScope::Clients);
        store.add("desk", fixtures::cert_a().clone()).unwrap();
        store.add("desk", fixtures::cert_b().clone()).unwrap();

        assert_eq!(store.list().len(), 1);
        assert!(store.is_trusted("desk", fixtures::cert_b()));
    }

    #[test]
    fn test_remove() {
        let store = TrustStore::in_memory(TrustScope::Servers);
        store.add("alpha", fixtures::cert_a().clone()).unwrap();

        assert!(store.remove("alpha").unwrap());
        assert!(!store.remove("alpha").unwrap());
        assert!(!store.contains("alpha"));
    }

    #[tokio::test]
    async fn test_subscribers_see_mutations() {
        let store = TrustStore::in_memory(TrustScope::Servers);
        let mut rx = store.subscribe();

        store.add("alpha", fixtures::cert_a().clone()).unwrap();
        rx.changed().await.unwrap();
        assert!(rx.borrow_and_update().contains_key("alpha"));

        store.remove("alpha").unwrap();
        rx.changed().await.unwrap();
        assert!(rx.borrow_and_update().is_empty());
    }

    #[test]
    fn test_noop_remove_does_not_notify() {
        let store = TrustStore::in_memory(TrustScope::Servers);
        let rx = store.subscribe();
        store.remove("ghost").unwrap();
        assert!(!rx.has_changed().unwrap());
    }

    #[test]
    fn test_file_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = TrustStore::open_in(dir.path(), TrustScope::Clients).unwrap();
            store.add("beta", fixtures::cert_b().clone()).unwrap();
        }
        let reopened = TrustStore::open_in(dir.path(), TrustScope::Clients).unwrap();
        assert!(reopened.is_trusted("beta", fixtures::cert_b()));

        // Scopes never share storage
        let servers = TrustStore::open_in(dir.path(), TrustScope::Servers).unwrap();
        assert!(servers.list().is_empty());
    }

    #[test]
    fn test_scope_parsing() {
        assert_eq!("servers".parse::<TrustScope>().unwrap(), TrustScope::Servers);
        assert_eq!("client".parse::<TrustScope>().unwrap(), TrustScope::Clients);
        assert!("nobody".parse::<TrustScope>().is_err());
    }
}
