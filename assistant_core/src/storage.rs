//! Namespaced key/value storage with per-entry expiry.
//!
//! Every plugin gets a [`PluginStorage`] bound to its own namespace. A
//! [`Namespace`] can only be minted inside this crate, so plugin code has no
//! way to address another plugin's keys.
//!
//! Expiry is checked lazily on every read and additionally swept by a
//! background task (see [`KeyedExpiringStore::spawn_sweeper`]).

use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::error::StorageError;
use crate::persistence::{Persistence, StoredEntry};

/// Storage isolation boundary, equal to the owning plugin's name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Namespace(String);

impl Namespace {
    pub(crate) fn new(plugin_name: impl Into<String>) -> Self {
        Self(plugin_name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<DateTime<Utc>>,
}

impl Entry {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(false, |at| now >= at)
    }

    fn to_stored(&self) -> Result<StoredEntry, StorageError> {
        Ok(StoredEntry {
            value_json: serde_json::to_string(&self.value)?,
            expires_at_ms: self.expires_at.map(|t| t.timestamp_millis()),
        })
    }
}

fn expiry_from(now: DateTime<Utc>, ttl: Option<Duration>) -> Option<DateTime<Utc>> {
    let ttl = ttl?;
    Some(
        chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|d| now.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC),
    )
}

pub struct KeyedExpiringStore {
    namespaces: DashMap<Namespace, BTreeMap<String, Entry>>,
    persistence: Option<Arc<Persistence>>,
    closed: AtomicBool,
}

impl Default for KeyedExpiringStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyedExpiringStore {
    /// Purely in-memory store.
    pub fn new() -> Self {
        Self {
            namespaces: DashMap::new(),
            persistence: None,
            closed: AtomicBool::new(false),
        }
    }

    /// Store with sled write-through; existing unexpired entries are loaded.
    #[instrument(skip(persistence))]
    pub fn with_persistence(persistence: Arc<Persistence>) -> Result<Self, StorageError> {
        let store = Self {
            namespaces: DashMap::new(),
            persistence: Some(persistence.clone()),
            closed: AtomicBool::new(false),
        };

        let now = Utc::now();
        let mut loaded = 0usize;
        for (ns, key, stored) in persistence.load_entries()? {
            let expires_at = stored
                .expires_at_ms
                .and_then(|ms| Utc.timestamp_millis_opt(ms).single());
            let entry = Entry {
                value: serde_json::from_str(&stored.value_json)?,
                expires_at,
            };
            if entry.is_expired(now) {
                persistence.remove_entry(&ns, &key)?;
                continue;
            }
            store
                .namespaces
                .entry(Namespace::new(ns))
                .or_default()
                .insert(key, entry);
            loaded += 1;
        }
        info!("Loaded {} persisted storage entries", loaded);
        Ok(store)
    }

    /// Storage facade bound to one plugin's namespace.
    pub(crate) fn facade(self: &Arc<Self>, plugin_name: &str) -> PluginStorage {
        PluginStorage {
            namespace: Namespace::new(plugin_name),
            store: self.clone(),
        }
    }

    fn ensure_open(&self) -> Result<(), StorageError> {
        if self.closed.load(Ordering::Acquire) {
            Err(StorageError::Closed)
        } else {
            Ok(())
        }
    }

    pub fn get(&self, ns: &Namespace, key: &str) -> Option<Value> {
        let now = Utc::now();
        self.namespaces
            .get(ns)
            .and_then(|entries| entries.get(key).cloned())
            .filter(|e| !e.is_expired(now))
            .map(|e| e.value)
    }

    /// Overwrite `key` and restart its TTL countdown. `ttl = None` means the
    /// entry never expires.
    pub fn set(
        &self,
        ns: &Namespace,
        key: &str,
        value: Value,
        ttl: Option<Duration>,
    ) -> Result<(), StorageError> {
        self.ensure_open()?;
        let entry = Entry {
            value,
            expires_at: expiry_from(Utc::now(), ttl),
        };
        // disk and memory change under the same shard guard
        let mut entries = self.namespaces.entry(ns.clone()).or_default();
        if let Some(p) = &self.persistence {
            p.put_entry(ns.as_str(), key, &entry.to_stored()?)?;
        }
        entries.insert(key.to_string(), entry);
        drop(entries);
        debug!(namespace = ns.as_str(), key, "Storage entry set");
        Ok(())
    }

    /// Remove `key`. Returns `false` when the key was absent or had already
    /// expired.
    pub fn delete(&self, ns: &Namespace, key: &str) -> Result<bool, StorageError> {
        self.ensure_open()?;
        let Some(mut entries) = self.namespaces.get_mut(ns) else {
            return Ok(false);
        };
        if let Some(p) = &self.persistence {
            p.remove_entry(ns.as_str(), key)?;
        }
        let now = Utc::now();
        Ok(entries.remove(key).map_or(false, |e| !e.is_expired(now)))
    }

    pub fn exists(&self, ns: &Namespace, key: &str) -> bool {
        self.get(ns, key).is_some()
    }

    /// Live keys of `ns` starting with `prefix`, in lexical order.
    pub fn list_keys(&self, ns: &Namespace, prefix: &str) -> Vec<String> {
        let now = Utc::now();
        let Some(entries) = self.namespaces.get(ns) else {
            return Vec::new();
        };
        entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .filter(|(_, e)| !e.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Drop every expired entry, returning how many were removed. Disk
    /// removal happens while the namespace shard is still locked, so a
    /// concurrent `set` of the same key cannot be undone on disk.
    pub fn sweep_expired(&self) -> usize {
        let now = Utc::now();
        let mut removed = 0usize;

        for mut ns_entries in self.namespaces.iter_mut() {
            let ns = ns_entries.key().clone();
            ns_entries.value_mut().retain(|key, entry| {
                if !entry.is_expired(now) {
                    return true;
                }
                if let Some(p) = &self.persistence {
                    if let Err(e) = p.remove_entry(ns.as_str(), key) {
                        warn!("Failed to remove expired entry {}/{} from disk: {}", ns.as_str(), key, e);
                    }
                }
                removed += 1;
                false
            });
        }
        self.namespaces.retain(|_, entries| !entries.is_empty());

        if removed > 0 {
            debug!("Swept {} expired storage entries", removed);
        }
        removed
    }

    /// Periodic expiry sweep. The task ends once the store is dropped or closed.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(store) = weak.upgrade() else { break };
                if store.closed.load(Ordering::Acquire) {
                    break;
                }
                store.sweep_expired();
            }
            debug!("Storage sweeper stopped");
        })
    }

    /// Stop accepting writes and flush persistence. Reads keep working.
    pub fn close(&self) -> Result<(), StorageError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!("Closing keyed expiring store");
        if let Some(p) = &self.persistence {
            p.flush()?;
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// A plugin's view of the store, fixed to its own namespace.
#[derive(Clone)]
pub struct PluginStorage {
    namespace: Namespace,
    store: Arc<KeyedExpiringStore>,
}

impl std::fmt::Debug for PluginStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginStorage")
            .field("namespace", &self.namespace.as_str())
            .finish()
    }
}

impl PluginStorage {
    pub fn namespace(&self) -> &str {
        self.namespace.as_str()
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.store.get(&self.namespace, key)
    }

    /// Typed read; a stored value of the wrong shape is a serialization error.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StorageError> {
        self.get(key)
            .map(serde_json::from_value)
            .transpose()
            .map_err(StorageError::from)
    }

    pub fn set(
        &self,
        key: &str,
        value: impl Into<Value>,
        ttl: Option<Duration>,
    ) -> Result<(), StorageError> {
        self.store.set(&self.namespace, key, value.into(), ttl)
    }

    pub fn delete(&self, key: &str) -> Result<bool, StorageError> {
        self.store.delete(&self.namespace, key)
    }

    pub fn exists(&self, key: &str) -> bool {
        self.store.exists(&self.namespace, key)
    }

    pub fn list_keys(&self, prefix: &str) -> Vec<String> {
        self.store.list_keys(&self.namespace, prefix)
    }
}
