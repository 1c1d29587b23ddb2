//! sled-backed write-through persistence for storage entries and context
//! history. Both are optional; without a configured path everything stays in
//! memory.

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info};

use crate::context::ContextEntry;
use crate::error::StorageError;

const ENTRIES_TREE: &str = "plugin_entries";
const CONTEXT_TREE: &str = "user_context";

/// On-disk form of a storage entry. The value is kept as JSON text because
/// bincode cannot round-trip `serde_json::Value`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub(crate) struct StoredEntry {
    pub value_json: String,
    pub expires_at_ms: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct Persistence {
    db: sled::Db,
    entries: sled::Tree,
    contexts: sled::Tree,
}

fn entry_key(namespace: &str, key: &str) -> Vec<u8> {
    let mut k = Vec::with_capacity(namespace.len() + key.len() + 1);
    k.extend_from_slice(namespace.as_bytes());
    k.push(0);
    k.extend_from_slice(key.as_bytes());
    k
}

fn split_entry_key(raw: &[u8]) -> Option<(String, String)> {
    let pos = raw.iter().position(|b| *b == 0)?;
    let ns = String::from_utf8(raw[..pos].to_vec()).ok()?;
    let key = String::from_utf8(raw[pos + 1..].to_vec()).ok()?;
    Some((ns, key))
}

impl Persistence {
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        let db = sled::open(path)?;
        info!("Opened persistence database at {:?}", path);
        Self::from_db(db)
    }

    /// In-memory sled instance that is deleted on drop; used in tests.
    pub fn temporary() -> Result<Self, StorageError> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> Result<Self, StorageError> {
        let entries = db.open_tree(ENTRIES_TREE)?;
        let contexts = db.open_tree(CONTEXT_TREE)?;
        Ok(Self {
            db,
            entries,
            contexts,
        })
    }

    pub(crate) fn put_entry(
        &self,
        namespace: &str,
        key: &str,
        entry: &StoredEntry,
    ) -> Result<(), StorageError> {
        let bytes = bincode::serialize(entry)?;
        self.entries.insert(entry_key(namespace, key), bytes)?;
        Ok(())
    }

    pub(crate) fn remove_entry(&self, namespace: &str, key: &str) -> Result<(), StorageError> {
        self.entries.remove(entry_key(namespace, key))?;
        Ok(())
    }

    pub(crate) fn load_entries(&self) -> Result<Vec<(String, String, StoredEntry)>, StorageError> {
        let mut out = Vec::new();
        for item in self.entries.iter() {
            let (k, v) = item?;
            let Some((ns, key)) = split_entry_key(&k) else {
                debug!("Skipping malformed persisted key");
                continue;
            };
            let entry: StoredEntry = bincode::deserialize(&v)?;
            out.push((ns, key, entry));
        }
        Ok(out)
    }

    pub(crate) fn put_history(
        &self,
        user_id: &str,
        history: &[ContextEntry],
    ) -> Result<(), StorageError> {
        let bytes = serde_json::to_vec(history)?;
        self.contexts.insert(user_id.as_bytes(), bytes)?;
        Ok(())
    }

    pub(crate) fn remove_history(&self, user_id: &str) -> Result<(), StorageError> {
        self.contexts.remove(user_id.as_bytes())?;
        Ok(())
    }

    pub(crate) fn load_histories(&self) -> Result<Vec<(String, Vec<ContextEntry>)>, StorageError> {
        let mut out = Vec::new();
        for item in self.contexts.iter() {
            let (k, v) = item?;
            let user = String::from_utf8_lossy(&k).into_owned();
            let history: Vec<ContextEntry> = serde_json::from_slice(&v)?;
            out.push((user, history));
        }
        Ok(out)
    }

    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }
}
