//! Persistence capability boundary
//!
//! Key-value storage consumed by the relay (at-rest message queue) and the
//! dedup manager (append-only seen log). Adapters must be idempotent and safe
//! to retry: a crash between "send succeeded" and "delete from store" may
//! replay an operation, and the receiving peer's dedup absorbs the duplicate.

use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::Result;

// ----------------------------------------------------------------------------
// PersistenceAdapter Trait
// ----------------------------------------------------------------------------

/// Passive key-value store. The core owns all lifecycle decisions; adapters
/// only read and write bytes. No cross-key ordering is required.
pub trait PersistenceAdapter: Send + Sync {
    /// Store a value under a key, overwriting any previous value
    fn put(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Fetch a value, None if absent
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Remove a key. Deleting an absent key is not an error.
    fn delete(&self, key: &str) -> Result<()>;

    /// All entries whose key starts with `prefix`
    fn query_by_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>>;

    /// All entries in the store
    fn query_all(&self) -> Result<Vec<(String, Vec<u8>)>>;
}

// ----------------------------------------------------------------------------
// In-Memory Adapter
// ----------------------------------------------------------------------------

/// In-memory adapter for tests, simulations, and ephemeral nodes
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries
    pub fn len(&self) -> usize {
        self.entries.lock().expect("store lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl PersistenceAdapter for MemoryStore {
    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        self.entries
            .lock()
            .expect("store lock poisoned")
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .entries
            .lock()
            .expect("store lock poisoned")
            .get(key)
            .cloned())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.entries.lock().expect("store lock poisoned").remove(key);
        Ok(())
    }

    fn query_by_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let entries = self.entries.lock().expect("store lock poisoned");
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    fn query_all(&self) -> Result<Vec<(String, Vec<u8>)>> {
        let entries = self.entries.lock().expect("store lock poisoned");
        Ok(entries
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
