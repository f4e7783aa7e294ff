use super::error::{KvError, Result};
use super::types::KVStats;
use parking_lot::RwLock;
use radix_trie::{Trie, TrieCommon};
use std::sync::Arc;
use tracing::debug;

/// Mutation contract used by replay and by the request path.
///
/// Implementations must tolerate concurrent callers; `delete` of a missing
/// key is a no-op.
pub trait StoreAdapter: Send + Sync {
    fn put(&self, key: &str, value: &str) -> Result<()>;
    fn delete(&self, key: &str) -> Result<()>;
}

/// In-memory key-value map guarded by a single reader/writer lock
#[derive(Clone)]
pub struct KVStore {
    data: Arc<RwLock<Trie<String, String>>>,
    stats: Arc<RwLock<KVStats>>,
}

impl Default for KVStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KVStore {
    pub fn new() -> Self {
        Self {
            data: Arc::new(RwLock::new(Trie::new())),
            stats: Arc::new(RwLock::new(KVStats::default())),
        }
    }

    /// Get a value by key
    pub fn get(&self, key: &str) -> Result<String> {
        debug!("GET key={}", key);

        let value = self.data.read().get(key).cloned();

        let mut stats = self.stats.write();
        stats.gets += 1;
        match value {
            Some(value) => {
                stats.hits += 1;
                Ok(value)
            }
            None => {
                stats.misses += 1;
                Err(KvError::KeyNotFound(key.to_string()))
            }
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.data.read().get(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    /// All keys in lexicographic order
    pub fn keys(&self) -> Vec<String> {
        self.data.read().keys().cloned().collect()
    }

    pub fn stats(&self) -> KVStats {
        let mut stats = self.stats.read().clone();
        stats.total_keys = self.len();
        stats
    }
}

impl StoreAdapter for KVStore {
    fn put(&self, key: &str, value: &str) -> Result<()> {
        if key.is_empty() {
            return Err(KvError::InvalidKey("key must not be empty".to_string()));
        }
        debug!("PUT key={}, size={}", key, value.len());

        self.data.write().insert(key.to_string(), value.to_string());
        self.stats.write().puts += 1;

        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        debug!("DELETE key={}", key);

        if self.data.write().remove(key).is_some() {
            self.stats.write().deletes += 1;
        }

        Ok(())
    }
}
