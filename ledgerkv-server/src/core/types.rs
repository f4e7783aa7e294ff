use serde::Serialize;

/// Counters kept by the in-memory store
#[derive(Debug, Clone, Default, Serialize)]
pub struct KVStats {
    pub total_keys: usize,
    pub puts: u64,
    pub deletes: u64,
    pub gets: u64,
    pub hits: u64,
    pub misses: u64,
}
