use super::log::TransactionLog;
use super::types::DurabilityMode;
use crate::core::{KVStore, KvError, StoreAdapter};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error};

/// Request-path coupling of the in-memory store and the transaction log.
///
/// Mutations are serialized by a write gate held across "apply + enqueue",
/// so the log records them in exactly the order the store applied them.
/// Reads never touch the gate.
///
/// In [`DurabilityMode::Async`] the store is updated first and the event is
/// only queued. If the later append fails, the change stays visible in
/// memory but is missing from the log: the two diverge until an operator
/// intervenes, and a restart will not reproduce it. The failure is reported
/// on the log's error channel only. [`DurabilityMode::Sync`] appends first and
/// applies only after the append is durable.
pub struct PersistenceLayer {
    store: Arc<KVStore>,
    log: Arc<TransactionLog>,
    durability: DurabilityMode,
    write_gate: Mutex<()>,
}

impl PersistenceLayer {
    pub fn new(store: Arc<KVStore>, log: Arc<TransactionLog>, durability: DurabilityMode) -> Self {
        Self {
            store,
            log,
            durability,
            write_gate: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &KVStore {
        &self.store
    }

    pub fn log(&self) -> &TransactionLog {
        &self.log
    }

    pub fn durability(&self) -> DurabilityMode {
        self.durability
    }

    pub fn get(&self, key: &str) -> Result<String, KvError> {
        self.store.get(key)
    }

    pub async fn put(&self, key: &str, value: &str) -> Result<(), KvError> {
        validate_key(key)?;
        let _gate = self.write_gate.lock().await;

        match self.durability {
            DurabilityMode::Async => {
                self.store.put(key, value)?;
                if let Err(e) = self.log.submit_put(key, value).await {
                    error!("PUT key={} applied but not logged: {}", key, e);
                }
            }
            DurabilityMode::Sync => {
                let sequence = self
                    .log
                    .submit_put_acked(key, value)
                    .await
                    .map_err(|e| KvError::LogUnavailable(e.to_string()))?;
                self.store.put(key, value)?;
                debug!("PUT key={} durable at sequence {}", key, sequence);
            }
        }

        Ok(())
    }

    pub async fn delete(&self, key: &str) -> Result<(), KvError> {
        validate_key(key)?;
        let _gate = self.write_gate.lock().await;

        match self.durability {
            DurabilityMode::Async => {
                self.store.delete(key)?;
                if let Err(e) = self.log.submit_delete(key).await {
                    error!("DELETE key={} applied but not logged: {}", key, e);
                }
            }
            DurabilityMode::Sync => {
                let sequence = self
                    .log
                    .submit_delete_acked(key)
                    .await
                    .map_err(|e| KvError::LogUnavailable(e.to_string()))?;
                self.store.delete(key)?;
                debug!("DELETE key={} durable at sequence {}", key, sequence);
            }
        }

        Ok(())
    }
}

fn validate_key(key: &str) -> Result<(), KvError> {
    if key.is_empty() {
        return Err(KvError::InvalidKey("key must not be empty".to_string()));
    }
    Ok(())
}
