use super::log::{ReplayStream, TransactionLog};
use super::types::{Event, EventType, PersistenceError, Result};
use crate::core::{KVStore, StoreAdapter};
use serde::Serialize;
use tracing::{debug, info};

/// Startup phase of a process. There is no way back from `Live`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayState {
    Replaying,
    Live,
}

/// Summary of a completed replay
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryInfo {
    pub events_applied: u64,
    pub puts: u64,
    pub deletes: u64,
    pub last_sequence: u64,
}

impl RecoveryInfo {
    fn apply<S: StoreAdapter + ?Sized>(&mut self, event: &Event, store: &S) -> Result<()> {
        match event.event_type() {
            EventType::Put => {
                store.put(event.key(), event.value())?;
                self.puts += 1;
            }
            EventType::Delete => {
                store.delete(event.key())?;
                self.deletes += 1;
            }
        }
        self.events_applied += 1;
        self.last_sequence = event.sequence();
        Ok(())
    }
}

/// Rebuilds the store from the log, then hands the log over to live traffic
#[derive(Debug)]
pub struct ReplayEngine {
    state: ReplayState,
}

impl Default for ReplayEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplayEngine {
    pub fn new() -> Self {
        Self {
            state: ReplayState::Replaying,
        }
    }

    pub fn state(&self) -> ReplayState {
        self.state
    }

    /// Replay every persisted event into `store`, then start the log writer.
    ///
    /// Any read or apply error aborts before the writer is started; the
    /// caller must not serve traffic in that case.
    pub async fn run<S: StoreAdapter + ?Sized>(
        &mut self,
        log: &TransactionLog,
        store: &S,
    ) -> Result<RecoveryInfo> {
        if self.state == ReplayState::Live {
            return Err(PersistenceError::AlreadyLive);
        }

        info!("Replaying transaction log (backend={})...", log.backend_name());
        let recovered = apply_stream(log.replay_events(), store).await?;

        log.start()?;
        self.state = ReplayState::Live;

        info!(
            "Recovery complete. Replayed {} events ({} puts, {} deletes), last sequence {}",
            recovered.events_applied, recovered.puts, recovered.deletes, recovered.last_sequence
        );
        Ok(recovered)
    }
}

/// Drain a replay stream into `store`, racing events against errors.
///
/// Events are applied one at a time in the order received. The first error
/// ends the replay.
pub async fn apply_stream<S: StoreAdapter + ?Sized>(
    stream: ReplayStream,
    store: &S,
) -> Result<RecoveryInfo> {
    let ReplayStream {
        mut events,
        mut errors,
    } = stream;

    let mut recovered = RecoveryInfo::default();
    let mut events_open = true;
    let mut errors_open = true;

    while events_open || errors_open {
        tokio::select! {
            event = events.recv(), if events_open => match event {
                Some(event) => {
                    debug!("Replay {} seq={} key={}", event.event_type(), event.sequence(), event.key());
                    recovered.apply(&event, store)?;
                }
                None => events_open = false,
            },
            error = errors.recv(), if errors_open => match error {
                Some(error) => {
                    // records read before the failure may still be buffered
                    while let Some(event) = events.recv().await {
                        recovered.apply(&event, store)?;
                    }
                    return Err(error);
                }
                None => errors_open = false,
            },
        }
    }

    Ok(recovered)
}

/// Dry-run replay into a scratch store; the writer is not started
pub async fn verify(log: &TransactionLog) -> Result<(RecoveryInfo, KVStore)> {
    let scratch = KVStore::new();
    let recovered = apply_stream(log.replay_events(), &scratch).await?;
    Ok((recovered, scratch))
}
