use super::file_log::FileTransactionLog;
use super::postgres_log::PostgresTransactionLog;
use super::types::{BackendConfig, Event, PersistenceError, Result, TransactionLogConfig};
use super::writer::AsyncWriter;
use tokio::sync::mpsc;
use tracing::info;

/// Single-pass cursor over a persisted log.
///
/// `events` yields records in ascending sequence order; `errors` carries at
/// most one read failure. Both close when the reader task finishes.
pub struct ReplayStream {
    pub events: mpsc::Receiver<Event>,
    pub errors: mpsc::Receiver<PersistenceError>,
}

impl ReplayStream {
    pub(crate) fn new(
        events: mpsc::Receiver<Event>,
        errors: mpsc::Receiver<PersistenceError>,
    ) -> Self {
        Self { events, errors }
    }
}

/// Durable transaction log, backed by a local file or a PostgreSQL table.
///
/// Lifecycle: `open` -> `replay_events` (consumed once) -> `start` -> submit
/// -> `close`. Submissions never wait on I/O, only on queue space; write
/// failures are delivered through [`TransactionLog::take_errors`].
pub enum TransactionLog {
    File(FileTransactionLog),
    Postgres(PostgresTransactionLog),
}

impl TransactionLog {
    pub async fn open(config: &TransactionLogConfig) -> Result<Self> {
        let log = match &config.backend {
            BackendConfig::File(file) => {
                Self::File(FileTransactionLog::open(file, config.queue_capacity).await?)
            }
            BackendConfig::Postgres(params) => {
                Self::Postgres(PostgresTransactionLog::open(params, config.queue_capacity).await?)
            }
        };

        info!(
            "Transaction log opened (backend={}, queue_capacity={})",
            log.backend_name(),
            config.queue_capacity
        );
        Ok(log)
    }

    pub fn backend_name(&self) -> &'static str {
        match self {
            Self::File(_) => "file",
            Self::Postgres(_) => "postgres",
        }
    }

    fn writer(&self) -> &AsyncWriter {
        match self {
            Self::File(log) => log.writer(),
            Self::Postgres(log) => log.writer(),
        }
    }

    pub async fn submit_put(&self, key: &str, value: &str) -> Result<()> {
        self.writer().submit(Event::put(key, value)).await
    }

    pub async fn submit_delete(&self, key: &str) -> Result<()> {
        self.writer().submit(Event::delete(key)).await
    }

    /// Resolves with the assigned sequence once the put is durable
    pub async fn submit_put_acked(&self, key: &str, value: &str) -> Result<u64> {
        self.writer().submit_acked(Event::put(key, value)).await
    }

    pub async fn submit_delete_acked(&self, key: &str) -> Result<u64> {
        self.writer().submit_acked(Event::delete(key)).await
    }

    /// Asynchronous write failures; available to exactly one consumer
    pub fn take_errors(&self) -> Option<mpsc::UnboundedReceiver<PersistenceError>> {
        self.writer().take_errors()
    }

    pub fn replay_events(&self) -> ReplayStream {
        match self {
            Self::File(log) => log.replay_events(),
            Self::Postgres(log) => log.replay_events(),
        }
    }

    /// Activate the writer. Call only once replay has been fully consumed.
    pub fn start(&self) -> Result<()> {
        match self {
            Self::File(log) => log.start(),
            Self::Postgres(log) => log.start(),
        }
    }

    pub fn is_started(&self) -> bool {
        self.writer().is_started()
    }

    /// Stop accepting submissions and wait until queued events are written
    pub async fn close(&self) {
        self.writer().close().await;
        info!("Transaction log closed (backend={})", self.backend_name());
    }

    pub fn last_sequence(&self) -> u64 {
        match self {
            Self::File(log) => log.last_sequence(),
            Self::Postgres(log) => log.last_sequence(),
        }
    }
}
