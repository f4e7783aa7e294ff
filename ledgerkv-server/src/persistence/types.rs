use crate::core::KvError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Name of the relational table holding the log
pub const TABLE: &str = "transactions";

/// Transaction log error types
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("backend unreachable: {0}")]
    Connectivity(String),

    #[error("cannot prepare log storage: {0}")]
    Schema(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("malformed record at {position}: {reason}")]
    Decode { position: u64, reason: String },

    #[error("unknown event type {0}")]
    UnknownEventType(i64),

    #[error("transaction numbers out of sequence: {found} after {previous}")]
    OutOfSequence { previous: u64, found: u64 },

    #[error("transaction log writer is closed")]
    WriterClosed,

    #[error("transaction log writer already started")]
    AlreadyStarted,

    #[error("replay already completed, engine is live")]
    AlreadyLive,

    #[error("failed to apply event: {0}")]
    Store(#[from] KvError),
}

pub type Result<T> = std::result::Result<T, PersistenceError>;

/// Kind of state change recorded by an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    Put,
    Delete,
}

impl EventType {
    /// Small-integer encoding shared by every backend
    pub fn code(self) -> i16 {
        match self {
            EventType::Put => 0,
            EventType::Delete => 1,
        }
    }
}

impl TryFrom<i64> for EventType {
    type Error = PersistenceError;

    fn try_from(code: i64) -> Result<Self> {
        match code {
            0 => Ok(EventType::Put),
            1 => Ok(EventType::Delete),
            other => Err(PersistenceError::UnknownEventType(other)),
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventType::Put => f.write_str("PUT"),
            EventType::Delete => f.write_str("DELETE"),
        }
    }
}

/// One durable state change.
///
/// The sequence number is zero until a backend persists the event (or replay
/// decodes it), and is never changed afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    sequence: u64,
    event_type: EventType,
    key: String,
    value: String,
}

impl Event {
    pub fn put(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            sequence: 0,
            event_type: EventType::Put,
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        Self {
            sequence: 0,
            event_type: EventType::Delete,
            key: key.into(),
            value: String::new(),
        }
    }

    /// Rebuild an event read back from durable storage
    pub(crate) fn persisted(
        sequence: u64,
        event_type: EventType,
        key: String,
        value: String,
    ) -> Self {
        let value = match event_type {
            EventType::Put => value,
            EventType::Delete => String::new(),
        };
        Self {
            sequence,
            event_type,
            key,
            value,
        }
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn event_type(&self) -> EventType {
        self.event_type
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn value(&self) -> &str {
        &self.value
    }
}

/// Transaction log configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionLogConfig {
    #[serde(flatten)]
    pub backend: BackendConfig,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default)]
    pub durability: DurabilityMode,
}

fn default_queue_capacity() -> usize {
    16
}

impl Default for TransactionLogConfig {
    fn default() -> Self {
        Self {
            backend: BackendConfig::File(FileLogConfig::default()),
            queue_capacity: default_queue_capacity(),
            durability: DurabilityMode::default(),
        }
    }
}

/// Backend selection; the only place the variant is chosen
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum BackendConfig {
    File(FileLogConfig),
    Postgres(PostgresParams),
}

/// File backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileLogConfig {
    pub path: PathBuf,
    #[serde(default)]
    pub fsync_mode: FsyncMode,
    #[serde(default = "default_fsync_interval_ms")]
    pub fsync_interval_ms: u64,
}

fn default_fsync_interval_ms() -> u64 {
    1000
}

impl Default for FileLogConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./data/transaction.log"),
            fsync_mode: FsyncMode::default(),
            fsync_interval_ms: default_fsync_interval_ms(),
        }
    }
}

/// Connection parameters for the relational backend
#[derive(Clone, Serialize, Deserialize)]
pub struct PostgresParams {
    pub host: String,
    pub db_name: String,
    pub user: String,
    pub password: String,
}

impl fmt::Debug for PostgresParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresParams")
            .field("host", &self.host)
            .field("db_name", &self.db_name)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Fsync mode for the file backend
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FsyncMode {
    /// Fsync after every write (safest, slowest)
    #[default]
    Always,
    /// Fsync at most once per `fsync_interval_ms` while writing; the writer
    /// also syncs an idle tail once the interval has passed
    Periodic,
    /// Never fsync, rely on the OS (fastest, least safe)
    Never,
}

/// How the request path waits on the log
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DurabilityMode {
    /// Apply in memory, enqueue the event and return; failures surface on the error channel
    #[default]
    Async,
    /// Wait for the durable append before applying in memory
    Sync,
}
