//! Transaction log subsystem
//!
//! Every mutation of the in-memory store is recorded as an [`Event`] in an
//! append-only log. At startup the log is replayed into an empty store before
//! the single background writer is started for new traffic.

pub mod file_log;
pub mod layer;
pub mod log;
pub mod postgres_log;
pub mod replay;
pub mod types;
mod writer;

pub use file_log::FileTransactionLog;
pub use layer::PersistenceLayer;
pub use log::{ReplayStream, TransactionLog};
pub use postgres_log::PostgresTransactionLog;
pub use replay::{RecoveryInfo, ReplayEngine, ReplayState, apply_stream, verify};
pub use types::{
    BackendConfig, DurabilityMode, Event, EventType, FileLogConfig, FsyncMode, PersistenceError,
    PostgresParams, Result, TransactionLogConfig,
};

#[cfg(test)]
mod tests;
