pub mod config;
pub mod core;
pub mod persistence;
pub mod server;

// Re-export commonly used types
pub use config::ServerConfig;
pub use core::{KVStats, KVStore, KvError, StoreAdapter};
pub use persistence::{
    DurabilityMode, Event, EventType, PersistenceError, PersistenceLayer, RecoveryInfo,
    ReplayEngine, ReplayState, TransactionLog, TransactionLogConfig,
};
pub use server::{AppState, create_router};
