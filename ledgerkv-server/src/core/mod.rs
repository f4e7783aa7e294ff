pub mod error;
pub mod kv_store;
pub mod types;

pub use error::KvError;
pub use kv_store::{KVStore, StoreAdapter};
pub use types::KVStats;
