pub use self::manager::StoreManager;
pub use self::models::{FailedMessage, MessageMapping, Platform, UserMappingRecord};

pub mod keys;
pub mod manager;
pub mod memory;
pub mod models;
pub mod redis;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store connection failed: {0}")]
    Connection(String),
    #[error("store operation failed: {0}")]
    Operation(String),
    #[error("stored value could not be decoded: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// TTL-keyed get/set/incr/exists/scan over the shared store. All bridge
/// state (mappings, idempotency records, DLQ entries, rate-limit counters)
/// lives behind this trait; the Redis implementation is used in production
/// and an in-memory one backs unit tests.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Unconditional single-key write. Every key the bridge stores carries
    /// a TTL; nothing is retained forever.
    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration)
    -> Result<(), StoreError>;

    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    async fn incr(&self, key: &str) -> Result<i64, StoreError>;

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError>;

    async fn scan_keys(&self, pattern: &str, limit: usize) -> Result<Vec<String>, StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;
}
