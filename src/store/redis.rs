//! Redis-backed [`KeyValueStore`] using a multiplexed connection manager.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use tracing::info;

use super::{KeyValueStore, StoreError};

pub struct RedisStore {
    manager: ConnectionManager,
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)
            .map_err(|e| StoreError::Connection(format!("invalid redis url: {e}")))?;
        let manager = ConnectionManager::new(client)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        let store = Self { manager };
        store.ping().await?;
        info!("redis connected");
        Ok(store)
    }

    fn conn(&self) -> ConnectionManager {
        self.manager.clone()
    }
}

fn op_err(err: redis::RedisError) -> StoreError {
    StoreError::Operation(err.to_string())
}

/// Redis rejects zero-second TTLs; clamp to one second.
fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        redis::cmd("GET")
            .arg(key)
            .query_async(&mut self.conn())
            .await
            .map_err(op_err)
    }

    async fn set_with_ttl(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(ttl_secs(ttl))
            .query_async::<_, ()>(&mut self.conn())
            .await
            .map_err(op_err)
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        redis::cmd("EXISTS")
            .arg(key)
            .query_async(&mut self.conn())
            .await
            .map_err(op_err)
    }

    async fn incr(&self, key: &str) -> Result<i64, StoreError> {
        redis::cmd("INCR")
            .arg(key)
            .query_async(&mut self.conn())
            .await
            .map_err(op_err)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        redis::cmd("EXPIRE")
            .arg(key)
            .arg(ttl_secs(ttl))
            .query_async::<_, i64>(&mut self.conn())
            .await
            .map(|_| ())
            .map_err(op_err)
    }

    async fn scan_keys(&self, pattern: &str, limit: usize) -> Result<Vec<String>, StoreError> {
        let mut keys: Vec<String> = redis::cmd("KEYS")
            .arg(pattern)
            .query_async(&mut self.conn())
            .await
            .map_err(op_err)?;
        keys.sort();
        keys.truncate(limit);
        Ok(keys)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        redis::cmd("PING")
            .query_async::<_, String>(&mut self.conn())
            .await
            .map(|_| ())
            .map_err(|e| StoreError::Connection(e.to_string()))
    }
}
