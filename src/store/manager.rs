//! Typed operations over the shared key-value store: idempotency records,
//! room/user mapping cache, dead-letter queue, and rate-limit counters.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use super::keys;
use super::models::{FailedMessage, MessageMapping, Platform, UserMappingRecord};
use super::{KeyValueStore, StoreError};

#[derive(Clone)]
pub struct StoreManager {
    store: Arc<dyn KeyValueStore>,
    message_ttl: Duration,
    mapping_ttl: Duration,
}

impl StoreManager {
    pub fn new(store: Arc<dyn KeyValueStore>, message_ttl: Duration, mapping_ttl: Duration) -> Self {
        Self {
            store,
            message_ttl,
            mapping_ttl,
        }
    }

    // Idempotency tracking

    /// True when an idempotency record exists for this source message, i.e.
    /// the message was already forwarded within the retention window.
    pub async fn is_message_processed(
        &self,
        platform: Platform,
        message_id: &str,
    ) -> Result<bool, StoreError> {
        self.store
            .exists(&keys::message_key(platform, message_id))
            .await
    }

    /// Write-once: the engine checks [`Self::is_message_processed`] first
    /// and never overwrites an existing record.
    pub async fn save_message_mapping(&self, mapping: &MessageMapping) -> Result<(), StoreError> {
        let key = keys::message_key(mapping.source_platform, &mapping.source_message_id);
        let value = serde_json::to_string(mapping)?;
        self.store
            .set_with_ttl(&key, &value, self.message_ttl)
            .await?;
        debug!(
            "message mapping saved source={} source_message_id={} target_message_id={}",
            mapping.source_platform, mapping.source_message_id, mapping.target_message_id
        );
        Ok(())
    }

    pub async fn get_message_mapping(
        &self,
        platform: Platform,
        message_id: &str,
    ) -> Result<Option<MessageMapping>, StoreError> {
        match self
            .store
            .get(&keys::message_key(platform, message_id))
            .await?
        {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    // Room mapping cache

    pub async fn get_room_mapping(
        &self,
        source_platform: Platform,
        source_room_id: &str,
    ) -> Result<Option<String>, StoreError> {
        self.store
            .get(&keys::room_key(source_platform, source_room_id))
            .await
    }

    pub async fn set_room_mapping(
        &self,
        source_platform: Platform,
        source_room_id: &str,
        target_room_id: &str,
    ) -> Result<(), StoreError> {
        self.store
            .set_with_ttl(
                &keys::room_key(source_platform, source_room_id),
                target_room_id,
                self.mapping_ttl,
            )
            .await
    }

    // User mapping cache

    pub async fn get_user_mapping(
        &self,
        source_platform: Platform,
        source_user_id: &str,
    ) -> Result<Option<UserMappingRecord>, StoreError> {
        match self
            .store
            .get(&keys::user_key(source_platform, source_user_id))
            .await?
        {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn set_user_mapping(
        &self,
        source_platform: Platform,
        source_user_id: &str,
        record: &UserMappingRecord,
    ) -> Result<(), StoreError> {
        let value = serde_json::to_string(record)?;
        self.store
            .set_with_ttl(
                &keys::user_key(source_platform, source_user_id),
                &value,
                self.mapping_ttl,
            )
            .await
    }

    // Dead-letter queue

    /// Persist a failed forward attempt. Retained 7x longer than ordinary
    /// message records so operators have time to inspect and replay.
    pub async fn record_failure(
        &self,
        source_message_id: &str,
        failed: &FailedMessage,
    ) -> Result<(), StoreError> {
        let key = keys::failed_key(
            &failed.failed_at.to_rfc3339(),
            failed.source_platform,
            source_message_id,
        );
        let value = serde_json::to_string(failed)?;
        self.store
            .set_with_ttl(&key, &value, self.message_ttl * 7)
            .await?;
        warn!(
            "message added to dlq source={} target={} retry_count={} error={}",
            failed.source_platform, failed.target_platform, failed.retry_count, failed.error
        );
        Ok(())
    }

    /// List DLQ entries in rough time order. Read-only: replay is an
    /// external operational concern.
    pub async fn failed_messages(
        &self,
        limit: usize,
    ) -> Result<Vec<(String, FailedMessage)>, StoreError> {
        let keys = self
            .store
            .scan_keys(keys::FAILED_KEY_PATTERN, limit)
            .await?;
        let mut messages = Vec::with_capacity(keys.len());
        for key in keys {
            let Some(raw) = self.store.get(&key).await? else {
                continue;
            };
            match serde_json::from_str(&raw) {
                Ok(failed) => messages.push((key, failed)),
                Err(e) => warn!("skipping undecodable dlq entry key={} error={}", key, e),
            }
        }
        Ok(messages)
    }

    // Rate limiting

    /// Sliding-window counter: INCR, then EXPIRE on the first increment of
    /// the window. Returns true while under the limit.
    pub async fn check_rate_limit(
        &self,
        key: &str,
        limit: i64,
        window: Duration,
    ) -> Result<bool, StoreError> {
        let current = self.store.incr(key).await?;
        if current == 1 {
            self.store.expire(key, window).await?;
        }
        Ok(current <= limit)
    }

    pub async fn health_check(&self) -> bool {
        match self.store.ping().await {
            Ok(()) => true,
            Err(e) => {
                warn!("store health check failed: {}", e);
                false
            }
        }
    }
}
