//! In-memory [`KeyValueStore`] with real TTL semantics. Backs unit tests and
//! local development without a Redis instance.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{KeyValueStore, StoreError};

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|deadline| deadline <= now)
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn live_value(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.is_expired(now) => {
                entries.remove(key);
                None
            }
            Some(entry) => Some(entry.value.clone()),
            None => None,
        }
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.live_value(key))
    }

    async fn set_with_ttl(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        self.entries.lock().insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.live_value(key).is_some())
    }

    async fn incr(&self, key: &str) -> Result<i64, StoreError> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let current = match entries.get(key) {
            Some(entry) if !entry.is_expired(now) => entry
                .value
                .parse::<i64>()
                .map_err(|e| StoreError::Operation(format!("counter is not an integer: {e}")))?,
            _ => 0,
        };
        let next = current + 1;
        let expires_at = entries
            .get(key)
            .filter(|entry| !entry.is_expired(now))
            .and_then(|entry| entry.expires_at);
        entries.insert(
            key.to_string(),
            Entry {
                value: next.to_string(),
                expires_at,
            },
        );
        Ok(next)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(key) {
            entry.expires_at = Some(Instant::now() + ttl);
        }
        Ok(())
    }

    async fn scan_keys(&self, pattern: &str, limit: usize) -> Result<Vec<String>, StoreError> {
        let now = Instant::now();
        let entries = self.entries.lock();
        let mut keys: Vec<String> = entries
            .iter()
            .filter(|(key, entry)| !entry.is_expired(now) && glob_match(pattern, key))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys.truncate(limit);
        Ok(keys)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Minimal glob: `*` matches any run of characters, everything else is
/// literal. Enough for the `failed:*` scan pattern.
fn glob_match(pattern: &str, key: &str) -> bool {
    let segments: Vec<&str> = pattern.split('*').collect();
    if segments.len() == 1 {
        return pattern == key;
    }

    let mut remaining = key;
    for (i, segment) in segments.iter().enumerate() {
        if segment.is_empty() {
            continue;
        }
        if i == 0 {
            match remaining.strip_prefix(segment) {
                Some(rest) => remaining = rest,
                None => return false,
            }
        } else if i == segments.len() - 1 {
            return remaining.ends_with(segment);
        } else {
            match remaining.find(segment) {
                Some(pos) => remaining = &remaining[pos + segment.len()..],
                None => return false,
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_get_roundtrip() {
        let store = MemoryStore::new();
        store
            .set_with_ttl("msg:chatwork:1", "payload", Duration::from_secs(60))
            .await
            .unwrap();

        assert_eq!(
            store.get("msg:chatwork:1").await.unwrap(),
            Some("payload".to_string())
        );
        assert!(store.exists("msg:chatwork:1").await.unwrap());
        assert!(!store.exists("msg:chatwork:2").await.unwrap());
    }

    #[tokio::test]
    async fn expired_entries_are_gone() {
        let store = MemoryStore::new();
        store
            .set_with_ttl("msg:lark:1", "payload", Duration::from_millis(10))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(store.get("msg:lark:1").await.unwrap(), None);
        assert!(!store.exists("msg:lark:1").await.unwrap());
    }

    #[tokio::test]
    async fn incr_counts_and_respects_expiry() {
        let store = MemoryStore::new();
        assert_eq!(store.incr("rate:chatwork").await.unwrap(), 1);
        assert_eq!(store.incr("rate:chatwork").await.unwrap(), 2);

        store
            .expire("rate:chatwork", Duration::from_millis(10))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(store.incr("rate:chatwork").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn scan_matches_prefix_pattern() {
        let store = MemoryStore::new();
        for key in ["failed:a", "failed:b", "msg:chatwork:1"] {
            store
                .set_with_ttl(key, "v", Duration::from_secs(60))
                .await
                .unwrap();
        }

        let keys = store.scan_keys("failed:*", 10).await.unwrap();
        assert_eq!(keys, vec!["failed:a".to_string(), "failed:b".to_string()]);

        let limited = store.scan_keys("failed:*", 1).await.unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[test]
    fn glob_match_handles_literals_and_wildcards() {
        assert!(glob_match("failed:*", "failed:2024:chatwork:1"));
        assert!(glob_match("exact", "exact"));
        assert!(!glob_match("exact", "exact2"));
        assert!(glob_match("a*c", "abc"));
        assert!(!glob_match("a*c", "abd"));
    }
}
