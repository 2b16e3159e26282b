//! Room and user mapping files, loaded at startup and refreshed on a timer.
//!
//! Mappings live in two JSON files under the configured directory:
//! `room_mappings.json` pairs a Chatwork room with a Lark chat, and
//! `user_mappings.json` pairs account IDs with display names. Each active
//! entry is written to the store in both directions so lookups during
//! forwarding are a single key read.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{error, info, warn};

use crate::store::{Platform, StoreManager, UserMappingRecord};

#[derive(Debug, Clone, Deserialize)]
pub struct RoomMapping {
    pub chatwork_room_id: String,
    pub lark_chat_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserMapping {
    pub chatwork_account_id: String,
    #[serde(default)]
    pub lark_user_id: Option<String>,
    pub display_name: String,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_active() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct RoomMappingFile {
    #[serde(default)]
    room_mappings: Vec<RoomMapping>,
}

#[derive(Debug, Deserialize)]
struct UserMappingFile {
    #[serde(default)]
    user_mappings: Vec<UserMapping>,
}

pub struct MappingLoader {
    store: Arc<StoreManager>,
    dir: PathBuf,
}

impl MappingLoader {
    pub fn new(store: Arc<StoreManager>, dir: impl Into<PathBuf>) -> Self {
        Self {
            store,
            dir: dir.into(),
        }
    }

    /// Load both files and push active entries into the store. Missing or
    /// broken user mappings only cost display names, so they never fail
    /// the load; room mappings are what the bridge runs on.
    pub async fn load_all(&self) -> Result<usize> {
        let rooms = self.load_room_mappings().await?;
        if let Err(err) = self.load_user_mappings().await {
            warn!("user mappings not loaded error={err:#}");
        }
        Ok(rooms)
    }

    async fn load_room_mappings(&self) -> Result<usize> {
        let path = self.dir.join("room_mappings.json");
        let Some(mappings) = read_mapping_file::<RoomMappingFile>(&path)? else {
            warn!("room mappings file missing path={}", path.display());
            return Ok(0);
        };

        let mut loaded = 0usize;
        for mapping in &mappings.room_mappings {
            if !mapping.is_active {
                continue;
            }
            self.store
                .set_room_mapping(
                    Platform::Chatwork,
                    &mapping.chatwork_room_id,
                    &mapping.lark_chat_id,
                )
                .await
                .context("failed to store chatwork room mapping")?;
            self.store
                .set_room_mapping(
                    Platform::Lark,
                    &mapping.lark_chat_id,
                    &mapping.chatwork_room_id,
                )
                .await
                .context("failed to store lark room mapping")?;
            loaded += 1;
        }
        info!(
            "room mappings loaded count={} total={}",
            loaded,
            mappings.room_mappings.len()
        );
        Ok(loaded)
    }

    async fn load_user_mappings(&self) -> Result<usize> {
        let path = self.dir.join("user_mappings.json");
        let Some(mappings) = read_mapping_file::<UserMappingFile>(&path)? else {
            return Ok(0);
        };

        let mut loaded = 0usize;
        for mapping in &mappings.user_mappings {
            if !mapping.is_active {
                continue;
            }
            let chatwork_record = UserMappingRecord {
                name: mapping.display_name.clone(),
                counterpart_user_id: mapping.lark_user_id.clone(),
            };
            self.store
                .set_user_mapping(Platform::Chatwork, &mapping.chatwork_account_id, &chatwork_record)
                .await
                .context("failed to store chatwork user mapping")?;
            if let Some(lark_user_id) = &mapping.lark_user_id {
                let lark_record = UserMappingRecord {
                    name: mapping.display_name.clone(),
                    counterpart_user_id: Some(mapping.chatwork_account_id.clone()),
                };
                self.store
                    .set_user_mapping(Platform::Lark, lark_user_id, &lark_record)
                    .await
                    .context("failed to store lark user mapping")?;
            }
            loaded += 1;
        }
        info!("user mappings loaded count={}", loaded);
        Ok(loaded)
    }

    /// Re-apply the mapping files forever at `interval`, so edits land
    /// without a restart. Mapping TTLs match the refresh cadence loosely;
    /// the periodic reload is what keeps entries alive.
    pub async fn run_refresh(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await; // first tick fires immediately; initial load already ran
        loop {
            ticker.tick().await;
            if let Err(err) = self.load_all().await {
                error!("mapping refresh failed error={err:#}");
            }
        }
    }
}

fn read_mapping_file<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let parsed = serde_json::from_str(&content)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    Ok(Some(parsed))
}
