use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One of the two bridged chat platforms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Chatwork,
    Lark,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Chatwork => "chatwork",
            Platform::Lark => "lark",
        }
    }

    /// The platform a message from `self` is forwarded to.
    pub fn other(&self) -> Platform {
        match self {
            Platform::Chatwork => Platform::Lark,
            Platform::Lark => Platform::Chatwork,
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Idempotency record linking a forwarded source message to the message the
/// bridge created on the target platform. Existence of this record is the
/// sole signal that an inbound message was already forwarded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageMapping {
    pub source_platform: Platform,
    pub source_message_id: String,
    pub target_platform: Platform,
    pub target_message_id: String,
    pub room_mapping_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Cached identity of a user on one platform, including their counterpart id
/// on the other platform when configured.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserMappingRecord {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub counterpart_user_id: Option<String>,
}

/// Dead-letter record for a forward attempt that could not be completed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedMessage {
    pub source_platform: Platform,
    pub target_platform: Platform,
    pub message: serde_json::Value,
    pub error: String,
    pub retry_count: u32,
    pub failed_at: DateTime<Utc>,
}
