//! Key layout in the shared store. The formats are load-bearing: existing
//! deployments share the same Redis instance, so they must not drift.

use super::models::Platform;

/// Rate-limit counter for outbound Chatwork API calls.
pub const CHATWORK_RATE_LIMIT: &str = "rate:chatwork";

pub fn message_key(platform: Platform, message_id: &str) -> String {
    format!("msg:{}:{}", platform, message_id)
}

pub fn room_key(platform: Platform, room_id: &str) -> String {
    format!("room:{}:{}", platform, room_id)
}

pub fn user_key(platform: Platform, user_id: &str) -> String {
    format!("user:{}:{}", platform, user_id)
}

pub fn failed_key(timestamp: &str, platform: Platform, message_id: &str) -> String {
    format!("failed:{}:{}:{}", timestamp, platform, message_id)
}

pub const FAILED_KEY_PATTERN: &str = "failed:*";
