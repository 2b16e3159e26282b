//! Outbound message formatting and loop detection.
//!
//! Every forwarded message is stamped with a marker naming its platform of
//! origin before the sender name and body. The same marker doubles as the
//! loop signal: when an inbound message on platform P starts with the
//! marker for the *other* platform, it is the bridge's own prior output
//! that round-tripped. This depends on every send applying the marker and
//! on no user message starting with that exact prefix — a documented
//! limitation, not a heuristic.

use crate::config::MessageConfig;
use crate::store::Platform;

pub const TRUNCATION_NOTICE: &str = "\n\n[Message truncated due to length limit]";

/// Characters reserved at the end of a truncated message for the notice.
const TRUNCATION_RESERVE: usize = 100;

#[derive(Debug, Clone)]
pub struct MessageFormatter {
    max_length: usize,
    loop_detection: bool,
    chatwork_marker: String,
    lark_marker: String,
}

impl MessageFormatter {
    pub fn new(config: &MessageConfig) -> Self {
        Self {
            max_length: config.max_length,
            loop_detection: config.enable_loop_detection,
            chatwork_marker: config.prefix_chatwork.clone(),
            lark_marker: config.prefix_lark.clone(),
        }
    }

    pub fn marker(&self, platform: Platform) -> &str {
        match platform {
            Platform::Chatwork => &self.chatwork_marker,
            Platform::Lark => &self.lark_marker,
        }
    }

    /// Case-insensitive check whether `text` starts with the marker for
    /// `origin`. Always false when loop detection is switched off.
    pub fn originated_from_bridge(&self, text: &str, origin: Platform) -> bool {
        if !self.loop_detection {
            return false;
        }
        let marker = self.marker(origin);
        let prefix: String = text.chars().take(marker.chars().count()).collect();
        prefix.to_lowercase() == marker.to_lowercase()
    }

    /// `"{marker} {sender}:\n{body}"`, truncated when over the limit.
    pub fn format_forward(&self, origin: Platform, sender_name: &str, body: &str) -> String {
        let text = format!("{} {}:\n{}", self.marker(origin), sender_name, body);
        self.truncate(text)
    }

    fn truncate(&self, text: String) -> String {
        if text.chars().count() <= self.max_length {
            return text;
        }
        let keep = self.max_length.saturating_sub(TRUNCATION_RESERVE);
        let mut truncated: String = text.chars().take(keep).collect();
        truncated.push_str(TRUNCATION_NOTICE);
        truncated
    }
}
