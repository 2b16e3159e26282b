//! Chatwork API client: outbound message delivery with typed error mapping
//! and a client-side rate-limit gate backed by the shared store.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::{HeaderMap, HeaderValue};
use secrecy::ExposeSecret;
use tracing::{debug, info, warn};

use crate::bridge::OutboundClient;
use crate::config::ChatworkConfig;
use crate::error::BridgeError;
use crate::store::{Platform, StoreManager, keys};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_RETRY_AFTER_SECS: u64 = 10;

pub struct ChatworkClient {
    http: reqwest::Client,
    base_url: String,
    store: Arc<StoreManager>,
    rate_limit_requests: i64,
    rate_limit_window: Duration,
}

impl ChatworkClient {
    pub fn new(config: &ChatworkConfig, store: Arc<StoreManager>) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            "X-ChatWorkToken",
            HeaderValue::from_str(config.api_token.expose_secret())
                .context("chatwork api token is not a valid header value")?,
        );

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("failed to build chatwork http client")?;

        info!("chatwork client initialized");
        Ok(Self {
            http,
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
            store,
            rate_limit_requests: config.rate_limit_requests,
            rate_limit_window: Duration::from_secs(config.rate_limit_window_seconds),
        })
    }

    async fn post_message(&self, room_id: &str, body: &str) -> Result<String, BridgeError> {
        // Chatwork enforces a small request budget per window; gate locally
        // so the backoff controller waits instead of burning the quota.
        let under_limit = self
            .store
            .check_rate_limit(
                keys::CHATWORK_RATE_LIMIT,
                self.rate_limit_requests,
                self.rate_limit_window,
            )
            .await?;
        if !under_limit {
            warn!(
                "chatwork rate limit budget exhausted window_secs={}",
                self.rate_limit_window.as_secs()
            );
            return Err(BridgeError::RateLimited {
                platform: Platform::Chatwork,
                retry_after: Some(self.rate_limit_window.as_secs()),
            });
        }

        let url = format!("{}/rooms/{}/messages", self.base_url, room_id);
        let response = self
            .http
            .post(&url)
            .form(&[("body", body), ("self_unread", "0")])
            .send()
            .await
            .map_err(|e| BridgeError::Network {
                platform: Platform::Chatwork,
                message: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get("Retry-After")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok());
            let text = response.text().await.unwrap_or_default();
            return Err(map_error_status(status, retry_after, room_id, &text));
        }

        let payload: serde_json::Value =
            response.json().await.map_err(|e| BridgeError::Network {
                platform: Platform::Chatwork,
                message: format!("invalid response body: {e}"),
            })?;

        message_id_from_response(&payload).ok_or_else(|| BridgeError::Api {
            platform: Platform::Chatwork,
            code: 0,
            message: "response is missing message_id".to_string(),
        })
    }
}

fn map_error_status(
    status: StatusCode,
    retry_after: Option<u64>,
    room_id: &str,
    body: &str,
) -> BridgeError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => BridgeError::RateLimited {
            platform: Platform::Chatwork,
            retry_after: Some(retry_after.unwrap_or(DEFAULT_RETRY_AFTER_SECS)),
        },
        StatusCode::UNAUTHORIZED => BridgeError::Authentication {
            platform: Platform::Chatwork,
            message: "api token rejected".to_string(),
        },
        StatusCode::NOT_FOUND => BridgeError::NotFound {
            platform: Platform::Chatwork,
            message: format!("room {room_id}"),
        },
        status if status.is_client_error() => BridgeError::BadRequest {
            platform: Platform::Chatwork,
            message: body.to_string(),
        },
        status => BridgeError::Server {
            platform: Platform::Chatwork,
            message: status.to_string(),
        },
    }
}

/// Chatwork returns `message_id` as a JSON number or string depending on
/// the endpoint version.
fn message_id_from_response(payload: &serde_json::Value) -> Option<String> {
    match payload.get("message_id") {
        Some(serde_json::Value::String(s)) => Some(s.clone()),
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

#[async_trait]
impl OutboundClient for ChatworkClient {
    fn platform(&self) -> Platform {
        Platform::Chatwork
    }

    async fn send_message(
        &self,
        conversation_id: &str,
        text: &str,
    ) -> Result<String, BridgeError> {
        let message_id = self.post_message(conversation_id, text).await?;
        debug!(
            "chatwork message sent room_id={} message_id={} body_len={}",
            conversation_id,
            message_id,
            text.len()
        );
        Ok(message_id)
    }
}
