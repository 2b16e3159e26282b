//! Lark (Feishu) API client: tenant access token management and outbound
//! message delivery. Lark reports failures through an in-body `code` field
//! rather than HTTP status, so errors are mapped from that code space.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use secrecy::ExposeSecret;
use serde::Deserialize;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::bridge::OutboundClient;
use crate::config::LarkConfig;
use crate::error::BridgeError;
use crate::store::Platform;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Refresh the cached token this long before Lark's reported expiry.
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(300);

const CODE_RATE_LIMITED: i64 = 99991663;
const CODE_APP_TICKET_INVALID: i64 = 99991661;
const CODE_ACCESS_TOKEN_INVALID: i64 = 99991662;
const RATE_LIMIT_RETRY_AFTER_SECS: u64 = 60;

struct CachedToken {
    value: String,
    expires_at: Instant,
}

pub struct LarkClient {
    http: reqwest::Client,
    base_url: String,
    app_id: String,
    app_secret: secrecy::SecretString,
    token: Mutex<Option<CachedToken>>,
}

#[derive(Deserialize)]
struct TokenResponse {
    code: i64,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    tenant_access_token: String,
    #[serde(default)]
    expire: u64,
}

#[derive(Deserialize)]
struct SendResponse {
    code: i64,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    data: Option<SendData>,
}

#[derive(Deserialize)]
struct SendData {
    message_id: String,
}

impl LarkClient {
    pub fn new(config: &LarkConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("failed to build lark http client")?;

        info!("lark client initialized app_id={}", config.app_id);
        Ok(Self {
            http,
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
            app_id: config.app_id.clone(),
            app_secret: config.app_secret.clone(),
            token: Mutex::new(None),
        })
    }

    /// Cached tenant access token, refreshed when missing or near expiry.
    async fn tenant_access_token(&self) -> Result<String, BridgeError> {
        {
            let cached = self.token.lock();
            if let Some(token) = cached.as_ref() {
                if Instant::now() < token.expires_at {
                    return Ok(token.value.clone());
                }
            }
        }

        let url = format!("{}/auth/v3/tenant_access_token/internal", self.base_url);
        let response = self
            .http
            .post(&url)
            .json(&serde_json::json!({
                "app_id": self.app_id,
                "app_secret": self.app_secret.expose_secret(),
            }))
            .send()
            .await
            .map_err(network_error)?;

        let body: TokenResponse = response.json().await.map_err(network_error)?;
        if body.code != 0 {
            return Err(map_error_code(body.code, &body.msg));
        }

        let ttl = Duration::from_secs(body.expire).saturating_sub(TOKEN_EXPIRY_MARGIN);
        debug!("lark tenant token refreshed expire_secs={}", body.expire);
        let mut cached = self.token.lock();
        *cached = Some(CachedToken {
            value: body.tenant_access_token.clone(),
            expires_at: Instant::now() + ttl,
        });
        Ok(body.tenant_access_token)
    }

    async fn post_message(&self, chat_id: &str, text: &str) -> Result<String, BridgeError> {
        let token = self.tenant_access_token().await?;
        let url = format!(
            "{}/im/v1/messages?receive_id_type=chat_id",
            self.base_url
        );
        // msg_type "text" requires content to be a JSON string holding
        // the serialized {"text": ...} object.
        let content = serde_json::json!({ "text": text }).to_string();
        let response = self
            .http
            .post(&url)
            .bearer_auth(&token)
            .json(&serde_json::json!({
                "receive_id": chat_id,
                "msg_type": "text",
                "content": content,
            }))
            .send()
            .await
            .map_err(network_error)?;

        let body: SendResponse = response.json().await.map_err(network_error)?;
        if body.code != 0 {
            // A stale token fails with an auth code; drop the cache so the
            // next attempt fetches a fresh one.
            if body.code == CODE_ACCESS_TOKEN_INVALID {
                *self.token.lock() = None;
            }
            return Err(map_error_code(body.code, &body.msg));
        }

        body.data.map(|d| d.message_id).ok_or_else(|| BridgeError::Api {
            platform: Platform::Lark,
            code: 0,
            message: "response is missing message_id".to_string(),
        })
    }
}

fn network_error(err: reqwest::Error) -> BridgeError {
    BridgeError::Network {
        platform: Platform::Lark,
        message: err.to_string(),
    }
}

fn map_error_code(code: i64, msg: &str) -> BridgeError {
    match code {
        CODE_RATE_LIMITED => BridgeError::RateLimited {
            platform: Platform::Lark,
            retry_after: Some(RATE_LIMIT_RETRY_AFTER_SECS),
        },
        CODE_APP_TICKET_INVALID | CODE_ACCESS_TOKEN_INVALID => BridgeError::Authentication {
            platform: Platform::Lark,
            message: msg.to_string(),
        },
        99991000..99992000 => BridgeError::BadRequest {
            platform: Platform::Lark,
            message: format!("code {code}: {msg}"),
        },
        code if code >= 99992000 => BridgeError::Server {
            platform: Platform::Lark,
            message: format!("code {code}: {msg}"),
        },
        code => BridgeError::Api {
            platform: Platform::Lark,
            code,
            message: msg.to_string(),
        },
    }
}

#[async_trait]
impl OutboundClient for LarkClient {
    fn platform(&self) -> Platform {
        Platform::Lark
    }

    async fn send_message(
        &self,
        conversation_id: &str,
        text: &str,
    ) -> Result<String, BridgeError> {
        let message_id = self.post_message(conversation_id, text).await?;
        debug!(
            "lark message sent chat_id={} message_id={} body_len={}",
            conversation_id,
            message_id,
            text.len()
        );
        Ok(message_id)
    }
}
