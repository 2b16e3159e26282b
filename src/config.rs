use std::path::Path;

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    pub chatwork: ChatworkConfig,
    pub lark: LarkConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub message: MessageConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatworkConfig {
    pub api_token: SecretString,
    /// Base64-encoded webhook signing secret from the Chatwork console.
    pub webhook_secret: SecretString,
    #[serde(default = "default_chatwork_api_base_url")]
    pub api_base_url: String,
    #[serde(default = "default_chatwork_rate_limit_requests")]
    pub rate_limit_requests: i64,
    #[serde(default = "default_chatwork_rate_limit_window")]
    pub rate_limit_window_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LarkConfig {
    pub app_id: String,
    pub app_secret: SecretString,
    pub verification_token: SecretString,
    #[serde(default = "default_lark_api_base_url")]
    pub api_base_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_url")]
    pub url: String,
    #[serde(default)]
    pub password: Option<SecretString>,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            password: None,
        }
    }
}

impl RedisConfig {
    /// Connection URL with the optional password spliced in.
    pub fn connection_url(&self) -> Result<String, ConfigError> {
        let Some(password) = &self.password else {
            return Ok(self.url.clone());
        };
        let mut url = Url::parse(&self.url)
            .map_err(|e| ConfigError::InvalidConfig(format!("redis.url is not a url: {e}")))?;
        url.set_password(Some(password.expose_secret()))
            .map_err(|_| ConfigError::InvalidConfig("redis.url cannot carry a password".into()))?;
        Ok(url.into())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessageConfig {
    #[serde(default = "default_max_message_length")]
    pub max_length: usize,
    #[serde(default = "default_message_ttl")]
    pub ttl_seconds: u64,
    #[serde(default = "default_mapping_ttl")]
    pub mapping_ttl_seconds: u64,
    #[serde(default = "default_true")]
    pub enable_loop_detection: bool,
    #[serde(default = "default_prefix_chatwork")]
    pub prefix_chatwork: String,
    #[serde(default = "default_prefix_lark")]
    pub prefix_lark: String,
    /// Directory holding room_mappings.json / user_mappings.json.
    #[serde(default = "default_mapping_dir")]
    pub mapping_dir: String,
    #[serde(default = "default_mapping_refresh")]
    pub mapping_refresh_seconds: u64,
}

impl Default for MessageConfig {
    fn default() -> Self {
        Self {
            max_length: default_max_message_length(),
            ttl_seconds: default_message_ttl(),
            mapping_ttl_seconds: default_mapping_ttl(),
            enable_loop_detection: true,
            prefix_chatwork: default_prefix_chatwork(),
            prefix_lark: default_prefix_lark(),
            mapping_dir: default_mapping_dir(),
            mapping_refresh_seconds: default_mapping_refresh(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retry_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_min_wait")]
    pub min_wait_seconds: u64,
    #[serde(default = "default_retry_max_wait")]
    pub max_wait_seconds: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_retry_attempts(),
            min_wait_seconds: default_retry_min_wait(),
            max_wait_seconds: default_retry_max_wait(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// "pretty" or "json".
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Config {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let mut config: Config = serde_yaml::from_str(&content)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.port == 0 {
            return Err(ConfigError::InvalidConfig(
                "server.port must be between 1 and 65535".to_string(),
            ));
        }
        if self.chatwork.api_token.expose_secret().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "chatwork.api_token cannot be empty".to_string(),
            ));
        }
        if self.lark.app_id.is_empty() {
            return Err(ConfigError::InvalidConfig(
                "lark.app_id cannot be empty".to_string(),
            ));
        }
        // Truncation keeps max_length - 100 characters of content, so the
        // limit must leave room for the reserve.
        if self.message.max_length <= 100 {
            return Err(ConfigError::InvalidConfig(
                "message.max_length must be greater than 100".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::InvalidConfig(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(value) = std::env::var("CHATWORK_API_TOKEN") {
            self.chatwork.api_token = value.into();
        }
        if let Ok(value) = std::env::var("CHATWORK_WEBHOOK_SECRET") {
            self.chatwork.webhook_secret = value.into();
        }
        if let Ok(value) = std::env::var("LARK_APP_SECRET") {
            self.lark.app_secret = value.into();
        }
        if let Ok(value) = std::env::var("LARK_VERIFICATION_TOKEN") {
            self.lark.verification_token = value.into();
        }
        if let Ok(value) = std::env::var("REDIS_URL") {
            self.redis.url = value;
        }
        if let Ok(value) = std::env::var("REDIS_PASSWORD") {
            self.redis.password = Some(value.into());
        }
    }
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_chatwork_api_base_url() -> String {
    "https://api.chatwork.com/v2".to_string()
}

fn default_chatwork_rate_limit_requests() -> i64 {
    10
}

fn default_chatwork_rate_limit_window() -> u64 {
    10
}

fn default_lark_api_base_url() -> String {
    "https://open.larksuite.com/open-apis".to_string()
}

fn default_redis_url() -> String {
    "redis://localhost:6379/0".to_string()
}

fn default_max_message_length() -> usize {
    4000
}

fn default_message_ttl() -> u64 {
    86400
}

fn default_mapping_ttl() -> u64 {
    86400
}

fn default_true() -> bool {
    true
}

fn default_prefix_chatwork() -> String {
    "[From Chatwork]".to_string()
}

fn default_prefix_lark() -> String {
    "[From Lark]".to_string()
}

fn default_mapping_dir() -> String {
    "config".to_string()
}

fn default_mapping_refresh() -> u64 {
    300
}

fn default_max_retry_attempts() -> u32 {
    5
}

fn default_retry_min_wait() -> u64 {
    2
}

fn default_retry_max_wait() -> u64 {
    60
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}
