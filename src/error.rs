//! Typed error taxonomy for the bridge. Every error is either retryable
//! (transient: rate limit, network, 5xx, store hiccup) or non-retryable
//! (permanent: auth, bad request, not found, signature mismatch). The
//! backoff controller keys off this classification.

use std::time::Duration;

use thiserror::Error;

use crate::store::{Platform, StoreError};

#[derive(Debug, Error)]
pub enum BridgeError {
    /// The platform rejected the call for pacing reasons. May carry the
    /// wait the platform suggested, which overrides generic backoff.
    #[error("{platform} API rate limit exceeded")]
    RateLimited {
        platform: Platform,
        retry_after: Option<u64>,
    },

    #[error("{platform} authentication failed: {message}")]
    Authentication { platform: Platform, message: String },

    #[error("{platform} rejected the request: {message}")]
    BadRequest { platform: Platform, message: String },

    #[error("resource not found on {platform}: {message}")]
    NotFound { platform: Platform, message: String },

    #[error("{platform} server error: {message}")]
    Server { platform: Platform, message: String },

    #[error("network error talking to {platform}: {message}")]
    Network { platform: Platform, message: String },

    /// Platform API responded with an error the bridge has no specific
    /// mapping for. Treated conservatively as non-retryable.
    #[error("{platform} API error {code}: {message}")]
    Api {
        platform: Platform,
        code: i64,
        message: String,
    },

    #[error("webhook signature verification failed for {0}")]
    SignatureVerification(Platform),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl BridgeError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BridgeError::RateLimited { .. }
                | BridgeError::Server { .. }
                | BridgeError::Network { .. }
                | BridgeError::Store(_)
        )
    }

    /// Platform-suggested wait, when the error carries one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            BridgeError::RateLimited {
                retry_after: Some(seconds),
                ..
            } => Some(Duration::from_secs(*seconds)),
            _ => None,
        }
    }
}
