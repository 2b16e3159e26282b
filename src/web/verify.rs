//! Webhook authentication.
//!
//! Chatwork signs each delivery with HMAC-SHA256 over the raw body, keyed
//! by the base64-decoded webhook secret, and sends the base64 digest in a
//! header. Lark instead echoes a verification token inside the event
//! payload. Both checks are constant-time.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Verify a Chatwork webhook signature against the raw request body.
/// Returns false on any decode failure; an unverifiable request is an
/// unauthenticated request.
pub fn verify_chatwork_signature(secret_b64: &str, body: &[u8], signature_b64: &str) -> bool {
    let Ok(secret) = BASE64.decode(secret_b64) else {
        return false;
    };
    let Ok(signature) = BASE64.decode(signature_b64) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(&secret) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&signature).is_ok()
}

/// Constant-time comparison of the Lark verification token.
pub fn verify_lark_token(expected: &str, provided: &str) -> bool {
    let expected = expected.as_bytes();
    let provided = provided.as_bytes();
    if expected.len() != provided.len() {
        return false;
    }
    expected.ct_eq(provided).into()
}
