//! Inbound webhook handlers and health endpoints.
//!
//! Both platforms deliver events over HTTP POST. Handlers authenticate the
//! delivery, filter to new text messages, resolve the sender's display name
//! from the user mapping cache, and hand the message to the sync engine.
//! Skipped events (wrong type, duplicate, loop, unmapped room) are
//! acknowledged with 200 so the platform does not redeliver them.

use salvo::prelude::*;
use secrecy::ExposeSecret;
use serde_json::{Value, json};
use tracing::{debug, error, info, warn};

use crate::bridge::{InboundMessage, SyncOutcome};
use crate::error::BridgeError;
use crate::store::{Platform, StoreManager};
use crate::web::verify::{verify_chatwork_signature, verify_lark_token};
use crate::web::web_state;

const CHATWORK_SIGNATURE_HEADER: &str = "x-chatworkwebhooksignature";

fn render_error(res: &mut Response, status: StatusCode, message: &str) {
    res.status_code(status);
    res.render(Json(json!({ "error": message })));
}

#[handler]
pub async fn index(res: &mut Response) {
    res.render(Json(json!({
        "service": "chatwork-lark-bridge",
        "version": env!("CARGO_PKG_VERSION"),
    })));
}

#[handler]
pub async fn health_check(res: &mut Response) {
    let state = web_state();
    let redis_ok = state.store.health_check().await;
    let status = if redis_ok { "healthy" } else { "degraded" };
    res.render(Json(json!({
        "status": status,
        "redis": redis_ok,
        "uptime_seconds": state.started_at.elapsed().as_secs(),
    })));
}

#[handler]
pub async fn health_live(res: &mut Response) {
    res.render(Json(json!({ "status": "alive" })));
}

#[handler]
pub async fn health_ready(res: &mut Response) {
    if web_state().store.health_check().await {
        res.render(Json(json!({ "status": "ready" })));
    } else {
        render_error(res, StatusCode::SERVICE_UNAVAILABLE, "store unavailable");
    }
}

#[handler]
pub async fn list_failed_messages(req: &mut Request, res: &mut Response) {
    let limit = req.query::<usize>("limit").unwrap_or(50).clamp(1, 500);
    match web_state().store.failed_messages(limit).await {
        Ok(entries) => {
            let failed: Vec<Value> = entries
                .into_iter()
                .map(|(key, message)| json!({ "key": key, "message": message }))
                .collect();
            res.render(Json(json!({ "count": failed.len(), "failed": failed })));
        }
        Err(err) => {
            render_error(
                res,
                StatusCode::INTERNAL_SERVER_ERROR,
                &format!("store error: {}", err),
            );
        }
    }
}

#[handler]
pub async fn chatwork_webhook(req: &mut Request, res: &mut Response) {
    let state = web_state();

    let body = match req.payload().await {
        Ok(body) => body.to_vec(),
        Err(err) => {
            render_error(
                res,
                StatusCode::BAD_REQUEST,
                &format!("unreadable body: {}", err),
            );
            return;
        }
    };

    let signature = req
        .header::<String>(CHATWORK_SIGNATURE_HEADER)
        .unwrap_or_default();
    let secret = state.config.chatwork.webhook_secret.expose_secret();
    if !verify_chatwork_signature(secret, &body, &signature) {
        let err = BridgeError::SignatureVerification(Platform::Chatwork);
        warn!("chatwork webhook rejected error={}", err);
        render_error(res, StatusCode::FORBIDDEN, "invalid signature");
        return;
    }

    let payload: Value = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(err) => {
            render_error(res, StatusCode::BAD_REQUEST, &format!("invalid json: {}", err));
            return;
        }
    };

    let Some(event) = parse_chatwork_event(&payload) else {
        debug!(
            "chatwork event ignored event_type={}",
            payload
                .get("webhook_event_type")
                .and_then(serde_json::Value::as_str)
                .unwrap_or("unknown")
        );
        res.render(Json(json!({ "status": "ignored", "reason": "unsupported event" })));
        return;
    };

    let sender_name = resolve_sender_name(&state.store, Platform::Chatwork, &event.sender_id).await;
    let inbound = InboundMessage {
        source_platform: Platform::Chatwork,
        conversation_id: event.conversation_id,
        message_id: event.message_id,
        sender_name,
        body: event.body,
    };

    dispatch(&inbound, res).await;
}

#[handler]
pub async fn lark_webhook(req: &mut Request, res: &mut Response) {
    let state = web_state();

    let payload: Value = match req.parse_json().await {
        Ok(payload) => payload,
        Err(err) => {
            render_error(res, StatusCode::BAD_REQUEST, &format!("invalid json: {}", err));
            return;
        }
    };

    let expected_token = state.config.lark.verification_token.expose_secret();

    // Endpoint registration handshake: echo the challenge back.
    if payload.get("type").and_then(Value::as_str) == Some("url_verification") {
        let token = payload.get("token").and_then(Value::as_str).unwrap_or("");
        if !verify_lark_token(expected_token, token) {
            render_error(res, StatusCode::FORBIDDEN, "invalid verification token");
            return;
        }
        let challenge = payload.get("challenge").and_then(Value::as_str).unwrap_or("");
        info!("lark url verification handshake completed");
        res.render(Json(json!({ "challenge": challenge })));
        return;
    }

    let token = payload
        .pointer("/header/token")
        .and_then(Value::as_str)
        .unwrap_or("");
    if !verify_lark_token(expected_token, token) {
        let err = BridgeError::SignatureVerification(Platform::Lark);
        warn!("lark webhook rejected error={}", err);
        render_error(res, StatusCode::FORBIDDEN, "invalid verification token");
        return;
    }

    let Some(event) = parse_lark_event(&payload) else {
        debug!(
            "lark event ignored event_type={}",
            payload
                .pointer("/header/event_type")
                .and_then(serde_json::Value::as_str)
                .unwrap_or("unknown")
        );
        res.render(Json(json!({ "status": "ignored", "reason": "unsupported event" })));
        return;
    };

    let sender_name = resolve_sender_name(&state.store, Platform::Lark, &event.sender_id).await;
    let inbound = InboundMessage {
        source_platform: Platform::Lark,
        conversation_id: event.conversation_id,
        message_id: event.message_id,
        sender_name,
        body: event.body,
    };

    dispatch(&inbound, res).await;
}

async fn dispatch(inbound: &InboundMessage, res: &mut Response) {
    match web_state().engine.process_inbound(inbound).await {
        Ok(SyncOutcome::Forwarded(target_message_id)) => {
            res.render(Json(json!({
                "status": "forwarded",
                "target_message_id": target_message_id,
            })));
        }
        Ok(SyncOutcome::Duplicate) => {
            res.render(Json(json!({ "status": "duplicate" })));
        }
        Ok(SyncOutcome::LoopDetected) => {
            res.render(Json(json!({ "status": "skipped", "reason": "loop detected" })));
        }
        Ok(SyncOutcome::Unmapped) => {
            res.render(Json(json!({ "status": "ignored", "reason": "no room mapping" })));
        }
        Err(err) => {
            error!(
                "message processing failed source={} message_id={} error={}",
                inbound.source_platform, inbound.message_id, err
            );
            render_error(
                res,
                StatusCode::INTERNAL_SERVER_ERROR,
                &format!("processing failed: {}", err),
            );
        }
    }
}

/// Display name for the sender, falling back to `User {id}`. Mapping
/// lookups never block forwarding, so store errors only cost the name.
async fn resolve_sender_name(store: &StoreManager, platform: Platform, sender_id: &str) -> String {
    match store.get_user_mapping(platform, sender_id).await {
        Ok(Some(record)) => record.name,
        Ok(None) => format!("User {}", sender_id),
        Err(err) => {
            warn!(
                "user mapping lookup failed platform={} user_id={} error={}",
                platform, sender_id, err
            );
            format!("User {}", sender_id)
        }
    }
}

struct ParsedEvent {
    conversation_id: String,
    message_id: String,
    sender_id: String,
    body: String,
}

/// Chatwork sends room and account ids as JSON numbers.
fn json_string(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn parse_chatwork_event(payload: &Value) -> Option<ParsedEvent> {
    if payload.get("webhook_event_type").and_then(Value::as_str) != Some("message_created") {
        return None;
    }
    let event = payload.get("webhook_event")?;
    Some(ParsedEvent {
        conversation_id: json_string(event.get("room_id"))?,
        message_id: json_string(event.get("message_id"))?,
        sender_id: json_string(event.get("account_id"))?,
        body: event.get("body")?.as_str()?.to_string(),
    })
}

fn parse_lark_event(payload: &Value) -> Option<ParsedEvent> {
    if payload.pointer("/header/event_type").and_then(Value::as_str)
        != Some("im.message.receive_v1")
    {
        return None;
    }
    let message = payload.pointer("/event/message")?;
    if message.get("message_type").and_then(Value::as_str) != Some("text") {
        return None;
    }
    // content is a JSON string holding the serialized {"text": ...} object;
    // fall back to the raw string when it is not.
    let raw_content = message.get("content")?.as_str()?;
    let body = serde_json::from_str::<Value>(raw_content)
        .ok()
        .and_then(|content| {
            content
                .get("text")
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| raw_content.to_string());
    Some(ParsedEvent {
        conversation_id: message.get("chat_id")?.as_str()?.to_string(),
        message_id: message.get("message_id")?.as_str()?.to_string(),
        sender_id: payload
            .pointer("/event/sender/sender_id/open_id")?
            .as_str()?
            .to_string(),
        body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chatwork_message_created_is_parsed() {
        let payload = json!({
            "webhook_setting_id": "12345",
            "webhook_event_type": "message_created",
            "webhook_event_time": 1709251200,
            "webhook_event": {
                "message_id": "1795231066542080000",
                "room_id": 12345678,
                "account_id": 1234567,
                "body": "Hello from Chatwork",
                "send_time": 1709251200
            }
        });

        let event = parse_chatwork_event(&payload).unwrap();
        assert_eq!(event.conversation_id, "12345678");
        assert_eq!(event.message_id, "1795231066542080000");
        assert_eq!(event.sender_id, "1234567");
        assert_eq!(event.body, "Hello from Chatwork");
    }

    #[test]
    fn chatwork_other_event_types_are_skipped() {
        let payload = json!({
            "webhook_event_type": "message_updated",
            "webhook_event": { "message_id": "1", "room_id": 2, "account_id": 3, "body": "x" }
        });
        assert!(parse_chatwork_event(&payload).is_none());
    }

    #[test]
    fn lark_text_message_is_parsed() {
        let payload = json!({
            "schema": "2.0",
            "header": {
                "event_id": "evt_1",
                "token": "v_token",
                "event_type": "im.message.receive_v1"
            },
            "event": {
                "sender": { "sender_id": { "open_id": "ou_abc" } },
                "message": {
                    "message_id": "om_xyz",
                    "chat_id": "oc_chat1",
                    "message_type": "text",
                    "content": "{\"text\":\"Hello from Lark\"}"
                }
            }
        });

        let event = parse_lark_event(&payload).unwrap();
        assert_eq!(event.conversation_id, "oc_chat1");
        assert_eq!(event.message_id, "om_xyz");
        assert_eq!(event.sender_id, "ou_abc");
        assert_eq!(event.body, "Hello from Lark");
    }

    #[test]
    fn lark_non_json_content_is_used_verbatim() {
        let payload = json!({
            "header": { "event_type": "im.message.receive_v1" },
            "event": {
                "sender": { "sender_id": { "open_id": "ou_abc" } },
                "message": {
                    "message_id": "om_raw",
                    "chat_id": "oc_chat1",
                    "message_type": "text",
                    "content": "plain, not json"
                }
            }
        });
        let event = parse_lark_event(&payload).unwrap();
        assert_eq!(event.body, "plain, not json");
    }

    #[test]
    fn lark_non_text_messages_are_skipped() {
        let payload = json!({
            "header": { "event_type": "im.message.receive_v1" },
            "event": {
                "sender": { "sender_id": { "open_id": "ou_abc" } },
                "message": {
                    "message_id": "om_img",
                    "chat_id": "oc_chat1",
                    "message_type": "image",
                    "content": "{\"image_key\":\"img_1\"}"
                }
            }
        });
        assert!(parse_lark_event(&payload).is_none());
    }

    #[test]
    fn lark_other_event_types_are_skipped() {
        let payload = json!({
            "header": { "event_type": "im.chat.member.bot.added_v1" },
            "event": {}
        });
        assert!(parse_lark_event(&payload).is_none());
    }

    #[test]
    fn json_string_accepts_numbers_and_strings() {
        assert_eq!(json_string(Some(&json!(42))), Some("42".to_string()));
        assert_eq!(json_string(Some(&json!("42"))), Some("42".to_string()));
        assert_eq!(json_string(Some(&json!(null))), None);
        assert_eq!(json_string(None), None);
    }

    mod sender_names {
        use std::sync::Arc;
        use std::time::Duration;

        use async_trait::async_trait;

        use super::*;
        use crate::store::memory::MemoryStore;
        use crate::store::{KeyValueStore, StoreError, UserMappingRecord};

        fn manager(store: Arc<dyn KeyValueStore>) -> StoreManager {
            StoreManager::new(store, Duration::from_secs(86400), Duration::from_secs(86400))
        }

        /// Store double whose every operation fails.
        struct BrokenStore;

        #[async_trait]
        impl KeyValueStore for BrokenStore {
            async fn get(&self, _key: &str) -> Result<Option<String>, StoreError> {
                Err(StoreError::Connection("refused".to_string()))
            }

            async fn set_with_ttl(
                &self,
                _key: &str,
                _value: &str,
                _ttl: Duration,
            ) -> Result<(), StoreError> {
                Err(StoreError::Connection("refused".to_string()))
            }

            async fn exists(&self, _key: &str) -> Result<bool, StoreError> {
                Err(StoreError::Connection("refused".to_string()))
            }

            async fn incr(&self, _key: &str) -> Result<i64, StoreError> {
                Err(StoreError::Connection("refused".to_string()))
            }

            async fn expire(&self, _key: &str, _ttl: Duration) -> Result<(), StoreError> {
                Err(StoreError::Connection("refused".to_string()))
            }

            async fn scan_keys(
                &self,
                _pattern: &str,
                _limit: usize,
            ) -> Result<Vec<String>, StoreError> {
                Err(StoreError::Connection("refused".to_string()))
            }

            async fn ping(&self) -> Result<(), StoreError> {
                Err(StoreError::Connection("refused".to_string()))
            }
        }

        #[tokio::test]
        async fn mapped_sender_uses_display_name() {
            let store = manager(Arc::new(MemoryStore::new()));
            store
                .set_user_mapping(
                    Platform::Chatwork,
                    "1234567",
                    &UserMappingRecord {
                        name: "Taro Yamada".to_string(),
                        counterpart_user_id: None,
                    },
                )
                .await
                .unwrap();

            let name = resolve_sender_name(&store, Platform::Chatwork, "1234567").await;
            assert_eq!(name, "Taro Yamada");
        }

        #[tokio::test]
        async fn unmapped_sender_falls_back_to_raw_id() {
            let store = manager(Arc::new(MemoryStore::new()));
            let name = resolve_sender_name(&store, Platform::Lark, "ou_unknown").await;
            assert_eq!(name, "User ou_unknown");
        }

        #[tokio::test]
        async fn store_failure_falls_back_to_raw_id() {
            let store = manager(Arc::new(BrokenStore));
            let name = resolve_sender_name(&store, Platform::Chatwork, "1234567").await;
            assert_eq!(name, "User 1234567");
        }
    }
}
