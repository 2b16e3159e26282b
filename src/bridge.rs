//! Synchronization engine: drives one inbound message through
//! dedup -> loop check -> mapping resolve -> format -> send -> record/DLQ.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::config::{MessageConfig, RetryConfig};
use crate::error::BridgeError;
use crate::retry::RetryPolicy;
use crate::store::{FailedMessage, MessageMapping, Platform, StoreManager};

pub mod format;

use self::format::MessageFormatter;

/// A normalized chat message handed to the engine by the webhook transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub source_platform: Platform,
    pub conversation_id: String,
    pub message_id: String,
    pub sender_name: String,
    pub body: String,
}

/// Explicit outcome of one pipeline run. The non-`Forwarded` variants are
/// expected control outcomes, not errors: the transport acknowledges all of
/// them so the origin platform does not redeliver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Sent to the target platform; carries the target message id.
    Forwarded(String),
    /// An idempotency record already exists for this source message.
    Duplicate,
    /// The message carries the bridge's own outbound marker.
    LoopDetected,
    /// No target room is configured for the source conversation.
    Unmapped,
}

/// Outbound side of one platform: send a text message to a conversation and
/// return the created message id, raising a typed [`BridgeError`].
#[async_trait]
pub trait OutboundClient: Send + Sync {
    fn platform(&self) -> Platform;

    async fn send_message(&self, conversation_id: &str, text: &str)
    -> Result<String, BridgeError>;
}

pub struct SyncEngine {
    store: Arc<StoreManager>,
    chatwork: Arc<dyn OutboundClient>,
    lark: Arc<dyn OutboundClient>,
    formatter: MessageFormatter,
    retry: RetryPolicy,
}

impl SyncEngine {
    pub fn new(
        store: Arc<StoreManager>,
        chatwork: Arc<dyn OutboundClient>,
        lark: Arc<dyn OutboundClient>,
        message_config: &MessageConfig,
        retry_config: &RetryConfig,
    ) -> Self {
        Self {
            store,
            chatwork,
            lark,
            formatter: MessageFormatter::new(message_config),
            retry: RetryPolicy::from_config(retry_config),
        }
    }

    fn client_for(&self, platform: Platform) -> &Arc<dyn OutboundClient> {
        match platform {
            Platform::Chatwork => &self.chatwork,
            Platform::Lark => &self.lark,
        }
    }

    /// Process one inbound message. Returns the forward outcome, or an
    /// error when the store is unreachable or the send ultimately failed
    /// (in which case a DLQ record was written first).
    ///
    /// Check order is load-bearing: dedup strictly precedes the loop check,
    /// which strictly precedes mapping resolution, so a redelivered looped
    /// or unmapped message short-circuits without re-logging the rejection.
    pub async fn process_inbound(
        &self,
        inbound: &InboundMessage,
    ) -> Result<SyncOutcome, BridgeError> {
        let source = inbound.source_platform;
        let target = source.other();

        info!(
            "processing inbound message platform={} conversation={} message_id={} sender={}",
            source, inbound.conversation_id, inbound.message_id, inbound.sender_name
        );

        if self
            .store
            .is_message_processed(source, &inbound.message_id)
            .await?
        {
            debug!(
                "message already processed platform={} message_id={}",
                source, inbound.message_id
            );
            return Ok(SyncOutcome::Duplicate);
        }

        if self.formatter.originated_from_bridge(&inbound.body, target) {
            info!(
                "loop detected, skipping platform={} message_id={} marker_platform={}",
                source, inbound.message_id, target
            );
            return Ok(SyncOutcome::LoopDetected);
        }

        let Some(target_conversation) = self
            .store
            .get_room_mapping(source, &inbound.conversation_id)
            .await?
        else {
            warn!(
                "room mapping not found platform={} conversation={}",
                source, inbound.conversation_id
            );
            return Ok(SyncOutcome::Unmapped);
        };

        let formatted = self
            .formatter
            .format_forward(source, &inbound.sender_name, &inbound.body);

        let client = self.client_for(target);
        let send_result = self
            .retry
            .execute(|| {
                let client = Arc::clone(client);
                let conversation = target_conversation.clone();
                let text = formatted.clone();
                async move { client.send_message(&conversation, &text).await }
            })
            .await;

        match send_result {
            Ok(target_message_id) => {
                // Written only after the send fully succeeded; no partial
                // record is ever persisted.
                self.store
                    .save_message_mapping(&MessageMapping {
                        source_platform: source,
                        source_message_id: inbound.message_id.clone(),
                        target_platform: target,
                        target_message_id: target_message_id.clone(),
                        room_mapping_id: Some(room_mapping_id(
                            source,
                            &inbound.conversation_id,
                            &target_conversation,
                        )),
                        timestamp: Utc::now(),
                    })
                    .await?;

                info!(
                    "message synced source={} target={} source_message_id={} target_message_id={}",
                    source, target, inbound.message_id, target_message_id
                );
                Ok(SyncOutcome::Forwarded(target_message_id))
            }
            Err(err) => {
                let failed = FailedMessage {
                    source_platform: source,
                    target_platform: target,
                    message: serde_json::to_value(inbound).unwrap_or(serde_json::Value::Null),
                    error: err.to_string(),
                    retry_count: if err.is_retryable() {
                        self.retry.max_attempts
                    } else {
                        1
                    },
                    failed_at: Utc::now(),
                };
                if let Err(dlq_err) = self.store.record_failure(&inbound.message_id, &failed).await
                {
                    // DLQ write failure must not mask the send failure, but
                    // it has to stay observable.
                    error!(
                        "failed to record dead letter platform={} message_id={} error={}",
                        source, inbound.message_id, dlq_err
                    );
                }
                Err(err)
            }
        }
    }
}

/// Stable identifier of the room pair a forward used, stored on the
/// idempotency record: `cw_{room}_lark_{chat}` or `lark_{chat}_cw_{room}`.
fn room_mapping_id(source: Platform, source_room: &str, target_room: &str) -> String {
    match source {
        Platform::Chatwork => format!("cw_{}_lark_{}", source_room, target_room),
        Platform::Lark => format!("lark_{}_cw_{}", source_room, target_room),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use parking_lot::Mutex;

    use super::*;
    use crate::store::memory::MemoryStore;

    struct MockClient {
        platform: Platform,
        responses: Mutex<VecDeque<Result<String, BridgeError>>>,
        calls: AtomicU32,
        sent: Mutex<Vec<(String, String)>>,
    }

    impl MockClient {
        fn new(platform: Platform) -> Arc<Self> {
            Arc::new(Self {
                platform,
                responses: Mutex::new(VecDeque::new()),
                calls: AtomicU32::new(0),
                sent: Mutex::new(Vec::new()),
            })
        }

        fn respond_with(self: &Arc<Self>, response: Result<String, BridgeError>) {
            self.responses.lock().push_back(response);
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl OutboundClient for MockClient {
        fn platform(&self) -> Platform {
            self.platform
        }

        async fn send_message(
            &self,
            conversation_id: &str,
            text: &str,
        ) -> Result<String, BridgeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.sent
                .lock()
                .push((conversation_id.to_string(), text.to_string()));
            self.responses
                .lock()
                .pop_front()
                .unwrap_or_else(|| Ok("om_default".to_string()))
        }
    }

    struct Fixture {
        store: Arc<StoreManager>,
        chatwork: Arc<MockClient>,
        lark: Arc<MockClient>,
        engine: SyncEngine,
    }

    fn fixture() -> Fixture {
        fixture_with(MessageConfig::default(), RetryConfig::default())
    }

    fn fixture_with(message: MessageConfig, retry: RetryConfig) -> Fixture {
        let store = Arc::new(StoreManager::new(
            Arc::new(MemoryStore::new()),
            Duration::from_secs(86400),
            Duration::from_secs(86400),
        ));
        let chatwork = MockClient::new(Platform::Chatwork);
        let lark = MockClient::new(Platform::Lark);
        let engine = SyncEngine::new(
            store.clone(),
            chatwork.clone(),
            lark.clone(),
            &message,
            &retry,
        );
        Fixture {
            store,
            chatwork,
            lark,
            engine,
        }
    }

    fn chatwork_message(body: &str) -> InboundMessage {
        InboundMessage {
            source_platform: Platform::Chatwork,
            conversation_id: "12345678".to_string(),
            message_id: "m1".to_string(),
            sender_name: "Taro".to_string(),
            body: body.to_string(),
        }
    }

    async fn map_room(fixture: &Fixture) {
        fixture
            .store
            .set_room_mapping(Platform::Chatwork, "12345678", "oc_test")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn forwards_and_records_idempotency() {
        let fixture = fixture();
        map_room(&fixture).await;
        fixture.lark.respond_with(Ok("om_test123".to_string()));

        let outcome = fixture
            .engine
            .process_inbound(&chatwork_message("Hello"))
            .await
            .unwrap();

        assert_eq!(outcome, SyncOutcome::Forwarded("om_test123".to_string()));
        assert_eq!(fixture.lark.calls(), 1);
        assert_eq!(fixture.chatwork.calls(), 0);

        let sent = fixture.lark.sent.lock();
        assert_eq!(sent[0].0, "oc_test");
        assert_eq!(sent[0].1, "[From Chatwork] Taro:\nHello");
        drop(sent);

        let mapping = fixture
            .store
            .get_message_mapping(Platform::Chatwork, "m1")
            .await
            .unwrap()
            .expect("idempotency record should exist");
        assert_eq!(mapping.target_platform, Platform::Lark);
        assert_eq!(mapping.target_message_id, "om_test123");
        assert_eq!(
            mapping.room_mapping_id.as_deref(),
            Some("cw_12345678_lark_oc_test")
        );
    }

    #[tokio::test]
    async fn lark_messages_flow_to_chatwork() {
        let fixture = fixture();
        fixture
            .store
            .set_room_mapping(Platform::Lark, "oc_test", "12345678")
            .await
            .unwrap();
        fixture.chatwork.respond_with(Ok("777".to_string()));

        let inbound = InboundMessage {
            source_platform: Platform::Lark,
            conversation_id: "oc_test".to_string(),
            message_id: "om_1".to_string(),
            sender_name: "Bob".to_string(),
            body: "Hi".to_string(),
        };
        let outcome = fixture.engine.process_inbound(&inbound).await.unwrap();

        assert_eq!(outcome, SyncOutcome::Forwarded("777".to_string()));
        assert_eq!(fixture.chatwork.calls(), 1);
        assert_eq!(fixture.lark.calls(), 0);
        let sent = fixture.chatwork.sent.lock();
        assert_eq!(sent[0].1, "[From Lark] Bob:\nHi");
    }

    #[tokio::test]
    async fn redelivery_is_a_no_op() {
        let fixture = fixture();
        map_room(&fixture).await;
        fixture.lark.respond_with(Ok("om_test123".to_string()));

        let message = chatwork_message("Hello");
        fixture.engine.process_inbound(&message).await.unwrap();
        let outcome = fixture.engine.process_inbound(&message).await.unwrap();

        assert_eq!(outcome, SyncOutcome::Duplicate);
        assert_eq!(fixture.lark.calls(), 1);
    }

    #[tokio::test]
    async fn looped_message_never_sends() {
        let fixture = fixture();
        map_room(&fixture).await;

        let outcome = fixture
            .engine
            .process_inbound(&chatwork_message("[From Lark] Bob: Hello"))
            .await
            .unwrap();

        assert_eq!(outcome, SyncOutcome::LoopDetected);
        assert_eq!(fixture.lark.calls(), 0);
        // No idempotency record either: a loop rejection is not a forward.
        assert!(
            !fixture
                .store
                .is_message_processed(Platform::Chatwork, "m1")
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn dedup_shortcircuits_before_loop_check() {
        let fixture = fixture();
        map_room(&fixture).await;
        fixture
            .store
            .save_message_mapping(&MessageMapping {
                source_platform: Platform::Chatwork,
                source_message_id: "m1".to_string(),
                target_platform: Platform::Lark,
                target_message_id: "om_prev".to_string(),
                room_mapping_id: None,
                timestamp: Utc::now(),
            })
            .await
            .unwrap();

        // Looped body, but the idempotency record wins.
        let outcome = fixture
            .engine
            .process_inbound(&chatwork_message("[From Lark] Bob: Hello"))
            .await
            .unwrap();
        assert_eq!(outcome, SyncOutcome::Duplicate);
    }

    #[tokio::test]
    async fn unmapped_room_skips_without_dlq() {
        let fixture = fixture();

        let outcome = fixture
            .engine
            .process_inbound(&chatwork_message("Hello"))
            .await
            .unwrap();

        assert_eq!(outcome, SyncOutcome::Unmapped);
        assert_eq!(fixture.lark.calls(), 0);
        assert!(fixture.store.failed_messages(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn non_retryable_send_failure_reaches_dlq() {
        let fixture = fixture();
        map_room(&fixture).await;
        fixture.lark.respond_with(Err(BridgeError::BadRequest {
            platform: Platform::Lark,
            message: "invalid receive_id".to_string(),
        }));

        let result = fixture
            .engine
            .process_inbound(&chatwork_message("Hello"))
            .await;

        assert!(matches!(result, Err(BridgeError::BadRequest { .. })));
        assert_eq!(fixture.lark.calls(), 1);

        let entries = fixture.store.failed_messages(10).await.unwrap();
        assert_eq!(entries.len(), 1);
        let (_, failed) = &entries[0];
        assert_eq!(failed.retry_count, 1);
        assert_eq!(failed.source_platform, Platform::Chatwork);
        assert_eq!(failed.message["message_id"], "m1");
        assert_eq!(failed.message["body"], "Hello");

        // No idempotency record: the forward never completed.
        assert!(
            !fixture
                .store
                .is_message_processed(Platform::Chatwork, "m1")
                .await
                .unwrap()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn retryable_exhaustion_writes_one_dlq_entry() {
        let fixture = fixture_with(
            MessageConfig::default(),
            RetryConfig {
                max_attempts: 3,
                min_wait_seconds: 1,
                max_wait_seconds: 4,
            },
        );
        map_room(&fixture).await;
        for _ in 0..3 {
            fixture.lark.respond_with(Err(BridgeError::Server {
                platform: Platform::Lark,
                message: "503".to_string(),
            }));
        }

        let result = fixture
            .engine
            .process_inbound(&chatwork_message("Hello"))
            .await;

        assert!(matches!(result, Err(BridgeError::Server { .. })));
        assert_eq!(fixture.lark.calls(), 3);

        let entries = fixture.store.failed_messages(10).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].1.retry_count, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_then_success_forwards_once() {
        let fixture = fixture();
        map_room(&fixture).await;
        fixture.lark.respond_with(Err(BridgeError::RateLimited {
            platform: Platform::Lark,
            retry_after: Some(5),
        }));
        fixture.lark.respond_with(Ok("om_after_wait".to_string()));

        let started = tokio::time::Instant::now();
        let outcome = fixture
            .engine
            .process_inbound(&chatwork_message("Hello"))
            .await
            .unwrap();

        assert_eq!(outcome, SyncOutcome::Forwarded("om_after_wait".to_string()));
        assert_eq!(fixture.lark.calls(), 2);
        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(5), "waited {waited:?}");
        assert!(fixture.store.failed_messages(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn oversized_body_is_truncated_before_send() {
        let fixture = fixture_with(
            MessageConfig {
                max_length: 200,
                ..MessageConfig::default()
            },
            RetryConfig::default(),
        );
        map_room(&fixture).await;
        fixture.lark.respond_with(Ok("om_1".to_string()));

        fixture
            .engine
            .process_inbound(&chatwork_message(&"x".repeat(1000)))
            .await
            .unwrap();

        let sent = fixture.lark.sent.lock();
        assert!(sent[0].1.ends_with(format::TRUNCATION_NOTICE));
        let kept = sent[0].1.strip_suffix(format::TRUNCATION_NOTICE).unwrap();
        assert_eq!(kept.chars().count(), 100);
    }

    #[test]
    fn room_mapping_id_orders_by_source() {
        assert_eq!(
            room_mapping_id(Platform::Chatwork, "1", "oc_a"),
            "cw_1_lark_oc_a"
        );
        assert_eq!(
            room_mapping_id(Platform::Lark, "oc_a", "1"),
            "lark_oc_a_cw_1"
        );
    }
}
