//! Message pipeline coordinating optimistic display, transport sends and acknowledgments.

use super::{PipelineError, Result, SendReceipt};
use crate::config::EngineConfig;
use crate::state::AppState;
use crate::transport::{OutgoingMessage, Transport, TransportError};
use chatsync_messaging::{Message, MessageStatus, MessageUpdate};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Configuration for the message pipeline.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub send_timeout: Duration,
    pub max_attempts: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            send_timeout: Duration::from_secs(10),
            max_attempts: 3,
        }
    }
}

impl From<&EngineConfig> for PipelineConfig {
    fn from(config: &EngineConfig) -> Self {
        Self {
            send_timeout: config.send_timeout,
            max_attempts: config.max_send_attempts,
        }
    }
}

/// Drives outgoing messages through `sending → sent | failed`.
pub struct MessagePipeline {
    config: PipelineConfig,
    state: Arc<AppState>,
    transport: Arc<dyn Transport>,
    receipt_tx: mpsc::UnboundedSender<SendReceipt>,
}

impl MessagePipeline {
    pub fn new(
        config: PipelineConfig,
        state: Arc<AppState>,
        transport: Arc<dyn Transport>,
    ) -> (Self, mpsc::UnboundedReceiver<SendReceipt>) {
        let (receipt_tx, receipt_rx) = mpsc::unbounded_channel();

        let pipeline = Self {
            config,
            state,
            transport,
            receipt_tx,
        };

        (pipeline, receipt_rx)
    }

    /// Compose a message to `receiver_id`, show it immediately and send it.
    ///
    /// Returns the message in its settled state, `sent` or `failed`.
    pub async fn send_message(
        &self,
        content: impl Into<String>,
        receiver_id: impl Into<String>,
    ) -> Result<Message> {
        let sender_id = self
            .state
            .current_user()
            .ok_or(PipelineError::NoCurrentUser)?;
        let message = Message::compose(sender_id, receiver_id, content, Utc::now());

        self.state.add_message(message.clone());
        self.receipt(&message);

        Ok(self.deliver(message).await)
    }

    /// Send a failed message again under the same temporary id.
    pub async fn retry(&self, temp_id: &str) -> Result<Message> {
        let message = self
            .state
            .message_by_temp_id(temp_id)
            .ok_or_else(|| PipelineError::NotFound(temp_id.to_string()))?;

        if message.status != MessageStatus::Failed {
            return Err(PipelineError::NotRetryable {
                status: message.status,
            });
        }
        if message.attempts >= self.config.max_attempts {
            return Err(PipelineError::AttemptsExhausted {
                attempts: message.attempts,
            });
        }

        let message = self
            .state
            .update_message_by_temp_id(temp_id, &MessageUpdate::status(MessageStatus::Sending))
            .ok_or_else(|| PipelineError::NotFound(temp_id.to_string()))?;
        info!(temp_id, attempt = message.attempts, "retrying send");
        self.receipt(&message);

        Ok(self.deliver(message).await)
    }

    async fn deliver(&self, message: Message) -> Message {
        let temp_id = match message.temp_id() {
            Some(temp_id) => temp_id.to_string(),
            None => return message,
        };
        let outgoing = OutgoingMessage {
            temp_id: temp_id.clone(),
            content: message.content.clone(),
            receiver_id: message.receiver_id.clone(),
        };

        let result = match timeout(self.config.send_timeout, self.transport.send(outgoing)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(self.config.send_timeout)),
        };

        let update = match result {
            Ok(ack) => {
                info!(temp_id = %temp_id, message_id = %ack.id, "message acknowledged");
                let mut update = MessageUpdate::acknowledged(ack.id);
                update.timestamp = ack.timestamp;
                update
            }
            Err(err) => {
                warn!(temp_id = %temp_id, error = %err, "send failed");
                MessageUpdate::status(MessageStatus::Failed)
            }
        };

        let settled = match self.state.update_message_by_temp_id(&temp_id, &update) {
            Some(settled) => settled,
            None => {
                // message vanished, e.g. cleared on logout mid-send
                let mut fallback = message;
                if let Err(err) = fallback.apply(&update) {
                    debug!(temp_id = %temp_id, error = %err, "status change ignored");
                }
                fallback
            }
        };
        self.receipt(&settled);
        settled
    }

    fn receipt(&self, message: &Message) {
        let Some(temp_id) = message.temp_id() else {
            return;
        };
        let _ = self.receipt_tx.send(SendReceipt {
            temp_id: temp_id.to_string(),
            status: message.status,
            server_id: message.server_id().map(str::to_string),
            attempt: message.attempts,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::LocalStore;
    use crate::transport::SendAck;
    use async_trait::async_trait;
    use chatsync_messaging::ConversationId;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails the first `failures` sends, then acknowledges with `m{n}` ids.
    struct Flaky {
        failures: u32,
        calls: AtomicU32,
    }

    impl Flaky {
        fn new(failures: u32) -> Arc<Self> {
            Arc::new(Self {
                failures,
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl Transport for Flaky {
        async fn send(&self, _message: OutgoingMessage) -> std::result::Result<SendAck, TransportError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.failures {
                return Err(TransportError::Disconnected);
            }
            Ok(SendAck {
                id: format!("m{call}"),
                timestamp: None,
            })
        }
    }

    struct Silent;

    #[async_trait]
    impl Transport for Silent {
        async fn send(&self, _message: OutgoingMessage) -> std::result::Result<SendAck, TransportError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Err(TransportError::Disconnected)
        }
    }

    /// Wipes local data while the send is in flight, then acknowledges.
    struct ClearsMidSend {
        state: Arc<AppState>,
    }

    #[async_trait]
    impl Transport for ClearsMidSend {
        async fn send(&self, _message: OutgoingMessage) -> std::result::Result<SendAck, TransportError> {
            self.state.clear_all_data();
            Ok(SendAck {
                id: "m9".into(),
                timestamp: None,
            })
        }
    }

    fn setup(transport: Arc<dyn Transport>) -> (Arc<AppState>, MessagePipeline, mpsc::UnboundedReceiver<SendReceipt>) {
        let store = LocalStore::temporary().unwrap();
        let state = AppState::new(EngineConfig::default(), store);
        state.set_current_user("alice");
        let (pipeline, receipts) = MessagePipeline::new(PipelineConfig::default(), state.clone(), transport);
        (state, pipeline, receipts)
    }

    #[tokio::test]
    async fn test_send_reconciles_to_server_id() {
        let (state, pipeline, mut receipts) = setup(Flaky::new(0));
        let sent = pipeline.send_message("hi", "bob").await.unwrap();

        assert_eq!(sent.status, MessageStatus::Sent);
        assert_eq!(sent.server_id(), Some("m1"));
        assert!(sent.temp_id().is_some());

        let conversation_id = ConversationId::for_participants("alice", "bob");
        let messages = state.messages_for(&conversation_id);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0], sent);
        assert_eq!(state.store().get_message("m1"), Some(sent));

        assert_eq!(receipts.recv().await.unwrap().status, MessageStatus::Sending);
        let settled = receipts.recv().await.unwrap();
        assert_eq!(settled.status, MessageStatus::Sent);
        assert_eq!(settled.server_id.as_deref(), Some("m1"));
    }

    #[tokio::test]
    async fn test_failure_then_retry_keeps_temp_id() {
        let (_state, pipeline, _receipts) = setup(Flaky::new(1));
        let failed = pipeline.send_message("hi", "bob").await.unwrap();
        assert_eq!(failed.status, MessageStatus::Failed);
        assert!(failed.server_id().is_none());

        let temp_id = failed.temp_id().unwrap().to_string();
        let sent = pipeline.retry(&temp_id).await.unwrap();
        assert_eq!(sent.status, MessageStatus::Sent);
        assert_eq!(sent.temp_id(), Some(temp_id.as_str()));
        assert_eq!(sent.attempts, 2);
    }

    #[tokio::test]
    async fn test_retry_is_bounded() {
        let (_state, pipeline, _receipts) = setup(Flaky::new(u32::MAX));
        let failed = pipeline.send_message("hi", "bob").await.unwrap();
        let temp_id = failed.temp_id().unwrap().to_string();

        pipeline.retry(&temp_id).await.unwrap();
        pipeline.retry(&temp_id).await.unwrap();
        let err = pipeline.retry(&temp_id).await.unwrap_err();
        assert_eq!(err, PipelineError::AttemptsExhausted { attempts: 3 });
    }

    #[tokio::test]
    async fn test_only_failed_messages_retry() {
        let (_state, pipeline, _receipts) = setup(Flaky::new(0));
        let sent = pipeline.send_message("hi", "bob").await.unwrap();
        let err = pipeline.retry(sent.temp_id().unwrap()).await.unwrap_err();
        assert_eq!(
            err,
            PipelineError::NotRetryable {
                status: MessageStatus::Sent
            }
        );
    }

    #[tokio::test]
    async fn test_ack_for_cleared_message_settles_locally() {
        let store = LocalStore::temporary().unwrap();
        let state = AppState::new(EngineConfig::default(), store);
        state.set_current_user("alice");
        let transport = Arc::new(ClearsMidSend { state: state.clone() });
        let (pipeline, mut receipts) =
            MessagePipeline::new(PipelineConfig::default(), state.clone(), transport);

        let settled = pipeline.send_message("hi", "bob").await.unwrap();
        assert_eq!(settled.status, MessageStatus::Sent);
        assert_eq!(settled.server_id(), Some("m9"));
        assert!(state.store().get_message("m9").is_none());
        assert!(state.snapshot().messages.is_empty());

        assert_eq!(receipts.recv().await.unwrap().status, MessageStatus::Sending);
        assert_eq!(receipts.recv().await.unwrap().status, MessageStatus::Sent);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_ack_times_out() {
        let (_state, pipeline, _receipts) = setup(Arc::new(Silent));
        let failed = pipeline.send_message("hi", "bob").await.unwrap();
        assert_eq!(failed.status, MessageStatus::Failed);
    }

    #[tokio::test]
    async fn test_send_requires_current_user() {
        let store = LocalStore::temporary().unwrap();
        let state = AppState::new(EngineConfig::default(), store);
        let (pipeline, _receipts) =
            MessagePipeline::new(PipelineConfig::default(), state, Flaky::new(0));
        assert_eq!(
            pipeline.send_message("hi", "bob").await.unwrap_err(),
            PipelineError::NoCurrentUser
        );
    }
}
