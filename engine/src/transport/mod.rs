//! Boundary with the real-time transport.
//!
//! Outbound sends go through [`Transport`]; inbound events arrive as
//! [`TransportEvent`]s and are dispatched by [`inbound`].

pub mod inbound;

pub use chatsync_messaging::events::TransportEvent;
pub use inbound::{apply_event, EventPump};

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("server rejected message: {0}")]
    Rejected(String),
    #[error("transport disconnected")]
    Disconnected,
    #[error("no acknowledgment within {0:?}")]
    Timeout(Duration),
}

/// One message handed to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub temp_id: String,
    pub content: String,
    pub receiver_id: String,
}

/// Server acceptance of an outgoing message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendAck {
    pub id: String,
    /// Server-side timestamp, when the server assigns one.
    pub timestamp: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Resolves once the server accepted the message.
    async fn send(&self, message: OutgoingMessage) -> Result<SendAck, TransportError>;
}
