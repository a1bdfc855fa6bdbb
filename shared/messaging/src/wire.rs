//! Server-side message shape used by the sync endpoint and by `message:new` events.

use crate::{ConversationId, Message, MessageId, MessageStatus, DELETED_PLACEHOLDER};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A message as the server reports it. Always carries a server id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteMessage {
    pub id: String,
    /// Echo of the sender's temporary id, when the server kept it.
    #[serde(default)]
    pub temp_id: Option<String>,
    pub content: String,
    pub sender_id: String,
    pub receiver_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_read: bool,
    #[serde(default)]
    pub read_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_edited: bool,
    #[serde(default)]
    pub edited_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl RemoteMessage {
    /// Convert into the local model. The conversation id is recomputed from
    /// the participants and the status follows the server's read flag.
    pub fn into_message(self) -> Message {
        let status = if self.is_read {
            MessageStatus::Read
        } else {
            MessageStatus::Delivered
        };
        let content = if self.deleted_at.is_some() {
            DELETED_PLACEHOLDER.to_string()
        } else {
            self.content
        };
        Message {
            id: MessageId::Confirmed {
                id: self.id,
                temp_id: self.temp_id,
            },
            conversation_id: ConversationId::for_participants(&self.sender_id, &self.receiver_id),
            content,
            sender_id: self.sender_id,
            receiver_id: self.receiver_id,
            timestamp: self.timestamp,
            created_at: self.created_at.unwrap_or(self.timestamp),
            status,
            is_edited: self.is_edited,
            edited_at: self.edited_at,
            deleted_at: self.deleted_at,
            is_read: self.is_read,
            read_at: self.read_at,
            attempts: 0,
        }
    }
}

/// Body of `GET /messages/sync`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncResponse {
    #[serde(default)]
    pub messages: Vec<RemoteMessage>,
}
