//! Message, conversation and presence models shared by ChatSync clients and the sync engine.

pub mod events;
pub mod lifecycle;
pub mod wire;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

pub use lifecycle::{LifecycleError, Transition};

/// Content that replaces the body of a soft-deleted message.
pub const DELETED_PLACEHOLDER: &str = "This message was deleted";

/// Key shared by both participants of a direct conversation.
///
/// Built from the two participant ids in sorted order so that either side
/// derives the same value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(String);

impl ConversationId {
    pub fn for_participants(a: &str, b: &str) -> Self {
        let (low, high) = if a <= b { (a, b) } else { (b, a) };
        Self(format!("{low}_{high}"))
    }

    /// Wrap an id that was already normalized elsewhere (storage keys, server payloads).
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of a message.
///
/// A message is `Pending` from composition until the server accepts it, then
/// `Confirmed` for the rest of its life. Once confirmed only the server id is
/// authoritative; the temporary id is kept for audit and for replaying the
/// same acknowledgment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MessageId {
    Pending {
        temp_id: String,
    },
    Confirmed {
        id: String,
        temp_id: Option<String>,
    },
}

impl MessageId {
    pub fn new_pending() -> Self {
        MessageId::Pending {
            temp_id: Uuid::new_v4().to_string(),
        }
    }

    pub fn server_id(&self) -> Option<&str> {
        match self {
            MessageId::Pending { .. } => None,
            MessageId::Confirmed { id, .. } => Some(id),
        }
    }

    pub fn temp_id(&self) -> Option<&str> {
        match self {
            MessageId::Pending { temp_id } => Some(temp_id),
            MessageId::Confirmed { temp_id, .. } => temp_id.as_deref(),
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, MessageId::Pending { .. })
    }

    /// The id callers should key lookups by: the server id once present,
    /// the temporary id otherwise.
    pub fn lookup_key(&self) -> &str {
        match self {
            MessageId::Pending { temp_id } => temp_id,
            MessageId::Confirmed { id, .. } => id,
        }
    }

    /// Promote to `Confirmed`, keeping the temporary id for audit.
    pub fn confirm(&mut self, server_id: impl Into<String>) {
        let server_id = server_id.into();
        let temp_id = match self {
            MessageId::Pending { temp_id } => Some(temp_id.clone()),
            MessageId::Confirmed { temp_id, .. } => temp_id.clone(),
        };
        *self = MessageId::Confirmed {
            id: server_id,
            temp_id,
        };
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.lookup_key())
    }
}

/// Delivery status of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Sending,
    Sent,
    Delivered,
    Read,
    Failed,
}

impl MessageStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageStatus::Sending => "sending",
            MessageStatus::Sent => "sent",
            MessageStatus::Delivered => "delivered",
            MessageStatus::Read => "read",
            MessageStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One direct chat message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub content: String,
    pub sender_id: String,
    pub receiver_id: String,
    /// Logical send time; orders messages inside a conversation.
    pub timestamp: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub status: MessageStatus,
    pub is_edited: bool,
    pub edited_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub is_read: bool,
    pub read_at: Option<DateTime<Utc>>,
    /// Number of send attempts made by this client; zero for remote messages.
    pub attempts: u32,
}

impl Message {
    /// Create an optimistic outgoing message with a fresh temporary id.
    pub fn compose(
        sender_id: impl Into<String>,
        receiver_id: impl Into<String>,
        content: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        let sender_id = sender_id.into();
        let receiver_id = receiver_id.into();
        Self {
            id: MessageId::new_pending(),
            conversation_id: ConversationId::for_participants(&sender_id, &receiver_id),
            content: content.into(),
            sender_id,
            receiver_id,
            timestamp: now,
            created_at: now,
            status: MessageStatus::Sending,
            is_edited: false,
            edited_at: None,
            deleted_at: None,
            is_read: false,
            read_at: None,
            attempts: 1,
        }
    }

    pub fn server_id(&self) -> Option<&str> {
        self.id.server_id()
    }

    pub fn temp_id(&self) -> Option<&str> {
        self.id.temp_id()
    }

    /// True when `key` identifies this message: the server id once confirmed,
    /// the temporary id only while pending.
    pub fn matches_key(&self, key: &str) -> bool {
        match &self.id {
            MessageId::Confirmed { id, .. } => id == key,
            MessageId::Pending { temp_id } => temp_id == key,
        }
    }

    /// True when the message was composed with `temp_id`, confirmed or not.
    pub fn matches_temp_id(&self, temp_id: &str) -> bool {
        self.id.temp_id() == Some(temp_id)
    }

    /// True when both values describe the same logical message.
    pub fn same_identity(&self, other: &Message) -> bool {
        match (self.server_id(), other.server_id()) {
            (Some(a), Some(b)) => a == b,
            _ => self.temp_id().is_some() && self.temp_id() == other.temp_id(),
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    pub fn is_unread_for(&self, user_id: &str) -> bool {
        self.receiver_id == user_id && !self.is_read
    }

    /// The participant that is not `user_id`.
    pub fn counterpart_of(&self, user_id: &str) -> &str {
        if self.sender_id == user_id {
            &self.receiver_id
        } else {
            &self.sender_id
        }
    }

    /// Shallow-merge `update` into this message.
    ///
    /// The id is applied before the status so that an acknowledgment carrying
    /// both confirms the message first. Status changes go through the
    /// lifecycle rules; a rejected status change leaves the other fields
    /// applied and is reported through the returned error.
    pub fn apply(&mut self, update: &MessageUpdate) -> std::result::Result<(), LifecycleError> {
        if let Some(id) = &update.id {
            if self.server_id() != Some(id.as_str()) {
                self.id.confirm(id.clone());
            }
        }
        if let Some(content) = &update.content {
            self.content = content.clone();
        }
        if let Some(timestamp) = update.timestamp {
            self.timestamp = timestamp;
        }
        if let Some(is_edited) = update.is_edited {
            self.is_edited = is_edited;
        }
        if update.edited_at.is_some() {
            self.edited_at = update.edited_at;
        }
        if update.deleted_at.is_some() {
            self.deleted_at = update.deleted_at;
            self.content = DELETED_PLACEHOLDER.to_string();
        }
        if let Some(is_read) = update.is_read {
            self.is_read = is_read;
        }
        if update.read_at.is_some() {
            self.read_at = update.read_at;
        }
        if let Some(status) = update.status {
            let at = update.read_at.unwrap_or_else(Utc::now);
            lifecycle::transition(self, status, at)?;
        }
        Ok(())
    }
}

/// Partial update applied to a message with [`Message::apply`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageUpdate {
    pub id: Option<String>,
    pub status: Option<MessageStatus>,
    pub content: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
    pub is_edited: Option<bool>,
    pub edited_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub is_read: Option<bool>,
    pub read_at: Option<DateTime<Utc>>,
}

impl MessageUpdate {
    /// Server acknowledgment: adopt `id` and move to `sent`.
    pub fn acknowledged(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            status: Some(MessageStatus::Sent),
            ..Self::default()
        }
    }

    pub fn status(status: MessageStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn edited(content: impl Into<String>, edited_at: DateTime<Utc>) -> Self {
        Self {
            content: Some(content.into()),
            is_edited: Some(true),
            edited_at: Some(edited_at),
            ..Self::default()
        }
    }

    pub fn deleted(deleted_at: DateTime<Utc>) -> Self {
        Self {
            deleted_at: Some(deleted_at),
            ..Self::default()
        }
    }

    pub fn read(read_at: DateTime<Utc>) -> Self {
        Self {
            status: Some(MessageStatus::Read),
            is_read: Some(true),
            read_at: Some(read_at),
            ..Self::default()
        }
    }
}

/// Running summary of the exchange between the current user and one counterpart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: ConversationId,
    pub other_user_id: String,
    pub other_user_name: Option<String>,
    pub other_user_avatar: Option<String>,
    pub last_message: Option<Message>,
    pub last_message_timestamp: Option<DateTime<Utc>>,
    pub unread_count: u32,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn new(current_user_id: &str, other_user_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        let other_user_id = other_user_id.into();
        Self {
            id: ConversationId::for_participants(current_user_id, &other_user_id),
            other_user_id,
            other_user_name: None,
            other_user_avatar: None,
            last_message: None,
            last_message_timestamp: None,
            unread_count: 0,
            updated_at: now,
        }
    }
}

/// Online/offline indicator for one user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Presence {
    pub user_id: String,
    pub is_online: bool,
    pub last_seen: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Presence {
    pub fn online(user_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            user_id: user_id.into(),
            is_online: true,
            last_seen: Some(now),
            updated_at: now,
        }
    }

    pub fn offline(
        user_id: impl Into<String>,
        last_seen: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            is_online: false,
            last_seen: last_seen.or(Some(now)),
            updated_at: now,
        }
    }
}

/// Messaging-specific errors.
#[derive(Debug, thiserror::Error)]
pub enum MessagingError {
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
    #[error("malformed payload: {0}")]
    Malformed(String),
}

pub type Result<T> = std::result::Result<T, MessagingError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conversation_id_is_order_normalized() {
        let ab = ConversationId::for_participants("alice", "bob");
        let ba = ConversationId::for_participants("bob", "alice");
        assert_eq!(ab, ba);
        assert_eq!(ab.as_str(), "alice_bob");
    }

    #[test]
    fn test_compose_creates_pending_message() {
        let message = Message::compose("alice", "bob", "hi", Utc::now());
        assert!(message.id.is_pending());
        assert!(message.server_id().is_none());
        assert_eq!(message.status, MessageStatus::Sending);
        assert_eq!(message.conversation_id.as_str(), "alice_bob");
        assert_eq!(message.attempts, 1);
    }

    #[test]
    fn test_acknowledgment_confirms_and_keeps_temp_id() {
        let mut message = Message::compose("alice", "bob", "hi", Utc::now());
        let temp_id = message.temp_id().unwrap().to_string();

        message.apply(&MessageUpdate::acknowledged("m42")).unwrap();

        assert_eq!(message.server_id(), Some("m42"));
        assert_eq!(message.temp_id(), Some(temp_id.as_str()));
        assert_eq!(message.status, MessageStatus::Sent);
        assert!(message.matches_key("m42"));
        assert!(!message.matches_key(&temp_id));
        assert!(message.matches_temp_id(&temp_id));
    }

    #[test]
    fn test_acknowledgment_twice_is_idempotent() {
        let mut message = Message::compose("alice", "bob", "hi", Utc::now());
        message.apply(&MessageUpdate::acknowledged("m42")).unwrap();
        let once = message.clone();
        message.apply(&MessageUpdate::acknowledged("m42")).unwrap();
        assert_eq!(message, once);
    }

    #[test]
    fn test_delete_replaces_content() {
        let mut message = Message::compose("alice", "bob", "secret", Utc::now());
        let at = Utc::now();
        message.apply(&MessageUpdate::deleted(at)).unwrap();
        assert_eq!(message.content, DELETED_PLACEHOLDER);
        assert_eq!(message.deleted_at, Some(at));
        assert!(message.is_deleted());
    }

    #[test]
    fn test_message_survives_bincode() {
        let mut message = Message::compose("alice", "bob", "hi", Utc::now());
        message.apply(&MessageUpdate::acknowledged("m1")).unwrap();
        let bytes = bincode::serialize(&message).unwrap();
        let decoded: Message = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded, message);
    }
}
