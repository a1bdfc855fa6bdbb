//! Inbound real-time events delivered by the transport layer.

use crate::wire::RemoteMessage;
use crate::MessageStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One event from the real-time channel, tagged with its wire name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum TransportEvent {
    #[serde(rename = "message:new")]
    MessageNew(RemoteMessage),
    #[serde(rename = "message:status", rename_all = "camelCase")]
    MessageStatus {
        message_id: String,
        status: MessageStatus,
        #[serde(default)]
        at: Option<DateTime<Utc>>,
    },
    #[serde(rename = "message:edited", rename_all = "camelCase")]
    MessageEdited {
        message_id: String,
        content: String,
        edited_at: DateTime<Utc>,
    },
    #[serde(rename = "message:deleted", rename_all = "camelCase")]
    MessageDeleted {
        message_id: String,
        deleted_at: DateTime<Utc>,
    },
    #[serde(rename = "presence:online", rename_all = "camelCase")]
    PresenceOnline { user_id: String },
    #[serde(rename = "presence:offline", rename_all = "camelCase")]
    PresenceOffline {
        user_id: String,
        #[serde(default)]
        last_seen: Option<DateTime<Utc>>,
    },
    #[serde(rename = "typing:start", rename_all = "camelCase")]
    TypingStart { user_id: String },
    #[serde(rename = "typing:stop", rename_all = "camelCase")]
    TypingStop { user_id: String },
}

impl TransportEvent {
    pub fn name(&self) -> &'static str {
        match self {
            TransportEvent::MessageNew(_) => "message:new",
            TransportEvent::MessageStatus { .. } => "message:status",
            TransportEvent::MessageEdited { .. } => "message:edited",
            TransportEvent::MessageDeleted { .. } => "message:deleted",
            TransportEvent::PresenceOnline { .. } => "presence:online",
            TransportEvent::PresenceOffline { .. } => "presence:offline",
            TransportEvent::TypingStart { .. } => "typing:start",
            TransportEvent::TypingStop { .. } => "typing:stop",
        }
    }

    /// Parse one JSON frame from the transport.
    pub fn from_json(frame: &str) -> crate::Result<Self> {
        serde_json::from_str(frame).map_err(|e| crate::MessagingError::Malformed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_status_event() {
        let frame = r#"{"event":"message:status","data":{"messageId":"m42","status":"delivered"}}"#;
        let event = TransportEvent::from_json(frame).unwrap();
        assert_eq!(event.name(), "message:status");
        assert_eq!(
            event,
            TransportEvent::MessageStatus {
                message_id: "m42".into(),
                status: MessageStatus::Delivered,
                at: None,
            }
        );
    }

    #[test]
    fn test_parse_typing_event() {
        let frame = r#"{"event":"typing:start","data":{"userId":"bob"}}"#;
        let event = TransportEvent::from_json(frame).unwrap();
        assert_eq!(
            event,
            TransportEvent::TypingStart {
                user_id: "bob".into()
            }
        );
    }

    #[test]
    fn test_unknown_event_is_malformed() {
        let frame = r#"{"event":"post:liked","data":{}}"#;
        assert!(TransportEvent::from_json(frame).is_err());
    }
}
