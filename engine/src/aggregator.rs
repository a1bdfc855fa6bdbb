//! Keeps per-conversation summaries (last message, unread count) in step
//! with the message stream.

use chatsync_messaging::{Conversation, Message};

/// How a message reached the aggregator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arrival {
    /// First time this message is stored locally.
    New,
    /// An already stored message changed (status, edit, delete, resync).
    Changed { was_unread: bool },
}

/// Fold `message` into the summary of its conversation, creating the summary
/// on first contact with the counterpart.
pub fn apply_message(
    existing: Option<Conversation>,
    message: &Message,
    current_user: &str,
    arrival: Arrival,
) -> Conversation {
    let mut conversation = existing.unwrap_or_else(|| {
        let mut created = Conversation::new(
            current_user,
            message.counterpart_of(current_user),
            message.timestamp,
        );
        created.id = message.conversation_id.clone();
        created
    });

    let replaces_last = match &conversation.last_message {
        None => true,
        Some(last) => last.same_identity(message) || message.timestamp >= last.timestamp,
    };
    if replaces_last {
        conversation.last_message_timestamp = Some(message.timestamp);
        conversation.last_message = Some(message.clone());
        if message.timestamp > conversation.updated_at {
            conversation.updated_at = message.timestamp;
        }
    }

    let was_unread = match arrival {
        Arrival::New => false,
        Arrival::Changed { was_unread } => was_unread,
    };
    match (was_unread, message.is_unread_for(current_user)) {
        (false, true) => conversation.unread_count = conversation.unread_count.saturating_add(1),
        (true, false) => conversation.unread_count = conversation.unread_count.saturating_sub(1),
        _ => {}
    }
    conversation
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatsync_messaging::wire::RemoteMessage;
    use chrono::{DateTime, Duration, Utc};

    fn incoming(id: &str, ts: DateTime<Utc>) -> Message {
        RemoteMessage {
            id: id.into(),
            temp_id: None,
            content: "yo".into(),
            sender_id: "bob".into(),
            receiver_id: "alice".into(),
            timestamp: ts,
            created_at: None,
            is_read: false,
            read_at: None,
            is_edited: false,
            edited_at: None,
            deleted_at: None,
        }
        .into_message()
    }

    #[test]
    fn test_first_message_creates_summary() {
        let message = incoming("m1", Utc::now());
        let conversation = apply_message(None, &message, "alice", Arrival::New);
        assert_eq!(conversation.id, message.conversation_id);
        assert_eq!(conversation.other_user_id, "bob");
        assert_eq!(conversation.unread_count, 1);
        assert_eq!(conversation.last_message, Some(message));
    }

    #[test]
    fn test_older_message_does_not_replace_last() {
        let now = Utc::now();
        let newer = incoming("m2", now);
        let older = incoming("m1", now - Duration::minutes(1));
        let conversation = apply_message(None, &newer, "alice", Arrival::New);
        let conversation = apply_message(Some(conversation), &older, "alice", Arrival::New);
        assert_eq!(conversation.last_message.unwrap().server_id(), Some("m2"));
        assert_eq!(conversation.unread_count, 2);
    }

    #[test]
    fn test_changed_message_does_not_count_again() {
        let message = incoming("m1", Utc::now());
        let conversation = apply_message(None, &message, "alice", Arrival::New);
        let changed = Arrival::Changed { was_unread: true };
        let conversation = apply_message(Some(conversation), &message, "alice", changed);
        assert_eq!(conversation.unread_count, 1);
    }

    #[test]
    fn test_read_flips_move_the_count_both_ways() {
        let unread = incoming("m1", Utc::now());
        let mut read = unread.clone();
        read.is_read = true;

        let conversation = apply_message(None, &unread, "alice", Arrival::New);
        let conversation = apply_message(
            Some(conversation),
            &read,
            "alice",
            Arrival::Changed { was_unread: true },
        );
        assert_eq!(conversation.unread_count, 0);
        assert!(conversation.last_message.unwrap().is_read);

        let conversation = apply_message(None, &read, "alice", Arrival::New);
        let conversation = apply_message(
            Some(conversation),
            &unread,
            "alice",
            Arrival::Changed { was_unread: false },
        );
        assert_eq!(conversation.unread_count, 1);
    }

    #[test]
    fn test_own_messages_are_not_unread() {
        let message = Message::compose("alice", "bob", "hi", Utc::now());
        let conversation = apply_message(None, &message, "alice", Arrival::New);
        assert_eq!(conversation.unread_count, 0);
        assert_eq!(conversation.other_user_id, "bob");
    }

    #[test]
    fn test_read_never_goes_negative() {
        let mut message = incoming("m1", Utc::now());
        message.is_read = true;
        let conversation = apply_message(None, &message, "alice", Arrival::New);
        let conversation = apply_message(
            Some(conversation),
            &message,
            "alice",
            Arrival::Changed { was_unread: true },
        );
        assert_eq!(conversation.unread_count, 0);
    }
}
