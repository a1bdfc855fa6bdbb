//! Status state machine for a single message.
//!
//! `sending -> sent -> delivered -> read`, with `failed` reachable from
//! `sending` and `sent`. A failed message re-enters `sending` on retry with
//! the same temporary id. Edits and deletes are flags layered on top and
//! never touch the status.

use crate::{Message, MessageStatus};
use chrono::{DateTime, Utc};

/// Outcome of a status change that was accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Applied,
    /// The message already had the requested status.
    Unchanged,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LifecycleError {
    #[error("invalid status transition {from} -> {to}")]
    InvalidTransition {
        from: MessageStatus,
        to: MessageStatus,
    },
    #[error("message {temp_id} has no server id and cannot become {to}")]
    MissingServerId { temp_id: String, to: MessageStatus },
}

impl MessageStatus {
    fn progress(self) -> Option<u8> {
        match self {
            MessageStatus::Sending => Some(0),
            MessageStatus::Sent => Some(1),
            MessageStatus::Delivered => Some(2),
            MessageStatus::Read => Some(3),
            MessageStatus::Failed => None,
        }
    }

    /// Whether `self -> next` is a legal step. Equal statuses are not a step.
    pub fn can_transition_to(self, next: MessageStatus) -> bool {
        use MessageStatus::*;
        match (self, next) {
            (Sending, Failed) | (Sent, Failed) => true,
            // retry
            (Failed, Sending) => true,
            // an acknowledgment that lands after the send timed out
            (Failed, Sent) => true,
            (Sending, Sent) => true,
            (from, to) => match (from.progress(), to.progress()) {
                (Some(a), Some(b)) => a >= 1 && b > a,
                _ => false,
            },
        }
    }
}

/// Move `message` to `next`, stamping read markers when it becomes `read`.
pub fn transition(
    message: &mut Message,
    next: MessageStatus,
    at: DateTime<Utc>,
) -> Result<Transition, LifecycleError> {
    if message.status == next {
        return Ok(Transition::Unchanged);
    }
    if !message.status.can_transition_to(next) {
        return Err(LifecycleError::InvalidTransition {
            from: message.status,
            to: next,
        });
    }
    let needs_server_id = matches!(
        next,
        MessageStatus::Sent | MessageStatus::Delivered | MessageStatus::Read
    );
    if needs_server_id && message.id.is_pending() {
        return Err(LifecycleError::MissingServerId {
            temp_id: message.id.lookup_key().to_string(),
            to: next,
        });
    }

    match next {
        MessageStatus::Read => {
            message.is_read = true;
            if message.read_at.is_none() {
                message.read_at = Some(at);
            }
        }
        MessageStatus::Sending => {
            message.attempts = message.attempts.saturating_add(1);
        }
        _ => {}
    }
    message.status = next;
    Ok(Transition::Applied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MessageUpdate;

    fn confirmed(status: MessageStatus) -> Message {
        let mut message = Message::compose("alice", "bob", "hi", Utc::now());
        message.id.confirm("m1");
        message.status = status;
        message
    }

    #[test]
    fn test_forward_path() {
        let mut message = Message::compose("alice", "bob", "hi", Utc::now());
        message.id.confirm("m1");
        for next in [
            MessageStatus::Sent,
            MessageStatus::Delivered,
            MessageStatus::Read,
        ] {
            assert_eq!(
                transition(&mut message, next, Utc::now()),
                Ok(Transition::Applied)
            );
        }
        assert!(message.is_read);
        assert!(message.read_at.is_some());
    }

    #[test]
    fn test_sent_requires_server_id() {
        let mut message = Message::compose("alice", "bob", "hi", Utc::now());
        let err = transition(&mut message, MessageStatus::Sent, Utc::now()).unwrap_err();
        assert!(matches!(err, LifecycleError::MissingServerId { .. }));
        assert_eq!(message.status, MessageStatus::Sending);
    }

    #[test]
    fn test_regression_is_rejected() {
        let mut message = confirmed(MessageStatus::Read);
        let err = transition(&mut message, MessageStatus::Delivered, Utc::now()).unwrap_err();
        assert_eq!(
            err,
            LifecycleError::InvalidTransition {
                from: MessageStatus::Read,
                to: MessageStatus::Delivered
            }
        );
        assert_eq!(message.status, MessageStatus::Read);
    }

    #[test]
    fn test_failed_only_from_sending_or_sent() {
        assert!(MessageStatus::Sending.can_transition_to(MessageStatus::Failed));
        assert!(MessageStatus::Sent.can_transition_to(MessageStatus::Failed));
        assert!(!MessageStatus::Delivered.can_transition_to(MessageStatus::Failed));
        assert!(!MessageStatus::Read.can_transition_to(MessageStatus::Failed));
    }

    #[test]
    fn test_retry_reenters_sending_with_same_temp_id() {
        let mut message = Message::compose("alice", "bob", "hi", Utc::now());
        let temp_id = message.temp_id().unwrap().to_string();
        transition(&mut message, MessageStatus::Failed, Utc::now()).unwrap();
        transition(&mut message, MessageStatus::Sending, Utc::now()).unwrap();
        assert_eq!(message.status, MessageStatus::Sending);
        assert_eq!(message.temp_id(), Some(temp_id.as_str()));
        assert_eq!(message.attempts, 2);
    }

    #[test]
    fn test_edit_after_read_keeps_status() {
        let mut message = confirmed(MessageStatus::Read);
        let at = Utc::now();
        message.apply(&MessageUpdate::edited("hello", at)).unwrap();
        assert_eq!(message.status, MessageStatus::Read);
        assert!(message.is_edited);
        assert_eq!(message.edited_at, Some(at));
        assert_eq!(message.content, "hello");
    }
}
