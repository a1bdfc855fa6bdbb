use std::sync::Arc;

use chatsync_messaging::events::TransportEvent;
use chatsync_messaging::MessageStatus;
use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::state::AppState;

/// Map one inbound event onto the matching container action.
pub fn apply_event(state: &AppState, event: TransportEvent) {
    debug!(event = event.name(), "inbound event");
    match event {
        TransportEvent::MessageNew(remote) => state.add_message(remote.into_message()),
        TransportEvent::MessageStatus {
            message_id,
            status: MessageStatus::Read,
            at,
        } => {
            state.mark_message_as_read(&message_id, at.unwrap_or_else(Utc::now));
        }
        TransportEvent::MessageStatus {
            message_id, status, ..
        } => {
            state.update_message_status(&message_id, status, None);
        }
        TransportEvent::MessageEdited {
            message_id,
            content,
            edited_at,
        } => {
            state.edit_message(&message_id, content, edited_at);
        }
        TransportEvent::MessageDeleted {
            message_id,
            deleted_at,
        } => {
            state.delete_message(&message_id, deleted_at);
        }
        TransportEvent::PresenceOnline { user_id } => state.set_user_online(&user_id),
        TransportEvent::PresenceOffline { user_id, last_seen } => {
            state.set_user_offline(&user_id, last_seen)
        }
        TransportEvent::TypingStart { user_id } => state.set_user_typing(&user_id),
        TransportEvent::TypingStop { user_id } => state.set_user_stopped_typing(&user_id),
    }
}

/// Drains a transport's event channel into the container.
pub struct EventPump;

impl EventPump {
    pub fn spawn(
        state: Arc<AppState>,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                apply_event(&state, event);
            }
            info!("transport event channel closed");
        })
    }
}
