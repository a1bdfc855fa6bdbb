//! Live, observable chat state mirrored into the local store.
//!
//! Every action takes the state lock, mutates the in-memory slices, writes
//! the matching record through to [`LocalStore`] and publishes a
//! [`StateChange`] before releasing the lock. A failed store write is logged
//! and never rolls back the in-memory change. Subscribers that react to a
//! change by calling [`AppState::snapshot`] only ever see whole actions.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chatsync_messaging::{
    Conversation, ConversationId, Message, MessageStatus, MessageUpdate, Presence,
};
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::aggregator::{self, Arrival};
use crate::config::EngineConfig;
use crate::storage::{LocalStore, SaveOutcome};
use crate::sync::{self, HttpSyncClient, SyncReport, SyncSource};

const EVENT_CAPACITY: usize = 256;

/// Plain data behind the container.
#[derive(Debug, Clone, Default)]
pub struct ChatState {
    pub current_user: Option<String>,
    pub selected_conversation: Option<ConversationId>,
    /// Loaded conversations only, each in ascending timestamp order.
    pub messages: HashMap<ConversationId, Vec<Message>>,
    /// Most recently updated first.
    pub conversations: Vec<Conversation>,
    pub online_users: HashSet<String>,
    pub typing_users: HashSet<String>,
}

/// Which slice an action touched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateChange {
    CurrentUser,
    SelectedConversation,
    Messages(ConversationId),
    Conversations,
    Presence { user_id: String, online: bool },
    Typing { user_id: String, typing: bool },
    Cleared,
}

#[derive(Clone, Copy)]
enum Target<'a> {
    Key(&'a str),
    TempId(&'a str),
}

impl Target<'_> {
    fn matches(&self, message: &Message) -> bool {
        match self {
            Target::Key(key) => message.matches_key(key),
            Target::TempId(temp_id) => message.matches_temp_id(temp_id),
        }
    }
}

pub struct AppState {
    config: EngineConfig,
    store: LocalStore,
    sync_source: Arc<dyn SyncSource>,
    inner: Mutex<ChatState>,
    events: broadcast::Sender<StateChange>,
}

impl AppState {
    pub fn new(config: EngineConfig, store: LocalStore) -> Arc<Self> {
        let source = Arc::new(HttpSyncClient::new(&config.api_base_url));
        Self::with_sync_source(config, store, source)
    }

    pub fn with_sync_source(
        config: EngineConfig,
        store: LocalStore,
        sync_source: Arc<dyn SyncSource>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new(Self {
            config,
            store,
            sync_source,
            inner: Mutex::new(ChatState::default()),
            events,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.events.subscribe()
    }

    /// Consistent copy of every slice.
    pub fn snapshot(&self) -> ChatState {
        self.lock().clone()
    }

    pub fn current_user(&self) -> Option<String> {
        self.lock().current_user.clone()
    }

    pub fn selected_conversation(&self) -> Option<ConversationId> {
        self.lock().selected_conversation.clone()
    }

    /// In-memory messages of a conversation; empty when it is not loaded.
    pub fn messages_for(&self, conversation_id: &ConversationId) -> Vec<Message> {
        self.lock()
            .messages
            .get(conversation_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn conversations(&self) -> Vec<Conversation> {
        self.lock().conversations.clone()
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        self.lock().online_users.contains(user_id)
    }

    pub fn is_typing(&self, user_id: &str) -> bool {
        self.lock().typing_users.contains(user_id)
    }

    /// The message composed with `temp_id`, from memory or the store.
    pub fn message_by_temp_id(&self, temp_id: &str) -> Option<Message> {
        let state = self.lock();
        self.find_message(&state, Target::TempId(temp_id))
    }

    /// Last persisted presence record, including `last_seen` for offline users.
    pub fn presence_of(&self, user_id: &str) -> Option<Presence> {
        self.store.get_user_presence(user_id)
    }

    pub fn set_current_user(&self, user_id: impl Into<String>) {
        let mut state = self.lock();
        state.current_user = Some(user_id.into());
        self.emit(StateChange::CurrentUser);
    }

    pub fn set_selected_conversation(&self, conversation_id: Option<ConversationId>) {
        let mut state = self.lock();
        state.selected_conversation = conversation_id;
        self.emit(StateChange::SelectedConversation);
    }

    /// Select a conversation, hydrate it if needed and zero its unread count.
    pub fn open_conversation(&self, conversation_id: &ConversationId) {
        self.set_selected_conversation(Some(conversation_id.clone()));
        let loaded = self.lock().messages.contains_key(conversation_id);
        if !loaded {
            self.load_messages_for_conversation(conversation_id);
        }
        self.clear_unread_count(conversation_id);
    }

    /// Add a composed or received message to its conversation.
    ///
    /// The conversation is the one derived from the participants, whether or
    /// not it is the selected one.
    pub fn add_message(&self, message: Message) {
        let mut state = self.lock();
        let conversation_id = message.conversation_id.clone();
        let user_id = state.current_user.clone();
        let unread_for_user =
            |m: &Message| user_id.as_deref().is_some_and(|user| m.is_unread_for(user));
        let in_memory = state
            .messages
            .get(&conversation_id)
            .and_then(|list| list.iter().find(|m| m.same_identity(&message)).cloned());

        upsert_message(
            state.messages.entry(conversation_id.clone()).or_default(),
            message.clone(),
        );

        let arrival = match self.store.save_message(&message) {
            Ok(SaveOutcome::Inserted) => Arrival::New,
            Ok(SaveOutcome::Updated(previous)) => Arrival::Changed {
                was_unread: unread_for_user(&previous),
            },
            Ok(SaveOutcome::Unchanged) => Arrival::Changed {
                was_unread: unread_for_user(&message),
            },
            Err(err) => {
                warn!(error = %err, message_id = %message.id, "failed to persist message");
                match &in_memory {
                    Some(previous) => Arrival::Changed {
                        was_unread: unread_for_user(previous),
                    },
                    None => Arrival::New,
                }
            }
        };
        debug!(message_id = %message.id, %conversation_id, ?arrival, "message added");
        self.emit(StateChange::Messages(conversation_id.clone()));

        let Some(user_id) = user_id else {
            debug!(message_id = %message.id, "no current user, conversation summary not updated");
            return;
        };
        let summary = self
            .store
            .update_conversation(&conversation_id, |existing| {
                Some(aggregator::apply_message(existing, &message, &user_id, arrival))
            });
        let summary = match summary {
            Ok(Some(summary)) => summary,
            Ok(None) => return,
            Err(err) => {
                warn!(error = %err, %conversation_id, "failed to persist conversation summary");
                let existing = find_conversation(&state.conversations, &conversation_id);
                aggregator::apply_message(existing, &message, &user_id, arrival)
            }
        };
        upsert_conversation(&mut state.conversations, summary);
        self.emit(StateChange::Conversations);
    }

    /// Shallow-merge `update` into the message identified by `key`, a server
    /// id or the temporary id of a message that has none yet.
    pub fn update_message(&self, key: &str, update: &MessageUpdate) -> Option<Message> {
        let mut state = self.lock();
        self.update_locked(&mut state, Target::Key(key), update)
    }

    /// Reconciliation entry point used between optimistic send and the
    /// server acknowledgment.
    pub fn update_message_by_temp_id(
        &self,
        temp_id: &str,
        update: &MessageUpdate,
    ) -> Option<Message> {
        let mut state = self.lock();
        self.update_locked(&mut state, Target::TempId(temp_id), update)
    }

    pub fn update_message_status(
        &self,
        key: &str,
        status: MessageStatus,
        extra: Option<MessageUpdate>,
    ) -> Option<Message> {
        let mut update = extra.unwrap_or_default();
        update.status = Some(status);
        self.update_message(key, &update)
    }

    /// Replace the content of a message. Deleted messages stay deleted.
    pub fn edit_message(
        &self,
        key: &str,
        content: impl Into<String>,
        edited_at: DateTime<Utc>,
    ) -> Option<Message> {
        let mut state = self.lock();
        let target = Target::Key(key);
        let current = self.find_message(&state, target)?;
        if current.is_deleted() {
            debug!(message_id = %current.id, "edit of deleted message ignored");
            return None;
        }
        self.update_locked(&mut state, target, &MessageUpdate::edited(content, edited_at))
    }

    /// Soft-delete: the content is replaced by the placeholder and discarded.
    pub fn delete_message(&self, key: &str, deleted_at: DateTime<Utc>) -> Option<Message> {
        let mut state = self.lock();
        self.update_locked(&mut state, Target::Key(key), &MessageUpdate::deleted(deleted_at))
    }

    pub fn mark_message_as_read(&self, key: &str, read_at: DateTime<Utc>) -> Option<Message> {
        let mut state = self.lock();
        self.update_locked(&mut state, Target::Key(key), &MessageUpdate::read(read_at))
    }

    /// Replace the in-memory slice of a conversation with its most recent
    /// page from the store. Unconfirmed sends that only live in memory are kept.
    pub fn load_messages_for_conversation(&self, conversation_id: &ConversationId) -> Vec<Message> {
        let stored = self
            .store
            .get_messages_for_conversation(conversation_id, self.config.page_size);
        let mut state = self.lock();
        let mut merged = stored;
        if let Some(previous) = state.messages.remove(conversation_id) {
            for message in previous {
                let persisted = merged.iter().any(|m| m.same_identity(&message));
                if !persisted && message.id.is_pending() {
                    upsert_message(&mut merged, message);
                }
            }
        }
        debug!(%conversation_id, count = merged.len(), "conversation hydrated");
        state.messages.insert(conversation_id.clone(), merged.clone());
        self.emit(StateChange::Messages(conversation_id.clone()));
        merged
    }

    /// Prepend the page of messages strictly older than `before`.
    pub fn load_older_messages(
        &self,
        conversation_id: &ConversationId,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Vec<Message> {
        let page = self.store.get_messages_page(conversation_id, before, limit);
        if page.is_empty() {
            return page;
        }
        let mut state = self.lock();
        let list = state.messages.entry(conversation_id.clone()).or_default();
        for message in &page {
            upsert_message(list, message.clone());
        }
        self.emit(StateChange::Messages(conversation_id.clone()));
        page
    }

    pub fn add_conversation(&self, conversation: Conversation) {
        let mut state = self.lock();
        if let Err(err) = self.store.save_conversation(&conversation) {
            warn!(error = %err, conversation_id = %conversation.id, "failed to persist conversation");
        }
        upsert_conversation(&mut state.conversations, conversation);
        self.emit(StateChange::Conversations);
    }

    /// Apply `change` to an existing conversation summary.
    pub fn update_conversation<F>(&self, conversation_id: &ConversationId, change: F) -> Option<Conversation>
    where
        F: Fn(&mut Conversation),
    {
        let mut state = self.lock();
        self.update_conversation_locked(&mut state, conversation_id, change)
    }

    pub fn update_conversation_unread_count(
        &self,
        conversation_id: &ConversationId,
        unread_count: u32,
    ) -> Option<Conversation> {
        self.update_conversation(conversation_id, |conversation| {
            conversation.unread_count = unread_count;
        })
    }

    /// Zero the unread counter in memory and in the store within one critical
    /// section, so no reader of the container sees only one of them cleared.
    pub fn clear_unread_count(&self, conversation_id: &ConversationId) -> Option<Conversation> {
        self.update_conversation_unread_count(conversation_id, 0)
    }

    pub fn load_conversations(&self) -> Vec<Conversation> {
        let conversations = self.store.get_all_conversations();
        let mut state = self.lock();
        state.conversations = conversations.clone();
        self.emit(StateChange::Conversations);
        conversations
    }

    pub fn set_user_online(&self, user_id: &str) {
        let mut state = self.lock();
        state.online_users.insert(user_id.to_string());
        if let Err(err) = self.store.update_user_presence(&Presence::online(user_id, Utc::now())) {
            warn!(error = %err, user_id, "failed to persist presence");
        }
        self.emit(StateChange::Presence {
            user_id: user_id.to_string(),
            online: true,
        });
    }

    pub fn set_user_offline(&self, user_id: &str, last_seen: Option<DateTime<Utc>>) {
        let mut state = self.lock();
        state.online_users.remove(user_id);
        let presence = Presence::offline(user_id, last_seen, Utc::now());
        if let Err(err) = self.store.update_user_presence(&presence) {
            warn!(error = %err, user_id, "failed to persist presence");
        }
        self.emit(StateChange::Presence {
            user_id: user_id.to_string(),
            online: false,
        });
    }

    /// Typing indicators are transient; the transport clears them.
    pub fn set_user_typing(&self, user_id: &str) {
        let mut state = self.lock();
        if state.typing_users.insert(user_id.to_string()) {
            self.emit(StateChange::Typing {
                user_id: user_id.to_string(),
                typing: true,
            });
        }
    }

    pub fn set_user_stopped_typing(&self, user_id: &str) {
        let mut state = self.lock();
        if state.typing_users.remove(user_id) {
            self.emit(StateChange::Typing {
                user_id: user_id.to_string(),
                typing: false,
            });
        }
    }

    /// Run one sync pass straight into the store.
    ///
    /// Touched conversations are refreshed lazily: their in-memory slices are
    /// dropped so the next open rehydrates them, except for the selected one,
    /// which is reloaded now. Failures are logged and yield `None`.
    pub async fn sync_messages(&self, user_id: &str, credential: &str) -> Option<SyncReport> {
        let report = match sync::sync_once(
            &self.store,
            self.sync_source.as_ref(),
            user_id,
            credential,
            self.config.retention_per_conversation,
        )
        .await
        {
            Ok(report) => report,
            Err(err) => {
                warn!(error = %err, user_id, "sync failed, will retry from the same cursor");
                return None;
            }
        };
        if report.conversations.is_empty() {
            return Some(report);
        }

        // the selection may have changed while the request was in flight
        let selected = self.selected_conversation();
        let reload = selected.filter(|id| report.conversations.contains(id));
        {
            let mut state = self.lock();
            state.conversations = self.store.get_all_conversations();
            for conversation_id in &report.conversations {
                if reload.as_ref() != Some(conversation_id) {
                    state.messages.remove(conversation_id);
                }
            }
            self.emit(StateChange::Conversations);
        }
        if let Some(conversation_id) = reload {
            self.load_messages_for_conversation(&conversation_id);
        }
        Some(report)
    }

    /// Restore persisted state after start-up. Sends left in `sending` by a
    /// previous process can no longer be acknowledged and become `failed`.
    pub fn hydrate(&self) -> usize {
        let conversations = self.load_conversations();
        let mut failed = 0;
        for message in self.store.get_messages_by_status(MessageStatus::Sending) {
            let key = message.id.lookup_key().to_string();
            match self.store.update_message_status(&key, MessageStatus::Failed, None) {
                Ok(Some(_)) => failed += 1,
                Ok(None) => {}
                Err(err) => warn!(error = %err, message_id = %key, "failed to mark stale send"),
            }
        }
        info!(conversations = conversations.len(), stale_sends = failed, "state hydrated");
        failed
    }

    /// Reset every slice and wipe the store. Safe to call repeatedly.
    pub fn clear_all_data(&self) {
        let mut state = self.lock();
        *state = ChatState::default();
        if let Err(err) = self.store.clear_all_data() {
            warn!(error = %err, "failed to clear local store");
        }
        self.emit(StateChange::Cleared);
    }

    fn update_locked(
        &self,
        state: &mut ChatState,
        target: Target<'_>,
        update: &MessageUpdate,
    ) -> Option<Message> {
        let previous = match target {
            Target::Key(key) => self.store.get_message(key),
            Target::TempId(temp_id) => self.store.get_message_by_temp_id(temp_id),
        }
        .or_else(|| find_in_memory(state, target));
        let persisted = match target {
            Target::Key(key) => self.store.update_message(key, update),
            Target::TempId(temp_id) => self.store.update_message_by_temp_id(temp_id, update),
        };
        let persisted = persisted.unwrap_or_else(|err| {
            warn!(error = %err, "failed to persist message update");
            None
        });

        let updated = match persisted {
            Some(message) => message,
            None => {
                let mut message = find_in_memory(state, target)?;
                if let Err(err) = message.apply(update) {
                    debug!(error = %err, message_id = %message.id, "status change ignored");
                }
                message
            }
        };

        let conversation_id = updated.conversation_id.clone();
        if let Some(list) = state.messages.get_mut(&conversation_id) {
            list.retain(|m| !target.matches(m));
            upsert_message(list, updated.clone());
            self.emit(StateChange::Messages(conversation_id.clone()));
        }

        if let Some(user_id) = state.current_user.clone() {
            let arrival = Arrival::Changed {
                was_unread: previous.is_some_and(|p| p.is_unread_for(&user_id)),
            };
            let message = updated.clone();
            self.update_conversation_summary(state, &conversation_id, move |existing| {
                existing.map(|c| aggregator::apply_message(Some(c), &message, &user_id, arrival))
            });
        }
        Some(updated)
    }

    fn update_conversation_summary<F>(&self, state: &mut ChatState, conversation_id: &ConversationId, apply: F)
    where
        F: Fn(Option<Conversation>) -> Option<Conversation>,
    {
        let summary = match self.store.update_conversation(conversation_id, &apply) {
            Ok(summary) => summary,
            Err(err) => {
                warn!(error = %err, %conversation_id, "failed to persist conversation summary");
                apply(find_conversation(&state.conversations, conversation_id))
            }
        };
        if let Some(summary) = summary {
            upsert_conversation(&mut state.conversations, summary);
            self.emit(StateChange::Conversations);
        }
    }

    fn update_conversation_locked<F>(
        &self,
        state: &mut ChatState,
        conversation_id: &ConversationId,
        change: F,
    ) -> Option<Conversation>
    where
        F: Fn(&mut Conversation),
    {
        let apply = |existing: Option<Conversation>| {
            existing.map(|mut conversation| {
                change(&mut conversation);
                conversation
            })
        };
        let persisted = match self.store.update_conversation(conversation_id, &apply) {
            Ok(persisted) => persisted,
            Err(err) => {
                warn!(error = %err, %conversation_id, "failed to persist conversation");
                None
            }
        };
        let updated = persisted.or_else(|| apply(find_conversation(&state.conversations, conversation_id)))?;
        upsert_conversation(&mut state.conversations, updated.clone());
        self.emit(StateChange::Conversations);
        Some(updated)
    }

    fn find_message(&self, state: &ChatState, target: Target<'_>) -> Option<Message> {
        find_in_memory(state, target).or_else(|| match target {
            Target::Key(key) => self.store.get_message(key),
            Target::TempId(temp_id) => self.store.get_message_by_temp_id(temp_id),
        })
    }

    fn lock(&self) -> MutexGuard<'_, ChatState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, change: StateChange) {
        // no subscribers is fine
        let _ = self.events.send(change);
    }
}

fn find_in_memory(state: &ChatState, target: Target<'_>) -> Option<Message> {
    state
        .messages
        .values()
        .flat_map(|list| list.iter())
        .find(|m| target.matches(m))
        .cloned()
}

fn find_conversation(conversations: &[Conversation], id: &ConversationId) -> Option<Conversation> {
    conversations.iter().find(|c| &c.id == id).cloned()
}

/// Insert keeping ascending timestamp order, replacing any copy of the same message.
fn upsert_message(list: &mut Vec<Message>, message: Message) {
    list.retain(|m| !m.same_identity(&message));
    let at = list.partition_point(|m| m.timestamp <= message.timestamp);
    list.insert(at, message);
}

fn upsert_conversation(conversations: &mut Vec<Conversation>, conversation: Conversation) {
    conversations.retain(|c| c.id != conversation.id);
    conversations.push(conversation);
    conversations.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
}
