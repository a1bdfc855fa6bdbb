//! Durable local cache of messages, conversations and presence backed by sled.
//!
//! Writes are flushed before they return and report failures to the caller.
//! Reads never fail: a storage or decoding error is logged and the read
//! yields an empty result, so callers always have a (possibly stale) view.

mod conversations;
mod keys;

use std::path::Path;

use anyhow::{Context, Result};
use chatsync_messaging::{
    lifecycle, ConversationId, Message, MessageId, MessageStatus, MessageUpdate,
};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::transaction::{
    ConflictableTransactionError, TransactionError, TransactionalTree,
    UnabortableTransactionError,
};
use sled::{IVec, Transactional};
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("storage backend error: {0}")]
    Backend(#[from] sled::Error),
    #[error("record codec error: {0}")]
    Codec(#[from] bincode::Error),
}

impl From<TransactionError<StoreError>> for StoreError {
    fn from(err: TransactionError<StoreError>) -> Self {
        match err {
            TransactionError::Abort(inner) => inner,
            TransactionError::Storage(inner) => StoreError::Backend(inner),
        }
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

type TxResult<T> = std::result::Result<T, ConflictableTransactionError<StoreError>>;

/// What [`LocalStore::save_message`] did with the incoming message.
#[derive(Debug, Clone, PartialEq)]
pub enum SaveOutcome {
    Inserted,
    /// Overwrote a record; carries the record as it was before the write.
    Updated(Box<Message>),
    /// The stored record already matched, nothing was written.
    Unchanged,
}

#[derive(Clone, Copy)]
enum Lookup<'a> {
    /// Server id, or temporary id of a message that has no server id yet.
    Key(&'a str),
    TempId(&'a str),
}

#[derive(Clone)]
pub struct LocalStore {
    db: sled::Db,
    messages: sled::Tree,
    message_ids: sled::Tree,
    timeline: sled::Tree,
    timestamps: sled::Tree,
    conversations: sled::Tree,
    presence: sled::Tree,
    temporary: bool,
}

impl LocalStore {
    const MESSAGES: &'static str = "messages";
    const MESSAGE_IDS: &'static str = "message_ids";
    const TIMELINE: &'static str = "conversation_timeline";
    const TIMESTAMPS: &'static str = "message_timestamps";
    const CONVERSATIONS: &'static str = "conversations";
    const PRESENCE: &'static str = "presence";

    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        std::fs::create_dir_all(path)
            .with_context(|| format!("failed to create storage directory {:?}", path))?;
        let db = sled::open(path)
            .with_context(|| format!("failed to open sled database at {:?}", path))?;
        Self::from_db(db, false).context("failed to open storage trees")
    }

    /// A store that lives only as long as the process.
    pub fn temporary() -> StoreResult<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db, true)
    }

    /// Open the store at `path`, degrading to a temporary store for this
    /// session when the directory is unusable.
    pub fn open_or_temporary(path: impl AsRef<Path>) -> Result<Self> {
        match Self::open(path.as_ref()) {
            Ok(store) => Ok(store),
            Err(err) => {
                warn!(error = ?err, path = ?path.as_ref(), "local store unavailable, continuing in memory only");
                Self::temporary().context("failed to open temporary store")
            }
        }
    }

    fn from_db(db: sled::Db, temporary: bool) -> StoreResult<Self> {
        Ok(Self {
            messages: db.open_tree(Self::MESSAGES)?,
            message_ids: db.open_tree(Self::MESSAGE_IDS)?,
            timeline: db.open_tree(Self::TIMELINE)?,
            timestamps: db.open_tree(Self::TIMESTAMPS)?,
            conversations: db.open_tree(Self::CONVERSATIONS)?,
            presence: db.open_tree(Self::PRESENCE)?,
            db,
            temporary,
        })
    }

    /// True when writes do not survive a restart.
    pub fn is_temporary(&self) -> bool {
        self.temporary
    }

    /// Insert or overwrite a message.
    ///
    /// A message carrying a server id overwrites the record already holding
    /// that id; one carrying a temporary id merges into the row composed with
    /// it. If both exist as separate rows the composed row wins and the other
    /// is folded into it.
    pub fn save_message(&self, message: &Message) -> StoreResult<SaveOutcome> {
        let outcome = (
            &self.messages,
            &self.message_ids,
            &self.timeline,
            &self.timestamps,
        )
            .transaction(|(messages, ids, timeline, timestamps)| {
                let mut incoming = message.clone();

                let id_row = match incoming.server_id() {
                    Some(id) => ids.get(id.as_bytes())?.map(|row| row_string(&row)),
                    None => None,
                };
                let mut temp_row = None;
                if let Some(temp_id) = incoming.temp_id() {
                    let candidate = keys::temp_row_key(temp_id);
                    if messages.get(candidate.as_bytes())?.is_some() {
                        temp_row = Some(candidate);
                    }
                }
                let row = temp_row
                    .clone()
                    .or_else(|| id_row.clone())
                    .unwrap_or_else(|| keys::row_key(&incoming.id));

                let mut folded = false;
                if let (Some(duplicate), Some(_)) = (&id_row, &temp_row) {
                    if *duplicate != row {
                        remove_row(messages, ids, timeline, timestamps, duplicate)?;
                        folded = true;
                    }
                }

                let existing: Option<Message> = match messages.get(row.as_bytes())? {
                    Some(bytes) => Some(decode(&bytes)?),
                    None => None,
                };
                if let Some(old) = &existing {
                    keep_local_identity(&mut incoming, old);
                    if !folded && *old == incoming {
                        return Ok(SaveOutcome::Unchanged);
                    }
                    unindex(timeline, timestamps, old, &row)?;
                    if let Some(old_id) = old.server_id() {
                        if incoming.server_id() != Some(old_id) {
                            ids.remove(old_id.as_bytes())?;
                        }
                    }
                }

                index(timeline, timestamps, &incoming, &row)?;
                if let Some(id) = incoming.server_id() {
                    ids.insert(id.as_bytes(), row.as_bytes())?;
                }
                messages.insert(row.as_bytes(), encode(&incoming)?)?;

                Ok(match existing {
                    Some(old) => SaveOutcome::Updated(Box::new(old)),
                    None => SaveOutcome::Inserted,
                })
            })?;
        self.db.flush()?;
        Ok(outcome)
    }

    /// Look up a message by server id, or by temporary id if it has none.
    pub fn get_message(&self, key: &str) -> Option<Message> {
        let row = match self.message_ids.get(key.as_bytes()) {
            Ok(Some(row)) => row,
            Ok(None) => IVec::from(keys::temp_row_key(key).as_bytes()),
            Err(err) => {
                warn!(error = %err, key, "message lookup failed");
                return None;
            }
        };
        self.load_row(&row).filter(|message| message.matches_key(key))
    }

    pub fn get_message_by_temp_id(&self, temp_id: &str) -> Option<Message> {
        self.load_row(keys::temp_row_key(temp_id).as_bytes())
    }

    /// The newest `limit` messages of a conversation in ascending timestamp order.
    pub fn get_messages_for_conversation(
        &self,
        conversation_id: &ConversationId,
        limit: usize,
    ) -> Vec<Message> {
        let prefix = keys::timeline_prefix(conversation_id);
        let entries = self.timeline.scan_prefix(&prefix).rev();
        self.collect_timeline(entries, prefix.len(), limit)
            .unwrap_or_else(|err| {
                warn!(error = %err, %conversation_id, "failed to read conversation messages");
                Vec::new()
            })
    }

    /// Up to `limit` messages strictly older than `before`, ascending.
    pub fn get_messages_page(
        &self,
        conversation_id: &ConversationId,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Vec<Message> {
        let prefix = keys::timeline_prefix(conversation_id);
        let bound = keys::timeline_bound(conversation_id, before);
        let entries = self.timeline.range(prefix.clone()..bound).rev();
        self.collect_timeline(entries, prefix.len(), limit)
            .unwrap_or_else(|err| {
                warn!(error = %err, %conversation_id, %before, "failed to read message page");
                Vec::new()
            })
    }

    /// Every message currently in `status`, across all conversations.
    pub fn get_messages_by_status(&self, status: MessageStatus) -> Vec<Message> {
        let mut found = Vec::new();
        for entry in self.messages.iter() {
            match entry {
                Ok((row, bytes)) => match bincode::deserialize::<Message>(&bytes) {
                    Ok(message) if message.status == status => found.push(message),
                    Ok(_) => {}
                    Err(err) => warn!(error = %err, row = %row_string(&row), "skipping corrupt message record"),
                },
                Err(err) => {
                    warn!(error = %err, "failed to scan messages");
                    return Vec::new();
                }
            }
        }
        found
    }

    /// Number of unread messages addressed to `user_id` in a conversation.
    pub fn count_unread(&self, conversation_id: &ConversationId, user_id: &str) -> usize {
        self.get_messages_for_conversation(conversation_id, usize::MAX)
            .iter()
            .filter(|message| message.is_unread_for(user_id))
            .count()
    }

    /// Timestamp of the newest stored message; the sync cursor.
    pub fn get_last_message_timestamp(&self) -> Option<DateTime<Utc>> {
        match self.timestamps.last() {
            Ok(Some((key, _))) => keys::decode_timestamp(&key),
            Ok(None) => None,
            Err(err) => {
                warn!(error = %err, "failed to read last message timestamp");
                None
            }
        }
    }

    /// Shallow-merge `update` into the message identified by `key`.
    pub fn update_message(&self, key: &str, update: &MessageUpdate) -> StoreResult<Option<Message>> {
        self.modify(Lookup::Key(key), update)
    }

    pub fn update_message_status(
        &self,
        key: &str,
        status: MessageStatus,
        extra: Option<MessageUpdate>,
    ) -> StoreResult<Option<Message>> {
        let mut update = extra.unwrap_or_default();
        update.status = Some(status);
        self.modify(Lookup::Key(key), &update)
    }

    /// Reconciliation entry point: applies `update` to the message composed
    /// with `temp_id`, whether or not it already carries a server id.
    pub fn update_message_by_temp_id(
        &self,
        temp_id: &str,
        update: &MessageUpdate,
    ) -> StoreResult<Option<Message>> {
        self.modify(Lookup::TempId(temp_id), update)
    }

    pub fn mark_message_as_edited(
        &self,
        key: &str,
        content: &str,
        edited_at: DateTime<Utc>,
    ) -> StoreResult<Option<Message>> {
        self.modify(Lookup::Key(key), &MessageUpdate::edited(content, edited_at))
    }

    pub fn mark_message_as_deleted(
        &self,
        key: &str,
        deleted_at: DateTime<Utc>,
    ) -> StoreResult<Option<Message>> {
        self.modify(Lookup::Key(key), &MessageUpdate::deleted(deleted_at))
    }

    pub fn mark_message_as_read(
        &self,
        key: &str,
        read_at: DateTime<Utc>,
    ) -> StoreResult<Option<Message>> {
        self.modify(Lookup::Key(key), &MessageUpdate::read(read_at))
    }

    /// Delete the oldest confirmed messages of a conversation beyond `keep`.
    /// Messages that never received a server id, and messages `reader` has
    /// not read yet, are never pruned.
    pub fn prune_conversation(
        &self,
        conversation_id: &ConversationId,
        keep: usize,
        reader: &str,
    ) -> StoreResult<usize> {
        let prefix = keys::timeline_prefix(conversation_id);
        let mut rows = Vec::new();
        for entry in self.timeline.scan_prefix(&prefix) {
            let (key, _) = entry?;
            rows.push(row_string(&key[prefix.len() + keys::TIMESTAMP_LEN..]));
        }
        if rows.len() <= keep {
            return Ok(0);
        }

        let excess = rows.len() - keep;
        let mut removed = 0;
        for row in rows.into_iter().take(excess) {
            let Some(message) = self.load_row(row.as_bytes()) else {
                continue;
            };
            if message.id.is_pending() || message.is_unread_for(reader) {
                continue;
            }
            (
                &self.messages,
                &self.message_ids,
                &self.timeline,
                &self.timestamps,
            )
                .transaction(|(messages, ids, timeline, timestamps)| {
                    remove_row(messages, ids, timeline, timestamps, &row)?;
                    Ok(())
                })?;
            removed += 1;
        }
        self.db.flush()?;
        if removed > 0 {
            info!(%conversation_id, removed, keep, "pruned conversation history");
        }
        Ok(removed)
    }

    /// Remove every record from every table.
    pub fn clear_all_data(&self) -> StoreResult<()> {
        for tree in [
            &self.messages,
            &self.message_ids,
            &self.timeline,
            &self.timestamps,
            &self.conversations,
            &self.presence,
        ] {
            tree.clear()?;
        }
        self.db.flush()?;
        info!("local store cleared");
        Ok(())
    }

    fn modify(&self, lookup: Lookup<'_>, update: &MessageUpdate) -> StoreResult<Option<Message>> {
        let result = (
            &self.messages,
            &self.message_ids,
            &self.timeline,
            &self.timestamps,
        )
            .transaction(|(messages, ids, timeline, timestamps)| {
                let row = match lookup {
                    Lookup::Key(key) => match ids.get(key.as_bytes())? {
                        Some(row) => row_string(&row),
                        None => keys::temp_row_key(key),
                    },
                    Lookup::TempId(temp_id) => keys::temp_row_key(temp_id),
                };
                let Some(bytes) = messages.get(row.as_bytes())? else {
                    return Ok(None);
                };
                let old: Message = decode(&bytes)?;
                let found = match lookup {
                    Lookup::Key(key) => old.matches_key(key),
                    Lookup::TempId(temp_id) => old.matches_temp_id(temp_id),
                };
                if !found {
                    return Ok(None);
                }

                let mut updated = old.clone();
                let rejected = updated.apply(update).err();

                if let Some(old_id) = old.server_id() {
                    if updated.server_id() != Some(old_id) {
                        ids.remove(old_id.as_bytes())?;
                    }
                }
                if let Some(id) = updated.server_id().map(str::to_string) {
                    if let Some(other) = ids.get(id.as_bytes())? {
                        let other = row_string(&other);
                        if other != row {
                            if let Some(remote) =
                                remove_row(messages, ids, timeline, timestamps, &other)?
                            {
                                absorb_remote_progress(&mut updated, &remote);
                            }
                        }
                    }
                    ids.insert(id.as_bytes(), row.as_bytes())?;
                }
                if old.timestamp != updated.timestamp {
                    unindex(timeline, timestamps, &old, &row)?;
                    index(timeline, timestamps, &updated, &row)?;
                }
                messages.insert(row.as_bytes(), encode(&updated)?)?;
                Ok(Some((updated, rejected)))
            })?;
        self.db.flush()?;

        Ok(result.map(|(message, rejected)| {
            if let Some(err) = rejected {
                debug!(error = %err, message_id = %message.id, "status change ignored");
            }
            message
        }))
    }

    fn load_row(&self, row: &[u8]) -> Option<Message> {
        match self.messages.get(row) {
            Ok(Some(bytes)) => match bincode::deserialize(&bytes) {
                Ok(message) => Some(message),
                Err(err) => {
                    warn!(error = %err, row = %row_string(row), "corrupt message record");
                    None
                }
            },
            Ok(None) => None,
            Err(err) => {
                warn!(error = %err, row = %row_string(row), "failed to read message");
                None
            }
        }
    }

    fn collect_timeline<I>(&self, entries: I, prefix_len: usize, limit: usize) -> StoreResult<Vec<Message>>
    where
        I: Iterator<Item = sled::Result<(IVec, IVec)>>,
    {
        let mut collected = Vec::new();
        for entry in entries {
            if collected.len() >= limit {
                break;
            }
            let (key, _) = entry?;
            let row = key.get(prefix_len + keys::TIMESTAMP_LEN..).unwrap_or_default();
            if let Some(message) = self.load_row(row) {
                collected.push(message);
            }
        }
        collected.reverse();
        Ok(collected)
    }
}

fn row_string(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> TxResult<T> {
    bincode::deserialize(bytes).map_err(|e| ConflictableTransactionError::Abort(StoreError::Codec(e)))
}

fn encode<T: Serialize>(value: &T) -> TxResult<Vec<u8>> {
    bincode::serialize(value).map_err(|e| ConflictableTransactionError::Abort(StoreError::Codec(e)))
}

fn index(
    timeline: &TransactionalTree,
    timestamps: &TransactionalTree,
    message: &Message,
    row: &str,
) -> std::result::Result<(), UnabortableTransactionError> {
    timeline.insert(
        keys::timeline_key(&message.conversation_id, message.timestamp, row),
        &b""[..],
    )?;
    timestamps.insert(keys::global_timestamp_key(message.timestamp, row), &b""[..])?;
    Ok(())
}

fn unindex(
    timeline: &TransactionalTree,
    timestamps: &TransactionalTree,
    message: &Message,
    row: &str,
) -> std::result::Result<(), UnabortableTransactionError> {
    timeline.remove(keys::timeline_key(&message.conversation_id, message.timestamp, row))?;
    timestamps.remove(keys::global_timestamp_key(message.timestamp, row))?;
    Ok(())
}

/// Drop a message row and its index entries, returning what was removed.
fn remove_row(
    messages: &TransactionalTree,
    ids: &TransactionalTree,
    timeline: &TransactionalTree,
    timestamps: &TransactionalTree,
    row: &str,
) -> TxResult<Option<Message>> {
    let Some(bytes) = messages.remove(row.as_bytes())? else {
        return Ok(None);
    };
    let message: Message = decode(&bytes)?;
    unindex(timeline, timestamps, &message, row)?;
    if let Some(id) = message.server_id() {
        if ids.get(id.as_bytes())?.as_deref() == Some(row.as_bytes()) {
            ids.remove(id.as_bytes())?;
        }
    }
    Ok(Some(message))
}

/// Keep the audit temp id and attempt count of the stored copy when the
/// incoming copy (typically from the server) does not carry them.
fn keep_local_identity(incoming: &mut Message, stored: &Message) {
    if let (Some(server_id), None, Some(temp_id)) =
        (incoming.server_id(), incoming.temp_id(), stored.temp_id())
    {
        incoming.id = MessageId::Confirmed {
            id: server_id.to_string(),
            temp_id: Some(temp_id.to_string()),
        };
    }
    if incoming.id.is_pending() && !stored.id.is_pending() {
        incoming.id = stored.id.clone();
    }
    if incoming.attempts == 0 {
        incoming.attempts = stored.attempts;
    }
}

/// Carry over delivery progress from a server copy that was synced before
/// the local row was reconciled.
fn absorb_remote_progress(local: &mut Message, remote: &Message) {
    let at = remote.read_at.unwrap_or_else(Utc::now);
    // rejected when the local copy is already at or past the server's status
    let _ = lifecycle::transition(local, remote.status, at);
}
