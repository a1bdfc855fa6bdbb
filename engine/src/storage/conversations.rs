use chatsync_messaging::{Conversation, ConversationId, Presence};
use serde::de::DeserializeOwned;
use tracing::warn;

use super::{decode, encode, row_string, LocalStore, StoreResult};

impl LocalStore {
    pub fn save_conversation(&self, conversation: &Conversation) -> StoreResult<()> {
        let encoded = bincode::serialize(conversation)?;
        self.conversations
            .insert(conversation.id.as_str().as_bytes(), encoded)?;
        self.db.flush()?;
        Ok(())
    }

    pub fn get_conversation(&self, id: &ConversationId) -> Option<Conversation> {
        match self.conversations.get(id.as_str().as_bytes()) {
            Ok(Some(bytes)) => decode_logged(&bytes, id.as_str()),
            Ok(None) => None,
            Err(err) => {
                warn!(error = %err, conversation_id = %id, "failed to read conversation");
                None
            }
        }
    }

    /// All conversations, most recently updated first.
    pub fn get_all_conversations(&self) -> Vec<Conversation> {
        let mut conversations: Vec<Conversation> = scan_all(&self.conversations, "conversations");
        conversations.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        conversations
    }

    /// Read-modify-write of one conversation summary, atomic with respect to
    /// every other writer of the same record. `apply` may run more than once.
    pub fn update_conversation<F>(
        &self,
        id: &ConversationId,
        apply: F,
    ) -> StoreResult<Option<Conversation>>
    where
        F: Fn(Option<Conversation>) -> Option<Conversation>,
    {
        let key = id.as_str().as_bytes();
        let updated = self.conversations.transaction(|tree| {
            let current: Option<Conversation> = match tree.get(key)? {
                Some(bytes) => Some(decode(&bytes)?),
                None => None,
            };
            let next = apply(current);
            if let Some(conversation) = &next {
                tree.insert(key, encode(conversation)?)?;
            }
            Ok(next)
        })?;
        self.db.flush()?;
        Ok(updated)
    }

    pub fn update_conversation_unread_count(
        &self,
        id: &ConversationId,
        unread_count: u32,
    ) -> StoreResult<Option<Conversation>> {
        self.update_conversation(id, |current| {
            current.map(|mut conversation| {
                conversation.unread_count = unread_count;
                conversation
            })
        })
    }

    pub fn clear_unread_count(&self, id: &ConversationId) -> StoreResult<Option<Conversation>> {
        self.update_conversation_unread_count(id, 0)
    }

    pub fn update_user_presence(&self, presence: &Presence) -> StoreResult<()> {
        let encoded = bincode::serialize(presence)?;
        self.presence.insert(presence.user_id.as_bytes(), encoded)?;
        self.db.flush()?;
        Ok(())
    }

    pub fn get_user_presence(&self, user_id: &str) -> Option<Presence> {
        match self.presence.get(user_id.as_bytes()) {
            Ok(Some(bytes)) => decode_logged(&bytes, user_id),
            Ok(None) => None,
            Err(err) => {
                warn!(error = %err, user_id, "failed to read presence");
                None
            }
        }
    }

    pub fn get_all_presence(&self) -> Vec<Presence> {
        scan_all(&self.presence, "presence")
    }
}

fn decode_logged<T: DeserializeOwned>(bytes: &[u8], key: &str) -> Option<T> {
    match bincode::deserialize(bytes) {
        Ok(value) => Some(value),
        Err(err) => {
            warn!(error = %err, key, "corrupt record");
            None
        }
    }
}

fn scan_all<T: DeserializeOwned>(tree: &sled::Tree, table: &'static str) -> Vec<T> {
    let mut records = Vec::new();
    for entry in tree.iter() {
        match entry {
            Ok((key, bytes)) => {
                if let Some(record) = decode_logged(&bytes, &row_string(&key)) {
                    records.push(record);
                }
            }
            Err(err) => {
                warn!(error = %err, table, "failed to scan table");
                return Vec::new();
            }
        }
    }
    records
}
