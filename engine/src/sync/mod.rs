//! Pull-based delta sync against the message API.
//!
//! The cursor is the newest locally stored timestamp. Everything newer is
//! fetched, persisted straight into the local store (the affected
//! conversations need not be open) and folded into conversation summaries.
//! A failed pass leaves the cursor where it was, so the next pass retries
//! the same window; re-persisting a known message is an overwrite.

mod service;

pub use service::{SyncIdentity, SyncService};

use std::collections::BTreeSet;

use async_trait::async_trait;
use chatsync_messaging::wire::{RemoteMessage, SyncResponse};
use chatsync_messaging::ConversationId;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::Client;
use tracing::{debug, info, warn};

use crate::aggregator::{self, Arrival};
use crate::storage::{LocalStore, SaveOutcome, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("sync request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("sync endpoint returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("sync source unavailable: {0}")]
    Unavailable(String),
    #[error("failed to persist synced message: {0}")]
    Store(#[from] StoreError),
}

/// Server collaborator answering "everything newer than the cursor".
#[async_trait]
pub trait SyncSource: Send + Sync {
    async fn fetch_since(
        &self,
        cursor: Option<DateTime<Utc>>,
        credential: &str,
    ) -> Result<Vec<RemoteMessage>, SyncError>;
}

/// `GET {base}/messages/sync?lastMessageTimestamp=<ISO8601|empty>` with bearer auth.
pub struct HttpSyncClient {
    client: Client,
    base_url: String,
}

impl HttpSyncClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl SyncSource for HttpSyncClient {
    async fn fetch_since(
        &self,
        cursor: Option<DateTime<Utc>>,
        credential: &str,
    ) -> Result<Vec<RemoteMessage>, SyncError> {
        let url = format!("{}/messages/sync", self.base_url);
        let cursor = cursor
            .map(|ts| ts.to_rfc3339_opts(SecondsFormat::AutoSi, true))
            .unwrap_or_default();

        let response = self
            .client
            .get(&url)
            .query(&[("lastMessageTimestamp", cursor.as_str())])
            .bearer_auth(credential)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(SyncError::Status { status, body });
        }

        let body: SyncResponse = response.json().await?;
        Ok(body.messages)
    }
}

/// What one sync pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub cursor: Option<DateTime<Utc>>,
    pub fetched: usize,
    pub inserted: usize,
    pub updated: usize,
    /// Redelivered messages that already matched the stored copy.
    pub unchanged: usize,
    pub pruned: usize,
    pub conversations: BTreeSet<ConversationId>,
}

/// Run one delta-sync pass for `user_id`.
///
/// Messages are persisted oldest first and the pass stops at the first write
/// failure, so the cursor never moves past a message that was not stored.
pub async fn sync_once(
    store: &LocalStore,
    source: &dyn SyncSource,
    user_id: &str,
    credential: &str,
    retention: Option<usize>,
) -> Result<SyncReport, SyncError> {
    let cursor = store.get_last_message_timestamp();
    debug!(?cursor, user_id, "sync pass starting");

    let mut remote = source.fetch_since(cursor, credential).await?;
    remote.sort_by_key(|message| message.timestamp);

    let mut report = SyncReport {
        cursor,
        fetched: remote.len(),
        ..SyncReport::default()
    };

    for incoming in remote {
        let message = incoming.into_message();
        let arrival = match store.save_message(&message)? {
            SaveOutcome::Inserted => {
                report.inserted += 1;
                Arrival::New
            }
            SaveOutcome::Updated(previous) => {
                report.updated += 1;
                Arrival::Changed {
                    was_unread: previous.is_unread_for(user_id),
                }
            }
            SaveOutcome::Unchanged => {
                report.unchanged += 1;
                continue;
            }
        };
        if let Err(err) = store.update_conversation(&message.conversation_id, |existing| {
            Some(aggregator::apply_message(existing, &message, user_id, arrival))
        }) {
            warn!(error = %err, conversation_id = %message.conversation_id, "failed to update conversation summary");
        }
        report.conversations.insert(message.conversation_id.clone());
    }

    if let Some(keep) = retention {
        for conversation_id in &report.conversations {
            match store.prune_conversation(conversation_id, keep, user_id) {
                Ok(pruned) => report.pruned += pruned,
                Err(err) => warn!(error = %err, %conversation_id, "retention pass failed"),
            }
        }
    }

    info!(
        fetched = report.fetched,
        inserted = report.inserted,
        updated = report.updated,
        unchanged = report.unchanged,
        pruned = report.pruned,
        conversations = report.conversations.len(),
        "sync pass complete"
    );
    Ok(report)
}
