use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::state::AppState;

/// Identity and bearer credential supplied by the session layer.
#[derive(Clone)]
pub struct SyncIdentity {
    pub user_id: String,
    pub credential: String,
}

impl SyncIdentity {
    pub fn new(user_id: impl Into<String>, credential: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            credential: credential.into(),
        }
    }
}

impl std::fmt::Debug for SyncIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncIdentity")
            .field("user_id", &self.user_id)
            .field("credential", &"<redacted>")
            .finish()
    }
}

enum SyncCommand {
    Now,
    Shutdown,
}

/// Background task running the sync protocol on a timer and on demand.
pub struct SyncService {
    command_tx: mpsc::Sender<SyncCommand>,
    task: JoinHandle<()>,
}

impl SyncService {
    /// Start the loop. The first pass runs immediately.
    pub fn spawn(state: Arc<AppState>, identity: SyncIdentity, every: Duration) -> Self {
        let (command_tx, command_rx) = mpsc::channel(8);
        let task = tokio::spawn(run(state, identity, every, command_rx));
        Self { command_tx, task }
    }

    /// Request an immediate pass, e.g. after the transport reconnects.
    pub async fn trigger(&self) {
        if self.command_tx.send(SyncCommand::Now).await.is_err() {
            warn!("sync service is not running");
        }
    }

    pub async fn shutdown(self) {
        let _ = self.command_tx.send(SyncCommand::Shutdown).await;
        if let Err(err) = self.task.await {
            warn!(error = %err, "sync service join error");
        }
    }
}

async fn run(
    state: Arc<AppState>,
    identity: SyncIdentity,
    every: Duration,
    mut command_rx: mpsc::Receiver<SyncCommand>,
) {
    let mut timer = interval(every);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(user_id = %identity.user_id, interval = ?every, "sync service started");

    loop {
        tokio::select! {
            _ = timer.tick() => {
                state.sync_messages(&identity.user_id, &identity.credential).await;
            }
            cmd = command_rx.recv() => {
                match cmd {
                    Some(SyncCommand::Now) => {
                        debug!("sync requested");
                        state.sync_messages(&identity.user_id, &identity.credential).await;
                        timer.reset();
                    }
                    Some(SyncCommand::Shutdown) | None => break,
                }
            }
        }
    }
    info!("sync service stopped");
}
