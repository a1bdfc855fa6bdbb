use anyhow::Context;
use chatsync_engine::{init_tracing, AppState, EngineConfig, LocalStore, SyncIdentity, SyncService};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = EngineConfig::from_env()?;
    let user_id = std::env::var("CHATSYNC_USER_ID").context("CHATSYNC_USER_ID must be set")?;
    let token = std::env::var("CHATSYNC_TOKEN").context("CHATSYNC_TOKEN must be set")?;

    let store = LocalStore::open_or_temporary(&config.data_dir)?;
    info!(
        data_dir = ?config.data_dir,
        api = %config.api_base_url,
        persistent = !store.is_temporary(),
        "starting chatsync engine"
    );

    let state = AppState::new(config.clone(), store);
    state.set_current_user(user_id.clone());
    state.hydrate();

    let mut changes = state.subscribe();
    let sync = SyncService::spawn(
        state.clone(),
        SyncIdentity::new(user_id, token),
        config.sync_interval,
    );

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            result = &mut shutdown => {
                if let Err(err) = result {
                    warn!(error = %err, "failed to listen for shutdown signal");
                }
                break;
            }
            change = changes.recv() => match change {
                Ok(change) => debug!(?change, "state changed"),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "state change stream lagged"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    info!("shutting down");
    sync.shutdown().await;
    Ok(())
}
