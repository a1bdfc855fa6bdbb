pub mod aggregator;
pub mod config;
pub mod messaging;
pub mod state;
pub mod storage;
pub mod sync;
pub mod transport;

pub use config::EngineConfig;
pub use messaging::{MessagePipeline, PipelineConfig};
pub use state::{AppState, StateChange};
pub use storage::LocalStore;
pub use sync::{SyncIdentity, SyncService};

use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

pub fn init_tracing() {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}
