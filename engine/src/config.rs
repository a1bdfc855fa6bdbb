use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Runtime configuration for the sync engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Directory holding the sled database.
    pub data_dir: PathBuf,
    /// Base URL of the message API serving `/messages/sync`.
    pub api_base_url: String,
    /// How often the background sync runs.
    pub sync_interval: Duration,
    /// How long a send may wait for acknowledgment before it is marked failed.
    pub send_timeout: Duration,
    /// Messages hydrated when a conversation is opened.
    pub page_size: usize,
    /// Upper bound on send attempts per message, including the first.
    pub max_send_attempts: u32,
    /// Messages kept per conversation after a sync; `None` keeps everything.
    pub retention_per_conversation: Option<usize>,
}

impl EngineConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();
        let data_dir = env::var("CHATSYNC_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.data_dir);
        let api_base_url = env::var("CHATSYNC_API_BASE_URL")
            .unwrap_or(defaults.api_base_url)
            .trim_end_matches('/')
            .to_string();
        let sync_interval = parsed::<u64>("CHATSYNC_SYNC_INTERVAL_SECS")
            .map(Duration::from_secs)
            .unwrap_or(defaults.sync_interval);
        let send_timeout = parsed::<u64>("CHATSYNC_SEND_TIMEOUT_MS")
            .map(Duration::from_millis)
            .unwrap_or(defaults.send_timeout);
        let page_size = parsed("CHATSYNC_PAGE_SIZE").unwrap_or(defaults.page_size);
        let max_send_attempts =
            parsed("CHATSYNC_MAX_SEND_ATTEMPTS").unwrap_or(defaults.max_send_attempts);
        let retention_per_conversation = parsed("CHATSYNC_RETENTION_PER_CONVERSATION");

        Ok(Self {
            data_dir,
            api_base_url,
            sync_interval,
            send_timeout,
            page_size,
            max_send_attempts,
            retention_per_conversation,
        })
    }

    pub fn with_data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.data_dir = path.into();
        self
    }

    pub fn with_api_base_url(mut self, url: impl Into<String>) -> Self {
        self.api_base_url = url.into();
        self
    }

    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = interval;
        self
    }

    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_retention(mut self, keep: usize) -> Self {
        self.retention_per_conversation = Some(keep);
        self
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data/chatsync"),
            api_base_url: "http://localhost:3000".to_string(),
            sync_interval: Duration::from_secs(30),
            send_timeout: Duration::from_secs(10),
            page_size: 50,
            max_send_attempts: 3,
            retention_per_conversation: None,
        }
    }
}

fn parsed<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|value| value.parse().ok())
}
