//! Outbound message pipeline: optimistic insert, transport send, reconciliation.

mod pipeline;

pub use pipeline::{MessagePipeline, PipelineConfig};

use chatsync_messaging::MessageStatus;

/// Errors that can occur in the messaging pipeline.
///
/// Delivery failures are not errors here; they land on the message as
/// [`MessageStatus::Failed`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PipelineError {
    #[error("no current user")]
    NoCurrentUser,
    #[error("no message with temporary id {0}")]
    NotFound(String),
    #[error("only failed messages can be retried, message is {status}")]
    NotRetryable { status: MessageStatus },
    #[error("giving up after {attempts} attempts")]
    AttemptsExhausted { attempts: u32 },
}

pub type Result<T> = std::result::Result<T, PipelineError>;

/// Progress report for one outgoing message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReceipt {
    pub temp_id: String,
    pub status: MessageStatus,
    /// Known once the server accepted the message.
    pub server_id: Option<String>,
    pub attempt: u32,
}
