//! Engine error types.

use chanvault_protocol::ProtocolError;
use chanvault_transfer::TransferError;

use crate::transport::TransportError;

/// Errors produced by an upload or download job.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("transfer error: {0}")]
    Transfer(#[from] TransferError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("no manifest among the last {window} messages")]
    ManifestNotFound { window: usize },

    #[error("upload incomplete, chunks failed: {failed:?}")]
    PartiallyFailed { failed: Vec<u32> },

    #[error("download incomplete, chunks missing: {missing:?}")]
    IncompleteTransfer { missing: Vec<u32> },

    #[error("cancelled")]
    Aborted,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("task error: {0}")]
    Task(String),
}

impl From<tokio::task::JoinError> for EngineError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::Task(e.to_string())
    }
}
