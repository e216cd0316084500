//! Node error types.

use thiserror::Error;

/// Errors surfaced by the maintenance node.
#[derive(Debug, Error)]
pub enum NodeError {
    /// Chain store error.
    #[error("store error: {0}")]
    Store(#[from] blocksnap_core::Error),

    /// Snapshot engine error.
    #[error("snapshot error: {0}")]
    Snapshot(#[from] blocksnap_snapshot::SnapshotError),

    /// Status encoding error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// A maintenance task panicked or was cancelled.
    #[error("task error: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Result type for node operations.
pub type Result<T> = std::result::Result<T, NodeError>;
