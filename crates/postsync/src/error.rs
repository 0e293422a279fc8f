//! Error types for the synchronization layer.

use thiserror::Error;

use crate::PostId;

/// Errors surfaced by queries and mutations.
///
/// Cloneable so a failed fetch can be stored in its cache entry and handed
/// to every subscriber.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    /// The remote call could not complete.
    #[error("transport error: {0}")]
    Transport(String),

    /// The requested post exists neither in the cache nor on the remote.
    #[error("post not found: {0}")]
    NotFound(PostId),

    /// Request rejected before reaching the remote.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The remote answered with something we could not interpret.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// The task driving a remote call was dropped before it settled.
    #[error("cancelled: {0}")]
    Cancelled(String),
}

impl SyncError {
    /// Whether retrying the same call might succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::Transport(_) | SyncError::Cancelled(_))
    }
}

impl From<tokio::task::JoinError> for SyncError {
    fn from(err: tokio::task::JoinError) -> Self {
        SyncError::Cancelled(err.to_string())
    }
}
