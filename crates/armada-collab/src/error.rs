//! Collaborator error types.

use std::time::Duration;

use thiserror::Error;

/// Result type alias for collaborator calls.
pub type CollabResult<T> = Result<T, CollabError>;

/// Errors surfaced by external collaborators.
#[derive(Debug, Clone, Error)]
pub enum CollabError {
    #[error("collaborator unavailable: {0}")]
    Unavailable(String),

    #[error("request rejected: {0}")]
    Rejected(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("serialization error: {0}")]
    Serialization(String),
}
