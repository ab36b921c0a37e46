//! Engine error types.

use thiserror::Error;

use armada_collab::CollabError;
use armada_core::{ValidationError, WorkflowStatus};
use armada_state::StateError;

/// Errors surfaced by the orchestrator and executor.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("workflow not found: {0}")]
    NotFound(String),

    #[error("workflow {id} is {status}, cannot {action}")]
    InvalidState {
        id: String,
        status: WorkflowStatus,
        action: &'static str,
    },

    #[error("lock error: {0}")]
    Lock(String),

    #[error("admission rejected: {0}")]
    Admission(String),

    #[error("execution failed: {0}")]
    Execution(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("rollback failed: {0}")]
    Rollback(String),

    #[error("state store error: {0}")]
    State(#[from] StateError),

    #[error("collaborator error: {0}")]
    Collab(#[from] CollabError),
}

pub type EngineResult<T> = Result<T, EngineError>;
