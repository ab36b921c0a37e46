//! Validation errors shared by the strategy planner and the orchestrator.

use thiserror::Error;

use crate::strategy::StrategyKind;

/// Result type alias for validation.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// A request or configuration rejected before anything is persisted.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("unsupported strategy: {0}")]
    UnsupportedStrategy(StrategyKind),

    #[error("planner for {planner} cannot plan a {config} configuration")]
    ConfigMismatch {
        planner: StrategyKind,
        config: StrategyKind,
    },

    #[error("no target hosts")]
    NoTargets,

    #[error("duplicate target host: {0}")]
    DuplicateHost(String),

    #[error("host not in target list: {0}")]
    UnknownHost(String),

    #[error("missing field: {0}")]
    MissingField(&'static str),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("availability requirement cannot be met: {0}")]
    Availability(String),

    #[error("no rollback version available")]
    NoRollbackVersion,
}
