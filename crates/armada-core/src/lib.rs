//! armada-core — shared types for the Armada deployment orchestrator.
//!
//! Defines the persisted shape of a rollout: a [`Workflow`] owns an ordered
//! list of [`Phase`]s, each of which owns the [`Step`]s dispatched to
//! individual hosts. Strategy configuration is a closed tagged enum
//! ([`StrategyConfig`]) validated when a workflow is created.
//!
//! # Modules
//!
//! - **`model`** — workflow/phase/step state machines, rollback config, error log
//! - **`strategy`** — per-strategy configuration (Rolling, BlueGreen, Canary)
//! - **`command`** — the canonical command schema sent to hosts and traffic actions
//! - **`request`** — rollout requests as submitted by callers
//! - **`config`** — orchestrator configuration (admission bounds, lock TTLs)
//! - **`error`** — validation errors shared by the planner and orchestrator

pub mod command;
pub mod config;
pub mod error;
pub mod model;
pub mod request;
pub mod strategy;

pub use command::{CommandReply, DeploymentCommand, SplitMethod, TrafficAction, TrafficRoute};
pub use config::OrchestratorConfig;
pub use error::{ValidationError, ValidationResult};
pub use model::*;
pub use request::CreateWorkflowRequest;
pub use strategy::*;
