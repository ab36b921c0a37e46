//! armada-engine — runs deployment workflows.
//!
//! The [`Orchestrator`] accepts rollout requests, plans them through the
//! strategy registry, and admits them for execution up to a configured
//! concurrency cap. Each admitted workflow is driven by a
//! [`WorkflowExecutor`] that holds the workflow's lock for the whole run,
//! executes phases step by step against the collaborators, and hands
//! control to the rollback plan when a breach or an operator asks for it.
//!
//! # Components
//!
//! - **`orchestrator`** — create/start/cancel/rollback/query, admission queue
//! - **`executor`** — phase scheduling, lanes, failure policy, settle
//! - **`step`** — dispatch, traffic actions, health waits, retries
//! - **`gate`** — monitoring windows, canary analysis, approvals
//! - **`lock`** — workflow lock acquisition and renewal
//! - **`repository`** / **`cache`** — persistence through store and cache
//! - **`control`** — cancel/rollback/lock-loss signals to a running executor
//! - **`report`** — statistics and health views

pub mod cache;
pub mod control;
pub mod error;
pub mod executor;
mod gate;
pub mod lock;
pub mod orchestrator;
pub mod report;
pub mod repository;
mod step;

pub use cache::WorkflowCache;
pub use control::{ApprovalGate, Control};
pub use error::{EngineError, EngineResult};
pub use executor::{Collaborators, ExecutorDeps, RollbackHandle, RunState, WorkflowExecutor};
pub use orchestrator::{Orchestrator, StartOutcome};
pub use report::{HealthReport, HealthStatus, WorkflowStatistics};
pub use repository::WorkflowRepository;
