//! armada-rollback — decides when a rollout must be reverted.
//!
//! The [`RollbackEvaluator`] pulls metric windows from the monitoring
//! collaborator and compares them against a workflow's rollback
//! conditions and canary advancement criteria. It never changes workflow
//! state itself; the [`RollbackMonitor`] runs it periodically per workflow
//! and hands breaches to a callback (the orchestrator's auto-rollback).
//!
//! # Components
//!
//! - **`evaluator`** — condition and advancement judgements
//! - **`monitor`** — cancellable per-workflow evaluation loops

pub mod evaluator;
pub mod monitor;

pub use evaluator::{AdvancementDecision, Breach, ConditionOutcome, RollbackEvaluator, metric_for};
pub use monitor::{BoxFuture, MonitorSpec, RollbackCallback, RollbackMonitor};
