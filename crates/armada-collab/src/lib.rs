//! armada-collab — interfaces to the systems the orchestrator drives.
//!
//! The orchestrator never talks to hosts, the key/value store, the load
//! balancer, or the monitoring stack directly; it goes through the async
//! traits defined here. Production deployments plug in broker/KV/LB
//! clients; the [`memory`] module provides in-process implementations for
//! tests and the daemon's simulation mode.
//!
//! # Interfaces
//!
//! | Trait | Collaborator | Used by |
//! |---|---|---|
//! | [`CommandDispatcher`] | message broker | step execution |
//! | [`KeyValueStore`] | lock + snapshot cache | orchestrator, executor |
//! | [`TrafficController`] | load balancer | blue-green / canary traffic steps |
//! | [`MetricsFeed`] | monitoring | rollback evaluator, health waits |

pub mod dispatch;
pub mod error;
pub mod kv;
pub mod memory;
pub mod metrics;
pub mod traffic;

pub use dispatch::CommandDispatcher;
pub use error::{CollabError, CollabResult};
pub use kv::{KeyValueStore, LockLease};
pub use metrics::{MetricFilter, MetricsFeed};
pub use traffic::TrafficController;
