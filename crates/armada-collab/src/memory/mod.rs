//! In-process collaborators for tests and local simulation.
//!
//! None of these persist anything or talk to the network. Time-based
//! behavior (lock and cache expiry) uses `tokio::time`, so paused-clock
//! tests see consistent expiry.

mod broker;
mod kv;
mod metrics;
mod traffic;

pub use broker::MemoryBroker;
pub use kv::MemoryKeyValueStore;
pub use metrics::StaticMetricsFeed;
pub use traffic::{MemoryTrafficController, TrafficEvent};
