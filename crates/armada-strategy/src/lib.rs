//! armada-strategy — turns a rollout request into an ordered phase plan.
//!
//! Planning is pure: a planner validates configuration and produces
//! [`Phase`](armada_core::Phase)s up front; it never dispatches anything.
//! Planners are looked up through an explicit [`StrategyRegistry`] built at
//! process start and handed to the orchestrator.
//!
//! # Planners
//!
//! - **`rolling`** — waves (fixed size, percentage, geographic, custom, adaptive)
//! - **`blue_green`** — deploy to the idle environment, verify, switch, monitor
//! - **`canary`** — canary subset, traffic split, analysis, promotion

pub mod blue_green;
pub mod canary;
pub mod plan;
pub mod planner;
pub mod registry;
pub mod rolling;

pub use blue_green::BlueGreenPlanner;
pub use canary::CanaryPlanner;
pub use plan::{PlanContext, verify_partition};
pub use planner::{PlanRequest, StrategyPlanner};
pub use registry::StrategyRegistry;
pub use rolling::RollingPlanner;
