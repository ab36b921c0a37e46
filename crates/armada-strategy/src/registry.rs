//! Explicit planner registry, built once and passed to the orchestrator.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use armada_core::{StrategyKind, ValidationError, ValidationResult};

use crate::blue_green::BlueGreenPlanner;
use crate::canary::CanaryPlanner;
use crate::planner::StrategyPlanner;
use crate::rolling::RollingPlanner;

#[derive(Clone, Default)]
pub struct StrategyRegistry {
    planners: HashMap<StrategyKind, Arc<dyn StrategyPlanner>>,
}

impl StrategyRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rolling, blue-green and canary planners. `Immediate` and
    /// `Scheduled` have no planner.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(RollingPlanner));
        registry.register(Arc::new(BlueGreenPlanner));
        registry.register(Arc::new(CanaryPlanner));
        registry
    }

    /// Add or replace the planner for its kind.
    pub fn register(&mut self, planner: Arc<dyn StrategyPlanner>) {
        debug!(strategy = %planner.kind(), "planner registered");
        self.planners.insert(planner.kind(), planner);
    }

    pub fn resolve(&self, kind: StrategyKind) -> ValidationResult<Arc<dyn StrategyPlanner>> {
        self.planners
            .get(&kind)
            .cloned()
            .ok_or(ValidationError::UnsupportedStrategy(kind))
    }

    pub fn supports(&self, kind: StrategyKind) -> bool {
        self.planners.contains_key(&kind)
    }
}
