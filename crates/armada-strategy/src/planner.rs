//! The planner contract shared by every strategy.

use std::time::Duration;

use armada_core::{
    CreateWorkflowRequest, ExecutionPolicy, Phase, RollbackCondition, StrategyConfig,
    StrategyKind, TargetHost, ValidationResult, Workflow,
};

/// Everything a planner needs to lay out a workflow.
#[derive(Debug, Clone)]
pub struct PlanRequest {
    pub workflow_id: String,
    pub service: String,
    pub version: String,
    pub previous_version: Option<String>,
    pub package: String,
    pub hosts: Vec<TargetHost>,
    pub strategy: StrategyConfig,
}

impl PlanRequest {
    pub fn from_request(workflow_id: &str, request: &CreateWorkflowRequest) -> Self {
        Self {
            workflow_id: workflow_id.to_string(),
            service: request.service.clone(),
            version: request.version.clone(),
            previous_version: request.previous_version.clone(),
            package: request.package.clone(),
            hosts: request.hosts.clone(),
            strategy: request.strategy.clone(),
        }
    }
}

/// A rollout strategy.
///
/// Implementations are stateless; one instance serves every workflow of its
/// kind and is resolved once, when the workflow is created.
pub trait StrategyPlanner: Send + Sync {
    fn kind(&self) -> StrategyKind;

    /// Reject configurations this planner cannot execute.
    fn validate_configuration(&self, config: &StrategyConfig) -> ValidationResult<()>;

    /// Build the forward plan. Deployment phases partition `request.hosts`.
    fn create_phases(&self, request: &PlanRequest) -> ValidationResult<Vec<Phase>>;

    fn estimate_execution_time(
        &self,
        hosts: &[TargetHost],
        config: &StrategyConfig,
    ) -> ValidationResult<Duration>;

    fn execution_policy(&self, config: &StrategyConfig) -> ExecutionPolicy;

    /// Conditions the strategy watches when the request brings none.
    fn default_rollback_conditions(&self, config: &StrategyConfig) -> Vec<RollbackCondition>;

    /// Evaluation cadence for background rollback monitoring, if the
    /// strategy configures one.
    fn monitoring_interval(&self, config: &StrategyConfig) -> Option<Duration>;

    /// Build the reverse plan for a workflow that has started. Only
    /// touched hosts are reverted.
    fn create_rollback_phases(
        &self,
        workflow: &Workflow,
        to_version: Option<&str>,
    ) -> ValidationResult<Vec<Phase>>;

    /// Resize the not-yet-started phase at `next` from the outcome of the
    /// phases before it. Returns true if the plan changed.
    fn adapt_next_phase(&self, _workflow: &mut Workflow, _next: usize) -> bool {
        false
    }
}
