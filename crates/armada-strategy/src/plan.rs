//! Phase and step construction shared by the planners.

use std::collections::HashSet;
use std::time::Duration;

use armada_core::{
    DeploymentCommand, HostId, Phase, PhaseKind, RetryPolicy, Step, StepStatus, StepType,
    TargetHost, TrafficAction, ValidationError, ValidationResult, Workflow,
};

/// Rough per-action durations used by the estimators.
pub(crate) const DEPLOY_ESTIMATE: Duration = Duration::from_secs(60);
pub(crate) const CHECK_ESTIMATE: Duration = Duration::from_secs(10);

/// Identity and step defaults for one plan.
#[derive(Debug, Clone)]
pub struct PlanContext {
    pub workflow_id: String,
    pub service: String,
    pub version: String,
    pub package: String,
    pub step_timeout_secs: u64,
    pub max_retries: u32,
    pub retry: RetryPolicy,
}

impl PlanContext {
    pub fn new(workflow_id: &str, service: &str, version: &str, package: &str) -> Self {
        Self {
            workflow_id: workflow_id.to_string(),
            service: service.to_string(),
            version: version.to_string(),
            package: package.to_string(),
            step_timeout_secs: 300,
            max_retries: 3,
            retry: RetryPolicy::default(),
        }
    }

    pub fn for_workflow(workflow: &Workflow) -> Self {
        Self::new(&workflow.id, &workflow.service, &workflow.version, &workflow.package)
    }

    pub fn steps(mut self, timeout_secs: u64, max_retries: u32, backoff_secs: u64) -> Self {
        self.step_timeout_secs = timeout_secs;
        self.max_retries = max_retries;
        self.retry = RetryPolicy::from_secs(backoff_secs);
        self
    }

    /// Same context deploying a different version (rollback plans).
    pub fn targeting(&self, version: &str) -> Self {
        let mut ctx = self.clone();
        ctx.version = version.to_string();
        ctx.package = format!("{}-{version}", self.service);
        ctx
    }

    /// A new phase with id `phase-{index:02}-{name}`.
    pub fn phase(&self, index: usize, name: &str, kind: PhaseKind) -> Phase {
        let mut phase = Phase::new(format!("phase-{index:02}-{name}"), name, kind);
        phase.retry = self.retry;
        phase
    }

    /// Append a step for `host` (or the whole service when `None`).
    pub fn add_step<'a>(
        &self,
        phase: &'a mut Phase,
        step_type: StepType,
        host: Option<&str>,
        critical: bool,
    ) -> &'a mut Step {
        let id = format!("{}/s{:03}", phase.id, phase.steps.len());
        let command = DeploymentCommand::new(
            &self.workflow_id,
            &id,
            step_type,
            &self.service,
            &self.version,
            &self.package,
            host,
        );
        let name = match host {
            Some(h) => format!("{step_type} {h}"),
            None => format!("{step_type} {}", self.service),
        };
        phase.steps.push(Step {
            id,
            name,
            step_type,
            host: host.map(str::to_string),
            command,
            traffic: None,
            status: StepStatus::Pending,
            critical,
            max_retries: self.max_retries,
            attempts: 0,
            timeout_secs: self.step_timeout_secs,
            output: None,
            error: None,
            started_at: None,
            completed_at: None,
        });
        let last = phase.steps.len() - 1;
        &mut phase.steps[last]
    }

    /// Append a load-balancer step. Host-scoped actions land in the host's lane.
    pub fn add_traffic_step<'a>(&self, phase: &'a mut Phase, action: TrafficAction) -> &'a mut Step {
        let host = match &action {
            TrafficAction::AddToPool { host, .. }
            | TrafficAction::RemoveFromPool { host, .. }
            | TrafficAction::PoolHealthCheck { host, .. } => Some(host.clone()),
            TrafficAction::Switch { .. } => None,
        };
        let step = self.add_step(phase, StepType::TrafficSwitch, host.as_deref(), true);
        step.name = match &action {
            TrafficAction::AddToPool { pool, host } => format!("add {host} to {pool}"),
            TrafficAction::RemoveFromPool { pool, host } => format!("remove {host} from {pool}"),
            TrafficAction::PoolHealthCheck { pool, host } => format!("check {host} in {pool}"),
            TrafficAction::Switch { route } => {
                format!("route {}% to {}", route.percentage, route.pool)
            }
        };
        step.traffic = Some(action);
        step
    }

    /// Time budget for a phase whose lanes run `steps` steps each, `rounds`
    /// lane batches deep, with every step allowed all its retries.
    pub fn phase_budget(&self, steps: usize, rounds: usize) -> u64 {
        let attempts = self.max_retries as u64 + 1;
        self.step_timeout_secs * attempts * (steps * rounds.max(1)) as u64 + 60
    }

    /// Pre-flight: a critical health check on every host.
    pub fn pre_deployment(&self, index: usize, hosts: &[TargetHost], max_parallelism: u32) -> Phase {
        let mut phase = self.phase(index, "pre-deployment", PhaseKind::PreDeployment);
        for host in hosts {
            self.add_step(&mut phase, StepType::HealthCheck, Some(&host.id), true);
        }
        phase.hosts = hosts.iter().map(|h| h.id.clone()).collect();
        phase.parallel = true;
        phase.max_parallelism = max_parallelism.max(1);
        phase.timeout_secs = self.phase_budget(1, hosts.len().div_ceil(phase.max_parallelism as usize));
        phase
    }

    /// Post-deployment: service-level validation and cleanup.
    pub fn post_deployment(&self, index: usize, hosts: &[TargetHost]) -> Phase {
        let mut phase = self.phase(index, "post-deployment", PhaseKind::PostDeployment);
        self.add_step(&mut phase, StepType::Validation, None, false);
        self.add_step(&mut phase, StepType::Cleanup, None, false);
        phase.hosts = hosts.iter().map(|h| h.id.clone()).collect();
        phase.max_failures = 1;
        phase.timeout_secs = self.phase_budget(2, 1);
        phase
    }
}

/// Ceiling of `total * percent / 100`, at least one.
pub(crate) fn share_of(total: usize, percent: f64) -> usize {
    ((total as f64 * percent / 100.0).ceil() as usize).max(1)
}

pub(crate) fn check_percentage(name: &str, value: f64) -> ValidationResult<()> {
    if value.is_nan() || value <= 0.0 || value > 100.0 {
        return Err(ValidationError::InvalidConfig(format!(
            "{name} must be in (0, 100], got {value}"
        )));
    }
    Ok(())
}

/// Largest number of hosts that may be out of service at once while
/// honoring the availability floors.
pub(crate) fn max_unavailable(
    total: usize,
    min_percentage: Option<f64>,
    min_instances: Option<u32>,
) -> ValidationResult<usize> {
    let mut required = 0usize;
    if let Some(pct) = min_percentage {
        if pct.is_nan() || !(0.0..=100.0).contains(&pct) {
            return Err(ValidationError::InvalidConfig(format!(
                "minimum_available_percentage must be in [0, 100], got {pct}"
            )));
        }
        required = required.max((total as f64 * pct / 100.0).ceil() as usize);
    }
    if let Some(n) = min_instances {
        required = required.max(n as usize);
    }
    if required > total {
        return Err(ValidationError::Availability(format!(
            "{required} hosts must stay available but only {total} are targeted"
        )));
    }
    Ok(total - required)
}

/// Reject a partition where `concurrent` consecutive groups, running
/// together, take more hosts down than allowed.
pub(crate) fn check_availability(
    groups: &[Vec<HostId>],
    total: usize,
    concurrent: usize,
    min_percentage: Option<f64>,
    min_instances: Option<u32>,
) -> ValidationResult<()> {
    let allowed = max_unavailable(total, min_percentage, min_instances)?;
    let sizes: Vec<usize> = groups.iter().map(Vec::len).collect();
    let window = concurrent.clamp(1, sizes.len().max(1));
    let largest = sizes
        .windows(window)
        .map(|w| w.iter().sum::<usize>())
        .max()
        .unwrap_or(0);
    if largest > allowed {
        return Err(ValidationError::Availability(format!(
            "{largest} hosts down at once across {window} concurrent group(s) leaves fewer than \
             the required available instances (at most {allowed} of {total} may be unavailable)"
        )));
    }
    Ok(())
}

/// Check that the `Deployment` phases cover every target host exactly once.
pub fn verify_partition(phases: &[Phase], hosts: &[TargetHost]) -> ValidationResult<()> {
    let targets: HashSet<&str> = hosts.iter().map(|h| h.id.as_str()).collect();
    let mut seen = HashSet::new();
    for phase in phases.iter().filter(|p| p.is_deployment()) {
        for host in &phase.hosts {
            if !targets.contains(host.as_str()) {
                return Err(ValidationError::UnknownHost(host.clone()));
            }
            if !seen.insert(host.as_str()) {
                return Err(ValidationError::DuplicateHost(host.clone()));
            }
        }
    }
    if let Some(missing) = hosts.iter().find(|h| !seen.contains(h.id.as_str())) {
        return Err(ValidationError::InvalidConfig(format!(
            "host {} is not covered by any deployment phase",
            missing.id
        )));
    }
    Ok(())
}

/// `Deployment` phases that have started, in plan order.
pub(crate) fn touched_deployments(workflow: &Workflow) -> Vec<&Phase> {
    workflow
        .phases
        .iter()
        .filter(|p| p.is_deployment() && p.status != armada_core::PhaseStatus::Pending)
        .collect()
}

/// Version a rollback reverts to: explicit, then configured, then previous.
pub(crate) fn rollback_version(workflow: &Workflow, to_version: Option<&str>) -> ValidationResult<String> {
    to_version
        .map(str::to_string)
        .or_else(|| workflow.rollback.as_ref().and_then(|r| r.target_version.clone()))
        .or_else(|| workflow.previous_version.clone())
        .ok_or(ValidationError::NoRollbackVersion)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hosts(n: usize) -> Vec<TargetHost> {
        (0..n).map(|i| TargetHost::new(format!("web-{i:02}"))).collect()
    }

    #[test]
    fn step_ids_are_deterministic() {
        let ctx = PlanContext::new("wf", "api", "2.0.0", "api-2.0.0");
        let mut phase = ctx.phase(3, "wave-1", PhaseKind::Deployment);
        assert_eq!(phase.id, "phase-03-wave-1");
        ctx.add_step(&mut phase, StepType::Deploy, Some("web-01"), true);
        let step = ctx.add_step(&mut phase, StepType::HealthCheck, Some("web-01"), true);
        assert_eq!(step.id, "phase-03-wave-1/s001");
        assert_eq!(step.command.idempotency_key, "wf/phase-03-wave-1/s001");
    }

    // The returned step borrows from the phase, not the context.
    fn deploy_with_fresh_context(phase: &mut Phase) -> &mut Step {
        PlanContext::new("wf", "api", "2.0.0", "api-2.0.0").add_step(
            phase,
            StepType::Deploy,
            Some("web-01"),
            true,
        )
    }

    fn drain_with_fresh_context(phase: &mut Phase) -> &mut Step {
        PlanContext::new("wf", "api", "2.0.0", "api-2.0.0").add_traffic_step(
            phase,
            TrafficAction::RemoveFromPool {
                pool: "api-blue".into(),
                host: "web-01".into(),
            },
        )
    }

    #[test]
    fn steps_outlive_the_context_that_built_them() {
        let mut phase = PlanContext::new("wf", "api", "2.0.0", "api-2.0.0")
            .phase(1, "wave-1", PhaseKind::Deployment);
        deploy_with_fresh_context(&mut phase).max_retries = 7;
        drain_with_fresh_context(&mut phase).critical = false;
        assert_eq!(phase.steps.len(), 2);
        assert_eq!(phase.steps[0].max_retries, 7);
        assert!(!phase.steps[1].critical);
        assert!(phase.steps[1].traffic.is_some());
    }

    #[test]
    fn availability_floor() {
        assert_eq!(max_unavailable(10, Some(80.0), None).unwrap(), 2);
        assert_eq!(max_unavailable(10, Some(50.0), Some(7)).unwrap(), 3);
        assert!(matches!(
            max_unavailable(3, None, Some(4)),
            Err(ValidationError::Availability(_))
        ));
        let groups = vec![vec!["a".to_string(), "b".to_string(), "c".to_string()]];
        assert!(check_availability(&groups, 10, 1, Some(80.0), None).is_err());
        assert!(check_availability(&groups, 10, 1, Some(70.0), None).is_ok());
    }

    #[test]
    fn overlapping_groups_count_together() {
        let groups: Vec<Vec<HostId>> = (0..5)
            .map(|g| vec![format!("web-{g}a"), format!("web-{g}b")])
            .collect();
        assert!(check_availability(&groups, 10, 1, Some(80.0), None).is_ok());
        assert!(check_availability(&groups, 10, 2, Some(80.0), None).is_err());
        assert!(check_availability(&groups, 10, 2, Some(60.0), None).is_ok());
        // More concurrency than groups: everything is down together.
        assert!(check_availability(&groups, 10, 9, None, Some(1)).is_err());
        assert!(check_availability(&groups, 10, 9, None, None).is_ok());
    }

    #[test]
    fn partition_detects_gaps_and_overlap() {
        let targets = hosts(3);
        let ctx = PlanContext::new("wf", "api", "2", "p");
        let mut a = ctx.phase(1, "a", PhaseKind::Deployment);
        a.hosts = vec!["web-00".into(), "web-01".into()];
        let mut b = ctx.phase(2, "b", PhaseKind::Deployment);
        b.hosts = vec!["web-02".into()];
        assert!(verify_partition(&[a.clone(), b.clone()], &targets).is_ok());

        b.hosts.push("web-01".into());
        assert_eq!(
            verify_partition(&[a.clone(), b], &targets),
            Err(ValidationError::DuplicateHost("web-01".into()))
        );
        assert!(verify_partition(&[a], &targets).is_err());
    }
}
