//! Workflow model — workflows, phases, steps and their state machines.
//!
//! All types serialize to JSON for the repository and the snapshot cache.
//! Status transitions go through the `transition` methods, which refuse
//! moves the state machines do not allow.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::command::{DeploymentCommand, TrafficAction};
use crate::strategy::{MetricCriterion, StrategyConfig, StrategyKind};

/// Unique identifier for a workflow (UUID v4).
pub type WorkflowId = String;

/// Host name as known to the command broker.
pub type HostId = String;

// ── Hosts ─────────────────────────────────────────────────────────

/// A service instance host targeted by a rollout.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TargetHost {
    pub id: HostId,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub datacenter: Option<String>,
    /// Relative load score, lower means less loaded.
    #[serde(default)]
    pub load: u32,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl TargetHost {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            region: None,
            datacenter: None,
            load: 0,
            labels: BTreeMap::new(),
        }
    }

    pub fn in_region(mut self, region: &str, datacenter: &str) -> Self {
        self.region = Some(region.to_string());
        self.datacenter = Some(datacenter.to_string());
        self
    }

    pub fn with_load(mut self, load: u32) -> Self {
        self.load = load;
        self
    }
}

// ── Workflow status ───────────────────────────────────────────────

/// Lifecycle status of a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Created,
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
    RollingBack,
    RolledBack,
}

impl WorkflowStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::RolledBack
        )
    }

    /// Running or rolling back: an executor owns the workflow.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Running | Self::RollingBack)
    }

    pub fn can_transition_to(self, next: WorkflowStatus) -> bool {
        use WorkflowStatus::*;
        matches!(
            (self, next),
            (Created, Queued)
                | (Created, Running)
                | (Queued, Running)
                | (Queued, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Running, RollingBack)
                | (RollingBack, RolledBack)
                | (RollingBack, Failed)
        )
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::RollingBack => "rolling_back",
            Self::RolledBack => "rolled_back",
        };
        f.write_str(s)
    }
}

// ── Phase ─────────────────────────────────────────────────────────

/// Lifecycle status of a phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    RollingBack,
}

impl PhaseStatus {
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn can_transition_to(self, next: PhaseStatus) -> bool {
        use PhaseStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Running, RollingBack)
                | (Completed, RollingBack)
                | (Failed, RollingBack)
        )
    }
}

/// What a phase is for. Only `Deployment` phases partition the target hosts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseKind {
    PreDeployment,
    Deployment,
    Verification,
    TrafficSwitch,
    Monitoring,
    Analysis,
    Approval,
    PostDeployment,
    Cleanup,
    Rollback,
}

/// Work a phase performs in place of steps: observe, evaluate, or wait.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PhaseGate {
    /// Watch rollback conditions for `duration_secs`; a breach triggers rollback.
    Monitor {
        duration_secs: u64,
        interval_secs: u64,
        conditions: Vec<RollbackCondition>,
    },
    /// Canary analysis: criteria must hold over the window with enough samples.
    Advancement {
        window_secs: u64,
        interval_secs: u64,
        minimum_samples: u32,
        criteria: Vec<MetricCriterion>,
        rollback_on_breach: bool,
    },
    /// Hold until an operator promotes the workflow.
    ManualApproval,
    /// Fixed pause, e.g. between gradual traffic increments.
    Wait { duration_secs: u64 },
}

/// Exponential retry backoff applied to every step of a phase.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 1_000,
            max_backoff_ms: 60_000,
        }
    }
}

impl RetryPolicy {
    pub fn from_secs(initial_secs: u64) -> Self {
        Self {
            initial_backoff_ms: initial_secs * 1_000,
            ..Default::default()
        }
    }

    /// Delay before retry number `retry` (1-based); doubles up to the cap.
    pub fn backoff(&self, retry: u32) -> Duration {
        let shift = retry.saturating_sub(1).min(16);
        let ms = self
            .initial_backoff_ms
            .saturating_mul(1u64 << shift)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}

/// A named unit of work scoped to a subset of the target hosts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Phase {
    pub id: String,
    pub name: String,
    pub kind: PhaseKind,
    pub status: PhaseStatus,
    pub steps: Vec<Step>,
    pub hosts: Vec<HostId>,
    #[serde(default)]
    pub gate: Option<PhaseGate>,
    pub timeout_secs: u64,
    pub retry: RetryPolicy,
    pub rollback_on_failure: bool,
    /// Run host lanes concurrently (bounded by `max_parallelism`).
    pub parallel: bool,
    pub max_parallelism: u32,
    pub delay_between_hosts_secs: u64,
    /// Pause before the phase starts (wave interval).
    pub wait_before_secs: u64,
    /// Host failures tolerated before the phase fails.
    pub max_failures: u32,
    #[serde(default)]
    pub failed_hosts: Vec<HostId>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Phase {
    pub fn new(id: String, name: &str, kind: PhaseKind) -> Self {
        Self {
            id,
            name: name.to_string(),
            kind,
            status: PhaseStatus::Pending,
            steps: Vec::new(),
            hosts: Vec::new(),
            gate: None,
            timeout_secs: 1_800,
            retry: RetryPolicy::default(),
            rollback_on_failure: false,
            parallel: false,
            max_parallelism: 1,
            delay_between_hosts_secs: 0,
            wait_before_secs: 0,
            max_failures: 0,
            failed_hosts: Vec::new(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Move to `next` if the phase state machine allows it.
    pub fn transition(&mut self, next: PhaseStatus) -> bool {
        if !self.status.can_transition_to(next) {
            warn!(phase = %self.name, from = ?self.status, to = ?next, "illegal phase transition ignored");
            return false;
        }
        debug!(phase = %self.name, from = ?self.status, to = ?next, "phase transition");
        match next {
            PhaseStatus::Running => self.started_at = Some(Utc::now()),
            PhaseStatus::Completed | PhaseStatus::Failed | PhaseStatus::Cancelled => {
                self.completed_at = Some(Utc::now())
            }
            _ => {}
        }
        self.status = next;
        true
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn is_deployment(&self) -> bool {
        self.kind == PhaseKind::Deployment
    }

    pub fn completed_steps(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Completed)
            .count()
    }

    /// Distinct hosts with steps in this phase, in first-seen order.
    pub fn lanes(&self) -> Vec<Option<HostId>> {
        let mut lanes: Vec<Option<HostId>> = Vec::new();
        for step in &self.steps {
            if !lanes.contains(&step.host) {
                lanes.push(step.host.clone());
            }
        }
        lanes
    }
}

// ── Step ──────────────────────────────────────────────────────────

/// Lifecycle status of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
    Cancelled,
}

impl StepStatus {
    pub fn is_finished(self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }

    pub fn can_transition_to(self, next: StepStatus) -> bool {
        use StepStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Skipped)
                | (Pending, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
        )
    }
}

/// Kind of work a step performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    ServiceStop,
    ServiceStart,
    ServiceRestart,
    Deploy,
    HealthCheck,
    WaitForHealthy,
    TrafficSwitch,
    Validation,
    Cleanup,
    Custom,
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::ServiceStop => "service_stop",
            Self::ServiceStart => "service_start",
            Self::ServiceRestart => "service_restart",
            Self::Deploy => "deploy",
            Self::HealthCheck => "health_check",
            Self::WaitForHealthy => "wait_for_healthy",
            Self::TrafficSwitch => "traffic_switch",
            Self::Validation => "validation",
            Self::Cleanup => "cleanup",
            Self::Custom => "custom",
        };
        f.write_str(s)
    }
}

/// The smallest unit of work, dispatched to one host (or to the service
/// as a whole when `host` is `None`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Step {
    pub id: String,
    pub name: String,
    pub step_type: StepType,
    pub host: Option<HostId>,
    pub command: DeploymentCommand,
    #[serde(default)]
    pub traffic: Option<TrafficAction>,
    pub status: StepStatus,
    /// A failed critical step fails the enclosing phase immediately.
    pub critical: bool,
    pub max_retries: u32,
    pub attempts: u32,
    pub timeout_secs: u64,
    pub output: Option<String>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Step {
    /// Move to `next` if the step state machine allows it.
    pub fn transition(&mut self, next: StepStatus) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        match next {
            StepStatus::Running => self.started_at = Some(Utc::now()),
            s if s.is_finished() => self.completed_at = Some(Utc::now()),
            _ => {}
        }
        self.status = next;
        true
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

// ── Rollback configuration ────────────────────────────────────────

/// Signal that can trigger an automatic rollback.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    ErrorRate,
    ResponseTime,
    HealthCheckFailure,
    ManualTrigger,
    Timeout,
    MemoryUsage,
    CpuUsage,
    Custom { metric: String },
}

impl fmt::Display for TriggerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ErrorRate => f.write_str("error_rate"),
            Self::ResponseTime => f.write_str("response_time"),
            Self::HealthCheckFailure => f.write_str("health_check_failure"),
            Self::ManualTrigger => f.write_str("manual"),
            Self::Timeout => f.write_str("timeout"),
            Self::MemoryUsage => f.write_str("memory_usage"),
            Self::CpuUsage => f.write_str("cpu_usage"),
            Self::Custom { metric } => write!(f, "custom:{metric}"),
        }
    }
}

/// A threshold over a metric window that, when exceeded, requests rollback.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RollbackCondition {
    pub trigger: TriggerType,
    pub threshold: f64,
    #[serde(default = "default_evaluation_window")]
    pub evaluation_window_secs: u64,
    /// Samples required before the condition may decide anything.
    #[serde(default = "default_minimum_data_points")]
    pub minimum_data_points: u32,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_evaluation_window() -> u64 {
    300
}

fn default_minimum_data_points() -> u32 {
    3
}

fn default_true() -> bool {
    true
}

impl RollbackCondition {
    pub fn new(trigger: TriggerType, threshold: f64) -> Self {
        Self {
            trigger,
            threshold,
            evaluation_window_secs: default_evaluation_window(),
            minimum_data_points: default_minimum_data_points(),
            enabled: true,
        }
    }

    pub fn window(mut self, secs: u64, minimum_data_points: u32) -> Self {
        self.evaluation_window_secs = secs;
        self.minimum_data_points = minimum_data_points;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct RollbackConfig {
    pub enabled: bool,
    /// Whether the evaluator and executor may roll back without an operator.
    pub automatic: bool,
    #[serde(default)]
    pub target_version: Option<String>,
    #[serde(default)]
    pub conditions: Vec<RollbackCondition>,
}

/// Record of why and by whom a rollback was requested.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RollbackRequest {
    pub trigger: TriggerType,
    pub reason: String,
    pub to_version: Option<String>,
    pub automatic: bool,
    pub requested_at: DateTime<Utc>,
}

// ── Error log ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

/// Error class of a log entry; separates timeouts from cancellations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Info,
    Validation,
    Execution,
    Timeout,
    Lock,
    Rollback,
    Cancellation,
    Admission,
}

/// Append-only audit entry on a workflow.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowError {
    pub at: DateTime<Utc>,
    pub severity: Severity,
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default)]
    pub phase_id: Option<String>,
    #[serde(default)]
    pub step_id: Option<String>,
    #[serde(default)]
    pub host: Option<HostId>,
}

impl WorkflowError {
    pub fn new(severity: Severity, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            at: Utc::now(),
            severity,
            kind,
            message: message.into(),
            phase_id: None,
            step_id: None,
            host: None,
        }
    }

    pub fn in_phase(mut self, phase_id: &str) -> Self {
        self.phase_id = Some(phase_id.to_string());
        self
    }

    pub fn at_step(mut self, step_id: &str) -> Self {
        self.step_id = Some(step_id.to_string());
        self
    }

    pub fn on_host(mut self, host: Option<&str>) -> Self {
        self.host = host.map(str::to_string);
        self
    }
}

// ── Workflow ──────────────────────────────────────────────────────

/// Execution knobs derived from the strategy configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionPolicy {
    pub max_concurrent_waves: u32,
    pub parallel_within_wave: bool,
    pub continue_on_non_critical_failure: bool,
    pub workflow_timeout_secs: u64,
    pub monitoring_interval_secs: u64,
}

impl Default for ExecutionPolicy {
    fn default() -> Self {
        Self {
            max_concurrent_waves: 1,
            parallel_within_wave: true,
            continue_on_non_critical_failure: false,
            workflow_timeout_secs: 7_200,
            monitoring_interval_secs: 30,
        }
    }
}

/// One rollout of a service version across a set of hosts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Workflow {
    pub id: WorkflowId,
    pub service: String,
    pub version: String,
    #[serde(default)]
    pub previous_version: Option<String>,
    pub package: String,
    pub strategy: StrategyKind,
    pub strategy_config: StrategyConfig,
    pub status: WorkflowStatus,
    pub phases: Vec<Phase>,
    /// Reverse plan, built when a rollback starts.
    #[serde(default)]
    pub rollback_phases: Vec<Phase>,
    pub hosts: Vec<TargetHost>,
    #[serde(default)]
    pub configuration: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub rollback: Option<RollbackConfig>,
    #[serde(default)]
    pub rollback_request: Option<RollbackRequest>,
    pub policy: ExecutionPolicy,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub current_phase: usize,
    pub progress: u8,
    #[serde(default)]
    pub errors: Vec<WorkflowError>,
    #[serde(default)]
    pub requested_by: Option<String>,
}

impl Workflow {
    /// A workflow in `Created` with no phases yet.
    pub fn new(
        id: WorkflowId,
        service: &str,
        version: &str,
        package: &str,
        strategy_config: StrategyConfig,
        hosts: Vec<TargetHost>,
    ) -> Self {
        Self {
            id,
            service: service.to_string(),
            version: version.to_string(),
            previous_version: None,
            package: package.to_string(),
            strategy: strategy_config.kind(),
            strategy_config,
            status: WorkflowStatus::Created,
            phases: Vec::new(),
            rollback_phases: Vec::new(),
            hosts,
            configuration: BTreeMap::new(),
            rollback: None,
            rollback_request: None,
            policy: ExecutionPolicy::default(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            current_phase: 0,
            progress: 0,
            errors: Vec::new(),
            requested_by: None,
        }
    }

    /// Move to `next` if the workflow state machine allows it.
    pub fn transition(&mut self, next: WorkflowStatus) -> bool {
        if !self.status.can_transition_to(next) {
            warn!(workflow = %self.id, from = %self.status, to = %next, "illegal workflow transition ignored");
            return false;
        }
        info!(workflow = %self.id, service = %self.service, from = %self.status, to = %next, "workflow transition");
        if next == WorkflowStatus::Running && self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
        if next.is_terminal() {
            self.completed_at = Some(Utc::now());
            if next == WorkflowStatus::Completed {
                self.progress = 100;
            }
        }
        self.status = next;
        true
    }

    /// Append an entry to the error log.
    pub fn record_error(&mut self, entry: WorkflowError) {
        match entry.severity {
            Severity::Info => info!(workflow = %self.id, kind = ?entry.kind, "{}", entry.message),
            Severity::Warning => warn!(workflow = %self.id, kind = ?entry.kind, "{}", entry.message),
            Severity::Error | Severity::Critical => {
                error!(workflow = %self.id, kind = ?entry.kind, severity = ?entry.severity, "{}", entry.message)
            }
        }
        self.errors.push(entry);
    }

    pub fn has_critical_error(&self) -> bool {
        self.errors.iter().any(|e| e.severity == Severity::Critical)
    }

    pub fn total_steps(&self) -> usize {
        self.phases.iter().map(|p| p.steps.len()).sum()
    }

    pub fn completed_steps(&self) -> usize {
        self.phases.iter().map(Phase::completed_steps).sum()
    }

    /// Recompute progress from completed steps. Never decreases.
    pub fn update_progress(&mut self) -> u8 {
        let total = self.total_steps();
        if total > 0 {
            let pct = (self.completed_steps() * 100 / total).min(100) as u8;
            self.progress = self.progress.max(pct);
        }
        self.progress
    }

    pub fn host_ids(&self) -> Vec<HostId> {
        self.hosts.iter().map(|h| h.id.clone()).collect()
    }

    pub fn rollback_enabled(&self) -> bool {
        self.rollback.as_ref().is_some_and(|r| r.enabled)
    }

    pub fn automatic_rollback(&self) -> bool {
        self.rollback.as_ref().is_some_and(|r| r.enabled && r.automatic)
    }

    pub fn workflow_timeout(&self) -> Duration {
        Duration::from_secs(self.policy.workflow_timeout_secs)
    }

    pub fn duration(&self) -> Option<chrono::Duration> {
        Some(self.completed_at? - self.started_at?)
    }

    pub fn find_phase(&self, phase_id: &str) -> Option<&Phase> {
        self.phases
            .iter()
            .chain(self.rollback_phases.iter())
            .find(|p| p.id == phase_id)
    }
}
