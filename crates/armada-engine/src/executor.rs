//! Workflow executor — drives one workflow from Running to a terminal state.
//!
//! The executor owns the workflow's mutation lease for the whole run. It
//! walks the forward phases in plan order (overlapping consecutive
//! deployment waves when the policy allows), fans steps out into per-host
//! lanes, and applies the failure policy between phases. A rollback, once
//! requested, preempts forward progress: the forward pass is dropped and the
//! rollback plan runs instead.
//!
//! ```text
//! WorkflowExecutor::run
//!   ├── lock renewal task ──(LockLost)──┐
//!   ├── rollback monitor ──(AutoRollback via orchestrator)──┐
//!   ├── forward pass  ◄── select ── control signals ◄───────┘
//!   │     └── phase → lanes → steps (retry, backoff, timeout) → gate
//!   └── settle: Completed | Failed | Cancelled | rollback pass → RolledBack
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Semaphore, watch};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use armada_collab::{
    CollabResult, CommandDispatcher, KeyValueStore, LockLease, MetricFilter, MetricsFeed,
    TrafficController,
};
use armada_core::{
    CommandReply, ErrorKind, HostId, Phase, PhaseKind, PhaseStatus, Severity, StepStatus,
    StepType, TriggerType, Workflow, WorkflowError, WorkflowId, WorkflowStatus,
};
use armada_rollback::{MonitorSpec, RollbackEvaluator, RollbackMonitor};
use armada_strategy::StrategyPlanner;

use crate::control::{self, ApprovalGate, Control};
use crate::lock;
use crate::repository::WorkflowRepository;

/// Handles to the systems a run drives.
#[derive(Clone)]
pub struct Collaborators {
    pub dispatcher: Arc<dyn CommandDispatcher>,
    pub traffic: Arc<dyn TrafficController>,
    pub metrics: Arc<dyn MetricsFeed>,
    pub kv: Arc<dyn KeyValueStore>,
}

/// The orchestrator entry point the executor escalates to.
#[async_trait]
pub trait RollbackHandle: Send + Sync {
    /// `true` when a rollback was started for the workflow.
    async fn auto_rollback(&self, workflow_id: &str, trigger: TriggerType, reason: String) -> bool;
}

/// Shared by every run of one orchestrator.
#[derive(Clone)]
pub struct ExecutorDeps {
    pub collab: Collaborators,
    pub evaluator: Arc<RollbackEvaluator>,
    pub monitor: Arc<RollbackMonitor>,
    pub repository: WorkflowRepository,
    pub renew_interval: Duration,
}

/// Per-run handles, created by the orchestrator when a workflow starts.
pub struct RunState {
    pub workflow_id: WorkflowId,
    pub workflow: Arc<Mutex<Workflow>>,
    pub planner: Arc<dyn StrategyPlanner>,
    pub control: Arc<watch::Sender<Control>>,
    pub approval: Arc<ApprovalGate>,
    pub lease: LockLease,
}

/// Which phase list an index refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Plan {
    Forward,
    Rollback,
}

pub(crate) fn plan_phases(wf: &mut Workflow, plan: Plan) -> &mut Vec<Phase> {
    match plan {
        Plan::Forward => &mut wf.phases,
        Plan::Rollback => &mut wf.rollback_phases,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum PhaseOutcome {
    Completed,
    Failed { critical: bool, reason: String },
    RollbackRequested,
}

#[derive(Debug, Clone, PartialEq)]
enum ForwardOutcome {
    Completed,
    Failed(String),
    RollbackRequested,
}

/// How the forward pass ended.
#[derive(Debug)]
enum Ending {
    Forward(ForwardOutcome),
    Signalled(Control),
    TimedOut,
}

/// First failed step of a lane.
#[derive(Debug, Clone)]
pub(crate) struct StepFailure {
    pub critical: bool,
    pub message: String,
}

#[derive(Debug)]
struct LaneReport {
    host: Option<HostId>,
    failure: Option<StepFailure>,
}

/// State shared by the tasks of one run.
pub(crate) struct RunContext {
    pub workflow_id: WorkflowId,
    pub workflow: Arc<Mutex<Workflow>>,
    pub planner: Arc<dyn StrategyPlanner>,
    pub collab: Collaborators,
    pub evaluator: Arc<RollbackEvaluator>,
    pub repository: WorkflowRepository,
    pub rollback: Arc<dyn RollbackHandle>,
    pub approval: Arc<ApprovalGate>,
    /// Set once the forward pass is abandoned; late writes to forward
    /// phases from aborted tasks are dropped.
    forward_halted: AtomicBool,
}

impl RunContext {
    /// Mutate the workflow under its lock.
    pub(crate) async fn update<R>(&self, plan: Plan, f: impl FnOnce(&mut Workflow) -> R) -> Option<R> {
        let mut wf = self.workflow.lock().await;
        if plan == Plan::Forward && self.forward_halted.load(Ordering::SeqCst) {
            return None;
        }
        Some(f(&mut wf))
    }

    async fn checkpoint(&self, plan: Plan, idx: usize) {
        let wf = self.workflow.lock().await;
        if plan == Plan::Forward && self.forward_halted.load(Ordering::SeqCst) {
            return;
        }
        let phase = match plan {
            Plan::Forward => wf.phases.get(idx),
            Plan::Rollback => wf.rollback_phases.get(idx),
        };
        if let Some(phase) = phase
            && let Err(e) = self.repository.save_phase(&wf, phase).await
        {
            warn!(workflow = %self.workflow_id, phase = %phase.name, error = %e, "checkpoint failed");
        }
    }

    pub(crate) fn metric_filter(&self, service: &str, hosts: &[HostId]) -> MetricFilter {
        MetricFilter::for_hosts(service, hosts)
    }

    /// Run one phase: wait, steps, gate. Applies no failure policy.
    pub(crate) async fn run_phase(self: &Arc<Self>, plan: Plan, idx: usize) -> PhaseOutcome {
        let Some((name, wait_before, timeout)) = self
            .update(plan, |wf| {
                let phase = &plan_phases(wf, plan)[idx];
                (phase.name.clone(), phase.wait_before_secs, phase.timeout())
            })
            .await
        else {
            return PhaseOutcome::Failed {
                critical: true,
                reason: "run halted".into(),
            };
        };

        if wait_before > 0 {
            debug!(workflow = %self.workflow_id, phase = %name, wait_secs = wait_before, "waiting before phase");
            tokio::time::sleep(Duration::from_secs(wait_before)).await;
        }

        self.update(plan, |wf| {
            if plan == Plan::Forward {
                wf.current_phase = idx;
            }
            plan_phases(wf, plan)[idx].transition(PhaseStatus::Running);
        })
        .await;
        self.checkpoint(plan, idx).await;
        info!(workflow = %self.workflow_id, phase = %name, ?plan, "phase started");

        let outcome = match tokio::time::timeout(timeout, self.phase_body(plan, idx)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                let reason = format!("phase {name} exceeded its {}s timeout", timeout.as_secs());
                self.update(plan, |wf| {
                    let phase = &mut plan_phases(wf, plan)[idx];
                    let phase_id = phase.id.clone();
                    close_steps(phase, StepStatus::Cancelled);
                    wf.record_error(
                        WorkflowError::new(Severity::Error, ErrorKind::Timeout, &reason)
                            .in_phase(&phase_id),
                    );
                })
                .await;
                PhaseOutcome::Failed {
                    critical: true,
                    reason,
                }
            }
        };

        self.update(plan, |wf| {
            let phase = &mut plan_phases(wf, plan)[idx];
            match &outcome {
                PhaseOutcome::Completed => phase.transition(PhaseStatus::Completed),
                PhaseOutcome::Failed { .. } => phase.transition(PhaseStatus::Failed),
                PhaseOutcome::RollbackRequested => phase.transition(PhaseStatus::RollingBack),
            };
            wf.update_progress();
        })
        .await;
        self.checkpoint(plan, idx).await;

        match &outcome {
            PhaseOutcome::Completed => info!(workflow = %self.workflow_id, phase = %name, "phase completed"),
            PhaseOutcome::Failed { reason, critical } => {
                warn!(workflow = %self.workflow_id, phase = %name, critical, %reason, "phase failed")
            }
            PhaseOutcome::RollbackRequested => {
                info!(workflow = %self.workflow_id, phase = %name, "phase interrupted by rollback")
            }
        }
        outcome
    }

    async fn phase_body(self: &Arc<Self>, plan: Plan, idx: usize) -> PhaseOutcome {
        let Some((lanes, kind, gate, hosts, service)) = self
            .update(plan, |wf| {
                let service = wf.service.clone();
                let fallback = wf.host_ids();
                let phase = &plan_phases(wf, plan)[idx];
                let lanes: Vec<(Option<HostId>, Vec<usize>)> = phase
                    .lanes()
                    .into_iter()
                    .map(|lane| {
                        let steps = phase
                            .steps
                            .iter()
                            .enumerate()
                            .filter(|(_, s)| s.host == lane)
                            .map(|(i, _)| i)
                            .collect();
                        (lane, steps)
                    })
                    .collect();
                let hosts = if phase.hosts.is_empty() {
                    fallback
                } else {
                    phase.hosts.clone()
                };
                (lanes, phase.kind, phase.gate.clone(), hosts, service)
            })
            .await
        else {
            return PhaseOutcome::Failed {
                critical: true,
                reason: "run halted".into(),
            };
        };

        if !lanes.is_empty() {
            let prefetched = if kind == PhaseKind::PreDeployment {
                self.prefetch_batch(plan, idx, &service).await
            } else {
                HashMap::new()
            };
            if let Some(failed) = self.run_lanes(plan, idx, lanes, prefetched).await {
                return failed;
            }
        }

        match gate {
            Some(gate) => self.run_gate(plan, idx, gate, &service, &hosts).await,
            None => PhaseOutcome::Completed,
        }
    }

    /// First attempt of every pending step, sent as one batch. A batch that
    /// outlasts the longest step timeout is abandoned and every step is
    /// dispatched on its own.
    async fn prefetch_batch(
        &self,
        plan: Plan,
        idx: usize,
        service: &str,
    ) -> HashMap<String, CommandReply> {
        let Some((commands, limit)) = self
            .update(plan, |wf| {
                let steps: Vec<_> = plan_phases(wf, plan)[idx]
                    .steps
                    .iter()
                    .filter(|s| {
                        s.status == StepStatus::Pending
                            && !matches!(s.step_type, StepType::TrafficSwitch | StepType::WaitForHealthy)
                    })
                    .collect();
                let limit = steps.iter().map(|s| s.timeout()).max().unwrap_or_default();
                let commands: Vec<_> = steps
                    .into_iter()
                    .map(|s| {
                        let mut command = s.command.clone();
                        command.attempt = 1;
                        command
                    })
                    .collect();
                (commands, limit)
            })
            .await
        else {
            return HashMap::new();
        };
        if commands.is_empty() {
            return HashMap::new();
        }

        let routing_key = format!("service.{service}");
        let batch = self.collab.dispatcher.publish_batch(&commands, &routing_key);
        let replies: CollabResult<Vec<CommandReply>> = match tokio::time::timeout(limit, batch).await {
            Ok(replies) => replies,
            Err(_) => {
                warn!(workflow = %self.workflow_id, timeout_secs = limit.as_secs(), "batch dispatch timed out, dispatching individually");
                return HashMap::new();
            }
        };
        match replies {
            Ok(replies) if replies.len() == commands.len() => commands
                .into_iter()
                .zip(replies)
                .map(|(command, reply)| (command.step_id, reply))
                .collect(),
            Ok(replies) => {
                warn!(workflow = %self.workflow_id, sent = commands.len(), received = replies.len(), "batch reply count mismatch, dispatching individually");
                HashMap::new()
            }
            Err(e) => {
                warn!(workflow = %self.workflow_id, error = %e, "batch dispatch failed, dispatching individually");
                HashMap::new()
            }
        }
    }

    /// Returns the phase failure, if the lanes produced one.
    async fn run_lanes(
        self: &Arc<Self>,
        plan: Plan,
        idx: usize,
        lanes: Vec<(Option<HostId>, Vec<usize>)>,
        prefetched: HashMap<String, CommandReply>,
    ) -> Option<PhaseOutcome> {
        let Some((parallel, concurrency, delay, max_failures)) = self
            .update(plan, |wf| {
                let sequential_waves = !wf.policy.parallel_within_wave;
                let phase = &plan_phases(wf, plan)[idx];
                let parallel =
                    phase.parallel && !(sequential_waves && phase.kind == PhaseKind::Deployment);
                (
                    parallel,
                    phase.max_parallelism.max(1) as usize,
                    Duration::from_secs(phase.delay_between_hosts_secs),
                    phase.max_failures as usize,
                )
            })
            .await
        else {
            return Some(PhaseOutcome::Failed {
                critical: true,
                reason: "run halted".into(),
            });
        };
        let prefetched = Arc::new(Mutex::new(prefetched));
        let mut failures = 0usize;

        if !parallel || lanes.len() == 1 {
            for (n, (host, steps)) in lanes.into_iter().enumerate() {
                if n > 0 && !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                let report = self.run_lane(plan, idx, host, steps, prefetched.clone()).await;
                if let Some(outcome) = self.tally(plan, idx, report, &mut failures, max_failures).await {
                    self.update(plan, |wf| close_steps(&mut plan_phases(wf, plan)[idx], StepStatus::Skipped))
                        .await;
                    return Some(outcome);
                }
            }
            return None;
        }

        let permits = Arc::new(Semaphore::new(concurrency));
        let mut set = JoinSet::new();
        for (host, steps) in lanes {
            let ctx = self.clone();
            let permits = permits.clone();
            let prefetched = prefetched.clone();
            set.spawn(async move {
                let _permit = permits.acquire_owned().await;
                ctx.run_lane(plan, idx, host, steps, prefetched).await
            });
        }

        let mut verdict = None;
        while let Some(joined) = set.join_next().await {
            let Ok(report) = joined else { continue };
            if verdict.is_some() {
                continue;
            }
            if let Some(outcome) = self.tally(plan, idx, report, &mut failures, max_failures).await {
                set.abort_all();
                verdict = Some(outcome);
            }
        }
        if verdict.is_some() {
            self.update(plan, |wf| close_steps(&mut plan_phases(wf, plan)[idx], StepStatus::Skipped))
                .await;
        }
        verdict
    }

    /// Fold one lane into the phase verdict.
    async fn tally(
        &self,
        plan: Plan,
        idx: usize,
        report: LaneReport,
        failures: &mut usize,
        max_failures: usize,
    ) -> Option<PhaseOutcome> {
        let failure = report.failure?;
        if failure.critical {
            return Some(PhaseOutcome::Failed {
                critical: true,
                reason: failure.message,
            });
        }
        *failures += 1;
        let host_label = report.host.clone().unwrap_or_else(|| "service".into());
        self.update(plan, |wf| {
            let phase = &mut plan_phases(wf, plan)[idx];
            if let Some(host) = &report.host
                && !phase.failed_hosts.contains(host)
            {
                phase.failed_hosts.push(host.clone());
            }
            let phase_id = phase.id.clone();
            wf.record_error(
                WorkflowError::new(
                    Severity::Warning,
                    ErrorKind::Execution,
                    format!("{host_label}: {}", failure.message),
                )
                .in_phase(&phase_id)
                .on_host(report.host.as_deref()),
            );
        })
        .await;
        (*failures > max_failures).then(|| PhaseOutcome::Failed {
            critical: false,
            reason: format!("{failures} host failures exceed the tolerated {max_failures}"),
        })
    }

    async fn run_lane(
        self: &Arc<Self>,
        plan: Plan,
        idx: usize,
        host: Option<HostId>,
        steps: Vec<usize>,
        prefetched: Arc<Mutex<HashMap<String, CommandReply>>>,
    ) -> LaneReport {
        for (pos, &si) in steps.iter().enumerate() {
            if let Err(failure) = self.run_step(plan, idx, si, &prefetched).await {
                let rest = steps[pos + 1..].to_vec();
                self.update(plan, |wf| {
                    let phase = &mut plan_phases(wf, plan)[idx];
                    for i in rest {
                        phase.steps[i].transition(StepStatus::Skipped);
                    }
                })
                .await;
                return LaneReport {
                    host,
                    failure: Some(failure),
                };
            }
        }
        LaneReport {
            host,
            failure: None,
        }
    }
}

/// Cancel running steps and settle pending ones with `pending`.
fn close_steps(phase: &mut Phase, pending: StepStatus) {
    for step in &mut phase.steps {
        match step.status {
            StepStatus::Running => {
                step.transition(StepStatus::Cancelled);
            }
            StepStatus::Pending => {
                step.transition(pending);
            }
            _ => {}
        }
    }
}

/// Close every in-flight forward phase after the forward pass was dropped.
fn close_in_flight(wf: &mut Workflow, phase_status: PhaseStatus, cancel_pending: bool) {
    for phase in &mut wf.phases {
        match phase.status {
            PhaseStatus::Running => {
                close_steps(phase, StepStatus::Cancelled);
                phase.transition(phase_status);
            }
            PhaseStatus::Pending if cancel_pending => {
                close_steps(phase, StepStatus::Cancelled);
                phase.transition(PhaseStatus::Cancelled);
            }
            _ => {}
        }
    }
}

enum FailurePolicy {
    Continue,
    Stop(ForwardOutcome),
}

/// Runs one workflow to completion. Consumed by [`WorkflowExecutor::run`].
pub struct WorkflowExecutor {
    ctx: Arc<RunContext>,
    control: Arc<watch::Sender<Control>>,
    monitor: Arc<RollbackMonitor>,
    lease: LockLease,
    renew_interval: Duration,
}

impl WorkflowExecutor {
    pub fn new(deps: ExecutorDeps, rollback: Arc<dyn RollbackHandle>, run: RunState) -> Self {
        Self {
            ctx: Arc::new(RunContext {
                workflow_id: run.workflow_id,
                workflow: run.workflow,
                planner: run.planner,
                collab: deps.collab,
                evaluator: deps.evaluator,
                repository: deps.repository,
                rollback,
                approval: run.approval,
                forward_halted: AtomicBool::new(false),
            }),
            control: run.control,
            monitor: deps.monitor,
            lease: run.lease,
            renew_interval: deps.renew_interval,
        }
    }

    /// Drive the workflow to a terminal status and release the lease.
    pub async fn run(self) -> WorkflowStatus {
        let id = self.ctx.workflow_id.clone();
        let renewal = lock::spawn_renewal(
            self.ctx.collab.kv.clone(),
            self.lease.clone(),
            self.renew_interval,
            self.control.clone(),
        );
        self.start_monitor().await;

        let timeout = self.ctx.workflow.lock().await.workflow_timeout();
        let mut rx = self.control.subscribe();
        let forward = self.ctx.clone().forward_pass();
        let ending = tokio::select! {
            biased;
            signal = control::signalled(&mut rx) => Ending::Signalled(signal),
            result = tokio::time::timeout(timeout, forward) => match result {
                Ok(outcome) => Ending::Forward(outcome),
                Err(_) => Ending::TimedOut,
            },
        };
        self.ctx.forward_halted.store(true, Ordering::SeqCst);
        debug!(workflow = %id, ?ending, "forward pass ended");
        self.monitor.stop_monitor(&id).await;

        let status = self.settle(ending, &mut rx).await;

        renewal.abort();
        if *self.control.borrow() != Control::LockLost {
            lock::release(self.ctx.collab.kv.as_ref(), &self.lease).await;
        }
        info!(workflow = %id, %status, "workflow run finished");
        status
    }

    async fn start_monitor(&self) {
        let spec = {
            let wf = self.ctx.workflow.lock().await;
            let conditions: Vec<_> = wf
                .rollback
                .as_ref()
                .filter(|r| r.enabled)
                .map(|r| r.conditions.iter().filter(|c| c.enabled).cloned().collect())
                .unwrap_or_default();
            if conditions.is_empty() {
                return;
            }
            MonitorSpec {
                workflow_id: wf.id.clone(),
                conditions,
                filter: MetricFilter::for_hosts(&wf.service, &wf.host_ids()),
                interval: Duration::from_secs(wf.policy.monitoring_interval_secs.max(1)),
            }
        };
        self.monitor.start_monitor(spec).await;
    }

    async fn settle(&self, ending: Ending, rx: &mut watch::Receiver<Control>) -> WorkflowStatus {
        let repo = &self.ctx.repository;
        let mut wf = self.ctx.workflow.lock().await;

        if let Ending::Signalled(Control::LockLost) = ending {
            close_in_flight(&mut wf, PhaseStatus::Cancelled, false);
            wf.record_error(WorkflowError::new(
                Severity::Error,
                ErrorKind::Lock,
                "workflow lock lost, aborting run",
            ));
            let next = if wf.status == WorkflowStatus::RollingBack {
                wf.record_error(WorkflowError::new(
                    Severity::Critical,
                    ErrorKind::Rollback,
                    "rollback aborted: workflow lock lost",
                ));
                WorkflowStatus::Failed
            } else {
                WorkflowStatus::Cancelled
            };
            return self.finish(&mut wf, next, "lock lost").await;
        }

        if wf.status == WorkflowStatus::RollingBack {
            close_in_flight(&mut wf, PhaseStatus::RollingBack, false);
            for phase in wf.phases.iter_mut().filter(|p| p.is_deployment()) {
                if matches!(phase.status, PhaseStatus::Completed | PhaseStatus::Failed) {
                    phase.transition(PhaseStatus::RollingBack);
                }
            }
            if let Err(e) = repo.save(&wf).await {
                warn!(workflow = %wf.id, error = %e, "failed to persist rollback start");
            }
            drop(wf);
            return self.rollback_pass(rx).await;
        }

        match ending {
            Ending::Forward(ForwardOutcome::Completed) => {
                self.finish(&mut wf, WorkflowStatus::Completed, "all phases completed").await
            }
            Ending::Forward(ForwardOutcome::Failed(reason)) => {
                self.finish(&mut wf, WorkflowStatus::Failed, &reason).await
            }
            Ending::Forward(ForwardOutcome::RollbackRequested) | Ending::Signalled(Control::Rollback) => {
                // Rollback was requested but never took effect on the status.
                self.finish(&mut wf, WorkflowStatus::Failed, "rollback requested but not started")
                    .await
            }
            Ending::Signalled(Control::Cancel { reason }) => {
                close_in_flight(&mut wf, PhaseStatus::Cancelled, true);
                wf.record_error(WorkflowError::new(
                    Severity::Info,
                    ErrorKind::Cancellation,
                    format!("cancelled: {reason}"),
                ));
                self.finish(&mut wf, WorkflowStatus::Cancelled, &reason).await
            }
            Ending::Signalled(Control::Proceed | Control::LockLost) => {
                self.finish(&mut wf, WorkflowStatus::Failed, "run interrupted").await
            }
            Ending::TimedOut => {
                close_in_flight(&mut wf, PhaseStatus::Failed, false);
                let message = format!(
                    "workflow exceeded its {}s timeout",
                    wf.policy.workflow_timeout_secs
                );
                wf.record_error(WorkflowError::new(Severity::Error, ErrorKind::Timeout, &message));
                self.finish(&mut wf, WorkflowStatus::Failed, &message).await
            }
        }
    }

    async fn finish(&self, wf: &mut Workflow, next: WorkflowStatus, reason: &str) -> WorkflowStatus {
        match self.ctx.repository.transition(wf, next, Some(reason)).await {
            Ok(true) => {}
            Ok(false) => warn!(workflow = %wf.id, from = %wf.status, to = %next, "final transition rejected"),
            Err(e) => warn!(workflow = %wf.id, error = %e, "failed to persist final status"),
        }
        wf.status
    }

    /// Run the reverse plan. Cancellation is ignored; only a lost lease stops it.
    async fn rollback_pass(&self, rx: &mut watch::Receiver<Control>) -> WorkflowStatus {
        let count = self.ctx.workflow.lock().await.rollback_phases.len();
        info!(workflow = %self.ctx.workflow_id, phases = count, "rollback started");

        let ctx = self.ctx.clone();
        let pass = async move {
            for idx in 0..count {
                if let PhaseOutcome::Failed { reason, .. } = ctx.run_phase(Plan::Rollback, idx).await {
                    return Err(reason);
                }
            }
            Ok(())
        };
        let result = tokio::select! {
            biased;
            _ = lock_lost(rx) => Err("workflow lock lost during rollback".to_string()),
            result = pass => result,
        };

        let mut wf = self.ctx.workflow.lock().await;
        match result {
            Ok(()) => self.finish(&mut wf, WorkflowStatus::RolledBack, "rollback completed").await,
            Err(reason) => {
                for phase in &mut wf.rollback_phases {
                    if phase.status == PhaseStatus::Running {
                        close_steps(phase, StepStatus::Cancelled);
                        phase.transition(PhaseStatus::Failed);
                    }
                }
                let kind = if *rx.borrow() == Control::LockLost {
                    ErrorKind::Lock
                } else {
                    ErrorKind::Rollback
                };
                wf.record_error(WorkflowError::new(
                    Severity::Critical,
                    kind,
                    format!("rollback failed: {reason}"),
                ));
                self.finish(&mut wf, WorkflowStatus::Failed, &reason).await
            }
        }
    }
}

async fn lock_lost(rx: &mut watch::Receiver<Control>) {
    if rx.wait_for(|c| *c == Control::LockLost).await.is_err() {
        std::future::pending::<()>().await;
    }
}

impl RunContext {
    async fn forward_pass(self: Arc<Self>) -> ForwardOutcome {
        let Some((count, max_waves)) = self
            .update(Plan::Forward, |wf| {
                (wf.phases.len(), wf.policy.max_concurrent_waves.max(1) as usize)
            })
            .await
        else {
            return ForwardOutcome::Failed("run halted".into());
        };

        let mut idx = 0;
        while idx < count {
            let group = self.next_group(idx, count, max_waves).await;
            let outcomes = if group.len() == 1 {
                vec![(idx, self.run_phase(Plan::Forward, idx).await)]
            } else {
                debug!(workflow = %self.workflow_id, waves = ?group, "running waves concurrently");
                let mut set = JoinSet::new();
                for &pidx in &group {
                    let ctx = self.clone();
                    set.spawn(async move { (pidx, ctx.run_phase(Plan::Forward, pidx).await) });
                }
                let mut outcomes = Vec::with_capacity(group.len());
                while let Some(joined) = set.join_next().await {
                    if let Ok(outcome) = joined {
                        outcomes.push(outcome);
                    }
                }
                outcomes.sort_by_key(|(pidx, _)| *pidx);
                outcomes
            };

            for (pidx, outcome) in outcomes {
                match outcome {
                    PhaseOutcome::Completed => {}
                    PhaseOutcome::RollbackRequested => return ForwardOutcome::RollbackRequested,
                    PhaseOutcome::Failed { critical, reason } => {
                        match self.on_phase_failure(pidx, critical, reason).await {
                            FailurePolicy::Continue => {}
                            FailurePolicy::Stop(outcome) => return outcome,
                        }
                    }
                }
            }
            idx += group.len();
        }
        ForwardOutcome::Completed
    }

    /// Phases to run next: one phase, or up to `max_waves` consecutive
    /// deployment waves. Adapts the next wave first.
    async fn next_group(&self, idx: usize, count: usize, max_waves: usize) -> Vec<usize> {
        let planner = self.planner.clone();
        self.update(Plan::Forward, |wf| {
            if wf.phases[idx].is_deployment() && planner.adapt_next_phase(wf, idx) {
                debug!(workflow = %wf.id, phase = %wf.phases[idx].name, hosts = wf.phases[idx].hosts.len(), "next wave resized");
            }
            if max_waves <= 1 || !wf.phases[idx].is_deployment() {
                return vec![idx];
            }
            (idx..count)
                .take_while(|&i| wf.phases[i].is_deployment())
                .take(max_waves)
                .collect()
        })
        .await
        .unwrap_or_else(|| vec![idx])
    }

    async fn on_phase_failure(&self, idx: usize, critical: bool, reason: String) -> FailurePolicy {
        let Some((name, rollback_on_failure, automatic, continue_on_failure)) = self
            .update(Plan::Forward, |wf| {
                let phase = &wf.phases[idx];
                (
                    phase.name.clone(),
                    phase.rollback_on_failure,
                    wf.automatic_rollback(),
                    wf.policy.continue_on_non_critical_failure,
                )
            })
            .await
        else {
            return FailurePolicy::Stop(ForwardOutcome::Failed(reason));
        };
        let reason = format!("phase {name} failed: {reason}");

        if rollback_on_failure && automatic {
            if self
                .rollback
                .auto_rollback(&self.workflow_id, TriggerType::HealthCheckFailure, reason.clone())
                .await
            {
                return FailurePolicy::Stop(ForwardOutcome::RollbackRequested);
            }
            return FailurePolicy::Stop(ForwardOutcome::Failed(reason));
        }

        if continue_on_failure && !critical {
            self.update(Plan::Forward, |wf| {
                let phase_id = wf.phases[idx].id.clone();
                wf.record_error(
                    WorkflowError::new(
                        Severity::Warning,
                        ErrorKind::Execution,
                        format!("{reason}; continuing"),
                    )
                    .in_phase(&phase_id),
                );
            })
            .await;
            return FailurePolicy::Continue;
        }

        self.update(Plan::Forward, |wf| {
            let phase_id = wf.phases[idx].id.clone();
            wf.record_error(
                WorkflowError::new(Severity::Error, ErrorKind::Execution, &reason).in_phase(&phase_id),
            );
        })
        .await;
        FailurePolicy::Stop(ForwardOutcome::Failed(reason))
    }
}
