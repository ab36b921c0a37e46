//! Orchestrator service — the public face of the engine.
//!
//! The `Orchestrator`:
//! - Validates rollout requests and asks the strategy planner for a plan
//! - Persists workflows through the repository (store + cache)
//! - Admits runs up to `max_concurrent_workflows`, queueing the overflow
//! - Hands admitted workflows to a [`WorkflowExecutor`] under the workflow lock
//! - Routes cancel, rollback and promotion requests to running executors

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use armada_collab::LockLease;
use armada_core::{
    CreateWorkflowRequest, ErrorKind, OrchestratorConfig, RollbackConfig, RollbackRequest,
    Severity, TriggerType, Workflow, WorkflowError, WorkflowId, WorkflowStatus,
};
use armada_rollback::{BoxFuture, Breach, RollbackCallback, RollbackEvaluator, RollbackMonitor};
use armada_state::{TransitionRecord, WorkflowFilter, WorkflowStore};
use armada_strategy::{PlanRequest, StrategyRegistry, verify_partition};

use crate::cache::WorkflowCache;
use crate::control::{self, ApprovalGate, Control};
use crate::error::{EngineError, EngineResult};
use crate::executor::{Collaborators, ExecutorDeps, RollbackHandle, RunState, WorkflowExecutor};
use crate::lock;
use crate::report::{HealthReport, WorkflowStatistics};
use crate::repository::WorkflowRepository;

/// Result of a start request that was accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    /// Waiting for a free run slot.
    Queued,
}

/// A workflow with a live executor.
struct RunSlot {
    workflow: Arc<Mutex<Workflow>>,
    control: Arc<watch::Sender<Control>>,
    approval: Arc<ApprovalGate>,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct Admission {
    runs: HashMap<WorkflowId, RunSlot>,
    queue: VecDeque<WorkflowId>,
}

struct Inner {
    config: OrchestratorConfig,
    registry: StrategyRegistry,
    repository: WorkflowRepository,
    deps: ExecutorDeps,
    /// Lock order: `admission`, then a slot's workflow mutex.
    admission: Mutex<Admission>,
    /// Bumped each time an executor finishes.
    finished: watch::Sender<u64>,
}

/// Cheap to clone; clones share one registry of runs.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    /// Assemble an orchestrator. The rollback monitor it owns escalates
    /// breaches back into [`Orchestrator::auto_rollback`].
    pub fn new(
        config: OrchestratorConfig,
        registry: StrategyRegistry,
        store: WorkflowStore,
        collab: Collaborators,
    ) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| {
            let evaluator = Arc::new(RollbackEvaluator::new(collab.metrics.clone()));
            let monitor = Arc::new(
                RollbackMonitor::new(evaluator.clone()).with_callback(breach_callback(weak.clone())),
            );
            let cache = WorkflowCache::new(collab.kv.clone(), &config);
            let repository = WorkflowRepository::new(store, cache);
            let (finished, _) = watch::channel(0);
            Inner {
                deps: ExecutorDeps {
                    collab,
                    evaluator,
                    monitor,
                    repository: repository.clone(),
                    renew_interval: config.lock_renew_interval(),
                },
                config,
                registry,
                repository,
                admission: Mutex::new(Admission::default()),
                finished,
            }
        });
        Self { inner }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &StrategyRegistry {
        &self.inner.registry
    }

    // ── Creation ──────────────────────────────────────────────────

    /// Validate a request, plan it, and persist the workflow as `Created`.
    pub async fn create_workflow(&self, request: CreateWorkflowRequest) -> EngineResult<Workflow> {
        request.validate()?;
        let planner = self.inner.registry.resolve(request.strategy.kind())?;
        planner.validate_configuration(&request.strategy)?;

        let id = Uuid::new_v4().to_string();
        let phases = planner.create_phases(&PlanRequest::from_request(&id, &request))?;
        verify_partition(&phases, &request.hosts)?;

        let mut wf = Workflow::new(
            id,
            &request.service,
            &request.version,
            &request.package,
            request.strategy.clone(),
            request.hosts.clone(),
        );
        wf.previous_version = request.previous_version.clone();
        wf.configuration = request.configuration.clone();
        wf.requested_by = request.requested_by.clone();
        wf.phases = phases;
        wf.policy = planner.execution_policy(&request.strategy);
        wf.policy.workflow_timeout_secs = request
            .timeout_secs
            .unwrap_or(self.inner.config.default_workflow_timeout_secs);
        wf.policy.monitoring_interval_secs = planner
            .monitoring_interval(&request.strategy)
            .map(|d| d.as_secs())
            .unwrap_or(self.inner.config.monitoring_interval_secs);

        let defaults = planner.default_rollback_conditions(&request.strategy);
        wf.rollback = match request.rollback {
            Some(mut rollback) => {
                if rollback.conditions.is_empty() {
                    rollback.conditions = defaults;
                }
                Some(rollback)
            }
            None if !defaults.is_empty() => Some(RollbackConfig {
                enabled: true,
                automatic: true,
                target_version: None,
                conditions: defaults,
            }),
            None => None,
        };

        self.inner.repository.save(&wf).await?;
        info!(
            workflow = %wf.id,
            service = %wf.service,
            version = %wf.version,
            strategy = %wf.strategy,
            phases = wf.phases.len(),
            hosts = wf.hosts.len(),
            "workflow created"
        );
        Ok(wf)
    }

    // ── Start and admission ───────────────────────────────────────

    /// Start a workflow, or queue it when every run slot is taken.
    ///
    /// Lock, admission and state errors surface to the caller; a workflow
    /// that is not `Created` or `Queued` is never mutated.
    pub async fn try_start(&self, id: &str) -> EngineResult<StartOutcome> {
        let current = self.load_required(id).await?;
        if !startable(current.status) {
            return Err(EngineError::InvalidState {
                id: id.to_string(),
                status: current.status,
                action: "start",
            });
        }

        let kv = self.inner.deps.collab.kv.clone();
        let lease = lock::acquire(
            kv.as_ref(),
            id,
            self.inner.config.lock_ttl(),
            self.inner.config.lock_wait(),
        )
        .await?;

        let mut admission = self.inner.admission.lock().await;
        let outcome = self.admit(&mut admission, id, &lease).await;
        if !matches!(outcome, Ok(StartOutcome::Started)) {
            lock::release(kv.as_ref(), &lease).await;
        }
        outcome
    }

    /// `try_start` as a yes/no answer: true when started or queued.
    pub async fn start_workflow(&self, id: &str) -> bool {
        match self.try_start(id).await {
            Ok(outcome) => {
                debug!(workflow = %id, ?outcome, "start accepted");
                true
            }
            Err(e) => {
                warn!(workflow = %id, error = %e, "start rejected");
                false
            }
        }
    }

    /// Runs with the workflow lock held and the admission registry locked.
    async fn admit(
        &self,
        admission: &mut Admission,
        id: &str,
        lease: &LockLease,
    ) -> EngineResult<StartOutcome> {
        // Re-read under the lock; another actor may have moved it.
        let mut wf = self.load_required(id).await?;
        if !startable(wf.status) || admission.runs.contains_key(id) {
            return Err(EngineError::InvalidState {
                id: id.to_string(),
                status: wf.status,
                action: "start",
            });
        }

        let config = &self.inner.config;
        if admission.runs.len() >= config.max_concurrent_workflows {
            if wf.status == WorkflowStatus::Queued {
                if !admission.queue.iter().any(|q| q == id) {
                    admission.queue.push_front(id.to_string());
                }
                return Ok(StartOutcome::Queued);
            }
            if admission.queue.len() >= config.max_queued_workflows {
                return Err(EngineError::Admission(format!(
                    "{} workflows running and {} queued",
                    admission.runs.len(),
                    admission.queue.len()
                )));
            }
            self.inner
                .repository
                .transition(&mut wf, WorkflowStatus::Queued, Some("waiting for a run slot"))
                .await?;
            admission.queue.push_back(id.to_string());
            info!(workflow = %id, position = admission.queue.len(), "workflow queued");
            return Ok(StartOutcome::Queued);
        }

        let planner = self.inner.registry.resolve(wf.strategy)?;
        admission.queue.retain(|q| q != id);
        self.inner
            .repository
            .transition(&mut wf, WorkflowStatus::Running, Some("started"))
            .await?;

        let workflow = Arc::new(Mutex::new(wf));
        let (tx, _) = watch::channel(Control::Proceed);
        let control = Arc::new(tx);
        let approval = Arc::new(ApprovalGate::new());
        let executor = WorkflowExecutor::new(
            self.inner.deps.clone(),
            Arc::new(self.clone()),
            RunState {
                workflow_id: id.to_string(),
                workflow: workflow.clone(),
                planner,
                control: control.clone(),
                approval: approval.clone(),
                lease: lease.clone(),
            },
        );

        let this = self.clone();
        let run_id = id.to_string();
        let handle = tokio::spawn(async move {
            let status = executor.run().await;
            this.run_finished(&run_id, status).await;
        });
        admission.runs.insert(
            id.to_string(),
            RunSlot {
                workflow,
                control,
                approval,
                handle,
            },
        );
        info!(workflow = %id, running = admission.runs.len(), "workflow started");
        Ok(StartOutcome::Started)
    }

    async fn run_finished(&self, id: &str, status: WorkflowStatus) {
        let running = {
            let mut admission = self.inner.admission.lock().await;
            admission.runs.remove(id);
            admission.runs.len()
        };
        debug!(workflow = %id, %status, running, "run slot freed");
        self.inner.finished.send_modify(|n| *n += 1);
        self.drain_queue().await;
    }

    /// Start queued workflows while slots are free. Boxed: a started run
    /// drains the queue again when it finishes.
    fn drain_queue(&self) -> BoxFuture<()> {
        let this = self.clone();
        Box::pin(async move {
            loop {
                let next = {
                    let mut admission = this.inner.admission.lock().await;
                    if admission.runs.len() >= this.inner.config.max_concurrent_workflows {
                        return;
                    }
                    admission.queue.pop_front()
                };
                let Some(id) = next else {
                    return;
                };
                match this.try_start(&id).await {
                    Ok(StartOutcome::Started) => info!(workflow = %id, "queued workflow admitted"),
                    Ok(StartOutcome::Queued) => return,
                    Err(e) => warn!(workflow = %id, error = %e, "queued workflow could not start"),
                }
            }
        })
    }

    // ── Control ───────────────────────────────────────────────────

    /// Cancel a running or queued workflow.
    pub async fn cancel_workflow(&self, id: &str, reason: &str) -> bool {
        let admission = self.inner.admission.lock().await;
        if let Some(slot) = admission.runs.get(id) {
            let status = slot.workflow.lock().await.status;
            if status != WorkflowStatus::Running {
                debug!(workflow = %id, %status, "cancel ignored");
                return false;
            }
            let accepted = control::signal(
                &slot.control,
                Control::Cancel {
                    reason: reason.to_string(),
                },
            );
            info!(workflow = %id, accepted, reason, "cancellation requested");
            return accepted;
        }

        drop(admission);
        match self.cancel_queued(id, reason).await {
            Ok(cancelled) => {
                if cancelled {
                    self.inner.admission.lock().await.queue.retain(|q| q != id);
                    self.inner.finished.send_modify(|n| *n += 1);
                }
                cancelled
            }
            Err(e) => {
                warn!(workflow = %id, error = %e, "cancel failed");
                false
            }
        }
    }

    async fn cancel_queued(&self, id: &str, reason: &str) -> EngineResult<bool> {
        let kv = self.inner.deps.collab.kv.clone();
        let lease = lock::acquire(
            kv.as_ref(),
            id,
            self.inner.config.lock_ttl(),
            self.inner.config.lock_wait(),
        )
        .await?;
        let result = async {
            let mut wf = self.load_required(id).await?;
            if wf.status != WorkflowStatus::Queued {
                return Ok(false);
            }
            wf.record_error(WorkflowError::new(
                Severity::Info,
                ErrorKind::Cancellation,
                format!("cancelled: {reason}"),
            ));
            self.inner
                .repository
                .transition(&mut wf, WorkflowStatus::Cancelled, Some(reason))
                .await
        }
        .await;
        lock::release(kv.as_ref(), &lease).await;
        result
    }

    /// Operator-requested rollback of a running workflow.
    pub async fn rollback_workflow(&self, id: &str, to_version: Option<&str>) -> bool {
        self.begin_rollback(
            id,
            RollbackRequest {
                trigger: TriggerType::ManualTrigger,
                reason: "manual rollback requested".into(),
                to_version: to_version.map(str::to_string),
                automatic: false,
                requested_at: Utc::now(),
            },
        )
        .await
    }

    /// Rollback on a detected breach. Only proceeds when the workflow
    /// allows automatic rollback; a second call is a no-op.
    pub async fn auto_rollback(&self, id: &str, trigger: TriggerType, reason: String) -> bool {
        self.begin_rollback(
            id,
            RollbackRequest {
                trigger,
                reason,
                to_version: None,
                automatic: true,
                requested_at: Utc::now(),
            },
        )
        .await
    }

    async fn begin_rollback(&self, id: &str, request: RollbackRequest) -> bool {
        let admission = self.inner.admission.lock().await;
        let Some(slot) = admission.runs.get(id) else {
            debug!(workflow = %id, "rollback ignored: workflow not running");
            return false;
        };
        let mut wf = slot.workflow.lock().await;

        match wf.status {
            WorkflowStatus::Running => {}
            WorkflowStatus::RollingBack | WorkflowStatus::RolledBack => {
                debug!(workflow = %id, "rollback already underway");
                return false;
            }
            status => {
                debug!(workflow = %id, %status, "rollback ignored");
                return false;
            }
        }
        if !wf.rollback_enabled() {
            warn!(workflow = %id, "rollback requested but disabled for this workflow");
            return false;
        }
        if request.automatic && !wf.automatic_rollback() {
            info!(workflow = %id, trigger = %request.trigger, "automatic rollback disabled, leaving workflow running");
            return false;
        }

        let to_version = request.to_version.clone().or_else(|| {
            wf.rollback
                .as_ref()
                .and_then(|r| r.target_version.clone())
        });
        let phases = match self
            .inner
            .registry
            .resolve(wf.strategy)
            .and_then(|planner| planner.create_rollback_phases(&wf, to_version.as_deref()))
        {
            Ok(phases) => phases,
            Err(e) => {
                wf.record_error(WorkflowError::new(
                    Severity::Error,
                    ErrorKind::Rollback,
                    format!("cannot plan rollback: {e}"),
                ));
                return false;
            }
        };

        wf.record_error(WorkflowError::new(
            Severity::Warning,
            ErrorKind::Rollback,
            format!("rollback requested ({}): {}", request.trigger, request.reason),
        ));
        wf.rollback_phases = phases;
        let reason = request.reason.clone();
        wf.rollback_request = Some(request);
        match self
            .inner
            .repository
            .transition(&mut wf, WorkflowStatus::RollingBack, Some(&reason))
            .await
        {
            Ok(true) => {}
            Ok(false) => return false,
            Err(e) => {
                // The in-memory status moved; the executor persists it at the next checkpoint.
                warn!(workflow = %id, error = %e, "failed to persist rollback start");
            }
        }
        drop(wf);
        control::signal(&slot.control, Control::Rollback);
        true
    }

    /// Release a workflow waiting at a manual approval gate.
    pub async fn promote_workflow(&self, id: &str) -> bool {
        let admission = self.inner.admission.lock().await;
        let promoted = admission
            .runs
            .get(id)
            .is_some_and(|slot| slot.approval.approve());
        info!(workflow = %id, promoted, "promotion requested");
        promoted
    }

    /// Cancel every run and stop rollback monitoring.
    pub async fn shutdown(&self) {
        {
            let admission = self.inner.admission.lock().await;
            for slot in admission.runs.values() {
                control::signal(
                    &slot.control,
                    Control::Cancel {
                        reason: "orchestrator shutting down".into(),
                    },
                );
            }
        }
        self.inner.deps.monitor.stop_all().await;
    }

    // ── Queries ───────────────────────────────────────────────────

    /// The live copy for running workflows, the repository's otherwise.
    pub async fn get_workflow(&self, id: &str) -> EngineResult<Option<Workflow>> {
        let live = {
            let admission = self.inner.admission.lock().await;
            admission.runs.get(id).map(|slot| slot.workflow.clone())
        };
        match live {
            Some(workflow) => Ok(Some(workflow.lock().await.clone())),
            None => self.inner.repository.load(id).await,
        }
    }

    pub fn list_workflows(&self, filter: &WorkflowFilter) -> EngineResult<Vec<Workflow>> {
        self.inner.repository.list(filter)
    }

    pub fn transitions(&self, id: &str) -> EngineResult<Vec<TransitionRecord>> {
        self.inner.repository.transitions(id)
    }

    /// Whether an executor is still attached to the workflow.
    pub async fn is_running(&self, id: &str) -> bool {
        let admission = self.inner.admission.lock().await;
        admission
            .runs
            .get(id)
            .is_some_and(|slot| !slot.handle.is_finished())
    }

    pub async fn queued(&self) -> Vec<WorkflowId> {
        self.inner.admission.lock().await.queue.iter().cloned().collect()
    }

    /// Wait until the workflow is terminal and its executor has exited.
    /// `None` when `timeout` passes first.
    pub async fn wait_for_completion(
        &self,
        id: &str,
        timeout: Duration,
    ) -> EngineResult<Option<WorkflowStatus>> {
        let mut finished = self.inner.finished.subscribe();
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let status = self.load_required(id).await?.status;
            if status.is_terminal() && !self.is_running(id).await {
                return Ok(Some(status));
            }
            match tokio::time::timeout_at(deadline, finished.changed()).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) | Err(_) => return Ok(None),
            }
        }
    }

    /// Remove a terminal workflow and its cached snapshots.
    pub async fn delete_workflow(&self, id: &str) -> EngineResult<bool> {
        let Some(wf) = self.inner.repository.load(id).await? else {
            return Ok(false);
        };
        if !wf.status.is_terminal() || self.is_running(id).await {
            return Err(EngineError::InvalidState {
                id: id.to_string(),
                status: wf.status,
                action: "delete",
            });
        }
        self.inner.repository.delete(id).await
    }

    /// Outcome counts for workflows created within `window` (all when `None`).
    pub fn get_statistics(&self, window: Option<Duration>) -> EngineResult<WorkflowStatistics> {
        let created_after = match window {
            Some(w) => Some(
                Utc::now()
                    - chrono::Duration::from_std(w)
                        .map_err(|e| EngineError::Execution(format!("invalid window: {e}")))?,
            ),
            None => None,
        };
        let workflows = self.inner.repository.list(&WorkflowFilter {
            created_after,
            ..Default::default()
        })?;
        Ok(WorkflowStatistics::from_workflows(&workflows))
    }

    pub async fn get_health(&self) -> HealthReport {
        let config = &self.inner.config;
        let (runs, queued) = {
            let admission = self.inner.admission.lock().await;
            let runs: Vec<_> = admission.runs.values().map(|s| s.workflow.clone()).collect();
            (runs, admission.queue.len())
        };

        let mut issues = Vec::new();
        if runs.len() > config.max_concurrent_workflows {
            issues.push(format!(
                "{} running workflows exceed limit {}",
                runs.len(),
                config.max_concurrent_workflows
            ));
        }
        if queued >= config.max_queued_workflows {
            issues.push(format!("admission queue full ({queued} waiting)"));
        }
        let now = Utc::now();
        for workflow in &runs {
            let wf = workflow.lock().await;
            if let Some(started) = wf.started_at
                && (now - started).num_seconds() > wf.policy.workflow_timeout_secs as i64
            {
                issues.push(format!("workflow {} is running past its timeout", wf.id));
            }
        }
        if !issues.is_empty() {
            warn!(issues = issues.len(), "orchestrator degraded");
        }
        HealthReport::new(runs.len(), queued, issues)
    }

    async fn load_required(&self, id: &str) -> EngineResult<Workflow> {
        self.inner
            .repository
            .load(id)
            .await?
            .ok_or_else(|| EngineError::NotFound(id.to_string()))
    }
}

#[async_trait]
impl RollbackHandle for Orchestrator {
    async fn auto_rollback(&self, workflow_id: &str, trigger: TriggerType, reason: String) -> bool {
        Orchestrator::auto_rollback(self, workflow_id, trigger, reason).await
    }
}

fn startable(status: WorkflowStatus) -> bool {
    matches!(status, WorkflowStatus::Created | WorkflowStatus::Queued)
}

/// Monitor callback that escalates to `auto_rollback` while the
/// orchestrator is alive.
fn breach_callback(inner: Weak<Inner>) -> RollbackCallback {
    Arc::new(move |id: WorkflowId, breach: Breach| -> BoxFuture<bool> {
        let inner = inner.clone();
        Box::pin(async move {
            match inner.upgrade() {
                Some(inner) => {
                    Orchestrator { inner }
                        .auto_rollback(&id, breach.trigger.clone(), breach.reason())
                        .await
                }
                None => false,
            }
        })
    })
}
