//! Rollback monitor — background task that evaluates a workflow's
//! rollback conditions while it runs.
//!
//! One loop per workflow. A breach is handed to the callback; once the
//! callback reports that a rollback was started the loop exits. Loops are
//! stopped and joined when the workflow finishes, so none outlives it.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{RwLock, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use armada_collab::MetricFilter;
use armada_core::{RollbackCondition, WorkflowId};

use crate::evaluator::{Breach, RollbackEvaluator};

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Invoked with each breach; resolves to `true` when a rollback started.
pub type RollbackCallback = Arc<dyn Fn(WorkflowId, Breach) -> BoxFuture<bool> + Send + Sync>;

/// How long `stop_monitor` waits for a loop to exit before aborting it.
const JOIN_GRACE: Duration = Duration::from_secs(5);

/// What to watch for one workflow.
#[derive(Debug, Clone)]
pub struct MonitorSpec {
    pub workflow_id: WorkflowId,
    pub conditions: Vec<RollbackCondition>,
    pub filter: MetricFilter,
    pub interval: Duration,
}

struct MonitorSlot {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

/// Manages rollback monitors for running workflows.
pub struct RollbackMonitor {
    evaluator: Arc<RollbackEvaluator>,
    /// workflow_id → slot.
    monitors: Arc<RwLock<HashMap<WorkflowId, MonitorSlot>>>,
    on_breach: Option<RollbackCallback>,
}

impl RollbackMonitor {
    pub fn new(evaluator: Arc<RollbackEvaluator>) -> Self {
        Self {
            evaluator,
            monitors: Arc::new(RwLock::new(HashMap::new())),
            on_breach: None,
        }
    }

    pub fn with_callback(mut self, callback: RollbackCallback) -> Self {
        self.on_breach = Some(callback);
        self
    }

    /// Start monitoring; replaces any monitor already running for the workflow.
    pub async fn start_monitor(&self, spec: MonitorSpec) {
        if spec.conditions.iter().all(|c| !c.enabled) {
            debug!(workflow_id = %spec.workflow_id, "no enabled rollback conditions, not monitoring");
            return;
        }
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let workflow_id = spec.workflow_id.clone();
        let interval = spec.interval;
        let evaluator = self.evaluator.clone();
        let callback = self.on_breach.clone();

        let handle = tokio::spawn(async move {
            run_rollback_loop(spec, evaluator, callback, shutdown_rx).await;
        });

        let mut monitors = self.monitors.write().await;
        if let Some(old) = monitors.insert(
            workflow_id.clone(),
            MonitorSlot {
                handle,
                shutdown_tx,
            },
        ) {
            let _ = old.shutdown_tx.send(true);
            old.handle.abort();
        }
        info!(%workflow_id, interval_secs = interval.as_secs(), "rollback monitor started");
    }

    /// Stop a workflow's monitor and wait for its loop to exit.
    pub async fn stop_monitor(&self, workflow_id: &str) {
        let slot = self.monitors.write().await.remove(workflow_id);
        if let Some(slot) = slot {
            join_slot(slot).await;
            info!(%workflow_id, "rollback monitor stopped");
        }
    }

    pub async fn stop_all(&self) {
        let slots: Vec<_> = self.monitors.write().await.drain().collect();
        for (id, slot) in slots {
            join_slot(slot).await;
            debug!(workflow_id = %id, "rollback monitor stopped");
        }
        info!("all rollback monitors stopped");
    }

    pub async fn active_monitors(&self) -> Vec<WorkflowId> {
        let monitors = self.monitors.read().await;
        monitors
            .iter()
            .filter(|(_, slot)| !slot.handle.is_finished())
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// True while the workflow's loop is still evaluating.
    pub async fn is_monitoring(&self, workflow_id: &str) -> bool {
        let monitors = self.monitors.read().await;
        monitors
            .get(workflow_id)
            .is_some_and(|slot| !slot.handle.is_finished())
    }
}

async fn join_slot(mut slot: MonitorSlot) {
    let _ = slot.shutdown_tx.send(true);
    if tokio::time::timeout(JOIN_GRACE, &mut slot.handle).await.is_err() {
        slot.handle.abort();
    }
}

async fn run_rollback_loop(
    spec: MonitorSpec,
    evaluator: Arc<RollbackEvaluator>,
    callback: Option<RollbackCallback>,
    mut shutdown: watch::Receiver<bool>,
) {
    let workflow_id = spec.workflow_id;
    debug!(%workflow_id, conditions = spec.conditions.len(), "rollback loop starting");

    loop {
        tokio::select! {
            _ = tokio::time::sleep(spec.interval) => {
                let breach = match evaluator.evaluate(&spec.conditions, &spec.filter).await {
                    Ok(breach) => breach,
                    Err(e) => {
                        warn!(%workflow_id, error = %e, "rollback evaluation failed");
                        continue;
                    }
                };
                let Some(breach) = breach else { continue };
                warn!(%workflow_id, reason = %breach.reason(), "rollback condition breached");
                if let Some(ref cb) = callback
                    && cb(workflow_id.clone(), breach).await
                {
                    debug!(%workflow_id, "rollback started, monitor exiting");
                    break;
                }
            }
            _ = shutdown.changed() => {
                debug!(%workflow_id, "rollback loop shutting down");
                break;
            }
        }
    }
}
