//! Step execution: dispatch, traffic actions, health waits, retries.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use armada_collab::metrics::names;
use armada_collab::{CollabError, MetricFilter};
use armada_core::{
    CommandReply, ErrorKind, Severity, Step, StepStatus, StepType, TrafficAction, WorkflowError,
};

use crate::executor::{Plan, RunContext, StepFailure, plan_phases};

/// Poll period while waiting for a host to report healthy.
const HEALTH_POLL: Duration = Duration::from_secs(2);
/// How far back a health sample may be and still count.
const HEALTH_LOOKBACK_SECS: i64 = 60;

#[derive(Debug)]
enum AttemptError {
    Rejected(String),
    TimedOut(Duration),
    Collab(CollabError),
}

impl fmt::Display for AttemptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rejected(msg) => f.write_str(msg),
            Self::TimedOut(after) => write!(f, "timed out after {}s", after.as_secs()),
            Self::Collab(e) => write!(f, "{e}"),
        }
    }
}

impl From<CollabError> for AttemptError {
    fn from(e: CollabError) -> Self {
        Self::Collab(e)
    }
}

fn reply_result(reply: CommandReply) -> Result<String, AttemptError> {
    if reply.success {
        Ok(reply.output.unwrap_or_default())
    } else {
        Err(AttemptError::Rejected(
            reply.error.unwrap_or_else(|| "command failed".into()),
        ))
    }
}

impl RunContext {
    /// Run a step through all of its attempts.
    pub(crate) async fn run_step(
        self: &Arc<Self>,
        plan: Plan,
        idx: usize,
        si: usize,
        prefetched: &Mutex<HashMap<String, CommandReply>>,
    ) -> Result<(), StepFailure> {
        let Some((step, retry, service)) = self
            .update(plan, |wf| {
                let service = wf.service.clone();
                let phase = &mut plan_phases(wf, plan)[idx];
                let retry = phase.retry;
                let step = &mut phase.steps[si];
                step.transition(StepStatus::Running);
                (step.clone(), retry, service)
            })
            .await
        else {
            return Err(StepFailure {
                critical: true,
                message: "run halted".into(),
            });
        };

        let max_attempts = step.max_retries + 1;
        let mut last_error = AttemptError::Rejected("not attempted".into());
        for attempt in 1..=max_attempts {
            self.update(plan, |wf| {
                let step = &mut plan_phases(wf, plan)[idx].steps[si];
                step.attempts = attempt;
                step.command.attempt = attempt;
            })
            .await;

            let early = if attempt == 1 {
                prefetched.lock().await.remove(&step.id)
            } else {
                None
            };
            let result = match early {
                Some(reply) => reply_result(reply),
                None => {
                    let mut step = step.clone();
                    step.command.attempt = attempt;
                    match tokio::time::timeout(step.timeout(), self.attempt(&step, &service)).await {
                        Ok(result) => result,
                        Err(_) => Err(AttemptError::TimedOut(step.timeout())),
                    }
                }
            };

            match result {
                Ok(output) => {
                    self.update(plan, |wf| {
                        let step = &mut plan_phases(wf, plan)[idx].steps[si];
                        step.output = Some(output);
                        step.error = None;
                        step.transition(StepStatus::Completed);
                        wf.update_progress();
                    })
                    .await;
                    debug!(workflow = %self.workflow_id, step = %step.id, attempt, "step completed");
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        workflow = %self.workflow_id,
                        step = %step.id,
                        host = step.host.as_deref().unwrap_or("service"),
                        attempt,
                        max_attempts,
                        error = %e,
                        "step attempt failed"
                    );
                    last_error = e;
                    if attempt < max_attempts {
                        tokio::time::sleep(retry.backoff(attempt)).await;
                    }
                }
            }
        }

        let message = format!("{} {}: {last_error}", step.step_type, step.id);
        let kind = match last_error {
            AttemptError::TimedOut(_) => ErrorKind::Timeout,
            _ => ErrorKind::Execution,
        };
        let severity = if step.critical {
            Severity::Error
        } else {
            Severity::Warning
        };
        self.update(plan, |wf| {
            let phase = &mut plan_phases(wf, plan)[idx];
            let phase_id = phase.id.clone();
            let step = &mut phase.steps[si];
            step.error = Some(last_error.to_string());
            step.transition(StepStatus::Failed);
            let entry = WorkflowError::new(severity, kind, &message)
                .in_phase(&phase_id)
                .at_step(&step.id)
                .on_host(step.host.as_deref());
            wf.record_error(entry);
        })
        .await;
        Err(StepFailure {
            critical: step.critical,
            message,
        })
    }

    /// One attempt, without retry or timeout.
    async fn attempt(&self, step: &Step, service: &str) -> Result<String, AttemptError> {
        match step.step_type {
            StepType::TrafficSwitch => match &step.traffic {
                Some(action) => self.apply_traffic(service, action).await,
                None => Err(AttemptError::Rejected("traffic step without an action".into())),
            },
            StepType::WaitForHealthy => self.wait_for_healthy(service, step.host.as_deref()).await,
            _ => {
                let reply = self
                    .collab
                    .dispatcher
                    .publish(&step.command, &step.command.routing_key())
                    .await?;
                reply_result(reply)
            }
        }
    }

    async fn apply_traffic(&self, service: &str, action: &TrafficAction) -> Result<String, AttemptError> {
        let traffic = &self.collab.traffic;
        match action {
            TrafficAction::AddToPool { pool, host } => {
                traffic.add_to_pool(pool, host).await?;
                Ok(format!("{host} added to {pool}"))
            }
            TrafficAction::RemoveFromPool { pool, host } => {
                traffic.remove_from_pool(pool, host).await?;
                Ok(format!("{host} removed from {pool}"))
            }
            TrafficAction::Switch { route } => {
                traffic.switch_traffic(service, route).await?;
                Ok(format!("{}% of {service} routed to {}", route.percentage, route.pool))
            }
            TrafficAction::PoolHealthCheck { pool, host } => {
                if traffic.health_check(pool, host).await? {
                    Ok(format!("{host} healthy in {pool}"))
                } else {
                    Err(AttemptError::Rejected(format!("{host} unhealthy in {pool}")))
                }
            }
        }
    }

    /// Poll the health feed until the latest sample reports healthy.
    async fn wait_for_healthy(&self, service: &str, host: Option<&str>) -> Result<String, AttemptError> {
        let filter = match host {
            Some(host) => MetricFilter::for_hosts(service, &[host.to_string()]),
            None => MetricFilter {
                service: Some(service.to_string()),
                hosts: Vec::new(),
            },
        };
        loop {
            let to = Utc::now();
            let from = to - chrono::Duration::seconds(HEALTH_LOOKBACK_SECS);
            let samples = self
                .collab
                .metrics
                .get_metric_values(names::HEALTH_STATUS, from, to, &filter)
                .await?;
            if samples.last().is_some_and(|v| *v >= 1.0) {
                return Ok("healthy".into());
            }
            tokio::time::sleep(HEALTH_POLL).await;
        }
    }
}
