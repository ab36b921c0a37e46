//! Phase gates: monitoring windows, canary analysis, approvals, pauses.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use armada_collab::metrics::names;
use armada_core::{
    ErrorKind, HostId, MetricCriterion, PhaseGate, RollbackCondition, Severity, TriggerType,
    WorkflowError,
};
use armada_rollback::AdvancementDecision;

use crate::executor::{Plan, PhaseOutcome, RunContext, plan_phases};

/// Trigger reported when an advancement criterion on `metric` is violated.
fn trigger_for_metric(metric: &str) -> TriggerType {
    match metric {
        names::ERROR_RATE => TriggerType::ErrorRate,
        names::RESPONSE_TIME_MS => TriggerType::ResponseTime,
        names::HEALTH_CHECK_FAILURES => TriggerType::HealthCheckFailure,
        names::MEMORY_PERCENT => TriggerType::MemoryUsage,
        names::CPU_PERCENT => TriggerType::CpuUsage,
        other => TriggerType::Custom {
            metric: other.to_string(),
        },
    }
}

impl RunContext {
    pub(crate) async fn run_gate(
        self: &Arc<Self>,
        plan: Plan,
        idx: usize,
        gate: PhaseGate,
        service: &str,
        hosts: &[HostId],
    ) -> PhaseOutcome {
        match gate {
            PhaseGate::Monitor {
                duration_secs,
                interval_secs,
                conditions,
            } => {
                self.monitor_window(plan, idx, duration_secs, interval_secs, &conditions, service, hosts)
                    .await
            }
            PhaseGate::Advancement {
                window_secs,
                interval_secs,
                minimum_samples,
                criteria,
                rollback_on_breach,
            } => {
                let window = AnalysisWindow {
                    window_secs,
                    interval_secs,
                    minimum_samples,
                };
                self.analyse(plan, idx, window, &criteria, rollback_on_breach, service, hosts)
                    .await
            }
            PhaseGate::ManualApproval => {
                self.note(plan, idx, "waiting for manual promotion").await;
                self.approval.wait().await;
                info!(workflow = %self.workflow_id, "manual promotion received");
                PhaseOutcome::Completed
            }
            PhaseGate::Wait { duration_secs } => {
                debug!(workflow = %self.workflow_id, duration_secs, "gate pause");
                tokio::time::sleep(Duration::from_secs(duration_secs)).await;
                PhaseOutcome::Completed
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn monitor_window(
        &self,
        plan: Plan,
        idx: usize,
        duration_secs: u64,
        interval_secs: u64,
        conditions: &[RollbackCondition],
        service: &str,
        hosts: &[HostId],
    ) -> PhaseOutcome {
        let deadline = Instant::now() + Duration::from_secs(duration_secs);
        let interval = Duration::from_secs(interval_secs.max(1));
        let filter = self.metric_filter(service, hosts);

        loop {
            let now = Instant::now();
            if now >= deadline {
                return PhaseOutcome::Completed;
            }
            tokio::time::sleep(interval.min(deadline - now)).await;
            match self.evaluator.evaluate(conditions, &filter).await {
                Ok(Some(breach)) => {
                    let reason = breach.reason();
                    self.record(plan, idx, Severity::Error, ErrorKind::Rollback, &reason)
                        .await;
                    return self.escalate(breach.trigger, reason).await;
                }
                Ok(None) => {}
                Err(e) => warn!(workflow = %self.workflow_id, error = %e, "monitoring evaluation failed"),
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn analyse(
        &self,
        plan: Plan,
        idx: usize,
        window: AnalysisWindow,
        criteria: &[MetricCriterion],
        rollback_on_breach: bool,
        service: &str,
        hosts: &[HostId],
    ) -> PhaseOutcome {
        let deadline = Instant::now() + Duration::from_secs(window.window_secs);
        let interval = Duration::from_secs(window.interval_secs.max(1));
        let filter = self.metric_filter(service, hosts);

        let mut last = AdvancementDecision::Hold {
            metric: String::new(),
            samples: 0,
            required: window.minimum_samples,
        };
        loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            tokio::time::sleep(interval.min(deadline - now)).await;
            match self
                .evaluator
                .evaluate_advancement(criteria, window.minimum_samples, window.window_secs, &filter)
                .await
            {
                Ok(decision) => last = decision,
                Err(e) => {
                    warn!(workflow = %self.workflow_id, error = %e, "canary analysis failed");
                    continue;
                }
            }
            if let AdvancementDecision::Reject {
                metric,
                observed,
                threshold,
            } = &last
            {
                let reason =
                    format!("canary {metric} at {observed:.2} violates threshold {threshold:.2}");
                self.record(plan, idx, Severity::Error, ErrorKind::Rollback, &reason)
                    .await;
                if rollback_on_breach {
                    return self.escalate(trigger_for_metric(metric), reason).await;
                }
                return PhaseOutcome::Failed {
                    critical: true,
                    reason,
                };
            }
        }

        match last {
            AdvancementDecision::Advance => {
                info!(workflow = %self.workflow_id, "advancement criteria met");
                PhaseOutcome::Completed
            }
            AdvancementDecision::Hold {
                metric,
                samples,
                required,
            } => {
                let reason = format!(
                    "canary analysis inconclusive: {samples} samples of {metric}, {required} required"
                );
                self.record(plan, idx, Severity::Error, ErrorKind::Execution, &reason)
                    .await;
                PhaseOutcome::Failed {
                    critical: true,
                    reason,
                }
            }
            // Rejections return from the loop.
            AdvancementDecision::Reject { metric, .. } => PhaseOutcome::Failed {
                critical: true,
                reason: format!("canary {metric} rejected"),
            },
        }
    }

    async fn escalate(&self, trigger: TriggerType, reason: String) -> PhaseOutcome {
        if self
            .rollback
            .auto_rollback(&self.workflow_id, trigger, reason.clone())
            .await
        {
            PhaseOutcome::RollbackRequested
        } else {
            PhaseOutcome::Failed {
                critical: true,
                reason,
            }
        }
    }

    async fn record(&self, plan: Plan, idx: usize, severity: Severity, kind: ErrorKind, message: &str) {
        self.update(plan, |wf| {
            let phase_id = plan_phases(wf, plan)[idx].id.clone();
            wf.record_error(WorkflowError::new(severity, kind, message).in_phase(&phase_id));
        })
        .await;
    }

    async fn note(&self, plan: Plan, idx: usize, message: &str) {
        self.record(plan, idx, Severity::Info, ErrorKind::Info, message).await;
    }
}

#[derive(Debug, Clone, Copy)]
struct AnalysisWindow {
    window_secs: u64,
    interval_secs: u64,
    minimum_samples: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advancement_metrics_map_to_triggers() {
        assert_eq!(trigger_for_metric("error_rate"), TriggerType::ErrorRate);
        assert_eq!(trigger_for_metric("response_time_ms"), TriggerType::ResponseTime);
        assert_eq!(
            trigger_for_metric("checkout_conversion"),
            TriggerType::Custom {
                metric: "checkout_conversion".into()
            }
        );
    }
}
