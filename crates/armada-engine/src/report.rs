//! Aggregate views over workflows: statistics and orchestrator health.

use serde::{Deserialize, Serialize};

use armada_core::{Workflow, WorkflowStatus};

/// Outcome counts over a time window.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStatistics {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub rolled_back: usize,
    pub cancelled: usize,
    /// Completed over finished, as a percentage.
    pub success_rate: f64,
    /// Mean wall time of finished workflows, in seconds.
    pub average_duration_secs: Option<f64>,
}

impl WorkflowStatistics {
    pub fn from_workflows(workflows: &[Workflow]) -> Self {
        let mut stats = Self {
            total: workflows.len(),
            ..Default::default()
        };
        let mut durations = Vec::new();
        for wf in workflows {
            match wf.status {
                WorkflowStatus::Completed => stats.completed += 1,
                WorkflowStatus::Failed => stats.failed += 1,
                WorkflowStatus::RolledBack => stats.rolled_back += 1,
                WorkflowStatus::Cancelled => stats.cancelled += 1,
                _ => continue,
            }
            if let Some(d) = wf.duration() {
                durations.push(d.num_milliseconds() as f64 / 1_000.0);
            }
        }

        let finished = stats.finished();
        if finished > 0 {
            stats.success_rate = stats.completed as f64 * 100.0 / finished as f64;
        }
        if !durations.is_empty() {
            stats.average_duration_secs =
                Some(durations.iter().sum::<f64>() / durations.len() as f64);
        }
        stats
    }

    pub fn finished(&self) -> usize {
        self.completed + self.failed + self.rolled_back + self.cancelled
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub is_healthy: bool,
    pub active_count: usize,
    pub queued_count: usize,
    pub issues: Vec<String>,
}

impl HealthReport {
    pub fn new(active_count: usize, queued_count: usize, issues: Vec<String>) -> Self {
        let is_healthy = issues.is_empty();
        Self {
            status: if is_healthy {
                HealthStatus::Healthy
            } else {
                HealthStatus::Degraded
            },
            is_healthy,
            active_count,
            queued_count,
            issues,
        }
    }
}

#[cfg(test)]
mod tests {
    use armada_core::{StrategyConfig, TargetHost};

    use super::*;

    fn workflow(status: WorkflowStatus) -> Workflow {
        let mut wf = Workflow::new(
            format!("wf-{status}"),
            "api",
            "2.0.0",
            "api-2.0.0",
            StrategyConfig::default(),
            vec![TargetHost::new("web-00")],
        );
        wf.status = status;
        wf
    }

    #[test]
    fn success_rate_over_finished_only() {
        let workflows = vec![
            workflow(WorkflowStatus::Completed),
            workflow(WorkflowStatus::Completed),
            workflow(WorkflowStatus::Completed),
            workflow(WorkflowStatus::Failed),
            workflow(WorkflowStatus::Running),
            workflow(WorkflowStatus::Created),
        ];
        let stats = WorkflowStatistics::from_workflows(&workflows);
        assert_eq!(stats.total, 6);
        assert_eq!(stats.finished(), 4);
        assert!((stats.success_rate - 75.0).abs() < f64::EPSILON);
        assert_eq!(stats.average_duration_secs, None);
    }

    #[test]
    fn empty_window_reports_zero() {
        let stats = WorkflowStatistics::from_workflows(&[]);
        assert_eq!(stats.success_rate, 0.0);
    }

    #[test]
    fn issues_degrade_health() {
        assert!(HealthReport::new(2, 0, Vec::new()).is_healthy);
        let report = HealthReport::new(11, 0, vec!["11 running workflows exceed limit 10".into()]);
        assert_eq!(report.status, HealthStatus::Degraded);
        assert!(!report.is_healthy);
    }
}
