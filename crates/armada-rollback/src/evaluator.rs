//! Rollback condition and canary advancement evaluation.
//!
//! A condition only decides once its window holds `minimum_data_points`
//! samples; a short window is `InsufficientData`, never a trigger.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;

use armada_collab::metrics::names;
use armada_collab::{CollabResult, MetricFilter, MetricsFeed};
use armada_core::{Aggregation, MetricCriterion, RollbackCondition, TriggerType};

/// Metric backing a trigger; `None` for triggers no metric can fire.
pub fn metric_for(trigger: &TriggerType) -> Option<&str> {
    match trigger {
        TriggerType::ErrorRate => Some(names::ERROR_RATE),
        TriggerType::ResponseTime => Some(names::RESPONSE_TIME_MS),
        TriggerType::HealthCheckFailure => Some(names::HEALTH_CHECK_FAILURES),
        TriggerType::MemoryUsage => Some(names::MEMORY_PERCENT),
        TriggerType::CpuUsage => Some(names::CPU_PERCENT),
        TriggerType::Custom { metric } => Some(metric.as_str()),
        TriggerType::ManualTrigger | TriggerType::Timeout => None,
    }
}

/// Reduce a sample window to one value.
pub fn aggregate(values: &[f64], aggregation: Aggregation) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let value = match aggregation {
        Aggregation::Mean => values.iter().sum::<f64>() / values.len() as f64,
        Aggregation::Sum => values.iter().sum(),
        Aggregation::Max => values.iter().copied().fold(f64::MIN, f64::max),
        Aggregation::Min => values.iter().copied().fold(f64::MAX, f64::min),
        Aggregation::P95 => {
            let mut sorted = values.to_vec();
            sorted.sort_by(f64::total_cmp);
            let rank = ((sorted.len() as f64) * 0.95).ceil() as usize;
            sorted[rank.clamp(1, sorted.len()) - 1]
        }
    };
    Some(value)
}

/// Failure counts add up over the window; everything else is averaged.
fn aggregation_for(trigger: &TriggerType) -> Aggregation {
    match trigger {
        TriggerType::HealthCheckFailure => Aggregation::Sum,
        _ => Aggregation::Mean,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConditionOutcome {
    Healthy { observed: f64, samples: usize },
    Breached { observed: f64, samples: usize },
    InsufficientData { samples: usize, required: u32 },
    /// Disabled, or a trigger with no metric.
    Skipped,
}

/// A breached condition, ready to be reported.
#[derive(Debug, Clone, PartialEq)]
pub struct Breach {
    pub trigger: TriggerType,
    pub observed: f64,
    pub threshold: f64,
    pub samples: usize,
}

impl Breach {
    pub fn reason(&self) -> String {
        format!(
            "{} at {:.2} exceeded threshold {:.2} over {} samples",
            self.trigger, self.observed, self.threshold, self.samples
        )
    }
}

/// Judge a condition against an already-fetched window.
pub fn judge(condition: &RollbackCondition, samples: &[f64]) -> ConditionOutcome {
    if !condition.enabled || metric_for(&condition.trigger).is_none() {
        return ConditionOutcome::Skipped;
    }
    if samples.len() < condition.minimum_data_points.max(1) as usize {
        return ConditionOutcome::InsufficientData {
            samples: samples.len(),
            required: condition.minimum_data_points,
        };
    }
    let observed = aggregate(samples, aggregation_for(&condition.trigger)).unwrap_or_default();
    if observed > condition.threshold {
        ConditionOutcome::Breached {
            observed,
            samples: samples.len(),
        }
    } else {
        ConditionOutcome::Healthy {
            observed,
            samples: samples.len(),
        }
    }
}

/// Result of judging canary metrics against advancement criteria.
#[derive(Debug, Clone, PartialEq)]
pub enum AdvancementDecision {
    Advance,
    /// Not enough evidence yet.
    Hold { metric: String, samples: usize, required: u32 },
    Reject { metric: String, observed: f64, threshold: f64 },
}

/// Judge criteria against fetched windows. A violated criterion with
/// enough samples rejects even while other metrics are still filling up.
pub fn judge_advancement(
    windows: &[(MetricCriterion, Vec<f64>)],
    minimum_samples: u32,
) -> AdvancementDecision {
    let required = minimum_samples.max(1) as usize;
    let mut hold = None;
    for (criterion, samples) in windows {
        if samples.len() < required {
            hold.get_or_insert(AdvancementDecision::Hold {
                metric: criterion.metric.clone(),
                samples: samples.len(),
                required: minimum_samples,
            });
            continue;
        }
        let observed = aggregate(samples, criterion.aggregation).unwrap_or_default();
        if !criterion.comparison.holds(observed, criterion.threshold) {
            return AdvancementDecision::Reject {
                metric: criterion.metric.clone(),
                observed,
                threshold: criterion.threshold,
            };
        }
    }
    hold.unwrap_or(AdvancementDecision::Advance)
}

/// Pulls metric windows and judges them. Side-effect free.
pub struct RollbackEvaluator {
    metrics: Arc<dyn MetricsFeed>,
}

impl RollbackEvaluator {
    pub fn new(metrics: Arc<dyn MetricsFeed>) -> Self {
        Self { metrics }
    }

    pub async fn evaluate_condition(
        &self,
        condition: &RollbackCondition,
        filter: &MetricFilter,
        now: DateTime<Utc>,
    ) -> CollabResult<ConditionOutcome> {
        let Some(metric) = metric_for(&condition.trigger) else {
            return Ok(ConditionOutcome::Skipped);
        };
        if !condition.enabled {
            return Ok(ConditionOutcome::Skipped);
        }
        let from = now - chrono::Duration::seconds(condition.evaluation_window_secs as i64);
        let samples = self
            .metrics
            .get_metric_values(metric, from, now, filter)
            .await?;
        let outcome = judge(condition, &samples);
        debug!(trigger = %condition.trigger, ?outcome, "rollback condition evaluated");
        Ok(outcome)
    }

    /// First enabled condition in breach, if any.
    pub async fn evaluate(
        &self,
        conditions: &[RollbackCondition],
        filter: &MetricFilter,
    ) -> CollabResult<Option<Breach>> {
        let now = Utc::now();
        for condition in conditions {
            if let ConditionOutcome::Breached { observed, samples } =
                self.evaluate_condition(condition, filter, now).await?
            {
                return Ok(Some(Breach {
                    trigger: condition.trigger.clone(),
                    observed,
                    threshold: condition.threshold,
                    samples,
                }));
            }
        }
        Ok(None)
    }

    /// Judge canary criteria over the trailing `window_secs`.
    pub async fn evaluate_advancement(
        &self,
        criteria: &[MetricCriterion],
        minimum_samples: u32,
        window_secs: u64,
        filter: &MetricFilter,
    ) -> CollabResult<AdvancementDecision> {
        let now = Utc::now();
        let from = now - chrono::Duration::seconds(window_secs as i64);
        let mut windows = Vec::with_capacity(criteria.len());
        for criterion in criteria {
            let samples = self
                .metrics
                .get_metric_values(&criterion.metric, from, now, filter)
                .await?;
            windows.push((criterion.clone(), samples));
        }
        let decision = judge_advancement(&windows, minimum_samples);
        debug!(?decision, "advancement evaluated");
        Ok(decision)
    }
}

#[cfg(test)]
mod tests {
    use armada_collab::memory::StaticMetricsFeed;
    use armada_core::Comparison;

    use super::*;

    fn error_rate(threshold: f64, min_points: u32) -> RollbackCondition {
        RollbackCondition::new(TriggerType::ErrorRate, threshold).window(300, min_points)
    }

    #[test]
    fn never_triggers_below_minimum_data_points() {
        let cond = error_rate(5.0, 3);
        assert_eq!(
            judge(&cond, &[50.0, 80.0]),
            ConditionOutcome::InsufficientData {
                samples: 2,
                required: 3
            }
        );
        assert!(matches!(
            judge(&cond, &[50.0, 80.0, 90.0]),
            ConditionOutcome::Breached { samples: 3, .. }
        ));
    }

    #[test]
    fn mean_at_threshold_is_healthy() {
        let cond = error_rate(5.0, 1);
        assert!(matches!(
            judge(&cond, &[4.0, 6.0]),
            ConditionOutcome::Healthy { .. }
        ));
    }

    #[test]
    fn health_failures_are_summed() {
        let cond = RollbackCondition::new(TriggerType::HealthCheckFailure, 2.0).window(60, 3);
        assert!(matches!(
            judge(&cond, &[1.0, 1.0, 1.0]),
            ConditionOutcome::Breached { observed, .. } if observed == 3.0
        ));
    }

    #[test]
    fn disabled_and_manual_conditions_skip() {
        let mut cond = error_rate(1.0, 1);
        cond.enabled = false;
        assert_eq!(judge(&cond, &[99.0]), ConditionOutcome::Skipped);
        let manual = RollbackCondition::new(TriggerType::ManualTrigger, 0.0);
        assert_eq!(judge(&manual, &[1.0]), ConditionOutcome::Skipped);
    }

    #[test]
    fn aggregations() {
        let values = [1.0, 2.0, 3.0, 4.0, 100.0];
        assert_eq!(aggregate(&values, Aggregation::Max), Some(100.0));
        assert_eq!(aggregate(&values, Aggregation::Min), Some(1.0));
        assert_eq!(aggregate(&values, Aggregation::Sum), Some(110.0));
        assert_eq!(aggregate(&values, Aggregation::P95), Some(100.0));
        assert_eq!(aggregate(&[], Aggregation::Mean), None);
    }

    #[test]
    fn advancement_rejects_on_violation_and_holds_without_evidence() {
        let error = MetricCriterion::new("error_rate", Comparison::LessThan, 1.0);
        let latency = MetricCriterion::new("response_time_ms", Comparison::LessThan, 200.0);

        let decision = judge_advancement(
            &[(error.clone(), vec![0.1, 0.2]), (latency.clone(), vec![100.0])],
            2,
        );
        assert!(matches!(decision, AdvancementDecision::Hold { ref metric, .. } if metric == "response_time_ms"));

        let decision = judge_advancement(
            &[(error.clone(), vec![3.0, 3.0]), (latency.clone(), vec![])],
            2,
        );
        assert!(matches!(decision, AdvancementDecision::Reject { ref metric, .. } if metric == "error_rate"));

        let decision = judge_advancement(&[(error, vec![0.1, 0.2]), (latency, vec![90.0, 110.0])], 2);
        assert_eq!(decision, AdvancementDecision::Advance);
    }

    #[tokio::test]
    async fn evaluate_returns_first_breach() {
        let feed = Arc::new(StaticMetricsFeed::new());
        feed.record("error_rate", Some("web-01"), &[9.0, 9.0, 9.0]).await;
        feed.record("cpu_percent", None, &[99.0, 99.0, 99.0]).await;
        let evaluator = RollbackEvaluator::new(feed);
        let filter = MetricFilter::for_hosts("api", &["web-01".to_string()]);

        let conditions = vec![
            RollbackCondition::new(TriggerType::ResponseTime, 100.0),
            RollbackCondition::new(TriggerType::ErrorRate, 5.0),
            RollbackCondition::new(TriggerType::CpuUsage, 90.0),
        ];
        let breach = evaluator.evaluate(&conditions, &filter).await.unwrap().unwrap();
        assert_eq!(breach.trigger, TriggerType::ErrorRate);
        assert_eq!(breach.samples, 3);
        assert!(breach.reason().contains("error_rate"));
    }

    #[tokio::test]
    async fn evaluate_is_quiet_without_data() {
        let feed = Arc::new(StaticMetricsFeed::new());
        let evaluator = RollbackEvaluator::new(feed);
        let breach = evaluator
            .evaluate(&[error_rate(0.0, 3)], &MetricFilter::default())
            .await
            .unwrap();
        assert!(breach.is_none());
    }
}
