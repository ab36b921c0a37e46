//! Metric samples from the monitoring collaborator.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use armada_core::HostId;

use crate::error::CollabResult;

/// Well-known metric names published by host agents.
pub mod names {
    /// Error rate in percent.
    pub const ERROR_RATE: &str = "error_rate";
    pub const RESPONSE_TIME_MS: &str = "response_time_ms";
    /// Failed health probes per sample interval.
    pub const HEALTH_CHECK_FAILURES: &str = "health_check_failures";
    /// 1.0 when the host reports healthy, 0.0 otherwise.
    pub const HEALTH_STATUS: &str = "health_status";
    pub const MEMORY_PERCENT: &str = "memory_percent";
    pub const CPU_PERCENT: &str = "cpu_percent";
}

/// Restricts a metric query to a service and/or hosts.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricFilter {
    pub service: Option<String>,
    pub hosts: Vec<HostId>,
}

impl MetricFilter {
    pub fn for_hosts(service: &str, hosts: &[HostId]) -> Self {
        Self {
            service: Some(service.to_string()),
            hosts: hosts.to_vec(),
        }
    }
}

#[async_trait]
pub trait MetricsFeed: Send + Sync {
    /// Samples of `metric` observed in `[from, to]`, oldest first.
    async fn get_metric_values(
        &self,
        metric: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        filter: &MetricFilter,
    ) -> CollabResult<Vec<f64>>;
}
