use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::error::CollabResult;
use crate::metrics::{MetricFilter, MetricsFeed};

type SeriesKey = (String, Option<String>);

#[derive(Default)]
struct Inner {
    /// Time-independent values, returned as one sample per query.
    gauges: HashMap<SeriesKey, f64>,
    samples: HashMap<SeriesKey, Vec<(DateTime<Utc>, f64)>>,
}

/// Metrics feed backed by values pushed from tests or the simulator.
///
/// Series are keyed by metric and optionally host. A query returns the
/// service-wide series plus the series of every host in the filter (all
/// hosts when the filter names none).
#[derive(Default)]
pub struct StaticMetricsFeed {
    inner: Mutex<Inner>,
}

impl StaticMetricsFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_gauge(&self, metric: &str, host: Option<&str>, value: f64) {
        self.inner
            .lock()
            .await
            .gauges
            .insert((metric.to_string(), host.map(str::to_string)), value);
    }

    /// Record samples stamped now.
    pub async fn record(&self, metric: &str, host: Option<&str>, values: &[f64]) {
        let now = Utc::now();
        let mut inner = self.inner.lock().await;
        let series = inner
            .samples
            .entry((metric.to_string(), host.map(str::to_string)))
            .or_default();
        series.extend(values.iter().map(|v| (now, *v)));
    }

    /// Drop all samples and gauges for `metric`.
    pub async fn clear(&self, metric: &str) {
        let mut inner = self.inner.lock().await;
        inner.gauges.retain(|(m, _), _| m != metric);
        inner.samples.retain(|(m, _), _| m != metric);
    }
}

fn selected(host: &Option<String>, filter: &MetricFilter) -> bool {
    match host {
        None => true,
        Some(h) => filter.hosts.is_empty() || filter.hosts.contains(h),
    }
}

#[async_trait]
impl MetricsFeed for StaticMetricsFeed {
    async fn get_metric_values(
        &self,
        metric: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        filter: &MetricFilter,
    ) -> CollabResult<Vec<f64>> {
        let inner = self.inner.lock().await;
        let mut values = Vec::new();
        let mut samples: Vec<(DateTime<Utc>, f64)> = inner
            .samples
            .iter()
            .filter(|((m, host), _)| m == metric && selected(host, filter))
            .flat_map(|(_, series)| series.iter().copied())
            .filter(|(at, _)| *at >= from && *at <= to)
            .collect();
        samples.sort_by_key(|(at, _)| *at);
        values.extend(samples.into_iter().map(|(_, v)| v));
        values.extend(
            inner
                .gauges
                .iter()
                .filter(|((m, host), _)| m == metric && selected(host, filter))
                .map(|(_, v)| *v),
        );
        Ok(values)
    }
}
