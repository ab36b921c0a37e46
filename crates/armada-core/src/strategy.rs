//! Rollout strategies — rolling waves, blue-green, canary.
//!
//! Each strategy has an explicit configuration struct; the closed
//! [`StrategyConfig`] enum is what a workflow stores. Every struct fills
//! missing fields from `Default`, so requests only name what they change.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::command::SplitMethod;
use crate::model::HostId;

/// The strategy family a workflow uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    Rolling,
    BlueGreen,
    Canary,
    Immediate,
    Scheduled,
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Rolling => "rolling",
            Self::BlueGreen => "blue_green",
            Self::Canary => "canary",
            Self::Immediate => "immediate",
            Self::Scheduled => "scheduled",
        };
        f.write_str(s)
    }
}

/// How to roll out a new version of a service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StrategyConfig {
    /// Replace hosts wave by wave. Default.
    Rolling(RollingConfig),
    /// Deploy to the idle environment, then move traffic over.
    BlueGreen(BlueGreenConfig),
    /// Validate on a subset before touching the rest.
    Canary(CanaryConfig),
    /// Everything at once.
    Immediate,
    /// Deferred start.
    Scheduled(ScheduledConfig),
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self::Rolling(RollingConfig::default())
    }
}

impl StrategyConfig {
    pub fn kind(&self) -> StrategyKind {
        match self {
            Self::Rolling(_) => StrategyKind::Rolling,
            Self::BlueGreen(_) => StrategyKind::BlueGreen,
            Self::Canary(_) => StrategyKind::Canary,
            Self::Immediate => StrategyKind::Immediate,
            Self::Scheduled(_) => StrategyKind::Scheduled,
        }
    }
}

// ── Rolling ───────────────────────────────────────────────────────

/// How hosts are grouped into waves.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WaveStrategy {
    FixedSize {
        size: u32,
    },
    Percentage {
        percent: f64,
    },
    /// One wave per region or datacenter; `priority` orders the groups,
    /// unlisted groups follow alphabetically.
    Geographic {
        #[serde(default)]
        group_by: GeoGrouping,
        #[serde(default)]
        priority: Vec<String>,
    },
    Custom {
        waves: Vec<NamedWave>,
    },
    /// Starts at `initial_size` and resizes the next wave from the health
    /// of the previous one.
    Adaptive {
        initial_size: u32,
        min_size: u32,
        growth_factor: f64,
    },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum GeoGrouping {
    #[default]
    Region,
    Datacenter,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NamedWave {
    pub name: String,
    pub hosts: Vec<HostId>,
}

/// Order in which touched waves are reverted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RollbackOrder {
    #[default]
    ReverseWave,
    SameAsDeployment,
    Custom {
        hosts: Vec<HostId>,
    },
}

/// Configuration for rolling updates.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RollingConfig {
    pub wave_strategy: WaveStrategy,
    /// Upper bound on hosts updated at once inside a wave.
    pub max_parallelism: u32,
    pub parallel_deployment_within_wave: bool,
    /// Pause between hosts when a wave runs sequentially.
    pub delay_between_servers_secs: u64,
    /// Pause between waves.
    pub wave_interval_secs: u64,
    /// Host failures tolerated inside one wave.
    pub max_batch_failures: u32,
    pub max_concurrent_waves: u32,
    pub minimum_available_percentage: Option<f64>,
    pub minimum_available_instances: Option<u32>,
    pub rollback_on_any_wave_failure: bool,
    pub continue_on_non_critical_failure: bool,
    pub rollback_order: RollbackOrder,
    pub health_check_timeout_secs: u64,
    pub wave_timeout_secs: u64,
    pub step_timeout_secs: u64,
    pub max_retries: u32,
    pub retry_backoff_secs: u64,
}

impl Default for RollingConfig {
    fn default() -> Self {
        Self {
            wave_strategy: WaveStrategy::FixedSize { size: 1 },
            max_parallelism: 5,
            parallel_deployment_within_wave: true,
            delay_between_servers_secs: 0,
            wave_interval_secs: 30,
            max_batch_failures: 0,
            max_concurrent_waves: 1,
            minimum_available_percentage: None,
            minimum_available_instances: None,
            rollback_on_any_wave_failure: true,
            continue_on_non_critical_failure: false,
            rollback_order: RollbackOrder::ReverseWave,
            health_check_timeout_secs: 120,
            wave_timeout_secs: 1_800,
            step_timeout_secs: 300,
            max_retries: 3,
            retry_backoff_secs: 5,
        }
    }
}

// ── Blue-green ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    #[default]
    Blue,
    Green,
}

impl Environment {
    pub fn other(self) -> Self {
        match self {
            Self::Blue => Self::Green,
            Self::Green => Self::Blue,
        }
    }

    pub fn pool_name(self, service: &str) -> String {
        match self {
            Self::Blue => format!("{service}-blue"),
            Self::Green => format!("{service}-green"),
        }
    }
}

/// How traffic moves to the new environment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SwitchMode {
    /// One atomic switch.
    #[default]
    Immediate,
    /// Stepped percentages, pausing `step_interval_secs` after each.
    Gradual {
        increments: Vec<u8>,
        step_interval_secs: u64,
    },
    /// Hold a fixed split; the previous environment stays up.
    Weighted { percentage: u8 },
}

/// Configuration for blue-green deployments.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BlueGreenConfig {
    /// Environment serving traffic before the rollout.
    pub active_environment: Environment,
    pub switch_mode: SwitchMode,
    pub max_parallelism: u32,
    pub health_check_timeout_secs: u64,
    pub monitoring_duration_secs: u64,
    pub monitoring_interval_secs: u64,
    pub auto_rollback_enabled: bool,
    /// Error rate (percent) above which monitoring rolls back.
    pub error_rate_threshold: f64,
    pub response_time_threshold_ms: Option<f64>,
    pub minimum_data_points: u32,
    pub decommission_previous: bool,
    pub minimum_available_instances: Option<u32>,
    pub step_timeout_secs: u64,
    pub max_retries: u32,
    pub retry_backoff_secs: u64,
}

impl Default for BlueGreenConfig {
    fn default() -> Self {
        Self {
            active_environment: Environment::Blue,
            switch_mode: SwitchMode::Immediate,
            max_parallelism: 10,
            health_check_timeout_secs: 120,
            monitoring_duration_secs: 300,
            monitoring_interval_secs: 15,
            auto_rollback_enabled: true,
            error_rate_threshold: 5.0,
            response_time_threshold_ms: None,
            minimum_data_points: 3,
            decommission_previous: true,
            minimum_available_instances: None,
            step_timeout_secs: 300,
            max_retries: 3,
            retry_backoff_secs: 5,
        }
    }
}

// ── Canary ────────────────────────────────────────────────────────

/// How canary hosts are picked from the target list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CanarySelection {
    #[default]
    FirstN,
    LastN,
    /// Deterministic shuffle keyed by `seed` (the workflow id when absent).
    Random {
        #[serde(default)]
        seed: Option<String>,
    },
    Explicit {
        hosts: Vec<HostId>,
    },
    /// Round-robin across regions.
    GeographicallyDistributed,
    /// Least-loaded hosts first.
    LoadBalanced,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Comparison {
    LessThan,
    LessOrEqual,
    GreaterThan,
    GreaterOrEqual,
}

impl Comparison {
    pub fn holds(self, observed: f64, threshold: f64) -> bool {
        match self {
            Self::LessThan => observed < threshold,
            Self::LessOrEqual => observed <= threshold,
            Self::GreaterThan => observed > threshold,
            Self::GreaterOrEqual => observed >= threshold,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Aggregation {
    #[default]
    Mean,
    Max,
    Min,
    P95,
    Sum,
}

/// A metric that must satisfy `comparison threshold` for a canary to advance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricCriterion {
    pub metric: String,
    pub comparison: Comparison,
    pub threshold: f64,
    #[serde(default)]
    pub aggregation: Aggregation,
}

impl MetricCriterion {
    pub fn new(metric: &str, comparison: Comparison, threshold: f64) -> Self {
        Self {
            metric: metric.to_string(),
            comparison,
            threshold,
            aggregation: Aggregation::Mean,
        }
    }
}

/// What the canary must demonstrate before promotion.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AdvancementCriteria {
    pub required_metrics: Vec<MetricCriterion>,
    pub business_metrics: Vec<MetricCriterion>,
    pub minimum_samples: u32,
}

impl Default for AdvancementCriteria {
    fn default() -> Self {
        Self {
            required_metrics: vec![MetricCriterion::new(
                "error_rate",
                Comparison::LessThan,
                1.0,
            )],
            business_metrics: Vec::new(),
            minimum_samples: 10,
        }
    }
}

impl AdvancementCriteria {
    pub fn all(&self) -> Vec<MetricCriterion> {
        self.required_metrics
            .iter()
            .chain(self.business_metrics.iter())
            .cloned()
            .collect()
    }
}

/// Configuration for canary deployments.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CanaryConfig {
    /// Share of hosts used as canaries (0-100).
    pub canary_percentage: f64,
    /// Fixed canary count; overrides the percentage.
    pub canary_count: Option<u32>,
    pub selection: CanarySelection,
    /// Share of traffic routed to the canary (0-100).
    pub traffic_percentage: u8,
    pub split_method: SplitMethod,
    pub sticky_sessions: bool,
    pub monitoring_duration_secs: u64,
    pub monitoring_interval_secs: u64,
    pub advancement: AdvancementCriteria,
    pub auto_promote: bool,
    /// Hosts per production batch after promotion; all at once when unset.
    pub production_batch_size: Option<u32>,
    pub health_check_between_batches: bool,
    pub auto_rollback: bool,
    pub error_rate_threshold: f64,
    pub max_parallelism: u32,
    pub minimum_available_percentage: Option<f64>,
    pub minimum_available_instances: Option<u32>,
    pub step_timeout_secs: u64,
    pub max_retries: u32,
    pub retry_backoff_secs: u64,
}

impl Default for CanaryConfig {
    fn default() -> Self {
        Self {
            canary_percentage: 10.0,
            canary_count: None,
            selection: CanarySelection::FirstN,
            traffic_percentage: 10,
            split_method: SplitMethod::Percentage,
            sticky_sessions: false,
            monitoring_duration_secs: 600,
            monitoring_interval_secs: 30,
            advancement: AdvancementCriteria::default(),
            auto_promote: true,
            production_batch_size: None,
            health_check_between_batches: true,
            auto_rollback: true,
            error_rate_threshold: 5.0,
            max_parallelism: 10,
            minimum_available_percentage: None,
            minimum_available_instances: None,
            step_timeout_secs: 300,
            max_retries: 3,
            retry_backoff_secs: 5,
        }
    }
}

// ── Scheduled ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ScheduledConfig {
    #[serde(default)]
    pub start_at: Option<DateTime<Utc>>,
}
