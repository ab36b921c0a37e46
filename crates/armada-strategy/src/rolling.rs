//! Rolling planner — replace hosts wave by wave.
//!
//! Plan layout:
//!
//! | # | Phase | Kind | Steps |
//! |---|---|---|---|
//! | 0 | `pre-deployment` | PreDeployment | HealthCheck per host |
//! | 1..=W | `wave-*` | Deployment | Deploy → HealthCheck → WaitForHealthy → Validation per host |
//! | W+1 | `post-deployment` | PostDeployment | service Validation, Cleanup |

use std::collections::BTreeMap;
use std::time::Duration;

use tracing::info;

use armada_core::{
    ExecutionPolicy, GeoGrouping, HostId, Phase, PhaseKind, PhaseStatus, RollbackCondition,
    RollbackOrder, RollingConfig, StepType, StrategyConfig, StrategyKind, TargetHost,
    ValidationError, ValidationResult, WaveStrategy, Workflow,
};

use crate::plan::{
    CHECK_ESTIMATE, DEPLOY_ESTIMATE, PlanContext, check_availability, check_percentage,
    max_unavailable, rollback_version, share_of, touched_deployments, verify_partition,
};
use crate::planner::{PlanRequest, StrategyPlanner};

const UNASSIGNED_GROUP: &str = "unassigned";

pub struct RollingPlanner;

fn rolling(config: &StrategyConfig) -> ValidationResult<&RollingConfig> {
    match config {
        StrategyConfig::Rolling(cfg) => Ok(cfg),
        other => Err(ValidationError::ConfigMismatch {
            planner: StrategyKind::Rolling,
            config: other.kind(),
        }),
    }
}

/// A group of hosts deployed together, before it becomes a phase.
#[derive(Debug, Clone, PartialEq)]
struct Wave {
    name: String,
    hosts: Vec<HostId>,
}

fn chunked(hosts: &[TargetHost], size: usize) -> Vec<Wave> {
    hosts
        .chunks(size.max(1))
        .enumerate()
        .map(|(i, chunk)| Wave {
            name: format!("wave-{}", i + 1),
            hosts: chunk.iter().map(|h| h.id.clone()).collect(),
        })
        .collect()
}

/// Split `hosts` into waves. Deterministic for a given host order.
fn partition(hosts: &[TargetHost], cfg: &RollingConfig) -> ValidationResult<Vec<Wave>> {
    if hosts.is_empty() {
        return Err(ValidationError::NoTargets);
    }
    let waves = match &cfg.wave_strategy {
        WaveStrategy::FixedSize { size } => chunked(hosts, *size as usize),
        WaveStrategy::Percentage { percent } => chunked(hosts, share_of(hosts.len(), *percent)),
        WaveStrategy::Adaptive { initial_size, .. } => {
            chunked(hosts, (*initial_size).min(cfg.max_parallelism) as usize)
        }
        WaveStrategy::Geographic { group_by, priority } => {
            let mut groups: BTreeMap<String, Vec<HostId>> = BTreeMap::new();
            for host in hosts {
                let tag = match group_by {
                    GeoGrouping::Region => host.region.as_deref(),
                    GeoGrouping::Datacenter => host.datacenter.as_deref(),
                };
                groups
                    .entry(tag.unwrap_or(UNASSIGNED_GROUP).to_string())
                    .or_default()
                    .push(host.id.clone());
            }
            let mut waves = Vec::with_capacity(groups.len());
            for name in priority {
                if let Some(group) = groups.remove(name) {
                    waves.push(Wave {
                        name: format!("wave-{name}"),
                        hosts: group,
                    });
                }
            }
            waves.extend(groups.into_iter().map(|(name, group)| Wave {
                name: format!("wave-{name}"),
                hosts: group,
            }));
            waves
        }
        WaveStrategy::Custom { waves } => {
            let known: Vec<&str> = hosts.iter().map(|h| h.id.as_str()).collect();
            let mut assigned: Vec<&str> = Vec::new();
            for wave in waves {
                for host in &wave.hosts {
                    if !known.contains(&host.as_str()) {
                        return Err(ValidationError::UnknownHost(host.clone()));
                    }
                    if assigned.contains(&host.as_str()) {
                        return Err(ValidationError::DuplicateHost(host.clone()));
                    }
                    assigned.push(host);
                }
            }
            if let Some(missing) = known.iter().find(|h| !assigned.contains(h)) {
                return Err(ValidationError::InvalidConfig(format!(
                    "host {missing} is not assigned to any custom wave"
                )));
            }
            waves
                .iter()
                .map(|w| Wave {
                    name: w.name.clone(),
                    hosts: w.hosts.clone(),
                })
                .collect()
        }
    };
    Ok(waves)
}

/// Per-host wave steps. With a failure budget, host failures count
/// against the budget instead of failing the wave outright.
fn fill_wave(ctx: &PlanContext, phase: &mut Phase, hosts: &[HostId], cfg: &RollingConfig) {
    let critical = cfg.max_batch_failures == 0;
    for host in hosts {
        ctx.add_step(phase, StepType::Deploy, Some(host), critical);
        ctx.add_step(phase, StepType::HealthCheck, Some(host), critical);
        ctx.add_step(phase, StepType::WaitForHealthy, Some(host), critical).timeout_secs =
            cfg.health_check_timeout_secs;
        ctx.add_step(phase, StepType::Validation, Some(host), false);
    }
    phase.hosts = hosts.to_vec();
}

fn context(workflow_id: &str, service: &str, version: &str, package: &str, cfg: &RollingConfig) -> PlanContext {
    PlanContext::new(workflow_id, service, version, package).steps(
        cfg.step_timeout_secs,
        cfg.max_retries,
        cfg.retry_backoff_secs,
    )
}

fn wave_phase(ctx: &PlanContext, index: usize, wave: &Wave, cfg: &RollingConfig, first: bool) -> Phase {
    let mut phase = ctx.phase(index, &wave.name, PhaseKind::Deployment);
    fill_wave(ctx, &mut phase, &wave.hosts, cfg);
    phase.parallel = cfg.parallel_deployment_within_wave;
    phase.max_parallelism = cfg.max_parallelism.max(1);
    phase.delay_between_hosts_secs = cfg.delay_between_servers_secs;
    phase.wait_before_secs = if first { 0 } else { cfg.wave_interval_secs };
    phase.max_failures = cfg.max_batch_failures;
    phase.rollback_on_failure = cfg.rollback_on_any_wave_failure;
    phase.timeout_secs = cfg.wave_timeout_secs;
    phase
}

/// Time to run one host lane end to end.
fn lane_estimate() -> Duration {
    DEPLOY_ESTIMATE + CHECK_ESTIMATE * 3
}

impl StrategyPlanner for RollingPlanner {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Rolling
    }

    fn validate_configuration(&self, config: &StrategyConfig) -> ValidationResult<()> {
        let cfg = rolling(config)?;
        if cfg.max_parallelism == 0 {
            return Err(ValidationError::InvalidConfig(
                "max_parallelism must be at least 1".into(),
            ));
        }
        if cfg.max_concurrent_waves == 0 {
            return Err(ValidationError::InvalidConfig(
                "max_concurrent_waves must be at least 1".into(),
            ));
        }
        if cfg.step_timeout_secs == 0 || cfg.wave_timeout_secs == 0 {
            return Err(ValidationError::InvalidConfig(
                "step and wave timeouts must be positive".into(),
            ));
        }
        match &cfg.wave_strategy {
            WaveStrategy::FixedSize { size } if *size == 0 => {
                return Err(ValidationError::InvalidConfig(
                    "wave size must be at least 1".into(),
                ));
            }
            WaveStrategy::Percentage { percent } => check_percentage("wave percent", *percent)?,
            WaveStrategy::Custom { waves } => {
                if waves.is_empty() {
                    return Err(ValidationError::InvalidConfig(
                        "custom wave strategy needs at least one wave".into(),
                    ));
                }
                if let Some(empty) = waves.iter().find(|w| w.hosts.is_empty() || w.name.is_empty()) {
                    return Err(ValidationError::InvalidConfig(format!(
                        "custom wave '{}' must be named and non-empty",
                        empty.name
                    )));
                }
            }
            WaveStrategy::Adaptive {
                initial_size,
                min_size,
                growth_factor,
            } => {
                if *min_size == 0 || min_size > initial_size {
                    return Err(ValidationError::InvalidConfig(format!(
                        "adaptive sizes need 1 <= min_size ({min_size}) <= initial_size ({initial_size})"
                    )));
                }
                if !growth_factor.is_finite() || *growth_factor < 1.0 {
                    return Err(ValidationError::InvalidConfig(format!(
                        "growth_factor must be >= 1.0, got {growth_factor}"
                    )));
                }
            }
            _ => {}
        }
        if let Some(pct) = cfg.minimum_available_percentage {
            max_unavailable(0, Some(pct), None).map(|_| ())?;
        }
        Ok(())
    }

    fn create_phases(&self, request: &PlanRequest) -> ValidationResult<Vec<Phase>> {
        self.validate_configuration(&request.strategy)?;
        let cfg = rolling(&request.strategy)?;
        let waves = partition(&request.hosts, cfg)?;
        let groups: Vec<Vec<HostId>> = waves.iter().map(|w| w.hosts.clone()).collect();
        check_availability(
            &groups,
            request.hosts.len(),
            cfg.max_concurrent_waves.max(1) as usize,
            cfg.minimum_available_percentage,
            cfg.minimum_available_instances,
        )?;

        let ctx = context(
            &request.workflow_id,
            &request.service,
            &request.version,
            &request.package,
            cfg,
        );
        let mut phases = Vec::with_capacity(waves.len() + 2);
        phases.push(ctx.pre_deployment(0, &request.hosts, cfg.max_parallelism));
        for (i, wave) in waves.iter().enumerate() {
            phases.push(wave_phase(&ctx, i + 1, wave, cfg, i == 0));
        }
        phases.push(ctx.post_deployment(waves.len() + 1, &request.hosts));
        verify_partition(&phases, &request.hosts)?;

        info!(
            workflow = %request.workflow_id,
            waves = waves.len(),
            hosts = request.hosts.len(),
            "rolling plan created"
        );
        Ok(phases)
    }

    fn estimate_execution_time(
        &self,
        hosts: &[TargetHost],
        config: &StrategyConfig,
    ) -> ValidationResult<Duration> {
        let cfg = rolling(config)?;
        let waves = partition(hosts, cfg)?;
        let lane = lane_estimate();
        let parallelism = cfg.max_parallelism.max(1) as usize;

        let mut waves_total = Duration::ZERO;
        for wave in &waves {
            let n = wave.hosts.len();
            waves_total += if cfg.parallel_deployment_within_wave {
                lane * n.div_ceil(parallelism) as u32
            } else {
                lane * n as u32
                    + Duration::from_secs(cfg.delay_between_servers_secs) * n.saturating_sub(1) as u32
            };
        }
        waves_total /= cfg.max_concurrent_waves.max(1);

        let pre = CHECK_ESTIMATE * hosts.len().div_ceil(parallelism) as u32;
        let post = CHECK_ESTIMATE * 2;
        let intervals = Duration::from_secs(cfg.wave_interval_secs) * waves.len().saturating_sub(1) as u32;
        Ok(pre + waves_total + intervals + post)
    }

    fn execution_policy(&self, config: &StrategyConfig) -> ExecutionPolicy {
        match rolling(config) {
            Ok(cfg) => ExecutionPolicy {
                max_concurrent_waves: cfg.max_concurrent_waves.max(1),
                parallel_within_wave: cfg.parallel_deployment_within_wave,
                continue_on_non_critical_failure: cfg.continue_on_non_critical_failure,
                ..ExecutionPolicy::default()
            },
            Err(_) => ExecutionPolicy::default(),
        }
    }

    fn default_rollback_conditions(&self, _config: &StrategyConfig) -> Vec<RollbackCondition> {
        Vec::new()
    }

    fn monitoring_interval(&self, _config: &StrategyConfig) -> Option<Duration> {
        None
    }

    fn create_rollback_phases(
        &self,
        workflow: &Workflow,
        to_version: Option<&str>,
    ) -> ValidationResult<Vec<Phase>> {
        let cfg = rolling(&workflow.strategy_config)?;
        let touched = touched_deployments(workflow);
        let groups: Vec<(String, Vec<HostId>)> = match &cfg.rollback_order {
            RollbackOrder::ReverseWave => touched
                .iter()
                .rev()
                .map(|p| (p.name.clone(), p.hosts.clone()))
                .collect(),
            RollbackOrder::SameAsDeployment => touched
                .iter()
                .map(|p| (p.name.clone(), p.hosts.clone()))
                .collect(),
            RollbackOrder::Custom { hosts } => {
                let touched_hosts: Vec<HostId> =
                    touched.iter().flat_map(|p| p.hosts.iter().cloned()).collect();
                let mut order: Vec<HostId> = hosts
                    .iter()
                    .filter(|h| touched_hosts.contains(h))
                    .cloned()
                    .collect();
                for host in touched_hosts {
                    if !order.contains(&host) {
                        order.push(host);
                    }
                }
                if order.is_empty() {
                    Vec::new()
                } else {
                    vec![("custom".to_string(), order)]
                }
            }
        };
        let groups: Vec<_> = groups.into_iter().filter(|(_, h)| !h.is_empty()).collect();
        if groups.is_empty() {
            return Ok(Vec::new());
        }

        let version = rollback_version(workflow, to_version)?;
        let ctx = context(
            &workflow.id,
            &workflow.service,
            &workflow.version,
            &workflow.package,
            cfg,
        )
        .targeting(&version);
        let base = workflow.phases.len();
        let phases = groups
            .iter()
            .enumerate()
            .map(|(i, (name, hosts))| {
                let mut phase = ctx.phase(base + i, &format!("rollback-{name}"), PhaseKind::Rollback);
                for host in hosts {
                    ctx.add_step(&mut phase, StepType::Deploy, Some(host), true);
                    ctx.add_step(&mut phase, StepType::HealthCheck, Some(host), true);
                    ctx.add_step(&mut phase, StepType::WaitForHealthy, Some(host), true)
                        .timeout_secs = cfg.health_check_timeout_secs;
                }
                phase.hosts = hosts.clone();
                phase.parallel = cfg.parallel_deployment_within_wave;
                phase.max_parallelism = cfg.max_parallelism.max(1);
                phase.delay_between_hosts_secs = cfg.delay_between_servers_secs;
                phase.timeout_secs = cfg.wave_timeout_secs;
                phase
            })
            .collect();
        Ok(phases)
    }

    fn adapt_next_phase(&self, workflow: &mut Workflow, next: usize) -> bool {
        let Ok(cfg) = rolling(&workflow.strategy_config) else {
            return false;
        };
        let cfg = cfg.clone();
        let WaveStrategy::Adaptive {
            min_size,
            growth_factor,
            ..
        } = cfg.wave_strategy
        else {
            return false;
        };
        let Some(phase) = workflow.phases.get(next) else {
            return false;
        };
        if !phase.is_deployment() || phase.status != PhaseStatus::Pending {
            return false;
        }
        let Some(previous) = workflow.phases[..next].iter().rev().find(|p| p.is_deployment())
        else {
            return false;
        };
        if !previous.status.is_finished() {
            return false;
        }

        let previous_size = previous.hosts.len().max(1);
        let clean = previous.status == PhaseStatus::Completed && previous.failed_hosts.is_empty();
        // Waves started together share the downtime budget.
        let concurrent = cfg.max_concurrent_waves.max(1) as usize;
        let budget = (max_unavailable(
            workflow.hosts.len(),
            cfg.minimum_available_percentage,
            cfg.minimum_available_instances,
        )
        .unwrap_or(previous_size)
            / concurrent)
            .max(1);
        let cap = budget.min(cfg.max_parallelism as usize).max(1);
        let floor = (min_size as usize).clamp(1, cap);
        let wanted = if clean {
            (previous_size as f64 * growth_factor).ceil() as usize
        } else {
            previous_size / 2
        };

        let pending: Vec<usize> = (next..workflow.phases.len())
            .filter(|&i| {
                let p = &workflow.phases[i];
                p.is_deployment() && p.status == PhaseStatus::Pending
            })
            .collect();
        let hosts: Vec<HostId> = pending
            .iter()
            .flat_map(|&i| workflow.phases[i].hosts.iter().cloned())
            .collect();
        if pending.len() < 2 {
            return false;
        }
        let others = pending.len() - 1;
        // The waves after this one must stay within the budget too.
        let size = wanted
            .clamp(floor, cap)
            .max(hosts.len().saturating_sub(budget * others))
            .min(hosts.len());
        if size == workflow.phases[next].hosts.len() {
            return false;
        }

        let rest = &hosts[size..];
        let per = rest.len().div_ceil(others).max(1);
        let mut groups: Vec<Vec<HostId>> = vec![hosts[..size].to_vec()];
        groups.extend(rest.chunks(per).map(<[HostId]>::to_vec));
        groups.resize(pending.len(), Vec::new());

        let ctx = context(
            &workflow.id,
            &workflow.service,
            &workflow.version,
            &workflow.package,
            &cfg,
        );
        for (&i, group) in pending.iter().zip(groups) {
            let phase = &mut workflow.phases[i];
            phase.steps.clear();
            fill_wave(&ctx, phase, &group, &cfg);
        }
        info!(
            workflow = %workflow.id,
            phase = %workflow.phases[next].name,
            previous = previous_size,
            size,
            "adaptive wave resized"
        );
        true
    }
}
