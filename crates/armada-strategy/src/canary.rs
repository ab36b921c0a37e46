//! Canary planner — validate on a subset before touching the rest.
//!
//! The canary hosts get the new version and a share of traffic; an
//! `Advancement` gate then judges the canary's metrics. Production
//! batches are planned up front but only run once the gate (and, without
//! auto-promotion, an operator) lets the workflow through.

use std::collections::BTreeMap;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tracing::info;

use armada_core::{
    CanaryConfig, CanarySelection, ExecutionPolicy, HostId, Phase, PhaseGate, PhaseKind,
    RollbackCondition, Step, StepType, StrategyConfig, StrategyKind, TargetHost, TrafficAction,
    TrafficRoute, TriggerType, ValidationError, ValidationResult, Workflow,
};

use crate::plan::{
    CHECK_ESTIMATE, DEPLOY_ESTIMATE, PlanContext, check_availability, check_percentage,
    rollback_version, share_of, touched_deployments, verify_partition,
};
use crate::planner::{PlanRequest, StrategyPlanner};

const UNASSIGNED_REGION: &str = "unassigned";

pub struct CanaryPlanner;

fn canary(config: &StrategyConfig) -> ValidationResult<&CanaryConfig> {
    match config {
        StrategyConfig::Canary(cfg) => Ok(cfg),
        other => Err(ValidationError::ConfigMismatch {
            planner: StrategyKind::Canary,
            config: other.kind(),
        }),
    }
}

/// Pool receiving the canary's traffic share.
pub fn canary_pool(service: &str) -> String {
    format!("{service}-canary")
}

fn context(workflow_id: &str, service: &str, version: &str, package: &str, cfg: &CanaryConfig) -> PlanContext {
    PlanContext::new(workflow_id, service, version, package).steps(
        cfg.step_timeout_secs,
        cfg.max_retries,
        cfg.retry_backoff_secs,
    )
}

fn as_canary(step: &mut Step) {
    step.command
        .parameters
        .insert("role".to_string(), "canary".to_string());
}

/// Number of canary hosts for a fleet of `total`.
fn canary_count(total: usize, cfg: &CanaryConfig) -> usize {
    match (&cfg.selection, cfg.canary_count) {
        (CanarySelection::Explicit { hosts }, _) => hosts.len(),
        (_, Some(n)) => n as usize,
        (_, None) => share_of(total, cfg.canary_percentage),
    }
}

/// Pick the canary hosts. `seed` keys the random shuffle.
fn select(hosts: &[TargetHost], cfg: &CanaryConfig, seed: &str) -> ValidationResult<Vec<HostId>> {
    let count = canary_count(hosts.len(), cfg);
    if count == 0 {
        return Err(ValidationError::InvalidConfig(
            "canary must contain at least one host".into(),
        ));
    }
    if count > hosts.len() {
        return Err(ValidationError::InvalidConfig(format!(
            "{count} canary hosts requested but only {} are targeted",
            hosts.len()
        )));
    }
    let ids = |hs: &[&TargetHost]| hs.iter().map(|h| h.id.clone()).collect::<Vec<_>>();

    let selected = match &cfg.selection {
        CanarySelection::FirstN => hosts.iter().take(count).map(|h| h.id.clone()).collect(),
        CanarySelection::LastN => hosts[hosts.len() - count..].iter().map(|h| h.id.clone()).collect(),
        CanarySelection::Explicit { hosts: wanted } => {
            for host in wanted {
                if !hosts.iter().any(|h| &h.id == host) {
                    return Err(ValidationError::UnknownHost(host.clone()));
                }
            }
            wanted.clone()
        }
        CanarySelection::Random { seed: configured } => {
            let seed = configured.as_deref().unwrap_or(seed);
            let mut keyed: Vec<(Vec<u8>, &TargetHost)> = hosts
                .iter()
                .map(|h| {
                    let mut hasher = Sha256::new();
                    hasher.update(seed.as_bytes());
                    hasher.update(h.id.as_bytes());
                    (hasher.finalize().to_vec(), h)
                })
                .collect();
            keyed.sort_by(|a, b| a.0.cmp(&b.0));
            let picked: Vec<&TargetHost> = keyed.into_iter().take(count).map(|(_, h)| h).collect();
            ids(&picked)
        }
        CanarySelection::GeographicallyDistributed => {
            let mut regions: BTreeMap<&str, Vec<&TargetHost>> = BTreeMap::new();
            for host in hosts {
                regions
                    .entry(host.region.as_deref().unwrap_or(UNASSIGNED_REGION))
                    .or_default()
                    .push(host);
            }
            let mut picked: Vec<&TargetHost> = Vec::with_capacity(count);
            let mut round = 0;
            while picked.len() < count {
                for group in regions.values() {
                    if let Some(host) = group.get(round)
                        && picked.len() < count
                    {
                        picked.push(host);
                    }
                }
                round += 1;
            }
            ids(&picked)
        }
        CanarySelection::LoadBalanced => {
            let mut by_load: Vec<&TargetHost> = hosts.iter().collect();
            by_load.sort_by_key(|h| h.load);
            ids(&by_load[..count])
        }
    };
    Ok(selected)
}

impl StrategyPlanner for CanaryPlanner {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Canary
    }

    fn validate_configuration(&self, config: &StrategyConfig) -> ValidationResult<()> {
        let cfg = canary(config)?;
        check_percentage("canary_percentage", cfg.canary_percentage)?;
        if cfg.traffic_percentage == 0 || cfg.traffic_percentage > 100 {
            return Err(ValidationError::InvalidConfig(format!(
                "traffic_percentage must be within 1..=100, got {}",
                cfg.traffic_percentage
            )));
        }
        if cfg.canary_count == Some(0) {
            return Err(ValidationError::InvalidConfig(
                "canary_count must be at least 1".into(),
            ));
        }
        if let CanarySelection::Explicit { hosts } = &cfg.selection
            && hosts.is_empty()
        {
            return Err(ValidationError::InvalidConfig(
                "explicit canary selection needs hosts".into(),
            ));
        }
        if cfg.production_batch_size == Some(0) {
            return Err(ValidationError::InvalidConfig(
                "production_batch_size must be at least 1".into(),
            ));
        }
        if cfg.max_parallelism == 0 {
            return Err(ValidationError::InvalidConfig(
                "max_parallelism must be at least 1".into(),
            ));
        }
        if cfg.monitoring_interval_secs == 0 {
            return Err(ValidationError::InvalidConfig(
                "monitoring_interval_secs must be positive".into(),
            ));
        }
        if cfg.advancement.all().is_empty() {
            return Err(ValidationError::InvalidConfig(
                "advancement criteria need at least one metric".into(),
            ));
        }
        Ok(())
    }

    fn create_phases(&self, request: &PlanRequest) -> ValidationResult<Vec<Phase>> {
        self.validate_configuration(&request.strategy)?;
        let cfg = canary(&request.strategy)?;
        if request.hosts.is_empty() {
            return Err(ValidationError::NoTargets);
        }

        let canaries = select(&request.hosts, cfg, &request.workflow_id)?;
        let rest: Vec<HostId> = request
            .hosts
            .iter()
            .filter(|h| !canaries.contains(&h.id))
            .map(|h| h.id.clone())
            .collect();
        let batches: Vec<Vec<HostId>> = match cfg.production_batch_size {
            Some(size) => rest.chunks(size as usize).map(<[HostId]>::to_vec).collect(),
            None if rest.is_empty() => Vec::new(),
            None => vec![rest.clone()],
        };
        let mut groups = vec![canaries.clone()];
        groups.extend(batches.iter().cloned());
        check_availability(
            &groups,
            request.hosts.len(),
            1,
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
        let pool = canary_pool(&request.service);
        let parallelism = cfg.max_parallelism.max(1);
        // Production hosts are checked just before their own batch.
        let canary_targets: Vec<TargetHost> = canaries
            .iter()
            .filter_map(|id| request.hosts.iter().find(|h| &h.id == id).cloned())
            .collect();
        let mut phases = vec![ctx.pre_deployment(0, &canary_targets, parallelism)];

        let mut deploy = ctx.phase(phases.len(), "canary-deploy", PhaseKind::Deployment);
        for host in &canaries {
            as_canary(ctx.add_step(&mut deploy, StepType::Deploy, Some(host), true));
            ctx.add_step(&mut deploy, StepType::HealthCheck, Some(host), true);
            ctx.add_step(&mut deploy, StepType::WaitForHealthy, Some(host), true);
        }
        deploy.hosts = canaries.clone();
        deploy.parallel = true;
        deploy.max_parallelism = parallelism;
        deploy.rollback_on_failure = cfg.auto_rollback;
        deploy.timeout_secs = ctx.phase_budget(3, canaries.len().div_ceil(parallelism as usize));
        phases.push(deploy);

        let mut traffic = ctx.phase(phases.len(), "canary-traffic", PhaseKind::TrafficSwitch);
        for host in &canaries {
            ctx.add_traffic_step(
                &mut traffic,
                TrafficAction::AddToPool {
                    pool: pool.clone(),
                    host: host.clone(),
                },
            );
        }
        ctx.add_traffic_step(
            &mut traffic,
            TrafficAction::Switch {
                route: TrafficRoute {
                    pool: pool.clone(),
                    percentage: cfg.traffic_percentage,
                    method: cfg.split_method.clone(),
                    sticky_sessions: cfg.sticky_sessions,
                },
            },
        );
        traffic.hosts = canaries.clone();
        traffic.parallel = true;
        traffic.max_parallelism = parallelism;
        traffic.rollback_on_failure = cfg.auto_rollback;
        traffic.timeout_secs = ctx.phase_budget(1, canaries.len() + 1);
        phases.push(traffic);

        let mut analysis = ctx.phase(phases.len(), "canary-analysis", PhaseKind::Analysis);
        analysis.gate = Some(PhaseGate::Advancement {
            window_secs: cfg.monitoring_duration_secs,
            interval_secs: cfg.monitoring_interval_secs,
            minimum_samples: cfg.advancement.minimum_samples,
            criteria: cfg.advancement.all(),
            rollback_on_breach: cfg.auto_rollback,
        });
        analysis.hosts = canaries.clone();
        analysis.rollback_on_failure = cfg.auto_rollback;
        analysis.timeout_secs = cfg.monitoring_duration_secs + 300;
        phases.push(analysis);

        if !cfg.auto_promote {
            let mut approval = ctx.phase(phases.len(), "manual-promotion", PhaseKind::Approval);
            approval.gate = Some(PhaseGate::ManualApproval);
            approval.timeout_secs = ExecutionPolicy::default().workflow_timeout_secs;
            phases.push(approval);
        }

        for (i, batch) in batches.iter().enumerate() {
            let mut phase = ctx.phase(phases.len(), &format!("production-{}", i + 1), PhaseKind::Deployment);
            for host in batch {
                ctx.add_step(&mut phase, StepType::HealthCheck, Some(host), true);
                ctx.add_step(&mut phase, StepType::Deploy, Some(host), true);
                if cfg.health_check_between_batches {
                    ctx.add_step(&mut phase, StepType::HealthCheck, Some(host), true);
                    ctx.add_step(&mut phase, StepType::WaitForHealthy, Some(host), true);
                }
            }
            phase.hosts = batch.clone();
            phase.parallel = true;
            phase.max_parallelism = parallelism;
            phase.rollback_on_failure = cfg.auto_rollback;
            phase.timeout_secs = ctx.phase_budget(4, batch.len().div_ceil(parallelism as usize));
            phases.push(phase);
        }

        let mut promote = ctx.phase(phases.len(), "promote-traffic", PhaseKind::TrafficSwitch);
        ctx.add_traffic_step(
            &mut promote,
            TrafficAction::Switch {
                route: TrafficRoute {
                    percentage: 0,
                    ..TrafficRoute::all_to(&pool)
                },
            },
        );
        for host in &canaries {
            ctx.add_traffic_step(
                &mut promote,
                TrafficAction::RemoveFromPool {
                    pool: pool.clone(),
                    host: host.clone(),
                },
            )
            .critical = false;
        }
        promote.hosts = canaries.clone();
        promote.max_failures = canaries.len() as u32;
        promote.timeout_secs = ctx.phase_budget(1, canaries.len() + 1);
        phases.push(promote);

        let index = phases.len();
        phases.push(ctx.post_deployment(index, &request.hosts));
        verify_partition(&phases, &request.hosts)?;

        info!(
            workflow = %request.workflow_id,
            canaries = canaries.len(),
            batches = batches.len(),
            "canary plan created"
        );
        Ok(phases)
    }

    fn estimate_execution_time(
        &self,
        hosts: &[TargetHost],
        config: &StrategyConfig,
    ) -> ValidationResult<Duration> {
        let cfg = canary(config)?;
        let parallelism = cfg.max_parallelism.max(1) as usize;
        let canaries = canary_count(hosts.len(), cfg).min(hosts.len());
        let rest = hosts.len() - canaries;
        let lane = DEPLOY_ESTIMATE + CHECK_ESTIMATE * 2;
        let (batches, batch_rounds) = match cfg.production_batch_size {
            Some(size) => {
                let size = size.max(1) as usize;
                (rest.div_ceil(size), size.min(rest).div_ceil(parallelism))
            }
            None => (usize::from(rest > 0), rest.div_ceil(parallelism)),
        };
        Ok(CHECK_ESTIMATE * canaries.div_ceil(parallelism) as u32
            + lane * canaries.div_ceil(parallelism) as u32
            + CHECK_ESTIMATE * 2
            + Duration::from_secs(cfg.monitoring_duration_secs)
            + (lane + CHECK_ESTIMATE) * (batches * batch_rounds) as u32
            + CHECK_ESTIMATE * 3)
    }

    fn execution_policy(&self, config: &StrategyConfig) -> ExecutionPolicy {
        match canary(config) {
            Ok(cfg) => ExecutionPolicy {
                monitoring_interval_secs: cfg.monitoring_interval_secs,
                ..ExecutionPolicy::default()
            },
            Err(_) => ExecutionPolicy::default(),
        }
    }

    fn default_rollback_conditions(&self, config: &StrategyConfig) -> Vec<RollbackCondition> {
        match canary(config) {
            Ok(cfg) if cfg.auto_rollback => vec![
                RollbackCondition::new(TriggerType::ErrorRate, cfg.error_rate_threshold)
                    .window(cfg.monitoring_duration_secs.max(cfg.monitoring_interval_secs), 3),
            ],
            _ => Vec::new(),
        }
    }

    fn monitoring_interval(&self, config: &StrategyConfig) -> Option<Duration> {
        canary(config)
            .ok()
            .map(|cfg| Duration::from_secs(cfg.monitoring_interval_secs.max(1)))
    }

    /// Pull canary traffic, then redeploy the previous version to every
    /// host the rollout touched.
    fn create_rollback_phases(
        &self,
        workflow: &Workflow,
        to_version: Option<&str>,
    ) -> ValidationResult<Vec<Phase>> {
        let cfg = canary(&workflow.strategy_config)?;
        let ctx = context(
            &workflow.id,
            &workflow.service,
            &workflow.version,
            &workflow.package,
            cfg,
        );
        let pool = canary_pool(&workflow.service);
        let base = workflow.phases.len();
        let canary_hosts: Vec<HostId> = workflow
            .phases
            .iter()
            .find(|p| p.name == "canary-deploy")
            .map(|p| p.hosts.clone())
            .unwrap_or_default();

        let mut phases = Vec::new();
        let mut traffic = ctx.phase(base, "rollback-traffic", PhaseKind::Rollback);
        ctx.add_traffic_step(
            &mut traffic,
            TrafficAction::Switch {
                route: TrafficRoute {
                    percentage: 0,
                    ..TrafficRoute::all_to(&pool)
                },
            },
        );
        for host in &canary_hosts {
            ctx.add_traffic_step(
                &mut traffic,
                TrafficAction::RemoveFromPool {
                    pool: pool.clone(),
                    host: host.clone(),
                },
            )
            .critical = false;
        }
        traffic.hosts = canary_hosts.clone();
        traffic.max_failures = canary_hosts.len() as u32;
        traffic.timeout_secs = ctx.phase_budget(1, canary_hosts.len() + 1);
        phases.push(traffic);

        let touched: Vec<HostId> = touched_deployments(workflow)
            .iter()
            .flat_map(|p| p.hosts.iter().cloned())
            .collect();
        if !touched.is_empty() {
            let version = rollback_version(workflow, to_version)?;
            let revert_ctx = ctx.targeting(&version);
            let mut revert = revert_ctx.phase(base + 1, "rollback-hosts", PhaseKind::Rollback);
            for host in &touched {
                revert_ctx.add_step(&mut revert, StepType::Deploy, Some(host), true);
                revert_ctx.add_step(&mut revert, StepType::HealthCheck, Some(host), true);
            }
            revert.hosts = touched.clone();
            revert.parallel = true;
            revert.max_parallelism = cfg.max_parallelism.max(1);
            revert.timeout_secs =
                revert_ctx.phase_budget(2, touched.len().div_ceil(revert.max_parallelism as usize));
            phases.push(revert);
        }
        Ok(phases)
    }
}

#[cfg(test)]
mod tests {
    use armada_core::{PhaseStatus, SplitMethod};

    use super::*;

    fn hosts(n: usize) -> Vec<TargetHost> {
        (0..n).map(|i| TargetHost::new(format!("web-{i:03}"))).collect()
    }

    fn request(targets: Vec<TargetHost>, cfg: CanaryConfig) -> PlanRequest {
        PlanRequest {
            workflow_id: "wf-canary".into(),
            service: "api".into(),
            version: "2.0.0".into(),
            previous_version: Some("1.9.0".into()),
            package: "api-2.0.0".into(),
            hosts: targets,
            strategy: StrategyConfig::Canary(cfg),
        }
    }

    fn find<'a>(phases: &'a [Phase], name: &str) -> &'a Phase {
        phases.iter().find(|p| p.name == name).unwrap()
    }

    #[test]
    fn ten_percent_of_hundred_hosts() {
        let phases = CanaryPlanner
            .create_phases(&request(hosts(100), CanaryConfig::default()))
            .unwrap();
        let deploy = find(&phases, "canary-deploy");
        assert_eq!(deploy.hosts.len(), 10);
        assert_eq!(deploy.hosts[0], "web-000");

        let analysis_at = phases.iter().position(|p| p.name == "canary-analysis").unwrap();
        let production_at = phases.iter().position(|p| p.name == "production-1").unwrap();
        assert!(analysis_at < production_at);
        assert_eq!(phases[production_at].hosts.len(), 90);
        assert!(matches!(
            phases[analysis_at].gate,
            Some(PhaseGate::Advancement { minimum_samples: 10, .. })
        ));
    }

    #[test]
    fn production_hosts_are_checked_with_their_batch() {
        let cfg = CanaryConfig {
            production_batch_size: Some(30),
            ..Default::default()
        };
        let phases = CanaryPlanner.create_phases(&request(hosts(100), cfg)).unwrap();
        let canaries = &find(&phases, "canary-deploy").hosts;
        let preflight = find(&phases, "pre-deployment");
        assert_eq!(&preflight.hosts, canaries);
        assert!(preflight
            .steps
            .iter()
            .all(|s| canaries.contains(s.host.as_ref().unwrap())));

        for batch in phases.iter().filter(|p| p.name.starts_with("production-")) {
            for host in &batch.hosts {
                let first = batch
                    .steps
                    .iter()
                    .find(|s| s.host.as_ref() == Some(host))
                    .unwrap();
                assert_eq!(first.step_type, StepType::HealthCheck);
            }
        }
    }

    #[test]
    fn selection_strategies() {
        let mut targets = hosts(6);
        for (i, host) in targets.iter_mut().enumerate() {
            host.load = (10 - i) as u32;
            host.region = Some(if i % 2 == 0 { "eu" } else { "us" }.to_string());
        }

        let pick = |selection: CanarySelection| {
            let cfg = CanaryConfig {
                canary_count: Some(2),
                selection,
                ..Default::default()
            };
            select(&targets, &cfg, "seed").unwrap()
        };

        assert_eq!(pick(CanarySelection::LastN), vec!["web-004", "web-005"]);
        assert_eq!(pick(CanarySelection::LoadBalanced), vec!["web-005", "web-004"]);
        assert_eq!(
            pick(CanarySelection::GeographicallyDistributed),
            vec!["web-000", "web-001"]
        );
        let random = pick(CanarySelection::Random { seed: None });
        assert_eq!(random, pick(CanarySelection::Random { seed: None }));
        assert_eq!(random.len(), 2);
    }

    #[test]
    fn explicit_selection_must_be_known() {
        let cfg = CanaryConfig {
            selection: CanarySelection::Explicit {
                hosts: vec!["nope".into()],
            },
            ..Default::default()
        };
        assert_eq!(
            CanaryPlanner.create_phases(&request(hosts(5), cfg)).unwrap_err(),
            ValidationError::UnknownHost("nope".into())
        );
    }

    #[test]
    fn production_batches_and_manual_promotion() {
        let cfg = CanaryConfig {
            canary_count: Some(2),
            production_batch_size: Some(3),
            auto_promote: false,
            split_method: SplitMethod::Header {
                name: "x-canary".into(),
                value: "1".into(),
            },
            ..Default::default()
        };
        let phases = CanaryPlanner.create_phases(&request(hosts(10), cfg)).unwrap();
        let batches: Vec<usize> = phases
            .iter()
            .filter(|p| p.name.starts_with("production-"))
            .map(|p| p.hosts.len())
            .collect();
        assert_eq!(batches, vec![3, 3, 2]);
        assert_eq!(find(&phases, "manual-promotion").gate, Some(PhaseGate::ManualApproval));

        let switch = find(&phases, "canary-traffic").steps.last().unwrap();
        match &switch.traffic {
            Some(TrafficAction::Switch { route }) => {
                assert_eq!(route.pool, "api-canary");
                assert_eq!(route.percentage, 10);
                assert!(matches!(route.method, SplitMethod::Header { .. }));
            }
            other => panic!("unexpected traffic action: {other:?}"),
        }
    }

    #[test]
    fn canary_larger_than_availability_allows() {
        let cfg = CanaryConfig {
            canary_percentage: 50.0,
            minimum_available_percentage: Some(60.0),
            ..Default::default()
        };
        let err = CanaryPlanner.create_phases(&request(hosts(10), cfg)).unwrap_err();
        assert!(matches!(err, ValidationError::Availability(_)));
    }

    #[test]
    fn rollback_reverts_only_touched_hosts() {
        let cfg = CanaryConfig::default();
        let phases = CanaryPlanner
            .create_phases(&request(hosts(20), cfg.clone()))
            .unwrap();
        let mut wf = Workflow::new(
            "wf-canary".into(),
            "api",
            "2.0.0",
            "api-2.0.0",
            StrategyConfig::Canary(cfg),
            hosts(20),
        );
        wf.previous_version = Some("1.9.0".into());
        wf.phases = phases;
        wf.phases[1].status = PhaseStatus::Completed;

        let rollback = CanaryPlanner.create_rollback_phases(&wf, None).unwrap();
        assert_eq!(rollback.len(), 2);
        assert_eq!(rollback[1].hosts.len(), 2);
        assert!(rollback[1]
            .steps
            .iter()
            .all(|s| s.command.version == "1.9.0"));
    }
}
