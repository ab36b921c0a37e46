//! Blue-green planner — deploy to the idle environment, then move traffic.
//!
//! The active environment keeps serving while the idle one is deployed and
//! verified, so host availability is never reduced. Traffic moves via the
//! load balancer (`TrafficSwitch` steps) and the new environment is watched
//! by a `Monitor` gate before the old one is decommissioned.

use std::time::Duration;

use tracing::info;

use armada_core::{
    BlueGreenConfig, Environment, ExecutionPolicy, HostId, Phase, PhaseGate, PhaseKind,
    RollbackCondition, Step, StepType, StrategyConfig, StrategyKind, SwitchMode, TargetHost,
    TrafficAction, TrafficRoute, TriggerType, ValidationError, ValidationResult, Workflow,
};

use crate::plan::{
    CHECK_ESTIMATE, DEPLOY_ESTIMATE, PlanContext, max_unavailable, touched_deployments,
    verify_partition,
};
use crate::planner::{PlanRequest, StrategyPlanner};

pub struct BlueGreenPlanner;

fn blue_green(config: &StrategyConfig) -> ValidationResult<&BlueGreenConfig> {
    match config {
        StrategyConfig::BlueGreen(cfg) => Ok(cfg),
        other => Err(ValidationError::ConfigMismatch {
            planner: StrategyKind::BlueGreen,
            config: other.kind(),
        }),
    }
}

fn label(env: Environment) -> &'static str {
    match env {
        Environment::Blue => "blue",
        Environment::Green => "green",
    }
}

fn in_env(step: &mut Step, env: Environment) {
    step.command
        .parameters
        .insert("environment".to_string(), label(env).to_string());
}

fn context(workflow_id: &str, service: &str, version: &str, package: &str, cfg: &BlueGreenConfig) -> PlanContext {
    PlanContext::new(workflow_id, service, version, package).steps(
        cfg.step_timeout_secs,
        cfg.max_retries,
        cfg.retry_backoff_secs,
    )
}

fn switch_phase(
    ctx: &PlanContext,
    index: usize,
    name: &str,
    route: TrafficRoute,
    cfg: &BlueGreenConfig,
) -> Phase {
    let mut phase = ctx.phase(index, name, PhaseKind::TrafficSwitch);
    ctx.add_traffic_step(&mut phase, TrafficAction::Switch { route });
    phase.rollback_on_failure = cfg.auto_rollback_enabled;
    phase.timeout_secs = ctx.phase_budget(1, 1);
    phase
}

impl StrategyPlanner for BlueGreenPlanner {
    fn kind(&self) -> StrategyKind {
        StrategyKind::BlueGreen
    }

    fn validate_configuration(&self, config: &StrategyConfig) -> ValidationResult<()> {
        let cfg = blue_green(config)?;
        if cfg.max_parallelism == 0 {
            return Err(ValidationError::InvalidConfig(
                "max_parallelism must be at least 1".into(),
            ));
        }
        if cfg.error_rate_threshold.is_nan() || cfg.error_rate_threshold < 0.0 {
            return Err(ValidationError::InvalidConfig(
                "error_rate_threshold must be non-negative".into(),
            ));
        }
        if cfg.monitoring_duration_secs > 0 && cfg.monitoring_interval_secs == 0 {
            return Err(ValidationError::InvalidConfig(
                "monitoring_interval_secs must be positive when monitoring".into(),
            ));
        }
        if cfg.minimum_data_points == 0 {
            return Err(ValidationError::InvalidConfig(
                "minimum_data_points must be at least 1".into(),
            ));
        }
        match &cfg.switch_mode {
            SwitchMode::Immediate => {}
            SwitchMode::Gradual { increments, .. } => {
                if increments.is_empty() {
                    return Err(ValidationError::InvalidConfig(
                        "gradual switch needs at least one increment".into(),
                    ));
                }
                if increments.windows(2).any(|w| w[0] >= w[1])
                    || increments.iter().any(|&p| p == 0 || p > 100)
                {
                    return Err(ValidationError::InvalidConfig(format!(
                        "gradual increments must rise strictly within 1..=100, got {increments:?}"
                    )));
                }
                if increments.last() != Some(&100) {
                    return Err(ValidationError::InvalidConfig(
                        "gradual increments must end at 100".into(),
                    ));
                }
            }
            SwitchMode::Weighted { percentage } => {
                if *percentage == 0 || *percentage >= 100 {
                    return Err(ValidationError::InvalidConfig(format!(
                        "weighted split must be within 1..=99, got {percentage}"
                    )));
                }
            }
        }
        Ok(())
    }

    fn create_phases(&self, request: &PlanRequest) -> ValidationResult<Vec<Phase>> {
        self.validate_configuration(&request.strategy)?;
        let cfg = blue_green(&request.strategy)?;
        if request.hosts.is_empty() {
            return Err(ValidationError::NoTargets);
        }
        max_unavailable(request.hosts.len(), None, cfg.minimum_available_instances)?;

        let ctx = context(
            &request.workflow_id,
            &request.service,
            &request.version,
            &request.package,
            cfg,
        );
        let active = cfg.active_environment;
        let idle = active.other();
        let idle_pool = idle.pool_name(&request.service);
        let active_pool = active.pool_name(&request.service);
        let host_ids: Vec<HostId> = request.hosts.iter().map(|h| h.id.clone()).collect();
        let parallelism = cfg.max_parallelism.max(1);
        let rounds = host_ids.len().div_ceil(parallelism as usize);

        let mut phases = vec![ctx.pre_deployment(0, &request.hosts, parallelism)];

        let mut deploy = ctx.phase(phases.len(), &format!("deploy-{}", label(idle)), PhaseKind::Deployment);
        for host in &host_ids {
            in_env(ctx.add_step(&mut deploy, StepType::Deploy, Some(host), true), idle);
            let wait = ctx.add_step(&mut deploy, StepType::WaitForHealthy, Some(host), true);
            wait.timeout_secs = cfg.health_check_timeout_secs;
            in_env(wait, idle);
        }
        deploy.hosts = host_ids.clone();
        deploy.parallel = true;
        deploy.max_parallelism = parallelism;
        deploy.timeout_secs = ctx.phase_budget(2, rounds) + cfg.health_check_timeout_secs;
        phases.push(deploy);

        let mut verify = ctx.phase(phases.len(), &format!("verify-{}", label(idle)), PhaseKind::Verification);
        for host in &host_ids {
            in_env(ctx.add_step(&mut verify, StepType::HealthCheck, Some(host), true), idle);
            ctx.add_traffic_step(
                &mut verify,
                TrafficAction::AddToPool {
                    pool: idle_pool.clone(),
                    host: host.clone(),
                },
            );
            ctx.add_traffic_step(
                &mut verify,
                TrafficAction::PoolHealthCheck {
                    pool: idle_pool.clone(),
                    host: host.clone(),
                },
            );
        }
        verify.hosts = host_ids.clone();
        verify.parallel = true;
        verify.max_parallelism = parallelism;
        verify.timeout_secs = ctx.phase_budget(3, rounds);
        phases.push(verify);

        match &cfg.switch_mode {
            SwitchMode::Immediate => {
                let index = phases.len();
                phases.push(switch_phase(&ctx, index, "switch-traffic", TrafficRoute::all_to(&idle_pool), cfg));
            }
            SwitchMode::Gradual {
                increments,
                step_interval_secs,
            } => {
                for (i, pct) in increments.iter().enumerate() {
                    let route = TrafficRoute {
                        percentage: *pct,
                        ..TrafficRoute::all_to(&idle_pool)
                    };
                    let index = phases.len();
                    let mut phase = switch_phase(&ctx, index, &format!("switch-traffic-{pct}"), route, cfg);
                    if i + 1 < increments.len() {
                        phase.gate = Some(PhaseGate::Wait {
                            duration_secs: *step_interval_secs,
                        });
                        phase.timeout_secs += step_interval_secs;
                    }
                    phases.push(phase);
                }
            }
            SwitchMode::Weighted { percentage } => {
                let route = TrafficRoute {
                    percentage: *percentage,
                    ..TrafficRoute::all_to(&idle_pool)
                };
                let index = phases.len();
                phases.push(switch_phase(&ctx, index, "switch-traffic", route, cfg));
            }
        }

        if cfg.monitoring_duration_secs > 0 {
            let mut monitor = ctx.phase(phases.len(), "monitor-traffic", PhaseKind::Monitoring);
            monitor.gate = Some(PhaseGate::Monitor {
                duration_secs: cfg.monitoring_duration_secs,
                interval_secs: cfg.monitoring_interval_secs,
                conditions: self.default_rollback_conditions(&request.strategy),
            });
            monitor.hosts = host_ids.clone();
            monitor.rollback_on_failure = cfg.auto_rollback_enabled;
            monitor.timeout_secs = cfg.monitoring_duration_secs + 300;
            phases.push(monitor);
        }

        let keeps_split = matches!(cfg.switch_mode, SwitchMode::Weighted { .. });
        if cfg.decommission_previous && !keeps_split {
            let mut decommission =
                ctx.phase(phases.len(), &format!("decommission-{}", label(active)), PhaseKind::Cleanup);
            for host in &host_ids {
                let step = ctx.add_traffic_step(
                    &mut decommission,
                    TrafficAction::RemoveFromPool {
                        pool: active_pool.clone(),
                        host: host.clone(),
                    },
                );
                step.critical = false;
            }
            in_env(ctx.add_step(&mut decommission, StepType::Cleanup, None, false), active);
            decommission.hosts = host_ids.clone();
            decommission.parallel = true;
            decommission.max_parallelism = parallelism;
            decommission.max_failures = host_ids.len() as u32 + 1;
            decommission.timeout_secs = ctx.phase_budget(1, rounds + 1);
            phases.push(decommission);
        }

        let index = phases.len();
        phases.push(ctx.post_deployment(index, &request.hosts));
        verify_partition(&phases, &request.hosts)?;

        info!(
            workflow = %request.workflow_id,
            target = label(idle),
            phases = phases.len(),
            "blue-green plan created"
        );
        Ok(phases)
    }

    fn estimate_execution_time(
        &self,
        hosts: &[TargetHost],
        config: &StrategyConfig,
    ) -> ValidationResult<Duration> {
        let cfg = blue_green(config)?;
        let rounds = hosts.len().div_ceil(cfg.max_parallelism.max(1) as usize) as u32;
        let switch = match &cfg.switch_mode {
            SwitchMode::Gradual {
                increments,
                step_interval_secs,
            } => {
                CHECK_ESTIMATE * increments.len() as u32
                    + Duration::from_secs(*step_interval_secs) * increments.len().saturating_sub(1) as u32
            }
            _ => CHECK_ESTIMATE,
        };
        Ok(CHECK_ESTIMATE * rounds
            + (DEPLOY_ESTIMATE + CHECK_ESTIMATE) * rounds
            + CHECK_ESTIMATE * 3 * rounds
            + switch
            + Duration::from_secs(cfg.monitoring_duration_secs)
            + CHECK_ESTIMATE * 4)
    }

    fn execution_policy(&self, config: &StrategyConfig) -> ExecutionPolicy {
        match blue_green(config) {
            Ok(cfg) => ExecutionPolicy {
                monitoring_interval_secs: cfg.monitoring_interval_secs,
                ..ExecutionPolicy::default()
            },
            Err(_) => ExecutionPolicy::default(),
        }
    }

    fn default_rollback_conditions(&self, config: &StrategyConfig) -> Vec<RollbackCondition> {
        let Ok(cfg) = blue_green(config) else {
            return Vec::new();
        };
        if !cfg.auto_rollback_enabled {
            return Vec::new();
        }
        let window = cfg.monitoring_duration_secs.max(cfg.monitoring_interval_secs).max(1);
        let mut conditions = vec![
            RollbackCondition::new(TriggerType::ErrorRate, cfg.error_rate_threshold)
                .window(window, cfg.minimum_data_points),
        ];
        if let Some(ms) = cfg.response_time_threshold_ms {
            conditions.push(
                RollbackCondition::new(TriggerType::ResponseTime, ms)
                    .window(window, cfg.minimum_data_points),
            );
        }
        conditions
    }

    fn monitoring_interval(&self, config: &StrategyConfig) -> Option<Duration> {
        blue_green(config)
            .ok()
            .map(|cfg| Duration::from_secs(cfg.monitoring_interval_secs.max(1)))
    }

    /// Route everything back to the active environment, then tear down the
    /// idle one on every host that received it.
    fn create_rollback_phases(
        &self,
        workflow: &Workflow,
        _to_version: Option<&str>,
    ) -> ValidationResult<Vec<Phase>> {
        let cfg = blue_green(&workflow.strategy_config)?;
        let ctx = context(
            &workflow.id,
            &workflow.service,
            &workflow.version,
            &workflow.package,
            cfg,
        );
        let active = cfg.active_environment;
        let idle = active.other();
        let idle_pool = idle.pool_name(&workflow.service);
        let base = workflow.phases.len();

        let mut phases = Vec::new();
        let mut traffic = ctx.phase(base, "rollback-traffic", PhaseKind::Rollback);
        ctx.add_traffic_step(
            &mut traffic,
            TrafficAction::Switch {
                route: TrafficRoute::all_to(&active.pool_name(&workflow.service)),
            },
        );
        traffic.timeout_secs = ctx.phase_budget(1, 1);
        phases.push(traffic);

        let touched: Vec<HostId> = touched_deployments(workflow)
            .iter()
            .flat_map(|p| p.hosts.iter().cloned())
            .collect();
        if !touched.is_empty() {
            let mut teardown = ctx.phase(base + 1, &format!("rollback-{}", label(idle)), PhaseKind::Rollback);
            for host in &touched {
                ctx.add_traffic_step(
                    &mut teardown,
                    TrafficAction::RemoveFromPool {
                        pool: idle_pool.clone(),
                        host: host.clone(),
                    },
                )
                .critical = false;
                in_env(ctx.add_step(&mut teardown, StepType::ServiceStop, Some(host), false), idle);
                in_env(ctx.add_step(&mut teardown, StepType::Cleanup, Some(host), false), idle);
            }
            teardown.hosts = touched.clone();
            teardown.parallel = true;
            teardown.max_parallelism = cfg.max_parallelism.max(1);
            teardown.max_failures = touched.len() as u32;
            teardown.timeout_secs = ctx.phase_budget(
                3,
                touched.len().div_ceil(teardown.max_parallelism as usize),
            );
            phases.push(teardown);
        }
        Ok(phases)
    }
}

#[cfg(test)]
mod tests {
    use armada_core::{PhaseStatus, StepStatus};

    use super::*;

    fn hosts(n: usize) -> Vec<TargetHost> {
        (0..n).map(|i| TargetHost::new(format!("web-{i:02}"))).collect()
    }

    fn request(n: usize, cfg: BlueGreenConfig) -> PlanRequest {
        PlanRequest {
            workflow_id: "wf-bg".into(),
            service: "api".into(),
            version: "2.0.0".into(),
            previous_version: Some("1.9.0".into()),
            package: "api-2.0.0".into(),
            hosts: hosts(n),
            strategy: StrategyConfig::BlueGreen(cfg),
        }
    }

    fn names(phases: &[Phase]) -> Vec<&str> {
        phases.iter().map(|p| p.name.as_str()).collect()
    }

    #[test]
    fn immediate_switch_layout() {
        let phases = BlueGreenPlanner
            .create_phases(&request(4, BlueGreenConfig::default()))
            .unwrap();
        assert_eq!(
            names(&phases),
            vec![
                "pre-deployment",
                "deploy-green",
                "verify-green",
                "switch-traffic",
                "monitor-traffic",
                "decommission-blue",
                "post-deployment"
            ]
        );
        let switch = &phases[3].steps[0];
        assert_eq!(
            switch.traffic,
            Some(TrafficAction::Switch {
                route: TrafficRoute::all_to("api-green")
            })
        );
        assert!(matches!(
            phases[4].gate,
            Some(PhaseGate::Monitor { duration_secs: 300, .. })
        ));
        assert_eq!(
            phases[1].steps[0].command.parameters.get("environment").map(String::as_str),
            Some("green")
        );
    }

    #[test]
    fn gradual_switch_waits_between_increments() {
        let cfg = BlueGreenConfig {
            switch_mode: SwitchMode::Gradual {
                increments: vec![10, 50, 100],
                step_interval_secs: 60,
            },
            ..Default::default()
        };
        let phases = BlueGreenPlanner.create_phases(&request(2, cfg)).unwrap();
        let switches: Vec<&Phase> = phases
            .iter()
            .filter(|p| p.kind == PhaseKind::TrafficSwitch)
            .collect();
        assert_eq!(switches.len(), 3);
        assert_eq!(switches[0].gate, Some(PhaseGate::Wait { duration_secs: 60 }));
        assert_eq!(switches[2].gate, None);
    }

    #[test]
    fn weighted_split_keeps_previous_environment() {
        let cfg = BlueGreenConfig {
            switch_mode: SwitchMode::Weighted { percentage: 30 },
            ..Default::default()
        };
        let phases = BlueGreenPlanner.create_phases(&request(2, cfg)).unwrap();
        assert!(!names(&phases).contains(&"decommission-blue"));
    }

    #[test]
    fn invalid_increments_rejected() {
        for increments in [vec![], vec![50, 20, 100], vec![10, 50]] {
            let config = StrategyConfig::BlueGreen(BlueGreenConfig {
                switch_mode: SwitchMode::Gradual {
                    increments,
                    step_interval_secs: 10,
                },
                ..Default::default()
            });
            assert!(BlueGreenPlanner.validate_configuration(&config).is_err());
        }
    }

    #[test]
    fn availability_beyond_fleet_rejected() {
        let cfg = BlueGreenConfig {
            minimum_available_instances: Some(5),
            ..Default::default()
        };
        let err = BlueGreenPlanner.create_phases(&request(3, cfg)).unwrap_err();
        assert!(matches!(err, ValidationError::Availability(_)));
    }

    #[test]
    fn default_conditions_follow_thresholds() {
        let config = StrategyConfig::BlueGreen(BlueGreenConfig {
            response_time_threshold_ms: Some(250.0),
            ..Default::default()
        });
        let conditions = BlueGreenPlanner.default_rollback_conditions(&config);
        assert_eq!(conditions.len(), 2);
        assert_eq!(conditions[0].trigger, TriggerType::ErrorRate);
        assert_eq!(conditions[0].threshold, 5.0);

        let off = StrategyConfig::BlueGreen(BlueGreenConfig {
            auto_rollback_enabled: false,
            ..Default::default()
        });
        assert!(BlueGreenPlanner.default_rollback_conditions(&off).is_empty());
    }

    #[test]
    fn rollback_switches_back_and_tears_down() {
        let config = BlueGreenConfig::default();
        let phases = BlueGreenPlanner.create_phases(&request(2, config.clone())).unwrap();
        let mut wf = Workflow::new(
            "wf-bg".into(),
            "api",
            "2.0.0",
            "api-2.0.0",
            StrategyConfig::BlueGreen(config),
            hosts(2),
        );
        wf.phases = phases;
        wf.phases[1].status = PhaseStatus::Completed;

        let rollback = BlueGreenPlanner.create_rollback_phases(&wf, None).unwrap();
        assert_eq!(rollback.len(), 2);
        assert_eq!(
            rollback[0].steps[0].traffic,
            Some(TrafficAction::Switch {
                route: TrafficRoute::all_to("api-blue")
            })
        );
        assert_eq!(rollback[1].name, "rollback-green");
        assert_eq!(rollback[1].hosts.len(), 2);
        assert!(rollback[1].steps.iter().all(|s| s.status == StepStatus::Pending));
    }
}
