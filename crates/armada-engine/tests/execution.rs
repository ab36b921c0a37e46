//! Executor policy: concurrent waves, failure tolerance, timeouts, adaptive waves.

mod common;

use std::time::Duration;

use armada_core::{
    ErrorKind, PhaseKind, PhaseStatus, RollingConfig, Severity, StepStatus, StepType,
    StrategyConfig, WaveStrategy, Workflow, WorkflowStatus,
};

use common::{Harness, hosts, request};

fn waves_of(size: u32) -> RollingConfig {
    RollingConfig {
        wave_strategy: WaveStrategy::FixedSize { size },
        wave_interval_secs: 0,
        ..Default::default()
    }
}

fn wave<'a>(wf: &'a Workflow, name: &str) -> &'a armada_core::Phase {
    wf.phases.iter().find(|p| p.name == name).unwrap()
}

fn deployment_sizes(wf: &Workflow) -> Vec<usize> {
    wf.phases
        .iter()
        .filter(|p| p.is_deployment())
        .map(|p| p.hosts.len())
        .collect()
}

/// Position of the `nth` (0-based) command of `action` sent to `host`.
async fn sent_at(h: &Harness, host: &str, action: StepType, nth: usize) -> usize {
    h.broker
        .published()
        .await
        .iter()
        .enumerate()
        .filter(|(_, c)| c.action == action && c.host.as_deref() == Some(host))
        .nth(nth)
        .map(|(i, _)| i)
        .unwrap()
}

#[tokio::test(start_paused = true)]
async fn concurrent_waves_overlap() {
    let h = Harness::standard().await;
    h.broker
        .fail(Some("web-000"), Some(StepType::Deploy), Some(1))
        .await;
    let cfg = RollingConfig {
        max_concurrent_waves: 3,
        retry_backoff_secs: 30,
        ..waves_of(2)
    };
    let wf = h
        .create(request("api", hosts("web", 6), StrategyConfig::Rolling(cfg)))
        .await;
    assert_eq!(wf.policy.max_concurrent_waves, 3);

    let done = h.run(&wf.id).await;
    assert_eq!(done.status, WorkflowStatus::Completed);
    assert!(done.phases.iter().all(|p| p.status == PhaseStatus::Completed));

    // wave-3 deployed while wave-1 was still backing off.
    let retry = sent_at(&h, "web-000", StepType::Deploy, 1).await;
    assert!(sent_at(&h, "web-004", StepType::Deploy, 0).await < retry);
    assert!(sent_at(&h, "web-005", StepType::Deploy, 0).await < retry);
}

#[tokio::test(start_paused = true)]
async fn concurrent_waves_settle_in_plan_order() {
    let h = Harness::standard().await;
    h.broker
        .fail(Some("web-002"), Some(StepType::Deploy), None)
        .await;
    let cfg = RollingConfig {
        max_concurrent_waves: 2,
        max_retries: 0,
        ..waves_of(2)
    };
    let wf = h
        .create(request("api", hosts("web", 8), StrategyConfig::Rolling(cfg)))
        .await;

    let done = h.run(&wf.id).await;
    assert_eq!(done.status, WorkflowStatus::Failed);
    assert_eq!(wave(&done, "wave-1").status, PhaseStatus::Completed);
    assert_eq!(wave(&done, "wave-2").status, PhaseStatus::Failed);
    assert_eq!(wave(&done, "wave-3").status, PhaseStatus::Pending);
    assert_eq!(wave(&done, "wave-4").status, PhaseStatus::Pending);
    assert_eq!(h.broker.count(Some("web-004"), StepType::Deploy).await, 0);

    let escalated = done
        .errors
        .iter()
        .find(|e| e.kind == ErrorKind::Execution && e.step_id.is_none())
        .unwrap();
    assert!(escalated.message.contains("wave-2"));
    assert_eq!(escalated.phase_id.as_deref(), Some(wave(&done, "wave-2").id.as_str()));
}

fn tolerant(continue_on_failure: bool) -> StrategyConfig {
    StrategyConfig::Rolling(RollingConfig {
        max_batch_failures: 1,
        max_retries: 0,
        continue_on_non_critical_failure: continue_on_failure,
        rollback_on_any_wave_failure: false,
        ..waves_of(2)
    })
}

#[tokio::test(start_paused = true)]
async fn non_critical_wave_failure_continues_when_allowed() {
    let h = Harness::standard().await;
    for host in ["web-000", "web-001"] {
        h.broker.fail(Some(host), Some(StepType::Deploy), None).await;
    }
    let wf = h.create(request("api", hosts("web", 6), tolerant(true))).await;

    let done = h.run(&wf.id).await;
    assert_eq!(done.status, WorkflowStatus::Completed);
    assert_eq!(wave(&done, "wave-1").status, PhaseStatus::Failed);
    assert_eq!(wave(&done, "wave-2").status, PhaseStatus::Completed);
    assert_eq!(wave(&done, "wave-3").status, PhaseStatus::Completed);
    assert_eq!(h.broker.count(Some("web-005"), StepType::Deploy).await, 1);

    let carried = done
        .errors
        .iter()
        .find(|e| e.message.contains("continuing"))
        .unwrap();
    assert_eq!(carried.severity, Severity::Warning);
    assert!(
        done.errors
            .iter()
            .all(|e| e.severity <= Severity::Warning)
    );
}

#[tokio::test(start_paused = true)]
async fn non_critical_wave_failure_stops_by_default() {
    let h = Harness::standard().await;
    for host in ["web-000", "web-001"] {
        h.broker.fail(Some(host), Some(StepType::Deploy), None).await;
    }
    let wf = h.create(request("api", hosts("web", 6), tolerant(false))).await;

    let done = h.run(&wf.id).await;
    assert_eq!(done.status, WorkflowStatus::Failed);
    assert_eq!(wave(&done, "wave-1").status, PhaseStatus::Failed);
    assert_eq!(wave(&done, "wave-2").status, PhaseStatus::Pending);
    assert_eq!(h.broker.count(Some("web-002"), StepType::Deploy).await, 0);
    assert!(
        done.errors
            .iter()
            .any(|e| e.severity == Severity::Error && e.message.contains("wave-1"))
    );
}

#[tokio::test(start_paused = true)]
async fn wave_tolerates_failures_up_to_its_budget() {
    let h = Harness::standard().await;
    h.broker
        .fail(Some("web-001"), Some(StepType::Deploy), None)
        .await;
    let cfg = StrategyConfig::Rolling(RollingConfig {
        max_batch_failures: 1,
        max_retries: 0,
        ..waves_of(3)
    });
    let wf = h.create(request("api", hosts("web", 6), cfg)).await;

    let done = h.run(&wf.id).await;
    assert_eq!(done.status, WorkflowStatus::Completed);
    let first = wave(&done, "wave-1");
    assert_eq!(first.status, PhaseStatus::Completed);
    assert_eq!(first.failed_hosts, vec!["web-001".to_string()]);
    assert_eq!(wave(&done, "wave-2").status, PhaseStatus::Completed);

    let skipped = first
        .steps
        .iter()
        .filter(|s| s.host.as_deref() == Some("web-001") && s.step_type != StepType::Deploy)
        .all(|s| s.status == StepStatus::Skipped);
    assert!(skipped);
    assert!(
        done.errors
            .iter()
            .any(|e| e.severity == Severity::Warning && e.host.as_deref() == Some("web-001"))
    );
    assert_eq!(h.broker.hosts_for(StepType::Deploy).await.len(), 6);
}

#[tokio::test(start_paused = true)]
async fn hung_host_in_preflight_times_out_its_own_step() {
    let h = Harness::standard().await;
    h.broker
        .hang(Some("web-001"), Some(StepType::HealthCheck))
        .await;
    let cfg = StrategyConfig::Rolling(RollingConfig {
        step_timeout_secs: 10,
        max_retries: 0,
        ..waves_of(1)
    });
    let wf = h.create(request("api", hosts("web", 3), cfg)).await;
    let preflight = &wf.phases[0];
    assert_eq!(preflight.kind, PhaseKind::PreDeployment);
    assert_eq!(preflight.timeout_secs, 70);

    let started = tokio::time::Instant::now();
    let done = h.run(&wf.id).await;
    assert!(started.elapsed() < Duration::from_secs(70));
    assert_eq!(done.status, WorkflowStatus::Failed);

    let timeout = done
        .errors
        .iter()
        .find(|e| e.kind == ErrorKind::Timeout)
        .unwrap();
    assert_eq!(timeout.host.as_deref(), Some("web-001"));
    assert!(timeout.step_id.is_some());
    assert!(!timeout.message.contains("exceeded"));

    let preflight = &done.phases[0];
    assert_eq!(preflight.status, PhaseStatus::Failed);
    for step in &preflight.steps {
        let expected = if step.host.as_deref() == Some("web-001") {
            StepStatus::Failed
        } else {
            StepStatus::Completed
        };
        assert_eq!(step.status, expected, "{}", step.id);
        assert_eq!(step.attempts, 1);
    }
    assert!(h.broker.hosts_for(StepType::Deploy).await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn step_timeout_is_retried_then_recorded() {
    let h = Harness::standard().await;
    h.broker.hang(Some("web-001"), Some(StepType::Deploy)).await;
    let cfg = StrategyConfig::Rolling(RollingConfig {
        step_timeout_secs: 10,
        max_retries: 1,
        retry_backoff_secs: 1,
        ..waves_of(2)
    });
    let wf = h.create(request("api", hosts("web", 4), cfg)).await;

    let done = h.run(&wf.id).await;
    assert_eq!(done.status, WorkflowStatus::Failed);
    assert_eq!(h.broker.count(Some("web-001"), StepType::Deploy).await, 2);

    let first = wave(&done, "wave-1");
    let step = first
        .steps
        .iter()
        .find(|s| s.step_type == StepType::Deploy && s.host.as_deref() == Some("web-001"))
        .unwrap();
    assert_eq!(step.status, StepStatus::Failed);
    assert_eq!(step.attempts, 2);
    assert!(step.error.as_deref().unwrap().contains("timed out"));

    let entry = done
        .errors
        .iter()
        .find(|e| e.kind == ErrorKind::Timeout)
        .unwrap();
    assert_eq!(entry.step_id.as_deref(), Some(step.id.as_str()));
    assert_eq!(entry.phase_id.as_deref(), Some(first.id.as_str()));
    assert_eq!(entry.severity, Severity::Error);
}

#[tokio::test(start_paused = true)]
async fn phase_timeout_cancels_the_wave() {
    let h = Harness::standard().await;
    h.broker.hang(Some("web-000"), Some(StepType::Deploy)).await;
    let cfg = StrategyConfig::Rolling(RollingConfig {
        step_timeout_secs: 10,
        wave_timeout_secs: 15,
        retry_backoff_secs: 1,
        ..waves_of(2)
    });
    let wf = h.create(request("api", hosts("web", 4), cfg)).await;

    let done = h.run(&wf.id).await;
    assert_eq!(done.status, WorkflowStatus::Failed);
    let first = wave(&done, "wave-1");
    assert_eq!(first.status, PhaseStatus::Failed);
    let hung = first
        .steps
        .iter()
        .find(|s| s.step_type == StepType::Deploy && s.host.as_deref() == Some("web-000"))
        .unwrap();
    assert_eq!(hung.status, StepStatus::Cancelled);

    let entry = done
        .errors
        .iter()
        .find(|e| e.kind == ErrorKind::Timeout)
        .unwrap();
    assert!(entry.message.contains("exceeded its 15s timeout"));
    assert_eq!(entry.phase_id.as_deref(), Some(first.id.as_str()));
    assert!(entry.step_id.is_none());
    assert_eq!(wave(&done, "wave-2").status, PhaseStatus::Pending);
}

#[tokio::test(start_paused = true)]
async fn workflow_timeout_fails_the_run() {
    let h = Harness::standard().await;
    let cfg = StrategyConfig::Rolling(RollingConfig {
        wave_interval_secs: 60,
        ..waves_of(1)
    });
    let mut req = request("api", hosts("web", 3), cfg);
    req.timeout_secs = Some(90);
    let wf = h.create(req).await;

    let done = h.run(&wf.id).await;
    assert_eq!(done.status, WorkflowStatus::Failed);
    let entry = done
        .errors
        .iter()
        .find(|e| e.kind == ErrorKind::Timeout)
        .unwrap();
    assert!(entry.message.contains("workflow exceeded its 90s timeout"));
    assert!(entry.phase_id.is_none());

    assert_eq!(wave(&done, "wave-2").status, PhaseStatus::Completed);
    assert_eq!(wave(&done, "wave-3").status, PhaseStatus::Pending);
    assert_eq!(h.broker.count(Some("web-002"), StepType::Deploy).await, 0);
}

#[tokio::test(start_paused = true)]
async fn adaptive_waves_resize_as_the_run_progresses() {
    let h = Harness::standard().await;
    let cfg = StrategyConfig::Rolling(RollingConfig {
        wave_strategy: WaveStrategy::Adaptive {
            initial_size: 2,
            min_size: 1,
            growth_factor: 2.0,
        },
        max_parallelism: 10,
        wave_interval_secs: 0,
        ..Default::default()
    });
    let wf = h.create(request("api", hosts("web", 10), cfg)).await;
    assert_eq!(deployment_sizes(&wf), vec![2, 2, 2, 2, 2]);

    let done = h.run(&wf.id).await;
    assert_eq!(done.status, WorkflowStatus::Completed);
    assert_eq!(deployment_sizes(&done), vec![2, 4, 4, 0, 0]);
    assert_eq!(h.broker.hosts_for(StepType::Deploy).await.len(), 10);

    // The second wave took both hosts planned for the third.
    let second = &wave(&done, "wave-2").hosts;
    assert_eq!(
        second,
        &["web-002", "web-003", "web-004", "web-005"].map(String::from).to_vec()
    );
}
