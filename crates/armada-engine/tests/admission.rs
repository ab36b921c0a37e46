//! Admission control, cancellation, locking and reporting.

mod common;

use std::time::Duration;

use armada_collab::KeyValueStore;
use armada_collab::kv::workflow_lock_key;
use armada_core::{
    BlueGreenConfig, ErrorKind, OrchestratorConfig, PhaseStatus, RollingConfig, Severity,
    StepType, StrategyConfig, WaveStrategy, WorkflowStatus,
};
use armada_engine::{EngineError, StartOutcome};

use common::{Harness, hosts, request};

fn slow_rolling() -> StrategyConfig {
    StrategyConfig::Rolling(RollingConfig {
        wave_strategy: WaveStrategy::FixedSize { size: 1 },
        wave_interval_secs: 60,
        ..Default::default()
    })
}

/// Parks in its monitoring phase for an hour once traffic is switched.
fn long_blue_green() -> StrategyConfig {
    StrategyConfig::BlueGreen(BlueGreenConfig {
        monitoring_duration_secs: 3_600,
        monitoring_interval_secs: 10,
        ..Default::default()
    })
}

fn single_slot() -> OrchestratorConfig {
    OrchestratorConfig {
        max_concurrent_workflows: 1,
        max_queued_workflows: 1,
        ..Default::default()
    }
}

#[tokio::test(start_paused = true)]
async fn overflow_is_queued_then_rejected() {
    let h = Harness::new(single_slot()).await;
    let a = h.create(request("api", hosts("a", 3), slow_rolling())).await;
    let b = h.create(request("api", hosts("b", 3), slow_rolling())).await;
    let c = h.create(request("api", hosts("c", 3), slow_rolling())).await;

    assert_eq!(h.orch.try_start(&a.id).await.unwrap(), StartOutcome::Started);
    assert_eq!(h.orch.try_start(&b.id).await.unwrap(), StartOutcome::Queued);
    let err = h.orch.try_start(&c.id).await.unwrap_err();
    assert!(matches!(err, EngineError::Admission(_)));
    assert!(!h.orch.start_workflow(&c.id).await);

    assert_eq!(h.status(&b.id).await, WorkflowStatus::Queued);
    assert_eq!(h.status(&c.id).await, WorkflowStatus::Created);
    assert_eq!(h.orch.queued().await, vec![b.id.clone()]);
    // Nothing from b has been dispatched while it waits.
    assert_eq!(h.broker.count(Some("b-000"), StepType::Deploy).await, 0);

    let health = h.orch.get_health().await;
    assert_eq!(health.active_count, 1);
    assert_eq!(health.queued_count, 1);
    assert!(!health.is_healthy);
    assert!(health.issues.iter().any(|i| i.contains("queue")));

    assert_eq!(h.finish(&a.id).await.status, WorkflowStatus::Completed);
    assert_eq!(h.finish(&b.id).await.status, WorkflowStatus::Completed);
    let path: Vec<_> = h
        .orch
        .transitions(&b.id)
        .unwrap()
        .into_iter()
        .map(|t| t.to)
        .collect();
    assert_eq!(
        path,
        vec![
            WorkflowStatus::Queued,
            WorkflowStatus::Running,
            WorkflowStatus::Completed
        ]
    );

    assert_eq!(h.run(&c.id).await.status, WorkflowStatus::Completed);
    assert!(h.orch.get_health().await.is_healthy);
}

#[tokio::test(start_paused = true)]
async fn start_from_wrong_status_changes_nothing() {
    let h = Harness::standard().await;
    let wf = h.create(request("api", hosts("web", 2), slow_rolling())).await;
    let done = h.run(&wf.id).await;
    assert_eq!(done.status, WorkflowStatus::Completed);
    let history = h.orch.transitions(&wf.id).unwrap().len();
    let published = h.broker.published().await.len();

    assert!(!h.orch.start_workflow(&wf.id).await);
    let err = h.orch.try_start(&wf.id).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::InvalidState {
            status: WorkflowStatus::Completed,
            ..
        }
    ));

    assert_eq!(h.workflow(&wf.id).await, done);
    assert_eq!(h.orch.transitions(&wf.id).unwrap().len(), history);
    assert_eq!(h.broker.published().await.len(), published);
    assert!(!h.orch.start_workflow("no-such-workflow").await);
}

#[tokio::test(start_paused = true)]
async fn second_start_while_running_is_refused() {
    let h = Harness::standard().await;
    let wf = h.create(request("api", hosts("web", 3), slow_rolling())).await;
    assert!(h.orch.start_workflow(&wf.id).await);
    assert!(!h.orch.start_workflow(&wf.id).await);
    assert_eq!(h.finish(&wf.id).await.status, WorkflowStatus::Completed);
}

#[tokio::test(start_paused = true)]
async fn held_lock_blocks_start() {
    let h = Harness::standard().await;
    let wf = h.create(request("api", hosts("web", 2), slow_rolling())).await;
    let other = h
        .kv
        .acquire_lock(&workflow_lock_key(&wf.id), Duration::from_secs(600), Duration::ZERO)
        .await
        .unwrap()
        .unwrap();

    let err = h.orch.try_start(&wf.id).await.unwrap_err();
    assert!(matches!(err, EngineError::Lock(_)));
    assert_eq!(h.status(&wf.id).await, WorkflowStatus::Created);

    h.kv.release_lock(&other).await.unwrap();
    assert_eq!(h.run(&wf.id).await.status, WorkflowStatus::Completed);
}

#[tokio::test(start_paused = true)]
async fn cancel_interrupts_a_running_workflow() {
    let h = Harness::standard().await;
    let wf = h.create(request("api", hosts("web", 2), long_blue_green())).await;
    assert!(h.orch.start_workflow(&wf.id).await);
    h.wait_for_route("api", "api-green").await;

    assert!(h.orch.cancel_workflow(&wf.id, "operator abort").await);
    let done = h.finish(&wf.id).await;
    assert_eq!(done.status, WorkflowStatus::Cancelled);
    assert!(!h.orch.cancel_workflow(&wf.id, "again").await);

    let entry = done
        .errors
        .iter()
        .find(|e| e.kind == ErrorKind::Cancellation)
        .unwrap();
    assert_eq!(entry.severity, Severity::Info);
    assert!(entry.message.contains("operator abort"));
    assert!(!done.errors.iter().any(|e| e.kind == ErrorKind::Timeout));

    let monitor = done.phases.iter().find(|p| p.name == "monitor-traffic").unwrap();
    assert_eq!(monitor.status, PhaseStatus::Cancelled);
    assert!(
        done.phases
            .iter()
            .all(|p| !matches!(p.status, PhaseStatus::Pending | PhaseStatus::Running))
    );
    assert!(!h.kv.is_locked(&workflow_lock_key(&wf.id)).await);
}

#[tokio::test(start_paused = true)]
async fn cancel_a_queued_workflow() {
    let h = Harness::new(single_slot()).await;
    let a = h.create(request("api", hosts("a", 2), long_blue_green())).await;
    let b = h.create(request("web", hosts("b", 2), slow_rolling())).await;
    assert_eq!(h.orch.try_start(&a.id).await.unwrap(), StartOutcome::Started);
    assert_eq!(h.orch.try_start(&b.id).await.unwrap(), StartOutcome::Queued);

    assert!(h.orch.cancel_workflow(&b.id, "not needed").await);
    let queued = h.workflow(&b.id).await;
    assert_eq!(queued.status, WorkflowStatus::Cancelled);
    assert!(queued.errors.iter().any(|e| e.kind == ErrorKind::Cancellation));
    assert!(h.orch.queued().await.is_empty());

    assert!(h.orch.cancel_workflow(&a.id, "done testing").await);
    assert_eq!(h.finish(&a.id).await.status, WorkflowStatus::Cancelled);
    assert_eq!(h.broker.count(Some("b-000"), StepType::Deploy).await, 0);
}

#[tokio::test(start_paused = true)]
async fn lost_lock_aborts_the_run() {
    let h = Harness::new(OrchestratorConfig {
        lock_ttl_secs: 30,
        ..Default::default()
    })
    .await;
    let wf = h.create(request("api", hosts("web", 2), long_blue_green())).await;
    assert!(h.orch.start_workflow(&wf.id).await);
    h.wait_for_route("api", "api-green").await;

    h.kv.expire_lock(&workflow_lock_key(&wf.id)).await;
    let done = h.finish(&wf.id).await;
    assert_eq!(done.status, WorkflowStatus::Cancelled);
    assert!(done.errors.iter().any(|e| e.kind == ErrorKind::Lock));
}

#[tokio::test(start_paused = true)]
async fn statistics_and_deletion() {
    let h = Harness::standard().await;
    h.broker
        .fail(Some("bad-000"), Some(StepType::Deploy), None)
        .await;
    let good = h.create(request("api", hosts("good", 2), slow_rolling())).await;
    let bad = h.create(request("api", hosts("bad", 2), slow_rolling())).await;
    let idle = h.create(request("api", hosts("idle", 2), slow_rolling())).await;

    assert_eq!(h.run(&good.id).await.status, WorkflowStatus::Completed);
    assert_eq!(h.run(&bad.id).await.status, WorkflowStatus::Failed);

    let stats = h.orch.get_statistics(None).unwrap();
    assert_eq!(stats.total, 3);
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.failed, 1);
    assert!((stats.success_rate - 50.0).abs() < f64::EPSILON);

    let err = h.orch.delete_workflow(&idle.id).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidState { .. }));
    assert!(h.orch.delete_workflow(&bad.id).await.unwrap());
    assert!(h.orch.get_workflow(&bad.id).await.unwrap().is_none());
    assert!(!h.orch.delete_workflow(&bad.id).await.unwrap());
    assert_eq!(h.orch.get_statistics(None).unwrap().total, 2);
}
