//! Workflows persisted on disk outlive the orchestrator that ran them.

mod common;

use armada_core::{
    OrchestratorConfig, PhaseStatus, RollingConfig, StepType, StrategyConfig, WaveStrategy,
    WorkflowStatus,
};
use armada_state::WorkflowStore;

use common::{Harness, hosts, request};

fn rolling() -> StrategyConfig {
    StrategyConfig::Rolling(RollingConfig {
        wave_strategy: WaveStrategy::FixedSize { size: 2 },
        wave_interval_secs: 0,
        max_retries: 0,
        ..Default::default()
    })
}

#[tokio::test(start_paused = true)]
async fn reopened_store_keeps_history_and_pending_work() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("workflows.redb");

    let (completed, failed, pending) = {
        let h = Harness::with_store(
            OrchestratorConfig::default(),
            WorkflowStore::open(&path).unwrap(),
        )
        .await;
        h.broker
            .fail(Some("db-001"), Some(StepType::Deploy), None)
            .await;
        let completed = h.create(request("api", hosts("web", 4), rolling())).await;
        let failed = h.create(request("db", hosts("db", 2), rolling())).await;
        let pending = h.create(request("cache", hosts("cache", 2), rolling())).await;

        assert_eq!(h.run(&completed.id).await.status, WorkflowStatus::Completed);
        assert_eq!(h.run(&failed.id).await.status, WorkflowStatus::Failed);
        h.orch.shutdown().await;
        (completed.id, failed.id, pending.id)
    };

    let h = Harness::with_store(
        OrchestratorConfig::default(),
        WorkflowStore::open(&path).unwrap(),
    )
    .await;
    let done = h.workflow(&completed).await;
    assert_eq!(done.status, WorkflowStatus::Completed);
    assert!(done.phases.iter().all(|p| p.status == PhaseStatus::Completed));
    assert_eq!(done.progress, 100);
    let history: Vec<_> = h
        .orch
        .transitions(&completed)
        .unwrap()
        .into_iter()
        .map(|t| t.to)
        .collect();
    assert_eq!(history, vec![WorkflowStatus::Running, WorkflowStatus::Completed]);
    assert_eq!(h.status(&failed).await, WorkflowStatus::Failed);

    let stats = h.orch.get_statistics(None).unwrap();
    assert_eq!(stats.total, 3);
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.failed, 1);

    // Created before the restart, runnable after it.
    assert_eq!(h.status(&pending).await, WorkflowStatus::Created);
    assert_eq!(h.run(&pending).await.status, WorkflowStatus::Completed);
    assert_eq!(h.broker.hosts_for(StepType::Deploy).await.len(), 2);
}
