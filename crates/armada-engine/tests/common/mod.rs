//! Shared harness: an orchestrator wired to in-memory collaborators.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use armada_collab::memory::{
    MemoryBroker, MemoryKeyValueStore, MemoryTrafficController, StaticMetricsFeed,
};
use armada_collab::metrics::names;
use armada_core::{
    CreateWorkflowRequest, OrchestratorConfig, StrategyConfig, TargetHost, Workflow,
    WorkflowStatus,
};
use armada_engine::{Collaborators, Orchestrator};
use armada_state::WorkflowStore;
use armada_strategy::StrategyRegistry;

/// Far beyond any scenario's virtual runtime.
pub const RUN_LIMIT: Duration = Duration::from_secs(6 * 3_600);

pub struct Harness {
    pub orch: Orchestrator,
    pub broker: Arc<MemoryBroker>,
    pub traffic: Arc<MemoryTrafficController>,
    pub metrics: Arc<StaticMetricsFeed>,
    pub kv: Arc<MemoryKeyValueStore>,
}

impl Harness {
    /// Hosts report healthy unless a test says otherwise.
    pub async fn new(config: OrchestratorConfig) -> Self {
        Self::with_store(config, WorkflowStore::open_in_memory().unwrap()).await
    }

    pub async fn with_store(config: OrchestratorConfig, store: WorkflowStore) -> Self {
        let broker = Arc::new(MemoryBroker::new());
        let traffic = Arc::new(MemoryTrafficController::new());
        let metrics = Arc::new(StaticMetricsFeed::new());
        let kv = Arc::new(MemoryKeyValueStore::new());
        metrics.set_gauge(names::HEALTH_STATUS, None, 1.0).await;

        let orch = Orchestrator::new(
            config,
            StrategyRegistry::with_defaults(),
            store,
            Collaborators {
                dispatcher: broker.clone(),
                traffic: traffic.clone(),
                metrics: metrics.clone(),
                kv: kv.clone(),
            },
        );
        Self {
            orch,
            broker,
            traffic,
            metrics,
            kv,
        }
    }

    pub async fn standard() -> Self {
        Self::new(OrchestratorConfig::default()).await
    }

    pub async fn create(&self, request: CreateWorkflowRequest) -> Workflow {
        self.orch.create_workflow(request).await.unwrap()
    }

    /// Start and wait for the terminal status.
    pub async fn run(&self, id: &str) -> Workflow {
        assert!(self.orch.start_workflow(id).await, "start rejected");
        self.finish(id).await
    }

    pub async fn finish(&self, id: &str) -> Workflow {
        let status = self
            .orch
            .wait_for_completion(id, RUN_LIMIT)
            .await
            .unwrap()
            .expect("workflow did not finish");
        assert!(status.is_terminal());
        self.workflow(id).await
    }

    pub async fn workflow(&self, id: &str) -> Workflow {
        self.orch.get_workflow(id).await.unwrap().unwrap()
    }

    pub async fn status(&self, id: &str) -> WorkflowStatus {
        self.workflow(id).await.status
    }

    /// Poll (in virtual time) until `service` routes to `pool`.
    pub async fn wait_for_route(&self, service: &str, pool: &str) {
        for _ in 0..3_600 {
            if self
                .traffic
                .current_route(service)
                .await
                .is_some_and(|r| r.pool == pool && r.percentage > 0)
            {
                return;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        panic!("{service} never routed to {pool}");
    }
}

pub fn hosts(prefix: &str, n: usize) -> Vec<TargetHost> {
    (0..n).map(|i| TargetHost::new(format!("{prefix}-{i:03}"))).collect()
}

pub fn request(service: &str, hosts: Vec<TargetHost>, strategy: StrategyConfig) -> CreateWorkflowRequest {
    let mut request = CreateWorkflowRequest::new(service, "2.0.0", hosts, strategy);
    request.previous_version = Some("1.9.0".into());
    request
}
