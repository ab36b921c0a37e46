//! Workflow and phase snapshots in the key/value cache.
//!
//! The cache is a read accelerator only. Write failures are logged and
//! dropped; the repository stays the source of truth.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use armada_collab::kv::{
    get_json, phase_cache_key, set_json, workflow_cache_key, workflow_cache_patterns,
};
use armada_collab::KeyValueStore;
use armada_core::{OrchestratorConfig, Phase, Workflow};

#[derive(Clone)]
pub struct WorkflowCache {
    kv: Arc<dyn KeyValueStore>,
    active_ttl: Duration,
    terminal_ttl: Duration,
}

impl WorkflowCache {
    pub fn new(kv: Arc<dyn KeyValueStore>, config: &OrchestratorConfig) -> Self {
        Self {
            kv,
            active_ttl: config.cache_ttl(false),
            terminal_ttl: config.cache_ttl(true),
        }
    }

    fn ttl_for(&self, workflow: &Workflow) -> Duration {
        if workflow.status.is_terminal() {
            self.terminal_ttl
        } else {
            self.active_ttl
        }
    }

    pub async fn put_workflow(&self, workflow: &Workflow) {
        let key = workflow_cache_key(&workflow.id);
        if let Err(e) = set_json(self.kv.as_ref(), &key, workflow, self.ttl_for(workflow)).await {
            warn!(workflow = %workflow.id, error = %e, "failed to cache workflow snapshot");
        }
    }

    pub async fn put_phase(&self, workflow: &Workflow, phase: &Phase) {
        let key = phase_cache_key(&workflow.id, &phase.id);
        if let Err(e) = set_json(self.kv.as_ref(), &key, phase, self.ttl_for(workflow)).await {
            warn!(workflow = %workflow.id, phase = %phase.name, error = %e, "failed to cache phase snapshot");
        }
    }

    pub async fn get_workflow(&self, id: &str) -> Option<Workflow> {
        match get_json(self.kv.as_ref(), &workflow_cache_key(id)).await {
            Ok(hit) => hit,
            Err(e) => {
                warn!(workflow = %id, error = %e, "cache read failed");
                None
            }
        }
    }

    pub async fn get_phase(&self, workflow_id: &str, phase_id: &str) -> Option<Phase> {
        get_json(self.kv.as_ref(), &phase_cache_key(workflow_id, phase_id))
            .await
            .ok()
            .flatten()
    }

    /// Drop the workflow snapshot and every phase snapshot under it.
    pub async fn invalidate(&self, id: &str) -> u64 {
        let mut removed = 0;
        for pattern in workflow_cache_patterns(id) {
            match self.kv.delete_by_pattern(&pattern).await {
                Ok(n) => removed += n,
                Err(e) => warn!(workflow = %id, %pattern, error = %e, "cache invalidation failed"),
            }
        }
        debug!(workflow = %id, keys = removed, "cache invalidated");
        removed
    }
}
