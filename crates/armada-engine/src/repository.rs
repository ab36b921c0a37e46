//! Workflow repository — the store plus its snapshot cache.
//!
//! Every status change goes through [`WorkflowRepository::transition`] so
//! the transition log and the persisted record never disagree.

use tracing::debug;

use armada_core::{Phase, Workflow, WorkflowStatus};
use armada_state::{TransitionRecord, WorkflowFilter, WorkflowStore};

use crate::cache::WorkflowCache;
use crate::error::EngineResult;

#[derive(Clone)]
pub struct WorkflowRepository {
    store: WorkflowStore,
    cache: WorkflowCache,
}

impl WorkflowRepository {
    pub fn new(store: WorkflowStore, cache: WorkflowCache) -> Self {
        Self { store, cache }
    }

    pub async fn save(&self, workflow: &Workflow) -> EngineResult<()> {
        self.store.put_workflow(workflow)?;
        self.cache.put_workflow(workflow).await;
        Ok(())
    }

    /// Apply a status change, log it, and persist. `false` (nothing
    /// written) when the state machine rejects the move.
    pub async fn transition(
        &self,
        workflow: &mut Workflow,
        next: WorkflowStatus,
        reason: Option<&str>,
    ) -> EngineResult<bool> {
        let from = workflow.status;
        if !workflow.transition(next) {
            return Ok(false);
        }
        let mut record = TransitionRecord::new(&workflow.id, from, next);
        if let Some(reason) = reason {
            record = record.with_reason(reason);
        }
        self.store.record_transition(&record)?;
        self.save(workflow).await?;
        Ok(true)
    }

    pub async fn save_phase(&self, workflow: &Workflow, phase: &Phase) -> EngineResult<()> {
        self.save(workflow).await?;
        self.cache.put_phase(workflow, phase).await;
        Ok(())
    }

    /// Cache first, then the store.
    pub async fn load(&self, id: &str) -> EngineResult<Option<Workflow>> {
        if let Some(hit) = self.cache.get_workflow(id).await {
            debug!(workflow = %id, "cache hit");
            return Ok(Some(hit));
        }
        let found = self.store.get_workflow(id)?;
        if let Some(workflow) = &found {
            self.cache.put_workflow(workflow).await;
        }
        Ok(found)
    }

    pub fn list(&self, filter: &WorkflowFilter) -> EngineResult<Vec<Workflow>> {
        Ok(self.store.list_workflows(filter)?)
    }

    pub fn transitions(&self, id: &str) -> EngineResult<Vec<TransitionRecord>> {
        Ok(self.store.list_transitions(id)?)
    }

    pub async fn delete(&self, id: &str) -> EngineResult<bool> {
        let removed = self.store.delete_workflow(id)?;
        self.cache.invalidate(id).await;
        Ok(removed)
    }
}
