//! WorkflowStore — redb-backed workflow persistence.
//!
//! The store supports both on-disk and in-memory backends (the latter for
//! tests and the daemon's simulation mode).

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use redb::{Database, ReadableDatabase, ReadableTable};
use serde::{Deserialize, Serialize};
use tracing::debug;

use armada_core::{Workflow, WorkflowStatus};

use crate::error::{StateError, StateResult};
use crate::tables::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// One entry of a workflow's status history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransitionRecord {
    pub workflow_id: String,
    pub from: WorkflowStatus,
    pub to: WorkflowStatus,
    pub at: DateTime<Utc>,
    #[serde(default)]
    pub reason: Option<String>,
}

impl TransitionRecord {
    pub fn new(workflow_id: &str, from: WorkflowStatus, to: WorkflowStatus) -> Self {
        Self {
            workflow_id: workflow_id.to_string(),
            from,
            to,
            at: Utc::now(),
            reason: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// Optional constraints for [`WorkflowStore::list_workflows`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkflowFilter {
    pub status: Option<WorkflowStatus>,
    pub service: Option<String>,
    /// Only workflows created at or after this instant.
    pub created_after: Option<DateTime<Utc>>,
}

impl WorkflowFilter {
    fn matches(&self, wf: &Workflow) -> bool {
        self.status.is_none_or(|s| wf.status == s)
            && self.service.as_deref().is_none_or(|s| wf.service == s)
            && self.created_after.is_none_or(|t| wf.created_at >= t)
    }
}

/// Thread-safe workflow repository backed by redb.
#[derive(Clone)]
pub struct WorkflowStore {
    db: Arc<Database>,
}

impl WorkflowStore {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "workflow store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store.
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory workflow store opened");
        Ok(store)
    }

    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        txn.open_table(WORKFLOWS).map_err(map_err!(Table))?;
        txn.open_table(TRANSITIONS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Workflows ──────────────────────────────────────────────────

    /// Insert or replace a workflow.
    pub fn put_workflow(&self, workflow: &Workflow) -> StateResult<()> {
        let value = serde_json::to_vec(workflow).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(WORKFLOWS).map_err(map_err!(Table))?;
            table
                .insert(workflow.id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(workflow = %workflow.id, status = %workflow.status, "workflow stored");
        Ok(())
    }

    pub fn get_workflow(&self, id: &str) -> StateResult<Option<Workflow>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(WORKFLOWS).map_err(map_err!(Table))?;
        match table.get(id).map_err(map_err!(Read))? {
            Some(guard) => {
                let wf: Workflow =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(wf))
            }
            None => Ok(None),
        }
    }

    /// Workflows matching `filter`, oldest first.
    pub fn list_workflows(&self, filter: &WorkflowFilter) -> StateResult<Vec<Workflow>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(WORKFLOWS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let wf: Workflow =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            if filter.matches(&wf) {
                results.push(wf);
            }
        }
        results.sort_by_key(|wf| wf.created_at);
        Ok(results)
    }

    /// Delete a workflow and its transition log. Returns true if it existed.
    pub fn delete_workflow(&self, id: &str) -> StateResult<bool> {
        let prefix = format!("{id}:");
        let history: Vec<String> = {
            let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
            let table = txn.open_table(TRANSITIONS).map_err(map_err!(Table))?;
            let mut keys = Vec::new();
            for entry in table.range(prefix.as_str()..).map_err(map_err!(Read))? {
                let (key, _) = entry.map_err(map_err!(Read))?;
                if !key.value().starts_with(&prefix) {
                    break;
                }
                keys.push(key.value().to_string());
            }
            keys
        };

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(WORKFLOWS).map_err(map_err!(Table))?;
            existed = table.remove(id).map_err(map_err!(Write))?.is_some();
            let mut transitions = txn.open_table(TRANSITIONS).map_err(map_err!(Table))?;
            for key in &history {
                transitions.remove(key.as_str()).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(workflow = %id, existed, transitions = history.len(), "workflow deleted");
        Ok(existed)
    }

    // ── Transitions ────────────────────────────────────────────────

    /// Append a status change to the workflow's history.
    pub fn record_transition(&self, record: &TransitionRecord) -> StateResult<()> {
        let prefix = format!("{}:", record.workflow_id);
        let value = serde_json::to_vec(record).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(TRANSITIONS).map_err(map_err!(Table))?;
            let mut seq = 0u64;
            for entry in table.range(prefix.as_str()..).map_err(map_err!(Read))? {
                let (key, _) = entry.map_err(map_err!(Read))?;
                if !key.value().starts_with(&prefix) {
                    break;
                }
                seq += 1;
            }
            let key = format!("{prefix}{seq:08}");
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// A workflow's status history, oldest first.
    pub fn list_transitions(&self, workflow_id: &str) -> StateResult<Vec<TransitionRecord>> {
        let prefix = format!("{workflow_id}:");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(TRANSITIONS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.range(prefix.as_str()..).map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if !key.value().starts_with(&prefix) {
                break;
            }
            let record: TransitionRecord =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(record);
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use armada_core::{StrategyConfig, TargetHost};

    use super::*;

    fn test_workflow(id: &str, service: &str, status: WorkflowStatus) -> Workflow {
        let mut wf = Workflow::new(
            id.to_string(),
            service,
            "2.0.0",
            &format!("{service}-2.0.0"),
            StrategyConfig::default(),
            vec![TargetHost::new("web-01")],
        );
        wf.previous_version = Some("1.9.0".to_string());
        wf.status = status;
        wf
    }

    #[test]
    fn workflow_put_and_get() {
        let store = WorkflowStore::open_in_memory().unwrap();
        let wf = test_workflow("wf-1", "api", WorkflowStatus::Created);
        store.put_workflow(&wf).unwrap();
        assert_eq!(store.get_workflow("wf-1").unwrap().unwrap(), wf);
        assert!(store.get_workflow("missing").unwrap().is_none());
    }

    #[test]
    fn workflow_update_in_place() {
        let store = WorkflowStore::open_in_memory().unwrap();
        let mut wf = test_workflow("wf-1", "api", WorkflowStatus::Created);
        store.put_workflow(&wf).unwrap();
        wf.status = WorkflowStatus::Running;
        wf.progress = 40;
        store.put_workflow(&wf).unwrap();

        let loaded = store.get_workflow("wf-1").unwrap().unwrap();
        assert_eq!(loaded.status, WorkflowStatus::Running);
        assert_eq!(loaded.progress, 40);
        assert_eq!(store.list_workflows(&WorkflowFilter::default()).unwrap().len(), 1);
    }

    #[test]
    fn list_applies_filter() {
        let store = WorkflowStore::open_in_memory().unwrap();
        store
            .put_workflow(&test_workflow("a", "api", WorkflowStatus::Completed))
            .unwrap();
        store
            .put_workflow(&test_workflow("b", "api", WorkflowStatus::Failed))
            .unwrap();
        store
            .put_workflow(&test_workflow("c", "billing", WorkflowStatus::Completed))
            .unwrap();

        let completed = store
            .list_workflows(&WorkflowFilter {
                status: Some(WorkflowStatus::Completed),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(completed.len(), 2);

        let api = store
            .list_workflows(&WorkflowFilter {
                service: Some("api".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(api.len(), 2);
    }

    #[test]
    fn transitions_are_ordered_per_workflow() {
        let store = WorkflowStore::open_in_memory().unwrap();
        use WorkflowStatus::*;
        store
            .record_transition(&TransitionRecord::new("wf-1", Created, Running))
            .unwrap();
        store
            .record_transition(&TransitionRecord::new("wf-10", Created, Queued))
            .unwrap();
        store
            .record_transition(&TransitionRecord::new("wf-1", Running, Completed).with_reason("done"))
            .unwrap();

        let history = store.list_transitions("wf-1").unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].to, Running);
        assert_eq!(history[1].to, Completed);
        assert_eq!(history[1].reason.as_deref(), Some("done"));
        assert_eq!(store.list_transitions("wf-10").unwrap().len(), 1);
    }

    #[test]
    fn delete_removes_history() {
        let store = WorkflowStore::open_in_memory().unwrap();
        store
            .put_workflow(&test_workflow("wf-1", "api", WorkflowStatus::Completed))
            .unwrap();
        store
            .record_transition(&TransitionRecord::new(
                "wf-1",
                WorkflowStatus::Running,
                WorkflowStatus::Completed,
            ))
            .unwrap();
        assert!(store.delete_workflow("wf-1").unwrap());
        assert!(!store.delete_workflow("wf-1").unwrap());
        assert!(store.list_transitions("wf-1").unwrap().is_empty());
    }

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("armada.redb");
        {
            let store = WorkflowStore::open(&path).unwrap();
            store
                .put_workflow(&test_workflow("wf-1", "api", WorkflowStatus::Completed))
                .unwrap();
        }
        let store = WorkflowStore::open(&path).unwrap();
        let wf = store.get_workflow("wf-1").unwrap().unwrap();
        assert_eq!(wf.status, WorkflowStatus::Completed);
    }
}
