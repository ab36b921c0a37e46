//! Workflow mutation lock: acquisition with a bounded wait and a renewal
//! task that keeps the lease alive while an executor runs.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use armada_collab::kv::workflow_lock_key;
use armada_collab::{KeyValueStore, LockLease};

use crate::control::{Control, signal};
use crate::error::{EngineError, EngineResult};

pub async fn acquire(
    kv: &dyn KeyValueStore,
    workflow_id: &str,
    ttl: Duration,
    wait: Duration,
) -> EngineResult<LockLease> {
    let key = workflow_lock_key(workflow_id);
    match kv.acquire_lock(&key, ttl, wait).await? {
        Some(lease) => {
            debug!(workflow = %workflow_id, ttl_secs = ttl.as_secs(), "workflow lock acquired");
            Ok(lease)
        }
        None => Err(EngineError::Lock(format!(
            "workflow {workflow_id} is locked by another actor"
        ))),
    }
}

pub async fn release(kv: &dyn KeyValueStore, lease: &LockLease) {
    match kv.release_lock(lease).await {
        Ok(true) => debug!(key = %lease.key, "workflow lock released"),
        Ok(false) => warn!(key = %lease.key, "workflow lock already gone at release"),
        Err(e) => warn!(key = %lease.key, error = %e, "failed to release workflow lock"),
    }
}

/// Extend the lease every `interval`. The first failed extension posts
/// `Control::LockLost` and ends the task.
pub fn spawn_renewal(
    kv: Arc<dyn KeyValueStore>,
    lease: LockLease,
    interval: Duration,
    control: Arc<watch::Sender<Control>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            match kv.extend_lock(&lease, lease.ttl).await {
                Ok(true) => debug!(key = %lease.key, "workflow lock renewed"),
                Ok(false) => {
                    error!(key = %lease.key, "workflow lock lost");
                    signal(&control, Control::LockLost);
                    break;
                }
                Err(e) => {
                    error!(key = %lease.key, error = %e, "workflow lock renewal failed");
                    signal(&control, Control::LockLost);
                    break;
                }
            }
        }
        info!(key = %lease.key, "lock renewal stopped");
    })
}
