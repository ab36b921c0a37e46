//! Distributed lock and snapshot cache.
//!
//! Key layout:
//!
//! | Key | Value |
//! |---|---|
//! | `lock:workflow:{id}` | lease token of the executor owning the workflow |
//! | `workflow:{id}` | JSON workflow snapshot |
//! | `workflow:{id}:phase:{phase_id}` | JSON phase snapshot |

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{CollabError, CollabResult};

/// A held lock. Only the holder's token can extend or release it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockLease {
    pub key: String,
    pub token: String,
    pub ttl: Duration,
}

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Try to take `key` for `ttl`, waiting at most `timeout` for a current
    /// holder to let go. `None` means the wait expired.
    async fn acquire_lock(
        &self,
        key: &str,
        ttl: Duration,
        timeout: Duration,
    ) -> CollabResult<Option<LockLease>>;

    /// Push the lease expiry out by `ttl`. `false` if the lease was lost.
    async fn extend_lock(&self, lease: &LockLease, ttl: Duration) -> CollabResult<bool>;

    /// `false` if the lease had already expired or changed hands.
    async fn release_lock(&self, lease: &LockLease) -> CollabResult<bool>;

    async fn get(&self, key: &str) -> CollabResult<Option<String>>;

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> CollabResult<()>;

    /// Delete every key matching a glob pattern (`*`, `?`). Returns the count.
    async fn delete_by_pattern(&self, pattern: &str) -> CollabResult<u64>;
}

pub fn workflow_lock_key(workflow_id: &str) -> String {
    format!("lock:workflow:{workflow_id}")
}

pub fn workflow_cache_key(workflow_id: &str) -> String {
    format!("workflow:{workflow_id}")
}

pub fn phase_cache_key(workflow_id: &str, phase_id: &str) -> String {
    format!("workflow:{workflow_id}:phase:{phase_id}")
}

/// Patterns covering the workflow snapshot and all of its phase snapshots,
/// and nothing under a workflow whose id merely starts with `workflow_id`.
pub fn workflow_cache_patterns(workflow_id: &str) -> [String; 2] {
    [
        workflow_cache_key(workflow_id),
        format!("workflow:{workflow_id}:phase:*"),
    ]
}

/// Read and decode a JSON value.
pub async fn get_json<T: DeserializeOwned>(
    store: &dyn KeyValueStore,
    key: &str,
) -> CollabResult<Option<T>> {
    match store.get(key).await? {
        Some(raw) => serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| CollabError::Serialization(e.to_string())),
        None => Ok(None),
    }
}

/// Encode and store a JSON value.
pub async fn set_json<T: Serialize + Sync>(
    store: &dyn KeyValueStore,
    key: &str,
    value: &T,
    ttl: Duration,
) -> CollabResult<()> {
    let raw = serde_json::to_string(value).map_err(|e| CollabError::Serialization(e.to_string()))?;
    store.set(key, &raw, ttl).await
}
