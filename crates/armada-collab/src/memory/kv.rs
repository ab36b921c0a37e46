use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::error::{CollabError, CollabResult};
use crate::kv::{KeyValueStore, LockLease};

const LOCK_POLL: Duration = Duration::from_millis(100);

struct Entry {
    value: String,
    expires_at: Instant,
}

struct Held {
    token: String,
    expires_at: Instant,
}

#[derive(Default)]
struct Inner {
    values: HashMap<String, Entry>,
    locks: HashMap<String, Held>,
}

/// Key/value store with TTL expiry and token-checked leases.
#[derive(Default)]
pub struct MemoryKeyValueStore {
    inner: Mutex<Inner>,
}

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop a lock regardless of holder, as if its lease expired.
    pub async fn expire_lock(&self, key: &str) {
        self.inner.lock().await.locks.remove(key);
    }

    pub async fn is_locked(&self, key: &str) -> bool {
        let inner = self.inner.lock().await;
        inner
            .locks
            .get(key)
            .is_some_and(|held| held.expires_at > Instant::now())
    }

    async fn try_acquire(&self, key: &str, ttl: Duration) -> Option<LockLease> {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        if let Some(held) = inner.locks.get(key)
            && held.expires_at > now
        {
            return None;
        }
        let token = uuid::Uuid::new_v4().to_string();
        inner.locks.insert(
            key.to_string(),
            Held {
                token: token.clone(),
                expires_at: now + ttl,
            },
        );
        Some(LockLease {
            key: key.to_string(),
            token,
            ttl,
        })
    }
}

/// Translate a `*`/`?` glob into an anchored regex.
fn glob_to_regex(pattern: &str) -> CollabResult<Regex> {
    let escaped = regex::escape(pattern)
        .replace(r"\*", ".*")
        .replace(r"\?", ".");
    Regex::new(&format!("^{escaped}$")).map_err(|e| CollabError::Rejected(e.to_string()))
}

#[async_trait]
impl KeyValueStore for MemoryKeyValueStore {
    async fn acquire_lock(
        &self,
        key: &str,
        ttl: Duration,
        timeout: Duration,
    ) -> CollabResult<Option<LockLease>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(lease) = self.try_acquire(key, ttl).await {
                debug!(key, "lock acquired");
                return Ok(Some(lease));
            }
            let now = Instant::now();
            if now >= deadline {
                debug!(key, "lock wait expired");
                return Ok(None);
            }
            tokio::time::sleep(LOCK_POLL.min(deadline - now)).await;
        }
    }

    async fn extend_lock(&self, lease: &LockLease, ttl: Duration) -> CollabResult<bool> {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        match inner.locks.get_mut(&lease.key) {
            Some(held) if held.token == lease.token && held.expires_at > now => {
                held.expires_at = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_lock(&self, lease: &LockLease) -> CollabResult<bool> {
        let mut inner = self.inner.lock().await;
        let owned = inner
            .locks
            .get(&lease.key)
            .is_some_and(|held| held.token == lease.token && held.expires_at > Instant::now());
        if owned {
            inner.locks.remove(&lease.key);
        }
        Ok(owned)
    }

    async fn get(&self, key: &str) -> CollabResult<Option<String>> {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        match inner.values.get(key) {
            Some(entry) if entry.expires_at > now => Ok(Some(entry.value.clone())),
            Some(_) => {
                inner.values.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> CollabResult<()> {
        let mut inner = self.inner.lock().await;
        inner.values.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn delete_by_pattern(&self, pattern: &str) -> CollabResult<u64> {
        let re = glob_to_regex(pattern)?;
        let mut inner = self.inner.lock().await;
        let before = inner.values.len();
        inner.values.retain(|key, _| !re.is_match(key));
        Ok((before - inner.values.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn lock_is_exclusive_until_released() {
        let store = MemoryKeyValueStore::new();
        let ttl = Duration::from_secs(30);
        let lease = store
            .acquire_lock("lock:workflow:a", ttl, Duration::ZERO)
            .await
            .unwrap()
            .unwrap();

        let second = store
            .acquire_lock("lock:workflow:a", ttl, Duration::from_secs(1))
            .await
            .unwrap();
        assert!(second.is_none());

        assert!(store.release_lock(&lease).await.unwrap());
        assert!(!store.release_lock(&lease).await.unwrap());
        assert!(
            store
                .acquire_lock("lock:workflow:a", ttl, Duration::ZERO)
                .await
                .unwrap()
                .is_some()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn expired_lease_cannot_be_extended() {
        let store = MemoryKeyValueStore::new();
        let lease = store
            .acquire_lock("k", Duration::from_secs(5), Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(store.extend_lock(&lease, Duration::from_secs(5)).await.unwrap());
        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(!store.extend_lock(&lease, Duration::from_secs(5)).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn waiter_gets_lock_after_expiry() {
        let store = MemoryKeyValueStore::new();
        store
            .acquire_lock("k", Duration::from_secs(2), Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        let lease = store
            .acquire_lock("k", Duration::from_secs(2), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(lease.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn values_expire_and_patterns_delete() {
        let store = MemoryKeyValueStore::new();
        let hour = Duration::from_secs(3_600);
        store.set("workflow:a", "{}", hour).await.unwrap();
        store.set("workflow:a:phase:p1", "{}", hour).await.unwrap();
        store.set("workflow:b", "{}", Duration::from_secs(1)).await.unwrap();

        assert_eq!(store.delete_by_pattern("workflow:a*").await.unwrap(), 2);
        assert!(store.get("workflow:a").await.unwrap().is_none());

        assert!(store.get("workflow:b").await.unwrap().is_some());
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(store.get("workflow:b").await.unwrap().is_none());
    }

    #[test]
    fn glob_escapes_regex_metacharacters() {
        let re = glob_to_regex("workflow:a.b*").unwrap();
        assert!(re.is_match("workflow:a.b:phase:x"));
        assert!(!re.is_match("workflow:aXb"));
    }
}
