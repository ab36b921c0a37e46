use std::collections::{BTreeMap, BTreeSet, HashSet};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::info;

use armada_core::TrafficRoute;

use crate::error::CollabResult;
use crate::traffic::TrafficController;

/// A change applied to the in-memory balancer.
#[derive(Debug, Clone, PartialEq)]
pub enum TrafficEvent {
    Added { pool: String, host: String },
    Removed { pool: String, host: String },
    Switched { service: String, route: TrafficRoute },
}

#[derive(Default)]
struct Inner {
    pools: BTreeMap<String, BTreeSet<String>>,
    routes: BTreeMap<String, TrafficRoute>,
    unhealthy: HashSet<(String, String)>,
    events: Vec<TrafficEvent>,
}

/// Balancer stand-in: tracks pool membership and the current route per service.
#[derive(Default)]
pub struct MemoryTrafficController {
    inner: Mutex<Inner>,
}

impl MemoryTrafficController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `health_check(pool, host)` report unhealthy.
    pub async fn mark_unhealthy(&self, pool: &str, host: &str) {
        self.inner
            .lock()
            .await
            .unhealthy
            .insert((pool.to_string(), host.to_string()));
    }

    pub async fn current_route(&self, service: &str) -> Option<TrafficRoute> {
        self.inner.lock().await.routes.get(service).cloned()
    }

    pub async fn pool_members(&self, pool: &str) -> Vec<String> {
        self.inner
            .lock()
            .await
            .pools
            .get(pool)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Routes applied to `service`, oldest first.
    pub async fn switches(&self, service: &str) -> Vec<TrafficRoute> {
        self.inner
            .lock()
            .await
            .events
            .iter()
            .filter_map(|e| match e {
                TrafficEvent::Switched { service: s, route } if s == service => {
                    Some(route.clone())
                }
                _ => None,
            })
            .collect()
    }

    pub async fn events(&self) -> Vec<TrafficEvent> {
        self.inner.lock().await.events.clone()
    }
}

#[async_trait]
impl TrafficController for MemoryTrafficController {
    async fn add_to_pool(&self, pool: &str, host: &str) -> CollabResult<()> {
        let mut inner = self.inner.lock().await;
        inner
            .pools
            .entry(pool.to_string())
            .or_default()
            .insert(host.to_string());
        inner.events.push(TrafficEvent::Added {
            pool: pool.to_string(),
            host: host.to_string(),
        });
        Ok(())
    }

    async fn remove_from_pool(&self, pool: &str, host: &str) -> CollabResult<()> {
        let mut inner = self.inner.lock().await;
        if let Some(members) = inner.pools.get_mut(pool) {
            members.remove(host);
        }
        inner.events.push(TrafficEvent::Removed {
            pool: pool.to_string(),
            host: host.to_string(),
        });
        Ok(())
    }

    async fn switch_traffic(&self, service: &str, route: &TrafficRoute) -> CollabResult<()> {
        info!(service, pool = %route.pool, percentage = route.percentage, "traffic switched");
        let mut inner = self.inner.lock().await;
        inner.routes.insert(service.to_string(), route.clone());
        inner.events.push(TrafficEvent::Switched {
            service: service.to_string(),
            route: route.clone(),
        });
        Ok(())
    }

    async fn health_check(&self, pool: &str, host: &str) -> CollabResult<bool> {
        let inner = self.inner.lock().await;
        let member = inner.pools.get(pool).is_some_and(|m| m.contains(host));
        Ok(member && !inner.unhealthy.contains(&(pool.to_string(), host.to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pool_membership_and_routes() {
        let lb = MemoryTrafficController::new();
        lb.add_to_pool("api-green", "web-01").await.unwrap();
        assert!(lb.health_check("api-green", "web-01").await.unwrap());
        assert!(!lb.health_check("api-green", "web-02").await.unwrap());

        lb.mark_unhealthy("api-green", "web-01").await;
        assert!(!lb.health_check("api-green", "web-01").await.unwrap());

        lb.switch_traffic("api", &TrafficRoute::all_to("api-green"))
            .await
            .unwrap();
        lb.switch_traffic("api", &TrafficRoute::all_to("api-blue"))
            .await
            .unwrap();
        assert_eq!(lb.current_route("api").await.unwrap().pool, "api-blue");
        assert_eq!(lb.switches("api").await.len(), 2);

        lb.remove_from_pool("api-green", "web-01").await.unwrap();
        assert!(lb.pool_members("api-green").await.is_empty());
    }
}
