//! Load-balancer control for blue-green and canary traffic steps.

use async_trait::async_trait;

use armada_core::TrafficRoute;

use crate::error::CollabResult;

#[async_trait]
pub trait TrafficController: Send + Sync {
    async fn add_to_pool(&self, pool: &str, host: &str) -> CollabResult<()>;

    async fn remove_from_pool(&self, pool: &str, host: &str) -> CollabResult<()>;

    /// Route `route.percentage` of the service's traffic to `route.pool`.
    async fn switch_traffic(&self, service: &str, route: &TrafficRoute) -> CollabResult<()>;

    /// Ask the balancer whether a pool member passes its health check.
    async fn health_check(&self, pool: &str, host: &str) -> CollabResult<bool>;
}
