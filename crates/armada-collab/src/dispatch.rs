//! Command dispatch through the message broker.

use async_trait::async_trait;

use armada_core::{CommandReply, DeploymentCommand};

use crate::error::CollabResult;

/// Sends commands to host agents and returns their replies.
///
/// Delivery is at-least-once: a host may see the same command twice and
/// must deduplicate on `idempotency_key` + `attempt`.
#[async_trait]
pub trait CommandDispatcher: Send + Sync {
    async fn publish(
        &self,
        command: &DeploymentCommand,
        routing_key: &str,
    ) -> CollabResult<CommandReply>;

    /// Publish several commands under one routing key. Replies are in
    /// command order.
    async fn publish_batch(
        &self,
        commands: &[DeploymentCommand],
        routing_key: &str,
    ) -> CollabResult<Vec<CommandReply>>;
}
