use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use armada_core::{CommandReply, DeploymentCommand, StepType};

use crate::dispatch::CommandDispatcher;
use crate::error::{CollabError, CollabResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Fail,
    Hang,
    Unavailable,
}

#[derive(Debug, Clone)]
struct Rule {
    host: Option<String>,
    action: Option<StepType>,
    /// `None` applies forever.
    remaining: Option<u32>,
    outcome: Outcome,
}

impl Rule {
    fn matches(&self, command: &DeploymentCommand) -> bool {
        let host_ok = match &self.host {
            Some(host) => command.host.as_deref() == Some(host.as_str()),
            None => true,
        };
        let action_ok = self.action.is_none_or(|a| a == command.action);
        host_ok && action_ok && self.remaining != Some(0)
    }
}

/// Broker stand-in that records every command and answers from scripted
/// rules; commands no rule matches succeed.
#[derive(Default)]
pub struct MemoryBroker {
    published: Mutex<Vec<(DeploymentCommand, String)>>,
    rules: Mutex<Vec<Rule>>,
    latency: Duration,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every reply by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Reply with a failure to matching commands, `times` times (always when `None`).
    pub async fn fail(&self, host: Option<&str>, action: Option<StepType>, times: Option<u32>) {
        self.add_rule(host, action, times, Outcome::Fail).await;
    }

    /// Never reply to matching commands.
    pub async fn hang(&self, host: Option<&str>, action: Option<StepType>) {
        self.add_rule(host, action, None, Outcome::Hang).await;
    }

    /// Return a transport error for matching commands.
    pub async fn disconnect(&self, host: Option<&str>, action: Option<StepType>, times: Option<u32>) {
        self.add_rule(host, action, times, Outcome::Unavailable).await;
    }

    pub async fn clear_rules(&self) {
        self.rules.lock().await.clear();
    }

    async fn add_rule(
        &self,
        host: Option<&str>,
        action: Option<StepType>,
        times: Option<u32>,
        outcome: Outcome,
    ) {
        self.rules.lock().await.push(Rule {
            host: host.map(str::to_string),
            action,
            remaining: times,
            outcome,
        });
    }

    /// Every command published so far, in order.
    pub async fn published(&self) -> Vec<DeploymentCommand> {
        self.published
            .lock()
            .await
            .iter()
            .map(|(cmd, _)| cmd.clone())
            .collect()
    }

    pub async fn routing_keys(&self) -> Vec<String> {
        self.published
            .lock()
            .await
            .iter()
            .map(|(_, key)| key.clone())
            .collect()
    }

    /// Distinct hosts that received a command of `action`.
    pub async fn hosts_for(&self, action: StepType) -> Vec<String> {
        let mut hosts: Vec<String> = Vec::new();
        for (cmd, _) in self.published.lock().await.iter() {
            if cmd.action == action
                && let Some(host) = &cmd.host
                && !hosts.contains(host)
            {
                hosts.push(host.clone());
            }
        }
        hosts
    }

    pub async fn count(&self, host: Option<&str>, action: StepType) -> usize {
        self.published
            .lock()
            .await
            .iter()
            .filter(|(cmd, _)| cmd.action == action && cmd.host.as_deref() == host)
            .count()
    }

    async fn outcome_for(&self, command: &DeploymentCommand) -> Option<Outcome> {
        let mut rules = self.rules.lock().await;
        let rule = rules.iter_mut().find(|r| r.matches(command))?;
        if let Some(n) = rule.remaining.as_mut() {
            *n -= 1;
        }
        Some(rule.outcome)
    }
}

#[async_trait]
impl CommandDispatcher for MemoryBroker {
    async fn publish(
        &self,
        command: &DeploymentCommand,
        routing_key: &str,
    ) -> CollabResult<CommandReply> {
        debug!(
            routing_key,
            step = %command.step_id,
            action = %command.action,
            attempt = command.attempt,
            "command published"
        );
        self.published
            .lock()
            .await
            .push((command.clone(), routing_key.to_string()));

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        match self.outcome_for(command).await {
            None => Ok(CommandReply::ok(format!("{} ok", command.action))),
            Some(Outcome::Fail) => Ok(CommandReply::failed(format!(
                "{} failed on {}",
                command.action,
                command.host.as_deref().unwrap_or("service")
            ))),
            Some(Outcome::Unavailable) => {
                Err(CollabError::Unavailable("broker connection lost".into()))
            }
            Some(Outcome::Hang) => {
                std::future::pending::<()>().await;
                Err(CollabError::Timeout(Duration::MAX))
            }
        }
    }

    async fn publish_batch(
        &self,
        commands: &[DeploymentCommand],
        routing_key: &str,
    ) -> CollabResult<Vec<CommandReply>> {
        let mut replies = Vec::with_capacity(commands.len());
        for command in commands {
            replies.push(self.publish(command, routing_key).await?);
        }
        Ok(replies)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deploy(host: &str) -> DeploymentCommand {
        DeploymentCommand::new("wf", "s", StepType::Deploy, "api", "2", "pkg", Some(host))
    }

    #[tokio::test]
    async fn scripted_failures_run_out() {
        let broker = MemoryBroker::new();
        broker.fail(Some("web-01"), Some(StepType::Deploy), Some(2)).await;

        let cmd = deploy("web-01");
        assert!(!broker.publish(&cmd, "host.web-01").await.unwrap().success);
        assert!(!broker.publish(&cmd, "host.web-01").await.unwrap().success);
        assert!(broker.publish(&cmd, "host.web-01").await.unwrap().success);
        assert!(broker.publish(&deploy("web-02"), "host.web-02").await.unwrap().success);

        assert_eq!(broker.count(Some("web-01"), StepType::Deploy).await, 3);
        assert_eq!(broker.hosts_for(StepType::Deploy).await, vec!["web-01", "web-02"]);
    }

    #[tokio::test]
    async fn disconnect_surfaces_transport_error() {
        let broker = MemoryBroker::new();
        broker.disconnect(None, None, Some(1)).await;
        let err = broker.publish(&deploy("web-01"), "host.web-01").await;
        assert!(matches!(err, Err(CollabError::Unavailable(_))));
        assert!(broker.publish(&deploy("web-01"), "host.web-01").await.is_ok());
    }
}
