//! Command schema — what the orchestrator sends to hosts and to the
//! traffic controller.
//!
//! There is one canonical [`DeploymentCommand`]; its `schema_version`
//! field is bumped when the shape changes. Delivery is at-least-once, so
//! hosts deduplicate on `idempotency_key` + `attempt`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::model::{HostId, StepType};

/// Current command schema version.
pub const COMMAND_SCHEMA_VERSION: u32 = 1;

/// A command dispatched to a host agent through the broker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeploymentCommand {
    pub schema_version: u32,
    /// `{workflow_id}/{step_id}`; stable across redeliveries of one attempt.
    pub idempotency_key: String,
    pub workflow_id: String,
    pub step_id: String,
    pub action: StepType,
    pub service: String,
    pub version: String,
    pub package: String,
    pub host: Option<HostId>,
    pub attempt: u32,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

impl DeploymentCommand {
    pub fn new(
        workflow_id: &str,
        step_id: &str,
        action: StepType,
        service: &str,
        version: &str,
        package: &str,
        host: Option<&str>,
    ) -> Self {
        Self {
            schema_version: COMMAND_SCHEMA_VERSION,
            idempotency_key: format!("{workflow_id}/{step_id}"),
            workflow_id: workflow_id.to_string(),
            step_id: step_id.to_string(),
            action,
            service: service.to_string(),
            version: version.to_string(),
            package: package.to_string(),
            host: host.map(str::to_string),
            attempt: 0,
            parameters: BTreeMap::new(),
        }
    }

    pub fn with_param(mut self, key: &str, value: impl Into<String>) -> Self {
        self.parameters.insert(key.to_string(), value.into());
        self
    }

    /// Broker routing key: host-scoped commands go to the host's queue,
    /// service-scoped ones to the service exchange.
    pub fn routing_key(&self) -> String {
        match &self.host {
            Some(host) => format!("host.{host}"),
            None => format!("service.{}", self.service),
        }
    }
}

/// Reply from a host agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct CommandReply {
    pub success: bool,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl CommandReply {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: Some(output.into()),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: None,
            error: Some(error.into()),
        }
    }
}

/// How split traffic is assigned to the target pool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SplitMethod {
    #[default]
    Percentage,
    Header {
        name: String,
        value: String,
    },
    User {
        cohort: String,
    },
    Geographic {
        regions: Vec<String>,
    },
}

/// A routing change requested from the load balancer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrafficRoute {
    /// Pool receiving `percentage` of the service's traffic.
    pub pool: String,
    pub percentage: u8,
    #[serde(default)]
    pub method: SplitMethod,
    #[serde(default)]
    pub sticky_sessions: bool,
}

impl TrafficRoute {
    pub fn all_to(pool: &str) -> Self {
        Self {
            pool: pool.to_string(),
            percentage: 100,
            method: SplitMethod::Percentage,
            sticky_sessions: false,
        }
    }
}

/// Load-balancer action carried by a `TrafficSwitch` step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TrafficAction {
    AddToPool { pool: String, host: HostId },
    RemoveFromPool { pool: String, host: HostId },
    Switch { route: TrafficRoute },
    PoolHealthCheck { pool: String, host: HostId },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routing_keys() {
        let cmd = DeploymentCommand::new(
            "wf-1",
            "phase-01-wave-1/s000",
            StepType::Deploy,
            "api",
            "2.0.0",
            "api-2.0.0.tar.gz",
            Some("web-01"),
        );
        assert_eq!(cmd.routing_key(), "host.web-01");
        assert_eq!(cmd.idempotency_key, "wf-1/phase-01-wave-1/s000");
        assert_eq!(cmd.schema_version, COMMAND_SCHEMA_VERSION);

        let svc = DeploymentCommand::new("wf-1", "s", StepType::Cleanup, "api", "2.0.0", "p", None);
        assert_eq!(svc.routing_key(), "service.api");
    }

    #[test]
    fn traffic_action_serializes_tagged() {
        let action = TrafficAction::Switch {
            route: TrafficRoute::all_to("api-green"),
        };
        let json = serde_json::to_value(&action).unwrap();
        assert_eq!(json["type"], "switch");
        assert_eq!(json["route"]["percentage"], 100);
    }
}
