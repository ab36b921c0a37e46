//! Rollout requests as submitted by callers.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ValidationError, ValidationResult};
use crate::model::{RollbackConfig, TargetHost};
use crate::strategy::StrategyConfig;

/// Request to create a workflow.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CreateWorkflowRequest {
    pub service: String,
    pub version: String,
    #[serde(default)]
    pub previous_version: Option<String>,
    pub package: String,
    pub hosts: Vec<TargetHost>,
    #[serde(default)]
    pub strategy: StrategyConfig,
    #[serde(default)]
    pub rollback: Option<RollbackConfig>,
    /// Forward-compatible custom fields; never read for core behavior.
    #[serde(default)]
    pub configuration: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub requested_by: Option<String>,
}

impl CreateWorkflowRequest {
    pub fn new(service: &str, version: &str, hosts: Vec<TargetHost>, strategy: StrategyConfig) -> Self {
        Self {
            service: service.to_string(),
            version: version.to_string(),
            previous_version: None,
            package: format!("{service}-{version}"),
            hosts,
            strategy,
            rollback: None,
            configuration: BTreeMap::new(),
            timeout_secs: None,
            requested_by: None,
        }
    }

    /// Read a request from a `.toml` or `.json` file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let request = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&content)?,
            _ => toml::from_str(&content)?,
        };
        Ok(request)
    }

    /// Checks that do not depend on the strategy.
    pub fn validate(&self) -> ValidationResult<()> {
        if self.service.trim().is_empty() {
            return Err(ValidationError::MissingField("service"));
        }
        if self.version.trim().is_empty() {
            return Err(ValidationError::MissingField("version"));
        }
        if self.package.trim().is_empty() {
            return Err(ValidationError::MissingField("package"));
        }
        if self.hosts.is_empty() {
            return Err(ValidationError::NoTargets);
        }
        let mut seen = HashSet::new();
        for host in &self.hosts {
            if !seen.insert(host.id.as_str()) {
                return Err(ValidationError::DuplicateHost(host.id.clone()));
            }
        }
        if let Some(rollback) = &self.rollback {
            for cond in &rollback.conditions {
                if cond.threshold.is_nan() || cond.threshold < 0.0 {
                    return Err(ValidationError::InvalidConfig(format!(
                        "rollback threshold for {} must be non-negative",
                        cond.trigger
                    )));
                }
            }
        }
        Ok(())
    }
}
