//! Orchestrator configuration (`armada.toml`).
//!
//! ```toml
//! max_concurrent_workflows = 10
//! max_queued_workflows = 50
//! lock_ttl_secs = 300
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ValidationError, ValidationResult};

const HOUR_SECS: u64 = 3_600;
const DAY_SECS: u64 = 24 * HOUR_SECS;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Hard cap on simultaneously running workflows.
    pub max_concurrent_workflows: usize,
    /// Start requests queued beyond the running cap.
    pub max_queued_workflows: usize,
    pub lock_ttl_secs: u64,
    /// Bounded wait when acquiring a workflow lock.
    pub lock_wait_secs: u64,
    /// Lease renewal period; `0` means a third of the TTL.
    pub lock_renew_interval_secs: u64,
    pub default_workflow_timeout_secs: u64,
    pub monitoring_interval_secs: u64,
    pub cache_ttl_active_secs: u64,
    pub cache_ttl_terminal_secs: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_workflows: 10,
            max_queued_workflows: 50,
            lock_ttl_secs: 300,
            lock_wait_secs: 5,
            lock_renew_interval_secs: 0,
            default_workflow_timeout_secs: 7_200,
            monitoring_interval_secs: 30,
            cache_ttl_active_secs: HOUR_SECS,
            cache_ttl_terminal_secs: DAY_SECS,
        }
    }
}

impl OrchestratorConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&content)?;
        Ok(config)
    }

    pub fn from_toml_str(s: &str) -> anyhow::Result<Self> {
        let config: OrchestratorConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ValidationResult<()> {
        if self.max_concurrent_workflows == 0 {
            return Err(ValidationError::InvalidConfig(
                "max_concurrent_workflows must be at least 1".into(),
            ));
        }
        if self.lock_ttl_secs == 0 {
            return Err(ValidationError::InvalidConfig(
                "lock_ttl_secs must be positive".into(),
            ));
        }
        for (name, ttl) in [
            ("cache_ttl_active_secs", self.cache_ttl_active_secs),
            ("cache_ttl_terminal_secs", self.cache_ttl_terminal_secs),
        ] {
            if !(HOUR_SECS..=DAY_SECS).contains(&ttl) {
                return Err(ValidationError::InvalidConfig(format!(
                    "{name} must be between 1 and 24 hours, got {ttl}s"
                )));
            }
        }
        Ok(())
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }

    pub fn lock_wait(&self) -> Duration {
        Duration::from_secs(self.lock_wait_secs)
    }

    pub fn lock_renew_interval(&self) -> Duration {
        if self.lock_renew_interval_secs > 0 {
            Duration::from_secs(self.lock_renew_interval_secs)
        } else {
            Duration::from_secs((self.lock_ttl_secs / 3).max(1))
        }
    }

    pub fn cache_ttl(&self, terminal: bool) -> Duration {
        if terminal {
            Duration::from_secs(self.cache_ttl_terminal_secs)
        } else {
            Duration::from_secs(self.cache_ttl_active_secs)
        }
    }
}
