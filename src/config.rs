use serde::{Deserialize, Serialize};

use crate::{DeployError, ExecutionMode, RetryPolicy};

/// Knobs for a deployment run, usually read from a JSON settings file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub mode: ExecutionMode,
    /// Parallel mode cap; `None` lets every eligible item run at once.
    pub concurrency: Option<usize>,
    pub include_dev_dependencies: bool,
    /// Route each item through the retry coordinator.
    pub use_retry: bool,
    pub retry: RetryPolicy,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::Sequential,
            concurrency: None,
            include_dev_dependencies: false,
            use_retry: true,
            retry: RetryPolicy::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn from_json_str(json: &str) -> Result<Self, DeployError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), DeployError> {
        if self.concurrency == Some(0) {
            return Err(DeployError::InvalidConfig("concurrency must be at least 1".into()));
        }
        let retry = &self.retry;
        if retry.max_attempts == 0 {
            return Err(DeployError::InvalidConfig("retry.max_attempts must be at least 1".into()));
        }
        if !(retry.multiplier >= 1.0) {
            return Err(DeployError::InvalidConfig(format!(
                "retry.multiplier must be >= 1.0, got {}",
                retry.multiplier
            )));
        }
        if retry.max_delay_ms < retry.base_delay_ms {
            return Err(DeployError::InvalidConfig(format!(
                "retry.max_delay_ms ({}) is below retry.base_delay_ms ({})",
                retry.max_delay_ms, retry.base_delay_ms
            )));
        }
        Ok(())
    }
}
