//! Configuration for the orchestrator
//!
//! Defaults, a builder, environment overrides and TOML files.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::chain::DEFAULT_MAX_DEPTH;
use crate::error::{HandoffError, Result};
use crate::registry::HandlerId;

/// Orchestrator configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Maximum number of transfers in one chain
    pub max_depth: usize,

    /// Byte budget of the serialized context
    pub context_budget_bytes: usize,

    /// Per-step handler timeout, in milliseconds
    pub step_timeout_ms: u64,

    /// Retry configuration
    pub retry: RetryConfig,

    /// Number of tasks processed concurrently
    pub worker_pool_size: usize,

    /// Routing thresholds
    pub coordinator: CoordinatorConfig,

    /// Directory of the file session store
    pub session_dir: PathBuf,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_depth: DEFAULT_MAX_DEPTH,
            context_budget_bytes: 16 * 1024,
            step_timeout_ms: 30_000,
            retry: RetryConfig::default(),
            worker_pool_size: 4,
            coordinator: CoordinatorConfig::default(),
            session_dir: PathBuf::from("./sessions"),
        }
    }
}

impl OrchestratorConfig {
    pub fn step_timeout(&self) -> Duration {
        Duration::from_millis(self.step_timeout_ms)
    }

    /// Rejects values the orchestrator cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.max_depth == 0 {
            return Err(HandoffError::configuration("max_depth must be at least 1"));
        }
        if self.context_budget_bytes == 0 {
            return Err(HandoffError::configuration(
                "context_budget_bytes must be positive",
            ));
        }
        if self.step_timeout_ms == 0 {
            return Err(HandoffError::configuration("step_timeout_ms must be positive"));
        }
        if self.worker_pool_size == 0 {
            return Err(HandoffError::configuration(
                "worker_pool_size must be at least 1",
            ));
        }
        self.coordinator.validate()
    }
}

/// Retry configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first failed invocation of a step
    pub max_retries: u32,

    /// Delay before each retry, in milliseconds
    pub backoff_ms: u64,

    /// Double the delay on each further retry
    pub exponential: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 1,
            backoff_ms: 50,
            exponential: false,
        }
    }
}

/// Coordinator thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Complexity below this runs with a single handler
    pub low_threshold: u8,

    /// Complexity up to this runs sequentially; above fans out
    pub high_threshold: u8,

    /// Maximum number of handlers in a fan-out
    pub max_fan_out: usize,

    /// Handler used when no descriptor scores above zero
    pub default_handler: Option<HandlerId>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            low_threshold: 4,
            high_threshold: 7,
            max_fan_out: 3,
            default_handler: None,
        }
    }
}

impl CoordinatorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.low_threshold > self.high_threshold {
            return Err(HandoffError::configuration(format!(
                "low_threshold {} exceeds high_threshold {}",
                self.low_threshold, self.high_threshold
            )));
        }
        if self.max_fan_out == 0 {
            return Err(HandoffError::configuration("max_fan_out must be at least 1"));
        }
        Ok(())
    }
}

/// Configuration builder
pub struct ConfigBuilder {
    config: OrchestratorConfig,
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: OrchestratorConfig::default(),
        }
    }

    pub fn max_depth(mut self, depth: usize) -> Self {
        self.config.max_depth = depth;
        self
    }

    pub fn context_budget(mut self, bytes: usize) -> Self {
        self.config.context_budget_bytes = bytes;
        self
    }

    pub fn step_timeout(mut self, timeout: Duration) -> Self {
        self.config.step_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.config.retry.max_retries = retries;
        self
    }

    pub fn backoff(mut self, delay: Duration) -> Self {
        self.config.retry.backoff_ms = delay.as_millis() as u64;
        self
    }

    pub fn workers(mut self, n: usize) -> Self {
        self.config.worker_pool_size = n;
        self
    }

    pub fn thresholds(mut self, low: u8, high: u8) -> Self {
        self.config.coordinator.low_threshold = low;
        self.config.coordinator.high_threshold = high;
        self
    }

    pub fn max_fan_out(mut self, n: usize) -> Self {
        self.config.coordinator.max_fan_out = n;
        self
    }

    pub fn default_handler(mut self, id: impl Into<HandlerId>) -> Self {
        self.config.coordinator.default_handler = Some(id.into());
        self
    }

    pub fn session_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.session_dir = path.into();
        self
    }

    pub fn build(self) -> OrchestratorConfig {
        self.config
    }
}

/// Load configuration from environment variables
pub fn from_env() -> OrchestratorConfig {
    let mut config = OrchestratorConfig::default();
    apply_env(&mut config, |k| std::env::var(k).ok());
    config
}

/// Overlay `HANDOFF_*` variables read through `lookup` onto `config`.
/// Unparseable values are ignored.
pub fn apply_env(config: &mut OrchestratorConfig, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(depth) = lookup("HANDOFF_MAX_DEPTH").and_then(|v| v.parse().ok()) {
        config.max_depth = depth;
    }

    // Seconds, like the CLI flag.
    if let Some(secs) = lookup("HANDOFF_STEP_TIMEOUT").and_then(|v| v.parse::<u64>().ok()) {
        config.step_timeout_ms = secs.saturating_mul(1000);
    }

    if let Some(bytes) = lookup("HANDOFF_CONTEXT_BUDGET").and_then(|v| v.parse().ok()) {
        config.context_budget_bytes = bytes;
    }

    if let Some(n) = lookup("HANDOFF_WORKERS").and_then(|v| v.parse().ok()) {
        config.worker_pool_size = n;
    }

    if let Some(dir) = lookup("HANDOFF_SESSION_DIR") {
        config.session_dir = PathBuf::from(dir);
    }
}

/// Load configuration from a TOML file
pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<OrchestratorConfig> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path).map_err(|e| {
        HandoffError::configuration(format!("cannot read {}: {}", path.display(), e))
    })?;
    let config: OrchestratorConfig = toml::from_str(&contents)
        .map_err(|e| HandoffError::configuration(format!("invalid config file: {}", e)))?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.max_depth, 5);
        assert_eq!(config.context_budget_bytes, 16384);
        assert_eq!(config.step_timeout(), Duration::from_secs(30));
        assert_eq!(config.retry.max_retries, 1);
        assert_eq!(config.coordinator.max_fan_out, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = ConfigBuilder::new()
            .max_depth(3)
            .context_budget(2048)
            .step_timeout(Duration::from_millis(250))
            .workers(8)
            .thresholds(2, 6)
            .default_handler("general")
            .build();

        assert_eq!(config.max_depth, 3);
        assert_eq!(config.context_budget_bytes, 2048);
        assert_eq!(config.step_timeout_ms, 250);
        assert_eq!(config.worker_pool_size, 8);
        assert_eq!(config.coordinator.low_threshold, 2);
        assert_eq!(
            config.coordinator.default_handler,
            Some(HandlerId::from("general"))
        );
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("HANDOFF_MAX_DEPTH", "7"),
            ("HANDOFF_STEP_TIMEOUT", "2"),
            ("HANDOFF_WORKERS", "not-a-number"),
            ("HANDOFF_SESSION_DIR", "/tmp/handoff"),
        ]
        .into_iter()
        .collect();
        let mut config = OrchestratorConfig::default();
        apply_env(&mut config, |k| vars.get(k).map(|v| v.to_string()));

        assert_eq!(config.max_depth, 7);
        assert_eq!(config.step_timeout_ms, 2000);
        assert_eq!(config.worker_pool_size, 4);
        assert_eq!(config.session_dir, PathBuf::from("/tmp/handoff"));
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: OrchestratorConfig = toml::from_str(
            r#"
            max_depth = 2

            [coordinator]
            high_threshold = 9
            "#,
        )
        .unwrap();
        assert_eq!(config.max_depth, 2);
        assert_eq!(config.coordinator.high_threshold, 9);
        assert_eq!(config.coordinator.low_threshold, 4);
        assert_eq!(config.retry, RetryConfig::default());
    }

    #[test]
    fn test_validation_rejects_inverted_thresholds() {
        let config = ConfigBuilder::new().thresholds(8, 3).build();
        assert!(matches!(
            config.validate(),
            Err(HandoffError::Configuration { .. })
        ));
        assert!(ConfigBuilder::new().max_depth(0).build().validate().is_err());
    }
}
