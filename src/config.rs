//! Runtime configuration loaded from YAML.
//!
//! ```yaml
//! runner:
//!   queue_size: 200
//!   emit_timeout: 500        # milliseconds
//!   max_hops: 16
//! orchestration:
//!   mode: collaborate
//!   config:
//!     timeout: 10000
//!     max_concurrency: 4
//!     failure_threshold: 0.75
//! error_routing:
//!   max_retries: 2
//! ```
//!
//! Every section and field is optional; omitted values take their defaults.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error_routing::ErrorRouterConfig;
use crate::orchestration::OrchestratorSpec;
use crate::resilience::{CircuitBreakerConfig, RetryPolicy};
use crate::runner::RunnerConfig;
use crate::utilities::duration_ms;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

fn default_queue_size() -> usize {
    100
}

fn default_emit_timeout() -> Duration {
    Duration::from_secs(1)
}

fn default_max_hops() -> Option<u32> {
    Some(32)
}

/// Queue and loop settings for the runner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunnerSettings {
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
    #[serde(default = "default_emit_timeout", with = "duration_ms")]
    pub emit_timeout: Duration,
    #[serde(default = "default_max_hops")]
    pub max_hops: Option<u32>,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            queue_size: default_queue_size(),
            emit_timeout: default_emit_timeout(),
            max_hops: default_max_hops(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub runner: RunnerSettings,
    #[serde(default)]
    pub orchestration: OrchestratorSpec,
    #[serde(default)]
    pub error_routing: ErrorRouterConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
}

impl RuntimeConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        log::debug!("Loaded runtime config from {}", path.display());
        Self::from_yaml_str(&raw)
    }

    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.runner.queue_size == 0 {
            return Err(ConfigError::Invalid("runner.queue_size must be > 0".into()));
        }
        let orchestration = &self.orchestration.config;
        if orchestration.max_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "orchestration.config.max_concurrency must be > 0".into(),
            ));
        }
        if !(0.0..=1.0).contains(&orchestration.failure_threshold) {
            return Err(ConfigError::Invalid(format!(
                "orchestration.config.failure_threshold must be within [0, 1], got {}",
                orchestration.failure_threshold
            )));
        }
        for (field, policy) in [("retry", &self.retry), ("orchestration.config.retry_policy", &orchestration.retry_policy)] {
            if policy.backoff_factor < 1.0 {
                return Err(ConfigError::Invalid(format!(
                    "{}.backoff_factor must be >= 1, got {}",
                    field, policy.backoff_factor
                )));
            }
        }
        if self.circuit_breaker.failure_threshold == 0 || self.circuit_breaker.success_threshold == 0 {
            return Err(ConfigError::Invalid(
                "circuit_breaker thresholds must be > 0".into(),
            ));
        }
        if self.error_routing.error_handler_name.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "error_routing.error_handler_name must not be empty".into(),
            ));
        }
        Ok(())
    }

    /// Runner settings combined with the error routing section.
    pub fn runner_config(&self) -> RunnerConfig {
        RunnerConfig {
            queue_size: self.runner.queue_size,
            emit_timeout: self.runner.emit_timeout,
            max_hops: self.runner.max_hops,
            error_router: self.error_routing.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestration::{MixedOrder, OrchestrationMode};
    use std::io::Write;

    #[test]
    fn test_empty_document_is_all_defaults() {
        let config = RuntimeConfig::from_yaml_str("{}").unwrap();
        assert_eq!(config, RuntimeConfig::default());
        assert_eq!(config.runner.queue_size, 100);
        assert_eq!(config.runner.max_hops, Some(32));
        assert_eq!(config.orchestration.mode, OrchestrationMode::Route);
    }

    #[test]
    fn test_partial_document() {
        let yaml = r#"
runner:
  queue_size: 8
  emit_timeout: 250
  max_hops: null
orchestration:
  mode: mixed
  collaborative_agents: [search, lookup]
  sequential_agents: [summarize]
  mixed_order: sequential_first
  config:
    max_concurrency: 4
error_routing:
  max_retries: 1
retry:
  jitter: false
"#;
        let config = RuntimeConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.runner.queue_size, 8);
        assert_eq!(config.runner.emit_timeout, Duration::from_millis(250));
        assert_eq!(config.runner.max_hops, None);
        assert_eq!(config.orchestration.mode, OrchestrationMode::Mixed);
        assert_eq!(config.orchestration.mixed_order, MixedOrder::SequentialFirst);
        assert_eq!(config.orchestration.config.max_concurrency, 4);
        assert_eq!(config.orchestration.config.timeout, Duration::from_secs(30));
        assert_eq!(config.error_routing.max_retries, 1);
        assert!(!config.retry.jitter);
        assert_eq!(config.retry.max_retries, 3);

        let runner = config.runner_config();
        assert_eq!(runner.queue_size, 8);
        assert_eq!(runner.error_router.max_retries, 1);
    }

    #[test]
    fn test_validation_failures() {
        let cases = [
            ("runner: {queue_size: 0}", "queue_size"),
            ("orchestration: {config: {failure_threshold: 1.5}}", "failure_threshold"),
            ("orchestration: {config: {max_concurrency: 0}}", "max_concurrency"),
            ("retry: {backoff_factor: 0.5}", "backoff_factor"),
            ("circuit_breaker: {failure_threshold: 0}", "circuit_breaker"),
        ];
        for (yaml, needle) in cases {
            let err = RuntimeConfig::from_yaml_str(yaml).unwrap_err();
            assert!(matches!(err, ConfigError::Invalid(_)), "{}", yaml);
            assert!(err.to_string().contains(needle), "{}: {}", yaml, err);
        }
    }

    #[test]
    fn test_unknown_mode_is_a_parse_error() {
        let err = RuntimeConfig::from_yaml_str("orchestration: {mode: swarm}").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "orchestration:\n  mode: loop\n  agent_names: [refiner]\n  max_iterations: 3").unwrap();
        let config = RuntimeConfig::from_file(file.path()).unwrap();
        assert_eq!(config.orchestration.mode, OrchestrationMode::Loop);
        assert_eq!(config.orchestration.max_iterations, 3);

        let missing = RuntimeConfig::from_file("/definitely/not/here.yaml").unwrap_err();
        assert!(missing.to_string().starts_with("failed to read config file"));
    }

    #[test]
    fn test_yaml_round_trip_keeps_millis() {
        let yaml = RuntimeConfig::default().to_yaml().unwrap();
        assert!(yaml.contains("emit_timeout: 1000"));
        let back = RuntimeConfig::from_yaml_str(&yaml).unwrap();
        assert_eq!(back, RuntimeConfig::default());
    }
}
