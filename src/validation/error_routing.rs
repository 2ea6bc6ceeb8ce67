//! Checks an [`ErrorRouterConfig`] against the agents that actually exist.

use std::collections::{BTreeSet, HashSet};

use serde::{Deserialize, Serialize};

use crate::error_routing::{ErrorCode, ErrorRouterConfig, Severity};

/// Handlers every deployment is expected to provide.
pub const RECOMMENDED_HANDLERS: [&str; 4] = [
    "error-handler",
    "validation-error-handler",
    "timeout-error-handler",
    "critical-error-handler",
];

const MAX_SENSIBLE_RETRIES: u32 = 10;
const MAX_SENSIBLE_DELAY_MS: u64 = 30_000;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub missing_agents: Vec<String>,
    pub unused_agents: Vec<String>,
    pub configured_paths: usize,
}

#[derive(Debug, Clone)]
pub struct ErrorRoutingValidator {
    available: HashSet<String>,
}

impl ErrorRoutingValidator {
    pub fn new<I, S>(available_agents: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            available: available_agents.into_iter().map(Into::into).collect(),
        }
    }

    pub fn validate(&self, config: &ErrorRouterConfig) -> ValidationResult {
        let mut result = ValidationResult::default();
        let mut missing = BTreeSet::new();

        for handler in RECOMMENDED_HANDLERS {
            if !self.available.contains(handler) {
                result
                    .warnings
                    .push(format!("recommended error handler '{}' not registered", handler));
            }
        }

        if config.max_retries > MAX_SENSIBLE_RETRIES {
            result.warnings.push(format!(
                "max_retries is very high ({}), consider reducing",
                config.max_retries
            ));
        }
        if config.retry_delay_ms > MAX_SENSIBLE_DELAY_MS {
            result.warnings.push(format!(
                "retry_delay_ms is very high ({}ms), consider reducing",
                config.retry_delay_ms
            ));
        }

        let mut categories: Vec<_> = config.category_handlers.iter().collect();
        categories.sort_by_key(|(code, _)| code.as_str());
        for (code, handler) in categories {
            if !self.available.contains(handler) {
                result.errors.push(format!(
                    "category handler '{}' for category '{}' does not exist",
                    handler, code
                ));
                missing.insert(handler.clone());
            }
        }
        for code in [ErrorCode::Validation, ErrorCode::Timeout] {
            if !config.category_handlers.contains_key(&code) {
                result
                    .warnings
                    .push(format!("missing handler for critical category: {}", code));
            }
        }

        let mut severities: Vec<_> = config.severity_handlers.iter().collect();
        severities.sort_by_key(|(severity, _)| severity.as_str());
        for (severity, handler) in severities {
            if !self.available.contains(handler) {
                result.errors.push(format!(
                    "severity handler '{}' for severity '{}' does not exist",
                    handler,
                    severity.as_str()
                ));
                missing.insert(handler.clone());
            }
        }
        if !config.severity_handlers.contains_key(&Severity::Critical) {
            result
                .warnings
                .push("missing handler for critical severity errors".to_string());
        }

        let default_handler = config.error_handler_name.trim();
        if default_handler.is_empty() {
            result
                .warnings
                .push("no default error handler configured".to_string());
        } else if !self.available.contains(default_handler) {
            result.errors.push(format!(
                "default error handler '{}' does not exist",
                default_handler
            ));
            missing.insert(default_handler.to_string());
        }

        let used: HashSet<String> = config.handler_names().into_iter().collect();
        let mut unused: Vec<String> = self
            .available
            .iter()
            .filter(|name| name.contains("error") && !used.contains(*name))
            .cloned()
            .collect();
        unused.sort();

        result.configured_paths = config.category_handlers.len()
            + config.severity_handlers.len()
            + usize::from(!default_handler.is_empty());
        result.missing_agents = missing.into_iter().collect();
        result.unused_agents = unused;
        result.is_valid = result.errors.is_empty();

        if !result.is_valid {
            log::warn!(
                "Error routing config has {} error(s); missing handlers: {:?}",
                result.errors.len(),
                result.missing_agents
            );
        }
        result
    }
}
