//! # Capabilities
//!
//! Optional collaborators an agent can be configured with: a language model,
//! a memory-backed cache, metrics settings and MCP tool servers.
//!
//! An agent's capability set is declared once with
//! [`AgentCapabilities::configure`]:
//!
//! ```ignore
//! let caps = AgentCapabilities::configure(vec![
//!     Capability::Llm(provider),
//!     Capability::Metrics(MetricsSettings::default()),
//! ])?;
//! if let Some(model) = caps.llm() {
//!     let reply = model.call(&ctx, &prompt).await?;
//! }
//! ```

pub mod memory;
pub mod provider;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::utilities::duration_ms;

pub use memory::{ChatMessage, Memory, MemoryRecord};
pub use provider::{ModelParameters, ModelProvider, ModelResponse, Prompt, UsageStats};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapabilityKind {
    Llm,
    Cache,
    Metrics,
    Mcp,
}

impl CapabilityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Llm => "llm",
            Self::Cache => "cache",
            Self::Metrics => "metrics",
            Self::Mcp => "mcp",
        }
    }
}

impl fmt::Display for CapabilityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_metrics_prefix() -> String {
    "switchyard".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSettings {
    #[serde(default = "default_metrics_prefix")]
    pub prefix: String,
    #[serde(default)]
    pub labels: Vec<(String, String)>,
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            prefix: default_metrics_prefix(),
            labels: Vec::new(),
        }
    }
}

fn default_tool_timeout() -> Duration {
    Duration::from_secs(30)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpSettings {
    pub servers: Vec<String>,
    #[serde(default = "default_tool_timeout", with = "duration_ms")]
    pub tool_timeout: Duration,
}

impl McpSettings {
    pub fn new(servers: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            servers: servers.into_iter().map(Into::into).collect(),
            tool_timeout: default_tool_timeout(),
        }
    }
}

/// One capability with whatever it needs to work.
#[derive(Clone)]
pub enum Capability {
    Llm(Arc<dyn ModelProvider>),
    Cache(Arc<dyn Memory>),
    Metrics(MetricsSettings),
    Mcp(McpSettings),
}

impl Capability {
    pub fn kind(&self) -> CapabilityKind {
        match self {
            Self::Llm(_) => CapabilityKind::Llm,
            Self::Cache(_) => CapabilityKind::Cache,
            Self::Metrics(_) => CapabilityKind::Metrics,
            Self::Mcp(_) => CapabilityKind::Mcp,
        }
    }
}

impl fmt::Debug for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Llm(provider) => f.debug_tuple("Llm").field(&provider.name()).finish(),
            Self::Cache(_) => f.write_str("Cache"),
            Self::Metrics(settings) => f.debug_tuple("Metrics").field(settings).finish(),
            Self::Mcp(settings) => f.debug_tuple("Mcp").field(settings).finish(),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CapabilityError {
    #[error("capability '{0}' configured more than once")]
    Duplicate(CapabilityKind),
}

/// The capabilities of one agent, at most one of each kind.
#[derive(Clone, Default)]
pub struct AgentCapabilities {
    llm: Option<Arc<dyn ModelProvider>>,
    cache: Option<Arc<dyn Memory>>,
    metrics: Option<MetricsSettings>,
    mcp: Option<McpSettings>,
}

impl AgentCapabilities {
    pub fn configure(capabilities: Vec<Capability>) -> Result<Self, CapabilityError> {
        let mut caps = Self::default();
        for capability in capabilities {
            let kind = capability.kind();
            if caps.has(kind) {
                return Err(CapabilityError::Duplicate(kind));
            }
            match capability {
                Capability::Llm(provider) => caps.llm = Some(provider),
                Capability::Cache(memory) => caps.cache = Some(memory),
                Capability::Metrics(settings) => caps.metrics = Some(settings),
                Capability::Mcp(settings) => caps.mcp = Some(settings),
            }
        }
        log::debug!("Configured agent capabilities: {:?}", caps.kinds());
        Ok(caps)
    }

    pub fn has(&self, kind: CapabilityKind) -> bool {
        match kind {
            CapabilityKind::Llm => self.llm.is_some(),
            CapabilityKind::Cache => self.cache.is_some(),
            CapabilityKind::Metrics => self.metrics.is_some(),
            CapabilityKind::Mcp => self.mcp.is_some(),
        }
    }

    pub fn kinds(&self) -> Vec<CapabilityKind> {
        [
            CapabilityKind::Llm,
            CapabilityKind::Cache,
            CapabilityKind::Metrics,
            CapabilityKind::Mcp,
        ]
        .into_iter()
        .filter(|k| self.has(*k))
        .collect()
    }

    pub fn llm(&self) -> Option<&Arc<dyn ModelProvider>> {
        self.llm.as_ref()
    }

    pub fn cache(&self) -> Option<&Arc<dyn Memory>> {
        self.cache.as_ref()
    }

    pub fn metrics(&self) -> Option<&MetricsSettings> {
        self.metrics.as_ref()
    }

    pub fn mcp(&self) -> Option<&McpSettings> {
        self.mcp.as_ref()
    }
}

impl fmt::Debug for AgentCapabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentCapabilities")
            .field("kinds", &self.kinds())
            .finish()
    }
}
