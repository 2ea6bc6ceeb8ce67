//! Language model seam.

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// Sampling options; `None` means the provider's default.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Prompt {
    #[serde(default)]
    pub system: String,
    pub user: String,
    #[serde(default)]
    pub parameters: ModelParameters,
}

impl Prompt {
    pub fn new(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            user: user.into(),
            parameters: ModelParameters::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageStats {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelResponse {
    pub content: String,
    #[serde(default)]
    pub usage: UsageStats,
    #[serde(default)]
    pub finish_reason: String,
}

/// A language model backend. Adapters for concrete vendors live outside
/// this crate.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Send a prompt and wait for the complete response.
    async fn call(&self, ctx: &CancellationToken, prompt: &Prompt) -> anyhow::Result<ModelResponse>;

    /// Send a prompt and receive the response as text chunks.
    ///
    /// An `Err` item ends the stream.
    async fn stream(
        &self,
        ctx: &CancellationToken,
        prompt: &Prompt,
    ) -> anyhow::Result<BoxStream<'static, anyhow::Result<String>>>;

    async fn embeddings(
        &self,
        ctx: &CancellationToken,
        texts: &[String],
    ) -> anyhow::Result<Vec<Vec<f64>>>;

    fn name(&self) -> &str {
        "model"
    }
}
