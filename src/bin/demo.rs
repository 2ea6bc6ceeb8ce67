//! switchyard demo binary.
//!
//! Runs a two-agent chain (`planner` routes to `writer`) on a runner built
//! from the runtime config, then prints the session trace as JSON.
//!
//! # Environment Variables
//!
//! - `SWITCHYARD_CONFIG`: path to a YAML runtime config (default: built-in defaults)
//! - `RUST_LOG`: tracing filter (default: "info,switchyard=debug")

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use switchyard::capabilities::{
    AgentCapabilities, Capability, MetricsSettings, ModelProvider, ModelResponse, Prompt,
};
use switchyard::events::ROUTE_KEY;
use switchyard::resilience::ResilientAgent;
use switchyard::runner::InMemoryTraceLogger;
use switchyard::validation::{AgentType, ErrorRoutingValidator, WorkflowValidator};
use switchyard::{
    handler_fn, AgentResult, ComponentRegistry, Event, EventData, OrchestrationMode, RuntimeConfig,
};

const SESSION: &str = "demo-session";

/// Stands in for a real model: fills a fixed template.
struct TemplateModel;

#[async_trait]
impl ModelProvider for TemplateModel {
    async fn call(&self, _ctx: &CancellationToken, prompt: &Prompt) -> anyhow::Result<ModelResponse> {
        Ok(ModelResponse {
            content: format!("A short note on {}.", prompt.user),
            finish_reason: "stop".into(),
            ..ModelResponse::default()
        })
    }

    async fn stream(
        &self,
        ctx: &CancellationToken,
        prompt: &Prompt,
    ) -> anyhow::Result<BoxStream<'static, anyhow::Result<String>>> {
        let response = self.call(ctx, prompt).await?;
        Ok(stream::once(async move { Ok::<_, anyhow::Error>(response.content) }).boxed())
    }

    async fn embeddings(
        &self,
        _ctx: &CancellationToken,
        texts: &[String],
    ) -> anyhow::Result<Vec<Vec<f64>>> {
        Ok(texts.iter().map(|_| Vec::new()).collect())
    }

    fn name(&self) -> &str {
        "template"
    }
}

fn load_config() -> anyhow::Result<RuntimeConfig> {
    match std::env::var("SWITCHYARD_CONFIG") {
        Ok(path) => {
            tracing::info!("Loading config from {}", path);
            Ok(RuntimeConfig::from_file(path)?)
        }
        Err(_) => Ok(RuntimeConfig::default()),
    }
}

fn check_workflow(config: &RuntimeConfig) -> anyhow::Result<()> {
    let mut workflow = WorkflowValidator::new(false);
    workflow.add_agent("planner", AgentType::Standard);
    workflow.add_agent("writer", AgentType::Finalizer);
    workflow.add_agent(&config.error_routing.error_handler_name, AgentType::ErrorHandler);
    workflow.add_route("planner", "writer")?;
    workflow.set_entry_point("planner")?;
    workflow.set_endpoint("writer")?;
    workflow.set_endpoint(&config.error_routing.error_handler_name)?;
    let result = workflow.validate();
    for issue in result.errors.iter().chain(&result.warnings) {
        tracing::warn!("{}", issue);
    }
    tracing::info!("Workflow summary: {}", workflow.summary());

    let routing = ErrorRoutingValidator::new(["planner", "writer", "error-handler"])
        .validate(&config.error_routing);
    tracing::info!(
        "Error routing: {} configured path(s), {} warning(s)",
        routing.configured_paths,
        routing.warnings.len()
    );
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,switchyard=debug".into()),
        )
        .init();

    let config = load_config()?;
    check_workflow(&config)?;

    let registry = ComponentRegistry::with_defaults();
    let runner = registry.build_runner(&config)?;
    runner.set_trace_logger(Arc::new(InMemoryTraceLogger::new()))?;

    let capabilities = AgentCapabilities::configure(vec![
        Capability::Llm(Arc::new(TemplateModel)),
        Capability::Metrics(MetricsSettings::default()),
    ])?;

    runner.register_agent(
        "planner",
        handler_fn(|_ctx, event, mut state| async move {
            let topic = event
                .data()
                .get("topic")
                .and_then(|v| v.as_str())
                .unwrap_or("nothing in particular")
                .to_string();
            state.set("plan", json!({ "topic": topic, "sections": 1 }));
            state.set_meta(ROUTE_KEY, "writer");
            Ok(AgentResult::success(state))
        }),
    )?;

    let writer = handler_fn(move |ctx, _event, mut state| {
        let capabilities = capabilities.clone();
        async move {
            let topic = state
                .get("plan")
                .and_then(|p| p.get("topic"))
                .and_then(|t| t.as_str())
                .unwrap_or_default()
                .to_string();
            let model = capabilities
                .llm()
                .ok_or_else(|| anyhow::anyhow!("writer has no model configured"))?;
            let response = model.call(&ctx, &Prompt::new("write plainly", topic)).await?;
            state.set("draft", json!(response.content));
            state.set_meta(ROUTE_KEY, "");
            Ok(AgentResult::success(state))
        }
    });
    let writer = ResilientAgent::new("writer", writer, registry.new_retrier(&config.retry))
        .with_breaker(registry.new_circuit_breaker("writer", &config.circuit_breaker));
    runner.register_agent("writer", Arc::new(writer))?;

    // Other modes would hand every event to the handler as well.
    if config.orchestration.mode == OrchestrationMode::Route {
        runner.register_agent(
            &config.error_routing.error_handler_name,
            handler_fn(|_ctx, event, mut state| async move {
                tracing::warn!("Error handler received event {}", event.id());
                state.set_meta(ROUTE_KEY, "");
                Ok(AgentResult::success(state))
            }),
        )?;
    }

    let ctx = CancellationToken::new();
    runner.start(&ctx)?;

    let mut data = EventData::new();
    data.insert("topic".into(), json!("circuit breakers"));
    runner.emit(Event::routed("planner", SESSION, data)).await?;

    tokio::time::sleep(Duration::from_millis(250)).await;
    runner.stop().await;

    let entries = runner.dump_trace(SESSION)?;
    println!("{}", serde_json::to_string_pretty(&entries)?);
    tracing::info!("Recorded {} trace entries for {}", entries.len(), SESSION);
    Ok(())
}
