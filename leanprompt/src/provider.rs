//! Builds the configured provider gateway.

use std::sync::Arc;
use std::time::Duration;

use lean_config::{ProviderKind, ProviderSection};
use lean_gateway::gemini::{GeminiConfig, GeminiGateway};
use lean_gateway::ollama::{OllamaConfig, OllamaGateway};
use lean_gateway::openai::{OpenAiConfig, OpenAiGateway};
use lean_gateway::{ContextCache, GatewayResult, ProviderGateway};
use tracing::info;

/// Creates the gateway described by `section`.
///
/// Every backend is wrapped in [`ContextCache`]: none of them keeps
/// conversation state server-side, so delta requests are expanded locally.
/// `timeout` bounds each HTTP request.
///
/// # Errors
///
/// Returns a configuration error for invalid base URLs or a missing API key on
/// hosted backends.
pub fn build_gateway(
    section: &ProviderSection,
    timeout: Duration,
) -> GatewayResult<Arc<dyn ProviderGateway>> {
    let gateway: Arc<dyn ProviderGateway> = match section.kind {
        ProviderKind::Openai | ProviderKind::Vllm | ProviderKind::LlamaCpp => {
            let mut config = match section.api_key_env() {
                Some(var) => OpenAiConfig::from_env_var(&section.model, var),
                None => OpenAiConfig::new(&section.model),
            }
            .with_timeout(timeout);
            if let Some(base_url) = section.base_url() {
                config = config.with_base_url(base_url)?;
            }
            if let Some(temperature) = section.temperature {
                config = config.with_default_temperature(temperature);
            }
            Arc::new(ContextCache::new(OpenAiGateway::new(config)?))
        }
        ProviderKind::Ollama => {
            let mut config = OllamaConfig::new(&section.model).with_timeout(timeout);
            if let Some(base_url) = section.base_url() {
                config = config.with_base_url(base_url)?;
            }
            if let Some(temperature) = section.temperature {
                config = config.with_default_temperature(temperature);
            }
            Arc::new(ContextCache::new(OllamaGateway::new(config)?))
        }
        ProviderKind::Gemini => {
            let mut config = match section.api_key_env() {
                Some(var) => GeminiConfig::from_env_var(&section.model, var),
                None => GeminiConfig::new(&section.model),
            }
            .with_timeout(timeout);
            if let Some(base_url) = section.base_url() {
                config = config.with_base_url(base_url)?;
            }
            if let Some(temperature) = section.temperature {
                config = config.with_default_temperature(temperature);
            }
            Arc::new(ContextCache::new(GeminiGateway::new(config)?))
        }
    };

    info!(
        provider = gateway.metadata().provider(),
        kind = %section.kind,
        model = gateway.metadata().model(),
        "provider gateway ready"
    );
    Ok(gateway)
}
