//! Google Gemini gateway.
//!
//! Gemini responses are always delivered as a single final chunk.

use std::{env, fmt, time::Duration};

use async_trait::async_trait;
use futures::stream;
use hyper::Uri;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::http_client::{HyperClient, build_https_client, post_json, read_body, sanitize_base_url};
use crate::traits::{
    GatewayMetadata, GatewayRequest, GatewayResult, MessageRole, PromptMessage, ProviderGateway,
    ResponseChunk, ResponseStream, TransportError,
};

/// Environment variable used when loading configuration automatically.
pub const GEMINI_API_KEY_ENV: &str = "GEMINI_API_KEY";

/// Configuration for the Gemini gateway.
#[derive(Clone, Debug)]
pub struct GeminiConfig {
    api_key: Option<String>,
    model: String,
    base_url: String,
    timeout: Duration,
    default_temperature: Option<f32>,
}

impl GeminiConfig {
    /// Creates a configuration using the supplied model identifier.
    #[must_use]
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            api_key: None,
            model: model.into(),
            base_url: "https://generativelanguage.googleapis.com/".to_owned(),
            timeout: Duration::from_secs(60),
            default_temperature: None,
        }
    }

    /// Loads the API key from the `GEMINI_API_KEY` environment variable.
    #[must_use]
    pub fn from_env(model: impl Into<String>) -> Self {
        Self::from_env_var(model, GEMINI_API_KEY_ENV)
    }

    /// Loads the API key from a named environment variable.
    #[must_use]
    pub fn from_env_var(model: impl Into<String>, var: &str) -> Self {
        let mut cfg = Self::new(model);
        cfg.api_key = env::var(var).ok().filter(|key| !key.trim().is_empty());
        cfg
    }

    /// Overrides the base URL used for API calls.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Configuration`] if the supplied URL is invalid.
    pub fn with_base_url(mut self, base_url: impl AsRef<str>) -> GatewayResult<Self> {
        self.base_url = sanitize_base_url("Gemini", base_url.as_ref())?;
        Ok(self)
    }

    /// Sets the default sampling temperature used when requests omit it.
    #[must_use]
    pub fn with_default_temperature(mut self, temperature: f32) -> Self {
        self.default_temperature = Some(temperature);
        self
    }

    /// Sets the HTTP request timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Supplies an explicit API key.
    #[must_use]
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }
}

/// Gemini gateway that calls the `generateContent` API over HTTPS.
pub struct GeminiGateway {
    client: HyperClient,
    base_url: String,
    metadata: GatewayMetadata,
    api_key: String,
    timeout: Duration,
    default_temperature: Option<f32>,
}

impl fmt::Debug for GeminiGateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GeminiGateway")
            .field("model", &self.metadata.model())
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl GeminiGateway {
    /// Constructs a new gateway with the provided configuration.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Configuration`] if the API key is missing.
    pub fn new(config: GeminiConfig) -> GatewayResult<Self> {
        let api_key = config
            .api_key
            .ok_or_else(|| TransportError::configuration("Gemini gateway requires an API key"))?;

        let metadata = GatewayMetadata::new("gemini", config.model.clone());
        let client = build_https_client()?;

        Ok(Self {
            client,
            base_url: config.base_url,
            metadata,
            api_key,
            timeout: config.timeout,
            default_temperature: config.default_temperature,
        })
    }

    fn build_request(&self, request: &GatewayRequest) -> GenerateContentRequest {
        let system_instruction = request.system_prompt().map(|prompt| SystemInstruction {
            parts: vec![Part {
                text: prompt.to_owned(),
            }],
        });

        let contents = request
            .messages()
            .iter()
            .filter(|msg| msg.role() != MessageRole::System)
            .map(map_prompt_message)
            .collect();

        let temperature = request.temperature().or(self.default_temperature);
        let generation_config = (temperature.is_some() || request.max_output_tokens().is_some())
            .then(|| GenerationConfig {
                temperature,
                max_output_tokens: request.max_output_tokens(),
            });

        GenerateContentRequest {
            system_instruction,
            contents,
            generation_config,
        }
    }

    fn build_uri(&self, model: &str) -> GatewayResult<Uri> {
        format!(
            "{}v1beta/models/{model}:generateContent?key={}",
            self.base_url, self.api_key
        )
        .parse::<Uri>()
        .map_err(|err| TransportError::configuration(format!("invalid Gemini endpoint: {err}")))
    }
}

#[async_trait]
impl ProviderGateway for GeminiGateway {
    fn metadata(&self) -> &GatewayMetadata {
        &self.metadata
    }

    async fn send(&self, request: GatewayRequest) -> GatewayResult<ResponseStream> {
        let payload = self.build_request(&request);
        let body = serde_json::to_vec(&payload).map_err(|err| {
            TransportError::rejected(format!("failed to encode Gemini request: {err}"))
        })?;

        let model = request.model().unwrap_or_else(|| self.metadata.model());
        let endpoint = self.build_uri(model)?;

        debug!(
            session = %request.key().session(),
            full = request.is_full(),
            "sending Gemini generateContent"
        );

        let response = post_json(&self.client, "Gemini", &endpoint, &[], body, self.timeout).await?;
        let bytes = read_body("Gemini", response).await?;
        let response: GenerateContentResponse = serde_json::from_slice(&bytes).map_err(|err| {
            TransportError::rejected(format!("failed to decode Gemini response: {err}"))
        })?;

        let content = response
            .candidates
            .into_iter()
            .flat_map(|candidate| candidate.content.parts)
            .map(|part| part.text)
            .collect::<Vec<_>>()
            .join("\n");

        let stream = stream::once(async move { Ok(ResponseChunk::new(content, true)) });
        Ok(Box::pin(stream))
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<SystemInstruction>,
    contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GenerationConfig>,
}

#[derive(Debug, Serialize)]
struct SystemInstruction {
    parts: Vec<Part>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Content {
    role: String,
    parts: Vec<Part>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Part {
    text: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Content,
}

fn map_prompt_message(message: &PromptMessage) -> Content {
    let role = match message.role() {
        MessageRole::Assistant => "model",
        MessageRole::User | MessageRole::System => "user",
    };

    Content {
        role: role.to_owned(),
        parts: vec![Part {
            text: message.content().to_owned(),
        }],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::ContextKey;
    use lean_primitives::{ContentHash, SessionId};

    fn key() -> ContextKey {
        ContextKey::new(SessionId::random(), ContentHash::of("system"))
    }

    #[test]
    fn requires_api_key() {
        let err = GeminiGateway::new(GeminiConfig::new("gemini-1.5-flash")).expect_err("no key");
        assert!(matches!(err, TransportError::Configuration { .. }));
    }

    #[test]
    fn prompt_mapping_uses_model_role() {
        let mapped = map_prompt_message(&PromptMessage::assistant("done"));
        assert_eq!(mapped.role, "model");
    }

    #[test]
    fn build_request_extracts_system_instruction() {
        let gateway =
            GeminiGateway::new(GeminiConfig::new("gemini-1.5-flash").with_api_key("k")).unwrap();
        let request = GatewayRequest::full(
            key(),
            "Return JSON.",
            vec![PromptMessage::user("hi"), PromptMessage::assistant("{}")],
        )
        .unwrap()
        .with_temperature(0.3);

        let payload = gateway.build_request(&request);
        assert!(payload.system_instruction.is_some());
        assert_eq!(payload.contents.len(), 2);
        assert_eq!(
            payload.generation_config.and_then(|cfg| cfg.temperature),
            Some(0.3)
        );
    }

    #[test]
    fn uri_embeds_model_override() {
        let gateway =
            GeminiGateway::new(GeminiConfig::new("gemini-1.5-flash").with_api_key("k")).unwrap();
        let uri = gateway.build_uri("gemini-1.5-pro").unwrap();
        assert!(uri.path().ends_with("gemini-1.5-pro:generateContent"));
    }
}
