//! `OpenAI`-compatible chat completions gateway.
//!
//! Also serves self-hosted servers exposing the same API (vLLM, llama.cpp)
//! through [`OpenAiConfig::with_base_url`].

use std::{env, fmt, time::Duration};

use async_trait::async_trait;
use futures::{StreamExt, future, stream};
use hyper::Uri;
use hyper::header::{AUTHORIZATION, HeaderName};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::http_client::{
    HyperClient, body_lines, build_https_client, post_json, read_body, sanitize_base_url,
};
use crate::traits::{
    GatewayMetadata, GatewayRequest, GatewayResult, MessageRole, PromptMessage, ProviderGateway,
    ResponseChunk, ResponseStream, TransportError,
};

/// Environment variable used when loading configuration automatically.
pub const OPENAI_API_KEY_ENV: &str = "OPENAI_API_KEY";

const OPENAI_DEFAULT_BASE: &str = "https://api.openai.com/";
const SSE_DONE: &str = "[DONE]";

/// Configuration for the `OpenAI` gateway.
#[derive(Clone, Debug)]
pub struct OpenAiConfig {
    api_key: Option<String>,
    model: String,
    base_url: String,
    timeout: Duration,
    default_temperature: Option<f32>,
}

impl OpenAiConfig {
    /// Creates a configuration using the supplied model identifier.
    #[must_use]
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            api_key: None,
            model: model.into(),
            base_url: OPENAI_DEFAULT_BASE.to_owned(),
            timeout: Duration::from_secs(60),
            default_temperature: None,
        }
    }

    /// Loads the API key from the `OPENAI_API_KEY` environment variable.
    #[must_use]
    pub fn from_env(model: impl Into<String>) -> Self {
        Self::from_env_var(model, OPENAI_API_KEY_ENV)
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
        self.base_url = sanitize_base_url("OpenAI", base_url.as_ref())?;
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

/// Gateway that calls an `OpenAI`-compatible chat completions endpoint.
pub struct OpenAiGateway {
    client: HyperClient,
    endpoint: Uri,
    metadata: GatewayMetadata,
    api_key: Option<String>,
    timeout: Duration,
    default_temperature: Option<f32>,
}

impl fmt::Debug for OpenAiGateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenAiGateway")
            .field("model", &self.metadata.model())
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

impl OpenAiGateway {
    /// Constructs a new gateway with the provided configuration.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Configuration`] if the API key is missing for the
    /// hosted `OpenAI` endpoint or the endpoint is invalid.
    pub fn new(config: OpenAiConfig) -> GatewayResult<Self> {
        if config.api_key.is_none() && config.base_url == OPENAI_DEFAULT_BASE {
            return Err(TransportError::configuration(
                "OpenAI gateway requires an API key",
            ));
        }

        let metadata = GatewayMetadata::new("openai", config.model.clone());
        let endpoint = format!("{}v1/chat/completions", config.base_url)
            .parse::<Uri>()
            .map_err(|err| {
                TransportError::configuration(format!("invalid OpenAI endpoint: {err}"))
            })?;

        let client = build_https_client()?;

        Ok(Self {
            client,
            endpoint,
            metadata,
            api_key: config.api_key,
            timeout: config.timeout,
            default_temperature: config.default_temperature,
        })
    }

    fn build_request(&self, request: &GatewayRequest) -> ChatCompletionRequest {
        let mut messages = Vec::with_capacity(request.messages().len() + 1);
        if let Some(system) = request.system_prompt() {
            messages.push(OpenAiMessage {
                role: MessageRole::System.to_string(),
                content: system.to_owned(),
            });
        }
        messages.extend(request.messages().iter().map(map_prompt_message));

        ChatCompletionRequest {
            model: request
                .model()
                .unwrap_or_else(|| self.metadata.model())
                .to_owned(),
            messages,
            temperature: request.temperature().or(self.default_temperature),
            max_tokens: request.max_output_tokens(),
            stream: request.is_streaming(),
        }
    }

    fn headers(&self) -> Vec<(HeaderName, String)> {
        self.api_key
            .iter()
            .map(|key| (AUTHORIZATION, format!("Bearer {key}")))
            .collect()
    }
}

#[async_trait]
impl ProviderGateway for OpenAiGateway {
    fn metadata(&self) -> &GatewayMetadata {
        &self.metadata
    }

    async fn send(&self, request: GatewayRequest) -> GatewayResult<ResponseStream> {
        let payload = self.build_request(&request);
        let body = serde_json::to_vec(&payload).map_err(|err| {
            TransportError::rejected(format!("failed to encode OpenAI request: {err}"))
        })?;

        debug!(
            session = %request.key().session(),
            full = request.is_full(),
            stream = payload.stream,
            "sending OpenAI chat completion"
        );

        let response = post_json(
            &self.client,
            "OpenAI",
            &self.endpoint,
            &self.headers(),
            body,
            self.timeout,
        )
        .await?;

        if payload.stream {
            let chunks = body_lines("OpenAI", response.into_body())
                .filter_map(|line| {
                    future::ready(match line {
                        Ok(line) => parse_sse_line(&line),
                        Err(err) => Some(Err(err)),
                    })
                });
            return Ok(Box::pin(chunks));
        }

        let bytes = read_body("OpenAI", response).await?;
        let response: ChatCompletionResponse = serde_json::from_slice(&bytes).map_err(|err| {
            TransportError::rejected(format!("failed to decode OpenAI response: {err}"))
        })?;

        let content = response
            .choices
            .into_iter()
            .find_map(|choice| choice.message.and_then(|message| message.content))
            .unwrap_or_default();

        let stream = stream::once(async move { Ok(ResponseChunk::new(content, true)) });
        Ok(Box::pin(stream))
    }
}

/// Parses one server-sent-events line.
///
/// Returns `None` for comments, blank deltas and non-data fields.
fn parse_sse_line(line: &str) -> Option<GatewayResult<ResponseChunk>> {
    let data = line.strip_prefix("data:")?.trim();
    if data == SSE_DONE {
        return Some(Ok(ResponseChunk::new("", true)));
    }

    let event: StreamEvent = match serde_json::from_str(data) {
        Ok(event) => event,
        Err(err) => {
            return Some(Err(TransportError::unavailable(format!(
                "malformed OpenAI stream event: {err}"
            ))));
        }
    };

    let content = event
        .choices
        .into_iter()
        .find_map(|choice| choice.delta.and_then(|delta| delta.content))
        .filter(|content| !content.is_empty())?;
    Some(Ok(ResponseChunk::new(content, false)))
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<OpenAiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "max_tokens")]
    max_tokens: Option<u32>,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct OpenAiMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    #[serde(default)]
    message: Option<ChoiceMessage>,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamEvent {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Option<ChoiceMessage>,
}

fn map_prompt_message(message: &PromptMessage) -> OpenAiMessage {
    OpenAiMessage {
        role: message.role().to_string(),
        content: message.content().to_owned(),
    }
}
