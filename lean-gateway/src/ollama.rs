//! `Ollama` gateway implementation.

use std::{fmt, time::Duration};

use async_trait::async_trait;
use futures::{StreamExt, future, stream};
use hyper::Uri;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::http_client::{
    HyperClient, body_lines, build_https_client, post_json, read_body, sanitize_base_url,
};
use crate::traits::{
    GatewayMetadata, GatewayRequest, GatewayResult, MessageRole, PromptMessage, ProviderGateway,
    ResponseChunk, ResponseStream, TransportError,
};

/// Configuration for the `Ollama` gateway.
#[derive(Clone, Debug)]
pub struct OllamaConfig {
    base_url: String,
    model: String,
    default_temperature: Option<f32>,
    timeout: Duration,
}

impl OllamaConfig {
    /// Creates a configuration for the supplied model using the local daemon.
    #[must_use]
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            base_url: "http://127.0.0.1:11434/".to_owned(),
            model: model.into(),
            default_temperature: None,
            timeout: Duration::from_secs(60),
        }
    }

    /// Overrides the base URL of the Ollama daemon.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Configuration`] if the supplied URL is invalid.
    pub fn with_base_url(mut self, base_url: impl AsRef<str>) -> GatewayResult<Self> {
        self.base_url = sanitize_base_url("Ollama", base_url.as_ref())?;
        Ok(self)
    }

    /// Sets the default sampling temperature used when the request does not
    /// provide one explicitly.
    #[must_use]
    pub fn with_default_temperature(mut self, temperature: f32) -> Self {
        self.default_temperature = Some(temperature);
        self
    }

    /// Sets the HTTP timeout for requests to the Ollama daemon.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Gateway that calls the Ollama chat API over HTTP/HTTPS.
pub struct OllamaGateway {
    client: HyperClient,
    endpoint: Uri,
    metadata: GatewayMetadata,
    timeout: Duration,
    default_temperature: Option<f32>,
}

impl fmt::Debug for OllamaGateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OllamaGateway")
            .field("model", &self.metadata.model())
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

impl OllamaGateway {
    /// Constructs a new gateway from the supplied configuration.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Configuration`] if the endpoint is invalid or the
    /// HTTP client cannot be constructed.
    #[allow(clippy::needless_pass_by_value)]
    pub fn new(config: OllamaConfig) -> GatewayResult<Self> {
        let endpoint = format!("{}api/chat", config.base_url)
            .parse::<Uri>()
            .map_err(|err| {
                TransportError::configuration(format!("invalid Ollama endpoint: {err}"))
            })?;

        let client = build_https_client()?;
        let metadata = GatewayMetadata::new("ollama", config.model.clone());

        Ok(Self {
            client,
            endpoint,
            metadata,
            timeout: config.timeout,
            default_temperature: config.default_temperature,
        })
    }

    fn build_request(&self, request: &GatewayRequest) -> ChatRequest {
        let mut messages = Vec::with_capacity(request.messages().len() + 1);
        if let Some(system) = request.system_prompt() {
            messages.push(ChatMessage {
                role: MessageRole::System.to_string(),
                content: system.to_owned(),
            });
        }
        messages.extend(request.messages().iter().map(map_prompt_message));

        let temperature = request.temperature().or(self.default_temperature);
        let options = (temperature.is_some() || request.max_output_tokens().is_some()).then(|| {
            ChatOptions {
                temperature,
                max_output_tokens: request.max_output_tokens(),
            }
        });

        ChatRequest {
            model: request
                .model()
                .unwrap_or_else(|| self.metadata.model())
                .to_owned(),
            stream: request.is_streaming(),
            messages,
            options,
        }
    }
}

#[async_trait]
impl ProviderGateway for OllamaGateway {
    fn metadata(&self) -> &GatewayMetadata {
        &self.metadata
    }

    async fn send(&self, request: GatewayRequest) -> GatewayResult<ResponseStream> {
        let payload = self.build_request(&request);
        let body = serde_json::to_vec(&payload).map_err(|err| {
            TransportError::rejected(format!("failed to encode Ollama request: {err}"))
        })?;

        debug!(
            session = %request.key().session(),
            full = request.is_full(),
            stream = payload.stream,
            "sending Ollama chat request"
        );

        let response = post_json(
            &self.client,
            "Ollama",
            &self.endpoint,
            &[],
            body,
            self.timeout,
        )
        .await?;

        if payload.stream {
            let chunks = body_lines("Ollama", response.into_body()).map(|line| {
                let line = line?;
                let response: ChatResponse = serde_json::from_str(&line).map_err(|err| {
                    TransportError::unavailable(format!("malformed Ollama stream line: {err}"))
                })?;
                response.into_chunk()
            });
            // Nothing after the `done` line is meaningful.
            let mut finished = false;
            let chunks = chunks.take_while(move |chunk| {
                let keep = !finished;
                finished = finished || matches!(chunk, Ok(c) if c.done) || chunk.is_err();
                future::ready(keep)
            });
            return Ok(Box::pin(chunks));
        }

        let bytes = read_body("Ollama", response).await?;
        let response: ChatResponse = serde_json::from_slice(&bytes).map_err(|err| {
            TransportError::rejected(format!("failed to decode Ollama response: {err}"))
        })?;

        let mut chunk = response.into_chunk()?;
        chunk.done = true;
        Ok(Box::pin(stream::once(async move { Ok(chunk) })))
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    stream: bool,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<ChatOptions>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct ChatOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "num_predict")]
    max_output_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    message: Option<ChatMessage>,
    #[serde(default)]
    response: Option<String>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

impl ChatResponse {
    fn into_chunk(self) -> GatewayResult<ResponseChunk> {
        if let Some(error) = self.error {
            return Err(TransportError::rejected(format!("Ollama error: {error}")));
        }
        let content = self
            .message
            .map(|message| message.content)
            .or(self.response)
            .unwrap_or_default();
        Ok(ResponseChunk::new(content, self.done))
    }
}

fn map_prompt_message(message: &PromptMessage) -> ChatMessage {
    ChatMessage {
        role: message.role().to_string(),
        content: message.content().to_owned(),
    }
}
