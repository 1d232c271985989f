//! Shared provider gateway traits and data structures.

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use lean_primitives::{ContentHash, SessionId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result alias used by provider gateways.
pub type GatewayResult<T> = Result<T, TransportError>;

/// Streaming response emitted by [`ProviderGateway::send`].
pub type ResponseStream = Pin<Box<dyn Stream<Item = GatewayResult<ResponseChunk>> + Send>>;

/// Failure modes surfaced by gateways to the orchestrator.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// Gateway is misconfigured or missing credentials.
    #[error("gateway not configured: {reason}")]
    Configuration {
        /// Additional context for the failure.
        reason: String,
    },

    /// Connection or transport failure, including timeouts. Retryable.
    #[error("provider unavailable: {reason}")]
    Unavailable {
        /// Additional context about the error.
        reason: String,
    },

    /// The provider throttled the request. Retryable after a delay.
    #[error("provider rate limited (retry after {retry_after:?})")]
    RateLimited {
        /// Suggested delay before retrying.
        retry_after: Option<Duration>,
    },

    /// The request was malformed or refused. Not retryable.
    #[error("request rejected: {reason}")]
    Rejected {
        /// Reason describing why the request could not be processed.
        reason: String,
    },
}

impl TransportError {
    /// Convenience constructor for configuration issues.
    #[must_use]
    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }

    /// Convenience constructor for transport failures.
    #[must_use]
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::Unavailable {
            reason: reason.into(),
        }
    }

    /// Convenience constructor for rejected requests.
    #[must_use]
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::Rejected {
            reason: reason.into(),
        }
    }

    /// Returns `true` when the orchestrator may retry the call.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable { .. } | Self::RateLimited { .. })
    }

    /// Returns the provider-suggested retry delay, if any.
    #[must_use]
    pub const fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

/// Minimal metadata describing a gateway instance.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GatewayMetadata {
    provider: &'static str,
    model: String,
}

impl GatewayMetadata {
    /// Creates metadata for the supplied provider and default model identifier.
    #[must_use]
    pub fn new(provider: &'static str, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
        }
    }

    /// Returns the provider identifier (e.g., "openai").
    #[must_use]
    pub const fn provider(&self) -> &'static str {
        self.provider
    }

    /// Returns the default model name.
    #[must_use]
    pub fn model(&self) -> &str {
        &self.model
    }
}

/// Roles supported in chat-style prompts.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// System messages steer the assistant behaviour.
    System,
    /// User-authored content.
    User,
    /// Assistant (model) responses.
    Assistant,
}

impl fmt::Display for MessageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        })
    }
}

/// A single chat message.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct PromptMessage {
    role: MessageRole,
    content: String,
}

impl PromptMessage {
    /// Creates a new prompt message.
    #[must_use]
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    /// Shorthand for a user message.
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, content)
    }

    /// Shorthand for an assistant message.
    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Assistant, content)
    }

    /// Returns the message role.
    #[must_use]
    pub const fn role(&self) -> MessageRole {
        self.role
    }

    /// Returns the message content.
    #[must_use]
    pub fn content(&self) -> &str {
        &self.content
    }
}

/// Identifies a provider-side cached prefix: one session bound to one prompt version.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ContextKey {
    session: SessionId,
    prompt_hash: ContentHash,
}

impl ContextKey {
    /// Creates a key for the session and prompt content hash.
    #[must_use]
    pub const fn new(session: SessionId, prompt_hash: ContentHash) -> Self {
        Self {
            session,
            prompt_hash,
        }
    }

    /// Returns the session part of the key.
    #[must_use]
    pub const fn session(&self) -> SessionId {
        self.session
    }

    /// Returns the prompt content hash part of the key.
    #[must_use]
    pub const fn prompt_hash(&self) -> ContentHash {
        self.prompt_hash
    }
}

/// Whether a request carries the full system prompt or only the new turn.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RequestShape {
    /// First turn (or first turn after a context reset).
    Full {
        /// Complete system prompt for the session.
        system_prompt: String,
    },
    /// Subsequent turn relying on the cached prefix.
    Delta,
}

/// Request submitted to a provider gateway.
#[derive(Clone, Debug, PartialEq)]
pub struct GatewayRequest {
    key: ContextKey,
    shape: RequestShape,
    messages: Vec<PromptMessage>,
    model: Option<String>,
    temperature: Option<f32>,
    max_output_tokens: Option<u32>,
    stream: bool,
}

impl GatewayRequest {
    /// Creates a full-context request.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Rejected`] if the message list is empty.
    pub fn full(
        key: ContextKey,
        system_prompt: impl Into<String>,
        messages: Vec<PromptMessage>,
    ) -> GatewayResult<Self> {
        Self::build(
            key,
            RequestShape::Full {
                system_prompt: system_prompt.into(),
            },
            messages,
        )
    }

    /// Creates a delta request carrying only the new turn.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Rejected`] if the message list is empty.
    pub fn delta(key: ContextKey, messages: Vec<PromptMessage>) -> GatewayResult<Self> {
        Self::build(key, RequestShape::Delta, messages)
    }

    fn build(
        key: ContextKey,
        shape: RequestShape,
        messages: Vec<PromptMessage>,
    ) -> GatewayResult<Self> {
        if messages.is_empty() {
            return Err(TransportError::rejected(
                "gateway request requires at least one message",
            ));
        }

        Ok(Self {
            key,
            shape,
            messages,
            model: None,
            temperature: None,
            max_output_tokens: None,
            stream: false,
        })
    }

    /// Overrides the provider's default model.
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Sets the sampling temperature.
    #[must_use]
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Sets the maximum output token budget.
    #[must_use]
    pub fn with_max_output_tokens(mut self, tokens: u32) -> Self {
        self.max_output_tokens = Some(tokens);
        self
    }

    /// Requests incremental delivery when the provider supports it.
    #[must_use]
    pub fn with_streaming(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    /// Returns the context key.
    #[must_use]
    pub const fn key(&self) -> ContextKey {
        self.key
    }

    /// Returns the request shape.
    #[must_use]
    pub const fn shape(&self) -> &RequestShape {
        &self.shape
    }

    /// Returns `true` for full-context requests.
    #[must_use]
    pub const fn is_full(&self) -> bool {
        matches!(self.shape, RequestShape::Full { .. })
    }

    /// Returns the system prompt for full-context requests.
    #[must_use]
    pub fn system_prompt(&self) -> Option<&str> {
        match &self.shape {
            RequestShape::Full { system_prompt } => Some(system_prompt),
            RequestShape::Delta => None,
        }
    }

    /// Returns the turn messages.
    #[must_use]
    pub fn messages(&self) -> &[PromptMessage] {
        &self.messages
    }

    /// Consumes the request, returning its messages.
    #[must_use]
    pub fn into_messages(self) -> Vec<PromptMessage> {
        self.messages
    }

    /// Returns the model override.
    #[must_use]
    pub fn model(&self) -> Option<&str> {
        self.model.as_deref()
    }

    /// Returns the configured sampling temperature.
    #[must_use]
    pub const fn temperature(&self) -> Option<f32> {
        self.temperature
    }

    /// Returns the configured maximum output tokens.
    #[must_use]
    pub const fn max_output_tokens(&self) -> Option<u32> {
        self.max_output_tokens
    }

    /// Returns `true` when incremental delivery was requested.
    #[must_use]
    pub const fn is_streaming(&self) -> bool {
        self.stream
    }

    /// Rebuilds the request as a full-context request with a new message list,
    /// keeping generation parameters.
    #[must_use]
    pub fn expand(
        &self,
        system_prompt: impl Into<String>,
        messages: Vec<PromptMessage>,
    ) -> Self {
        Self {
            key: self.key,
            shape: RequestShape::Full {
                system_prompt: system_prompt.into(),
            },
            messages,
            model: self.model.clone(),
            temperature: self.temperature,
            max_output_tokens: self.max_output_tokens,
            stream: self.stream,
        }
    }
}

/// Streaming chunk returned by a gateway.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct ResponseChunk {
    /// Partial text emitted by the provider.
    pub delta: String,
    /// Whether the generation is complete.
    pub done: bool,
}

impl ResponseChunk {
    /// Creates a new chunk.
    #[must_use]
    pub fn new(delta: impl Into<String>, done: bool) -> Self {
        Self {
            delta: delta.into(),
            done,
        }
    }
}

/// Capability implemented by every provider backend.
///
/// The orchestrator depends only on this trait, never on a provider's request
/// or response shape.
#[async_trait]
pub trait ProviderGateway: Send + Sync {
    /// Returns basic metadata describing the gateway instance.
    fn metadata(&self) -> &GatewayMetadata;

    /// Sends the request, returning a stream of response chunks.
    ///
    /// Non-streaming providers return a stream yielding a single final chunk.
    async fn send(&self, request: GatewayRequest) -> GatewayResult<ResponseStream>;

    /// Drops any provider-side state kept for the session.
    async fn release(&self, session: SessionId) {
        let _ = session;
    }
}

#[async_trait]
impl<G> ProviderGateway for Arc<G>
where
    G: ProviderGateway + ?Sized,
{
    fn metadata(&self) -> &GatewayMetadata {
        (**self).metadata()
    }

    async fn send(&self, request: GatewayRequest) -> GatewayResult<ResponseStream> {
        (**self).send(request).await
    }

    async fn release(&self, session: SessionId) {
        (**self).release(session).await;
    }
}

/// Drains a response stream into the complete message text.
///
/// # Errors
///
/// Returns the first error yielded by the stream.
pub async fn collect_response(mut stream: ResponseStream) -> GatewayResult<String> {
    let mut response = String::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        response.push_str(&chunk.delta);
        if chunk.done {
            break;
        }
    }
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    fn key() -> ContextKey {
        ContextKey::new(SessionId::random(), ContentHash::of("prompt"))
    }

    #[test]
    fn validates_request_messages() {
        let err = GatewayRequest::delta(key(), Vec::new()).expect_err("messages required");
        assert!(matches!(err, TransportError::Rejected { .. }));
    }

    #[test]
    fn builds_full_request() {
        let request = GatewayRequest::full(key(), "system", vec![PromptMessage::user("ping")])
            .unwrap()
            .with_model("gpt-4o-mini")
            .with_max_output_tokens(256)
            .with_temperature(0.7);

        assert!(request.is_full());
        assert_eq!(request.system_prompt(), Some("system"));
        assert_eq!(request.messages().len(), 1);
        assert_eq!(request.model(), Some("gpt-4o-mini"));
        assert_eq!(request.max_output_tokens(), Some(256));
        assert_eq!(request.temperature(), Some(0.7));
    }

    #[test]
    fn expand_keeps_parameters() {
        let delta = GatewayRequest::delta(key(), vec![PromptMessage::user("again")])
            .unwrap()
            .with_temperature(0.1)
            .with_streaming(true);
        let expanded = delta.expand("system", vec![PromptMessage::user("a")]);

        assert!(expanded.is_full());
        assert_eq!(expanded.key(), delta.key());
        assert_eq!(expanded.temperature(), Some(0.1));
        assert!(expanded.is_streaming());
    }

    #[test]
    fn retryable_classification() {
        assert!(TransportError::unavailable("down").is_retryable());
        assert!(
            TransportError::RateLimited {
                retry_after: Some(Duration::from_secs(1))
            }
            .is_retryable()
        );
        assert!(!TransportError::rejected("bad").is_retryable());
        assert!(!TransportError::configuration("no key").is_retryable());
    }

    #[tokio::test]
    async fn collects_chunks_until_done() {
        let chunks = vec![
            Ok(ResponseChunk::new("hel", false)),
            Ok(ResponseChunk::new("lo", true)),
            Ok(ResponseChunk::new("ignored", false)),
        ];
        let text = collect_response(Box::pin(stream::iter(chunks)))
            .await
            .unwrap();
        assert_eq!(text, "hello");
    }

    #[tokio::test]
    async fn collect_propagates_errors() {
        let chunks = vec![
            Ok(ResponseChunk::new("partial", false)),
            Err(TransportError::unavailable("reset")),
        ];
        let err = collect_response(Box::pin(stream::iter(chunks)))
            .await
            .expect_err("should fail");
        assert!(err.is_retryable());
    }
}
