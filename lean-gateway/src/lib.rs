//! Provider gateways used by the orchestrator.
//!
//! Each module exposes an implementation for a specific provider while sharing a
//! common trait-based interface defined in [`traits`]. Providers that keep no
//! server-side conversation state are wrapped in [`context_cache::ContextCache`]
//! so that delta requests work everywhere.

#![warn(missing_docs, clippy::pedantic)]

pub mod context_cache;
pub mod gemini;
pub mod ollama;
pub mod openai;
pub mod traits;

mod http_client;

pub use context_cache::ContextCache;
pub use traits::{
    ContextKey, GatewayMetadata, GatewayRequest, GatewayResult, MessageRole, PromptMessage,
    ProviderGateway, RequestShape, ResponseChunk, ResponseStream, TransportError,
    collect_response,
};
