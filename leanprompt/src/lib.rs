//! LeanPrompt: markdown-defined prompts, session context caching and guardrail
//! self-correction for services that call LLMs.
//!
//! This crate bundles the runtime crates behind feature flags. With the
//! default features a service can load its `leanprompt.toml`, build a provider
//! gateway with [`provider::build_gateway`], and serve turns through
//! [`kernel::SessionChannel`].

#![warn(missing_docs, clippy::pedantic)]

/// Shared identifiers and hashes.
pub use lean_primitives as primitives;

/// Session registry, orchestrator and session channel (enabled by `kernel` feature).
#[cfg(feature = "kernel")]
pub use lean_kernel as kernel;

/// Provider gateways (enabled by `gateway` feature).
#[cfg(feature = "gateway")]
pub use lean_gateway as gateway;

/// Prompt specs and their loader (enabled by `prompts` feature).
#[cfg(feature = "prompts")]
pub use lean_prompts as prompts;

/// Response validation (enabled by `guard` feature).
#[cfg(feature = "guard")]
pub use lean_guard as guard;

/// Runtime configuration (enabled by `config` feature).
#[cfg(feature = "config")]
pub use lean_config as config;

/// Tracing setup (enabled by `telemetry` feature).
#[cfg(feature = "telemetry")]
pub use lean_telemetry as telemetry;

/// Gateway construction from configuration.
#[cfg(all(feature = "gateway", feature = "config"))]
pub mod provider;
