//! Core shared types for the LeanPrompt runtime.

#![warn(missing_docs, clippy::pedantic)]

mod error;
mod hash;
mod ids;

/// Error type and result alias shared across the SDK.
pub use error::{Error, Result};
/// SHA-256 digest identifying prompt source content.
pub use hash::ContentHash;
/// Session and prompt identifiers.
pub use ids::{PromptSpecId, SessionId};
