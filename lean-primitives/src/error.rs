//! Shared error definitions for runtime primitives.

use thiserror::Error;
use uuid::Error as UuidError;

/// Result alias used throughout the runtime.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while constructing primitive types.
#[derive(Debug, Error)]
pub enum Error {
    /// The provided session identifier could not be parsed.
    #[error("invalid session id: {source}")]
    InvalidSessionId {
        /// Source parsing error from the UUID library.
        #[from]
        source: UuidError,
    },

    /// Prompt identifier failed validation.
    #[error("invalid prompt id `{id}`: {reason}")]
    InvalidPromptId {
        /// The offending identifier string.
        id: String,
        /// Human-readable reason for rejection.
        reason: String,
    },
}
