use std::path::PathBuf;

use thiserror::Error;

/// Result alias for prompt operations.
pub type PromptResult<T> = Result<T, PromptError>;

/// Errors raised while loading or resolving prompt definitions.
#[derive(Debug, Error)]
pub enum PromptError {
    /// No prompt definition exists for the identifier.
    #[error("prompt not found: {id}")]
    NotFound {
        /// Identifier that was requested.
        id: String,
    },

    /// The prompt document could not be read.
    #[error("failed to read prompt document {path}: {source}")]
    Io {
        /// Path that failed to load.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The document frontmatter or body is malformed.
    #[error("invalid prompt document `{id}`: {reason}")]
    InvalidDocument {
        /// Identifier of the offending prompt.
        id: String,
        /// Human-readable reason.
        reason: String,
    },

    /// A field type declaration could not be parsed.
    #[error("invalid schema field `{field}`: {reason}")]
    InvalidSchema {
        /// Field whose declaration failed.
        field: String,
        /// Human-readable reason.
        reason: String,
    },

    /// A schema reference names no registered schema.
    #[error("unknown schema reference: {name}")]
    UnknownSchema {
        /// Referenced schema name.
        name: String,
    },

    /// The prompt identifier failed validation.
    #[error(transparent)]
    InvalidId(#[from] lean_primitives::Error),
}
