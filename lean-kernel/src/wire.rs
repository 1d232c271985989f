//! JSON frames exchanged over a session channel.
//!
//! Outbound messages are tagged by `type`:
//!
//! ```json
//! {"type":"session_init","session_id":"9b2e..."}
//! {"type":"chunk","text":"{\"current_"}
//! {"type":"complete","result":{"current_mood":"happy"}}
//! {"type":"error","message":"...","details":{"kind":"validation_failed"}}
//! ```

use bytes::Bytes;
use lean_primitives::SessionId;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use thiserror::Error;

use crate::error::OrchestratorError;

/// Message sent to the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    /// Announces the session serving the following turns.
    SessionInit {
        /// Session identifier to echo back on later frames.
        session_id: SessionId,
    },
    /// A streamed response fragment.
    Chunk {
        /// Fragment text.
        text: String,
    },
    /// Terminal success event of a turn.
    Complete {
        /// Validated result.
        result: Value,
    },
    /// Terminal failure event of a turn, or a rejected frame.
    Error {
        /// Human-readable description.
        message: String,
        /// Structured context such as the error kind and field errors.
        #[serde(default, skip_serializing_if = "Value::is_null")]
        details: Value,
    },
}

impl OutboundMessage {
    /// Builds an error message without details.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
            details: Value::Null,
        }
    }

    /// Builds the terminal error event for a failed turn.
    ///
    /// Validation failures carry every attempt's field errors under
    /// `details.attempts`, oldest first.
    #[must_use]
    pub fn from_error(error: &OrchestratorError) -> Self {
        let mut details = Map::new();
        details.insert("kind".into(), json!(error.kind()));
        if let Some(failure) = error.validation() {
            details.insert("errors".into(), json!(failure.last_errors()));
            details.insert("attempts".into(), json!(failure.attempts()));
        }
        Self::Error {
            message: error.to_string(),
            details: Value::Object(details),
        }
    }

    /// Returns `true` for `complete` and `error`.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete { .. } | Self::Error { .. })
    }

    /// Serializes the message to JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns the serializer error; unreachable for well-formed values.
    pub fn to_bytes(&self) -> Result<Bytes, serde_json::Error> {
        serde_json::to_vec(self).map(Bytes::from)
    }
}

/// Reasons an inbound frame is rejected before a turn starts.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FrameError {
    /// The frame is not a JSON object.
    #[error("Invalid JSON format")]
    InvalidJson,
    /// `path` or `message` is absent or empty.
    #[error("Fields 'path' and 'message' are required")]
    MissingFields,
    /// No prompt is registered at the path.
    #[error("No route found for path: {path}")]
    NoRoute {
        /// Requested path.
        path: String,
    },
}

impl From<FrameError> for OutboundMessage {
    fn from(error: FrameError) -> Self {
        Self::error(error.to_string())
    }
}

/// How an inbound frame refers to its session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRef {
    /// No `session_id`: continue the session the channel already serves for
    /// the route's prompt, or start one.
    Current,
    /// Continue this session.
    Id(SessionId),
    /// A `session_id` the runtime never issues; a new session starts.
    Unrecognized,
}

/// A user message addressed to a route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundFrame {
    /// Route path.
    pub path: String,
    /// User message.
    pub message: String,
    /// Session the caller refers to.
    pub session: SessionRef,
}

impl InboundFrame {
    /// Decodes a frame from raw JSON bytes.
    ///
    /// Non-string messages are forwarded as their JSON text. A null
    /// `session_id` counts as absent; a string that is not a session
    /// identifier yields [`SessionRef::Unrecognized`].
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::InvalidJson`] or [`FrameError::MissingFields`].
    pub fn decode(raw: &[u8]) -> Result<Self, FrameError> {
        let value: Value = serde_json::from_slice(raw).map_err(|_| FrameError::InvalidJson)?;
        let Value::Object(mut object) = value else {
            return Err(FrameError::InvalidJson);
        };

        let path = match object.remove("path") {
            Some(Value::String(path)) if !path.trim().is_empty() => path,
            _ => return Err(FrameError::MissingFields),
        };
        let message = match object.remove("message") {
            Some(Value::String(message)) if !message.is_empty() => message,
            None | Some(Value::Null | Value::String(_)) => return Err(FrameError::MissingFields),
            Some(other) => other.to_string(),
        };
        let session = match object.get("session_id").and_then(Value::as_str) {
            None => SessionRef::Current,
            Some(raw) => raw
                .trim()
                .parse()
                .map_or(SessionRef::Unrecognized, SessionRef::Id),
        };

        Ok(Self {
            path,
            message,
            session,
        })
    }
}
