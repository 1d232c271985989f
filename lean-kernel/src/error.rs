//! Error types surfaced by the kernel.

use lean_gateway::TransportError;
use lean_guard::FieldError;
use lean_primitives::{PromptSpecId, SessionId};
use lean_prompts::PromptError;
use thiserror::Error;

use crate::turn_state::TurnStateError;

/// Failures of the session registry.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    /// The session is bound to another prompt.
    #[error("session {session} is bound to prompt `{bound}`, not `{requested}`")]
    Mismatch {
        /// Offending session.
        session: SessionId,
        /// Prompt the session was created for.
        bound: PromptSpecId,
        /// Prompt the request addressed.
        requested: PromptSpecId,
    },
    /// A turn is already in flight for the session.
    #[error("session {session} already has a turn in flight")]
    Busy {
        /// Offending session.
        session: SessionId,
    },
    /// The session is no longer registered.
    #[error("session {session} has expired")]
    Expired {
        /// Offending session.
        session: SessionId,
    },
}

/// Result alias for registry operations.
pub type SessionResult<T> = Result<T, SessionError>;

/// Field errors collected over every attempt of a failed turn.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationFailure {
    attempts: Vec<Vec<FieldError>>,
}

impl ValidationFailure {
    /// Wraps the per-attempt error sets, oldest first.
    #[must_use]
    pub const fn new(attempts: Vec<Vec<FieldError>>) -> Self {
        Self { attempts }
    }

    /// Returns every attempt's errors, oldest first.
    #[must_use]
    pub fn attempts(&self) -> &[Vec<FieldError>] {
        &self.attempts
    }

    /// Returns the errors of the final attempt.
    #[must_use]
    pub fn last_errors(&self) -> &[FieldError] {
        self.attempts.last().map_or(&[], Vec::as_slice)
    }
}

fn summarize(failure: &ValidationFailure) -> String {
    let errors: Vec<String> = failure
        .last_errors()
        .iter()
        .map(ToString::to_string)
        .collect();
    format!(
        "{} after {} attempt(s)",
        errors.join("; "),
        failure.attempts.len()
    )
}

/// Terminal failure of a turn.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Registry rejected the request.
    #[error(transparent)]
    Session(#[from] SessionError),
    /// Gateway call failed fatally or exhausted its retries.
    #[error("provider `{provider}` failed: {source}")]
    Transport {
        /// Provider name reported by the gateway.
        provider: &'static str,
        /// Underlying transport error.
        #[source]
        source: TransportError,
    },
    /// Every self-correction attempt produced an invalid response.
    #[error("response failed validation: {}", summarize(.0))]
    Validation(ValidationFailure),
    /// A streamed response turned out invalid after chunks were delivered.
    #[error("streamed response failed validation: {}", summarize(.0))]
    PostStreamValidation(ValidationFailure),
    /// The prompt store does not know the prompt.
    #[error("unknown prompt `{id}`")]
    UnknownPrompt {
        /// Requested prompt identifier.
        id: PromptSpecId,
    },
    /// The prompt could not be loaded.
    #[error(transparent)]
    Prompt(PromptError),
    /// The caller went away before the turn completed.
    #[error("turn cancelled")]
    Cancelled,
    /// Internal state machine violation.
    #[error(transparent)]
    InvalidTransition(#[from] TurnStateError),
}

impl OrchestratorError {
    /// Stable machine-readable code for the error, used in wire `details`.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Session(SessionError::Mismatch { .. }) => "session_mismatch",
            Self::Session(SessionError::Busy { .. }) => "session_busy",
            Self::Session(SessionError::Expired { .. }) => "session_expired",
            Self::Transport {
                source: TransportError::Rejected { .. },
                ..
            } => "transport_rejected",
            Self::Transport {
                source: TransportError::Configuration { .. },
                ..
            } => "transport_configuration",
            Self::Transport { .. } => "transport_unavailable",
            Self::Validation(_) => "validation_failed",
            Self::PostStreamValidation(_) => "post_stream_validation_failed",
            Self::UnknownPrompt { .. } => "unknown_prompt",
            Self::Prompt(_) => "prompt_error",
            Self::Cancelled => "cancelled",
            Self::InvalidTransition(_) => "internal",
        }
    }

    /// Returns the validation failure carried by validation errors.
    #[must_use]
    pub const fn validation(&self) -> Option<&ValidationFailure> {
        match self {
            Self::Validation(failure) | Self::PostStreamValidation(failure) => Some(failure),
            _ => None,
        }
    }

    pub(crate) fn from_prompt(id: &PromptSpecId, error: PromptError) -> Self {
        match error {
            PromptError::NotFound { .. } => Self::UnknownPrompt { id: id.clone() },
            other => Self::Prompt(other),
        }
    }
}

/// Result alias for orchestrator operations.
pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

#[cfg(test)]
mod tests {
    use super::*;
    use lean_guard::FieldProblem;

    #[test]
    fn validation_message_quotes_last_attempt() {
        let first = FieldError::new("confidence", "a number", FieldProblem::WrongType {
            found: "string".into(),
        });
        let second = FieldError::new("reason", "a string", FieldProblem::Missing);
        let error = OrchestratorError::Validation(ValidationFailure::new(vec![
            vec![first],
            vec![second.clone()],
        ]));

        assert_eq!(error.kind(), "validation_failed");
        assert_eq!(
            error.to_string(),
            format!("response failed validation: {second} after 2 attempt(s)")
        );
        assert_eq!(error.validation().unwrap().attempts().len(), 2);
    }

    #[test]
    fn kinds_distinguish_session_errors() {
        let session = SessionId::random();
        let busy: OrchestratorError = SessionError::Busy { session }.into();
        assert_eq!(busy.kind(), "session_busy");
        assert_eq!(
            busy.to_string(),
            format!("session {session} already has a turn in flight")
        );
    }

    #[test]
    fn missing_prompt_maps_to_unknown_prompt() {
        let id = PromptSpecId::new("mood/json").unwrap();
        let error = OrchestratorError::from_prompt(&id, PromptError::NotFound {
            id: id.to_string(),
        });
        assert!(matches!(error, OrchestratorError::UnknownPrompt { .. }));
    }
}
