//! State machine for one conversational turn.

use lean_primitives::SessionId;
use thiserror::Error;
use tracing::debug;

/// Discrete states a turn moves through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    /// Request built, not yet handed to the gateway.
    AwaitingSend,
    /// Request handed to the gateway; response pending.
    Sent,
    /// Response assembled and being checked against the schema.
    Validating,
    /// Validation failed; a corrective delta is about to be sent.
    Retrying,
    /// Turn produced a valid result.
    Done,
    /// Turn failed terminally.
    Failed,
}

impl TurnState {
    /// Returns `true` for `Done` and `Failed`.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

/// Events driving a turn forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnEvent {
    /// The gateway accepted a request.
    Send,
    /// The full response text is available.
    ResponseReady,
    /// The response conforms to the schema.
    Accept,
    /// The response is invalid and the correction budget allows another try.
    Correct,
    /// Transport failure, exhausted budget or a non-retractable stream.
    Fail,
}

/// Turn state tracker bound to one session.
#[derive(Debug, Clone, Copy)]
pub struct TurnMachine {
    session: SessionId,
    state: TurnState,
}

impl TurnMachine {
    /// Starts a machine in [`TurnState::AwaitingSend`].
    #[must_use]
    pub const fn new(session: SessionId) -> Self {
        Self {
            session,
            state: TurnState::AwaitingSend,
        }
    }

    /// Returns the current state.
    #[must_use]
    pub const fn state(&self) -> TurnState {
        self.state
    }

    /// Applies an event, returning the resulting state.
    ///
    /// # Errors
    ///
    /// Returns [`TurnStateError::InvalidTransition`] when `event` is not allowed
    /// from the current state.
    pub fn transition(&mut self, event: TurnEvent) -> Result<TurnState, TurnStateError> {
        let next = match (self.state, event) {
            (TurnState::AwaitingSend | TurnState::Retrying, TurnEvent::Send) => {
                Some(TurnState::Sent)
            }
            (TurnState::Sent, TurnEvent::ResponseReady) => Some(TurnState::Validating),
            (TurnState::Validating, TurnEvent::Accept) => Some(TurnState::Done),
            (TurnState::Validating, TurnEvent::Correct) => Some(TurnState::Retrying),
            (
                TurnState::AwaitingSend
                | TurnState::Sent
                | TurnState::Validating
                | TurnState::Retrying,
                TurnEvent::Fail,
            ) => Some(TurnState::Failed),
            _ => None,
        };

        let Some(next_state) = next else {
            return Err(TurnStateError::InvalidTransition {
                session: self.session,
                from: self.state,
                event,
            });
        };

        debug!(
            session_id = %self.session,
            from = ?self.state,
            to = ?next_state,
            ?event,
            "turn state transition"
        );
        self.state = next_state;
        Ok(next_state)
    }
}

/// Errors emitted by the turn state machine.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TurnStateError {
    /// Transition not permitted from the current state.
    #[error("invalid turn transition from {from:?} via {event:?} for session {session}")]
    InvalidTransition {
        /// Session owning the turn.
        session: SessionId,
        /// State before the attempted transition.
        from: TurnState,
        /// Rejected event.
        event: TurnEvent,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path() {
        let mut machine = TurnMachine::new(SessionId::random());
        machine.transition(TurnEvent::Send).unwrap();
        machine.transition(TurnEvent::ResponseReady).unwrap();
        assert_eq!(machine.transition(TurnEvent::Accept).unwrap(), TurnState::Done);
        assert!(machine.state().is_terminal());
    }

    #[test]
    fn correction_loops_back_to_sent() {
        let mut machine = TurnMachine::new(SessionId::random());
        machine.transition(TurnEvent::Send).unwrap();
        machine.transition(TurnEvent::ResponseReady).unwrap();
        machine.transition(TurnEvent::Correct).unwrap();
        assert_eq!(machine.state(), TurnState::Retrying);
        assert_eq!(machine.transition(TurnEvent::Send).unwrap(), TurnState::Sent);
    }

    #[test]
    fn transport_failure_from_sent() {
        let mut machine = TurnMachine::new(SessionId::random());
        machine.transition(TurnEvent::Send).unwrap();
        assert_eq!(machine.transition(TurnEvent::Fail).unwrap(), TurnState::Failed);
    }

    #[test]
    fn terminal_states_reject_events() {
        let mut machine = TurnMachine::new(SessionId::random());
        machine.transition(TurnEvent::Fail).unwrap();
        let err = machine.transition(TurnEvent::Send).unwrap_err();
        assert!(matches!(
            err,
            TurnStateError::InvalidTransition {
                from: TurnState::Failed,
                event: TurnEvent::Send,
                ..
            }
        ));
    }

    #[test]
    fn cannot_accept_before_validating() {
        let mut machine = TurnMachine::new(SessionId::random());
        machine.transition(TurnEvent::Send).unwrap();
        assert!(machine.transition(TurnEvent::Accept).is_err());
        assert_eq!(machine.state(), TurnState::Sent);
    }
}
