//! Session runtime for LeanPrompt.
//!
//! The kernel owns the session registry, the per-turn orchestration loop
//! (context caching, transport retry, guardrail self-correction and session
//! summarization), and the transport-agnostic session channel that streams
//! results to callers.

#![warn(missing_docs, clippy::pedantic)]

pub mod channel;
pub mod orchestrator;
pub mod retry;
pub mod routes;
pub mod scheduler;
pub mod session;
pub mod summary;
pub mod sweeper;
pub mod turn_state;
pub mod wire;

mod error;

pub use channel::SessionChannel;
pub use error::{
    OrchestratorError, OrchestratorResult, SessionError, SessionResult, ValidationFailure,
};
pub use orchestrator::{Orchestrator, OrchestratorConfig, TurnOutcome, TurnRequest, TurnUpdate};
pub use retry::RetryPolicy;
pub use routes::{RouteError, RouteTable, normalize_path};
pub use scheduler::{SchedulerConfig, SchedulerError, SchedulerResult, TaskScheduler};
pub use session::{SessionRegistry, SessionSnapshot, Turn, TurnLease};
pub use sweeper::Sweeper;
pub use turn_state::{TurnEvent, TurnMachine, TurnState, TurnStateError};
pub use wire::{FrameError, InboundFrame, OutboundMessage, SessionRef};
