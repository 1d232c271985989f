//! Turn execution: context caching, transport retry and guardrail self-correction.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use lean_config::RuntimeConfig;
use lean_gateway::{
    ContextKey, GatewayRequest, PromptMessage, ProviderGateway, TransportError, collect_response,
};
use lean_guard::{FieldError, ValidationResult, corrective_instruction, validate};
use lean_primitives::{PromptSpecId, SessionId};
use lean_prompts::{PromptSpec, PromptStore};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{OrchestratorError, OrchestratorResult, ValidationFailure};
use crate::retry::RetryPolicy;
use crate::scheduler::{SchedulerResult, TaskScheduler};
use crate::session::{SessionRegistry, SessionSnapshot, Turn};
use crate::summary::{SUMMARY_INSTRUCTION, local_digest};
use crate::sweeper::Sweeper;
use crate::turn_state::{TurnEvent, TurnMachine};

/// Limits applied to every turn.
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorConfig {
    /// Backoff schedule for transient transport failures.
    pub retry: RetryPolicy,
    /// Upper bound on a single gateway call, including stream draining.
    pub call_timeout: Duration,
    /// Corrective deltas allowed per turn after the first invalid response.
    pub correction_budget: u32,
    /// Turns after which the session is condensed into a summary.
    pub summarize_after_turns: u32,
}

impl OrchestratorConfig {
    /// Derives the orchestrator limits from runtime configuration.
    #[must_use]
    pub fn from_runtime(config: &RuntimeConfig) -> Self {
        Self {
            retry: RetryPolicy::from(&config.transport),
            call_timeout: config.transport.call_timeout(),
            correction_budget: config.guardrail.correction_budget,
            summarize_after_turns: config.session.summarize_after_turns,
        }
    }
}

/// One inbound user message addressed to a prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnRequest {
    prompt: PromptSpecId,
    input: String,
    session: Option<SessionId>,
}

impl TurnRequest {
    /// Creates a request that starts a new session.
    #[must_use]
    pub fn new(prompt: PromptSpecId, input: impl Into<String>) -> Self {
        Self {
            prompt,
            input: input.into(),
            session: None,
        }
    }

    /// Continues an existing session.
    #[must_use]
    pub const fn with_session(mut self, session: SessionId) -> Self {
        self.session = Some(session);
        self
    }

    /// Continues `session` when one is given.
    #[must_use]
    pub const fn with_optional_session(mut self, session: Option<SessionId>) -> Self {
        self.session = session;
        self
    }

    /// Target prompt.
    #[must_use]
    pub const fn prompt(&self) -> &PromptSpecId {
        &self.prompt
    }

    /// User input.
    #[must_use]
    pub fn input(&self) -> &str {
        &self.input
    }

    /// Session the caller asked to continue.
    #[must_use]
    pub const fn session(&self) -> Option<SessionId> {
        self.session
    }
}

/// Progress reported while a streamed turn runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnUpdate {
    /// The session serving this turn; `created` when it was just allocated.
    Session {
        /// Session identifier.
        session: SessionId,
        /// Whether the session was created for this turn.
        created: bool,
    },
    /// A fragment of the response, forwarded as soon as it arrives.
    Chunk(String),
}

/// Result of a successful turn.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnOutcome {
    /// Session that served the turn.
    pub session: SessionId,
    /// Whether the session was created for this turn.
    pub created: bool,
    /// Validated output.
    pub result: Value,
    /// Sequence number of the recorded turn.
    pub sequence: u64,
    /// Corrective deltas the turn needed.
    pub corrections: u32,
    /// Whether the session context was condensed after this turn.
    pub summarized: bool,
}

/// Drives turns for every session against a single provider gateway.
#[derive(Clone)]
pub struct Orchestrator {
    registry: Arc<SessionRegistry>,
    prompts: Arc<PromptStore>,
    gateway: Arc<dyn ProviderGateway>,
    config: OrchestratorConfig,
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let metadata = self.gateway.metadata();
        f.debug_struct("Orchestrator")
            .field("provider", &metadata.provider())
            .field("model", &metadata.model())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Creates an orchestrator.
    #[must_use]
    pub fn new(
        registry: Arc<SessionRegistry>,
        prompts: Arc<PromptStore>,
        gateway: Arc<dyn ProviderGateway>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            registry,
            prompts,
            gateway,
            config,
        }
    }

    /// Session registry backing the orchestrator.
    #[must_use]
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Prompt store backing the orchestrator.
    #[must_use]
    pub fn prompts(&self) -> &Arc<PromptStore> {
        &self.prompts
    }

    /// Gateway used for provider calls.
    #[must_use]
    pub fn gateway(&self) -> &Arc<dyn ProviderGateway> {
        &self.gateway
    }

    /// Active limits.
    #[must_use]
    pub const fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Starts the idle-session sweeper on `scheduler`.
    ///
    /// # Errors
    ///
    /// Returns a scheduler error when the scheduler is closed.
    pub fn start_sweeper(
        &self,
        interval: Duration,
        scheduler: &TaskScheduler,
    ) -> SchedulerResult<Sweeper> {
        Sweeper::start(
            Arc::clone(&self.registry),
            Arc::clone(&self.gateway),
            interval,
            scheduler,
        )
    }

    /// Runs one turn and returns the validated result.
    ///
    /// # Errors
    ///
    /// Returns session errors untouched, transport errors after retries are
    /// exhausted and [`OrchestratorError::Validation`] once the correction
    /// budget is spent.
    pub async fn handle_turn(&self, request: TurnRequest) -> OrchestratorResult<TurnOutcome> {
        self.run_turn(request, None, Delivery::Buffered).await
    }

    /// Runs one turn, forwarding session info and response chunks to `updates`.
    ///
    /// If the receiving side of `updates` is dropped the turn is abandoned with
    /// [`OrchestratorError::Cancelled`] and nothing is recorded.
    ///
    /// # Errors
    ///
    /// As [`Orchestrator::handle_turn`], plus
    /// [`OrchestratorError::PostStreamValidation`] when an already streamed
    /// response fails validation.
    pub async fn stream_turn(
        &self,
        request: TurnRequest,
        updates: mpsc::Sender<TurnUpdate>,
    ) -> OrchestratorResult<TurnOutcome> {
        self.run_turn(request, Some(&updates), Delivery::Streamed).await
    }

    /// Runs one turn, reporting the serving session to `updates` before any
    /// provider call but holding response chunks back.
    ///
    /// Nothing reaches the caller before validation, so invalid responses stay
    /// correctable. Cancellation behaves as in [`Orchestrator::stream_turn`].
    ///
    /// # Errors
    ///
    /// As [`Orchestrator::handle_turn`], plus
    /// [`OrchestratorError::Cancelled`] when `updates` is closed.
    pub async fn buffered_turn(
        &self,
        request: TurnRequest,
        updates: mpsc::Sender<TurnUpdate>,
    ) -> OrchestratorResult<TurnOutcome> {
        self.run_turn(request, Some(&updates), Delivery::Buffered).await
    }

    /// Removes a session and drops the context the gateway keeps for it.
    ///
    /// Returns `true` when the session existed.
    pub async fn expire(&self, session: SessionId) -> bool {
        let removed = self.registry.expire(session).await;
        self.gateway.release(session).await;
        removed
    }

    async fn run_turn(
        &self,
        request: TurnRequest,
        updates: Option<&mpsc::Sender<TurnUpdate>>,
        delivery: Delivery,
    ) -> OrchestratorResult<TurnOutcome> {
        let spec = self
            .prompts
            .resolve(request.prompt())
            .await
            .map_err(|err| OrchestratorError::from_prompt(request.prompt(), err))?;

        let (snapshot, created) = self.registry.get_or_create(request.session(), &spec).await?;
        if let Some(stale) = request.session().filter(|_| created) {
            // The requested session expired; drop whatever the provider kept for it.
            self.gateway.release(stale).await;
        }
        let lease = self.registry.begin_turn(snapshot.id).await?;

        if let Some(updates) = updates {
            updates
                .send(TurnUpdate::Session {
                    session: snapshot.id,
                    created,
                })
                .await
                .map_err(|_| OrchestratorError::Cancelled)?;
        }

        let mut turn = TurnRun {
            orchestrator: self,
            spec: &spec,
            snapshot: &snapshot,
            key: ContextKey::new(snapshot.id, spec.hash()),
            machine: TurnMachine::new(snapshot.id),
            context_sent: snapshot.context_sent,
            updates,
            delivery,
            forwarded: 0,
        };
        let (result, corrections) = turn.execute(request.input()).await?;

        let sequence = self
            .registry
            .record_turn(snapshot.id, Turn::new(request.input(), result.clone(), corrections))
            .await?;
        info!(
            session_id = %snapshot.id,
            prompt = %spec.id(),
            sequence,
            corrections,
            "turn completed"
        );

        let summarized = self.maybe_summarize(&spec, snapshot.id).await?;
        drop(lease);

        Ok(TurnOutcome {
            session: snapshot.id,
            created,
            result,
            sequence,
            corrections,
            summarized,
        })
    }

    async fn maybe_summarize(&self, spec: &PromptSpec, session: SessionId) -> OrchestratorResult<bool> {
        let snapshot = self.registry.snapshot(session).await?;
        if snapshot.turns_since_reset <= self.config.summarize_after_turns {
            return Ok(false);
        }

        let key = ContextKey::new(session, spec.hash());
        let summary = match self.request_summary(spec, key).await {
            Ok(text) if !text.trim().is_empty() => text.trim().to_owned(),
            Ok(_) => {
                warn!(session_id = %session, "summarization returned no text; using local digest");
                local_digest(&self.registry.history(session).await?)
            }
            Err(err) => {
                warn!(session_id = %session, %err, "summarization failed; using local digest");
                local_digest(&self.registry.history(session).await?)
            }
        };

        self.registry.reset_context(session, Some(summary)).await?;
        self.gateway.release(session).await;
        info!(
            session_id = %session,
            turns = snapshot.turns_since_reset,
            "session context condensed"
        );
        Ok(true)
    }

    async fn request_summary(&self, spec: &PromptSpec, key: ContextKey) -> Result<String, TransportError> {
        let request = apply_params(
            GatewayRequest::delta(key, vec![PromptMessage::user(SUMMARY_INSTRUCTION)])?,
            spec,
        );
        let call = async {
            let stream = self.gateway.send(request).await?;
            collect_response(stream).await
        };
        tokio::time::timeout(self.config.call_timeout, call)
            .await
            .map_err(|_| TransportError::unavailable("summarization call timed out"))?
    }

    fn transport_error(&self, source: TransportError) -> OrchestratorError {
        OrchestratorError::Transport {
            provider: self.gateway.metadata().provider(),
            source,
        }
    }
}

/// Mutable state of one turn in flight.
struct TurnRun<'a> {
    orchestrator: &'a Orchestrator,
    spec: &'a PromptSpec,
    snapshot: &'a SessionSnapshot,
    key: ContextKey,
    machine: TurnMachine,
    context_sent: bool,
    updates: Option<&'a mpsc::Sender<TurnUpdate>>,
    delivery: Delivery,
    forwarded: usize,
}

impl TurnRun<'_> {
    /// Sends, validates and self-corrects until the turn reaches a terminal state.
    async fn execute(&mut self, input: &str) -> OrchestratorResult<(Value, u32)> {
        let budget = self.orchestrator.config.correction_budget;
        let mut attempts: Vec<Vec<FieldError>> = Vec::new();
        let mut corrections = 0_u32;
        let mut message = input.to_owned();

        loop {
            let request = match self.build_request(message) {
                Ok(request) => request,
                Err(source) => {
                    let error = self.orchestrator.transport_error(source);
                    return Err(self.fail(error));
                }
            };
            let was_full = request.is_full();
            self.machine.transition(TurnEvent::Send)?;

            let text = match self.send_with_retry(request).await {
                Ok(text) => text,
                Err(err) => return Err(self.fail(err)),
            };
            if was_full {
                self.orchestrator.registry.mark_context_sent(self.snapshot.id).await?;
                self.context_sent = true;
            }

            self.machine.transition(TurnEvent::ResponseReady)?;
            let errors = match validate(&text, self.spec.schema()) {
                ValidationResult::Valid(value) => {
                    self.machine.transition(TurnEvent::Accept)?;
                    return Ok((value, corrections));
                }
                ValidationResult::Invalid(errors) => errors,
            };

            debug!(
                session_id = %self.snapshot.id,
                attempt = attempts.len() + 1,
                errors = errors.len(),
                "response failed validation"
            );
            let instruction = corrective_instruction(&errors, self.spec.schema());
            attempts.push(errors);

            if self.forwarded > 0 {
                self.machine.transition(TurnEvent::Fail)?;
                return Err(OrchestratorError::PostStreamValidation(ValidationFailure::new(
                    attempts,
                )));
            }
            if corrections >= budget {
                self.machine.transition(TurnEvent::Fail)?;
                return Err(OrchestratorError::Validation(ValidationFailure::new(attempts)));
            }

            self.machine.transition(TurnEvent::Correct)?;
            corrections += 1;
            warn!(
                session_id = %self.snapshot.id,
                prompt = %self.spec.id(),
                attempt = corrections,
                budget,
                "sending corrective delta"
            );
            message = instruction;
        }
    }

    fn build_request(&self, message: String) -> Result<GatewayRequest, TransportError> {
        let messages = vec![PromptMessage::user(message)];
        let request = if self.context_sent {
            GatewayRequest::delta(self.key, messages)?
        } else {
            GatewayRequest::full(
                self.key,
                self.spec.system_prompt(self.snapshot.summary.as_deref()),
                messages,
            )?
        };
        Ok(apply_params(request, self.spec).with_streaming(self.delivery == Delivery::Streamed))
    }

    async fn send_with_retry(&mut self, request: GatewayRequest) -> OrchestratorResult<String> {
        let policy = self.orchestrator.config.retry.clone();
        let provider = self.orchestrator.gateway.metadata().provider();
        let mut attempt = 0_u32;

        loop {
            if self.updates.is_some_and(|updates| updates.is_closed()) {
                return Err(OrchestratorError::Cancelled);
            }
            attempt += 1;

            let timeout = self.orchestrator.config.call_timeout;
            let outcome = match tokio::time::timeout(timeout, self.send_once(request.clone())).await {
                Ok(outcome) => outcome,
                Err(_) => Err(SendFailure::Transport(TransportError::unavailable(format!(
                    "gateway call exceeded {}s",
                    timeout.as_secs_f64()
                )))),
            };

            let error = match outcome {
                Ok(text) => return Ok(text),
                Err(SendFailure::Cancelled) => return Err(OrchestratorError::Cancelled),
                Err(SendFailure::Transport(error)) => error,
            };

            if !error.is_retryable() || self.forwarded > 0 || !policy.allows_retry(attempt) {
                return Err(self.orchestrator.transport_error(error));
            }

            let delay = policy.delay_for(&error, attempt - 1);
            warn!(
                session_id = %self.snapshot.id,
                provider,
                attempt,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                %error,
                "gateway call failed; retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    async fn send_once(&mut self, request: GatewayRequest) -> Result<String, SendFailure> {
        let mut stream = self
            .orchestrator
            .gateway
            .send(request)
            .await
            .map_err(SendFailure::Transport)?;

        let mut text = String::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(SendFailure::Transport)?;
            if !chunk.delta.is_empty() {
                if let Some(updates) = self.updates.filter(|_| self.delivery == Delivery::Streamed) {
                    updates
                        .send(TurnUpdate::Chunk(chunk.delta.clone()))
                        .await
                        .map_err(|_| SendFailure::Cancelled)?;
                    self.forwarded += 1;
                }
                text.push_str(&chunk.delta);
            }
            if chunk.done {
                break;
            }
        }
        Ok(text)
    }

    fn fail(&mut self, error: OrchestratorError) -> OrchestratorError {
        if let Err(transition) = self.machine.transition(TurnEvent::Fail) {
            return transition.into();
        }
        error
    }
}

/// Whether response chunks reach the caller before validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    Streamed,
    Buffered,
}

enum SendFailure {
    Transport(TransportError),
    Cancelled,
}

fn apply_params(mut request: GatewayRequest, spec: &PromptSpec) -> GatewayRequest {
    let params = spec.params();
    if let Some(model) = &params.model {
        request = request.with_model(model.clone());
    }
    if let Some(temperature) = params.temperature {
        request = request.with_temperature(temperature);
    }
    if let Some(tokens) = params.max_output_tokens {
        request = request.with_max_output_tokens(tokens);
    }
    request
}
