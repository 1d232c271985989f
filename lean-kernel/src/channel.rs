//! Transport-agnostic session channel.
//!
//! A serving layer (WebSocket, stdin, test harness) hands the channel a stream
//! of raw inbound frames and a sender for outbound messages. For every frame
//! the channel emits zero or more `chunk` messages followed by exactly one
//! `complete` or `error`.
//!
//! A buffered channel (`with_streaming(false)`) sends no chunks. Invalid
//! responses then stay correctable, since nothing was delivered yet.
//!
//! One connection may address several routes. The channel keeps one session
//! per prompt, so frames without a `session_id` continue the session of their
//! own route.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use lean_primitives::{PromptSpecId, SessionId};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::error::OrchestratorResult;
use crate::orchestrator::{Orchestrator, TurnOutcome, TurnRequest, TurnUpdate};
use crate::routes::RouteTable;
use crate::scheduler::{SchedulerResult, TaskScheduler};
use crate::wire::{FrameError, InboundFrame, OutboundMessage, SessionRef};

const UPDATE_BUFFER: usize = 32;

/// Outbound side went away; the channel stops.
struct Disconnected;

/// Sessions announced to the caller, per prompt.
type Announced = HashMap<PromptSpecId, SessionId>;

/// Serves turns for one connected caller.
#[derive(Debug, Clone)]
pub struct SessionChannel {
    orchestrator: Orchestrator,
    routes: Arc<RouteTable>,
    streaming: bool,
}

impl SessionChannel {
    /// Creates a channel routing frames through `routes`.
    #[must_use]
    pub fn new(orchestrator: Orchestrator, routes: Arc<RouteTable>) -> Self {
        Self {
            orchestrator,
            routes,
            streaming: true,
        }
    }

    /// Chooses between forwarding chunks as they arrive (the default) and
    /// delivering only the validated result.
    #[must_use]
    pub const fn with_streaming(mut self, streaming: bool) -> Self {
        self.streaming = streaming;
        self
    }

    /// Route table used to resolve frame paths.
    #[must_use]
    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    /// Processes inbound frames until the stream ends or `outbound` closes.
    ///
    /// Turns run one at a time in arrival order. `session_init` is sent before
    /// the first turn of each prompt's session and again whenever that session
    /// changes, e.g. after the previous one expired.
    pub async fn serve<S>(&self, inbound: S, outbound: mpsc::Sender<OutboundMessage>)
    where
        S: Stream<Item = Bytes> + Send,
    {
        futures::pin_mut!(inbound);
        let mut announced = Announced::new();

        while let Some(raw) = inbound.next().await {
            if self.handle_frame(&raw, &mut announced, &outbound).await.is_err() {
                debug!("outbound side closed; session channel stopping");
                return;
            }
        }
        debug!("inbound stream ended");
    }

    /// Runs [`SessionChannel::serve`] as a task on `scheduler`.
    ///
    /// # Errors
    ///
    /// Returns a scheduler error when the scheduler is closed.
    pub fn spawn<S>(
        self,
        scheduler: &TaskScheduler,
        inbound: S,
        outbound: mpsc::Sender<OutboundMessage>,
    ) -> SchedulerResult<JoinHandle<Option<()>>>
    where
        S: Stream<Item = Bytes> + Send + 'static,
    {
        scheduler.spawn("session-channel", async move { self.serve(inbound, outbound).await })
    }

    async fn handle_frame(
        &self,
        raw: &[u8],
        announced: &mut Announced,
        outbound: &mpsc::Sender<OutboundMessage>,
    ) -> Result<(), Disconnected> {
        if outbound.is_closed() {
            return Err(Disconnected);
        }
        let frame = match InboundFrame::decode(raw) {
            Ok(frame) => frame,
            Err(err) => return send(outbound, err.into()).await,
        };
        let Some(prompt) = self.routes.resolve(&frame.path) else {
            return send(outbound, FrameError::NoRoute { path: frame.path }.into()).await;
        };

        let session = match frame.session {
            SessionRef::Current => announced.get(prompt).copied(),
            SessionRef::Id(id) => Some(id),
            SessionRef::Unrecognized => None,
        };
        let request = TurnRequest::new(prompt.clone(), frame.message).with_optional_session(session);

        let result = self.run_turn(request, announced, outbound).await?;
        let message = match result {
            Ok(outcome) => {
                info!(session_id = %outcome.session, sequence = outcome.sequence, "turn delivered");
                OutboundMessage::Complete {
                    result: outcome.result,
                }
            }
            Err(err) => {
                debug!(kind = err.kind(), %err, "turn failed");
                OutboundMessage::from_error(&err)
            }
        };
        send(outbound, message).await
    }

    /// Runs the turn while relaying its updates, so `session_init` precedes
    /// the terminal message in both delivery modes.
    async fn run_turn(
        &self,
        request: TurnRequest,
        announced: &mut Announced,
        outbound: &mpsc::Sender<OutboundMessage>,
    ) -> Result<OrchestratorResult<TurnOutcome>, Disconnected> {
        let prompt = request.prompt().clone();
        let (updates_tx, mut updates) = mpsc::channel(UPDATE_BUFFER);
        let turn = async {
            if self.streaming {
                self.orchestrator.stream_turn(request, updates_tx).await
            } else {
                self.orchestrator.buffered_turn(request, updates_tx).await
            }
        };
        futures::pin_mut!(turn);

        let result = loop {
            tokio::select! {
                biased;
                Some(update) = updates.recv() => forward(update, &prompt, announced, outbound).await?,
                result = &mut turn => break result,
            }
        };
        while let Ok(update) = updates.try_recv() {
            forward(update, &prompt, announced, outbound).await?;
        }
        Ok(result)
    }
}

async fn forward(
    update: TurnUpdate,
    prompt: &PromptSpecId,
    announced: &mut Announced,
    outbound: &mpsc::Sender<OutboundMessage>,
) -> Result<(), Disconnected> {
    match update {
        TurnUpdate::Session { session, .. } => {
            if announced.get(prompt) == Some(&session) {
                return Ok(());
            }
            announced.insert(prompt.clone(), session);
            send(outbound, OutboundMessage::SessionInit { session_id: session }).await
        }
        TurnUpdate::Chunk(text) => send(outbound, OutboundMessage::Chunk { text }).await,
    }
}

async fn send(
    outbound: &mpsc::Sender<OutboundMessage>,
    message: OutboundMessage,
) -> Result<(), Disconnected> {
    outbound.send(message).await.map_err(|_| Disconnected)
}
