//! Scripted provider gateway and fixtures shared by the integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream;
use lean_gateway::{
    GatewayMetadata, GatewayRequest, GatewayResult, ProviderGateway, ResponseChunk,
    ResponseStream, TransportError,
};
use lean_kernel::{Orchestrator, OrchestratorConfig, RetryPolicy, SessionRegistry};
use lean_primitives::{PromptSpecId, SessionId};
use lean_prompts::{PromptSpec, PromptStore, ResponseSchema};
use tokio::sync::Notify;

pub const MOOD_PROMPT: &str = "mood/json";
pub const CALC_PROMPT: &str = "calc/add";
pub const MOOD_BODY: &str = "Analyse the user's mood and answer in JSON.";
pub const VALID: &str = r#"{"current_mood":"happy","confidence":0.9,"reason":"said great"}"#;
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// One scripted provider reaction.
#[derive(Clone)]
pub enum Reply {
    /// Single final chunk.
    Text(String),
    /// Several chunks, the last one final.
    Chunks(Vec<String>),
    /// Immediate transport failure.
    Fail(TransportError),
    /// Waits for the gate before answering with the text.
    Gated(Arc<Notify>, String),
    /// Never answers.
    Stall,
}

impl Reply {
    pub fn text(text: &str) -> Self {
        Self::Text(text.to_owned())
    }

    pub fn chunks(parts: &[&str]) -> Self {
        Self::Chunks(parts.iter().map(|part| (*part).to_owned()).collect())
    }
}

/// In-memory gateway answering from a script and recording every request.
pub struct ScriptedGateway {
    metadata: GatewayMetadata,
    script: Mutex<VecDeque<Reply>>,
    requests: Mutex<Vec<GatewayRequest>>,
    released: Mutex<Vec<SessionId>>,
}

impl ScriptedGateway {
    pub fn new(replies: impl IntoIterator<Item = Reply>) -> Arc<Self> {
        Arc::new(Self {
            metadata: GatewayMetadata::new("scripted", "test-model"),
            script: Mutex::new(replies.into_iter().collect()),
            requests: Mutex::new(Vec::new()),
            released: Mutex::new(Vec::new()),
        })
    }

    pub fn push(&self, reply: Reply) {
        self.script.lock().unwrap().push_back(reply);
    }

    pub fn requests(&self) -> Vec<GatewayRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn released(&self) -> Vec<SessionId> {
        self.released.lock().unwrap().clone()
    }
}

fn single(text: String) -> ResponseStream {
    Box::pin(stream::iter(vec![Ok(ResponseChunk::new(text, true))]))
}

#[async_trait]
impl ProviderGateway for ScriptedGateway {
    fn metadata(&self) -> &GatewayMetadata {
        &self.metadata
    }

    async fn send(&self, request: GatewayRequest) -> GatewayResult<ResponseStream> {
        self.requests.lock().unwrap().push(request);
        let reply = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Reply::Fail(TransportError::rejected("script exhausted")));

        match reply {
            Reply::Text(text) => Ok(single(text)),
            Reply::Chunks(parts) => {
                let last = parts.len().saturating_sub(1);
                let chunks: Vec<GatewayResult<ResponseChunk>> = parts
                    .into_iter()
                    .enumerate()
                    .map(|(index, part)| Ok(ResponseChunk::new(part, index == last)))
                    .collect();
                Ok(Box::pin(stream::iter(chunks)))
            }
            Reply::Fail(error) => Err(error),
            Reply::Gated(gate, text) => {
                gate.notified().await;
                Ok(single(text))
            }
            Reply::Stall => std::future::pending().await,
        }
    }

    async fn release(&self, session: SessionId) {
        self.released.lock().unwrap().push(session);
    }
}

pub fn mood_id() -> PromptSpecId {
    PromptSpecId::new(MOOD_PROMPT).unwrap()
}

pub fn mood_prompt() -> PromptSpec {
    let schema = ResponseSchema::parse([
        ("current_mood", "string"),
        ("confidence", "float[0,1]"),
        ("reason", "string"),
    ])
    .unwrap();
    PromptSpec::new(mood_id(), MOOD_BODY).with_schema(schema)
}

pub fn calc_id() -> PromptSpecId {
    PromptSpecId::new(CALC_PROMPT).unwrap()
}

/// Schema-less prompt; any text is a valid answer.
pub fn calc_prompt() -> PromptSpec {
    PromptSpec::new(calc_id(), "Add the numbers and answer with the sum only.")
}

pub fn config() -> OrchestratorConfig {
    OrchestratorConfig {
        retry: RetryPolicy::new(3, Duration::from_millis(100), Duration::from_secs(1)),
        call_timeout: Duration::from_secs(5),
        correction_budget: 1,
        summarize_after_turns: 10,
    }
}

pub async fn orchestrator(gateway: &Arc<ScriptedGateway>, config: OrchestratorConfig) -> Orchestrator {
    orchestrator_over(Arc::clone(gateway) as Arc<dyn ProviderGateway>, config).await
}

/// Orchestrator over any gateway, with the mood and calc prompts loaded.
pub async fn orchestrator_over(
    gateway: Arc<dyn ProviderGateway>,
    config: OrchestratorConfig,
) -> Orchestrator {
    let prompts = PromptStore::new();
    prompts.insert(mood_prompt()).await;
    prompts.insert(calc_prompt()).await;
    Orchestrator::new(
        Arc::new(SessionRegistry::new(IDLE_TIMEOUT)),
        Arc::new(prompts),
        gateway,
        config,
    )
}
