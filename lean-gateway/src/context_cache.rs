//! Client-side context caching for providers without server-side sessions.
//!
//! [`ContextCache`] wraps any [`ProviderGateway`] and keeps, per session, the
//! system prompt plus the transcript of completed exchanges. Delta requests are
//! expanded into full requests before reaching the wrapped gateway, so the
//! orchestrator can send only the new turn regardless of provider.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::{StreamExt, stream};
use lean_primitives::{ContentHash, SessionId};
use tokio::sync::Mutex;
use tracing::{debug, trace};

use crate::traits::{
    ContextKey, GatewayMetadata, GatewayRequest, GatewayResult, PromptMessage, ProviderGateway,
    RequestShape, ResponseStream, TransportError,
};

#[derive(Debug, Clone)]
struct CachedContext {
    prompt_hash: ContentHash,
    system_prompt: String,
    transcript: Vec<PromptMessage>,
}

type Entries = Arc<Mutex<HashMap<SessionId, CachedContext>>>;

/// Gateway decorator that emulates provider-side prefix caching.
pub struct ContextCache<G> {
    inner: G,
    entries: Entries,
}

impl<G> ContextCache<G> {
    /// Wraps the supplied gateway.
    #[must_use]
    pub fn new(inner: G) -> Self {
        Self {
            inner,
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Returns the wrapped gateway.
    #[must_use]
    pub const fn inner(&self) -> &G {
        &self.inner
    }

    /// Returns the number of cached messages for the session, if cached.
    pub async fn cached_messages(&self, session: SessionId) -> Option<usize> {
        self.entries
            .lock()
            .await
            .get(&session)
            .map(|entry| entry.transcript.len())
    }

    /// Returns the number of sessions with a cached context.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Returns `true` when nothing is cached.
    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    async fn expand(&self, request: GatewayRequest) -> GatewayResult<(GatewayRequest, Pending)> {
        let key = request.key();
        match request.shape() {
            RequestShape::Full { system_prompt } => {
                let pending = Pending {
                    key,
                    system_prompt: Some(system_prompt.clone()),
                    messages: request.messages().to_vec(),
                };
                Ok((request, pending))
            }
            RequestShape::Delta => {
                let entries = self.entries.lock().await;
                let entry = entries.get(&key.session()).ok_or_else(|| {
                    TransportError::rejected(format!(
                        "no cached context for session {}",
                        key.session()
                    ))
                })?;

                if entry.prompt_hash != key.prompt_hash() {
                    return Err(TransportError::rejected(format!(
                        "cached context for session {} belongs to prompt {}",
                        key.session(),
                        entry.prompt_hash.short()
                    )));
                }

                let mut messages = entry.transcript.clone();
                messages.extend_from_slice(request.messages());
                let expanded = request.expand(entry.system_prompt.clone(), messages);
                trace!(
                    session = %key.session(),
                    messages = expanded.messages().len(),
                    "expanded delta request"
                );

                let pending = Pending {
                    key,
                    system_prompt: None,
                    messages: request.into_messages(),
                };
                Ok((expanded, pending))
            }
        }
    }
}

#[async_trait]
impl<G> ProviderGateway for ContextCache<G>
where
    G: ProviderGateway,
{
    fn metadata(&self) -> &GatewayMetadata {
        self.inner.metadata()
    }

    async fn send(&self, request: GatewayRequest) -> GatewayResult<ResponseStream> {
        let (request, pending) = self.expand(request).await?;
        let inner = self.inner.send(request).await?;

        let state = Recording {
            inner,
            entries: Arc::clone(&self.entries),
            pending: Some(pending),
            reply: String::new(),
            finished: false,
        };

        let stream = stream::unfold(state, |mut state| async move {
            if state.finished {
                return None;
            }
            match state.inner.next().await {
                Some(Ok(chunk)) => {
                    state.reply.push_str(&chunk.delta);
                    if chunk.done {
                        state.commit().await;
                        state.finished = true;
                    }
                    Some((Ok(chunk), state))
                }
                Some(Err(err)) => {
                    state.finished = true;
                    Some((Err(err), state))
                }
                None => {
                    state.commit().await;
                    None
                }
            }
        });

        Ok(Box::pin(stream))
    }

    async fn release(&self, session: SessionId) {
        if self.entries.lock().await.remove(&session).is_some() {
            debug!(%session, "released cached context");
        }
        self.inner.release(session).await;
    }
}

/// Exchange to record once the wrapped stream completes.
struct Pending {
    key: ContextKey,
    system_prompt: Option<String>,
    messages: Vec<PromptMessage>,
}

struct Recording {
    inner: ResponseStream,
    entries: Entries,
    pending: Option<Pending>,
    reply: String,
    finished: bool,
}

impl Recording {
    async fn commit(&mut self) {
        let Some(pending) = self.pending.take() else {
            return;
        };

        let reply = PromptMessage::assistant(std::mem::take(&mut self.reply));
        let session = pending.key.session();
        let mut entries = self.entries.lock().await;

        if let Some(system_prompt) = pending.system_prompt {
            let mut transcript = pending.messages;
            transcript.push(reply);
            entries.insert(
                session,
                CachedContext {
                    prompt_hash: pending.key.prompt_hash(),
                    system_prompt,
                    transcript,
                },
            );
            return;
        }

        match entries.get_mut(&session) {
            Some(entry) if entry.prompt_hash == pending.key.prompt_hash() => {
                entry.transcript.extend(pending.messages);
                entry.transcript.push(reply);
            }
            _ => debug!(%session, "cached context replaced during delta turn"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::{ResponseChunk, collect_response};
    use std::sync::Mutex as StdMutex;

    /// Records every request and answers with a fixed reply.
    struct Recorder {
        metadata: GatewayMetadata,
        seen: Arc<StdMutex<Vec<GatewayRequest>>>,
        fail: bool,
    }

    impl Recorder {
        fn new(fail: bool) -> (Self, Arc<StdMutex<Vec<GatewayRequest>>>) {
            let seen = Arc::new(StdMutex::new(Vec::new()));
            let recorder = Self {
                metadata: GatewayMetadata::new("recorder", "test"),
                seen: Arc::clone(&seen),
                fail,
            };
            (recorder, seen)
        }
    }

    #[async_trait]
    impl ProviderGateway for Recorder {
        fn metadata(&self) -> &GatewayMetadata {
            &self.metadata
        }

        async fn send(&self, request: GatewayRequest) -> GatewayResult<ResponseStream> {
            self.seen.lock().unwrap().push(request);
            if self.fail {
                let chunks = vec![
                    Ok(ResponseChunk::new("par", false)),
                    Err(TransportError::unavailable("reset")),
                ];
                return Ok(Box::pin(stream::iter(chunks)));
            }
            let chunks = vec![
                Ok(ResponseChunk::new("o", false)),
                Ok(ResponseChunk::new("k", true)),
            ];
            Ok(Box::pin(stream::iter(chunks)))
        }
    }

    fn key(session: SessionId) -> ContextKey {
        ContextKey::new(session, ContentHash::of("system"))
    }

    #[tokio::test]
    async fn delta_without_context_is_rejected() {
        let (recorder, _) = Recorder::new(false);
        let cache = ContextCache::new(recorder);
        let request =
            GatewayRequest::delta(key(SessionId::random()), vec![PromptMessage::user("hi")])
                .unwrap();

        let err = cache.send(request).await.err().expect("rejected");
        assert!(matches!(err, TransportError::Rejected { .. }));
    }

    #[tokio::test]
    async fn delta_expands_into_transcript() {
        let (recorder, seen) = Recorder::new(false);
        let cache = ContextCache::new(recorder);
        let session = SessionId::random();

        let first =
            GatewayRequest::full(key(session), "system", vec![PromptMessage::user("one")]).unwrap();
        assert_eq!(collect_response(cache.send(first).await.unwrap()).await.unwrap(), "ok");
        assert_eq!(cache.cached_messages(session).await, Some(2));

        let second = GatewayRequest::delta(key(session), vec![PromptMessage::user("two")]).unwrap();
        collect_response(cache.send(second).await.unwrap())
            .await
            .unwrap();

        let seen = seen.lock().unwrap();
        let expanded = &seen[1];
        assert_eq!(expanded.system_prompt(), Some("system"));
        let contents: Vec<&str> = expanded.messages().iter().map(PromptMessage::content).collect();
        assert_eq!(contents, vec!["one", "ok", "two"]);
        drop(seen);
        assert_eq!(cache.cached_messages(session).await, Some(4));
    }

    #[tokio::test]
    async fn hash_mismatch_is_rejected() {
        let (recorder, _) = Recorder::new(false);
        let cache = ContextCache::new(recorder);
        let session = SessionId::random();

        let first =
            GatewayRequest::full(key(session), "system", vec![PromptMessage::user("one")]).unwrap();
        collect_response(cache.send(first).await.unwrap())
            .await
            .unwrap();

        let other = ContextKey::new(session, ContentHash::of("edited"));
        let delta = GatewayRequest::delta(other, vec![PromptMessage::user("two")]).unwrap();
        let err = cache.send(delta).await.err().expect("rejected");
        assert!(matches!(err, TransportError::Rejected { .. }));
    }

    #[tokio::test]
    async fn failed_stream_records_nothing() {
        let (recorder, _) = Recorder::new(true);
        let cache = ContextCache::new(recorder);
        let session = SessionId::random();

        let first =
            GatewayRequest::full(key(session), "system", vec![PromptMessage::user("one")]).unwrap();
        assert!(collect_response(cache.send(first).await.unwrap()).await.is_err());
        assert_eq!(cache.cached_messages(session).await, None);
    }

    #[tokio::test]
    async fn release_drops_context() {
        let (recorder, _) = Recorder::new(false);
        let cache = ContextCache::new(recorder);
        let session = SessionId::random();

        let first =
            GatewayRequest::full(key(session), "system", vec![PromptMessage::user("one")]).unwrap();
        collect_response(cache.send(first).await.unwrap())
            .await
            .unwrap();
        assert_eq!(cache.len().await, 1);

        cache.release(session).await;
        assert!(cache.is_empty().await);
    }
}
