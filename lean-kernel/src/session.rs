//! Session registry: lifecycle, context flags, turn history and idle expiry.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use lean_primitives::{ContentHash, PromptSpecId, SessionId};
use lean_prompts::PromptSpec;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::{SessionError, SessionResult};

/// One completed exchange: user input plus the validated output.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Turn {
    sequence: u64,
    input: String,
    output: Value,
    corrections: u32,
    completed_at: DateTime<Utc>,
}

impl Turn {
    /// Creates a turn; the registry assigns the sequence number on record.
    #[must_use]
    pub fn new(input: impl Into<String>, output: Value, corrections: u32) -> Self {
        Self {
            sequence: 0,
            input: input.into(),
            output,
            corrections,
            completed_at: Utc::now(),
        }
    }

    /// 1-based position in the session history.
    #[must_use]
    pub const fn sequence(&self) -> u64 {
        self.sequence
    }

    /// User input that started the turn.
    #[must_use]
    pub fn input(&self) -> &str {
        &self.input
    }

    /// Validated output.
    #[must_use]
    pub const fn output(&self) -> &Value {
        &self.output
    }

    /// Number of self-correction deltas the turn needed.
    #[must_use]
    pub const fn corrections(&self) -> u32 {
        self.corrections
    }

    /// Completion time.
    #[must_use]
    pub const fn completed_at(&self) -> DateTime<Utc> {
        self.completed_at
    }
}

/// Point-in-time view of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    /// Session identifier.
    pub id: SessionId,
    /// Prompt the session is bound to.
    pub prompt: PromptSpecId,
    /// Content hash of the prompt when last bound.
    pub prompt_hash: ContentHash,
    /// Whether the full context reached the provider since creation or reset.
    pub context_sent: bool,
    /// Turns recorded since the last context reset.
    pub turns_since_reset: u32,
    /// Condensed summary carried into the next full request.
    pub summary: Option<String>,
    /// Turns recorded over the session lifetime.
    pub turn_count: usize,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

#[derive(Debug)]
struct SessionEntry {
    prompt: PromptSpecId,
    prompt_hash: ContentHash,
    context_sent: bool,
    turns_since_reset: u32,
    summary: Option<String>,
    history: Vec<Turn>,
    last_activity: Instant,
    created_at: DateTime<Utc>,
    busy: Arc<AtomicBool>,
}

impl SessionEntry {
    fn new(prompt: &PromptSpec) -> Self {
        Self {
            prompt: prompt.id().clone(),
            prompt_hash: prompt.hash(),
            context_sent: false,
            turns_since_reset: 0,
            summary: None,
            history: Vec::new(),
            last_activity: Instant::now(),
            created_at: Utc::now(),
            busy: Arc::new(AtomicBool::new(false)),
        }
    }

    fn snapshot(&self, id: SessionId) -> SessionSnapshot {
        SessionSnapshot {
            id,
            prompt: self.prompt.clone(),
            prompt_hash: self.prompt_hash,
            context_sent: self.context_sent,
            turns_since_reset: self.turns_since_reset,
            summary: self.summary.clone(),
            turn_count: self.history.len(),
            created_at: self.created_at,
        }
    }

    fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    fn is_idle(&self, now: Instant, timeout: Duration) -> bool {
        !self.is_busy() && now.saturating_duration_since(self.last_activity) >= timeout
    }

    fn touch(&mut self) {
        self.last_activity = Instant::now();
    }
}

/// Exclusive right to run one turn on a session.
///
/// Dropping the lease, including through cancellation of the owning future,
/// frees the session for the next turn.
#[derive(Debug)]
#[must_use = "the session is busy only while the lease is held"]
pub struct TurnLease {
    session: SessionId,
    busy: Arc<AtomicBool>,
}

impl TurnLease {
    /// Session the lease belongs to.
    #[must_use]
    pub const fn session(&self) -> SessionId {
        self.session
    }
}

impl Drop for TurnLease {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::Release);
    }
}

/// In-memory registry of live sessions.
#[derive(Debug)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionId, SessionEntry>>,
    idle_timeout: Duration,
}

impl SessionRegistry {
    /// Creates an empty registry that expires sessions idle for `idle_timeout`.
    #[must_use]
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            idle_timeout,
        }
    }

    /// Returns the idle timeout.
    #[must_use]
    pub const fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    /// Looks up `requested` or creates a fresh session bound to `prompt`.
    ///
    /// An absent, unknown or idle-expired id yields a new session under a newly
    /// allocated id; the boolean reports whether that happened. A known session
    /// whose bound hash differs from `prompt.hash()` is rebound and must resend
    /// its full context.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Mismatch`] when the session belongs to another
    /// prompt and [`SessionError::Busy`], leaving the session untouched, while
    /// a turn is in flight on it.
    pub async fn get_or_create(
        &self,
        requested: Option<SessionId>,
        prompt: &PromptSpec,
    ) -> SessionResult<(SessionSnapshot, bool)> {
        let mut sessions = self.sessions.write().await;

        if let Some(id) = requested {
            let now = Instant::now();
            if sessions
                .get(&id)
                .is_some_and(|entry| entry.is_idle(now, self.idle_timeout))
            {
                sessions.remove(&id);
                info!(session_id = %id, "session expired on access");
            }

            if let Some(entry) = sessions.get_mut(&id) {
                if entry.prompt != *prompt.id() {
                    return Err(SessionError::Mismatch {
                        session: id,
                        bound: entry.prompt.clone(),
                        requested: prompt.id().clone(),
                    });
                }
                if entry.is_busy() {
                    return Err(SessionError::Busy { session: id });
                }
                if entry.prompt_hash != prompt.hash() {
                    info!(
                        session_id = %id,
                        prompt = %prompt.id(),
                        hash = %prompt.hash().short(),
                        "prompt changed; session context reset"
                    );
                    entry.prompt_hash = prompt.hash();
                    entry.context_sent = false;
                }
                entry.touch();
                return Ok((entry.snapshot(id), false));
            }
        }

        let id = SessionId::random();
        let entry = SessionEntry::new(prompt);
        let snapshot = entry.snapshot(id);
        sessions.insert(id, entry);
        info!(session_id = %id, prompt = %prompt.id(), "session created");
        Ok((snapshot, true))
    }

    /// Claims the session for one turn.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Busy`] while another lease is held and
    /// [`SessionError::Expired`] for unregistered ids.
    pub async fn begin_turn(&self, id: SessionId) -> SessionResult<TurnLease> {
        self.with_entry(id, |entry| {
            entry
                .busy
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .map_err(|_| SessionError::Busy { session: id })?;
            Ok(TurnLease {
                session: id,
                busy: Arc::clone(&entry.busy),
            })
        })
        .await
    }

    /// Records that a full-context request succeeded.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Expired`] for unregistered ids.
    pub async fn mark_context_sent(&self, id: SessionId) -> SessionResult<()> {
        self.with_entry(id, |entry| {
            entry.context_sent = true;
            Ok(())
        })
        .await
    }

    /// Appends a completed turn, returning its sequence number.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Expired`] for unregistered ids.
    pub async fn record_turn(&self, id: SessionId, mut turn: Turn) -> SessionResult<u64> {
        self.with_entry(id, |entry| {
            let sequence = entry.history.len() as u64 + 1;
            turn.sequence = sequence;
            entry.history.push(turn);
            entry.turns_since_reset = entry.turns_since_reset.saturating_add(1);
            debug!(session_id = %id, sequence, "turn recorded");
            Ok(sequence)
        })
        .await
    }

    /// Clears the context flag and turn counter, storing `summary` for the next
    /// full request.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Expired`] for unregistered ids.
    pub async fn reset_context(&self, id: SessionId, summary: Option<String>) -> SessionResult<()> {
        self.with_entry(id, |entry| {
            entry.context_sent = false;
            entry.turns_since_reset = 0;
            entry.summary = summary;
            Ok(())
        })
        .await
    }

    /// Removes a session, returning `true` when it existed.
    pub async fn expire(&self, id: SessionId) -> bool {
        let removed = self.sessions.write().await.remove(&id).is_some();
        if removed {
            info!(session_id = %id, "session expired");
        }
        removed
    }

    /// Returns a snapshot without touching the activity clock.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Expired`] for unregistered ids.
    pub async fn snapshot(&self, id: SessionId) -> SessionResult<SessionSnapshot> {
        self.sessions
            .read()
            .await
            .get(&id)
            .map(|entry| entry.snapshot(id))
            .ok_or(SessionError::Expired { session: id })
    }

    /// Returns the recorded turns, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Expired`] for unregistered ids.
    pub async fn history(&self, id: SessionId) -> SessionResult<Vec<Turn>> {
        self.sessions
            .read()
            .await
            .get(&id)
            .map(|entry| entry.history.clone())
            .ok_or(SessionError::Expired { session: id })
    }

    /// Removes every idle session without a turn in flight.
    pub async fn sweep(&self) -> Vec<SessionId> {
        let now = Instant::now();
        let mut sessions = self.sessions.write().await;
        let expired: Vec<SessionId> = sessions
            .iter()
            .filter(|(_, entry)| entry.is_idle(now, self.idle_timeout))
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            sessions.remove(id);
        }
        if !expired.is_empty() {
            info!(count = expired.len(), "swept idle sessions");
        }
        expired
    }

    /// Number of registered sessions.
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Returns `true` when no session is registered.
    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    async fn with_entry<T>(
        &self,
        id: SessionId,
        apply: impl FnOnce(&mut SessionEntry) -> SessionResult<T>,
    ) -> SessionResult<T> {
        let mut sessions = self.sessions.write().await;
        let entry = sessions
            .get_mut(&id)
            .ok_or(SessionError::Expired { session: id })?;
        entry.touch();
        apply(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const TIMEOUT: Duration = Duration::from_secs(60);

    fn prompt(body: &str) -> PromptSpec {
        PromptSpec::new(PromptSpecId::new("mood/json").unwrap(), body)
    }

    #[tokio::test]
    async fn creates_session_for_missing_or_unknown_id() {
        let registry = SessionRegistry::new(TIMEOUT);
        let spec = prompt("Analyse mood.");

        let (first, created) = registry.get_or_create(None, &spec).await.unwrap();
        assert!(created);
        assert!(!first.context_sent);

        let unknown = SessionId::random();
        let (second, created) = registry.get_or_create(Some(unknown), &spec).await.unwrap();
        assert!(created);
        assert_ne!(second.id, unknown);

        let (again, created) = registry.get_or_create(Some(first.id), &spec).await.unwrap();
        assert!(!created);
        assert_eq!(again.id, first.id);
        assert_eq!(registry.len().await, 2);
    }

    #[tokio::test]
    async fn rejects_other_prompt() {
        let registry = SessionRegistry::new(TIMEOUT);
        let (snapshot, _) = registry.get_or_create(None, &prompt("a")).await.unwrap();
        let other = PromptSpec::new(PromptSpecId::new("calc/add").unwrap(), "b");

        let err = registry
            .get_or_create(Some(snapshot.id), &other)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Mismatch { .. }));
    }

    #[tokio::test]
    async fn changed_prompt_hash_resets_context() {
        let registry = SessionRegistry::new(TIMEOUT);
        let (snapshot, _) = registry.get_or_create(None, &prompt("v1")).await.unwrap();
        registry.mark_context_sent(snapshot.id).await.unwrap();

        let (same, _) = registry
            .get_or_create(Some(snapshot.id), &prompt("v1"))
            .await
            .unwrap();
        assert!(same.context_sent);

        let updated = prompt("v2");
        let (rebound, created) = registry
            .get_or_create(Some(snapshot.id), &updated)
            .await
            .unwrap();
        assert!(!created);
        assert!(!rebound.context_sent);
        assert_eq!(rebound.prompt_hash, updated.hash());
    }

    #[tokio::test]
    async fn lease_is_exclusive_and_released_on_drop() {
        let registry = SessionRegistry::new(TIMEOUT);
        let (snapshot, _) = registry.get_or_create(None, &prompt("a")).await.unwrap();

        let lease = registry.begin_turn(snapshot.id).await.unwrap();
        assert_eq!(lease.session(), snapshot.id);
        assert_eq!(
            registry.begin_turn(snapshot.id).await.unwrap_err(),
            SessionError::Busy {
                session: snapshot.id
            }
        );

        drop(lease);
        assert!(registry.begin_turn(snapshot.id).await.is_ok());
    }

    #[tokio::test]
    async fn busy_session_is_not_rebound() {
        let registry = SessionRegistry::new(TIMEOUT);
        let original = prompt("v1");
        let (snapshot, _) = registry.get_or_create(None, &original).await.unwrap();
        registry.mark_context_sent(snapshot.id).await.unwrap();
        let _lease = registry.begin_turn(snapshot.id).await.unwrap();

        let err = registry
            .get_or_create(Some(snapshot.id), &prompt("v2"))
            .await
            .unwrap_err();
        assert_eq!(err, SessionError::Busy { session: snapshot.id });

        let after = registry.snapshot(snapshot.id).await.unwrap();
        assert!(after.context_sent);
        assert_eq!(after.prompt_hash, original.hash());
    }

    #[tokio::test]
    async fn records_turns_in_order() {
        let registry = SessionRegistry::new(TIMEOUT);
        let (snapshot, _) = registry.get_or_create(None, &prompt("a")).await.unwrap();

        for input in ["one", "two", "three"] {
            registry
                .record_turn(snapshot.id, Turn::new(input, json!({"ok": true}), 0))
                .await
                .unwrap();
        }

        let history = registry.history(snapshot.id).await.unwrap();
        let sequences: Vec<u64> = history.iter().map(Turn::sequence).collect();
        assert_eq!(sequences, vec![1, 2, 3]);
        assert_eq!(history[1].input(), "two");
        assert_eq!(registry.snapshot(snapshot.id).await.unwrap().turns_since_reset, 3);
    }

    #[tokio::test]
    async fn reset_context_stores_summary() {
        let registry = SessionRegistry::new(TIMEOUT);
        let (snapshot, _) = registry.get_or_create(None, &prompt("a")).await.unwrap();
        registry.mark_context_sent(snapshot.id).await.unwrap();
        registry
            .record_turn(snapshot.id, Turn::new("hi", json!("hello"), 0))
            .await
            .unwrap();

        registry
            .reset_context(snapshot.id, Some("user said hi".into()))
            .await
            .unwrap();

        let after = registry.snapshot(snapshot.id).await.unwrap();
        assert!(!after.context_sent);
        assert_eq!(after.turns_since_reset, 0);
        assert_eq!(after.turn_count, 1);
        assert_eq!(after.summary.as_deref(), Some("user said hi"));
    }

    #[tokio::test]
    async fn operations_on_removed_session_report_expired() {
        let registry = SessionRegistry::new(TIMEOUT);
        let (snapshot, _) = registry.get_or_create(None, &prompt("a")).await.unwrap();
        assert!(registry.expire(snapshot.id).await);
        assert!(!registry.expire(snapshot.id).await);

        assert!(matches!(
            registry.mark_context_sent(snapshot.id).await,
            Err(SessionError::Expired { .. })
        ));
        assert!(matches!(
            registry.begin_turn(snapshot.id).await,
            Err(SessionError::Expired { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_sessions_expire_lazily_and_on_sweep() {
        let registry = SessionRegistry::new(TIMEOUT);
        let spec = prompt("a");
        let (stale, _) = registry.get_or_create(None, &spec).await.unwrap();
        let (busy, _) = registry.get_or_create(None, &spec).await.unwrap();
        let _lease = registry.begin_turn(busy.id).await.unwrap();

        tokio::time::advance(TIMEOUT + Duration::from_secs(1)).await;

        let (fresh, created) = registry.get_or_create(Some(stale.id), &spec).await.unwrap();
        assert!(created);
        assert_ne!(fresh.id, stale.id);

        let (idle, _) = registry.get_or_create(None, &spec).await.unwrap();
        tokio::time::advance(TIMEOUT).await;
        let swept = registry.sweep().await;
        assert!(swept.contains(&idle.id));
        assert!(swept.contains(&fresh.id));
        assert!(!swept.contains(&busy.id));
        assert_eq!(registry.len().await, 1);
    }
}
