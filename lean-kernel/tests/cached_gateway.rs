//! Turns driven through the client-side context cache that wraps every
//! production provider.

mod support;

use std::sync::Arc;

use lean_gateway::{ContextCache, MessageRole, ProviderGateway};
use lean_kernel::summary::SUMMARY_INSTRUCTION;
use lean_kernel::{Orchestrator, OrchestratorConfig, TurnRequest};
use lean_prompts::PromptSpec;

use support::{
    MOOD_BODY, Reply, ScriptedGateway, VALID, config, mood_id, mood_prompt, orchestrator_over,
};

type Cache = ContextCache<Arc<ScriptedGateway>>;

async fn cached(
    replies: impl IntoIterator<Item = Reply>,
    config: OrchestratorConfig,
) -> (Arc<ScriptedGateway>, Arc<Cache>, Orchestrator) {
    let provider = ScriptedGateway::new(replies);
    let cache = Arc::new(ContextCache::new(Arc::clone(&provider)));
    let orchestrator =
        orchestrator_over(Arc::clone(&cache) as Arc<dyn ProviderGateway>, config).await;
    (provider, cache, orchestrator)
}

fn request(input: &str) -> TurnRequest {
    TurnRequest::new(mood_id(), input)
}

#[tokio::test]
async fn corrective_delta_reaches_provider_with_cached_transcript() {
    let invalid = r#"{"current_mood":"happy","confidence":"high","reason":"x"}"#;
    let (provider, cache, orchestrator) =
        cached([Reply::text(invalid), Reply::text(VALID)], config()).await;

    let outcome = orchestrator
        .handle_turn(request("I am feeling great today!"))
        .await
        .unwrap();
    assert_eq!(outcome.corrections, 1);

    let sent = provider.requests();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].system_prompt(), Some(MOOD_BODY));
    assert_eq!(sent[0].messages().len(), 1);

    let correction = &sent[1];
    assert_eq!(correction.system_prompt(), Some(MOOD_BODY));
    let roles: Vec<MessageRole> = correction.messages().iter().map(|m| m.role()).collect();
    assert_eq!(roles, vec![MessageRole::User, MessageRole::Assistant, MessageRole::User]);
    assert_eq!(correction.messages()[0].content(), "I am feeling great today!");
    assert_eq!(correction.messages()[1].content(), invalid);
    assert!(correction.messages()[2].content().contains("confidence"));

    assert_eq!(cache.cached_messages(outcome.session).await, Some(4));
}

#[tokio::test]
async fn summarized_session_starts_over_with_a_fresh_full_request() {
    let mut config = config();
    config.summarize_after_turns = 1;
    let (provider, cache, orchestrator) = cached(
        [
            Reply::text(VALID),
            Reply::text(VALID),
            Reply::text("The user is happy."),
            Reply::text(VALID),
        ],
        config,
    )
    .await;

    let first = orchestrator.handle_turn(request("one")).await.unwrap();
    let second = orchestrator
        .handle_turn(request("two").with_session(first.session))
        .await
        .unwrap();
    assert!(second.summarized);
    assert_eq!(cache.cached_messages(first.session).await, None);
    assert_eq!(provider.released(), vec![first.session]);

    let sent = provider.requests();
    assert_eq!(sent[1].messages().len(), 3);
    let summary_call = &sent[2];
    assert_eq!(summary_call.messages().len(), 5);
    assert_eq!(
        summary_call.messages().last().map(|m| m.content()),
        Some(SUMMARY_INSTRUCTION)
    );

    orchestrator
        .handle_turn(request("three").with_session(first.session))
        .await
        .unwrap();
    let resent = &provider.requests()[3];
    assert_eq!(resent.messages().len(), 1);
    assert!(resent.system_prompt().unwrap().ends_with("The user is happy."));
    assert_eq!(cache.cached_messages(first.session).await, Some(2));
}

#[tokio::test]
async fn edited_prompt_is_resent_instead_of_a_stale_delta() {
    let (provider, cache, orchestrator) =
        cached([Reply::text(VALID), Reply::text(VALID)], config()).await;
    let first = orchestrator.handle_turn(request("one")).await.unwrap();

    let schema = mood_prompt().schema().cloned().unwrap();
    orchestrator
        .prompts()
        .insert(PromptSpec::new(mood_id(), "Analyse the mood, briefly.").with_schema(schema))
        .await;

    let second = orchestrator
        .handle_turn(request("two").with_session(first.session))
        .await
        .unwrap();
    assert_eq!(second.session, first.session);

    let sent = provider.requests();
    assert_eq!(sent[1].system_prompt(), Some("Analyse the mood, briefly."));
    assert_eq!(sent[1].messages().len(), 1);
    assert_eq!(cache.cached_messages(first.session).await, Some(2));
}

#[tokio::test]
async fn expiring_a_session_drops_its_cached_context() {
    let (provider, cache, orchestrator) = cached([Reply::text(VALID)], config()).await;
    let outcome = orchestrator.handle_turn(request("one")).await.unwrap();
    assert_eq!(cache.len().await, 1);

    assert!(orchestrator.expire(outcome.session).await);
    assert!(cache.is_empty().await);
    assert!(orchestrator.registry().is_empty().await);
    assert_eq!(provider.released(), vec![outcome.session]);

    assert!(!orchestrator.expire(outcome.session).await);
}
