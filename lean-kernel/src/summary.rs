//! Condensing long sessions into a summary carried by the next full request.

use std::fmt::Write;

use serde_json::Value;

use crate::session::Turn;

/// Delta sent to the provider when a session outgrows its turn threshold.
pub const SUMMARY_INSTRUCTION: &str = "Summarize our conversation so far in a short paragraph. \
Keep facts, user preferences and open questions needed to continue. \
Reply with the summary text only.";

const DIGEST_TURNS: usize = 8;
const DIGEST_FIELD_CHARS: usize = 240;

/// Builds a summary locally from recorded turns.
///
/// Used when the summarization call fails. Only the most recent turns are
/// kept and long values are clipped.
#[must_use]
pub fn local_digest(history: &[Turn]) -> String {
    let skip = history.len().saturating_sub(DIGEST_TURNS);
    let mut digest = String::new();
    if skip > 0 {
        let _ = writeln!(digest, "({skip} earlier turn(s) omitted)");
    }
    for turn in &history[skip..] {
        let _ = writeln!(
            digest,
            "User: {}\nAssistant: {}",
            clip(turn.input()),
            clip(&render(turn.output()))
        );
    }
    digest.trim_end().to_owned()
}

fn render(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn clip(text: &str) -> String {
    let text = text.trim();
    match text.char_indices().nth(DIGEST_FIELD_CHARS) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_owned(),
    }
}
