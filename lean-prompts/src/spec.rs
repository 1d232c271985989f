//! Immutable prompt definitions.

use std::collections::BTreeMap;

use lean_primitives::{ContentHash, PromptSpecId};
use serde::{Deserialize, Serialize};

use crate::schema::ResponseSchema;

/// Generation parameters forwarded to the provider.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    /// Model override; the gateway default is used when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Sampling temperature.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    /// Maximum number of output tokens.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
    /// Provider specific parameters passed through untouched.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// A prompt definition bound to a route.
///
/// Specs are immutable; a changed source produces a new spec with a new hash.
#[derive(Clone, Debug, PartialEq)]
pub struct PromptSpec {
    id: PromptSpecId,
    body: String,
    params: GenerationParams,
    schema: Option<ResponseSchema>,
    hash: ContentHash,
    source_hashed: bool,
}

impl PromptSpec {
    /// Creates a spec whose hash is derived from its content.
    ///
    /// The derived hash covers the body, the generation parameters and the
    /// schema, and is recomputed by [`PromptSpec::with_params`] and
    /// [`PromptSpec::with_schema`]. Specs parsed from a document use
    /// [`PromptSpec::with_source_hash`] instead.
    #[must_use]
    pub fn new(id: PromptSpecId, body: impl Into<String>) -> Self {
        let body = body.into();
        let hash = ContentHash::of(&body);
        Self {
            id,
            body,
            params: GenerationParams::default(),
            schema: None,
            hash,
            source_hashed: false,
        }
    }

    /// Sets the generation parameters.
    #[must_use]
    pub fn with_params(mut self, params: GenerationParams) -> Self {
        self.params = params;
        self.rehash();
        self
    }

    /// Attaches a response schema.
    #[must_use]
    pub fn with_schema(mut self, schema: ResponseSchema) -> Self {
        self.schema = Some(schema);
        self.rehash();
        self
    }

    /// Pins the content hash to the hash of the source document.
    ///
    /// Later builder calls keep the pinned hash.
    #[must_use]
    pub fn with_source_hash(mut self, hash: ContentHash) -> Self {
        self.hash = hash;
        self.source_hashed = true;
        self
    }

    fn rehash(&mut self) {
        if self.source_hashed {
            return;
        }
        self.hash = if self.params == GenerationParams::default() && self.schema.is_none() {
            ContentHash::of(&self.body)
        } else {
            // Infallible for these types: string keys, no custom serializers.
            let content = serde_json::to_vec(&(&self.body, &self.params, &self.schema))
                .unwrap_or_else(|_| self.body.clone().into_bytes());
            ContentHash::of(content)
        };
    }

    /// Returns the identifier.
    #[must_use]
    pub const fn id(&self) -> &PromptSpecId {
        &self.id
    }

    /// Returns the static prompt body.
    #[must_use]
    pub fn body(&self) -> &str {
        &self.body
    }

    /// Returns the generation parameters.
    #[must_use]
    pub const fn params(&self) -> &GenerationParams {
        &self.params
    }

    /// Returns the response schema, if one is attached.
    #[must_use]
    pub const fn schema(&self) -> Option<&ResponseSchema> {
        self.schema.as_ref()
    }

    /// Returns the content hash.
    #[must_use]
    pub const fn hash(&self) -> ContentHash {
        self.hash
    }

    /// Builds the full system prompt, appending a condensed summary when present.
    #[must_use]
    pub fn system_prompt(&self, summary: Option<&str>) -> String {
        match summary.map(str::trim).filter(|s| !s.is_empty()) {
            Some(summary) => format!(
                "{}\n\nSummary of the conversation so far:\n{summary}",
                self.body
            ),
            None => self.body.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::FieldSpec;

    fn id() -> PromptSpecId {
        PromptSpecId::new("mood/json").unwrap()
    }

    #[test]
    fn hash_follows_body() {
        let a = PromptSpec::new(id(), "Analyse the mood.");
        let b = PromptSpec::new(id(), "Analyse the mood.");
        let c = PromptSpec::new(id(), "Analyse the mood!");
        assert_eq!(a.hash(), b.hash());
        assert_ne!(a.hash(), c.hash());
    }

    #[test]
    fn hash_covers_schema_and_params() {
        let bare = PromptSpec::new(id(), "Analyse the mood.");
        let typed = bare
            .clone()
            .with_schema(ResponseSchema::new(vec![FieldSpec::parse("mood", "string").unwrap()]));
        let retyped = bare
            .clone()
            .with_schema(ResponseSchema::new(vec![FieldSpec::parse("mood", "int").unwrap()]));
        let tuned = bare.clone().with_params(GenerationParams {
            temperature: Some(0.1),
            ..GenerationParams::default()
        });

        assert_ne!(bare.hash(), typed.hash());
        assert_ne!(typed.hash(), retyped.hash());
        assert_ne!(bare.hash(), tuned.hash());
        assert_eq!(
            typed.hash(),
            PromptSpec::new(id(), "Analyse the mood.")
                .with_schema(ResponseSchema::new(vec![FieldSpec::parse("mood", "string").unwrap()]))
                .hash()
        );
    }

    #[test]
    fn source_hash_survives_later_builders() {
        let source = ContentHash::of("---\nmodel: x\n---\nAnalyse the mood.");
        let spec = PromptSpec::new(id(), "Analyse the mood.")
            .with_source_hash(source)
            .with_schema(ResponseSchema::new(vec![FieldSpec::parse("mood", "string").unwrap()]));
        assert_eq!(spec.hash(), source);
    }

    #[test]
    fn system_prompt_appends_summary() {
        let spec = PromptSpec::new(id(), "Analyse the mood.")
            .with_schema(ResponseSchema::new(vec![FieldSpec::parse("m", "string").unwrap()]));

        assert_eq!(spec.system_prompt(None), "Analyse the mood.");
        assert_eq!(spec.system_prompt(Some("  ")), "Analyse the mood.");
        let full = spec.system_prompt(Some("User felt great."));
        assert!(full.starts_with("Analyse the mood."));
        assert!(full.ends_with("User felt great."));
    }

    #[test]
    fn params_deserialize_with_extra() {
        let params: GenerationParams = serde_json::from_value(serde_json::json!({
            "model": "gpt-4o-mini",
            "temperature": 0.2,
            "extra": { "top_p": 0.9 }
        }))
        .unwrap();
        assert_eq!(params.model.as_deref(), Some("gpt-4o-mini"));
        assert_eq!(params.extra.len(), 1);
        assert!(params.max_output_tokens.is_none());
    }
}
