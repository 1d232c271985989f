//! Prompt documents and the sources they are loaded from.
//!
//! A document is markdown with an optional YAML frontmatter block:
//!
//! ```text
//! ---
//! model: gpt-4o-mini
//! temperature: 0.2
//! schema:
//!   current_mood: string
//!   confidence: float[0,1]
//! ---
//! Analyse the user's mood and answer in JSON.
//! ```

use std::collections::{BTreeMap, HashMap};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use lean_primitives::{ContentHash, PromptSpecId};
use serde::Deserialize;

use crate::error::{PromptError, PromptResult};
use crate::schema::ResponseSchema;
use crate::spec::{GenerationParams, PromptSpec};

const FENCE: &str = "---";

/// Backing store that yields raw prompt documents by identifier.
#[async_trait]
pub trait PromptSource: Send + Sync {
    /// Loads the raw document for `id`.
    ///
    /// # Errors
    ///
    /// Returns [`PromptError::NotFound`] when no document exists.
    async fn load(&self, id: &PromptSpecId) -> PromptResult<String>;
}

/// Loads prompt documents from markdown files under a root directory.
///
/// The route key `mood/json` maps to `<root>/mood/json.md` unless an explicit
/// file was registered with [`DirectorySource::with_file`].
#[derive(Clone, Debug)]
pub struct DirectorySource {
    root: PathBuf,
    files: HashMap<PromptSpecId, PathBuf>,
}

impl DirectorySource {
    /// Creates a source rooted at `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            files: HashMap::new(),
        }
    }

    /// Maps an identifier to a specific file relative to the root.
    #[must_use]
    pub fn with_file(mut self, id: PromptSpecId, file: impl Into<PathBuf>) -> Self {
        self.files.insert(id, file.into());
        self
    }

    /// Returns the root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolves the file path backing `id`.
    #[must_use]
    pub fn path_for(&self, id: &PromptSpecId) -> PathBuf {
        if let Some(file) = self.files.get(id) {
            return self.root.join(file);
        }
        let relative = id.as_str().trim_start_matches('/');
        let mut path = self.root.join(relative);
        if path.extension().is_none_or(|ext| ext != "md") {
            path.set_file_name(format!(
                "{}.md",
                path.file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_default()
            ));
        }
        path
    }
}

#[async_trait]
impl PromptSource for DirectorySource {
    async fn load(&self, id: &PromptSpecId) -> PromptResult<String> {
        // Route keys never address files outside the root.
        if id.as_str().split('/').any(|segment| segment == "..") {
            return Err(PromptError::NotFound { id: id.to_string() });
        }
        let path = self.path_for(id);
        match tokio::fs::read_to_string(&path).await {
            Ok(raw) => Ok(raw),
            Err(err) if err.kind() == ErrorKind::NotFound => Err(PromptError::NotFound {
                id: id.to_string(),
            }),
            Err(source) => Err(PromptError::Io { path, source }),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct Frontmatter {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    temperature: Option<f32>,
    #[serde(default, alias = "max_output_tokens")]
    max_tokens: Option<u32>,
    #[serde(default)]
    schema: Option<serde_yaml::Mapping>,
    #[serde(default)]
    validator: Option<String>,
    #[serde(flatten)]
    extra: BTreeMap<String, serde_yaml::Value>,
}

/// Parses a raw document into a [`PromptSpec`].
///
/// `schemas` resolves `validator:` references to named schemas. The prompt hash is
/// the hash of the whole document, so frontmatter edits also invalidate caches.
///
/// # Errors
///
/// Returns [`PromptError::InvalidDocument`] for malformed frontmatter or an empty
/// body, [`PromptError::InvalidSchema`] for bad field declarations and
/// [`PromptError::UnknownSchema`] for dangling references.
pub fn parse_document(
    id: PromptSpecId,
    raw: &str,
    schemas: &HashMap<String, ResponseSchema>,
) -> PromptResult<PromptSpec> {
    let invalid = |reason: String| PromptError::InvalidDocument {
        id: id.to_string(),
        reason,
    };

    let (frontmatter, body) = split_frontmatter(raw).map_err(invalid)?;
    let meta: Frontmatter = match frontmatter {
        Some(yaml) if !yaml.trim().is_empty() => serde_yaml::from_str(yaml)
            .map_err(|err| invalid(format!("malformed frontmatter: {err}")))?,
        _ => Frontmatter::default(),
    };

    let body = body.trim();
    if body.is_empty() {
        return Err(invalid("prompt body is empty".to_owned()));
    }

    let schema = match (meta.schema, meta.validator) {
        (Some(_), Some(_)) => {
            return Err(invalid(
                "`schema` and `validator` are mutually exclusive".to_owned(),
            ));
        }
        (Some(mapping), None) => Some(inline_schema(&mapping).map_err(|err| match err {
            PromptError::InvalidDocument { reason, .. } => invalid(reason),
            other => other,
        })?),
        (None, Some(name)) => Some(
            schemas
                .get(name.trim())
                .cloned()
                .ok_or(PromptError::UnknownSchema { name })?,
        ),
        (None, None) => None,
    };

    let extra = meta
        .extra
        .into_iter()
        .map(|(key, value)| {
            serde_json::to_value(value)
                .map(|value| (key.clone(), value))
                .map_err(|err| invalid(format!("unsupported value for `{key}`: {err}")))
        })
        .collect::<PromptResult<BTreeMap<_, _>>>()?;

    let params = GenerationParams {
        model: meta.model,
        temperature: meta.temperature,
        max_output_tokens: meta.max_tokens,
        extra,
    };

    let mut spec = PromptSpec::new(id, body)
        .with_params(params)
        .with_source_hash(ContentHash::of(raw));
    if let Some(schema) = schema {
        spec = spec.with_schema(schema);
    }
    Ok(spec)
}

fn inline_schema(mapping: &serde_yaml::Mapping) -> PromptResult<ResponseSchema> {
    let mut pairs = Vec::with_capacity(mapping.len());
    for (key, value) in mapping {
        let (Some(name), Some(decl)) = (key.as_str(), value.as_str()) else {
            return Err(PromptError::InvalidDocument {
                id: String::new(),
                reason: "schema entries must map field names to type strings".to_owned(),
            });
        };
        pairs.push((name.to_owned(), decl.to_owned()));
    }
    ResponseSchema::parse(pairs)
}

/// Splits `---` fenced frontmatter from the body.
fn split_frontmatter(raw: &str) -> Result<(Option<&str>, &str), String> {
    let trimmed = raw.trim_start_matches('\u{feff}').trim_start();
    let Some(rest) = trimmed.strip_prefix(FENCE) else {
        return Ok((None, raw));
    };
    let Some(rest) = rest
        .strip_prefix("\r\n")
        .or_else(|| rest.strip_prefix('\n'))
    else {
        return Ok((None, raw));
    };

    let mut offset = 0;
    for line in rest.split_inclusive('\n') {
        if line.trim_end() == FENCE {
            let yaml = &rest[..offset];
            let body = &rest[offset + line.len()..];
            return Ok((Some(yaml), body));
        }
        offset += line.len();
    }

    Err("frontmatter is missing its closing `---`".to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::FieldKind;

    fn id(raw: &str) -> PromptSpecId {
        PromptSpecId::new(raw).unwrap()
    }

    const MOOD: &str = "---\nmodel: gpt-4o-mini\ntemperature: 0.2\nmax_tokens: 200\ntop_p: 0.9\nschema:\n  current_mood: string\n  confidence: float[0,1]\n  reason: string\n---\nAnalyse the user's mood.\n";

    #[test]
    fn parses_frontmatter_and_body() {
        let spec = parse_document(id("mood/json"), MOOD, &HashMap::new()).unwrap();
        assert_eq!(spec.body(), "Analyse the user's mood.");
        assert_eq!(spec.params().model.as_deref(), Some("gpt-4o-mini"));
        assert_eq!(spec.params().max_output_tokens, Some(200));
        assert_eq!(spec.params().extra.get("top_p"), Some(&serde_json::json!(0.9)));
        assert_eq!(spec.hash(), ContentHash::of(MOOD));

        let schema = spec.schema().expect("schema");
        assert_eq!(schema.fields().len(), 3);
        assert_eq!(schema.fields()[1].name(), "confidence");
        assert_eq!(schema.fields()[1].kind(), FieldKind::Number);
    }

    #[test]
    fn plain_markdown_has_no_schema() {
        let spec = parse_document(id("chat"), "  You are helpful.  ", &HashMap::new()).unwrap();
        assert_eq!(spec.body(), "You are helpful.");
        assert!(spec.schema().is_none());
    }

    #[test]
    fn resolves_validator_reference() {
        let mut schemas = HashMap::new();
        schemas.insert(
            "mood".to_owned(),
            ResponseSchema::parse([("current_mood", "string")]).unwrap(),
        );
        let raw = "---\nvalidator: mood\n---\nBody";
        let spec = parse_document(id("mood"), raw, &schemas).unwrap();
        assert!(spec.schema().is_some());

        let err = parse_document(id("mood"), "---\nvalidator: other\n---\nBody", &schemas)
            .expect_err("unknown");
        assert!(matches!(err, PromptError::UnknownSchema { .. }));
    }

    #[test]
    fn rejects_malformed_documents() {
        let schemas = HashMap::new();
        let cases = [
            "---\nmodel: x\nBody without closing fence",
            "---\nmodel: [unclosed\n---\nBody",
            "---\nmodel: x\n---\n   ",
            "---\nschema:\n  a: [1, 2]\n---\nBody",
        ];
        for raw in cases {
            let err = parse_document(id("x"), raw, &schemas).expect_err(raw);
            assert!(matches!(err, PromptError::InvalidDocument { .. }), "{raw}");
        }
    }

    #[test]
    fn path_mapping_appends_extension() {
        let source = DirectorySource::new("/prompts")
            .with_file(id("calc/add"), "math/addition.md");
        assert_eq!(source.path_for(&id("mood/json")), PathBuf::from("/prompts/mood/json.md"));
        assert_eq!(source.path_for(&id("mood.md")), PathBuf::from("/prompts/mood.md"));
        assert_eq!(
            source.path_for(&id("calc/add")),
            PathBuf::from("/prompts/math/addition.md")
        );
    }

    #[tokio::test]
    async fn missing_file_is_not_found() {
        let source = DirectorySource::new(std::env::temp_dir().join("lean-prompts-missing"));
        let err = source.load(&id("nope")).await.expect_err("missing");
        assert!(matches!(err, PromptError::NotFound { .. }));
    }
}
