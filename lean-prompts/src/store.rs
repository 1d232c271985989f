//! Concurrent prompt store with content-hash reloads.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use lean_primitives::{ContentHash, PromptSpecId};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::{PromptError, PromptResult};
use crate::loader::{PromptSource, parse_document};
use crate::schema::ResponseSchema;
use crate::spec::PromptSpec;

/// Holds the prompt definitions served by the runtime.
///
/// Specs are shared as `Arc<PromptSpec>`; a reload swaps the entry and leaves
/// specs already handed out untouched.
#[derive(Default)]
pub struct PromptStore {
    specs: RwLock<HashMap<PromptSpecId, Arc<PromptSpec>>>,
    schemas: RwLock<HashMap<String, ResponseSchema>>,
    source: Option<Arc<dyn PromptSource>>,
}

impl fmt::Debug for PromptStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PromptStore")
            .field("has_source", &self.source.is_some())
            .finish_non_exhaustive()
    }
}

impl PromptStore {
    /// Creates an empty store without a backing source.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store that loads documents from `source` on demand.
    #[must_use]
    pub fn with_source(source: Arc<dyn PromptSource>) -> Self {
        Self {
            source: Some(source),
            ..Self::default()
        }
    }

    /// Registers a named schema that documents can reference via `validator:`.
    pub async fn register_schema(&self, name: impl Into<String>, schema: ResponseSchema) {
        self.schemas.write().await.insert(name.into(), schema);
    }

    /// Inserts or replaces a spec, returning the previous entry.
    pub async fn insert(&self, spec: PromptSpec) -> Option<Arc<PromptSpec>> {
        let id = spec.id().clone();
        self.specs.write().await.insert(id, Arc::new(spec))
    }

    /// Returns the cached spec without consulting the source.
    pub async fn get(&self, id: &PromptSpecId) -> Option<Arc<PromptSpec>> {
        self.specs.read().await.get(id).cloned()
    }

    /// Returns the current spec for `id`, reloading it when the source changed.
    ///
    /// Without a source, or when the source has no document for an id that was
    /// inserted directly, the cached spec is returned.
    ///
    /// # Errors
    ///
    /// Returns [`PromptError::NotFound`] when neither the cache nor the source
    /// knows the id, and parse errors for malformed documents.
    pub async fn resolve(&self, id: &PromptSpecId) -> PromptResult<Arc<PromptSpec>> {
        let cached = self.get(id).await;
        let Some(source) = &self.source else {
            return cached.ok_or_else(|| PromptError::NotFound { id: id.to_string() });
        };

        let raw = match source.load(id).await {
            Ok(raw) => raw,
            Err(PromptError::NotFound { .. }) if cached.is_some() => {
                return cached.ok_or_else(|| PromptError::NotFound { id: id.to_string() });
            }
            Err(err) => return Err(err),
        };

        let hash = ContentHash::of(&raw);
        if let Some(spec) = cached.as_ref().filter(|spec| spec.hash() == hash) {
            return Ok(Arc::clone(spec));
        }

        let spec = {
            let schemas = self.schemas.read().await;
            Arc::new(parse_document(id.clone(), &raw, &schemas)?)
        };

        if cached.is_some() {
            info!(prompt = %id, hash = %hash.short(), "prompt source changed; reloaded");
        } else {
            debug!(prompt = %id, hash = %hash.short(), "loaded prompt");
        }

        self.specs
            .write()
            .await
            .insert(id.clone(), Arc::clone(&spec));
        Ok(spec)
    }

    /// Removes a spec from the cache.
    pub async fn remove(&self, id: &PromptSpecId) -> Option<Arc<PromptSpec>> {
        self.specs.write().await.remove(id)
    }

    /// Returns the number of cached specs.
    pub async fn len(&self) -> usize {
        self.specs.read().await.len()
    }

    /// Returns `true` when no spec is cached.
    pub async fn is_empty(&self) -> bool {
        self.specs.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// In-memory source whose documents can be edited between calls.
    #[derive(Default)]
    struct MemorySource {
        docs: Mutex<HashMap<String, String>>,
    }

    impl MemorySource {
        fn put(&self, id: &str, raw: &str) {
            self.docs
                .lock()
                .unwrap()
                .insert(id.to_owned(), raw.to_owned());
        }
    }

    #[async_trait]
    impl PromptSource for MemorySource {
        async fn load(&self, id: &PromptSpecId) -> PromptResult<String> {
            self.docs
                .lock()
                .unwrap()
                .get(id.as_str())
                .cloned()
                .ok_or_else(|| PromptError::NotFound { id: id.to_string() })
        }
    }

    fn id(raw: &str) -> PromptSpecId {
        PromptSpecId::new(raw).unwrap()
    }

    #[tokio::test]
    async fn insert_get_remove() {
        let store = PromptStore::new();
        assert!(store.is_empty().await);

        store.insert(PromptSpec::new(id("chat"), "Be kind.")).await;
        assert_eq!(store.len().await, 1);
        assert_eq!(store.resolve(&id("chat")).await.unwrap().body(), "Be kind.");

        store.remove(&id("chat")).await;
        let err = store.resolve(&id("chat")).await.expect_err("gone");
        assert!(matches!(err, PromptError::NotFound { .. }));
    }

    #[tokio::test]
    async fn resolve_reuses_unchanged_spec() {
        let source = Arc::new(MemorySource::default());
        source.put("mood", "Analyse the mood.");
        let store = PromptStore::with_source(source.clone());

        let first = store.resolve(&id("mood")).await.unwrap();
        let second = store.resolve(&id("mood")).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn resolve_reloads_on_hash_change() {
        let source = Arc::new(MemorySource::default());
        source.put("mood", "Analyse the mood.");
        let store = PromptStore::with_source(source.clone());

        let before = store.resolve(&id("mood")).await.unwrap();
        source.put("mood", "---\ntemperature: 0.1\n---\nAnalyse the mood.");
        let after = store.resolve(&id("mood")).await.unwrap();

        assert_ne!(before.hash(), after.hash());
        assert_eq!(after.params().temperature, Some(0.1));
        assert_eq!(before.body(), "Analyse the mood.");
    }

    #[tokio::test]
    async fn inserted_spec_survives_missing_document() {
        let store = PromptStore::with_source(Arc::new(MemorySource::default()));
        store.insert(PromptSpec::new(id("inline"), "Inline.")).await;
        assert!(store.resolve(&id("inline")).await.is_ok());
        assert!(store.resolve(&id("unknown")).await.is_err());
    }

    #[tokio::test]
    async fn schema_catalog_feeds_documents() {
        let source = Arc::new(MemorySource::default());
        source.put("mood", "---\nvalidator: mood\n---\nAnalyse.");
        let store = PromptStore::with_source(source);

        let err = store.resolve(&id("mood")).await.expect_err("unregistered");
        assert!(matches!(err, PromptError::UnknownSchema { .. }));

        store
            .register_schema("mood", ResponseSchema::parse([("current_mood", "string")]).unwrap())
            .await;
        let spec = store.resolve(&id("mood")).await.unwrap();
        assert!(spec.schema().is_some());
    }
}
