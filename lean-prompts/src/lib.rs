//! Prompt definitions for LeanPrompt routes.
//!
//! A [`PromptSpec`] couples a static prompt body with generation parameters and
//! an optional [`ResponseSchema`]. The [`PromptStore`] caches specs and reloads
//! them from a [`PromptSource`] whenever the source content hash changes.

#![warn(missing_docs, clippy::pedantic)]

mod error;
pub mod loader;
pub mod schema;
pub mod spec;
pub mod store;

pub use error::{PromptError, PromptResult};
pub use loader::{DirectorySource, PromptSource, parse_document};
pub use schema::{FieldKind, FieldSpec, NumericRange, ResponseSchema};
pub use spec::{GenerationParams, PromptSpec};
pub use store::PromptStore;
