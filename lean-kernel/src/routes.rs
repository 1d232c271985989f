//! Explicit mapping from request paths to prompts.

use std::collections::BTreeMap;

use lean_config::RoutesSection;
use lean_primitives::PromptSpecId;
use thiserror::Error;
use tracing::debug;

/// Errors raised while building a route table.
#[derive(Debug, Error)]
pub enum RouteError {
    /// The session channel cannot live at the root path.
    #[error("channel path must not be `/`")]
    RootChannelPath,
    /// The configured prompt identifier is malformed.
    #[error("route `{path}` names an invalid prompt: {source}")]
    InvalidPrompt {
        /// Offending path.
        path: String,
        /// Identifier validation error.
        #[source]
        source: lean_primitives::Error,
    },
}

/// Normalizes a path: trimmed, leading `/`, no trailing `/` except for the root.
#[must_use]
pub fn normalize_path(path: &str) -> String {
    let trimmed = path.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return "/".to_owned();
    }
    if trimmed.starts_with('/') {
        trimmed.to_owned()
    } else {
        format!("/{trimmed}")
    }
}

/// Address → prompt table populated at startup.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    prefix: Option<String>,
    channel_path: String,
    routes: BTreeMap<String, PromptSpecId>,
}

impl RouteTable {
    /// Creates an empty table serving its session channel at `channel_path`.
    ///
    /// # Errors
    ///
    /// Returns [`RouteError::RootChannelPath`] when the channel path is `/`.
    pub fn new(channel_path: &str) -> Result<Self, RouteError> {
        let channel_path = normalize_path(channel_path);
        if channel_path == "/" {
            return Err(RouteError::RootChannelPath);
        }
        Ok(Self {
            prefix: None,
            channel_path,
            routes: BTreeMap::new(),
        })
    }

    /// Builds a table from the `[routes]` configuration section.
    ///
    /// # Errors
    ///
    /// Returns an error for a root channel path or malformed prompt ids.
    pub fn from_config(section: &RoutesSection) -> Result<Self, RouteError> {
        let mut table = Self::new(&section.channel_path)?.with_prefix(&section.api_prefix);
        for (path, prompt) in &section.paths {
            let id = PromptSpecId::new(prompt.as_str()).map_err(|source| {
                RouteError::InvalidPrompt {
                    path: path.clone(),
                    source,
                }
            })?;
            table.register(path, id);
        }
        Ok(table)
    }

    /// Sets the API prefix applied on registration and lookup.
    #[must_use]
    pub fn with_prefix(mut self, prefix: &str) -> Self {
        let prefix = normalize_path(prefix);
        self.prefix = (prefix != "/").then_some(prefix);
        self
    }

    /// Returns the session channel path.
    #[must_use]
    pub fn channel_path(&self) -> &str {
        &self.channel_path
    }

    /// Registers `prompt` at `path`, returning the previous binding.
    pub fn register(&mut self, path: &str, prompt: PromptSpecId) -> Option<PromptSpecId> {
        let path = self.full_path(path);
        debug!(path = %path, prompt = %prompt, "route registered");
        self.routes.insert(path, prompt)
    }

    /// Looks up the prompt served at `path`.
    #[must_use]
    pub fn resolve(&self, path: &str) -> Option<&PromptSpecId> {
        self.routes.get(&self.full_path(path))
    }

    /// Iterates over registered `(path, prompt)` pairs in path order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &PromptSpecId)> {
        self.routes.iter().map(|(path, prompt)| (path.as_str(), prompt))
    }

    /// Number of registered routes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Returns `true` when no route is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    fn full_path(&self, path: &str) -> String {
        let path = normalize_path(path);
        let Some(prefix) = &self.prefix else {
            return path;
        };
        if path == *prefix
            || path
                .strip_prefix(prefix.as_str())
                .is_some_and(|rest| rest.starts_with('/'))
        {
            return path;
        }
        if path == "/" {
            return prefix.clone();
        }
        format!("{prefix}{path}")
    }
}
