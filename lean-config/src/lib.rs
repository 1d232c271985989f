//! Runtime configuration for LeanPrompt.
//!
//! Configuration is a single TOML document. Session, guardrail, and transport
//! limits have no built-in defaults and must be stated explicitly:
//!
//! ```toml
//! [session]
//! idle_timeout_secs = 900
//! sweep_interval_secs = 60
//! summarize_after_turns = 20
//!
//! [guardrail]
//! correction_budget = 2
//!
//! [transport]
//! max_attempts = 3
//! initial_backoff_ms = 250
//! max_backoff_ms = 4000
//! call_timeout_secs = 60
//!
//! [provider]
//! kind = "openai"
//! model = "gpt-4o-mini"
//!
//! [routes]
//! api_prefix = "/api"
//! channel_path = "/ws"
//! prompt_dir = "prompts"
//!
//! [routes.paths]
//! "/mood" = "mood/json"
//! ```

#![warn(missing_docs, clippy::pedantic)]

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Root configuration document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuntimeConfig {
    /// Session lifetime settings.
    pub session: SessionSection,
    /// Self-correction settings.
    pub guardrail: GuardrailSection,
    /// Gateway call settings.
    pub transport: TransportSection,
    /// Provider selection.
    pub provider: ProviderSection,
    /// Route registration.
    #[serde(default)]
    pub routes: RoutesSection,
    /// Logging settings.
    #[serde(default)]
    pub telemetry: TelemetrySection,
}

impl RuntimeConfig {
    /// Parses and validates a TOML document.
    ///
    /// # Errors
    ///
    /// Returns an error when the document is malformed, misses a required key,
    /// or fails [`RuntimeConfig::validate`].
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).context("failed to parse runtime config")?;
        config.validate()?;
        Ok(config)
    }

    /// Loads and validates the configuration file at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error when the file cannot be read or is invalid.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config = Self::from_toml_str(&content)
            .with_context(|| format!("invalid config file: {}", path.display()))?;
        debug!(path = %path.display(), provider = %config.provider.kind, "loaded runtime config");
        Ok(config)
    }

    /// Checks cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first offending key.
    pub fn validate(&self) -> Result<()> {
        let session = &self.session;
        ensure!(
            session.idle_timeout_secs > 0,
            "session.idle_timeout_secs must be greater than zero"
        );
        ensure!(
            session.sweep_interval_secs > 0,
            "session.sweep_interval_secs must be greater than zero"
        );
        ensure!(
            session.summarize_after_turns > 0,
            "session.summarize_after_turns must be greater than zero"
        );

        let transport = &self.transport;
        ensure!(
            transport.max_attempts > 0,
            "transport.max_attempts must be at least 1"
        );
        ensure!(
            transport.initial_backoff_ms > 0,
            "transport.initial_backoff_ms must be greater than zero"
        );
        ensure!(
            transport.initial_backoff_ms <= transport.max_backoff_ms,
            "transport.initial_backoff_ms cannot exceed transport.max_backoff_ms"
        );
        ensure!(
            transport.call_timeout_secs > 0,
            "transport.call_timeout_secs must be greater than zero"
        );

        ensure!(
            !self.provider.model.trim().is_empty(),
            "provider.model cannot be empty"
        );
        if let Some(base_url) = &self.provider.base_url {
            ensure!(
                base_url.starts_with("http://") || base_url.starts_with("https://"),
                "provider.base_url must start with http:// or https://"
            );
        }

        let channel = self.routes.channel_path.trim().trim_end_matches('/');
        ensure!(
            !channel.is_empty(),
            "routes.channel_path cannot be the root path"
        );
        Ok(())
    }
}

/// `[session]` section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionSection {
    /// Seconds of inactivity after which a session is discarded.
    pub idle_timeout_secs: u64,
    /// Seconds between background expiry sweeps.
    pub sweep_interval_secs: u64,
    /// Turns after which the session context is summarised and reset.
    pub summarize_after_turns: u32,
}

impl SessionSection {
    /// Returns the idle timeout.
    #[must_use]
    pub const fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    /// Returns the sweep interval.
    #[must_use]
    pub const fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// `[guardrail]` section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GuardrailSection {
    /// Corrective round trips allowed per turn; `0` disables self-correction.
    pub correction_budget: u32,
}

/// `[transport]` section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransportSection {
    /// Attempts per gateway call, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_backoff_ms: u64,
    /// Upper bound for retry delays.
    pub max_backoff_ms: u64,
    /// Bound on a single gateway call.
    pub call_timeout_secs: u64,
}

impl TransportSection {
    /// Returns the initial backoff.
    #[must_use]
    pub const fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    /// Returns the backoff cap.
    #[must_use]
    pub const fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    /// Returns the per-call timeout.
    #[must_use]
    pub const fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
}

/// Supported provider backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// Hosted `OpenAI` API.
    #[serde(alias = "open_ai")]
    Openai,
    /// vLLM server exposing the `OpenAI` API.
    Vllm,
    /// llama.cpp server exposing the `OpenAI` API.
    #[serde(alias = "llama-cpp", alias = "llamacpp")]
    LlamaCpp,
    /// Local Ollama daemon.
    Ollama,
    /// Google Gemini.
    #[serde(alias = "google")]
    Gemini,
}

impl ProviderKind {
    /// Returns `true` for backends that speak the `OpenAI` chat completions API.
    #[must_use]
    pub const fn is_openai_compatible(self) -> bool {
        matches!(self, Self::Openai | Self::Vllm | Self::LlamaCpp)
    }

    /// Returns the default base URL for self-hosted backends.
    #[must_use]
    pub const fn default_base_url(self) -> Option<&'static str> {
        match self {
            Self::Vllm => Some("http://localhost:8000"),
            Self::LlamaCpp => Some("http://localhost:8080"),
            Self::Ollama => Some("http://localhost:11434"),
            Self::Openai | Self::Gemini => None,
        }
    }

    /// Returns the environment variable holding the API key by default.
    #[must_use]
    pub const fn default_api_key_env(self) -> Option<&'static str> {
        match self {
            Self::Openai => Some("OPENAI_API_KEY"),
            Self::Gemini => Some("GEMINI_API_KEY"),
            Self::Vllm | Self::LlamaCpp | Self::Ollama => None,
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Openai => "openai",
            Self::Vllm => "vllm",
            Self::LlamaCpp => "llama_cpp",
            Self::Ollama => "ollama",
            Self::Gemini => "gemini",
        })
    }
}

/// `[provider]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderSection {
    /// Backend to talk to.
    pub kind: ProviderKind,
    /// Default model name.
    pub model: String,
    /// Base URL override.
    #[serde(default)]
    pub base_url: Option<String>,
    /// Environment variable holding the API key.
    #[serde(default)]
    pub api_key_env: Option<String>,
    /// Default sampling temperature.
    #[serde(default)]
    pub temperature: Option<f32>,
}

impl ProviderSection {
    /// Returns the configured base URL or the backend default.
    #[must_use]
    pub fn base_url(&self) -> Option<&str> {
        self.base_url
            .as_deref()
            .or_else(|| self.kind.default_base_url())
    }

    /// Returns the configured key variable or the backend default.
    #[must_use]
    pub fn api_key_env(&self) -> Option<&str> {
        self.api_key_env
            .as_deref()
            .or_else(|| self.kind.default_api_key_env())
    }
}

/// `[routes]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RoutesSection {
    /// Prefix applied to every registered route.
    #[serde(default)]
    pub api_prefix: String,
    /// Address of the streaming session channel.
    #[serde(default = "default_channel_path")]
    pub channel_path: String,
    /// Directory holding prompt documents.
    #[serde(default = "default_prompt_dir")]
    pub prompt_dir: PathBuf,
    /// Route address to prompt identifier.
    #[serde(default)]
    pub paths: BTreeMap<String, String>,
}

impl Default for RoutesSection {
    fn default() -> Self {
        Self {
            api_prefix: String::new(),
            channel_path: default_channel_path(),
            prompt_dir: default_prompt_dir(),
            paths: BTreeMap::new(),
        }
    }
}

fn default_channel_path() -> String {
    "/ws".to_owned()
}

fn default_prompt_dir() -> PathBuf {
    PathBuf::from("prompts")
}

/// `[telemetry]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TelemetrySection {
    /// Default `EnvFilter` directive; `RUST_LOG` takes precedence.
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
    /// Include event targets in log lines.
    #[serde(default)]
    pub with_target: bool,
}

impl Default for TelemetrySection {
    fn default() -> Self {
        Self {
            log_filter: default_log_filter(),
            with_target: false,
        }
    }
}

fn default_log_filter() -> String {
    "info".to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: &str = r#"
[session]
idle_timeout_secs = 900
sweep_interval_secs = 60
summarize_after_turns = 20

[guardrail]
correction_budget = 2

[transport]
max_attempts = 3
initial_backoff_ms = 250
max_backoff_ms = 4000
call_timeout_secs = 60

[provider]
kind = "ollama"
model = "llama3"

[routes]
api_prefix = "/api"

[routes.paths]
"/mood" = "mood/json"
"#;

    #[test]
    fn parses_valid_document() {
        let config = RuntimeConfig::from_toml_str(VALID).expect("valid");
        assert_eq!(config.session.idle_timeout(), Duration::from_secs(900));
        assert_eq!(config.guardrail.correction_budget, 2);
        assert_eq!(config.transport.initial_backoff(), Duration::from_millis(250));
        assert_eq!(config.provider.kind, ProviderKind::Ollama);
        assert_eq!(config.provider.base_url(), Some("http://localhost:11434"));
        assert_eq!(config.provider.api_key_env(), None);
        assert_eq!(config.routes.channel_path, "/ws");
        assert_eq!(config.routes.paths.get("/mood").map(String::as_str), Some("mood/json"));
        assert_eq!(config.telemetry.log_filter, "info");
    }

    #[test]
    fn limits_are_required() {
        let without_budget = VALID.replace("[guardrail]\ncorrection_budget = 2\n", "");
        let err = RuntimeConfig::from_toml_str(&without_budget).expect_err("missing section");
        assert!(format!("{err:#}").contains("guardrail"));

        let without_timeout = VALID.replace("idle_timeout_secs = 900\n", "");
        assert!(RuntimeConfig::from_toml_str(&without_timeout).is_err());
    }

    #[test]
    fn rejects_inconsistent_values() {
        let cases = [
            ("idle_timeout_secs = 900", "idle_timeout_secs = 0"),
            ("max_attempts = 3", "max_attempts = 0"),
            ("initial_backoff_ms = 250", "initial_backoff_ms = 9000"),
            ("api_prefix = \"/api\"", "api_prefix = \"/api\"\nchannel_path = \"/\""),
            ("model = \"llama3\"", "model = \"llama3\"\nbase_url = \"localhost\""),
        ];
        for (from, to) in cases {
            let doc = VALID.replace(from, to);
            assert!(RuntimeConfig::from_toml_str(&doc).is_err(), "{to}");
        }
    }

    #[test]
    fn rejects_unknown_keys() {
        let doc = VALID.replace("correction_budget = 2", "correction_budget = 2\nretries = 1");
        assert!(RuntimeConfig::from_toml_str(&doc).is_err());
    }

    #[test]
    fn provider_aliases() {
        let doc = VALID.replace("kind = \"ollama\"", "kind = \"google\"");
        let config = RuntimeConfig::from_toml_str(&doc).unwrap();
        assert_eq!(config.provider.kind, ProviderKind::Gemini);
        assert_eq!(config.provider.api_key_env(), Some("GEMINI_API_KEY"));
        assert!(!config.provider.kind.is_openai_compatible());
    }

    #[test]
    fn load_reports_missing_file() {
        let err = RuntimeConfig::load("/definitely/not/here.toml").expect_err("missing");
        assert!(err.to_string().contains("failed to read config file"));
    }
}
