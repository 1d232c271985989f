//! Structured logging setup.
//!
//! Libraries in this workspace only emit `tracing` events; binaries call
//! [`init_tracing`] once at startup to install a formatter.

#![warn(missing_docs, clippy::pedantic)]

use lean_config::TelemetrySection;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

/// Errors raised while installing the subscriber.
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// The default filter directive could not be parsed.
    #[error("invalid log filter `{directive}`: {reason}")]
    InvalidFilter {
        /// Offending directive.
        directive: String,
        /// Parser diagnostic.
        reason: String,
    },
}

/// Subscriber options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryConfig {
    filter: String,
    with_target: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_owned(),
            with_target: false,
        }
    }
}

impl TelemetryConfig {
    /// Creates options with the given default filter directive.
    #[must_use]
    pub fn new(filter: impl Into<String>) -> Self {
        Self {
            filter: filter.into(),
            ..Self::default()
        }
    }

    /// Includes event targets in log lines.
    #[must_use]
    pub fn with_target(mut self, enabled: bool) -> Self {
        self.with_target = enabled;
        self
    }

    /// Returns the default filter directive.
    #[must_use]
    pub fn filter(&self) -> &str {
        &self.filter
    }

    fn env_filter(&self) -> Result<EnvFilter, TelemetryError> {
        if let Ok(filter) = EnvFilter::try_from_default_env() {
            return Ok(filter);
        }
        EnvFilter::try_new(&self.filter).map_err(|err| TelemetryError::InvalidFilter {
            directive: self.filter.clone(),
            reason: err.to_string(),
        })
    }
}

impl From<&TelemetrySection> for TelemetryConfig {
    fn from(section: &TelemetrySection) -> Self {
        Self::new(section.log_filter.clone()).with_target(section.with_target)
    }
}

/// Installs the global fmt subscriber.
///
/// `RUST_LOG` overrides the configured directive. Returns `Ok(false)` when a
/// global subscriber was already installed, so repeated calls are harmless.
///
/// # Errors
///
/// Returns [`TelemetryError::InvalidFilter`] if the directive is malformed.
pub fn init_tracing(config: &TelemetryConfig) -> Result<bool, TelemetryError> {
    let filter = config.env_filter()?;
    let installed = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.with_target)
        .with_level(true)
        .try_init()
        .is_ok();
    Ok(installed)
}
