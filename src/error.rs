//! Crate-level error type and secret redaction
//!
//! Each adapter owns its own error enum; this module aggregates them for the
//! binary and for embedders that drive both adapters.

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// Top-level error for embedding applications
#[derive(Debug, Error)]
pub enum RepertoryError {
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("Broker error: {0}")]
    Broker(#[from] crate::transport::mqtt::MqttError),

    #[error("Bot session error: {0}")]
    Session(#[from] crate::telegram::SessionError),

    #[error("Command registry error: {0}")]
    Registry(#[from] crate::telegram::RegistryError),

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl RepertoryError {
    /// Create internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

/// Result type for crate operations
pub type RepertoryResult<T> = Result<T, RepertoryError>;

static BOT_TOKEN_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"bot\d+:[A-Za-z0-9_-]+").expect("static regex"));

static SECRET_ASSIGNMENT_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(password|token|secret)[=:]\s*\S+").expect("static regex")
});

const MAX_REDACTED_LEN: usize = 500;

/// Strip access tokens and credentials from text destined for logs.
///
/// Request URLs embed the bot token as `/bot<id>:<secret>/`, and transport
/// errors echo those URLs back verbatim.
pub fn redact_secrets(message: &str) -> String {
    let mut redacted = BOT_TOKEN_PATTERN
        .replace_all(message, "bot***")
        .to_string();

    redacted = SECRET_ASSIGNMENT_PATTERN
        .replace_all(&redacted, "${1}=***")
        .to_string();

    if redacted.len() > MAX_REDACTED_LEN {
        let suffix = "...[truncated]";
        let mut cut = MAX_REDACTED_LEN - suffix.len();
        while !redacted.is_char_boundary(cut) {
            cut -= 1;
        }
        redacted = format!("{}{}", &redacted[..cut], suffix);
    }

    redacted
}
