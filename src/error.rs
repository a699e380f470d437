use std::time::Duration;

use thiserror::Error;

/// Runtime failures of the media engine. None of these are fatal: the
/// component that sees one turns it into a reconnect or a skipped write.
#[derive(Debug, Error)]
pub enum MediaError {
    #[error("failed to connect to {url}: {reason}")]
    Connect { url: String, reason: String },

    #[error("decode failed: {0}")]
    Decode(String),

    #[error("send to sink failed: {0}")]
    Send(String),

    #[error("{op} timed out after {after:?}")]
    Timeout { op: &'static str, after: Duration },

    #[error("end of stream")]
    EndOfStream,

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl MediaError {
    pub fn connect(url: impl Into<String>, reason: impl ToString) -> Self {
        Self::Connect {
            url: url.into(),
            reason: reason.to_string(),
        }
    }
}

/// Startup-only failures; these halt the process before any component runs.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("failed to load fallback image {path}: {reason}")]
    FallbackImage { path: String, reason: String },

    #[error("media engine unavailable: {0}")]
    Engine(String),
}
