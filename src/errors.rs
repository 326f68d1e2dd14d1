use std::io;
use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum UpdateError {
    #[error("Manifest fetch failed: {0}")]
    ManifestFetch(String),
    #[error("Manifest parse error: {0}")]
    ManifestParse(#[from] serde_json::Error),
    #[error("Invalid manifest entry {path}: {reason}")]
    InvalidEntry { path: String, reason: String },
    #[error("All mirrors failed for {path}: {}", .failures.join(" | "))]
    MirrorExhausted { path: String, failures: Vec<String> },
    #[error("Operation cancelled")]
    Cancelled,
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("HTTP error: {0}")]
    Http(String),
    #[error("Hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },
    #[error("Timed out after {}s", .0.as_secs())]
    Timeout(Duration),
    #[error("Config error: {0}")]
    Config(String),
}

impl UpdateError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, UpdateError::Cancelled)
    }

    pub(crate) fn invalid_entry(path: &str, reason: impl Into<String>) -> Self {
        UpdateError::InvalidEntry {
            path: path.to_string(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, UpdateError>;
