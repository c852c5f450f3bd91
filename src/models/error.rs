//! Error types for exportkit.
//!
//! Epistemic taxonomy:
//! - B_i falsified: Configuration is wrong (missing settings, unknown exclusions)
//! - I^B materialized: The origin misbehaved (network, throttling, bad status)
//! - K_i violated: Local state could not be read or written

use std::time::Duration;
use thiserror::Error;

/// Top-level error type for exportkit.
#[derive(Debug, Error)]
pub enum ExportError {
    // ═══════════════════════════════════════════════════════════════════
    // FATAL CONFIGURATION: abort the run, never retried
    // ═══════════════════════════════════════════════════════════════════
    #[error("Configuration error: {0}")]
    Config(#[from] super::ConfigError),

    #[error("wanted to exclude non existing entity: {0}")]
    UnknownExclusion(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    // ═══════════════════════════════════════════════════════════════════
    // RETRYABLE TRANSPORT: retried by the requester's general budget
    // ═══════════════════════════════════════════════════════════════════
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Request timeout after {0:?}")]
    Timeout(Duration),

    // ═══════════════════════════════════════════════════════════════════
    // FATAL REQUEST: abort the enclosing stage and the run
    // ═══════════════════════════════════════════════════════════════════
    #[error("Rate limited after {attempts} attempts (status {status}), can't retry: {body}")]
    RateLimitExhausted {
        attempts: u32,
        status: u16,
        body: String,
    },

    #[error("Authentication failed (status {status}): {message}")]
    AuthenticationFailed { status: u16, message: String },

    #[error("Request failed with status code {status}")]
    HttpStatus { status: u16, body: String },

    #[error("API request failed: type: {kind} message: {message}")]
    Api { kind: String, message: String },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Can't retry request, too many retries ({attempts}): {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    #[error("Pagination error: {0}")]
    Pagination(String),

    // ═══════════════════════════════════════════════════════════════════
    // STATE I/O: fatal for the current run
    // ═══════════════════════════════════════════════════════════════════
    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Record does not have {0}")]
    MissingField(&'static str),

    // ═══════════════════════════════════════════════════════════════════
    // RUNTIME
    // ═══════════════════════════════════════════════════════════════════
    #[error("Run cancelled")]
    Cancelled,

    #[error("Channel closed unexpectedly")]
    ChannelClosed,

    #[error("Child process exited with {0}")]
    ChildExited(String),

    #[error("no running process for command {0}")]
    NotRunning(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ExportError {
    /// Create an IO error with context.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Check if this error is retryable by the general retry budget.
    ///
    /// Rate-limit signals are not listed here: they are consumed by the
    /// throttle budget and only surface as the fatal `RateLimitExhausted`.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Network(_) | Self::Connection(_) | Self::Timeout(_)
        )
    }

    /// True for errors caused by cancelling the run context.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<serde_json::Error> for ExportError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// Result type alias for exportkit.
pub type Result<T> = std::result::Result<T, ExportError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(ExportError::Connection("reset".into()).is_retryable());
        assert!(ExportError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(
            !ExportError::HttpStatus {
                status: 500,
                body: String::new()
            }
            .is_retryable()
        );
        assert!(!ExportError::UnknownExclusion("r1".into()).is_retryable());
        assert!(!ExportError::Cancelled.is_retryable());
    }
}
