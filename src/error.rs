//! Error types for the engine and its collaborators.
//!
//! Errors are classified at the escalation boundary by recoverability:
//! - Retryable: network issues, timeouts, rate limits, 5xx responses
//! - NonRetryable: configuration errors, other rejected requests

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by an `EventStore` backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Failed to encode or decode record: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Failed to create store directory {0}: {1}")]
    CreateDir(PathBuf, std::io::Error),

    #[error("Schema migration failed: {0}")]
    Migration(String),

    #[error("Store task failed: {0}")]
    Task(String),
}

/// Errors from a narrative-generation call.
#[derive(Debug, Error)]
pub enum EscalationError {
    // Retryable errors
    #[error("Network error: {0}")]
    Network(String),

    #[error("Narrative call timed out after {0} seconds")]
    Timeout(u64),

    #[error("Narrative service rejected the request with status {status}: {body}")]
    Rejected { status: u16, body: String },

    // Non-retryable errors
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl EscalationError {
    /// Returns true if another attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            EscalationError::Network(_) | EscalationError::Timeout(_) => true,
            EscalationError::Rejected { status, .. } => *status == 429 || *status >= 500,
            EscalationError::Configuration(_) => false,
        }
    }

    /// True when the collaborator answered but refused; false for transport
    /// problems where it never answered.
    pub fn is_rejection(&self) -> bool {
        matches!(self, EscalationError::Rejected { .. })
    }
}

impl From<reqwest::Error> for EscalationError {
    fn from(err: reqwest::Error) -> Self {
        EscalationError::Network(err.to_string())
    }
}

/// Top-level engine errors. These never escape the scheduler entrypoint;
/// they are rendered into an `error` run report.
#[derive(Debug, Error)]
pub enum SentinelError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Warm-up of {0} did not finish within {1} seconds")]
    WarmUpTimeout(&'static str, u64),

    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    #[error("Internal fault: {0}")]
    Internal(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(EscalationError::Network("reset".into()).is_retryable());
        assert!(EscalationError::Timeout(45).is_retryable());
        assert!(EscalationError::Rejected { status: 503, body: String::new() }.is_retryable());
        assert!(EscalationError::Rejected { status: 429, body: String::new() }.is_retryable());
        assert!(!EscalationError::Rejected { status: 400, body: String::new() }.is_retryable());
        assert!(!EscalationError::Configuration("no url".into()).is_retryable());
    }

    #[test]
    fn test_rejection_vs_transport() {
        assert!(EscalationError::Rejected { status: 500, body: String::new() }.is_rejection());
        assert!(!EscalationError::Timeout(1).is_rejection());
    }
}
