//! The substrate-wide error taxonomy.
//!
//! Every component returns `Result<T, SubstrateError>`. Background workers
//! (GC sweeps, queue recovery) log their own errors and do not propagate
//! them to any caller.

use thiserror::Error;

/// Errors surfaced by any substrate component.
#[derive(Debug, Error)]
pub enum SubstrateError {
    /// Malformed arguments: empty topic/agent id, empty key, unspecified
    /// namespace, empty data to `Store`.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A reference, key, subscription, or handler is missing.
    #[error("not found: {0}")]
    NotFound(String),

    /// `expected_version` mismatch on a `SharedMemoryStore` write.
    #[error("version conflict on {key}: expected {expected}, found {actual}")]
    VersionConflict {
        key: String,
        expected: u64,
        actual: u64,
    },

    /// A reference is past its TTL at resolve time.
    #[error("expired: {0}")]
    Expired(String),

    /// A queued message exceeded `max_retries` on requeue.
    #[error("max retries exceeded for message {0}")]
    MaxRetriesExceeded(String),

    /// `SendAndReceive` exceeded its deadline.
    #[error("timeout waiting for response to {0}")]
    Timeout(String),

    /// The caller's cancellation token fired before completion.
    #[error("cancelled")]
    Cancelled,

    /// The operation targets a component that has been closed.
    #[error("component closed")]
    Closed,

    /// `Enqueue` targets an agent id rejected by the configured validator.
    #[error("unknown agent: {0}")]
    UnknownAgent(String),

    /// A workflow stage's output failed structural validation through every retry.
    #[error("validation exhausted after {retries} retries: {last_error}")]
    ValidationExhausted { retries: u32, last_error: String },

    /// A restart request failed one of the ordered validation rules.
    #[error("restart rejected: {0}")]
    RestartRejected(String),

    /// Underlying storage failure (sqlite, I/O).
    #[error("storage error: {0}")]
    Storage(String),

    /// Serialization/deserialization failure.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for SubstrateError {
    fn from(e: serde_json::Error) -> Self {
        SubstrateError::Serialization(e.to_string())
    }
}

impl From<rusqlite::Error> for SubstrateError {
    fn from(e: rusqlite::Error) -> Self {
        SubstrateError::Storage(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// **Scenario**: `Display` of each variant contains an expected keyword, so
    /// log lines and API error bodies remain greppable.
    #[test]
    fn display_contains_keyword() {
        assert!(SubstrateError::InvalidInput("x".into())
            .to_string()
            .contains("invalid input"));
        assert!(SubstrateError::NotFound("x".into())
            .to_string()
            .contains("not found"));
        assert!(SubstrateError::VersionConflict {
            key: "k".into(),
            expected: 1,
            actual: 2
        }
        .to_string()
        .contains("version conflict"));
        assert!(SubstrateError::Expired("x".into())
            .to_string()
            .contains("expired"));
        assert!(SubstrateError::MaxRetriesExceeded("x".into())
            .to_string()
            .contains("max retries"));
        assert!(SubstrateError::Timeout("x".into())
            .to_string()
            .contains("timeout"));
        assert!(SubstrateError::Cancelled.to_string().contains("cancelled"));
        assert!(SubstrateError::Closed.to_string().contains("closed"));
        assert!(SubstrateError::UnknownAgent("x".into())
            .to_string()
            .contains("unknown agent"));
        assert!(SubstrateError::ValidationExhausted {
            retries: 3,
            last_error: "bad".into()
        }
        .to_string()
        .contains("validation exhausted"));
        assert!(SubstrateError::RestartRejected("x".into())
            .to_string()
            .contains("restart rejected"));
    }
}
