//! Error types for beacon-core
//!
//! The crate-level [`Error`] covers setup and the developer-facing surface
//! (configuration, storage adapters, DLQ tooling). Pipeline stages carry their
//! own narrower enums so callers can match on exactly what a stage can fail
//! with. None of these ever reach the caller of `track()`.

use thiserror::Error;

/// Main error type for the beacon-core library
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Storage capability failure
    #[error("storage error: {0}")]
    Storage(String),

    /// Batch compression failure
    #[error("compression error: {0}")]
    Compression(String),

    /// Persistent queue error
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    /// Dead letter queue error
    #[error("dead letter error: {0}")]
    DeadLetter(#[from] DlqError),

    /// Operation needs `initialize()` first
    #[error("client is not initialized")]
    NotInitialized,

    /// Operation attempted after `shutdown()`
    #[error("client has been shut down")]
    ShutDown,
}

/// Result type alias for beacon-core
pub type Result<T> = std::result::Result<T, Error>;

/// Taxonomy validation failure. The event is dropped before it is queued.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchemaError {
    /// Name is not registered and the registry is strict
    #[error("unknown event: {name}")]
    UnknownEvent { name: String },

    /// Name is not lowercase snake_case of 1..=64 characters
    #[error("invalid event name: {name:?}")]
    InvalidName { name: String },

    /// A property has the wrong type
    #[error("field {field}: expected {expected}, got {actual}")]
    TypeMismatch {
        field: String,
        expected: String,
        actual: String,
    },

    /// A required property is absent
    #[error("missing required field: {field}")]
    MissingField { field: String },

    /// The schema does not allow properties it does not declare
    #[error("unexpected field: {field}")]
    UnexpectedField { field: String },
}

/// Failure of one transport send, after internal retries.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Every attempt hit its deadline
    #[error("request timed out")]
    Timeout,

    /// The collector answered with a non-success status
    #[error("server rejected batch with status {0}")]
    ServerRejected(u16),

    /// No route to the collector
    #[error("network unavailable")]
    NetworkUnavailable,
}

impl TransportError {
    /// Whether another attempt could succeed.
    ///
    /// 429 and 5xx are transient; any other rejection means the batch itself
    /// is unacceptable and resending it cannot help.
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::Timeout | TransportError::NetworkUnavailable => true,
            TransportError::ServerRejected(status) => *status == 429 || *status >= 500,
        }
    }
}

/// Error reported by the injected network capability
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetworkError {
    /// Could not connect (offline, DNS, refused)
    #[error("connection failed: {0}")]
    Connect(String),

    /// The request exceeded the caller-supplied timeout
    #[error("request timed out")]
    Timeout,

    /// Anything else the HTTP stack reports
    #[error("request failed: {0}")]
    Other(String),
}

/// Persistent queue errors
#[derive(Error, Debug)]
pub enum QueueError {
    /// At capacity with nothing evictable (every entry is in flight)
    #[error("queue is full ({cap} entries, none pending)")]
    Full { cap: usize },

    /// The storage capability refused a write or read
    #[error("storage error: {0}")]
    Storage(String),

    /// A persisted entry could not be encoded or decoded
    #[error("entry encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Dead letter queue errors
#[derive(Error, Debug)]
pub enum DlqError {
    /// No dead letter with this event id
    #[error("no dead letter for event {0}")]
    NotFound(uuid::Uuid),

    /// The entry died too long ago to be replayed
    #[error("event {0} is outside the replay window")]
    ReplayWindowExpired(uuid::Uuid),

    /// The storage capability refused a write or read
    #[error("storage error: {0}")]
    Storage(String),

    /// A persisted entry could not be encoded or decoded
    #[error("entry encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    /// Re-enqueueing the replayed event failed
    #[error("replay failed: {0}")]
    Replay(#[from] QueueError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_retryability() {
        assert!(TransportError::Timeout.is_retryable());
        assert!(TransportError::NetworkUnavailable.is_retryable());
        assert!(TransportError::ServerRejected(429).is_retryable());
        assert!(TransportError::ServerRejected(500).is_retryable());
        assert!(TransportError::ServerRejected(503).is_retryable());
        assert!(!TransportError::ServerRejected(400).is_retryable());
        assert!(!TransportError::ServerRejected(401).is_retryable());
        assert!(!TransportError::ServerRejected(413).is_retryable());
    }

    #[test]
    fn test_schema_error_display() {
        let err = SchemaError::TypeMismatch {
            field: "noteId".to_string(),
            expected: "string".to_string(),
            actual: "bool".to_string(),
        };
        assert_eq!(err.to_string(), "field noteId: expected string, got bool");
    }
}
