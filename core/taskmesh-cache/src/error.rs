//! Error types for the cache layer.

use thiserror::Error;

/// Result type for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;

/// Errors that can occur in cache operations.
#[derive(Debug, Error)]
pub enum CacheError {
    /// A value was rejected by the cache's schema. Nothing was written.
    #[error("schema validation failed for {namespace}/{key}: {reason}")]
    SchemaValidation {
        namespace: String,
        key: String,
        reason: String,
    },

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error (file system).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The persistence collaborator failed.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// The persisted blob does not have the expected layout.
    #[error("invalid data: {0}")]
    InvalidData(String),
}
