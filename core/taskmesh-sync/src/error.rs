//! Error types for the sync layer.

use crate::staging::CommitReport;
use std::future::Future;
use std::time::Duration;
use taskmesh_cache::CacheError;
use taskmesh_extension::ExtensionError;
use taskmesh_types::EntityId;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur in sync operations.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Extension(#[from] ExtensionError),

    #[error(transparent)]
    Types(#[from] taskmesh_types::Error),

    /// An external call did not finish in time. Its late result is discarded.
    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    /// An adapter failed to fetch one sub-resource.
    #[error("failed to fetch '{sub_resource}' from {extension_id}: {message}")]
    SourceFetch {
        extension_id: String,
        sub_resource: String,
        message: String,
    },

    /// Some staged mutations failed. Carries the full report.
    #[error("{} of {} staged mutations failed", .0.failed.len(), .0.attempted())]
    PartialCommit(CommitReport),

    #[error("entity not found: {0}")]
    EntityNotFound(EntityId),

    /// An entity handler rejected a write.
    #[error("validation failed for {entity_id}: {reason}")]
    Validation { entity_id: EntityId, reason: String },

    /// The entity cannot go where it was sent (wrong owner, missing source).
    #[error("invalid entity: {0}")]
    InvalidEntity(String),

    #[error("no planning session is active")]
    NoActiveSession,

    #[error("source '{0}' is disabled in the configuration")]
    SourceDisabled(String),

    #[error("config error: {0}")]
    Config(#[from] toml::de::Error),
}

/// Runs `fut` under a deadline, mapping expiry to [`SyncError::Timeout`].
pub(crate) async fn within<T, F>(operation: &str, timeout_ms: u64, fut: F) -> SyncResult<T>
where
    F: Future<Output = SyncResult<T>>,
{
    match tokio::time::timeout(Duration::from_millis(timeout_ms), fut).await {
        Ok(result) => result,
        Err(_) => Err(SyncError::Timeout {
            operation: operation.to_string(),
            timeout_ms,
        }),
    }
}
