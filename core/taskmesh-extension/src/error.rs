//! Error types for extensions.

use crate::lifecycle::{LifecycleOp, LifecycleState};
use thiserror::Error;

/// Result type for extension operations.
pub type ExtensionResult<T> = Result<T, ExtensionError>;

#[derive(Debug, Error)]
pub enum ExtensionError {
    /// An extension with this id is already registered. Unregister it first.
    #[error("extension already registered: {0}")]
    Duplicate(String),

    #[error("extension not found: {0}")]
    NotFound(String),

    /// A lifecycle method was called out of order.
    #[error("illegal state: cannot {operation} extension '{extension_id}' while {state}")]
    IllegalState {
        extension_id: String,
        state: LifecycleState,
        operation: LifecycleOp,
    },

    #[error("extension '{extension_id}' failed to {operation}: {message}")]
    Lifecycle {
        extension_id: String,
        operation: LifecycleOp,
        message: String,
    },

    /// The external source rejected or failed a request.
    #[error("source error: {0}")]
    Source(String),

    /// A raw item could not be turned into an entity.
    #[error("transform error: {0}")]
    Transform(String),

    #[error("capability '{capability}' not supported by extension '{extension_id}'")]
    Unsupported {
        extension_id: String,
        capability: String,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
