//! Core type definitions for taskmesh.
//!
//! This crate defines the source-agnostic types shared by every layer of the
//! engine:
//! - Entity identifiers (UUID v7)
//! - The canonical [`Entity`] record (task, project, area, schedule)
//! - Cross-source identity ([`SourceRef`], [`SourceIdentity`])
//! - Domain events broadcast on the event bus
//!
//! Wire formats of individual integrations belong in their adapters, not here.

mod entity;
mod event;
mod handler;
mod ids;
mod source;

pub use entity::{Entity, EntityKind};
pub use event::{DomainEvent, EventType};
pub use handler::{DefaultHandler, EntityHandler};
pub use ids::EntityId;
pub use source::{SourceIdentity, SourceRef};

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in type operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid UUID: {0}")]
    InvalidUuid(#[from] uuid::Error),

    #[error("invalid patch: {0}")]
    InvalidPatch(String),
}
