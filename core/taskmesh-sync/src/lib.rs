//! Cross-source synchronization for taskmesh.
//!
//! This crate sits on top of the extension registry and the cache and owns
//! everything that coordinates more than one source:
//!
//! - **Collection**: the live entities, unique by `(extension_id, source_key)`
//! - **Importer**: one-off imports that never duplicate an item
//! - **Resolver**: reads and writes routed between the collection and the
//!   per-source [`EntityDataProvider`](taskmesh_extension::EntityDataProvider)s
//! - **Refresh**: per-source fetch, transform and atomic swap
//! - **Staging**: daily planning with preview and partial-failure commits
//!
//! [`TaskMesh`] wires them together.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use taskmesh_cache::MemoryBackend;
//! use taskmesh_sync::{SyncConfig, TaskMesh};
//!
//! let engine = TaskMesh::init(SyncConfig::default(), Arc::new(MemoryBackend::new()));
//! assert!(engine.collection().is_empty());
//! ```

mod collection;
mod config;
mod engine;
mod error;
mod import;
mod refresh;
mod resolver;
mod staging;

pub use collection::{
    CollectionChange, CollectionSnapshot, CollectionSubscription, EntityCollection, LOCAL_OWNER,
    UpsertOutcome, owner_of,
};
pub use config::{SourceOverrides, SourceSettings, SyncConfig};
pub use engine::TaskMesh;
pub use error::{SyncError, SyncResult};
pub use import::{ImportOutcome, Importer};
pub use refresh::{
    RefreshOrchestrator, RefreshProgress, RefreshReport, RefreshStatus, SubResourceFailure,
};
pub use resolver::{ReadOnlyProvider, SyncResolver, TaskOperationsProvider};
pub use staging::{
    CommitFailure, CommitReport, MutationApplier, MutationKind, ScheduleApplier,
    StagedMutationEngine,
    StagedSet,
};
