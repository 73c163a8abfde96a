//! One-off import of external items into the live collection.

use crate::collection::{EntityCollection, UpsertOutcome};
use crate::error::{SyncError, SyncResult};
use serde_json::Value;
use std::sync::Arc;
use taskmesh_extension::{EventBus, ExtensionError, ExtensionRegistry};
use taskmesh_types::{DomainEvent, EntityId, SourceIdentity};
use tracing::info;

/// What happened to an imported item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportOutcome {
    Imported(EntityId),
    /// The item was already in the collection under this id.
    AlreadyImported(EntityId),
}

impl ImportOutcome {
    pub fn entity_id(&self) -> EntityId {
        match self {
            Self::Imported(id) | Self::AlreadyImported(id) => *id,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, Self::Imported(_))
    }
}

/// Imports raw items through their extension's source adapter.
pub struct Importer {
    registry: Arc<ExtensionRegistry>,
    collection: Arc<EntityCollection>,
    bus: Arc<EventBus>,
}

impl Importer {
    pub fn new(
        registry: Arc<ExtensionRegistry>,
        collection: Arc<EntityCollection>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            registry,
            collection,
            bus,
        }
    }

    /// Transforms `raw` with the adapter of `extension_id` and adds it to the
    /// collection unless an entity with the same source identity exists.
    pub fn import(&self, extension_id: &str, raw: &Value) -> SyncResult<ImportOutcome> {
        let extension = self.registry.require_loaded(extension_id)?;
        let adapter = extension
            .source_adapter()
            .ok_or_else(|| ExtensionError::Unsupported {
                extension_id: extension_id.to_string(),
                capability: "source_adapter".to_string(),
            })?;

        let entity = adapter.transform(raw)?;
        if entity.extension_id() != Some(extension_id) {
            return Err(SyncError::InvalidEntity(format!(
                "adapter for {extension_id} produced an entity owned by {:?}",
                entity.extension_id()
            )));
        }

        match self.collection.upsert_sourced(entity)? {
            UpsertOutcome::Inserted(id) => {
                if let Some(stored) = self.collection.get(id) {
                    info!(extension_id, entity_id = %id, "Imported entity");
                    self.bus.publish(&DomainEvent::entity_imported(&stored));
                }
                Ok(ImportOutcome::Imported(id))
            }
            UpsertOutcome::AlreadyPresent(id) => Ok(ImportOutcome::AlreadyImported(id)),
        }
    }

    /// True if `(extension_id, source_key)` is already in the collection.
    pub fn is_imported(&self, extension_id: &str, source_key: &str) -> bool {
        self.collection
            .find_by_identity(&SourceIdentity::new(extension_id, source_key))
            .is_some()
    }
}
