//! Cross-source read and write resolution.
//!
//! Reads prefer the live collection. A provider is asked only when the
//! collection does not hold the entity, so a provider's cached view can never
//! shadow a local edit that was just applied. Writes go to the provider that
//! owns the entity's source and, once accepted there, into the collection.

use crate::collection::EntityCollection;
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult, within};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};
use taskmesh_extension::{EntityDataProvider, EventBus, Extension, ExtensionError, ExtensionResult};
use taskmesh_types::{DomainEvent, Entity, EntityHandler, EntityId, EntityKind};
use tracing::{debug, info, warn};

/// Routes entity reads and writes between the collection and per-source providers.
pub struct SyncResolver {
    collection: Arc<EntityCollection>,
    bus: Arc<EventBus>,
    providers: RwLock<BTreeMap<String, Arc<dyn EntityDataProvider>>>,
    handlers: RwLock<HashMap<EntityKind, Arc<dyn EntityHandler>>>,
    read_timeout_ms: u64,
    write_timeout_ms: u64,
}

impl SyncResolver {
    pub fn new(collection: Arc<EntityCollection>, bus: Arc<EventBus>, config: &SyncConfig) -> Self {
        Self {
            collection,
            bus,
            providers: RwLock::new(BTreeMap::new()),
            handlers: RwLock::new(HashMap::new()),
            read_timeout_ms: config.fetch_timeout_ms,
            write_timeout_ms: config.write_timeout_ms,
        }
    }

    pub fn collection(&self) -> &Arc<EntityCollection> {
        &self.collection
    }

    /// Registers the provider for its extension id, replacing and returning
    /// any previous one.
    pub fn register_provider(
        &self,
        provider: Arc<dyn EntityDataProvider>,
    ) -> Option<Arc<dyn EntityDataProvider>> {
        let id = provider.extension_id().to_string();
        let previous = self
            .providers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone(), provider);
        if previous.is_some() {
            info!(extension_id = %id, "Replaced entity data provider");
        } else {
            debug!(extension_id = %id, "registered entity data provider");
        }
        previous
    }

    pub fn unregister_provider(&self, extension_id: &str) -> Option<Arc<dyn EntityDataProvider>> {
        self.providers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(extension_id)
    }

    pub fn provider(&self, extension_id: &str) -> Option<Arc<dyn EntityDataProvider>> {
        self.providers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(extension_id)
            .cloned()
    }

    /// Installs a validation hook for one entity kind.
    pub fn set_handler(&self, kind: EntityKind, handler: Arc<dyn EntityHandler>) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(kind, handler);
    }

    /// True if a registered provider owns `entity`.
    pub fn can_handle(&self, entity: &Entity) -> bool {
        entity
            .extension_id()
            .and_then(|id| self.provider(id))
            .is_some_and(|p| p.can_handle(entity))
    }

    /// Current data for `entity_id`: the live collection first, then each
    /// provider in extension id order. Provider failures are logged and skipped.
    pub async fn read_entity_data(&self, entity_id: EntityId) -> SyncResult<Option<Value>> {
        if let Some(entity) = self.collection.get(entity_id) {
            return Ok(Some(entity.data));
        }

        let providers: Vec<Arc<dyn EntityDataProvider>> = self
            .providers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();

        for provider in providers {
            let read = async {
                provider
                    .read_entity_data(entity_id)
                    .await
                    .map_err(SyncError::from)
            };
            match within("read entity data", self.read_timeout_ms, read).await {
                Ok(Some(data)) => {
                    debug!(
                        entity_id = %entity_id,
                        extension_id = provider.extension_id(),
                        "resolved from provider"
                    );
                    return Ok(Some(data));
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(
                        entity_id = %entity_id,
                        extension_id = provider.extension_id(),
                        "provider read failed: {}",
                        e
                    );
                }
            }
        }
        Ok(None)
    }

    /// Applies `patch` to the entity and pushes it to the owning source.
    ///
    /// The collection changes only after the provider accepted the write.
    /// The patch is then merged into the entity as it is at that moment, so
    /// overlapping writes to different fields all survive. Read-only
    /// providers are skipped and the change stays local. Entities without a
    /// registered provider are updated locally only.
    pub async fn write_entity_data(
        &self,
        entity_id: EntityId,
        patch: &Value,
    ) -> SyncResult<Entity> {
        let mut entity = self
            .collection
            .get(entity_id)
            .ok_or(SyncError::EntityNotFound(entity_id))?;
        entity.apply_patch(patch, Utc::now())?;

        let handler = self.handler(entity.kind);
        if let Some(handler) = &handler {
            handler
                .validate(&entity)
                .map_err(|reason| SyncError::Validation { entity_id, reason })?;
        }

        if let Some(provider) = entity.extension_id().and_then(|id| self.provider(id)) {
            if provider.is_read_only() {
                debug!(
                    entity_id = %entity_id,
                    extension_id = provider.extension_id(),
                    "read-only source, change kept local"
                );
            } else {
                let write = async {
                    provider
                        .write_entity_data(&entity, patch)
                        .await
                        .map_err(SyncError::from)
                };
                within("write entity data", self.write_timeout_ms, write).await?;
            }
        }

        let updated = self.collection.modify(entity_id, |current| {
            current.apply_patch(patch, Utc::now())?;
            if let Some(handler) = &handler {
                handler
                    .validate(current)
                    .map_err(|reason| SyncError::Validation { entity_id, reason })?;
            }
            Ok(())
        })?;
        self.bus.publish(&DomainEvent::entity_updated(&updated));
        Ok(updated)
    }

    /// Validates and inserts a locally created entity.
    pub fn create_entity(&self, entity: Entity) -> SyncResult<EntityId> {
        if let Some(handler) = self.handler(entity.kind) {
            handler.validate(&entity).map_err(|reason| SyncError::Validation {
                entity_id: entity.id,
                reason,
            })?;
        }
        let id = self.collection.insert_native(entity.clone())?;
        self.bus.publish(&DomainEvent::entity_created(&entity));
        Ok(id)
    }

    /// Reconciles a freshly fetched entity with the one already held.
    ///
    /// Uses the handler for the entity kind. Without one the incoming
    /// entity is taken as is.
    pub fn merge_incoming(&self, local: &Entity, incoming: Entity) -> Entity {
        match self.handler(incoming.kind) {
            Some(handler) => handler.merge(local, &incoming),
            None => incoming,
        }
    }

    fn handler(&self, kind: EntityKind) -> Option<Arc<dyn EntityHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .cloned()
    }
}

/// Provider backed by an extension's [`TaskOperations`](taskmesh_extension::TaskOperations).
///
/// Reads need the entity's source key, so entities are tracked as they pass
/// through the write path or via [`TaskOperationsProvider::track`].
pub struct TaskOperationsProvider {
    extension: Arc<dyn Extension>,
    keys: RwLock<HashMap<EntityId, String>>,
}

impl TaskOperationsProvider {
    pub fn new(extension: Arc<dyn Extension>) -> Self {
        Self {
            extension,
            keys: RwLock::new(HashMap::new()),
        }
    }

    /// Remembers the source key of `entity` so it can be read back by id.
    pub fn track(&self, entity: &Entity) {
        if let Some(source) = &entity.source {
            self.keys
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(entity.id, source.source_key.clone());
        }
    }

    fn unsupported(&self) -> ExtensionError {
        ExtensionError::Unsupported {
            extension_id: self.extension.id().to_string(),
            capability: "task_operations".to_string(),
        }
    }
}

#[async_trait]
impl EntityDataProvider for TaskOperationsProvider {
    fn extension_id(&self) -> &str {
        self.extension.id()
    }

    fn is_read_only(&self) -> bool {
        self.extension
            .task_operations()
            .is_none_or(|ops| !ops.supports_write_back())
    }

    async fn read_entity_data(&self, entity_id: EntityId) -> ExtensionResult<Option<Value>> {
        let key = self
            .keys
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&entity_id)
            .cloned();
        let Some(key) = key else {
            return Ok(None);
        };
        let ops = self.extension.task_operations().ok_or_else(|| self.unsupported())?;
        ops.fetch_task(&key).await
    }

    async fn write_entity_data(&self, entity: &Entity, patch: &Value) -> ExtensionResult<()> {
        let source = entity.source.as_ref().ok_or_else(|| {
            ExtensionError::Source(format!("entity {} has no source reference", entity.id))
        })?;
        let ops = self.extension.task_operations().ok_or_else(|| self.unsupported())?;
        if !ops.supports_write_back() {
            return Ok(());
        }
        ops.update_task(&source.source_key, patch).await?;
        self.track(entity);
        Ok(())
    }
}

/// Provider for sources without a write-back API.
///
/// Writes are accepted and dropped; reads answer from the last data handed
/// to [`ReadOnlyProvider::remember`].
pub struct ReadOnlyProvider {
    extension_id: String,
    known: RwLock<HashMap<EntityId, Value>>,
}

impl ReadOnlyProvider {
    pub fn new(extension_id: impl Into<String>) -> Self {
        Self {
            extension_id: extension_id.into(),
            known: RwLock::new(HashMap::new()),
        }
    }

    pub fn remember(&self, entity: &Entity) {
        self.known
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(entity.id, entity.data.clone());
    }
}

#[async_trait]
impl EntityDataProvider for ReadOnlyProvider {
    fn extension_id(&self) -> &str {
        &self.extension_id
    }

    fn is_read_only(&self) -> bool {
        true
    }

    async fn read_entity_data(&self, entity_id: EntityId) -> ExtensionResult<Option<Value>> {
        Ok(self
            .known
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&entity_id)
            .cloned())
    }

    /// No-op: the source cannot be written to.
    async fn write_entity_data(&self, _entity: &Entity, _patch: &Value) -> ExtensionResult<()> {
        Ok(())
    }
}
