use crate::error::ExtensionResult;
use async_trait::async_trait;
use serde_json::Value;
use taskmesh_types::{Entity, EntityId};

/// Per-source lookup and write-back adapter.
///
/// A provider answers "what does this source currently believe about the
/// entity" and pushes patches back to it. It is consulted for reads only
/// when the live collection does not hold the entity.
#[async_trait]
pub trait EntityDataProvider: Send + Sync {
    /// Id of the extension that owns the source.
    fn extension_id(&self) -> &str;

    /// True if this provider owns `entity`.
    fn can_handle(&self, entity: &Entity) -> bool {
        entity.extension_id() == Some(self.extension_id())
    }

    /// Read-only providers accept writes as documented no-ops.
    fn is_read_only(&self) -> bool {
        false
    }

    /// The source's view of the entity, as a partial payload.
    async fn read_entity_data(&self, entity_id: EntityId) -> ExtensionResult<Option<Value>>;

    /// Pushes `patch` for `entity` to the source.
    async fn write_entity_data(&self, entity: &Entity, patch: &Value) -> ExtensionResult<()>;
}
