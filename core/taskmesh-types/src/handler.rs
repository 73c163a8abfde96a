use crate::Entity;

/// Optional hook for entity validation and conflict resolution.
///
/// Most sources do NOT need this. Implement it when writes must be rejected
/// on content (e.g. a task without a title) or when two views of the same
/// entity need a merge smarter than "newer wins".
pub trait EntityHandler: Send + Sync {
    /// Validate an entity before it is written. `Err(message)` rejects the write.
    fn validate(&self, entity: &Entity) -> Result<(), String> {
        let _ = entity;
        Ok(())
    }

    /// Reconcile two views of the same entity.
    /// Default implementation keeps the one with the later `updated_at`.
    fn merge(&self, local: &Entity, remote: &Entity) -> Entity {
        if remote.updated_at > local.updated_at {
            remote.clone()
        } else {
            local.clone()
        }
    }
}

/// Handler that accepts everything and uses the default merge.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultHandler;

impl EntityHandler for DefaultHandler {}
