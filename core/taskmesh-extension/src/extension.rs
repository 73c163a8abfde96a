use crate::error::ExtensionResult;
use crate::provider::EntityDataProvider;
use crate::source::SourceAdapter;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;
use taskmesh_types::{DomainEvent, Entity, EntityKind};

/// A pluggable data source.
///
/// Only `id` and `supported_entity_types` are mandatory. Lifecycle hooks
/// default to no-ops and every capability accessor defaults to `None`; an
/// extension opts into a capability by overriding the matching accessor.
#[async_trait]
pub trait Extension: Send + Sync {
    /// Unique id within the registry.
    fn id(&self) -> &str;

    /// Human-readable name.
    fn name(&self) -> &str {
        self.id()
    }

    /// Entity kinds this extension can produce.
    fn supported_entity_types(&self) -> &[EntityKind];

    /// Event types delivered to [`Extension::handle_event`] while loaded.
    fn subscribed_events(&self) -> Vec<String> {
        Vec::new()
    }

    /// Prepare internal state (credentials, clients). Called once.
    async fn initialize(&self) -> ExtensionResult<()> {
        Ok(())
    }

    /// Start serving. Only called after a successful `initialize`.
    async fn load(&self) -> ExtensionResult<()> {
        Ok(())
    }

    /// Release resources. The registry never calls it twice.
    async fn shutdown(&self) -> ExtensionResult<()> {
        Ok(())
    }

    /// Receives subscribed events. Runs synchronously on the publisher's task.
    fn handle_event(&self, event: &DomainEvent) -> anyhow::Result<()> {
        let _ = event;
        Ok(())
    }

    fn task_operations(&self) -> Option<&dyn TaskOperations> {
        None
    }

    fn calendar_operations(&self) -> Option<&dyn CalendarOperations> {
        None
    }

    fn source_adapter(&self) -> Option<Arc<dyn SourceAdapter>> {
        None
    }

    fn data_provider(&self) -> Option<Arc<dyn EntityDataProvider>> {
        None
    }
}

/// Per-task access to the external source.
#[async_trait]
pub trait TaskOperations: Send + Sync {
    /// Reads the source's current view of one item as a partial entity payload.
    async fn fetch_task(&self, source_key: &str) -> ExtensionResult<Option<Value>>;

    /// Pushes a field patch to the source.
    async fn update_task(&self, source_key: &str, patch: &Value) -> ExtensionResult<()>;

    /// False for sources without a write-back API; writes are then skipped.
    fn supports_write_back(&self) -> bool {
        true
    }
}

/// Schedule queries against a calendar-like source.
#[async_trait]
pub trait CalendarOperations: Send + Sync {
    /// Schedule entities overlapping `[start, end)`.
    async fn events_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> ExtensionResult<Vec<Entity>>;
}
