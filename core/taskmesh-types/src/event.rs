//! Domain events broadcast on the event bus.
//!
//! Events are immutable notifications. They are published once, fanned out to
//! the current subscribers and then dropped: there is no persistence and no
//! replay.

use crate::{Entity, EntityId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Well-known event types emitted by the engine.
///
/// The bus itself routes on plain strings, so extensions are free to publish
/// their own types alongside these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    EntityCreated,
    EntityUpdated,
    EntityImported,
    EntitiesRefreshed,
    ExtensionRegistered,
    ExtensionLoaded,
    ExtensionUnloaded,
    PlanningCommitted,
}

impl EventType {
    /// Subscribing to this type receives every event.
    pub const WILDCARD: &'static str = "*";

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EntityCreated => "entity.created",
            Self::EntityUpdated => "entity.updated",
            Self::EntityImported => "entity.imported",
            Self::EntitiesRefreshed => "entities.refreshed",
            Self::ExtensionRegistered => "extension.registered",
            Self::ExtensionLoaded => "extension.loaded",
            Self::ExtensionUnloaded => "extension.unloaded",
            Self::PlanningCommitted => "planning.committed",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<EventType> for String {
    fn from(value: EventType) -> Self {
        value.as_str().to_string()
    }
}

/// An immutable, typed notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub payload: Map<String, Value>,
    pub occurred_at: DateTime<Utc>,
}

impl DomainEvent {
    /// Creates an event with an empty payload.
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            payload: Map::new(),
            occurred_at: Utc::now(),
        }
    }

    /// Adds a payload field.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    /// Returns true if this event is of the given well-known type.
    pub fn is(&self, event_type: EventType) -> bool {
        self.event_type == event_type.as_str()
    }

    /// Reads a string payload field.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }

    /// A native entity was created.
    pub fn entity_created(entity: &Entity) -> Self {
        Self::entity_event(EventType::EntityCreated, entity)
    }

    /// An entity changed through the write path.
    pub fn entity_updated(entity: &Entity) -> Self {
        Self::entity_event(EventType::EntityUpdated, entity)
    }

    /// An external item was imported into the collection.
    pub fn entity_imported(entity: &Entity) -> Self {
        Self::entity_event(EventType::EntityImported, entity)
    }

    /// A source finished a refresh and its entities were swapped in.
    pub fn entities_refreshed(extension_id: &str, entity_count: usize, failed: usize) -> Self {
        Self::new(EventType::EntitiesRefreshed)
            .with("extensionId", extension_id)
            .with("entityCount", entity_count)
            .with("failedSubResources", failed)
    }

    /// An extension changed lifecycle state.
    pub fn extension(event_type: EventType, extension_id: &str) -> Self {
        Self::new(event_type).with("extensionId", extension_id)
    }

    /// A staged daily plan was committed.
    pub fn planning_committed(succeeded: &[EntityId], failed: &[EntityId]) -> Self {
        let ids = |ids: &[EntityId]| {
            Value::Array(ids.iter().map(|id| Value::String(id.to_string())).collect())
        };
        Self::new(EventType::PlanningCommitted)
            .with("succeeded", ids(succeeded))
            .with("failed", ids(failed))
    }

    fn entity_event(event_type: EventType, entity: &Entity) -> Self {
        let mut event = Self::new(event_type)
            .with("entityId", entity.id.to_string())
            .with("kind", entity.kind.as_str());
        if let Some(source) = &entity.source {
            event = event
                .with("extensionId", source.extension_id.as_str())
                .with("sourceKey", source.source_key.as_str());
        }
        event
    }
}
