use crate::{EntityId, Error, Result, SourceIdentity, SourceRef};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The kind of record an [`Entity`] holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Task,
    Project,
    Area,
    Schedule,
}

impl EntityKind {
    pub const ALL: [EntityKind; 4] = [Self::Task, Self::Project, Self::Area, Self::Schedule];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Task => "task",
            Self::Project => "project",
            Self::Area => "area",
            Self::Schedule => "schedule",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A canonical record held in the live collection.
///
/// Everything the synchronization layer needs (identity, origin, timestamps)
/// is typed. The kind-specific fields (title, done, due date, ...) live in
/// `data` and are opaque to the core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    pub id: EntityId,
    pub kind: EntityKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<SourceRef>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl Entity {
    /// Creates a native entity (no external source) stamped with the current time.
    pub fn new(kind: EntityKind, data: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            id: EntityId::new(),
            kind,
            source: None,
            created_at: now,
            updated_at: now,
            data,
        }
    }

    /// Creates a task with the given data.
    pub fn task(data: serde_json::Value) -> Self {
        Self::new(EntityKind::Task, data)
    }

    /// Attaches a source reference.
    #[must_use]
    pub fn with_source(mut self, source: SourceRef) -> Self {
        self.source = Some(source);
        self
    }

    /// Overrides both timestamps, used when the owning side supplies its own.
    #[must_use]
    pub fn with_timestamps(mut self, created_at: DateTime<Utc>, updated_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self.updated_at = updated_at;
        self
    }

    /// Returns the cross-source identity, if this entity is mirrored.
    pub fn identity(&self) -> Option<SourceIdentity> {
        self.source.as_ref().map(SourceRef::identity)
    }

    /// Id of the extension this entity belongs to, if any.
    pub fn extension_id(&self) -> Option<&str> {
        self.source.as_ref().map(|s| s.extension_id.as_str())
    }

    /// Extract a string value from `data` using a JSON pointer (e.g., "/title").
    pub fn get_str(&self, pointer: &str) -> Option<&str> {
        self.data.pointer(pointer).and_then(|v| v.as_str())
    }

    /// Extract a boolean value from `data` using a JSON pointer.
    pub fn get_bool(&self, pointer: &str) -> Option<bool> {
        self.data.pointer(pointer).and_then(|v| v.as_bool())
    }

    /// Extract a numeric value from `data` using a JSON pointer.
    pub fn get_number(&self, pointer: &str) -> Option<f64> {
        self.data.pointer(pointer).and_then(|v| v.as_f64())
    }

    /// Merges `patch` into `data` field by field and stamps `updated_at`.
    ///
    /// A `null` value in the patch removes the field. The patch must be an
    /// object; `data` that is not an object is replaced by an empty one first.
    pub fn apply_patch(&mut self, patch: &serde_json::Value, now: DateTime<Utc>) -> Result<()> {
        let fields = patch
            .as_object()
            .ok_or_else(|| Error::InvalidPatch(format!("expected object, got {patch}")))?;

        if !self.data.is_object() {
            self.data = serde_json::Value::Object(serde_json::Map::new());
        }
        if let Some(target) = self.data.as_object_mut() {
            for (key, value) in fields {
                if value.is_null() {
                    target.remove(key);
                } else {
                    target.insert(key.clone(), value.clone());
                }
            }
        }
        self.updated_at = now;
        Ok(())
    }
}
