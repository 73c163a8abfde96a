//! Cross-source identity.
//!
//! An entity mirrored from an external system carries a [`SourceRef`]. The
//! pair `(extension_id, source_key)` is its identity across refreshes and
//! imports, and is unique within the live collection.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Where a mirrored entity came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceRef {
    /// Id of the extension that owns the source.
    pub extension_id: String,
    /// Key of the item inside the source (issue number, reminder id, UID).
    pub source_key: String,
    /// Link back to the item, if the source has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
    /// The untransformed item as the source returned it.
    #[serde(default)]
    pub raw_payload: serde_json::Value,
}

impl SourceRef {
    /// Creates a source reference without URL or payload.
    pub fn new(extension_id: impl Into<String>, source_key: impl Into<String>) -> Self {
        Self {
            extension_id: extension_id.into(),
            source_key: source_key.into(),
            source_url: None,
            raw_payload: serde_json::Value::Null,
        }
    }

    /// Sets the source URL.
    #[must_use]
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.source_url = Some(url.into());
        self
    }

    /// Sets the raw payload.
    #[must_use]
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.raw_payload = payload;
        self
    }

    /// Returns the de-duplication key for this reference.
    pub fn identity(&self) -> SourceIdentity {
        SourceIdentity::new(&self.extension_id, &self.source_key)
    }
}

/// The `(extension_id, source_key)` pair used for de-duplication.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourceIdentity {
    pub extension_id: String,
    pub source_key: String,
}

impl SourceIdentity {
    pub fn new(extension_id: impl Into<String>, source_key: impl Into<String>) -> Self {
        Self {
            extension_id: extension_id.into(),
            source_key: source_key.into(),
        }
    }
}

impl fmt::Display for SourceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.extension_id, self.source_key)
    }
}
