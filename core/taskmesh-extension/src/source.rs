//! Source adapter contract used by the refresh orchestrator.

use crate::error::ExtensionResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use taskmesh_types::Entity;

/// A unit of a source that is fetched independently (a list, folder,
/// repository or calendar).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubResource {
    pub id: String,
    pub name: String,
}

impl SubResource {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

/// One page of raw items.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ItemPage {
    pub items: Vec<Value>,
    /// Cursor for the next page; `None` on the last page.
    pub next_cursor: Option<String>,
}

impl ItemPage {
    /// A final page.
    pub fn last(items: Vec<Value>) -> Self {
        Self {
            items,
            next_cursor: None,
        }
    }

    /// A page followed by more.
    pub fn more(items: Vec<Value>, cursor: impl Into<String>) -> Self {
        Self {
            items,
            next_cursor: Some(cursor.into()),
        }
    }
}

/// The three operations a source must offer to be refreshed.
///
/// Implementations wrap the integration's wire protocol; the orchestrator
/// never sees anything but raw JSON items and canonical entities.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    /// Id of the extension this adapter belongs to.
    fn extension_id(&self) -> &str;

    async fn fetch_sub_resources(&self) -> ExtensionResult<Vec<SubResource>>;

    /// Fetches one page of `sub_resource`, starting at `cursor`.
    async fn fetch_items_for(
        &self,
        sub_resource: &SubResource,
        cursor: Option<&str>,
    ) -> ExtensionResult<ItemPage>;

    /// Turns a raw item into a canonical entity carrying a `SourceRef`.
    fn transform(&self, raw: &Value) -> ExtensionResult<Entity>;
}
