//! JSON fixture source for the `taskmesh` binary.
//!
//! A fixture file stands in for an external system:
//!
//! ```json
//! {
//!   "extension_id": "github",
//!   "lists": {
//!     "inbox": [{ "id": "1", "title": "Fix login" }]
//!   }
//! }
//! ```
//!
//! Each list is a sub-resource and each item needs an `id`. The file is
//! re-read on every fetch and patched in place on writes, so edits made
//! through the engine show up in the fixture.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use taskmesh_extension::{
    EntityDataProvider, Extension, ExtensionError, ExtensionResult, ItemPage, SourceAdapter,
    SubResource,
};
use taskmesh_sync::{CommitReport, RefreshReport};
use taskmesh_types::{Entity, EntityId, EntityKind, SourceRef};
use tokio::sync::Mutex;
use tracing::debug;

const DEFAULT_PAGE_SIZE: usize = 100;

/// On-disk fixture layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fixture {
    pub extension_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_size: Option<usize>,
    #[serde(default)]
    pub lists: BTreeMap<String, Vec<Value>>,
}

impl Fixture {
    pub async fn read(path: &Path) -> ExtensionResult<Self> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| ExtensionError::Source(format!("cannot read {}: {e}", path.display())))?;
        Ok(serde_json::from_str(&contents)?)
    }
}

/// Reads items from, and writes patches back to, a fixture file.
pub struct FixtureSource {
    path: PathBuf,
    extension_id: String,
    page_size: usize,
    write_lock: Mutex<()>,
}

impl FixtureSource {
    pub async fn open(path: impl Into<PathBuf>) -> ExtensionResult<Self> {
        let path = path.into();
        let fixture = Fixture::read(&path).await?;
        Ok(Self {
            extension_id: fixture.extension_id,
            page_size: fixture.page_size.unwrap_or(DEFAULT_PAGE_SIZE).max(1),
            path,
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Sibling file that write-back goes through before being renamed over
    /// the fixture.
    pub fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

fn item_key(raw: &Value) -> Option<String> {
    match raw.get("id")? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[async_trait]
impl SourceAdapter for FixtureSource {
    fn extension_id(&self) -> &str {
        &self.extension_id
    }

    async fn fetch_sub_resources(&self) -> ExtensionResult<Vec<SubResource>> {
        let fixture = Fixture::read(&self.path).await?;
        Ok(fixture
            .lists
            .keys()
            .map(|name| SubResource::new(name.clone(), name.clone()))
            .collect())
    }

    async fn fetch_items_for(
        &self,
        sub_resource: &SubResource,
        cursor: Option<&str>,
    ) -> ExtensionResult<ItemPage> {
        let fixture = Fixture::read(&self.path).await?;
        let items = fixture.lists.get(&sub_resource.id).ok_or_else(|| {
            ExtensionError::Source(format!("list '{}' no longer exists", sub_resource.id))
        })?;
        let offset = match cursor {
            Some(c) => c
                .parse::<usize>()
                .map_err(|_| ExtensionError::Source(format!("bad cursor '{c}'")))?,
            None => 0,
        };
        let end = (offset + self.page_size).min(items.len());
        let page = items.get(offset..end).unwrap_or_default().to_vec();
        debug!(list = %sub_resource.id, offset, count = page.len(), "read fixture page");
        if end < items.len() {
            Ok(ItemPage::more(page, end.to_string()))
        } else {
            Ok(ItemPage::last(page))
        }
    }

    fn transform(&self, raw: &Value) -> ExtensionResult<Entity> {
        let key = item_key(raw)
            .ok_or_else(|| ExtensionError::Transform(format!("item without id: {raw}")))?;
        let mut data: Map<String, Value> = raw
            .as_object()
            .cloned()
            .ok_or_else(|| ExtensionError::Transform(format!("item {key} is not an object")))?;
        data.remove("id");
        let url = data.get("url").and_then(Value::as_str).map(str::to_string);

        let mut source = SourceRef::new(&self.extension_id, key).with_payload(raw.clone());
        if let Some(url) = url {
            source = source.with_url(url);
        }
        Ok(Entity::task(Value::Object(data)).with_source(source))
    }
}

#[async_trait]
impl EntityDataProvider for FixtureSource {
    fn extension_id(&self) -> &str {
        &self.extension_id
    }

    /// Fixture data is only served through refreshes.
    async fn read_entity_data(&self, _entity_id: EntityId) -> ExtensionResult<Option<Value>> {
        Ok(None)
    }

    async fn write_entity_data(&self, entity: &Entity, patch: &Value) -> ExtensionResult<()> {
        let source = entity
            .source
            .as_ref()
            .ok_or_else(|| {
                ExtensionError::Source(format!("entity {} is not from a fixture", entity.id))
            })?;
        let fields = patch
            .as_object()
            .ok_or_else(|| ExtensionError::Source("patch must be an object".into()))?;

        let _guard = self.write_lock.lock().await;
        let mut fixture = Fixture::read(&self.path).await?;
        let target = fixture
            .lists
            .values_mut()
            .flat_map(|items| items.iter_mut())
            .find(|item| item_key(item).as_deref() == Some(source.source_key.as_str()))
            .and_then(Value::as_object_mut)
            .ok_or_else(|| {
                ExtensionError::Source(format!("item {} not found in fixture", source.source_key))
            })?;
        for (key, value) in fields {
            if value.is_null() {
                target.remove(key);
            } else {
                target.insert(key.clone(), value.clone());
            }
        }

        let contents = serde_json::to_string_pretty(&fixture)?;
        let temp = self.temp_path();
        let written = match tokio::fs::write(&temp, contents).await {
            Ok(()) => tokio::fs::rename(&temp, &self.path).await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(ExtensionError::Source(format!(
                "cannot write {}: {e}",
                self.path.display()
            )));
        }
        debug!(key = %source.source_key, "patched fixture item");
        Ok(())
    }
}

/// Extension wrapping one fixture file.
pub struct FixtureExtension {
    source: Arc<FixtureSource>,
}

impl FixtureExtension {
    pub async fn open(path: impl Into<PathBuf>) -> ExtensionResult<Self> {
        Ok(Self {
            source: Arc::new(FixtureSource::open(path).await?),
        })
    }
}

#[async_trait]
impl Extension for FixtureExtension {
    fn id(&self) -> &str {
        &self.source.extension_id
    }

    fn supported_entity_types(&self) -> &[EntityKind] {
        &[EntityKind::Task]
    }

    fn source_adapter(&self) -> Option<Arc<dyn SourceAdapter>> {
        Some(Arc::clone(&self.source) as Arc<dyn SourceAdapter>)
    }

    fn data_provider(&self) -> Option<Arc<dyn EntityDataProvider>> {
        Some(Arc::clone(&self.source) as Arc<dyn EntityDataProvider>)
    }
}

/// Human-readable refresh summary.
pub fn summarize_refresh(report: &RefreshReport) -> String {
    let mut out = format!(
        "{}: {} entities from {} lists",
        report.extension_id, report.entity_count, report.sub_resources
    );
    if let Some(error) = &report.error {
        let _ = write!(out, "\n  error: {error}");
    }
    for failure in &report.failures {
        let reused = if failure.reused_cache { " (using cached items)" } else { "" };
        let _ = write!(out, "\n  failed: {}: {}{}", failure.sub_resource, failure.message, reused);
    }
    for warning in &report.warnings {
        let _ = write!(out, "\n  warning: {warning}");
    }
    out
}

/// Human-readable commit summary.
pub fn summarize_commit(report: &CommitReport) -> String {
    let mut out = format!(
        "committed {} of {} changes",
        report.succeeded.len(),
        report.attempted()
    );
    for failure in &report.failed {
        let _ = write!(out, "\n  failed: {}: {}", failure.entity_id, failure.reason);
    }
    out
}
