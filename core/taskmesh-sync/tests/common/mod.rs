#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use taskmesh_extension::{
    EntityDataProvider, Extension, ExtensionError, ExtensionResult, ItemPage, SourceAdapter,
    SubResource,
};
use taskmesh_types::{Entity, EntityKind, SourceRef};

/// Raw item as the mock source emits it.
pub fn item(key: &str, title: &str) -> Value {
    json!({ "key": key, "title": title })
}

/// Pages of raw items per sub-resource, with switchable failures and delays.
pub struct MockSource {
    pub id: String,
    lists: Mutex<BTreeMap<String, Vec<Vec<Value>>>>,
    failing: Mutex<HashSet<String>>,
    delays: Mutex<HashMap<String, Duration>>,
    listing_delay: Mutex<Option<Duration>>,
    pub listing_calls: AtomicUsize,
    pub page_calls: AtomicUsize,
}

impl MockSource {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            lists: Mutex::new(BTreeMap::new()),
            failing: Mutex::new(HashSet::new()),
            delays: Mutex::new(HashMap::new()),
            listing_delay: Mutex::new(None),
            listing_calls: AtomicUsize::new(0),
            page_calls: AtomicUsize::new(0),
        }
    }

    /// Adds a sub-resource served as a single page.
    pub fn with_list(self, name: &str, items: Vec<Value>) -> Self {
        self.set_pages(name, vec![items]);
        self
    }

    pub fn set_pages(&self, name: &str, pages: Vec<Vec<Value>>) {
        self.lists.lock().unwrap().insert(name.to_string(), pages);
    }

    pub fn fail(&self, name: &str, failing: bool) {
        let mut set = self.failing.lock().unwrap();
        if failing {
            set.insert(name.to_string());
        } else {
            set.remove(name);
        }
    }

    pub fn delay(&self, name: &str, by: Duration) {
        self.delays.lock().unwrap().insert(name.to_string(), by);
    }

    pub fn delay_listing(&self, by: Duration) {
        *self.listing_delay.lock().unwrap() = Some(by);
    }

    pub fn listings(&self) -> usize {
        self.listing_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SourceAdapter for MockSource {
    fn extension_id(&self) -> &str {
        &self.id
    }

    async fn fetch_sub_resources(&self) -> ExtensionResult<Vec<SubResource>> {
        self.listing_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.listing_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self
            .lists
            .lock()
            .unwrap()
            .keys()
            .map(|name| SubResource::new(name.clone(), name.clone()))
            .collect())
    }

    async fn fetch_items_for(
        &self,
        sub_resource: &SubResource,
        cursor: Option<&str>,
    ) -> ExtensionResult<ItemPage> {
        self.page_calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.delays.lock().unwrap().get(&sub_resource.id).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.lock().unwrap().contains(&sub_resource.id) {
            return Err(ExtensionError::Source(format!("{} unavailable", sub_resource.id)));
        }

        let index: usize = cursor.map_or(0, |c| c.parse().unwrap());
        let lists = self.lists.lock().unwrap();
        let pages = lists.get(&sub_resource.id).cloned().unwrap_or_default();
        let items = pages.get(index).cloned().unwrap_or_default();
        if index + 1 < pages.len() {
            Ok(ItemPage::more(items, (index + 1).to_string()))
        } else {
            Ok(ItemPage::last(items))
        }
    }

    fn transform(&self, raw: &Value) -> ExtensionResult<Entity> {
        let key = raw
            .get("key")
            .and_then(Value::as_str)
            .ok_or_else(|| ExtensionError::Transform("item without key".into()))?;
        let title = raw.get("title").cloned().unwrap_or(Value::Null);
        Ok(Entity::task(json!({ "title": title }))
            .with_source(SourceRef::new(&self.id, key).with_payload(raw.clone())))
    }
}

/// Extension exposing a [`MockSource`] and, optionally, a data provider.
pub struct MockExtension {
    pub source: Arc<MockSource>,
    pub provider: Option<Arc<dyn EntityDataProvider>>,
}

impl MockExtension {
    pub fn new(source: Arc<MockSource>) -> Self {
        Self {
            source,
            provider: None,
        }
    }
}

#[async_trait]
impl Extension for MockExtension {
    fn id(&self) -> &str {
        &self.source.id
    }

    fn supported_entity_types(&self) -> &[EntityKind] {
        &[EntityKind::Task]
    }

    fn source_adapter(&self) -> Option<Arc<dyn SourceAdapter>> {
        Some(self.source.clone() as Arc<dyn SourceAdapter>)
    }

    fn data_provider(&self) -> Option<Arc<dyn EntityDataProvider>> {
        self.provider.clone()
    }
}

/// Titles of `entities`, sorted.
pub fn titles<'a>(entities: impl IntoIterator<Item = &'a Entity>) -> Vec<String> {
    let mut titles: Vec<String> = entities
        .into_iter()
        .filter_map(|e| e.get_str("/title").map(str::to_string))
        .collect();
    titles.sort();
    titles
}
