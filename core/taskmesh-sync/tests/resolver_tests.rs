mod common;

use async_trait::async_trait;
use common::{MockExtension, MockSource};
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use taskmesh_extension::{
    EntityDataProvider, EventBus, Extension, ExtensionError, ExtensionResult, TaskOperations,
};
use taskmesh_sync::{
    EntityCollection, ReadOnlyProvider, SyncConfig, SyncError, SyncResolver,
    TaskOperationsProvider,
};
use taskmesh_types::{Entity, EntityHandler, EntityId, EntityKind, EventType, SourceRef};

/// Provider that answers reads from a map and records writes.
struct StubProvider {
    extension_id: String,
    data: HashMap<EntityId, Value>,
    writes: Mutex<Vec<Value>>,
    fail_writes: bool,
    write_delay: Option<Duration>,
    field_delays: HashMap<String, Duration>,
}

impl StubProvider {
    fn new(extension_id: &str) -> Self {
        Self {
            extension_id: extension_id.to_string(),
            data: HashMap::new(),
            writes: Mutex::new(Vec::new()),
            fail_writes: false,
            write_delay: None,
            field_delays: HashMap::new(),
        }
    }
}

#[async_trait]
impl EntityDataProvider for StubProvider {
    fn extension_id(&self) -> &str {
        &self.extension_id
    }

    async fn read_entity_data(&self, entity_id: EntityId) -> ExtensionResult<Option<Value>> {
        Ok(self.data.get(&entity_id).cloned())
    }

    async fn write_entity_data(&self, _entity: &Entity, patch: &Value) -> ExtensionResult<()> {
        if let Some(delay) = self.write_delay {
            tokio::time::sleep(delay).await;
        }
        let field_delay = patch
            .as_object()
            .into_iter()
            .flat_map(|fields| fields.keys())
            .filter_map(|field| self.field_delays.get(field))
            .max();
        if let Some(delay) = field_delay {
            tokio::time::sleep(*delay).await;
        }
        if self.fail_writes {
            return Err(ExtensionError::Source("rejected".into()));
        }
        self.writes.lock().unwrap().push(patch.clone());
        Ok(())
    }
}

fn resolver() -> (SyncResolver, Arc<EntityCollection>, Arc<EventBus>) {
    let collection = Arc::new(EntityCollection::new());
    let bus = Arc::new(EventBus::new());
    let resolver = SyncResolver::new(collection.clone(), bus.clone(), &SyncConfig::default());
    (resolver, collection, bus)
}

fn github_task(key: &str) -> Entity {
    Entity::task(json!({ "title": "from github" })).with_source(SourceRef::new("github", key))
}

// ── Reads ────────────────────────────────────────────────────────

#[tokio::test]
async fn live_collection_wins_over_provider() {
    let (resolver, collection, _) = resolver();
    let entity = github_task("1");
    let id = entity.id;
    collection.upsert_sourced(entity).unwrap();

    let mut stale = StubProvider::new("github");
    stale.data.insert(id, json!({ "title": "stale" }));
    resolver.register_provider(Arc::new(stale));

    let data = resolver.read_entity_data(id).await.unwrap().unwrap();
    assert_eq!(data["title"], "from github");
}

#[tokio::test]
async fn provider_is_fallback_when_entity_is_not_live() {
    let (resolver, _, _) = resolver();
    let id = EntityId::new();
    let mut provider = StubProvider::new("github");
    provider.data.insert(id, json!({ "title": "fetched" }));
    resolver.register_provider(Arc::new(provider));

    assert_eq!(
        resolver.read_entity_data(id).await.unwrap(),
        Some(json!({ "title": "fetched" }))
    );
    assert_eq!(resolver.read_entity_data(EntityId::new()).await.unwrap(), None);
}

// ── Provider registry ────────────────────────────────────────────

#[tokio::test]
async fn re_registration_replaces_provider() {
    let (resolver, _, _) = resolver();
    let id = EntityId::new();
    let mut first = StubProvider::new("github");
    first.data.insert(id, json!({ "v": 1 }));
    let mut second = StubProvider::new("github");
    second.data.insert(id, json!({ "v": 2 }));

    assert!(resolver.register_provider(Arc::new(first)).is_none());
    assert!(resolver.register_provider(Arc::new(second)).is_some());

    assert_eq!(resolver.read_entity_data(id).await.unwrap(), Some(json!({ "v": 2 })));
}

#[test]
fn can_handle_looks_up_by_source_extension() {
    let (resolver, _, _) = resolver();
    resolver.register_provider(Arc::new(StubProvider::new("github")));

    assert!(resolver.can_handle(&github_task("1")));
    assert!(!resolver.can_handle(
        &Entity::task(json!({})).with_source(SourceRef::new("caldav", "1"))
    ));
    assert!(!resolver.can_handle(&Entity::task(json!({}))));
}

// ── Writes ───────────────────────────────────────────────────────

#[tokio::test]
async fn write_goes_to_provider_then_collection() {
    let (resolver, collection, bus) = resolver();
    let provider = Arc::new(StubProvider::new("github"));
    resolver.register_provider(provider.clone());
    let id = collection
        .upsert_sourced(github_task("1"))
        .unwrap()
        .entity_id();
    let updates = Arc::new(Mutex::new(0));
    let counter = updates.clone();
    bus.on(EventType::EntityUpdated, move |_| {
        *counter.lock().unwrap() += 1;
        Ok(())
    });

    let patch = json!({ "done": true });
    let updated = resolver.write_entity_data(id, &patch).await.unwrap();

    assert_eq!(updated.get_bool("/done"), Some(true));
    assert_eq!(*provider.writes.lock().unwrap(), vec![patch]);
    assert_eq!(collection.get(id).unwrap().get_bool("/done"), Some(true));
    assert_eq!(*updates.lock().unwrap(), 1);
}

#[tokio::test]
async fn rejected_write_leaves_collection_unchanged() {
    let (resolver, collection, _) = resolver();
    let mut provider = StubProvider::new("github");
    provider.fail_writes = true;
    resolver.register_provider(Arc::new(provider));
    let id = collection
        .upsert_sourced(github_task("1"))
        .unwrap()
        .entity_id();

    let err = resolver
        .write_entity_data(id, &json!({ "done": true }))
        .await
        .unwrap_err();

    assert!(matches!(err, SyncError::Extension(ExtensionError::Source(_))));
    assert_eq!(collection.get(id).unwrap().get_bool("/done"), None);
}

#[tokio::test(start_paused = true)]
async fn slow_write_times_out() {
    let (resolver, collection, _) = resolver();
    let mut provider = StubProvider::new("github");
    provider.write_delay = Some(Duration::from_secs(30));
    resolver.register_provider(Arc::new(provider));
    let id = collection
        .upsert_sourced(github_task("1"))
        .unwrap()
        .entity_id();

    let err = resolver
        .write_entity_data(id, &json!({ "done": true }))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        SyncError::Timeout {
            timeout_ms: 10_000,
            ..
        }
    ));
    assert_eq!(collection.get(id).unwrap().get_bool("/done"), None);
}

#[tokio::test(start_paused = true)]
async fn overlapping_writes_to_different_fields_both_survive() {
    let (resolver, collection, _) = resolver();
    let mut provider = StubProvider::new("github");
    provider.field_delays.insert("a".into(), Duration::from_millis(50));
    provider.field_delays.insert("b".into(), Duration::from_millis(10));
    resolver.register_provider(Arc::new(provider));
    let id = collection
        .upsert_sourced(github_task("1"))
        .unwrap()
        .entity_id();

    let patch_a = json!({ "a": 1 });
    let patch_b = json!({ "b": 2 });
    let (slow, fast) = tokio::join!(
        resolver.write_entity_data(id, &patch_a),
        resolver.write_entity_data(id, &patch_b),
    );

    assert_eq!(fast.unwrap().data, json!({ "title": "from github", "b": 2 }));
    assert_eq!(slow.unwrap().data, json!({ "title": "from github", "a": 1, "b": 2 }));
    assert_eq!(
        collection.get(id).unwrap().data,
        json!({ "title": "from github", "a": 1, "b": 2 })
    );
}

#[tokio::test(start_paused = true)]
async fn write_keeps_a_refresh_that_landed_meanwhile() {
    let (resolver, collection, _) = resolver();
    let mut provider = StubProvider::new("github");
    provider.write_delay = Some(Duration::from_millis(50));
    resolver.register_provider(Arc::new(provider));
    let id = collection
        .upsert_sourced(github_task("1"))
        .unwrap()
        .entity_id();

    let patch = json!({ "done": true });
    let write = resolver.write_entity_data(id, &patch);
    let refresh = async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        let renamed = Entity::task(json!({ "title": "renamed upstream" }))
            .with_source(SourceRef::new("github", "1"));
        collection.replace_source("github", vec![renamed]);
    };
    let (written, ()) = tokio::join!(write, refresh);
    written.unwrap();

    let current = collection.get(id).unwrap();
    assert_eq!(current.get_str("/title"), Some("renamed upstream"));
    assert_eq!(current.get_bool("/done"), Some(true));
}

#[tokio::test]
async fn read_only_provider_write_is_a_local_no_op() {
    let (resolver, collection, _) = resolver();
    resolver.register_provider(Arc::new(ReadOnlyProvider::new("reminders")));
    let id = collection
        .upsert_sourced(
            Entity::task(json!({ "title": "milk" })).with_source(SourceRef::new("reminders", "r1")),
        )
        .unwrap()
        .entity_id();

    resolver
        .write_entity_data(id, &json!({ "done": true }))
        .await
        .unwrap();

    assert_eq!(collection.get(id).unwrap().get_bool("/done"), Some(true));
}

#[tokio::test]
async fn read_only_provider_answers_from_remembered_data() {
    let provider = ReadOnlyProvider::new("reminders");
    let entity = Entity::task(json!({ "title": "milk" }));
    provider.remember(&entity);

    assert!(provider.is_read_only());
    assert_eq!(
        provider.read_entity_data(entity.id).await.unwrap(),
        Some(json!({ "title": "milk" }))
    );
    provider
        .write_entity_data(&entity, &json!({ "done": true }))
        .await
        .unwrap();
}

#[tokio::test]
async fn native_entities_are_written_locally() {
    let (resolver, collection, _) = resolver();
    let id = collection
        .insert_native(Entity::task(json!({ "title": "local" })))
        .unwrap();
    resolver
        .write_entity_data(id, &json!({ "title": "renamed" }))
        .await
        .unwrap();
    assert_eq!(collection.get(id).unwrap().get_str("/title"), Some("renamed"));
}

#[tokio::test]
async fn write_to_unknown_entity_fails() {
    let (resolver, _, _) = resolver();
    let missing = EntityId::new();
    assert!(matches!(
        resolver.write_entity_data(missing, &json!({})).await,
        Err(SyncError::EntityNotFound(id)) if id == missing
    ));
}

#[tokio::test]
async fn non_object_patch_is_rejected() {
    let (resolver, collection, _) = resolver();
    let id = collection
        .insert_native(Entity::task(json!({})))
        .unwrap();
    assert!(matches!(
        resolver.write_entity_data(id, &json!("nope")).await,
        Err(SyncError::Types(_))
    ));
}

// ── Local creation ───────────────────────────────────────────────

struct RequireTitle;

impl EntityHandler for RequireTitle {
    fn validate(&self, entity: &Entity) -> Result<(), String> {
        match entity.get_str("/title") {
            Some(title) if !title.is_empty() => Ok(()),
            _ => Err("title is required".into()),
        }
    }
}

#[tokio::test]
async fn created_entity_is_inserted_and_announced() {
    let (resolver, collection, bus) = resolver();
    let created = Arc::new(Mutex::new(Vec::new()));
    let sink = created.clone();
    bus.on(EventType::EntityCreated, move |event| {
        sink.lock().unwrap().push(event.get_str("entityId").map(str::to_string));
        Ok(())
    });

    let id = resolver
        .create_entity(Entity::task(json!({ "title": "buy milk" })))
        .unwrap();

    assert_eq!(collection.get(id).unwrap().get_str("/title"), Some("buy milk"));
    assert_eq!(*created.lock().unwrap(), vec![Some(id.to_string())]);
}

#[tokio::test]
async fn invalid_created_entity_is_rejected() {
    let (resolver, collection, _) = resolver();
    resolver.set_handler(EntityKind::Task, Arc::new(RequireTitle));

    let err = resolver
        .create_entity(Entity::task(json!({ "title": "" })))
        .unwrap_err();

    assert!(matches!(err, SyncError::Validation { .. }));
    assert!(collection.is_empty());
}

#[test]
fn sourced_entity_cannot_be_created_locally() {
    let (resolver, _, _) = resolver();
    assert!(matches!(
        resolver.create_entity(github_task("1")),
        Err(SyncError::InvalidEntity(_))
    ));
}

// ── Task operations adapter ──────────────────────────────────────

struct Tracker {
    remote: Mutex<HashMap<String, Value>>,
    writable: bool,
}

#[async_trait]
impl TaskOperations for Tracker {
    async fn fetch_task(&self, source_key: &str) -> ExtensionResult<Option<Value>> {
        Ok(self.remote.lock().unwrap().get(source_key).cloned())
    }

    async fn update_task(&self, source_key: &str, patch: &Value) -> ExtensionResult<()> {
        self.remote
            .lock()
            .unwrap()
            .insert(source_key.to_string(), patch.clone());
        Ok(())
    }

    fn supports_write_back(&self) -> bool {
        self.writable
    }
}

struct TrackerExtension {
    tracker: Tracker,
}

#[async_trait]
impl Extension for TrackerExtension {
    fn id(&self) -> &str {
        "github"
    }

    fn supported_entity_types(&self) -> &[EntityKind] {
        &[EntityKind::Task]
    }

    fn task_operations(&self) -> Option<&dyn TaskOperations> {
        Some(&self.tracker)
    }
}

fn tracker(writable: bool) -> Arc<TrackerExtension> {
    Arc::new(TrackerExtension {
        tracker: Tracker {
            remote: Mutex::new(HashMap::new()),
            writable,
        },
    })
}

#[tokio::test]
async fn task_operations_provider_writes_and_reads_back() {
    let extension = tracker(true);
    let provider = TaskOperationsProvider::new(extension.clone());
    let entity = github_task("99");

    assert!(!provider.is_read_only());
    provider
        .write_entity_data(&entity, &json!({ "done": true }))
        .await
        .unwrap();

    assert_eq!(
        extension.tracker.remote.lock().unwrap().get("99"),
        Some(&json!({ "done": true }))
    );
    assert_eq!(
        provider.read_entity_data(entity.id).await.unwrap(),
        Some(json!({ "done": true }))
    );
    assert_eq!(provider.read_entity_data(EntityId::new()).await.unwrap(), None);
}

#[tokio::test]
async fn task_operations_without_write_back_is_read_only() {
    let extension = tracker(false);
    let provider = TaskOperationsProvider::new(extension.clone());
    assert!(provider.is_read_only());

    provider
        .write_entity_data(&github_task("1"), &json!({ "done": true }))
        .await
        .unwrap();
    assert!(extension.tracker.remote.lock().unwrap().is_empty());
}

#[tokio::test]
async fn extension_without_task_operations_is_unsupported() {
    let source = Arc::new(MockSource::new("github"));
    let provider = TaskOperationsProvider::new(Arc::new(MockExtension::new(source)));
    let entity = github_task("1");
    provider.track(&entity);

    assert!(provider.is_read_only());
    assert!(matches!(
        provider.read_entity_data(entity.id).await,
        Err(ExtensionError::Unsupported { .. })
    ));
}
