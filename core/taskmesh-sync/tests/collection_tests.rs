mod common;

use pretty_assertions::assert_eq;
use proptest::prelude::*;
use serde_json::json;
use taskmesh_sync::{
    CollectionChange, EntityCollection, LOCAL_OWNER, SyncError, UpsertOutcome, owner_of,
};
use taskmesh_types::{Entity, EntityId, SourceIdentity, SourceRef};

fn sourced(ext: &str, key: &str, title: &str) -> Entity {
    Entity::task(json!({ "title": title })).with_source(SourceRef::new(ext, key))
}

// ── Native entities ──────────────────────────────────────────────

#[test]
fn insert_native_and_get() {
    let collection = EntityCollection::new();
    let entity = Entity::task(json!({ "title": "write report" }));
    let id = collection.insert_native(entity).unwrap();

    let stored = collection.get(id).unwrap();
    assert_eq!(stored.get_str("/title"), Some("write report"));
    assert_eq!(owner_of(&stored), LOCAL_OWNER);
    assert_eq!(collection.entities_for(LOCAL_OWNER).len(), 1);
}

#[test]
fn insert_native_rejects_sourced_entity() {
    let collection = EntityCollection::new();
    let err = collection
        .insert_native(sourced("github", "1", "x"))
        .unwrap_err();
    assert!(matches!(err, SyncError::InvalidEntity(_)));
    assert!(collection.is_empty());
}

// ── Source identity uniqueness ───────────────────────────────────

#[test]
fn same_identity_is_inserted_once() {
    let collection = EntityCollection::new();
    let first = collection.upsert_sourced(sourced("github", "42", "a")).unwrap();
    let second = collection.upsert_sourced(sourced("github", "42", "b")).unwrap();

    assert!(matches!(first, UpsertOutcome::Inserted(_)));
    assert_eq!(second, UpsertOutcome::AlreadyPresent(first.entity_id()));
    assert_eq!(collection.len(), 1);
    assert_eq!(
        collection.get(first.entity_id()).unwrap().get_str("/title"),
        Some("a")
    );
}

#[test]
fn same_key_from_different_sources_is_distinct() {
    let collection = EntityCollection::new();
    collection.upsert_sourced(sourced("github", "1", "a")).unwrap();
    collection.upsert_sourced(sourced("reminders", "1", "b")).unwrap();
    assert_eq!(collection.len(), 2);
}

#[test]
fn upsert_requires_source() {
    let collection = EntityCollection::new();
    assert!(collection
        .upsert_sourced(Entity::task(json!({})))
        .is_err());
}

#[test]
fn update_cannot_change_identity() {
    let collection = EntityCollection::new();
    let id = collection
        .upsert_sourced(sourced("github", "1", "a"))
        .unwrap()
        .entity_id();

    let mut moved = collection.get(id).unwrap();
    moved.source = Some(SourceRef::new("github", "2"));
    assert!(matches!(
        collection.update(moved),
        Err(SyncError::InvalidEntity(_))
    ));

    let mut edited = collection.get(id).unwrap();
    edited.data = json!({ "title": "edited" });
    collection.update(edited).unwrap();
    assert_eq!(collection.get(id).unwrap().get_str("/title"), Some("edited"));
}

#[test]
fn update_unknown_entity_fails() {
    let collection = EntityCollection::new();
    let err = collection
        .update(Entity::task(json!({})))
        .unwrap_err();
    assert!(matches!(err, SyncError::EntityNotFound(_)));
}

#[test]
fn modify_patches_the_current_version() {
    let collection = EntityCollection::new();
    let id = collection.upsert_sourced(sourced("github", "1", "a")).unwrap().entity_id();
    let stale = collection.get(id).unwrap();
    collection.replace_source("github", vec![sourced("github", "1", "b")]);

    let modified = collection
        .modify(id, |entity| {
            entity.apply_patch(&json!({ "done": true }), stale.updated_at)?;
            Ok(())
        })
        .unwrap();

    assert_eq!(modified.get_str("/title"), Some("b"));
    assert_eq!(modified.get_bool("/done"), Some(true));
    assert_eq!(collection.get(id).unwrap(), modified);
}

#[test]
fn failed_or_identity_changing_modify_changes_nothing() {
    let collection = EntityCollection::new();
    let id = collection.upsert_sourced(sourced("github", "1", "a")).unwrap().entity_id();
    let before = collection.get(id).unwrap();

    let err = collection
        .modify(id, |entity| {
            entity.data = json!({ "title": "half done" });
            Err(SyncError::InvalidEntity("nope".into()))
        })
        .unwrap_err();
    assert!(matches!(err, SyncError::InvalidEntity(_)));

    let err = collection
        .modify(id, |entity| {
            entity.source = Some(SourceRef::new("github", "2"));
            Ok(())
        })
        .unwrap_err();
    assert!(matches!(err, SyncError::InvalidEntity(_)));

    assert_eq!(collection.get(id).unwrap(), before);
    assert!(matches!(
        collection.modify(EntityId::new(), |_| Ok(())),
        Err(SyncError::EntityNotFound(_))
    ));
}

#[test]
fn replace_source_with_merges_known_items() {
    let collection = EntityCollection::new();
    let id = collection.upsert_sourced(sourced("github", "1", "a")).unwrap().entity_id();

    collection.replace_source_with(
        "github",
        vec![sourced("github", "1", "b"), sourced("github", "2", "c")],
        |local, mut incoming| {
            incoming.data["previous"] = local.data["title"].clone();
            incoming
        },
    );

    let merged = collection.get(id).unwrap();
    assert_eq!(merged.get_str("/title"), Some("b"));
    assert_eq!(merged.get_str("/previous"), Some("a"));
    let fresh = collection
        .find_by_identity(&SourceIdentity::new("github", "2"))
        .unwrap();
    assert_eq!(fresh.data.get("previous"), None);
}

// ── Atomic source replacement ────────────────────────────────────

#[test]
fn replace_source_swaps_only_that_owner() {
    let collection = EntityCollection::new();
    let local = collection
        .insert_native(Entity::task(json!({ "title": "local" })))
        .unwrap();
    collection.upsert_sourced(sourced("github", "1", "old")).unwrap();
    collection.upsert_sourced(sourced("caldav", "x", "meeting")).unwrap();

    let count = collection.replace_source(
        "github",
        vec![sourced("github", "2", "new"), sourced("github", "3", "newer")],
    );

    assert_eq!(count, 2);
    assert_eq!(
        common::titles(&collection.entities_for("github")),
        vec!["new", "newer"]
    );
    assert!(collection.get(local).is_some());
    assert_eq!(collection.entities_for("caldav").len(), 1);
    assert!(collection
        .find_by_identity(&SourceIdentity::new("github", "1"))
        .is_none());
}

#[test]
fn replace_source_keeps_ids_of_known_items() {
    let collection = EntityCollection::new();
    let original = collection
        .upsert_sourced(sourced("github", "1", "before"))
        .unwrap()
        .entity_id();
    let created_at = collection.get(original).unwrap().created_at;

    collection.replace_source("github", vec![sourced("github", "1", "after")]);

    let current = collection
        .find_by_identity(&SourceIdentity::new("github", "1"))
        .unwrap();
    assert_eq!(current.id, original);
    assert_eq!(current.created_at, created_at);
    assert_eq!(current.get_str("/title"), Some("after"));
}

#[test]
fn replace_source_drops_duplicates_and_foreign_entities() {
    let collection = EntityCollection::new();
    let count = collection.replace_source(
        "github",
        vec![
            sourced("github", "1", "first"),
            sourced("github", "1", "second"),
            sourced("caldav", "9", "foreign"),
        ],
    );
    assert_eq!(count, 1);
    assert_eq!(
        common::titles(&collection.entities_for("github")),
        vec!["first"]
    );
    assert!(collection.entities_for("caldav").is_empty());
}

#[test]
fn snapshot_is_unaffected_by_later_writes() {
    let collection = EntityCollection::new();
    collection.upsert_sourced(sourced("github", "1", "a")).unwrap();
    let snapshot = collection.snapshot();

    collection.replace_source("github", vec![]);

    assert_eq!(snapshot.len(), 1);
    assert!(collection.is_empty());
}

// ── Subscriptions ────────────────────────────────────────────────

#[tokio::test]
async fn subscribers_receive_changes() {
    let collection = EntityCollection::new();
    let mut sub = collection.subscribe();

    let id = collection
        .insert_native(Entity::task(json!({ "title": "t" })))
        .unwrap();
    collection.replace_source("github", vec![sourced("github", "1", "a")]);

    assert_eq!(sub.recv().await, Some(CollectionChange::Inserted(id)));
    assert_eq!(
        sub.recv().await,
        Some(CollectionChange::Replaced {
            owner: "github".into(),
            count: 1
        })
    );
    assert_eq!(sub.try_recv(), None);
}

#[test]
fn dropping_subscription_unsubscribes() {
    let collection = EntityCollection::new();
    let a = collection.subscribe();
    let b = collection.subscribe();
    assert_eq!(collection.subscriber_count(), 2);

    a.unsubscribe();
    drop(b);

    assert_eq!(collection.subscriber_count(), 0);
    collection
        .insert_native(Entity::task(json!({})))
        .unwrap();
}

// ── Properties ───────────────────────────────────────────────────

proptest! {
    #[test]
    fn identities_stay_unique(
        ops in proptest::collection::vec((0u8..3, 0u8..6, any::<bool>()), 1..40)
    ) {
        let collection = EntityCollection::new();
        let sources = ["github", "reminders", "caldav"];

        for (source, key, bulk) in ops {
            let ext = sources[source as usize];
            let entity = sourced(ext, &key.to_string(), "t");
            if bulk {
                let mut batch = collection.entities_for(ext);
                batch.push(entity);
                collection.replace_source(ext, batch);
            } else {
                collection.upsert_sourced(entity).unwrap();
            }
        }

        let snapshot = collection.snapshot();
        let mut seen = std::collections::HashSet::new();
        for entity in snapshot.iter() {
            prop_assert!(seen.insert(entity.identity().unwrap()));
        }
    }
}
