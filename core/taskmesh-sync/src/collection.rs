//! The live entity collection.
//!
//! State is held behind an `Arc` and replaced copy-on-write: a reader takes a
//! [`CollectionSnapshot`] and keeps a consistent view no matter what writers
//! do afterwards. Every mutation happens under one write lock, which is what
//! makes the `(extension_id, source_key)` uniqueness check and the per-source
//! swap atomic.

use crate::error::{SyncError, SyncResult};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use taskmesh_types::{Entity, EntityId, SourceIdentity};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Owner partition of natively created entities.
pub const LOCAL_OWNER: &str = "local";

/// Change notification delivered to [`CollectionSubscription`]s.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollectionChange {
    Inserted(EntityId),
    Updated(EntityId),
    /// All entities of `owner` were swapped in one step.
    Replaced { owner: String, count: usize },
}

/// Result of [`EntityCollection::upsert_sourced`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted(EntityId),
    /// An entity with the same source identity already exists; nothing changed.
    AlreadyPresent(EntityId),
}

impl UpsertOutcome {
    pub fn entity_id(&self) -> EntityId {
        match self {
            Self::Inserted(id) | Self::AlreadyPresent(id) => *id,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct State {
    entities: BTreeMap<EntityId, Entity>,
    by_identity: HashMap<SourceIdentity, EntityId>,
}

impl State {
    fn insert(&mut self, entity: Entity) {
        if let Some(identity) = entity.identity() {
            self.by_identity.insert(identity, entity.id);
        }
        self.entities.insert(entity.id, entity);
    }
}

/// Immutable view of the collection at one point in time.
#[derive(Debug, Clone)]
pub struct CollectionSnapshot {
    state: Arc<State>,
}

impl CollectionSnapshot {
    pub fn get(&self, id: EntityId) -> Option<&Entity> {
        self.state.entities.get(&id)
    }

    pub fn find_by_identity(&self, identity: &SourceIdentity) -> Option<&Entity> {
        self.state
            .by_identity
            .get(identity)
            .and_then(|id| self.state.entities.get(id))
    }

    /// Entities owned by `owner` (an extension id, or [`LOCAL_OWNER`]).
    pub fn entities_for<'a>(&'a self, owner: &'a str) -> impl Iterator<Item = &'a Entity> + 'a {
        self.state
            .entities
            .values()
            .filter(move |e| owner_of(e) == owner)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Entity> {
        self.state.entities.values()
    }

    pub fn len(&self) -> usize {
        self.state.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.entities.is_empty()
    }
}

type Subscribers = Mutex<HashMap<u64, mpsc::UnboundedSender<CollectionChange>>>;

/// Receives change notifications until dropped or unsubscribed.
pub struct CollectionSubscription {
    id: u64,
    receiver: mpsc::UnboundedReceiver<CollectionChange>,
    subscribers: Weak<Subscribers>,
}

impl CollectionSubscription {
    /// Waits for the next change. `None` once unsubscribed.
    pub async fn recv(&mut self) -> Option<CollectionChange> {
        self.receiver.recv().await
    }

    /// Returns a pending change without waiting.
    pub fn try_recv(&mut self) -> Option<CollectionChange> {
        self.receiver.try_recv().ok()
    }

    /// Stops delivery. Equivalent to dropping the subscription.
    pub fn unsubscribe(self) {}
}

impl Drop for CollectionSubscription {
    fn drop(&mut self) {
        if let Some(subscribers) = self.subscribers.upgrade() {
            subscribers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&self.id);
        }
    }
}

/// Every entity the engine knows about, partitioned by owner.
pub struct EntityCollection {
    state: RwLock<Arc<State>>,
    subscribers: Arc<Subscribers>,
    next_subscriber: AtomicU64,
}

impl EntityCollection {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(Arc::new(State::default())),
            subscribers: Arc::new(Mutex::new(HashMap::new())),
            next_subscriber: AtomicU64::new(1),
        }
    }

    pub fn snapshot(&self) -> CollectionSnapshot {
        CollectionSnapshot {
            state: Arc::clone(&self.state.read().unwrap_or_else(PoisonError::into_inner)),
        }
    }

    pub fn get(&self, id: EntityId) -> Option<Entity> {
        self.snapshot().get(id).cloned()
    }

    pub fn find_by_identity(&self, identity: &SourceIdentity) -> Option<Entity> {
        self.snapshot().find_by_identity(identity).cloned()
    }

    pub fn entities_for(&self, owner: &str) -> Vec<Entity> {
        self.snapshot().entities_for(owner).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    /// Adds an entity created locally. It must not carry a source reference.
    pub fn insert_native(&self, entity: Entity) -> SyncResult<EntityId> {
        if entity.source.is_some() {
            return Err(SyncError::InvalidEntity(format!(
                "native entity {} carries a source reference",
                entity.id
            )));
        }
        let id = entity.id;
        self.mutate(|state| {
            if state.entities.contains_key(&id) {
                return Err(SyncError::InvalidEntity(format!("duplicate entity id {id}")));
            }
            state.insert(entity);
            Ok(())
        })?;
        self.notify(CollectionChange::Inserted(id));
        Ok(id)
    }

    /// Inserts a mirrored entity unless its source identity is already present.
    ///
    /// The check and the insert happen under one lock, so concurrent imports
    /// of the same item produce exactly one entity.
    pub fn upsert_sourced(&self, entity: Entity) -> SyncResult<UpsertOutcome> {
        let identity = entity.identity().ok_or_else(|| {
            SyncError::InvalidEntity(format!("entity {} has no source reference", entity.id))
        })?;

        let outcome = self.mutate(|state| {
            if let Some(existing) = state.by_identity.get(&identity) {
                return Ok(UpsertOutcome::AlreadyPresent(*existing));
            }
            if state.entities.contains_key(&entity.id) {
                return Err(SyncError::InvalidEntity(format!(
                    "duplicate entity id {}",
                    entity.id
                )));
            }
            let id = entity.id;
            state.insert(entity);
            Ok(UpsertOutcome::Inserted(id))
        })?;

        match outcome {
            UpsertOutcome::Inserted(id) => self.notify(CollectionChange::Inserted(id)),
            UpsertOutcome::AlreadyPresent(id) => {
                debug!(entity_id = %id, identity = %identity, "already present");
            }
        }
        Ok(outcome)
    }

    /// Replaces an existing entity with the same id. The source identity
    /// cannot change through an update.
    pub fn update(&self, entity: Entity) -> SyncResult<()> {
        let id = entity.id;
        self.mutate(|state| {
            let current = state
                .entities
                .get(&id)
                .ok_or(SyncError::EntityNotFound(id))?;
            if current.identity() != entity.identity() {
                return Err(SyncError::InvalidEntity(format!(
                    "update would change the source identity of {id}"
                )));
            }
            state.entities.insert(id, entity);
            Ok(())
        })?;
        self.notify(CollectionChange::Updated(id));
        Ok(())
    }

    /// Applies `f` to the current version of an entity and returns the result.
    ///
    /// `f` runs under the collection lock against the latest state, so
    /// changes made since the caller last read the entity are kept. Nothing
    /// changes if `f` fails. The source identity cannot change.
    pub fn modify(
        &self,
        id: EntityId,
        f: impl FnOnce(&mut Entity) -> SyncResult<()>,
    ) -> SyncResult<Entity> {
        let entity = self.mutate(|state| {
            let current = state
                .entities
                .get_mut(&id)
                .ok_or(SyncError::EntityNotFound(id))?;
            let identity = current.identity();
            f(current)?;
            if current.identity() != identity || current.id != id {
                return Err(SyncError::InvalidEntity(format!(
                    "modification would change the identity of {id}"
                )));
            }
            Ok(current.clone())
        })?;
        self.notify(CollectionChange::Updated(id));
        Ok(entity)
    }

    /// Atomically swaps every entity owned by `owner` for `entities`.
    ///
    /// An incoming entity whose identity already existed keeps the existing
    /// id and `created_at`. Entities owned by someone else are skipped, as are
    /// repeated identities within the batch (first wins). Returns how many
    /// entities `owner` holds afterwards.
    pub fn replace_source(&self, owner: &str, entities: Vec<Entity>) -> usize {
        self.replace_source_with(owner, entities, |_, incoming| incoming)
    }

    /// Like [`EntityCollection::replace_source`], but an incoming entity that
    /// matches one already held is passed through `merge(local, incoming)`.
    /// A merge result with a different source identity is dropped.
    pub fn replace_source_with<M>(&self, owner: &str, entities: Vec<Entity>, merge: M) -> usize
    where
        M: Fn(&Entity, Entity) -> Entity,
    {
        let count = self
            .mutate(|state| {
                let previous: HashMap<SourceIdentity, Entity> = state
                    .entities
                    .values()
                    .filter(|e| owner_of(e) == owner)
                    .filter_map(|e| e.identity().map(|identity| (identity, e.clone())))
                    .collect();

                let kept: Vec<EntityId> = state
                    .entities
                    .values()
                    .filter(|e| owner_of(e) == owner)
                    .map(|e| e.id)
                    .collect();
                for id in kept {
                    let identity = state.entities.remove(&id).and_then(|e| e.identity());
                    if let Some(identity) = identity {
                        state.by_identity.remove(&identity);
                    }
                }

                let mut count = 0;
                for mut entity in entities {
                    if owner_of(&entity) != owner {
                        warn!(
                            owner,
                            entity_id = %entity.id,
                            "skipping entity owned by another source"
                        );
                        continue;
                    }
                    if let Some(identity) = entity.identity() {
                        if state.by_identity.contains_key(&identity) {
                            warn!(
                                owner,
                                identity = %identity,
                                "duplicate identity in refresh batch"
                            );
                            continue;
                        }
                        if let Some(local) = previous.get(&identity) {
                            entity.id = local.id;
                            entity.created_at = local.created_at;
                            entity = merge(local, entity);
                            if entity.identity().as_ref() != Some(&identity) {
                                warn!(owner, identity = %identity, "merge changed the identity");
                                continue;
                            }
                            entity.id = local.id;
                            entity.created_at = local.created_at;
                        }
                    }
                    if state.entities.contains_key(&entity.id) {
                        warn!(
                            owner,
                            entity_id = %entity.id,
                            "duplicate entity id in refresh batch"
                        );
                        continue;
                    }
                    state.insert(entity);
                    count += 1;
                }
                Ok(count)
            })
            .unwrap_or_default();

        self.notify(CollectionChange::Replaced {
            owner: owner.to_string(),
            count,
        });
        count
    }

    /// Starts receiving change notifications.
    pub fn subscribe(&self) -> CollectionSubscription {
        let (sender, receiver) = mpsc::unbounded_channel();
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, sender);
        CollectionSubscription {
            id,
            receiver,
            subscribers: Arc::downgrade(&self.subscribers),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Applies `f` to a private copy of the state and publishes it only if
    /// `f` succeeds.
    fn mutate<R>(&self, f: impl FnOnce(&mut State) -> SyncResult<R>) -> SyncResult<R> {
        let mut guard = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = State::clone(&guard);
        let result = f(&mut next)?;
        *guard = Arc::new(next);
        Ok(result)
    }

    fn notify(&self, change: CollectionChange) {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|_, sender| sender.send(change.clone()).is_ok());
    }
}

impl Default for EntityCollection {
    fn default() -> Self {
        Self::new()
    }
}

/// Partition an entity belongs to.
pub fn owner_of(entity: &Entity) -> &str {
    entity.extension_id().unwrap_or(LOCAL_OWNER)
}
