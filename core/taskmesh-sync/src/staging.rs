//! Staged mutations for daily planning.
//!
//! A planning session collects "add to today" and "remove from today"
//! decisions without touching the entities, so the user can preview them.
//! `commit` applies everything that can be applied and reports the rest.

use crate::error::{SyncError, SyncResult};
use crate::resolver::SyncResolver;
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::{Arc, PoisonError, RwLock};
use taskmesh_extension::EventBus;
use taskmesh_types::{DomainEvent, EntityId};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationKind {
    Add,
    Remove,
}

/// The staged ids. An id is in at most one of the two lists.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StagedSet {
    to_add: Vec<EntityId>,
    to_remove: Vec<EntityId>,
}

impl StagedSet {
    /// Ids staged for adding, in staging order.
    pub fn to_add(&self) -> &[EntityId] {
        &self.to_add
    }

    pub fn to_remove(&self) -> &[EntityId] {
        &self.to_remove
    }

    pub fn kind_of(&self, id: EntityId) -> Option<MutationKind> {
        if self.to_add.contains(&id) {
            Some(MutationKind::Add)
        } else if self.to_remove.contains(&id) {
            Some(MutationKind::Remove)
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        self.to_add.len() + self.to_remove.len()
    }

    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_remove.is_empty()
    }

    fn stage(&mut self, id: EntityId, kind: MutationKind) {
        self.to_add.retain(|x| *x != id);
        self.to_remove.retain(|x| *x != id);
        match kind {
            MutationKind::Add => self.to_add.push(id),
            MutationKind::Remove => self.to_remove.push(id),
        }
    }

    fn unstage(&mut self, id: EntityId) -> bool {
        let before = self.len();
        self.to_add.retain(|x| *x != id);
        self.to_remove.retain(|x| *x != id);
        self.len() != before
    }

    fn iter(&self) -> impl Iterator<Item = (EntityId, MutationKind)> + '_ {
        self.to_add
            .iter()
            .map(|id| (*id, MutationKind::Add))
            .chain(self.to_remove.iter().map(|id| (*id, MutationKind::Remove)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitFailure {
    pub entity_id: EntityId,
    pub kind: MutationKind,
    pub reason: String,
}

/// What a commit did. Ids appear in the order they were applied.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitReport {
    pub succeeded: Vec<EntityId>,
    pub failed: Vec<CommitFailure>,
}

impl CommitReport {
    pub fn attempted(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }

    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn failed_ids(&self) -> Vec<EntityId> {
        self.failed.iter().map(|f| f.entity_id).collect()
    }

    /// `Err(PartialCommit)` if anything failed.
    pub fn into_result(self) -> SyncResult<CommitReport> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(SyncError::PartialCommit(self))
        }
    }
}

/// Applies one staged mutation through the regular write path.
#[async_trait]
pub trait MutationApplier: Send + Sync {
    async fn apply(&self, entity_id: EntityId, kind: MutationKind) -> SyncResult<()>;
}

/// Schedules entities for a day by patching `scheduled_for`.
pub struct ScheduleApplier {
    resolver: Arc<SyncResolver>,
    date: NaiveDate,
}

impl ScheduleApplier {
    pub fn new(resolver: Arc<SyncResolver>, date: NaiveDate) -> Self {
        Self { resolver, date }
    }
}

#[async_trait]
impl MutationApplier for ScheduleApplier {
    async fn apply(&self, entity_id: EntityId, kind: MutationKind) -> SyncResult<()> {
        let patch = match kind {
            MutationKind::Add => json!({ "scheduled_for": self.date.to_string() }),
            MutationKind::Remove => json!({ "scheduled_for": null }),
        };
        self.resolver.write_entity_data(entity_id, &patch).await?;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Session {
    active: bool,
    staged: Arc<StagedSet>,
}

/// Holds the planning session. Snapshots are copy-on-write.
pub struct StagedMutationEngine {
    session: RwLock<Session>,
    commit_lock: Mutex<()>,
    bus: Arc<EventBus>,
}

impl StagedMutationEngine {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            session: RwLock::new(Session::default()),
            commit_lock: Mutex::new(()),
            bus,
        }
    }

    /// Opens a session. Already staged changes are kept.
    pub fn start_session(&self) {
        self.write_session().active = true;
        debug!("planning session started");
    }

    pub fn is_active(&self) -> bool {
        self.session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .active
    }

    /// Stages `id`, moving it out of the opposite list if needed.
    pub fn stage(&self, id: EntityId, kind: MutationKind) -> SyncResult<()> {
        let mut session = self.write_session();
        if !session.active {
            return Err(SyncError::NoActiveSession);
        }
        Arc::make_mut(&mut session.staged).stage(id, kind);
        Ok(())
    }

    /// Drops `id` from the staged set. Returns false if it wasn't staged.
    pub fn unstage(&self, id: EntityId) -> bool {
        let mut session = self.write_session();
        if session.staged.kind_of(id).is_none() {
            return false;
        }
        Arc::make_mut(&mut session.staged).unstage(id)
    }

    /// The staged set as of now. Later staging does not affect it.
    pub fn snapshot(&self) -> Arc<StagedSet> {
        Arc::clone(
            &self
                .session
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .staged,
        )
    }

    /// Applies adds, then removes, one at a time. A failure is recorded and
    /// the rest are still attempted. The committed entries are cleared once
    /// the pass is over and the session ends; anything staged meanwhile stays.
    pub async fn commit(&self, applier: &dyn MutationApplier) -> CommitReport {
        let _guard = self.commit_lock.lock().await;
        let staged = self.snapshot();
        let mut report = CommitReport::default();

        for (id, kind) in staged.iter() {
            match applier.apply(id, kind).await {
                Ok(()) => report.succeeded.push(id),
                Err(e) => {
                    warn!(entity_id = %id, ?kind, "Staged mutation failed: {}", e);
                    report.failed.push(CommitFailure {
                        entity_id: id,
                        kind,
                        reason: e.to_string(),
                    });
                }
            }
        }

        {
            let mut session = self.write_session();
            let remaining = Arc::make_mut(&mut session.staged);
            for (id, kind) in staged.iter() {
                if remaining.kind_of(id) == Some(kind) {
                    remaining.unstage(id);
                }
            }
            session.active = false;
        }

        info!(
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            "Planning committed"
        );
        self.bus.publish(&DomainEvent::planning_committed(
            &report.succeeded,
            &report.failed_ids(),
        ));
        report
    }

    /// Discards everything staged and ends the session. Always safe.
    pub fn cancel(&self) {
        let mut session = self.write_session();
        session.staged = Arc::new(StagedSet::default());
        session.active = false;
        debug!("planning session cancelled");
    }

    fn write_session(&self) -> std::sync::RwLockWriteGuard<'_, Session> {
        self.session.write().unwrap_or_else(PoisonError::into_inner)
    }
}
