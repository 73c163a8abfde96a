//! Per-source refresh orchestration.
//!
//! A refresh lists the source's sub-resources, pages through each one,
//! transforms the raw items and swaps the result into the collection in one
//! step. One failing sub-resource never aborts its siblings; its last cached
//! items stand in for it when they are still valid.
//!
//! Only one refresh per source runs at a time. Callers arriving while one is
//! in flight await the same run and receive the same report.

use crate::collection::EntityCollection;
use crate::config::SourceSettings;
use crate::error::{SyncError, SyncResult, within};
use crate::resolver::SyncResolver;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use serde::Serialize;
use serde_json::Value;
use std::sync::{Arc, Mutex, PoisonError};
use taskmesh_cache::{CacheSchema, CacheStats, CacheStore, SchemaCache};
use taskmesh_extension::{EventBus, SourceAdapter, SubResource};
use taskmesh_types::DomainEvent;
use tokio::sync::watch;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshStatus {
    Idle,
    Refreshing,
    /// Transient: the run finished with failures and is about to return to idle.
    Error,
}

/// Observable refresh progress. One unit is one sub-resource.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshProgress {
    pub status: RefreshStatus,
    pub processed_units: usize,
    pub total_units: usize,
    pub percentage: u8,
    /// Summary of the last run's failures, kept after returning to idle.
    pub error: Option<String>,
}

impl RefreshProgress {
    fn idle() -> Self {
        Self {
            status: RefreshStatus::Idle,
            processed_units: 0,
            total_units: 0,
            percentage: 0,
            error: None,
        }
    }
}

/// A sub-resource that could not be fetched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubResourceFailure {
    pub sub_resource: String,
    pub message: String,
    /// Cached items from an earlier run were used instead.
    pub reused_cache: bool,
}

/// Outcome of one refresh run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshReport {
    pub extension_id: String,
    /// Entities the source holds after the swap.
    pub entity_count: usize,
    pub sub_resources: usize,
    pub failures: Vec<SubResourceFailure>,
    pub warnings: Vec<String>,
    /// Sub-resources cut off by the pagination cap.
    pub truncated: Vec<String>,
    /// Set when the run failed before any sub-resource was fetched. The
    /// collection is left untouched in that case.
    pub error: Option<String>,
}

impl RefreshReport {
    pub fn is_clean(&self) -> bool {
        self.error.is_none() && self.failures.is_empty() && self.warnings.is_empty()
    }
}

type InFlight = Shared<BoxFuture<'static, RefreshReport>>;

struct Inner {
    extension_id: String,
    adapter: Arc<dyn SourceAdapter>,
    collection: Arc<EntityCollection>,
    resolver: Arc<SyncResolver>,
    bus: Arc<EventBus>,
    items: SchemaCache<Vec<Value>>,
    settings: SourceSettings,
    progress: watch::Sender<RefreshProgress>,
    in_flight: Mutex<Option<InFlight>>,
}

/// Refreshes one source. Cheap to clone; clones share the in-flight run.
#[derive(Clone)]
pub struct RefreshOrchestrator {
    inner: Arc<Inner>,
}

impl RefreshOrchestrator {
    /// Refreshed entities land in the resolver's collection, merged with the
    /// ones already held through the resolver's entity handlers.
    pub fn new(
        adapter: Arc<dyn SourceAdapter>,
        resolver: Arc<SyncResolver>,
        bus: Arc<EventBus>,
        store: &Arc<CacheStore>,
        settings: SourceSettings,
    ) -> Self {
        let extension_id = adapter.extension_id().to_string();
        let namespace = format!("{extension_id}/items");
        let items = store.cache(
            namespace.clone(),
            CacheSchema::list_of(namespace, settings.schema_version, Vec::new()),
            settings.cache_ttl,
        );
        let (progress, _) = watch::channel(RefreshProgress::idle());
        Self {
            inner: Arc::new(Inner {
                extension_id,
                adapter,
                collection: Arc::clone(resolver.collection()),
                resolver,
                bus,
                items,
                settings,
                progress,
                in_flight: Mutex::new(None),
            }),
        }
    }

    pub fn extension_id(&self) -> &str {
        &self.inner.extension_id
    }

    /// Subscribes to progress updates.
    pub fn progress(&self) -> watch::Receiver<RefreshProgress> {
        self.inner.progress.subscribe()
    }

    pub fn status(&self) -> RefreshStatus {
        self.inner.progress.borrow().status
    }

    /// Counters of the raw item cache.
    pub fn cache_stats(&self) -> CacheStats {
        self.inner.items.stats()
    }

    /// Runs a refresh, or joins the one already in flight.
    pub async fn refresh(&self) -> RefreshReport {
        let run = {
            let mut slot = self
                .inner
                .in_flight
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            match slot.as_ref() {
                Some(running) => {
                    debug!(extension_id = %self.inner.extension_id, "joining in-flight refresh");
                    running.clone()
                }
                None => {
                    let inner = Arc::clone(&self.inner);
                    let run = async move {
                        let report = inner.run().await;
                        inner
                            .in_flight
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .take();
                        report
                    }
                    .boxed()
                    .shared();
                    *slot = Some(run.clone());
                    run
                }
            }
        };
        run.await
    }
}

impl Inner {
    async fn run(&self) -> RefreshReport {
        let mut report = RefreshReport {
            extension_id: self.extension_id.clone(),
            ..RefreshReport::default()
        };
        info!(extension_id = %self.extension_id, "Refresh started");
        self.set_progress(RefreshStatus::Refreshing, 0, 0, None);

        let listing = async {
            self.adapter
                .fetch_sub_resources()
                .await
                .map_err(|e| self.fetch_error("<sub-resources>", e))
        };
        let sub_resources =
            match within("fetch sub-resources", self.settings.fetch_timeout_ms, listing).await {
                Ok(subs) => subs,
                Err(e) => {
                    warn!(extension_id = %self.extension_id, "Refresh aborted: {}", e);
                    report.error = Some(e.to_string());
                    report.entity_count = self.collection.entities_for(&self.extension_id).len();
                    self.finish(&report);
                    return report;
                }
            };

        let total = sub_resources.len();
        report.sub_resources = total;
        self.set_progress(RefreshStatus::Refreshing, 0, total, None);

        let mut entities = Vec::new();
        for (index, sub) in sub_resources.iter().enumerate() {
            let raw = self.collect_items(sub, &mut report).await;
            for item in &raw {
                match self.adapter.transform(item) {
                    Ok(entity) if entity.extension_id() == Some(self.extension_id.as_str()) => {
                        entities.push(entity);
                    }
                    Ok(entity) => report.warnings.push(format!(
                        "{}: transformed entity {} is not owned by this source",
                        sub.name, entity.id
                    )),
                    Err(e) => report.warnings.push(format!("{}: {}", sub.name, e)),
                }
            }
            self.set_progress(RefreshStatus::Refreshing, index + 1, total, None);
        }

        report.entity_count = self.collection.replace_source_with(
            &self.extension_id,
            entities,
            |local, incoming| self.resolver.merge_incoming(local, incoming),
        );
        self.bus.publish(&DomainEvent::entities_refreshed(
            &self.extension_id,
            report.entity_count,
            report.failures.len(),
        ));
        self.finish(&report);
        report
    }

    /// Fetches every page of `sub`, falling back to cached items on failure.
    async fn collect_items(&self, sub: &SubResource, report: &mut RefreshReport) -> Vec<Value> {
        match self.fetch_pages(sub).await {
            Ok((items, truncated)) => {
                if truncated {
                    warn!(
                        extension_id = %self.extension_id,
                        sub_resource = %sub.name,
                        max_pages = self.settings.max_pages,
                        "Pagination cap reached, results truncated"
                    );
                    report.truncated.push(sub.id.clone());
                    report.warnings.push(format!(
                        "{}: stopped after {} pages",
                        sub.name, self.settings.max_pages
                    ));
                }
                if let Err(e) = self.items.set(&sub.id, items.clone()).await {
                    report.warnings.push(format!("{}: not cached: {}", sub.name, e));
                }
                items
            }
            Err(e) => {
                warn!(
                    extension_id = %self.extension_id,
                    sub_resource = %sub.name,
                    "Sub-resource fetch failed: {}",
                    e
                );
                let cached = match self.items.get(&sub.id).await {
                    Ok(cached) => cached,
                    Err(cache_err) => {
                        debug!(sub_resource = %sub.name, "cache read failed: {}", cache_err);
                        None
                    }
                };
                report.failures.push(SubResourceFailure {
                    sub_resource: sub.id.clone(),
                    message: e.to_string(),
                    reused_cache: cached.is_some(),
                });
                cached.unwrap_or_default()
            }
        }
    }

    /// Returns the items and whether the page cap cut them short.
    async fn fetch_pages(&self, sub: &SubResource) -> SyncResult<(Vec<Value>, bool)> {
        let operation = format!("fetch '{}'", sub.name);
        let mut items = Vec::new();
        let mut cursor: Option<String> = None;

        for _ in 0..self.settings.max_pages {
            let fetch = async {
                self.adapter
                    .fetch_items_for(sub, cursor.as_deref())
                    .await
                    .map_err(|e| self.fetch_error(&sub.id, e))
            };
            let page = within(&operation, self.settings.fetch_timeout_ms, fetch).await?;
            items.extend(page.items);
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => return Ok((items, false)),
            }
        }
        Ok((items, true))
    }

    fn fetch_error(&self, sub_resource: &str, error: impl std::fmt::Display) -> SyncError {
        SyncError::SourceFetch {
            extension_id: self.extension_id.clone(),
            sub_resource: sub_resource.to_string(),
            message: error.to_string(),
        }
    }

    fn finish(&self, report: &RefreshReport) {
        let total = report.sub_resources;
        let error = report.error.clone().or_else(|| {
            (!report.failures.is_empty()).then(|| {
                let failed: Vec<&str> = report
                    .failures
                    .iter()
                    .map(|f| f.sub_resource.as_str())
                    .collect();
                format!("failed sub-resources: {}", failed.join(", "))
            })
        });

        if error.is_some() {
            self.set_progress(RefreshStatus::Error, total, total, error.clone());
        }
        self.set_progress(RefreshStatus::Idle, total, total, error);
        info!(
            extension_id = %self.extension_id,
            entities = report.entity_count,
            failed = report.failures.len(),
            warnings = report.warnings.len(),
            "Refresh finished"
        );
    }

    fn set_progress(
        &self,
        status: RefreshStatus,
        processed_units: usize,
        total_units: usize,
        error: Option<String>,
    ) {
        let percentage = if total_units == 0 {
            if status == RefreshStatus::Refreshing { 0 } else { 100 }
        } else {
            u8::try_from(processed_units * 100 / total_units).unwrap_or(100)
        };
        self.progress.send_replace(RefreshProgress {
            status,
            processed_units,
            total_units,
            percentage,
            error,
        });
    }
}
