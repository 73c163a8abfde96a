//! The engine's service container.

use crate::collection::EntityCollection;
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult, within};
use crate::import::Importer;
use crate::refresh::{RefreshOrchestrator, RefreshReport};
use crate::resolver::SyncResolver;
use crate::staging::{CommitReport, ScheduleApplier, StagedMutationEngine};
use chrono::{DateTime, NaiveDate, Utc};
use futures::future::join_all;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use taskmesh_cache::{CacheStore, Clock, PersistenceBackend, SystemClock};
use taskmesh_extension::{EventBus, Extension, ExtensionError, ExtensionRegistry};
use taskmesh_types::{Entity, EntityId};
use tracing::{info, warn};

/// Owns every engine service. Construct one per process (or per test) and
/// pass it around by reference; nothing here is global.
pub struct TaskMesh {
    config: SyncConfig,
    bus: Arc<EventBus>,
    registry: Arc<ExtensionRegistry>,
    store: Arc<CacheStore>,
    collection: Arc<EntityCollection>,
    resolver: Arc<SyncResolver>,
    importer: Importer,
    staging: StagedMutationEngine,
    orchestrators: RwLock<BTreeMap<String, RefreshOrchestrator>>,
    shut_down: AtomicBool,
}

impl TaskMesh {
    pub fn init(config: SyncConfig, backend: Arc<dyn PersistenceBackend>) -> Self {
        Self::init_with_clock(config, backend, Arc::new(SystemClock))
    }

    /// Like [`TaskMesh::init`] with an explicit clock for cache expiry.
    pub fn init_with_clock(
        config: SyncConfig,
        backend: Arc<dyn PersistenceBackend>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let bus = Arc::new(EventBus::new());
        let registry = Arc::new(ExtensionRegistry::new(Arc::clone(&bus)));
        let collection = Arc::new(EntityCollection::new());
        let resolver = Arc::new(SyncResolver::new(
            Arc::clone(&collection),
            Arc::clone(&bus),
            &config,
        ));
        let importer = Importer::new(
            Arc::clone(&registry),
            Arc::clone(&collection),
            Arc::clone(&bus),
        );
        let staging = StagedMutationEngine::new(Arc::clone(&bus));
        info!(schema_version = config.schema_version, "Engine initialized");
        Self {
            store: CacheStore::with_clock(backend, clock),
            config,
            bus,
            registry,
            collection,
            resolver,
            importer,
            staging,
            orchestrators: RwLock::new(BTreeMap::new()),
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn registry(&self) -> &Arc<ExtensionRegistry> {
        &self.registry
    }

    pub fn cache_store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    pub fn collection(&self) -> &Arc<EntityCollection> {
        &self.collection
    }

    pub fn resolver(&self) -> &Arc<SyncResolver> {
        &self.resolver
    }

    pub fn importer(&self) -> &Importer {
        &self.importer
    }

    pub fn staging(&self) -> &StagedMutationEngine {
        &self.staging
    }

    /// Registers an extension without starting it.
    pub fn install(&self, extension: Arc<dyn Extension>) -> SyncResult<()> {
        Ok(self.registry.register(extension)?)
    }

    /// Initializes and loads an installed extension, then wires its data
    /// provider and source adapter into the engine.
    pub async fn activate(&self, extension_id: &str) -> SyncResult<()> {
        let settings = self.config.for_source(extension_id);
        if !settings.enabled {
            return Err(SyncError::SourceDisabled(extension_id.to_string()));
        }

        self.registry.initialize(extension_id).await?;
        self.registry.load(extension_id).await?;
        let extension = self.registry.require_loaded(extension_id)?;

        if let Some(provider) = extension.data_provider() {
            self.resolver.register_provider(provider);
        }
        if let Some(adapter) = extension.source_adapter() {
            let orchestrator = RefreshOrchestrator::new(
                adapter,
                Arc::clone(&self.resolver),
                Arc::clone(&self.bus),
                &self.store,
                settings,
            );
            self.orchestrators
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(extension_id.to_string(), orchestrator);
        }
        Ok(())
    }

    /// Adds a locally created entity and publishes `entity.created`.
    pub fn create(&self, entity: Entity) -> SyncResult<EntityId> {
        self.resolver.create_entity(entity)
    }

    pub fn orchestrator(&self, extension_id: &str) -> Option<RefreshOrchestrator> {
        self.orchestrators
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(extension_id)
            .cloned()
    }

    /// Refreshes one loaded source.
    pub async fn refresh(&self, extension_id: &str) -> SyncResult<RefreshReport> {
        self.registry.require_loaded(extension_id)?;
        let orchestrator =
            self.orchestrator(extension_id)
                .ok_or_else(|| ExtensionError::Unsupported {
                    extension_id: extension_id.to_string(),
                    capability: "source_adapter".to_string(),
                })?;
        Ok(orchestrator.refresh().await)
    }

    /// Refreshes every loaded source concurrently.
    pub async fn refresh_all(&self) -> Vec<RefreshReport> {
        let orchestrators: Vec<RefreshOrchestrator> = self
            .registry
            .loaded()
            .iter()
            .filter_map(|ext| self.orchestrator(ext.id()))
            .collect();
        join_all(orchestrators.iter().map(|o| o.refresh())).await
    }

    /// Schedule entities in `[start, end)` from every loaded calendar source.
    /// A failing source is logged and skipped.
    pub async fn events_between(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<Entity> {
        let mut events = Vec::new();
        for extension in self.registry.loaded() {
            let Some(calendar) = extension.calendar_operations() else {
                continue;
            };
            let query = async {
                calendar
                    .events_between(start, end)
                    .await
                    .map_err(SyncError::from)
            };
            match within("events between", self.config.fetch_timeout_ms, query).await {
                Ok(found) => events.extend(found),
                Err(e) => {
                    warn!(extension_id = extension.id(), "Calendar query failed: {}", e);
                }
            }
        }
        events
    }

    /// Commits the planning session, scheduling added entities for `date`.
    pub async fn commit_plan(&self, date: NaiveDate) -> CommitReport {
        let applier = ScheduleApplier::new(Arc::clone(&self.resolver), date);
        self.staging.commit(&applier).await
    }

    /// Stops every extension. Later calls do nothing.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.staging.cancel();
        self.registry.shutdown_all().await;
        self.orchestrators
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        info!("Engine shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }
}
