//! Installed extensions and their lifecycle.

use crate::error::{ExtensionError, ExtensionResult};
use crate::event_bus::{EventBus, SubscriptionId};
use crate::extension::Extension;
use crate::lifecycle::{LifecycleOp, LifecycleState};
use std::sync::{Arc, PoisonError, RwLock};
use taskmesh_types::{DomainEvent, EntityKind, EventType};
use tokio::sync::Mutex;
use tracing::{info, warn};

struct Entry {
    extension: Arc<dyn Extension>,
    state: LifecycleState,
    subscriptions: Vec<SubscriptionId>,
}

/// Tracks installed extensions in registration order.
///
/// Lookups are synchronous. Lifecycle calls are async (they call into the
/// extension) and are serialized so two callers can't drive the same
/// extension through a transition at once.
pub struct ExtensionRegistry {
    entries: RwLock<Vec<Entry>>,
    bus: Arc<EventBus>,
    lifecycle: Mutex<()>,
}

impl ExtensionRegistry {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            bus,
            lifecycle: Mutex::new(()),
        }
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Installs an extension in the `Registered` state.
    ///
    /// Fails with [`ExtensionError::Duplicate`] if the id is taken; the
    /// existing instance stays in place.
    pub fn register(&self, extension: Arc<dyn Extension>) -> ExtensionResult<()> {
        let id = extension.id().to_string();
        {
            let mut entries = self.write_entries();
            if entries.iter().any(|e| e.extension.id() == id) {
                return Err(ExtensionError::Duplicate(id));
            }
            entries.push(Entry {
                extension,
                state: LifecycleState::Registered,
                subscriptions: Vec::new(),
            });
        }
        info!(extension_id = %id, "Extension registered");
        self.bus
            .publish(&DomainEvent::extension(EventType::ExtensionRegistered, &id));
        Ok(())
    }

    /// Shuts the extension down if needed and removes it.
    pub async fn unregister(&self, id: &str) -> ExtensionResult<Arc<dyn Extension>> {
        self.shutdown(id).await?;
        let mut entries = self.write_entries();
        let index = entries
            .iter()
            .position(|e| e.extension.id() == id)
            .ok_or_else(|| ExtensionError::NotFound(id.to_string()))?;
        let entry = entries.remove(index);
        info!(extension_id = %id, "Extension unregistered");
        Ok(entry.extension)
    }

    pub fn get_by_id(&self, id: &str) -> Option<Arc<dyn Extension>> {
        self.read_entries(|entries| {
            entries
                .iter()
                .find(|e| e.extension.id() == id)
                .map(|e| Arc::clone(&e.extension))
        })
    }

    pub fn get_all(&self) -> Vec<Arc<dyn Extension>> {
        self.read_entries(|entries| entries.iter().map(|e| Arc::clone(&e.extension)).collect())
    }

    /// Extensions declaring support for `kind`, in registration order.
    pub fn get_by_entity_type(&self, kind: EntityKind) -> Vec<Arc<dyn Extension>> {
        self.read_entries(|entries| {
            entries
                .iter()
                .filter(|e| e.extension.supported_entity_types().contains(&kind))
                .map(|e| Arc::clone(&e.extension))
                .collect()
        })
    }

    /// Extensions currently in the `Loaded` state.
    pub fn loaded(&self) -> Vec<Arc<dyn Extension>> {
        self.read_entries(|entries| {
            entries
                .iter()
                .filter(|e| e.state.is_active())
                .map(|e| Arc::clone(&e.extension))
                .collect()
        })
    }

    pub fn state(&self, id: &str) -> Option<LifecycleState> {
        self.read_entries(|entries| {
            entries
                .iter()
                .find(|e| e.extension.id() == id)
                .map(|e| e.state)
        })
    }

    /// Returns the extension if it is loaded, `IllegalState` otherwise.
    pub fn require_loaded(&self, id: &str) -> ExtensionResult<Arc<dyn Extension>> {
        let (extension, state) = self.lookup(id)?;
        if !state.is_active() {
            return Err(ExtensionError::IllegalState {
                extension_id: id.to_string(),
                state,
                operation: LifecycleOp::Serve,
            });
        }
        Ok(extension)
    }

    pub async fn initialize(&self, id: &str) -> ExtensionResult<()> {
        let _guard = self.lifecycle.lock().await;
        let (extension, state) = self.lookup(id)?;
        let Some(next) = state.next(LifecycleOp::Initialize, id)? else {
            return Ok(());
        };

        extension
            .initialize()
            .await
            .map_err(|e| lifecycle_failure(id, LifecycleOp::Initialize, e))?;

        self.set_state(id, next, None);
        info!(extension_id = %id, "Extension initialized");
        Ok(())
    }

    /// Loads an initialized extension and subscribes it to its events.
    ///
    /// Calling this before `initialize` is a programmer error and fails with
    /// `IllegalState` without calling into the extension.
    pub async fn load(&self, id: &str) -> ExtensionResult<()> {
        let _guard = self.lifecycle.lock().await;
        let (extension, state) = self.lookup(id)?;
        let Some(next) = state.next(LifecycleOp::Load, id)? else {
            return Ok(());
        };

        extension
            .load()
            .await
            .map_err(|e| lifecycle_failure(id, LifecycleOp::Load, e))?;

        let subscriptions: Vec<SubscriptionId> = extension
            .subscribed_events()
            .into_iter()
            .map(|event_type| {
                let target = Arc::clone(&extension);
                self.bus.on(event_type, move |event| target.handle_event(event))
            })
            .collect();

        self.set_state(id, next, Some(subscriptions));
        info!(extension_id = %id, "Extension loaded");
        self.bus
            .publish(&DomainEvent::extension(EventType::ExtensionLoaded, id));
        Ok(())
    }

    /// Shuts an extension down. Safe to call repeatedly and on an extension
    /// that was never initialized; both are no-ops.
    pub async fn shutdown(&self, id: &str) -> ExtensionResult<()> {
        let _guard = self.lifecycle.lock().await;
        let (extension, state) = self.lookup(id)?;
        let Some(next) = state.next(LifecycleOp::Shutdown, id)? else {
            return Ok(());
        };

        let subscriptions = self.set_state(id, next, Some(Vec::new()));
        for sub in subscriptions {
            self.bus.off(sub);
        }

        if let Err(e) = extension.shutdown().await {
            warn!(extension_id = %id, "shutdown() failed: {}", e);
        }
        info!(extension_id = %id, "Extension unloaded");
        self.bus
            .publish(&DomainEvent::extension(EventType::ExtensionUnloaded, id));
        Ok(())
    }

    /// Shuts down every extension in reverse registration order.
    pub async fn shutdown_all(&self) {
        let ids: Vec<String> = self.read_entries(|entries| {
            entries
                .iter()
                .rev()
                .map(|e| e.extension.id().to_string())
                .collect()
        });
        for id in ids {
            if let Err(e) = self.shutdown(&id).await {
                warn!(extension_id = %id, "shutdown failed: {}", e);
            }
        }
    }

    fn lookup(&self, id: &str) -> ExtensionResult<(Arc<dyn Extension>, LifecycleState)> {
        self.read_entries(|entries| {
            entries
                .iter()
                .find(|e| e.extension.id() == id)
                .map(|e| (Arc::clone(&e.extension), e.state))
        })
        .ok_or_else(|| ExtensionError::NotFound(id.to_string()))
    }

    /// Updates the state and, when given, swaps the subscription list.
    /// Returns the previous subscriptions.
    fn set_state(
        &self,
        id: &str,
        state: LifecycleState,
        subscriptions: Option<Vec<SubscriptionId>>,
    ) -> Vec<SubscriptionId> {
        let mut entries = self.write_entries();
        let Some(entry) = entries.iter_mut().find(|e| e.extension.id() == id) else {
            return Vec::new();
        };
        entry.state = state;
        match subscriptions {
            Some(subs) => std::mem::replace(&mut entry.subscriptions, subs),
            None => Vec::new(),
        }
    }

    fn read_entries<R>(&self, f: impl FnOnce(&[Entry]) -> R) -> R {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        f(&entries)
    }

    fn write_entries(&self) -> std::sync::RwLockWriteGuard<'_, Vec<Entry>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn lifecycle_failure(id: &str, operation: LifecycleOp, error: ExtensionError) -> ExtensionError {
    match error {
        e @ ExtensionError::IllegalState { .. } => e,
        other => ExtensionError::Lifecycle {
            extension_id: id.to_string(),
            operation,
            message: other.to_string(),
        },
    }
}
