//! In-process publish/subscribe for domain events.
//!
//! Dispatch is synchronous: `trigger` runs every matching handler on the
//! caller's task, in subscription order, before returning. A failing or
//! panicking handler does not stop the fan-out; failures are collected and
//! returned together once every handler has run.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use taskmesh_types::{DomainEvent, EventType};
use thiserror::Error;
use tracing::{debug, warn};

type Handler = Arc<dyn Fn(&DomainEvent) -> anyhow::Result<()> + Send + Sync>;

/// Handle returned by [`EventBus::on`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// One handler that failed during a dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerFailure {
    pub subscription: SubscriptionId,
    pub message: String,
}

/// Every handler failure from a single `trigger` call.
#[derive(Debug, Clone, Error)]
#[error("{} handler(s) failed for event '{event_type}'", failures.len())]
pub struct DispatchError {
    pub event_type: String,
    /// Handlers that ran successfully.
    pub delivered: usize,
    pub failures: Vec<HandlerFailure>,
}

struct Subscription {
    id: SubscriptionId,
    event_type: String,
    handler: Handler,
}

/// Process-wide event bus. Construct one per engine and share it by `Arc`.
pub struct EventBus {
    next_id: AtomicU64,
    subscriptions: RwLock<Vec<Subscription>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            subscriptions: RwLock::new(Vec::new()),
        }
    }

    /// Subscribes `handler` to `event_type` (or [`EventType::WILDCARD`]).
    pub fn on<F>(&self, event_type: impl Into<String>, handler: F) -> SubscriptionId
    where
        F: Fn(&DomainEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let event_type = event_type.into();
        debug!(subscription = %id, event_type = %event_type, "subscribed");
        self.subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Subscription {
                id,
                event_type,
                handler: Arc::new(handler),
            });
        id
    }

    /// Removes a subscription. Returns false if it was already gone.
    pub fn off(&self, id: SubscriptionId) -> bool {
        let mut subs = self
            .subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = subs.len();
        subs.retain(|s| s.id != id);
        subs.len() != before
    }

    /// Publishes `event` to its current subscribers.
    ///
    /// Returns how many handlers ran successfully. Handlers may subscribe or
    /// unsubscribe while being dispatched; such changes apply from the next
    /// `trigger` on.
    pub fn trigger(&self, event: &DomainEvent) -> Result<usize, DispatchError> {
        let handlers: Vec<(SubscriptionId, Handler)> = self
            .subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|s| s.event_type == event.event_type || s.event_type == EventType::WILDCARD)
            .map(|s| (s.id, Arc::clone(&s.handler)))
            .collect();

        let mut delivered = 0;
        let mut failures = Vec::new();
        for (id, handler) in handlers {
            let outcome = catch_unwind(AssertUnwindSafe(|| handler(event)));
            let message = match outcome {
                Ok(Ok(())) => {
                    delivered += 1;
                    continue;
                }
                Ok(Err(e)) => e.to_string(),
                Err(panic) => panic_message(panic.as_ref()),
            };
            warn!(
                subscription = %id,
                event_type = %event.event_type,
                "event handler failed: {}",
                message
            );
            failures.push(HandlerFailure {
                subscription: id,
                message,
            });
        }

        if failures.is_empty() {
            Ok(delivered)
        } else {
            Err(DispatchError {
                event_type: event.event_type.clone(),
                delivered,
                failures,
            })
        }
    }

    /// Publishes `event` and logs, rather than returns, handler failures.
    pub fn publish(&self, event: &DomainEvent) {
        if let Err(e) = self.trigger(event) {
            warn!("{}", e);
        }
    }

    /// Number of subscriptions for exactly `event_type`.
    pub fn subscriber_count(&self, event_type: &str) -> usize {
        self.subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|s| s.event_type == event_type)
            .count()
    }

    /// Drops every subscription.
    pub fn clear(&self) {
        self.subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("handler panicked: {s}")
    } else {
        "handler panicked".to_string()
    }
}
