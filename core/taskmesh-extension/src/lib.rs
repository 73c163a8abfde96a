//! Extension registry, lifecycle and event bus for taskmesh.
//!
//! An [`Extension`] represents one data source (a note store, an issue
//! tracker, a reminders app, a calendar endpoint). Extensions declare what
//! they can do through optional capability traits rather than by exposing
//! a fixed set of methods:
//!
//! - [`TaskOperations`]: read and write individual tasks in the source
//! - [`CalendarOperations`]: answer schedule queries for a time range
//! - [`SourceAdapter`]: list, page through and transform the source's items
//! - [`EntityDataProvider`]: resolve entity data not yet in the live collection
//!
//! The [`ExtensionRegistry`] tracks installed extensions and drives them
//! through `Registered → Initialized → Loaded → Unloaded`. Only loaded
//! extensions receive events from the [`EventBus`].

mod error;
mod event_bus;
mod extension;
mod lifecycle;
mod provider;
mod registry;
mod source;

pub use error::{ExtensionError, ExtensionResult};
pub use event_bus::{DispatchError, EventBus, HandlerFailure, SubscriptionId};
pub use extension::{CalendarOperations, Extension, TaskOperations};
pub use lifecycle::{LifecycleOp, LifecycleState};
pub use provider::EntityDataProvider;
pub use registry::ExtensionRegistry;
pub use source::{ItemPage, SourceAdapter, SubResource};
