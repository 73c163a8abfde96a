//! Schema-validated persistent cache for taskmesh.
//!
//! A [`SchemaCache`] is a namespaced key/value store with two layers:
//! an in-memory map checked first, and a persistent blob provided by a
//! [`PersistenceBackend`]. Every write is validated against a
//! [`CacheSchema`]; every read checks the entry's schema version and expiry,
//! so stale or outdated entries behave exactly like misses.
//!
//! # Persisted layout
//!
//! ```text
//! { "cache": { "<namespace>": { "<key>": CacheEntry } } }
//! ```
//!
//! Other top-level keys of the blob belong to other subsystems and are
//! preserved untouched.

mod backend;
mod cache;
mod clock;
mod entry;
mod error;
mod schema;
mod store;

pub use backend::{JsonFileBackend, MemoryBackend, PersistenceBackend};
pub use cache::{CacheStats, SchemaCache};
pub use clock::{Clock, ManualClock, SystemClock};
pub use entry::CacheEntry;
pub use error::{CacheError, CacheResult};
pub use schema::{CacheSchema, FieldSpec, FieldType};
pub use store::CacheStore;
