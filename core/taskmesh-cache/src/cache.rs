use crate::entry::CacheEntry;
use crate::error::{CacheError, CacheResult};
use crate::schema::CacheSchema;
use crate::store::CacheStore;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::hash_map::Entry;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, warn};

/// Counters for one cache instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub writes: u64,
    /// Persistent-layer reads or writes that failed and were absorbed.
    pub persist_failures: u64,
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
    persist_failures: AtomicU64,
}

/// A namespaced, schema-validated, two-layer cache.
///
/// Reads go memory-first, then fall back to the persistent layer and
/// populate memory on a valid hit. Writes update both layers; a failed
/// durable write is logged and counted but leaves the memory layer updated,
/// so memory is never older than storage.
pub struct SchemaCache<T> {
    namespace: String,
    schema: CacheSchema,
    ttl: Option<chrono::Duration>,
    store: Arc<CacheStore>,
    memory: RwLock<HashMap<String, CacheEntry<T>>>,
    counters: Counters,
}

impl<T> SchemaCache<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync,
{
    pub(crate) fn new(
        namespace: String,
        schema: CacheSchema,
        ttl: Option<chrono::Duration>,
        store: Arc<CacheStore>,
    ) -> Self {
        Self {
            namespace,
            schema,
            ttl,
            store,
            memory: RwLock::new(HashMap::new()),
            counters: Counters::default(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn schema_version(&self) -> u32 {
        self.schema.version
    }

    /// Returns the value for `key`, or `None` when missing, expired or
    /// written under another schema version.
    ///
    /// A persistent layer that cannot be read counts as a miss.
    pub async fn get(&self, key: &str) -> CacheResult<Option<T>> {
        let now = self.store.clock().now();

        if let Some(data) = self.memory_lookup(key, now) {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            debug!(namespace = %self.namespace, key, "cache hit (memory)");
            return Ok(Some(data));
        }

        let raw = match self.store.read_entry(&self.namespace, key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return Ok(self.miss(key)),
            Err(e) => {
                self.persist_failed("get", key, &e);
                return Ok(self.miss(key));
            }
        };

        let entry: CacheEntry<T> = match serde_json::from_value(raw) {
            Ok(entry) => entry,
            Err(e) => {
                debug!(namespace = %self.namespace, key, "unreadable persisted entry: {}", e);
                return Ok(self.miss(key));
            }
        };

        if !entry.is_valid(self.schema.version, now) {
            debug!(
                namespace = %self.namespace,
                key,
                version = entry.version,
                "persisted entry is stale or from another schema version"
            );
            return Ok(self.miss(key));
        }

        // A set that ran while the blob was loading wins over what was loaded.
        let version = self.schema.version;
        let data = self.write_memory(|memory| match memory.entry(key.to_string()) {
            Entry::Occupied(mut slot) => {
                let current = slot.get();
                if current.is_valid(version, now) && current.timestamp >= entry.timestamp {
                    current.data.clone()
                } else {
                    let data = entry.data.clone();
                    slot.insert(entry);
                    data
                }
            }
            Entry::Vacant(slot) => slot.insert(entry).data.clone(),
        });
        self.counters.hits.fetch_add(1, Ordering::Relaxed);
        debug!(namespace = %self.namespace, key, "cache hit (persistent)");
        Ok(Some(data))
    }

    /// Returns true if `get` would return a value.
    pub async fn has(&self, key: &str) -> CacheResult<bool> {
        Ok(self.get(key).await?.is_some())
    }

    /// Validates and stores `data`.
    ///
    /// Fails with [`CacheError::SchemaValidation`] without touching either
    /// layer when the value does not match the schema.
    pub async fn set(&self, key: &str, data: T) -> CacheResult<()> {
        let value = serde_json::to_value(&data)?;
        self.schema
            .validate(&value)
            .map_err(|reason| CacheError::SchemaValidation {
                namespace: self.namespace.clone(),
                key: key.to_string(),
                reason,
            })?;

        let entry = CacheEntry::new(data, self.schema.version, self.store.clock().now(), self.ttl);
        let serialized = serde_json::to_value(CacheEntry {
            data: value,
            timestamp: entry.timestamp,
            expires_at: entry.expires_at,
            version: entry.version,
        })?;

        self.write_memory(|memory| {
            memory.insert(key.to_string(), entry);
        });
        self.counters.writes.fetch_add(1, Ordering::Relaxed);

        if let Err(e) = self.store.write_entry(&self.namespace, key, serialized).await {
            self.persist_failed("set", key, &e);
        }
        Ok(())
    }

    /// Removes `key` from both layers.
    pub async fn delete(&self, key: &str) -> CacheResult<()> {
        self.write_memory(|memory| {
            memory.remove(key);
        });
        if let Err(e) = self
            .store
            .remove_entries(&self.namespace, &[key.to_string()])
            .await
        {
            self.persist_failed("delete", key, &e);
        }
        Ok(())
    }

    /// Removes every entry of this namespace. Other namespaces are untouched.
    pub async fn clear(&self) -> CacheResult<()> {
        self.write_memory(|memory| memory.clear());
        if let Err(e) = self.store.clear_namespace(&self.namespace).await {
            self.persist_failed("clear", "*", &e);
        }
        Ok(())
    }

    /// Keys present in either layer, sorted. Entries are not validated.
    /// Only memory keys are listed when the persistent layer cannot be read.
    pub async fn keys(&self) -> CacheResult<Vec<String>> {
        let mut keys: BTreeSet<String> = self
            .memory
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        match self.store.read_keys(&self.namespace).await {
            Ok(persisted) => keys.extend(persisted),
            Err(e) => self.persist_failed("keys", "*", &e),
        }
        Ok(keys.into_iter().collect())
    }

    /// Drops every invalid entry from both layers. Returns how many were removed.
    pub async fn prune_expired(&self) -> CacheResult<usize> {
        let now = self.store.clock().now();
        let version = self.schema.version;
        let mut stale = Vec::new();

        match self.store.read_keys(&self.namespace).await {
            Ok(persisted) => {
                for key in persisted {
                    let valid = match self.store.read_entry(&self.namespace, &key).await {
                        Ok(Some(raw)) => serde_json::from_value::<CacheEntry<Value>>(raw)
                            .map(|entry| entry.is_valid(version, now))
                            .unwrap_or(false),
                        Ok(None) => true,
                        Err(e) => {
                            self.persist_failed("prune", &key, &e);
                            true
                        }
                    };
                    if !valid {
                        stale.push(key);
                    }
                }
            }
            Err(e) => self.persist_failed("prune", "*", &e),
        }

        self.write_memory(|memory| {
            memory.retain(|key, entry| {
                let keep = entry.is_valid(version, now);
                if !keep && !stale.contains(key) {
                    stale.push(key.clone());
                }
                keep
            });
            for key in &stale {
                memory.remove(key);
            }
        });

        if !stale.is_empty() {
            if let Err(e) = self.store.remove_entries(&self.namespace, &stale).await {
                self.persist_failed("prune", "*", &e);
            }
        }
        debug!(namespace = %self.namespace, removed = stale.len(), "pruned cache");
        Ok(stale.len())
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            writes: self.counters.writes.load(Ordering::Relaxed),
            persist_failures: self.counters.persist_failures.load(Ordering::Relaxed),
        }
    }

    fn memory_lookup(&self, key: &str, now: chrono::DateTime<chrono::Utc>) -> Option<T> {
        let version = self.schema.version;
        let expired = {
            let memory = self.memory.read().unwrap_or_else(PoisonError::into_inner);
            match memory.get(key) {
                Some(entry) if entry.is_valid(version, now) => {
                    return Some(entry.data.clone());
                }
                Some(_) => true,
                None => false,
            }
        };
        if expired {
            // Re-checked under the write lock: a fresh set may have landed.
            self.write_memory(|memory| {
                if memory.get(key).is_some_and(|entry| !entry.is_valid(version, now)) {
                    memory.remove(key);
                }
            });
        }
        None
    }

    fn miss(&self, key: &str) -> Option<T> {
        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        debug!(namespace = %self.namespace, key, "cache miss");
        None
    }

    fn write_memory<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut HashMap<String, CacheEntry<T>>) -> R,
    {
        let mut memory = self.memory.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut memory)
    }

    fn persist_failed(&self, operation: &str, key: &str, error: &CacheError) {
        self.counters.persist_failures.fetch_add(1, Ordering::Relaxed);
        warn!(
            namespace = %self.namespace,
            key,
            operation,
            "cache persistence failed, continuing with the in-memory layer: {}",
            error
        );
    }
}
