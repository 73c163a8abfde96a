use crate::backend::PersistenceBackend;
use crate::cache::SchemaCache;
use crate::clock::{Clock, SystemClock};
use crate::error::{CacheError, CacheResult};
use crate::schema::CacheSchema;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::Mutex;

const CACHE_ROOT: &str = "cache";

/// Shares one persistence backend between many cache namespaces.
///
/// Every change is a read-modify-write of the whole blob, so writes are
/// serialized through an async mutex to keep concurrent namespaces from
/// overwriting each other's subtrees.
pub struct CacheStore {
    backend: Arc<dyn PersistenceBackend>,
    clock: Arc<dyn Clock>,
    write_lock: Mutex<()>,
}

impl CacheStore {
    pub fn new(backend: Arc<dyn PersistenceBackend>) -> Arc<Self> {
        Self::with_clock(backend, Arc::new(SystemClock))
    }

    /// Uses `clock` for every cache created from this store.
    pub fn with_clock(backend: Arc<dyn PersistenceBackend>, clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new(Self {
            backend,
            clock,
            write_lock: Mutex::new(()),
        })
    }

    /// Creates a cache instance over `namespace`.
    pub fn cache<T>(
        self: &Arc<Self>,
        namespace: impl Into<String>,
        schema: CacheSchema,
        ttl: Option<chrono::Duration>,
    ) -> SchemaCache<T>
    where
        T: Serialize + DeserializeOwned + Clone + Send + Sync,
    {
        SchemaCache::new(namespace.into(), schema, ttl, Arc::clone(self))
    }

    pub(crate) fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Reads one serialized entry.
    pub(crate) async fn read_entry(
        &self,
        namespace: &str,
        key: &str,
    ) -> CacheResult<Option<Value>> {
        let blob = self.backend.load_data().await?;
        Ok(blob
            .get(CACHE_ROOT)
            .and_then(|root| root.get(namespace))
            .and_then(|ns| ns.get(key))
            .cloned())
    }

    /// Lists keys persisted under a namespace.
    pub(crate) async fn read_keys(&self, namespace: &str) -> CacheResult<Vec<String>> {
        let blob = self.backend.load_data().await?;
        Ok(blob
            .get(CACHE_ROOT)
            .and_then(|root| root.get(namespace))
            .and_then(Value::as_object)
            .map(|ns| ns.keys().cloned().collect())
            .unwrap_or_default())
    }

    pub(crate) async fn write_entry(
        &self,
        namespace: &str,
        key: &str,
        entry: Value,
    ) -> CacheResult<()> {
        self.modify_namespace(namespace, |ns| {
            ns.insert(key.to_string(), entry);
        })
        .await
    }

    pub(crate) async fn remove_entries(&self, namespace: &str, keys: &[String]) -> CacheResult<()> {
        self.modify_namespace(namespace, |ns| {
            for key in keys {
                ns.remove(key);
            }
        })
        .await
    }

    pub(crate) async fn clear_namespace(&self, namespace: &str) -> CacheResult<()> {
        let _guard = self.write_lock.lock().await;
        let mut blob = self.backend.load_data().await?;
        if let Some(root) = blob.get_mut(CACHE_ROOT).and_then(Value::as_object_mut) {
            root.remove(namespace);
        }
        self.backend.save_data(blob).await
    }

    async fn modify_namespace<F>(&self, namespace: &str, f: F) -> CacheResult<()>
    where
        F: FnOnce(&mut Map<String, Value>),
    {
        let _guard = self.write_lock.lock().await;
        let mut blob = self.backend.load_data().await?;
        let root = blob
            .as_object_mut()
            .ok_or_else(|| CacheError::InvalidData("persisted blob is not an object".into()))?
            .entry(CACHE_ROOT)
            .or_insert_with(|| Value::Object(Map::new()));
        let root = root
            .as_object_mut()
            .ok_or_else(|| CacheError::InvalidData("`cache` is not an object".into()))?;
        let ns = root
            .entry(namespace)
            .or_insert_with(|| Value::Object(Map::new()))
            .as_object_mut()
            .ok_or_else(|| {
                CacheError::InvalidData(format!("`cache.{namespace}` is not an object"))
            })?;
        f(ns);
        self.backend.save_data(blob).await
    }
}
