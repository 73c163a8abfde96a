//! Local persistence collaborator.
//!
//! The backend stores one opaque JSON blob. It imposes no schema; the cache
//! owns the `cache` subtree and leaves the rest alone.

use crate::error::{CacheError, CacheResult};
use async_trait::async_trait;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Mutex;

/// Opaque key/value blob storage provided by the host application.
#[async_trait]
pub trait PersistenceBackend: Send + Sync {
    /// Loads the whole blob. An empty store returns an empty object.
    async fn load_data(&self) -> CacheResult<Value>;

    /// Replaces the whole blob.
    async fn save_data(&self, data: Value) -> CacheResult<()>;
}

/// In-process backend, used by tests and by hosts without durable storage.
#[derive(Debug)]
pub struct MemoryBackend {
    data: Mutex<Value>,
    saves: AtomicUsize,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::with_data(Value::Object(Default::default()))
    }

    /// Starts from an existing blob.
    pub fn with_data(data: Value) -> Self {
        Self {
            data: Mutex::new(data),
            saves: AtomicUsize::new(0),
        }
    }

    /// Number of `save_data` calls so far.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    /// Returns a copy of the current blob.
    pub async fn snapshot(&self) -> Value {
        self.data.lock().await.clone()
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PersistenceBackend for MemoryBackend {
    async fn load_data(&self) -> CacheResult<Value> {
        Ok(self.data.lock().await.clone())
    }

    async fn save_data(&self, data: Value) -> CacheResult<()> {
        *self.data.lock().await = data;
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Stores the blob as a JSON file.
///
/// Writes go to a sibling temp file first and are renamed into place, so a
/// crash mid-write leaves the previous blob intact.
#[derive(Debug, Clone)]
pub struct JsonFileBackend {
    path: PathBuf,
}

impl JsonFileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl PersistenceBackend for JsonFileBackend {
    async fn load_data(&self) -> CacheResult<Value> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) if contents.trim().is_empty() => Ok(Value::Object(Default::default())),
            Ok(contents) => {
                let value: Value = serde_json::from_str(&contents)?;
                if !value.is_object() {
                    return Err(CacheError::InvalidData(format!(
                        "{} does not contain a JSON object",
                        self.path.display()
                    )));
                }
                Ok(value)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Ok(Value::Object(Default::default()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn save_data(&self, data: Value) -> CacheResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let bytes = serde_json::to_vec_pretty(&data)?;
        let temp = self.temp_path();
        tokio::fs::write(&temp, bytes).await?;
        tokio::fs::rename(&temp, &self.path).await?;
        Ok(())
    }
}
