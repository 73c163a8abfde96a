//! Engine configuration, read from `taskmesh.toml`.

use crate::error::SyncResult;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{info, warn};

/// Top-level configuration. Every field has a default, so an empty file is valid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Version stamped on cache entries. Bumping it invalidates every entry.
    pub schema_version: u32,
    /// Lifetime of cached source items. `0` disables expiry, as does a value
    /// too large to represent.
    pub cache_ttl_secs: Option<u64>,
    /// Pagination cap per sub-resource.
    pub max_pages_per_sub_resource: usize,
    pub fetch_timeout_ms: u64,
    pub write_timeout_ms: u64,
    /// Per-source overrides keyed by extension id.
    pub sources: BTreeMap<String, SourceOverrides>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            schema_version: 1,
            cache_ttl_secs: Some(3600),
            max_pages_per_sub_resource: 50,
            fetch_timeout_ms: 30_000,
            write_timeout_ms: 10_000,
            sources: BTreeMap::new(),
        }
    }
}

/// `[sources.<extension_id>]` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceOverrides {
    pub enabled: bool,
    pub max_pages: Option<usize>,
    pub cache_ttl_secs: Option<u64>,
}

impl Default for SourceOverrides {
    fn default() -> Self {
        Self {
            enabled: true,
            max_pages: None,
            cache_ttl_secs: None,
        }
    }
}

/// Effective settings for one source after applying overrides.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceSettings {
    pub enabled: bool,
    pub max_pages: usize,
    pub cache_ttl: Option<chrono::Duration>,
    pub fetch_timeout_ms: u64,
    pub schema_version: u32,
}

impl SyncConfig {
    /// Parses a TOML document. Unlike [`SyncConfig::load_from`], errors are returned.
    pub fn from_toml_str(contents: &str) -> SyncResult<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Loads the config at `path`, falling back to defaults when the file
    /// is missing or unreadable.
    pub fn load_from(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        if !path.exists() {
            info!("No config file found at {:?}, using defaults", path);
            return Self::default();
        }

        match std::fs::read_to_string(path) {
            Ok(contents) => match Self::from_toml_str(&contents) {
                Ok(config) => {
                    info!("Loaded config from {:?}", path);
                    config
                }
                Err(e) => {
                    warn!("Failed to parse config file {:?}: {}. Using defaults.", path, e);
                    Self::default()
                }
            },
            Err(e) => {
                warn!("Failed to read config file {:?}: {}", path, e);
                Self::default()
            }
        }
    }

    /// Resolves the settings for `extension_id`.
    pub fn for_source(&self, extension_id: &str) -> SourceSettings {
        let overrides = self.sources.get(extension_id).cloned().unwrap_or_default();
        let ttl_secs = overrides.cache_ttl_secs.or(self.cache_ttl_secs);
        SourceSettings {
            enabled: overrides.enabled,
            max_pages: overrides
                .max_pages
                .unwrap_or(self.max_pages_per_sub_resource)
                .max(1),
            cache_ttl: ttl_secs
                .filter(|secs| *secs > 0)
                .and_then(|secs| i64::try_from(secs).ok())
                .and_then(chrono::Duration::try_seconds),
            fetch_timeout_ms: self.fetch_timeout_ms,
            schema_version: self.schema_version,
        }
    }
}
