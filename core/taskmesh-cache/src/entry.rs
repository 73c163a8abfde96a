use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A cached value with its freshness metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry<T> {
    pub data: T,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    pub version: u32,
}

impl<T> CacheEntry<T> {
    /// Creates an entry written at `now`, expiring after `ttl` if one is given.
    /// A `ttl` that reaches past the representable range never expires.
    pub fn new(data: T, version: u32, now: DateTime<Utc>, ttl: Option<chrono::Duration>) -> Self {
        Self {
            data,
            timestamp: now,
            expires_at: ttl.and_then(|ttl| now.checked_add_signed(ttl)),
            version,
        }
    }

    /// An entry is usable iff its version matches and it has not expired.
    pub fn is_valid(&self, current_version: u32, now: DateTime<Utc>) -> bool {
        self.version == current_version && self.expires_at.is_none_or(|expires| now < expires)
    }
}
