//! Local key/value cache used for the last-sequence watermark, the unlocked
//! device key, and the shard-header cache (§4.5, §4.6, §6).
//!
//! This is process-local scratch state, distinct from the manifest and
//! shard files that the sync protocol actually converges on (§2 "no shared
//! mutable state beyond the manifest and shard files").

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;

#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Option<Vec<u8>>;
    async fn set(&self, key: &str, value: Vec<u8>);
    async fn remove(&self, key: &str);
}

/// The default cache: an in-process map, good enough for a CLI run or a
/// single long-lived server process. A persistent variant (sled, a flat
/// file) would implement the same trait without touching callers.
#[derive(Default)]
pub struct InMemoryCacheStore {
    entries: RwLock<HashMap<String, Vec<u8>>>,
}

impl InMemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheStore for InMemoryCacheStore {
    async fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.entries.read().get(key).cloned()
    }

    async fn set(&self, key: &str, value: Vec<u8>) {
        self.entries.write().insert(key.to_string(), value);
    }

    async fn remove(&self, key: &str) {
        self.entries.write().remove(key);
    }
}

/// Cache key under which the shard manager's most recently fetched header
/// cache entry for `filename` is stored.
pub fn shard_header_key(filename: &str) -> String {
    format!("shard-header/{filename}")
}

/// Cache key for the device's local last-sequence watermark (§3, §7).
pub const LAST_SEQUENCE_KEY: &str = "last-sequence";
