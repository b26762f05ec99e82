//! Ephemeral state cache: version-checked fast read path.
//!
//! The cache is latency, not durability: an entry either equals the
//! committed state at some version or is absent, never ahead of the store.
//! Eviction is allowed at any moment and correctness never depends on
//! presence; on a miss the Repository reloads from snapshot + events.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::error::Result;

/// A cached `(version, state)` pair for one workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedState {
    pub version: i64,
    pub state: Value,
}

/// Key-value map from workflow key to versioned state with optimistic put.
///
/// Any ordered KV offering compare-and-set works; the crate ships an
/// in-process implementation, and out-of-process stores (e.g. a NATS KV
/// bucket) plug in behind this trait.
#[async_trait]
pub trait StateCache: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<CachedState>>;

    /// Store `value` if the current entry is absent or its version equals
    /// `expected_version`. Returns false when the CAS lost; the caller is
    /// expected to delete the entry so stale readers reload from the store.
    async fn put_if_version(
        &self,
        key: &str,
        expected_version: i64,
        value: CachedState,
    ) -> Result<bool>;

    async fn delete(&self, key: &str) -> Result<()>;
}

/// In-process cache. Cheap to clone; clones share the same map.
#[derive(Clone, Default)]
pub struct MemoryStateCache {
    entries: Arc<Mutex<HashMap<String, CachedState>>>,
}

impl MemoryStateCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateCache for MemoryStateCache {
    async fn get(&self, key: &str) -> Result<Option<CachedState>> {
        let entries = self.entries.lock().await;
        Ok(entries.get(key).cloned())
    }

    async fn put_if_version(
        &self,
        key: &str,
        expected_version: i64,
        value: CachedState,
    ) -> Result<bool> {
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some(existing) if existing.version != expected_version => Ok(false),
            _ => {
                entries.insert(key.to_owned(), value);
                Ok(true)
            }
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.lock().await;
        entries.remove(key);
        Ok(())
    }
}
