//! Transactional cache manager
//!
//! Second-tier cache writes are staged per session and only become visible
//! to other sessions at commit. Reads pass through to the shared cache;
//! misses are tracked so rollback can release blocking-cache locks taken by
//! failed reads.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

use super::{Cache, CacheKey, CacheValue};
use crate::error::Result;

/// Per-session staging over one shared cache
struct TransactionalCache {
    delegate: Arc<dyn Cache>,
    clear_on_commit: bool,
    entries_to_add: HashMap<CacheKey, CacheValue>,
    entries_to_remove: HashSet<CacheKey>,
    entries_missed: HashSet<CacheKey>,
}

impl TransactionalCache {
    fn new(delegate: Arc<dyn Cache>) -> Self {
        Self {
            delegate,
            clear_on_commit: false,
            entries_to_add: HashMap::new(),
            entries_to_remove: HashSet::new(),
            entries_missed: HashSet::new(),
        }
    }

    async fn get(&mut self, key: &CacheKey) -> Result<Option<CacheValue>> {
        let value = self.delegate.get(key).await?;
        if value.is_none() {
            self.entries_missed.insert(key.clone());
        }
        // A staged clear hides shared entries from this session too.
        if self.clear_on_commit {
            return Ok(None);
        }
        Ok(value)
    }

    fn put(&mut self, key: CacheKey, value: CacheValue) {
        self.entries_to_remove.remove(&key);
        self.entries_to_add.insert(key, value);
    }

    fn remove(&mut self, key: CacheKey) {
        self.entries_to_add.remove(&key);
        self.entries_to_remove.insert(key);
    }

    fn clear(&mut self) {
        self.clear_on_commit = true;
        self.entries_to_add.clear();
    }

    async fn commit(&mut self) -> Result<()> {
        if self.clear_on_commit {
            self.delegate.clear().await?;
        }
        for key in self.entries_to_remove.drain() {
            self.delegate.remove(&key).await?;
        }
        for (key, value) in self.entries_to_add.drain() {
            self.delegate.put(key.clone(), value).await?;
            self.entries_missed.remove(&key);
        }
        // Misses that were never satisfied still hold blocking locks.
        for key in self.entries_missed.drain() {
            self.delegate.remove(&key).await?;
        }
        self.clear_on_commit = false;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        self.entries_to_add.clear();
        self.entries_to_remove.clear();
        self.clear_on_commit = false;
        for key in self.entries_missed.drain() {
            self.delegate.remove(&key).await?;
        }
        Ok(())
    }
}

/// Buffers second-tier writes for every cache a session touches.
#[derive(Default)]
pub struct TransactionalCacheManager {
    caches: HashMap<String, TransactionalCache>,
}

impl TransactionalCacheManager {
    /// Create an empty manager
    pub fn new() -> Self {
        Self::default()
    }

    fn staging(&mut self, cache: &Arc<dyn Cache>) -> &mut TransactionalCache {
        self.caches
            .entry(cache.id().to_string())
            .or_insert_with(|| TransactionalCache::new(cache.clone()))
    }

    /// Read through the shared cache, tracking misses
    pub async fn get(&mut self, cache: &Arc<dyn Cache>, key: &CacheKey) -> Result<Option<CacheValue>> {
        self.staging(cache).get(key).await
    }

    /// Stage a write for commit
    pub fn put(&mut self, cache: &Arc<dyn Cache>, key: CacheKey, value: CacheValue) {
        self.staging(cache).put(key, value);
    }

    /// Stage a removal for commit
    pub fn remove(&mut self, cache: &Arc<dyn Cache>, key: CacheKey) {
        self.staging(cache).remove(key);
    }

    /// Stage a full clear for commit
    pub fn clear(&mut self, cache: &Arc<dyn Cache>) {
        self.staging(cache).clear();
    }

    /// Flush all staged changes to the shared caches
    pub async fn commit(&mut self) -> Result<()> {
        debug!(caches = self.caches.len(), "committing staged cache changes");
        for staging in self.caches.values_mut() {
            staging.commit().await?;
        }
        Ok(())
    }

    /// Discard staged changes, releasing any blocking locks held by misses
    pub async fn rollback(&mut self) -> Result<()> {
        for staging in self.caches.values_mut() {
            staging.rollback().await?;
        }
        Ok(())
    }
}
