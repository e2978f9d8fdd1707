//! Cache layers
//!
//! Every layer implements [`Cache`]; layers compose by decoration over a
//! plain hash-map store. Composition order is fixed: store, eviction policy,
//! optional blocking, optional serialization, logging, synchronization, and
//! an optional scheduled clear outermost. A cache's identity is the innermost
//! store's id, typically the mapping namespace.

pub mod decorators;
pub mod key;
pub mod transactional;

use async_trait::async_trait;
use sqlweave_rdbc::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;
pub use key::CacheKey;

/// A cached entry
pub type CacheValue = Arc<Value>;

/// One cache layer
#[async_trait]
pub trait Cache: Send + Sync {
    /// Cache identity; decorators delegate to the innermost store
    fn id(&self) -> &str;

    /// Store an entry
    async fn put(&self, key: CacheKey, value: CacheValue) -> Result<()>;

    /// Fetch an entry. Absence is not an error.
    async fn get(&self, key: &CacheKey) -> Result<Option<CacheValue>>;

    /// Drop an entry
    async fn remove(&self, key: &CacheKey) -> Result<()>;

    /// Drop everything
    async fn clear(&self) -> Result<()>;

    /// Number of stored entries
    async fn size(&self) -> usize;
}

/// The innermost store: a plain hash map
pub struct PerpetualCache {
    id: String,
    store: tokio::sync::Mutex<HashMap<CacheKey, CacheValue>>,
}

impl PerpetualCache {
    /// Create a store with the given identity
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            store: tokio::sync::Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl Cache for PerpetualCache {
    fn id(&self) -> &str {
        &self.id
    }

    async fn put(&self, key: CacheKey, value: CacheValue) -> Result<()> {
        self.store.lock().await.insert(key, value);
        Ok(())
    }

    async fn get(&self, key: &CacheKey) -> Result<Option<CacheValue>> {
        Ok(self.store.lock().await.get(key).cloned())
    }

    async fn remove(&self, key: &CacheKey) -> Result<()> {
        self.store.lock().await.remove(key);
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.store.lock().await.clear();
        Ok(())
    }

    async fn size(&self) -> usize {
        self.store.lock().await.len()
    }
}

/// Eviction policies a namespace cache can declare
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionPolicy {
    /// Least-recently-used, bounded
    Lru,
    /// Insertion order, bounded
    Fifo,
    /// Weak references with a small hot-entry retention ring
    Weak,
    /// Weak references with a large hot-entry retention ring
    Soft,
}

impl EvictionPolicy {
    /// Parse from mapping-markup spelling
    pub fn parse(name: &str) -> Option<Self> {
        Some(match name.to_ascii_uppercase().as_str() {
            "LRU" => Self::Lru,
            "FIFO" => Self::Fifo,
            "WEAK" => Self::Weak,
            "SOFT" => Self::Soft,
            _ => return None,
        })
    }
}

/// Builds a namespace cache with the fixed decoration order.
pub struct CacheBuilder {
    id: String,
    eviction: EvictionPolicy,
    capacity: usize,
    clear_interval: Option<Duration>,
    read_write: bool,
    blocking: bool,
    blocking_timeout: Option<Duration>,
}

impl CacheBuilder {
    /// Start building a cache for a namespace
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            eviction: EvictionPolicy::Lru,
            capacity: 1024,
            clear_interval: None,
            read_write: false,
            blocking: false,
            blocking_timeout: None,
        }
    }

    /// Choose the eviction policy
    pub fn eviction(mut self, policy: EvictionPolicy) -> Self {
        self.eviction = policy;
        self
    }

    /// Bound the cache size (LRU/FIFO)
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Clear on a schedule
    pub fn clear_interval(mut self, interval: Duration) -> Self {
        self.clear_interval = Some(interval);
        self
    }

    /// Serialize entries so readers get copies (read/write cache)
    pub fn read_write(mut self, on: bool) -> Self {
        self.read_write = on;
        self
    }

    /// Collapse concurrent misses per key
    pub fn blocking(mut self, on: bool) -> Self {
        self.blocking = on;
        self
    }

    /// Fail blocked readers after this long
    pub fn blocking_timeout(mut self, timeout: Duration) -> Self {
        self.blocking_timeout = Some(timeout);
        self
    }

    /// Compose the cache
    pub fn build(self) -> Arc<dyn Cache> {
        use decorators::*;

        let store: Arc<dyn Cache> = Arc::new(PerpetualCache::new(self.id));
        let mut cache: Arc<dyn Cache> = match self.eviction {
            EvictionPolicy::Lru => Arc::new(LruCache::new(store, self.capacity)),
            EvictionPolicy::Fifo => Arc::new(FifoCache::new(store, self.capacity)),
            EvictionPolicy::Weak => Arc::new(WeakCache::new(store, 16)),
            EvictionPolicy::Soft => Arc::new(WeakCache::new(store, 256)),
        };
        if self.blocking {
            cache = Arc::new(BlockingCache::new(cache, self.blocking_timeout));
        }
        if self.read_write {
            cache = Arc::new(SerializedCache::new(cache));
        }
        cache = Arc::new(LoggingCache::new(cache));
        cache = Arc::new(SynchronizedCache::new(cache));
        if let Some(interval) = self.clear_interval {
            cache = Arc::new(ScheduledCache::new(cache, interval));
        }
        cache
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(n: i64) -> CacheKey {
        let mut k = CacheKey::new();
        k.update(Value::from(n));
        k
    }

    #[tokio::test]
    async fn perpetual_put_get_remove() {
        let cache = PerpetualCache::new("ns");
        assert_eq!(cache.id(), "ns");

        cache.put(key(1), Arc::new(Value::from("v"))).await.unwrap();
        assert_eq!(
            cache.get(&key(1)).await.unwrap(),
            Some(Arc::new(Value::from("v")))
        );
        assert_eq!(cache.size().await, 1);

        cache.remove(&key(1)).await.unwrap();
        assert_eq!(cache.get(&key(1)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn builder_composes_a_working_cache() {
        let cache = CacheBuilder::new("ns")
            .eviction(EvictionPolicy::Lru)
            .capacity(8)
            .read_write(true)
            .build();

        assert_eq!(cache.id(), "ns");
        cache.put(key(1), Arc::new(Value::from(10_i64))).await.unwrap();
        let got = cache.get(&key(1)).await.unwrap().unwrap();
        assert_eq!(*got, Value::from(10_i64));
        cache.clear().await.unwrap();
        assert_eq!(cache.get(&key(1)).await.unwrap(), None);
    }
}
