//! Cache decorators
//!
//! Each decorator wraps another [`Cache`] and adds one concern: bounded
//! eviction (LRU, FIFO), reference-based eviction (weak/soft), scheduled
//! clearing, per-key miss collapsing (blocking), serialization, hit-ratio
//! logging, and coarse synchronization.

use async_trait::async_trait;
use sqlweave_rdbc::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use super::{Cache, CacheKey, CacheValue};
use crate::error::{Error, Result};

// ==================== LRU ====================

/// Bounds the delegate at `capacity` entries, evicting the least recently
/// used key on overflow. Reads refresh recency.
pub struct LruCache {
    delegate: Arc<dyn Cache>,
    capacity: usize,
    order: parking_lot::Mutex<indexmap::IndexMap<CacheKey, ()>>,
}

impl LruCache {
    /// Wrap a delegate with an LRU bound
    pub fn new(delegate: Arc<dyn Cache>, capacity: usize) -> Self {
        Self {
            delegate,
            capacity: capacity.max(1),
            order: parking_lot::Mutex::new(indexmap::IndexMap::new()),
        }
    }

    fn record_insert(&self, key: &CacheKey) -> Option<CacheKey> {
        let mut order = self.order.lock();
        order.shift_remove(key);
        order.insert(key.clone(), ());
        if order.len() > self.capacity {
            // shift_remove_index keeps the remaining order intact
            order.shift_remove_index(0).map(|(k, ())| k)
        } else {
            None
        }
    }

    fn record_access(&self, key: &CacheKey) {
        let mut order = self.order.lock();
        if order.shift_remove(key).is_some() {
            order.insert(key.clone(), ());
        }
    }
}

#[async_trait]
impl Cache for LruCache {
    fn id(&self) -> &str {
        self.delegate.id()
    }

    async fn put(&self, key: CacheKey, value: CacheValue) -> Result<()> {
        let evicted = self.record_insert(&key);
        self.delegate.put(key, value).await?;
        if let Some(eldest) = evicted {
            self.delegate.remove(&eldest).await?;
        }
        Ok(())
    }

    async fn get(&self, key: &CacheKey) -> Result<Option<CacheValue>> {
        self.record_access(key);
        self.delegate.get(key).await
    }

    async fn remove(&self, key: &CacheKey) -> Result<()> {
        self.order.lock().shift_remove(key);
        self.delegate.remove(key).await
    }

    async fn clear(&self) -> Result<()> {
        self.order.lock().clear();
        self.delegate.clear().await
    }

    async fn size(&self) -> usize {
        self.delegate.size().await
    }
}

// ==================== FIFO ====================

/// Bounds the delegate at `capacity` entries, evicting in insertion order.
pub struct FifoCache {
    delegate: Arc<dyn Cache>,
    capacity: usize,
    queue: parking_lot::Mutex<VecDeque<CacheKey>>,
}

impl FifoCache {
    /// Wrap a delegate with a FIFO bound
    pub fn new(delegate: Arc<dyn Cache>, capacity: usize) -> Self {
        Self {
            delegate,
            capacity: capacity.max(1),
            queue: parking_lot::Mutex::new(VecDeque::new()),
        }
    }
}

#[async_trait]
impl Cache for FifoCache {
    fn id(&self) -> &str {
        self.delegate.id()
    }

    async fn put(&self, key: CacheKey, value: CacheValue) -> Result<()> {
        let evicted = {
            let mut queue = self.queue.lock();
            if !queue.contains(&key) {
                queue.push_back(key.clone());
            }
            if queue.len() > self.capacity {
                queue.pop_front()
            } else {
                None
            }
        };
        self.delegate.put(key, value).await?;
        if let Some(head) = evicted {
            self.delegate.remove(&head).await?;
        }
        Ok(())
    }

    async fn get(&self, key: &CacheKey) -> Result<Option<CacheValue>> {
        self.delegate.get(key).await
    }

    async fn remove(&self, key: &CacheKey) -> Result<()> {
        self.queue.lock().retain(|k| k != key);
        self.delegate.remove(key).await
    }

    async fn clear(&self) -> Result<()> {
        self.queue.lock().clear();
        self.delegate.clear().await
    }

    async fn size(&self) -> usize {
        self.delegate.size().await
    }
}

// ==================== Scheduled ====================

/// Clears the delegate whenever an access finds the clear interval elapsed.
/// Reads that trigger the clear observe the empty cache.
pub struct ScheduledCache {
    delegate: Arc<dyn Cache>,
    interval: Duration,
    last_clear: parking_lot::Mutex<Instant>,
}

impl ScheduledCache {
    /// Wrap a delegate with an interval clear
    pub fn new(delegate: Arc<dyn Cache>, interval: Duration) -> Self {
        Self {
            delegate,
            interval,
            last_clear: parking_lot::Mutex::new(Instant::now()),
        }
    }

    async fn clear_when_stale(&self) -> Result<bool> {
        let stale = {
            let mut last = self.last_clear.lock();
            if last.elapsed() > self.interval {
                *last = Instant::now();
                true
            } else {
                false
            }
        };
        if stale {
            self.delegate.clear().await?;
        }
        Ok(stale)
    }
}

#[async_trait]
impl Cache for ScheduledCache {
    fn id(&self) -> &str {
        self.delegate.id()
    }

    async fn put(&self, key: CacheKey, value: CacheValue) -> Result<()> {
        self.clear_when_stale().await?;
        self.delegate.put(key, value).await
    }

    async fn get(&self, key: &CacheKey) -> Result<Option<CacheValue>> {
        if self.clear_when_stale().await? {
            return Ok(None);
        }
        self.delegate.get(key).await
    }

    async fn remove(&self, key: &CacheKey) -> Result<()> {
        self.clear_when_stale().await?;
        self.delegate.remove(key).await
    }

    async fn clear(&self) -> Result<()> {
        *self.last_clear.lock() = Instant::now();
        self.delegate.clear().await
    }

    async fn size(&self) -> usize {
        self.delegate.size().await
    }
}

// ==================== Weak / Soft ====================

/// Stores weak references, protecting the last `retention` read values with
/// hard references so hot entries survive. Dead entries are swept on every
/// mutating operation. The soft variant is this store with a larger ring.
pub struct WeakCache {
    delegate: Arc<dyn Cache>,
    retention: usize,
    store: parking_lot::Mutex<WeakStore>,
}

#[derive(Default)]
struct WeakStore {
    entries: HashMap<CacheKey, Weak<Value>>,
    hard: VecDeque<Arc<Value>>,
}

impl WeakCache {
    /// Wrap a delegate's identity with a weak-reference store
    pub fn new(delegate: Arc<dyn Cache>, retention: usize) -> Self {
        Self {
            delegate,
            retention,
            store: parking_lot::Mutex::new(WeakStore::default()),
        }
    }

    fn sweep(store: &mut WeakStore) {
        store.entries.retain(|_, weak| weak.strong_count() > 0);
    }
}

#[async_trait]
impl Cache for WeakCache {
    fn id(&self) -> &str {
        self.delegate.id()
    }

    async fn put(&self, key: CacheKey, value: CacheValue) -> Result<()> {
        let mut store = self.store.lock();
        Self::sweep(&mut store);
        store.entries.insert(key, Arc::downgrade(&value));
        store.hard.push_back(value);
        while store.hard.len() > self.retention {
            store.hard.pop_front();
        }
        Ok(())
    }

    async fn get(&self, key: &CacheKey) -> Result<Option<CacheValue>> {
        let mut store = self.store.lock();
        match store.entries.get(key).and_then(Weak::upgrade) {
            Some(value) => {
                store.hard.push_back(value.clone());
                while store.hard.len() > self.retention {
                    store.hard.pop_front();
                }
                Ok(Some(value))
            }
            None => {
                store.entries.remove(key);
                Ok(None)
            }
        }
    }

    async fn remove(&self, key: &CacheKey) -> Result<()> {
        let mut store = self.store.lock();
        store.entries.remove(key);
        Self::sweep(&mut store);
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        let mut store = self.store.lock();
        store.entries.clear();
        store.hard.clear();
        Ok(())
    }

    async fn size(&self) -> usize {
        let store = self.store.lock();
        store
            .entries
            .values()
            .filter(|w| w.strong_count() > 0)
            .count()
    }
}

// ==================== Blocking ====================

/// Acquires a per-key lock on `get`. A miss keeps the lock so concurrent
/// readers of the same key wait for the loader's `put` (or `remove`) instead
/// of hitting the database themselves.
pub struct BlockingCache {
    delegate: Arc<dyn Cache>,
    timeout: Option<Duration>,
    locks: parking_lot::Mutex<HashMap<CacheKey, Arc<tokio::sync::Mutex<()>>>>,
    held: parking_lot::Mutex<HashMap<CacheKey, tokio::sync::OwnedMutexGuard<()>>>,
}

impl BlockingCache {
    /// Wrap a delegate with per-key miss collapsing
    pub fn new(delegate: Arc<dyn Cache>, timeout: Option<Duration>) -> Self {
        Self {
            delegate,
            timeout,
            locks: parking_lot::Mutex::new(HashMap::new()),
            held: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    fn lock_for(&self, key: &CacheKey) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .entry(key.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn release(&self, key: &CacheKey) {
        self.held.lock().remove(key);
    }
}

#[async_trait]
impl Cache for BlockingCache {
    fn id(&self) -> &str {
        self.delegate.id()
    }

    async fn put(&self, key: CacheKey, value: CacheValue) -> Result<()> {
        let result = self.delegate.put(key.clone(), value).await;
        self.release(&key);
        result
    }

    async fn get(&self, key: &CacheKey) -> Result<Option<CacheValue>> {
        let lock = self.lock_for(key);
        let guard = match self.timeout {
            Some(timeout) => tokio::time::timeout(timeout, lock.lock_owned())
                .await
                .map_err(|_| {
                    Error::cache_lock_timeout(format!(
                        "could not acquire cache lock for key within {timeout:?}"
                    ))
                })?,
            None => lock.lock_owned().await,
        };
        let value = self.delegate.get(key).await?;
        if value.is_some() {
            drop(guard);
        } else {
            // Hold the lock until this caller's put or remove.
            self.held.lock().insert(key.clone(), guard);
        }
        Ok(value)
    }

    async fn remove(&self, key: &CacheKey) -> Result<()> {
        // Only releases the lock; entries are not removed through the
        // blocking layer.
        self.release(key);
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.delegate.clear().await
    }

    async fn size(&self) -> usize {
        self.delegate.size().await
    }
}

// ==================== Serialized ====================

/// Serializes entries on `put` and deserializes on `get`, so every reader
/// gets a private copy of the cached value.
pub struct SerializedCache {
    delegate: Arc<dyn Cache>,
}

impl SerializedCache {
    /// Wrap a delegate with serialization
    pub fn new(delegate: Arc<dyn Cache>) -> Self {
        Self { delegate }
    }
}

#[async_trait]
impl Cache for SerializedCache {
    fn id(&self) -> &str {
        self.delegate.id()
    }

    async fn put(&self, key: CacheKey, value: CacheValue) -> Result<()> {
        let bytes = serde_json::to_vec(&*value)
            .map_err(|e| Error::conversion(format!("value is not serializable: {e}")))?;
        self.delegate
            .put(key, Arc::new(Value::Bytes(bytes)))
            .await
    }

    async fn get(&self, key: &CacheKey) -> Result<Option<CacheValue>> {
        match self.delegate.get(key).await? {
            Some(stored) => match &*stored {
                Value::Bytes(bytes) => {
                    let value: Value = serde_json::from_slice(bytes).map_err(|e| {
                        Error::conversion(format!("cached value failed to deserialize: {e}"))
                    })?;
                    Ok(Some(Arc::new(value)))
                }
                _ => Err(Error::conversion("cached value is not serialized bytes")),
            },
            None => Ok(None),
        }
    }

    async fn remove(&self, key: &CacheKey) -> Result<()> {
        self.delegate.remove(key).await
    }

    async fn clear(&self) -> Result<()> {
        self.delegate.clear().await
    }

    async fn size(&self) -> usize {
        self.delegate.size().await
    }
}

// ==================== Logging ====================

/// Counts requests and hits and logs the running hit ratio.
pub struct LoggingCache {
    delegate: Arc<dyn Cache>,
    requests: AtomicU64,
    hits: AtomicU64,
}

impl LoggingCache {
    /// Wrap a delegate with hit-ratio logging
    pub fn new(delegate: Arc<dyn Cache>) -> Self {
        Self {
            delegate,
            requests: AtomicU64::new(0),
            hits: AtomicU64::new(0),
        }
    }

    /// Hit ratio so far
    pub fn hit_ratio(&self) -> f64 {
        let requests = self.requests.load(Ordering::Relaxed);
        if requests == 0 {
            0.0
        } else {
            self.hits.load(Ordering::Relaxed) as f64 / requests as f64
        }
    }
}

#[async_trait]
impl Cache for LoggingCache {
    fn id(&self) -> &str {
        self.delegate.id()
    }

    async fn put(&self, key: CacheKey, value: CacheValue) -> Result<()> {
        self.delegate.put(key, value).await
    }

    async fn get(&self, key: &CacheKey) -> Result<Option<CacheValue>> {
        let requests = self.requests.fetch_add(1, Ordering::Relaxed) + 1;
        let value = self.delegate.get(key).await?;
        if value.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }
        debug!(
            cache = self.id(),
            requests,
            ratio = self.hit_ratio(),
            "cache lookup"
        );
        Ok(value)
    }

    async fn remove(&self, key: &CacheKey) -> Result<()> {
        self.delegate.remove(key).await
    }

    async fn clear(&self) -> Result<()> {
        self.delegate.clear().await
    }

    async fn size(&self) -> usize {
        self.delegate.size().await
    }
}

// ==================== Synchronized ====================

/// Coarse mutex over every operation; the outermost shared layer.
pub struct SynchronizedCache {
    delegate: Arc<dyn Cache>,
    mutex: tokio::sync::Mutex<()>,
}

impl SynchronizedCache {
    /// Wrap a delegate with coarse synchronization
    pub fn new(delegate: Arc<dyn Cache>) -> Self {
        Self {
            delegate,
            mutex: tokio::sync::Mutex::new(()),
        }
    }
}

#[async_trait]
impl Cache for SynchronizedCache {
    fn id(&self) -> &str {
        self.delegate.id()
    }

    async fn put(&self, key: CacheKey, value: CacheValue) -> Result<()> {
        let _guard = self.mutex.lock().await;
        self.delegate.put(key, value).await
    }

    async fn get(&self, key: &CacheKey) -> Result<Option<CacheValue>> {
        let _guard = self.mutex.lock().await;
        self.delegate.get(key).await
    }

    async fn remove(&self, key: &CacheKey) -> Result<()> {
        let _guard = self.mutex.lock().await;
        self.delegate.remove(key).await
    }

    async fn clear(&self) -> Result<()> {
        let _guard = self.mutex.lock().await;
        self.delegate.clear().await
    }

    async fn size(&self) -> usize {
        let _guard = self.mutex.lock().await;
        self.delegate.size().await
    }
}
