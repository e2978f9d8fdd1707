//! Pooled data source
//!
//! A bounded broker over the unpooled source. Connections are wrapped; a
//! wrapper's `close` returns the underlying connection to the pool instead of
//! the driver. When every slot is checked out, the oldest active wrapper past
//! its checkout deadline is reclaimed and its underlying connection reused.
//!
//! All pool state lives under one async mutex; waiters park on a
//! [`tokio::sync::Notify`] and are woken one at a time on release.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::driver::{Connection, DataSource, IsolationLevel, Statement, StatementOptions};
use crate::error::{Error, Result};
use crate::unpooled::UnpooledDataSource;

/// Pool configuration.
///
/// Changing parameters on a live pool requires [`PooledDataSource::apply_config`],
/// which force-closes everything so new settings take effect uniformly.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Connections that may be checked out at once
    pub max_active: usize,
    /// Reclaimed connections kept for reuse
    pub max_idle: usize,
    /// Checkout age after which an active connection may be claimed
    pub max_checkout_time: Duration,
    /// How long one acquire attempt waits before re-checking the pool
    pub time_to_wait: Duration,
    /// Extra bad connections tolerated per acquire beyond `max_idle`
    pub bad_connection_tolerance: usize,
    /// Validity-check query
    pub ping_query: String,
    /// Whether the ping query runs at all
    pub ping_enabled: bool,
    /// Only ping connections idle longer than this
    pub ping_not_used_for: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_active: 10,
            max_idle: 5,
            max_checkout_time: Duration::from_secs(20),
            time_to_wait: Duration::from_secs(20),
            bad_connection_tolerance: 3,
            ping_query: "NO PING QUERY SET".to_string(),
            ping_enabled: false,
            ping_not_used_for: Duration::ZERO,
        }
    }
}

impl PoolConfig {
    /// Set the maximum number of active connections
    pub fn with_max_active(mut self, n: usize) -> Self {
        self.max_active = n;
        self
    }

    /// Set the maximum number of idle connections
    pub fn with_max_idle(mut self, n: usize) -> Self {
        self.max_idle = n;
        self
    }

    /// Set the overdue-claim checkout deadline
    pub fn with_max_checkout_time(mut self, t: Duration) -> Self {
        self.max_checkout_time = t;
        self
    }

    /// Set the per-attempt wait time
    pub fn with_time_to_wait(mut self, t: Duration) -> Self {
        self.time_to_wait = t;
        self
    }

    /// Set the bad-connection tolerance
    pub fn with_bad_connection_tolerance(mut self, n: usize) -> Self {
        self.bad_connection_tolerance = n;
        self
    }

    /// Enable pinging with the given query
    pub fn with_ping(mut self, query: impl Into<String>, not_used_for: Duration) -> Self {
        self.ping_enabled = true;
        self.ping_query = query.into();
        self.ping_not_used_for = not_used_for;
        self
    }
}

/// Counters kept by the pool
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Connections handed out
    pub request_count: u64,
    /// Total time spent satisfying requests
    pub accumulated_request_time: Duration,
    /// Total time connections were checked out
    pub accumulated_checkout_time: Duration,
    /// Requests that had to wait for a slot
    pub had_to_wait_count: u64,
    /// Total time requests spent waiting
    pub accumulated_wait_time: Duration,
    /// Connections found invalid
    pub bad_connection_count: u64,
    /// Overdue active connections reclaimed
    pub claimed_overdue_count: u64,
    /// Currently active wrappers
    pub active: usize,
    /// Currently idle wrappers
    pub idle: usize,
}

/// One wrapper around a real connection.
///
/// The underlying connection can be taken out (overdue claim, release) while
/// a holder still owns the wrapper; such a wrapper is invalid and every
/// operation on it, including `close`, is a no-op or error.
struct PooledEntry {
    real: tokio::sync::Mutex<Option<Box<dyn Connection>>>,
    valid: AtomicBool,
    auto_commit: AtomicBool,
    product: String,
    token: u64,
    created_at: Instant,
    last_used_at: parking_lot::Mutex<Instant>,
    checkout_at: parking_lot::Mutex<Instant>,
}

impl PooledEntry {
    fn wrap(real: Box<dyn Connection>, token: u64) -> Arc<Self> {
        let now = Instant::now();
        Arc::new(Self {
            auto_commit: AtomicBool::new(real.is_auto_commit()),
            product: real.database_product().to_string(),
            real: tokio::sync::Mutex::new(Some(real)),
            valid: AtomicBool::new(true),
            token,
            created_at: now,
            last_used_at: parking_lot::Mutex::new(now),
            checkout_at: parking_lot::Mutex::new(now),
        })
    }

    fn is_valid_flag(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    fn invalidate(&self) {
        self.valid.store(false, Ordering::Release);
    }

    fn touch(&self) {
        *self.last_used_at.lock() = Instant::now();
    }

    fn mark_checkout(&self) {
        let now = Instant::now();
        *self.checkout_at.lock() = now;
        *self.last_used_at.lock() = now;
    }

    fn checkout_elapsed(&self) -> Duration {
        self.checkout_at.lock().elapsed()
    }

    fn idle_elapsed(&self) -> Duration {
        self.last_used_at.lock().elapsed()
    }

    async fn take_real(&self) -> Option<Box<dyn Connection>> {
        self.real.lock().await.take()
    }
}

#[derive(Default)]
struct PoolState {
    idle: VecDeque<Arc<PooledEntry>>,
    /// Active wrappers, earliest checkout first
    active: Vec<Arc<PooledEntry>>,
    request_count: u64,
    accumulated_request_time: Duration,
    accumulated_checkout_time: Duration,
    had_to_wait_count: u64,
    accumulated_wait_time: Duration,
    bad_connection_count: u64,
    claimed_overdue_count: u64,
}

struct PoolInner {
    factory: UnpooledDataSource,
    config: parking_lot::RwLock<PoolConfig>,
    state: tokio::sync::Mutex<PoolState>,
    available: Notify,
    expected_token: AtomicU64,
}

/// Bounded, shared connection pool over an [`UnpooledDataSource`].
#[derive(Clone)]
pub struct PooledDataSource {
    inner: Arc<PoolInner>,
}

fn connection_token(factory: &UnpooledDataSource) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    factory.url().hash(&mut hasher);
    factory.username().hash(&mut hasher);
    factory.password().hash(&mut hasher);
    hasher.finish()
}

impl PooledDataSource {
    /// Create a pool over a non-pooled factory with default parameters
    pub fn new(factory: UnpooledDataSource) -> Self {
        Self::with_config(factory, PoolConfig::default())
    }

    /// Create a pool with explicit parameters
    pub fn with_config(factory: UnpooledDataSource, config: PoolConfig) -> Self {
        let token = connection_token(&factory);
        Self {
            inner: Arc::new(PoolInner {
                factory,
                config: parking_lot::RwLock::new(config),
                state: tokio::sync::Mutex::new(PoolState::default()),
                available: Notify::new(),
                expected_token: AtomicU64::new(token),
            }),
        }
    }

    /// Snapshot pool counters
    pub async fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock().await;
        PoolStats {
            request_count: state.request_count,
            accumulated_request_time: state.accumulated_request_time,
            accumulated_checkout_time: state.accumulated_checkout_time,
            had_to_wait_count: state.had_to_wait_count,
            accumulated_wait_time: state.accumulated_wait_time,
            bad_connection_count: state.bad_connection_count,
            claimed_overdue_count: state.claimed_overdue_count,
            active: state.active.len(),
            idle: state.idle.len(),
        }
    }

    /// Current configuration
    pub fn config(&self) -> PoolConfig {
        self.inner.config.read().clone()
    }

    /// Replace the pool parameters. Everything outstanding is invalidated and
    /// every underlying connection is closed so the new parameters apply
    /// uniformly.
    pub async fn apply_config(&self, config: PoolConfig) {
        *self.inner.config.write() = config;
        self.force_close_all().await;
    }

    /// Invalidate all wrappers and close every underlying connection.
    pub async fn force_close_all(&self) {
        let token = connection_token(&self.inner.factory);
        self.inner.expected_token.store(token, Ordering::Release);

        let mut state = self.inner.state.lock().await;
        let mut entries: Vec<Arc<PooledEntry>> = state.active.drain(..).collect();
        entries.extend(state.idle.drain(..));
        drop(state);

        for entry in entries {
            entry.invalidate();
            if let Some(mut real) = entry.take_real().await {
                if !real.is_auto_commit() {
                    if let Err(e) = real.rollback().await {
                        warn!("rollback during force close failed: {e}");
                    }
                }
                if let Err(e) = real.close().await {
                    warn!("close during force close failed: {e}");
                }
            }
        }
        debug!("pool forcefully closed");
    }

    async fn pop_connection(&self) -> Result<PooledConnection> {
        let inner = &self.inner;
        let started = Instant::now();
        let mut bad_count: usize = 0;
        let mut counted_wait = false;

        loop {
            let config = inner.config.read().clone();
            let mut state = inner.state.lock().await;

            let candidate: Option<Arc<PooledEntry>> = if let Some(entry) = state.idle.pop_front()
            {
                debug!("checked out connection from idle list");
                Some(entry)
            } else if state.active.len() < config.max_active {
                let real = inner.factory.connection().await?;
                debug!("created new pooled connection");
                Some(PooledEntry::wrap(
                    real,
                    inner.expected_token.load(Ordering::Acquire),
                ))
            } else {
                let oldest = state.active[0].clone();
                let checkout_elapsed = oldest.checkout_elapsed();
                if checkout_elapsed > config.max_checkout_time {
                    // Claim the overdue connection; its holder keeps a dead
                    // wrapper whose close is a no-op.
                    state.claimed_overdue_count += 1;
                    state.accumulated_checkout_time += checkout_elapsed;
                    state.active.remove(0);
                    let real = oldest.take_real().await;
                    oldest.invalidate();
                    match real {
                        Some(mut real) => {
                            if !real.is_auto_commit() {
                                if let Err(e) = real.rollback().await {
                                    // A failed rollback leaves the connection
                                    // suspect; validation below decides.
                                    warn!("rollback of overdue connection failed: {e}");
                                }
                            }
                            debug!("claimed overdue connection");
                            Some(PooledEntry::wrap(
                                real,
                                inner.expected_token.load(Ordering::Acquire),
                            ))
                        }
                        None => None,
                    }
                } else {
                    if !counted_wait {
                        state.had_to_wait_count += 1;
                        counted_wait = true;
                    }
                    debug!("waiting up to {:?} for a connection", config.time_to_wait);
                    let notified = inner.available.notified();
                    tokio::pin!(notified);
                    notified.as_mut().enable();
                    drop(state);

                    let wait_started = Instant::now();
                    let _ = tokio::time::timeout(config.time_to_wait, notified).await;

                    let mut state = inner.state.lock().await;
                    state.accumulated_wait_time += wait_started.elapsed();
                    continue;
                }
            };

            let Some(entry) = candidate else {
                continue;
            };

            if self.validate(&entry, &config).await {
                {
                    let mut guard = entry.real.lock().await;
                    if let Some(real) = guard.as_mut() {
                        if !real.is_auto_commit() {
                            // Discard whatever transaction a previous holder
                            // left behind.
                            real.rollback().await?;
                        }
                    }
                }
                entry.mark_checkout();
                state.active.push(entry.clone());
                state.request_count += 1;
                state.accumulated_request_time += started.elapsed();
                return Ok(PooledConnection {
                    entry,
                    pool: inner.clone(),
                    returned: false,
                });
            }

            state.bad_connection_count += 1;
            bad_count += 1;
            if bad_count > config.max_idle + config.bad_connection_tolerance {
                warn!("could not get a good connection from the pool");
                return Err(Error::pool_exhausted(
                    "could not get a good connection to the database",
                ));
            }
        }
    }

    /// Real validity check: closed connections fail immediately; beyond that,
    /// connections idle past the ping threshold get the ping query.
    async fn validate(&self, entry: &PooledEntry, config: &PoolConfig) -> bool {
        if !entry.is_valid_flag() {
            return false;
        }
        let mut guard = entry.real.lock().await;
        let Some(real) = guard.as_mut() else {
            return false;
        };
        if real.is_closed() {
            return false;
        }
        if config.ping_enabled && entry.idle_elapsed() > config.ping_not_used_for {
            match real.ping(&config.ping_query).await {
                Ok(()) => true,
                Err(e) => {
                    warn!("ping failed, discarding connection: {e}");
                    let _ = real.close().await;
                    false
                }
            }
        } else {
            true
        }
    }
}

#[async_trait]
impl DataSource for PooledDataSource {
    async fn connection(&self) -> Result<Box<dyn Connection>> {
        Ok(Box::new(self.pop_connection().await?))
    }
}

async fn push_connection(pool: &Arc<PoolInner>, entry: &Arc<PooledEntry>) {
    let config = pool.config.read().clone();
    let mut state = pool.state.lock().await;
    state.active.retain(|e| !Arc::ptr_eq(e, entry));

    if !entry.is_valid_flag() {
        state.bad_connection_count += 1;
        return;
    }

    state.accumulated_checkout_time += entry.checkout_elapsed();
    let token_matches = entry.token == pool.expected_token.load(Ordering::Acquire);

    if state.idle.len() < config.max_idle && token_matches {
        let real = entry.take_real().await;
        entry.invalidate();
        if let Some(mut real) = real {
            if !real.is_auto_commit() {
                if let Err(e) = real.rollback().await {
                    warn!("rollback on release failed, closing connection: {e}");
                    let _ = real.close().await;
                    state.bad_connection_count += 1;
                    return;
                }
            }
            let fresh = PooledEntry::wrap(real, entry.token);
            state.idle.push_back(fresh);
            pool.available.notify_one();
            debug!("returned connection to idle list");
        }
    } else {
        let real = entry.take_real().await;
        entry.invalidate();
        if let Some(mut real) = real {
            if !real.is_auto_commit() {
                let _ = real.rollback().await;
            }
            let _ = real.close().await;
            debug!("closed surplus connection");
        }
        // Wake a waiter anyway: an active slot just freed up.
        pool.available.notify_one();
    }
}

/// A connection checked out of the pool.
///
/// `close` returns the underlying connection to the pool. A wrapper that was
/// invalidated (overdue claim, force close) ignores `close` and fails every
/// other operation.
pub struct PooledConnection {
    entry: Arc<PooledEntry>,
    pool: Arc<PoolInner>,
    returned: bool,
}

impl PooledConnection {
    fn check_valid(&self) -> Result<()> {
        if self.entry.is_valid_flag() {
            Ok(())
        } else {
            Err(Error::connection(
                "connection wrapper has been invalidated by the pool",
            ))
        }
    }
}

#[async_trait]
impl Connection for PooledConnection {
    fn is_auto_commit(&self) -> bool {
        self.entry.auto_commit.load(Ordering::Acquire)
    }

    async fn set_auto_commit(&mut self, on: bool) -> Result<()> {
        self.check_valid()?;
        let mut guard = self.entry.real.lock().await;
        let real = guard
            .as_mut()
            .ok_or_else(|| Error::connection("underlying connection reclaimed"))?;
        real.set_auto_commit(on).await?;
        self.entry.auto_commit.store(on, Ordering::Release);
        Ok(())
    }

    async fn set_isolation(&mut self, level: IsolationLevel) -> Result<()> {
        self.check_valid()?;
        let mut guard = self.entry.real.lock().await;
        let real = guard
            .as_mut()
            .ok_or_else(|| Error::connection("underlying connection reclaimed"))?;
        real.set_isolation(level).await
    }

    async fn commit(&mut self) -> Result<()> {
        self.check_valid()?;
        let mut guard = self.entry.real.lock().await;
        let real = guard
            .as_mut()
            .ok_or_else(|| Error::connection("underlying connection reclaimed"))?;
        real.commit().await
    }

    async fn rollback(&mut self) -> Result<()> {
        self.check_valid()?;
        let mut guard = self.entry.real.lock().await;
        let real = guard
            .as_mut()
            .ok_or_else(|| Error::connection("underlying connection reclaimed"))?;
        real.rollback().await
    }

    async fn close(&mut self) -> Result<()> {
        // A dead wrapper must not double-return its connection.
        if self.returned || !self.entry.is_valid_flag() {
            self.returned = true;
            return Ok(());
        }
        self.returned = true;
        push_connection(&self.pool, &self.entry).await;
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.returned || !self.entry.is_valid_flag()
    }

    async fn create_statement(
        &mut self,
        sql: &str,
        options: StatementOptions,
    ) -> Result<Box<dyn Statement>> {
        self.check_valid()?;
        self.entry.touch();
        let mut guard = self.entry.real.lock().await;
        let real = guard
            .as_mut()
            .ok_or_else(|| Error::connection("underlying connection reclaimed"))?;
        real.create_statement(sql, options).await
    }

    async fn ping(&mut self, sql: &str) -> Result<()> {
        self.check_valid()?;
        let mut guard = self.entry.real.lock().await;
        let real = guard
            .as_mut()
            .ok_or_else(|| Error::connection("underlying connection reclaimed"))?;
        real.ping(sql).await
    }

    fn database_product(&self) -> &str {
        &self.entry.product
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if !self.returned && self.entry.is_valid_flag() {
            let pool = self.pool.clone();
            let entry = self.entry.clone();
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    push_connection(&pool, &entry).await;
                });
            }
        }
    }
}
