//! Executors
//!
//! The driver of statement execution, caching, and batching for a session.
//! One [`Executor`] trait carries the shared pipeline as default methods
//! (local cache, cache-key construction, deferred loads, commit/rollback
//! plumbing); variants implement `do_query`/`do_update`/`do_flush`. The
//! caching variant decorates another executor with the namespace cache.

pub mod batch;
pub mod caching;
pub mod keygen;
pub mod resultset;
pub mod reuse;
pub mod simple;
pub mod statement;

use async_trait::async_trait;
use sqlweave_rdbc::transaction::Transaction;
use sqlweave_rdbc::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::debug;

use crate::cache::CacheKey;
use crate::config::{Configuration, ExecutorType, LocalCacheScope};
use crate::error::{Error, ErrorKind, Result};
use crate::mapping::{BoundSql, KeyGeneratorKind, MappedStatement, ParameterMode};
use crate::meta::path;

/// Row range applied to query results
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowBounds {
    /// Rows skipped before the first materialized row
    pub offset: usize,
    /// Maximum rows materialized
    pub limit: usize,
}

impl Default for RowBounds {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: usize::MAX,
        }
    }
}

impl RowBounds {
    /// A bounded range
    pub fn new(offset: usize, limit: usize) -> Self {
        Self { offset, limit }
    }

    /// Whether this is the unbounded default
    pub fn is_default(&self) -> bool {
        self.offset == 0 && self.limit == usize::MAX
    }
}

/// Receives each produced result object; the default handler collects a list
pub trait ResultHandler: Send {
    /// Handle one result object
    fn handle(&mut self, object: &Value);
}

impl<F: FnMut(&Value) + Send> ResultHandler for F {
    fn handle(&mut self, object: &Value) {
        self(object)
    }
}

/// Outcome of one batched statement group
#[derive(Debug, Clone)]
pub struct BatchResult {
    /// Statement id the group belongs to
    pub statement_id: String,
    /// The SQL text shared by the group
    pub sql: String,
    /// Parameter objects in add order; batch key generation writes
    /// generated keys back into these
    pub parameters: Vec<Value>,
    /// Affected counts, one per parameter set
    pub update_counts: Vec<i64>,
}

/// Update count reported for writes deferred into a batch
pub const BATCH_UPDATE_SENTINEL: i64 = i64::MIN + 1002;

/// A nested select queued for execution after the owning query finishes
pub struct DeferredLoad {
    /// Statement to run
    pub statement_id: String,
    /// Parameter for the nested select
    pub parameter: Value,
    /// Index of the owning row in the produced list
    pub row_index: usize,
    /// Property receiving the loaded value
    pub property: String,
    /// Whether the property collects a list
    pub collection: bool,
}

enum LocalEntry {
    /// Query in flight; nested selects that hit this break recursion
    Placeholder,
    List(Arc<Vec<Value>>),
}

/// State shared by every executor variant
pub struct BaseExecutor {
    /// The configuration this executor runs under
    pub config: Arc<Configuration>,
    /// The transaction driving the connection
    pub transaction: Box<dyn Transaction>,
    local_cache: HashMap<CacheKey, LocalEntry>,
    deferred: VecDeque<DeferredLoad>,
    query_stack: usize,
    closed: bool,
}

impl BaseExecutor {
    /// Create executor state over a transaction
    pub fn new(config: Arc<Configuration>, transaction: Box<dyn Transaction>) -> Self {
        Self {
            config,
            transaction,
            local_cache: HashMap::new(),
            deferred: VecDeque::new(),
            query_stack: 0,
            closed: false,
        }
    }

    fn check_open(&self) -> Result<()> {
        if self.closed {
            Err(Error::new(
                ErrorKind::ExecutionFailed,
                "executor was closed",
            ))
        } else {
            Ok(())
        }
    }
}

/// The statement execution driver behind a session.
#[async_trait]
pub trait Executor: Send {
    /// Shared state, mutable
    fn base(&mut self) -> &mut BaseExecutor;

    /// Shared state, shared
    fn base_ref(&self) -> &BaseExecutor;

    /// Variant write path
    async fn do_update(
        &mut self,
        ms: &Arc<MappedStatement>,
        parameter: &mut Value,
    ) -> Result<i64>;

    /// Variant read path
    async fn do_query(
        &mut self,
        ms: &Arc<MappedStatement>,
        parameter: &Value,
        bounds: RowBounds,
        bound_sql: &BoundSql,
        handler: Option<&mut dyn ResultHandler>,
    ) -> Result<Vec<Value>>;

    /// Variant flush path; `rollback` discards pending work instead
    async fn do_flush(&mut self, rollback: bool) -> Result<Vec<BatchResult>>;

    /// Execute a write
    async fn update(&mut self, ms: &Arc<MappedStatement>, parameter: &mut Value) -> Result<i64> {
        self.base_ref().check_open()?;
        self.clear_local_cache();
        self.do_update(ms, parameter).await
    }

    /// Execute a read, computing bound SQL and cache key
    async fn query(
        &mut self,
        ms: &Arc<MappedStatement>,
        parameter: Value,
        bounds: RowBounds,
        handler: Option<&mut dyn ResultHandler>,
    ) -> Result<Vec<Value>> {
        let bound_sql = ms
            .sql_source
            .bound_sql(&self.base_ref().config, &parameter)?;
        // Handler invocations are never cached; they carry the null key.
        let key = if handler.is_some() {
            CacheKey::null()
        } else {
            self.create_cache_key(ms, &parameter, bounds, &bound_sql)
        };
        self.query_with(ms, parameter, bounds, handler, key, bound_sql)
            .await
    }

    /// Execute a read with a precomputed key and bound SQL
    async fn query_with(
        &mut self,
        ms: &Arc<MappedStatement>,
        parameter: Value,
        bounds: RowBounds,
        handler: Option<&mut dyn ResultHandler>,
        key: CacheKey,
        bound_sql: BoundSql,
    ) -> Result<Vec<Value>> {
        self.base_ref().check_open()?;

        if self.base_ref().query_stack == 0 && ms.flush_cache {
            self.clear_local_cache();
        }

        // Null-key and handler invocations skip the local cache on both
        // ends.
        let use_local = handler.is_none() && !key.is_null();
        if use_local {
            match self.base().local_cache.get(&key) {
                Some(LocalEntry::List(list)) => {
                    debug!(id = %ms.id, "local cache hit");
                    return Ok(list.as_ref().clone());
                }
                // A nested select recursed into its own in-flight query.
                Some(LocalEntry::Placeholder) => return Ok(Vec::new()),
                None => {}
            }
            self.base()
                .local_cache
                .insert(key.clone(), LocalEntry::Placeholder);
        }

        let deferred_mark = self.base_ref().deferred.len();
        self.base().query_stack += 1;

        let result = self
            .do_query(ms, &parameter, bounds, &bound_sql, handler)
            .await;

        // This statement's deferred nested selects run before the depth
        // drops back, so a statement-scoped clear can only fire once the
        // whole unit has finished. Only entries this invocation queued are
        // drained; a nested query drains its own.
        let result = match result {
            Ok(mut list) => {
                let mut pending = self.base().deferred.split_off(deferred_mark);
                let mut outcome = Ok(());
                while let Some(load) = pending.pop_front() {
                    if let Err(e) = self.apply_deferred(load, &mut list).await {
                        outcome = Err(e);
                        break;
                    }
                }
                outcome.map(|_| list)
            }
            Err(e) => Err(e),
        };
        self.base().query_stack -= 1;

        let list = match result {
            Ok(list) => list,
            Err(e) => {
                self.base().deferred.truncate(deferred_mark);
                if use_local {
                    self.base().local_cache.remove(&key);
                }
                return Err(e);
            }
        };

        if use_local {
            self.base()
                .local_cache
                .insert(key, LocalEntry::List(Arc::new(list.clone())));
        }

        if self.base_ref().query_stack == 0
            && self.base_ref().config.settings.local_cache_scope == LocalCacheScope::Statement
        {
            self.clear_local_cache();
        }
        Ok(list)
    }

    /// Execute a deferred nested select against the produced list
    async fn apply_deferred(&mut self, load: DeferredLoad, list: &mut Vec<Value>) -> Result<()> {
        let ms = self
            .base_ref()
            .config
            .registry
            .statement(&load.statement_id)?;
        let rows = self
            .query(&ms, load.parameter, RowBounds::default(), None)
            .await?;
        let value = if load.collection {
            Value::Array(rows)
        } else {
            rows.into_iter().next().unwrap_or(Value::Null)
        };
        if let Some(target) = list.get_mut(load.row_index) {
            path::set_path(target, &load.property, value);
        }
        Ok(())
    }

    /// Queue a nested select for after the owning query
    fn defer_load(&mut self, load: DeferredLoad) {
        self.base().deferred.push_back(load);
    }

    /// Whether a list (not a placeholder) is cached for the key
    fn is_cached(&self, key: &CacheKey) -> bool {
        matches!(
            self.base_ref().local_cache.get(key),
            Some(LocalEntry::List(_))
        )
    }

    /// Drop all session-local cache entries
    fn clear_local_cache(&mut self) {
        self.base().local_cache.clear();
    }

    /// Deterministic identity of a query invocation
    fn create_cache_key(
        &self,
        ms: &Arc<MappedStatement>,
        parameter: &Value,
        bounds: RowBounds,
        bound_sql: &BoundSql,
    ) -> CacheKey {
        let base = self.base_ref();
        let mut key = CacheKey::new();
        key.update(Value::String(ms.id.clone()));
        key.update(Value::Int64(bounds.offset as i64));
        key.update(Value::Int64(bounds.limit.min(i64::MAX as usize) as i64));
        key.update(Value::String(bound_sql.sql.clone()));
        for mapping in &bound_sql.parameter_mappings {
            if mapping.mode == ParameterMode::Out {
                continue;
            }
            let value = statement::resolve_parameter_value(bound_sql, parameter, mapping);
            key.update(value);
        }
        if let Some(environment) = &base.config.environment {
            key.update(Value::String(environment.id.clone()));
        }
        key
    }

    /// Open a streaming cursor over a query. Cursors bypass both cache
    /// tiers and support flat result maps only.
    async fn query_cursor(
        &mut self,
        ms: &Arc<MappedStatement>,
        parameter: Value,
        bounds: RowBounds,
    ) -> Result<RowCursor> {
        self.base_ref().check_open()?;
        let config = self.base_ref().config.clone();
        let bound_sql = ms.sql_source.bound_sql(&config, &parameter)?;
        let rm_id = ms.result_maps.first().ok_or_else(|| {
            Error::materialization(format!("statement '{}' declares no result shape", ms.id))
        })?;
        let result_map = config.registry.result_map(rm_id)?;

        let shandler = statement::StatementHandler::new(&config, ms, &bound_sql);
        let tx_timeout = self.base().transaction.timeout();
        let connection = self.base().transaction.connection().await?;
        let mut stmt = shandler.prepare(connection.as_mut(), tx_timeout).await?;
        if let Err(e) = shandler.parameterize(stmt.as_mut(), &parameter) {
            let _ = stmt.close().await;
            return Err(e);
        }
        let mut execution = match stmt.execute().await {
            Ok(execution) => execution,
            Err(e) => {
                let _ = stmt.close().await;
                return Err(Error::execution(&ms.id, &bound_sql.sql, e));
            }
        };
        if execution.result_sets.is_empty() {
            let _ = stmt.close().await;
            return Err(Error::materialization(format!(
                "statement '{}' produced no result set",
                ms.id
            )));
        }
        Ok(RowCursor {
            config,
            result_map,
            statement: stmt,
            cursor: execution.result_sets.remove(0),
            to_skip: bounds.offset,
            remaining: bounds.limit,
            done: false,
        })
    }

    /// Flush any deferred batch work
    async fn flush_statements(&mut self) -> Result<Vec<BatchResult>> {
        self.base_ref().check_open()?;
        self.do_flush(false).await
    }

    /// Commit the transaction, flushing batches and local caches first
    async fn commit(&mut self, required: bool) -> Result<()> {
        self.base_ref().check_open()?;
        self.clear_local_cache();
        self.do_flush(false).await?;
        if required {
            self.base().transaction.commit().await?;
        }
        Ok(())
    }

    /// Roll back the transaction, discarding batches and local caches
    async fn rollback(&mut self, required: bool) -> Result<()> {
        if self.base_ref().closed {
            return Ok(());
        }
        self.clear_local_cache();
        let flush = self.do_flush(true).await;
        if required {
            self.base().transaction.rollback().await?;
        }
        flush.map(|_| ())
    }

    /// Release the executor and its transaction
    async fn close(&mut self, force_rollback: bool) -> Result<()> {
        if self.base_ref().closed {
            return Ok(());
        }
        let rollback = self.rollback(force_rollback).await;
        let close = self.base().transaction.close().await;
        let base = self.base();
        base.closed = true;
        base.local_cache.clear();
        base.deferred.clear();
        rollback?;
        close?;
        Ok(())
    }
}

/// A lazy sequence of materialized rows over an open driver cursor.
///
/// The driver statement stays open until the cursor is exhausted or closed.
pub struct RowCursor {
    config: Arc<Configuration>,
    result_map: Arc<crate::mapping::ResultMap>,
    statement: Box<dyn sqlweave_rdbc::driver::Statement>,
    cursor: Box<dyn sqlweave_rdbc::driver::ResultCursor>,
    to_skip: usize,
    remaining: usize,
    done: bool,
}

impl RowCursor {
    /// Materialize the next row, or `None` at end of the range
    pub async fn next(&mut self) -> Result<Option<Value>> {
        if self.done {
            return Ok(None);
        }
        while self.to_skip > 0 {
            if self.cursor.next().await?.is_none() {
                self.close().await?;
                return Ok(None);
            }
            self.to_skip -= 1;
        }
        if self.remaining == 0 {
            self.close().await?;
            return Ok(None);
        }
        match self.cursor.next().await? {
            Some(row) => {
                self.remaining -= 1;
                let meta = self.cursor.metadata().clone();
                let value =
                    resultset::materialize_flat_row(&self.config, &self.result_map, &row, &meta)?;
                Ok(Some(value.unwrap_or(Value::Null)))
            }
            None => {
                self.close().await?;
                Ok(None)
            }
        }
    }

    /// Drain the cursor into a list
    pub async fn collect(mut self) -> Result<Vec<Value>> {
        let mut out = Vec::new();
        while let Some(value) = self.next().await? {
            out.push(value);
        }
        Ok(out)
    }

    /// Release the driver cursor and statement
    pub async fn close(&mut self) -> Result<()> {
        if !self.done {
            self.done = true;
            let _ = self.cursor.close().await;
            let _ = self.statement.close().await;
        }
        Ok(())
    }
}

/// Build an executor of the requested type, wrapping it with the caching
/// decorator when the second-tier cache is enabled.
pub fn new_executor(
    config: Arc<Configuration>,
    transaction: Box<dyn Transaction>,
    executor_type: ExecutorType,
) -> Box<dyn Executor> {
    let base = BaseExecutor::new(config.clone(), transaction);
    let inner: Box<dyn Executor> = match executor_type {
        ExecutorType::Simple => Box::new(simple::SimpleExecutor::new(base)),
        ExecutorType::Reuse => Box::new(reuse::ReuseExecutor::new(base)),
        ExecutorType::Batch => Box::new(batch::BatchExecutor::new(base)),
    };
    if config.settings.cache_enabled {
        Box::new(caching::CachingExecutor::new(inner))
    } else {
        inner
    }
}

/// Run the companion select-key statement and write its columns into the
/// parameter's key properties.
pub(crate) async fn run_select_key(
    executor: &mut dyn Executor,
    ms: &Arc<MappedStatement>,
    parameter: &mut Value,
) -> Result<()> {
    let KeyGeneratorKind::SelectKey { statement_id, .. } = &ms.key_generator else {
        return Ok(());
    };
    let key_ms = executor
        .base_ref()
        .config
        .registry
        .statement(statement_id)?;
    let rows = executor
        .query(&key_ms, parameter.clone(), RowBounds::default(), None)
        .await?;
    let row = rows.into_iter().next().unwrap_or(Value::Null);
    keygen::assign_key_values(&ms.key_properties, &row, parameter);
    Ok(())
}
