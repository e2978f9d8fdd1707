//! Caching executor: decorates another executor with the namespace
//! (second-tier) cache through the transactional cache manager.

use async_trait::async_trait;
use sqlweave_rdbc::Value;
use std::sync::Arc;
use tracing::debug;

use crate::cache::transactional::TransactionalCacheManager;
use crate::cache::{Cache, CacheKey};
use crate::error::Result;
use crate::mapping::{BoundSql, MappedStatement};

use super::{BaseExecutor, BatchResult, Executor, ResultHandler, RowBounds};

/// Decorator serving reads from the namespace cache and staging writes for
/// commit.
pub struct CachingExecutor {
    delegate: Box<dyn Executor>,
    tcm: TransactionalCacheManager,
}

impl CachingExecutor {
    /// Wrap an executor with second-tier caching
    pub fn new(delegate: Box<dyn Executor>) -> Self {
        Self {
            delegate,
            tcm: TransactionalCacheManager::new(),
        }
    }

    fn cache_for(&self, ms: &MappedStatement) -> Option<Arc<dyn Cache>> {
        self.delegate
            .base_ref()
            .config
            .registry
            .cache_for_namespace(&ms.namespace)
    }

    fn flush_cache_if_required(&mut self, ms: &MappedStatement) {
        if ms.flush_cache {
            if let Some(cache) = self.cache_for(ms) {
                self.tcm.clear(&cache);
            }
        }
    }
}

#[async_trait]
impl Executor for CachingExecutor {
    fn base(&mut self) -> &mut BaseExecutor {
        self.delegate.base()
    }

    fn base_ref(&self) -> &BaseExecutor {
        self.delegate.base_ref()
    }

    async fn do_update(
        &mut self,
        ms: &Arc<MappedStatement>,
        parameter: &mut Value,
    ) -> Result<i64> {
        self.delegate.do_update(ms, parameter).await
    }

    async fn do_query(
        &mut self,
        ms: &Arc<MappedStatement>,
        parameter: &Value,
        bounds: RowBounds,
        bound_sql: &BoundSql,
        handler: Option<&mut dyn ResultHandler>,
    ) -> Result<Vec<Value>> {
        self.delegate
            .do_query(ms, parameter, bounds, bound_sql, handler)
            .await
    }

    async fn do_flush(&mut self, rollback: bool) -> Result<Vec<BatchResult>> {
        self.delegate.do_flush(rollback).await
    }

    async fn update(&mut self, ms: &Arc<MappedStatement>, parameter: &mut Value) -> Result<i64> {
        self.flush_cache_if_required(ms);
        self.delegate.update(ms, parameter).await
    }

    async fn query_with(
        &mut self,
        ms: &Arc<MappedStatement>,
        parameter: Value,
        bounds: RowBounds,
        handler: Option<&mut dyn ResultHandler>,
        key: CacheKey,
        bound_sql: BoundSql,
    ) -> Result<Vec<Value>> {
        if let Some(cache) = self.cache_for(ms) {
            self.flush_cache_if_required(ms);
            if ms.use_cache && handler.is_none() && !key.is_null() {
                if let Some(cached) = self.tcm.get(&cache, &key).await? {
                    debug!(id = %ms.id, "second-tier cache hit");
                    let list = match &*cached {
                        Value::Array(items) => items.clone(),
                        _ => Vec::new(),
                    };
                    return Ok(list);
                }
                let list = self
                    .delegate
                    .query_with(ms, parameter, bounds, None, key.clone(), bound_sql)
                    .await?;
                self.tcm
                    .put(&cache, key, Arc::new(Value::Array(list.clone())));
                return Ok(list);
            }
        }
        self.delegate
            .query_with(ms, parameter, bounds, handler, key, bound_sql)
            .await
    }

    async fn flush_statements(&mut self) -> Result<Vec<BatchResult>> {
        self.delegate.flush_statements().await
    }

    async fn commit(&mut self, required: bool) -> Result<()> {
        self.delegate.commit(required).await?;
        self.tcm.commit().await
    }

    async fn rollback(&mut self, required: bool) -> Result<()> {
        let result = self.delegate.rollback(required).await;
        self.tcm.rollback().await?;
        result
    }

    async fn close(&mut self, force_rollback: bool) -> Result<()> {
        if force_rollback {
            self.tcm.rollback().await?;
        } else {
            self.tcm.commit().await?;
        }
        self.delegate.close(force_rollback).await
    }
}
