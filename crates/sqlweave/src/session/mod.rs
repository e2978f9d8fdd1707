//! Sessions
//!
//! A session is a short-lived facade over one executor and one transaction.
//! The factory builds sessions from a shared configuration; each session is
//! owned by one caller at a time and is not safe for concurrent use.

pub mod mapper;

use indexmap::IndexMap;
use sqlweave_rdbc::driver::{Connection, IsolationLevel};
use sqlweave_rdbc::transaction::ExternalTransaction;
use sqlweave_rdbc::Value;
use std::sync::Arc;
use tracing::debug;

use crate::config::{Configuration, ExecutorType};
use crate::error::{Error, Result};
use crate::executor::{new_executor, BatchResult, Executor, ResultHandler, RowCursor};
use crate::mapping::MappedStatement;
use crate::meta::path;

pub use crate::executor::RowBounds;
pub use mapper::pack_args;

/// A typed mapper facade over a namespace; implemented by the
/// [`crate::mapper!`] macro.
pub trait Mapper {
    /// Namespace the facade's statement ids live under
    const NAMESPACE: &'static str;

    /// Construct the facade
    fn new() -> Self;
}

/// Builds sessions over one configuration.
pub struct SessionFactory {
    config: Arc<Configuration>,
}

impl SessionFactory {
    /// Create a factory. Mapping-build errors have already surfaced while
    /// the configuration was assembled.
    pub fn new(config: Configuration) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    /// The shared configuration
    pub fn configuration(&self) -> &Arc<Configuration> {
        &self.config
    }

    /// Open a session with the default executor type
    pub fn open_session(&self) -> Result<Session> {
        self.open_session_with(self.config.settings.default_executor_type, false, None)
    }

    /// Open a session with explicit executor type, autocommit, and isolation
    pub fn open_session_with(
        &self,
        executor_type: ExecutorType,
        auto_commit: bool,
        isolation: Option<IsolationLevel>,
    ) -> Result<Session> {
        let environment = self.config.environment()?;
        let transaction = environment.transaction_factory.new_transaction(
            environment.data_source.clone(),
            isolation,
            auto_commit,
        );
        debug!(executor = ?executor_type, "opening session");
        Ok(Session {
            executor: new_executor(self.config.clone(), transaction, executor_type),
            config: self.config.clone(),
            dirty: false,
        })
    }

    /// Open a session over a caller-supplied connection whose lifecycle is
    /// managed externally
    pub fn open_session_with_connection(&self, connection: Box<dyn Connection>) -> Session {
        let transaction = Box::new(ExternalTransaction::new(connection));
        Session {
            executor: new_executor(
                self.config.clone(),
                transaction,
                self.config.settings.default_executor_type,
            ),
            config: self.config.clone(),
            dirty: false,
        }
    }
}

/// One unit of work against the database.
pub struct Session {
    config: Arc<Configuration>,
    executor: Box<dyn Executor>,
    dirty: bool,
}

impl Session {
    fn statement(&self, id: &str) -> Result<Arc<MappedStatement>> {
        self.config.registry.statement(id)
    }

    /// The configuration this session runs under
    pub fn configuration(&self) -> &Arc<Configuration> {
        &self.config
    }

    /// Run a select and collect every result object
    pub async fn select_list(
        &mut self,
        id: &str,
        parameter: impl Into<Value>,
    ) -> Result<Vec<Value>> {
        self.select_list_bounds(id, parameter, RowBounds::default())
            .await
    }

    /// Run a select over a row range
    pub async fn select_list_bounds(
        &mut self,
        id: &str,
        parameter: impl Into<Value>,
        bounds: RowBounds,
    ) -> Result<Vec<Value>> {
        let ms = self.statement(id)?;
        self.executor.query(&ms, parameter.into(), bounds, None).await
    }

    /// Run a select expected to produce at most one row
    pub async fn select_one(
        &mut self,
        id: &str,
        parameter: impl Into<Value>,
    ) -> Result<Option<Value>> {
        let mut list = self.select_list(id, parameter).await?;
        match list.len() {
            0 => Ok(None),
            1 => {
                let value = list.pop().expect("one element");
                Ok((!value.is_null()).then_some(value))
            }
            n => Err(Error::materialization(format!(
                "expected one result (or none) from '{id}' but found {n}"
            ))),
        }
    }

    /// Run a select and key each result object by a property path
    pub async fn select_map(
        &mut self,
        id: &str,
        parameter: impl Into<Value>,
        key_property: &str,
    ) -> Result<IndexMap<String, Value>> {
        let rows = self.select_list(id, parameter).await?;
        let mut out = IndexMap::with_capacity(rows.len());
        for row in rows {
            let key = path::get_path(&row, key_property)
                .cloned()
                .unwrap_or(Value::Null)
                .render();
            out.insert(key, row);
        }
        Ok(out)
    }

    /// Run a select as a lazy cursor over the open driver result set
    pub async fn select_cursor(
        &mut self,
        id: &str,
        parameter: impl Into<Value>,
        bounds: RowBounds,
    ) -> Result<RowCursor> {
        let ms = self.statement(id)?;
        self.executor.query_cursor(&ms, parameter.into(), bounds).await
    }

    /// Run a select, feeding each result object to the handler
    pub async fn select_with_handler(
        &mut self,
        id: &str,
        parameter: impl Into<Value>,
        bounds: RowBounds,
        handler: &mut dyn ResultHandler,
    ) -> Result<()> {
        let ms = self.statement(id)?;
        self.executor
            .query(&ms, parameter.into(), bounds, Some(handler))
            .await?;
        Ok(())
    }

    async fn write(&mut self, id: &str, parameter: &mut Value) -> Result<i64> {
        let ms = self.statement(id)?;
        self.dirty = true;
        self.executor.update(&ms, parameter).await
    }

    /// Run an insert; generated keys are written into the parameter
    pub async fn insert(&mut self, id: &str, parameter: &mut Value) -> Result<i64> {
        self.write(id, parameter).await
    }

    /// Run an update; key generators may write into the parameter
    pub async fn update(&mut self, id: &str, parameter: &mut Value) -> Result<i64> {
        self.write(id, parameter).await
    }

    /// Run a delete
    pub async fn delete(&mut self, id: &str, parameter: impl Into<Value>) -> Result<i64> {
        let mut parameter = parameter.into();
        self.write(id, &mut parameter).await
    }

    /// Execute any pending batched statements
    pub async fn flush_statements(&mut self) -> Result<Vec<BatchResult>> {
        self.executor.flush_statements().await
    }

    /// Commit the transaction. `force` commits even when the session saw no
    /// writes.
    pub async fn commit(&mut self, force: bool) -> Result<()> {
        let required = self.dirty || force;
        self.executor.commit(required).await?;
        self.dirty = false;
        Ok(())
    }

    /// Roll back the transaction. `force` rolls back even when the session
    /// saw no writes.
    pub async fn rollback(&mut self, force: bool) -> Result<()> {
        let required = self.dirty || force;
        self.executor.rollback(required).await?;
        self.dirty = false;
        Ok(())
    }

    /// Drop all session-local cache entries
    pub fn clear_cache(&mut self) {
        self.executor.clear_local_cache();
    }

    /// Close the session; uncommitted writes are rolled back
    pub async fn close(&mut self) -> Result<()> {
        let result = self.executor.close(self.dirty).await;
        self.dirty = false;
        result
    }

    /// A typed mapper facade whose namespace must be registered
    pub fn mapper<M: Mapper>(&self) -> Result<M> {
        if self.config.registry.has_namespace(M::NAMESPACE) {
            Ok(M::new())
        } else {
            Err(Error::statement_not_found(M::NAMESPACE))
        }
    }
}
