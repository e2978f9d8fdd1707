//! Reuse executor: driver statements cached per SQL text for the session.

use async_trait::async_trait;
use sqlweave_rdbc::driver::Statement;
use sqlweave_rdbc::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::mapping::{BoundSql, KeyGeneratorKind, MappedStatement};

use super::keygen;
use super::resultset::handle_result_sets;
use super::statement::StatementHandler;
use super::{run_select_key, BaseExecutor, BatchResult, Executor, ResultHandler, RowBounds};

/// Executor that keeps prepared statements keyed by SQL text, closing them
/// all when the session flushes.
pub struct ReuseExecutor {
    base: BaseExecutor,
    statements: HashMap<String, Box<dyn Statement>>,
}

impl ReuseExecutor {
    /// Create a reuse executor over shared state
    pub fn new(base: BaseExecutor) -> Self {
        Self {
            base,
            statements: HashMap::new(),
        }
    }

    /// Take a cached statement for the SQL, or prepare a fresh one.
    /// The statement is handed back via `store` after use.
    async fn take_statement(
        &mut self,
        handler: &StatementHandler<'_>,
        sql: &str,
    ) -> Result<Box<dyn Statement>> {
        if let Some(stmt) = self.statements.remove(sql) {
            return Ok(stmt);
        }
        let tx_timeout = self.base.transaction.timeout();
        let connection = self.base.transaction.connection().await?;
        handler.prepare(connection.as_mut(), tx_timeout).await
    }

    fn store(&mut self, sql: String, stmt: Box<dyn Statement>) {
        self.statements.insert(sql, stmt);
    }
}

#[async_trait]
impl Executor for ReuseExecutor {
    fn base(&mut self) -> &mut BaseExecutor {
        &mut self.base
    }

    fn base_ref(&self) -> &BaseExecutor {
        &self.base
    }

    async fn do_update(
        &mut self,
        ms: &Arc<MappedStatement>,
        parameter: &mut Value,
    ) -> Result<i64> {
        let config = self.base.config.clone();
        if let KeyGeneratorKind::SelectKey {
            execute_before: true,
            ..
        } = &ms.key_generator
        {
            run_select_key(self, ms, parameter).await?;
        }

        let bound_sql = ms.sql_source.bound_sql(&config, parameter)?;
        let handler = StatementHandler::new(&config, ms, &bound_sql);
        let mut stmt = self.take_statement(&handler, &bound_sql.sql).await?;

        handler.parameterize(stmt.as_mut(), parameter)?;
        let execution = stmt
            .execute()
            .await
            .map_err(|e| Error::execution(&ms.id, &bound_sql.sql, e))?;
        let count = execution.update_count as i64;

        handler.process_out_parameters(stmt.as_ref(), parameter)?;
        if ms.key_generator == KeyGeneratorKind::DriverGenerated {
            keygen::process_driver_keys(ms, execution.generated_keys, parameter).await?;
        }
        self.store(bound_sql.sql.clone(), stmt);

        if let KeyGeneratorKind::SelectKey {
            execute_before: false,
            ..
        } = &ms.key_generator
        {
            run_select_key(self, ms, parameter).await?;
        }
        Ok(count)
    }

    async fn do_query(
        &mut self,
        ms: &Arc<MappedStatement>,
        parameter: &Value,
        bounds: RowBounds,
        bound_sql: &BoundSql,
        handler: Option<&mut dyn ResultHandler>,
    ) -> Result<Vec<Value>> {
        let config = self.base.config.clone();
        let shandler = StatementHandler::new(&config, ms, bound_sql);
        let mut stmt = self.take_statement(&shandler, &bound_sql.sql).await?;

        shandler.parameterize(stmt.as_mut(), parameter)?;
        let execution = stmt
            .execute()
            .await
            .map_err(|e| Error::execution(&ms.id, &bound_sql.sql, e))?;

        let rows = handle_result_sets(self, ms, execution, bounds, handler).await;
        self.store(bound_sql.sql.clone(), stmt);
        rows
    }

    async fn do_flush(&mut self, _rollback: bool) -> Result<Vec<BatchResult>> {
        for (_, mut stmt) in self.statements.drain() {
            let _ = stmt.close().await;
        }
        Ok(Vec::new())
    }
}
