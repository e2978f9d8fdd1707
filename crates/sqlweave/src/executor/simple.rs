//! Simple executor: a fresh driver statement per operation.

use async_trait::async_trait;
use sqlweave_rdbc::Value;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::mapping::{BoundSql, KeyGeneratorKind, MappedStatement};

use super::keygen;
use super::resultset::handle_result_sets;
use super::statement::StatementHandler;
use super::{run_select_key, BaseExecutor, BatchResult, Executor, ResultHandler, RowBounds};

/// Executor that prepares, executes, and closes a statement per call.
pub struct SimpleExecutor {
    base: BaseExecutor,
}

impl SimpleExecutor {
    /// Create a simple executor over shared state
    pub fn new(base: BaseExecutor) -> Self {
        Self { base }
    }
}

#[async_trait]
impl Executor for SimpleExecutor {
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
        let tx_timeout = self.base.transaction.timeout();
        let connection = self.base.transaction.connection().await?;
        let mut stmt = handler.prepare(connection.as_mut(), tx_timeout).await?;

        if let Err(e) = handler.parameterize(stmt.as_mut(), parameter) {
            let _ = stmt.close().await;
            return Err(e);
        }
        let execution = match stmt.execute().await {
            Ok(execution) => execution,
            Err(e) => {
                let _ = stmt.close().await;
                return Err(Error::execution(&ms.id, &bound_sql.sql, e));
            }
        };
        let count = execution.update_count as i64;

        handler.process_out_parameters(stmt.as_ref(), parameter)?;
        if ms.key_generator == KeyGeneratorKind::DriverGenerated {
            keygen::process_driver_keys(ms, execution.generated_keys, parameter).await?;
        }
        let _ = stmt.close().await;

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
        let tx_timeout = self.base.transaction.timeout();
        let connection = self.base.transaction.connection().await?;
        let mut stmt = shandler.prepare(connection.as_mut(), tx_timeout).await?;

        if let Err(e) = shandler.parameterize(stmt.as_mut(), parameter) {
            let _ = stmt.close().await;
            return Err(e);
        }
        let execution = match stmt.execute().await {
            Ok(execution) => execution,
            Err(e) => {
                let _ = stmt.close().await;
                return Err(Error::execution(&ms.id, &bound_sql.sql, e));
            }
        };

        let rows = handle_result_sets(self, ms, execution, bounds, handler).await;
        let _ = stmt.close().await;
        rows
    }

    async fn do_flush(&mut self, _rollback: bool) -> Result<Vec<BatchResult>> {
        Ok(Vec::new())
    }
}
