//! Batch executor: writes grouped by SQL text and deferred into driver
//! batches until the session flushes.

use async_trait::async_trait;
use sqlweave_rdbc::driver::Statement;
use sqlweave_rdbc::Value;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::mapping::{BoundSql, KeyGeneratorKind, MappedStatement};

use super::keygen;
use super::resultset::handle_result_sets;
use super::statement::StatementHandler;
use super::{
    run_select_key, BaseExecutor, BatchResult, Executor, ResultHandler, RowBounds,
    BATCH_UPDATE_SENTINEL,
};

/// Executor that queues consecutive writes sharing one SQL text into a
/// single driver batch. Update calls report [`BATCH_UPDATE_SENTINEL`]; real
/// counts arrive with `flush_statements`.
pub struct BatchExecutor {
    base: BaseExecutor,
    current_sql: Option<String>,
    current_statement_id: Option<String>,
    statements: Vec<Box<dyn Statement>>,
    statement_meta: Vec<Arc<MappedStatement>>,
    results: Vec<BatchResult>,
}

impl BatchExecutor {
    /// Create a batch executor over shared state
    pub fn new(base: BaseExecutor) -> Self {
        Self {
            base,
            current_sql: None,
            current_statement_id: None,
            statements: Vec::new(),
            statement_meta: Vec::new(),
            results: Vec::new(),
        }
    }

    fn is_current(&self, ms: &MappedStatement, sql: &str) -> bool {
        self.current_sql.as_deref() == Some(sql)
            && self.current_statement_id.as_deref() == Some(ms.id.as_str())
    }
}

#[async_trait]
impl Executor for BatchExecutor {
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

        if self.is_current(ms, &bound_sql.sql) {
            let stmt = self
                .statements
                .last_mut()
                .expect("current batch statement exists");
            handler.parameterize(stmt.as_mut(), parameter)?;
            stmt.add_batch()?;
            self.results
                .last_mut()
                .expect("current batch result exists")
                .parameters
                .push(parameter.clone());
        } else {
            let tx_timeout = self.base.transaction.timeout();
            let connection = self.base.transaction.connection().await?;
            let mut stmt = handler.prepare(connection.as_mut(), tx_timeout).await?;
            handler.parameterize(stmt.as_mut(), parameter)?;
            stmt.add_batch()?;
            self.current_sql = Some(bound_sql.sql.clone());
            self.current_statement_id = Some(ms.id.clone());
            self.statements.push(stmt);
            self.statement_meta.push(ms.clone());
            self.results.push(BatchResult {
                statement_id: ms.id.clone(),
                sql: bound_sql.sql.clone(),
                parameters: vec![parameter.clone()],
                update_counts: Vec::new(),
            });
        }

        if let KeyGeneratorKind::SelectKey {
            execute_before: false,
            ..
        } = &ms.key_generator
        {
            run_select_key(self, ms, parameter).await?;
        }
        Ok(BATCH_UPDATE_SENTINEL)
    }

    async fn do_query(
        &mut self,
        ms: &Arc<MappedStatement>,
        parameter: &Value,
        bounds: RowBounds,
        bound_sql: &BoundSql,
        handler: Option<&mut dyn ResultHandler>,
    ) -> Result<Vec<Value>> {
        // Pending writes must hit the database before the query reads it.
        self.do_flush(false).await?;

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

    async fn do_flush(&mut self, rollback: bool) -> Result<Vec<BatchResult>> {
        self.current_sql = None;
        self.current_statement_id = None;
        let mut statements = std::mem::take(&mut self.statements);
        let meta = std::mem::take(&mut self.statement_meta);
        let mut results = std::mem::take(&mut self.results);

        if rollback {
            for stmt in statements.iter_mut() {
                let _ = stmt.close().await;
            }
            return Ok(Vec::new());
        }

        for (i, mut stmt) in statements.into_iter().enumerate() {
            let batch = stmt.execute_batch().await.map_err(|e| {
                Error::execution(&results[i].statement_id, &results[i].sql, e)
            })?;
            results[i].update_counts = batch
                .update_counts
                .iter()
                .map(|c| *c as i64)
                .collect();
            let ms = &meta[i];
            if ms.key_generator == KeyGeneratorKind::DriverGenerated {
                keygen::process_batch_keys(ms, batch.generated_keys, &mut results[i].parameters)
                    .await?;
            }
            let _ = stmt.close().await;
        }
        Ok(results)
    }
}
