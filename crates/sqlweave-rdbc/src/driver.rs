//! Driver traits for sqlweave-rdbc
//!
//! Core abstractions every backend implements:
//! - Driver: opens raw connections from a URL
//! - DataSource: hands out configured connections
//! - Connection: transactional connection with statement creation
//! - Statement: positional parameter binding and execution
//! - ResultCursor: forward-only row iteration

use async_trait::async_trait;
use std::time::Duration;

use crate::error::Result;
use crate::types::{DriverType, ResultSetMetadata, Row, Value};

/// Transaction isolation levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IsolationLevel {
    /// Read uncommitted - dirty reads possible
    ReadUncommitted,
    /// Read committed - no dirty reads
    ReadCommitted,
    /// Repeatable read - no non-repeatable reads
    RepeatableRead,
    /// Serializable - full isolation
    Serializable,
}

impl IsolationLevel {
    /// Convert to SQL string for SET TRANSACTION statements
    pub fn to_sql(&self) -> &'static str {
        match self {
            Self::ReadUncommitted => "READ UNCOMMITTED",
            Self::ReadCommitted => "READ COMMITTED",
            Self::RepeatableRead => "REPEATABLE READ",
            Self::Serializable => "SERIALIZABLE",
        }
    }
}

impl std::fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_sql())
    }
}

/// Options applied when a statement is created
#[derive(Debug, Clone, Default)]
pub struct StatementOptions {
    /// Rows fetched per round trip, if the driver supports it
    pub fetch_size: Option<u32>,
    /// Query timeout; enforced by the driver
    pub query_timeout: Option<Duration>,
    /// Request driver-generated keys on execute
    pub return_generated_keys: bool,
    /// Key column names for generated-key retrieval
    pub key_columns: Vec<String>,
}

/// Outcome of executing a statement
pub struct Execution {
    /// Affected row count for writes; 0 for pure selects
    pub update_count: u64,
    /// Result cursors, in driver order
    pub result_sets: Vec<Box<dyn ResultCursor>>,
    /// Generated-keys cursor, when requested and produced
    pub generated_keys: Option<Box<dyn ResultCursor>>,
}

impl Execution {
    /// An execution with only an update count
    pub fn updated(count: u64) -> Self {
        Self {
            update_count: count,
            result_sets: Vec::new(),
            generated_keys: None,
        }
    }
}

/// Outcome of executing a statement batch
pub struct BatchExecution {
    /// Affected row counts, one per queued parameter set
    pub update_counts: Vec<u64>,
    /// Generated-keys cursor covering the whole batch, when requested
    pub generated_keys: Option<Box<dyn ResultCursor>>,
}

/// Opens raw connections for a URL. Registered with data-source factories
/// so configuration markup can name a driver by key.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Open a new connection
    async fn connect(
        &self,
        url: &str,
        username: Option<&str>,
        password: Option<&str>,
    ) -> Result<Box<dyn Connection>>;
}

/// Hands out connections; implemented by the unpooled and pooled sources
/// as well as test doubles.
#[async_trait]
pub trait DataSource: Send + Sync {
    /// Get a connection, creating or reusing one as the source sees fit
    async fn connection(&self) -> Result<Box<dyn Connection>>;
}

/// A connection to a database.
///
/// `close` is the only way to release the connection; for pooled wrappers it
/// returns the underlying connection to the pool instead of the driver.
#[async_trait]
pub trait Connection: Send {
    /// Current autocommit mode
    fn is_auto_commit(&self) -> bool;

    /// Switch autocommit mode
    async fn set_auto_commit(&mut self, on: bool) -> Result<()>;

    /// Apply an isolation level
    async fn set_isolation(&mut self, level: IsolationLevel) -> Result<()>;

    /// Commit the current transaction
    async fn commit(&mut self) -> Result<()>;

    /// Roll back the current transaction
    async fn rollback(&mut self) -> Result<()>;

    /// Close the connection (or return it to its pool)
    async fn close(&mut self) -> Result<()>;

    /// Whether the connection has been closed
    fn is_closed(&self) -> bool;

    /// Create a statement for the given SQL
    async fn create_statement(
        &mut self,
        sql: &str,
        options: StatementOptions,
    ) -> Result<Box<dyn Statement>>;

    /// Execute a validity-check query; any error means the connection is bad
    async fn ping(&mut self, sql: &str) -> Result<()>;

    /// Database product name, used by database-id providers
    fn database_product(&self) -> &str;
}

/// A driver statement: plain, prepared, or callable.
///
/// Parameter indices are 1-based, matching placeholder order in the SQL.
#[async_trait]
pub trait Statement: Send {
    /// The SQL this statement was created with
    fn sql(&self) -> &str;

    /// Bind a parameter by position
    fn bind(&mut self, index: usize, value: Value, driver_type: DriverType) -> Result<()>;

    /// Register an OUT parameter by position (callable statements)
    fn register_out(&mut self, index: usize, driver_type: DriverType) -> Result<()>;

    /// Execute and collect the outcome
    async fn execute(&mut self) -> Result<Execution>;

    /// Queue the current parameter set for batch execution
    fn add_batch(&mut self) -> Result<()>;

    /// Execute all queued parameter sets
    async fn execute_batch(&mut self) -> Result<BatchExecution>;

    /// Read an OUT parameter after execution
    fn out_value(&self, index: usize) -> Result<Value>;

    /// Release driver-side resources
    async fn close(&mut self) -> Result<()>;
}

/// Forward-only cursor over one result set
#[async_trait]
pub trait ResultCursor: Send {
    /// Column metadata for this result set
    fn metadata(&self) -> &ResultSetMetadata;

    /// Fetch the next row, or `None` at end
    async fn next(&mut self) -> Result<Option<Row>>;

    /// Release the cursor
    async fn close(&mut self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_isolation_level_to_sql() {
        assert_eq!(IsolationLevel::ReadCommitted.to_sql(), "READ COMMITTED");
        assert_eq!(IsolationLevel::Serializable.to_sql(), "SERIALIZABLE");
    }

    #[test]
    fn test_statement_options_default() {
        let opts = StatementOptions::default();
        assert!(opts.fetch_size.is_none());
        assert!(opts.query_timeout.is_none());
        assert!(!opts.return_generated_keys);
        assert!(opts.key_columns.is_empty());
    }

    #[test]
    fn test_execution_updated() {
        let ex = Execution::updated(3);
        assert_eq!(ex.update_count, 3);
        assert!(ex.result_sets.is_empty());
        assert!(ex.generated_keys.is_none());
    }
}
