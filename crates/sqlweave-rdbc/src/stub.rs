//! Scripted in-memory driver
//!
//! A test double implementing the full driver contract. Tests enqueue
//! fixtures keyed by SQL substring; every executed statement is recorded with
//! its bound parameters and options, and connection lifecycle events are
//! observable. Both crates' test suites run against this driver.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::driver::{
    BatchExecution, Connection, DataSource, Driver, Execution, IsolationLevel, ResultCursor,
    Statement, StatementOptions,
};
use crate::error::{Error, Result};
use crate::types::{ColumnMetadata, DriverType, ResultSetMetadata, Row, Value};

/// One scripted result set: metadata plus rows
#[derive(Clone)]
pub struct ResultSetFixture {
    /// Column metadata
    pub metadata: ResultSetMetadata,
    /// Rows in cursor order
    pub rows: Vec<Row>,
}

/// Build a result-set fixture from column names and row values, inferring
/// driver types from the first row.
pub fn result_set(columns: &[&str], rows: Vec<Vec<Value>>) -> ResultSetFixture {
    let metadata = ResultSetMetadata::new(
        columns
            .iter()
            .enumerate()
            .map(|(i, name)| {
                let driver_type = rows
                    .first()
                    .and_then(|r| r.get(i))
                    .map(DriverType::of)
                    .unwrap_or(DriverType::Other);
                ColumnMetadata::new(*name, driver_type)
            })
            .collect(),
    );
    let columns: Vec<String> = columns.iter().map(|c| c.to_string()).collect();
    let rows = rows
        .into_iter()
        .map(|values| Row::new(columns.clone(), values))
        .collect();
    ResultSetFixture { metadata, rows }
}

/// One scripted statement outcome
#[derive(Clone, Default)]
pub struct Fixture {
    pattern: String,
    result_sets: Vec<ResultSetFixture>,
    update_count: u64,
    generated_keys: Option<ResultSetFixture>,
    out_values: Vec<(usize, Value)>,
    once: bool,
    fail: Option<String>,
}

impl Fixture {
    /// Match statements whose SQL contains `pattern`
    pub fn matching(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            ..Default::default()
        }
    }

    /// Return these rows
    pub fn returning(mut self, rs: ResultSetFixture) -> Self {
        self.result_sets.push(rs);
        self
    }

    /// Report this update count
    pub fn affecting(mut self, count: u64) -> Self {
        self.update_count = count;
        self
    }

    /// Produce these generated keys
    pub fn with_generated_keys(mut self, rs: ResultSetFixture) -> Self {
        self.generated_keys = Some(rs);
        self
    }

    /// Provide an OUT parameter value by 1-based position
    pub fn with_out_value(mut self, index: usize, value: Value) -> Self {
        self.out_values.push((index, value));
        self
    }

    /// Consume this fixture after its first match
    pub fn once(mut self) -> Self {
        self.once = true;
        self
    }

    /// Fail execution with this message instead of succeeding
    pub fn failing(mut self, message: impl Into<String>) -> Self {
        self.fail = Some(message.into());
        self
    }
}

/// A statement the stub driver executed, as recorded for assertions
#[derive(Debug, Clone)]
pub struct ExecutedStatement {
    /// The SQL text
    pub sql: String,
    /// Bound parameters in positional order
    pub params: Vec<Value>,
    /// Options the statement was created with
    pub fetch_size: Option<u32>,
    /// Query timeout in milliseconds, if set
    pub timeout_ms: Option<u64>,
}

/// Observable connection lifecycle events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// A connection was opened
    Opened,
    /// Autocommit was switched
    AutoCommit(bool),
    /// An isolation level was applied
    Isolation(String),
    /// The connection committed
    Committed,
    /// The connection rolled back
    RolledBack,
    /// The connection was closed
    Closed,
    /// A ping query ran
    Pinged(String),
}

/// Shared script and recordings behind every stub connection
#[derive(Default)]
pub struct StubScript {
    fixtures: parking_lot::Mutex<Vec<Fixture>>,
    executed: parking_lot::Mutex<Vec<ExecutedStatement>>,
    events: parking_lot::Mutex<Vec<ConnectionEvent>>,
    connections_opened: AtomicUsize,
    fail_pings: AtomicUsize,
    fail_connects: AtomicUsize,
}

impl StubScript {
    /// Enqueue a fixture
    pub fn expect(&self, fixture: Fixture) {
        self.fixtures.lock().push(fixture);
    }

    /// Shorthand: a query fixture
    pub fn expect_query(&self, pattern: impl Into<String>, rs: ResultSetFixture) {
        self.expect(Fixture::matching(pattern).returning(rs));
    }

    /// Shorthand: an update fixture
    pub fn expect_update(&self, pattern: impl Into<String>, count: u64) {
        self.expect(Fixture::matching(pattern).affecting(count));
    }

    /// Everything executed so far
    pub fn executed(&self) -> Vec<ExecutedStatement> {
        self.executed.lock().clone()
    }

    /// SQL texts executed so far
    pub fn executed_sql(&self) -> Vec<String> {
        self.executed.lock().iter().map(|e| e.sql.clone()).collect()
    }

    /// Number of statements executed so far
    pub fn execution_count(&self) -> usize {
        self.executed.lock().len()
    }

    /// Connection events so far
    pub fn events(&self) -> Vec<ConnectionEvent> {
        self.events.lock().clone()
    }

    /// Connections opened so far
    pub fn connections_opened(&self) -> usize {
        self.connections_opened.load(Ordering::Acquire)
    }

    /// Make the next `n` pings fail
    pub fn fail_next_pings(&self, n: usize) {
        self.fail_pings.store(n, Ordering::Release);
    }

    /// Make the next `n` connection attempts fail
    pub fn fail_next_connects(&self, n: usize) {
        self.fail_connects.store(n, Ordering::Release);
    }

    /// Drop all recordings (fixtures stay)
    pub fn clear_recordings(&self) {
        self.executed.lock().clear();
        self.events.lock().clear();
    }

    fn record_event(&self, event: ConnectionEvent) {
        self.events.lock().push(event);
    }

    fn take_fixture(&self, sql: &str) -> Option<Fixture> {
        let mut fixtures = self.fixtures.lock();
        let pos = fixtures.iter().position(|f| sql.contains(&f.pattern))?;
        if fixtures[pos].once {
            Some(fixtures.remove(pos))
        } else {
            Some(fixtures[pos].clone())
        }
    }
}

/// Data source handing out stub connections
#[derive(Clone, Default)]
pub struct StubDataSource {
    script: Arc<StubScript>,
}

impl StubDataSource {
    /// Create a stub data source with an empty script
    pub fn new() -> Self {
        Self::default()
    }

    /// The shared script, for fixtures and assertions
    pub fn script(&self) -> &Arc<StubScript> {
        &self.script
    }
}

#[async_trait]
impl DataSource for StubDataSource {
    async fn connection(&self) -> Result<Box<dyn Connection>> {
        StubDriver::open(self.script.clone())
    }
}

/// Driver registered under a key for configuration markup
#[derive(Clone, Default)]
pub struct StubDriver {
    script: Arc<StubScript>,
}

impl StubDriver {
    /// Create a driver sharing the given script
    pub fn with_script(script: Arc<StubScript>) -> Self {
        Self { script }
    }

    /// The shared script
    pub fn script(&self) -> &Arc<StubScript> {
        &self.script
    }

    fn open(script: Arc<StubScript>) -> Result<Box<dyn Connection>> {
        let failing = script.fail_connects.load(Ordering::Acquire);
        if failing > 0
            && script
                .fail_connects
                .compare_exchange(failing, failing - 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            return Err(Error::connection("scripted connect failure"));
        }
        script.connections_opened.fetch_add(1, Ordering::AcqRel);
        script.record_event(ConnectionEvent::Opened);
        Ok(Box::new(StubConnection {
            script,
            auto_commit: AtomicBool::new(true),
            closed: AtomicBool::new(false),
        }))
    }
}

#[async_trait]
impl Driver for StubDriver {
    async fn connect(
        &self,
        _url: &str,
        _username: Option<&str>,
        _password: Option<&str>,
    ) -> Result<Box<dyn Connection>> {
        Self::open(self.script.clone())
    }
}

struct StubConnection {
    script: Arc<StubScript>,
    auto_commit: AtomicBool,
    closed: AtomicBool,
}

impl StubConnection {
    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(Error::connection("connection is closed"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Connection for StubConnection {
    fn is_auto_commit(&self) -> bool {
        self.auto_commit.load(Ordering::Acquire)
    }

    async fn set_auto_commit(&mut self, on: bool) -> Result<()> {
        self.check_open()?;
        self.auto_commit.store(on, Ordering::Release);
        self.script.record_event(ConnectionEvent::AutoCommit(on));
        Ok(())
    }

    async fn set_isolation(&mut self, level: IsolationLevel) -> Result<()> {
        self.check_open()?;
        self.script
            .record_event(ConnectionEvent::Isolation(level.to_string()));
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        self.check_open()?;
        self.script.record_event(ConnectionEvent::Committed);
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        self.check_open()?;
        self.script.record_event(ConnectionEvent::RolledBack);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.script.record_event(ConnectionEvent::Closed);
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    async fn create_statement(
        &mut self,
        sql: &str,
        options: StatementOptions,
    ) -> Result<Box<dyn Statement>> {
        self.check_open()?;
        Ok(Box::new(StubStatement {
            script: self.script.clone(),
            sql: sql.to_string(),
            options,
            binds: BTreeMap::new(),
            batch: Vec::new(),
            last_fixture: None,
        }))
    }

    async fn ping(&mut self, sql: &str) -> Result<()> {
        self.check_open()?;
        self.script
            .record_event(ConnectionEvent::Pinged(sql.to_string()));
        let failing = self.script.fail_pings.load(Ordering::Acquire);
        if failing > 0
            && self
                .script
                .fail_pings
                .compare_exchange(failing, failing - 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            return Err(Error::execution("scripted ping failure"));
        }
        Ok(())
    }

    fn database_product(&self) -> &str {
        "StubDB"
    }
}

struct StubStatement {
    script: Arc<StubScript>,
    sql: String,
    options: StatementOptions,
    binds: BTreeMap<usize, Value>,
    batch: Vec<Vec<Value>>,
    last_fixture: Option<Fixture>,
}

impl StubStatement {
    fn current_params(&self) -> Vec<Value> {
        self.binds.values().cloned().collect()
    }

    fn record(&self, params: Vec<Value>) {
        self.script.executed.lock().push(ExecutedStatement {
            sql: self.sql.clone(),
            params,
            fetch_size: self.options.fetch_size,
            timeout_ms: self.options.query_timeout.map(|t| t.as_millis() as u64),
        });
    }

    fn cursor(rs: &ResultSetFixture) -> Box<dyn ResultCursor> {
        Box::new(StubCursor {
            metadata: rs.metadata.clone(),
            rows: rs.rows.clone().into(),
        })
    }
}

#[async_trait]
impl Statement for StubStatement {
    fn sql(&self) -> &str {
        &self.sql
    }

    fn bind(&mut self, index: usize, value: Value, _driver_type: DriverType) -> Result<()> {
        self.binds.insert(index, value);
        Ok(())
    }

    fn register_out(&mut self, _index: usize, _driver_type: DriverType) -> Result<()> {
        Ok(())
    }

    async fn execute(&mut self) -> Result<Execution> {
        let params = self.current_params();
        self.record(params);
        let fixture = self.script.take_fixture(&self.sql);
        let Some(fixture) = fixture else {
            return Ok(Execution::updated(0));
        };
        if let Some(message) = &fixture.fail {
            return Err(Error::execution_with_sql(message.clone(), self.sql.clone()));
        }
        let execution = Execution {
            update_count: fixture.update_count,
            result_sets: fixture.result_sets.iter().map(Self::cursor).collect(),
            generated_keys: fixture.generated_keys.as_ref().map(Self::cursor),
        };
        self.last_fixture = Some(fixture);
        Ok(execution)
    }

    fn add_batch(&mut self) -> Result<()> {
        let params = self.current_params();
        self.batch.push(params);
        self.binds.clear();
        Ok(())
    }

    async fn execute_batch(&mut self) -> Result<BatchExecution> {
        let fixture = self.script.take_fixture(&self.sql);
        let mut counts = Vec::with_capacity(self.batch.len());
        for params in self.batch.drain(..) {
            self.script.executed.lock().push(ExecutedStatement {
                sql: self.sql.clone(),
                params,
                fetch_size: self.options.fetch_size,
                timeout_ms: self.options.query_timeout.map(|t| t.as_millis() as u64),
            });
            counts.push(fixture.as_ref().map(|f| f.update_count).unwrap_or(1));
        }
        Ok(BatchExecution {
            update_counts: counts,
            generated_keys: fixture
                .as_ref()
                .and_then(|f| f.generated_keys.as_ref())
                .map(Self::cursor),
        })
    }

    fn out_value(&self, index: usize) -> Result<Value> {
        let fixture = self
            .last_fixture
            .as_ref()
            .ok_or_else(|| Error::execution("statement has not been executed"))?;
        fixture
            .out_values
            .iter()
            .find(|(i, _)| *i == index)
            .map(|(_, v)| v.clone())
            .ok_or_else(|| Error::execution(format!("no OUT value scripted at index {index}")))
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

struct StubCursor {
    metadata: ResultSetMetadata,
    rows: std::collections::VecDeque<Row>,
}

#[async_trait]
impl ResultCursor for StubCursor {
    fn metadata(&self) -> &ResultSetMetadata {
        &self.metadata
    }

    async fn next(&mut self) -> Result<Option<Row>> {
        Ok(self.rows.pop_front())
    }

    async fn close(&mut self) -> Result<()> {
        self.rows.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn executes_scripted_query() {
        let ds = StubDataSource::new();
        ds.script().expect_query(
            "FROM users",
            result_set(
                &["id", "name"],
                vec![vec![Value::from(7_i64), Value::from("Ann")]],
            ),
        );

        let mut conn = ds.connection().await.unwrap();
        let mut stmt = conn
            .create_statement(
                "SELECT id, name FROM users WHERE id = ?",
                StatementOptions::default(),
            )
            .await
            .unwrap();
        stmt.bind(1, Value::from(7_i64), DriverType::BigInt).unwrap();
        let mut execution = stmt.execute().await.unwrap();

        assert_eq!(execution.result_sets.len(), 1);
        let cursor = &mut execution.result_sets[0];
        let row = cursor.next().await.unwrap().unwrap();
        assert_eq!(row.get_by_name("name"), Some(&Value::from("Ann")));
        assert!(cursor.next().await.unwrap().is_none());

        let executed = ds.script().executed();
        assert_eq!(executed.len(), 1);
        assert_eq!(executed[0].params, vec![Value::from(7_i64)]);
    }

    #[tokio::test]
    async fn unmatched_sql_affects_nothing() {
        let ds = StubDataSource::new();
        let mut conn = ds.connection().await.unwrap();
        let mut stmt = conn
            .create_statement("DELETE FROM t", StatementOptions::default())
            .await
            .unwrap();
        let execution = stmt.execute().await.unwrap();
        assert_eq!(execution.update_count, 0);
        assert!(execution.result_sets.is_empty());
    }

    #[tokio::test]
    async fn once_fixtures_are_consumed() {
        let ds = StubDataSource::new();
        ds.script()
            .expect(Fixture::matching("UPDATE t").affecting(5).once());

        let mut conn = ds.connection().await.unwrap();
        let mut stmt = conn
            .create_statement("UPDATE t SET x = ?", StatementOptions::default())
            .await
            .unwrap();
        assert_eq!(stmt.execute().await.unwrap().update_count, 5);
        assert_eq!(stmt.execute().await.unwrap().update_count, 0);
    }

    #[tokio::test]
    async fn records_lifecycle_events() {
        let ds = StubDataSource::new();
        let mut conn = ds.connection().await.unwrap();
        conn.set_auto_commit(false).await.unwrap();
        conn.commit().await.unwrap();
        conn.rollback().await.unwrap();
        conn.close().await.unwrap();

        assert_eq!(
            ds.script().events(),
            vec![
                ConnectionEvent::Opened,
                ConnectionEvent::AutoCommit(false),
                ConnectionEvent::Committed,
                ConnectionEvent::RolledBack,
                ConnectionEvent::Closed,
            ]
        );
    }

    #[tokio::test]
    async fn scripted_failures_surface() {
        let ds = StubDataSource::new();
        ds.script()
            .expect(Fixture::matching("boom").failing("scripted error"));
        let mut conn = ds.connection().await.unwrap();
        let mut stmt = conn
            .create_statement("SELECT boom", StatementOptions::default())
            .await
            .unwrap();
        let err = stmt.execute().await.unwrap_err();
        assert!(err.to_string().contains("scripted error"));
    }
}
