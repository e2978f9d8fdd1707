//! # sqlweave-rdbc
//!
//! Driver-facing foundation for the sqlweave SQL mapping framework.
//!
//! This crate defines the dynamic SQL value model and the driver contract the
//! framework executes against, plus the two stock data sources:
//!
//! - **Value model**: [`types::Value`], [`types::Row`], [`types::DriverType`]
//! - **Driver traits**: [`driver::Driver`], [`driver::DataSource`],
//!   [`driver::Connection`], [`driver::Statement`], [`driver::ResultCursor`]
//! - **Unpooled source**: opens a fresh connection per request
//! - **Pooled source**: bounded broker with overdue-claim reclamation and
//!   ping-based health checks
//! - **Transactions**: managed and externally-managed lifecycles
//! - **Stub driver**: a scripted in-memory driver for tests
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use sqlweave_rdbc::prelude::*;
//!
//! let unpooled = UnpooledDataSource::new(driver, "db://localhost/app")
//!     .with_credentials("app", "secret");
//! let pool = PooledDataSource::with_config(
//!     unpooled,
//!     PoolConfig::default().with_max_active(20),
//! );
//!
//! let mut conn = pool.connection().await?;
//! let mut stmt = conn
//!     .create_statement("SELECT * FROM users WHERE id = ?", Default::default())
//!     .await?;
//! stmt.bind(1, Value::Int64(1), DriverType::BigInt)?;
//! let execution = stmt.execute().await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod driver;
pub mod error;
pub mod pool;
pub mod stub;
pub mod transaction;
pub mod types;
pub mod unpooled;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::error::{Error, ErrorCategory, Result};

    pub use crate::types::{ColumnMetadata, DriverType, ResultSetMetadata, Row, Value};

    pub use crate::driver::{
        BatchExecution, Connection, DataSource, Driver, Execution, IsolationLevel, ResultCursor,
        Statement, StatementOptions,
    };

    pub use crate::pool::{PoolConfig, PoolStats, PooledConnection, PooledDataSource};

    pub use crate::transaction::{
        DetachedTransaction, ExternalTransaction, ManagedTransaction, Transaction,
    };

    pub use crate::unpooled::UnpooledDataSource;

    pub use crate::stub::{
        result_set, ConnectionEvent, ExecutedStatement, Fixture, ResultSetFixture, StubDataSource,
        StubDriver, StubScript,
    };
}

// Re-export commonly used items at crate root
pub use error::{Error, Result};
pub use types::{DriverType, Row, Value};
