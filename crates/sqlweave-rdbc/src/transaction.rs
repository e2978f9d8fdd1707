//! Transaction wrappers
//!
//! A transaction binds one connection to a commit/rollback/close lifecycle.
//! Two variants:
//! - [`ManagedTransaction`] lazily obtains a connection from a data source and
//!   owns its lifecycle.
//! - [`ExternalTransaction`] wraps a caller-supplied connection whose
//!   lifecycle is managed elsewhere; commit/rollback/close are no-ops.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::driver::{Connection, DataSource, IsolationLevel};
use crate::error::{Error, Result};

/// A connection bound to a commit/rollback/close lifecycle
#[async_trait]
pub trait Transaction: Send {
    /// The underlying connection, obtained lazily if necessary
    async fn connection(&mut self) -> Result<&mut Box<dyn Connection>>;

    /// Commit, unless the connection is in autocommit mode
    async fn commit(&mut self) -> Result<()>;

    /// Roll back, unless the connection is in autocommit mode
    async fn rollback(&mut self) -> Result<()>;

    /// Release the connection
    async fn close(&mut self) -> Result<()>;

    /// Transaction-scoped timeout, if one applies
    fn timeout(&self) -> Option<Duration> {
        None
    }
}

/// Transaction that manages its connection's full lifecycle.
pub struct ManagedTransaction {
    data_source: Arc<dyn DataSource>,
    connection: Option<Box<dyn Connection>>,
    isolation: Option<IsolationLevel>,
    desired_auto_commit: bool,
}

impl ManagedTransaction {
    /// Create a transaction over a data source. The connection is not opened
    /// until first use.
    pub fn new(
        data_source: Arc<dyn DataSource>,
        isolation: Option<IsolationLevel>,
        desired_auto_commit: bool,
    ) -> Self {
        Self {
            data_source,
            connection: None,
            isolation,
            desired_auto_commit,
        }
    }

    async fn open_connection(&mut self) -> Result<()> {
        debug!("opening transaction connection");
        let mut conn = self.data_source.connection().await?;
        if let Some(level) = self.isolation {
            conn.set_isolation(level).await?;
        }
        if conn.is_auto_commit() != self.desired_auto_commit {
            conn.set_auto_commit(self.desired_auto_commit)
                .await
                .map_err(|e| {
                    Error::transaction_config(format!(
                        "could not set autocommit to {}: {e}",
                        self.desired_auto_commit
                    ))
                })?;
        }
        self.connection = Some(conn);
        Ok(())
    }
}

#[async_trait]
impl Transaction for ManagedTransaction {
    async fn connection(&mut self) -> Result<&mut Box<dyn Connection>> {
        if self.connection.is_none() {
            self.open_connection().await?;
        }
        Ok(self.connection.as_mut().expect("connection just opened"))
    }

    async fn commit(&mut self) -> Result<()> {
        if let Some(conn) = self.connection.as_mut() {
            if !conn.is_auto_commit() {
                debug!("committing transaction");
                conn.commit().await?;
            }
        }
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        if let Some(conn) = self.connection.as_mut() {
            if !conn.is_auto_commit() {
                debug!("rolling back transaction");
                conn.rollback().await?;
            }
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut conn) = self.connection.take() {
            // Some drivers require autocommit before close or they issue an
            // implicit commit of whatever is pending.
            if !conn.is_auto_commit() {
                let _ = conn.set_auto_commit(true).await;
            }
            conn.close().await?;
        }
        Ok(())
    }
}

/// Transaction whose boundaries are controlled outside this process, e.g. by
/// a container. Obtains connections lazily like [`ManagedTransaction`] but
/// never commits or rolls back; `close` only returns the connection.
pub struct DetachedTransaction {
    data_source: Arc<dyn DataSource>,
    connection: Option<Box<dyn Connection>>,
    isolation: Option<IsolationLevel>,
}

impl DetachedTransaction {
    /// Create a detached transaction over a data source
    pub fn new(data_source: Arc<dyn DataSource>, isolation: Option<IsolationLevel>) -> Self {
        Self {
            data_source,
            connection: None,
            isolation,
        }
    }
}

#[async_trait]
impl Transaction for DetachedTransaction {
    async fn connection(&mut self) -> Result<&mut Box<dyn Connection>> {
        if self.connection.is_none() {
            let mut conn = self.data_source.connection().await?;
            if let Some(level) = self.isolation {
                conn.set_isolation(level).await?;
            }
            self.connection = Some(conn);
        }
        Ok(self.connection.as_mut().expect("connection just opened"))
    }

    async fn commit(&mut self) -> Result<()> {
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut conn) = self.connection.take() {
            conn.close().await?;
        }
        Ok(())
    }
}

/// Transaction over a connection whose lifecycle belongs to the caller.
pub struct ExternalTransaction {
    connection: Box<dyn Connection>,
}

impl ExternalTransaction {
    /// Wrap a caller-supplied connection
    pub fn new(connection: Box<dyn Connection>) -> Self {
        Self { connection }
    }
}

#[async_trait]
impl Transaction for ExternalTransaction {
    async fn connection(&mut self) -> Result<&mut Box<dyn Connection>> {
        Ok(&mut self.connection)
    }

    async fn commit(&mut self) -> Result<()> {
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}
