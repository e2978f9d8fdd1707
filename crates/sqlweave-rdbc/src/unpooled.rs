//! Non-pooled data source
//!
//! Opens a fresh driver connection per request and applies the configured
//! autocommit and isolation preferences. The pooled source wraps this one.

use async_trait::async_trait;
use std::sync::Arc;

use crate::driver::{Connection, DataSource, Driver, IsolationLevel};
use crate::error::Result;

/// Data source that opens a new connection on every request.
#[derive(Clone)]
pub struct UnpooledDataSource {
    driver: Arc<dyn Driver>,
    url: String,
    username: Option<String>,
    password: Option<String>,
    auto_commit: Option<bool>,
    default_isolation: Option<IsolationLevel>,
}

impl UnpooledDataSource {
    /// Create a data source over a driver and connection URL
    pub fn new(driver: Arc<dyn Driver>, url: impl Into<String>) -> Self {
        Self {
            driver,
            url: url.into(),
            username: None,
            password: None,
            auto_commit: None,
            default_isolation: None,
        }
    }

    /// Set credentials
    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Set the desired autocommit mode applied to every new connection
    pub fn with_auto_commit(mut self, on: bool) -> Self {
        self.auto_commit = Some(on);
        self
    }

    /// Set the isolation level applied to every new connection
    pub fn with_default_isolation(mut self, level: IsolationLevel) -> Self {
        self.default_isolation = Some(level);
        self
    }

    /// Connection URL
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Configured username
    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    /// Configured password
    pub fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }

    async fn configure(&self, conn: &mut dyn Connection) -> Result<()> {
        if let Some(level) = self.default_isolation {
            conn.set_isolation(level).await?;
        }
        if let Some(on) = self.auto_commit {
            if conn.is_auto_commit() != on {
                conn.set_auto_commit(on).await?;
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for UnpooledDataSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnpooledDataSource")
            .field("url", &self.url)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("auto_commit", &self.auto_commit)
            .field("default_isolation", &self.default_isolation)
            .finish()
    }
}

#[async_trait]
impl DataSource for UnpooledDataSource {
    async fn connection(&self) -> Result<Box<dyn Connection>> {
        let mut conn = self
            .driver
            .connect(&self.url, self.username.as_deref(), self.password.as_deref())
            .await?;
        self.configure(conn.as_mut()).await?;
        Ok(conn)
    }
}
