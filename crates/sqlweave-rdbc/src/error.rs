//! Error types for sqlweave-rdbc
//!
//! Provides granular error classification for proper retry handling:
//! - Retriable errors (connection, pool exhaustion)
//! - Non-retriable errors (execution, conversion, configuration)

use std::fmt;
use thiserror::Error;

/// Result type for sqlweave-rdbc operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error categories for classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Connection-related errors (retriable)
    Connection,
    /// Statement execution errors
    Execution,
    /// Transaction configuration errors (autocommit/isolation rejected)
    TransactionConfig,
    /// Pool exhausted (retriable with backoff)
    PoolExhausted,
    /// Value conversion errors (not retriable)
    Conversion,
    /// Unsupported operation for this driver
    Unsupported,
    /// Unknown/other errors
    Other,
}

impl ErrorCategory {
    /// Whether errors in this category are generally retriable
    #[inline]
    pub const fn is_retriable(self) -> bool {
        matches!(self, Self::Connection | Self::PoolExhausted)
    }
}

/// Main error type for sqlweave-rdbc
#[derive(Error, Debug)]
pub enum Error {
    /// Connection failed or is no longer usable
    #[error("connection error: {message}")]
    Connection {
        /// What went wrong
        message: String,
        /// Underlying driver cause, if any
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Statement prepare or execute failed
    #[error("execution error: {message}")]
    Execution {
        /// What went wrong
        message: String,
        /// The SQL text being executed, if known
        sql: Option<String>,
        /// Underlying driver cause, if any
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Driver rejected autocommit or isolation configuration
    #[error("transaction configuration error: {message}")]
    TransactionConfig {
        /// What went wrong
        message: String,
    },

    /// Connection pool exhausted after bad-connection tolerance
    #[error("pool exhausted: {message}")]
    PoolExhausted {
        /// What went wrong
        message: String,
    },

    /// Value could not be bound or decoded
    #[error("conversion error: {message}")]
    Conversion {
        /// What went wrong
        message: String,
    },

    /// Operation not supported by this driver
    #[error("unsupported: {message}")]
    Unsupported {
        /// What went wrong
        message: String,
    },
}

impl Error {
    /// Get the error category
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Connection { .. } => ErrorCategory::Connection,
            Self::Execution { .. } => ErrorCategory::Execution,
            Self::TransactionConfig { .. } => ErrorCategory::TransactionConfig,
            Self::PoolExhausted { .. } => ErrorCategory::PoolExhausted,
            Self::Conversion { .. } => ErrorCategory::Conversion,
            Self::Unsupported { .. } => ErrorCategory::Unsupported,
        }
    }

    /// Whether this error is retriable
    #[inline]
    pub fn is_retriable(&self) -> bool {
        self.category().is_retriable()
    }

    /// Create a connection error
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            source: None,
        }
    }

    /// Create a connection error with source
    pub fn connection_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Connection {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create an execution error
    pub fn execution(message: impl Into<String>) -> Self {
        Self::Execution {
            message: message.into(),
            sql: None,
            source: None,
        }
    }

    /// Create an execution error carrying the SQL text
    pub fn execution_with_sql(message: impl Into<String>, sql: impl Into<String>) -> Self {
        Self::Execution {
            message: message.into(),
            sql: Some(sql.into()),
            source: None,
        }
    }

    /// Create a transaction configuration error
    pub fn transaction_config(message: impl Into<String>) -> Self {
        Self::TransactionConfig {
            message: message.into(),
        }
    }

    /// Create a pool-exhausted error
    pub fn pool_exhausted(message: impl Into<String>) -> Self {
        Self::PoolExhausted {
            message: message.into(),
        }
    }

    /// Create a conversion error
    pub fn conversion(message: impl Into<String>) -> Self {
        Self::Conversion {
            message: message.into(),
        }
    }

    /// Create an unsupported-operation error
    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::Unsupported {
            message: message.into(),
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection => write!(f, "connection"),
            Self::Execution => write!(f, "execution"),
            Self::TransactionConfig => write!(f, "transaction_config"),
            Self::PoolExhausted => write!(f, "pool_exhausted"),
            Self::Conversion => write!(f, "conversion"),
            Self::Unsupported => write!(f, "unsupported"),
            Self::Other => write!(f, "other"),
        }
    }
}
