//! Error types for the mapping framework
//!
//! Every failure carries a semantic [`ErrorKind`]; driver-side causes are
//! preserved as sources. Execution errors carry the statement id and a SQL
//! excerpt so failures are attributable from the message alone.

use thiserror::Error;

/// Result type for sqlweave operations
pub type Result<T> = std::result::Result<T, Error>;

/// Semantic error kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Unparsable mapping or configuration markup
    ConfigMalformed,
    /// Unresolved forward references at end of build
    ConfigIncomplete,
    /// Configuration setting not recognized
    ConfigUnknownSetting,
    /// Ambiguous property registration for a type
    ReflectionAmbiguous,
    /// Property not exposed by the target type
    ReflectionMissing,
    /// Type converter failed to bind or decode a value
    ConversionFailed,
    /// Referenced statement id does not resolve
    StatementNotFound,
    /// Driver rejected autocommit/isolation configuration
    TransactionConfig,
    /// Connection acquisition exhausted its tolerance
    PoolExhausted,
    /// Blocking cache lock not obtained before timeout
    CacheLockTimeout,
    /// Driver reported an error during prepare/execute
    ExecutionFailed,
    /// Failure while decoding a result row
    ResultMaterialization,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::ConfigMalformed => "config_malformed",
            Self::ConfigIncomplete => "config_incomplete",
            Self::ConfigUnknownSetting => "config_unknown_setting",
            Self::ReflectionAmbiguous => "reflection_ambiguous",
            Self::ReflectionMissing => "reflection_missing",
            Self::ConversionFailed => "conversion_failed",
            Self::StatementNotFound => "statement_not_found",
            Self::TransactionConfig => "transaction_config",
            Self::PoolExhausted => "pool_exhausted",
            Self::CacheLockTimeout => "cache_lock_timeout",
            Self::ExecutionFailed => "execution_failed",
            Self::ResultMaterialization => "result_materialization",
        };
        write!(f, "{name}")
    }
}

/// Main error type for the mapping framework
#[derive(Error, Debug)]
#[error("{kind}: {message}")]
pub struct Error {
    /// Semantic kind
    pub kind: ErrorKind,
    /// Human-readable context
    pub message: String,
    /// Underlying cause, usually a driver error
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    /// Create an error of the given kind
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    /// Attach an underlying cause
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Unparsable markup
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ConfigMalformed, message)
    }

    /// Unresolved forward references
    pub fn incomplete(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ConfigIncomplete, message)
    }

    /// Unknown setting name
    pub fn unknown_setting(name: &str) -> Self {
        Self::new(
            ErrorKind::ConfigUnknownSetting,
            format!("unknown configuration setting '{name}'"),
        )
    }

    /// Ambiguous property registration
    pub fn ambiguous(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ReflectionAmbiguous, message)
    }

    /// Missing property
    pub fn missing_property(type_name: &str, property: &str) -> Self {
        Self::new(
            ErrorKind::ReflectionMissing,
            format!("type '{type_name}' does not expose property '{property}'"),
        )
    }

    /// Converter failure
    pub fn conversion(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ConversionFailed, message)
    }

    /// Unknown statement id
    pub fn statement_not_found(id: &str) -> Self {
        Self::new(
            ErrorKind::StatementNotFound,
            format!("mapped statement '{id}' is not registered"),
        )
    }

    /// Blocking-cache lock timeout
    pub fn cache_lock_timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::CacheLockTimeout, message)
    }

    /// Execution failure, attributed to a statement and its SQL
    pub fn execution(statement_id: &str, sql: &str, cause: sqlweave_rdbc::Error) -> Self {
        let excerpt: String = sql.chars().take(120).collect();
        Self::new(
            ErrorKind::ExecutionFailed,
            format!("error executing '{statement_id}' [sql: {excerpt}]"),
        )
        .with_source(cause)
    }

    /// Row decoding failure
    pub fn materialization(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ResultMaterialization, message)
    }
}

impl From<sqlweave_rdbc::Error> for Error {
    fn from(e: sqlweave_rdbc::Error) -> Self {
        use sqlweave_rdbc::error::ErrorCategory;
        let kind = match e.category() {
            ErrorCategory::TransactionConfig => ErrorKind::TransactionConfig,
            ErrorCategory::PoolExhausted => ErrorKind::PoolExhausted,
            ErrorCategory::Conversion => ErrorKind::ConversionFailed,
            _ => ErrorKind::ExecutionFailed,
        };
        Self::new(kind, e.to_string()).with_source(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execution_error_carries_statement_and_sql_excerpt() {
        let cause = sqlweave_rdbc::Error::execution("bad syntax");
        let err = Error::execution("user.findById", "SELECT * FROM users WHERE id = ?", cause);
        assert_eq!(err.kind, ErrorKind::ExecutionFailed);
        let text = err.to_string();
        assert!(text.contains("user.findById"));
        assert!(text.contains("SELECT * FROM users"));
    }

    #[test]
    fn rdbc_errors_map_to_kinds() {
        let err: Error = sqlweave_rdbc::Error::pool_exhausted("none left").into();
        assert_eq!(err.kind, ErrorKind::PoolExhausted);

        let err: Error = sqlweave_rdbc::Error::transaction_config("rejected").into();
        assert_eq!(err.kind, ErrorKind::TransactionConfig);

        let err: Error = sqlweave_rdbc::Error::execution("boom").into();
        assert_eq!(err.kind, ErrorKind::ExecutionFailed);
    }

    #[test]
    fn constructor_messages_name_the_subject() {
        assert!(Error::statement_not_found("u.missing")
            .to_string()
            .contains("u.missing"));
        assert!(Error::unknown_setting("frobnicate")
            .to_string()
            .contains("frobnicate"));
        assert!(Error::missing_property("User", "age")
            .to_string()
            .contains("age"));
    }
}
