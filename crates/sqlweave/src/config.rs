//! Configuration
//!
//! The root value threaded through every session: global settings, type
//! aliases, the converter and metadata registries, the environment, and the
//! statement registry. There are no globals; sessions are built from an
//! explicit `Arc<Configuration>`.

use sqlweave_rdbc::driver::{DataSource, IsolationLevel};
use sqlweave_rdbc::transaction::{DetachedTransaction, ManagedTransaction, Transaction};
use sqlweave_rdbc::DriverType;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::convert::ConverterRegistry;
use crate::error::{Error, Result};
use crate::meta::MetaRegistry;
use crate::registry::StatementRegistry;

/// How unmapped columns are applied to result objects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AutoMappingBehavior {
    /// Never auto-map
    None,
    /// Auto-map only results without nested result maps
    #[default]
    Partial,
    /// Auto-map everything, including nested results
    Full,
}

/// What to do when auto-mapping meets a column with no matching property
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnknownColumnBehavior {
    /// Ignore silently
    #[default]
    None,
    /// Log a warning
    Warning,
    /// Fail the query
    Failing,
}

/// Which executor variant a session uses by default
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutorType {
    /// Fresh statement per operation
    #[default]
    Simple,
    /// Reuse prepared statements per SQL text
    Reuse,
    /// Defer writes into driver batches
    Batch,
}

/// Lifetime of the executor-local cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LocalCacheScope {
    /// Entries live until a write or the session ends
    #[default]
    Session,
    /// Entries are dropped after each top-level statement
    Statement,
}

/// Global settings with their documented defaults
#[derive(Debug, Clone)]
pub struct Settings {
    /// Master switch for the second-tier cache
    pub cache_enabled: bool,
    /// Defer nested selects flagged lazy
    pub lazy_loading_enabled: bool,
    /// Loading any lazy property loads them all
    pub aggressive_lazy_loading: bool,
    /// Allow statements to return multiple result sets
    pub multiple_result_sets_enabled: bool,
    /// Use column labels instead of column names
    pub use_column_label: bool,
    /// Request driver-generated keys for all inserts
    pub use_generated_keys: bool,
    /// Unmapped-column application policy
    pub auto_mapping_behavior: AutoMappingBehavior,
    /// Unknown-column reaction during auto-mapping
    pub auto_mapping_unknown_column_behavior: UnknownColumnBehavior,
    /// Default executor variant
    pub default_executor_type: ExecutorType,
    /// Default statement timeout
    pub default_statement_timeout: Option<Duration>,
    /// Default fetch size
    pub default_fetch_size: Option<u32>,
    /// Match `user_name` columns to `userName` properties
    pub map_underscore_to_camel_case: bool,
    /// Forbid row bounds on nested statements
    pub safe_row_bounds_enabled: bool,
    /// Forbid result handlers on nested statements
    pub safe_result_handler_enabled: bool,
    /// Local cache lifetime
    pub local_cache_scope: LocalCacheScope,
    /// Driver type bound for null parameters without a declared type
    pub driver_type_for_null: DriverType,
    /// Method names that trigger loading of all lazy properties
    pub lazy_load_trigger_methods: Vec<String>,
    /// Call setters for null columns
    pub call_setters_on_nulls: bool,
    /// Produce an instance for rows where every column is null
    pub return_instance_for_empty_row: bool,
    /// Use declared argument names for parameter packing
    pub use_actual_param_name: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            cache_enabled: true,
            lazy_loading_enabled: false,
            aggressive_lazy_loading: false,
            multiple_result_sets_enabled: true,
            use_column_label: true,
            use_generated_keys: false,
            auto_mapping_behavior: AutoMappingBehavior::Partial,
            auto_mapping_unknown_column_behavior: UnknownColumnBehavior::None,
            default_executor_type: ExecutorType::Simple,
            default_statement_timeout: None,
            default_fetch_size: None,
            map_underscore_to_camel_case: false,
            safe_row_bounds_enabled: false,
            safe_result_handler_enabled: true,
            local_cache_scope: LocalCacheScope::Session,
            driver_type_for_null: DriverType::Other,
            lazy_load_trigger_methods: vec![
                "equals".to_string(),
                "clone".to_string(),
                "hashCode".to_string(),
                "toString".to_string(),
            ],
            call_setters_on_nulls: false,
            return_instance_for_empty_row: false,
            use_actual_param_name: true,
        }
    }
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(Error::malformed(format!(
            "setting '{name}' expects true/false, got '{value}'"
        ))),
    }
}

impl Settings {
    /// Apply one setting by its markup name. Unknown names fail with
    /// `ConfigUnknownSetting`.
    pub fn apply(&mut self, name: &str, value: &str) -> Result<()> {
        match name {
            "cacheEnabled" => self.cache_enabled = parse_bool(name, value)?,
            "lazyLoadingEnabled" => self.lazy_loading_enabled = parse_bool(name, value)?,
            "aggressiveLazyLoading" => self.aggressive_lazy_loading = parse_bool(name, value)?,
            "multipleResultSetsEnabled" => {
                self.multiple_result_sets_enabled = parse_bool(name, value)?
            }
            "useColumnLabel" => self.use_column_label = parse_bool(name, value)?,
            "useGeneratedKeys" => self.use_generated_keys = parse_bool(name, value)?,
            "autoMappingBehavior" => {
                self.auto_mapping_behavior = match value.to_ascii_uppercase().as_str() {
                    "NONE" => AutoMappingBehavior::None,
                    "PARTIAL" => AutoMappingBehavior::Partial,
                    "FULL" => AutoMappingBehavior::Full,
                    _ => {
                        return Err(Error::malformed(format!(
                            "bad autoMappingBehavior '{value}'"
                        )))
                    }
                }
            }
            "autoMappingUnknownColumnBehavior" => {
                self.auto_mapping_unknown_column_behavior =
                    match value.to_ascii_uppercase().as_str() {
                        "NONE" => UnknownColumnBehavior::None,
                        "WARNING" => UnknownColumnBehavior::Warning,
                        "FAILING" => UnknownColumnBehavior::Failing,
                        _ => {
                            return Err(Error::malformed(format!(
                                "bad autoMappingUnknownColumnBehavior '{value}'"
                            )))
                        }
                    }
            }
            "defaultExecutorType" => {
                self.default_executor_type = match value.to_ascii_uppercase().as_str() {
                    "SIMPLE" => ExecutorType::Simple,
                    "REUSE" => ExecutorType::Reuse,
                    "BATCH" => ExecutorType::Batch,
                    _ => {
                        return Err(Error::malformed(format!(
                            "bad defaultExecutorType '{value}'"
                        )))
                    }
                }
            }
            "defaultStatementTimeout" => {
                let secs: u64 = value.parse().map_err(|_| {
                    Error::malformed(format!("bad defaultStatementTimeout '{value}'"))
                })?;
                self.default_statement_timeout = Some(Duration::from_secs(secs));
            }
            "defaultFetchSize" => {
                self.default_fetch_size = Some(value.parse().map_err(|_| {
                    Error::malformed(format!("bad defaultFetchSize '{value}'"))
                })?);
            }
            "mapUnderscoreToCamelCase" => {
                self.map_underscore_to_camel_case = parse_bool(name, value)?
            }
            "safeRowBoundsEnabled" => self.safe_row_bounds_enabled = parse_bool(name, value)?,
            "safeResultHandlerEnabled" => {
                self.safe_result_handler_enabled = parse_bool(name, value)?
            }
            "localCacheScope" => {
                self.local_cache_scope = match value.to_ascii_uppercase().as_str() {
                    "SESSION" => LocalCacheScope::Session,
                    "STATEMENT" => LocalCacheScope::Statement,
                    _ => return Err(Error::malformed(format!("bad localCacheScope '{value}'"))),
                }
            }
            "jdbcTypeForNull" | "driverTypeForNull" => {
                self.driver_type_for_null = DriverType::parse(value).ok_or_else(|| {
                    Error::malformed(format!("bad driver type for null '{value}'"))
                })?;
            }
            "lazyLoadTriggerMethods" => {
                self.lazy_load_trigger_methods =
                    value.split(',').map(|s| s.trim().to_string()).collect();
            }
            "callSettersOnNulls" => self.call_setters_on_nulls = parse_bool(name, value)?,
            "returnInstanceForEmptyRow" => {
                self.return_instance_for_empty_row = parse_bool(name, value)?
            }
            "useActualParamName" => self.use_actual_param_name = parse_bool(name, value)?,
            other => return Err(Error::unknown_setting(other)),
        }
        Ok(())
    }
}

/// How transactions are created for an environment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransactionFactory {
    /// The framework drives commit/rollback on the connection
    #[default]
    Managed,
    /// Transaction boundaries are controlled outside the framework
    External,
}

impl TransactionFactory {
    /// Parse from configuration markup
    pub fn parse(name: &str) -> Result<Self> {
        match name.to_ascii_uppercase().as_str() {
            "MANAGED" | "JDBC" => Ok(Self::Managed),
            "EXTERNAL" => Ok(Self::External),
            other => Err(Error::malformed(format!(
                "unknown transaction manager type '{other}'"
            ))),
        }
    }

    /// Create a transaction over the data source
    pub fn new_transaction(
        &self,
        data_source: Arc<dyn DataSource>,
        isolation: Option<IsolationLevel>,
        auto_commit: bool,
    ) -> Box<dyn Transaction> {
        match self {
            Self::Managed => Box::new(ManagedTransaction::new(data_source, isolation, auto_commit)),
            Self::External => Box::new(DetachedTransaction::new(data_source, isolation)),
        }
    }
}

/// One configured environment: transactions plus a data source
#[derive(Clone)]
pub struct Environment {
    /// Environment id
    pub id: String,
    /// Transaction creation strategy
    pub transaction_factory: TransactionFactory,
    /// The data source sessions draw connections from
    pub data_source: Arc<dyn DataSource>,
}

impl Environment {
    /// Create an environment
    pub fn new(
        id: impl Into<String>,
        transaction_factory: TransactionFactory,
        data_source: Arc<dyn DataSource>,
    ) -> Self {
        Self {
            id: id.into(),
            transaction_factory,
            data_source,
        }
    }
}

/// The assembled configuration behind a session factory
pub struct Configuration {
    /// Global settings
    pub settings: Settings,
    /// Active database id, if a provider matched one
    pub database_id: Option<String>,
    /// Alias → type name
    pub type_aliases: HashMap<String, String>,
    /// Converter registry
    pub converters: ConverterRegistry,
    /// Type metadata registry
    pub meta: MetaRegistry,
    /// The environment sessions run against
    pub environment: Option<Environment>,
    /// Everything the mapping compiler registered
    pub registry: StatementRegistry,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            settings: Settings::default(),
            database_id: None,
            type_aliases: HashMap::new(),
            converters: ConverterRegistry::new(),
            meta: MetaRegistry::new(),
            environment: None,
            registry: StatementRegistry::new(),
        }
    }
}

impl Configuration {
    /// A configuration with defaults and no environment
    pub fn new() -> Self {
        Self::default()
    }

    /// A configuration bound to an environment
    pub fn with_environment(environment: Environment) -> Self {
        Self {
            environment: Some(environment),
            ..Self::default()
        }
    }

    /// Register a type alias
    pub fn add_type_alias(&mut self, alias: impl Into<String>, type_name: impl Into<String>) {
        self.type_aliases.insert(alias.into(), type_name.into());
    }

    /// Resolve a type name through the alias table
    pub fn resolve_type_name<'a>(&'a self, name: &'a str) -> &'a str {
        self.type_aliases.get(name).map(String::as_str).unwrap_or(name)
    }

    /// The environment, or an error if none was configured
    pub fn environment(&self) -> Result<&Environment> {
        self.environment
            .as_ref()
            .ok_or_else(|| Error::malformed("no environment configured"))
    }
}
