//! Mapping model
//!
//! The immutable descriptors the compiler registers and the runtime executes:
//! mapped statements, result maps and their mappings, parameter mappings,
//! discriminators, and the bound SQL produced by evaluating a statement's
//! SQL source against a parameter.

use indexmap::IndexMap;
use sqlweave_rdbc::{DriverType, Value};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use crate::convert::AppType;
use crate::error::Result;

/// What a statement does
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlCommandType {
    /// Read rows
    Select,
    /// Insert rows
    Insert,
    /// Update rows
    Update,
    /// Delete rows
    Delete,
}

impl SqlCommandType {
    /// Whether this command modifies data
    pub fn is_write(&self) -> bool {
        !matches!(self, Self::Select)
    }
}

/// How the driver statement is created
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StatementType {
    /// Plain statement, SQL built inline
    Statement,
    /// Prepared statement with positional parameters
    #[default]
    Prepared,
    /// Callable statement with OUT parameter support
    Callable,
}

/// Parameter direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParameterMode {
    /// Input only
    #[default]
    In,
    /// Output only
    Out,
    /// Both directions
    InOut,
}

impl ParameterMode {
    /// Whether a value flows into the statement
    pub fn is_in(&self) -> bool {
        matches!(self, Self::In | Self::InOut)
    }

    /// Whether a value flows back out
    pub fn is_out(&self) -> bool {
        matches!(self, Self::Out | Self::InOut)
    }
}

/// One positional parameter of a bound SQL string
#[derive(Debug, Clone)]
pub struct ParameterMapping {
    /// Property path resolved against the parameter object
    pub property: String,
    /// Direction
    pub mode: ParameterMode,
    /// Declared application type
    pub app_type: AppType,
    /// Declared driver type
    pub driver_type: DriverType,
    /// Numeric scale for decimal OUT parameters
    pub numeric_scale: Option<u32>,
    /// Named converter override
    pub converter: Option<String>,
    /// Result map decoding an OUT cursor parameter
    pub result_map: Option<String>,
}

impl ParameterMapping {
    /// An IN parameter with inferred types
    pub fn of(property: impl Into<String>) -> Self {
        Self {
            property: property.into(),
            mode: ParameterMode::In,
            app_type: AppType::Object,
            driver_type: DriverType::Undefined,
            numeric_scale: None,
            converter: None,
            result_map: None,
        }
    }
}

/// Final SQL plus its ordered parameter bindings
#[derive(Debug, Clone)]
pub struct BoundSql {
    /// SQL text with positional `?` markers
    pub sql: String,
    /// One mapping per marker, in order
    pub parameter_mappings: Vec<ParameterMapping>,
    /// Scoped bindings created during rendering (foreach items, bind vars)
    pub additional: IndexMap<String, Value>,
}

impl BoundSql {
    /// Bound SQL with no parameters
    pub fn of(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            parameter_mappings: Vec::new(),
            additional: IndexMap::new(),
        }
    }

    /// Whether a scoped binding exists for the head of a property path
    pub fn has_additional(&self, property: &str) -> bool {
        let head = crate::meta::path::PropertyPath::first_name(property);
        self.additional.contains_key(head)
    }
}

/// Evaluates to bound SQL for a given parameter object
pub trait SqlSource: Send + Sync {
    /// Produce final SQL and bindings for the parameter
    fn bound_sql(&self, config: &crate::config::Configuration, parameter: &Value)
        -> Result<BoundSql>;
}

/// Column-to-property mapping inside a result map
#[derive(Debug, Clone, Default)]
pub struct ResultMapping {
    /// Target property
    pub property: Option<String>,
    /// Source column
    pub column: Option<String>,
    /// Declared application type
    pub app_type: Option<AppType>,
    /// Declared driver type
    pub driver_type: DriverType,
    /// Named converter override
    pub converter: Option<String>,
    /// Statement id fetched to produce this property (nested query)
    pub nested_select: Option<String>,
    /// Result map materialized from the same row (nested mapping)
    pub nested_result_map: Option<String>,
    /// Part of the row identity
    pub id_flag: bool,
    /// Passed to the constructor instead of set as a property
    pub constructor_flag: bool,
    /// Columns that must all be non-null for the nested object to exist
    pub not_null_columns: Vec<String>,
    /// Prefix applied to nested columns
    pub column_prefix: Option<String>,
    /// Composite (property, column) bindings parameterizing a nested select
    pub composites: Vec<(String, String)>,
    /// Defer the nested select until the top-level query finishes
    pub lazy: bool,
    /// Accumulate into a list-valued property
    pub collection: bool,
}

impl ResultMapping {
    /// A plain column-to-property mapping
    pub fn column(property: impl Into<String>, column: impl Into<String>) -> Self {
        Self {
            property: Some(property.into()),
            column: Some(column.into()),
            ..Default::default()
        }
    }
}

/// Column-driven subtype selector
#[derive(Debug, Clone)]
pub struct Discriminator {
    /// Column holding the discriminating value
    pub column: String,
    /// Declared application type of the column
    pub app_type: AppType,
    /// Declared driver type of the column
    pub driver_type: DriverType,
    /// Value → result map id
    pub cases: IndexMap<String, String>,
}

/// Declarative mapping from columns to an object shape
#[derive(Debug, Clone)]
pub struct ResultMap {
    /// Fully qualified id
    pub id: String,
    /// Target type name
    pub type_name: String,
    /// Target application type
    pub app_type: AppType,
    /// All mappings in declaration order
    pub mappings: Vec<ResultMapping>,
    /// Subtype selector
    pub discriminator: Option<Discriminator>,
    /// Per-map auto-mapping override
    pub auto_mapping: Option<bool>,
    /// Uppercased mapped column names (after prefixes)
    pub mapped_columns: HashSet<String>,
}

impl ResultMap {
    /// Build a result map, computing the derived column set
    pub fn new(
        id: impl Into<String>,
        type_name: impl Into<String>,
        mappings: Vec<ResultMapping>,
    ) -> Self {
        let type_name = type_name.into();
        let mapped_columns = mappings
            .iter()
            .filter_map(|m| m.column.as_ref())
            .map(|c| c.to_uppercase())
            .collect();
        Self {
            id: id.into(),
            app_type: AppType::parse(&type_name),
            type_name,
            mappings,
            discriminator: None,
            auto_mapping: None,
            mapped_columns,
        }
    }

    /// Attach a discriminator
    pub fn with_discriminator(mut self, discriminator: Discriminator) -> Self {
        self.discriminator = Some(discriminator);
        self
    }

    /// Override auto-mapping for this map
    pub fn with_auto_mapping(mut self, on: bool) -> Self {
        self.auto_mapping = Some(on);
        self
    }

    /// Mappings flagged CONSTRUCTOR, in declaration order
    pub fn constructor_mappings(&self) -> impl Iterator<Item = &ResultMapping> {
        self.mappings.iter().filter(|m| m.constructor_flag)
    }

    /// Mappings not flagged CONSTRUCTOR
    pub fn property_mappings(&self) -> impl Iterator<Item = &ResultMapping> {
        self.mappings.iter().filter(|m| !m.constructor_flag)
    }

    /// Mappings flagged ID; used for row-key identity
    pub fn id_mappings(&self) -> impl Iterator<Item = &ResultMapping> {
        self.mappings.iter().filter(|m| m.id_flag)
    }

    /// Whether any mapping materializes a nested result map
    pub fn has_nested_result_maps(&self) -> bool {
        self.mappings.iter().any(|m| m.nested_result_map.is_some())
    }
}

/// Ordered parameter shape declared separately from the statement
#[derive(Debug, Clone)]
pub struct ParameterMap {
    /// Fully qualified id
    pub id: String,
    /// Mappings in declaration order
    pub mappings: Vec<ParameterMapping>,
}

/// How generated keys are produced for a statement
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum KeyGeneratorKind {
    /// No key handling
    #[default]
    None,
    /// Ask the driver for generated keys after execute
    DriverGenerated,
    /// Run a companion select before or after the main statement
    SelectKey {
        /// Id of the companion statement
        statement_id: String,
        /// Run before the main statement instead of after
        execute_before: bool,
    },
}

/// A compiled SQL operation descriptor. Created once at registry build time,
/// immutable thereafter, referenced by id for the process lifetime.
pub struct MappedStatement {
    /// Fully qualified `namespace.id`
    pub id: String,
    /// Owning namespace
    pub namespace: String,
    /// Command kind
    pub command_type: SqlCommandType,
    /// Driver statement kind
    pub statement_type: StatementType,
    /// SQL source evaluated per invocation
    pub sql_source: Arc<dyn SqlSource>,
    /// Explicit parameter map id
    pub parameter_map: Option<String>,
    /// Result map ids, one per expected result set
    pub result_maps: Vec<String>,
    /// Fetch size hint
    pub fetch_size: Option<u32>,
    /// Statement-level timeout
    pub timeout: Option<Duration>,
    /// Clear caches before executing
    pub flush_cache: bool,
    /// Serve and populate the namespace cache
    pub use_cache: bool,
    /// Generated-key strategy
    pub key_generator: KeyGeneratorKind,
    /// Properties receiving generated keys
    pub key_properties: Vec<String>,
    /// Columns producing generated keys
    pub key_columns: Vec<String>,
    /// Only active under this database id
    pub database_id: Option<String>,
    /// Names for multiple result sets
    pub result_sets: Vec<String>,
}

impl MappedStatement {
    /// Start building a statement
    pub fn builder(
        id: impl Into<String>,
        command_type: SqlCommandType,
        sql_source: Arc<dyn SqlSource>,
    ) -> MappedStatementBuilder {
        let id = id.into();
        let namespace = id.rsplit_once('.').map(|(ns, _)| ns.to_string()).unwrap_or_default();
        MappedStatementBuilder {
            statement: MappedStatement {
                id,
                namespace,
                command_type,
                statement_type: StatementType::Prepared,
                sql_source,
                parameter_map: None,
                result_maps: Vec::new(),
                fetch_size: None,
                timeout: None,
                flush_cache: command_type.is_write(),
                use_cache: !command_type.is_write(),
                key_generator: KeyGeneratorKind::None,
                key_properties: Vec::new(),
                key_columns: Vec::new(),
                database_id: None,
                result_sets: Vec::new(),
            },
        }
    }
}

/// Builder for [`MappedStatement`]
pub struct MappedStatementBuilder {
    statement: MappedStatement,
}

impl MappedStatementBuilder {
    /// Set the driver statement kind
    pub fn statement_type(mut self, t: StatementType) -> Self {
        self.statement.statement_type = t;
        self
    }

    /// Reference a parameter map
    pub fn parameter_map(mut self, id: Option<String>) -> Self {
        self.statement.parameter_map = id;
        self
    }

    /// Reference result maps
    pub fn result_maps(mut self, ids: Vec<String>) -> Self {
        self.statement.result_maps = ids;
        self
    }

    /// Set the fetch size hint
    pub fn fetch_size(mut self, size: Option<u32>) -> Self {
        self.statement.fetch_size = size;
        self
    }

    /// Set the statement timeout
    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.statement.timeout = timeout;
        self
    }

    /// Override cache flushing
    pub fn flush_cache(mut self, on: bool) -> Self {
        self.statement.flush_cache = on;
        self
    }

    /// Override cache use
    pub fn use_cache(mut self, on: bool) -> Self {
        self.statement.use_cache = on;
        self
    }

    /// Set the key-generator strategy
    pub fn key_generator(mut self, kind: KeyGeneratorKind) -> Self {
        self.statement.key_generator = kind;
        self
    }

    /// Set the key properties
    pub fn key_properties(mut self, properties: Vec<String>) -> Self {
        self.statement.key_properties = properties;
        self
    }

    /// Set the key columns
    pub fn key_columns(mut self, columns: Vec<String>) -> Self {
        self.statement.key_columns = columns;
        self
    }

    /// Restrict to a database id
    pub fn database_id(mut self, id: Option<String>) -> Self {
        self.statement.database_id = id;
        self
    }

    /// Name the expected result sets
    pub fn result_sets(mut self, names: Vec<String>) -> Self {
        self.statement.result_sets = names;
        self
    }

    /// Finish the statement
    pub fn build(self) -> Arc<MappedStatement> {
        Arc::new(self.statement)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StaticSql(&'static str);
    impl SqlSource for StaticSql {
        fn bound_sql(
            &self,
            _config: &crate::config::Configuration,
            _parameter: &Value,
        ) -> Result<BoundSql> {
            Ok(BoundSql::of(self.0))
        }
    }

    #[test]
    fn statement_defaults_follow_command_type() {
        let select = MappedStatement::builder(
            "u.findById",
            SqlCommandType::Select,
            Arc::new(StaticSql("SELECT 1")),
        )
        .build();
        assert!(select.use_cache);
        assert!(!select.flush_cache);
        assert_eq!(select.namespace, "u");

        let insert = MappedStatement::builder(
            "u.create",
            SqlCommandType::Insert,
            Arc::new(StaticSql("INSERT")),
        )
        .build();
        assert!(!insert.use_cache);
        assert!(insert.flush_cache);
    }

    #[test]
    fn result_map_partitions_mappings() {
        let mut ctor = ResultMapping::column("id", "id");
        ctor.constructor_flag = true;
        ctor.id_flag = true;
        let name = ResultMapping::column("name", "user_name");

        let map = ResultMap::new("u.userMap", "User", vec![ctor, name]);
        assert_eq!(map.constructor_mappings().count(), 1);
        assert_eq!(map.property_mappings().count(), 1);
        assert_eq!(map.id_mappings().count(), 1);
        assert!(map.mapped_columns.contains("USER_NAME"));
        assert!(!map.has_nested_result_maps());
    }

    #[test]
    fn bound_sql_tracks_additional_bindings() {
        let mut bound = BoundSql::of("SELECT * FROM t WHERE a = ?");
        bound
            .additional
            .insert("__frch_item_0".to_string(), Value::from(1_i64));
        assert!(bound.has_additional("__frch_item_0"));
        assert!(bound.has_additional("__frch_item_0.nested"));
        assert!(!bound.has_additional("other"));
    }
}
