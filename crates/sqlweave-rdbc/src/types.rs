//! Value and row types for sqlweave-rdbc
//!
//! The dynamic value model shared by parameter binding and result decoding:
//! - All primitive SQL types (bool, integers, floats, decimal)
//! - Date/time types with and without timezone
//! - Binary data, UUIDs
//! - Structured values (arrays, objects) used as generic application objects

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use indexmap::IndexMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// SQL value type that can hold any database value.
///
/// `Object` doubles as the generic application object: parameter packing and
/// result materialization both produce `Object` values whose entries preserve
/// declaration order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// SQL NULL
    Null,
    /// Boolean value
    Bool(bool),
    /// 16-bit signed integer (SMALLINT)
    Int16(i16),
    /// 32-bit signed integer (INTEGER)
    Int32(i32),
    /// 64-bit signed integer (BIGINT)
    Int64(i64),
    /// 32-bit floating point (REAL)
    Float32(f32),
    /// 64-bit floating point (DOUBLE PRECISION)
    Float64(f64),
    /// Arbitrary precision decimal (NUMERIC, DECIMAL)
    Decimal(Decimal),
    /// Text string (VARCHAR, TEXT, CHAR)
    String(String),
    /// Binary data (BYTEA, BLOB, VARBINARY)
    Bytes(Vec<u8>),
    /// Date without time (DATE)
    Date(NaiveDate),
    /// Time without date (TIME)
    Time(NaiveTime),
    /// Timestamp without timezone (TIMESTAMP)
    DateTime(NaiveDateTime),
    /// Timestamp with timezone (TIMESTAMPTZ)
    DateTimeTz(DateTime<Utc>),
    /// UUID
    Uuid(uuid::Uuid),
    /// Ordered list of values
    Array(Vec<Value>),
    /// Ordered named properties; the generic application object
    Object(IndexMap<String, Value>),
}

impl Value {
    /// Check if value is NULL
    #[inline]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Get SQL type name
    pub fn sql_type(&self) -> &'static str {
        match self {
            Self::Null => "NULL",
            Self::Bool(_) => "BOOLEAN",
            Self::Int16(_) => "SMALLINT",
            Self::Int32(_) => "INTEGER",
            Self::Int64(_) => "BIGINT",
            Self::Float32(_) => "REAL",
            Self::Float64(_) => "DOUBLE PRECISION",
            Self::Decimal(_) => "DECIMAL",
            Self::String(_) => "VARCHAR",
            Self::Bytes(_) => "BYTEA",
            Self::Date(_) => "DATE",
            Self::Time(_) => "TIME",
            Self::DateTime(_) => "TIMESTAMP",
            Self::DateTimeTz(_) => "TIMESTAMPTZ",
            Self::Uuid(_) => "UUID",
            Self::Array(_) => "ARRAY",
            Self::Object(_) => "OBJECT",
        }
    }

    /// Try to convert to bool
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            Self::Int16(n) => Some(*n != 0),
            Self::Int32(n) => Some(*n != 0),
            Self::Int64(n) => Some(*n != 0),
            Self::String(s) => match s.to_lowercase().as_str() {
                "true" | "t" | "yes" | "y" | "1" => Some(true),
                "false" | "f" | "no" | "n" | "0" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    /// Try to convert to i64
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int16(n) => Some(i64::from(*n)),
            Self::Int32(n) => Some(i64::from(*n)),
            Self::Int64(n) => Some(*n),
            Self::Bool(b) => Some(i64::from(*b)),
            Self::Float32(n) if n.is_finite() => Some(*n as i64),
            Self::Float64(n) if n.is_finite() => Some(*n as i64),
            Self::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Try to convert to f64
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float32(n) => Some(f64::from(*n)),
            Self::Float64(n) => Some(*n),
            Self::Int16(n) => Some(f64::from(*n)),
            Self::Int32(n) => Some(f64::from(*n)),
            Self::Int64(n) => Some(*n as f64),
            Self::Decimal(d) => d.to_string().parse().ok(),
            Self::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Try to view as a string slice
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Try to view as an array slice
    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Self::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Try to view as an object map
    pub fn as_object(&self) -> Option<&IndexMap<String, Value>> {
        match self {
            Self::Object(map) => Some(map),
            _ => None,
        }
    }

    /// Try to view as a mutable object map
    pub fn as_object_mut(&mut self) -> Option<&mut IndexMap<String, Value>> {
        match self {
            Self::Object(map) => Some(map),
            _ => None,
        }
    }

    /// Whether the value is a collection (array or object)
    #[inline]
    pub const fn is_collection(&self) -> bool {
        matches!(self, Self::Array(_) | Self::Object(_))
    }

    /// Render the value as a plain string, the way it would appear inlined
    /// into SQL text. Strings render without quotes.
    pub fn render(&self) -> String {
        match self {
            Self::Null => "null".to_string(),
            Self::Bool(b) => b.to_string(),
            Self::Int16(n) => n.to_string(),
            Self::Int32(n) => n.to_string(),
            Self::Int64(n) => n.to_string(),
            Self::Float32(n) => n.to_string(),
            Self::Float64(n) => n.to_string(),
            Self::Decimal(d) => d.to_string(),
            Self::String(s) => s.clone(),
            Self::Bytes(b) => format!("<{} bytes>", b.len()),
            Self::Date(d) => d.to_string(),
            Self::Time(t) => t.to_string(),
            Self::DateTime(dt) => dt.to_string(),
            Self::DateTimeTz(dt) => dt.to_rfc3339(),
            Self::Uuid(u) => u.to_string(),
            Self::Array(items) => {
                let parts: Vec<String> = items.iter().map(Value::render).collect();
                format!("[{}]", parts.join(", "))
            }
            Self::Object(_) => "<object>".to_string(),
        }
    }

    /// Stable 64-bit hash used for cache-key components.
    ///
    /// Not a cryptographic hash; collisions are tolerated because full
    /// component equality is re-checked on hash match.
    pub fn stable_hash(&self) -> u64 {
        fn mix(acc: u64, byte: u64) -> u64 {
            acc.wrapping_mul(0x100000001b3).wrapping_add(byte)
        }
        fn hash_bytes(tag: u64, bytes: &[u8]) -> u64 {
            let mut acc = 0xcbf29ce484222325u64 ^ tag;
            for b in bytes {
                acc = mix(acc, u64::from(*b));
            }
            acc
        }
        match self {
            Self::Null => 0x9e3779b97f4a7c15,
            Self::Bool(b) => hash_bytes(1, &[u8::from(*b)]),
            Self::Int16(n) => hash_bytes(2, &n.to_le_bytes()),
            Self::Int32(n) => hash_bytes(2, &i64::from(*n).to_le_bytes()[..4]),
            Self::Int64(n) => hash_bytes(2, &n.to_le_bytes()),
            Self::Float32(n) => hash_bytes(3, &f64::from(*n).to_bits().to_le_bytes()),
            Self::Float64(n) => hash_bytes(3, &n.to_bits().to_le_bytes()),
            Self::Decimal(d) => hash_bytes(4, d.to_string().as_bytes()),
            Self::String(s) => hash_bytes(5, s.as_bytes()),
            Self::Bytes(b) => hash_bytes(6, b),
            Self::Date(d) => hash_bytes(7, d.to_string().as_bytes()),
            Self::Time(t) => hash_bytes(7, t.to_string().as_bytes()),
            Self::DateTime(dt) => hash_bytes(7, dt.to_string().as_bytes()),
            Self::DateTimeTz(dt) => hash_bytes(7, dt.to_rfc3339().as_bytes()),
            Self::Uuid(u) => hash_bytes(8, u.as_bytes()),
            Self::Array(items) => {
                let mut acc = 0xcbf29ce484222325u64 ^ 9;
                for item in items {
                    acc = mix(acc, item.stable_hash());
                }
                acc
            }
            Self::Object(map) => {
                let mut acc = 0xcbf29ce484222325u64 ^ 10;
                for (k, v) in map {
                    acc = mix(acc, hash_bytes(5, k.as_bytes()));
                    acc = mix(acc, v.stable_hash());
                }
                acc
            }
        }
    }
}

impl Default for Value {
    fn default() -> Self {
        Self::Null
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.render())
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}
impl From<i16> for Value {
    fn from(v: i16) -> Self {
        Self::Int16(v)
    }
}
impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int32(v)
    }
}
impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int64(v)
    }
}
impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Self::Float32(v)
    }
}
impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float64(v)
    }
}
impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}
impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}
impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(v)
    }
}
impl From<uuid::Uuid> for Value {
    fn from(v: uuid::Uuid) -> Self {
        Self::Uuid(v)
    }
}
impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Self::Array(v)
    }
}
impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(inner) => inner.into(),
            None => Self::Null,
        }
    }
}

/// Wire-level type hint used for parameter binding and column decoding.
///
/// Mirrors the driver API's type codes; `Undefined` means the mapping did not
/// declare one and the converter should infer from the value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum DriverType {
    /// BIT
    Bit,
    /// TINYINT
    TinyInt,
    /// SMALLINT
    SmallInt,
    /// INTEGER
    Integer,
    /// BIGINT
    BigInt,
    /// FLOAT
    Float,
    /// REAL
    Real,
    /// DOUBLE
    Double,
    /// NUMERIC
    Numeric,
    /// DECIMAL
    Decimal,
    /// CHAR
    Char,
    /// VARCHAR
    Varchar,
    /// LONGVARCHAR
    LongVarchar,
    /// DATE
    Date,
    /// TIME
    Time,
    /// TIMESTAMP
    Timestamp,
    /// TIMESTAMP WITH TIME ZONE
    TimestampTz,
    /// BINARY
    Binary,
    /// VARBINARY
    VarBinary,
    /// BLOB
    Blob,
    /// CLOB
    Clob,
    /// BOOLEAN
    Boolean,
    /// UUID
    Uuid,
    /// JSON
    Json,
    /// Driver-specific type
    Other,
    /// SQL NULL type, used to bind typed nulls
    Null,
    /// No driver type declared or reported
    #[default]
    Undefined,
}

impl DriverType {
    /// Parse a driver type from its mapping-markup spelling.
    pub fn parse(name: &str) -> Option<Self> {
        Some(match name.to_ascii_uppercase().as_str() {
            "BIT" => Self::Bit,
            "TINYINT" => Self::TinyInt,
            "SMALLINT" => Self::SmallInt,
            "INTEGER" | "INT" => Self::Integer,
            "BIGINT" => Self::BigInt,
            "FLOAT" => Self::Float,
            "REAL" => Self::Real,
            "DOUBLE" => Self::Double,
            "NUMERIC" => Self::Numeric,
            "DECIMAL" => Self::Decimal,
            "CHAR" => Self::Char,
            "VARCHAR" => Self::Varchar,
            "LONGVARCHAR" => Self::LongVarchar,
            "DATE" => Self::Date,
            "TIME" => Self::Time,
            "TIMESTAMP" => Self::Timestamp,
            "TIMESTAMP_WITH_TIMEZONE" | "TIMESTAMPTZ" => Self::TimestampTz,
            "BINARY" => Self::Binary,
            "VARBINARY" => Self::VarBinary,
            "BLOB" => Self::Blob,
            "CLOB" => Self::Clob,
            "BOOLEAN" => Self::Boolean,
            "UUID" => Self::Uuid,
            "JSON" => Self::Json,
            "OTHER" => Self::Other,
            "NULL" => Self::Null,
            "UNDEFINED" => Self::Undefined,
            _ => return None,
        })
    }

    /// The driver type a value naturally binds as.
    pub fn of(value: &Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(_) => Self::Boolean,
            Value::Int16(_) => Self::SmallInt,
            Value::Int32(_) => Self::Integer,
            Value::Int64(_) => Self::BigInt,
            Value::Float32(_) => Self::Real,
            Value::Float64(_) => Self::Double,
            Value::Decimal(_) => Self::Decimal,
            Value::String(_) => Self::Varchar,
            Value::Bytes(_) => Self::VarBinary,
            Value::Date(_) => Self::Date,
            Value::Time(_) => Self::Time,
            Value::DateTime(_) => Self::Timestamp,
            Value::DateTimeTz(_) => Self::TimestampTz,
            Value::Uuid(_) => Self::Uuid,
            Value::Array(_) | Value::Object(_) => Self::Other,
        }
    }
}

/// Metadata for one result-set column
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMetadata {
    /// Column name or label
    pub name: String,
    /// Driver-reported type
    pub driver_type: DriverType,
    /// Driver-reported type name, if any
    pub type_name: Option<String>,
}

impl ColumnMetadata {
    /// Create column metadata with just a name and type
    pub fn new(name: impl Into<String>, driver_type: DriverType) -> Self {
        Self {
            name: name.into(),
            driver_type,
            type_name: None,
        }
    }
}

/// Ordered column metadata for one result set
#[derive(Debug, Clone, Default)]
pub struct ResultSetMetadata {
    /// Columns in result order
    pub columns: Vec<ColumnMetadata>,
}

impl ResultSetMetadata {
    /// Create metadata from a list of columns
    pub fn new(columns: Vec<ColumnMetadata>) -> Self {
        Self { columns }
    }

    /// Column names in result order
    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    /// Find a column index by case-insensitive name
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name))
    }
}

/// One row of a result set: ordered columns plus values
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Vec<String>,
    values: Vec<Value>,
}

impl Row {
    /// Create a new row
    pub fn new(columns: Vec<String>, values: Vec<Value>) -> Self {
        debug_assert_eq!(columns.len(), values.len());
        Self { columns, values }
    }

    /// Get column count
    #[inline]
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// Check if row is empty
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Get column names
    #[inline]
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Get values in column order
    #[inline]
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Get a value by index
    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    /// Get a value by case-insensitive column name
    pub fn get_by_name(&self, name: &str) -> Option<&Value> {
        self.columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(name))
            .and_then(|i| self.values.get(i))
    }

    /// Consume the row into its values
    pub fn into_values(self) -> Vec<Value> {
        self.values
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_conversions() {
        assert_eq!(Value::from(42_i32).as_i64(), Some(42));
        assert_eq!(Value::from("17").as_i64(), Some(17));
        assert_eq!(Value::from("yes").as_bool(), Some(true));
        assert_eq!(Value::from(1.5_f64).as_f64(), Some(1.5));
        assert!(Value::Null.is_null());
        assert_eq!(Value::from(Option::<i64>::None), Value::Null);
    }

    #[test]
    fn test_value_render() {
        assert_eq!(Value::from("Ann").render(), "Ann");
        assert_eq!(Value::from(7_i64).render(), "7");
        assert_eq!(Value::Null.render(), "null");
        assert_eq!(
            Value::Array(vec![Value::from(1), Value::from(2)]).render(),
            "[1, 2]"
        );
    }

    #[test]
    fn test_stable_hash_distinguishes_values() {
        assert_ne!(
            Value::from("a").stable_hash(),
            Value::from("b").stable_hash()
        );
        assert_ne!(Value::from(1_i64).stable_hash(), Value::Null.stable_hash());
        assert_eq!(
            Value::from("same").stable_hash(),
            Value::from("same").stable_hash()
        );
    }

    #[test]
    fn test_driver_type_parse() {
        assert_eq!(DriverType::parse("VARCHAR"), Some(DriverType::Varchar));
        assert_eq!(DriverType::parse("bigint"), Some(DriverType::BigInt));
        assert_eq!(DriverType::parse("NULL"), Some(DriverType::Null));
        assert_eq!(DriverType::parse("nope"), None);
    }

    #[test]
    fn test_driver_type_of_value() {
        assert_eq!(DriverType::of(&Value::from(1_i32)), DriverType::Integer);
        assert_eq!(DriverType::of(&Value::from("x")), DriverType::Varchar);
        assert_eq!(DriverType::of(&Value::Null), DriverType::Null);
    }

    #[test]
    fn test_row_access() {
        let row = Row::new(
            vec!["id".into(), "name".into()],
            vec![Value::from(7_i64), Value::from("Ann")],
        );
        assert_eq!(row.len(), 2);
        assert_eq!(row.get(0), Some(&Value::from(7_i64)));
        assert_eq!(row.get_by_name("NAME"), Some(&Value::from("Ann")));
        assert_eq!(row.get_by_name("missing"), None);
    }

    #[test]
    fn test_result_set_metadata() {
        let meta = ResultSetMetadata::new(vec![
            ColumnMetadata::new("id", DriverType::BigInt),
            ColumnMetadata::new("user_name", DriverType::Varchar),
        ]);
        assert_eq!(meta.index_of("USER_NAME"), Some(1));
        assert_eq!(meta.index_of("absent"), None);
        assert_eq!(meta.column_names(), vec!["id", "user_name"]);
    }
}
