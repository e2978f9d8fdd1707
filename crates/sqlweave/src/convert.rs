//! Type conversion registry
//!
//! Two-axis lookup `(application type, driver type) → converter` driving both
//! parameter binding and row-column decoding. Resolution tries the explicit
//! driver type, then the no-driver-type default, then the unique-converter
//! fallback; absence is memoized so repeated misses stay cheap. Named
//! application types without a registration get the default enum converter;
//! `Object` and driver-undefined columns go through [`UnknownConverter`].

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use rust_decimal::Decimal;
use sqlweave_rdbc::driver::Statement;
use sqlweave_rdbc::types::{DriverType, Row, Value};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use crate::error::{Error, Result};

/// Application-side type identifier: the first lookup axis.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AppType {
    /// bool
    Bool,
    /// i16
    I16,
    /// i32
    I32,
    /// i64
    I64,
    /// f32
    F32,
    /// f64
    F64,
    /// Arbitrary-precision decimal
    Decimal,
    /// String
    String,
    /// Byte array
    Bytes,
    /// Calendar date
    Date,
    /// Time of day
    Time,
    /// Timestamp without zone
    DateTime,
    /// Timestamp with zone
    DateTimeTz,
    /// UUID
    Uuid,
    /// Free-form object / map
    Object,
    /// List of values
    Array,
    /// A named application type (described entity or enum)
    Named(String),
}

impl AppType {
    /// Parse an application type from its mapping-markup spelling.
    /// Unrecognized names become [`AppType::Named`].
    pub fn parse(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "bool" | "boolean" => Self::Bool,
            "i16" | "short" => Self::I16,
            "i32" | "int" | "integer" => Self::I32,
            "i64" | "long" => Self::I64,
            "f32" | "float" => Self::F32,
            "f64" | "double" => Self::F64,
            "decimal" | "bigdecimal" => Self::Decimal,
            "string" | "str" => Self::String,
            "bytes" | "byte[]" | "blob" => Self::Bytes,
            "date" => Self::Date,
            "time" => Self::Time,
            "datetime" | "timestamp" => Self::DateTime,
            "datetimetz" | "timestamptz" => Self::DateTimeTz,
            "uuid" => Self::Uuid,
            "object" | "map" | "hashmap" => Self::Object,
            "array" | "list" | "collection" => Self::Array,
            _ => Self::Named(name.to_string()),
        }
    }

    /// The application type a value naturally is
    pub fn of(value: &Value) -> Self {
        match value {
            Value::Null => Self::Object,
            Value::Bool(_) => Self::Bool,
            Value::Int16(_) => Self::I16,
            Value::Int32(_) => Self::I32,
            Value::Int64(_) => Self::I64,
            Value::Float32(_) => Self::F32,
            Value::Float64(_) => Self::F64,
            Value::Decimal(_) => Self::Decimal,
            Value::String(_) => Self::String,
            Value::Bytes(_) => Self::Bytes,
            Value::Date(_) => Self::Date,
            Value::Time(_) => Self::Time,
            Value::DateTime(_) => Self::DateTime,
            Value::DateTimeTz(_) => Self::DateTimeTz,
            Value::Uuid(_) => Self::Uuid,
            Value::Array(_) => Self::Array,
            Value::Object(_) => Self::Object,
        }
    }

    /// Whether this type is a scalar (single-column) type
    pub fn is_scalar(&self) -> bool {
        !matches!(self, Self::Object | Self::Array | Self::Named(_))
    }

    /// The application type a driver type naturally decodes to
    pub fn of_driver(driver_type: DriverType) -> Self {
        match driver_type {
            DriverType::Bit | DriverType::Boolean => Self::Bool,
            DriverType::TinyInt | DriverType::SmallInt => Self::I16,
            DriverType::Integer => Self::I32,
            DriverType::BigInt => Self::I64,
            DriverType::Float | DriverType::Real => Self::F32,
            DriverType::Double => Self::F64,
            DriverType::Numeric | DriverType::Decimal => Self::Decimal,
            DriverType::Char
            | DriverType::Varchar
            | DriverType::LongVarchar
            | DriverType::Clob
            | DriverType::Json => Self::String,
            DriverType::Date => Self::Date,
            DriverType::Time => Self::Time,
            DriverType::Timestamp => Self::DateTime,
            DriverType::TimestampTz => Self::DateTimeTz,
            DriverType::Binary | DriverType::VarBinary | DriverType::Blob => Self::Bytes,
            DriverType::Uuid => Self::Uuid,
            DriverType::Other | DriverType::Null | DriverType::Undefined => Self::Object,
        }
    }
}

/// Coerce a value to the given application type, leniently.
pub fn coerce(value: &Value, target: &AppType) -> Result<Value> {
    if value.is_null() {
        return Ok(Value::Null);
    }
    let fail = || {
        Error::conversion(format!(
            "cannot convert {} value '{}' to {:?}",
            value.sql_type(),
            value.render(),
            target
        ))
    };
    Ok(match target {
        AppType::Bool => Value::Bool(value.as_bool().ok_or_else(fail)?),
        AppType::I16 => Value::Int16(
            value
                .as_i64()
                .and_then(|n| i16::try_from(n).ok())
                .ok_or_else(fail)?,
        ),
        AppType::I32 => Value::Int32(
            value
                .as_i64()
                .and_then(|n| i32::try_from(n).ok())
                .ok_or_else(fail)?,
        ),
        AppType::I64 => Value::Int64(value.as_i64().ok_or_else(fail)?),
        AppType::F32 => Value::Float32(value.as_f64().ok_or_else(fail)? as f32),
        AppType::F64 => Value::Float64(value.as_f64().ok_or_else(fail)?),
        AppType::Decimal => match value {
            Value::Decimal(d) => Value::Decimal(*d),
            other => Value::Decimal(
                Decimal::from_str(other.render().trim()).map_err(|_| fail())?,
            ),
        },
        AppType::String => Value::String(value.render()),
        AppType::Bytes => match value {
            Value::Bytes(b) => Value::Bytes(b.clone()),
            Value::String(s) => Value::Bytes(s.clone().into_bytes()),
            _ => return Err(fail()),
        },
        AppType::Date => match value {
            Value::Date(d) => Value::Date(*d),
            Value::DateTime(dt) => Value::Date(dt.date()),
            Value::String(s) => {
                Value::Date(NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|_| fail())?)
            }
            _ => return Err(fail()),
        },
        AppType::Time => match value {
            Value::Time(t) => Value::Time(*t),
            Value::DateTime(dt) => Value::Time(dt.time()),
            Value::String(s) => {
                Value::Time(NaiveTime::parse_from_str(s, "%H:%M:%S").map_err(|_| fail())?)
            }
            _ => return Err(fail()),
        },
        AppType::DateTime => match value {
            Value::DateTime(dt) => Value::DateTime(*dt),
            Value::DateTimeTz(dt) => Value::DateTime(dt.naive_utc()),
            Value::Date(d) => Value::DateTime(d.and_hms_opt(0, 0, 0).ok_or_else(fail)?),
            Value::String(s) => Value::DateTime(
                NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
                    .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S"))
                    .map_err(|_| fail())?,
            ),
            _ => return Err(fail()),
        },
        AppType::DateTimeTz => match value {
            Value::DateTimeTz(dt) => Value::DateTimeTz(*dt),
            Value::DateTime(dt) => Value::DateTimeTz(dt.and_utc()),
            Value::String(s) => Value::DateTimeTz(
                chrono::DateTime::parse_from_rfc3339(s)
                    .map(|dt| dt.with_timezone(&chrono::Utc))
                    .map_err(|_| fail())?,
            ),
            _ => return Err(fail()),
        },
        AppType::Uuid => match value {
            Value::Uuid(u) => Value::Uuid(*u),
            Value::String(s) => Value::Uuid(uuid::Uuid::parse_str(s).map_err(|_| fail())?),
            Value::Bytes(b) => {
                Value::Uuid(uuid::Uuid::from_slice(b).map_err(|_| fail())?)
            }
            _ => return Err(fail()),
        },
        AppType::Object | AppType::Array | AppType::Named(_) => value.clone(),
    })
}

/// A registered value converter.
///
/// A converter registered under an application type must be able to bind any
/// value assignable to that type.
pub trait Converter: Send + Sync {
    /// Bind a value to a statement by positional index
    fn bind(
        &self,
        stmt: &mut dyn Statement,
        index: usize,
        value: &Value,
        driver_type: DriverType,
    ) -> Result<()>;

    /// Decode a column by name
    fn decode_by_name(&self, row: &Row, column: &str) -> Result<Value>;

    /// Decode a column by index
    fn decode_by_index(&self, row: &Row, index: usize) -> Result<Value>;

    /// Decode a callable-statement OUT parameter by index
    fn decode_out(&self, stmt: &dyn Statement, index: usize) -> Result<Value>;
}

/// Converter for one scalar application type: coerces on both axes.
pub struct ScalarConverter {
    target: AppType,
}

impl ScalarConverter {
    /// Create a converter targeting the given type
    pub fn new(target: AppType) -> Self {
        Self { target }
    }
}

impl Converter for ScalarConverter {
    fn bind(
        &self,
        stmt: &mut dyn Statement,
        index: usize,
        value: &Value,
        driver_type: DriverType,
    ) -> Result<()> {
        let coerced = coerce(value, &self.target)?;
        stmt.bind(index, coerced, driver_type)?;
        Ok(())
    }

    fn decode_by_name(&self, row: &Row, column: &str) -> Result<Value> {
        match row.get_by_name(column) {
            Some(v) => coerce(v, &self.target),
            None => Ok(Value::Null),
        }
    }

    fn decode_by_index(&self, row: &Row, index: usize) -> Result<Value> {
        match row.get(index) {
            Some(v) => coerce(v, &self.target),
            None => Ok(Value::Null),
        }
    }

    fn decode_out(&self, stmt: &dyn Statement, index: usize) -> Result<Value> {
        coerce(&stmt.out_value(index)?, &self.target)
    }
}

/// Converter for columns and parameters with no usable type information:
/// binds values as their natural driver type and decodes columns as whatever
/// the driver reported.
pub struct UnknownConverter;

impl Converter for UnknownConverter {
    fn bind(
        &self,
        stmt: &mut dyn Statement,
        index: usize,
        value: &Value,
        driver_type: DriverType,
    ) -> Result<()> {
        let driver_type = if driver_type == DriverType::Undefined {
            DriverType::of(value)
        } else {
            driver_type
        };
        stmt.bind(index, value.clone(), driver_type)?;
        Ok(())
    }

    fn decode_by_name(&self, row: &Row, column: &str) -> Result<Value> {
        Ok(row.get_by_name(column).cloned().unwrap_or(Value::Null))
    }

    fn decode_by_index(&self, row: &Row, index: usize) -> Result<Value> {
        Ok(row.get(index).cloned().unwrap_or(Value::Null))
    }

    fn decode_out(&self, stmt: &dyn Statement, index: usize) -> Result<Value> {
        Ok(stmt.out_value(index)?)
    }
}

/// Default converter for named enum-like types: values travel as their
/// string names.
pub struct EnumNameConverter;

impl Converter for EnumNameConverter {
    fn bind(
        &self,
        stmt: &mut dyn Statement,
        index: usize,
        value: &Value,
        _driver_type: DriverType,
    ) -> Result<()> {
        let coerced = coerce(value, &AppType::String)?;
        stmt.bind(index, coerced, DriverType::Varchar)?;
        Ok(())
    }

    fn decode_by_name(&self, row: &Row, column: &str) -> Result<Value> {
        match row.get_by_name(column) {
            Some(v) => coerce(v, &AppType::String),
            None => Ok(Value::Null),
        }
    }

    fn decode_by_index(&self, row: &Row, index: usize) -> Result<Value> {
        match row.get(index) {
            Some(v) => coerce(v, &AppType::String),
            None => Ok(Value::Null),
        }
    }

    fn decode_out(&self, stmt: &dyn Statement, index: usize) -> Result<Value> {
        coerce(&stmt.out_value(index)?, &AppType::String)
    }
}

type DriverTable = HashMap<Option<DriverType>, Arc<dyn Converter>>;

/// The two-axis converter registry.
pub struct ConverterRegistry {
    by_app: parking_lot::RwLock<HashMap<AppType, DriverTable>>,
    named: parking_lot::RwLock<HashMap<String, Arc<dyn Converter>>>,
    unknown: Arc<dyn Converter>,
    default_enum: Arc<dyn Converter>,
}

impl Default for ConverterRegistry {
    fn default() -> Self {
        let registry = Self {
            by_app: parking_lot::RwLock::new(HashMap::new()),
            named: parking_lot::RwLock::new(HashMap::new()),
            unknown: Arc::new(UnknownConverter),
            default_enum: Arc::new(EnumNameConverter),
        };
        registry.register_builtins();
        registry
    }
}

impl ConverterRegistry {
    /// Create a registry pre-populated with the built-in scalar converters
    pub fn new() -> Self {
        Self::default()
    }

    fn register_builtins(&self) {
        use AppType::*;
        let pairs: &[(AppType, &[DriverType])] = &[
            (Bool, &[DriverType::Boolean, DriverType::Bit]),
            (I16, &[DriverType::SmallInt, DriverType::TinyInt]),
            (I32, &[DriverType::Integer]),
            (I64, &[DriverType::BigInt]),
            (F32, &[DriverType::Real, DriverType::Float]),
            (F64, &[DriverType::Double]),
            (Decimal, &[DriverType::Decimal, DriverType::Numeric]),
            (
                String,
                &[
                    DriverType::Varchar,
                    DriverType::Char,
                    DriverType::LongVarchar,
                    DriverType::Clob,
                ],
            ),
            (
                Bytes,
                &[DriverType::VarBinary, DriverType::Binary, DriverType::Blob],
            ),
            (Date, &[DriverType::Date]),
            (Time, &[DriverType::Time]),
            (DateTime, &[DriverType::Timestamp]),
            (DateTimeTz, &[DriverType::TimestampTz]),
            (Uuid, &[DriverType::Uuid]),
        ];
        for (app, drivers) in pairs {
            let converter: Arc<dyn Converter> = Arc::new(ScalarConverter::new(app.clone()));
            self.register(app.clone(), None, converter.clone());
            for driver in *drivers {
                self.register(app.clone(), Some(*driver), converter.clone());
            }
        }
    }

    /// Register a converter under an application type and optional driver type
    pub fn register(
        &self,
        app_type: AppType,
        driver_type: Option<DriverType>,
        converter: Arc<dyn Converter>,
    ) {
        self.by_app
            .write()
            .entry(app_type)
            .or_default()
            .insert(driver_type, converter);
    }

    /// Register a converter under a name, usable as a per-mapping override
    pub fn register_named(&self, name: impl Into<String>, converter: Arc<dyn Converter>) {
        self.named.write().insert(name.into(), converter);
    }

    /// Look up a named converter override
    pub fn named(&self, name: &str) -> Option<Arc<dyn Converter>> {
        self.named.read().get(name).cloned()
    }

    /// The fallback converter for unknown shapes
    pub fn unknown(&self) -> Arc<dyn Converter> {
        self.unknown.clone()
    }

    /// Resolve a converter for the given axes.
    pub fn resolve(&self, app_type: &AppType, driver_type: DriverType) -> Option<Arc<dyn Converter>> {
        {
            let tables = self.by_app.read();
            if let Some(table) = tables.get(app_type) {
                return Self::pick(table, driver_type);
            }
        }
        // First miss for this application type: enums get the default enum
        // converter; everything else memoizes absence with an empty table.
        let mut tables = self.by_app.write();
        let table = tables.entry(app_type.clone()).or_default();
        if table.is_empty() {
            if let AppType::Named(_) = app_type {
                table.insert(None, self.default_enum.clone());
            }
        }
        Self::pick(table, driver_type)
    }

    /// Resolve with the unknown-converter fallback
    pub fn resolve_or_unknown(
        &self,
        app_type: &AppType,
        driver_type: DriverType,
    ) -> Arc<dyn Converter> {
        self.resolve(app_type, driver_type)
            .unwrap_or_else(|| self.unknown.clone())
    }

    fn pick(table: &DriverTable, driver_type: DriverType) -> Option<Arc<dyn Converter>> {
        if let Some(c) = table.get(&Some(driver_type)) {
            return Some(c.clone());
        }
        if let Some(c) = table.get(&None) {
            return Some(c.clone());
        }
        // Unique-converter fallback: if every registration is the same
        // converter, the driver type did not matter after all.
        let mut unique: Option<&Arc<dyn Converter>> = None;
        for c in table.values() {
            match unique {
                None => unique = Some(c),
                Some(seen) if Arc::ptr_eq(seen, c) => {}
                Some(_) => return None,
            }
        }
        unique.cloned()
    }
}
