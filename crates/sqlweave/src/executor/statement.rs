//! Statement handler
//!
//! Prepares driver statements from bound SQL, binds parameters through the
//! converter registry, and reads OUT parameters back. Three statement kinds:
//! plain (inline SQL, no binds), prepared (positional binds), callable
//! (OUT registration plus binds).

use sqlweave_rdbc::driver::{Connection, Statement, StatementOptions};
use sqlweave_rdbc::{DriverType, Value};
use std::sync::Arc;
use std::time::Duration;

use crate::config::Configuration;
use crate::convert::Converter;
use crate::error::{Error, Result};
use crate::mapping::{BoundSql, KeyGeneratorKind, MappedStatement, ParameterMapping, StatementType};
use crate::meta::path::{self, PropertyPath};

/// Resolve the value a parameter mapping binds, in priority order: scoped
/// bindings from rendering, the whole parameter for scalar objects, then a
/// property path into the parameter object.
pub fn resolve_parameter_value(
    bound_sql: &BoundSql,
    parameter: &Value,
    mapping: &ParameterMapping,
) -> Value {
    let property = mapping.property.as_str();
    if bound_sql.has_additional(property) {
        let head = PropertyPath::first_name(property);
        let base = bound_sql.additional.get(head).cloned().unwrap_or(Value::Null);
        let rest = &property[head.len()..];
        let rest = rest.strip_prefix('.').unwrap_or(rest);
        if rest.is_empty() {
            return base;
        }
        return path::get_path(&base, rest).cloned().unwrap_or(Value::Null);
    }
    match parameter {
        Value::Object(_) => path::get_path(parameter, property)
            .cloned()
            .unwrap_or(Value::Null),
        // Scalar parameters bind whole regardless of the declared name.
        other => other.clone(),
    }
}

/// Routes prepare/parameterize/out-parameter handling per statement kind.
pub struct StatementHandler<'a> {
    config: &'a Configuration,
    ms: &'a Arc<MappedStatement>,
    bound_sql: &'a BoundSql,
}

impl<'a> StatementHandler<'a> {
    /// Create a handler for one execution
    pub fn new(
        config: &'a Configuration,
        ms: &'a Arc<MappedStatement>,
        bound_sql: &'a BoundSql,
    ) -> Self {
        Self {
            config,
            ms,
            bound_sql,
        }
    }

    fn query_timeout(&self, transaction_timeout: Option<Duration>) -> Option<Duration> {
        let statement_timeout = self
            .ms
            .timeout
            .or(self.config.settings.default_statement_timeout);
        // The transaction deadline clips whatever the statement asked for.
        match (statement_timeout, transaction_timeout) {
            (Some(s), Some(t)) => Some(s.min(t)),
            (s, t) => s.or(t),
        }
    }

    /// Create the driver statement with fetch size, timeout, and
    /// generated-key options applied.
    pub async fn prepare(
        &self,
        connection: &mut dyn Connection,
        transaction_timeout: Option<Duration>,
    ) -> Result<Box<dyn Statement>> {
        let options = StatementOptions {
            fetch_size: self.ms.fetch_size.or(self.config.settings.default_fetch_size),
            query_timeout: self.query_timeout(transaction_timeout),
            return_generated_keys: self.ms.key_generator == KeyGeneratorKind::DriverGenerated
                || (self.config.settings.use_generated_keys
                    && self.ms.command_type == crate::mapping::SqlCommandType::Insert),
            key_columns: self.ms.key_columns.clone(),
        };
        connection
            .create_statement(&self.bound_sql.sql, options)
            .await
            .map_err(|e| Error::execution(&self.ms.id, &self.bound_sql.sql, e))
    }

    fn converter_for(&self, mapping: &ParameterMapping) -> Result<Arc<dyn Converter>> {
        if let Some(name) = &mapping.converter {
            return self.config.converters.named(name).ok_or_else(|| {
                Error::conversion(format!(
                    "no converter registered under '{name}' for '{}'",
                    self.ms.id
                ))
            });
        }
        Ok(self
            .config
            .converters
            .resolve_or_unknown(&mapping.app_type, mapping.driver_type))
    }

    fn bind_driver_type(&self, mapping: &ParameterMapping, value: &Value) -> DriverType {
        if mapping.driver_type != DriverType::Undefined {
            return mapping.driver_type;
        }
        if value.is_null() {
            return self.config.settings.driver_type_for_null;
        }
        DriverType::of(value)
    }

    /// Bind parameters per the statement kind
    pub fn parameterize(&self, stmt: &mut dyn Statement, parameter: &Value) -> Result<()> {
        match self.ms.statement_type {
            StatementType::Statement => Ok(()),
            StatementType::Prepared => self.bind_parameters(stmt, parameter),
            StatementType::Callable => {
                self.register_out_parameters(stmt)?;
                self.bind_parameters(stmt, parameter)
            }
        }
    }

    fn bind_parameters(&self, stmt: &mut dyn Statement, parameter: &Value) -> Result<()> {
        for (i, mapping) in self.bound_sql.parameter_mappings.iter().enumerate() {
            if !mapping.mode.is_in() {
                continue;
            }
            let value = resolve_parameter_value(self.bound_sql, parameter, mapping);
            let driver_type = self.bind_driver_type(mapping, &value);
            let converter = self.converter_for(mapping)?;
            converter.bind(stmt, i + 1, &value, driver_type).map_err(|e| {
                Error::conversion(format!(
                    "could not bind parameter '{}' of '{}': {e}",
                    mapping.property, self.ms.id
                ))
            })?;
        }
        Ok(())
    }

    fn register_out_parameters(&self, stmt: &mut dyn Statement) -> Result<()> {
        for (i, mapping) in self.bound_sql.parameter_mappings.iter().enumerate() {
            if mapping.mode.is_out() {
                stmt.register_out(i + 1, mapping.driver_type)
                    .map_err(|e| Error::execution(&self.ms.id, &self.bound_sql.sql, e))?;
            }
        }
        Ok(())
    }

    /// Read OUT parameters back into the caller's parameter object
    pub fn process_out_parameters(
        &self,
        stmt: &dyn Statement,
        parameter: &mut Value,
    ) -> Result<()> {
        if self.ms.statement_type != StatementType::Callable {
            return Ok(());
        }
        for (i, mapping) in self.bound_sql.parameter_mappings.iter().enumerate() {
            if !mapping.mode.is_out() {
                continue;
            }
            let converter = self.converter_for(mapping)?;
            let value = converter.decode_out(stmt, i + 1).map_err(|e| {
                Error::conversion(format!(
                    "could not decode OUT parameter '{}' of '{}': {e}",
                    mapping.property, self.ms.id
                ))
            })?;
            path::set_path(parameter, &mapping.property, value);
        }
        Ok(())
    }
}
