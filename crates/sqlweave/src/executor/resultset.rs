//! Result set handler
//!
//! Walks driver cursors and materializes application objects per result map:
//! discriminator chains, constructor mappings, nested selects (inline or
//! deferred), nested result maps with row-key identity and collection
//! aggregation, and column auto-mapping.

use sqlweave_rdbc::driver::{Execution, ResultCursor};
use sqlweave_rdbc::types::{ResultSetMetadata, Row};
use sqlweave_rdbc::{DriverType, Value};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::{AutoMappingBehavior, Configuration, UnknownColumnBehavior};
use crate::convert::{AppType, Converter};
use crate::error::{Error, Result};
use crate::mapping::{MappedStatement, ResultMap, ResultMapping};
use crate::meta::{self, path};

use super::{DeferredLoad, Executor, ResultHandler, RowBounds};

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Process every result set of an execution per the statement's result maps.
///
/// With a single result map the produced objects are returned directly; with
/// several, each set's objects are wrapped in an array element.
pub async fn handle_result_sets(
    executor: &mut dyn Executor,
    ms: &Arc<MappedStatement>,
    execution: Execution,
    bounds: RowBounds,
    mut handler: Option<&mut dyn ResultHandler>,
) -> Result<Vec<Value>> {
    let config = executor.base_ref().config.clone();
    let mut cursors = execution.result_sets;
    if ms.result_maps.is_empty() {
        return Ok(Vec::new());
    }

    let take = if config.settings.multiple_result_sets_enabled {
        ms.result_maps.len()
    } else {
        1
    };

    let mut lists: Vec<Vec<Value>> = Vec::new();
    for (i, rm_id) in ms.result_maps.iter().take(take).enumerate() {
        let Some(cursor) = cursors.get_mut(i) else {
            // Driver produced fewer result sets than declared; stop quietly
            // but leave a trace of what went unconsumed.
            debug!(
                statement = %ms.id,
                expected = ms.result_maps.len(),
                produced = i,
                names = ?ms.result_sets,
                "driver returned fewer result sets than declared"
            );
            break;
        };
        let rm = config.registry.result_map(rm_id)?;
        let fut = process_result_set(
            executor,
            &config,
            &rm,
            cursor.as_mut(),
            bounds,
            handler.as_deref_mut(),
        );
        let result = fut.await;
        let list = result?;
        lists.push(list);
    }

    if lists.len() <= 1 {
        Ok(lists.pop().unwrap_or_default())
    } else {
        Ok(lists.into_iter().map(Value::Array).collect())
    }
}

async fn process_result_set(
    executor: &mut dyn Executor,
    config: &Arc<Configuration>,
    rm: &Arc<ResultMap>,
    cursor: &mut dyn ResultCursor,
    bounds: RowBounds,
    mut handler: Option<&mut dyn ResultHandler>,
) -> Result<Vec<Value>> {
    let meta = cursor.metadata().clone();
    let mut out: Vec<Value> = Vec::new();
    let mut identity: HashMap<String, usize> = HashMap::new();
    let mut skipped = 0usize;
    let mut processed = 0usize;

    while let Some(row) = cursor.next().await? {
        if skipped < bounds.offset {
            skipped += 1;
            continue;
        }
        if processed >= bounds.limit {
            break;
        }
        processed += 1;

        let active = resolve_discriminated(config, rm.clone(), &row, "")?;

        if active.has_nested_result_maps() {
            if let Some(key) = row_key(&active, &row, "") {
                if let Some(&index) = identity.get(&key) {
                    // Same ancestor: only fold this row's nested objects in.
                    let mut existing = std::mem::replace(&mut out[index], Value::Null);
                    merge_nested(executor, config, &active, &row, &meta, &mut existing, "")
                        .await?;
                    out[index] = existing;
                    continue;
                }
                identity.insert(key, out.len());
            }
        }

        let value = materialize_row(
            executor,
            config,
            &active,
            &row,
            &meta,
            "",
            out.len(),
            true,
        )
        .await?;
        let value = match value {
            Some(v) => v,
            None => {
                if config.settings.return_instance_for_empty_row {
                    empty_instance(config, &active)
                } else {
                    Value::Null
                }
            }
        };
        if let Some(h) = handler.as_mut() {
            h.handle(&value);
        }
        out.push(value);
    }
    Ok(out)
}

fn empty_instance(config: &Configuration, rm: &ResultMap) -> Value {
    let type_name = config.resolve_type_name(&rm.type_name).to_string();
    config
        .meta
        .descriptor(&type_name)
        .map(|d| d.create_default())
        .unwrap_or_else(|| Value::Object(indexmap::IndexMap::new()))
}

fn prefixed(prefix: &str, column: &str) -> String {
    if prefix.is_empty() {
        column.to_string()
    } else {
        format!("{prefix}{column}")
    }
}

/// Follow the discriminator chain to the effective result map, guarding
/// against cycles.
fn resolve_discriminated(
    config: &Configuration,
    rm: Arc<ResultMap>,
    row: &Row,
    prefix: &str,
) -> Result<Arc<ResultMap>> {
    let mut current = rm;
    let mut seen: HashSet<String> = HashSet::new();
    seen.insert(current.id.clone());
    while let Some(discriminator) = current.discriminator.clone() {
        let column = prefixed(prefix, &discriminator.column);
        let value = row
            .get_by_name(&column)
            .cloned()
            .unwrap_or(Value::Null)
            .render();
        let Some(next_id) = discriminator.cases.get(&value) else {
            break;
        };
        if !seen.insert(next_id.clone()) {
            break;
        }
        current = config.registry.result_map(next_id)?;
    }
    Ok(current)
}

/// Composite identity of a row under a result map: ID-flagged columns, or
/// every plain mapped column when no IDs are declared. `None` when every
/// participating column is null.
fn row_key(rm: &ResultMap, row: &Row, prefix: &str) -> Option<String> {
    let id_mappings: Vec<&ResultMapping> = {
        let ids: Vec<&ResultMapping> = rm.id_mappings().collect();
        if ids.is_empty() {
            rm.mappings
                .iter()
                .filter(|m| m.column.is_some() && m.nested_result_map.is_none())
                .collect()
        } else {
            ids
        }
    };
    let mut key = String::new();
    let mut any = false;
    for mapping in id_mappings {
        let Some(column) = &mapping.column else {
            continue;
        };
        let column = prefixed(prefix, column);
        let value = row.get_by_name(&column).cloned().unwrap_or(Value::Null);
        if !value.is_null() {
            any = true;
        }
        key.push_str(&column);
        key.push('=');
        key.push_str(&value.render());
        key.push('|');
    }
    if any {
        Some(format!("{}::{key}", rm.id))
    } else {
        None
    }
}

fn decode_column(
    config: &Configuration,
    mapping: &ResultMapping,
    declared: Option<&AppType>,
    row: &Row,
    meta: &ResultSetMetadata,
    column: &str,
) -> Result<Value> {
    let column_driver_type = meta
        .columns
        .iter()
        .find(|c| c.name.eq_ignore_ascii_case(column))
        .map(|c| c.driver_type)
        .unwrap_or(DriverType::Undefined);
    let driver_type = if mapping.driver_type != DriverType::Undefined {
        mapping.driver_type
    } else {
        column_driver_type
    };
    let app_type = mapping
        .app_type
        .clone()
        .or_else(|| declared.cloned())
        .unwrap_or_else(|| AppType::of_driver(driver_type));

    let converter: Arc<dyn Converter> = match &mapping.converter {
        Some(name) => config.converters.named(name).ok_or_else(|| {
            Error::conversion(format!("no converter registered under '{name}'"))
        })?,
        None => config.converters.resolve_or_unknown(&app_type, driver_type),
    };
    converter.decode_by_name(row, column).map_err(|e| {
        Error::materialization(format!("could not decode column '{column}': {e}"))
    })
}

fn not_null_satisfied(mapping: &ResultMapping, row: &Row, prefix: &str) -> bool {
    if mapping.not_null_columns.is_empty() {
        return true;
    }
    mapping.not_null_columns.iter().all(|column| {
        row.get_by_name(&prefixed(prefix, column))
            .map(|v| !v.is_null())
            .unwrap_or(false)
    })
}

fn nested_select_parameter(mapping: &ResultMapping, row: &Row, prefix: &str) -> Option<Value> {
    if !mapping.composites.is_empty() {
        let mut object = indexmap::IndexMap::new();
        let mut any = false;
        for (property, column) in &mapping.composites {
            let value = row
                .get_by_name(&prefixed(prefix, column))
                .cloned()
                .unwrap_or(Value::Null);
            if !value.is_null() {
                any = true;
            }
            object.insert(property.clone(), value);
        }
        return any.then_some(Value::Object(object));
    }
    let column = mapping.column.as_ref()?;
    let value = row.get_by_name(&prefixed(prefix, column)).cloned()?;
    (!value.is_null()).then_some(value)
}

/// Whether two materialized objects are the same entity under a result map's
/// identity columns.
fn same_identity(rm: &ResultMap, a: &Value, b: &Value) -> bool {
    let ids: Vec<&ResultMapping> = rm.id_mappings().collect();
    if ids.is_empty() {
        return a == b;
    }
    ids.iter().all(|m| {
        let Some(property) = &m.property else {
            return false;
        };
        path::get_path(a, property) == path::get_path(b, property)
    })
}

#[allow(clippy::too_many_arguments)]
fn materialize_row<'a>(
    executor: &'a mut dyn Executor,
    config: &'a Arc<Configuration>,
    rm: &'a Arc<ResultMap>,
    row: &'a Row,
    meta: &'a ResultSetMetadata,
    prefix: &'a str,
    row_index: usize,
    top_level: bool,
) -> BoxFuture<'a, Result<Option<Value>>> {
    Box::pin(async move {
        let type_name = config.resolve_type_name(&rm.type_name).to_string();
        let descriptor = config.meta.descriptor(&type_name);

        // Scalar shapes with no explicit mappings decode the first column.
        if rm.app_type.is_scalar() && rm.mappings.is_empty() {
            let value = row.get(0).cloned().unwrap_or(Value::Null);
            if value.is_null() {
                return Ok(None);
            }
            return Ok(Some(crate::convert::coerce(&value, &rm.app_type)?));
        }

        let mut object = descriptor
            .as_ref()
            .map(|d| d.create_default())
            .unwrap_or_else(|| Value::Object(indexmap::IndexMap::new()));
        let mut found_values = false;

        // Constructor mappings are decoded first and set positionally.
        let ctor_mappings: Vec<ResultMapping> = rm.constructor_mappings().cloned().collect();
        for (i, mapping) in ctor_mappings.iter().enumerate() {
            let value = if let Some(nested_id) = &mapping.nested_result_map {
                let nested_rm = config.registry.result_map(nested_id)?;
                let nested_prefix = compose_prefix(prefix, mapping);
                materialize_row(
                    executor,
                    config,
                    &nested_rm,
                    row,
                    meta,
                    &nested_prefix,
                    row_index,
                    false,
                )
                .await?
                .unwrap_or(Value::Null)
            } else if let Some(select_id) = &mapping.nested_select {
                run_nested_select(executor, select_id, mapping, row, prefix).await?
            } else if let Some(column) = &mapping.column {
                let column = prefixed(prefix, column);
                decode_column(config, mapping, None, row, meta, &column)?
            } else {
                Value::Null
            };
            if !value.is_null() {
                found_values = true;
            }
            let property = mapping
                .property
                .clone()
                .or_else(|| {
                    descriptor
                        .as_ref()
                        .and_then(|d| d.constructor())
                        .and_then(|names| names.get(i).cloned())
                })
                .ok_or_else(|| {
                    Error::materialization(format!(
                        "constructor mapping {i} of '{}' has no resolvable property",
                        rm.id
                    ))
                })?;
            path::set_path(&mut object, &property, value);
        }

        // Property mappings.
        let property_mappings: Vec<ResultMapping> = rm.property_mappings().cloned().collect();
        for mapping in &property_mappings {
            let Some(property) = mapping.property.clone() else {
                continue;
            };
            // Pathed properties write through nested objects; only simple
            // names are validated against the descriptor.
            let simple_name = !property.contains('.') && !property.contains('[');
            if simple_name {
                if let Some(d) = descriptor.as_ref() {
                    let writable = d.property(&property).map(|p| p.writable).unwrap_or(false);
                    if !writable {
                        return Err(Error::missing_property(d.name(), &property));
                    }
                }
            }

            if let Some(nested_id) = &mapping.nested_result_map {
                if !not_null_satisfied(mapping, row, prefix) {
                    if mapping.collection {
                        path::set_path(&mut object, &property, Value::Array(Vec::new()));
                    }
                    continue;
                }
                let nested_rm = config.registry.result_map(nested_id)?;
                let nested_prefix = compose_prefix(prefix, mapping);
                let nested_rm =
                    resolve_discriminated(config, nested_rm, row, &nested_prefix)?;
                let child = materialize_row(
                    executor,
                    config,
                    &nested_rm,
                    row,
                    meta,
                    &nested_prefix,
                    row_index,
                    false,
                )
                .await?;
                let value = match (mapping.collection, child) {
                    (true, Some(child)) => Value::Array(vec![child]),
                    (true, None) => Value::Array(Vec::new()),
                    (false, Some(child)) => child,
                    (false, None) => Value::Null,
                };
                if !value.is_null() {
                    found_values = true;
                }
                path::set_path(&mut object, &property, value);
            } else if let Some(select_id) = &mapping.nested_select {
                let deferrable = top_level
                    && mapping.lazy
                    && config.settings.lazy_loading_enabled;
                if deferrable {
                    if let Some(parameter) = nested_select_parameter(mapping, row, prefix) {
                        executor.defer_load(DeferredLoad {
                            statement_id: select_id.clone(),
                            parameter,
                            row_index,
                            property: property.clone(),
                            collection: mapping.collection,
                        });
                    }
                    let placeholder = if mapping.collection {
                        Value::Array(Vec::new())
                    } else {
                        Value::Null
                    };
                    path::set_path(&mut object, &property, placeholder);
                } else {
                    let value =
                        run_nested_select(executor, select_id, mapping, row, prefix).await?;
                    if !value.is_null() {
                        found_values = true;
                    }
                    path::set_path(&mut object, &property, value);
                }
            } else if let Some(column) = &mapping.column {
                let column = prefixed(prefix, column);
                let declared = descriptor
                    .as_ref()
                    .and_then(|d| d.property(&property))
                    .map(|p| p.app_type.clone());
                let value =
                    decode_column(config, mapping, declared.as_ref(), row, meta, &column)?;
                if !value.is_null() {
                    found_values = true;
                    path::set_path(&mut object, &property, value);
                } else if config.settings.call_setters_on_nulls {
                    path::set_path(&mut object, &property, Value::Null);
                }
            }
        }

        // Auto-mapping for columns no mapping claimed.
        let auto = rm.auto_mapping.unwrap_or(match config.settings.auto_mapping_behavior {
            AutoMappingBehavior::None => false,
            AutoMappingBehavior::Partial => !rm.has_nested_result_maps(),
            AutoMappingBehavior::Full => true,
        });
        if auto {
            found_values |= apply_auto_mapping(
                config,
                rm,
                descriptor.as_deref(),
                row,
                meta,
                prefix,
                &mut object,
            )?;
        }

        Ok(found_values.then_some(object))
    })
}

fn compose_prefix(prefix: &str, mapping: &ResultMapping) -> String {
    match &mapping.column_prefix {
        Some(own) => format!("{prefix}{own}"),
        None => prefix.to_string(),
    }
}

async fn run_nested_select(
    executor: &mut dyn Executor,
    select_id: &str,
    mapping: &ResultMapping,
    row: &Row,
    prefix: &str,
) -> Result<Value> {
    let Some(parameter) = nested_select_parameter(mapping, row, prefix) else {
        return Ok(if mapping.collection {
            Value::Array(Vec::new())
        } else {
            Value::Null
        });
    };
    let nested_ms = executor.base_ref().config.registry.statement(select_id)?;
    let rows = executor
        .query(&nested_ms, parameter, RowBounds::default(), None)
        .await?;
    Ok(if mapping.collection {
        Value::Array(rows)
    } else {
        rows.into_iter().next().unwrap_or(Value::Null)
    })
}

fn apply_auto_mapping(
    config: &Configuration,
    rm: &ResultMap,
    descriptor: Option<&meta::TypeDescriptor>,
    row: &Row,
    meta: &ResultSetMetadata,
    prefix: &str,
    object: &mut Value,
) -> Result<bool> {
    let map_underscore = config.settings.map_underscore_to_camel_case;
    let mut found = false;
    for column in row.columns() {
        // Only columns belonging to this level participate.
        let unprefixed = if prefix.is_empty() {
            column.as_str()
        } else {
            let Some(stripped) = strip_prefix_ci(column, prefix) else {
                continue;
            };
            stripped
        };
        if rm.mapped_columns.contains(&unprefixed.to_uppercase()) {
            continue;
        }

        let property = match descriptor {
            Some(d) => match d.find_property(unprefixed, map_underscore) {
                Some(p) if p.writable => p.name.clone(),
                Some(_) | None => {
                    match config.settings.auto_mapping_unknown_column_behavior {
                        UnknownColumnBehavior::None => {}
                        UnknownColumnBehavior::Warning => warn!(
                            column = %column,
                            result_map = %rm.id,
                            "unknown column during auto-mapping"
                        ),
                        UnknownColumnBehavior::Failing => {
                            return Err(Error::materialization(format!(
                                "unknown column '{column}' during auto-mapping of '{}'",
                                rm.id
                            )))
                        }
                    }
                    continue;
                }
            },
            None => {
                if map_underscore {
                    meta::underscore_to_camel(unprefixed)
                } else {
                    unprefixed.to_string()
                }
            }
        };

        let declared = descriptor
            .and_then(|d| d.property(&property))
            .map(|p| p.app_type.clone());
        let mapping = ResultMapping {
            column: Some(unprefixed.to_string()),
            ..Default::default()
        };
        let value = decode_column(config, &mapping, declared.as_ref(), row, meta, column)?;
        if !value.is_null() {
            found = true;
            path::set_path(object, &property, value);
        } else if config.settings.call_setters_on_nulls || descriptor.is_none() {
            path::set_path(object, &property, Value::Null);
        }
    }
    Ok(found)
}

fn strip_prefix_ci<'c>(column: &'c str, prefix: &str) -> Option<&'c str> {
    if column.len() >= prefix.len() && column[..prefix.len()].eq_ignore_ascii_case(prefix) {
        Some(&column[prefix.len()..])
    } else {
        None
    }
}

/// Fold one additional row's nested objects into an existing ancestor.
fn merge_nested<'a>(
    executor: &'a mut dyn Executor,
    config: &'a Arc<Configuration>,
    rm: &'a Arc<ResultMap>,
    row: &'a Row,
    meta: &'a ResultSetMetadata,
    existing: &'a mut Value,
    prefix: &'a str,
) -> BoxFuture<'a, Result<()>> {
    Box::pin(async move {
        let nested_mappings: Vec<ResultMapping> = rm
            .property_mappings()
            .filter(|m| m.nested_result_map.is_some())
            .cloned()
            .collect();
        for mapping in &nested_mappings {
            let Some(property) = mapping.property.clone() else {
                continue;
            };
            if !not_null_satisfied(mapping, row, prefix) {
                continue;
            }
            let nested_id = mapping.nested_result_map.as_ref().expect("filtered");
            let nested_rm = config.registry.result_map(nested_id)?;
            let nested_prefix = compose_prefix(prefix, mapping);
            let nested_rm = resolve_discriminated(config, nested_rm, row, &nested_prefix)?;
            let child = materialize_row(
                executor,
                config,
                &nested_rm,
                row,
                meta,
                &nested_prefix,
                0,
                false,
            )
            .await?;
            let Some(child) = child else {
                continue;
            };

            if mapping.collection {
                let slot = match path::get_path(existing, &property) {
                    Some(Value::Array(items)) => items.clone(),
                    _ => Vec::new(),
                };
                let mut items = slot;
                let mut merged = false;
                for item in items.iter_mut() {
                    if same_identity(&nested_rm, item, &child) {
                        // Same child entity: fold its own nested rows in.
                        merge_nested(executor, config, &nested_rm, row, meta, item, &nested_prefix)
                            .await?;
                        merged = true;
                        break;
                    }
                }
                if !merged {
                    items.push(child);
                }
                path::set_path(existing, &property, Value::Array(items));
            } else {
                match path::get_path(existing, &property) {
                    Some(current) if !current.is_null() => {
                        let mut current = current.clone();
                        merge_nested(
                            executor,
                            config,
                            &nested_rm,
                            row,
                            meta,
                            &mut current,
                            &nested_prefix,
                        )
                        .await?;
                        path::set_path(existing, &property, current);
                    }
                    _ => {
                        path::set_path(existing, &property, child);
                    }
                }
            }
        }
        Ok(())
    })
}

/// Materialize one row with column mappings and auto-mapping only, for
/// streaming cursors. Nested selects and nested result maps are rejected.
pub fn materialize_flat_row(
    config: &Arc<Configuration>,
    rm: &Arc<ResultMap>,
    row: &Row,
    meta: &ResultSetMetadata,
) -> Result<Option<Value>> {
    if rm.has_nested_result_maps()
        || rm.mappings.iter().any(|m| m.nested_select.is_some())
    {
        return Err(Error::materialization(format!(
            "result map '{}' uses nested mappings and cannot stream through a cursor",
            rm.id
        )));
    }
    let type_name = config.resolve_type_name(&rm.type_name).to_string();
    let descriptor = config.meta.descriptor(&type_name);

    if rm.app_type.is_scalar() && rm.mappings.is_empty() {
        let value = row.get(0).cloned().unwrap_or(Value::Null);
        if value.is_null() {
            return Ok(None);
        }
        return Ok(Some(crate::convert::coerce(&value, &rm.app_type)?));
    }

    let mut object = descriptor
        .as_ref()
        .map(|d| d.create_default())
        .unwrap_or_else(|| Value::Object(indexmap::IndexMap::new()));
    let mut found = false;
    for mapping in &rm.mappings {
        let (Some(property), Some(column)) = (&mapping.property, &mapping.column) else {
            continue;
        };
        let declared = descriptor
            .as_ref()
            .and_then(|d| d.property(property))
            .map(|p| p.app_type.clone());
        let value = decode_column(config, mapping, declared.as_ref(), row, meta, column)?;
        if !value.is_null() {
            found = true;
            path::set_path(&mut object, property, value);
        } else if config.settings.call_setters_on_nulls {
            path::set_path(&mut object, property, Value::Null);
        }
    }
    let auto = rm
        .auto_mapping
        .unwrap_or(config.settings.auto_mapping_behavior != AutoMappingBehavior::None);
    if auto {
        found |= apply_auto_mapping(config, rm, descriptor.as_deref(), row, meta, "", &mut object)?;
    }
    Ok(found.then_some(object))
}
