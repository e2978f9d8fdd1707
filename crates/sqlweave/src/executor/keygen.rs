//! Key generators
//!
//! Writes generated keys back into parameter objects: either from the
//! driver's generated-keys cursor after execute, or from a companion
//! select-key statement run before or after the main statement.

use sqlweave_rdbc::driver::ResultCursor;
use sqlweave_rdbc::types::Row;
use sqlweave_rdbc::Value;
use std::sync::Arc;

use crate::error::Result;
use crate::mapping::MappedStatement;
use crate::meta::path;

/// Assign one key row onto a parameter object. A scalar row value with a
/// single key property assigns directly; otherwise columns are matched to
/// key properties by position, falling back to key columns by name.
pub fn assign_key_values(key_properties: &[String], key_row: &Value, parameter: &mut Value) {
    if key_properties.is_empty() || key_row.is_null() {
        return;
    }
    match key_row {
        Value::Object(map) => {
            for (i, property) in key_properties.iter().enumerate() {
                // Match by property name first, then by column position.
                let value = map
                    .get(property)
                    .or_else(|| {
                        map.keys()
                            .find(|k| k.eq_ignore_ascii_case(property))
                            .and_then(|k| map.get(k))
                    })
                    .or_else(|| map.get_index(i).map(|(_, v)| v))
                    .cloned()
                    .unwrap_or(Value::Null);
                path::set_path(parameter, property, value);
            }
        }
        scalar => {
            if let Some(property) = key_properties.first() {
                path::set_path(parameter, property, scalar.clone());
            }
        }
    }
}

fn assign_row(ms: &MappedStatement, row: &Row, parameter: &mut Value) {
    for (i, property) in ms.key_properties.iter().enumerate() {
        let value = ms
            .key_columns
            .get(i)
            .and_then(|column| row.get_by_name(column))
            .or_else(|| row.get(i))
            .cloned()
            .unwrap_or(Value::Null);
        path::set_path(parameter, property, value);
    }
}

/// Apply a driver generated-keys cursor to the input parameter. Collection
/// parameters consume one key row per element, in order.
pub async fn process_driver_keys(
    ms: &Arc<MappedStatement>,
    keys: Option<Box<dyn ResultCursor>>,
    parameter: &mut Value,
) -> Result<()> {
    let Some(mut cursor) = keys else {
        return Ok(());
    };
    if ms.key_properties.is_empty() {
        return Ok(());
    }
    match parameter {
        Value::Array(items) => {
            for item in items.iter_mut() {
                let Some(row) = cursor.next().await? else {
                    break;
                };
                assign_row(ms, &row, item);
            }
        }
        single => {
            if let Some(row) = cursor.next().await? {
                assign_row(ms, &row, single);
            }
        }
    }
    cursor.close().await?;
    Ok(())
}

/// Apply generated keys collected from a batch execution to the batch's
/// recorded parameter objects, in add order.
pub async fn process_batch_keys(
    ms: &Arc<MappedStatement>,
    keys: Option<Box<dyn ResultCursor>>,
    parameters: &mut [Value],
) -> Result<()> {
    let Some(mut cursor) = keys else {
        return Ok(());
    };
    if ms.key_properties.is_empty() {
        return Ok(());
    }
    for parameter in parameters.iter_mut() {
        let Some(row) = cursor.next().await? else {
            break;
        };
        assign_row(ms, &row, parameter);
    }
    cursor.close().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use indexmap::IndexMap;

    fn obj(entries: Vec<(&str, Value)>) -> Value {
        Value::Object(
            entries
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect::<IndexMap<_, _>>(),
        )
    }

    #[test]
    fn scalar_key_assigns_to_single_property() {
        let mut param = obj(vec![("name", Value::from("Ann"))]);
        assign_key_values(&["id".to_string()], &Value::from(42_i64), &mut param);
        assert_eq!(
            path::get_path(&param, "id"),
            Some(&Value::from(42_i64))
        );
    }

    #[test]
    fn object_key_assigns_by_name_then_position() {
        let mut param = obj(vec![]);
        let key_row = obj(vec![
            ("ID", Value::from(5_i64)),
            ("seq", Value::from(9_i64)),
        ]);
        assign_key_values(
            &["id".to_string(), "sequence".to_string()],
            &key_row,
            &mut param,
        );
        // "id" matched case-insensitively, "sequence" fell back to position.
        assert_eq!(path::get_path(&param, "id"), Some(&Value::from(5_i64)));
        assert_eq!(
            path::get_path(&param, "sequence"),
            Some(&Value::from(9_i64))
        );
    }

    #[test]
    fn null_key_row_is_ignored() {
        let mut param = obj(vec![("name", Value::from("x"))]);
        assign_key_values(&["id".to_string()], &Value::Null, &mut param);
        assert_eq!(path::get_path(&param, "id"), None);
    }
}
