//! Conversion between JSON rows and engine values.

use crate::error::{CliError, Result};
use serde_json::Value as JsonValue;
use veil_core::{Catalog, ColumnId, DataType, Value};

/// Convert a JSON scalar. Integers in TIMESTAMP columns become timestamps.
pub fn json_to_value(json: &JsonValue, ty: Option<DataType>) -> Result<Value> {
    Ok(match json {
        JsonValue::Null => Value::Null,
        JsonValue::Bool(b) => Value::Bool(*b),
        JsonValue::Number(n) => match (n.as_i64(), ty) {
            (Some(i), Some(DataType::Timestamp)) => Value::Timestamp(i),
            (Some(i), _) => Value::Int(i),
            (None, _) => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
        },
        JsonValue::String(s) => Value::String(s.clone()),
        JsonValue::Array(_) | JsonValue::Object(_) => {
            return Err(CliError::Invalid(format!(
                "expected a scalar value, found {}",
                json
            )))
        }
    })
}

pub fn value_to_json(value: &Value) -> JsonValue {
    match value {
        Value::Null => JsonValue::Null,
        Value::Bool(b) => JsonValue::Bool(*b),
        Value::Int(i) => JsonValue::from(*i),
        Value::Float(x) => serde_json::Number::from_f64(*x)
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null),
        Value::String(s) => JsonValue::String(s.clone()),
        Value::Timestamp(t) => JsonValue::from(*t),
    }
}

/// Build input rows in `columns` order.
///
/// Each JSON row is either an array, read positionally, or an object keyed
/// by column name, where missing columns are NULL.
pub fn rows_from_json(
    json: &JsonValue,
    columns: &[ColumnId],
    catalog: &Catalog,
) -> Result<Vec<Vec<Value>>> {
    let JsonValue::Array(rows) = json else {
        return Err(CliError::Invalid("rows file must contain a JSON array".into()));
    };
    let types: Vec<Option<DataType>> = columns
        .iter()
        .map(|c| catalog.column_type(c).ok())
        .collect();

    rows.iter()
        .enumerate()
        .map(|(i, row)| match row {
            JsonValue::Array(values) => {
                if values.len() != columns.len() {
                    return Err(CliError::Invalid(format!(
                        "row {} has {} value(s), expected {} ({})",
                        i,
                        values.len(),
                        columns.len(),
                        column_list(columns)
                    )));
                }
                values
                    .iter()
                    .zip(&types)
                    .map(|(v, ty)| json_to_value(v, *ty))
                    .collect()
            }
            JsonValue::Object(fields) => columns
                .iter()
                .zip(&types)
                .map(|(c, ty)| match fields.get(&c.column) {
                    Some(v) => json_to_value(v, *ty),
                    None => Ok(Value::Null),
                })
                .collect(),
            other => Err(CliError::Invalid(format!(
                "row {} must be an array or object, found {}",
                i, other
            ))),
        })
        .collect()
}

fn column_list(columns: &[ColumnId]) -> String {
    columns
        .iter()
        .map(|c| c.column.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Parse a `key=value` session attribute. Values that parse as JSON
/// scalars keep their type; anything else is text.
pub fn parse_attribute(pair: &str) -> Result<(String, Value)> {
    let (key, raw) = pair
        .split_once('=')
        .ok_or_else(|| CliError::Invalid(format!("attribute '{}' must be key=value", pair)))?;
    let value = match serde_json::from_str::<JsonValue>(raw) {
        Ok(json) => json_to_value(&json, None).unwrap_or_else(|_| Value::from(raw)),
        Err(_) => Value::from(raw),
    };
    Ok((key.to_string(), value))
}
