//! SQL value model: parameter binding and column decoding.
//!
//! [`SqlValue`] is the single closed set of kinds that can travel into a
//! statement as a parameter or come back out of it as a result cell. Binding
//! and decoding are deliberately asymmetric: `Int32`, `Bool` and the array
//! kinds only exist on the way in, decoding always yields `Int64`, `Double`,
//! `Text`, `Blob` or `Null` according to the cell's storage class.

use rusqlite::types::{Null, ValueRef};
use rusqlite::{Row, Statement};
use serde_json::Value;

use crate::error::DatabaseError;

/// A value bound to a statement parameter or decoded from a result column.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Int32(i32),
    Int64(i64),
    Double(f64),
    Text(String),
    Blob(Vec<u8>),
    Int32Array(Vec<i32>),
    Int64Array(Vec<i64>),
    DoubleArray(Vec<f64>),
    /// Untyped list; only bindable when every element is a byte (0..=255).
    GenericList(Vec<SqlValue>),
}

impl SqlValue {
    /// Short kind name used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            SqlValue::Null => "null",
            SqlValue::Bool(_) => "bool",
            SqlValue::Int32(_) => "int32",
            SqlValue::Int64(_) => "int64",
            SqlValue::Double(_) => "double",
            SqlValue::Text(_) => "text",
            SqlValue::Blob(_) => "blob",
            SqlValue::Int32Array(_) => "int32 array",
            SqlValue::Int64Array(_) => "int64 array",
            SqlValue::DoubleArray(_) => "double array",
            SqlValue::GenericList(_) => "list",
        }
    }

    /// Converts a channel value into a parameter.
    ///
    /// Objects have no SQL counterpart and are rejected.
    pub fn from_json(value: &Value) -> Result<Self, DatabaseError> {
        Ok(match value {
            Value::Null => SqlValue::Null,
            Value::Bool(b) => SqlValue::Bool(*b),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    match i32::try_from(i) {
                        Ok(small) => SqlValue::Int32(small),
                        Err(_) => SqlValue::Int64(i),
                    }
                } else if let Some(f) = n.as_f64() {
                    SqlValue::Double(f)
                } else {
                    return Err(DatabaseError::unsupported_type(format!(
                        "number {} does not fit a 64-bit integer or double",
                        n
                    )));
                }
            }
            Value::String(s) => SqlValue::Text(s.clone()),
            Value::Array(items) => SqlValue::GenericList(
                items
                    .iter()
                    .map(SqlValue::from_json)
                    .collect::<Result<Vec<_>, _>>()?,
            ),
            Value::Object(_) => {
                return Err(DatabaseError::unsupported_type(
                    "maps cannot be bound as statement parameters",
                ))
            }
        })
    }

    /// Converts a list of channel values into a parameter list.
    pub fn list_from_json(values: &[Value]) -> Result<Vec<Self>, DatabaseError> {
        values.iter().map(SqlValue::from_json).collect()
    }

    /// Converts the value back into the channel format.
    ///
    /// Blobs and numeric arrays become arrays of numbers; doubles that JSON
    /// cannot represent (NaN, infinities) become null.
    pub fn to_json(&self) -> Value {
        match self {
            SqlValue::Null => Value::Null,
            SqlValue::Bool(b) => Value::Bool(*b),
            SqlValue::Int32(v) => Value::from(*v),
            SqlValue::Int64(v) => Value::from(*v),
            SqlValue::Double(v) => double_to_json(*v),
            SqlValue::Text(s) => Value::String(s.clone()),
            SqlValue::Blob(bytes) => Value::Array(bytes.iter().map(|b| Value::from(*b)).collect()),
            SqlValue::Int32Array(items) => Value::Array(items.iter().map(|v| Value::from(*v)).collect()),
            SqlValue::Int64Array(items) => Value::Array(items.iter().map(|v| Value::from(*v)).collect()),
            SqlValue::DoubleArray(items) => {
                Value::Array(items.iter().map(|v| double_to_json(*v)).collect())
            }
            SqlValue::GenericList(items) => Value::Array(items.iter().map(SqlValue::to_json).collect()),
        }
    }
}

fn double_to_json(v: f64) -> Value {
    serde_json::Number::from_f64(v)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

impl From<ValueRef<'_>> for SqlValue {
    fn from(value: ValueRef<'_>) -> Self {
        match value {
            ValueRef::Null => SqlValue::Null,
            ValueRef::Integer(i) => SqlValue::Int64(i),
            ValueRef::Real(f) => SqlValue::Double(f),
            ValueRef::Text(t) => SqlValue::Text(String::from_utf8_lossy(t).into_owned()),
            ValueRef::Blob(b) => SqlValue::Blob(b.to_vec()),
        }
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Int64(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl From<Vec<u8>> for SqlValue {
    fn from(v: Vec<u8>) -> Self {
        SqlValue::Blob(v)
    }
}

/// Decoded query output: column names plus one row per result row.
///
/// Every row has exactly `columns.len()` cells.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<SqlValue>>,
}

impl ResultSet {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

// =============================================================================
// Binding
// =============================================================================

/// Binds `params` positionally (1-based) to `stmt`.
///
/// Stops at the first value that cannot be bound. Earlier bindings stay on
/// the statement; the statement cache clears them when the statement is
/// handed back.
pub fn bind_parameters(stmt: &mut Statement<'_>, params: &[SqlValue]) -> Result<(), DatabaseError> {
    for (i, value) in params.iter().enumerate() {
        let index = i + 1;
        match value {
            SqlValue::Null => stmt.raw_bind_parameter(index, Null)?,
            SqlValue::Bool(b) => stmt.raw_bind_parameter(index, i64::from(*b))?,
            SqlValue::Int32(v) => stmt.raw_bind_parameter(index, *v)?,
            SqlValue::Int64(v) => stmt.raw_bind_parameter(index, *v)?,
            SqlValue::Double(v) => stmt.raw_bind_parameter(index, *v)?,
            SqlValue::Text(s) => stmt.raw_bind_parameter(index, s.as_str())?,
            SqlValue::Blob(bytes) => stmt.raw_bind_parameter(index, bytes.as_slice())?,
            SqlValue::Int32Array(items) => {
                let bytes: Vec<u8> = items.iter().flat_map(|v| v.to_le_bytes()).collect();
                stmt.raw_bind_parameter(index, bytes)?
            }
            SqlValue::Int64Array(items) => {
                let bytes: Vec<u8> = items.iter().flat_map(|v| v.to_le_bytes()).collect();
                stmt.raw_bind_parameter(index, bytes)?
            }
            SqlValue::DoubleArray(items) => {
                let bytes: Vec<u8> = items.iter().flat_map(|v| v.to_le_bytes()).collect();
                stmt.raw_bind_parameter(index, bytes)?
            }
            SqlValue::GenericList(items) => {
                let bytes = list_to_bytes(index, items)?;
                stmt.raw_bind_parameter(index, bytes)?
            }
        }
    }
    Ok(())
}

/// Reads a generic list as a blob. Any element that is not an integer in
/// 0..=255 fails the whole bind; nothing is clamped.
fn list_to_bytes(index: usize, items: &[SqlValue]) -> Result<Vec<u8>, DatabaseError> {
    items
        .iter()
        .map(|item| {
            let byte = match item {
                SqlValue::Int32(v) => u8::try_from(*v).ok(),
                SqlValue::Int64(v) => u8::try_from(*v).ok(),
                _ => None,
            };
            byte.ok_or_else(|| {
                DatabaseError::unsupported_type(format!(
                    "parameter {} is a list containing a non-byte {} element",
                    index,
                    item.kind()
                ))
            })
        })
        .collect()
}

// =============================================================================
// Decoding
// =============================================================================

/// Decodes the first `column_count` columns of `row` by storage class.
pub fn decode_row(row: &Row<'_>, column_count: usize) -> Result<Vec<SqlValue>, DatabaseError> {
    (0..column_count)
        .map(|i| Ok(SqlValue::from(row.get_ref(i)?)))
        .collect()
}
