// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Remote field types, local column types, and value coercion.
//!
//! Each field gets a [`ValueShape`] from its remote type and multiplicity.
//! The shape decides the physical column type and how an incoming JSON
//! value is turned into a bindable [`CellValue`].
//!
//! | Remote type                     | Shape              | Column            |
//! |---------------------------------|--------------------|-------------------|
//! | any, `isMultiple`               | `List(kind)`       | JSON text         |
//! | `integer`, `int`                | `Scalar(Integer)`  | BIGINT            |
//! | `double`, `float`, `number`     | `Scalar(Float)`    | DOUBLE            |
//! | `boolean`, `bool`               | `Scalar(Boolean)`  | BOOLEAN           |
//! | `datetime`                      | `Scalar(Timestamp)`| DATETIME (UTC)    |
//! | `date`                          | `Scalar(Date)`     | DATE              |
//! | `crm_multifield`, `object`      | `Json`             | JSON text         |
//! | anything else                   | `Scalar(Text)`     | TEXT              |

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::Value;
use thiserror::Error;

use crate::storage::sql::Dialect;

/// Storage format for timestamp columns (always UTC).
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
pub const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalarKind {
    Integer,
    Float,
    Boolean,
    Timestamp,
    Date,
    Text,
}

impl ScalarKind {
    fn from_remote(remote_type: &str) -> Self {
        match remote_type.trim().to_lowercase().as_str() {
            "integer" | "int" => Self::Integer,
            "double" | "float" | "number" => Self::Float,
            "boolean" | "bool" => Self::Boolean,
            "datetime" => Self::Timestamp,
            "date" => Self::Date,
            _ => Self::Text,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::Integer => "integer",
            Self::Float => "float",
            Self::Boolean => "boolean",
            Self::Timestamp => "timestamp",
            Self::Date => "date",
            Self::Text => "text",
        }
    }
}

/// Tagged description of what a field holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueShape {
    Scalar(ScalarKind),
    /// A multi-valued field; elements are of the given kind
    List(ScalarKind),
    /// A structured value kept verbatim
    Json,
}

impl ValueShape {
    pub fn from_remote(remote_type: &str, is_multiple: bool) -> Self {
        let kind = ScalarKind::from_remote(remote_type);
        if is_multiple {
            return Self::List(kind);
        }
        match remote_type.trim().to_lowercase().as_str() {
            "crm_multifield" | "object" => Self::Json,
            _ => Self::Scalar(kind),
        }
    }

    pub fn column_type(&self) -> ColumnType {
        match self {
            Self::List(_) | Self::Json => ColumnType::Json,
            Self::Scalar(ScalarKind::Integer) => ColumnType::BigInt,
            Self::Scalar(ScalarKind::Float) => ColumnType::Double,
            Self::Scalar(ScalarKind::Boolean) => ColumnType::Boolean,
            Self::Scalar(ScalarKind::Timestamp) => ColumnType::Timestamp,
            Self::Scalar(ScalarKind::Date) => ColumnType::Date,
            Self::Scalar(ScalarKind::Text) => ColumnType::Text,
        }
    }
}

/// Physical column type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnType {
    BigInt,
    Double,
    Boolean,
    Timestamp,
    Date,
    Text,
    Json,
}

impl ColumnType {
    /// DDL type name. JSON is stored as text (the sqlx Any driver has no JSON mapping).
    pub fn sql_type(&self, dialect: Dialect) -> &'static str {
        match (self, dialect) {
            (Self::BigInt, _) => "BIGINT",
            (Self::Double, Dialect::Sqlite) => "REAL",
            (Self::Double, Dialect::MySql) => "DOUBLE",
            (Self::Boolean, Dialect::Sqlite) => "INTEGER",
            (Self::Boolean, Dialect::MySql) => "TINYINT(1)",
            (Self::Timestamp, Dialect::Sqlite) => "TEXT",
            (Self::Timestamp, Dialect::MySql) => "DATETIME",
            (Self::Date, Dialect::Sqlite) => "TEXT",
            (Self::Date, Dialect::MySql) => "DATE",
            (Self::Text | Self::Json, Dialect::Sqlite) => "TEXT",
            (Self::Text | Self::Json, Dialect::MySql) => "LONGTEXT",
        }
    }
}

/// A value ready to be bound into an SQL statement.
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Null,
    Int(i64),
    Float(f64),
    Bool(bool),
    Text(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("cannot store {found} as {expected}")]
pub struct CoerceError {
    pub expected: &'static str,
    pub found: String,
}

impl CoerceError {
    fn new(expected: ScalarKind, found: &Value) -> Self {
        let mut found = found.to_string();
        if found.len() > 64 {
            let mut cut = 64;
            while !found.is_char_boundary(cut) {
                cut -= 1;
            }
            found.truncate(cut);
            found.push_str("...");
        }
        Self { expected: expected.name(), found }
    }
}

/// Convert a remote JSON value into a cell for a column of the given shape.
pub fn coerce(value: &Value, shape: ValueShape) -> Result<CellValue, CoerceError> {
    match shape {
        ValueShape::List(_) => Ok(match value {
            Value::Null => CellValue::Null,
            Value::Array(_) | Value::Object(_) => CellValue::Text(value.to_string()),
            scalar => CellValue::Text(Value::Array(vec![scalar.clone()]).to_string()),
        }),
        ValueShape::Json => Ok(match value {
            Value::Null => CellValue::Null,
            other => CellValue::Text(other.to_string()),
        }),
        ValueShape::Scalar(kind) => coerce_scalar(value, kind),
    }
}

fn coerce_scalar(value: &Value, kind: ScalarKind) -> Result<CellValue, CoerceError> {
    if value.is_null() {
        return Ok(CellValue::Null);
    }
    if let Value::String(s) = value {
        if s.trim().is_empty() {
            return Ok(match kind {
                ScalarKind::Text => CellValue::Text(s.clone()),
                _ => CellValue::Null,
            });
        }
    }

    let fail = || CoerceError::new(kind, value);

    match kind {
        ScalarKind::Text => Ok(match value {
            Value::String(s) => CellValue::Text(s.clone()),
            other => CellValue::Text(other.to_string()),
        }),
        ScalarKind::Integer => match value {
            Value::Number(n) => n
                .as_i64()
                .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f.trunc() as i64))
                .map(CellValue::Int)
                .ok_or_else(fail),
            Value::Bool(b) => Ok(CellValue::Int(i64::from(*b))),
            Value::String(s) => parse_number(s)
                .map(|f| CellValue::Int(f.trunc() as i64))
                .ok_or_else(fail),
            _ => Err(fail()),
        },
        ScalarKind::Float => match value {
            Value::Number(n) => n.as_f64().map(CellValue::Float).ok_or_else(fail),
            Value::Bool(b) => Ok(CellValue::Float(if *b { 1.0 } else { 0.0 })),
            Value::String(s) => parse_number(s).map(CellValue::Float).ok_or_else(fail),
            _ => Err(fail()),
        },
        ScalarKind::Boolean => match value {
            Value::Bool(b) => Ok(CellValue::Bool(*b)),
            Value::Number(n) => match n.as_i64() {
                Some(0) => Ok(CellValue::Bool(false)),
                Some(1) => Ok(CellValue::Bool(true)),
                _ => Err(fail()),
            },
            Value::String(s) => match s.trim().to_lowercase().as_str() {
                "y" | "yes" | "true" | "1" | "on" => Ok(CellValue::Bool(true)),
                "n" | "no" | "false" | "0" | "off" => Ok(CellValue::Bool(false)),
                _ => Err(fail()),
            },
            _ => Err(fail()),
        },
        ScalarKind::Timestamp => value
            .as_str()
            .and_then(parse_timestamp)
            .map(|ts| CellValue::Text(ts.format(TIMESTAMP_FORMAT).to_string()))
            .ok_or_else(fail),
        ScalarKind::Date => value
            .as_str()
            .and_then(parse_date)
            .map(|d| CellValue::Text(d.format(DATE_FORMAT).to_string()))
            .ok_or_else(fail),
    }
}

/// Numbers sometimes arrive as strings, with a decimal comma.
fn parse_number(s: &str) -> Option<f64> {
    s.trim()
        .replace(',', ".")
        .parse::<f64>()
        .ok()
        .filter(|f| f.is_finite())
}

/// RFC 3339 with any offset, or a naive timestamp taken as UTC.
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Some(ts.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S", TIMESTAMP_FORMAT]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .map(|naive| naive.and_utc())
}

/// The calendar date in the first ten characters.
pub fn parse_date(s: &str) -> Option<NaiveDate> {
    let head = s.trim().get(..10)?;
    NaiveDate::parse_from_str(head, DATE_FORMAT).ok()
}
