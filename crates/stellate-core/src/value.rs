//! Typed values, rows and in-memory row buffers

use chrono::{NaiveDate, NaiveDateTime};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::schema::LogicalType;

/// A single typed cell value
///
/// `Eq + Hash` so that natural-key tuples can be used as map keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Decimal(Decimal),
    String(String),
    Date(NaiveDate),
    Timestamp(NaiveDateTime),
}

impl Value {
    /// Whether this value is NULL
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Convert a loosely-typed JSON value
    ///
    /// JSON numbers with a fractional part become decimals (parsed from their
    /// textual form, so `10.0` stays exact). Arrays and objects are kept as
    /// their JSON text.
    pub fn from_json(value: &serde_json::Value) -> Value {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else {
                    Decimal::from_str(&n.to_string())
                        .or_else(|_| Decimal::from_scientific(&n.to_string()))
                        .map(Value::Decimal)
                        .unwrap_or_else(|_| Value::String(n.to_string()))
                }
            }
            serde_json::Value::String(s) => Value::String(s.clone()),
            other => Value::String(other.to_string()),
        }
    }

    /// Convert to a JSON value (dates and decimals become strings)
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::from(*i),
            other => serde_json::Value::String(other.to_string()),
        }
    }

    /// Coerce this value into the given logical type
    ///
    /// NULL coerces to NULL for every type; nullability is checked elsewhere.
    pub fn coerce(&self, target: &LogicalType) -> Result<Value, String> {
        if self.is_null() {
            return Ok(Value::Null);
        }

        let fail = || format!("cannot convert {} to {}", self.describe(), target);

        match target {
            LogicalType::Bool => match self {
                Value::Bool(b) => Ok(Value::Bool(*b)),
                Value::Int(0) => Ok(Value::Bool(false)),
                Value::Int(1) => Ok(Value::Bool(true)),
                Value::String(s) => match s.trim().to_lowercase().as_str() {
                    "true" | "t" | "yes" | "y" | "1" => Ok(Value::Bool(true)),
                    "false" | "f" | "no" | "n" | "0" => Ok(Value::Bool(false)),
                    _ => Err(fail()),
                },
                _ => Err(fail()),
            },

            LogicalType::Int => match self {
                Value::Int(i) => Ok(Value::Int(*i)),
                Value::Bool(b) => Ok(Value::Int(i64::from(*b))),
                Value::Decimal(d) if d.fract().is_zero() => {
                    d.to_i64().map(Value::Int).ok_or_else(fail)
                }
                Value::String(s) => s.trim().parse::<i64>().map(Value::Int).map_err(|_| fail()),
                _ => Err(fail()),
            },

            LogicalType::Decimal { scale, .. } => {
                let decimal = match self {
                    Value::Decimal(d) => *d,
                    Value::Int(i) => Decimal::from(*i),
                    Value::String(s) => Decimal::from_str(s.trim())
                        .or_else(|_| Decimal::from_scientific(s.trim()))
                        .map_err(|_| fail())?,
                    _ => return Err(fail()),
                };
                Ok(Value::Decimal(match scale {
                    Some(scale) => decimal.round_dp(u32::from(*scale)),
                    None => decimal,
                }))
            }

            LogicalType::String => match self {
                Value::String(s) => Ok(Value::String(s.clone())),
                other => Ok(Value::String(other.to_string())),
            },

            LogicalType::Date => match self {
                Value::Date(d) => Ok(Value::Date(*d)),
                Value::Timestamp(ts) => Ok(Value::Date(ts.date())),
                Value::String(s) => parse_date(s.trim()).map(Value::Date).ok_or_else(fail),
                _ => Err(fail()),
            },

            LogicalType::Timestamp => match self {
                Value::Timestamp(ts) => Ok(Value::Timestamp(*ts)),
                Value::Date(d) => d
                    .and_hms_opt(0, 0, 0)
                    .map(Value::Timestamp)
                    .ok_or_else(fail),
                Value::String(s) => parse_timestamp(s.trim())
                    .map(Value::Timestamp)
                    .ok_or_else(fail),
                _ => Err(fail()),
            },
        }
    }

    /// Short description used in error messages, e.g. `string "abc"`
    pub fn describe(&self) -> String {
        match self {
            Value::Null => "NULL".to_string(),
            Value::Bool(b) => format!("bool {}", b),
            Value::Int(i) => format!("integer {}", i),
            Value::Decimal(d) => format!("decimal {}", d),
            Value::String(s) => format!("string {:?}", s),
            Value::Date(d) => format!("date {}", d),
            Value::Timestamp(ts) => format!("timestamp {}", ts),
        }
    }
}

fn parse_date(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .or_else(|| parse_timestamp(s).map(|ts| ts.date()))
}

fn parse_timestamp(s: &str) -> Option<NaiveDateTime> {
    const FORMATS: [&str; 4] = [
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S%.f",
    ];

    FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Decimal(d) => write!(f, "{}", d),
            Value::String(s) => write!(f, "{}", s),
            Value::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
            Value::Timestamp(ts) => write!(f, "{}", ts.format("%Y-%m-%d %H:%M:%S")),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<Decimal> for Value {
    fn from(d: Decimal) -> Self {
        Value::Decimal(d)
    }
}

impl From<NaiveDate> for Value {
    fn from(d: NaiveDate) -> Self {
        Value::Date(d)
    }
}

/// One row: column name -> value
pub type Row = BTreeMap<String, Value>;

/// Ordered natural-key values identifying one dimension row
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyTuple(pub Vec<Value>);

impl KeyTuple {
    pub fn values(&self) -> &[Value] {
        &self.0
    }
}

impl fmt::Display for KeyTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, value) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", value)?;
        }
        write!(f, ")")
    }
}

/// Fully materialized set of rows owned by a single run
///
/// Extraction always fills the whole buffer before any transform runs, so
/// no upstream cursor is held open while expansions or resolution execute.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowBuffer {
    rows: Vec<Row>,
}

impl RowBuffer {
    /// Create an empty buffer
    pub fn new() -> Self {
        Self { rows: Vec::new() }
    }

    /// Create a buffer from rows
    pub fn from_rows(rows: Vec<Row>) -> Self {
        Self { rows }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn push(&mut self, row: Row) {
        self.rows.push(row);
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Row> {
        self.rows.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, Row> {
        self.rows.iter_mut()
    }

    pub fn into_rows(self) -> Vec<Row> {
        self.rows
    }

    /// All field names present in any row, sorted
    pub fn field_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .rows
            .iter()
            .flat_map(|row| row.keys().cloned())
            .collect();
        names.sort();
        names.dedup();
        names
    }
}

impl IntoIterator for RowBuffer {
    type Item = Row;
    type IntoIter = std::vec::IntoIter<Row>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.into_iter()
    }
}

impl FromIterator<Row> for RowBuffer {
    fn from_iter<I: IntoIterator<Item = Row>>(iter: I) -> Self {
        Self {
            rows: iter.into_iter().collect(),
        }
    }
}

/// Build a row from `(name, value)` pairs
pub fn row<K, V, I>(pairs: I) -> Row
where
    K: Into<String>,
    V: Into<Value>,
    I: IntoIterator<Item = (K, V)>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coerce_string_to_date_and_timestamp() {
        let value = Value::from("2024-01-01");
        assert_eq!(
            value.coerce(&LogicalType::Date).unwrap(),
            Value::Date(NaiveDate::from_ymd_opt(2024, 1, 1).unwrap())
        );

        let ts = Value::from("2024-01-01T10:30:00").coerce(&LogicalType::Timestamp).unwrap();
        assert_eq!(ts.to_string(), "2024-01-01 10:30:00");
    }

    #[test]
    fn coerce_numbers() {
        let decimal = LogicalType::Decimal { precision: Some(12), scale: Some(2) };
        assert_eq!(
            Value::Int(10).coerce(&decimal).unwrap(),
            Value::Decimal(Decimal::new(10, 0))
        );
        assert_eq!(
            Value::from("3.14159").coerce(&decimal).unwrap(),
            Value::Decimal(Decimal::new(314, 2))
        );
        assert_eq!(Value::from(" 42 ").coerce(&LogicalType::Int).unwrap(), Value::Int(42));
        assert!(Value::from("forty").coerce(&LogicalType::Int).is_err());
        assert!(Value::Decimal(Decimal::new(15, 1)).coerce(&LogicalType::Int).is_err());
    }

    #[test]
    fn coerce_bool_and_null() {
        assert_eq!(Value::from("yes").coerce(&LogicalType::Bool).unwrap(), Value::Bool(true));
        assert_eq!(Value::Int(0).coerce(&LogicalType::Bool).unwrap(), Value::Bool(false));
        assert_eq!(Value::Null.coerce(&LogicalType::Date).unwrap(), Value::Null);
    }

    #[test]
    fn json_numbers_keep_precision() {
        let value = Value::from_json(&serde_json::json!(10.0));
        assert_eq!(value, Value::Decimal(Decimal::new(100, 1)));
        assert_eq!(Value::from_json(&serde_json::json!(7)), Value::Int(7));
    }

    #[test]
    fn decimal_equality_ignores_scale() {
        let a = KeyTuple(vec![Value::Decimal(Decimal::new(100, 1))]);
        let b = KeyTuple(vec![Value::Decimal(Decimal::new(1000, 2))]);
        assert_eq!(a, b);

        let mut set = std::collections::HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
    }

    #[test]
    fn key_tuple_display() {
        let key = KeyTuple(vec![Value::from("S1"), Value::Int(3)]);
        assert_eq!(key.to_string(), "(S1, 3)");
    }

    #[test]
    fn buffer_field_names() {
        let buffer = RowBuffer::from_rows(vec![
            row([("b", Value::Int(1))]),
            row([("a", Value::Int(2)), ("b", Value::Int(3))]),
        ]);
        assert_eq!(buffer.field_names(), vec!["a", "b"]);
        assert_eq!(buffer.len(), 2);
    }
}
