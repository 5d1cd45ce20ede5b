//! Dynamic query values and results.
//!
//! The access layer moves values between callers and three different drivers,
//! so parameters and result cells are carried as a single dynamic enum rather
//! than driver-native types. This module provides:
//! - `PgValue`: the dynamic parameter/result value
//! - SQL literal rendering for the `EXECUTE {name}(...)` path
//! - `QueryResult`: rows plus column names plus the affected-row count
//! - tokio-postgres `ToSql`/`FromSql` bridges for the dynamic enum

use std::fmt::Write as _;
use std::sync::Arc;

use bytes::BytesMut;
use chrono::{DateTime, NaiveDateTime, Utc};
use smallvec::SmallVec;
use tokio_postgres::types::{to_sql_checked, FromSql, IsNull, ToSql, Type};

use crate::error::BoxError;

// ============================================================================
// Values
// ============================================================================

/// A dynamic PostgreSQL value.
///
/// Covers the value kinds the layer needs to shuttle for query planners and
/// schema builders; anything more exotic stays inside the driver.
#[derive(Debug, Clone, PartialEq)]
pub enum PgValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Timestamp(DateTime<Utc>),
    Array(Vec<PgValue>),
    Json(serde_json::Value),
}

impl PgValue {
    /// Render this value as an inline SQL literal.
    ///
    /// Used for `EXECUTE {name}(...)`: the backends do not expose
    /// parameterized `EXECUTE` for ad-hoc prepared names, so values are
    /// formatted into the statement text. Strings double embedded quotes;
    /// JSON is rendered as a quoted `::jsonb` cast.
    pub fn to_literal(&self) -> String {
        let mut out = String::new();
        self.write_literal(&mut out);
        out
    }

    fn write_literal(&self, out: &mut String) {
        match self {
            PgValue::Null => out.push_str("NULL"),
            PgValue::Bool(true) => out.push_str("TRUE"),
            PgValue::Bool(false) => out.push_str("FALSE"),
            PgValue::Int(i) => {
                let _ = write!(out, "{i}");
            }
            PgValue::Float(f) => {
                let _ = write!(out, "{f}");
            }
            PgValue::Text(s) => write_quoted(out, s),
            PgValue::Timestamp(ts) => write_quoted(out, &ts.to_rfc3339()),
            PgValue::Array(items) => {
                out.push_str("ARRAY[");
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    item.write_literal(out);
                }
                out.push(']');
            }
            PgValue::Json(value) => {
                // serde_json never emits invalid JSON for a Value
                let rendered = serde_json::to_string(value).unwrap_or_default();
                write_quoted(out, &rendered);
                out.push_str("::jsonb");
            }
        }
    }

    /// Whether this value is SQL `NULL`.
    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, PgValue::Null)
    }

    /// The string contents, for `Text` values.
    #[inline]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            PgValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// The integer contents, for `Int` values.
    #[inline]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            PgValue::Int(i) => Some(*i),
            _ => None,
        }
    }
}

fn write_quoted(out: &mut String, s: &str) {
    out.push('\'');
    for ch in s.chars() {
        if ch == '\'' {
            out.push('\'');
        }
        out.push(ch);
    }
    out.push('\'');
}

impl From<bool> for PgValue {
    fn from(v: bool) -> Self {
        PgValue::Bool(v)
    }
}

impl From<i32> for PgValue {
    fn from(v: i32) -> Self {
        PgValue::Int(v as i64)
    }
}

impl From<i64> for PgValue {
    fn from(v: i64) -> Self {
        PgValue::Int(v)
    }
}

impl From<f64> for PgValue {
    fn from(v: f64) -> Self {
        PgValue::Float(v)
    }
}

impl From<&str> for PgValue {
    fn from(v: &str) -> Self {
        PgValue::Text(v.to_string())
    }
}

impl From<String> for PgValue {
    fn from(v: String) -> Self {
        PgValue::Text(v)
    }
}

impl From<serde_json::Value> for PgValue {
    fn from(v: serde_json::Value) -> Self {
        PgValue::Json(v)
    }
}

impl From<DateTime<Utc>> for PgValue {
    fn from(v: DateTime<Utc>) -> Self {
        PgValue::Timestamp(v)
    }
}

impl<T: Into<PgValue>> From<Option<T>> for PgValue {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(v) => v.into(),
            None => PgValue::Null,
        }
    }
}

// ============================================================================
// Query results
// ============================================================================

/// A row stored as column values.
///
/// SmallVec keeps rows with up to 16 columns inline, which covers the
/// typical planner-issued query.
pub type Row = SmallVec<[PgValue; 16]>;

/// Result of executing a SQL query.
#[derive(Debug, Clone)]
pub struct QueryResult {
    /// Column names, in result order. Empty when the query was executed in
    /// array mode (positional rows only) or returned no row description.
    pub columns: Arc<Vec<String>>,
    /// The result rows.
    pub rows: Vec<Row>,
    /// Affected-row count reported by the server; for SELECT-like statements
    /// this equals `rows.len()`.
    pub row_count: u64,
}

impl QueryResult {
    /// Create a result from rows and column names.
    pub fn new(columns: Vec<String>, rows: Vec<Row>, row_count: u64) -> Self {
        Self {
            columns: Arc::new(columns),
            rows,
            row_count,
        }
    }

    /// An empty result (no rows, no columns).
    pub fn empty() -> Self {
        Self::new(Vec::new(), Vec::new(), 0)
    }

    /// Look up a cell by row index and column name.
    pub fn value(&self, row: usize, column: &str) -> Option<&PgValue> {
        let idx = self.columns.iter().position(|c| c == column)?;
        self.rows.get(row)?.get(idx)
    }
}

// ============================================================================
// tokio-postgres bridges
// ============================================================================

impl ToSql for PgValue {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> Result<IsNull, BoxError> {
        match self {
            PgValue::Null => Ok(IsNull::Yes),
            PgValue::Bool(b) => b.to_sql(ty, out),
            PgValue::Int(i) => {
                if *ty == Type::INT2 {
                    (*i as i16).to_sql(ty, out)
                } else if *ty == Type::INT4 {
                    (*i as i32).to_sql(ty, out)
                } else {
                    i.to_sql(ty, out)
                }
            }
            PgValue::Float(f) => {
                if *ty == Type::FLOAT4 {
                    (*f as f32).to_sql(ty, out)
                } else {
                    f.to_sql(ty, out)
                }
            }
            PgValue::Text(s) => s.to_sql(ty, out),
            PgValue::Timestamp(ts) => {
                if *ty == Type::TIMESTAMP {
                    ts.naive_utc().to_sql(ty, out)
                } else {
                    ts.to_sql(ty, out)
                }
            }
            PgValue::Array(items) => items.to_sql(ty, out),
            PgValue::Json(value) => value.to_sql(ty, out),
        }
    }

    fn accepts(_ty: &Type) -> bool {
        // Dynamic values defer type mismatches to encode time.
        true
    }

    to_sql_checked!();
}

impl<'a> FromSql<'a> for PgValue {
    fn from_sql(ty: &Type, raw: &'a [u8]) -> Result<Self, BoxError> {
        let value = if *ty == Type::BOOL {
            PgValue::Bool(bool::from_sql(ty, raw)?)
        } else if *ty == Type::INT2 {
            PgValue::Int(i16::from_sql(ty, raw)? as i64)
        } else if *ty == Type::INT4 {
            PgValue::Int(i32::from_sql(ty, raw)? as i64)
        } else if *ty == Type::INT8 {
            PgValue::Int(i64::from_sql(ty, raw)?)
        } else if *ty == Type::OID {
            PgValue::Int(u32::from_sql(ty, raw)? as i64)
        } else if *ty == Type::FLOAT4 {
            PgValue::Float(f32::from_sql(ty, raw)? as f64)
        } else if *ty == Type::FLOAT8 {
            PgValue::Float(f64::from_sql(ty, raw)?)
        } else if *ty == Type::TEXT
            || *ty == Type::VARCHAR
            || *ty == Type::BPCHAR
            || *ty == Type::NAME
            || *ty == Type::UNKNOWN
        {
            PgValue::Text(String::from_sql(ty, raw)?)
        } else if *ty == Type::JSON || *ty == Type::JSONB {
            PgValue::Json(serde_json::Value::from_sql(ty, raw)?)
        } else if *ty == Type::TIMESTAMPTZ {
            PgValue::Timestamp(DateTime::<Utc>::from_sql(ty, raw)?)
        } else if *ty == Type::TIMESTAMP {
            PgValue::Timestamp(NaiveDateTime::from_sql(ty, raw)?.and_utc())
        } else if *ty == Type::TEXT_ARRAY
            || *ty == Type::VARCHAR_ARRAY
            || *ty == Type::INT4_ARRAY
            || *ty == Type::INT8_ARRAY
            || *ty == Type::BOOL_ARRAY
        {
            PgValue::Array(Vec::<PgValue>::from_sql(ty, raw)?)
        } else {
            return Err(format!("unsupported result type: {ty}").into());
        };
        Ok(value)
    }

    fn from_sql_null(_ty: &Type) -> Result<Self, BoxError> {
        Ok(PgValue::Null)
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_scalar_literals() {
        assert_eq!(PgValue::Null.to_literal(), "NULL");
        assert_eq!(PgValue::Bool(true).to_literal(), "TRUE");
        assert_eq!(PgValue::Bool(false).to_literal(), "FALSE");
        assert_eq!(PgValue::Int(42).to_literal(), "42");
        assert_eq!(PgValue::Int(-7).to_literal(), "-7");
        assert_eq!(PgValue::Float(1.5).to_literal(), "1.5");
        assert_eq!(PgValue::Text("hello".into()).to_literal(), "'hello'");
    }

    #[test]
    fn test_string_literal_doubles_quotes() {
        let v = PgValue::Text("it's; DROP TABLE t".into());
        assert_eq!(v.to_literal(), "'it''s; DROP TABLE t'");
    }

    #[test]
    fn test_timestamp_literal_is_iso8601() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap();
        let lit = PgValue::Timestamp(ts).to_literal();
        assert!(lit.starts_with("'2024-03-01T12:30:00"), "literal: {lit}");
        assert!(lit.ends_with('\''));
    }

    #[test]
    fn test_array_literal_recurses() {
        let v = PgValue::Array(vec![
            PgValue::Int(1),
            PgValue::Text("a'b".into()),
            PgValue::Array(vec![PgValue::Null]),
        ]);
        assert_eq!(v.to_literal(), "ARRAY[1,'a''b',ARRAY[NULL]]");
    }

    #[test]
    fn test_json_literal_is_jsonb_cast() {
        let v = PgValue::Json(serde_json::json!({"k": "it's"}));
        assert_eq!(v.to_literal(), "'{\"k\":\"it''s\"}'::jsonb");
    }

    #[test]
    fn test_result_lookup_by_column() {
        let result = QueryResult::new(
            vec!["TimeZone".to_string()],
            vec![Row::from_vec(vec![PgValue::Text("UTC".into())])],
            1,
        );
        assert_eq!(
            result.value(0, "TimeZone").and_then(|v| v.as_text()),
            Some("UTC")
        );
        assert!(result.value(0, "missing").is_none());
        assert!(result.value(1, "TimeZone").is_none());
    }

    #[test]
    fn test_option_conversion() {
        assert_eq!(PgValue::from(None::<i64>), PgValue::Null);
        assert_eq!(PgValue::from(Some(3i64)), PgValue::Int(3));
    }
}
