//! Tabular values exchanged with the database.
//!
//! [`DataFrame`] is what `get_data` returns and what `push_data` writes. Cells
//! are a small closed set of [`Value`]s; anything PostgreSQL returns outside
//! that set (uuid, json, intervals, arrays...) is kept as its text rendering.

use std::io::Read;

use chrono::NaiveDateTime;
use rust_decimal::prelude::ToPrimitive;
use serde::Serialize;
use sqlx::postgres::{PgColumn, PgRow};
use sqlx::{Column, Row, TypeInfo, ValueRef};
use tracing::debug;

use crate::db::error::{Error, Result};

const TIMESTAMP_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
];

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Timestamp(NaiveDateTime),
}

impl Value {
    /// Infer a value from untyped text such as a CSV field.
    ///
    /// Empty text is NULL; otherwise booleans, integers, floats and
    /// timestamps are recognised before falling back to text.
    pub fn infer(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Value::Null;
        }
        match trimmed {
            "true" | "TRUE" | "True" => return Value::Bool(true),
            "false" | "FALSE" | "False" => return Value::Bool(false),
            _ => {}
        }
        if let Ok(i) = trimmed.parse::<i64>() {
            return Value::Int(i);
        }
        if is_integer_literal(trimmed) {
            // Beyond i64; a float would silently drop digits
            return Value::Text(raw.to_string());
        }
        if let Ok(f) = trimmed.parse::<f64>()
            && f.is_finite()
        {
            return Value::Float(f);
        }
        for format in TIMESTAMP_FORMATS {
            if let Ok(ts) = NaiveDateTime::parse_from_str(trimmed, format) {
                return Value::Timestamp(ts);
            }
        }
        Value::Text(raw.to_string())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Column type this value asks for; `None` for NULL.
    pub fn sql_type(&self) -> Option<SqlType> {
        match self {
            Value::Null => None,
            Value::Bool(_) => Some(SqlType::Boolean),
            Value::Int(_) => Some(SqlType::BigInt),
            Value::Float(_) => Some(SqlType::Double),
            Value::Text(_) => Some(SqlType::Text),
            Value::Timestamp(_) => Some(SqlType::Timestamp),
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<NaiveDateTime> {
        match self {
            Value::Timestamp(ts) => Some(*ts),
            _ => None,
        }
    }

    /// Text rendering of any non-null value.
    pub fn as_text(&self) -> Option<String> {
        match self {
            Value::Null => None,
            Value::Bool(b) => Some(b.to_string()),
            Value::Int(i) => Some(i.to_string()),
            Value::Float(f) => Some(f.to_string()),
            Value::Text(s) => Some(s.clone()),
            Value::Timestamp(ts) => Some(ts.to_string()),
        }
    }
}

/// Column types used when creating a table for `push_data`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlType {
    Boolean,
    BigInt,
    Double,
    Timestamp,
    Text,
}

impl SqlType {
    pub fn as_sql(&self) -> &'static str {
        match self {
            SqlType::Boolean => "BOOLEAN",
            SqlType::BigInt => "BIGINT",
            SqlType::Double => "DOUBLE PRECISION",
            SqlType::Timestamp => "TIMESTAMP",
            SqlType::Text => "TEXT",
        }
    }

    /// Widen two observed types into one that holds both.
    fn merge(a: Option<SqlType>, b: Option<SqlType>) -> Option<SqlType> {
        match (a, b) {
            (None, x) | (x, None) => x,
            (Some(a), Some(b)) if a == b => Some(a),
            (Some(SqlType::BigInt), Some(SqlType::Double))
            | (Some(SqlType::Double), Some(SqlType::BigInt)) => Some(SqlType::Double),
            _ => Some(SqlType::Text),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FrameColumn {
    pub name: String,
    /// PostgreSQL type name for query results, empty for user-built frames.
    pub type_name: String,
}

impl FrameColumn {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: String::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DataFrame {
    columns: Vec<FrameColumn>,
    rows: Vec<Vec<Value>>,
}

impl DataFrame {
    pub fn new(columns: Vec<FrameColumn>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    pub fn with_columns<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(names.into_iter().map(FrameColumn::new).collect())
    }

    pub fn push_row(&mut self, row: Vec<Value>) -> Result<()> {
        if row.len() != self.columns.len() {
            return Err(Error::Write(format!(
                "row has {} values but the frame has {} columns",
                row.len(),
                self.columns.len()
            )));
        }
        self.rows.push(row);
        Ok(())
    }

    /// Read a CSV document with a header row, inferring each cell's type.
    pub fn from_csv<R: Read>(reader: R) -> Result<Self> {
        let mut reader = csv::Reader::from_reader(reader);
        let headers = reader
            .headers()
            .map_err(|e| Error::Write(format!("invalid CSV header: {}", e)))?
            .clone();

        let mut frame = Self::with_columns(headers.iter());
        for (line, record) in reader.records().enumerate() {
            let record = record
                .map_err(|e| Error::Write(format!("invalid CSV record {}: {}", line + 1, e)))?;
            frame.push_row(record.iter().map(Value::infer).collect())?;
        }
        Ok(frame)
    }

    /// Empty frame shaped like a statement's result columns.
    pub(crate) fn from_pg_columns(columns: &[PgColumn]) -> Self {
        Self::new(
            columns
                .iter()
                .map(|col| FrameColumn {
                    name: col.name().to_string(),
                    type_name: col.type_info().name().to_string(),
                })
                .collect(),
        )
    }

    pub(crate) fn from_pg_rows(rows: &[PgRow]) -> Self {
        let Some(first) = rows.first() else {
            return Self::default();
        };

        let columns = Self::from_pg_columns(first.columns()).columns;
        let rows = rows
            .iter()
            .map(|row| {
                row.columns()
                    .iter()
                    .enumerate()
                    .map(|(i, column)| decode_cell(row, column, i))
                    .collect()
            })
            .collect();

        Self { columns, rows }
    }

    pub fn columns(&self) -> &[FrameColumn] {
        &self.columns
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn rows(&self) -> &[Vec<Value>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn width(&self) -> usize {
        self.columns.len()
    }

    /// Cell at `row` in the column called `column`.
    pub fn get(&self, row: usize, column: &str) -> Option<&Value> {
        let idx = self.columns.iter().position(|c| c.name == column)?;
        self.rows.get(row)?.get(idx)
    }

    /// Narrowest [`SqlType`] holding every value of column `idx`; TEXT when
    /// the column is entirely NULL.
    pub fn column_type(&self, idx: usize) -> SqlType {
        self.rows
            .iter()
            .filter_map(|row| row.get(idx))
            .fold(None, |acc, value| SqlType::merge(acc, value.sql_type()))
            .unwrap_or(SqlType::Text)
    }

    pub fn column_types(&self) -> Vec<SqlType> {
        (0..self.width()).map(|idx| self.column_type(idx)).collect()
    }
}

fn decode_cell(row: &PgRow, column: &PgColumn, index: usize) -> Value {
    match row.try_get_raw(index) {
        Ok(raw) if raw.is_null() => return Value::Null,
        Ok(_) => {}
        Err(e) => {
            debug!("Cannot read column {}: {}", column.name(), e);
            return Value::Null;
        }
    }

    let decoded = match column.type_info().name() {
        "BOOL" => row.try_get::<bool, _>(index).map(Value::Bool),
        "INT2" => row.try_get::<i16, _>(index).map(|v| Value::Int(v.into())),
        "INT4" => row.try_get::<i32, _>(index).map(|v| Value::Int(v.into())),
        "INT8" => row.try_get::<i64, _>(index).map(Value::Int),
        "FLOAT4" => row.try_get::<f32, _>(index).map(|v| Value::Float(v.into())),
        "FLOAT8" => row.try_get::<f64, _>(index).map(Value::Float),
        "NUMERIC" => row.try_get::<rust_decimal::Decimal, _>(index).map(|v| {
            v.to_f64()
                .map(Value::Float)
                .unwrap_or_else(|| Value::Text(v.to_string()))
        }),
        "TIMESTAMP" => row.try_get::<NaiveDateTime, _>(index).map(Value::Timestamp),
        "TIMESTAMPTZ" => row
            .try_get::<chrono::DateTime<chrono::Utc>, _>(index)
            .map(|v| Value::Timestamp(v.naive_utc())),
        "DATE" => row
            .try_get::<chrono::NaiveDate, _>(index)
            .map(|v| Value::Text(v.to_string())),
        _ => row.try_get_unchecked::<String, _>(index).map(Value::Text),
    };

    decoded
        .or_else(|e| {
            debug!(
                "Keeping column {} of type {} as text: {}",
                column.name(),
                column.type_info().name(),
                e
            );
            row.try_get_unchecked::<String, _>(index).map(Value::Text)
        })
        .unwrap_or_else(|e| {
            debug!("Cannot decode column {}: {}", column.name(), e);
            Value::Null
        })
}

/// Optional sign followed by digits only.
fn is_integer_literal(s: &str) -> bool {
    let digits = s.strip_prefix(['+', '-']).unwrap_or(s);
    !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;

    mod inference {
        use super::*;

        #[test]
        fn test_infers_scalars() {
            assert_eq!(Value::infer(""), Value::Null);
            assert_eq!(Value::infer("true"), Value::Bool(true));
            assert_eq!(Value::infer("42"), Value::Int(42));
            assert_eq!(Value::infer("-3.5"), Value::Float(-3.5));
            assert_eq!(Value::infer("hello"), Value::Text("hello".to_string()));
        }

        #[test]
        fn test_infers_timestamps() {
            let ts = NaiveDateTime::parse_from_str("2024-05-01 12:30:00", "%Y-%m-%d %H:%M:%S")
                .unwrap();
            assert_eq!(Value::infer("2024-05-01 12:30:00"), Value::Timestamp(ts));
            assert_eq!(Value::infer("2024-05-01T12:30:00"), Value::Timestamp(ts));
        }

        #[test]
        fn test_integer_beyond_i64_stays_text() {
            assert_eq!(
                Value::infer("12345678901234567890"),
                Value::Text("12345678901234567890".to_string())
            );
            assert_eq!(
                Value::infer("-99999999999999999999"),
                Value::Text("-99999999999999999999".to_string())
            );
            assert_eq!(Value::infer("9223372036854775807"), Value::Int(i64::MAX));
            assert_eq!(Value::infer("1e30"), Value::Float(1e30));
        }

        #[test]
        fn test_nan_stays_text() {
            assert_eq!(Value::infer("NaN"), Value::Text("NaN".to_string()));
        }
    }

    mod column_types {
        use super::*;

        fn frame(values: Vec<Value>) -> DataFrame {
            let mut frame = DataFrame::with_columns(["c"]);
            for v in values {
                frame.push_row(vec![v]).unwrap();
            }
            frame
        }

        #[test]
        fn test_nulls_are_ignored() {
            let f = frame(vec![Value::Null, Value::Int(1), Value::Null]);
            assert_eq!(f.column_type(0), SqlType::BigInt);
        }

        #[test]
        fn test_int_and_float_widen_to_double() {
            let f = frame(vec![Value::Int(1), Value::Float(1.5)]);
            assert_eq!(f.column_type(0), SqlType::Double);
        }

        #[test]
        fn test_conflicting_types_become_text() {
            let f = frame(vec![Value::Bool(true), Value::Int(1)]);
            assert_eq!(f.column_type(0), SqlType::Text);
        }

        #[test]
        fn test_all_null_column_is_text() {
            let f = frame(vec![Value::Null, Value::Null]);
            assert_eq!(f.column_type(0), SqlType::Text);
        }

        #[test]
        fn test_sql_names() {
            assert_eq!(SqlType::Double.as_sql(), "DOUBLE PRECISION");
            assert_eq!(SqlType::Timestamp.as_sql(), "TIMESTAMP");
        }
    }

    mod frame_building {
        use super::*;

        #[test]
        fn test_push_row_rejects_wrong_width() {
            let mut frame = DataFrame::with_columns(["a", "b"]);
            let err = frame.push_row(vec![Value::Int(1)]).unwrap_err();
            assert!(matches!(err, Error::Write(_)));
            assert!(frame.is_empty());
        }

        #[test]
        fn test_from_csv() {
            let csv = "id,name,score,active\n1,ada,9.5,true\n2,,7,false\n";
            let frame = DataFrame::from_csv(csv.as_bytes()).unwrap();
            assert_eq!(frame.column_names(), vec!["id", "name", "score", "active"]);
            assert_eq!(frame.len(), 2);
            assert_eq!(frame.get(0, "name"), Some(&Value::Text("ada".to_string())));
            assert_eq!(frame.get(1, "name"), Some(&Value::Null));
            assert_eq!(
                frame.column_types(),
                vec![SqlType::BigInt, SqlType::Text, SqlType::Double, SqlType::Boolean]
            );
        }

        #[test]
        fn test_from_csv_ragged_record_fails() {
            let csv = "a,b\n1,2\n3\n";
            assert!(DataFrame::from_csv(csv.as_bytes()).is_err());
        }

        #[test]
        fn test_get_unknown_column() {
            let frame = DataFrame::with_columns(["a"]);
            assert_eq!(frame.get(0, "b"), None);
        }

        #[test]
        fn test_serializes_cells_untagged() {
            let mut frame = DataFrame::with_columns(["a", "b"]);
            frame
                .push_row(vec![Value::Int(1), Value::Null])
                .unwrap();
            let json = serde_json::to_value(&frame).unwrap();
            assert_eq!(json["rows"][0][0], 1);
            assert!(json["rows"][0][1].is_null());
            assert_eq!(json["columns"][0]["name"], "a");
        }
    }
}
