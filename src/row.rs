// ABOUTME: Typed row representation moved between source and target
// ABOUTME: Ordered column values plus a shared name-to-index lookup

use std::cmp::Ordering;
use std::collections::HashMap;
use std::error::Error;
use std::sync::Arc;

use bytes::BytesMut;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rust_decimal::Decimal;
use tokio_postgres::types::{to_sql_checked, IsNull, ToSql, Type};

use crate::schema::ColumnType;

/// A single column value.
///
/// Variants mirror [`ColumnType`]; integers and floats are re-encoded to the
/// width of the target column when bound, so a source `integer` can land in
/// a target `bigint`.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Bool(bool),
    I16(i16),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    Numeric(Decimal),
    Text(String),
    Uuid(uuid::Uuid),
    Date(NaiveDate),
    Time(NaiveTime),
    Timestamp(NaiveDateTime),
    TimestampTz(DateTime<Utc>),
    Json(serde_json::Value),
    Bytes(Vec<u8>),
    /// Text form of a value with no native variant.
    Raw(String),
}

impl SqlValue {
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    fn as_i64(&self) -> Option<i64> {
        match self {
            SqlValue::I16(v) => Some(i64::from(*v)),
            SqlValue::I32(v) => Some(i64::from(*v)),
            SqlValue::I64(v) => Some(*v),
            _ => None,
        }
    }

    fn as_f64(&self) -> Option<f64> {
        match self {
            SqlValue::F32(v) => Some(f64::from(*v)),
            SqlValue::F64(v) => Some(*v),
            other => other.as_i64().map(|v| v as f64),
        }
    }

    /// Order two values of compatible kinds. `NULL` and mismatched kinds do
    /// not compare, matching SQL's `>` yielding NULL.
    pub fn compare(&self, other: &SqlValue) -> Option<Ordering> {
        use SqlValue::*;
        match (self, other) {
            (Null, _) | (_, Null) => None,
            (Bool(a), Bool(b)) => Some(a.cmp(b)),
            (Numeric(a), Numeric(b)) => Some(a.cmp(b)),
            (Text(a), Text(b)) => Some(a.cmp(b)),
            (Uuid(a), Uuid(b)) => Some(a.cmp(b)),
            (Date(a), Date(b)) => Some(a.cmp(b)),
            (Time(a), Time(b)) => Some(a.cmp(b)),
            (Timestamp(a), Timestamp(b)) => Some(a.cmp(b)),
            (TimestampTz(a), TimestampTz(b)) => Some(a.cmp(b)),
            (Bytes(a), Bytes(b)) => Some(a.cmp(b)),
            (Raw(a), Raw(b)) => Some(a.cmp(b)),
            (a, b) => match (a.as_i64(), b.as_i64()) {
                (Some(x), Some(y)) => Some(x.cmp(&y)),
                _ => match (a.as_f64(), b.as_f64()) {
                    (Some(x), Some(y)) => x.partial_cmp(&y),
                    _ => None,
                },
            },
        }
    }

    /// Read column `idx` of a PostgreSQL row as `kind`.
    pub fn from_pg_row(
        row: &tokio_postgres::Row,
        idx: usize,
        kind: ColumnType,
    ) -> Result<SqlValue, tokio_postgres::Error> {
        fn opt<T>(value: Option<T>, wrap: fn(T) -> SqlValue) -> SqlValue {
            value.map_or(SqlValue::Null, wrap)
        }

        let value = match kind {
            ColumnType::Bool => opt(row.try_get(idx)?, SqlValue::Bool),
            ColumnType::Int2 => opt(row.try_get(idx)?, SqlValue::I16),
            ColumnType::Int4 => opt(row.try_get(idx)?, SqlValue::I32),
            ColumnType::Int8 => opt(row.try_get(idx)?, SqlValue::I64),
            ColumnType::Float4 => opt(row.try_get(idx)?, SqlValue::F32),
            ColumnType::Float8 => opt(row.try_get(idx)?, SqlValue::F64),
            ColumnType::Numeric => opt(row.try_get(idx)?, SqlValue::Numeric),
            ColumnType::Text => opt(row.try_get(idx)?, SqlValue::Text),
            ColumnType::Uuid => opt(row.try_get(idx)?, SqlValue::Uuid),
            ColumnType::Date => opt(row.try_get(idx)?, SqlValue::Date),
            ColumnType::Time => opt(row.try_get(idx)?, SqlValue::Time),
            ColumnType::Timestamp => opt(row.try_get(idx)?, SqlValue::Timestamp),
            ColumnType::TimestampTz => opt(row.try_get(idx)?, SqlValue::TimestampTz),
            ColumnType::Json => opt(row.try_get(idx)?, SqlValue::Json),
            ColumnType::Bytea => opt(row.try_get(idx)?, SqlValue::Bytes),
            ColumnType::Raw => opt(row.try_get(idx)?, SqlValue::Raw),
        };
        Ok(value)
    }
}

fn int_to_sql(
    value: i64,
    ty: &Type,
    out: &mut BytesMut,
) -> Result<IsNull, Box<dyn Error + Sync + Send>> {
    if *ty == Type::INT2 {
        i16::try_from(value)?.to_sql(ty, out)
    } else if *ty == Type::INT4 {
        i32::try_from(value)?.to_sql(ty, out)
    } else if *ty == Type::FLOAT4 {
        (value as f32).to_sql(ty, out)
    } else if *ty == Type::FLOAT8 {
        (value as f64).to_sql(ty, out)
    } else if *ty == Type::NUMERIC {
        Decimal::from(value).to_sql(ty, out)
    } else {
        value.to_sql(ty, out)
    }
}

impl ToSql for SqlValue {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> Result<IsNull, Box<dyn Error + Sync + Send>> {
        match self {
            SqlValue::Null => Ok(IsNull::Yes),
            SqlValue::Bool(v) => v.to_sql(ty, out),
            SqlValue::I16(v) => int_to_sql(i64::from(*v), ty, out),
            SqlValue::I32(v) => int_to_sql(i64::from(*v), ty, out),
            SqlValue::I64(v) => int_to_sql(*v, ty, out),
            SqlValue::F32(v) if *ty == Type::FLOAT8 => f64::from(*v).to_sql(ty, out),
            SqlValue::F32(v) => v.to_sql(ty, out),
            SqlValue::F64(v) if *ty == Type::FLOAT4 => (*v as f32).to_sql(ty, out),
            SqlValue::F64(v) => v.to_sql(ty, out),
            SqlValue::Numeric(v) => v.to_sql(ty, out),
            SqlValue::Text(v) => v.to_sql(ty, out),
            SqlValue::Uuid(v) => v.to_sql(ty, out),
            SqlValue::Date(v) => v.to_sql(ty, out),
            SqlValue::Time(v) => v.to_sql(ty, out),
            SqlValue::Timestamp(v) => v.to_sql(ty, out),
            SqlValue::TimestampTz(v) => v.to_sql(ty, out),
            SqlValue::Json(v) => v.to_sql(ty, out),
            SqlValue::Bytes(v) => v.to_sql(ty, out),
            SqlValue::Raw(v) => v.to_sql(ty, out),
        }
    }

    fn accepts(_ty: &Type) -> bool {
        // Each variant delegates to a concrete type that performs its own
        // check at bind time.
        true
    }

    to_sql_checked!();
}

/// Column names of a row set, shared by every row read in one fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnIndex {
    names: Vec<String>,
    lookup: HashMap<String, usize>,
}

impl ColumnIndex {
    pub fn new(names: Vec<String>) -> Self {
        let lookup = names
            .iter()
            .enumerate()
            .map(|(idx, name)| (name.clone(), idx))
            .collect();
        Self { names, lookup }
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.lookup.get(name).copied()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// One row: values in column order.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Arc<ColumnIndex>,
    values: Vec<SqlValue>,
}

impl Row {
    /// Build a row. Missing trailing values are padded with `NULL` and
    /// surplus values are dropped so the row always matches its index.
    pub fn new(columns: Arc<ColumnIndex>, mut values: Vec<SqlValue>) -> Self {
        values.resize(columns.len(), SqlValue::Null);
        Self { columns, values }
    }

    pub fn get(&self, name: &str) -> Option<&SqlValue> {
        self.columns.position(name).map(|idx| &self.values[idx])
    }

    pub fn values(&self) -> &[SqlValue] {
        &self.values
    }

    /// Values of `names` in order; unknown columns read as `NULL`.
    pub fn project(&self, names: &[String]) -> Vec<SqlValue> {
        names
            .iter()
            .map(|n| self.get(n).cloned().unwrap_or(SqlValue::Null))
            .collect()
    }
}

/// Rows produced by one chunk fetch, in key order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowBatch {
    pub rows: Vec<Row>,
}

impl RowBatch {
    pub fn new(rows: Vec<Row>) -> Self {
        Self { rows }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Key of the last row, which becomes the next watermark.
    pub fn last_key(&self, key_columns: &[String]) -> Option<Vec<SqlValue>> {
        self.rows.last().map(|row| row.project(key_columns))
    }
}
