//! Read-only row wrapper and typed projection.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use tokio_postgres::row::RowIndex;
use tokio_postgres::types::{FromSql, Type};
use tokio_postgres::Row;

use crate::error::Result;
use crate::value::Value;

/// Copy the relevant fields of a row into a caller-defined shape.
pub trait FromRow: Sized {
    fn from_row(row: &DbRow) -> Result<Self>;
}

/// A thin, read-only view over one result row.
pub struct DbRow {
    inner: Row,
}

impl DbRow {
    pub(crate) fn new(inner: Row) -> Self {
        Self { inner }
    }

    /// Typed access by name or index. Panics on a missing column or a type
    /// mismatch, like `Row::get`.
    pub fn get<'a, I, T>(&'a self, idx: I) -> T
    where
        I: RowIndex + std::fmt::Display,
        T: FromSql<'a>,
    {
        self.inner.get(idx)
    }

    /// Fallible typed access by name or index.
    pub fn try_get<'a, I, T>(&'a self, idx: I) -> Result<T>
    where
        I: RowIndex + std::fmt::Display,
        T: FromSql<'a>,
    {
        Ok(self.inner.try_get(idx)?)
    }

    /// Dynamically typed access by column name; unknown names and unmapped
    /// column types come back as `Value::Null` / text fallback.
    pub fn value(&self, name: &str) -> Value {
        match self
            .inner
            .columns()
            .iter()
            .position(|c| c.name() == name)
        {
            Some(idx) => extract_value(&self.inner, idx, self.inner.columns()[idx].type_()),
            None => Value::Null,
        }
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.inner.columns().iter().map(|c| c.name()).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.columns().iter().any(|c| c.name() == name)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Project into a typed shape.
    pub fn decode<T: FromRow>(&self) -> Result<T> {
        T::from_row(self)
    }

    pub fn into_inner(self) -> Row {
        self.inner
    }
}

impl std::fmt::Debug for DbRow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbRow")
            .field("columns", &self.column_names())
            .finish()
    }
}

fn extract_value(row: &Row, idx: usize, pg_type: &Type) -> Value {
    match *pg_type {
        Type::BOOL => row
            .try_get::<_, Option<bool>>(idx)
            .ok()
            .flatten()
            .map(Value::Bool)
            .unwrap_or(Value::Null),
        Type::INT2 => row
            .try_get::<_, Option<i16>>(idx)
            .ok()
            .flatten()
            .map(Value::Int2)
            .unwrap_or(Value::Null),
        Type::INT4 => row
            .try_get::<_, Option<i32>>(idx)
            .ok()
            .flatten()
            .map(Value::Int4)
            .unwrap_or(Value::Null),
        Type::INT8 => row
            .try_get::<_, Option<i64>>(idx)
            .ok()
            .flatten()
            .map(Value::Int8)
            .unwrap_or(Value::Null),
        Type::FLOAT4 => row
            .try_get::<_, Option<f32>>(idx)
            .ok()
            .flatten()
            .map(Value::Float4)
            .unwrap_or(Value::Null),
        Type::FLOAT8 => row
            .try_get::<_, Option<f64>>(idx)
            .ok()
            .flatten()
            .map(Value::Float8)
            .unwrap_or(Value::Null),
        Type::TEXT | Type::VARCHAR | Type::NAME | Type::CHAR | Type::BPCHAR => row
            .try_get::<_, Option<String>>(idx)
            .ok()
            .flatten()
            .map(Value::Text)
            .unwrap_or(Value::Null),
        Type::BYTEA => row
            .try_get::<_, Option<Vec<u8>>>(idx)
            .ok()
            .flatten()
            .map(Value::Bytes)
            .unwrap_or(Value::Null),
        Type::DATE => row
            .try_get::<_, Option<NaiveDate>>(idx)
            .ok()
            .flatten()
            .map(Value::Date)
            .unwrap_or(Value::Null),
        Type::TIME => row
            .try_get::<_, Option<NaiveTime>>(idx)
            .ok()
            .flatten()
            .map(Value::Time)
            .unwrap_or(Value::Null),
        Type::TIMESTAMP => row
            .try_get::<_, Option<NaiveDateTime>>(idx)
            .ok()
            .flatten()
            .map(Value::Timestamp)
            .unwrap_or(Value::Null),
        Type::TIMESTAMPTZ => row
            .try_get::<_, Option<DateTime<Utc>>>(idx)
            .ok()
            .flatten()
            .map(Value::TimestampTz)
            .unwrap_or(Value::Null),
        Type::JSON | Type::JSONB => row
            .try_get::<_, Option<serde_json::Value>>(idx)
            .ok()
            .flatten()
            .map(Value::Json)
            .unwrap_or(Value::Null),
        _ => row
            .try_get::<_, Option<String>>(idx)
            .ok()
            .flatten()
            .map(Value::Text)
            .unwrap_or(Value::Null),
    }
}
