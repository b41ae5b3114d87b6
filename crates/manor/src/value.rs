//! Dynamic SQL values and rows.
//!
//! The engine is schema-driven rather than derive-driven, so rows travel as
//! [`Record`]s: ordered column-name → [`SqlValue`] maps extracted from
//! `tokio_postgres` rows by column type. `SqlValue` implements `ToSql` by
//! delegating to the wrapped scalar, so the same values flow back out as
//! statement parameters.

use crate::error::{OrmError, OrmResult};
use bytes::BytesMut;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use std::hash::{Hash, Hasher};
use tokio_postgres::Row;
use tokio_postgres::types::{IsNull, Kind, ToSql, Type};
use uuid::Uuid;

/// A dynamically typed SQL scalar.
#[derive(Debug, Clone)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Int(i32),
    BigInt(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    Uuid(Uuid),
    Timestamp(NaiveDateTime),
    TimestampTz(DateTime<Utc>),
    Date(NaiveDate),
    Json(serde_json::Value),
    Array(Vec<SqlValue>),
}

impl SqlValue {
    /// Whether this value is SQL NULL.
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    /// Extract the column at `idx` from a driver row, mapping by column type.
    pub fn from_row_column(row: &Row, idx: usize, ty: &Type, column: &str) -> OrmResult<SqlValue> {
        fn get<'a, T>(row: &'a Row, idx: usize, column: &str) -> OrmResult<Option<T>>
        where
            T: tokio_postgres::types::FromSql<'a>,
        {
            row.try_get::<_, Option<T>>(idx)
                .map_err(|e| OrmError::decode(column, e.to_string()))
        }

        let value = if *ty == Type::BOOL {
            get::<bool>(row, idx, column)?.map(SqlValue::Bool)
        } else if *ty == Type::INT2 {
            get::<i16>(row, idx, column)?.map(|v| SqlValue::Int(i32::from(v)))
        } else if *ty == Type::INT4 {
            get::<i32>(row, idx, column)?.map(SqlValue::Int)
        } else if *ty == Type::INT8 {
            get::<i64>(row, idx, column)?.map(SqlValue::BigInt)
        } else if *ty == Type::FLOAT4 {
            get::<f32>(row, idx, column)?.map(|v| SqlValue::Float(f64::from(v)))
        } else if *ty == Type::FLOAT8 {
            get::<f64>(row, idx, column)?.map(SqlValue::Float)
        } else if *ty == Type::TEXT || *ty == Type::VARCHAR || *ty == Type::BPCHAR || *ty == Type::NAME {
            get::<String>(row, idx, column)?.map(SqlValue::Text)
        } else if *ty == Type::BYTEA {
            get::<Vec<u8>>(row, idx, column)?.map(SqlValue::Bytes)
        } else if *ty == Type::UUID {
            get::<Uuid>(row, idx, column)?.map(SqlValue::Uuid)
        } else if *ty == Type::TIMESTAMP {
            get::<NaiveDateTime>(row, idx, column)?.map(SqlValue::Timestamp)
        } else if *ty == Type::TIMESTAMPTZ {
            get::<DateTime<Utc>>(row, idx, column)?.map(SqlValue::TimestampTz)
        } else if *ty == Type::DATE {
            get::<NaiveDate>(row, idx, column)?.map(SqlValue::Date)
        } else if *ty == Type::JSON || *ty == Type::JSONB {
            get::<serde_json::Value>(row, idx, column)?.map(SqlValue::Json)
        } else if let Kind::Array(_) = ty.kind() {
            Self::array_from_row_column(row, idx, ty, column)?
        } else {
            // Last resort: let the driver hand us text if it can.
            get::<String>(row, idx, column)?.map(SqlValue::Text)
        };

        Ok(value.unwrap_or(SqlValue::Null))
    }

    fn array_from_row_column(
        row: &Row,
        idx: usize,
        ty: &Type,
        column: &str,
    ) -> OrmResult<Option<SqlValue>> {
        fn get_vec<'a, T>(row: &'a Row, idx: usize, column: &str) -> OrmResult<Option<Vec<T>>>
        where
            T: tokio_postgres::types::FromSql<'a>,
        {
            row.try_get::<_, Option<Vec<T>>>(idx)
                .map_err(|e| OrmError::decode(column, e.to_string()))
        }

        let value = if *ty == Type::INT2_ARRAY {
            get_vec::<i16>(row, idx, column)?
                .map(|v| v.into_iter().map(|i| SqlValue::Int(i32::from(i))).collect())
        } else if *ty == Type::INT4_ARRAY {
            get_vec::<i32>(row, idx, column)?
                .map(|v| v.into_iter().map(SqlValue::Int).collect())
        } else if *ty == Type::INT8_ARRAY {
            get_vec::<i64>(row, idx, column)?
                .map(|v| v.into_iter().map(SqlValue::BigInt).collect())
        } else if *ty == Type::TEXT_ARRAY || *ty == Type::VARCHAR_ARRAY {
            get_vec::<String>(row, idx, column)?
                .map(|v| v.into_iter().map(SqlValue::Text).collect())
        } else if *ty == Type::UUID_ARRAY {
            get_vec::<Uuid>(row, idx, column)?
                .map(|v| v.into_iter().map(SqlValue::Uuid).collect())
        } else if *ty == Type::BOOL_ARRAY {
            get_vec::<bool>(row, idx, column)?
                .map(|v| v.into_iter().map(SqlValue::Bool).collect())
        } else if *ty == Type::FLOAT8_ARRAY {
            get_vec::<f64>(row, idx, column)?
                .map(|v| v.into_iter().map(SqlValue::Float).collect())
        } else {
            return Err(OrmError::decode(
                column,
                format!("unsupported array element type '{ty}'"),
            ));
        };

        Ok(value.map(SqlValue::Array))
    }
}

impl PartialEq for SqlValue {
    fn eq(&self, other: &Self) -> bool {
        use SqlValue::*;
        match (self, other) {
            (Null, Null) => true,
            (Bool(a), Bool(b)) => a == b,
            (Int(a), Int(b)) => a == b,
            (BigInt(a), BigInt(b)) => a == b,
            (Int(a), BigInt(b)) | (BigInt(b), Int(a)) => i64::from(*a) == *b,
            // Bitwise so NaN keys behave as map keys.
            (Float(a), Float(b)) => a.to_bits() == b.to_bits(),
            (Text(a), Text(b)) => a == b,
            (Bytes(a), Bytes(b)) => a == b,
            (Uuid(a), Uuid(b)) => a == b,
            (Timestamp(a), Timestamp(b)) => a == b,
            (TimestampTz(a), TimestampTz(b)) => a == b,
            (Date(a), Date(b)) => a == b,
            (Json(a), Json(b)) => a == b,
            (Array(a), Array(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for SqlValue {}

impl Hash for SqlValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        use SqlValue::*;
        match self {
            Null => state.write_u8(0),
            Bool(v) => v.hash(state),
            // Int and BigInt hash identically so cross-width equality holds.
            Int(v) => i64::from(*v).hash(state),
            BigInt(v) => v.hash(state),
            Float(v) => v.to_bits().hash(state),
            Text(v) => v.hash(state),
            Bytes(v) => v.hash(state),
            Uuid(v) => v.hash(state),
            Timestamp(v) => v.hash(state),
            TimestampTz(v) => v.hash(state),
            Date(v) => v.hash(state),
            Json(v) => v.to_string().hash(state),
            Array(v) => v.hash(state),
        }
    }
}

impl ToSql for SqlValue {
    fn to_sql(
        &self,
        ty: &Type,
        out: &mut BytesMut,
    ) -> Result<IsNull, Box<dyn std::error::Error + Sync + Send>> {
        match self {
            SqlValue::Null => Ok(IsNull::Yes),
            SqlValue::Bool(v) => v.to_sql(ty, out),
            SqlValue::Int(v) => {
                if *ty == Type::INT8 {
                    i64::from(*v).to_sql(ty, out)
                } else if *ty == Type::INT2 {
                    i16::try_from(*v)?.to_sql(ty, out)
                } else {
                    v.to_sql(ty, out)
                }
            }
            SqlValue::BigInt(v) => {
                if *ty == Type::INT4 {
                    i32::try_from(*v)?.to_sql(ty, out)
                } else if *ty == Type::INT2 {
                    i16::try_from(*v)?.to_sql(ty, out)
                } else {
                    v.to_sql(ty, out)
                }
            }
            SqlValue::Float(v) => {
                if *ty == Type::FLOAT4 {
                    (*v as f32).to_sql(ty, out)
                } else {
                    v.to_sql(ty, out)
                }
            }
            SqlValue::Text(v) => v.to_sql(ty, out),
            SqlValue::Bytes(v) => v.to_sql(ty, out),
            SqlValue::Uuid(v) => v.to_sql(ty, out),
            SqlValue::Timestamp(v) => v.to_sql(ty, out),
            SqlValue::TimestampTz(v) => v.to_sql(ty, out),
            SqlValue::Date(v) => v.to_sql(ty, out),
            SqlValue::Json(v) => v.to_sql(ty, out),
            SqlValue::Array(v) => v.to_sql(ty, out),
        }
    }

    fn accepts(_ty: &Type) -> bool {
        // Values are dynamically typed; the delegated impl rejects genuine
        // mismatches at encode time.
        true
    }

    fn to_sql_checked(
        &self,
        ty: &Type,
        out: &mut BytesMut,
    ) -> Result<IsNull, Box<dyn std::error::Error + Sync + Send>> {
        self.to_sql(ty, out)
    }
}

impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        SqlValue::Bool(v)
    }
}

impl From<i16> for SqlValue {
    fn from(v: i16) -> Self {
        SqlValue::Int(i32::from(v))
    }
}

impl From<i32> for SqlValue {
    fn from(v: i32) -> Self {
        SqlValue::Int(v)
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::BigInt(v)
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        SqlValue::Float(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

impl From<Uuid> for SqlValue {
    fn from(v: Uuid) -> Self {
        SqlValue::Uuid(v)
    }
}

impl From<DateTime<Utc>> for SqlValue {
    fn from(v: DateTime<Utc>) -> Self {
        SqlValue::TimestampTz(v)
    }
}

impl From<NaiveDateTime> for SqlValue {
    fn from(v: NaiveDateTime) -> Self {
        SqlValue::Timestamp(v)
    }
}

impl From<NaiveDate> for SqlValue {
    fn from(v: NaiveDate) -> Self {
        SqlValue::Date(v)
    }
}

impl From<serde_json::Value> for SqlValue {
    fn from(v: serde_json::Value) -> Self {
        SqlValue::Json(v)
    }
}

impl From<Vec<u8>> for SqlValue {
    fn from(v: Vec<u8>) -> Self {
        SqlValue::Bytes(v)
    }
}

impl From<Vec<SqlValue>> for SqlValue {
    fn from(v: Vec<SqlValue>) -> Self {
        SqlValue::Array(v)
    }
}

impl<T> From<Option<T>> for SqlValue
where
    T: Into<SqlValue>,
{
    fn from(v: Option<T>) -> Self {
        v.map_or(SqlValue::Null, Into::into)
    }
}

/// An ordered column-name → value map representing one row.
///
/// Lookup is linear; rows are narrow enough that this beats hashing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record(Vec<(String, SqlValue)>);

impl Record {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Build a record from `(column, value)` pairs.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<SqlValue>,
    {
        Self(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    /// Convert a driver row, extracting every column by its declared type.
    pub fn from_row(row: &Row) -> OrmResult<Self> {
        let mut record = Record::new();
        for (idx, col) in row.columns().iter().enumerate() {
            let value = SqlValue::from_row_column(row, idx, col.type_(), col.name())?;
            record.push(col.name().to_string(), value);
        }
        Ok(record)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, column: &str) -> bool {
        self.0.iter().any(|(k, _)| k == column)
    }

    pub fn get(&self, column: &str) -> Option<&SqlValue> {
        self.0.iter().find(|(k, _)| k == column).map(|(_, v)| v)
    }

    /// Set a column value, replacing any existing entry of the same name.
    pub fn set(&mut self, column: impl Into<String>, value: impl Into<SqlValue>) {
        let column = column.into();
        let value = value.into();
        match self.0.iter_mut().find(|(k, _)| *k == column) {
            Some(slot) => slot.1 = value,
            None => self.0.push((column, value)),
        }
    }

    /// Append a column without checking for duplicates.
    pub(crate) fn push(&mut self, column: String, value: SqlValue) {
        self.0.push((column, value));
    }

    /// Remove and return a column value.
    pub fn remove(&mut self, column: &str) -> Option<SqlValue> {
        let idx = self.0.iter().position(|(k, _)| k == column)?;
        Some(self.0.remove(idx).1)
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|(k, _)| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &SqlValue)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn into_iter(self) -> impl Iterator<Item = (String, SqlValue)> {
        self.0.into_iter()
    }

    /// Values in column order.
    pub fn values(&self) -> impl Iterator<Item = &SqlValue> {
        self.0.iter().map(|(_, v)| v)
    }
}

impl FromIterator<(String, SqlValue)> for Record {
    fn from_iter<I: IntoIterator<Item = (String, SqlValue)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}
