//! Parameter-safe dynamic SQL builder.
//!
//! `Sql` stores SQL pieces and parameters separately and generates `$1, $2, ...`
//! placeholders automatically in the final SQL string, so composed fragments
//! never have to track placeholder indices by hand.
//!
//! # Example
//!
//! ```ignore
//! use manor::sql::sql;
//!
//! let mut q = sql("SELECT id, username FROM users WHERE 1=1");
//! q.push(" AND status = ").push_bind("active");
//! q.push(" ORDER BY created_at DESC");
//! let rows = q.fetch_all(&backend).await?;
//! ```

use crate::backend::Backend;
use crate::error::{OrmError, OrmResult};
use crate::ident::IntoIdent;
use crate::value::{Record, SqlValue};

#[derive(Debug, Clone)]
enum SqlPart {
    Raw(String),
    Param,
}

/// A SQL-first, parameter-safe dynamic SQL builder.
#[derive(Debug, Clone, Default)]
pub struct Sql {
    parts: Vec<SqlPart>,
    params: Vec<SqlValue>,
}

/// Start building a SQL statement.
pub fn sql(initial_sql: impl Into<String>) -> Sql {
    Sql::new(initial_sql)
}

impl Sql {
    /// Create a new builder with an initial SQL fragment.
    pub fn new(initial_sql: impl Into<String>) -> Self {
        Self {
            parts: vec![SqlPart::Raw(initial_sql.into())],
            params: Vec::new(),
        }
    }

    /// Create an empty builder.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Append raw SQL (no parameters).
    pub fn push(&mut self, sql: &str) -> &mut Self {
        if sql.is_empty() {
            return self;
        }

        match self.parts.last_mut() {
            Some(SqlPart::Raw(last)) => last.push_str(sql),
            _ => self.parts.push(SqlPart::Raw(sql.to_string())),
        }
        self
    }

    /// Append a parameter placeholder and bind its value.
    pub fn push_bind(&mut self, value: impl Into<SqlValue>) -> &mut Self {
        self.parts.push(SqlPart::Param);
        self.params.push(value.into());
        self
    }

    /// Append a comma-separated list of placeholders and bind all values.
    ///
    /// If `values` is empty, this appends `NULL` (so `IN (NULL)` is valid SQL).
    pub fn push_bind_list<T>(&mut self, values: impl IntoIterator<Item = T>) -> &mut Self
    where
        T: Into<SqlValue>,
    {
        let mut iter = values.into_iter();
        let Some(first) = iter.next() else {
            return self.push("NULL");
        };

        self.push_bind(first);
        for v in iter {
            self.push(", ");
            self.push_bind(v);
        }
        self
    }

    /// Append another `Sql` fragment, consuming it.
    pub fn push_sql(&mut self, mut other: Sql) -> &mut Self {
        self.parts.append(&mut other.parts);
        self.params.append(&mut other.params);
        self
    }

    /// Append a SQL identifier (schema/table/column) safely.
    ///
    /// Identifiers cannot be parameterized in Postgres, so this validates via
    /// [`crate::ident::Ident`] before splicing the name into the SQL text.
    pub fn push_ident(&mut self, ident: impl IntoIdent) -> OrmResult<&mut Self> {
        let ident = ident.into_ident()?;
        Ok(self.push(ident.as_str()))
    }

    /// Render SQL with `$1, $2, ...` placeholders.
    pub fn to_sql(&self) -> String {
        let mut out = String::new();
        let mut idx: usize = 0;

        for part in &self.parts {
            match part {
                SqlPart::Raw(s) => out.push_str(s),
                SqlPart::Param => {
                    idx += 1;
                    use std::fmt::Write;
                    let _ = write!(&mut out, "${idx}");
                }
            }
        }
        out
    }

    /// The bound parameters in placeholder order.
    pub fn params(&self) -> &[SqlValue] {
        &self.params
    }

    /// Parameter refs compatible with `tokio-postgres`.
    pub fn params_ref(&self) -> Vec<&(dyn tokio_postgres::types::ToSql + Sync)> {
        self.params
            .iter()
            .map(|p| p as &(dyn tokio_postgres::types::ToSql + Sync))
            .collect()
    }

    fn validate(&self) -> OrmResult<()> {
        let placeholder_count = self
            .parts
            .iter()
            .filter(|p| matches!(p, SqlPart::Param))
            .count();

        if placeholder_count != self.params.len() {
            return Err(OrmError::Validation(format!(
                "Sql: {} placeholders but {} params",
                placeholder_count,
                self.params.len()
            )));
        }
        Ok(())
    }

    /// Execute the built SQL and return all rows.
    pub async fn fetch_all(&self, backend: &impl Backend) -> OrmResult<Vec<Record>> {
        self.validate()?;
        backend.fetch_all(&self.to_sql(), self.params()).await
    }

    /// Execute the built SQL and return at most one row.
    pub async fn fetch_opt(&self, backend: &impl Backend) -> OrmResult<Option<Record>> {
        self.validate()?;
        backend.fetch_one(&self.to_sql(), self.params()).await
    }

    /// Execute the built SQL and return exactly one row.
    pub async fn fetch_one(&self, backend: &impl Backend) -> OrmResult<Record> {
        self.fetch_opt(backend)
            .await?
            .ok_or_else(|| OrmError::not_found("query returned no rows"))
    }

    /// Execute the built SQL and return the affected row count.
    pub async fn execute(&self, backend: &impl Backend) -> OrmResult<u64> {
        self.validate()?;
        backend.execute(&self.to_sql(), self.params()).await
    }
}
