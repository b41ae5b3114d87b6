//! Per-table gateway for CRUD, bulk writes, and upserts.
//!
//! A [`Manager`] is bound to one table of a finalized schema. Read paths hand
//! out [`QuerySet`]s; write paths render their statements here. Multi-batch
//! writes open their own transaction when the backend is not already inside
//! one, and a failed batch aborts the remaining batches of the call.

use crate::backend::Backend;
use crate::condition::{Filter, FilterValue};
use crate::error::{OrmError, OrmResult};
use crate::prefetch::QueryRow;
use crate::queryset::QuerySet;
use crate::schema::{Schema, Table, UniqueConstraint};
use crate::set_functions::SetFunction;
use crate::sql::{Sql, sql};
use crate::value::{Record, SqlValue};
use std::collections::BTreeMap;
use std::sync::Arc;

const DEFAULT_BATCH_SIZE: usize = 1000;

/// Named set functions applied per column instead of plain overwrite.
pub type SetFunctions = BTreeMap<String, SetFunction>;

/// Per-table entry point for queries and writes.
#[derive(Debug, Clone)]
pub struct Manager {
    schema: Arc<Schema>,
    table: String,
}

impl Manager {
    pub fn new(schema: Arc<Schema>, table: impl Into<String>) -> OrmResult<Self> {
        let table = table.into();
        schema.table(&table)?;
        Ok(Self { schema, table })
    }

    pub fn table_name(&self) -> &str {
        &self.table
    }

    fn table_ref(&self) -> OrmResult<&Table> {
        self.schema.table(&self.table)
    }

    // ==================== read paths ====================

    /// A query set matching every row.
    pub fn all(&self) -> OrmResult<QuerySet> {
        QuerySet::new(Arc::clone(&self.schema), self.table.clone())
    }

    pub fn filter(&self, filter: Filter) -> OrmResult<QuerySet> {
        self.all()?.filter(filter)
    }

    pub fn exclude(&self, filter: Filter) -> OrmResult<QuerySet> {
        self.all()?.exclude(filter)
    }

    /// A single-row query set; execute with `one` / `one_opt`.
    pub fn get(&self, filter: Filter) -> OrmResult<QuerySet> {
        Ok(self.all()?.filter(filter)?.single())
    }

    // ==================== create ====================

    /// Insert one row and return it fully materialized (`RETURNING *`).
    ///
    /// NULL values on generated columns (primary key, server defaults) are
    /// stripped so the database produces them.
    pub async fn create(&self, backend: &impl Backend, record: Record) -> OrmResult<QueryRow> {
        let table = self.table_ref()?;
        let record = self.prepare_row(table, record)?;

        let mut q = sql("INSERT INTO ");
        q.push_ident(self.table.as_str())?;
        if record.is_empty() {
            q.push(" DEFAULT VALUES");
        } else {
            q.push(" (");
            for (i, col) in record.columns().enumerate() {
                if i > 0 {
                    q.push(", ");
                }
                q.push_ident(col)?;
            }
            q.push(") VALUES (");
            for (i, value) in record.values().enumerate() {
                if i > 0 {
                    q.push(", ");
                }
                q.push_bind(value.clone());
            }
            q.push(")");
        }
        q.push(" RETURNING *");

        let row = q.fetch_one(backend).await?;
        Ok(QueryRow::new(row, table))
    }

    /// Validate column names and drop NULLs the database will generate.
    fn prepare_row(&self, table: &Table, record: Record) -> OrmResult<Record> {
        let mut out = Record::new();
        for (name, value) in record.into_iter() {
            let column = table.resolve_column(&name)?;
            if value.is_null() && column.is_generated() {
                continue;
            }
            out.set(name, value);
        }
        Ok(out)
    }

    // ==================== bulk insert ====================

    /// Insert rows in batches of `batch_size` (default 1000), one multi-row
    /// statement per batch, all inside a single transaction. Generated
    /// columns come back via `RETURNING` and are written onto the input rows
    /// in order, so index correspondence is exact.
    pub async fn bulk_insert(
        &self,
        backend: &impl Backend,
        rows: &mut [Record],
        batch_size: Option<usize>,
    ) -> OrmResult<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let table = self.table_ref()?;
        let returning: Vec<String> = table
            .generated_columns()
            .iter()
            .map(|s| s.to_string())
            .collect();
        let prepared: Vec<Record> = rows
            .iter()
            .map(|r| self.prepare_row(table, r.clone()))
            .collect::<OrmResult<_>>()?;

        let returned = self
            .bulk_insert_raw(backend, prepared, batch_size, Some(returning))
            .await?;
        for (row, generated) in rows.iter_mut().zip(returned) {
            for (name, value) in generated.into_iter() {
                row.set(name, value);
            }
        }
        Ok(())
    }

    /// Batched multi-row insert with explicit `RETURNING` selection.
    /// Returns the returned rows in input order.
    pub async fn bulk_insert_raw(
        &self,
        backend: &impl Backend,
        rows: Vec<Record>,
        batch_size: Option<usize>,
        returning: Option<Vec<String>>,
    ) -> OrmResult<Vec<Record>> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        let table = self.table_ref()?;
        let columns = uniform_columns(table, &rows)?;
        let batch_size = batch_size.unwrap_or(DEFAULT_BATCH_SIZE).max(1);

        let mut statements = Vec::new();
        for batch in rows.chunks(batch_size) {
            statements.push(self.insert_statement(&columns, batch, returning.as_deref(), None)?);
        }
        run_statements(backend, statements, returning.is_some()).await
    }

    fn insert_statement(
        &self,
        columns: &[String],
        batch: &[Record],
        returning: Option<&[String]>,
        conflict: Option<&ConflictClause<'_>>,
    ) -> OrmResult<Sql> {
        let mut q = sql("INSERT INTO ");
        q.push_ident(self.table.as_str())?;
        q.push(" (");
        for (i, col) in columns.iter().enumerate() {
            if i > 0 {
                q.push(", ");
            }
            q.push_ident(col.as_str())?;
        }
        q.push(") VALUES ");
        for (r, row) in batch.iter().enumerate() {
            if r > 0 {
                q.push(", ");
            }
            q.push("(");
            for (i, col) in columns.iter().enumerate() {
                if i > 0 {
                    q.push(", ");
                }
                q.push_bind(row.get(col).cloned().unwrap_or(SqlValue::Null));
            }
            q.push(")");
        }
        if let Some(conflict) = conflict {
            self.push_conflict_clause(&mut q, conflict)?;
        }
        if let Some(returning) = returning {
            if returning.is_empty() {
                q.push(" RETURNING *");
            } else {
                q.push(" RETURNING ");
                for (i, col) in returning.iter().enumerate() {
                    if i > 0 {
                        q.push(", ");
                    }
                    q.push_ident(col.as_str())?;
                }
            }
        }
        Ok(q)
    }

    // ==================== bulk update ====================

    /// Update many rows with one statement per batch: the incoming rows form
    /// a `VALUES` table joined against the target on `key_fields`, and each
    /// non-key column is either overwritten or merged through a set function.
    /// Returns the total affected row count.
    pub async fn bulk_update(
        &self,
        backend: &impl Backend,
        rows: Vec<Record>,
        key_fields: &[&str],
        set_functions: &SetFunctions,
        batch_size: Option<usize>,
    ) -> OrmResult<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        if key_fields.is_empty() {
            return Err(OrmError::Validation(
                "bulk_update requires at least one key field".to_string(),
            ));
        }
        let table = self.table_ref()?;
        let columns = uniform_columns(table, &rows)?;
        for key in key_fields {
            if !columns.iter().any(|c| c == key) {
                return Err(OrmError::Validation(format!(
                    "key field '{key}' is missing from the update rows"
                )));
            }
        }
        if columns.len() == key_fields.len() {
            return Err(OrmError::Validation(
                "bulk_update rows carry no non-key columns".to_string(),
            ));
        }
        let batch_size = batch_size.unwrap_or(DEFAULT_BATCH_SIZE).max(1);

        let mut statements = Vec::new();
        for batch in rows.chunks(batch_size) {
            statements.push(self.update_statement(table, &columns, batch, key_fields, set_functions)?);
        }

        let mut affected = 0;
        if backend.in_transaction() || statements.len() <= 1 {
            for stmt in statements {
                affected += stmt.execute(backend).await?;
            }
        } else {
            let tx = backend.begin().await?;
            for stmt in statements {
                match stmt.execute(&tx).await {
                    Ok(n) => affected += n,
                    Err(e) => {
                        let _ = tx.rollback().await;
                        return Err(e);
                    }
                }
            }
            tx.commit().await?;
        }
        Ok(affected)
    }

    fn update_statement(
        &self,
        table: &Table,
        columns: &[String],
        batch: &[Record],
        key_fields: &[&str],
        set_functions: &SetFunctions,
    ) -> OrmResult<Sql> {
        let mut q = sql("UPDATE ");
        q.push_ident(self.table.as_str())?;
        q.push(" AS t SET ");

        let mut first = true;
        for col in columns {
            if key_fields.iter().any(|k| k == col) {
                continue;
            }
            if !first {
                q.push(", ");
            }
            first = false;
            q.push_ident(col.as_str())?;
            q.push(" = ");
            let incoming = format!("v.{col}");
            match set_functions.get(col) {
                Some(func) => {
                    let column = table.resolve_column(col)?;
                    q.push(&func.expression(column, &format!("t.{col}"), &incoming));
                }
                None => {
                    q.push(&incoming);
                }
            }
        }

        q.push(" FROM (VALUES ");
        for (r, row) in batch.iter().enumerate() {
            if r > 0 {
                q.push(", ");
            }
            q.push("(");
            for (i, col) in columns.iter().enumerate() {
                if i > 0 {
                    q.push(", ");
                }
                q.push_bind(row.get(col).cloned().unwrap_or(SqlValue::Null));
                // The first row carries explicit casts so Postgres types the
                // whole virtual table.
                if r == 0 {
                    q.push(&format!("::{}", table.resolve_column(col)?.ty.cast_name()));
                }
            }
            q.push(")");
        }
        q.push(") AS v(");
        for (i, col) in columns.iter().enumerate() {
            if i > 0 {
                q.push(", ");
            }
            q.push_ident(col.as_str())?;
        }
        q.push(") WHERE ");
        for (i, key) in key_fields.iter().enumerate() {
            if i > 0 {
                q.push(" AND ");
            }
            q.push(&format!("t.{key} = v.{key}"));
        }
        Ok(q)
    }

    // ==================== upserts ====================

    fn resolve_conflict_target(
        &self,
        table: &Table,
        conflict_target: Option<Vec<String>>,
    ) -> OrmResult<UniqueConstraint> {
        match conflict_target {
            Some(columns) => {
                for col in &columns {
                    table.resolve_column(col)?;
                }
                Ok(table.conflict_target_for(&columns))
            }
            None => table.derive_conflict_target(),
        }
    }

    fn push_conflict_clause(&self, q: &mut Sql, conflict: &ConflictClause<'_>) -> OrmResult<()> {
        q.push(" ON CONFLICT (");
        for (i, col) in conflict.target.columns.iter().enumerate() {
            if i > 0 {
                q.push(", ");
            }
            q.push_ident(col.as_str())?;
        }
        q.push(")");
        if let Some(pred) = &conflict.target.predicate {
            q.push(" WHERE ");
            q.push(pred);
        }

        if !conflict.update {
            q.push(" DO NOTHING");
            return Ok(());
        }

        let table = self.table_ref()?;
        let mut clauses: Vec<String> = Vec::new();
        for col in conflict.update_columns {
            if conflict.target.columns.iter().any(|k| k == col) {
                continue;
            }
            let column = table.resolve_column(col)?;
            let incoming = format!("EXCLUDED.{col}");
            let expr = match conflict.set_functions.get(col) {
                Some(func) => func.expression(column, &format!("{}.{col}", self.table), &incoming),
                None => incoming,
            };
            clauses.push(format!("{col} = {expr}"));
        }
        // Database-side onupdate expressions fire on every conflict-update.
        for column in table.columns() {
            if let Some(expr) = &column.onupdate {
                if !conflict.update_columns.iter().any(|c| *c == column.name) {
                    clauses.push(format!("{} = {expr}", column.name));
                }
            }
        }

        if clauses.is_empty() {
            q.push(" DO NOTHING");
        } else {
            q.push(" DO UPDATE SET ");
            q.push(&clauses.join(", "));
        }
        Ok(())
    }

    /// Insert or merge one row on its conflict target, returning the merged
    /// row. Non-key columns take the incoming value unless a set function is
    /// named for them.
    pub async fn update_or_create(
        &self,
        backend: &impl Backend,
        record: Record,
        conflict_target: Option<Vec<String>>,
        set_functions: &SetFunctions,
    ) -> OrmResult<QueryRow> {
        let table = self.table_ref()?;
        let target = self.resolve_conflict_target(table, conflict_target)?;
        let record = self.prepare_row(table, record)?;
        let columns: Vec<String> = record.columns().map(str::to_string).collect();

        let q = self.insert_statement(
            &columns,
            std::slice::from_ref(&record),
            Some(&[]),
            Some(&ConflictClause {
                target: &target,
                update: true,
                update_columns: &columns,
                set_functions,
            }),
        )?;
        let row = q.fetch_one(backend).await?;
        Ok(QueryRow::new(row, table))
    }

    /// Batched upsert. With `update` false, conflicting rows are left
    /// untouched (`DO NOTHING`). Returns the rows the database reported back
    /// (`RETURNING *`); untouched conflict rows are absent.
    pub async fn bulk_update_or_create(
        &self,
        backend: &impl Backend,
        rows: Vec<Record>,
        update: bool,
        batch_size: Option<usize>,
        conflict_target: Option<Vec<String>>,
        set_functions: &SetFunctions,
    ) -> OrmResult<Vec<Record>> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        let table = self.table_ref()?;
        let target = self.resolve_conflict_target(table, conflict_target)?;
        let columns = uniform_columns(table, &rows)?;
        let batch_size = batch_size.unwrap_or(DEFAULT_BATCH_SIZE).max(1);

        let mut statements = Vec::new();
        for batch in rows.chunks(batch_size) {
            statements.push(self.insert_statement(
                &columns,
                batch,
                Some(&[]),
                Some(&ConflictClause {
                    target: &target,
                    update,
                    update_columns: &columns,
                    set_functions,
                }),
            )?);
        }
        run_statements(backend, statements, true).await
    }

    /// Fetch the row matching `record`'s conflict target, creating it first
    /// when absent. Returns the row and whether it was created.
    pub async fn get_or_create(
        &self,
        backend: &impl Backend,
        record: Record,
        conflict_target: Option<Vec<String>>,
    ) -> OrmResult<(QueryRow, bool)> {
        let table = self.table_ref()?;
        let target = self.resolve_conflict_target(table, conflict_target)?;
        let prepared = self.prepare_row(table, record)?;
        let columns: Vec<String> = prepared.columns().map(str::to_string).collect();

        let q = self.insert_statement(
            &columns,
            std::slice::from_ref(&prepared),
            Some(&[]),
            Some(&ConflictClause {
                target: &target,
                update: false,
                update_columns: &columns,
                set_functions: &SetFunctions::new(),
            }),
        )?;
        if let Some(row) = q.fetch_opt(backend).await? {
            return Ok((QueryRow::new(row, table), true));
        }

        // Nothing inserted: the row already exists, re-fetch it by the
        // conflict-target fields.
        let pairs: Vec<(String, FilterValue)> = target
            .columns
            .iter()
            .map(|col| {
                let value = prepared.get(col).cloned().unwrap_or(SqlValue::Null);
                (col.clone(), FilterValue::Value(value))
            })
            .collect();
        let row = self.get(Filter::pairs(pairs))?.one(backend).await?;
        Ok((row, false))
    }

    /// Insert the row unless its conflict target already exists. Returns
    /// whether a row was created.
    pub async fn create_or_nothing(
        &self,
        backend: &impl Backend,
        record: Record,
        conflict_target: Option<Vec<String>>,
    ) -> OrmResult<bool> {
        let table = self.table_ref()?;
        let target = self.resolve_conflict_target(table, conflict_target)?;
        let prepared = self.prepare_row(table, record)?;
        let columns: Vec<String> = prepared.columns().map(str::to_string).collect();

        let q = self.insert_statement(
            &columns,
            std::slice::from_ref(&prepared),
            None,
            Some(&ConflictClause {
                target: &target,
                update: false,
                update_columns: &columns,
                set_functions: &SetFunctions::new(),
            }),
        )?;
        Ok(q.execute(backend).await? > 0)
    }

    #[cfg(test)]
    pub(crate) fn upsert_statement_for_test(
        &self,
        record: Record,
        conflict_target: Option<Vec<String>>,
        update: bool,
        set_functions: &SetFunctions,
    ) -> OrmResult<Sql> {
        let table = self.table_ref()?;
        let target = self.resolve_conflict_target(table, conflict_target)?;
        let record = self.prepare_row(table, record)?;
        let columns: Vec<String> = record.columns().map(str::to_string).collect();
        self.insert_statement(
            &columns,
            std::slice::from_ref(&record),
            Some(&[]),
            Some(&ConflictClause {
                target: &target,
                update,
                update_columns: &columns,
                set_functions,
            }),
        )
    }

    #[cfg(test)]
    pub(crate) fn update_statement_for_test(
        &self,
        rows: &[Record],
        key_fields: &[&str],
        set_functions: &SetFunctions,
    ) -> OrmResult<Sql> {
        let table = self.table_ref()?;
        let columns = uniform_columns(table, rows)?;
        self.update_statement(table, &columns, rows, key_fields, set_functions)
    }
}

struct ConflictClause<'a> {
    target: &'a UniqueConstraint,
    update: bool,
    update_columns: &'a [String],
    set_functions: &'a SetFunctions,
}

/// All rows of a batched write must carry the same columns, in order.
fn uniform_columns(table: &Table, rows: &[Record]) -> OrmResult<Vec<String>> {
    let columns: Vec<String> = rows[0].columns().map(str::to_string).collect();
    for col in &columns {
        table.resolve_column(col)?;
    }
    for row in &rows[1..] {
        if row.len() != columns.len() || !columns.iter().all(|c| row.contains(c)) {
            return Err(OrmError::Validation(
                "all rows of a batched write must carry the same columns".to_string(),
            ));
        }
    }
    Ok(columns)
}

/// Run a batch of statements, inside one transaction when more than one
/// statement must execute and the backend is not already transactional.
async fn run_statements(
    backend: &impl Backend,
    statements: Vec<Sql>,
    collect_rows: bool,
) -> OrmResult<Vec<Record>> {
    let mut out = Vec::new();
    if backend.in_transaction() || statements.len() <= 1 {
        for stmt in statements {
            if collect_rows {
                out.extend(stmt.fetch_all(backend).await?);
            } else {
                stmt.execute(backend).await?;
            }
        }
    } else {
        let tx = backend.begin().await?;
        for stmt in statements {
            let result = if collect_rows {
                stmt.fetch_all(&tx).await.map(|rows| out.extend(rows))
            } else {
                stmt.execute(&tx).await.map(|_| ())
            };
            if let Err(e) = result {
                let _ = tx.rollback().await;
                return Err(e);
            }
        }
        tx.commit().await?;
    }
    Ok(out)
}
