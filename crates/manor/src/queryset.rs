//! The query-building state machine.
//!
//! A `QuerySet` starts in the building state: `filter`, `exclude`,
//! `order_by`, `select_related`, `prefetch_related` and the shaping calls all
//! mutate it fluently, failing fast on build-time errors. Compiling flattens
//! the predicate trees into one conjunction and renders the statement;
//! builder calls after that point fail with `QuerySetAlreadyCompiled`. The
//! terminal executors consume the set, so an executed query cannot be reused.

use crate::backend::Backend;
use crate::condition::{ConditionNode, Filter, FilterValue, Operator, parse_field};
use crate::error::{OrmError, OrmResult};
use crate::ident::Ident;
use crate::prefetch::{PrefetchSpec, QueryRow, assemble_joined, run_prefetches};
use crate::schema::{RelationKind, ResolvedJoin, Schema, Table};
use crate::sql::{Sql, sql};
use crate::value::{Record, SqlValue};
use std::collections::HashMap;
use std::sync::Arc;

/// An aggregate expression with an output label.
#[derive(Debug, Clone)]
pub struct Aggregation {
    func: &'static str,
    column: Option<String>,
    label: String,
}

impl Aggregation {
    pub fn count(label: impl Into<String>) -> Self {
        Self {
            func: "count",
            column: None,
            label: label.into(),
        }
    }

    pub fn sum(column: impl Into<String>, label: impl Into<String>) -> Self {
        Self::with_func("sum", column, label)
    }

    pub fn min(column: impl Into<String>, label: impl Into<String>) -> Self {
        Self::with_func("min", column, label)
    }

    pub fn max(column: impl Into<String>, label: impl Into<String>) -> Self {
        Self::with_func("max", column, label)
    }

    pub fn avg(column: impl Into<String>, label: impl Into<String>) -> Self {
        Self::with_func("avg", column, label)
    }

    pub fn array_agg(column: impl Into<String>, label: impl Into<String>) -> Self {
        Self::with_func("array_agg", column, label)
    }

    fn with_func(
        func: &'static str,
        column: impl Into<String>,
        label: impl Into<String>,
    ) -> Self {
        Self {
            func,
            column: Some(column.into()),
            label: label.into(),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    fn render(&self, q: &mut Sql, prefix: Option<&str>) -> OrmResult<()> {
        q.push(self.func);
        q.push("(");
        match &self.column {
            Some(col) => {
                push_qualified(q, prefix, col)?;
            }
            None => {
                q.push("*");
            }
        }
        q.push(") AS ");
        q.push_ident(self.label.as_str())?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct OrderBy {
    field: String,
    desc: bool,
    nulls_last: bool,
}

#[derive(Debug, Clone)]
enum Projection {
    All,
    Columns(Vec<String>),
}

/// A resolved join hop produced by `select_related`.
#[derive(Debug, Clone)]
struct Join {
    /// Dot-separated relation path; also the (quoted) join alias.
    path: String,
    table: String,
    parent_path: Option<String>,
    target_column: String,
    local_column: String,
}

fn push_qualified(q: &mut Sql, prefix: Option<&str>, column: &str) -> OrmResult<()> {
    // A dotted reference names a join alias, which the SELECT list emits
    // quoted; the reference must be quoted the same way or it case-folds.
    if let Some((path, col)) = column.rsplit_once('.') {
        for seg in path.split('.') {
            Ident::parse(seg)?;
        }
        q.push(&format!("\"{path}\"."));
        q.push_ident(col)?;
        return Ok(());
    }
    match prefix {
        Some(p) => {
            q.push_ident(format!("{p}.{column}"))?;
        }
        None => {
            q.push_ident(column)?;
        }
    }
    Ok(())
}

/// A mutable query description bound to one table.
#[derive(Debug, Clone)]
pub struct QuerySet {
    schema: Arc<Schema>,
    table: String,
    conditions: Vec<ConditionNode>,
    projection: Projection,
    raw_shape: bool,
    annotations: Vec<Aggregation>,
    group_by: Vec<String>,
    having: Option<ConditionNode>,
    joins: Vec<Join>,
    prefetches: Vec<PrefetchSpec>,
    order: Vec<OrderBy>,
    limit: Option<u64>,
    single: bool,
    for_update: bool,
    compiled: bool,
}

impl QuerySet {
    pub(crate) fn new(schema: Arc<Schema>, table: impl Into<String>) -> OrmResult<Self> {
        let table = table.into();
        schema.table(&table)?;
        Ok(Self {
            schema,
            table,
            conditions: Vec::new(),
            projection: Projection::All,
            raw_shape: false,
            annotations: Vec::new(),
            group_by: Vec::new(),
            having: None,
            joins: Vec::new(),
            prefetches: Vec::new(),
            order: Vec::new(),
            limit: None,
            single: false,
            for_update: false,
            compiled: false,
        })
    }

    pub fn table_name(&self) -> &str {
        &self.table
    }

    fn ensure_building(&self) -> OrmResult<()> {
        if self.compiled {
            return Err(OrmError::QuerySetAlreadyCompiled);
        }
        Ok(())
    }

    fn table_ref(&self) -> OrmResult<&Table> {
        self.schema.table(&self.table)
    }

    fn annotation_labels(&self) -> Vec<String> {
        self.annotations.iter().map(|a| a.label.clone()).collect()
    }

    /// Whether `field` resolves to a column or annotation label.
    fn check_field(&self, field: &str) -> OrmResult<()> {
        let table = self.table_ref()?;
        if table.has_column(field) || self.annotations.iter().any(|a| a.label == field) {
            return Ok(());
        }
        // Dotted fields refer to joined columns.
        if let Some((path, column)) = field.rsplit_once('.') {
            if let Some(join) = self.joins.iter().find(|j| j.path == path) {
                let target = self.schema.table(&join.table)?;
                if target.has_column(column) {
                    return Ok(());
                }
            }
        }
        Err(OrmError::UnresolvedColumn {
            table: self.table.clone(),
            column: field.to_string(),
        })
    }

    // ==================== builders ====================

    /// Narrow the result set.
    pub fn filter(mut self, filter: Filter) -> OrmResult<Self> {
        self.ensure_building()?;
        let labels = self.annotation_labels();
        let node = filter.into_condition(self.table_ref()?, &labels)?;
        self.conditions.push(node);
        Ok(self)
    }

    /// Narrow the result set to rows NOT matching the filter.
    pub fn exclude(mut self, filter: Filter) -> OrmResult<Self> {
        self.ensure_building()?;
        let labels = self.annotation_labels();
        let node = filter.into_condition(self.table_ref()?, &labels)?.negated();
        self.conditions.push(node);
        Ok(self)
    }

    pub fn order_by(mut self, field: impl Into<String>, desc: bool, nulls_last: bool) -> OrmResult<Self> {
        self.ensure_building()?;
        let field = field.into();
        self.check_field(&field)?;
        self.order.push(OrderBy {
            field,
            desc,
            nulls_last,
        });
        Ok(self)
    }

    pub fn limit(mut self, n: u64) -> OrmResult<Self> {
        self.ensure_building()?;
        self.limit = Some(n);
        Ok(self)
    }

    /// Lock matched rows with `FOR NO KEY UPDATE`.
    pub fn for_update(mut self) -> OrmResult<Self> {
        self.ensure_building()?;
        self.for_update = true;
        Ok(self)
    }

    pub(crate) fn single(mut self) -> Self {
        self.single = true;
        self
    }

    /// Project an explicit column list and switch to raw-row output.
    /// Duplicates collapse; relation fetching no longer applies.
    pub fn values_list<I, S>(mut self, fields: I) -> OrmResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ensure_building()?;
        if !self.joins.is_empty() || !self.prefetches.is_empty() {
            return Err(OrmError::InvalidQueryComposition(
                "raw projection cannot be combined with relation fetching".to_string(),
            ));
        }
        if self.raw_shape {
            return Err(OrmError::InvalidQueryComposition(
                "result shape is already fixed".to_string(),
            ));
        }
        let mut columns: Vec<String> = Vec::new();
        for field in fields {
            let field = field.into();
            self.check_field(&field)?;
            if !columns.contains(&field) {
                columns.push(field);
            }
        }
        if columns.is_empty() {
            return Err(OrmError::InvalidQueryComposition(
                "values_list requires at least one field".to_string(),
            ));
        }
        self.projection = Projection::Columns(columns);
        self.raw_shape = true;
        Ok(self)
    }

    /// Add labeled aggregate columns next to the regular projection.
    pub fn annotate(mut self, aggregations: impl IntoIterator<Item = Aggregation>) -> OrmResult<Self> {
        self.ensure_building()?;
        if self.raw_shape {
            return Err(OrmError::InvalidQueryComposition(
                "result shape is already fixed".to_string(),
            ));
        }
        for agg in aggregations {
            if let Some(col) = &agg.column {
                if !col.contains('.') {
                    self.table_ref()?.resolve_column(col)?;
                }
            }
            self.annotations.push(agg);
        }
        Ok(self)
    }

    /// Switch to a grouped aggregate query: `group_by` columns are projected
    /// alongside the aggregate selections, optionally filtered by `having`.
    pub fn aggregate(
        mut self,
        group_by: Vec<String>,
        select: Vec<Aggregation>,
        having: Option<Filter>,
    ) -> OrmResult<Self> {
        self.ensure_building()?;
        if self.raw_shape {
            return Err(OrmError::InvalidQueryComposition(
                "result shape is already fixed".to_string(),
            ));
        }
        for col in &group_by {
            self.check_field(col)?;
        }
        self.annotations = select;
        let labels = self.annotation_labels();
        if let Some(having) = having {
            self.having = Some(having.into_condition(self.table_ref()?, &labels)?);
        }
        self.projection = Projection::Columns(group_by.clone());
        self.group_by = group_by;
        self.raw_shape = true;
        Ok(self)
    }

    /// Join a dot-separated relation path into the root query.
    ///
    /// Every hop becomes a `LEFT JOIN` whose columns come back aliased
    /// `"path.column"`. Requesting the same path twice is a no-op; joining a
    /// to-many relation is refused (prefetch it instead).
    pub fn select_related(mut self, path: &str) -> OrmResult<Self> {
        self.ensure_building()?;
        if self.raw_shape {
            return Err(OrmError::InvalidQueryComposition(
                "raw projection cannot be combined with relation fetching".to_string(),
            ));
        }
        let head = path.split('.').next().unwrap_or(path);
        if self
            .prefetches
            .iter()
            .any(|p| p.path.split('.').next() == Some(head))
        {
            return Err(OrmError::InvalidQueryComposition(format!(
                "relation '{head}' is already prefetched; join and prefetch are exclusive"
            )));
        }

        let mut table_name = self.table.clone();
        let mut parent_path: Option<String> = None;
        for seg in path.split('.') {
            Ident::parse(seg)?;
            let table = self.schema.table(&table_name)?;
            let relation = table.resolve_relation(seg)?.clone();
            // Joining a to-many relation would multiply root rows; those go
            // through prefetch_related instead.
            if !relation.kind.is_to_one() {
                return Err(OrmError::InvalidQueryComposition(format!(
                    "to-many relation '{seg}' cannot be joined; use prefetch_related"
                )));
            }
            let ResolvedJoin::Direct {
                target_column,
                local_column,
            } = relation.join.clone()
            else {
                unreachable!("direct relations resolve to direct joins");
            };

            let acc = match &parent_path {
                None => seg.to_string(),
                Some(parent) => format!("{parent}.{seg}"),
            };
            if !self.joins.iter().any(|j| j.path == acc) {
                self.joins.push(Join {
                    path: acc.clone(),
                    table: relation.target.clone(),
                    parent_path: parent_path.clone(),
                    target_column,
                    local_column,
                });
            }
            parent_path = Some(acc.clone());
            table_name = relation.target.clone();
        }
        Ok(self)
    }

    /// Record a relation (dot paths allowed) to populate via a separate
    /// batched query, optionally restricted to a column subset.
    pub fn prefetch_related(mut self, path: &str, columns: Option<Vec<String>>) -> OrmResult<Self> {
        self.ensure_building()?;
        if self.raw_shape {
            return Err(OrmError::InvalidQueryComposition(
                "raw projection cannot be combined with relation fetching".to_string(),
            ));
        }
        let head = path.split('.').next().unwrap_or(path);
        if self
            .joins
            .iter()
            .any(|j| j.path.split('.').next() == Some(head))
        {
            return Err(OrmError::InvalidQueryComposition(format!(
                "relation '{head}' is already joined; join and prefetch are exclusive"
            )));
        }
        // The head must at least exist on this table; deeper validation
        // happens when the prefetch plan is built.
        self.table_ref()?.resolve_relation(head)?;
        self.prefetches.push(PrefetchSpec {
            path: path.to_string(),
            columns,
        });
        Ok(self)
    }

    // ==================== compilation ====================

    /// Render the SELECT statement. Flattens all predicate trees into a
    /// single conjunction; the set refuses builder calls afterwards.
    fn compile(&mut self, scalar: Option<&'static str>) -> OrmResult<Sql> {
        self.ensure_building()?;
        self.compiled = true;

        let qualify = !self.joins.is_empty();
        let prefix = if qualify { Some(self.table.as_str()) } else { None };

        let mut q = sql("SELECT ");
        match scalar {
            Some(expr) => {
                q.push(expr);
            }
            None => {
                match &self.projection {
                    Projection::All => {
                        if qualify {
                            q.push_ident(self.table.as_str())?;
                            q.push(".*");
                        } else {
                            q.push("*");
                        }
                    }
                    Projection::Columns(columns) => {
                        for (i, col) in columns.iter().enumerate() {
                            if i > 0 {
                                q.push(", ");
                            }
                            push_qualified(&mut q, prefix, col)?;
                        }
                    }
                }
                for join in &self.joins {
                    let target = self.schema.table(&join.table)?;
                    for col in target.columns() {
                        q.push(&format!(
                            ", \"{}\".{} AS \"{}.{}\"",
                            join.path, col.name, join.path, col.name
                        ));
                    }
                }
                for agg in &self.annotations {
                    q.push(", ");
                    agg.render(&mut q, prefix)?;
                }
            }
        }

        q.push(" FROM ");
        q.push_ident(self.table.as_str())?;

        for join in &self.joins {
            q.push(" LEFT JOIN ");
            q.push_ident(join.table.as_str())?;
            q.push(&format!(" AS \"{}\" ON \"{}\".", join.path, join.path));
            q.push_ident(join.target_column.as_str())?;
            q.push(" = ");
            match &join.parent_path {
                None => {
                    q.push_ident(format!("{}.{}", self.table, join.local_column))?;
                }
                Some(parent) => {
                    q.push(&format!("\"{parent}\".{}", join.local_column));
                }
            }
        }

        let where_node = ConditionNode::And(std::mem::take(&mut self.conditions));
        if !where_node.is_empty() {
            q.push(" WHERE ");
            where_node.append_to_sql(&mut q, prefix)?;
        }

        if !self.group_by.is_empty() && scalar.is_none() {
            q.push(" GROUP BY ");
            for (i, col) in self.group_by.iter().enumerate() {
                if i > 0 {
                    q.push(", ");
                }
                push_qualified(&mut q, prefix, col)?;
            }
            if let Some(having) = &self.having {
                q.push(" HAVING ");
                having.append_to_sql(&mut q, prefix)?;
            }
        }

        if scalar.is_none() {
            for (i, order) in self.order.iter().enumerate() {
                q.push(if i == 0 { " ORDER BY " } else { ", " });
                if self.annotations.iter().any(|a| a.label == order.field) {
                    q.push_ident(order.field.as_str())?;
                } else {
                    push_qualified(&mut q, prefix, &order.field)?;
                }
                if order.desc {
                    q.push(" DESC");
                }
                if order.nulls_last {
                    q.push(" NULLS LAST");
                }
            }
        }

        let limit = match (scalar, self.limit, self.single) {
            (Some("TRUE"), _, _) => Some(1),
            (Some(_), _, _) => None,
            (None, Some(n), _) => Some(n),
            (None, None, true) => Some(1),
            (None, None, false) => None,
        };
        if let Some(n) = limit {
            q.push(" LIMIT ");
            q.push_bind(n as i64);
        }

        if self.for_update && scalar.is_none() {
            q.push(" FOR NO KEY UPDATE");
        }

        Ok(q)
    }

    /// Compile into a single-column subquery usable as a membership value
    /// (`field__in`). The projection must already be exactly one column.
    pub fn into_subquery(mut self) -> OrmResult<Sql> {
        match &self.projection {
            Projection::Columns(cols) if cols.len() == 1 && self.annotations.is_empty() => {}
            _ => {
                return Err(OrmError::InvalidQueryComposition(
                    "a subquery must project exactly one column".to_string(),
                ));
            }
        }
        if !self.prefetches.is_empty() {
            return Err(OrmError::InvalidQueryComposition(
                "a subquery cannot prefetch relations".to_string(),
            ));
        }
        self.compile(None)
    }

    // ==================== terminal executors ====================

    /// Fetch all rows as entity graphs (joins split out, prefetches run).
    pub async fn all(mut self, backend: &impl Backend) -> OrmResult<Vec<QueryRow>> {
        if self.raw_shape {
            return Err(OrmError::InvalidQueryComposition(
                "raw-shaped query sets execute via values/values_flat/values_keyed".to_string(),
            ));
        }
        let join_paths: Vec<String> = self.joins.iter().map(|j| j.path.clone()).collect();
        let prefetches = std::mem::take(&mut self.prefetches);
        let schema = Arc::clone(&self.schema);
        let table_name = self.table.clone();
        let q = self.compile(None)?;

        let records = q.fetch_all(backend).await?;
        let table = schema.table(&table_name)?;
        let mut rows = records
            .into_iter()
            .map(|r| assemble_joined(&schema, table, r, &join_paths))
            .collect::<OrmResult<Vec<_>>>()?;

        run_prefetches(backend, &schema, table, &mut rows, prefetches).await?;
        Ok(rows)
    }

    /// Fetch at most one row.
    pub async fn one_opt(self, backend: &impl Backend) -> OrmResult<Option<QueryRow>> {
        let rows = self.single().all(backend).await?;
        Ok(rows.into_iter().next())
    }

    /// Fetch exactly one row, or `NotFound`.
    pub async fn one(self, backend: &impl Backend) -> OrmResult<QueryRow> {
        let table = self.table.clone();
        self.one_opt(backend)
            .await?
            .ok_or_else(|| OrmError::not_found(format!("no row matched in '{table}'")))
    }

    /// Fetch raw rows, bypassing relation assembly.
    pub async fn values(mut self, backend: &impl Backend) -> OrmResult<Vec<Record>> {
        if !self.prefetches.is_empty() {
            return Err(OrmError::InvalidQueryComposition(
                "raw output cannot be combined with prefetching".to_string(),
            ));
        }
        self.compile(None)?.fetch_all(backend).await
    }

    /// Fetch the first projected column of every row.
    pub async fn values_flat(self, backend: &impl Backend) -> OrmResult<Vec<SqlValue>> {
        let records = self.values(backend).await?;
        Ok(records
            .into_iter()
            .filter_map(|r| r.into_iter().next().map(|(_, v)| v))
            .collect())
    }

    /// Fetch rows keyed by `key_fields` (joined into a composite key when
    /// several are given). On key collision the later row wins; this is the
    /// defined behavior, not an accident, so order results deliberately when
    /// it matters.
    pub async fn values_keyed(
        self,
        backend: &impl Backend,
        key_fields: &[&str],
    ) -> OrmResult<HashMap<SqlValue, Record>> {
        if key_fields.is_empty() {
            return Err(OrmError::InvalidQueryComposition(
                "values_keyed requires at least one key field".to_string(),
            ));
        }
        let records = self.values(backend).await?;
        let mut out = HashMap::with_capacity(records.len());
        for record in records {
            let mut parts = Vec::with_capacity(key_fields.len());
            for field in key_fields {
                let value = record.get(field).ok_or_else(|| {
                    OrmError::decode(*field, "key field missing from result row")
                })?;
                parts.push(value.clone());
            }
            let key = if parts.len() == 1 {
                parts.remove(0)
            } else {
                SqlValue::Array(parts)
            };
            out.insert(key, record);
        }
        Ok(out)
    }

    /// `SELECT COUNT(*)` over the current predicate.
    pub async fn count(mut self, backend: &impl Backend) -> OrmResult<u64> {
        if self.raw_shape {
            return Err(OrmError::InvalidQueryComposition(
                "count would discard the fixed raw projection".to_string(),
            ));
        }
        let record = self.compile(Some("COUNT(*)"))?.fetch_one(backend).await?;
        match record.values().next() {
            Some(SqlValue::BigInt(n)) => Ok(*n as u64),
            Some(SqlValue::Int(n)) => Ok(*n as u64),
            other => Err(OrmError::decode(
                "count",
                format!("expected integer count, got {other:?}"),
            )),
        }
    }

    /// Whether any row matches the current predicate.
    pub async fn exists(mut self, backend: &impl Backend) -> OrmResult<bool> {
        if self.raw_shape {
            return Err(OrmError::InvalidQueryComposition(
                "exists would discard the fixed raw projection".to_string(),
            ));
        }
        let record = self.compile(Some("TRUE"))?.fetch_opt(backend).await?;
        Ok(record.is_some())
    }

    fn compile_update(&mut self, values: Vec<(String, FilterValue)>, returning: bool) -> OrmResult<Sql> {
        self.ensure_building()?;
        if !self.joins.is_empty() || !self.prefetches.is_empty() {
            return Err(OrmError::InvalidQueryComposition(
                "update/delete cannot fetch relations".to_string(),
            ));
        }
        if values.is_empty() {
            return Err(OrmError::Validation("update requires at least one value".to_string()));
        }
        self.compiled = true;

        let table = self.schema.table(&self.table)?;
        let mut q = sql("UPDATE ");
        q.push_ident(self.table.as_str())?;
        q.push(" SET ");

        for (i, (name, value)) in values.into_iter().enumerate() {
            if i > 0 {
                q.push(", ");
            }
            let (column, op) = parse_field(&name)?;
            table.resolve_column(column)?;
            q.push_ident(column)?;
            q.push(" = ");
            match (op, value) {
                (Operator::Eq, FilterValue::Value(v)) => {
                    q.push_bind(v);
                }
                (Operator::Eq, FilterValue::Field(f)) => {
                    table.resolve_column(f.column())?;
                    f.append_expr(&mut q, None)?;
                }
                (Operator::Concat, FilterValue::Value(v)) => {
                    q.push_ident(column)?;
                    q.push(" || ");
                    q.push_bind(v);
                }
                _ => {
                    return Err(OrmError::InvalidQueryComposition(format!(
                        "operator not usable in update of '{column}'"
                    )));
                }
            }
        }

        let where_node = ConditionNode::And(std::mem::take(&mut self.conditions));
        if !where_node.is_empty() {
            q.push(" WHERE ");
            where_node.append_to_sql(&mut q, None)?;
        }
        if returning {
            q.push(" RETURNING *");
        }
        Ok(q)
    }

    /// `UPDATE ... SET` over the current predicate; returns the affected row
    /// count. Value names accept the `__concat` suffix and `F` expressions.
    pub async fn update(
        mut self,
        backend: &impl Backend,
        values: Vec<(String, FilterValue)>,
    ) -> OrmResult<u64> {
        let q = self.compile_update(values, false)?;
        q.execute(backend).await
    }

    /// `UPDATE ... RETURNING *`.
    pub async fn update_returning(
        mut self,
        backend: &impl Backend,
        values: Vec<(String, FilterValue)>,
    ) -> OrmResult<Vec<Record>> {
        let q = self.compile_update(values, true)?;
        q.fetch_all(backend).await
    }

    fn compile_delete(&mut self, returning: bool) -> OrmResult<Sql> {
        self.ensure_building()?;
        if !self.joins.is_empty() || !self.prefetches.is_empty() {
            return Err(OrmError::InvalidQueryComposition(
                "update/delete cannot fetch relations".to_string(),
            ));
        }
        self.compiled = true;

        let mut q = sql("DELETE FROM ");
        q.push_ident(self.table.as_str())?;
        let where_node = ConditionNode::And(std::mem::take(&mut self.conditions));
        if !where_node.is_empty() {
            q.push(" WHERE ");
            where_node.append_to_sql(&mut q, None)?;
        }
        if returning {
            q.push(" RETURNING *");
        }
        Ok(q)
    }

    /// `DELETE` over the current predicate; returns the affected row count.
    pub async fn delete(mut self, backend: &impl Backend) -> OrmResult<u64> {
        let q = self.compile_delete(false)?;
        q.execute(backend).await
    }

    /// `DELETE ... RETURNING *`.
    pub async fn delete_returning(mut self, backend: &impl Backend) -> OrmResult<Vec<Record>> {
        let q = self.compile_delete(true)?;
        q.fetch_all(backend).await
    }

    #[cfg(test)]
    pub(crate) fn compile_for_test(mut self) -> OrmResult<Sql> {
        self.compile(None)
    }

    #[cfg(test)]
    pub(crate) fn compile_scalar_for_test(mut self, scalar: &'static str) -> OrmResult<Sql> {
        self.compile(Some(scalar))
    }

    #[cfg(test)]
    pub(crate) fn compile_update_for_test(
        mut self,
        values: Vec<(String, FilterValue)>,
        returning: bool,
    ) -> OrmResult<Sql> {
        self.compile_update(values, returning)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Column, ColumnType, SchemaRegistry, Table};

    fn schema() -> Arc<Schema> {
        let users = Table::new("users")
            .column(Column::new("id", ColumnType::BigInt).primary_key())
            .column(Column::new("name", ColumnType::Text))
            .column(Column::new("qty", ColumnType::Int))
            .relation("posts", RelationKind::OneToMany, "posts")
            .relation(
                "groups",
                RelationKind::ManyToMany {
                    through: "memberships".to_string(),
                },
                "groups",
            );
        let posts = Table::new("posts")
            .column(Column::new("id", ColumnType::BigInt).primary_key())
            .column(Column::new("author_id", ColumnType::BigInt))
            .column(Column::new("title", ColumnType::Text))
            .foreign_key("author_id", "users", "id")
            .relation("author", RelationKind::OneToOne, "users");
        let groups = Table::new("groups")
            .column(Column::new("id", ColumnType::BigInt).primary_key());
        let memberships = Table::new("memberships")
            .column(Column::new("user_id", ColumnType::BigInt))
            .column(Column::new("group_id", ColumnType::BigInt))
            .foreign_key("user_id", "users", "id")
            .foreign_key("group_id", "groups", "id");

        let mut reg = SchemaRegistry::new();
        for t in [users, posts, groups, memberships] {
            reg.declare(t).unwrap();
        }
        reg.finalize().unwrap()
    }

    fn qs(table: &str) -> QuerySet {
        QuerySet::new(schema(), table).unwrap()
    }

    #[test]
    fn plain_select_all() {
        let q = qs("users").compile_for_test().unwrap();
        assert_eq!(q.to_sql(), "SELECT * FROM users");
    }

    #[test]
    fn filter_and_order_and_limit() {
        let q = qs("users")
            .filter(Filter::pairs([("qty__gt", 5_i64)]))
            .unwrap()
            .order_by("name", true, true)
            .unwrap()
            .limit(10)
            .unwrap()
            .compile_for_test()
            .unwrap();
        assert_eq!(
            q.to_sql(),
            "SELECT * FROM users WHERE qty > $1 ORDER BY name DESC NULLS LAST LIMIT $2"
        );
        assert_eq!(q.params().len(), 2);
    }

    #[test]
    fn exclude_negates_filter() {
        let filtered = qs("users")
            .filter(Filter::pairs([("qty", 5_i64)]))
            .unwrap()
            .compile_for_test()
            .unwrap();
        let excluded = qs("users")
            .exclude(Filter::pairs([("qty", 5_i64)]))
            .unwrap()
            .compile_for_test()
            .unwrap();
        assert_eq!(filtered.to_sql(), "SELECT * FROM users WHERE qty = $1");
        assert_eq!(excluded.to_sql(), "SELECT * FROM users WHERE NOT (qty = $1)");
    }

    #[test]
    fn multiple_filters_flatten_into_one_conjunction() {
        let q = qs("users")
            .filter(Filter::pairs([("qty__ge", 1_i64)]))
            .unwrap()
            .filter(Filter::pairs([("qty__le", 9_i64)]))
            .unwrap()
            .compile_for_test()
            .unwrap();
        assert_eq!(
            q.to_sql(),
            "SELECT * FROM users WHERE (qty >= $1 AND qty <= $2)"
        );
    }

    #[test]
    fn select_related_joins_and_aliases() {
        let q = qs("posts")
            .select_related("author")
            .unwrap()
            .compile_for_test()
            .unwrap();
        assert_eq!(
            q.to_sql(),
            "SELECT posts.*, \"author\".id AS \"author.id\", \"author\".name AS \"author.name\", \
             \"author\".qty AS \"author.qty\" FROM posts \
             LEFT JOIN users AS \"author\" ON \"author\".id = posts.author_id"
        );
    }

    #[test]
    fn select_related_duplicate_path_is_noop() {
        let a = qs("posts")
            .select_related("author")
            .unwrap()
            .select_related("author")
            .unwrap()
            .compile_for_test()
            .unwrap();
        let b = qs("posts").select_related("author").unwrap().compile_for_test().unwrap();
        assert_eq!(a.to_sql(), b.to_sql());
    }

    #[test]
    fn select_related_rejects_many_to_many() {
        let err = qs("users").select_related("groups").unwrap_err();
        assert!(matches!(err, OrmError::InvalidQueryComposition(_)));
    }

    #[test]
    fn join_and_prefetch_on_same_relation_conflict() {
        let err = qs("posts")
            .select_related("author")
            .unwrap()
            .prefetch_related("author", None)
            .unwrap_err();
        assert!(matches!(err, OrmError::InvalidQueryComposition(_)));

        let err = qs("posts")
            .prefetch_related("author", None)
            .unwrap()
            .select_related("author")
            .unwrap_err();
        assert!(matches!(err, OrmError::InvalidQueryComposition(_)));
    }

    #[test]
    fn filters_qualify_when_joined() {
        let q = qs("posts")
            .select_related("author")
            .unwrap()
            .filter(Filter::pairs([("title", "x")]))
            .unwrap()
            .compile_for_test()
            .unwrap();
        assert!(q.to_sql().contains("WHERE posts.title = $1"));
    }

    #[test]
    fn values_list_projects_and_dedupes() {
        let q = qs("users")
            .values_list(["name", "qty", "name"])
            .unwrap()
            .compile_for_test()
            .unwrap();
        assert_eq!(q.to_sql(), "SELECT name, qty FROM users");
    }

    #[test]
    fn values_list_conflicts_with_relations() {
        let err = qs("posts")
            .select_related("author")
            .unwrap()
            .values_list(["title"])
            .unwrap_err();
        assert!(matches!(err, OrmError::InvalidQueryComposition(_)));

        let err = qs("users")
            .values_list(["name"])
            .unwrap()
            .prefetch_related("posts", None)
            .unwrap_err();
        assert!(matches!(err, OrmError::InvalidQueryComposition(_)));
    }

    #[test]
    fn shape_cannot_be_fixed_twice() {
        let err = qs("users")
            .values_list(["name"])
            .unwrap()
            .values_list(["qty"])
            .unwrap_err();
        assert!(matches!(err, OrmError::InvalidQueryComposition(_)));
    }

    #[test]
    fn annotate_appends_labeled_aggregates() {
        let q = qs("users")
            .annotate([Aggregation::count("total")])
            .unwrap()
            .compile_for_test()
            .unwrap();
        assert_eq!(q.to_sql(), "SELECT *, count(*) AS total FROM users");
    }

    #[test]
    fn aggregate_groups_and_filters_on_labels() {
        let q = qs("users")
            .aggregate(
                vec!["name".to_string()],
                vec![Aggregation::sum("qty", "total_qty")],
                Some(Filter::pairs([("total_qty__gt", 10_i64)])),
            )
            .unwrap()
            .compile_for_test()
            .unwrap();
        assert_eq!(
            q.to_sql(),
            "SELECT name, sum(qty) AS total_qty FROM users GROUP BY name HAVING total_qty > $1"
        );
    }

    #[test]
    fn count_replaces_projection() {
        let q = qs("users")
            .filter(Filter::pairs([("qty__gt", 5_i64)]))
            .unwrap()
            .compile_scalar_for_test("COUNT(*)")
            .unwrap();
        assert_eq!(q.to_sql(), "SELECT COUNT(*) FROM users WHERE qty > $1");
    }

    #[test]
    fn exists_limits_to_one_row() {
        let q = qs("users").compile_scalar_for_test("TRUE").unwrap();
        assert_eq!(q.to_sql(), "SELECT TRUE FROM users LIMIT $1");
    }

    #[test]
    fn for_update_appends_lock_clause() {
        let q = qs("users").for_update().unwrap().compile_for_test().unwrap();
        assert_eq!(q.to_sql(), "SELECT * FROM users FOR NO KEY UPDATE");
    }

    #[test]
    fn builder_after_compile_fails() {
        let mut q = qs("users");
        q.compile(None).unwrap();
        let err = q.filter(Filter::pairs([("qty", 1_i64)])).unwrap_err();
        assert!(matches!(err, OrmError::QuerySetAlreadyCompiled));
    }

    #[test]
    fn subquery_requires_single_column() {
        let err = qs("users").into_subquery().unwrap_err();
        assert!(matches!(err, OrmError::InvalidQueryComposition(_)));

        let sub = qs("posts")
            .values_list(["author_id"])
            .unwrap()
            .into_subquery()
            .unwrap();
        assert_eq!(sub.to_sql(), "SELECT author_id FROM posts");
    }

    #[test]
    fn subquery_composes_into_membership_filter() {
        let sub = qs("posts")
            .values_list(["author_id"])
            .unwrap()
            .into_subquery()
            .unwrap();
        let q = qs("users")
            .filter(Filter::pairs([("id__in", FilterValue::Subquery(sub))]))
            .unwrap()
            .compile_for_test()
            .unwrap();
        assert_eq!(
            q.to_sql(),
            "SELECT * FROM users WHERE id IN (SELECT author_id FROM posts)"
        );
    }

    #[test]
    fn update_renders_set_and_where() {
        let q = qs("users")
            .filter(Filter::pairs([("id", 1_i64)]))
            .unwrap()
            .compile_update_for_test(
                vec![("qty".to_string(), FilterValue::value(5_i64))],
                false,
            )
            .unwrap();
        assert_eq!(q.to_sql(), "UPDATE users SET qty = $1 WHERE id = $2");
    }

    #[test]
    fn update_supports_field_expressions_and_concat() {
        let q = qs("users")
            .compile_update_for_test(
                vec![
                    (
                        "qty".to_string(),
                        FilterValue::from(crate::condition::F::col("qty").add(1_i64)),
                    ),
                    ("name__concat".to_string(), FilterValue::value("!")),
                ],
                true,
            )
            .unwrap();
        assert_eq!(
            q.to_sql(),
            "UPDATE users SET qty = qty + $1, name = name || $2 RETURNING *"
        );
    }

    #[test]
    fn update_rejects_comparison_operators() {
        let err = qs("users")
            .compile_update_for_test(
                vec![("qty__gt".to_string(), FilterValue::value(1_i64))],
                false,
            )
            .unwrap_err();
        assert!(matches!(err, OrmError::InvalidQueryComposition(_)));
    }

    #[test]
    fn order_by_unknown_field_fails() {
        let err = qs("users").order_by("missing", false, false).unwrap_err();
        assert!(matches!(err, OrmError::UnresolvedColumn { .. }));
    }

    #[test]
    fn order_by_joined_column_uses_quoted_alias() {
        let q = qs("posts")
            .select_related("author")
            .unwrap()
            .order_by("author.name", false, false)
            .unwrap()
            .compile_for_test()
            .unwrap();
        assert!(q.to_sql().ends_with("ORDER BY \"author\".name"));
    }

    #[test]
    fn annotate_after_aggregate_fails() {
        let err = qs("users")
            .aggregate(
                vec!["name".to_string()],
                vec![Aggregation::sum("qty", "total_qty")],
                None,
            )
            .unwrap()
            .annotate([Aggregation::count("total")])
            .unwrap_err();
        assert!(matches!(err, OrmError::InvalidQueryComposition(_)));
    }
}
