//! Relation prefetching and result assembly.
//!
//! The engine takes a root result set plus the declared prefetch specs and
//! populates each relation with one batched secondary query — filtered to
//! `key = ANY($1)` over the distinct foreign-key values of the roots — never
//! one query per root row. Many-to-many relations aggregate the through
//! table's current-side keys into the same query so a single round trip
//! serves every root at once.
//!
//! Sibling relations fetch concurrently when the backend is outside a
//! transaction; inside one they run strictly sequentially, because concurrent
//! statements multiplexed onto a transactional connection corrupt its state.
//! The flag is queried per call, never cached.

use crate::backend::Backend;
use crate::error::{OrmError, OrmResult};
use crate::schema::{Relation, RelationKind, ResolvedJoin, Schema, Table};
use crate::sql::{Sql, sql};
use crate::value::{Record, SqlValue};
use futures_util::future::{BoxFuture, try_join_all};
use std::collections::{BTreeMap, HashMap};

/// Aggregated-keys alias used by many-to-many secondary queries.
const PARENT_KEYS_ALIAS: &str = "__manor_parent_keys";

/// A relation slot on a fetched row.
///
/// `NotFetched` is distinct from "fetched and empty" so callers can tell
/// "forgot to prefetch" from "no related rows".
#[derive(Debug, Clone, PartialEq)]
pub enum Related {
    NotFetched,
    One(Option<Box<QueryRow>>),
    Many(Vec<QueryRow>),
}

impl Related {
    /// The related row of a to-one relation.
    pub fn as_one(&self) -> OrmResult<Option<&QueryRow>> {
        match self {
            Related::One(row) => Ok(row.as_deref()),
            Related::Many(_) => Err(OrmError::Validation(
                "relation is to-many; use as_many".to_string(),
            )),
            Related::NotFetched => Err(OrmError::RelationNotFetched(String::new())),
        }
    }

    /// The related rows of a to-many relation.
    pub fn as_many(&self) -> OrmResult<&[QueryRow]> {
        match self {
            Related::Many(rows) => Ok(rows),
            Related::One(_) => Err(OrmError::Validation(
                "relation is to-one; use as_one".to_string(),
            )),
            Related::NotFetched => Err(OrmError::RelationNotFetched(String::new())),
        }
    }
}

/// A fetched row together with its relation slots.
///
/// Every relation declared on the row's table gets a slot; slots start as
/// [`Related::NotFetched`] and are filled by joins or prefetches.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryRow {
    record: Record,
    relations: BTreeMap<String, Related>,
}

impl QueryRow {
    pub(crate) fn new(record: Record, table: &Table) -> Self {
        let relations = table
            .relations()
            .map(|r| (r.name.clone(), Related::NotFetched))
            .collect();
        Self { record, relations }
    }

    /// A row with no relation slots (raw output shapes).
    pub(crate) fn bare(record: Record) -> Self {
        Self {
            record,
            relations: BTreeMap::new(),
        }
    }

    pub fn record(&self) -> &Record {
        &self.record
    }

    pub fn into_record(self) -> Record {
        self.record
    }

    /// A plain column value.
    pub fn get(&self, column: &str) -> Option<&SqlValue> {
        self.record.get(column)
    }

    /// Access a relation slot.
    ///
    /// An undeclared name is [`OrmError::UnknownRelationField`]; a declared
    /// but never joined/prefetched one is [`OrmError::RelationNotFetched`].
    pub fn related(&self, name: &str) -> OrmResult<&Related> {
        match self.relations.get(name) {
            None => Err(OrmError::UnknownRelationField(name.to_string())),
            Some(Related::NotFetched) => Err(OrmError::RelationNotFetched(name.to_string())),
            Some(related) => Ok(related),
        }
    }

    pub(crate) fn set_related(&mut self, name: &str, related: Related) {
        self.relations.insert(name.to_string(), related);
    }

    fn related_mut(&mut self, name: &str) -> Option<&mut Related> {
        self.relations.get_mut(name)
    }
}

/// A recorded prefetch request: dot-separated relation path plus an optional
/// column subset applied to the head relation's table.
#[derive(Debug, Clone)]
pub(crate) struct PrefetchSpec {
    pub path: String,
    pub columns: Option<Vec<String>>,
}

/// Validate a prefetch column subset against the relation's target table.
fn validate_columns(
    relation: &Relation,
    target: &Table,
    columns: &Option<Vec<String>>,
) -> OrmResult<()> {
    if let Some(columns) = columns {
        for col in columns {
            if !target.has_column(col) {
                return Err(OrmError::InvalidColumnSelection {
                    relation: relation.name.clone(),
                    column: col.clone(),
                });
            }
        }
    }
    Ok(())
}

/// One relation's worth of prefetch work, planned before any I/O.
#[derive(Debug)]
struct PlannedPrefetch {
    relation: Relation,
    columns: Option<Vec<String>>,
    nested: Vec<PrefetchSpec>,
    /// Distinct root key values, in first-seen order.
    keys: Vec<SqlValue>,
    /// Root key value -> indices of root rows carrying it.
    key_roots: HashMap<SqlValue, Vec<usize>>,
}

fn plan_prefetches(
    schema: &Schema,
    table: &Table,
    rows: &[QueryRow],
    specs: Vec<PrefetchSpec>,
) -> OrmResult<Vec<PlannedPrefetch>> {
    // Group dot-paths by head relation; deeper segments recurse later.
    let mut heads: BTreeMap<String, (Option<Vec<String>>, Vec<PrefetchSpec>)> = BTreeMap::new();
    for spec in specs {
        match spec.path.split_once('.') {
            None => {
                let entry = heads.entry(spec.path.clone()).or_default();
                if spec.columns.is_some() {
                    entry.0 = spec.columns;
                }
            }
            Some((head, rest)) => {
                let entry = heads.entry(head.to_string()).or_default();
                entry.1.push(PrefetchSpec {
                    path: rest.to_string(),
                    columns: spec.columns,
                });
            }
        }
    }

    let mut planned = Vec::with_capacity(heads.len());
    for (name, (columns, nested)) in heads {
        let relation = table.resolve_relation(&name)?.clone();
        let target = schema.table(&relation.target)?;
        validate_columns(&relation, target, &columns)?;

        let root_key = match &relation.join {
            ResolvedJoin::Direct { local_column, .. } => local_column.clone(),
            ResolvedJoin::Through { current_key, .. } => current_key.clone(),
        };

        let mut keys = Vec::new();
        let mut key_roots: HashMap<SqlValue, Vec<usize>> = HashMap::new();
        for (idx, row) in rows.iter().enumerate() {
            let Some(key) = row.get(&root_key) else { continue };
            if key.is_null() {
                continue;
            }
            let roots = key_roots.entry(key.clone()).or_default();
            if roots.is_empty() {
                keys.push(key.clone());
            }
            roots.push(idx);
        }

        planned.push(PlannedPrefetch {
            relation,
            columns,
            nested,
            keys,
            key_roots,
        });
    }
    Ok(planned)
}

/// The batched secondary query for one relation.
fn secondary_query(plan: &PlannedPrefetch) -> OrmResult<Sql> {
    let relation = &plan.relation;
    let mut q = sql("SELECT ");

    match &relation.join {
        ResolvedJoin::Direct { target_column, .. } => {
            match &plan.columns {
                Some(columns) => {
                    // The join key is needed for stitching even when the
                    // caller didn't select it.
                    let mut cols: Vec<&String> = columns.iter().collect();
                    if !columns.contains(target_column) {
                        cols.push(target_column);
                    }
                    for (i, col) in cols.iter().enumerate() {
                        if i > 0 {
                            q.push(", ");
                        }
                        q.push_ident(col.as_str())?;
                    }
                }
                None => {
                    q.push("*");
                }
            }
            q.push(" FROM ");
            q.push_ident(relation.target.as_str())?;
            q.push(" WHERE ");
            q.push_ident(target_column.as_str())?;
            q.push(" = ANY(");
            q.push_bind(SqlValue::Array(plan.keys.clone()));
            q.push(")");
        }
        ResolvedJoin::Through {
            through,
            through_current,
            through_target,
            target_key,
            ..
        } => {
            match &plan.columns {
                Some(columns) => {
                    let mut cols: Vec<&String> = columns.iter().collect();
                    if !columns.contains(target_key) {
                        cols.push(target_key);
                    }
                    for (i, col) in cols.iter().enumerate() {
                        if i > 0 {
                            q.push(", ");
                        }
                        q.push_ident(format!("t.{col}"))?;
                    }
                }
                None => {
                    q.push("t.*");
                }
            }
            q.push(&format!(", ck.{PARENT_KEYS_ALIAS} FROM "));
            q.push_ident(relation.target.as_str())?;
            q.push(" AS t JOIN (SELECT ");
            q.push_ident(through_target.as_str())?;
            q.push(" AS k, array_agg(");
            q.push_ident(through_current.as_str())?;
            q.push(&format!(") AS {PARENT_KEYS_ALIAS} FROM "));
            q.push_ident(through.as_str())?;
            q.push(" WHERE ");
            q.push_ident(through_current.as_str())?;
            q.push(" = ANY(");
            q.push_bind(SqlValue::Array(plan.keys.clone()));
            q.push(") GROUP BY ");
            q.push_ident(through_target.as_str())?;
            q.push(") ck ON ck.k = ");
            q.push_ident(format!("t.{target_key}"))?;
        }
    }

    Ok(q)
}

/// Stitch one relation's secondary rows onto the roots.
fn stitch(
    plan: &PlannedPrefetch,
    roots: &mut [QueryRow],
    secondary: Vec<QueryRow>,
) -> OrmResult<()> {
    let relation = &plan.relation;
    let to_one = relation.kind.is_to_one();

    // Declared empty value first, so no root is ever left unset.
    for row in roots.iter_mut() {
        let default = if to_one {
            Related::One(None)
        } else {
            Related::Many(Vec::new())
        };
        row.set_related(&relation.name, default);
    }

    for mut sec in secondary {
        let parent_keys: Vec<SqlValue> = match &relation.join {
            ResolvedJoin::Direct { target_column, .. } => sec
                .get(target_column)
                .cloned()
                .into_iter()
                .collect(),
            ResolvedJoin::Through { .. } => {
                match sec.record.remove(PARENT_KEYS_ALIAS) {
                    Some(SqlValue::Array(keys)) => keys,
                    _ => {
                        return Err(OrmError::decode(
                            PARENT_KEYS_ALIAS,
                            "aggregated parent keys missing from secondary row",
                        ));
                    }
                }
            }
        };

        for parent_key in parent_keys {
            let Some(root_idxs) = plan.key_roots.get(&parent_key) else { continue };
            for &idx in root_idxs {
                match roots[idx].related_mut(&relation.name) {
                    Some(Related::One(slot)) => *slot = Some(Box::new(sec.clone())),
                    Some(Related::Many(list)) => list.push(sec.clone()),
                    _ => {}
                }
            }
        }
    }
    Ok(())
}

/// Run all prefetch specs against `rows`.
///
/// Boxed because nested dot-paths recurse on each relation's secondary set.
pub(crate) fn run_prefetches<'a, B: Backend>(
    backend: &'a B,
    schema: &'a Schema,
    table: &'a Table,
    rows: &'a mut Vec<QueryRow>,
    specs: Vec<PrefetchSpec>,
) -> BoxFuture<'a, OrmResult<()>> {
    Box::pin(async move {
        if specs.is_empty() {
            return Ok(());
        }
        let plans = plan_prefetches(schema, table, rows, specs)?;

        // Fetch every relation's secondary rows; any failure aborts the whole
        // prefetch before anything is stitched.
        let mut fetched: Vec<Vec<Record>> = Vec::with_capacity(plans.len());
        if backend.in_transaction() {
            for plan in &plans {
                fetched.push(fetch_secondary(backend, plan).await?);
            }
        } else {
            let futures = plans.iter().map(|plan| fetch_secondary(backend, plan));
            fetched = try_join_all(futures).await?;
        }

        for (plan, records) in plans.into_iter().zip(fetched) {
            let target = schema.table(&plan.relation.target)?;
            let mut secondary: Vec<QueryRow> = records
                .into_iter()
                .map(|r| QueryRow::new(r, target))
                .collect();
            if !plan.nested.is_empty() {
                run_prefetches(backend, schema, target, &mut secondary, plan.nested.clone())
                    .await?;
            }
            stitch(&plan, rows, secondary)?;
        }
        Ok(())
    })
}

async fn fetch_secondary(backend: &impl Backend, plan: &PlannedPrefetch) -> OrmResult<Vec<Record>> {
    if plan.keys.is_empty() {
        return Ok(Vec::new());
    }
    secondary_query(plan)?.fetch_all(backend).await
}

/// Rebuild a joined root record into a nested [`QueryRow`].
///
/// Joined columns come back aliased `"path.column"`; each join path becomes a
/// [`Related::One`] child (an all-NULL child means the LEFT JOIN found no
/// row). Deeper paths nest beneath their parent.
pub(crate) fn assemble_joined(
    schema: &Schema,
    table: &Table,
    record: Record,
    join_paths: &[String],
) -> OrmResult<QueryRow> {
    let mut base = Record::new();
    let mut by_path: BTreeMap<String, Record> = BTreeMap::new();

    for (name, value) in record.into_iter() {
        match name.rsplit_once('.') {
            Some((path, column)) if join_paths.iter().any(|p| p == path) => {
                by_path
                    .entry(path.to_string())
                    .or_default()
                    .push(column.to_string(), value);
            }
            _ => base.push(name, value),
        }
    }

    let mut root = QueryRow::new(base, table);

    // Shallow paths first, so parents exist before their children.
    let mut ordered: Vec<&String> = join_paths.iter().collect();
    ordered.sort_by_key(|p| p.matches('.').count());

    for path in ordered {
        let Some(child_record) = by_path.remove(path.as_str()) else { continue };
        attach_joined_child(schema, table, &mut root, path, child_record)?;
    }

    Ok(root)
}

/// Descend `path` and attach the joined child row at its leaf. A hop whose
/// own join found no row swallows the child (it is necessarily all-NULL).
fn attach_joined_child(
    schema: &Schema,
    table: &Table,
    row: &mut QueryRow,
    path: &str,
    child_record: Record,
) -> OrmResult<()> {
    match path.split_once('.') {
        Some((head, rest)) => {
            let relation = table.resolve_relation(head)?.clone();
            let child_table = schema.table(&relation.target)?;
            if let Some(Related::One(Some(child))) = row.related_mut(head) {
                attach_joined_child(schema, child_table, child, rest, child_record)?;
            }
            Ok(())
        }
        None => {
            let relation = table.resolve_relation(path)?.clone();
            let child_table = schema.table(&relation.target)?;
            let related = if child_record.values().all(SqlValue::is_null) {
                Related::One(None)
            } else {
                Related::One(Some(Box::new(QueryRow::new(child_record, child_table))))
            };
            row.set_related(path, related);
            Ok(())
        }
    }
}
