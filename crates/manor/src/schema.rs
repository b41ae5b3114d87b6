//! Schema declaration and the two-phase registry.
//!
//! Tables are declared as pure data on a [`SchemaRegistry`]; nothing is
//! resolved at that point, so declaration order does not matter and forward
//! references are fine. [`SchemaRegistry::finalize`] then resolves every
//! foreign key, relation descriptor, and derived lookup in one pass and fails
//! loudly on dangling references. The resulting [`Schema`] is read-only and
//! shared via `Arc` for the lifetime of the process.

use crate::error::{OrmError, OrmResult};
use crate::ident::Ident;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Logical column type, carrying its SQL cast name for VALUES-table casts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnType {
    Bool,
    SmallInt,
    Int,
    BigInt,
    Float,
    Double,
    Text,
    Bytes,
    Uuid,
    Timestamp,
    TimestampTz,
    Date,
    Json,
    Array(Box<ColumnType>),
}

impl ColumnType {
    /// The Postgres type name used in explicit `::type` casts.
    pub fn cast_name(&self) -> String {
        match self {
            ColumnType::Bool => "bool".to_string(),
            ColumnType::SmallInt => "int2".to_string(),
            ColumnType::Int => "int4".to_string(),
            ColumnType::BigInt => "int8".to_string(),
            ColumnType::Float => "float4".to_string(),
            ColumnType::Double => "float8".to_string(),
            ColumnType::Text => "text".to_string(),
            ColumnType::Bytes => "bytea".to_string(),
            ColumnType::Uuid => "uuid".to_string(),
            ColumnType::Timestamp => "timestamp".to_string(),
            ColumnType::TimestampTz => "timestamptz".to_string(),
            ColumnType::Date => "date".to_string(),
            ColumnType::Json => "jsonb".to_string(),
            ColumnType::Array(inner) => format!("{}[]", inner.cast_name()),
        }
    }
}

/// A declared column.
#[derive(Debug, Clone)]
pub struct Column {
    pub name: String,
    pub ty: ColumnType,
    pub nullable: bool,
    pub primary_key: bool,
    pub unique: bool,
    /// Raw SQL default applied by the database on insert.
    pub server_default: Option<String>,
    /// Raw SQL expression applied on conflict-update (e.g. `now()`).
    pub onupdate: Option<String>,
}

impl Column {
    pub fn new(name: impl Into<String>, ty: ColumnType) -> Self {
        Self {
            name: name.into(),
            ty,
            nullable: false,
            primary_key: false,
            unique: false,
            server_default: None,
            onupdate: None,
        }
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn server_default(mut self, expr: impl Into<String>) -> Self {
        self.server_default = Some(expr.into());
        self
    }

    pub fn onupdate(mut self, expr: impl Into<String>) -> Self {
        self.onupdate = Some(expr.into());
        self
    }

    /// Whether the database can produce this column's value itself.
    pub fn is_generated(&self) -> bool {
        self.primary_key || self.server_default.is_some() || self.onupdate.is_some()
    }
}

/// A declared foreign key: `column` references `target_table.target_column`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKey {
    pub column: String,
    pub target_table: String,
    pub target_column: String,
}

/// A declared unique constraint, with an optional partial-index predicate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniqueConstraint {
    pub columns: Vec<String>,
    pub predicate: Option<String>,
}

/// The shape of a declared relation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelationKind {
    OneToOne,
    OneToMany,
    ManyToMany { through: String },
}

impl RelationKind {
    /// Whether the relation resolves to at most one target row.
    pub fn is_to_one(&self) -> bool {
        matches!(self, RelationKind::OneToOne)
    }
}

/// A relation as declared, before any column resolution.
#[derive(Debug, Clone)]
struct RelationDecl {
    name: String,
    kind: RelationKind,
    target: String,
    /// Explicit `(target_column, local_column)` pair; required when more than
    /// one foreign key connects the two tables.
    columns: Option<(String, String)>,
}

/// The resolved join columns of a relation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedJoin {
    /// The target table carries a foreign key pointing back at this table:
    /// `target.target_column = current.local_column`.
    Direct {
        target_column: String,
        local_column: String,
    },
    /// A through table carries foreign keys to both sides.
    Through {
        through: String,
        /// `through.through_current = current.current_key`
        through_current: String,
        current_key: String,
        /// `through.through_target = target.target_key`
        through_target: String,
        target_key: String,
    },
}

/// A relation with its join columns resolved at finalize time.
#[derive(Debug, Clone)]
pub struct Relation {
    pub name: String,
    pub kind: RelationKind,
    pub target: String,
    pub join: ResolvedJoin,
}

/// A declared table. Build with the fluent methods, then hand it to
/// [`SchemaRegistry::declare`].
#[derive(Debug, Clone)]
pub struct Table {
    name: String,
    columns: Vec<Column>,
    foreign_keys: Vec<ForeignKey>,
    unique_constraints: Vec<UniqueConstraint>,
    relation_decls: Vec<RelationDecl>,

    // Derived at finalize().
    relations: BTreeMap<String, Relation>,
    conflict_candidates: Vec<UniqueConstraint>,
}

impl Table {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            foreign_keys: Vec::new(),
            unique_constraints: Vec::new(),
            relation_decls: Vec::new(),
            relations: BTreeMap::new(),
            conflict_candidates: Vec::new(),
        }
    }

    pub fn column(mut self, column: Column) -> Self {
        self.columns.push(column);
        self
    }

    /// Declare `column` as a foreign key referencing `target.target_column`.
    pub fn foreign_key(
        mut self,
        column: impl Into<String>,
        target: impl Into<String>,
        target_column: impl Into<String>,
    ) -> Self {
        self.foreign_keys.push(ForeignKey {
            column: column.into(),
            target_table: target.into(),
            target_column: target_column.into(),
        });
        self
    }

    /// Declare a multi-column unique constraint.
    pub fn unique_together<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.unique_constraints.push(UniqueConstraint {
            columns: columns.into_iter().map(Into::into).collect(),
            predicate: None,
        });
        self
    }

    /// Declare a partial unique constraint (unique index with a predicate).
    pub fn unique_where<I, S>(mut self, columns: I, predicate: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.unique_constraints.push(UniqueConstraint {
            columns: columns.into_iter().map(Into::into).collect(),
            predicate: Some(predicate.into()),
        });
        self
    }

    /// Declare a named relation to `target`. Join columns are resolved from
    /// the declared foreign keys at finalize time.
    pub fn relation(
        mut self,
        name: impl Into<String>,
        kind: RelationKind,
        target: impl Into<String>,
    ) -> Self {
        self.relation_decls.push(RelationDecl {
            name: name.into(),
            kind,
            target: target.into(),
            columns: None,
        });
        self
    }

    /// Declare a relation with an explicit `(target_column, local_column)`
    /// pair. Required when more than one foreign key connects the tables.
    pub fn relation_with_columns(
        mut self,
        name: impl Into<String>,
        kind: RelationKind,
        target: impl Into<String>,
        target_column: impl Into<String>,
        local_column: impl Into<String>,
    ) -> Self {
        self.relation_decls.push(RelationDecl {
            name: name.into(),
            kind,
            target: target.into(),
            columns: Some((target_column.into(), local_column.into())),
        });
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn find_column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.find_column(name).is_some()
    }

    /// Resolve a column name or fail with [`OrmError::UnresolvedColumn`].
    pub fn resolve_column(&self, name: &str) -> OrmResult<&Column> {
        self.find_column(name).ok_or_else(|| OrmError::UnresolvedColumn {
            table: self.name.clone(),
            column: name.to_string(),
        })
    }

    pub fn foreign_keys(&self) -> &[ForeignKey] {
        &self.foreign_keys
    }

    pub fn unique_constraints(&self) -> &[UniqueConstraint] {
        &self.unique_constraints
    }

    /// Primary key column names, in declaration order.
    pub fn primary_key(&self) -> Vec<&str> {
        self.columns
            .iter()
            .filter(|c| c.primary_key)
            .map(|c| c.name.as_str())
            .collect()
    }

    /// Columns the database can generate (pk, server defaults, onupdate).
    pub fn generated_columns(&self) -> Vec<&str> {
        self.columns
            .iter()
            .filter(|c| c.is_generated())
            .map(|c| c.name.as_str())
            .collect()
    }

    /// A resolved relation by name. Only populated after finalize.
    pub fn find_relation(&self, name: &str) -> Option<&Relation> {
        self.relations.get(name)
    }

    /// Resolve a relation name or fail with [`OrmError::UnknownRelationField`].
    pub fn resolve_relation(&self, name: &str) -> OrmResult<&Relation> {
        self.find_relation(name)
            .ok_or_else(|| OrmError::UnknownRelationField(name.to_string()))
    }

    pub fn relations(&self) -> impl Iterator<Item = &Relation> {
        self.relations.values()
    }

    /// Derive the upsert conflict target.
    ///
    /// Exactly one unique constraint besides the primary key: use it. None:
    /// fall back to the primary key. More than one: refuse with
    /// [`OrmError::AmbiguousConflictTarget`] naming the candidates.
    pub fn derive_conflict_target(&self) -> OrmResult<UniqueConstraint> {
        match self.conflict_candidates.len() {
            0 => {
                let pk = self.primary_key();
                if pk.is_empty() {
                    return Err(OrmError::Validation(format!(
                        "table '{}' has no unique constraint or primary key to upsert on",
                        self.name
                    )));
                }
                Ok(UniqueConstraint {
                    columns: pk.into_iter().map(str::to_string).collect(),
                    predicate: None,
                })
            }
            1 => Ok(self.conflict_candidates[0].clone()),
            _ => Err(OrmError::AmbiguousConflictTarget {
                table: self.name.clone(),
                candidates: self
                    .conflict_candidates
                    .iter()
                    .map(|c| format!("({})", c.columns.join(", ")))
                    .collect::<Vec<_>>()
                    .join(", "),
            }),
        }
    }

    /// Look up a caller-supplied conflict target among the declared unique
    /// constraints, so partial-index predicates are carried along.
    pub fn conflict_target_for(&self, columns: &[String]) -> UniqueConstraint {
        self.conflict_candidates
            .iter()
            .find(|c| c.columns == *columns)
            .cloned()
            .unwrap_or_else(|| UniqueConstraint {
                columns: columns.to_vec(),
                predicate: None,
            })
    }

    fn validate_declaration(&self) -> OrmResult<()> {
        Ident::parse(&self.name)?;
        for col in &self.columns {
            Ident::parse(&col.name)?;
            if self.columns.iter().filter(|c| c.name == col.name).count() > 1 {
                return Err(OrmError::Validation(format!(
                    "duplicate column '{}' on table '{}'",
                    col.name, self.name
                )));
            }
        }
        for fk in &self.foreign_keys {
            if !self.has_column(&fk.column) {
                return Err(OrmError::UnresolvedReference(format!(
                    "foreign key column '{}.{}' is not declared",
                    self.name, fk.column
                )));
            }
        }
        for uc in &self.unique_constraints {
            for col in &uc.columns {
                if !self.has_column(col) {
                    return Err(OrmError::UnresolvedReference(format!(
                        "unique constraint column '{}.{}' is not declared",
                        self.name, col
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Declaration phase of the schema lifecycle.
#[derive(Debug, Default)]
pub struct SchemaRegistry {
    tables: Vec<Table>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a table declaration. Pure data; nothing is resolved yet.
    pub fn declare(&mut self, table: Table) -> OrmResult<()> {
        table.validate_declaration()?;
        if self.tables.iter().any(|t| t.name == table.name) {
            return Err(OrmError::Validation(format!(
                "table '{}' is declared twice",
                table.name
            )));
        }
        self.tables.push(table);
        Ok(())
    }

    /// Resolve every foreign key and relation, compute derived lookups, and
    /// seal the schema. Fails on any dangling reference.
    pub fn finalize(self) -> OrmResult<Arc<Schema>> {
        let by_name: BTreeMap<String, usize> = self
            .tables
            .iter()
            .enumerate()
            .map(|(i, t)| (t.name.clone(), i))
            .collect();

        // Cross-table foreign key targets.
        for table in &self.tables {
            for fk in &table.foreign_keys {
                let Some(&target_idx) = by_name.get(&fk.target_table) else {
                    return Err(OrmError::UnresolvedReference(format!(
                        "foreign key '{}.{}' references unknown table '{}'",
                        table.name, fk.column, fk.target_table
                    )));
                };
                if !self.tables[target_idx].has_column(&fk.target_column) {
                    return Err(OrmError::UnresolvedReference(format!(
                        "foreign key '{}.{}' references unknown column '{}.{}'",
                        table.name, fk.column, fk.target_table, fk.target_column
                    )));
                }
            }
        }

        // Relations resolve against the full declaration set.
        let mut resolved: Vec<BTreeMap<String, Relation>> = Vec::with_capacity(self.tables.len());
        for table in &self.tables {
            let mut relations = BTreeMap::new();
            for decl in &table.relation_decls {
                let relation = resolve_relation(&self.tables, &by_name, table, decl)?;
                if relations.insert(decl.name.clone(), relation).is_some() {
                    return Err(OrmError::Validation(format!(
                        "relation '{}' is declared twice on table '{}'",
                        decl.name, table.name
                    )));
                }
            }
            resolved.push(relations);
        }

        let mut tables = self.tables;
        for (table, relations) in tables.iter_mut().zip(resolved) {
            table.relations = relations;
            table.conflict_candidates = conflict_candidates(table);
        }

        Ok(Arc::new(Schema {
            tables: tables.into_iter().map(|t| (t.name.clone(), t)).collect(),
        }))
    }
}

/// Unique constraints usable as upsert conflict targets: declared multi-column
/// constraints plus single `unique` columns, excluding the primary key.
fn conflict_candidates(table: &Table) -> Vec<UniqueConstraint> {
    let pk: Vec<String> = table.primary_key().iter().map(|s| s.to_string()).collect();
    let mut out: Vec<UniqueConstraint> = table
        .unique_constraints
        .iter()
        .filter(|c| c.columns != pk)
        .cloned()
        .collect();
    for col in &table.columns {
        if col.unique && !col.primary_key {
            out.push(UniqueConstraint {
                columns: vec![col.name.clone()],
                predicate: None,
            });
        }
    }
    out
}

/// Scan `from`'s foreign keys for exactly one pointing at `to`.
fn resolve_fk(from: &Table, to: &str) -> OrmResult<(String, String)> {
    let mut matches = from.foreign_keys.iter().filter(|fk| fk.target_table == to);
    let Some(first) = matches.next() else {
        return Err(OrmError::NoRelation {
            from: from.name.clone(),
            to: to.to_string(),
        });
    };
    if matches.next().is_some() {
        return Err(OrmError::AmbiguousRelation {
            from: from.name.clone(),
            to: to.to_string(),
        });
    }
    Ok((first.column.clone(), first.target_column.clone()))
}

fn resolve_relation(
    tables: &[Table],
    by_name: &BTreeMap<String, usize>,
    current: &Table,
    decl: &RelationDecl,
) -> OrmResult<Relation> {
    let Some(&target_idx) = by_name.get(&decl.target) else {
        return Err(OrmError::UnresolvedReference(format!(
            "relation '{}.{}' targets unknown table '{}'",
            current.name, decl.name, decl.target
        )));
    };
    let target = &tables[target_idx];

    let join = match &decl.kind {
        RelationKind::OneToOne | RelationKind::OneToMany => {
            let (target_column, local_column) = match &decl.columns {
                Some((tc, lc)) => {
                    target.resolve_column(tc)?;
                    current.resolve_column(lc)?;
                    (tc.clone(), lc.clone())
                }
                // Usually the target side carries the foreign key pointing
                // back here; the belongs-to direction (our own foreign key
                // pointing at the target) is tried second.
                None => match resolve_fk(target, &current.name) {
                    Ok(cols) => cols,
                    Err(OrmError::NoRelation { .. }) => {
                        let (local_column, target_column) = resolve_fk(current, &decl.target)?;
                        (target_column, local_column)
                    }
                    Err(e) => return Err(e),
                },
            };
            ResolvedJoin::Direct {
                target_column,
                local_column,
            }
        }
        RelationKind::ManyToMany { through } => {
            let Some(&through_idx) = by_name.get(through) else {
                return Err(OrmError::UnresolvedReference(format!(
                    "relation '{}.{}' uses unknown through table '{}'",
                    current.name, decl.name, through
                )));
            };
            let through_table = &tables[through_idx];
            let (through_current, current_key) = resolve_fk(through_table, &current.name)?;
            let (through_target, target_key) = resolve_fk(through_table, &decl.target)?;
            ResolvedJoin::Through {
                through: through.clone(),
                through_current,
                current_key,
                through_target,
                target_key,
            }
        }
    };

    Ok(Relation {
        name: decl.name.clone(),
        kind: decl.kind.clone(),
        target: decl.target.clone(),
        join,
    })
}

/// A finalized, read-only schema.
#[derive(Debug)]
pub struct Schema {
    tables: BTreeMap<String, Table>,
}

impl Schema {
    pub fn find_table(&self, name: &str) -> Option<&Table> {
        self.tables.get(name)
    }

    /// Look up a table or fail with [`OrmError::UnresolvedReference`].
    pub fn table(&self, name: &str) -> OrmResult<&Table> {
        self.find_table(name)
            .ok_or_else(|| OrmError::UnresolvedReference(format!("unknown table '{name}'")))
    }

    pub fn tables(&self) -> impl Iterator<Item = &Table> {
        self.tables.values()
    }
}
