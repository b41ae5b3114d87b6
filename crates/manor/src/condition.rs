//! Condition and expression building.
//!
//! Filters are written as keyword pairs whose field names may carry a
//! `__`-suffix selecting the comparison operator (`qty__gt`, `name__ilike`,
//! ...) or as nested boolean groups combined with AND/OR. Building resolves
//! every field against the queried table immediately, so a typo or unknown
//! operator fails at the offending call instead of at execution time.

use crate::error::{OrmError, OrmResult};
use crate::schema::Table;
use crate::sql::Sql;
use crate::value::SqlValue;

/// Comparison operator selected by a `__` field suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Eq,
    Neq,
    Gt,
    Ge,
    Lt,
    Le,
    In,
    NotIn,
    Is,
    IsNot,
    Like,
    Ilike,
    NotLike,
    NotIlike,
    Startswith,
    Endswith,
    Contains,
    Concat,
}

impl Operator {
    fn from_suffix(suffix: &str) -> Option<Self> {
        Some(match suffix {
            "eq" => Operator::Eq,
            "neq" => Operator::Neq,
            "gt" => Operator::Gt,
            "ge" => Operator::Ge,
            "lt" => Operator::Lt,
            "le" => Operator::Le,
            "in" => Operator::In,
            "not_in" => Operator::NotIn,
            "is" => Operator::Is,
            "is_not" => Operator::IsNot,
            "like" => Operator::Like,
            "ilike" => Operator::Ilike,
            "not_like" => Operator::NotLike,
            "not_ilike" => Operator::NotIlike,
            "startswith" => Operator::Startswith,
            "endswith" => Operator::Endswith,
            "contains" => Operator::Contains,
            "concat" => Operator::Concat,
            _ => None?,
        })
    }
}

/// Split `field__op` into a column name and operator. A name without a `__`
/// suffix defaults to equality; an unknown suffix is an immediate error.
pub(crate) fn parse_field(name: &str) -> OrmResult<(&str, Operator)> {
    match name.rsplit_once("__") {
        Some((column, suffix)) => {
            let op = Operator::from_suffix(suffix)
                .ok_or_else(|| OrmError::UnsupportedOperator(suffix.to_string()))?;
            Ok((column, op))
        }
        None => Ok((name, Operator::Eq)),
    }
}

/// A column-reference expression with an optional additive offset, used for
/// column-to-column comparisons like `updated_at >= created_at + 60`.
#[derive(Debug, Clone)]
pub struct F {
    column: String,
    delta: Option<SqlValue>,
    negate_delta: bool,
}

impl F {
    pub fn col(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            delta: None,
            negate_delta: false,
        }
    }

    /// `column + delta`.
    pub fn add(mut self, delta: impl Into<SqlValue>) -> Self {
        self.delta = Some(delta.into());
        self.negate_delta = false;
        self
    }

    /// `column - delta`.
    pub fn sub(mut self, delta: impl Into<SqlValue>) -> Self {
        self.delta = Some(delta.into());
        self.negate_delta = true;
        self
    }

    pub(crate) fn column(&self) -> &str {
        &self.column
    }

    /// Render `column [+|- delta]` into a SQL fragment.
    pub(crate) fn append_expr(&self, sql: &mut Sql, prefix: Option<&str>) -> OrmResult<()> {
        push_column(sql, prefix, &self.column)?;
        if let Some(delta) = &self.delta {
            sql.push(if self.negate_delta { " - " } else { " + " });
            sql.push_bind(delta.clone());
        }
        Ok(())
    }
}

/// The right-hand side of a keyword-pair comparison.
#[derive(Debug, Clone)]
pub enum FilterValue {
    Value(SqlValue),
    List(Vec<SqlValue>),
    Field(F),
    /// A compiled single-column subquery (see `QuerySet::into_subquery`).
    Subquery(Sql),
}

impl FilterValue {
    pub fn value(v: impl Into<SqlValue>) -> Self {
        FilterValue::Value(v.into())
    }

    pub fn list<T: Into<SqlValue>>(values: impl IntoIterator<Item = T>) -> Self {
        FilterValue::List(values.into_iter().map(Into::into).collect())
    }

    pub fn null() -> Self {
        FilterValue::Value(SqlValue::Null)
    }
}

impl From<F> for FilterValue {
    fn from(f: F) -> Self {
        FilterValue::Field(f)
    }
}

impl From<SqlValue> for FilterValue {
    fn from(v: SqlValue) -> Self {
        FilterValue::Value(v)
    }
}

impl From<Vec<SqlValue>> for FilterValue {
    fn from(v: Vec<SqlValue>) -> Self {
        FilterValue::List(v)
    }
}

macro_rules! filter_value_from_scalar {
    ($($t:ty),* $(,)?) => {
        $(impl From<$t> for FilterValue {
            fn from(v: $t) -> Self {
                FilterValue::Value(v.into())
            }
        })*
    };
}

filter_value_from_scalar!(
    bool,
    i16,
    i32,
    i64,
    f64,
    &str,
    String,
    uuid::Uuid,
    chrono::NaiveDateTime,
    chrono::NaiveDate,
    chrono::DateTime<chrono::Utc>,
    serde_json::Value,
);

/// Boolean connector for grouped filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connector {
    And,
    Or,
}

/// A filter: either keyword pairs or nested groups, never both.
#[derive(Debug, Clone)]
pub struct Filter {
    connector: Connector,
    pairs: Vec<(String, FilterValue)>,
    groups: Vec<Filter>,
}

impl Filter {
    /// Keyword pairs combined with AND.
    pub fn pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<FilterValue>,
    {
        Self {
            connector: Connector::And,
            pairs: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
            groups: Vec::new(),
        }
    }

    /// Keyword pairs combined with OR.
    pub fn or_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<FilterValue>,
    {
        let mut f = Self::pairs(pairs);
        f.connector = Connector::Or;
        f
    }

    /// Nested groups combined with AND.
    pub fn and(groups: impl IntoIterator<Item = Filter>) -> Self {
        Self {
            connector: Connector::And,
            pairs: Vec::new(),
            groups: groups.into_iter().collect(),
        }
    }

    /// Nested groups combined with OR.
    pub fn or(groups: impl IntoIterator<Item = Filter>) -> Self {
        Self {
            connector: Connector::Or,
            pairs: Vec::new(),
            groups: groups.into_iter().collect(),
        }
    }

    /// Assemble a filter from both forms, enforcing the one-or-the-other
    /// contract: mixing nested groups and keyword pairs in a single call is a
    /// composition error.
    pub fn compose(
        connector: Connector,
        groups: Vec<Filter>,
        pairs: Vec<(String, FilterValue)>,
    ) -> OrmResult<Self> {
        if !groups.is_empty() && !pairs.is_empty() {
            return Err(OrmError::InvalidQueryComposition(
                "pass either nested groups or keyword pairs, not both".to_string(),
            ));
        }
        Ok(Self {
            connector,
            pairs,
            groups,
        })
    }

    /// Resolve every field against `table` (or the extra annotation names)
    /// and build the condition tree.
    pub(crate) fn into_condition(self, table: &Table, extra: &[String]) -> OrmResult<ConditionNode> {
        let mut children = Vec::new();

        for group in self.groups {
            children.push(group.into_condition(table, extra)?);
        }

        for (name, value) in self.pairs {
            let (column, op) = parse_field(&name)?;
            if !table.has_column(column) && !extra.iter().any(|a| a == column) {
                return Err(OrmError::UnresolvedColumn {
                    table: table.name().to_string(),
                    column: column.to_string(),
                });
            }
            let value = match value {
                FilterValue::Field(f) => {
                    // Column refs resolve against the target table now, not
                    // at execution time.
                    table.resolve_column(f.column())?;
                    FilterValue::Field(f)
                }
                other => other,
            };
            children.push(ConditionNode::Compare {
                column: column.to_string(),
                op,
                value,
            });
        }

        Ok(match self.connector {
            Connector::And => ConditionNode::And(children),
            Connector::Or => ConditionNode::Or(children),
        })
    }
}

/// A resolved predicate tree.
#[derive(Debug, Clone)]
pub(crate) enum ConditionNode {
    And(Vec<ConditionNode>),
    Or(Vec<ConditionNode>),
    Not(Box<ConditionNode>),
    Compare {
        column: String,
        op: Operator,
        value: FilterValue,
    },
}

/// Escape `%`, `_`, and `\` in a LIKE needle.
fn escape_like(needle: &str) -> String {
    let mut out = String::with_capacity(needle.len());
    for c in needle.chars() {
        if c == '%' || c == '_' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn like_needle(value: &FilterValue) -> OrmResult<String> {
    match value {
        FilterValue::Value(SqlValue::Text(s)) => Ok(escape_like(s)),
        _ => Err(OrmError::Validation(
            "startswith/endswith/contains require a text value".to_string(),
        )),
    }
}

impl ConditionNode {
    pub(crate) fn negated(self) -> Self {
        ConditionNode::Not(Box::new(self))
    }

    pub(crate) fn is_empty(&self) -> bool {
        match self {
            ConditionNode::And(c) | ConditionNode::Or(c) => c.iter().all(Self::is_empty),
            ConditionNode::Not(inner) => inner.is_empty(),
            ConditionNode::Compare { .. } => false,
        }
    }

    /// Render into a [`Sql`] fragment. `prefix` qualifies bare column names
    /// when the root query carries joins.
    pub(crate) fn append_to_sql(&self, sql: &mut Sql, prefix: Option<&str>) -> OrmResult<()> {
        match self {
            ConditionNode::And(children) | ConditionNode::Or(children) => {
                let children: Vec<&ConditionNode> =
                    children.iter().filter(|c| !c.is_empty()).collect();
                if children.is_empty() {
                    sql.push("1=1");
                    return Ok(());
                }
                let joiner = if matches!(self, ConditionNode::And(_)) {
                    " AND "
                } else {
                    " OR "
                };
                let wrap = children.len() > 1;
                if wrap {
                    sql.push("(");
                }
                for (i, child) in children.iter().enumerate() {
                    if i > 0 {
                        sql.push(joiner);
                    }
                    child.append_to_sql(sql, prefix)?;
                }
                if wrap {
                    sql.push(")");
                }
                Ok(())
            }
            ConditionNode::Not(inner) => {
                sql.push("NOT (");
                inner.append_to_sql(sql, prefix)?;
                sql.push(")");
                Ok(())
            }
            ConditionNode::Compare { column, op, value } => {
                append_comparison(sql, prefix, column, *op, value)
            }
        }
    }
}

fn push_column(sql: &mut Sql, prefix: Option<&str>, column: &str) -> OrmResult<()> {
    match prefix {
        Some(p) if !column.contains('.') => {
            sql.push_ident(format!("{p}.{column}"))?;
        }
        _ => {
            sql.push_ident(column)?;
        }
    }
    Ok(())
}

fn append_comparison(
    sql: &mut Sql,
    prefix: Option<&str>,
    column: &str,
    op: Operator,
    value: &FilterValue,
) -> OrmResult<()> {
    // IN/NOT IN have list and subquery forms; everything else is scalar-ish.
    match (op, value) {
        (Operator::In | Operator::NotIn, FilterValue::List(values)) => {
            if values.is_empty() {
                // Vacuous membership test, matching SQL three-valued logic
                // pitfalls with `IN ()`.
                sql.push(if op == Operator::In { "1=0" } else { "1=1" });
                return Ok(());
            }
            push_column(sql, prefix, column)?;
            sql.push(if op == Operator::In { " IN (" } else { " NOT IN (" });
            for (i, v) in values.iter().enumerate() {
                if i > 0 {
                    sql.push(", ");
                }
                sql.push_bind(v.clone());
            }
            sql.push(")");
            return Ok(());
        }
        (Operator::In | Operator::NotIn, FilterValue::Subquery(sub)) => {
            push_column(sql, prefix, column)?;
            sql.push(if op == Operator::In { " IN (" } else { " NOT IN (" });
            sql.push_sql(sub.clone());
            sql.push(")");
            return Ok(());
        }
        (Operator::In | Operator::NotIn, _) => {
            return Err(OrmError::Validation(format!(
                "'{column}' membership test requires a list or subquery value"
            )));
        }
        _ => {}
    }

    if let FilterValue::Field(f) = value {
        push_column(sql, prefix, column)?;
        sql.push(comparison_symbol(op, false)?);
        f.append_expr(sql, prefix)?;
        return Ok(());
    }

    let scalar = match value {
        FilterValue::Value(v) => v,
        FilterValue::List(_) | FilterValue::Subquery(_) => {
            return Err(OrmError::Validation(format!(
                "operator on '{column}' requires a scalar value"
            )));
        }
        FilterValue::Field(_) => unreachable!(),
    };
    let is_null = scalar.is_null();

    match op {
        Operator::Eq | Operator::Is if is_null => {
            push_column(sql, prefix, column)?;
            sql.push(" IS NULL");
        }
        Operator::Neq | Operator::IsNot if is_null => {
            push_column(sql, prefix, column)?;
            sql.push(" IS NOT NULL");
        }
        Operator::Startswith => {
            push_column(sql, prefix, column)?;
            sql.push(" LIKE ");
            sql.push_bind(format!("{}%", like_needle(value)?));
        }
        Operator::Endswith => {
            push_column(sql, prefix, column)?;
            sql.push(" LIKE ");
            sql.push_bind(format!("%{}", like_needle(value)?));
        }
        Operator::Contains => {
            push_column(sql, prefix, column)?;
            sql.push(" LIKE ");
            sql.push_bind(format!("%{}%", like_needle(value)?));
        }
        Operator::Concat => {
            push_column(sql, prefix, column)?;
            sql.push(" || ");
            sql.push_bind(scalar.clone());
        }
        _ => {
            push_column(sql, prefix, column)?;
            sql.push(comparison_symbol(op, is_null)?);
            sql.push_bind(scalar.clone());
        }
    }
    Ok(())
}

fn comparison_symbol(op: Operator, is_null: bool) -> OrmResult<&'static str> {
    Ok(match op {
        Operator::Eq => " = ",
        Operator::Neq => " != ",
        Operator::Gt => " > ",
        Operator::Ge => " >= ",
        Operator::Lt => " < ",
        Operator::Le => " <= ",
        Operator::Is => " IS ",
        Operator::IsNot => " IS NOT ",
        Operator::Like => " LIKE ",
        Operator::Ilike => " ILIKE ",
        Operator::NotLike => " NOT LIKE ",
        Operator::NotIlike => " NOT ILIKE ",
        Operator::Concat => " || ",
        Operator::In | Operator::NotIn => {
            return Err(OrmError::Validation(
                "membership operators render separately".to_string(),
            ));
        }
        Operator::Startswith | Operator::Endswith | Operator::Contains => {
            let _ = is_null;
            return Err(OrmError::Validation(
                "affix operators render separately".to_string(),
            ));
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Column, ColumnType, Table};
    use crate::sql::Sql;

    fn items() -> Table {
        Table::new("items")
            .column(Column::new("id", ColumnType::BigInt).primary_key())
            .column(Column::new("qty", ColumnType::Int))
            .column(Column::new("name", ColumnType::Text).nullable())
            .column(Column::new("created_at", ColumnType::BigInt))
            .column(Column::new("updated_at", ColumnType::BigInt))
    }

    fn render(filter: Filter) -> OrmResult<(String, usize)> {
        let table = items();
        let node = filter.into_condition(&table, &[])?;
        let mut sql = Sql::empty();
        node.append_to_sql(&mut sql, None)?;
        Ok((sql.to_sql(), sql.params().len()))
    }

    #[test]
    fn default_operator_is_equality() {
        let (sql, n) = render(Filter::pairs([("qty", 5_i64)])).unwrap();
        assert_eq!(sql, "qty = $1");
        assert_eq!(n, 1);
    }

    #[test]
    fn suffix_selects_operator() {
        let (sql, _) = render(Filter::pairs([("qty__gt", 5_i64)])).unwrap();
        assert_eq!(sql, "qty > $1");
        let (sql, _) = render(Filter::pairs([("name__ilike", "%bolt%")])).unwrap();
        assert_eq!(sql, "name ILIKE $1");
    }

    #[test]
    fn unknown_suffix_fails_at_build() {
        let err = render(Filter::pairs([("qty__frobnicate", 5_i64)])).unwrap_err();
        assert!(matches!(err, OrmError::UnsupportedOperator(s) if s == "frobnicate"));
    }

    #[test]
    fn unknown_column_fails_at_build() {
        let err = render(Filter::pairs([("missing", 5_i64)])).unwrap_err();
        assert!(matches!(err, OrmError::UnresolvedColumn { .. }));
    }

    #[test]
    fn pairs_join_with_and() {
        let (sql, n) = render(Filter::pairs([
            ("qty__ge", FilterValue::value(1_i64)),
            ("qty__le", FilterValue::value(9_i64)),
        ]))
        .unwrap();
        assert_eq!(sql, "(qty >= $1 AND qty <= $2)");
        assert_eq!(n, 2);
    }

    #[test]
    fn groups_join_with_or() {
        let f = Filter::or([
            Filter::pairs([("qty", 1_i64)]),
            Filter::pairs([("qty", 2_i64)]),
        ]);
        let (sql, _) = render(f).unwrap();
        assert_eq!(sql, "(qty = $1 OR qty = $2)");
    }

    #[test]
    fn compose_rejects_mixed_forms() {
        let err = Filter::compose(
            Connector::And,
            vec![Filter::pairs([("qty", 1_i64)])],
            vec![("name".to_string(), FilterValue::value("x"))],
        )
        .unwrap_err();
        assert!(matches!(err, OrmError::InvalidQueryComposition(_)));
    }

    #[test]
    fn empty_in_list_is_vacuously_false() {
        let (sql, n) = render(Filter::pairs([(
            "qty__in",
            FilterValue::list(Vec::<i64>::new()),
        )]))
        .unwrap();
        assert_eq!(sql, "1=0");
        assert_eq!(n, 0);

        let (sql, _) = render(Filter::pairs([(
            "qty__not_in",
            FilterValue::list(Vec::<i64>::new()),
        )]))
        .unwrap();
        assert_eq!(sql, "1=1");
    }

    #[test]
    fn in_list_renders_placeholders() {
        let (sql, n) = render(Filter::pairs([(
            "qty__in",
            FilterValue::list([1_i64, 2, 3]),
        )]))
        .unwrap();
        assert_eq!(sql, "qty IN ($1, $2, $3)");
        assert_eq!(n, 3);
    }

    #[test]
    fn null_equality_renders_is_null() {
        let (sql, n) = render(Filter::pairs([("name", FilterValue::null())])).unwrap();
        assert_eq!(sql, "name IS NULL");
        assert_eq!(n, 0);

        let (sql, _) = render(Filter::pairs([("name__neq", FilterValue::null())])).unwrap();
        assert_eq!(sql, "name IS NOT NULL");
    }

    #[test]
    fn affix_operators_escape_needle() {
        let (sql, _) = render(Filter::pairs([("name__startswith", "50%_a")])).unwrap();
        assert_eq!(sql, "name LIKE $1");
        let (sql, _) = render(Filter::pairs([("name__contains", "bolt")])).unwrap();
        assert_eq!(sql, "name LIKE $1");
        assert_eq!(escape_like("50%_a"), r"50\%\_a");
    }

    #[test]
    fn field_ref_with_delta() {
        let f = Filter::pairs([("updated_at__ge", FilterValue::from(F::col("created_at").add(60_i64)))]);
        let (sql, n) = render(f).unwrap();
        assert_eq!(sql, "updated_at >= created_at + $1");
        assert_eq!(n, 1);
    }

    #[test]
    fn field_ref_resolves_against_table() {
        let f = Filter::pairs([("updated_at__ge", FilterValue::from(F::col("nope")))]);
        let err = render(f).unwrap_err();
        assert!(matches!(err, OrmError::UnresolvedColumn { .. }));
    }

    #[test]
    fn negation_wraps_in_not() {
        let table = items();
        let node = Filter::pairs([("qty", 5_i64)])
            .into_condition(&table, &[])
            .unwrap()
            .negated();
        let mut sql = Sql::empty();
        node.append_to_sql(&mut sql, None).unwrap();
        assert_eq!(sql.to_sql(), "NOT (qty = $1)");
    }

    #[test]
    fn prefix_qualifies_bare_columns() {
        let table = items();
        let node = Filter::pairs([("qty__gt", 5_i64)])
            .into_condition(&table, &[])
            .unwrap();
        let mut sql = Sql::empty();
        node.append_to_sql(&mut sql, Some("items")).unwrap();
        assert_eq!(sql.to_sql(), "items.qty > $1");
    }
}
