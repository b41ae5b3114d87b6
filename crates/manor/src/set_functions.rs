//! Merge operators for upsert conflict clauses and bulk updates.
//!
//! A set function replaces the plain overwrite of a column: given the
//! existing column expression and the incoming value expression (the
//! `EXCLUDED` column in an upsert, the VALUES-table column in a bulk
//! update), it produces the merged SQL expression.

use crate::schema::Column;

/// A named merge operator applied instead of plain overwrite.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetFunction {
    /// `existing + incoming`; a nullable existing column is coalesced to 0.
    Increment,
    /// `existing - incoming`; a nullable existing column is coalesced to 0.
    Decrement,
    /// `greatest(existing, incoming)`.
    Greatest,
    /// Keep the existing value when the incoming one is NULL:
    /// `coalesce(incoming, existing)`.
    CoalesceIfNull,
    /// Distinct union of two array columns, with an optional element cap.
    ArrayUnion { limit: Option<u64> },
}

impl SetFunction {
    /// Render the merged expression for `column`, where `existing` and
    /// `incoming` are already-qualified SQL expressions.
    pub fn expression(&self, column: &Column, existing: &str, incoming: &str) -> String {
        match self {
            SetFunction::Increment => {
                format!("{} + {incoming}", numeric_source(column, existing))
            }
            SetFunction::Decrement => {
                format!("{} - {incoming}", numeric_source(column, existing))
            }
            SetFunction::Greatest => format!("greatest({existing}, {incoming})"),
            SetFunction::CoalesceIfNull => format!("coalesce({incoming}, {existing})"),
            SetFunction::ArrayUnion { limit } => {
                let source = if column.nullable {
                    format!("coalesce({existing}, '{{}}'::{})", column.ty.cast_name())
                } else {
                    existing.to_string()
                };
                let mut inner =
                    format!("SELECT DISTINCT unnest(array_cat({source}, {incoming}))");
                if let Some(limit) = limit {
                    use std::fmt::Write;
                    let _ = write!(&mut inner, " LIMIT {limit}");
                }
                format!("array(({inner}))")
            }
        }
    }
}

fn numeric_source(column: &Column, existing: &str) -> String {
    if column.nullable {
        format!("coalesce({existing}, 0)")
    } else {
        existing.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ColumnType;

    #[test]
    fn increment_plain_column() {
        let col = Column::new("qty", ColumnType::Int);
        assert_eq!(
            SetFunction::Increment.expression(&col, "items.qty", "EXCLUDED.qty"),
            "items.qty + EXCLUDED.qty"
        );
    }

    #[test]
    fn increment_coalesces_nullable() {
        let col = Column::new("qty", ColumnType::Int).nullable();
        assert_eq!(
            SetFunction::Increment.expression(&col, "items.qty", "EXCLUDED.qty"),
            "coalesce(items.qty, 0) + EXCLUDED.qty"
        );
    }

    #[test]
    fn decrement_nullable() {
        let col = Column::new("qty", ColumnType::Int).nullable();
        assert_eq!(
            SetFunction::Decrement.expression(&col, "items.qty", "v.qty"),
            "coalesce(items.qty, 0) - v.qty"
        );
    }

    #[test]
    fn greatest_and_coalesce() {
        let col = Column::new("seen_at", ColumnType::BigInt);
        assert_eq!(
            SetFunction::Greatest.expression(&col, "t.seen_at", "EXCLUDED.seen_at"),
            "greatest(t.seen_at, EXCLUDED.seen_at)"
        );
        assert_eq!(
            SetFunction::CoalesceIfNull.expression(&col, "t.seen_at", "EXCLUDED.seen_at"),
            "coalesce(EXCLUDED.seen_at, t.seen_at)"
        );
    }

    #[test]
    fn array_union_nullable_with_limit() {
        let col = Column::new("tags", ColumnType::Array(Box::new(ColumnType::Text))).nullable();
        assert_eq!(
            SetFunction::ArrayUnion { limit: Some(8) }.expression(&col, "t.tags", "EXCLUDED.tags"),
            "array((SELECT DISTINCT unnest(array_cat(coalesce(t.tags, '{}'::text[]), EXCLUDED.tags)) LIMIT 8))"
        );
    }

    #[test]
    fn array_union_plain() {
        let col = Column::new("tags", ColumnType::Array(Box::new(ColumnType::Text)));
        assert_eq!(
            SetFunction::ArrayUnion { limit: None }.expression(&col, "t.tags", "v.tags"),
            "array((SELECT DISTINCT unnest(array_cat(t.tags, v.tags))))"
        );
    }
}
