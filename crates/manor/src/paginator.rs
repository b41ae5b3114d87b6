//! Cursor pagination over a query set.
//!
//! Pages are keyed by the value of one ordered column instead of an offset,
//! so concurrent inserts never shift page boundaries. The boundary comparison
//! is inclusive (`>=` / `<=`): when the cursor column is not unique, a row at
//! the boundary can appear on two consecutive pages, which is preferred over
//! silently skipping rows.

use crate::backend::Backend;
use crate::condition::{Filter, FilterValue};
use crate::error::{OrmError, OrmResult};
use crate::prefetch::QueryRow;
use crate::queryset::QuerySet;
use crate::value::SqlValue;

const DEFAULT_PAGE_LIMIT: u64 = 20;

/// One page of results plus the cursor for the following page.
///
/// `next_cursor` is `None` when this page exhausted the matching rows.
#[derive(Debug)]
pub struct Page {
    pub results: Vec<QueryRow>,
    pub next_cursor: Option<SqlValue>,
}

/// Cursor paginator over a prepared [`QuerySet`].
///
/// The paginator orders by `field`, fetches `limit + 1` rows, and uses the
/// overflow row to produce the next cursor. `increasing` selects the paging
/// direction relative to the sort order; `order_desc` the sort order itself.
#[derive(Debug)]
pub struct QuerySetPaginator {
    queryset: QuerySet,
    field: String,
    limit: u64,
    order_desc: bool,
    is_increase: bool,
    start_value: Option<SqlValue>,
    nulls_last: bool,
}

impl QuerySetPaginator {
    pub fn new(queryset: QuerySet, field: impl Into<String>) -> Self {
        Self {
            queryset,
            field: field.into(),
            limit: DEFAULT_PAGE_LIMIT,
            order_desc: false,
            is_increase: true,
            start_value: None,
            nulls_last: false,
        }
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = limit.max(1);
        self
    }

    pub fn order_desc(mut self, desc: bool) -> Self {
        self.order_desc = desc;
        self
    }

    /// Page forward (`true`, the default) or backward through the order.
    pub fn increasing(mut self, is_increase: bool) -> Self {
        self.is_increase = is_increase;
        self
    }

    /// Resume from a cursor returned by a previous page.
    pub fn start_value(mut self, value: impl Into<SqlValue>) -> Self {
        self.start_value = Some(value.into());
        self
    }

    pub fn nulls_last(mut self, nulls_last: bool) -> Self {
        self.nulls_last = nulls_last;
        self
    }

    /// Execute the paginated query.
    pub async fn page(self, backend: &impl Backend) -> OrmResult<Page> {
        let mut qs = self
            .queryset
            .clone()
            .order_by(&self.field, self.order_desc, self.nulls_last)?
            .limit(self.limit + 1)?;

        // Inclusive boundary: a duplicated cursor value may repeat a row on
        // the next page, but never skips one.
        if let Some(start) = &self.start_value {
            let op = if self.is_increase { "ge" } else { "le" };
            qs = qs.filter(Filter::pairs([(
                format!("{}__{op}", self.field),
                FilterValue::Value(start.clone()),
            )]))?;
        }

        let results = qs.all(backend).await?;
        self.slice_results(results)
    }

    /// When the overflow row is present, the cursor comes from one end of the
    /// result list and the page is the other `limit` rows.
    fn cursor_index(&self, len: usize) -> usize {
        if (self.order_desc && !self.is_increase) || (!self.order_desc && self.is_increase) {
            len - 1
        } else {
            0
        }
    }

    fn slice_results(&self, mut results: Vec<QueryRow>) -> OrmResult<Page> {
        if results.len() <= self.limit as usize {
            return Ok(Page {
                results,
                next_cursor: None,
            });
        }

        let idx = self.cursor_index(results.len());
        let next_cursor = results[idx]
            .record()
            .get(&self.field)
            .cloned()
            .ok_or_else(|| {
                OrmError::decode(&self.field, "pagination field missing from result row")
            })?;

        if idx == 0 {
            results.remove(0);
        } else {
            results.truncate(self.limit as usize);
        }
        Ok(Page {
            results,
            next_cursor: Some(next_cursor),
        })
    }
}
