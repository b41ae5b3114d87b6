//! # manor
//!
//! A dynamic Postgres data-access layer for Rust.
//!
//! ## Features
//!
//! - **Declarative schema**: tables, foreign keys, and relations declared as
//!   data, resolved once by [`SchemaRegistry::finalize`]
//! - **Composable filters**: `column__operator` pairs build predicate trees
//!   with explicit AND/OR composition
//! - **Query sets**: lazy SELECT builders that compile once and execute once;
//!   a consumed or compiled set refuses further composition
//! - **Relations**: `select_related` joins to-one chains in one statement,
//!   `prefetch_related` batches to-many and many-to-many fetches
//! - **Bulk writes**: batched multi-row inserts with generated-column
//!   write-back, `UPDATE ... FROM (VALUES ...)` bulk updates, and
//!   `ON CONFLICT` upserts with per-column merge functions
//! - **Cursor pagination**: value-based paging that never skips rows
//! - **Transaction-friendly**: every operation runs against any [`Backend`],
//!   pooled connection or open transaction alike
//!
//! ## Quick tour
//!
//! ```ignore
//! use manor::{sql, Filter, Manager, PoolBackend, QuerySetPaginator};
//!
//! let backend = PoolBackend::from_url("postgres://localhost/app")?;
//! let users = Manager::new(schema.clone(), "users")?;
//!
//! // Filtered read with a joined profile and prefetched tags.
//! let rows = users
//!     .filter(Filter::pairs([("status", "active"), ("plan", "pro")]))?
//!     .select_related("profile")?
//!     .prefetch_related("tags", None)?
//!     .order_by("created_at", true, false)?
//!     .all(&backend)
//!     .await?;
//!
//! // Upsert merging counters instead of overwriting them.
//! users
//!     .update_or_create(&backend, record, None, &set_functions)
//!     .await?;
//! ```

pub mod backend;
pub mod condition;
pub mod error;
pub mod ident;
pub mod manager;
pub mod paginator;
pub mod prefetch;
pub mod queryset;
pub mod schema;
pub mod set_functions;
pub mod sql;
pub mod value;

pub use backend::{Backend, PoolBackend, TransactionBackend};
pub use condition::{Connector, F, Filter, FilterValue, Operator};
pub use error::{OrmError, OrmResult};
pub use ident::{Ident, IntoIdent};
pub use manager::{Manager, SetFunctions};
pub use paginator::{Page, QuerySetPaginator};
pub use prefetch::{QueryRow, Related};
pub use queryset::{Aggregation, QuerySet};
pub use schema::{
    Column, ColumnType, ForeignKey, Relation, RelationKind, ResolvedJoin, Schema, SchemaRegistry,
    Table, UniqueConstraint,
};
pub use set_functions::SetFunction;
pub use sql::{Sql, sql};
pub use value::{Record, SqlValue};
