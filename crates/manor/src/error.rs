//! Error types for manor

use thiserror::Error;

/// Result type alias for manor operations
pub type OrmResult<T> = Result<T, OrmError>;

/// Error types for query building and database operations.
///
/// Build-time (caller) errors — unresolved columns, unsupported operators,
/// ambiguous conflict targets or relations, conflicting builder calls — are
/// raised at the offending call, never deferred to execution. Execution
/// errors coming back from the database are surfaced verbatim.
#[derive(Debug, Error)]
pub enum OrmError {
    /// Database connection error
    #[error("Connection error: {0}")]
    Connection(String),

    /// Query execution error
    #[error("Query error: {0}")]
    Query(#[from] tokio_postgres::Error),

    /// Row not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Unique constraint violation
    #[error("Unique constraint violation: {0}")]
    UniqueViolation(String),

    /// Foreign key constraint violation
    #[error("Foreign key violation: {0}")]
    ForeignKeyViolation(String),

    /// Check constraint violation
    #[error("Check constraint violation: {0}")]
    CheckViolation(String),

    /// Row decode/mapping error
    #[error("Decode error on column '{column}': {message}")]
    Decode { column: String, message: String },

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Unknown `__`-suffix operator in a field expression
    #[error("Unsupported operator '{0}'")]
    UnsupportedOperator(String),

    /// Conflicting builder calls (mixed condition forms, join+prefetch on the
    /// same relation, raw projection combined with prefetching, ...)
    #[error("Invalid query composition: {0}")]
    InvalidQueryComposition(String),

    /// Builder call on a query set that has already been compiled
    #[error("Query set is already compiled; builder calls are no longer allowed")]
    QuerySetAlreadyCompiled,

    /// A field name that resolves to neither a column nor an annotation
    #[error("Column '{column}' is not defined on table '{table}'")]
    UnresolvedColumn { table: String, column: String },

    /// More than one unique constraint is usable as an upsert conflict target
    #[error("Can't choose conflict target on '{table}', choose one of: {candidates}")]
    AmbiguousConflictTarget { table: String, candidates: String },

    /// No foreign key connects the two tables
    #[error("There is no foreign key from '{from}' to '{to}'")]
    NoRelation { from: String, to: String },

    /// More than one foreign key connects the two tables
    #[error("More than one foreign key from '{from}' to '{to}'; declare the relation with explicit columns")]
    AmbiguousRelation { from: String, to: String },

    /// Relation name not declared on the queried table
    #[error("Unknown relation field '{0}'")]
    UnknownRelationField(String),

    /// Prefetch column subset contains a column foreign to the target table
    #[error("Column '{column}' does not belong to relation '{relation}'")]
    InvalidColumnSelection { relation: String, column: String },

    /// Relation declared but neither joined nor prefetched by the query
    #[error("Relation '{0}' was not fetched; request it via select_related or prefetch_related")]
    RelationNotFetched(String),

    /// Dangling reference discovered while finalizing the schema
    #[error("Unresolved schema reference: {0}")]
    UnresolvedReference(String),

    /// Pool error
    #[error("Pool error: {0}")]
    Pool(String),

    /// Other errors
    #[error("{0}")]
    Other(String),
}

impl OrmError {
    /// Create a decode error for a specific column
    pub fn decode(column: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Decode {
            column: column.into(),
            message: message.into(),
        }
    }

    /// Create a not found error
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    /// Create a validation error
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Check if this is a unique violation error
    pub fn is_unique_violation(&self) -> bool {
        matches!(self, Self::UniqueViolation(_))
    }

    /// Check if this is a not found error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Check if this error was raised while building the query, before any
    /// statement reached the database.
    pub fn is_build_error(&self) -> bool {
        matches!(
            self,
            Self::UnsupportedOperator(_)
                | Self::InvalidQueryComposition(_)
                | Self::QuerySetAlreadyCompiled
                | Self::UnresolvedColumn { .. }
                | Self::AmbiguousConflictTarget { .. }
                | Self::NoRelation { .. }
                | Self::AmbiguousRelation { .. }
                | Self::UnknownRelationField(_)
                | Self::InvalidColumnSelection { .. }
                | Self::UnresolvedReference(_)
        )
    }

    /// Parse a tokio_postgres error into a more specific OrmError
    pub fn from_db_error(err: tokio_postgres::Error) -> Self {
        if let Some(db_err) = err.as_db_error() {
            let constraint = db_err.constraint().unwrap_or("unknown");
            let message = db_err.message();

            match db_err.code().code() {
                "23505" => return Self::UniqueViolation(format!("{}: {}", constraint, message)),
                "23503" => {
                    return Self::ForeignKeyViolation(format!("{}: {}", constraint, message));
                }
                "23514" => return Self::CheckViolation(format!("{}: {}", constraint, message)),
                _ => {}
            }
        }
        Self::Query(err)
    }
}

impl From<deadpool_postgres::PoolError> for OrmError {
    fn from(err: deadpool_postgres::PoolError) -> Self {
        Self::Pool(err.to_string())
    }
}
