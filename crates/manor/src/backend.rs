//! Database backends.
//!
//! [`Backend`] is the execution seam between the query engine and Postgres.
//! Query sets and managers speak to a backend in three verbs (`fetch_all`,
//! `fetch_one`, `execute`) plus transaction bookkeeping, so tests can run the
//! whole engine against a scripted fake while production traffic goes through
//! a [`PoolBackend`] or an open [`TransactionBackend`].

use crate::error::{OrmError, OrmResult};
use crate::value::{Record, SqlValue};
use deadpool_postgres::{Manager, ManagerConfig, Object, Pool, RecyclingMethod};
use std::future::Future;
use tokio_postgres::NoTls;
use tokio_postgres::types::ToSql;

fn params_ref(params: &[SqlValue]) -> Vec<&(dyn ToSql + Sync)> {
    params.iter().map(|p| p as &(dyn ToSql + Sync)).collect()
}

/// Execution backend for query sets and managers.
///
/// `in_transaction` is consulted by multi-statement operations: inside a
/// transaction they run statements sequentially on the same connection;
/// outside, bulk writes open their own transaction and read-side prefetches
/// fan out concurrently over the pool.
pub trait Backend: Send + Sync {
    /// Run a query and return all rows.
    fn fetch_all(
        &self,
        sql: &str,
        params: &[SqlValue],
    ) -> impl Future<Output = OrmResult<Vec<Record>>> + Send;

    /// Run a query and return at most one row.
    fn fetch_one(
        &self,
        sql: &str,
        params: &[SqlValue],
    ) -> impl Future<Output = OrmResult<Option<Record>>> + Send;

    /// Run a statement and return the affected row count.
    fn execute(
        &self,
        sql: &str,
        params: &[SqlValue],
    ) -> impl Future<Output = OrmResult<u64>> + Send;

    /// Whether this backend is already inside an open transaction.
    fn in_transaction(&self) -> bool;

    /// Open a transaction on a dedicated connection.
    fn begin(&self) -> impl Future<Output = OrmResult<TransactionBackend>> + Send;
}

impl<B: Backend> Backend for &B {
    fn fetch_all(
        &self,
        sql: &str,
        params: &[SqlValue],
    ) -> impl Future<Output = OrmResult<Vec<Record>>> + Send {
        (**self).fetch_all(sql, params)
    }

    fn fetch_one(
        &self,
        sql: &str,
        params: &[SqlValue],
    ) -> impl Future<Output = OrmResult<Option<Record>>> + Send {
        (**self).fetch_one(sql, params)
    }

    fn execute(
        &self,
        sql: &str,
        params: &[SqlValue],
    ) -> impl Future<Output = OrmResult<u64>> + Send {
        (**self).execute(sql, params)
    }

    fn in_transaction(&self) -> bool {
        (**self).in_transaction()
    }

    fn begin(&self) -> impl Future<Output = OrmResult<TransactionBackend>> + Send {
        (**self).begin()
    }
}

/// A pooled Postgres backend.
///
/// Each call checks a connection out of the deadpool pool, so independent
/// queries may run on different connections concurrently.
#[derive(Clone)]
pub struct PoolBackend {
    pool: Pool,
}

impl PoolBackend {
    /// Create a backend from a database URL with default pool settings.
    ///
    /// Uses `NoTls` and a small pool, suitable for local/dev. For production
    /// tuning build the pool yourself and use [`PoolBackend::from_pool`].
    pub fn from_url(database_url: &str) -> OrmResult<Self> {
        Self::from_url_with_size(database_url, 16)
    }

    /// Create a backend from a database URL with an explicit pool size.
    pub fn from_url_with_size(database_url: &str, max_size: usize) -> OrmResult<Self> {
        let pg_config: tokio_postgres::Config = database_url
            .parse()
            .map_err(|e: tokio_postgres::Error| OrmError::Connection(e.to_string()))?;

        let mgr = Manager::from_config(
            pg_config,
            NoTls,
            ManagerConfig {
                recycling_method: RecyclingMethod::Fast,
            },
        );
        let pool = Pool::builder(mgr)
            .max_size(max_size)
            .build()
            .map_err(|e| OrmError::Pool(e.to_string()))?;
        Ok(Self { pool })
    }

    /// Wrap an existing pool.
    pub fn from_pool(pool: Pool) -> Self {
        Self { pool }
    }

    /// The underlying pool.
    pub fn pool(&self) -> &Pool {
        &self.pool
    }
}

impl Backend for PoolBackend {
    async fn fetch_all(&self, sql: &str, params: &[SqlValue]) -> OrmResult<Vec<Record>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(sql, &params_ref(params))
            .await
            .map_err(OrmError::from_db_error)?;
        rows.iter().map(Record::from_row).collect()
    }

    async fn fetch_one(&self, sql: &str, params: &[SqlValue]) -> OrmResult<Option<Record>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(sql, &params_ref(params))
            .await
            .map_err(OrmError::from_db_error)?;
        row.as_ref().map(Record::from_row).transpose()
    }

    async fn execute(&self, sql: &str, params: &[SqlValue]) -> OrmResult<u64> {
        let client = self.pool.get().await?;
        client
            .execute(sql, &params_ref(params))
            .await
            .map_err(OrmError::from_db_error)
    }

    fn in_transaction(&self) -> bool {
        false
    }

    async fn begin(&self) -> OrmResult<TransactionBackend> {
        let client = self.pool.get().await?;
        client
            .batch_execute("BEGIN")
            .await
            .map_err(OrmError::from_db_error)?;
        Ok(TransactionBackend {
            client: Some(client),
            force_rollback: false,
        })
    }
}

/// An open transaction pinned to one pooled connection.
///
/// All statements issued through this backend run inside the transaction.
/// Call [`commit`](TransactionBackend::commit) or
/// [`rollback`](TransactionBackend::rollback) to finish it; dropping an
/// unfinished transaction schedules a best-effort `ROLLBACK` before the
/// connection returns to the pool.
pub struct TransactionBackend {
    client: Option<Object>,
    force_rollback: bool,
}

impl TransactionBackend {
    fn client(&self) -> OrmResult<&Object> {
        self.client
            .as_ref()
            .ok_or_else(|| OrmError::Other("transaction already finished".to_string()))
    }

    /// Make the transaction roll back on [`commit`](TransactionBackend::commit).
    ///
    /// Useful in integration tests that want real statements without
    /// persisting their effects.
    pub fn force_rollback(&mut self) {
        self.force_rollback = true;
    }

    /// Commit the transaction and release the connection.
    pub async fn commit(mut self) -> OrmResult<()> {
        let Some(client) = self.client.take() else {
            return Ok(());
        };
        let end = if self.force_rollback { "ROLLBACK" } else { "COMMIT" };
        client
            .batch_execute(end)
            .await
            .map_err(OrmError::from_db_error)
    }

    /// Roll the transaction back and release the connection.
    pub async fn rollback(mut self) -> OrmResult<()> {
        let Some(client) = self.client.take() else {
            return Ok(());
        };
        client
            .batch_execute("ROLLBACK")
            .await
            .map_err(OrmError::from_db_error)
    }
}

impl Drop for TransactionBackend {
    fn drop(&mut self) {
        if let Some(client) = self.client.take() {
            #[cfg(feature = "tracing")]
            tracing::warn!("transaction dropped without commit or rollback");
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    let _ = client.batch_execute("ROLLBACK").await;
                });
            }
        }
    }
}

impl Backend for TransactionBackend {
    async fn fetch_all(&self, sql: &str, params: &[SqlValue]) -> OrmResult<Vec<Record>> {
        let rows = self
            .client()?
            .query(sql, &params_ref(params))
            .await
            .map_err(OrmError::from_db_error)?;
        rows.iter().map(Record::from_row).collect()
    }

    async fn fetch_one(&self, sql: &str, params: &[SqlValue]) -> OrmResult<Option<Record>> {
        let row = self
            .client()?
            .query_opt(sql, &params_ref(params))
            .await
            .map_err(OrmError::from_db_error)?;
        row.as_ref().map(Record::from_row).transpose()
    }

    async fn execute(&self, sql: &str, params: &[SqlValue]) -> OrmResult<u64> {
        self.client()?
            .execute(sql, &params_ref(params))
            .await
            .map_err(OrmError::from_db_error)
    }

    fn in_transaction(&self) -> bool {
        true
    }

    async fn begin(&self) -> OrmResult<TransactionBackend> {
        Err(OrmError::InvalidQueryComposition(
            "nested transactions are not supported; use the current transaction".to_string(),
        ))
    }
}
