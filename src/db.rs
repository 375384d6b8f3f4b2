//! Borrowed database handles.
//!
//! Collectors only need two things from a connection: a row cursor for a read-only query and a way to
//! run a statement and discard its result. [`Database`] captures exactly that so the collection pipeline
//! can be driven by a pooled connection in production and by an in-memory double in tests.

use anyhow::Context;
use futures::future::BoxFuture;
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use tokio_postgres::types::ToSql;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A row cursor. Dropping it releases the underlying portal.
pub type RowStream<'a, R> = BoxStream<'a, Result<R, BoxError>>;

/// Typed, nullable column access. SQL NULL is `Ok(None)`; a type mismatch is an error.
pub trait SqlRow: Send {
    fn get_string(&self, index: usize) -> Result<Option<String>, BoxError>;
    fn get_i64(&self, index: usize) -> Result<Option<i64>, BoxError>;
    fn get_f64(&self, index: usize) -> Result<Option<f64>, BoxError>;
}

pub trait Database: Send + Sync {
    type Row: SqlRow;

    /// Executes `sql` and returns a cursor over its rows.
    fn query_rows<'a>(&'a self, sql: &'a str) -> BoxFuture<'a, Result<RowStream<'a, Self::Row>, BoxError>>;

    /// Executes `sql`, discarding any rows it returns.
    fn execute_statement<'a>(&'a self, sql: &'a str) -> BoxFuture<'a, Result<u64, BoxError>>;
}

impl SqlRow for tokio_postgres::Row {
    fn get_string(&self, index: usize) -> Result<Option<String>, BoxError> {
        Ok(self.try_get(index)?)
    }

    fn get_i64(&self, index: usize) -> Result<Option<i64>, BoxError> {
        Ok(self.try_get(index)?)
    }

    fn get_f64(&self, index: usize) -> Result<Option<f64>, BoxError> {
        Ok(self.try_get(index)?)
    }
}

fn no_params() -> Vec<&'static (dyn ToSql + Sync)> {
    Vec::new()
}

impl Database for deadpool_postgres::Object {
    type Row = tokio_postgres::Row;

    fn query_rows<'a>(&'a self, sql: &'a str) -> BoxFuture<'a, Result<RowStream<'a, Self::Row>, BoxError>> {
        Box::pin(async move {
            let client: &tokio_postgres::Client = self;
            let rows = client.query_raw(&self.prepare_cached(sql).await?, no_params()).await?;
            Ok(rows.map_err(BoxError::from).boxed())
        })
    }

    fn execute_statement<'a>(&'a self, sql: &'a str) -> BoxFuture<'a, Result<u64, BoxError>> {
        Box::pin(async move {
            let client: &tokio_postgres::Client = self;
            Ok(client.execute(sql, &[]).await?)
        })
    }
}

/// A database handle borrowed for the duration of one scrape, plus facts about the server behind it.
#[derive(Debug)]
pub struct Instance<D> {
    db: D,
    version: u32,
}

impl<D: Database> Instance<D> {
    /// `version` is the server's `server_version_num`, e.g. `160002`.
    pub fn new(db: D, version: u32) -> Self {
        Self { db, version }
    }

    pub fn db(&self) -> &D {
        &self.db
    }

    pub fn version(&self) -> u32 {
        self.version
    }
}

impl Instance<deadpool_postgres::Object> {
    /// Checks a connection out of `pool` and reads its server version.
    pub async fn connect(pool: &deadpool_postgres::Pool) -> anyhow::Result<Self> {
        let db = pool.get().await?;
        let version: String = db.query_one("SHOW server_version_num", &[]).await?.get(0);
        let version = version.parse().with_context(|| format!("unexpected server_version_num {version:?}"))?;
        tracing::debug!(version, "connected");
        Ok(Self::new(db, version))
    }
}
