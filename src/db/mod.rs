//! Connection pools and connections for the three backends.

mod connection;
mod mysql;
mod postgres;
mod query;
mod sqlite;

pub use connection::*;
pub use mysql::MySqlPool;
pub use postgres::PostgresPool;
pub use query::*;
pub use sqlite::SqlitePool;

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::{Backend, DriverConfig};
use crate::dialect::Dialect;
use crate::error::Result;
use crate::value::Param;

/// One physical connection, leased from a [`Pool`].
#[async_trait]
pub trait Connection: Send {
    /// Run a statement, returning the affected-row count.
    async fn execute(&mut self, sql: &str, params: &[Param]) -> Result<u64>;

    /// Run a statement and materialize its rows.
    async fn query(&mut self, sql: &str, params: &[Param]) -> Result<Vec<RawRow>>;

    async fn begin(&mut self) -> Result<()>;

    async fn commit(&mut self) -> Result<()>;

    async fn rollback(&mut self) -> Result<()>;
}

/// Source of connections plus the dialect that speaks to them.
#[async_trait]
pub trait Pool: Send + Sync {
    fn dialect(&self) -> Arc<dyn Dialect>;

    /// Wait for a free connection, up to the configured timeout.
    async fn acquire(&self) -> Result<Box<dyn Connection>>;

    /// Called after a database was dropped, to release backing storage.
    async fn database_dropped(&self, _db: &str) -> Result<()> {
        Ok(())
    }

    async fn close(&self);
}

/// Open the pool selected by `config.backend`.
pub async fn open_pool(config: &DriverConfig) -> Result<Arc<dyn Pool>> {
    let pool: Arc<dyn Pool> = match config.backend {
        Backend::Sqlite => Arc::new(SqlitePool::open(config)?),
        Backend::Mysql => Arc::new(MySqlPool::open(config)?),
        Backend::Postgres => Arc::new(PostgresPool::open(config)?),
    };
    tracing::info!(
        backend = pool.dialect().name(),
        max_size = config.pool.max_size,
        "connection pool ready"
    );
    Ok(pool)
}
