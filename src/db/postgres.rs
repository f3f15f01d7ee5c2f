use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use deadpool_postgres::{Manager, ManagerConfig, Object, PoolError, RecyclingMethod, Runtime};
use tokio::task::JoinHandle;
use tokio_postgres::error::ErrorPosition;
use tokio_postgres::types::{ToSql, Type};
use tokio_postgres::{NoTls, Row};
use tracing::debug;

use super::{byte_offset_to_line_col, categorize_sqlstate, CellValue, Connection, ErrorCategory, Pool, RawRow};
use crate::config::DriverConfig;
use crate::dialect::{Dialect, PostgresDialect};
use crate::error::{Error, Result};
use crate::value::Param;

pub struct PostgresPool {
    pool: deadpool_postgres::Pool,
    dialect: Arc<PostgresDialect>,
    reaper: Option<JoinHandle<()>>,
}

impl PostgresPool {
    /// Build the pool and start the idle reaper. Must run inside a Tokio runtime.
    pub fn open(config: &DriverConfig) -> Result<Self> {
        let server = &config.server;
        let pg_config: tokio_postgres::Config = server
            .connection_string(config.port(), server.catalog())
            .parse()
            .map_err(|e| Error::Config(format!("invalid connection settings: {}", e)))?;

        let manager_config = ManagerConfig {
            recycling_method: if config.pool.ping {
                RecyclingMethod::Verified
            } else {
                RecyclingMethod::Fast
            },
        };
        let manager = if server.ssl_mode.uses_tls() {
            Manager::from_config(pg_config, server.postgres_tls()?, manager_config)
        } else {
            Manager::from_config(pg_config, NoTls, manager_config)
        };

        let timeout = Some(config.pool.acquire_timeout());
        let pool = deadpool_postgres::Pool::builder(manager)
            .max_size(config.pool.max_size.max(1))
            .wait_timeout(timeout)
            .create_timeout(timeout)
            .recycle_timeout(timeout)
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(|e| Error::Config(format!("failed to build postgres pool: {}", e)))?;

        let idle = config.pool.idle_timeout();
        let reaper = (!idle.is_zero()).then(|| spawn_reaper(pool.clone(), idle));

        debug!(target = %server.display_string(config.database()), "postgres pool configured");
        Ok(Self {
            pool,
            dialect: Arc::new(PostgresDialect::new()),
            reaper,
        })
    }
}

/// Periodically drop connections that sat unused longer than `idle`.
fn spawn_reaper(pool: deadpool_postgres::Pool, idle: Duration) -> JoinHandle<()> {
    let period = (idle / 2).clamp(Duration::from_secs(1), Duration::from_secs(60));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            let reaped = pool.retain(|_, metrics| metrics.last_used() < idle);
            if !reaped.removed.is_empty() {
                debug!(closed = reaped.removed.len(), "closed idle postgres connections");
            }
        }
    })
}

#[async_trait]
impl Pool for PostgresPool {
    fn dialect(&self) -> Arc<dyn Dialect> {
        self.dialect.clone()
    }

    async fn acquire(&self) -> Result<Box<dyn Connection>> {
        let client = self.pool.get().await.map_err(|e| match e {
            PoolError::Timeout(kind) => {
                Error::Connectivity(format!("timed out waiting for a postgres connection ({:?})", kind))
            }
            PoolError::Backend(e) => map_err(e, ""),
            other => Error::Connectivity(other.to_string()),
        })?;
        Ok(Box::new(PostgresConnection { client }))
    }

    async fn close(&self) {
        if let Some(reaper) = &self.reaper {
            reaper.abort();
        }
        self.pool.close();
    }
}

struct PostgresConnection {
    client: Object,
}

#[async_trait]
impl Connection for PostgresConnection {
    async fn execute(&mut self, sql: &str, params: &[Param]) -> Result<u64> {
        let values = to_sql_params(params);
        let refs: Vec<&(dyn ToSql + Sync)> = values
            .iter()
            .map(|v| v.as_ref() as &(dyn ToSql + Sync))
            .collect();
        let statement = self
            .client
            .prepare_cached(sql)
            .await
            .map_err(|e| map_err(e, sql))?;
        self.client
            .execute(&statement, &refs)
            .await
            .map_err(|e| map_err(e, sql))
    }

    async fn query(&mut self, sql: &str, params: &[Param]) -> Result<Vec<RawRow>> {
        let values = to_sql_params(params);
        let refs: Vec<&(dyn ToSql + Sync)> = values
            .iter()
            .map(|v| v.as_ref() as &(dyn ToSql + Sync))
            .collect();
        let statement = self
            .client
            .prepare_cached(sql)
            .await
            .map_err(|e| map_err(e, sql))?;
        let rows = self
            .client
            .query(&statement, &refs)
            .await
            .map_err(|e| map_err(e, sql))?;
        let columns: Arc<[String]> = statement
            .columns()
            .iter()
            .map(|c| c.name().to_string())
            .collect::<Vec<_>>()
            .into();
        Ok(rows
            .iter()
            .map(|row| {
                let cells = row
                    .columns()
                    .iter()
                    .enumerate()
                    .map(|(i, column)| extract_value(row, i, column.type_()))
                    .collect();
                RawRow::new(columns.clone(), cells)
            })
            .collect())
    }

    async fn begin(&mut self) -> Result<()> {
        self.client.batch_execute("BEGIN").await.map_err(|e| map_err(e, "BEGIN"))
    }

    async fn commit(&mut self) -> Result<()> {
        self.client.batch_execute("COMMIT").await.map_err(|e| map_err(e, "COMMIT"))
    }

    async fn rollback(&mut self) -> Result<()> {
        self.client
            .batch_execute("ROLLBACK")
            .await
            .map_err(|e| map_err(e, "ROLLBACK"))
    }
}

/// Placeholders carry an explicit cast matching the parameter kind, so each
/// value binds with its natural Rust type.
fn to_sql_params(params: &[Param]) -> Vec<Box<dyn ToSql + Sync + Send>> {
    params
        .iter()
        .map(|p| -> Box<dyn ToSql + Sync + Send> {
            match p {
                Param::Null => Box::new(Option::<String>::None),
                Param::Bool(b) => Box::new(*b),
                Param::Int(i) => Box::new(*i),
                Param::Float(f) => Box::new(*f),
                Param::Str(s) => Box::new(s.clone()),
                Param::Json(v) => Box::new(v.clone()),
                Param::Bytes(b) => Box::new(b.clone()),
            }
        })
        .collect()
}

fn extract_value(row: &Row, idx: usize, pg_type: &Type) -> CellValue {
    fn get<'a, T, F>(row: &'a Row, idx: usize, wrap: F) -> CellValue
    where
        T: tokio_postgres::types::FromSql<'a>,
        F: FnOnce(T) -> CellValue,
    {
        row.try_get::<_, Option<T>>(idx)
            .ok()
            .flatten()
            .map(wrap)
            .unwrap_or(CellValue::Null)
    }

    match *pg_type {
        Type::BOOL => get(row, idx, CellValue::Bool),
        Type::INT2 => get(row, idx, |v: i16| CellValue::Int64(i64::from(v))),
        Type::INT4 => get(row, idx, |v: i32| CellValue::Int64(i64::from(v))),
        Type::INT8 => get(row, idx, CellValue::Int64),
        Type::FLOAT4 => get(row, idx, |v: f32| CellValue::Float64(f64::from(v))),
        Type::FLOAT8 => get(row, idx, CellValue::Float64),
        Type::TEXT | Type::VARCHAR | Type::NAME | Type::CHAR | Type::BPCHAR => {
            get(row, idx, CellValue::Text)
        }
        Type::BYTEA => get(row, idx, CellValue::Bytes),
        Type::DATE => get(row, idx, |v: NaiveDate| CellValue::Text(v.to_string())),
        Type::TIME => get(row, idx, |v: NaiveTime| CellValue::Text(v.to_string())),
        Type::TIMESTAMP => get(row, idx, |v: NaiveDateTime| CellValue::Text(v.to_string())),
        Type::TIMESTAMPTZ => get(row, idx, |v: DateTime<Utc>| CellValue::Text(v.to_rfc3339())),
        Type::JSON | Type::JSONB => get(row, idx, CellValue::Json),
        _ => get(row, idx, CellValue::Text),
    }
}

/// Database errors keep their SQLSTATE category and, when the server
/// reports one, the line and column of the failure.
fn map_err(err: tokio_postgres::Error, sql: &str) -> Error {
    let Some(db) = err.as_db_error() else {
        return if err.is_closed() {
            Error::Connectivity(err.to_string())
        } else {
            Error::execution(ErrorCategory::Connection, err.to_string())
        };
    };
    let mut message = db.message().to_string();
    if let Some(ErrorPosition::Original(pos)) = db.position() {
        let (line, col) = byte_offset_to_line_col(sql, *pos as usize);
        message.push_str(&format!(" at line {}, column {}", line, col));
    }
    if let Some(detail) = db.detail() {
        message.push_str(&format!(" ({})", detail));
    }
    Error::execution(categorize_sqlstate(db.code().code()), message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Backend;
    use crate::db::SslMode;

    fn config() -> DriverConfig {
        let mut config = DriverConfig {
            backend: Backend::Postgres,
            ..Default::default()
        };
        config.server.ssl_mode = SslMode::Disable;
        config.server.username = "app".into();
        config
    }

    #[tokio::test]
    async fn test_open_does_not_connect() {
        let pool = PostgresPool::open(&config()).unwrap();
        assert_eq!(pool.dialect().name(), "postgres");
        assert!(pool.reaper.is_some());
        pool.close().await;
        assert!(pool.pool.is_closed());
    }

    #[tokio::test]
    async fn test_zero_idle_timeout_disables_reaper() {
        let mut config = config();
        config.pool.idle_timeout_secs = 0;
        let pool = PostgresPool::open(&config).unwrap();
        assert!(pool.reaper.is_none());
    }
}
