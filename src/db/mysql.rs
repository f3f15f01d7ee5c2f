use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mysql_async::prelude::Queryable;
use mysql_async::{Conn, OptsBuilder, PoolConstraints, PoolOpts, Row, SslOpts, Value as MyValue};
use tracing::debug;

use super::{categorize_sqlstate, CellValue, Connection, ErrorCategory, Pool, RawRow};
use crate::config::DriverConfig;
use crate::db::SslMode;
use crate::dialect::{Dialect, MySqlDialect};
use crate::error::{Error, Result};
use crate::value::Param;

pub struct MySqlPool {
    pool: mysql_async::Pool,
    dialect: Arc<MySqlDialect>,
    acquire_timeout: Duration,
    ping: bool,
}

impl MySqlPool {
    /// Build the pool. No connection is made until the first `acquire`.
    pub fn open(config: &DriverConfig) -> Result<Self> {
        let server = &config.server;
        let constraints = PoolConstraints::new(config.pool.min_size, config.pool.max_size.max(1))
            .ok_or_else(|| {
                Error::Config(format!(
                    "pool min_size {} exceeds max_size {}",
                    config.pool.min_size, config.pool.max_size
                ))
            })?;
        let pool_opts = PoolOpts::default()
            .with_constraints(constraints)
            .with_inactive_connection_ttl(config.pool.idle_timeout());

        let mut opts = OptsBuilder::default()
            .ip_or_hostname(server.host.clone())
            .tcp_port(config.port())
            .user(Some(server.username.clone()))
            .pass(Some(server.password.clone()))
            .client_found_rows(true)
            .pool_opts(pool_opts);
        if let Some(ssl) = ssl_opts(config)? {
            opts = opts.ssl_opts(ssl);
        }

        debug!(target = %server.display_string(config.database()), "mysql pool configured");
        Ok(Self {
            pool: mysql_async::Pool::new(opts),
            dialect: Arc::new(MySqlDialect::new()),
            acquire_timeout: config.pool.acquire_timeout(),
            ping: config.pool.ping,
        })
    }
}

/// `Prefer` is treated as `Disable`; the client has no opportunistic TLS.
fn ssl_opts(config: &DriverConfig) -> Result<Option<SslOpts>> {
    let server = &config.server;
    let mode = server.ssl_mode;
    if matches!(mode, SslMode::Disable | SslMode::Prefer) {
        return Ok(None);
    }
    let mut ssl = SslOpts::default();
    if mode.verifies() {
        if let Some(path) = &server.ca_cert_path {
            // Fail early on an unreadable bundle rather than on first connect.
            server.ca_certificates()?;
            ssl = ssl.with_root_certs(vec![PathBuf::from(path).into()]);
        }
        ssl = ssl.with_danger_skip_domain_validation(mode == SslMode::VerifyCa);
    } else {
        ssl = ssl
            .with_danger_accept_invalid_certs(true)
            .with_danger_skip_domain_validation(true);
    }
    Ok(Some(ssl))
}

#[async_trait]
impl Pool for MySqlPool {
    fn dialect(&self) -> Arc<dyn Dialect> {
        self.dialect.clone()
    }

    async fn acquire(&self) -> Result<Box<dyn Connection>> {
        let mut conn = tokio::time::timeout(self.acquire_timeout, self.pool.get_conn())
            .await
            .map_err(|_| {
                Error::Connectivity(format!(
                    "timed out after {:?} waiting for a mysql connection",
                    self.acquire_timeout
                ))
            })?
            .map_err(map_err)?;
        if self.ping {
            conn.ping().await.map_err(map_err)?;
        }
        Ok(Box::new(MySqlConnection { conn }))
    }

    async fn close(&self) {
        if let Err(e) = self.pool.clone().disconnect().await {
            debug!(error = %e, "mysql pool disconnect failed");
        }
    }
}

struct MySqlConnection {
    conn: Conn,
}

#[async_trait]
impl Connection for MySqlConnection {
    async fn execute(&mut self, sql: &str, params: &[Param]) -> Result<u64> {
        if params.is_empty() {
            self.conn.query_drop(sql).await.map_err(map_err)?;
        } else {
            self.conn
                .exec_drop(sql, to_params(params))
                .await
                .map_err(map_err)?;
        }
        Ok(self.conn.affected_rows())
    }

    async fn query(&mut self, sql: &str, params: &[Param]) -> Result<Vec<RawRow>> {
        let rows: Vec<Row> = if params.is_empty() {
            self.conn.query(sql).await.map_err(map_err)?
        } else {
            self.conn
                .exec(sql, to_params(params))
                .await
                .map_err(map_err)?
        };
        let Some(first) = rows.first() else {
            return Ok(Vec::new());
        };
        let columns: Arc<[String]> = first
            .columns_ref()
            .iter()
            .map(|c| c.name_str().into_owned())
            .collect::<Vec<_>>()
            .into();
        Ok(rows
            .into_iter()
            .map(|row| {
                let cells = row
                    .unwrap_raw()
                    .into_iter()
                    .map(|value| value.map(cell).unwrap_or(CellValue::Null))
                    .collect();
                RawRow::new(columns.clone(), cells)
            })
            .collect())
    }

    async fn begin(&mut self) -> Result<()> {
        self.conn.query_drop("START TRANSACTION").await.map_err(map_err)
    }

    async fn commit(&mut self) -> Result<()> {
        self.conn.query_drop("COMMIT").await.map_err(map_err)
    }

    async fn rollback(&mut self) -> Result<()> {
        self.conn.query_drop("ROLLBACK").await.map_err(map_err)
    }
}

fn to_params(params: &[Param]) -> mysql_async::Params {
    mysql_async::Params::Positional(
        params
            .iter()
            .map(|p| match p {
                Param::Null => MyValue::NULL,
                Param::Bool(b) => MyValue::Int(i64::from(*b)),
                Param::Int(i) => MyValue::Int(*i),
                Param::Float(f) => MyValue::Double(*f),
                Param::Str(s) => MyValue::Bytes(s.clone().into_bytes()),
                Param::Json(v) => MyValue::Bytes(v.to_string().into_bytes()),
                Param::Bytes(b) => MyValue::Bytes(b.clone()),
            })
            .collect(),
    )
}

/// The text protocol delivers everything as bytes; numbers are recovered
/// later from the column's logical type.
fn cell(value: MyValue) -> CellValue {
    match value {
        MyValue::NULL => CellValue::Null,
        MyValue::Int(i) => CellValue::Int64(i),
        MyValue::UInt(u) => match i64::try_from(u) {
            Ok(i) => CellValue::Int64(i),
            Err(_) => CellValue::Float64(u as f64),
        },
        MyValue::Float(f) => CellValue::Float64(f64::from(f)),
        MyValue::Double(f) => CellValue::Float64(f),
        MyValue::Bytes(b) => match String::from_utf8(b) {
            Ok(s) => CellValue::Text(s),
            Err(e) => CellValue::Bytes(e.into_bytes()),
        },
        MyValue::Date(y, mo, d, h, mi, s, us) => {
            let mut text = format!("{:04}-{:02}-{:02} {:02}:{:02}:{:02}", y, mo, d, h, mi, s);
            if us > 0 {
                text.push_str(&format!(".{:06}", us));
            }
            CellValue::Text(text)
        }
        MyValue::Time(negative, days, h, mi, s, us) => {
            let hours = days * 24 + u32::from(h);
            let mut text = format!(
                "{}{:02}:{:02}:{:02}",
                if negative { "-" } else { "" },
                hours,
                mi,
                s
            );
            if us > 0 {
                text.push_str(&format!(".{:06}", us));
            }
            CellValue::Text(text)
        }
    }
}

fn map_err(err: mysql_async::Error) -> Error {
    match err {
        mysql_async::Error::Server(server) => Error::execution(
            categorize_sqlstate(&server.state),
            format!("{} (code {})", server.message, server.code),
        ),
        mysql_async::Error::Driver(e) => Error::Connectivity(e.to_string()),
        mysql_async::Error::Io(e) => Error::Connectivity(e.to_string()),
        other => Error::execution(ErrorCategory::Unknown, other.to_string()),
    }
}
