//! Single-connection SQLite pool. Every call runs on the blocking thread
//! pool while holding the one connection.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use rusqlite::functions::FunctionFlags;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::ErrorCode;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info};

use super::{CellValue, Connection, ErrorCategory, Pool, RawRow};
use crate::config::DriverConfig;
use crate::dialect::{Dialect, SqliteDialect};
use crate::error::{Error, Result};
use crate::value::Param;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub struct SqlitePool {
    conn: Arc<Mutex<rusqlite::Connection>>,
    dialect: Arc<SqliteDialect>,
    attach_dir: Option<PathBuf>,
    acquire_timeout: Duration,
}

impl SqlitePool {
    pub fn open(config: &DriverConfig) -> Result<Self> {
        let conn = match &config.sqlite.path {
            Some(path) => rusqlite::Connection::open(path),
            None => rusqlite::Connection::open_in_memory(),
        }
        .map_err(|e| Error::Connectivity(format!("failed to open sqlite database: {}", e)))?;
        register_regexp(&conn)?;

        let dialect = SqliteDialect::new(config.sqlite.attach_dir.clone());
        if let Some(dir) = &config.sqlite.attach_dir {
            std::fs::create_dir_all(dir).map_err(|e| {
                Error::Config(format!("failed to create attach directory {}: {}", dir.display(), e))
            })?;
            attach_existing(&conn, &dialect, dir, config.sqlite.path.as_deref())?;
        }

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            dialect: Arc::new(dialect),
            attach_dir: config.sqlite.attach_dir.clone(),
            acquire_timeout: config.pool.acquire_timeout(),
        })
    }
}

/// `X REGEXP Y` calls `regexp(Y, X)`. Compiled patterns are cached per
/// statement; non-text values never match.
fn register_regexp(conn: &rusqlite::Connection) -> Result<()> {
    conn.create_scalar_function(
        "regexp",
        2,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            let pattern: Arc<Regex> = ctx.get_or_create_aux(0, |vr| -> std::result::Result<_, BoxError> {
                Ok(Regex::new(vr.as_str()?)?)
            })?;
            let matched = match ctx.get_raw(1) {
                ValueRef::Text(text) => std::str::from_utf8(text)
                    .map(|s| pattern.is_match(s))
                    .unwrap_or(false),
                _ => false,
            };
            Ok(matched)
        },
    )
    .map_err(map_err)
}

/// Re-attach every `<name>.db` file left in the attach directory.
fn attach_existing(
    conn: &rusqlite::Connection,
    dialect: &SqliteDialect,
    dir: &Path,
    main_path: Option<&Path>,
) -> Result<()> {
    let entries = std::fs::read_dir(dir)
        .map_err(|e| Error::Config(format!("failed to read {}: {}", dir.display(), e)))?;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("db") || Some(path.as_path()) == main_path {
            continue;
        }
        let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        if name.eq_ignore_ascii_case("main") || name.eq_ignore_ascii_case("temp") {
            continue;
        }
        conn.execute(
            &format!("ATTACH DATABASE ?1 AS {}", dialect.quote_ident(name)),
            [path.to_string_lossy().as_ref()],
        )
        .map_err(map_err)?;
        info!(db = name, "attached existing database");
    }
    Ok(())
}

#[async_trait]
impl Pool for SqlitePool {
    fn dialect(&self) -> Arc<dyn Dialect> {
        self.dialect.clone()
    }

    async fn acquire(&self) -> Result<Box<dyn Connection>> {
        let guard = tokio::time::timeout(self.acquire_timeout, self.conn.clone().lock_owned())
            .await
            .map_err(|_| {
                Error::Connectivity(format!(
                    "timed out after {:?} waiting for the sqlite connection",
                    self.acquire_timeout
                ))
            })?;
        Ok(Box::new(SqliteConnection { guard: Some(guard) }))
    }

    async fn database_dropped(&self, db: &str) -> Result<()> {
        let Some(dir) = &self.attach_dir else {
            return Ok(());
        };
        let path = dir.join(format!("{}.db", db));
        match std::fs::remove_file(&path) {
            Ok(()) => {
                debug!(path = %path.display(), "removed database file");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::execution(
                ErrorCategory::Execution,
                format!("failed to remove {}: {}", path.display(), e),
            )),
        }
    }

    async fn close(&self) {
        debug!("sqlite pool closed");
    }
}

struct SqliteConnection {
    guard: Option<OwnedMutexGuard<rusqlite::Connection>>,
}

impl SqliteConnection {
    /// Move the connection onto a blocking thread for one call.
    async fn run<T, F>(&mut self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut rusqlite::Connection) -> Result<T> + Send + 'static,
    {
        let mut guard = self
            .guard
            .take()
            .ok_or_else(|| Error::Connectivity("sqlite connection was lost".into()))?;
        let (guard, result) = tokio::task::spawn_blocking(move || {
            let result = f(&mut guard);
            (guard, result)
        })
        .await
        .map_err(|e| Error::Connectivity(format!("sqlite worker failed: {}", e)))?;
        self.guard = Some(guard);
        result
    }

    async fn batch(&mut self, sql: &'static str) -> Result<()> {
        self.run(move |conn| conn.execute_batch(sql).map_err(map_err)).await
    }
}

#[async_trait]
impl Connection for SqliteConnection {
    async fn execute(&mut self, sql: &str, params: &[Param]) -> Result<u64> {
        let sql = sql.to_string();
        let values = to_values(params);
        self.run(move |conn| {
            // Cached statements may still reference the schema being detached.
            if sql.starts_with("DETACH") {
                conn.flush_prepared_statement_cache();
            }
            let mut stmt = conn.prepare_cached(&sql).map_err(map_err)?;
            let affected = stmt
                .execute(rusqlite::params_from_iter(values.iter()))
                .map_err(map_err)?;
            Ok(affected as u64)
        })
        .await
    }

    async fn query(&mut self, sql: &str, params: &[Param]) -> Result<Vec<RawRow>> {
        let sql = sql.to_string();
        let values = to_values(params);
        self.run(move |conn| {
            let mut stmt = conn.prepare_cached(&sql).map_err(map_err)?;
            let columns: Arc<[String]> = stmt
                .column_names()
                .into_iter()
                .map(String::from)
                .collect::<Vec<_>>()
                .into();
            let width = columns.len();
            let mut rows = stmt
                .query(rusqlite::params_from_iter(values.iter()))
                .map_err(map_err)?;
            let mut out = Vec::new();
            while let Some(row) = rows.next().map_err(map_err)? {
                let mut cells = Vec::with_capacity(width);
                for i in 0..width {
                    cells.push(cell(row.get_ref(i).map_err(map_err)?));
                }
                out.push(RawRow::new(columns.clone(), cells));
            }
            Ok(out)
        })
        .await
    }

    async fn begin(&mut self) -> Result<()> {
        self.batch("BEGIN").await
    }

    async fn commit(&mut self) -> Result<()> {
        self.batch("COMMIT").await
    }

    async fn rollback(&mut self) -> Result<()> {
        self.batch("ROLLBACK").await
    }
}

fn to_values(params: &[Param]) -> Vec<SqlValue> {
    params
        .iter()
        .map(|p| match p {
            Param::Null => SqlValue::Null,
            Param::Bool(b) => SqlValue::Integer(i64::from(*b)),
            Param::Int(i) => SqlValue::Integer(*i),
            Param::Float(f) => SqlValue::Real(*f),
            Param::Str(s) => SqlValue::Text(s.clone()),
            Param::Json(v) => SqlValue::Text(v.to_string()),
            Param::Bytes(b) => SqlValue::Blob(b.clone()),
        })
        .collect()
}

fn cell(value: ValueRef<'_>) -> CellValue {
    match value {
        ValueRef::Null => CellValue::Null,
        ValueRef::Integer(i) => CellValue::Int64(i),
        ValueRef::Real(f) => CellValue::Float64(f),
        ValueRef::Text(t) => CellValue::Text(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => CellValue::Bytes(b.to_vec()),
    }
}

fn map_err(err: rusqlite::Error) -> Error {
    let category = match &err {
        rusqlite::Error::SqliteFailure(failure, message) => match failure.code {
            ErrorCode::ConstraintViolation | ErrorCode::TypeMismatch | ErrorCode::TooBig => {
                ErrorCategory::Execution
            }
            ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => ErrorCategory::Transaction,
            ErrorCode::CannotOpen | ErrorCode::NotADatabase | ErrorCode::SystemIoFailure => {
                ErrorCategory::Connection
            }
            _ => categorize_message(message.as_deref().unwrap_or_default()),
        },
        rusqlite::Error::InvalidParameterCount(..) | rusqlite::Error::InvalidColumnIndex(_) => {
            ErrorCategory::Semantic
        }
        _ => ErrorCategory::Unknown,
    };
    Error::execution(category, err.to_string())
}

/// SQLite reports most compile errors as a generic SQLITE_ERROR.
fn categorize_message(message: &str) -> ErrorCategory {
    if message.contains("syntax error") || message.contains("incomplete input") {
        ErrorCategory::Syntax
    } else if message.starts_with("no such") || message.contains("ambiguous") {
        ErrorCategory::Semantic
    } else if message.contains("transaction") {
        ErrorCategory::Transaction
    } else {
        ErrorCategory::Execution
    }
}
