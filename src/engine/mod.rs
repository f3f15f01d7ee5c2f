//! The pooled execution engine shared by every backend: resolve the
//! collection schema, compile through the dialect, run the plan on a leased
//! connection and normalize the rows.

mod executor;
mod normalize;

pub use executor::{run_plan, PlanRun};

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::db::{Connection, Pool};
use crate::dialect::{Dialect, Operation, Target};
use crate::dsl::{set_path, Filter, GroupQuery, Projection, Query, UpdateSpec};
use crate::error::{Error, Result};
use crate::plan::{PlanState, RowFormat, SqlPlan, Statement};
use crate::schema::{CollectionSchema, CollectionSpec, ColumnDef, SchemaCache};
use crate::value::{ensure_id, Document, FieldType, Param, EXT_COLUMN, ID_FIELD};

/// A connection held open by the caller for one transaction.
///
/// The engine runs statements on it but never begins, commits or releases it.
pub struct Session {
    conn: Box<dyn Connection>,
}

impl Session {
    pub(crate) fn new(conn: Box<dyn Connection>) -> Self {
        Self { conn }
    }

    pub(crate) fn into_connection(self) -> Box<dyn Connection> {
        self.conn
    }
}

/// Where one call's statements run.
enum Lease<'s> {
    Session(&'s mut Session),
    /// A pooled connection owned by this call, with auto-commit on success,
    /// auto-rollback on error and release on drop.
    Owned {
        conn: Box<dyn Connection>,
        in_tx: bool,
    },
}

impl Lease<'_> {
    fn conn(&mut self) -> &mut dyn Connection {
        match self {
            Lease::Session(session) => session.conn.as_mut(),
            Lease::Owned { conn, .. } => conn.as_mut(),
        }
    }

    /// Open a transaction on an owned lease. Sessions are already in one.
    async fn begin(&mut self) -> Result<()> {
        if let Lease::Owned { conn, in_tx } = self {
            if !*in_tx {
                conn.begin().await?;
                *in_tx = true;
            }
        }
        Ok(())
    }

    /// Open a transaction the first time a plan writes.
    async fn prepare(&mut self, plan: &SqlPlan) -> Result<()> {
        if plan.needs_transaction() {
            self.begin().await?;
        }
        Ok(())
    }

    async fn finish<T>(self, result: Result<T>) -> Result<T> {
        let Lease::Owned { mut conn, in_tx: true } = self else {
            return result;
        };
        match result {
            Ok(value) => {
                conn.commit().await?;
                debug!(state = ?PlanState::Committed, "owned lease finished");
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback) = conn.rollback().await {
                    warn!(error = %rollback, "rollback failed");
                }
                debug!(state = ?PlanState::RolledBack, error = %e, "owned lease finished");
                Err(e)
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateOptions {
    /// Update every match instead of exactly one.
    pub multi: bool,
    /// Insert a document when nothing matches.
    pub upsert: bool,
    pub hint: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeleteOptions {
    pub multi: bool,
    pub hint: Option<String>,
}

/// Result of a native command.
#[derive(Debug, Clone, PartialEq)]
pub enum NativeResult {
    Affected(u64),
    Rows(Vec<Document>),
}

pub struct Engine {
    pool: Arc<dyn Pool>,
    dialect: Arc<dyn Dialect>,
    schemas: SchemaCache,
    debug: bool,
}

impl Engine {
    pub fn new(pool: Arc<dyn Pool>, debug: bool) -> Self {
        let dialect = pool.dialect();
        Self {
            pool,
            dialect,
            schemas: SchemaCache::new(),
            debug,
        }
    }

    pub async fn acquire(&self) -> Result<Box<dyn Connection>> {
        self.pool.acquire().await
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn lease<'s>(&self, session: Option<&'s mut Session>) -> Result<Lease<'s>> {
        Ok(match session {
            Some(session) => Lease::Session(session),
            None => Lease::Owned {
                conn: self.pool.acquire().await?,
                in_tx: false,
            },
        })
    }

    async fn run(&self, lease: &mut Lease<'_>, plan: &SqlPlan) -> Result<PlanRun> {
        lease.prepare(plan).await?;
        run_plan(lease.conn(), plan, self.debug).await
    }

    /// Compile and run an operation on a fresh owned lease.
    async fn run_owned(&self, operation: Operation<'_>) -> Result<PlanRun> {
        let plan = self.dialect.generate_sql_plan(operation)?;
        let mut lease = self.lease(None).await?;
        let result = self.run(&mut lease, &plan).await;
        lease.finish(result).await
    }

    /// Cached schema, or introspect the live table. A collection that does
    /// not exist resolves to the schemaless set and is not cached.
    async fn schema(&self, lease: &mut Lease<'_>, db: &str, collection: &str) -> Result<CollectionSchema> {
        if let Some(schema) = self.schemas.get(db, collection).await {
            return Ok(schema);
        }
        let plan = self
            .dialect
            .generate_sql_plan(Operation::DescribeCollection { db, collection })?;
        let run = self.run(lease, &plan).await?;
        if run.rows.is_empty() {
            debug!(db, collection, "collection not found, treating as schemaless");
            return Ok(CollectionSchema::schemaless());
        }
        let mut columns = Vec::new();
        for row in &run.rows {
            let Some(name) = row.get("name").and_then(|c| c.as_text()) else {
                continue;
            };
            if name == ID_FIELD || name == EXT_COLUMN {
                continue;
            }
            let declared = row.get("type").and_then(|c| c.as_text()).unwrap_or_default();
            let ty = self.dialect.parse_column_type(declared).unwrap_or_else(|| {
                debug!(column = name, declared, "unrecognized column type, reading as str");
                FieldType::Str
            });
            columns.push(ColumnDef::new(name, ty));
        }
        Ok(self
            .schemas
            .insert(db, collection, CollectionSchema::new(columns))
            .await)
    }

    pub async fn create_db(&self, db: &str) -> Result<()> {
        self.run_owned(Operation::CreateDb { db }).await?;
        info!(db, "database created");
        Ok(())
    }

    pub async fn drop_db(&self, db: &str) -> Result<()> {
        self.run_owned(Operation::DropDb { db }).await?;
        self.schemas.invalidate_db(db).await;
        self.pool.database_dropped(db).await?;
        info!(db, "database dropped");
        Ok(())
    }

    pub async fn list_dbs(&self) -> Result<Vec<String>> {
        let run = self.run_owned(Operation::ListDbs).await?;
        Ok(normalize::names(run.rows))
    }

    pub async fn create_collection(&self, db: &str, collection: &str, spec: &CollectionSpec) -> Result<()> {
        self.run_owned(Operation::CreateCollection { db, collection, spec })
            .await?;
        self.schemas.put(db, collection, spec.schema()).await;
        info!(db, collection, indexes = spec.indexes.len(), "collection created");
        Ok(())
    }

    pub async fn drop_collection(&self, db: &str, collection: &str) -> Result<()> {
        self.run_owned(Operation::DropCollection { db, collection }).await?;
        self.schemas.invalidate(db, collection).await;
        Ok(())
    }

    pub async fn truncate_collection(&self, db: &str, collection: &str) -> Result<()> {
        self.run_owned(Operation::TruncateCollection { db, collection })
            .await?;
        Ok(())
    }

    pub async fn list_collections(&self, db: &str) -> Result<Vec<String>> {
        let run = self.run_owned(Operation::ListCollections { db }).await?;
        Ok(normalize::names(run.rows))
    }

    /// Insert documents, generating missing `_id`s. Returns the ids in order.
    pub async fn insert(
        &self,
        db: &str,
        collection: &str,
        docs: Vec<Document>,
        session: Option<&mut Session>,
    ) -> Result<Vec<String>> {
        let mut lease = self.lease(session).await?;
        let result = self.insert_on(&mut lease, db, collection, docs).await;
        lease.finish(result).await
    }

    async fn insert_on(
        &self,
        lease: &mut Lease<'_>,
        db: &str,
        collection: &str,
        mut docs: Vec<Document>,
    ) -> Result<Vec<String>> {
        let ids = docs.iter_mut().map(ensure_id).collect::<Result<Vec<_>>>()?;
        let schema = self.schema(lease, db, collection).await?;
        let target = Target::new(db, collection, &schema);
        let plan = self
            .dialect
            .generate_sql_plan(Operation::Insert { target, docs: &docs })?;
        self.run(lease, &plan).await?;
        debug!(db, collection, count = ids.len(), "inserted documents");
        Ok(ids)
    }

    /// Returns the number of matched rows, or 1 when an upsert inserted.
    pub async fn update(
        &self,
        db: &str,
        collection: &str,
        filter: &Filter,
        update: &UpdateSpec,
        options: &UpdateOptions,
        session: Option<&mut Session>,
    ) -> Result<u64> {
        if update.ops.is_empty() {
            return Err(Error::invalid("update has no operators"));
        }
        let mut lease = self.lease(session).await?;
        let result = self
            .update_on(&mut lease, db, collection, filter, update, options)
            .await;
        lease.finish(result).await
    }

    async fn update_on(
        &self,
        lease: &mut Lease<'_>,
        db: &str,
        collection: &str,
        filter: &Filter,
        update: &UpdateSpec,
        options: &UpdateOptions,
    ) -> Result<u64> {
        let schema = self.schema(lease, db, collection).await?;
        let target = Target::new(db, collection, &schema);
        let hint = options.hint.as_deref();

        let matched = match self.narrow(lease, target, filter, options.multi, hint).await? {
            Narrowed::NoMatch => 0,
            Narrowed::Filter(narrowed) => {
                let plan = self.dialect.generate_sql_plan(Operation::Update {
                    target,
                    filter: narrowed.as_ref().unwrap_or(filter),
                    update,
                    hint,
                })?;
                self.run(lease, &plan).await?.affected
            }
        };
        if matched > 0 || !options.upsert {
            return Ok(matched);
        }

        let mut doc = Document::new();
        for (path, value) in filter.equality_fields() {
            set_path(&mut doc, path, value.clone());
        }
        for (path, value) in update.upsert_values() {
            set_path(&mut doc, path, value);
        }
        let ids = self.insert_on(lease, db, collection, vec![doc]).await?;
        debug!(db, collection, id = ?ids.first(), "upserted document");
        Ok(1)
    }

    pub async fn delete(
        &self,
        db: &str,
        collection: &str,
        filter: &Filter,
        options: &DeleteOptions,
        session: Option<&mut Session>,
    ) -> Result<u64> {
        let mut lease = self.lease(session).await?;
        let result = self
            .delete_on(&mut lease, db, collection, filter, options)
            .await;
        lease.finish(result).await
    }

    async fn delete_on(
        &self,
        lease: &mut Lease<'_>,
        db: &str,
        collection: &str,
        filter: &Filter,
        options: &DeleteOptions,
    ) -> Result<u64> {
        let schema = self.schema(lease, db, collection).await?;
        let target = Target::new(db, collection, &schema);
        let hint = options.hint.as_deref();
        match self.narrow(lease, target, filter, options.multi, hint).await? {
            Narrowed::NoMatch => Ok(0),
            Narrowed::Filter(narrowed) => {
                let plan = self.dialect.generate_sql_plan(Operation::Delete {
                    target,
                    filter: narrowed.as_ref().unwrap_or(filter),
                    hint,
                })?;
                Ok(self.run(lease, &plan).await?.affected)
            }
        }
    }

    /// Single-row writes not already pinned to one `_id` are pinned to the
    /// first match, looked up inside the write's transaction.
    async fn narrow(
        &self,
        lease: &mut Lease<'_>,
        target: Target<'_>,
        filter: &Filter,
        multi: bool,
        hint: Option<&str>,
    ) -> Result<Narrowed> {
        if multi || filter.pins_id() {
            return Ok(Narrowed::Filter(None));
        }
        lease.begin().await?;
        let mut query = Query::new(filter.clone())
            .projection(Projection::Include {
                fields: Vec::new(),
                with_id: true,
            })
            .limit(1);
        query.hint = hint.map(str::to_string);
        let plan = self.dialect.generate_sql_plan(Operation::Find {
            target,
            query: &query,
            joined: &[],
        })?;
        let run = self.run(lease, &plan).await?;
        let id = run
            .rows
            .first()
            .and_then(|row| row.first())
            .and_then(|cell| cell.as_text())
            .map(str::to_string);
        Ok(match id {
            Some(id) => Narrowed::Filter(Some(Filter::by_id(id))),
            None => Narrowed::NoMatch,
        })
    }

    pub async fn find(
        &self,
        db: &str,
        collection: &str,
        query: &Query,
        session: Option<&mut Session>,
    ) -> Result<Vec<Document>> {
        let mut lease = self.lease(session).await?;
        let result = self.find_on(&mut lease, db, collection, query).await;
        lease.finish(result).await
    }

    async fn find_on(
        &self,
        lease: &mut Lease<'_>,
        db: &str,
        collection: &str,
        query: &Query,
    ) -> Result<Vec<Document>> {
        let schema = self.schema(lease, db, collection).await?;
        let mut joined = Vec::with_capacity(query.joins.len());
        for join in &query.joins {
            joined.push(self.schema(lease, db, &join.collection).await?);
        }
        let plan = self.dialect.generate_sql_plan(Operation::Find {
            target: Target::new(db, collection, &schema),
            query,
            joined: &joined,
        })?;
        let run = self.run(lease, &plan).await?;
        Ok(self.rows(run, &plan))
    }

    pub async fn count(
        &self,
        db: &str,
        collection: &str,
        filter: &Filter,
        hint: Option<&str>,
        session: Option<&mut Session>,
    ) -> Result<u64> {
        let mut lease = self.lease(session).await?;
        let result: Result<u64> = async {
            let schema = self.schema(&mut lease, db, collection).await?;
            let plan = self.dialect.generate_sql_plan(Operation::Count {
                target: Target::new(db, collection, &schema),
                filter,
                hint,
            })?;
            let run = self.run(&mut lease, &plan).await?;
            Ok(run.scalar.unwrap_or(0).max(0) as u64)
        }
        .await;
        lease.finish(result).await
    }

    pub async fn group(
        &self,
        db: &str,
        collection: &str,
        query: &GroupQuery,
        session: Option<&mut Session>,
    ) -> Result<Vec<Document>> {
        let mut lease = self.lease(session).await?;
        let result: Result<Vec<Document>> = async {
            let schema = self.schema(&mut lease, db, collection).await?;
            let plan = self.dialect.generate_sql_plan(Operation::Group {
                target: Target::new(db, collection, &schema),
                query,
            })?;
            let run = self.run(&mut lease, &plan).await?;
            Ok(self.rows(run, &plan))
        }
        .await;
        lease.finish(result).await
    }

    /// Run caller-written SQL as-is. Placeholders follow the backend's syntax.
    pub async fn native(
        &self,
        sql: &str,
        params: Vec<Param>,
        is_query: bool,
        session: Option<&mut Session>,
    ) -> Result<NativeResult> {
        let plan = if is_query {
            SqlPlan::single(Statement::query(sql, params)).rows(RowFormat::Raw)
        } else {
            SqlPlan::single(Statement::execute(sql, params))
        };
        let mut lease = self.lease(session).await?;
        let result = self.run(&mut lease, &plan).await;
        let run = lease.finish(result).await?;
        Ok(if is_query {
            NativeResult::Rows(normalize::raw(run.rows))
        } else {
            NativeResult::Affected(run.affected)
        })
    }

    fn rows(&self, run: PlanRun, plan: &SqlPlan) -> Vec<Document> {
        match &plan.row_format {
            RowFormat::Documents(format) => normalize::documents(run.rows, format),
            _ => normalize::raw(run.rows),
        }
    }
}

enum Narrowed {
    /// Nothing matched the single-row lookup.
    NoMatch,
    /// Run with this filter, or the caller's when `None`.
    Filter(Option<Filter>),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use serde_json::json;

    use crate::config::DriverConfig;
    use crate::db::{RawRow, SqlitePool};
    use crate::dsl::parse_filter;

    /// Logs every statement and transaction boundary sent to SQLite.
    struct RecordingPool {
        inner: SqlitePool,
        log: Arc<Mutex<Vec<String>>>,
    }

    struct RecordingConnection {
        inner: Box<dyn Connection>,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl RecordingConnection {
        fn record(&self, entry: &str) {
            self.log.lock().unwrap().push(entry.to_string());
        }
    }

    #[async_trait]
    impl Connection for RecordingConnection {
        async fn execute(&mut self, sql: &str, params: &[Param]) -> Result<u64> {
            self.record(sql);
            self.inner.execute(sql, params).await
        }

        async fn query(&mut self, sql: &str, params: &[Param]) -> Result<Vec<RawRow>> {
            self.record(sql);
            self.inner.query(sql, params).await
        }

        async fn begin(&mut self) -> Result<()> {
            self.record("BEGIN");
            self.inner.begin().await
        }

        async fn commit(&mut self) -> Result<()> {
            self.record("COMMIT");
            self.inner.commit().await
        }

        async fn rollback(&mut self) -> Result<()> {
            self.record("ROLLBACK");
            self.inner.rollback().await
        }
    }

    #[async_trait]
    impl Pool for RecordingPool {
        fn dialect(&self) -> Arc<dyn Dialect> {
            self.inner.dialect()
        }

        async fn acquire(&self) -> Result<Box<dyn Connection>> {
            Ok(Box::new(RecordingConnection {
                inner: self.inner.acquire().await?,
                log: self.log.clone(),
            }))
        }

        async fn close(&self) {
            self.inner.close().await;
        }
    }

    async fn engine_with_docs() -> (Engine, Arc<Mutex<Vec<String>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pool = RecordingPool {
            inner: SqlitePool::open(&DriverConfig::sqlite_memory()).unwrap(),
            log: log.clone(),
        };
        let engine = Engine::new(Arc::new(pool), false);
        engine
            .create_collection("main", "c", &CollectionSpec::default())
            .await
            .unwrap();
        let docs = (0..3)
            .map(|i| {
                let mut doc = Document::new();
                doc.insert("n".into(), json!(i));
                doc
            })
            .collect();
        engine.insert("main", "c", docs, None).await.unwrap();
        log.lock().unwrap().clear();
        (engine, log)
    }

    fn position(log: &[String], pred: impl Fn(&str) -> bool) -> usize {
        log.iter()
            .position(|entry| pred(entry.as_str()))
            .unwrap_or_else(|| panic!("no matching entry in {:?}", log))
    }

    #[tokio::test]
    async fn test_single_row_lookup_runs_inside_the_write_transaction() {
        let (engine, log) = engine_with_docs().await;
        let filter = parse_filter(&json!({"n": {"$gte": 0}})).unwrap();
        let update = crate::dsl::parse_update(&json!({"$set": {"z": 1}})).unwrap();
        let affected = engine
            .update("main", "c", &filter, &update, &UpdateOptions::default(), None)
            .await
            .unwrap();
        assert_eq!(affected, 1);

        let log = log.lock().unwrap().clone();
        let begin = position(&log, |e| e == "BEGIN");
        let lookup = position(&log, |e| e.starts_with("SELECT"));
        let write = position(&log, |e| e.starts_with("UPDATE"));
        let commit = position(&log, |e| e == "COMMIT");
        assert!(begin < lookup && lookup < write && write < commit, "{:?}", log);
    }

    #[tokio::test]
    async fn test_delete_over_id_range_removes_one_row() {
        let (engine, log) = engine_with_docs().await;
        let filter = parse_filter(&json!({"_id": {"$ne": "none"}})).unwrap();
        let options = DeleteOptions::default();
        assert_eq!(engine.delete("main", "c", &filter, &options, None).await.unwrap(), 1);

        let log = log.lock().unwrap().clone();
        let begin = position(&log, |e| e == "BEGIN");
        let lookup = position(&log, |e| e.starts_with("SELECT"));
        assert!(begin < lookup, "{:?}", log);
        assert_eq!(log.iter().filter(|e| e.starts_with("DELETE")).count(), 1);
        assert_eq!(engine.count("main", "c", &Filter::all(), None, None).await.unwrap(), 2);
    }
}
