//! The public document API.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::info;

use crate::config::{Backend, DriverConfig};
use crate::db::open_pool;
use crate::dsl::{parse_filter, parse_update, FieldPath, GroupQuery, Query, SortKey};
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::schema::CollectionSpec;
use crate::value::{Document, Param};

pub use crate::engine::{DeleteOptions, NativeResult, Session, UpdateOptions};

/// Counts for paging through a filtered collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PageInfo {
    pub total: u64,
    pub page_size: u64,
    pub pages: u64,
}

/// Document CRUD and queries over one backend.
///
/// Collection-level calls address the current database. Calls that take a
/// `session` run inside the caller's transaction; without one each call
/// leases its own connection and commits or rolls back before returning.
#[async_trait]
pub trait DocumentDriver: Send + Sync {
    async fn create_db(&self, db: &str) -> Result<()>;

    /// Make `db` the current database. It must exist.
    async fn switch_db(&self, db: &str) -> Result<()>;

    async fn list_dbs(&self) -> Result<Vec<String>>;

    async fn drop_db(&self, db: &str) -> Result<()>;

    /// Create a collection. Repeating the call with the same spec is a no-op.
    async fn create_collection(&self, collection: &str, spec: &CollectionSpec) -> Result<()>;

    async fn list_collections(&self) -> Result<Vec<String>>;

    async fn drop_collection(&self, collection: &str) -> Result<()>;

    async fn truncate_collection(&self, collection: &str) -> Result<()>;

    /// True when every named collection exists.
    async fn collections_exists(&self, collections: &[&str]) -> Result<bool>;

    async fn start_transaction(&self) -> Result<Session>;

    async fn commit_transaction(&self, session: Session) -> Result<()>;

    async fn abort_transaction(&self, session: Session) -> Result<()>;

    async fn insert_one(&self, collection: &str, doc: Document, session: Option<&mut Session>) -> Result<String>;

    async fn insert_many(
        &self,
        collection: &str,
        docs: Vec<Document>,
        session: Option<&mut Session>,
    ) -> Result<Vec<String>>;

    async fn update(
        &self,
        collection: &str,
        filter: &Value,
        update: &Value,
        options: UpdateOptions,
        session: Option<&mut Session>,
    ) -> Result<u64>;

    async fn delete(
        &self,
        collection: &str,
        filter: &Value,
        options: DeleteOptions,
        session: Option<&mut Session>,
    ) -> Result<u64>;

    async fn query_list(&self, collection: &str, query: &Query, session: Option<&mut Session>) -> Result<Vec<Document>>;

    /// A lazy cursor yielding batches of at most `batch_size` documents.
    /// With a session every batch is read inside that transaction.
    async fn query_iter<'s>(
        &self,
        collection: &str,
        query: Query,
        batch_size: u64,
        session: Option<&'s mut Session>,
    ) -> Result<QueryCursor<'s>>;

    async fn query_count(&self, collection: &str, filter: &Value, session: Option<&mut Session>) -> Result<u64>;

    async fn query_group_by(
        &self,
        collection: &str,
        query: &GroupQuery,
        session: Option<&mut Session>,
    ) -> Result<Vec<Document>>;

    async fn query_page_info(
        &self,
        collection: &str,
        filter: &Value,
        page_size: u64,
        session: Option<&mut Session>,
    ) -> Result<PageInfo>;

    /// Page `page` (1-based) of `query`, `page_size` documents per page.
    /// Pages count from `query.skip` and stop at `query.limit`.
    async fn query_page(
        &self,
        collection: &str,
        query: &Query,
        page: u64,
        page_size: u64,
        session: Option<&mut Session>,
    ) -> Result<Vec<Document>>;

    /// Run backend-specific SQL without compiling it.
    async fn run_native_cmd(
        &self,
        sql: &str,
        params: Vec<Param>,
        is_query: bool,
        session: Option<&mut Session>,
    ) -> Result<NativeResult>;
}

/// Forward-only batches over a query, fetched with offset paging.
///
/// Without an explicit sort the cursor orders by `_id` so pages do not
/// overlap. Once exhausted it stays exhausted.
pub struct QueryCursor<'s> {
    engine: Arc<Engine>,
    session: Option<&'s mut Session>,
    db: String,
    collection: String,
    query: Query,
    batch_size: u64,
    fetched: u64,
    exhausted: bool,
}

impl QueryCursor<'_> {
    pub async fn next_batch(&mut self) -> Result<Option<Vec<Document>>> {
        if self.exhausted {
            return Ok(None);
        }
        let mut limit = self.batch_size;
        if let Some(total) = self.query.limit {
            limit = limit.min(total.saturating_sub(self.fetched));
        }
        if limit == 0 {
            self.exhausted = true;
            return Ok(None);
        }

        let mut page = self.query.clone();
        page.skip = Some(self.query.skip.unwrap_or(0).saturating_add(self.fetched));
        page.limit = Some(limit);
        let docs = self
            .engine
            .find(&self.db, &self.collection, &page, self.session.as_deref_mut())
            .await?;
        self.fetched += docs.len() as u64;
        if (docs.len() as u64) < limit {
            self.exhausted = true;
        }
        Ok(if docs.is_empty() { None } else { Some(docs) })
    }

    /// Documents handed out so far.
    pub fn fetched(&self) -> u64 {
        self.fetched
    }
}

pub struct Driver {
    engine: Arc<Engine>,
    backend: Backend,
    current_db: RwLock<String>,
}

impl Driver {
    /// Open the configured backend and make sure the initial database exists.
    pub async fn connect(config: &DriverConfig) -> Result<Self> {
        let pool = open_pool(config).await?;
        let driver = Self {
            engine: Arc::new(Engine::new(pool, config.debug)),
            backend: config.backend,
            current_db: RwLock::new(config.database().to_string()),
        };
        let db = config.database();
        if !driver.engine.list_dbs().await?.iter().any(|d| d == db) {
            driver.engine.create_db(db).await?;
        }
        info!(backend = ?config.backend, db, "driver connected");
        Ok(driver)
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    pub async fn current_db(&self) -> String {
        self.current_db.read().await.clone()
    }

    pub async fn close(&self) {
        self.engine.close().await;
    }
}

#[async_trait]
impl DocumentDriver for Driver {
    async fn create_db(&self, db: &str) -> Result<()> {
        if self.engine.list_dbs().await?.iter().any(|d| d == db) {
            return Ok(());
        }
        self.engine.create_db(db).await
    }

    async fn switch_db(&self, db: &str) -> Result<()> {
        if !self.engine.list_dbs().await?.iter().any(|d| d == db) {
            return Err(Error::NotFound(format!("database '{}'", db)));
        }
        *self.current_db.write().await = db.to_string();
        info!(db, "switched database");
        Ok(())
    }

    async fn list_dbs(&self) -> Result<Vec<String>> {
        self.engine.list_dbs().await
    }

    async fn drop_db(&self, db: &str) -> Result<()> {
        if *self.current_db.read().await == db {
            return Err(Error::invalid(format!("cannot drop the current database '{}'", db)));
        }
        self.engine.drop_db(db).await
    }

    async fn create_collection(&self, collection: &str, spec: &CollectionSpec) -> Result<()> {
        let db = self.current_db().await;
        self.engine.create_collection(&db, collection, spec).await
    }

    async fn list_collections(&self) -> Result<Vec<String>> {
        let db = self.current_db().await;
        self.engine.list_collections(&db).await
    }

    async fn drop_collection(&self, collection: &str) -> Result<()> {
        let db = self.current_db().await;
        self.engine.drop_collection(&db, collection).await
    }

    async fn truncate_collection(&self, collection: &str) -> Result<()> {
        let db = self.current_db().await;
        self.engine.truncate_collection(&db, collection).await
    }

    async fn collections_exists(&self, collections: &[&str]) -> Result<bool> {
        let existing = self.list_collections().await?;
        Ok(collections
            .iter()
            .all(|name| existing.iter().any(|e| e == name)))
    }

    async fn start_transaction(&self) -> Result<Session> {
        let mut conn = self.engine.acquire().await?;
        conn.begin().await?;
        Ok(Session::new(conn))
    }

    async fn commit_transaction(&self, session: Session) -> Result<()> {
        session.into_connection().commit().await
    }

    async fn abort_transaction(&self, session: Session) -> Result<()> {
        session.into_connection().rollback().await
    }

    async fn insert_one(&self, collection: &str, doc: Document, session: Option<&mut Session>) -> Result<String> {
        let mut ids = self.insert_many(collection, vec![doc], session).await?;
        ids.pop()
            .ok_or_else(|| Error::invalid("insert returned no id"))
    }

    async fn insert_many(
        &self,
        collection: &str,
        docs: Vec<Document>,
        session: Option<&mut Session>,
    ) -> Result<Vec<String>> {
        let db = self.current_db().await;
        self.engine.insert(&db, collection, docs, session).await
    }

    async fn update(
        &self,
        collection: &str,
        filter: &Value,
        update: &Value,
        options: UpdateOptions,
        session: Option<&mut Session>,
    ) -> Result<u64> {
        let filter = parse_filter(filter)?;
        let update = parse_update(update)?;
        let db = self.current_db().await;
        self.engine
            .update(&db, collection, &filter, &update, &options, session)
            .await
    }

    async fn delete(
        &self,
        collection: &str,
        filter: &Value,
        options: DeleteOptions,
        session: Option<&mut Session>,
    ) -> Result<u64> {
        let filter = parse_filter(filter)?;
        let db = self.current_db().await;
        self.engine
            .delete(&db, collection, &filter, &options, session)
            .await
    }

    async fn query_list(&self, collection: &str, query: &Query, session: Option<&mut Session>) -> Result<Vec<Document>> {
        let db = self.current_db().await;
        self.engine.find(&db, collection, query, session).await
    }

    async fn query_iter<'s>(
        &self,
        collection: &str,
        mut query: Query,
        batch_size: u64,
        session: Option<&'s mut Session>,
    ) -> Result<QueryCursor<'s>> {
        if batch_size == 0 {
            return Err(Error::invalid("batch size must be positive"));
        }
        if query.sort.is_empty() {
            query.sort = vec![SortKey::asc(FieldPath::id())];
        }
        Ok(QueryCursor {
            engine: self.engine.clone(),
            session,
            db: self.current_db().await,
            collection: collection.to_string(),
            query,
            batch_size,
            fetched: 0,
            exhausted: false,
        })
    }

    async fn query_count(&self, collection: &str, filter: &Value, session: Option<&mut Session>) -> Result<u64> {
        let filter = parse_filter(filter)?;
        let db = self.current_db().await;
        self.engine.count(&db, collection, &filter, None, session).await
    }

    async fn query_group_by(
        &self,
        collection: &str,
        query: &GroupQuery,
        session: Option<&mut Session>,
    ) -> Result<Vec<Document>> {
        let db = self.current_db().await;
        self.engine.group(&db, collection, query, session).await
    }

    async fn query_page_info(
        &self,
        collection: &str,
        filter: &Value,
        page_size: u64,
        session: Option<&mut Session>,
    ) -> Result<PageInfo> {
        if page_size == 0 {
            return Err(Error::invalid("page size must be positive"));
        }
        let total = self.query_count(collection, filter, session).await?;
        Ok(PageInfo {
            total,
            page_size,
            pages: total.div_ceil(page_size),
        })
    }

    async fn query_page(
        &self,
        collection: &str,
        query: &Query,
        page: u64,
        page_size: u64,
        session: Option<&mut Session>,
    ) -> Result<Vec<Document>> {
        if page == 0 || page_size == 0 {
            return Err(Error::invalid("page and page size start at 1"));
        }
        let out_of_range =
            || Error::invalid(format!("page {} of size {} is out of range", page, page_size));
        let offset = (page - 1).checked_mul(page_size).ok_or_else(out_of_range)?;
        let skip = query.skip.unwrap_or(0).checked_add(offset).ok_or_else(out_of_range)?;

        let mut limit = page_size;
        if let Some(total) = query.limit {
            limit = limit.min(total.saturating_sub(offset));
        }
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut paged = query.clone();
        paged.skip = Some(skip);
        paged.limit = Some(limit);
        if paged.sort.is_empty() {
            paged.sort = vec![SortKey::asc(FieldPath::id())];
        }
        self.query_list(collection, &paged, session).await
    }

    async fn run_native_cmd(
        &self,
        sql: &str,
        params: Vec<Param>,
        is_query: bool,
        session: Option<&mut Session>,
    ) -> Result<NativeResult> {
        self.engine.native(sql, params, is_query, session).await
    }
}
