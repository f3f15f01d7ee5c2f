//! docsql: a document-style CRUD and query API compiled to SQL for SQLite,
//! MySQL and PostgreSQL.
//!
//! Documents are JSON objects with a string `_id`. Each collection is a
//! table holding `_id`, optional typed fixed columns and an `_ext` JSON blob
//! for every other field.

pub mod config;
pub mod db;
pub mod dialect;
pub mod driver;
pub mod dsl;
pub mod engine;
pub mod error;
pub mod plan;
pub mod schema;
pub mod value;

pub use config::{Backend, DriverConfig};
pub use driver::{DeleteOptions, DocumentDriver, Driver, NativeResult, PageInfo, QueryCursor, Session, UpdateOptions};
pub use error::{Error, Result};
pub use value::{Document, Param};
