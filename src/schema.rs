//! Collection definitions and the per-(database, collection) fixed-column cache.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::debug;

use crate::dsl::FieldPath;
use crate::error::{Error, Result};
use crate::value::{FieldType, EXT_COLUMN, ID_FIELD};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: FieldType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<u32>,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

fn default_nullable() -> bool {
    true
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, ty: FieldType) -> Self {
        Self {
            name: name.into(),
            ty,
            length: None,
            nullable: true,
            default: None,
        }
    }

    pub fn length(mut self, length: u32) -> Self {
        self.length = Some(length);
        self
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn default_value(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexKey {
    pub field: String,
    #[serde(default = "default_ascending")]
    pub ascending: bool,
}

fn default_ascending() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexDef {
    pub name: String,
    pub keys: Vec<IndexKey>,
    #[serde(default)]
    pub unique: bool,
}

impl IndexDef {
    pub fn new(name: impl Into<String>, fields: &[&str]) -> Self {
        Self {
            name: name.into(),
            keys: fields
                .iter()
                .map(|f| IndexKey {
                    field: f.to_string(),
                    ascending: true,
                })
                .collect(),
            unique: false,
        }
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartitionKind {
    Range,
    List,
    Hash,
    Key,
}

impl PartitionKind {
    pub fn sql(&self) -> &'static str {
        match self {
            PartitionKind::Range => "RANGE",
            PartitionKind::List => "LIST",
            PartitionKind::Hash => "HASH",
            PartitionKind::Key => "KEY",
        }
    }
}

/// One named partition, e.g. `p0 VALUES LESS THAN (100)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionDef {
    pub name: String,
    /// Raw bound clause, e.g. `LESS THAN (100)` or `IN (1, 2)`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subpartitions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubpartitionSpec {
    pub kind: PartitionKind,
    pub columns: Vec<String>,
    #[serde(default)]
    pub linear: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u32>,
}

/// Table partitioning, only honored by MySQL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionSpec {
    pub kind: PartitionKind,
    pub columns: Vec<String>,
    /// `RANGE COLUMNS(...)` / `LIST COLUMNS(...)` instead of an expression.
    #[serde(default)]
    pub use_columns: bool,
    #[serde(default)]
    pub linear: bool,
    /// `PARTITIONS n` for HASH/KEY when no explicit definitions are given.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub partitions: Vec<PartitionDef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subpartition: Option<SubpartitionSpec>,
}

/// Everything `create_collection` accepts.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CollectionSpec {
    #[serde(default)]
    pub fixed_columns: Vec<ColumnDef>,
    #[serde(default)]
    pub indexes: Vec<IndexDef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition: Option<PartitionSpec>,
}

impl CollectionSpec {
    pub fn column(mut self, column: ColumnDef) -> Self {
        self.fixed_columns.push(column);
        self
    }

    pub fn index(mut self, index: IndexDef) -> Self {
        self.indexes.push(index);
        self
    }

    pub fn comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    pub fn partition(mut self, partition: PartitionSpec) -> Self {
        self.partition = Some(partition);
        self
    }

    pub fn validate(&self) -> Result<()> {
        let mut seen = Vec::with_capacity(self.fixed_columns.len());
        for column in &self.fixed_columns {
            if column.name == ID_FIELD || column.name == EXT_COLUMN {
                return Err(Error::invalid(format!(
                    "'{}' is reserved and cannot be declared",
                    column.name
                )));
            }
            if column.name.is_empty() || column.name.contains('.') || column.name.starts_with('$')
            {
                return Err(Error::invalid(format!(
                    "invalid column name '{}'",
                    column.name
                )));
            }
            if seen.contains(&column.name.as_str()) {
                return Err(Error::invalid(format!(
                    "column '{}' declared twice",
                    column.name
                )));
            }
            seen.push(column.name.as_str());
        }
        for index in &self.indexes {
            if index.name.is_empty() || index.keys.is_empty() {
                return Err(Error::invalid(format!(
                    "index '{}' needs a name and at least one key",
                    index.name
                )));
            }
            for key in &index.keys {
                FieldPath::parse(&key.field)?;
            }
        }
        Ok(())
    }

    pub fn schema(&self) -> CollectionSchema {
        CollectionSchema::new(self.fixed_columns.clone())
    }
}

/// The resolved fixed-column set of one collection. Any field not listed
/// here lives in the extension column.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CollectionSchema {
    pub columns: Vec<ColumnDef>,
}

impl CollectionSchema {
    pub fn new(columns: Vec<ColumnDef>) -> Self {
        Self { columns }
    }

    /// Everything in `_ext`.
    pub fn schemaless() -> Self {
        Self::default()
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn is_fixed(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    /// Fixed column a path starts in, if any. Paths into a `json` column
    /// still resolve to that column.
    pub fn fixed_for(&self, path: &FieldPath) -> Option<&ColumnDef> {
        self.column(path.root())
    }
}

type CacheKey = (String, String);

/// Read-mostly cache of resolved schemas, owned by one driver instance.
#[derive(Debug, Default)]
pub struct SchemaCache {
    entries: RwLock<HashMap<CacheKey, CollectionSchema>>,
}

impl SchemaCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, db: &str, collection: &str) -> Option<CollectionSchema> {
        let entries = self.entries.read().await;
        entries
            .get(&(db.to_string(), collection.to_string()))
            .cloned()
    }

    /// First writer wins; a racing introspection yields the same definition.
    pub async fn insert(&self, db: &str, collection: &str, schema: CollectionSchema) -> CollectionSchema {
        let mut entries = self.entries.write().await;
        let entry = entries
            .entry((db.to_string(), collection.to_string()))
            .or_insert_with(|| {
                debug!(db, collection, columns = schema.columns.len(), "cached collection schema");
                schema
            });
        entry.clone()
    }

    /// Replace an entry outright, used when a collection is (re)created.
    pub async fn put(&self, db: &str, collection: &str, schema: CollectionSchema) {
        let mut entries = self.entries.write().await;
        entries.insert((db.to_string(), collection.to_string()), schema);
    }

    pub async fn invalidate(&self, db: &str, collection: &str) {
        let mut entries = self.entries.write().await;
        entries.remove(&(db.to_string(), collection.to_string()));
    }

    pub async fn invalidate_db(&self, db: &str) {
        let mut entries = self.entries.write().await;
        entries.retain(|(entry_db, _), _| entry_db != db);
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> CollectionSchema {
        CollectionSchema::new(vec![
            ColumnDef::new("c_index", FieldType::Str).length(32),
            ColumnDef::new("c_int", FieldType::Int),
            ColumnDef::new("meta", FieldType::Json),
        ])
    }

    #[test]
    fn test_fixed_for_resolves_root() {
        let schema = sample();
        let nested = FieldPath::parse("meta.tags.0").unwrap();
        assert_eq!(schema.fixed_for(&nested).map(|c| c.ty), Some(FieldType::Json));
        assert!(schema.fixed_for(&FieldPath::parse("other").unwrap()).is_none());
    }

    #[test]
    fn test_spec_validation() {
        let spec = CollectionSpec::default().column(ColumnDef::new("_ext", FieldType::Json));
        assert!(spec.validate().is_err());
        let spec = CollectionSpec::default()
            .column(ColumnDef::new("a", FieldType::Int))
            .column(ColumnDef::new("a", FieldType::Str));
        assert!(spec.validate().is_err());
        let spec = CollectionSpec::default().index(IndexDef::new("", &["a"]));
        assert!(spec.validate().is_err());
        let spec = CollectionSpec::default()
            .column(ColumnDef::new("a", FieldType::Int))
            .index(IndexDef::new("idx_a", &["a"]).unique());
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn test_spec_deserializes_from_json() {
        let spec: CollectionSpec = serde_json::from_value(json!({
            "fixed_columns": [
                {"name": "c_index", "type": "str", "length": 64},
                {"name": "c_int", "type": "int", "nullable": false, "default": 0}
            ],
            "indexes": [{"name": "idx_ci", "keys": [{"field": "c_index"}], "unique": true}]
        }))
        .unwrap();
        assert_eq!(spec.fixed_columns[0].length, Some(64));
        assert!(spec.fixed_columns[0].nullable);
        assert!(!spec.fixed_columns[1].nullable);
        assert!(spec.indexes[0].keys[0].ascending);
    }

    #[tokio::test]
    async fn test_cache_first_writer_wins_and_invalidation() {
        let cache = SchemaCache::new();
        assert!(cache.get("main", "c").await.is_none());
        cache.insert("main", "c", sample()).await;
        let second = cache.insert("main", "c", CollectionSchema::schemaless()).await;
        assert_eq!(second, sample());

        cache.insert("main", "d", CollectionSchema::schemaless()).await;
        cache.insert("other", "c", CollectionSchema::schemaless()).await;
        cache.invalidate("main", "c").await;
        assert!(cache.get("main", "c").await.is_none());
        cache.invalidate_db("main").await;
        assert_eq!(cache.len().await, 1);
    }
}
