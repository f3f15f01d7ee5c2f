use std::path::PathBuf;

use serde_json::Value;

use super::{dollar_path, Dialect, HintTarget, Params, PlaceholderStyle};
use crate::dsl::{Comparison, PathSegment, RegexOp};
use crate::error::{Error, Result};
use crate::plan::{RowFormat, SqlPlan, Statement};
use crate::schema::{CollectionSpec, ColumnDef};
use crate::value::{FieldType, Param, ID_FIELD};

/// SQLite with the JSON1 functions. Databases are attached files, or
/// in-memory databases when no attach directory is configured.
#[derive(Debug, Clone, Default)]
pub struct SqliteDialect {
    attach_dir: Option<PathBuf>,
}

impl SqliteDialect {
    pub fn new(attach_dir: Option<PathBuf>) -> Self {
        Self { attach_dir }
    }

    /// File backing an attached database.
    pub fn database_path(&self, db: &str) -> String {
        match &self.attach_dir {
            Some(dir) => dir.join(format!("{}.db", db)).to_string_lossy().into_owned(),
            None => ":memory:".to_string(),
        }
    }

    /// JSON types a literal may be compared with.
    fn comparable_types(value: &Value) -> Option<&'static str> {
        match value {
            Value::Number(_) => Some("'integer', 'real'"),
            Value::String(_) => Some("'text'"),
            Value::Bool(_) => Some("'true', 'false'"),
            _ => None,
        }
    }

    fn path_literal(&self, path: &[PathSegment]) -> String {
        self.quote_literal(&dollar_path(path))
    }

    /// Inline `(?i)` flag, since REGEXP takes no options.
    fn pattern(regex: &RegexOp) -> String {
        if regex.case_insensitive {
            format!("(?i){}", regex.pattern)
        } else {
            regex.pattern.clone()
        }
    }
}

fn check_db_name(db: &str) -> Result<()> {
    if db.eq_ignore_ascii_case("main") || db.eq_ignore_ascii_case("temp") {
        return Err(Error::invalid(format!("database '{}' is built in", db)));
    }
    Ok(())
}

impl Dialect for SqliteDialect {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn placeholder_style(&self) -> PlaceholderStyle {
        PlaceholderStyle::Question
    }

    fn quote_ident(&self, ident: &str) -> String {
        format!("\"{}\"", ident.replace('"', "\"\""))
    }

    fn column_type(&self, column: &ColumnDef) -> String {
        match column.ty {
            FieldType::Str => match column.length {
                Some(n) => format!("VARCHAR({})", n),
                None => "TEXT".to_string(),
            },
            FieldType::Int => "INTEGER".to_string(),
            FieldType::Float => "REAL".to_string(),
            FieldType::Bool => "BOOLEAN".to_string(),
            FieldType::Json => "JSON".to_string(),
        }
    }

    fn json_type(&self) -> &'static str {
        "JSON"
    }

    fn parse_column_type(&self, declared: &str) -> Option<FieldType> {
        let declared = declared.trim().to_ascii_uppercase();
        let base = declared.split('(').next().unwrap_or("").trim();
        match base {
            "VARCHAR" | "TEXT" | "CHAR" | "CLOB" | "NVARCHAR" => Some(FieldType::Str),
            "INTEGER" | "INT" | "BIGINT" => Some(FieldType::Int),
            "REAL" | "DOUBLE" | "FLOAT" | "NUMERIC" => Some(FieldType::Float),
            "BOOLEAN" | "BOOL" => Some(FieldType::Bool),
            "JSON" => Some(FieldType::Json),
            _ => None,
        }
    }

    fn empty_object(&self) -> &'static str {
        "'{}'"
    }

    fn json_value(&self, column: &str, path: &[PathSegment]) -> String {
        format!("{} -> {}", column, self.path_literal(path))
    }

    fn json_sort_key(&self, column: &str, path: &[PathSegment]) -> String {
        format!("json_extract({}, {})", column, self.path_literal(path))
    }

    fn json_text(&self, column: &str, path: &[PathSegment]) -> String {
        format!("{} ->> {}", column, self.path_literal(path))
    }

    fn json_number(&self, column: &str, path: &[PathSegment]) -> String {
        let p = self.path_literal(path);
        format!(
            "CASE WHEN json_type({column}, {p}) IN ('integer', 'real') THEN json_extract({column}, {p}) END"
        )
    }

    fn json_copy(&self, column: &str, path: &[PathSegment]) -> String {
        format!("json({})", self.json_value(column, path))
    }

    fn json_exists(&self, column: &str, path: &[PathSegment]) -> String {
        format!("json_type({}, {}) IS NOT NULL", column, self.path_literal(path))
    }

    fn json_eq(&self, column: &str, path: &[PathSegment], value: &Value, params: &mut Params) -> String {
        let p = self.path_literal(path);
        match value {
            Value::Object(_) | Value::Array(_) => format!(
                "(json_type({column}, {p}) IN ('object', 'array') AND json_extract({column}, {p}) = json({}))",
                params.push(Param::json_text(value))
            ),
            other => {
                let types = Self::comparable_types(other).unwrap_or("'null'");
                format!(
                    "(json_type({column}, {p}) IN ({types}) AND json_extract({column}, {p}) = {})",
                    params.push(Param::from_json(other))
                )
            }
        }
    }

    fn json_is_null(&self, column: &str, path: &[PathSegment]) -> String {
        format!(
            "COALESCE(json_type({}, {}), 'null') = 'null'",
            column,
            self.path_literal(path)
        )
    }

    /// Walks the value with `json_each`, so a scalar matches directly and an
    /// array matches when any element does. Object members never match.
    fn json_compare(
        &self,
        column: &str,
        path: &[PathSegment],
        op: Comparison,
        value: &Value,
        params: &mut Params,
    ) -> String {
        let Some(types) = Self::comparable_types(value) else {
            return "1 = 0".to_string();
        };
        format!(
            "EXISTS (SELECT 1 FROM json_each({}, {}) AS je WHERE (je.key IS NULL OR typeof(je.key) = 'integer') AND je.type IN ({}) AND je.value {} {})",
            column,
            self.path_literal(path),
            types,
            op.sql(),
            params.push(Param::from_json(value))
        )
    }

    fn json_regex(&self, column: &str, path: &[PathSegment], regex: &RegexOp, params: &mut Params) -> String {
        let p = self.path_literal(path);
        format!(
            "(json_type({column}, {p}) = 'text' AND json_extract({column}, {p}) REGEXP {})",
            params.push(Param::Str(Self::pattern(regex)))
        )
    }

    fn regex_match(&self, expr: &str, regex: &RegexOp, params: &mut Params) -> String {
        format!("{} REGEXP {}", expr, params.push(Param::Str(Self::pattern(regex))))
    }

    fn json_set(&self, acc: &str, path: &[PathSegment], value: &str) -> String {
        format!("json_set({}, {}, {})", acc, self.path_literal(path), value)
    }

    fn json_remove(&self, acc: &str, path: &[PathSegment]) -> String {
        format!("json_remove({}, {})", acc, self.path_literal(path))
    }

    fn json_set_value(&self, value: &Value, params: &mut Params) -> String {
        match value {
            Value::String(s) => params.push(Param::Str(s.clone())),
            other => format!("json({})", params.push(Param::json_text(other))),
        }
    }

    fn creates_parents(&self) -> bool {
        true
    }

    fn limit_clause(&self, limit: Option<u64>, skip: Option<u64>) -> String {
        match (limit, skip) {
            (None, None) => String::new(),
            (Some(limit), None) => format!("LIMIT {}", limit),
            (Some(limit), Some(skip)) => format!("LIMIT {} OFFSET {}", limit, skip),
            (None, Some(skip)) => format!("LIMIT -1 OFFSET {}", skip),
        }
    }

    fn index_hint(&self, collection: &str, hint: &str, _target: HintTarget) -> Option<String> {
        Some(format!(
            "INDEXED BY {}",
            self.quote_ident(&index_name(collection, hint))
        ))
    }

    fn create_db(&self, db: &str) -> Result<SqlPlan> {
        check_db_name(db)?;
        let sql = format!("ATTACH DATABASE ? AS {}", self.quote_ident(db));
        Ok(SqlPlan::single(Statement::execute(sql, vec![Param::Str(self.database_path(db))])).non_transactional())
    }

    fn drop_db(&self, db: &str) -> Result<SqlPlan> {
        check_db_name(db)?;
        let sql = format!("DETACH DATABASE {}", self.quote_ident(db));
        Ok(SqlPlan::single(Statement::execute(sql, vec![])).non_transactional())
    }

    fn list_dbs(&self) -> Result<SqlPlan> {
        Ok(SqlPlan::single(Statement::query(
            "SELECT name FROM pragma_database_list WHERE name <> 'temp' ORDER BY seq",
            vec![],
        ))
        .rows(RowFormat::Raw))
    }

    fn create_collection(&self, db: &str, collection: &str, spec: &CollectionSpec) -> Result<SqlPlan> {
        let mut columns = self.table_columns(spec)?;
        columns.push(format!("PRIMARY KEY ({})", self.quote_ident(ID_FIELD)));
        let mut plan = SqlPlan::single(Statement::execute(
            format!(
                "CREATE TABLE IF NOT EXISTS {} ({})",
                self.table(db, collection),
                columns.join(", ")
            ),
            vec![],
        ));
        let schema = spec.schema();
        for index in &spec.indexes {
            plan.add(Statement::execute(
                format!(
                    "CREATE {}INDEX IF NOT EXISTS {}.{} ON {} ({})",
                    if index.unique { "UNIQUE " } else { "" },
                    self.quote_ident(db),
                    self.quote_ident(&index_name(collection, &index.name)),
                    self.quote_ident(collection),
                    self.index_columns(&schema, index)?
                ),
                vec![],
            ));
        }
        Ok(plan)
    }

    fn truncate_collection(&self, db: &str, collection: &str) -> Result<SqlPlan> {
        Ok(SqlPlan::single(Statement::execute(
            format!("DELETE FROM {}", self.table(db, collection)),
            vec![],
        )))
    }

    fn list_collections(&self, db: &str) -> Result<SqlPlan> {
        let sql = format!(
            "SELECT name FROM {}.sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite\\_%' ESCAPE '\\' ORDER BY name",
            self.quote_ident(db)
        );
        Ok(SqlPlan::single(Statement::query(sql, vec![])).rows(RowFormat::Raw))
    }

    fn describe_collection(&self, db: &str, collection: &str) -> Result<SqlPlan> {
        Ok(SqlPlan::single(Statement::query(
            "SELECT name, type FROM pragma_table_info(?, ?) ORDER BY cid",
            vec![Param::Str(collection.to_string()), Param::Str(db.to_string())],
        ))
        .rows(RowFormat::Raw))
    }
}

/// Index names share one namespace per database, so they carry the collection.
fn index_name(collection: &str, index: &str) -> String {
    format!("{}_{}", collection, index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::{Operation, Scope, Target};
    use crate::dsl::{parse_filter, parse_update, FieldPath, Filter, Query, SortKey};
    use crate::schema::{CollectionSchema, IndexDef};
    use serde_json::json;

    fn schema() -> CollectionSchema {
        CollectionSchema::new(vec![
            ColumnDef::new("c_index", FieldType::Str).length(32),
            ColumnDef::new("c_int", FieldType::Int),
        ])
    }

    fn where_sql(filter: serde_json::Value) -> (String, Vec<Param>) {
        let dialect = SqliteDialect::default();
        let schema = schema();
        let mut params = dialect.new_params();
        let sql = dialect
            .compile_filter(&Scope::new(&schema), &parse_filter(&filter).unwrap(), &mut params)
            .unwrap()
            .unwrap();
        (sql, params.into_vec())
    }

    #[test]
    fn test_ext_equality_is_type_guarded() {
        let (sql, params) = where_sql(json!({"n_str": "x"}));
        assert_eq!(
            sql,
            "(json_type(\"_ext\", '$.\"n_str\"') IN ('text') AND json_extract(\"_ext\", '$.\"n_str\"') = ?)"
        );
        assert_eq!(params, vec![Param::Str("x".into())]);
    }

    #[test]
    fn test_ext_comparison_walks_with_json_each() {
        let (sql, params) = where_sql(json!({"score": {"$gt": 5}}));
        assert_eq!(
            sql,
            "EXISTS (SELECT 1 FROM json_each(\"_ext\", '$.\"score\"') AS je WHERE (je.key IS NULL OR typeof(je.key) = 'integer') AND je.type IN ('integer', 'real') AND je.value > ?)"
        );
        assert_eq!(params, vec![Param::Int(5)]);
    }

    #[test]
    fn test_null_and_regex() {
        let (sql, _) = where_sql(json!({"gone": null}));
        assert_eq!(sql, "COALESCE(json_type(\"_ext\", '$.\"gone\"'), 'null') = 'null'");

        let (sql, params) = where_sql(json!({"c_index": {"$regex": "^i", "$options": "i"}}));
        assert_eq!(sql, "\"c_index\" REGEXP ?");
        assert_eq!(params, vec![Param::Str("(?i)^i".into())]);
    }

    #[test]
    fn test_or_and_ne() {
        let (sql, params) = where_sql(json!({"$or": [{"c_int": 1}, {"c_index": {"$ne": "a"}}]}));
        assert_eq!(
            sql,
            "((\"c_int\" = ?) OR ((\"c_index\" IS NULL OR \"c_index\" <> ?)))"
        );
        assert_eq!(params, vec![Param::Int(1), Param::Str("a".into())]);
    }

    #[test]
    fn test_update_fixed_and_ext() {
        let dialect = SqliteDialect::default();
        let schema = schema();
        let target = Target::new("main", "c", &schema);
        let update = parse_update(&json!({"$inc": {"c_int": 6}, "$set": {"n_str": "y"}})).unwrap();
        let filter = parse_filter(&json!({"c_index": "i1"})).unwrap();
        let plan = dialect
            .generate_sql_plan(Operation::Update {
                target,
                filter: &filter,
                update: &update,
                hint: None,
            })
            .unwrap();
        assert_eq!(
            plan.statements[0].sql,
            "UPDATE \"main\".\"c\" SET \"c_int\" = COALESCE(\"c_int\", 0) + ?, \"_ext\" = json_set(COALESCE(\"_ext\", '{}'), '$.\"n_str\"', ?) WHERE \"c_index\" = ?"
        );
        assert_eq!(
            plan.statements[0].params,
            vec![Param::Int(6), Param::Str("y".into()), Param::Str("i1".into())]
        );
    }

    #[test]
    fn test_ext_min_reads_current_value() {
        let dialect = SqliteDialect::default();
        let schema = CollectionSchema::schemaless();
        let mut params = dialect.new_params();
        let update = parse_update(&json!({"$min": {"low": 3}, "$unset": {"tmp": ""}})).unwrap();
        let assignments = dialect
            .compile_assignments(&Scope::new(&schema), &update, &mut params)
            .unwrap();
        let num = "CASE WHEN json_type(\"_ext\", '$.\"low\"') IN ('integer', 'real') THEN json_extract(\"_ext\", '$.\"low\"') END";
        assert_eq!(
            assignments,
            vec![format!(
                "\"_ext\" = json_remove(json_set(COALESCE(\"_ext\", '{{}}'), '$.\"low\"', CASE WHEN COALESCE({num}, ?) < ? THEN COALESCE({num}, 0) ELSE ? END), '$.\"tmp\"')"
            )]
        );
        assert_eq!(params.len(), 3);
    }

    #[test]
    fn test_rename_guards_missing_source() {
        let dialect = SqliteDialect::default();
        let schema = CollectionSchema::schemaless();
        let mut params = dialect.new_params();
        let update = parse_update(&json!({"$rename": {"a": "b"}})).unwrap();
        let assignments = dialect
            .compile_assignments(&Scope::new(&schema), &update, &mut params)
            .unwrap();
        assert_eq!(
            assignments[0],
            "\"_ext\" = CASE WHEN json_type(\"_ext\", '$.\"a\"') IS NOT NULL THEN json_remove(json_set(COALESCE(\"_ext\", '{}'), '$.\"b\"', json(\"_ext\" -> '$.\"a\"')), '$.\"a\"') ELSE COALESCE(\"_ext\", '{}') END"
        );
        assert!(params.is_empty());
    }

    #[test]
    fn test_find_with_projection_sort_limit_hint() {
        let dialect = SqliteDialect::default();
        let schema = schema();
        let target = Target::new("main", "c", &schema);
        let query = Query::new(Filter::all())
            .projection(crate::dsl::parse_projection(&json!(["c_int", "n.x"])).unwrap().unwrap())
            .sort(vec![SortKey::desc(FieldPath::parse("n.x").unwrap())])
            .skip(5)
            .hint("by_int");
        let plan = dialect
            .generate_sql_plan(Operation::Find {
                target,
                query: &query,
                joined: &[],
            })
            .unwrap();
        assert_eq!(
            plan.statements[0].sql,
            "SELECT \"_id\" AS \"_id\", \"c_int\" AS \"c_int\", \"_ext\" -> '$.\"n\".\"x\"' AS \"n.x\" FROM \"main\".\"c\" INDEXED BY \"c_by_int\" ORDER BY json_extract(\"_ext\", '$.\"n\".\"x\"') DESC LIMIT -1 OFFSET 5"
        );
    }

    #[test]
    fn test_create_collection_ddl() {
        let dialect = SqliteDialect::default();
        let spec = CollectionSpec::default()
            .column(ColumnDef::new("c_index", FieldType::Str).length(32).not_null())
            .column(ColumnDef::new("flag", FieldType::Bool).default_value(json!(true)))
            .index(IndexDef::new("ci", &["c_index"]).unique())
            .index(IndexDef::new("tag", &["tag"]));
        let plan = dialect.create_collection("main", "c", &spec).unwrap();
        assert_eq!(
            plan.statements[0].sql,
            "CREATE TABLE IF NOT EXISTS \"main\".\"c\" (\"_id\" VARCHAR(64) NOT NULL, \"c_index\" VARCHAR(32) NOT NULL, \"flag\" BOOLEAN DEFAULT 1, \"_ext\" JSON, PRIMARY KEY (\"_id\"))"
        );
        assert_eq!(
            plan.statements[1].sql,
            "CREATE UNIQUE INDEX IF NOT EXISTS \"main\".\"c_ci\" ON \"c\" (\"c_index\")"
        );
        assert_eq!(
            plan.statements[2].sql,
            "CREATE INDEX IF NOT EXISTS \"main\".\"c_tag\" ON \"c\" ((json_extract(\"_ext\", '$.\"tag\"')))"
        );
    }

    #[test]
    fn test_attach_is_not_transactional() {
        let dialect = SqliteDialect::new(Some(PathBuf::from("/data")));
        let plan = dialect.create_db("sales").unwrap();
        assert!(!plan.transactional);
        assert_eq!(plan.statements[0].params, vec![Param::Str("/data/sales.db".into())]);
        assert!(dialect.drop_db("main").is_err());
    }

    #[test]
    fn test_parse_declared_types() {
        let dialect = SqliteDialect::default();
        assert_eq!(dialect.parse_column_type("VARCHAR(32)"), Some(FieldType::Str));
        assert_eq!(dialect.parse_column_type("integer"), Some(FieldType::Int));
        assert_eq!(dialect.parse_column_type("JSON"), Some(FieldType::Json));
        assert_eq!(dialect.parse_column_type("BLOB"), None);
    }
}
