use serde_json::Value;

use super::{Dialect, Params, PlaceholderStyle};
use crate::dsl::{AggFunc, Comparison, PathSegment, RegexOp};
use crate::error::Result;
use crate::plan::{RowFormat, SqlPlan, Statement};
use crate::schema::{CollectionSpec, ColumnDef};
use crate::value::{FieldType, Param, ID_FIELD};

/// PostgreSQL with `jsonb`. A database maps onto a schema.
#[derive(Debug, Clone, Default)]
pub struct PostgresDialect;

impl PostgresDialect {
    pub fn new() -> Self {
        Self
    }

    /// `'{"a","b","0"}'`, the text[] form taken by `#>` and `jsonb_set`.
    fn path_literal(&self, path: &[PathSegment]) -> String {
        let elements: Vec<String> = path
            .iter()
            .map(|segment| {
                let raw = segment.as_key();
                format!("\"{}\"", raw.replace('\\', "\\\\").replace('"', "\\\""))
            })
            .collect();
        self.quote_literal(&format!("{{{}}}", elements.join(",")))
    }

    fn json_kind(value: &Value) -> Option<&'static str> {
        match value {
            Value::Number(_) => Some("number"),
            Value::String(_) => Some("string"),
            Value::Bool(_) => Some("boolean"),
            _ => None,
        }
    }
}

impl Dialect for PostgresDialect {
    fn name(&self) -> &'static str {
        "postgres"
    }

    fn placeholder_style(&self) -> PlaceholderStyle {
        PlaceholderStyle::Numbered
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
            FieldType::Int => "BIGINT".to_string(),
            FieldType::Float => "DOUBLE PRECISION".to_string(),
            FieldType::Bool => "BOOLEAN".to_string(),
            FieldType::Json => "JSONB".to_string(),
        }
    }

    fn json_type(&self) -> &'static str {
        "JSONB"
    }

    fn parse_column_type(&self, declared: &str) -> Option<FieldType> {
        match declared.trim().to_ascii_lowercase().as_str() {
            "character varying" | "varchar" | "text" | "character" | "char" => Some(FieldType::Str),
            "bigint" | "integer" | "smallint" => Some(FieldType::Int),
            "double precision" | "real" | "numeric" => Some(FieldType::Float),
            "boolean" => Some(FieldType::Bool),
            "jsonb" | "json" => Some(FieldType::Json),
            _ => None,
        }
    }

    fn bool_literal(&self, value: bool) -> &'static str {
        if value {
            "TRUE"
        } else {
            "FALSE"
        }
    }

    fn empty_object(&self) -> &'static str {
        "'{}'::jsonb"
    }

    fn json_value(&self, column: &str, path: &[PathSegment]) -> String {
        format!("{} #> {}", column, self.path_literal(path))
    }

    fn json_text(&self, column: &str, path: &[PathSegment]) -> String {
        format!("{} #>> {}", column, self.path_literal(path))
    }

    fn json_number(&self, column: &str, path: &[PathSegment]) -> String {
        format!(
            "CASE WHEN jsonb_typeof({}) = 'number' THEN CAST({} AS NUMERIC) END",
            self.json_value(column, path),
            self.json_text(column, path)
        )
    }

    fn json_exists(&self, column: &str, path: &[PathSegment]) -> String {
        format!("{} IS NOT NULL", self.json_value(column, path))
    }

    fn json_eq(&self, column: &str, path: &[PathSegment], value: &Value, params: &mut Params) -> String {
        format!(
            "{} = {}",
            self.json_value(column, path),
            params.push(Param::Json(value.clone()))
        )
    }

    fn json_is_null(&self, column: &str, path: &[PathSegment]) -> String {
        format!(
            "COALESCE(jsonb_typeof({}), 'null') = 'null'",
            self.json_value(column, path)
        )
    }

    /// jsonb orders scalars of one type by their SQL type's rules.
    fn json_compare(
        &self,
        column: &str,
        path: &[PathSegment],
        op: Comparison,
        value: &Value,
        params: &mut Params,
    ) -> String {
        let Some(kind) = Self::json_kind(value) else {
            return "1 = 0".to_string();
        };
        let x = self.json_value(column, path);
        format!(
            "(jsonb_typeof({x}) = '{kind}' AND {x} {} {})",
            op.sql(),
            params.push(Param::Json(value.clone()))
        )
    }

    fn json_regex(&self, column: &str, path: &[PathSegment], regex: &RegexOp, params: &mut Params) -> String {
        format!(
            "(jsonb_typeof({}) = 'string' AND {})",
            self.json_value(column, path),
            self.regex_match(&format!("({})", self.json_text(column, path)), regex, params)
        )
    }

    fn regex_match(&self, expr: &str, regex: &RegexOp, params: &mut Params) -> String {
        let op = if regex.case_insensitive { "~*" } else { "~" };
        format!("{} {} {}", expr, op, params.push(Param::Str(regex.pattern.clone())))
    }

    fn json_set(&self, acc: &str, path: &[PathSegment], value: &str) -> String {
        format!("jsonb_set({}, {}, {}, true)", acc, self.path_literal(path), value)
    }

    fn json_remove(&self, acc: &str, path: &[PathSegment]) -> String {
        format!("({} #- {})", acc, self.path_literal(path))
    }

    fn json_set_value(&self, value: &Value, params: &mut Params) -> String {
        params.push(Param::Json(value.clone()))
    }

    fn creates_parents(&self) -> bool {
        false
    }

    fn numeric_operand(&self, param: Param, params: &mut Params) -> String {
        format!("CAST({} AS NUMERIC)", params.push(param))
    }

    fn number_to_json(&self, expr: String) -> String {
        format!("to_jsonb({})", expr)
    }

    fn text_cast(&self, expr: String) -> String {
        format!("CAST({} AS TEXT)", expr)
    }

    /// NUMERIC results come back as DOUBLE PRECISION.
    fn aggregate(&self, func: AggFunc, expr: &str) -> String {
        format!("CAST({}({}) AS DOUBLE PRECISION)", func.sql(), expr)
    }

    fn limit_clause(&self, limit: Option<u64>, skip: Option<u64>) -> String {
        match (limit, skip) {
            (None, None) => String::new(),
            (Some(limit), None) => format!("LIMIT {}", limit),
            (Some(limit), Some(skip)) => format!("LIMIT {} OFFSET {}", limit, skip),
            (None, Some(skip)) => format!("OFFSET {}", skip),
        }
    }

    fn create_db(&self, db: &str) -> Result<SqlPlan> {
        Ok(SqlPlan::single(Statement::execute(
            format!("CREATE SCHEMA IF NOT EXISTS {}", self.quote_ident(db)),
            vec![],
        )))
    }

    fn drop_db(&self, db: &str) -> Result<SqlPlan> {
        Ok(SqlPlan::single(Statement::execute(
            format!("DROP SCHEMA IF EXISTS {} CASCADE", self.quote_ident(db)),
            vec![],
        )))
    }

    fn list_dbs(&self) -> Result<SqlPlan> {
        Ok(SqlPlan::single(Statement::query(
            "SELECT schema_name::text AS name FROM information_schema.schemata \
             WHERE schema_name <> 'information_schema' AND schema_name NOT LIKE 'pg\\_%' \
             ORDER BY schema_name",
            vec![],
        ))
        .rows(RowFormat::Raw))
    }

    fn create_collection(&self, db: &str, collection: &str, spec: &CollectionSpec) -> Result<SqlPlan> {
        let table = self.table(db, collection);
        let mut columns = self.table_columns(spec)?;
        columns.push(format!("PRIMARY KEY ({})", self.quote_ident(ID_FIELD)));
        let mut plan = SqlPlan::single(Statement::execute(
            format!("CREATE TABLE IF NOT EXISTS {} ({})", table, columns.join(", ")),
            vec![],
        ));
        if let Some(comment) = &spec.comment {
            plan.add(Statement::execute(
                format!("COMMENT ON TABLE {} IS {}", table, self.quote_literal(comment)),
                vec![],
            ));
        }
        let schema = spec.schema();
        for index in &spec.indexes {
            plan.add(Statement::execute(
                format!(
                    "CREATE {}INDEX IF NOT EXISTS {} ON {} ({})",
                    if index.unique { "UNIQUE " } else { "" },
                    self.quote_ident(&format!("{}_{}", collection, index.name)),
                    table,
                    self.index_columns(&schema, index)?
                ),
                vec![],
            ));
        }
        Ok(plan)
    }

    fn list_collections(&self, db: &str) -> Result<SqlPlan> {
        Ok(SqlPlan::single(Statement::query(
            "SELECT table_name::text AS name FROM information_schema.tables \
             WHERE table_schema = $1::text AND table_type = 'BASE TABLE' ORDER BY table_name",
            vec![Param::Str(db.to_string())],
        ))
        .rows(RowFormat::Raw))
    }

    fn describe_collection(&self, db: &str, collection: &str) -> Result<SqlPlan> {
        Ok(SqlPlan::single(Statement::query(
            "SELECT column_name::text AS name, data_type::text AS type FROM information_schema.columns \
             WHERE table_schema = $1::text AND table_name = $2::text ORDER BY ordinal_position",
            vec![Param::Str(db.to_string()), Param::Str(collection.to_string())],
        ))
        .rows(RowFormat::Raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::{Operation, Scope, Target};
    use crate::dsl::{parse_filter, parse_group, parse_update, Filter, GroupQuery};
    use crate::schema::{CollectionSchema, IndexDef};
    use serde_json::json;

    fn schema() -> CollectionSchema {
        CollectionSchema::new(vec![
            ColumnDef::new("c_index", FieldType::Str).length(32),
            ColumnDef::new("c_int", FieldType::Int),
        ])
    }

    fn where_sql(filter: serde_json::Value) -> (String, Vec<Param>) {
        let dialect = PostgresDialect::new();
        let schema = schema();
        let mut params = dialect.new_params();
        let sql = dialect
            .compile_filter(&Scope::new(&schema), &parse_filter(&filter).unwrap(), &mut params)
            .unwrap()
            .unwrap();
        (sql, params.into_vec())
    }

    #[test]
    fn test_numbered_placeholders_carry_casts() {
        let (sql, params) = where_sql(json!({"c_int": {"$gte": 3}, "c_index": "a"}));
        assert_eq!(sql, "\"c_int\" >= $1::bigint AND \"c_index\" = $2::text");
        assert_eq!(params, vec![Param::Int(3), Param::Str("a".into())]);
    }

    #[test]
    fn test_ext_filters_use_jsonb_operators() {
        let (sql, params) = where_sql(json!({"n.x": 2, "tags.0": {"$lt": "m"}}));
        assert_eq!(
            sql,
            "\"_ext\" #> '{\"n\",\"x\"}' = $1::jsonb AND (jsonb_typeof(\"_ext\" #> '{\"tags\",\"0\"}') = 'string' AND \"_ext\" #> '{\"tags\",\"0\"}' < $2::jsonb)"
        );
        assert_eq!(params, vec![Param::Json(json!(2)), Param::Json(json!("m"))]);

        let (sql, _) = where_sql(json!({"s": {"$regex": "^a", "$options": "i"}}));
        assert_eq!(
            sql,
            "(jsonb_typeof(\"_ext\" #> '{\"s\"}') = 'string' AND (\"_ext\" #>> '{\"s\"}') ~* $1::text)"
        );
    }

    #[test]
    fn test_ne_and_nin_are_null_safe() {
        let (sql, _) = where_sql(json!({"k": {"$ne": 1}}));
        assert_eq!(sql, "NOT COALESCE(\"_ext\" #> '{\"k\"}' = $1::jsonb, FALSE)");
        let (sql, _) = where_sql(json!({"k": {"$nin": [1, null]}}));
        assert_eq!(
            sql,
            "NOT COALESCE((\"_ext\" #> '{\"k\"}' = $1::jsonb OR COALESCE(jsonb_typeof(\"_ext\" #> '{\"k\"}'), 'null') = 'null'), FALSE)"
        );
    }

    #[test]
    fn test_inc_goes_through_numeric() {
        let dialect = PostgresDialect::new();
        let schema = CollectionSchema::schemaless();
        let mut params = dialect.new_params();
        let update = parse_update(&json!({"$inc": {"n": 6}})).unwrap();
        let assignments = dialect
            .compile_assignments(&Scope::new(&schema), &update, &mut params)
            .unwrap();
        assert_eq!(
            assignments[0],
            "\"_ext\" = jsonb_set(COALESCE(\"_ext\", '{}'::jsonb), '{\"n\"}', to_jsonb(COALESCE(CASE WHEN jsonb_typeof(\"_ext\" #> '{\"n\"}') = 'number' THEN CAST(\"_ext\" #>> '{\"n\"}' AS NUMERIC) END, 0) + CAST($1::bigint AS NUMERIC)), true)"
        );
    }

    #[test]
    fn test_unset_and_rename() {
        let dialect = PostgresDialect::new();
        let schema = CollectionSchema::schemaless();
        let mut params = dialect.new_params();
        let update = parse_update(&json!({"$rename": {"a": "b"}, "$unset": {"c": ""}})).unwrap();
        let assignments = dialect
            .compile_assignments(&Scope::new(&schema), &update, &mut params)
            .unwrap();
        assert_eq!(
            assignments[0],
            "\"_ext\" = (CASE WHEN \"_ext\" #> '{\"a\"}' IS NOT NULL THEN (jsonb_set(COALESCE(\"_ext\", '{}'::jsonb), '{\"b\"}', \"_ext\" #> '{\"a\"}', true) #- '{\"a\"}') ELSE COALESCE(\"_ext\", '{}'::jsonb) END #- '{\"c\"}')"
        );
        assert!(params.is_empty());
    }

    #[test]
    fn test_group_casts_aggregates() {
        let dialect = PostgresDialect::new();
        let schema = schema();
        let target = Target::new("shop", "orders", &schema);
        let group = parse_group(&json!({"c_index": "$c_index", "total": {"$sum": "$c_int"}})).unwrap();
        let query = GroupQuery::new(Filter::all(), group);
        let plan = dialect
            .generate_sql_plan(Operation::Group {
                target,
                query: &query,
            })
            .unwrap();
        assert_eq!(
            plan.statements[0].sql,
            "SELECT \"c_index\" AS \"c_index\", CAST(SUM(\"c_int\") AS DOUBLE PRECISION) AS \"total\" FROM \"shop\".\"orders\" GROUP BY \"c_index\""
        );
    }

    #[test]
    fn test_create_collection_ddl() {
        let dialect = PostgresDialect::new();
        let spec = CollectionSpec::default()
            .column(ColumnDef::new("flag", FieldType::Bool).default_value(json!(false)))
            .index(IndexDef::new("tag", &["tag"]))
            .comment("orders");
        let plan = dialect.create_collection("shop", "c", &spec).unwrap();
        assert_eq!(
            plan.statements[0].sql,
            "CREATE TABLE IF NOT EXISTS \"shop\".\"c\" (\"_id\" VARCHAR(64) NOT NULL, \"flag\" BOOLEAN DEFAULT FALSE, \"_ext\" JSONB, PRIMARY KEY (\"_id\"))"
        );
        assert_eq!(plan.statements[1].sql, "COMMENT ON TABLE \"shop\".\"c\" IS 'orders'");
        assert_eq!(
            plan.statements[2].sql,
            "CREATE INDEX IF NOT EXISTS \"c_tag\" ON \"shop\".\"c\" ((\"_ext\" #> '{\"tag\"}'))"
        );
    }

    #[test]
    fn test_offset_without_limit() {
        let dialect = PostgresDialect::new();
        assert_eq!(dialect.limit_clause(None, Some(4)), "OFFSET 4");
        assert_eq!(dialect.limit_clause(Some(2), None), "LIMIT 2");
    }

    #[test]
    fn test_parse_declared_types() {
        let dialect = PostgresDialect::new();
        assert_eq!(dialect.parse_column_type("character varying"), Some(FieldType::Str));
        assert_eq!(dialect.parse_column_type("double precision"), Some(FieldType::Float));
        assert_eq!(dialect.parse_column_type("jsonb"), Some(FieldType::Json));
        assert_eq!(dialect.parse_column_type("bytea"), None);
    }
}
