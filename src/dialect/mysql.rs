use serde_json::Value;

use super::{dollar_path, resolve, ArithOp, Dialect, FieldRef, HintTarget, Params, PlaceholderStyle};
use crate::dsl::{Comparison, FieldPath, PathSegment, RegexOp};
use crate::error::{Error, Result};
use crate::plan::{CompareOp, PreCheck, RowFormat, SqlPlan, Statement};
use crate::schema::{CollectionSchema, CollectionSpec, ColumnDef, PartitionKind, PartitionSpec};
use crate::value::{FieldType, Param, ID_FIELD};

const NUMBER_TYPES: &str = "'INTEGER', 'UNSIGNED INTEGER', 'DOUBLE', 'DECIMAL'";

/// Largest row count MySQL accepts; `OFFSET` needs a `LIMIT`.
const NO_LIMIT: u64 = 18_446_744_073_709_551_615;

const SYSTEM_SCHEMAS: &str = "'information_schema', 'mysql', 'performance_schema', 'sys'";

/// MySQL 8 with the native JSON type.
#[derive(Debug, Clone, Default)]
pub struct MySqlDialect;

impl MySqlDialect {
    pub fn new() -> Self {
        Self
    }

    fn path_literal(&self, path: &[PathSegment]) -> String {
        self.quote_literal(&dollar_path(path))
    }

    /// `column` is always a column reference, which `->` requires.
    fn extract(&self, column: &str, path: &[PathSegment]) -> String {
        format!("{}->{}", column, self.path_literal(path))
    }

    fn comparable_types(value: &Value) -> Option<&'static str> {
        match value {
            Value::Number(_) => Some(NUMBER_TYPES),
            Value::String(_) => Some("'STRING'"),
            Value::Bool(_) => Some("'BOOLEAN'"),
            _ => None,
        }
    }

    fn match_type(regex: &RegexOp) -> &'static str {
        if regex.case_insensitive {
            "'i'"
        } else {
            "'c'"
        }
    }

    /// `PARTITION BY ...` clause. Partition columns must be fixed columns.
    fn partition_clause(&self, spec: &CollectionSpec, partition: &PartitionSpec) -> Result<String> {
        for column in &partition.columns {
            if column != ID_FIELD && spec.fixed_columns.iter().all(|c| &c.name != column) {
                return Err(Error::invalid(format!(
                    "partition column '{}' is not a fixed column",
                    column
                )));
            }
        }
        let mut sql = String::from("PARTITION BY ");
        sql.push_str(&self.partition_method(
            partition.kind,
            &partition.columns,
            partition.linear,
            partition.use_columns,
        )?);

        if let Some(count) = partition.count {
            if !partition.partitions.is_empty() {
                return Err(Error::invalid("give either a partition count or partition definitions"));
            }
            sql.push_str(&format!(" PARTITIONS {}", count));
        }

        if let Some(sub) = &partition.subpartition {
            if !matches!(sub.kind, PartitionKind::Hash | PartitionKind::Key) {
                return Err(Error::invalid("subpartitions must use HASH or KEY"));
            }
            sql.push_str(" SUBPARTITION BY ");
            sql.push_str(&self.partition_method(sub.kind, &sub.columns, sub.linear, false)?);
            if let Some(count) = sub.count {
                sql.push_str(&format!(" SUBPARTITIONS {}", count));
            }
        }

        if !partition.partitions.is_empty() {
            let mut defs = Vec::with_capacity(partition.partitions.len());
            for def in &partition.partitions {
                let mut out = format!("PARTITION {}", self.quote_ident(&def.name));
                match (&def.values, partition.kind) {
                    (Some(values), PartitionKind::Range | PartitionKind::List) => {
                        out.push_str(" VALUES ");
                        out.push_str(values);
                    }
                    (None, PartitionKind::Range | PartitionKind::List) => {
                        return Err(Error::invalid(format!(
                            "partition '{}' needs a VALUES bound",
                            def.name
                        )))
                    }
                    (Some(_), _) => {
                        return Err(Error::invalid(format!(
                            "{} partition '{}' cannot carry VALUES",
                            partition.kind.sql(),
                            def.name
                        )))
                    }
                    (None, _) => {}
                }
                if !def.subpartitions.is_empty() {
                    let subs: Vec<String> = def
                        .subpartitions
                        .iter()
                        .map(|s| format!("SUBPARTITION {}", self.quote_ident(s)))
                        .collect();
                    out.push_str(&format!(" ({})", subs.join(", ")));
                }
                defs.push(out);
            }
            sql.push_str(&format!(" ({})", defs.join(", ")));
        }
        Ok(sql)
    }

    fn partition_method(
        &self,
        kind: PartitionKind,
        columns: &[String],
        linear: bool,
        use_columns: bool,
    ) -> Result<String> {
        if columns.is_empty() {
            return Err(Error::invalid("partitioning needs at least one column"));
        }
        let mut sql = String::new();
        if linear {
            if !matches!(kind, PartitionKind::Hash | PartitionKind::Key) {
                return Err(Error::invalid("LINEAR applies to HASH and KEY partitioning only"));
            }
            sql.push_str("LINEAR ");
        }
        let quoted: Vec<String> = columns.iter().map(|c| self.quote_ident(c)).collect();
        match kind {
            PartitionKind::Key => sql.push_str(&format!("KEY ({})", quoted.join(", "))),
            PartitionKind::Range | PartitionKind::List if use_columns => {
                sql.push_str(&format!("{} COLUMNS ({})", kind.sql(), quoted.join(", ")))
            }
            _ => {
                if quoted.len() != 1 {
                    return Err(Error::invalid(format!(
                        "{} partitioning takes one column unless COLUMNS is used",
                        kind.sql()
                    )));
                }
                sql.push_str(&format!("{} ({})", kind.sql(), quoted[0]));
            }
        }
        Ok(sql)
    }
}

impl Dialect for MySqlDialect {
    fn name(&self) -> &'static str {
        "mysql"
    }

    fn placeholder_style(&self) -> PlaceholderStyle {
        PlaceholderStyle::Question
    }

    fn quote_ident(&self, ident: &str) -> String {
        format!("`{}`", ident.replace('`', "``"))
    }

    fn quote_literal(&self, value: &str) -> String {
        format!("'{}'", value.replace('\\', "\\\\").replace('\'', "''"))
    }

    fn column_type(&self, column: &ColumnDef) -> String {
        match column.ty {
            FieldType::Str => format!("VARCHAR({})", column.length.unwrap_or(255)),
            FieldType::Int => "BIGINT".to_string(),
            FieldType::Float => "DOUBLE".to_string(),
            FieldType::Bool => "TINYINT(1)".to_string(),
            FieldType::Json => "JSON".to_string(),
        }
    }

    fn json_type(&self) -> &'static str {
        "JSON"
    }

    fn parse_column_type(&self, declared: &str) -> Option<FieldType> {
        let declared = declared.trim().to_ascii_lowercase();
        if declared.starts_with("tinyint(1)") {
            return Some(FieldType::Bool);
        }
        let base = declared.split(['(', ' ']).next().unwrap_or("");
        match base {
            "varchar" | "char" | "text" | "tinytext" | "mediumtext" | "longtext" => {
                Some(FieldType::Str)
            }
            "bigint" | "int" | "integer" | "smallint" | "mediumint" | "tinyint" => {
                Some(FieldType::Int)
            }
            "double" | "float" | "decimal" | "real" => Some(FieldType::Float),
            "bool" | "boolean" => Some(FieldType::Bool),
            "json" => Some(FieldType::Json),
            _ => None,
        }
    }

    fn empty_object(&self) -> &'static str {
        "JSON_OBJECT()"
    }

    fn json_value(&self, column: &str, path: &[PathSegment]) -> String {
        self.extract(column, path)
    }

    fn json_text(&self, column: &str, path: &[PathSegment]) -> String {
        format!("{}->>{}", column, self.path_literal(path))
    }

    fn json_number(&self, column: &str, path: &[PathSegment]) -> String {
        let x = self.extract(column, path);
        format!("CASE WHEN JSON_TYPE({x}) IN ({NUMBER_TYPES}) THEN CAST({x} AS DOUBLE) END")
    }

    fn json_exists(&self, column: &str, path: &[PathSegment]) -> String {
        format!(
            "JSON_CONTAINS_PATH({}, 'one', {})",
            column,
            self.path_literal(path)
        )
    }

    fn json_eq(&self, column: &str, path: &[PathSegment], value: &Value, params: &mut Params) -> String {
        format!(
            "{} = CAST({} AS JSON)",
            self.extract(column, path),
            params.push(Param::json_text(value))
        )
    }

    fn json_is_null(&self, column: &str, path: &[PathSegment]) -> String {
        format!(
            "COALESCE(JSON_TYPE({}), 'NULL') = 'NULL'",
            self.extract(column, path)
        )
    }

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
        let x = self.extract(column, path);
        format!(
            "(JSON_TYPE({x}) IN ({types}) AND {x} {} CAST({} AS JSON))",
            op.sql(),
            params.push(Param::json_text(value))
        )
    }

    fn json_regex(&self, column: &str, path: &[PathSegment], regex: &RegexOp, params: &mut Params) -> String {
        let x = self.extract(column, path);
        let text = self.json_text(column, path);
        format!(
            "(JSON_TYPE({x}) = 'STRING' AND REGEXP_LIKE({text}, {}, {}))",
            params.push(Param::Str(regex.pattern.clone())),
            Self::match_type(regex)
        )
    }

    fn regex_match(&self, expr: &str, regex: &RegexOp, params: &mut Params) -> String {
        format!(
            "REGEXP_LIKE({}, {}, {})",
            expr,
            params.push(Param::Str(regex.pattern.clone())),
            Self::match_type(regex)
        )
    }

    fn json_set(&self, acc: &str, path: &[PathSegment], value: &str) -> String {
        format!("JSON_SET({}, {}, {})", acc, self.path_literal(path), value)
    }

    fn json_remove(&self, acc: &str, path: &[PathSegment]) -> String {
        format!("JSON_REMOVE({}, {})", acc, self.path_literal(path))
    }

    fn json_set_value(&self, value: &Value, params: &mut Params) -> String {
        format!("CAST({} AS JSON)", params.push(Param::json_text(value)))
    }

    fn creates_parents(&self) -> bool {
        false
    }

    /// Integer operands keep integer values integral; CASE over mixed
    /// BIGINT and DOUBLE branches would otherwise widen everything to DOUBLE.
    fn json_arith(
        &self,
        column: &str,
        path: &[PathSegment],
        op: ArithOp,
        operand: &Param,
        params: &mut Params,
    ) -> String {
        let x = self.extract(column, path);
        let sign = op.sql();
        match operand {
            Param::Int(_) => {
                let a = params.push(operand.clone());
                let b = params.push(operand.clone());
                format!(
                    "CASE WHEN JSON_TYPE({x}) IN ('DOUBLE', 'DECIMAL') THEN CAST(CAST({x} AS DOUBLE) {sign} {a} AS JSON) \
                     ELSE CAST(COALESCE(CASE WHEN JSON_TYPE({x}) IN ('INTEGER', 'UNSIGNED INTEGER') THEN CAST({x} AS SIGNED) END, 0) {sign} {b} AS JSON) END"
                )
            }
            _ => format!(
                "CAST(COALESCE({}, 0) {sign} {} AS JSON)",
                self.json_number(column, path),
                params.push(operand.clone())
            ),
        }
    }

    /// Keeps the stored JSON value untouched when it already wins.
    fn json_bound(
        &self,
        column: &str,
        path: &[PathSegment],
        op: Comparison,
        operand: &Param,
        params: &mut Params,
    ) -> String {
        let current = self.json_number(column, path);
        let a = params.push(operand.clone());
        let b = params.push(operand.clone());
        let c = params.push(operand.clone());
        format!(
            "CASE WHEN COALESCE({current}, {a}) {} {b} THEN {} ELSE CAST({c} AS JSON) END",
            op.sql(),
            self.extract(column, path)
        )
    }

    fn text_cast(&self, expr: String) -> String {
        format!("CAST({} AS CHAR)", expr)
    }

    fn limit_clause(&self, limit: Option<u64>, skip: Option<u64>) -> String {
        match (limit, skip) {
            (None, None) => String::new(),
            (Some(limit), None) => format!("LIMIT {}", limit),
            (Some(limit), Some(skip)) => format!("LIMIT {} OFFSET {}", limit, skip),
            (None, Some(skip)) => format!("LIMIT {} OFFSET {}", NO_LIMIT, skip),
        }
    }

    fn index_hint(&self, _collection: &str, hint: &str, target: HintTarget) -> Option<String> {
        match target {
            HintTarget::Select | HintTarget::Update => {
                Some(format!("FORCE INDEX ({})", self.quote_ident(hint)))
            }
            HintTarget::Delete => None,
        }
    }

    /// JSON key parts index their text form; MySQL cannot index JSON directly.
    fn index_key_expr(&self, schema: &CollectionSchema, field: &str) -> Result<String> {
        let path = FieldPath::parse(field)?;
        match resolve(schema, &path)? {
            FieldRef::Column { name, .. } => Ok(self.quote_ident(&name)),
            FieldRef::Json { column, segments } => Ok(format!(
                "(CAST({} AS CHAR(255)))",
                self.json_text(&self.quote_ident(&column), segments)
            )),
        }
    }

    fn create_db(&self, db: &str) -> Result<SqlPlan> {
        Ok(SqlPlan::single(Statement::execute(
            format!("CREATE DATABASE IF NOT EXISTS {}", self.quote_ident(db)),
            vec![],
        )))
    }

    fn drop_db(&self, db: &str) -> Result<SqlPlan> {
        Ok(SqlPlan::single(Statement::execute(
            format!("DROP DATABASE IF EXISTS {}", self.quote_ident(db)),
            vec![],
        )))
    }

    fn list_dbs(&self) -> Result<SqlPlan> {
        Ok(SqlPlan::single(Statement::query(
            format!(
                "SELECT SCHEMA_NAME AS name FROM information_schema.schemata WHERE SCHEMA_NAME NOT IN ({}) ORDER BY SCHEMA_NAME",
                SYSTEM_SCHEMAS
            ),
            vec![],
        ))
        .rows(RowFormat::Raw))
    }

    /// Indexes are created behind an existence probe, since MySQL has no
    /// `CREATE INDEX IF NOT EXISTS`.
    fn create_collection(&self, db: &str, collection: &str, spec: &CollectionSpec) -> Result<SqlPlan> {
        let mut columns = self.table_columns(spec)?;
        let mut key = vec![self.quote_ident(ID_FIELD)];
        if let Some(partition) = &spec.partition {
            key.extend(
                partition
                    .columns
                    .iter()
                    .filter(|c| c.as_str() != ID_FIELD)
                    .map(|c| self.quote_ident(c)),
            );
        }
        columns.push(format!("PRIMARY KEY ({})", key.join(", ")));

        let mut sql = format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            self.table(db, collection),
            columns.join(", ")
        );
        if let Some(comment) = &spec.comment {
            sql.push_str(" COMMENT=");
            sql.push_str(&self.quote_literal(comment));
        }
        if let Some(partition) = &spec.partition {
            sql.push(' ');
            sql.push_str(&self.partition_clause(spec, partition)?);
        }
        let mut plan = SqlPlan::single(Statement::execute(sql, vec![]));

        let schema = spec.schema();
        for index in &spec.indexes {
            plan.add(Statement::scalar(
                "SELECT COUNT(*) FROM information_schema.statistics WHERE table_schema = ? AND table_name = ? AND index_name = ?",
                vec![
                    Param::Str(db.to_string()),
                    Param::Str(collection.to_string()),
                    Param::Str(index.name.clone()),
                ],
            ));
            plan.add(
                Statement::execute(
                    format!(
                        "CREATE {}INDEX {} ON {} ({})",
                        if index.unique { "UNIQUE " } else { "" },
                        self.quote_ident(&index.name),
                        self.table(db, collection),
                        self.index_columns(&schema, index)?
                    ),
                    vec![],
                )
                .pre_check(PreCheck::result(CompareOp::Eq, 0))
                .ignore_error(),
            );
        }
        Ok(plan)
    }

    fn list_collections(&self, db: &str) -> Result<SqlPlan> {
        Ok(SqlPlan::single(Statement::query(
            "SELECT TABLE_NAME AS name FROM information_schema.tables WHERE TABLE_SCHEMA = ? AND TABLE_TYPE = 'BASE TABLE' ORDER BY TABLE_NAME",
            vec![Param::Str(db.to_string())],
        ))
        .rows(RowFormat::Raw))
    }

    fn describe_collection(&self, db: &str, collection: &str) -> Result<SqlPlan> {
        Ok(SqlPlan::single(Statement::query(
            "SELECT COLUMN_NAME AS name, COLUMN_TYPE AS type FROM information_schema.columns WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ? ORDER BY ORDINAL_POSITION",
            vec![Param::Str(db.to_string()), Param::Str(collection.to_string())],
        ))
        .rows(RowFormat::Raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::{Operation, Scope, Target};
    use crate::dsl::{parse_filter, parse_update, Filter, Query};
    use crate::schema::{IndexDef, PartitionDef};
    use serde_json::json;

    fn schema() -> CollectionSchema {
        CollectionSchema::new(vec![
            ColumnDef::new("c_index", FieldType::Str).length(32),
            ColumnDef::new("c_int", FieldType::Int),
        ])
    }

    fn where_sql(filter: serde_json::Value) -> (String, Vec<Param>) {
        let dialect = MySqlDialect::new();
        let schema = schema();
        let mut params = dialect.new_params();
        let sql = dialect
            .compile_filter(&Scope::new(&schema), &parse_filter(&filter).unwrap(), &mut params)
            .unwrap()
            .unwrap();
        (sql, params.into_vec())
    }

    #[test]
    fn test_ext_equality_casts_literal_to_json() {
        let (sql, params) = where_sql(json!({"n.s": "x"}));
        assert_eq!(sql, "`_ext`->'$.\"n\".\"s\"' = CAST(? AS JSON)");
        assert_eq!(params, vec![Param::Str("\"x\"".into())]);
    }

    #[test]
    fn test_ext_comparison_is_type_guarded() {
        let (sql, params) = where_sql(json!({"score": {"$lte": 2.5}}));
        assert_eq!(
            sql,
            "(JSON_TYPE(`_ext`->'$.\"score\"') IN ('INTEGER', 'UNSIGNED INTEGER', 'DOUBLE', 'DECIMAL') AND `_ext`->'$.\"score\"' <= CAST(? AS JSON))"
        );
        assert_eq!(params, vec![Param::Str("2.5".into())]);
    }

    #[test]
    fn test_regex_match_type() {
        let (sql, params) = where_sql(json!({"c_index": {"$regex": "^a", "$options": "i"}}));
        assert_eq!(sql, "REGEXP_LIKE(`c_index`, ?, 'i')");
        assert_eq!(params, vec![Param::Str("^a".into())]);

        let (sql, _) = where_sql(json!({"tag": {"$regex": "b$"}}));
        assert!(sql.ends_with("REGEXP_LIKE(`_ext`->>'$.\"tag\"', ?, 'c'))"));
    }

    #[test]
    fn test_nested_set_ensures_parent() {
        let dialect = MySqlDialect::new();
        let schema = CollectionSchema::schemaless();
        let mut params = dialect.new_params();
        let update = parse_update(&json!({"$set": {"a.b": 1}})).unwrap();
        let assignments = dialect
            .compile_assignments(&Scope::new(&schema), &update, &mut params)
            .unwrap();
        assert_eq!(
            assignments[0],
            "`_ext` = JSON_SET(JSON_SET(COALESCE(`_ext`, JSON_OBJECT()), '$.\"a\"', COALESCE(`_ext`->'$.\"a\"', JSON_OBJECT())), '$.\"a\".\"b\"', CAST(? AS JSON))"
        );
        assert_eq!(params.into_vec(), vec![Param::Str("1".into())]);
    }

    #[test]
    fn test_integer_inc_stays_integral() {
        let dialect = MySqlDialect::new();
        let schema = CollectionSchema::schemaless();
        let mut params = dialect.new_params();
        let update = parse_update(&json!({"$inc": {"n": 2}})).unwrap();
        let assignments = dialect
            .compile_assignments(&Scope::new(&schema), &update, &mut params)
            .unwrap();
        assert!(assignments[0].contains("AS SIGNED) END, 0) + ? AS JSON) END"));
        assert_eq!(params.into_vec(), vec![Param::Int(2), Param::Int(2)]);

        let mut params = dialect.new_params();
        let update = parse_update(&json!({"$mul": {"n": 1.5}})).unwrap();
        let assignments = dialect
            .compile_assignments(&Scope::new(&schema), &update, &mut params)
            .unwrap();
        assert!(assignments[0].contains(" * ? AS JSON)"));
        assert_eq!(params.len(), 1);
    }

    #[test]
    fn test_hints_and_unbounded_offset() {
        let dialect = MySqlDialect::new();
        let schema = schema();
        let target = Target::new("shop", "c", &schema);
        let query = Query::new(Filter::all()).skip(10).hint("by_int");
        let plan = dialect
            .generate_sql_plan(Operation::Find {
                target,
                query: &query,
                joined: &[],
            })
            .unwrap();
        assert!(plan.statements[0]
            .sql
            .ends_with("FROM `shop`.`c` FORCE INDEX (`by_int`) LIMIT 18446744073709551615 OFFSET 10"));

        let filter = Filter::all();
        let plan = dialect
            .generate_sql_plan(Operation::Delete {
                target,
                filter: &filter,
                hint: Some("by_int"),
            })
            .unwrap();
        assert_eq!(plan.statements[0].sql, "DELETE FROM `shop`.`c`");
    }

    #[test]
    fn test_create_collection_probes_indexes() {
        let dialect = MySqlDialect::new();
        let spec = CollectionSpec::default()
            .column(ColumnDef::new("c_index", FieldType::Str).length(32))
            .index(IndexDef::new("ci", &["c_index"]).unique())
            .index(IndexDef::new("tag", &["tag"]))
            .comment("it's mine");
        let plan = dialect.create_collection("shop", "c", &spec).unwrap();
        assert_eq!(
            plan.statements[0].sql,
            "CREATE TABLE IF NOT EXISTS `shop`.`c` (`_id` VARCHAR(64) NOT NULL, `c_index` VARCHAR(32), `_ext` JSON, PRIMARY KEY (`_id`)) COMMENT='it''s mine'"
        );
        assert_eq!(plan.statements.len(), 5);
        assert_eq!(plan.statements[1].kind, crate::plan::StatementKind::Scalar);
        let create = &plan.statements[2];
        assert_eq!(create.sql, "CREATE UNIQUE INDEX `ci` ON `shop`.`c` (`c_index`)");
        assert_eq!(create.pre_check, Some(PreCheck::result(CompareOp::Eq, 0)));
        assert!(create.ignore_error);
        assert_eq!(
            plan.statements[4].sql,
            "CREATE INDEX `tag` ON `shop`.`c` ((CAST(`_ext`->>'$.\"tag\"' AS CHAR(255))))"
        );
        assert!(plan.validate().is_ok());
    }

    #[test]
    fn test_range_partitioning() {
        let dialect = MySqlDialect::new();
        let spec = CollectionSpec::default()
            .column(ColumnDef::new("year", FieldType::Int).not_null())
            .partition(PartitionSpec {
                kind: PartitionKind::Range,
                columns: vec!["year".into()],
                use_columns: false,
                linear: false,
                count: None,
                partitions: vec![
                    PartitionDef {
                        name: "p0".into(),
                        values: Some("LESS THAN (2000)".into()),
                        subpartitions: vec![],
                    },
                    PartitionDef {
                        name: "p1".into(),
                        values: Some("LESS THAN MAXVALUE".into()),
                        subpartitions: vec![],
                    },
                ],
                subpartition: None,
            });
        let sql = &dialect.create_collection("shop", "sales", &spec).unwrap().statements[0].sql;
        assert!(sql.contains("PRIMARY KEY (`_id`, `year`)"));
        assert!(sql.ends_with(
            "PARTITION BY RANGE (`year`) (PARTITION `p0` VALUES LESS THAN (2000), PARTITION `p1` VALUES LESS THAN MAXVALUE)"
        ));
    }

    #[test]
    fn test_partition_validation() {
        let dialect = MySqlDialect::new();
        let spec = CollectionSpec::default().partition(PartitionSpec {
            kind: PartitionKind::Hash,
            columns: vec!["missing".into()],
            use_columns: false,
            linear: true,
            count: Some(4),
            partitions: vec![],
            subpartition: None,
        });
        assert!(dialect.create_collection("shop", "c", &spec).is_err());

        let spec = CollectionSpec::default()
            .column(ColumnDef::new("k", FieldType::Int))
            .partition(PartitionSpec {
                kind: PartitionKind::Hash,
                columns: vec!["k".into()],
                use_columns: false,
                linear: true,
                count: Some(4),
                partitions: vec![],
                subpartition: None,
            });
        let sql = &dialect.create_collection("shop", "c", &spec).unwrap().statements[0].sql;
        assert!(sql.ends_with("PARTITION BY LINEAR HASH (`k`) PARTITIONS 4"));
    }

    #[test]
    fn test_parse_declared_types() {
        let dialect = MySqlDialect::new();
        assert_eq!(dialect.parse_column_type("tinyint(1)"), Some(FieldType::Bool));
        assert_eq!(dialect.parse_column_type("bigint(20)"), Some(FieldType::Int));
        assert_eq!(dialect.parse_column_type("varchar(32)"), Some(FieldType::Str));
        assert_eq!(dialect.parse_column_type("json"), Some(FieldType::Json));
        assert_eq!(dialect.parse_column_type("blob"), None);
    }
}
