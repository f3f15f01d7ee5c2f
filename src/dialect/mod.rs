//! SQL generation. The filter walk, update ordering and statement layout
//! live here as provided trait methods; each backend supplies the JSON
//! algebra, quoting, DDL and introspection of its engine.

mod mysql;
mod postgres;
mod sqlite;

pub use mysql::MySqlDialect;
pub use postgres::PostgresDialect;
pub use sqlite::SqliteDialect;

use std::fmt::Debug;

use serde_json::{Map, Value};

use crate::dsl::{
    AggArg, AggFunc, Clause, Comparison, Condition, FieldPath, Filter, FilterOp, GroupQuery,
    JoinKind, PathSegment, Projection, Query, RegexOp, SortKey, UpdateOp, UpdateSpec,
};
use crate::error::{Error, Result};
use crate::plan::{Decode, DocumentFormat, OutputColumn, RowFormat, SqlPlan, Statement};
use crate::schema::{CollectionSchema, CollectionSpec, ColumnDef, IndexDef};
use crate::value::{json_type_name, Document, FieldType, Param, EXT_COLUMN, ID_FIELD};

/// Length of the `_id` column.
pub const ID_LENGTH: u32 = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaceholderStyle {
    /// `?`
    Question,
    /// `$1::type`
    Numbered,
}

/// Parameters of one statement, in placeholder order.
#[derive(Debug, Clone)]
pub struct Params {
    style: PlaceholderStyle,
    values: Vec<Param>,
}

impl Params {
    pub fn new(style: PlaceholderStyle) -> Self {
        Self {
            style,
            values: Vec::new(),
        }
    }

    /// Bind a value and return its placeholder. `NULL` is rendered inline.
    pub fn push(&mut self, param: Param) -> String {
        if param.is_null() {
            return "NULL".to_string();
        }
        let cast = pg_cast(&param);
        self.values.push(param);
        match self.style {
            PlaceholderStyle::Question => "?".to_string(),
            PlaceholderStyle::Numbered => format!("${}::{}", self.values.len(), cast),
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn into_vec(self) -> Vec<Param> {
        self.values
    }
}

fn pg_cast(param: &Param) -> &'static str {
    match param {
        Param::Null | Param::Str(_) => "text",
        Param::Bool(_) => "boolean",
        Param::Int(_) => "bigint",
        Param::Float(_) => "float8",
        Param::Json(_) => "jsonb",
        Param::Bytes(_) => "bytea",
    }
}

/// Statement an index hint is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HintTarget {
    Select,
    Update,
    Delete,
}

/// A collection together with its resolved fixed columns.
#[derive(Debug, Clone, Copy)]
pub struct Target<'a> {
    pub db: &'a str,
    pub collection: &'a str,
    pub schema: &'a CollectionSchema,
}

impl<'a> Target<'a> {
    pub fn new(db: &'a str, collection: &'a str, schema: &'a CollectionSchema) -> Self {
        Self {
            db,
            collection,
            schema,
        }
    }
}

/// One high-level call, the input of [`Dialect::generate_sql_plan`].
#[derive(Debug, Clone, Copy)]
pub enum Operation<'a> {
    CreateDb {
        db: &'a str,
    },
    DropDb {
        db: &'a str,
    },
    ListDbs,
    CreateCollection {
        db: &'a str,
        collection: &'a str,
        spec: &'a CollectionSpec,
    },
    DropCollection {
        db: &'a str,
        collection: &'a str,
    },
    TruncateCollection {
        db: &'a str,
        collection: &'a str,
    },
    ListCollections {
        db: &'a str,
    },
    /// Column names and declared types of a live table.
    DescribeCollection {
        db: &'a str,
        collection: &'a str,
    },
    Insert {
        target: Target<'a>,
        docs: &'a [Document],
    },
    Update {
        target: Target<'a>,
        filter: &'a Filter,
        update: &'a UpdateSpec,
        hint: Option<&'a str>,
    },
    Delete {
        target: Target<'a>,
        filter: &'a Filter,
        hint: Option<&'a str>,
    },
    Find {
        target: Target<'a>,
        query: &'a Query,
        /// Schemas of `query.joins`, in order.
        joined: &'a [CollectionSchema],
    },
    Count {
        target: Target<'a>,
        filter: &'a Filter,
        hint: Option<&'a str>,
    },
    Group {
        target: Target<'a>,
        query: &'a GroupQuery,
    },
}

/// Columns visible to an expression, optionally qualified by a table alias.
#[derive(Debug, Clone, Copy)]
pub struct Scope<'a> {
    pub schema: &'a CollectionSchema,
    pub qualifier: Option<&'a str>,
}

impl<'a> Scope<'a> {
    pub fn new(schema: &'a CollectionSchema) -> Self {
        Self {
            schema,
            qualifier: None,
        }
    }

    pub fn qualified(schema: &'a CollectionSchema, qualifier: &'a str) -> Self {
        Self {
            schema,
            qualifier: Some(qualifier),
        }
    }
}

/// Where a field path lives.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldRef<'p> {
    /// A whole fixed column.
    Column { name: String, ty: FieldType },
    /// A value inside a JSON column; empty `segments` is the column itself.
    Json {
        column: String,
        segments: &'p [PathSegment],
    },
}

/// Decide whether a path targets a real column or the inside of a JSON blob.
pub fn resolve<'p>(schema: &CollectionSchema, path: &'p FieldPath) -> Result<FieldRef<'p>> {
    if path.root() == ID_FIELD {
        if path.is_nested() {
            return Err(Error::invalid(format!("'{}' addresses inside _id", path)));
        }
        return Ok(FieldRef::Column {
            name: ID_FIELD.to_string(),
            ty: FieldType::Str,
        });
    }
    match schema.fixed_for(path) {
        Some(column) if column.ty == FieldType::Json => Ok(FieldRef::Json {
            column: column.name.clone(),
            segments: path.rest(),
        }),
        Some(column) if !path.is_nested() => Ok(FieldRef::Column {
            name: column.name.clone(),
            ty: column.ty,
        }),
        Some(column) => Err(Error::invalid(format!(
            "'{}' addresses inside {} column '{}'",
            path, column.ty, column.name
        ))),
        None => Ok(FieldRef::Json {
            column: EXT_COLUMN.to_string(),
            segments: path.segments(),
        }),
    }
}

/// A filter literal as bound against a fixed column of type `ty`.
/// `None` when the value can never equal a value of that column.
fn fixed_operand(ty: FieldType, value: &Value) -> Option<Param> {
    match (ty, value) {
        (FieldType::Str, Value::String(s)) => Some(Param::Str(s.clone())),
        (FieldType::Int | FieldType::Float, Value::Number(_)) => Some(Param::from_json(value)),
        (FieldType::Bool, Value::Bool(b)) => Some(Param::Bool(*b)),
        (FieldType::Bool, Value::Number(n)) => match n.as_i64() {
            Some(0) => Some(Param::Bool(false)),
            Some(1) => Some(Param::Bool(true)),
            _ => None,
        },
        (FieldType::Json, v) => Some(Param::Json(v.clone())),
        _ => None,
    }
}

/// One mutation of a JSON blob column, paths relative to the column.
#[derive(Debug, Clone, PartialEq)]
pub enum BlobMutation<'p> {
    Set(&'p [PathSegment], &'p Value),
    Unset(&'p [PathSegment]),
    Arith {
        path: &'p [PathSegment],
        op: ArithOp,
        operand: Param,
    },
    Bound {
        path: &'p [PathSegment],
        op: Comparison,
        operand: Param,
    },
    Rename {
        from: &'p [PathSegment],
        to: &'p [PathSegment],
    },
}

impl<'p> BlobMutation<'p> {
    fn written(&self) -> Option<&'p [PathSegment]> {
        match self {
            BlobMutation::Set(path, _)
            | BlobMutation::Arith { path, .. }
            | BlobMutation::Bound { path, .. } => Some(*path),
            BlobMutation::Rename { to, .. } => Some(*to),
            BlobMutation::Unset(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Mul,
}

impl ArithOp {
    pub fn sql(&self) -> &'static str {
        match self {
            ArithOp::Add => "+",
            ArithOp::Mul => "*",
        }
    }
}

/// SQL generation for one relational engine.
///
/// Required methods emit engine-specific fragments; the provided methods
/// compile whole operations out of them.
pub trait Dialect: Debug + Send + Sync {
    fn name(&self) -> &'static str;

    fn placeholder_style(&self) -> PlaceholderStyle;

    fn quote_ident(&self, ident: &str) -> String;

    fn quote_literal(&self, value: &str) -> String {
        format!("'{}'", value.replace('\'', "''"))
    }

    /// Storage type of a fixed column.
    fn column_type(&self, column: &ColumnDef) -> String;

    /// Storage type of `_ext`.
    fn json_type(&self) -> &'static str;

    /// Map a declared type from introspection back to a logical type.
    fn parse_column_type(&self, declared: &str) -> Option<FieldType>;

    fn bool_literal(&self, value: bool) -> &'static str {
        if value {
            "1"
        } else {
            "0"
        }
    }

    /// Literal for an empty JSON object.
    fn empty_object(&self) -> &'static str;

    // JSON algebra. `column` is an already quoted column expression.

    /// The JSON value at `path`, typed as the engine's JSON.
    fn json_value(&self, column: &str, path: &[PathSegment]) -> String;

    /// The value at `path` as a plain SQL scalar, for sorting.
    fn json_sort_key(&self, column: &str, path: &[PathSegment]) -> String {
        self.json_value(column, path)
    }

    /// The value at `path` as SQL text, for join keys.
    fn json_text(&self, column: &str, path: &[PathSegment]) -> String;

    /// The numeric value at `path`, NULL when missing or not a number.
    fn json_number(&self, column: &str, path: &[PathSegment]) -> String;

    /// JSON value at `path` suitable as the value argument of a JSON set.
    fn json_copy(&self, column: &str, path: &[PathSegment]) -> String {
        self.json_value(column, path)
    }

    /// Whether `path` exists in `column`.
    fn json_exists(&self, column: &str, path: &[PathSegment]) -> String;

    /// Equality with a non-null literal.
    fn json_eq(&self, column: &str, path: &[PathSegment], value: &Value, params: &mut Params)
        -> String;

    /// Missing or JSON null.
    fn json_is_null(&self, column: &str, path: &[PathSegment]) -> String;

    /// Ordered comparison, only between values of the literal's JSON type.
    fn json_compare(
        &self,
        column: &str,
        path: &[PathSegment],
        op: Comparison,
        value: &Value,
        params: &mut Params,
    ) -> String;

    fn json_regex(
        &self,
        column: &str,
        path: &[PathSegment],
        regex: &RegexOp,
        params: &mut Params,
    ) -> String;

    /// Regex match over a text column.
    fn regex_match(&self, expr: &str, regex: &RegexOp, params: &mut Params) -> String;

    /// JSON set returning the new document. `value` is a SQL expression.
    fn json_set(&self, acc: &str, path: &[PathSegment], value: &str) -> String;

    fn json_remove(&self, acc: &str, path: &[PathSegment]) -> String;

    /// A literal bound as the value argument of a JSON set.
    fn json_set_value(&self, value: &Value, params: &mut Params) -> String;

    /// Whether a JSON set on a nested path creates missing parent objects.
    fn creates_parents(&self) -> bool;

    /// Numeric operand in arithmetic against [`Dialect::json_number`].
    fn numeric_operand(&self, param: Param, params: &mut Params) -> String {
        params.push(param)
    }

    /// Convert a numeric SQL expression into a JSON set value.
    fn number_to_json(&self, expr: String) -> String {
        expr
    }

    /// `$inc`/`$mul` on a JSON value; a missing or non-numeric value counts as 0.
    fn json_arith(
        &self,
        column: &str,
        path: &[PathSegment],
        op: ArithOp,
        operand: &Param,
        params: &mut Params,
    ) -> String {
        let current = self.json_number(column, path);
        let operand = self.numeric_operand(operand.clone(), params);
        self.number_to_json(format!("COALESCE({}, 0) {} {}", current, op.sql(), operand))
    }

    /// `$min`/`$max` on a JSON value; a missing value takes the operand.
    fn json_bound(
        &self,
        column: &str,
        path: &[PathSegment],
        op: Comparison,
        operand: &Param,
        params: &mut Params,
    ) -> String {
        let current = self.json_number(column, path);
        let a = self.numeric_operand(operand.clone(), params);
        let b = self.numeric_operand(operand.clone(), params);
        let c = self.numeric_operand(operand.clone(), params);
        self.number_to_json(format!(
            "CASE WHEN COALESCE({current}, {a}) {} {b} THEN COALESCE({current}, 0) ELSE {c} END",
            op.sql()
        ))
    }

    fn text_cast(&self, expr: String) -> String {
        expr
    }

    fn aggregate(&self, func: AggFunc, expr: &str) -> String {
        format!("{}({})", func.sql(), expr)
    }

    fn limit_clause(&self, limit: Option<u64>, skip: Option<u64>) -> String;

    fn index_hint(&self, _collection: &str, _hint: &str, _target: HintTarget) -> Option<String> {
        None
    }

    // Catalog and DDL.

    fn create_db(&self, db: &str) -> Result<SqlPlan>;

    fn drop_db(&self, db: &str) -> Result<SqlPlan>;

    fn list_dbs(&self) -> Result<SqlPlan>;

    fn create_collection(&self, db: &str, collection: &str, spec: &CollectionSpec)
        -> Result<SqlPlan>;

    fn drop_collection(&self, db: &str, collection: &str) -> Result<SqlPlan> {
        Ok(SqlPlan::single(Statement::execute(
            format!("DROP TABLE IF EXISTS {}", self.table(db, collection)),
            vec![],
        )))
    }

    fn truncate_collection(&self, db: &str, collection: &str) -> Result<SqlPlan> {
        Ok(SqlPlan::single(Statement::execute(
            format!("TRUNCATE TABLE {}", self.table(db, collection)),
            vec![],
        )))
    }

    fn list_collections(&self, db: &str) -> Result<SqlPlan>;

    /// Rows of `(column name, declared type)`.
    fn describe_collection(&self, db: &str, collection: &str) -> Result<SqlPlan>;

    // Provided compilers.

    fn table(&self, db: &str, collection: &str) -> String {
        format!("{}.{}", self.quote_ident(db), self.quote_ident(collection))
    }

    fn new_params(&self) -> Params {
        Params::new(self.placeholder_style())
    }

    fn column_ref(&self, scope: &Scope<'_>, name: &str) -> String {
        match scope.qualifier {
            Some(q) => format!("{}.{}", q, self.quote_ident(name)),
            None => self.quote_ident(name),
        }
    }

    /// `name TYPE [NOT NULL] [DEFAULT ...]`
    fn column_definition(&self, column: &ColumnDef) -> Result<String> {
        let mut sql = format!(
            "{} {}",
            self.quote_ident(&column.name),
            self.column_type(column)
        );
        if !column.nullable {
            sql.push_str(" NOT NULL");
        }
        if let Some(default) = &column.default {
            sql.push_str(" DEFAULT ");
            sql.push_str(&self.default_literal(column, default)?);
        }
        Ok(sql)
    }

    fn default_literal(&self, column: &ColumnDef, value: &Value) -> Result<String> {
        let literal = match (column.ty, value) {
            (_, Value::Null) => "NULL".to_string(),
            (FieldType::Str, Value::String(s)) => self.quote_literal(s),
            (FieldType::Int | FieldType::Float, Value::Number(n)) => n.to_string(),
            (FieldType::Bool, Value::Bool(b)) => self.bool_literal(*b).to_string(),
            (FieldType::Json, v) => format!("({})", self.quote_literal(&v.to_string())),
            (ty, v) => {
                return Err(Error::invalid(format!(
                    "default for '{}' must be {}, got {}",
                    column.name,
                    ty,
                    json_type_name(v)
                )))
            }
        };
        Ok(literal)
    }

    /// Expression indexed for one index key.
    fn index_key_expr(&self, schema: &CollectionSchema, field: &str) -> Result<String> {
        let path = FieldPath::parse(field)?;
        let scope = Scope::new(schema);
        match resolve(schema, &path)? {
            FieldRef::Column { name, .. } => Ok(self.quote_ident(&name)),
            FieldRef::Json { column, segments } => Ok(format!(
                "({})",
                self.json_sort_key(&self.column_ref(&scope, &column), segments)
            )),
        }
    }

    fn index_columns(&self, schema: &CollectionSchema, index: &IndexDef) -> Result<String> {
        let mut keys = Vec::with_capacity(index.keys.len());
        for key in &index.keys {
            let expr = self.index_key_expr(schema, &key.field)?;
            keys.push(if key.ascending {
                expr
            } else {
                format!("{} DESC", expr)
            });
        }
        Ok(keys.join(", "))
    }

    /// Shared `CREATE TABLE` body: `_id`, fixed columns and `_ext`.
    fn table_columns(&self, spec: &CollectionSpec) -> Result<Vec<String>> {
        let mut columns = vec![format!(
            "{} VARCHAR({}) NOT NULL",
            self.quote_ident(ID_FIELD),
            ID_LENGTH
        )];
        for column in &spec.fixed_columns {
            columns.push(self.column_definition(column)?);
        }
        columns.push(format!("{} {}", self.quote_ident(EXT_COLUMN), self.json_type()));
        Ok(columns)
    }

    fn compile_filter(
        &self,
        scope: &Scope<'_>,
        filter: &Filter,
        params: &mut Params,
    ) -> Result<Option<String>> {
        if filter.is_empty() {
            return Ok(None);
        }
        let mut parts = Vec::with_capacity(filter.clauses.len());
        for clause in &filter.clauses {
            match clause {
                Clause::Field { path, condition } => {
                    parts.push(self.compile_condition(scope, path, condition, params)?)
                }
                Clause::Or(branches) => {
                    let mut alternatives = Vec::with_capacity(branches.len());
                    for branch in branches {
                        let compiled = self
                            .compile_filter(scope, branch, params)?
                            .unwrap_or_else(|| "1 = 1".to_string());
                        alternatives.push(format!("({})", compiled));
                    }
                    parts.push(format!("({})", alternatives.join(" OR ")));
                }
            }
        }
        Ok(Some(parts.join(" AND ")))
    }

    fn compile_condition(
        &self,
        scope: &Scope<'_>,
        path: &FieldPath,
        condition: &Condition,
        params: &mut Params,
    ) -> Result<String> {
        let field = resolve(scope.schema, path)?;
        match condition {
            Condition::Eq(value) => self.compile_op(scope, &field, &FilterOp::Eq(value.clone()), params),
            Condition::Ops(ops) => {
                let mut parts = Vec::with_capacity(ops.len());
                for op in ops {
                    parts.push(self.compile_op(scope, &field, op, params)?);
                }
                Ok(parts.join(" AND "))
            }
        }
    }

    fn compile_op(
        &self,
        scope: &Scope<'_>,
        field: &FieldRef<'_>,
        op: &FilterOp,
        params: &mut Params,
    ) -> Result<String> {
        match field {
            FieldRef::Column { name, ty } => {
                Ok(self.column_op(&self.column_ref(scope, name), *ty, op, params))
            }
            FieldRef::Json { column, segments } => {
                Ok(self.json_op(&self.column_ref(scope, column), segments, op, params))
            }
        }
    }

    fn column_op(&self, col: &str, ty: FieldType, op: &FilterOp, params: &mut Params) -> String {
        match op {
            FilterOp::Eq(Value::Null) => format!("{} IS NULL", col),
            FilterOp::Eq(value) => match fixed_operand(ty, value) {
                Some(param) => format!("{} = {}", col, params.push(param)),
                None => "1 = 0".to_string(),
            },
            FilterOp::Ne(Value::Null) => format!("{} IS NOT NULL", col),
            FilterOp::Ne(value) => match fixed_operand(ty, value) {
                Some(param) => format!("({} IS NULL OR {} <> {})", col, col, params.push(param)),
                None => "1 = 1".to_string(),
            },
            FilterOp::In(values) | FilterOp::Nin(values) => {
                let negate = matches!(op, FilterOp::Nin(_));
                let with_null = values.iter().any(Value::is_null);
                let operands: Vec<Param> = values
                    .iter()
                    .filter(|v| !v.is_null())
                    .filter_map(|v| fixed_operand(ty, v))
                    .collect();
                let list = if operands.is_empty() {
                    None
                } else {
                    let placeholders: Vec<String> =
                        operands.into_iter().map(|p| params.push(p)).collect();
                    Some(placeholders.join(", "))
                };
                match (negate, list, with_null) {
                    (false, None, false) => "1 = 0".to_string(),
                    (false, None, true) => format!("{} IS NULL", col),
                    (false, Some(list), false) => format!("{} IN ({})", col, list),
                    (false, Some(list), true) => {
                        format!("({} IN ({}) OR {} IS NULL)", col, list, col)
                    }
                    (true, None, false) => "1 = 1".to_string(),
                    (true, None, true) => format!("{} IS NOT NULL", col),
                    (true, Some(list), false) => {
                        format!("({} IS NULL OR {} NOT IN ({}))", col, col, list)
                    }
                    (true, Some(list), true) => {
                        format!("({} IS NOT NULL AND {} NOT IN ({}))", col, col, list)
                    }
                }
            }
            FilterOp::Regex(regex) => {
                if ty == FieldType::Str {
                    self.regex_match(col, regex, params)
                } else {
                    "1 = 0".to_string()
                }
            }
            FilterOp::Lt(_) | FilterOp::Lte(_) | FilterOp::Gt(_) | FilterOp::Gte(_) => {
                let Some((cmp, value)) = op.comparison() else {
                    return "1 = 0".to_string();
                };
                let operand = match (ty, value) {
                    (FieldType::Int | FieldType::Float, Value::Number(_)) => {
                        Some(Param::from_json(value))
                    }
                    (FieldType::Str, Value::String(s)) => Some(Param::Str(s.clone())),
                    (FieldType::Bool, Value::Bool(b)) => Some(Param::Bool(*b)),
                    _ => None,
                };
                match operand {
                    Some(param) => format!("{} {} {}", col, cmp.sql(), params.push(param)),
                    None => "1 = 0".to_string(),
                }
            }
        }
    }

    fn json_op(
        &self,
        col: &str,
        path: &[PathSegment],
        op: &FilterOp,
        params: &mut Params,
    ) -> String {
        match op {
            FilterOp::Eq(Value::Null) => self.json_is_null(col, path),
            FilterOp::Eq(value) => self.json_eq(col, path, value, params),
            FilterOp::Ne(Value::Null) => format!("NOT ({})", self.json_is_null(col, path)),
            FilterOp::Ne(value) => {
                format!("NOT COALESCE({}, FALSE)", self.json_eq(col, path, value, params))
            }
            FilterOp::In(values) | FilterOp::Nin(values) => {
                let alternatives: Vec<String> = values
                    .iter()
                    .map(|v| match v {
                        Value::Null => self.json_is_null(col, path),
                        v => self.json_eq(col, path, v, params),
                    })
                    .collect();
                let negate = matches!(op, FilterOp::Nin(_));
                match (negate, alternatives.is_empty()) {
                    (false, true) => "1 = 0".to_string(),
                    (true, true) => "1 = 1".to_string(),
                    (false, false) => format!("({})", alternatives.join(" OR ")),
                    (true, false) => {
                        format!("NOT COALESCE(({}), FALSE)", alternatives.join(" OR "))
                    }
                }
            }
            FilterOp::Regex(regex) => self.json_regex(col, path, regex, params),
            FilterOp::Lt(_) | FilterOp::Lte(_) | FilterOp::Gt(_) | FilterOp::Gte(_) => {
                match op.comparison() {
                    Some((cmp, value)) => self.json_compare(col, path, cmp, value, params),
                    None => "1 = 0".to_string(),
                }
            }
        }
    }

    fn compile_sort(&self, scope: &Scope<'_>, sort: &[SortKey]) -> Result<Option<String>> {
        if sort.is_empty() {
            return Ok(None);
        }
        let mut keys = Vec::with_capacity(sort.len());
        for key in sort {
            let expr = match resolve(scope.schema, &key.path)? {
                FieldRef::Column { name, .. } => self.column_ref(scope, &name),
                FieldRef::Json { column, segments } => {
                    self.json_sort_key(&self.column_ref(scope, &column), segments)
                }
            };
            keys.push(format!("{} {}", expr, if key.descending { "DESC" } else { "ASC" }));
        }
        Ok(Some(keys.join(", ")))
    }

    /// Select list and row format for a document query.
    fn compile_projection(
        &self,
        scope: &Scope<'_>,
        projection: Option<&Projection>,
    ) -> Result<(Vec<String>, DocumentFormat)> {
        let mut select = Vec::new();
        let mut format = DocumentFormat::default();
        match projection {
            Some(Projection::Include { fields, with_id }) => {
                if *with_id {
                    self.push_column(scope, &mut select, &mut format, ID_FIELD, Decode::Fixed(FieldType::Str));
                }
                for field in fields {
                    if field.path.is_id() {
                        if !*with_id {
                            self.push_column(scope, &mut select, &mut format, ID_FIELD, Decode::Fixed(FieldType::Str));
                        }
                        continue;
                    }
                    let output = field.output_name();
                    let (expr, decode) = match resolve(scope.schema, &field.path)? {
                        FieldRef::Column { name, ty } => (self.column_ref(scope, &name), Decode::Fixed(ty)),
                        FieldRef::Json { column, segments } => (
                            self.json_value(&self.column_ref(scope, &column), segments),
                            Decode::Json,
                        ),
                    };
                    select.push(format!("{} AS {}", expr, self.quote_ident(output)));
                    format.columns.push(OutputColumn::new(output, output, decode));
                }
            }
            Some(Projection::Exclude { fields, with_id }) => {
                self.push_document_columns(scope, &mut select, &mut format, None);
                format.exclude = fields.clone();
                if !*with_id {
                    format.exclude.push(FieldPath::id());
                }
            }
            None => self.push_document_columns(scope, &mut select, &mut format, None),
        }
        Ok((select, format))
    }

    fn push_column(
        &self,
        scope: &Scope<'_>,
        select: &mut Vec<String>,
        format: &mut DocumentFormat,
        name: &str,
        decode: Decode,
    ) {
        select.push(format!(
            "{} AS {}",
            self.column_ref(scope, name),
            self.quote_ident(name)
        ));
        format.columns.push(OutputColumn::new(name, name, decode));
    }

    /// `_id`, every fixed column and `_ext`; joined columns are labelled `alias|column`.
    fn push_document_columns(
        &self,
        scope: &Scope<'_>,
        select: &mut Vec<String>,
        format: &mut DocumentFormat,
        join: Option<&str>,
    ) {
        let mut columns: Vec<(&str, Decode)> = vec![(ID_FIELD, Decode::Fixed(FieldType::Str))];
        columns.extend(scope.schema.columns.iter().map(|c| (c.name.as_str(), Decode::Fixed(c.ty))));
        columns.push((EXT_COLUMN, Decode::Ext));
        for (name, decode) in columns {
            let label = match join {
                Some(alias) => format!("{}|{}", alias, name),
                None => name.to_string(),
            };
            select.push(format!(
                "{} AS {}",
                self.column_ref(scope, name),
                self.quote_ident(&label)
            ));
            let mut column = OutputColumn::new(label, name, decode);
            if let Some(alias) = join {
                column = column.joined(alias);
            }
            format.columns.push(column);
        }
    }

    fn join_key(&self, scope: &Scope<'_>, path: &FieldPath) -> Result<String> {
        match resolve(scope.schema, path)? {
            FieldRef::Column { name, .. } => Ok(self.text_cast(self.column_ref(scope, &name))),
            FieldRef::Json { column, segments } => {
                Ok(self.json_text(&self.column_ref(scope, &column), segments))
            }
        }
    }

    fn where_clause(&self, sql: &mut String, condition: Option<String>) {
        if let Some(condition) = condition {
            sql.push_str(" WHERE ");
            sql.push_str(&condition);
        }
    }

    fn hint_clause(&self, sql: &mut String, collection: &str, hint: Option<&str>, target: HintTarget) {
        if let Some(clause) = hint.and_then(|h| self.index_hint(collection, h, target)) {
            sql.push(' ');
            sql.push_str(&clause);
        }
    }

    fn compile_insert(&self, target: &Target<'_>, docs: &[Document]) -> Result<SqlPlan> {
        if docs.is_empty() {
            return Err(Error::invalid("nothing to insert"));
        }
        let mut columns = vec![self.quote_ident(ID_FIELD)];
        columns.extend(target.schema.columns.iter().map(|c| self.quote_ident(&c.name)));
        columns.push(self.quote_ident(EXT_COLUMN));

        let mut params = self.new_params();
        let mut rows = Vec::with_capacity(docs.len());
        for doc in docs {
            let id = match doc.get(ID_FIELD) {
                Some(Value::String(id)) => id.clone(),
                _ => return Err(Error::invalid("document is missing a string _id")),
            };
            let mut values = vec![params.push(Param::Str(id))];
            for column in &target.schema.columns {
                let value = match doc.get(&column.name) {
                    Some(v) => v,
                    None => column.default.as_ref().unwrap_or(&Value::Null),
                };
                values.push(params.push(Param::for_column(column.ty, value, &column.name)?));
            }
            let ext: Map<String, Value> = doc
                .iter()
                .filter(|(k, _)| k.as_str() != ID_FIELD && !target.schema.is_fixed(k))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            values.push(params.push(Param::Json(Value::Object(ext))));
            rows.push(format!("({})", values.join(", ")));
        }

        let sql = format!(
            "INSERT INTO {} ({}) VALUES {}",
            self.table(target.db, target.collection),
            columns.join(", "),
            rows.join(", ")
        );
        Ok(SqlPlan::single(Statement::execute(sql, params.into_vec())))
    }

    /// SET assignments. Order matters for engines that evaluate SET left to
    /// right: columns read by other assignments are cleared last.
    fn compile_assignments(
        &self,
        scope: &Scope<'_>,
        update: &UpdateSpec,
        params: &mut Params,
    ) -> Result<Vec<String>> {
        let mut fixed: Vec<(String, &UpdateOp, FieldType)> = Vec::new();
        let mut blobs: Vec<(String, Vec<BlobMutation<'_>>)> = Vec::new();
        let mut cleared: Vec<String> = Vec::new();

        for op in &update.ops {
            if let UpdateOp::Rename { from, to } = op {
                match (resolve(scope.schema, from)?, resolve(scope.schema, to)?) {
                    (FieldRef::Column { name: src, ty: src_ty }, FieldRef::Column { name: dst, ty: dst_ty }) => {
                        if src_ty != dst_ty {
                            return Err(Error::invalid(format!(
                                "$rename from {} column '{}' to {} column '{}'",
                                src_ty, src, dst_ty, dst
                            )));
                        }
                        fixed.push((dst, op, dst_ty));
                        cleared.push(src);
                    }
                    (
                        FieldRef::Json { column: src, segments: from },
                        FieldRef::Json { column: dst, segments: to },
                    ) if src == dst && !from.is_empty() && !to.is_empty() => {
                        blob_for(&mut blobs, &dst).push(BlobMutation::Rename { from, to });
                    }
                    _ => {
                        return Err(Error::unsupported(format!(
                            "$rename of '{}' to '{}' across storage columns",
                            from, to
                        )))
                    }
                }
                continue;
            }

            let path = op.target();
            match resolve(scope.schema, path)? {
                FieldRef::Json { column, segments } if !segments.is_empty() => {
                    let mutation = match op {
                        UpdateOp::Set { value, .. } => BlobMutation::Set(segments, value),
                        UpdateOp::Unset { .. } => BlobMutation::Unset(segments),
                        UpdateOp::Inc { amount, .. } => BlobMutation::Arith {
                            path: segments,
                            op: ArithOp::Add,
                            operand: Param::number(&Value::Number(amount.clone()), path.as_str())?,
                        },
                        UpdateOp::Mul { factor, .. } => BlobMutation::Arith {
                            path: segments,
                            op: ArithOp::Mul,
                            operand: Param::number(&Value::Number(factor.clone()), path.as_str())?,
                        },
                        UpdateOp::Min { value, .. } => BlobMutation::Bound {
                            path: segments,
                            op: Comparison::Lt,
                            operand: Param::number(value, path.as_str())?,
                        },
                        UpdateOp::Max { value, .. } => BlobMutation::Bound {
                            path: segments,
                            op: Comparison::Gt,
                            operand: Param::number(value, path.as_str())?,
                        },
                        UpdateOp::Rename { .. } => continue,
                    };
                    blob_for(&mut blobs, &column).push(mutation);
                }
                FieldRef::Json { column, .. } => {
                    if column == EXT_COLUMN {
                        return Err(Error::invalid("the extension column cannot be updated directly"));
                    }
                    match op {
                        UpdateOp::Unset { .. } => cleared.push(column),
                        UpdateOp::Set { .. } => fixed.push((column, op, FieldType::Json)),
                        other => {
                            return Err(Error::invalid(format!(
                                "{} needs a numeric field, '{}' is json",
                                other.operator(),
                                path
                            )))
                        }
                    }
                }
                FieldRef::Column { name, ty } => match op {
                    UpdateOp::Unset { .. } => cleared.push(name),
                    _ => fixed.push((name, op, ty)),
                },
            }
        }

        let mut assignments = Vec::new();
        for (name, op, ty) in &fixed {
            let (name, ty) = (name.as_str(), *ty);
            let col = self.column_ref(scope, name);
            let value = match op {
                UpdateOp::Set { value, .. } => params.push(Param::for_column(ty, value, name)?),
                UpdateOp::Inc { amount, .. } | UpdateOp::Mul { factor: amount, .. } => {
                    if !ty.is_numeric() {
                        return Err(Error::invalid(format!(
                            "{} needs a numeric field, '{}' is {}",
                            op.operator(),
                            name,
                            ty
                        )));
                    }
                    let sign = if matches!(op, UpdateOp::Inc { .. }) { "+" } else { "*" };
                    let operand = params.push(Param::number(&Value::Number(amount.clone()), name)?);
                    format!("COALESCE({}, 0) {} {}", col, sign, operand)
                }
                UpdateOp::Min { value, .. } | UpdateOp::Max { value, .. } => {
                    if !ty.is_numeric() {
                        return Err(Error::invalid(format!(
                            "{} needs a numeric field, '{}' is {}",
                            op.operator(),
                            name,
                            ty
                        )));
                    }
                    let cmp = if matches!(op, UpdateOp::Min { .. }) { "<" } else { ">" };
                    let a = params.push(Param::number(value, name)?);
                    let b = params.push(Param::number(value, name)?);
                    let c = params.push(Param::number(value, name)?);
                    format!(
                        "CASE WHEN COALESCE({col}, {a}) {cmp} {b} THEN COALESCE({col}, 0) ELSE {c} END"
                    )
                }
                UpdateOp::Rename { from, .. } => self.column_ref(scope, from.root()),
                UpdateOp::Unset { .. } => continue,
            };
            assignments.push(format!("{} = {}", col, value));
        }

        for (column, mutations) in &blobs {
            let col = self.column_ref(scope, column);
            let folded = self.fold_blob(&col, mutations, params);
            assignments.push(format!("{} = {}", col, folded));
        }

        for name in cleared {
            assignments.push(format!("{} = NULL", self.column_ref(scope, &name)));
        }
        Ok(assignments)
    }

    /// Fold every mutation of one blob column into one nested expression.
    /// Current values are always read from the unmodified column.
    fn fold_blob(&self, col: &str, mutations: &[BlobMutation<'_>], params: &mut Params) -> String {
        let mut acc = format!("COALESCE({}, {})", col, self.empty_object());

        if !self.creates_parents() {
            let mut ensured: Vec<&[PathSegment]> = Vec::new();
            for path in mutations.iter().filter_map(BlobMutation::written) {
                for depth in 1..path.len() {
                    let prefix = &path[..depth];
                    if matches!(path[depth], PathSegment::Index(_)) || ensured.contains(&prefix) {
                        continue;
                    }
                    let current = format!(
                        "COALESCE({}, {})",
                        self.json_value(col, prefix),
                        self.empty_object()
                    );
                    acc = self.json_set(&acc, prefix, &current);
                    ensured.push(prefix);
                }
            }
        }

        for mutation in mutations {
            if let BlobMutation::Rename { from, to } = mutation {
                let moved = self.json_remove(&self.json_set(&acc, to, &self.json_copy(col, from)), from);
                acc = format!(
                    "CASE WHEN {} THEN {} ELSE {} END",
                    self.json_exists(col, from),
                    moved,
                    acc
                );
            }
        }

        for mutation in mutations {
            acc = match mutation {
                BlobMutation::Set(path, value) => {
                    let value = self.json_set_value(value, params);
                    self.json_set(&acc, path, &value)
                }
                BlobMutation::Arith { path, op, operand } => {
                    let value = self.json_arith(col, path, *op, operand, params);
                    self.json_set(&acc, path, &value)
                }
                BlobMutation::Bound { path, op, operand } => {
                    let value = self.json_bound(col, path, *op, operand, params);
                    self.json_set(&acc, path, &value)
                }
                BlobMutation::Unset(_) | BlobMutation::Rename { .. } => continue,
            };
        }

        for mutation in mutations {
            if let BlobMutation::Unset(path) = mutation {
                acc = self.json_remove(&acc, path);
            }
        }
        acc
    }

    fn compile_update(
        &self,
        target: &Target<'_>,
        filter: &Filter,
        update: &UpdateSpec,
        hint: Option<&str>,
    ) -> Result<SqlPlan> {
        let scope = Scope::new(target.schema);
        let mut params = self.new_params();
        let mut sql = format!("UPDATE {}", self.table(target.db, target.collection));
        self.hint_clause(&mut sql, target.collection, hint, HintTarget::Update);
        let assignments = self.compile_assignments(&scope, update, &mut params)?;
        if assignments.is_empty() {
            return Err(Error::invalid("update has no assignments"));
        }
        sql.push_str(" SET ");
        sql.push_str(&assignments.join(", "));
        let condition = self.compile_filter(&scope, filter, &mut params)?;
        self.where_clause(&mut sql, condition);
        Ok(SqlPlan::single(Statement::execute(sql, params.into_vec())))
    }

    fn compile_delete(&self, target: &Target<'_>, filter: &Filter, hint: Option<&str>) -> Result<SqlPlan> {
        let scope = Scope::new(target.schema);
        let mut params = self.new_params();
        let mut sql = format!("DELETE FROM {}", self.table(target.db, target.collection));
        self.hint_clause(&mut sql, target.collection, hint, HintTarget::Delete);
        let condition = self.compile_filter(&scope, filter, &mut params)?;
        self.where_clause(&mut sql, condition);
        Ok(SqlPlan::single(Statement::execute(sql, params.into_vec())))
    }

    fn compile_find(
        &self,
        target: &Target<'_>,
        query: &Query,
        joined: &[CollectionSchema],
    ) -> Result<SqlPlan> {
        if joined.len() != query.joins.len() {
            return Err(Error::invalid("join schemas do not match join descriptors"));
        }
        let base_alias = "t0";
        let scope = if query.joins.is_empty() {
            Scope::new(target.schema)
        } else {
            Scope::qualified(target.schema, base_alias)
        };
        let mut params = self.new_params();
        let (mut select, mut format) = self.compile_projection(&scope, query.projection.as_ref())?;

        let aliases: Vec<String> = (1..=query.joins.len()).map(|i| format!("j{}", i)).collect();
        for ((join, schema), alias) in query.joins.iter().zip(joined).zip(&aliases) {
            if join.alias.contains('|') {
                return Err(Error::invalid(format!("join alias '{}' may not contain '|'", join.alias)));
            }
            let join_scope = Scope::qualified(schema, alias);
            self.push_document_columns(&join_scope, &mut select, &mut format, Some(&join.alias));
        }

        let mut sql = format!(
            "SELECT {} FROM {}",
            select.join(", "),
            self.table(target.db, target.collection)
        );
        if !query.joins.is_empty() {
            sql.push_str(" AS ");
            sql.push_str(base_alias);
        }
        self.hint_clause(&mut sql, target.collection, query.hint.as_deref(), HintTarget::Select);
        for ((join, schema), alias) in query.joins.iter().zip(joined).zip(&aliases) {
            let join_scope = Scope::qualified(schema, alias);
            let kind = match join.kind {
                JoinKind::Inner => "INNER JOIN",
                JoinKind::Left => "LEFT JOIN",
            };
            sql.push_str(&format!(
                " {} {} AS {} ON {} = {}",
                kind,
                self.table(target.db, &join.collection),
                alias,
                self.join_key(&scope, &join.local_field)?,
                self.join_key(&join_scope, &join.foreign_field)?
            ));
        }

        let condition = self.compile_filter(&scope, &query.filter, &mut params)?;
        self.where_clause(&mut sql, condition);
        if let Some(order) = self.compile_sort(&scope, &query.sort)? {
            sql.push_str(" ORDER BY ");
            sql.push_str(&order);
        }
        let limit = self.limit_clause(query.limit, query.skip);
        if !limit.is_empty() {
            sql.push(' ');
            sql.push_str(&limit);
        }
        Ok(SqlPlan::single(Statement::query(sql, params.into_vec())).rows(RowFormat::Documents(format)))
    }

    fn compile_count(&self, target: &Target<'_>, filter: &Filter, hint: Option<&str>) -> Result<SqlPlan> {
        let scope = Scope::new(target.schema);
        let mut params = self.new_params();
        let mut sql = format!("SELECT COUNT(*) FROM {}", self.table(target.db, target.collection));
        self.hint_clause(&mut sql, target.collection, hint, HintTarget::Select);
        let condition = self.compile_filter(&scope, filter, &mut params)?;
        self.where_clause(&mut sql, condition);
        Ok(SqlPlan::single(Statement::scalar(sql, params.into_vec())).rows(RowFormat::Scalar))
    }

    fn compile_group(&self, target: &Target<'_>, query: &GroupQuery) -> Result<SqlPlan> {
        let scope = Scope::new(target.schema);
        let mut params = self.new_params();
        let mut select = Vec::new();
        let mut group_by = Vec::new();
        let mut outputs: Vec<OutputColumn> = Vec::new();

        for key in &query.group.keys {
            let (expr, decode) = match resolve(scope.schema, &key.path)? {
                FieldRef::Column { name, ty } => (self.column_ref(&scope, &name), Decode::Fixed(ty)),
                FieldRef::Json { column, segments } => (
                    self.json_value(&self.column_ref(&scope, &column), segments),
                    Decode::Json,
                ),
            };
            select.push(format!("{} AS {}", expr, self.quote_ident(&key.output)));
            group_by.push(expr);
            outputs.push(OutputColumn::new(&key.output, &key.output, decode));
        }
        for agg in &query.group.aggregates {
            let arg = match &agg.arg {
                AggArg::Const(n) => self.numeric_operand(Param::from_json(&Value::Number(n.clone())), &mut params),
                AggArg::Field(path) => match resolve(scope.schema, path)? {
                    FieldRef::Column { name, .. } => self.column_ref(&scope, &name),
                    FieldRef::Json { column, segments } => {
                        self.json_number(&self.column_ref(&scope, &column), segments)
                    }
                },
            };
            select.push(format!(
                "{} AS {}",
                self.aggregate(agg.func, &arg),
                self.quote_ident(&agg.output)
            ));
            outputs.push(OutputColumn::new(&agg.output, &agg.output, Decode::Number));
        }
        if outputs.is_empty() {
            return Err(Error::invalid("group has no outputs"));
        }

        let mut sql = format!(
            "SELECT {} FROM {}",
            select.join(", "),
            self.table(target.db, target.collection)
        );
        self.hint_clause(&mut sql, target.collection, query.hint.as_deref(), HintTarget::Select);
        let condition = self.compile_filter(&scope, &query.filter, &mut params)?;
        self.where_clause(&mut sql, condition);
        if !group_by.is_empty() {
            sql.push_str(" GROUP BY ");
            sql.push_str(&group_by.join(", "));
        }

        if let Some(fields) = &query.fields {
            let mut kept = Vec::with_capacity(fields.len());
            for field in fields {
                match outputs.iter().find(|o| &o.output == field) {
                    Some(column) => kept.push(column.clone()),
                    None => return Err(Error::invalid(format!("'{}' is not a group output", field))),
                }
            }
            let projection: Vec<String> = kept.iter().map(|c| self.quote_ident(&c.label)).collect();
            sql = format!("SELECT {} FROM ({}) AS g", projection.join(", "), sql);
            outputs = kept;
        }

        if !query.sort.is_empty() {
            let mut keys = Vec::with_capacity(query.sort.len());
            for key in &query.sort {
                if !outputs.iter().any(|o| o.output == key.path.as_str()) {
                    return Err(Error::invalid(format!("cannot sort by '{}', not a group output", key.path)));
                }
                keys.push(format!(
                    "{} {}",
                    self.quote_ident(key.path.as_str()),
                    if key.descending { "DESC" } else { "ASC" }
                ));
            }
            sql.push_str(" ORDER BY ");
            sql.push_str(&keys.join(", "));
        }
        let limit = self.limit_clause(query.limit, query.skip);
        if !limit.is_empty() {
            sql.push(' ');
            sql.push_str(&limit);
        }

        let format = DocumentFormat {
            columns: outputs,
            exclude: Vec::new(),
        };
        Ok(SqlPlan::single(Statement::query(sql, params.into_vec())).rows(RowFormat::Documents(format)))
    }

    /// The single entry point used by the engine.
    fn generate_sql_plan(&self, operation: Operation<'_>) -> Result<SqlPlan> {
        let plan = match operation {
            Operation::CreateDb { db } => self.create_db(db)?,
            Operation::DropDb { db } => self.drop_db(db)?,
            Operation::ListDbs => self.list_dbs()?,
            Operation::CreateCollection { db, collection, spec } => {
                spec.validate()?;
                self.create_collection(db, collection, spec)?
            }
            Operation::DropCollection { db, collection } => self.drop_collection(db, collection)?,
            Operation::TruncateCollection { db, collection } => {
                self.truncate_collection(db, collection)?
            }
            Operation::ListCollections { db } => self.list_collections(db)?,
            Operation::DescribeCollection { db, collection } => {
                self.describe_collection(db, collection)?
            }
            Operation::Insert { target, docs } => self.compile_insert(&target, docs)?,
            Operation::Update {
                target,
                filter,
                update,
                hint,
            } => self.compile_update(&target, filter, update, hint)?,
            Operation::Delete {
                target,
                filter,
                hint,
            } => self.compile_delete(&target, filter, hint)?,
            Operation::Find {
                target,
                query,
                joined,
            } => self.compile_find(&target, query, joined)?,
            Operation::Count {
                target,
                filter,
                hint,
            } => self.compile_count(&target, filter, hint)?,
            Operation::Group { target, query } => self.compile_group(&target, query)?,
        };
        plan.validate()?;
        Ok(plan)
    }
}

fn blob_for<'v, 'p>(
    blobs: &'v mut Vec<(String, Vec<BlobMutation<'p>>)>,
    column: &str,
) -> &'v mut Vec<BlobMutation<'p>> {
    let index = match blobs.iter().position(|(c, _)| c == column) {
        Some(index) => index,
        None => {
            blobs.push((column.to_string(), Vec::new()));
            blobs.len() - 1
        }
    };
    &mut blobs[index].1
}

/// Render path segments as a `$.a.b[0]` JSON path. Keys are always quoted.
pub(crate) fn dollar_path(path: &[PathSegment]) -> String {
    let mut out = String::from("$");
    for segment in path {
        match segment {
            PathSegment::Key(key) => {
                out.push_str(".\"");
                out.push_str(&key.replace('\\', "\\\\").replace('"', "\\\""));
                out.push('"');
            }
            PathSegment::Index(i) => out.push_str(&format!("[{}]", i)),
        }
    }
    out
}
