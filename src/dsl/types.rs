//! Typed forms of the caller-facing filter/update/projection/sort/group DSL.
//!
//! Every operator is a closed enum variant, so compilers match exhaustively
//! and an unknown `$` key is rejected while parsing instead of being ignored.

use serde_json::{Number, Value};

use super::path::FieldPath;

/// Implicit AND over its clauses. An empty filter matches every row.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Filter {
    pub clauses: Vec<Clause>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Clause {
    Field { path: FieldPath, condition: Condition },
    Or(Vec<Filter>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// `{field: literal}`; `null` matches missing fields too.
    Eq(Value),
    /// `{field: {$op: v, ...}}`, ANDed.
    Ops(Vec<FilterOp>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum FilterOp {
    Eq(Value),
    Ne(Value),
    Lt(Value),
    Lte(Value),
    Gt(Value),
    Gte(Value),
    In(Vec<Value>),
    Nin(Vec<Value>),
    Regex(RegexOp),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Lt,
    Lte,
    Gt,
    Gte,
}

impl Comparison {
    pub fn sql(&self) -> &'static str {
        match self {
            Comparison::Lt => "<",
            Comparison::Lte => "<=",
            Comparison::Gt => ">",
            Comparison::Gte => ">=",
        }
    }
}

impl FilterOp {
    /// The ordered comparison carried by `$lt/$lte/$gt/$gte`.
    pub fn comparison(&self) -> Option<(Comparison, &Value)> {
        match self {
            FilterOp::Lt(v) => Some((Comparison::Lt, v)),
            FilterOp::Lte(v) => Some((Comparison::Lte, v)),
            FilterOp::Gt(v) => Some((Comparison::Gt, v)),
            FilterOp::Gte(v) => Some((Comparison::Gte, v)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RegexOp {
    pub pattern: String,
    pub case_insensitive: bool,
}

impl Filter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn by_id(id: impl Into<String>) -> Self {
        Self {
            clauses: vec![Clause::Field {
                path: FieldPath::id(),
                condition: Condition::Eq(Value::String(id.into())),
            }],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    /// Whether a top-level clause fixes `_id` to one string, so at most one
    /// row can match. `$in`, `$ne` and ranges over `_id` do not count.
    pub fn pins_id(&self) -> bool {
        self.clauses.iter().any(|c| match c {
            Clause::Field { path, condition } if path.is_id() => match condition {
                Condition::Eq(value) => value.is_string(),
                Condition::Ops(ops) => ops
                    .iter()
                    .any(|op| matches!(op, FilterOp::Eq(Value::String(_)))),
            },
            _ => false,
        })
    }

    /// Top-level `{field: literal}` clauses, the seed of an upserted document.
    pub fn equality_fields(&self) -> impl Iterator<Item = (&FieldPath, &Value)> {
        self.clauses.iter().filter_map(|c| match c {
            Clause::Field {
                path,
                condition: Condition::Eq(value),
            } => Some((path, value)),
            _ => None,
        })
    }

    /// Every field path referenced, `$or` branches included.
    pub fn paths(&self) -> Vec<&FieldPath> {
        let mut out = Vec::new();
        for clause in &self.clauses {
            match clause {
                Clause::Field { path, .. } => out.push(path),
                Clause::Or(branches) => {
                    for branch in branches {
                        out.extend(branch.paths());
                    }
                }
            }
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOp {
    Set { path: FieldPath, value: Value },
    Unset { path: FieldPath },
    Inc { path: FieldPath, amount: Number },
    Mul { path: FieldPath, factor: Number },
    Min { path: FieldPath, value: Value },
    Max { path: FieldPath, value: Value },
    Rename { from: FieldPath, to: FieldPath },
}

impl UpdateOp {
    /// The path written by this operation.
    pub fn target(&self) -> &FieldPath {
        match self {
            UpdateOp::Set { path, .. }
            | UpdateOp::Unset { path }
            | UpdateOp::Inc { path, .. }
            | UpdateOp::Mul { path, .. }
            | UpdateOp::Min { path, .. }
            | UpdateOp::Max { path, .. } => path,
            UpdateOp::Rename { to, .. } => to,
        }
    }

    pub fn operator(&self) -> &'static str {
        match self {
            UpdateOp::Set { .. } => "$set",
            UpdateOp::Unset { .. } => "$unset",
            UpdateOp::Inc { .. } => "$inc",
            UpdateOp::Mul { .. } => "$mul",
            UpdateOp::Min { .. } => "$min",
            UpdateOp::Max { .. } => "$max",
            UpdateOp::Rename { .. } => "$rename",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct UpdateSpec {
    pub ops: Vec<UpdateOp>,
}

impl UpdateSpec {
    /// Values an upsert seeds the inserted document with.
    /// `$mul` on a missing field yields 0.
    pub fn upsert_values(&self) -> Vec<(&FieldPath, Value)> {
        self.ops
            .iter()
            .filter_map(|op| match op {
                UpdateOp::Set { path, value }
                | UpdateOp::Min { path, value }
                | UpdateOp::Max { path, value } => Some((path, value.clone())),
                UpdateOp::Inc { path, amount } => Some((path, Value::Number(amount.clone()))),
                UpdateOp::Mul { path, .. } => Some((path, Value::from(0))),
                UpdateOp::Unset { .. } | UpdateOp::Rename { .. } => None,
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProjectedField {
    pub path: FieldPath,
    pub alias: Option<String>,
}

impl ProjectedField {
    pub fn output_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(self.path.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Projection {
    /// Only these fields (plus `_id` unless excluded).
    Include {
        fields: Vec<ProjectedField>,
        with_id: bool,
    },
    /// Everything except these fields.
    Exclude { fields: Vec<FieldPath>, with_id: bool },
}

#[derive(Debug, Clone, PartialEq)]
pub struct SortKey {
    pub path: FieldPath,
    pub descending: bool,
}

impl SortKey {
    pub fn asc(path: FieldPath) -> Self {
        Self {
            path,
            descending: false,
        }
    }

    pub fn desc(path: FieldPath) -> Self {
        Self {
            path,
            descending: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggFunc {
    Sum,
    Avg,
    Min,
    Max,
}

impl AggFunc {
    pub fn sql(&self) -> &'static str {
        match self {
            AggFunc::Sum => "SUM",
            AggFunc::Avg => "AVG",
            AggFunc::Min => "MIN",
            AggFunc::Max => "MAX",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AggArg {
    Field(FieldPath),
    Const(Number),
}

#[derive(Debug, Clone, PartialEq)]
pub struct GroupKey {
    /// Output name; dotted names (`_id.k`) nest in the returned document.
    pub output: String,
    pub path: FieldPath,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Aggregate {
    pub output: String,
    pub func: AggFunc,
    pub arg: AggArg,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct GroupSpec {
    pub keys: Vec<GroupKey>,
    pub aggregates: Vec<Aggregate>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JoinKind {
    Inner,
    #[default]
    Left,
}

/// Join another collection and nest its matching document under `alias`.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinSpec {
    pub collection: String,
    pub local_field: FieldPath,
    pub foreign_field: FieldPath,
    pub alias: String,
    pub kind: JoinKind,
}

/// Everything `query_list` needs besides the collection and session.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Query {
    pub filter: Filter,
    pub projection: Option<Projection>,
    pub sort: Vec<SortKey>,
    pub skip: Option<u64>,
    pub limit: Option<u64>,
    pub hint: Option<String>,
    pub joins: Vec<JoinSpec>,
}

impl Query {
    pub fn new(filter: Filter) -> Self {
        Self {
            filter,
            ..Default::default()
        }
    }

    pub fn projection(mut self, projection: Projection) -> Self {
        self.projection = Some(projection);
        self
    }

    pub fn sort(mut self, sort: Vec<SortKey>) -> Self {
        self.sort = sort;
        self
    }

    pub fn skip(mut self, skip: u64) -> Self {
        self.skip = Some(skip);
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn hint(mut self, index: impl Into<String>) -> Self {
        self.hint = Some(index.into());
        self
    }

    pub fn join(mut self, join: JoinSpec) -> Self {
        self.joins.push(join);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct GroupQuery {
    pub filter: Filter,
    pub group: GroupSpec,
    /// Restrict the returned outputs; wraps the grouped select.
    pub fields: Option<Vec<String>>,
    /// Sort over output names.
    pub sort: Vec<SortKey>,
    pub skip: Option<u64>,
    pub limit: Option<u64>,
    pub hint: Option<String>,
}

impl GroupQuery {
    pub fn new(filter: Filter, group: GroupSpec) -> Self {
        Self {
            filter,
            group,
            ..Default::default()
        }
    }

    pub fn fields(mut self, fields: Vec<String>) -> Self {
        self.fields = Some(fields);
        self
    }

    pub fn sort(mut self, sort: Vec<SortKey>) -> Self {
        self.sort = sort;
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_only_string_equality_pins_id() {
        assert!(Filter::by_id("abc").pins_id());
        assert!(!Filter::all().pins_id());

        let pinned = |v| crate::dsl::parse_filter(&v).unwrap().pins_id();
        assert!(pinned(json!({"_id": {"$eq": "abc"}})));
        assert!(pinned(json!({"_id": {"$eq": "abc", "$ne": "x"}, "n": 1})));
        assert!(!pinned(json!({"_id": {"$in": ["a", "b"]}})));
        assert!(!pinned(json!({"_id": {"$ne": "a"}})));
        assert!(!pinned(json!({"_id": {"$gt": "a"}})));
        assert!(!pinned(json!({"_id": {"$regex": "^a"}})));
        assert!(!pinned(json!({"_id": null})));
        assert!(!pinned(json!({"$or": [{"_id": "a"}, {"_id": "b"}]})));
    }

    #[test]
    fn test_upsert_values_substitute_zero_for_mul() {
        let spec = UpdateSpec {
            ops: vec![
                UpdateOp::Set {
                    path: FieldPath::parse("a").unwrap(),
                    value: json!("x"),
                },
                UpdateOp::Mul {
                    path: FieldPath::parse("m").unwrap(),
                    factor: Number::from(3),
                },
                UpdateOp::Unset {
                    path: FieldPath::parse("u").unwrap(),
                },
            ],
        };
        let values = spec.upsert_values();
        assert_eq!(values.len(), 2);
        assert_eq!(values[0].1, json!("x"));
        assert_eq!(values[1].1, json!(0));
    }

    #[test]
    fn test_projected_output_name() {
        let field = ProjectedField {
            path: FieldPath::parse("a.b").unwrap(),
            alias: None,
        };
        assert_eq!(field.output_name(), "a.b");
        let aliased = ProjectedField {
            path: FieldPath::parse("a.b").unwrap(),
            alias: Some("ab".into()),
        };
        assert_eq!(aliased.output_name(), "ab");
    }
}
