//! JSON → typed DSL. All structural validation happens here so the dialect
//! compilers only ever see well-formed expressions.

use serde_json::{Map, Number, Value};

use super::path::FieldPath;
use super::types::*;
use crate::error::{Error, Result};

pub fn parse_filter(value: &Value) -> Result<Filter> {
    match value {
        Value::Null => Ok(Filter::all()),
        Value::Object(map) => parse_filter_map(map),
        other => Err(Error::invalid(format!(
            "filter must be an object, got {}",
            other
        ))),
    }
}

fn parse_filter_map(map: &Map<String, Value>) -> Result<Filter> {
    let mut clauses = Vec::with_capacity(map.len());
    for (key, value) in map {
        if key == "$or" {
            clauses.push(parse_or(value)?);
            continue;
        }
        if key.starts_with('$') {
            return Err(Error::unsupported(format!("filter operator '{}'", key)));
        }
        let path = FieldPath::parse(key)?;
        let condition = parse_condition(&path, value)?;
        clauses.push(Clause::Field { path, condition });
    }
    Ok(Filter { clauses })
}

fn parse_or(value: &Value) -> Result<Clause> {
    let branches = match value {
        Value::Array(items) if !items.is_empty() => items,
        _ => {
            return Err(Error::invalid(
                "$or expects a non-empty array of filter objects",
            ))
        }
    };
    let mut filters = Vec::with_capacity(branches.len());
    for branch in branches {
        match branch {
            Value::Object(map) => filters.push(parse_filter_map(map)?),
            other => {
                return Err(Error::invalid(format!(
                    "$or branch must be an object, got {}",
                    other
                )))
            }
        }
    }
    Ok(Clause::Or(filters))
}

fn parse_condition(path: &FieldPath, value: &Value) -> Result<Condition> {
    let map = match value {
        Value::Object(map) if map.keys().any(|k| k.starts_with('$')) => map,
        literal => return Ok(Condition::Eq(literal.clone())),
    };
    if !map.keys().all(|k| k.starts_with('$')) {
        return Err(Error::invalid(format!(
            "field '{}' mixes operators and plain keys",
            path
        )));
    }

    let options = match map.get("$options") {
        None => None,
        Some(Value::String(s)) => Some(s.as_str()),
        Some(other) => {
            return Err(Error::invalid(format!(
                "$options on '{}' must be a string, got {}",
                path, other
            )))
        }
    };

    let mut ops = Vec::with_capacity(map.len());
    for (op, operand) in map {
        let parsed = match op.as_str() {
            "$eq" => FilterOp::Eq(operand.clone()),
            "$ne" => FilterOp::Ne(operand.clone()),
            "$lt" => FilterOp::Lt(comparable(path, op, operand)?),
            "$lte" => FilterOp::Lte(comparable(path, op, operand)?),
            "$gt" => FilterOp::Gt(comparable(path, op, operand)?),
            "$gte" => FilterOp::Gte(comparable(path, op, operand)?),
            "$in" => FilterOp::In(list_operand(path, op, operand)?),
            "$nin" => FilterOp::Nin(list_operand(path, op, operand)?),
            "$regex" => FilterOp::Regex(regex_operand(path, operand, options)?),
            "$options" => {
                if !map.contains_key("$regex") {
                    return Err(Error::invalid(format!(
                        "$options on '{}' requires $regex",
                        path
                    )));
                }
                continue;
            }
            other => {
                return Err(Error::unsupported(format!(
                    "filter operator '{}' on '{}'",
                    other, path
                )))
            }
        };
        ops.push(parsed);
    }
    Ok(Condition::Ops(ops))
}

fn comparable(path: &FieldPath, op: &str, operand: &Value) -> Result<Value> {
    match operand {
        Value::Number(_) | Value::String(_) | Value::Bool(_) => Ok(operand.clone()),
        other => Err(Error::invalid(format!(
            "{} on '{}' needs a scalar operand, got {}",
            op, path, other
        ))),
    }
}

fn list_operand(path: &FieldPath, op: &str, operand: &Value) -> Result<Vec<Value>> {
    match operand {
        Value::Array(items) => Ok(items.clone()),
        other => Err(Error::invalid(format!(
            "{} on '{}' needs an array, got {}",
            op, path, other
        ))),
    }
}

fn regex_operand(path: &FieldPath, operand: &Value, options: Option<&str>) -> Result<RegexOp> {
    let pattern = operand.as_str().ok_or_else(|| {
        Error::invalid(format!("$regex on '{}' needs a string pattern", path))
    })?;
    let mut case_insensitive = false;
    for flag in options.unwrap_or("").chars() {
        match flag {
            'i' => case_insensitive = true,
            other => {
                return Err(Error::unsupported(format!(
                    "$options flag '{}' on '{}'",
                    other, path
                )))
            }
        }
    }
    Ok(RegexOp {
        pattern: pattern.to_string(),
        case_insensitive,
    })
}

pub fn parse_update(value: &Value) -> Result<UpdateSpec> {
    let map = value
        .as_object()
        .ok_or_else(|| Error::invalid(format!("update must be an object, got {}", value)))?;
    if map.is_empty() {
        return Err(Error::invalid("update has no operators"));
    }

    let mut ops = Vec::new();
    for (op, fields) in map {
        let fields = match fields {
            Value::Object(fields) => fields,
            _ if !op.starts_with('$') => {
                return Err(Error::invalid(format!(
                    "update key '{}' is not an operator",
                    op
                )))
            }
            other => {
                return Err(Error::invalid(format!(
                    "{} expects an object of fields, got {}",
                    op, other
                )))
            }
        };
        for (field, operand) in fields {
            let path = FieldPath::parse(field)?;
            let parsed = match op.as_str() {
                "$set" => UpdateOp::Set {
                    path,
                    value: operand.clone(),
                },
                "$unset" => UpdateOp::Unset { path },
                "$inc" => UpdateOp::Inc {
                    amount: numeric(&path, op, operand)?,
                    path,
                },
                "$mul" => UpdateOp::Mul {
                    factor: numeric(&path, op, operand)?,
                    path,
                },
                "$min" => UpdateOp::Min {
                    value: numeric_value(&path, op, operand)?,
                    path,
                },
                "$max" => UpdateOp::Max {
                    value: numeric_value(&path, op, operand)?,
                    path,
                },
                "$rename" => {
                    let to = operand.as_str().ok_or_else(|| {
                        Error::invalid(format!("$rename of '{}' needs a string target", path))
                    })?;
                    UpdateOp::Rename {
                        from: path,
                        to: FieldPath::parse(to)?,
                    }
                }
                other if other.starts_with('$') => {
                    return Err(Error::unsupported(format!("update operator '{}'", other)))
                }
                other => {
                    return Err(Error::invalid(format!(
                        "update key '{}' is not an operator",
                        other
                    )))
                }
            };
            ops.push(parsed);
        }
    }

    let spec = UpdateSpec { ops };
    validate_update(&spec)?;
    Ok(spec)
}

fn numeric(path: &FieldPath, op: &str, operand: &Value) -> Result<Number> {
    match operand {
        Value::Number(n) => Ok(n.clone()),
        other => Err(Error::invalid(format!(
            "{} on '{}' needs a number, got {}",
            op, path, other
        ))),
    }
}

fn numeric_value(path: &FieldPath, op: &str, operand: &Value) -> Result<Value> {
    numeric(path, op, operand).map(Value::Number)
}

/// Reject writes to `_id` and operators that touch overlapping paths.
pub fn validate_update(spec: &UpdateSpec) -> Result<()> {
    let mut touched: Vec<&FieldPath> = Vec::new();
    for op in &spec.ops {
        let mut paths = vec![op.target()];
        if let UpdateOp::Rename { from, .. } = op {
            paths.push(from);
        }
        for path in paths {
            if path.root() == crate::value::ID_FIELD {
                return Err(Error::invalid(format!(
                    "{} may not modify _id",
                    op.operator()
                )));
            }
            if let Some(prev) = touched.iter().find(|p| p.overlaps(path)) {
                return Err(Error::invalid(format!(
                    "conflicting update paths '{}' and '{}'",
                    prev, path
                )));
            }
            touched.push(path);
        }
    }
    Ok(())
}

/// Accepts `["a", "b.c"]` or `{"a": 1, "b.c": "alias", "_id": 0}`.
/// A string value includes the field under that output name.
pub fn parse_projection(value: &Value) -> Result<Option<Projection>> {
    match value {
        Value::Null => Ok(None),
        Value::Array(items) => {
            let mut fields = Vec::with_capacity(items.len());
            for item in items {
                let name = item.as_str().ok_or_else(|| {
                    Error::invalid(format!("projection entry must be a string, got {}", item))
                })?;
                fields.push(ProjectedField {
                    path: FieldPath::parse(name)?,
                    alias: None,
                });
            }
            Ok(Some(Projection::Include {
                fields,
                with_id: true,
            }))
        }
        Value::Object(map) => parse_projection_map(map).map(Some),
        other => Err(Error::invalid(format!(
            "projection must be a list or object, got {}",
            other
        ))),
    }
}

fn parse_projection_map(map: &Map<String, Value>) -> Result<Projection> {
    let mut included = Vec::new();
    let mut excluded = Vec::new();
    let mut with_id = true;

    for (field, flag) in map {
        let path = FieldPath::parse(field)?;
        let include = match flag {
            Value::Bool(b) => Some(*b),
            Value::Number(n) => Some(n.as_f64().map(|f| f != 0.0).unwrap_or(false)),
            Value::String(_) => None,
            other => {
                return Err(Error::invalid(format!(
                    "projection value for '{}' must be a flag or alias, got {}",
                    field, other
                )))
            }
        };
        if path.is_id() {
            match include {
                Some(flag) => with_id = flag,
                None => {
                    return Err(Error::invalid("_id cannot be aliased in a projection"));
                }
            }
            continue;
        }
        match (include, flag) {
            (Some(true), _) => included.push(ProjectedField { path, alias: None }),
            (Some(false), _) => excluded.push(path),
            (None, Value::String(alias)) => included.push(ProjectedField {
                path,
                alias: Some(alias.clone()),
            }),
            (None, _) => {}
        }
    }

    if !included.is_empty() && !excluded.is_empty() {
        return Err(Error::invalid(
            "projection cannot mix inclusion and exclusion",
        ));
    }
    if included.is_empty() {
        Ok(Projection::Exclude {
            fields: excluded,
            with_id,
        })
    } else {
        Ok(Projection::Include {
            fields: included,
            with_id,
        })
    }
}

/// Accepts `{"a": 1, "b": -1}` or `[["a", "asc"], ["b", -1]]`.
pub fn parse_sort(value: &Value) -> Result<Vec<SortKey>> {
    let pairs: Vec<(&str, &Value)> = match value {
        Value::Null => return Ok(Vec::new()),
        Value::Object(map) => map.iter().map(|(k, v)| (k.as_str(), v)).collect(),
        Value::Array(items) => {
            let mut pairs = Vec::with_capacity(items.len());
            for item in items {
                match item {
                    Value::String(field) => pairs.push((field.as_str(), &Value::Null)),
                    Value::Array(pair) if pair.len() == 2 => {
                        let field = pair[0].as_str().ok_or_else(|| {
                            Error::invalid(format!("sort field must be a string, got {}", pair[0]))
                        })?;
                        pairs.push((field, &pair[1]));
                    }
                    other => {
                        return Err(Error::invalid(format!("invalid sort entry {}", other)))
                    }
                }
            }
            pairs
        }
        other => return Err(Error::invalid(format!("invalid sort {}", other))),
    };

    pairs
        .into_iter()
        .map(|(field, direction)| {
            let descending = match direction {
                Value::Null => false,
                Value::Number(n) => n.as_f64().map(|d| d < 0.0).unwrap_or(false),
                Value::String(s) => match s.to_ascii_lowercase().as_str() {
                    "asc" | "ascending" => false,
                    "desc" | "descending" => true,
                    _ => {
                        return Err(Error::invalid(format!(
                            "unknown sort direction '{}' for '{}'",
                            s, field
                        )))
                    }
                },
                other => {
                    return Err(Error::invalid(format!(
                        "unknown sort direction {} for '{}'",
                        other, field
                    )))
                }
            };
            Ok(SortKey {
                path: FieldPath::parse(field)?,
                descending,
            })
        })
        .collect()
}

/// Accepts `{"_id": {"city": "$city"}, "total": {"$sum": "$amount"}, "n": {"$sum": 1}}`.
/// A bare `"$field"` reference becomes a GROUP BY key.
pub fn parse_group(value: &Value) -> Result<GroupSpec> {
    let map = value
        .as_object()
        .ok_or_else(|| Error::invalid(format!("group must be an object, got {}", value)))?;
    let mut spec = GroupSpec::default();
    for (output, expr) in map {
        parse_group_entry(output, expr, &mut spec)?;
    }
    if spec.keys.is_empty() && spec.aggregates.is_empty() {
        return Err(Error::invalid("group has no keys or aggregates"));
    }
    Ok(spec)
}

fn parse_group_entry(output: &str, expr: &Value, spec: &mut GroupSpec) -> Result<()> {
    match expr {
        Value::String(reference) => {
            spec.keys.push(GroupKey {
                output: output.to_string(),
                path: field_reference(reference)?,
            });
            Ok(())
        }
        Value::Object(map) if map.len() == 1 && map.keys().all(|k| k.starts_with('$')) => {
            let (op, arg) = map.iter().next().ok_or_else(|| Error::invalid("empty aggregate"))?;
            let func = match op.as_str() {
                "$sum" => AggFunc::Sum,
                "$avg" => AggFunc::Avg,
                "$min" => AggFunc::Min,
                "$max" => AggFunc::Max,
                other => return Err(Error::unsupported(format!("group operator '{}'", other))),
            };
            let arg = match arg {
                Value::String(reference) => AggArg::Field(field_reference(reference)?),
                Value::Number(n) => AggArg::Const(n.clone()),
                other => {
                    return Err(Error::invalid(format!(
                        "{} for '{}' needs a field reference or number, got {}",
                        op, output, other
                    )))
                }
            };
            spec.aggregates.push(Aggregate {
                output: output.to_string(),
                func,
                arg,
            });
            Ok(())
        }
        Value::Object(map) if !map.keys().any(|k| k.starts_with('$')) => {
            for (sub, expr) in map {
                parse_group_entry(&format!("{}.{}", output, sub), expr, spec)?;
            }
            Ok(())
        }
        other => Err(Error::invalid(format!(
            "invalid group expression for '{}': {}",
            output, other
        ))),
    }
}

fn field_reference(reference: &str) -> Result<FieldPath> {
    match reference.strip_prefix('$') {
        Some(field) => FieldPath::parse(field),
        None => Err(Error::invalid(format!(
            "group reference '{}' must start with '$'",
            reference
        ))),
    }
}
