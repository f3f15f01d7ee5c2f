//! Turning result rows back into documents.

use serde_json::{Map, Number, Value};

use crate::db::{CellValue, RawRow};
use crate::dsl::{remove_path, set_path, FieldPath};
use crate::plan::{Decode, DocumentFormat};
use crate::value::{decode_column, Document};

/// Decode rows selected under `format`.
///
/// Fixed columns are decoded by their logical type and the `_ext` blob is
/// merged into the top level. Null values are dropped, dotted outputs nest,
/// joined columns land under their alias (omitted when nothing matched) and
/// exclusions are removed last.
pub fn documents(rows: Vec<RawRow>, format: &DocumentFormat) -> Vec<Document> {
    rows.into_iter().map(|row| document(row, format)).collect()
}

fn document(row: RawRow, format: &DocumentFormat) -> Document {
    let mut doc = Document::new();
    let mut joined: Vec<(&str, Document)> = Vec::new();

    for (column, cell) in format.columns.iter().zip(row.values) {
        let target = match &column.join {
            Some(alias) => {
                let index = match joined.iter().position(|(a, _)| a == alias) {
                    Some(index) => index,
                    None => {
                        joined.push((alias.as_str(), Document::new()));
                        joined.len() - 1
                    }
                };
                &mut joined[index].1
            }
            None => &mut doc,
        };
        match column.decode {
            Decode::Ext => {
                if let Value::Object(ext) = cell.into_json_document() {
                    for (key, value) in ext {
                        if !value.is_null() {
                            target.entry(key).or_insert(value);
                        }
                    }
                }
            }
            Decode::Fixed(ty) => put(target, &column.output, decode_column(ty, cell)),
            Decode::Json => put(target, &column.output, cell.into_json_document()),
            Decode::Number => put(target, &column.output, number(cell)),
        }
    }

    for (alias, sub) in joined {
        if !sub.is_empty() {
            doc.insert(alias.to_string(), Value::Object(sub));
        }
    }
    for path in &format.exclude {
        remove_path(&mut doc, path);
    }
    doc
}

fn put(doc: &mut Document, output: &str, value: Value) {
    if value.is_null() {
        return;
    }
    match FieldPath::parse(output) {
        Ok(path) if path.is_nested() => set_path(doc, &path, value),
        _ => {
            doc.insert(output.to_string(), value);
        }
    }
}

/// Aggregate results: integral floats collapse to integers and numeric
/// text (MySQL's text protocol) is parsed.
fn number(cell: CellValue) -> Value {
    match cell {
        CellValue::Float64(f) => float(f),
        CellValue::Text(s) => match s.trim().parse::<i64>() {
            Ok(i) => Value::from(i),
            Err(_) => match s.trim().parse::<f64>() {
                Ok(f) => float(f),
                Err(_) => Value::String(s),
            },
        },
        CellValue::Json(Value::Number(n)) => n.as_f64().map(float).unwrap_or(Value::Number(n)),
        other => other.into_json(),
    }
}

fn float(f: f64) -> Value {
    if f.fract() == 0.0 && f.abs() < 9.0e15 {
        Value::from(f as i64)
    } else {
        Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null)
    }
}

/// Rows of an introspection or native query, keyed by column label.
pub fn raw(rows: Vec<RawRow>) -> Vec<Document> {
    rows.into_iter()
        .map(|row| {
            row.into_pairs()
                .map(|(column, cell)| (column, cell.into_json()))
                .collect::<Map<String, Value>>()
        })
        .collect()
}

/// First column of every row as text.
pub fn names(rows: Vec<RawRow>) -> Vec<String> {
    rows.into_iter()
        .filter_map(|row| row.values.into_iter().next())
        .filter_map(|cell| match cell.into_json() {
            Value::String(s) => Some(s),
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::OutputColumn;
    use crate::value::FieldType;
    use serde_json::json;
    use std::sync::Arc;

    fn row(labels: &[&str], values: Vec<CellValue>) -> RawRow {
        let columns: Arc<[String]> = labels.iter().map(|s| s.to_string()).collect::<Vec<_>>().into();
        RawRow::new(columns, values)
    }

    #[test]
    fn test_ext_merges_and_nulls_drop() {
        let format = DocumentFormat {
            columns: vec![
                OutputColumn::new("_id", "_id", Decode::Fixed(FieldType::Str)),
                OutputColumn::new("flag", "flag", Decode::Fixed(FieldType::Bool)),
                OutputColumn::new("c_int", "c_int", Decode::Fixed(FieldType::Int)),
                OutputColumn::new("_ext", "_ext", Decode::Ext),
            ],
            exclude: vec![],
        };
        let rows = vec![row(
            &["_id", "flag", "c_int", "_ext"],
            vec![
                CellValue::Text("a".into()),
                CellValue::Int64(1),
                CellValue::Null,
                CellValue::Text(r#"{"n":{"x":1},"gone":null}"#.into()),
            ],
        )];
        let docs = documents(rows, &format);
        assert_eq!(Value::Object(docs[0].clone()), json!({"_id": "a", "flag": true, "n": {"x": 1}}));
    }

    #[test]
    fn test_joined_and_dotted_outputs() {
        let format = DocumentFormat {
            columns: vec![
                OutputColumn::new("_id.city", "_id.city", Decode::Json),
                OutputColumn::new("total", "total", Decode::Number),
                OutputColumn::new("o|_id", "_id", Decode::Fixed(FieldType::Str)).joined("o"),
                OutputColumn::new("o|_ext", "_ext", Decode::Ext).joined("o"),
            ],
            exclude: vec![],
        };
        let rows = vec![
            row(
                &["_id.city", "total", "o|_id", "o|_ext"],
                vec![
                    CellValue::Text("\"Oslo\"".into()),
                    CellValue::Float64(12.0),
                    CellValue::Text("x".into()),
                    CellValue::Text("{\"qty\":2}".into()),
                ],
            ),
            row(
                &["_id.city", "total", "o|_id", "o|_ext"],
                vec![
                    CellValue::Json(json!("Rome")),
                    CellValue::Text("2.5".into()),
                    CellValue::Null,
                    CellValue::Null,
                ],
            ),
        ];
        let docs = documents(rows, &format);
        assert_eq!(
            Value::Object(docs[0].clone()),
            json!({"_id": {"city": "Oslo"}, "total": 12, "o": {"_id": "x", "qty": 2}})
        );
        assert_eq!(Value::Object(docs[1].clone()), json!({"_id": {"city": "Rome"}, "total": 2.5}));
    }

    #[test]
    fn test_exclusions_apply_after_merge() {
        let format = DocumentFormat {
            columns: vec![
                OutputColumn::new("_id", "_id", Decode::Fixed(FieldType::Str)),
                OutputColumn::new("_ext", "_ext", Decode::Ext),
            ],
            exclude: vec![FieldPath::parse("a.b").unwrap(), FieldPath::id()],
        };
        let rows = vec![row(
            &["_id", "_ext"],
            vec![CellValue::Text("1".into()), CellValue::Text(r#"{"a":{"b":1,"c":2}}"#.into())],
        )];
        let docs = documents(rows, &format);
        assert_eq!(Value::Object(docs[0].clone()), json!({"a": {"c": 2}}));
    }

    #[test]
    fn test_names_takes_first_column() {
        let rows = vec![
            row(&["name"], vec![CellValue::Text("main".into())]),
            row(&["name"], vec![CellValue::Null]),
        ];
        assert_eq!(names(rows), vec!["main".to_string()]);
    }
}
