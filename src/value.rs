//! Logical field types, bound parameters and conversions between documents
//! and storage cells.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

use crate::db::CellValue;
use crate::error::{Error, Result};

/// A document as seen by callers.
pub type Document = Map<String, Value>;

/// Reserved identity field, always a real column.
pub const ID_FIELD: &str = "_id";

/// Reserved extension column holding every field not declared fixed.
pub const EXT_COLUMN: &str = "_ext";

/// Logical type of a fixed column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Str,
    Int,
    Float,
    Bool,
    Json,
}

impl FieldType {
    pub fn name(&self) -> &'static str {
        match self {
            FieldType::Str => "str",
            FieldType::Int => "int",
            FieldType::Float => "float",
            FieldType::Bool => "bool",
            FieldType::Json => "json",
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, FieldType::Int | FieldType::Float)
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for FieldType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "str" | "string" | "text" => Ok(FieldType::Str),
            "int" | "integer" => Ok(FieldType::Int),
            "float" | "double" | "real" => Ok(FieldType::Float),
            "bool" | "boolean" => Ok(FieldType::Bool),
            "json" => Ok(FieldType::Json),
            other => Err(Error::invalid(format!("unknown field type '{}'", other))),
        }
    }
}

/// A positional parameter bound to a statement.
///
/// Backends map these onto their native bind types; `Bool` becomes 0/1 on
/// engines without a boolean type and `Json` travels as JSON text there.
#[derive(Debug, Clone, PartialEq)]
pub enum Param {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Json(Value),
    Bytes(Vec<u8>),
}

impl Param {
    /// Map a JSON scalar to the closest parameter; arrays and objects stay JSON.
    pub fn from_json(value: &Value) -> Param {
        match value {
            Value::Null => Param::Null,
            Value::Bool(b) => Param::Bool(*b),
            Value::Number(n) => number_param(n),
            Value::String(s) => Param::Str(s.clone()),
            other => Param::Json(other.clone()),
        }
    }

    /// The value serialized as JSON text, for engines that parse JSON on the server.
    pub fn json_text(value: &Value) -> Param {
        Param::Str(value.to_string())
    }

    /// Coerce a document value into the storage form of a fixed column.
    pub fn for_column(ty: FieldType, value: &Value, field: &str) -> Result<Param> {
        if value.is_null() {
            return Ok(Param::Null);
        }
        let mismatch = || {
            Error::invalid(format!(
                "field '{}' expects {} but got {}",
                field,
                ty,
                json_type_name(value)
            ))
        };
        match ty {
            FieldType::Str => value.as_str().map(|s| Param::Str(s.to_string())).ok_or_else(mismatch),
            FieldType::Int => match value {
                Value::Number(n) => {
                    if let Some(i) = n.as_i64() {
                        Ok(Param::Int(i))
                    } else if let Some(f) = n.as_f64().filter(|f| f.fract() == 0.0 && f.abs() < 9.0e15) {
                        Ok(Param::Int(f as i64))
                    } else {
                        Err(mismatch())
                    }
                }
                _ => Err(mismatch()),
            },
            FieldType::Float => value.as_f64().map(Param::Float).ok_or_else(mismatch),
            FieldType::Bool => match value {
                Value::Bool(b) => Ok(Param::Bool(*b)),
                Value::Number(n) if n.as_i64() == Some(0) || n.as_i64() == Some(1) => {
                    Ok(Param::Bool(n.as_i64() == Some(1)))
                }
                _ => Err(mismatch()),
            },
            FieldType::Json => Ok(Param::Json(value.clone())),
        }
    }

    /// Numeric operand for `$inc`/`$mul`.
    pub fn number(value: &Value, field: &str) -> Result<Param> {
        match value {
            Value::Number(n) => Ok(number_param(n)),
            other => Err(Error::invalid(format!(
                "field '{}' needs a numeric operand, got {}",
                field,
                json_type_name(other)
            ))),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Param::Null)
    }

    /// Render for debug-mode error messages.
    pub fn describe(&self) -> String {
        match self {
            Param::Null => "NULL".to_string(),
            Param::Bool(b) => b.to_string(),
            Param::Int(i) => i.to_string(),
            Param::Float(f) => f.to_string(),
            Param::Str(s) => format!("{:?}", s),
            Param::Json(v) => v.to_string(),
            Param::Bytes(b) => format!("[{} bytes]", b.len()),
        }
    }
}

fn number_param(n: &Number) -> Param {
    match n.as_i64() {
        Some(i) => Param::Int(i),
        None => Param::Float(n.as_f64().unwrap_or(0.0)),
    }
}

pub fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_f64() => "float",
        Value::Number(_) => "int",
        Value::String(_) => "str",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Convert a stored fixed-column cell back to its logical JSON value.
pub fn decode_column(ty: FieldType, cell: CellValue) -> Value {
    match (ty, cell) {
        (_, CellValue::Null) => Value::Null,
        (FieldType::Bool, CellValue::Int64(i)) => Value::Bool(i != 0),
        (FieldType::Bool, CellValue::Text(s)) => Value::Bool(matches!(s.as_str(), "1" | "true" | "t")),
        (FieldType::Int, CellValue::Float64(f)) if f.fract() == 0.0 => Value::from(f as i64),
        (FieldType::Int, CellValue::Text(s)) => s
            .trim()
            .parse::<i64>()
            .map(Value::from)
            .unwrap_or(Value::String(s)),
        (FieldType::Float, CellValue::Int64(i)) => Number::from_f64(i as f64)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        (FieldType::Float, CellValue::Text(s)) => s
            .trim()
            .parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map(Value::Number)
            .unwrap_or(Value::String(s)),
        (FieldType::Json, cell) => cell.into_json_document(),
        (_, cell) => cell.into_json(),
    }
}

/// Validate a caller-supplied `_id` or generate a fresh one.
pub fn ensure_id(doc: &mut Document) -> Result<String> {
    match doc.get(ID_FIELD) {
        None | Some(Value::Null) => {
            let id = new_object_id();
            doc.insert(ID_FIELD.to_string(), Value::String(id.clone()));
            Ok(id)
        }
        Some(Value::String(s)) if !s.is_empty() => Ok(s.clone()),
        Some(other) => Err(Error::invalid(format!(
            "_id must be a non-empty string, got {}",
            json_type_name(other)
        ))),
    }
}

/// Generate a 24 hex character ObjectId-style identifier:
/// 4 bytes of seconds since the epoch, 5 process-random bytes, 3 counter bytes.
pub fn new_object_id() -> String {
    static PROCESS: OnceLock<[u8; 5]> = OnceLock::new();
    static COUNTER: OnceLock<AtomicU32> = OnceLock::new();

    let process = PROCESS.get_or_init(rand::random::<[u8; 5]>);
    let counter = COUNTER.get_or_init(|| AtomicU32::new(rand::random::<u32>()));
    let seconds = chrono::Utc::now().timestamp() as u32;
    let count = counter.fetch_add(1, Ordering::Relaxed) & 0x00ff_ffff;

    let mut id = format!("{:08x}", seconds);
    for byte in process {
        id.push_str(&format!("{:02x}", byte));
    }
    id.push_str(&format!("{:06x}", count));
    id
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_field_type_parse() {
        assert_eq!("str".parse::<FieldType>().unwrap(), FieldType::Str);
        assert_eq!("BOOLEAN".parse::<FieldType>().unwrap(), FieldType::Bool);
        assert_eq!("double".parse::<FieldType>().unwrap(), FieldType::Float);
        assert!("date".parse::<FieldType>().is_err());
    }

    #[test]
    fn test_for_column_coercion() {
        assert_eq!(
            Param::for_column(FieldType::Int, &json!(3), "n").unwrap(),
            Param::Int(3)
        );
        assert_eq!(
            Param::for_column(FieldType::Int, &json!(3.0), "n").unwrap(),
            Param::Int(3)
        );
        assert!(Param::for_column(FieldType::Int, &json!(3.5), "n").is_err());
        assert_eq!(
            Param::for_column(FieldType::Float, &json!(2), "f").unwrap(),
            Param::Float(2.0)
        );
        assert!(Param::for_column(FieldType::Str, &json!(1), "s").is_err());
        assert_eq!(
            Param::for_column(FieldType::Bool, &json!(1), "b").unwrap(),
            Param::Bool(true)
        );
        assert_eq!(
            Param::for_column(FieldType::Json, &json!({"a": 1}), "j").unwrap(),
            Param::Json(json!({"a": 1}))
        );
        assert_eq!(
            Param::for_column(FieldType::Str, &Value::Null, "s").unwrap(),
            Param::Null
        );
    }

    #[test]
    fn test_decode_column() {
        assert_eq!(decode_column(FieldType::Bool, CellValue::Int64(1)), json!(true));
        assert_eq!(decode_column(FieldType::Bool, CellValue::Int64(0)), json!(false));
        assert_eq!(decode_column(FieldType::Int, CellValue::Float64(4.0)), json!(4));
        assert_eq!(decode_column(FieldType::Float, CellValue::Int64(2)), json!(2.0));
        assert_eq!(
            decode_column(FieldType::Json, CellValue::Text("[1,2]".into())),
            json!([1, 2])
        );
        assert_eq!(decode_column(FieldType::Str, CellValue::Null), Value::Null);
    }

    #[test]
    fn test_object_id_shape() {
        let a = new_object_id();
        let b = new_object_id();
        assert_eq!(a.len(), 24);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn test_ensure_id() {
        let mut doc = Document::new();
        let id = ensure_id(&mut doc).unwrap();
        assert_eq!(doc.get(ID_FIELD), Some(&Value::String(id)));

        let mut doc = json!({"_id": "abc"}).as_object().cloned().unwrap();
        assert_eq!(ensure_id(&mut doc).unwrap(), "abc");

        let mut doc = json!({"_id": 5}).as_object().cloned().unwrap();
        assert!(ensure_id(&mut doc).is_err());
    }
}
