use std::fmt;
use std::sync::Arc;

use serde_json::Value;

/// Categorized error types for SQL statement failures.
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorCategory {
    /// Syntax errors (SQLSTATE class 42 - syntax_error, etc.)
    Syntax,
    /// Semantic errors (missing table/column, ambiguous reference)
    Semantic,
    /// Execution/runtime errors (division by zero, constraint violation)
    Execution,
    /// Transaction state errors (e.g., transaction aborted)
    Transaction,
    /// Connection/communication errors
    Connection,
    /// Unknown or unclassified errors
    Unknown,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Syntax => write!(f, "Syntax Error"),
            ErrorCategory::Semantic => write!(f, "Semantic Error"),
            ErrorCategory::Execution => write!(f, "Execution Error"),
            ErrorCategory::Transaction => write!(f, "Transaction Error"),
            ErrorCategory::Connection => write!(f, "Connection Error"),
            ErrorCategory::Unknown => write!(f, "Error"),
        }
    }
}

/// Categorize a SQLSTATE code into an ErrorCategory.
///
/// PostgreSQL and MySQL both report SQLSTATE, so the same table serves both.
pub fn categorize_sqlstate(code: &str) -> ErrorCategory {
    if code.len() < 2 {
        return ErrorCategory::Unknown;
    }
    let class = &code[..2];
    match class {
        // Class 42: Syntax Error or Access Rule Violation
        "42" => {
            // 42601 = syntax_error; MySQL reports 42000 for parse errors
            if code == "42601" || code == "42000" {
                ErrorCategory::Syntax
            } else {
                // 42P01 = undefined_table, 42703 = undefined_column, 42S02 (MySQL), etc.
                ErrorCategory::Semantic
            }
        }
        // Class 22: Data Exception (division by zero, etc.)
        "22" => ErrorCategory::Execution,
        // Class 23: Integrity Constraint Violation
        "23" => ErrorCategory::Execution,
        // Class 25: Invalid Transaction State
        "25" => ErrorCategory::Transaction,
        // Class 40: Transaction Rollback
        "40" => ErrorCategory::Transaction,
        // Class 08: Connection Exception
        "08" => ErrorCategory::Connection,
        // Class 53: Insufficient Resources
        "53" => ErrorCategory::Execution,
        // Class 54: Program Limit Exceeded
        "54" => ErrorCategory::Execution,
        // Class 55: Object Not In Prerequisite State
        "55" => ErrorCategory::Execution,
        // Class 57: Operator Intervention
        "57" => ErrorCategory::Execution,
        _ => ErrorCategory::Unknown,
    }
}

/// Convert a 1-based byte offset in a statement to (line, column), both 1-based.
pub fn byte_offset_to_line_col(query: &str, byte_pos: usize) -> (usize, usize) {
    if byte_pos == 0 || query.is_empty() {
        return (1, 1);
    }
    let target = (byte_pos - 1).min(query.len());
    let mut line = 1usize;
    let mut col = 1usize;
    for (i, ch) in query.char_indices() {
        if i >= target {
            break;
        }
        if ch == '\n' {
            line += 1;
            col = 1;
        } else {
            col += 1;
        }
    }
    (line, col)
}

/// A single value read back from a backend, before normalization.
///
/// `Json` holds values the driver already decoded (PostgreSQL `jsonb`);
/// JSON stored as text by SQLite and MySQL arrives as `Text`.
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Null,
    Bool(bool),
    Int64(i64),
    Float64(f64),
    Text(String),
    Bytes(Vec<u8>),
    Json(Value),
}

impl CellValue {
    pub fn is_null(&self) -> bool {
        matches!(self, CellValue::Null)
    }

    /// Plain conversion with no knowledge of the column's logical type.
    pub fn into_json(self) -> Value {
        match self {
            CellValue::Null => Value::Null,
            CellValue::Bool(b) => Value::Bool(b),
            CellValue::Int64(i) => Value::from(i),
            CellValue::Float64(f) => serde_json::Number::from_f64(f)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            CellValue::Text(s) => Value::String(s),
            CellValue::Bytes(b) => match String::from_utf8(b) {
                Ok(s) => Value::String(s),
                Err(e) => Value::Array(e.into_bytes().into_iter().map(Value::from).collect()),
            },
            CellValue::Json(v) => v,
        }
    }

    /// Decode a cell that holds a JSON document, whatever its wire form.
    /// Text that does not parse is kept as a plain string.
    pub fn into_json_document(self) -> Value {
        match self {
            CellValue::Text(s) => serde_json::from_str(&s).unwrap_or(Value::String(s)),
            CellValue::Bytes(b) => match serde_json::from_slice(&b) {
                Ok(v) => v,
                Err(_) => CellValue::Bytes(b).into_json(),
            },
            other => other.into_json(),
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            CellValue::Int64(i) => Some(*i),
            CellValue::Float64(f) => Some(*f as i64),
            CellValue::Bool(b) => Some(i64::from(*b)),
            CellValue::Text(s) => s.trim().parse().ok(),
            CellValue::Json(v) => v.as_i64(),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            CellValue::Text(s) => Some(s),
            CellValue::Json(Value::String(s)) => Some(s),
            _ => None,
        }
    }
}

/// One row as returned by a backend: column names shared across the result set.
#[derive(Debug, Clone)]
pub struct RawRow {
    pub columns: Arc<[String]>,
    pub values: Vec<CellValue>,
}

impl RawRow {
    pub fn new(columns: Arc<[String]>, values: Vec<CellValue>) -> Self {
        Self { columns, values }
    }

    pub fn get(&self, column: &str) -> Option<&CellValue> {
        self.columns
            .iter()
            .position(|c| c == column)
            .and_then(|i| self.values.get(i))
    }

    pub fn first(&self) -> Option<&CellValue> {
        self.values.first()
    }

    pub fn into_pairs(self) -> impl Iterator<Item = (String, CellValue)> {
        let columns = self.columns;
        self.values
            .into_iter()
            .enumerate()
            .map(move |(i, v)| (columns[i].clone(), v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_categorize_sqlstate() {
        assert_eq!(categorize_sqlstate("42601"), ErrorCategory::Syntax);
        assert_eq!(categorize_sqlstate("42000"), ErrorCategory::Syntax);
        assert_eq!(categorize_sqlstate("42P01"), ErrorCategory::Semantic);
        assert_eq!(categorize_sqlstate("42S02"), ErrorCategory::Semantic);
        assert_eq!(categorize_sqlstate("23505"), ErrorCategory::Execution);
        assert_eq!(categorize_sqlstate("25001"), ErrorCategory::Transaction);
        assert_eq!(categorize_sqlstate("08006"), ErrorCategory::Connection);
        assert_eq!(categorize_sqlstate("XX000"), ErrorCategory::Unknown);
        assert_eq!(categorize_sqlstate("4"), ErrorCategory::Unknown);
    }

    #[test]
    fn test_byte_offset_to_line_col() {
        let query = "SELECT *\nFROM users\nWHERE id = 1";
        assert_eq!(byte_offset_to_line_col(query, 1), (1, 1));
        assert_eq!(byte_offset_to_line_col(query, 10), (2, 1));
        assert_eq!(byte_offset_to_line_col(query, 21), (3, 1));
    }

    #[test]
    fn test_into_json_scalars() {
        assert_eq!(CellValue::Null.into_json(), Value::Null);
        assert_eq!(CellValue::Int64(7).into_json(), json!(7));
        assert_eq!(CellValue::Float64(1.5).into_json(), json!(1.5));
        assert_eq!(CellValue::Text("x".into()).into_json(), json!("x"));
        assert_eq!(CellValue::Bytes(b"ab".to_vec()).into_json(), json!("ab"));
    }

    #[test]
    fn test_into_json_document_parses_text() {
        let cell = CellValue::Text(r#"{"a":1,"b":[true]}"#.into());
        assert_eq!(cell.into_json_document(), json!({"a": 1, "b": [true]}));
        // already-decoded jsonb strings are not parsed a second time
        let cell = CellValue::Json(json!("123"));
        assert_eq!(cell.into_json_document(), json!("123"));
        let cell = CellValue::Text("not json".into());
        assert_eq!(cell.into_json_document(), json!("not json"));
    }

    #[test]
    fn test_raw_row_lookup() {
        let columns: Arc<[String]> = vec!["_id".to_string(), "n".to_string()].into();
        let row = RawRow::new(columns, vec![CellValue::Text("a".into()), CellValue::Int64(3)]);
        assert_eq!(row.get("n").and_then(|c| c.as_i64()), Some(3));
        assert!(row.get("missing").is_none());
        assert_eq!(row.first().and_then(|c| c.as_text()), Some("a"));
    }
}
