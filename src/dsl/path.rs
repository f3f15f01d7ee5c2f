//! Dotted field paths: `a.b.0.c` addresses nested JSON, numeric segments
//! after the first address array elements.

use std::fmt;
use std::str::FromStr;

use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::value::{Document, ID_FIELD};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

impl PathSegment {
    pub fn as_key(&self) -> String {
        match self {
            PathSegment::Key(k) => k.clone(),
            PathSegment::Index(i) => i.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldPath {
    raw: String,
    segments: Vec<PathSegment>,
}

impl FieldPath {
    pub fn parse(raw: &str) -> Result<Self> {
        if raw.is_empty() {
            return Err(Error::invalid("empty field path"));
        }
        if raw.starts_with('$') {
            return Err(Error::invalid(format!(
                "field path '{}' must not start with '$'",
                raw
            )));
        }
        let mut segments = Vec::new();
        for (i, part) in raw.split('.').enumerate() {
            if part.is_empty() {
                return Err(Error::invalid(format!("empty segment in field path '{}'", raw)));
            }
            let is_index = i > 0 && part.bytes().all(|b| b.is_ascii_digit());
            match part.parse::<usize>() {
                Ok(idx) if is_index => segments.push(PathSegment::Index(idx)),
                _ => segments.push(PathSegment::Key(part.to_string())),
            }
        }
        Ok(Self {
            raw: raw.to_string(),
            segments,
        })
    }

    pub fn id() -> Self {
        Self {
            raw: ID_FIELD.to_string(),
            segments: vec![PathSegment::Key(ID_FIELD.to_string())],
        }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn segments(&self) -> &[PathSegment] {
        &self.segments
    }

    /// The top-level key; for a declared fixed column this is the column name.
    pub fn root(&self) -> &str {
        match &self.segments[0] {
            PathSegment::Key(k) => k,
            PathSegment::Index(_) => &self.raw,
        }
    }

    /// Segments below the root.
    pub fn rest(&self) -> &[PathSegment] {
        &self.segments[1..]
    }

    pub fn is_id(&self) -> bool {
        self.raw == ID_FIELD
    }

    pub fn is_nested(&self) -> bool {
        self.segments.len() > 1
    }

    /// True when one path is a prefix of (or equal to) the other.
    pub fn overlaps(&self, other: &FieldPath) -> bool {
        let n = self.segments.len().min(other.segments.len());
        self.segments[..n] == other.segments[..n]
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl FromStr for FieldPath {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        FieldPath::parse(s)
    }
}

pub fn get_path<'a>(doc: &'a Document, path: &FieldPath) -> Option<&'a Value> {
    let mut segments = path.segments().iter();
    let mut current = doc.get(&segments.next()?.as_key())?;
    for segment in segments {
        current = match (segment, current) {
            (PathSegment::Index(i), Value::Array(items)) => items.get(*i)?,
            (segment, Value::Object(map)) => map.get(&segment.as_key())?,
            _ => return None,
        };
    }
    Some(current)
}

/// Set a value, creating intermediate objects as needed.
pub fn set_path(doc: &mut Document, path: &FieldPath, value: Value) {
    let segments = path.segments();
    let (last, parents) = match segments.split_last() {
        Some(split) => split,
        None => return,
    };
    let mut current = doc;
    for segment in parents {
        let entry = current
            .entry(segment.as_key())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        let Value::Object(map) = entry else {
            return;
        };
        current = map;
    }
    current.insert(last.as_key(), value);
}

pub fn remove_path(doc: &mut Document, path: &FieldPath) -> Option<Value> {
    let segments = path.segments();
    let (last, parents) = segments.split_last()?;
    let mut current = doc;
    for segment in parents {
        current = match current.get_mut(&segment.as_key())? {
            Value::Object(map) => map,
            _ => return None,
        };
    }
    current.remove(&last.as_key())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_segments() {
        let path = FieldPath::parse("a.b.0.c").unwrap();
        assert_eq!(
            path.segments(),
            &[
                PathSegment::Key("a".into()),
                PathSegment::Key("b".into()),
                PathSegment::Index(0),
                PathSegment::Key("c".into()),
            ]
        );
        assert_eq!(path.root(), "a");
        assert_eq!(path.rest().len(), 3);
    }

    #[test]
    fn test_numeric_root_stays_key() {
        let path = FieldPath::parse("0.a").unwrap();
        assert_eq!(path.segments()[0], PathSegment::Key("0".into()));
    }

    #[test]
    fn test_parse_rejects_bad_paths() {
        assert!(FieldPath::parse("").is_err());
        assert!(FieldPath::parse("a..b").is_err());
        assert!(FieldPath::parse("$set").is_err());
    }

    #[test]
    fn test_overlaps() {
        let a = FieldPath::parse("a").unwrap();
        let ab = FieldPath::parse("a.b").unwrap();
        let c = FieldPath::parse("c").unwrap();
        assert!(a.overlaps(&ab));
        assert!(ab.overlaps(&a));
        assert!(!a.overlaps(&c));
    }

    #[test]
    fn test_get_set_remove() {
        let mut doc = json!({"a": {"b": [10, 20]}}).as_object().cloned().unwrap();
        assert_eq!(
            get_path(&doc, &FieldPath::parse("a.b.1").unwrap()),
            Some(&json!(20))
        );
        set_path(&mut doc, &FieldPath::parse("x.y").unwrap(), json!(1));
        assert_eq!(doc.get("x"), Some(&json!({"y": 1})));
        assert_eq!(
            remove_path(&mut doc, &FieldPath::parse("x.y").unwrap()),
            Some(json!(1))
        );
        assert_eq!(doc.get("x"), Some(&json!({})));
        assert!(remove_path(&mut doc, &FieldPath::parse("q.r").unwrap()).is_none());
    }
}
