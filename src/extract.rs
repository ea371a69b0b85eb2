//! Type-checked field extraction from loosely shaped cloud JSON.
//!
//! The cloud is inconsistent about scalar encodings: the same flag shows up as
//! `true`, `1` or `"1"` depending on firmware, and numbers are frequently sent
//! as strings. Optional fields never fail: a missing or mistyped value reads
//! as `None`. Required fields and structural shapes (objects, arrays) fail
//! with a [`ParseError`] naming the JSON path.

use serde_json::{Map, Value};
use std::fmt;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Kind {
    Object,
    Array,
    String,
    Number,
    Integer,
    Bool,
    Null,
    Missing,
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Kind::Object => "object",
            Kind::Array => "array",
            Kind::String => "string",
            Kind::Number => "number",
            Kind::Integer => "integer",
            Kind::Bool => "boolean",
            Kind::Null => "null",
            Kind::Missing => "nothing",
        };
        f.write_str(s)
    }
}

pub fn kind_of(value: Option<&Value>) -> Kind {
    match value {
        None => Kind::Missing,
        Some(Value::Null) => Kind::Null,
        Some(Value::Bool(_)) => Kind::Bool,
        Some(Value::Number(n)) if n.is_i64() || n.is_u64() => Kind::Integer,
        Some(Value::Number(_)) => Kind::Number,
        Some(Value::String(_)) => Kind::String,
        Some(Value::Array(_)) => Kind::Array,
        Some(Value::Object(_)) => Kind::Object,
    }
}

/// A payload did not have the shape we rely on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    pub path: String,
    pub expected: Kind,
    pub found: Kind,
}

impl ParseError {
    pub fn new(path: impl Into<String>, expected: Kind, found: Option<&Value>) -> Self {
        ParseError {
            path: path.into(),
            expected,
            found: kind_of(found),
        }
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "at {}: expected {}, found {}", self.path, self.expected, self.found)
    }
}

impl std::error::Error for ParseError {}

/// Borrowed view of a JSON object together with its path, for error reporting.
#[derive(Debug, Clone)]
pub struct Obj<'a> {
    path: String,
    map: &'a Map<String, Value>,
}

impl<'a> Obj<'a> {
    pub fn root(value: &'a Value, path: &str) -> Result<Self, ParseError> {
        match value {
            Value::Object(map) => Ok(Obj {
                path: path.to_string(),
                map,
            }),
            other => Err(ParseError::new(path, Kind::Object, Some(other))),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    fn key_path(&self, key: &str) -> String {
        format!("{}.{}", self.path, key)
    }

    fn get(&self, key: &str) -> Option<&'a Value> {
        self.map.get(key)
    }

    /// Non-empty string; numbers are accepted and rendered.
    pub fn str(&self, key: &str) -> Option<String> {
        match self.get(key)? {
            Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    pub fn req_str(&self, key: &str) -> Result<String, ParseError> {
        self.str(key)
            .ok_or_else(|| ParseError::new(self.key_path(key), Kind::String, self.get(key)))
    }

    /// Integer, or a float without fractional part, or a numeric string.
    pub fn int(&self, key: &str) -> Option<i64> {
        match self.get(key)? {
            Value::Number(n) => n
                .as_i64()
                .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0 && f.abs() < 9.0e15).map(|f| f as i64)),
            Value::String(s) => s.trim().parse::<i64>().ok(),
            _ => None,
        }
    }

    pub fn float(&self, key: &str) -> Option<f64> {
        match self.get(key)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse::<f64>().ok().filter(|f| f.is_finite()),
            _ => None,
        }
    }

    pub fn flag(&self, key: &str) -> Option<bool> {
        match self.get(key)? {
            Value::Bool(b) => Some(*b),
            Value::Number(n) => match n.as_i64() {
                Some(0) => Some(false),
                Some(1) => Some(true),
                _ => None,
            },
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "on" | "yes" => Some(true),
                "0" | "false" | "off" | "no" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn flag_or(&self, key: &str, default: bool) -> bool {
        self.flag(key).unwrap_or(default)
    }

    /// Nested object; absent or mistyped reads as `None`.
    pub fn child(&self, key: &str) -> Option<Obj<'a>> {
        match self.get(key)? {
            Value::Object(map) => Some(Obj {
                path: self.key_path(key),
                map,
            }),
            _ => None,
        }
    }

    /// Array of objects. A missing or `null` array is empty; any other
    /// non-array is an error. Elements that are not objects are returned as
    /// errors alongside the good ones so one bad entry does not drop the rest.
    pub fn objects(&self, key: &str) -> Result<(Vec<Obj<'a>>, Vec<ParseError>), ParseError> {
        let items = match self.get(key) {
            None | Some(Value::Null) => return Ok((Vec::new(), Vec::new())),
            Some(Value::Array(items)) => items,
            Some(other) => return Err(ParseError::new(self.key_path(key), Kind::Array, Some(other))),
        };
        let mut good = Vec::with_capacity(items.len());
        let mut bad = Vec::new();
        for (index, item) in items.iter().enumerate() {
            let path = format!("{}.{}[{}]", self.path, key, index);
            match item {
                Value::Object(map) => good.push(Obj { path, map }),
                other => bad.push(ParseError::new(path, Kind::Object, Some(other))),
            }
        }
        Ok((good, bad))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn root_must_be_object() {
        let v = json!([1, 2]);
        let err = Obj::root(&v, "$").unwrap_err();
        assert_eq!(err.path, "$");
        assert_eq!(err.expected, Kind::Object);
        assert_eq!(err.found, Kind::Array);
        assert_eq!(err.to_string(), "at $: expected object, found array");
    }

    #[test]
    fn scalars_are_tolerant() {
        let v = json!({
            "a": "12", "b": 12.0, "c": 12.5, "d": true, "e": "1", "f": 0,
            "g": "  ", "h": 7, "i": "off", "j": [1]
        });
        let o = Obj::root(&v, "$").unwrap();
        assert_eq!(o.int("a"), Some(12));
        assert_eq!(o.int("b"), Some(12));
        assert_eq!(o.int("c"), None);
        assert_eq!(o.float("c"), Some(12.5));
        assert_eq!(o.flag("d"), Some(true));
        assert_eq!(o.flag("e"), Some(true));
        assert_eq!(o.flag("f"), Some(false));
        assert_eq!(o.flag("h"), None);
        assert_eq!(o.flag("i"), Some(false));
        assert_eq!(o.flag_or("missing", true), true);
        assert_eq!(o.str("g"), None);
        assert_eq!(o.str("h"), Some("7".into()));
        assert_eq!(o.str("j"), None);
        assert_eq!(o.int("j"), None);
    }

    #[test]
    fn required_string_names_its_path() {
        let v = json!({"zone": {"id": null}});
        let o = Obj::root(&v, "$").unwrap();
        let zone = o.child("zone").unwrap();
        let err = zone.req_str("id").unwrap_err();
        assert_eq!(err.path, "$.zone.id");
        assert_eq!(err.found, Kind::Null);
    }

    #[test]
    fn objects_keeps_good_entries() {
        let v = json!({"items": [{"x": 1}, 3, {"x": 2}], "nothing": null, "wrong": "x"});
        let o = Obj::root(&v, "$").unwrap();
        let (good, bad) = o.objects("items").unwrap();
        assert_eq!(good.len(), 2);
        assert_eq!(good[1].path(), "$.items[2]");
        assert_eq!(bad.len(), 1);
        assert_eq!(bad[0].path, "$.items[1]");

        let (none, _) = o.objects("nothing").unwrap();
        assert!(none.is_empty());
        assert!(o.objects("absent").unwrap().0.is_empty());
        assert_eq!(o.objects("wrong").unwrap_err().expected, Kind::Array);
    }
}
