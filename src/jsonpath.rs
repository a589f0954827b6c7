//! Dotted-path DSL for extracting values from JSON documents.
//!
//! Paths look like `a.b[].c` or `items[0].id`: `.` descends into object
//! fields, `[n]` indexes into an array, and `[]` fans out over every array
//! element, collecting one extracted value per element. The empty path
//! addresses the document root.

use crate::error::Error;
use serde_json::Value;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Field(String),
    Every,
    Index(usize),
}

/// A parsed extraction path.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct JsonPath {
    segments: Vec<Segment>,
}

impl JsonPath {
    /// Parses a dotted path. A leading `.` is accepted and ignored, so the
    /// scan paths produced by action scanning (`.x[].y`) parse directly.
    ///
    /// # Errors
    ///
    /// Returns a load error on malformed bracket syntax or empty field names.
    pub fn parse(input: &str) -> Result<Self, Error> {
        let mut segments = Vec::new();
        let trimmed = input.strip_prefix('.').unwrap_or(input);
        if trimmed.is_empty() {
            return Ok(Self { segments });
        }

        for part in trimmed.split('.') {
            let mut rest = part;
            // Field portion before any brackets; may be empty for paths
            // like `[].x` where the bracket applies to the current value.
            let field_end = rest.find('[').unwrap_or(rest.len());
            let field = &rest[..field_end];
            if !field.is_empty() {
                segments.push(Segment::Field(field.to_string()));
            } else if field_end == rest.len() {
                return Err(Error::load(format!("empty segment in path '{input}'")));
            }
            rest = &rest[field_end..];

            while let Some(stripped) = rest.strip_prefix('[') {
                let Some(close) = stripped.find(']') else {
                    return Err(Error::load(format!("unclosed '[' in path '{input}'")));
                };
                let inner = &stripped[..close];
                if inner.is_empty() {
                    segments.push(Segment::Every);
                } else {
                    let idx = inner.parse::<usize>().map_err(|_| {
                        Error::load(format!("invalid array index '{inner}' in path '{input}'"))
                    })?;
                    segments.push(Segment::Index(idx));
                }
                rest = &stripped[close + 1..];
            }
            if !rest.is_empty() {
                return Err(Error::load(format!(
                    "unexpected '{rest}' after brackets in path '{input}'"
                )));
            }
        }

        Ok(Self { segments })
    }

    #[must_use]
    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// True if the path fans out over array elements somewhere, meaning an
    /// extraction yields one value per element.
    #[must_use]
    pub fn fans_out(&self) -> bool {
        self.segments.contains(&Segment::Every)
    }

    /// Extracts the value this path addresses within `root`.
    ///
    /// An `[]` segment maps the remaining path over every element of the
    /// array at that position and yields the results as an array.
    ///
    /// # Errors
    ///
    /// Returns a runtime error on a missing field, an out-of-range index, a
    /// non-array value under `[]`/`[n]`, or an empty array under `[]`.
    pub fn extract(&self, root: &Value) -> Result<Value, Error> {
        extract_at(&self.segments, root, self)
    }
}

fn extract_at(segments: &[Segment], value: &Value, path: &JsonPath) -> Result<Value, Error> {
    let Some((head, rest)) = segments.split_first() else {
        return Ok(value.clone());
    };

    match head {
        Segment::Field(name) => {
            let child = value.get(name).ok_or_else(|| {
                Error::runtime(format!("path '{path}': field '{name}' not present"))
            })?;
            extract_at(rest, child, path)
        }
        Segment::Index(idx) => {
            let arr = value
                .as_array()
                .ok_or_else(|| Error::runtime(format!("path '{path}': value is not an array")))?;
            let child = arr.get(*idx).ok_or_else(|| {
                Error::runtime(format!("path '{path}': index {idx} out of range"))
            })?;
            extract_at(rest, child, path)
        }
        Segment::Every => {
            let arr = value
                .as_array()
                .ok_or_else(|| Error::runtime(format!("path '{path}': value is not an array")))?;
            if arr.is_empty() {
                return Err(Error::runtime(format!(
                    "path '{path}': '[]' applied to an empty array"
                )));
            }
            let collected = arr
                .iter()
                .map(|elem| extract_at(rest, elem, path))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Value::Array(collected))
        }
    }
}

impl fmt::Display for JsonPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for seg in &self.segments {
            match seg {
                Segment::Field(name) => {
                    if !first {
                        write!(f, ".")?;
                    }
                    write!(f, "{name}")?;
                }
                Segment::Every => write!(f, "[]")?,
                Segment::Index(idx) => write!(f, "[{idx}]")?,
            }
            first = false;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_simple_fields() {
        let path = JsonPath::parse("a.b.c").unwrap();
        assert_eq!(path.to_string(), "a.b.c");
    }

    #[test]
    fn parse_leading_dot() {
        let path = JsonPath::parse(".access_token").unwrap();
        assert_eq!(path.to_string(), "access_token");
    }

    #[test]
    fn parse_root() {
        assert!(JsonPath::parse("").unwrap().is_root());
        assert!(JsonPath::parse(".").unwrap().is_root());
    }

    #[test]
    fn parse_every_and_index() {
        let path = JsonPath::parse("items[].id").unwrap();
        assert!(path.fans_out());
        let path = JsonPath::parse("items[2]").unwrap();
        assert!(!path.fans_out());
    }

    #[test]
    fn parse_rejects_unclosed_bracket() {
        assert!(JsonPath::parse("a[").is_err());
        assert!(JsonPath::parse("a[x]").is_err());
    }

    #[test]
    fn extract_nested_field() {
        let doc = json!({"data": {"nested": {"value": "deep"}}});
        let path = JsonPath::parse("data.nested.value").unwrap();
        assert_eq!(path.extract(&doc).unwrap(), json!("deep"));
    }

    #[test]
    fn extract_root_clones_document() {
        let doc = json!({"id": 1});
        assert_eq!(JsonPath::parse("").unwrap().extract(&doc).unwrap(), doc);
    }

    #[test]
    fn extract_every_collects_per_element() {
        let doc = json!({"items": [{"id": "a"}, {"id": "b"}]});
        let path = JsonPath::parse("items[].id").unwrap();
        assert_eq!(path.extract(&doc).unwrap(), json!(["a", "b"]));
    }

    #[test]
    fn extract_every_on_empty_array_fails() {
        let doc = json!({"items": []});
        let path = JsonPath::parse("items[]").unwrap();
        let err = path.extract(&doc).unwrap_err();
        assert!(err.to_string().contains("empty array"), "got: {err}");
    }

    #[test]
    fn extract_missing_field_fails() {
        let doc = json!({"other": 1});
        let err = JsonPath::parse("id").unwrap().extract(&doc).unwrap_err();
        assert!(err.to_string().contains("not present"), "got: {err}");
    }

    #[test]
    fn extract_index() {
        let doc = json!({"ids": [10, 20, 30]});
        let path = JsonPath::parse("ids[1]").unwrap();
        assert_eq!(path.extract(&doc).unwrap(), json!(20));
    }
}
