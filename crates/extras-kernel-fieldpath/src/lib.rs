//! Field-path access to nested untyped JSON documents.
//!
//! A field path addresses one location inside a document using dotted field
//! segments and bracketed indices, e.g. `metadata.name`,
//! `spec.containers[0].image`, or `metadata.labels['app.kubernetes.io/name']`.
//! Lookups distinguish "the path does not exist" ([`PathError::NotFound`])
//! from structural mismatches such as indexing into an object, so callers can
//! treat absence as data while treating mismatches as errors.

use std::iter::Peekable;
use std::str::Chars;

use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PathError {
    #[error("invalid field path {path:?}: {reason}")]
    Malformed { path: String, reason: String },
    #[error("no value at field path {path:?}")]
    NotFound { path: String },
    #[error("field path {path:?} expected {expected}, found {found}")]
    UnexpectedKind { path: String, expected: &'static str, found: &'static str },
}

impl PathError {
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// One parsed step of a field path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Field(String),
    Index(usize),
}

/// The JSON kind name of a value, as used in error messages.
#[must_use]
pub fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Parse a field path into segments.
///
/// # Errors
/// Returns [`PathError::Malformed`] for an empty path, an empty segment, or
/// an unterminated bracket.
pub fn parse(path: &str) -> Result<Vec<Segment>, PathError> {
    if path.is_empty() {
        return Err(malformed(path, "empty path"));
    }

    let mut segments = Vec::new();
    let mut chars = path.chars().peekable();
    while let Some(&next) = chars.peek() {
        match next {
            '.' => {
                chars.next();
                let field = consume_field(&mut chars);
                if field.is_empty() {
                    return Err(malformed(path, "empty field segment"));
                }
                segments.push(Segment::Field(field));
            }
            '[' => {
                chars.next();
                segments.push(consume_bracket(&mut chars, path)?);
            }
            _ => {
                if !segments.is_empty() {
                    return Err(malformed(path, "expected '.' or '[' between segments"));
                }
                segments.push(Segment::Field(consume_field(&mut chars)));
            }
        }
    }

    if segments.is_empty() {
        return Err(malformed(path, "no segments"));
    }
    Ok(segments)
}

fn malformed(path: &str, reason: &str) -> PathError {
    PathError::Malformed { path: path.to_string(), reason: reason.to_string() }
}

fn consume_field(chars: &mut Peekable<Chars<'_>>) -> String {
    let mut field = String::new();
    while let Some(&c) = chars.peek() {
        if c == '.' || c == '[' {
            break;
        }
        field.push(c);
        chars.next();
    }
    field
}

fn consume_bracket(chars: &mut Peekable<Chars<'_>>, path: &str) -> Result<Segment, PathError> {
    let mut body = String::new();
    loop {
        match chars.next() {
            None => return Err(malformed(path, "unterminated bracket segment")),
            Some(']') => break,
            Some(c) => body.push(c),
        }
    }

    if body.is_empty() {
        return Err(malformed(path, "empty bracket segment"));
    }

    // Quoted bracket keys allow dots and brackets inside field names.
    for quote in ['\'', '"'] {
        if body.len() >= 2 && body.starts_with(quote) && body.ends_with(quote) {
            let inner = &body[1..body.len() - 1];
            if inner.is_empty() {
                return Err(malformed(path, "empty quoted key"));
            }
            return Ok(Segment::Field(inner.to_string()));
        }
    }

    if body.chars().all(|c| c.is_ascii_digit()) {
        let index = body
            .parse::<usize>()
            .map_err(|_| malformed(path, "array index out of range"))?;
        return Ok(Segment::Index(index));
    }

    Ok(Segment::Field(body))
}

/// Fetch the value at `path` inside `doc`.
///
/// # Errors
/// Returns [`PathError::NotFound`] when an object key or array index along
/// the path does not exist, [`PathError::UnexpectedKind`] when the path
/// descends into a value of the wrong kind, and [`PathError::Malformed`] for
/// unparseable paths.
pub fn get_value<'a>(doc: &'a Value, path: &str) -> Result<&'a Value, PathError> {
    let segments = parse(path)?;
    let mut current = doc;
    for segment in &segments {
        current = match (segment, current) {
            (Segment::Field(name), Value::Object(map)) => map
                .get(name)
                .ok_or_else(|| PathError::NotFound { path: path.to_string() })?,
            (Segment::Field(_), other) => {
                return Err(PathError::UnexpectedKind {
                    path: path.to_string(),
                    expected: "object",
                    found: value_kind(other),
                });
            }
            (Segment::Index(index), Value::Array(items)) => items
                .get(*index)
                .ok_or_else(|| PathError::NotFound { path: path.to_string() })?,
            (Segment::Index(_), other) => {
                return Err(PathError::UnexpectedKind {
                    path: path.to_string(),
                    expected: "array",
                    found: value_kind(other),
                });
            }
        };
    }
    Ok(current)
}

/// Fetch the string at `path` inside `doc`.
///
/// # Errors
/// Returns the errors of [`get_value`], plus [`PathError::UnexpectedKind`]
/// when the value at the path is not a string.
pub fn get_string(doc: &Value, path: &str) -> Result<String, PathError> {
    match get_value(doc, path)? {
        Value::String(s) => Ok(s.clone()),
        other => Err(PathError::UnexpectedKind {
            path: path.to_string(),
            expected: "string",
            found: value_kind(other),
        }),
    }
}

/// Write `value` at `path` inside `doc`, materializing missing intermediate
/// objects and arrays. Arrays grow with nulls up to a written index.
///
/// # Errors
/// Returns [`PathError::Malformed`] when the path does not start with a field
/// segment, and [`PathError::UnexpectedKind`] when an existing intermediate
/// value has the wrong kind for the next segment.
pub fn set_value(doc: &mut Map<String, Value>, path: &str, value: Value) -> Result<(), PathError> {
    let segments = parse(path)?;
    let Some((first, rest)) = segments.split_first() else {
        return Err(malformed(path, "no segments"));
    };
    let Segment::Field(name) = first else {
        return Err(malformed(path, "destination must start with a field segment"));
    };
    let slot = doc.entry(name.clone()).or_insert(Value::Null);
    set_segments(slot, rest, value, path)
}

fn set_segments(
    current: &mut Value,
    segments: &[Segment],
    value: Value,
    path: &str,
) -> Result<(), PathError> {
    let Some((segment, rest)) = segments.split_first() else {
        *current = value;
        return Ok(());
    };

    match segment {
        Segment::Field(name) => {
            if current.is_null() {
                *current = Value::Object(Map::new());
            }
            match current {
                Value::Object(map) => {
                    let slot = map.entry(name.clone()).or_insert(Value::Null);
                    set_segments(slot, rest, value, path)
                }
                other => Err(PathError::UnexpectedKind {
                    path: path.to_string(),
                    expected: "object",
                    found: value_kind(other),
                }),
            }
        }
        Segment::Index(index) => {
            if current.is_null() {
                *current = Value::Array(Vec::new());
            }
            match current {
                Value::Array(items) => {
                    while items.len() <= *index {
                        items.push(Value::Null);
                    }
                    set_segments(&mut items[*index], rest, value, path)
                }
                other => Err(PathError::UnexpectedKind {
                    path: path.to_string(),
                    expected: "array",
                    found: value_kind(other),
                }),
            }
        }
    }
}
