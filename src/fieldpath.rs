// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Field-path resolution on structured documents.
//!
//! Patches copy values between field paths on the composite and its composed
//! resources. A field path addresses a location inside a JSON document:
//!
//! - `spec.size` - nested object fields, separated by dots
//! - `spec.containers[0].image` - array elements by index
//! - `metadata.labels[example.com/role]` - bracketed keys for field names
//!   that themselves contain dots
//!
//! Reads return `None` for absent paths (optional patches skip silently);
//! writes create missing intermediate objects and pad arrays with `null`
//! up to the target index.

use serde_json::Value;
use thiserror::Error;

/// Errors raised while parsing or applying a field path.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FieldPathError {
    /// The path string itself is malformed.
    #[error("invalid field path {path:?}: {reason}")]
    InvalidPath {
        /// The offending path
        path: String,
        /// What is wrong with it
        reason: String,
    },

    /// A write stepped through a value of the wrong shape, e.g. indexing
    /// into an object or setting a field on a string.
    #[error("cannot traverse {path:?}: segment {segment:?} applied to {found}")]
    WrongShape {
        /// The full path being applied
        path: String,
        /// The segment that could not be applied
        segment: String,
        /// A short description of the value found there
        found: String,
    },
}

/// One step of a parsed field path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    /// An object field, e.g. `spec`
    Field(String),
    /// An array index, e.g. `[0]`
    Index(usize),
}

/// Parse a field path into its segments.
///
/// # Errors
///
/// Returns [`FieldPathError::InvalidPath`] on empty paths, unterminated
/// brackets, or empty segments.
pub fn parse(path: &str) -> Result<Vec<Segment>, FieldPathError> {
    if path.is_empty() {
        return Err(FieldPathError::InvalidPath {
            path: path.to_string(),
            reason: "empty path".to_string(),
        });
    }

    let invalid = |reason: &str| FieldPathError::InvalidPath {
        path: path.to_string(),
        reason: reason.to_string(),
    };

    let mut segments = Vec::new();
    let mut chars = path.chars().peekable();
    let mut field = String::new();
    // A dot is only a separator between fields; after a closing bracket the
    // next segment may start directly with another bracket.
    let mut expect_field = true;

    while let Some(c) = chars.next() {
        match c {
            '.' => {
                if expect_field {
                    if field.is_empty() {
                        return Err(invalid("empty field segment"));
                    }
                    segments.push(Segment::Field(std::mem::take(&mut field)));
                }
                expect_field = true;
            }
            '[' => {
                if expect_field && !field.is_empty() {
                    segments.push(Segment::Field(std::mem::take(&mut field)));
                }
                let mut inner = String::new();
                let mut closed = false;
                for b in chars.by_ref() {
                    if b == ']' {
                        closed = true;
                        break;
                    }
                    inner.push(b);
                }
                if !closed {
                    return Err(invalid("unterminated '['"));
                }
                if inner.is_empty() {
                    return Err(invalid("empty bracket segment"));
                }
                // All-digit brackets are array indices; anything else is a
                // quoted field name (quotes optional).
                if inner.chars().all(|b| b.is_ascii_digit()) {
                    let idx = inner
                        .parse::<usize>()
                        .map_err(|_| invalid("index out of range"))?;
                    segments.push(Segment::Index(idx));
                } else {
                    let key = inner.trim_matches(|q| q == '\'' || q == '"');
                    if key.is_empty() {
                        return Err(invalid("empty bracket segment"));
                    }
                    segments.push(Segment::Field(key.to_string()));
                }
                expect_field = false;
            }
            _ => {
                field.push(c);
                expect_field = true;
            }
        }
    }

    if expect_field {
        if field.is_empty() {
            return Err(invalid("trailing '.'"));
        }
        segments.push(Segment::Field(field));
    }

    Ok(segments)
}

/// Read the value at `path` in `doc`.
///
/// Returns `Ok(None)` if any segment along the way is absent - the caller
/// decides whether absence is an error (required patches) or a silent skip
/// (optional patches).
///
/// # Errors
///
/// Returns [`FieldPathError::InvalidPath`] if the path does not parse.
pub fn get<'a>(doc: &'a Value, path: &str) -> Result<Option<&'a Value>, FieldPathError> {
    let segments = parse(path)?;
    let mut current = doc;
    for segment in &segments {
        let next = match segment {
            Segment::Field(name) => current.as_object().and_then(|m| m.get(name)),
            Segment::Index(idx) => current.as_array().and_then(|a| a.get(*idx)),
        };
        match next {
            Some(v) => current = v,
            None => return Ok(None),
        }
    }
    Ok(Some(current))
}

/// Write `value` at `path` in `doc`, creating missing intermediate
/// structure.
///
/// Missing objects are created for field segments; arrays are created and
/// padded with `null` for index segments. Traversing through an existing
/// value of the wrong shape is an error rather than a silent overwrite.
///
/// # Errors
///
/// Returns [`FieldPathError::InvalidPath`] if the path does not parse, or
/// [`FieldPathError::WrongShape`] if an existing non-container value blocks
/// the traversal.
pub fn set(doc: &mut Value, path: &str, value: Value) -> Result<(), FieldPathError> {
    let segments = parse(path)?;
    let mut current = doc;

    for (i, segment) in segments.iter().enumerate() {
        let last = i == segments.len() - 1;
        match segment {
            Segment::Field(name) => {
                if current.is_null() {
                    *current = Value::Object(serde_json::Map::new());
                }
                let map = current
                    .as_object_mut()
                    .ok_or_else(|| FieldPathError::WrongShape {
                        path: path.to_string(),
                        segment: name.clone(),
                        found: "non-object".to_string(),
                    })?;
                if last {
                    map.insert(name.clone(), value);
                    return Ok(());
                }
                current = map.entry(name.clone()).or_insert(Value::Null);
            }
            Segment::Index(idx) => {
                if current.is_null() {
                    *current = Value::Array(Vec::new());
                }
                let arr = current
                    .as_array_mut()
                    .ok_or_else(|| FieldPathError::WrongShape {
                        path: path.to_string(),
                        segment: format!("[{idx}]"),
                        found: "non-array".to_string(),
                    })?;
                while arr.len() <= *idx {
                    arr.push(Value::Null);
                }
                if last {
                    arr[*idx] = value;
                    return Ok(());
                }
                current = &mut arr[*idx];
            }
        }
    }

    Ok(())
}

#[cfg(test)]
#[path = "fieldpath_tests.rs"]
mod fieldpath_tests;
