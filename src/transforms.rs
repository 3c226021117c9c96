// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Value transforms applied by patches.
//!
//! A patch may declare an ordered list of transforms; the extracted value is
//! folded through [`Transform::resolve`] one transform at a time. Transforms
//! are a tagged variant - `Math`, `Map`, `Match`, `String`, `Convert` - with
//! a single resolve operation, so adding a transform kind never touches the
//! patch engine itself.
//!
//! # Example
//!
//! ```rust
//! use loomy::transforms::{MathTransform, Transform};
//! use serde_json::json;
//!
//! let transform = Transform::Math(MathTransform { multiply: 2 });
//! let out = transform.resolve(&json!(3)).unwrap();
//! assert_eq!(out, json!(6));
//! ```

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

/// Errors produced while resolving a single transform.
///
/// The patch engine wraps these with the transform index and the patch
/// index, so the surfaced error reads like
/// `patch 0: transform 0: math transform input is not an integer`.
#[derive(Error, Debug)]
pub enum TransformError {
    /// Math transforms require an integer input (`mathInputNonNumber`).
    #[error("math transform input is not an integer")]
    MathInputNonNumber,

    /// Map transforms look values up by string key.
    #[error("map transform input is not a string")]
    MapInputNotAString,

    /// The input string has no entry in the map.
    #[error("map transform has no entry for key {key:?}")]
    MapKeyNotFound {
        /// The key that was looked up
        key: String,
    },

    /// A `regexp` pattern in a Match or String transform does not compile.
    #[error("regex {pattern:?} does not compile: {source}")]
    BadRegex {
        /// The offending pattern
        pattern: String,
        /// The compile error
        #[source]
        source: Box<regex::Error>,
    },

    /// String transforms operate on string input.
    #[error("string transform input is not a string")]
    StringInputNotAString,

    /// Base64 decoding failed. The partial output is whatever decoded
    /// cleanly before the offending byte.
    #[error("cannot decode base64 input: {reason} (partial output {partial:?})")]
    Base64Decode {
        /// The decode error
        reason: String,
        /// Decoded prefix, lossily converted to UTF-8
        partial: String,
    },

    /// A String `Regexp` transform found no match in the input.
    #[error("regex {pattern:?} did not match the input")]
    RegexNoMatch {
        /// The pattern that failed to match
        pattern: String,
    },

    /// The requested capture group does not exist in the match.
    #[error("regex {pattern:?} has no capture group {group}")]
    RegexNoSuchGroup {
        /// The pattern
        pattern: String,
        /// The requested group
        group: usize,
    },

    /// A format string consumed more arguments than were supplied.
    #[error("format string {fmt:?}: {reason}")]
    Format {
        /// The format string
        fmt: String,
        /// What went wrong
        reason: String,
    },

    /// A Convert transform was asked for an unsupported or lossy coercion.
    #[error("cannot convert from {from} to {to}: {reason}")]
    Convert {
        /// Source type name
        from: &'static str,
        /// Target type name
        to: &'static str,
        /// Why the conversion is refused
        reason: String,
    },
}

/// A single value transform.
///
/// Transforms are resolved in declaration order; each receives the output
/// of the previous one.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type")]
pub enum Transform {
    /// Integer arithmetic.
    Math(MathTransform),
    /// Keyed lookup in a literal map.
    Map(MapTransform),
    /// First-match-wins pattern matching.
    Match(MatchTransform),
    /// String formatting and conversion.
    String(StringTransform),
    /// Type coercion between scalar types.
    Convert(ConvertTransform),
}

impl Transform {
    /// Resolve this transform against `input`, producing the output value.
    ///
    /// # Errors
    ///
    /// Returns a [`TransformError`] describing the first failure: wrong
    /// input type, missing map key, non-compiling or non-matching regex,
    /// or an unsupported conversion.
    pub fn resolve(&self, input: &Value) -> Result<Value, TransformError> {
        match self {
            Self::Math(t) => t.resolve(input),
            Self::Map(t) => t.resolve(input),
            Self::Match(t) => t.resolve(input),
            Self::String(t) => t.resolve(input),
            Self::Convert(t) => t.resolve(input),
        }
    }
}

/// Multiply an integer input by an integer constant.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MathTransform {
    /// The constant to multiply the input by.
    pub multiply: i64,
}

impl MathTransform {
    /// Multiply the input, which must be an integer-valued JSON number.
    ///
    /// # Errors
    ///
    /// Returns [`TransformError::MathInputNonNumber`] for strings, floats,
    /// and every other non-integer input.
    pub fn resolve(&self, input: &Value) -> Result<Value, TransformError> {
        let n = input
            .as_i64()
            .ok_or(TransformError::MathInputNonNumber)?;
        Ok(Value::from(n * self.multiply))
    }
}

/// Look the input string up in a literal map.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MapTransform {
    /// Map of input string to output value.
    pub pairs: BTreeMap<String, Value>,
}

impl MapTransform {
    /// Resolve by map lookup. Missing keys are an error, not a skip.
    ///
    /// # Errors
    ///
    /// Returns [`TransformError::MapInputNotAString`] for non-string input
    /// and [`TransformError::MapKeyNotFound`] when the key is absent.
    pub fn resolve(&self, input: &Value) -> Result<Value, TransformError> {
        let key = input
            .as_str()
            .ok_or(TransformError::MapInputNotAString)?;
        self.pairs
            .get(key)
            .cloned()
            .ok_or_else(|| TransformError::MapKeyNotFound {
                key: key.to_string(),
            })
    }
}

/// Match the input against an ordered list of patterns.
///
/// The first matching pattern wins. If nothing matches, the fallback value
/// is returned (default `null`). Result values may be any JSON value,
/// including `null`, objects, and arrays.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MatchTransform {
    /// Patterns tried in order.
    pub patterns: Vec<MatchPattern>,

    /// Value returned when no pattern matches.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_value: Option<Value>,
}

/// One pattern of a [`MatchTransform`].
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum MatchPattern {
    /// Exact string equality.
    Literal {
        /// The string the input must equal.
        literal: String,
        /// The value produced on match.
        result: Value,
    },
    /// Regular-expression match. The pattern must compile; compile errors
    /// surface explicitly rather than being treated as a non-match.
    Regexp {
        /// The regular expression.
        regexp: String,
        /// The value produced on match.
        result: Value,
    },
}

impl MatchTransform {
    /// Resolve the match, first pattern wins.
    ///
    /// # Errors
    ///
    /// Returns [`TransformError::StringInputNotAString`] for non-string
    /// input and [`TransformError::BadRegex`] when a `regexp` pattern does
    /// not compile.
    pub fn resolve(&self, input: &Value) -> Result<Value, TransformError> {
        let s = input
            .as_str()
            .ok_or(TransformError::StringInputNotAString)?;

        for pattern in &self.patterns {
            match pattern {
                MatchPattern::Literal { literal, result } => {
                    if s == literal {
                        return Ok(result.clone());
                    }
                }
                MatchPattern::Regexp { regexp, result } => {
                    let re = regex::Regex::new(regexp).map_err(|e| TransformError::BadRegex {
                        pattern: regexp.clone(),
                        source: Box::new(e),
                    })?;
                    if re.is_match(s) {
                        return Ok(result.clone());
                    }
                }
            }
        }

        Ok(self.fallback_value.clone().unwrap_or(Value::Null))
    }
}

/// String manipulation transforms.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type")]
pub enum StringTransform {
    /// printf-style formatting with a single verb, e.g. `prefix-%s`.
    Format {
        /// The format string.
        fmt: String,
    },
    /// Case and base64 conversions.
    Convert {
        /// Which conversion to apply.
        convert: StringConversion,
    },
    /// Remove a prefix if present.
    TrimPrefix {
        /// The prefix to remove.
        trim: String,
    },
    /// Remove a suffix if present.
    TrimSuffix {
        /// The suffix to remove.
        trim: String,
    },
    /// Extract a capture group from a regex match (group 0 by default).
    Regexp {
        /// The regular expression to match.
        #[serde(rename = "match")]
        pattern: String,
        /// Capture group to extract; defaults to the whole match.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        group: Option<usize>,
    },
}

/// Conversions available to [`StringTransform::Convert`].
#[derive(Clone, Copy, Debug, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum StringConversion {
    /// Uppercase the input.
    Upper,
    /// Lowercase the input.
    Lower,
    /// Base64-encode the input.
    ToBase64,
    /// Base64-decode the input; decode errors carry the partial output.
    FromBase64,
}

impl StringTransform {
    /// Resolve the string transform.
    ///
    /// # Errors
    ///
    /// Non-string input, base64 decode failures, regexes that do not
    /// compile or match, and out-of-range capture groups are all errors.
    pub fn resolve(&self, input: &Value) -> Result<Value, TransformError> {
        match self {
            Self::Format { fmt } => Ok(Value::String(format_values(fmt, &[input.clone()])?)),
            Self::Convert { convert } => {
                let s = input
                    .as_str()
                    .ok_or(TransformError::StringInputNotAString)?;
                let out = match convert {
                    StringConversion::Upper => s.to_uppercase(),
                    StringConversion::Lower => s.to_lowercase(),
                    StringConversion::ToBase64 => BASE64.encode(s.as_bytes()),
                    StringConversion::FromBase64 => {
                        let bytes = decode_base64_with_partial(s)?;
                        String::from_utf8_lossy(&bytes).into_owned()
                    }
                };
                Ok(Value::String(out))
            }
            Self::TrimPrefix { trim } => {
                let s = input
                    .as_str()
                    .ok_or(TransformError::StringInputNotAString)?;
                Ok(Value::String(
                    s.strip_prefix(trim.as_str()).unwrap_or(s).to_string(),
                ))
            }
            Self::TrimSuffix { trim } => {
                let s = input
                    .as_str()
                    .ok_or(TransformError::StringInputNotAString)?;
                Ok(Value::String(
                    s.strip_suffix(trim.as_str()).unwrap_or(s).to_string(),
                ))
            }
            Self::Regexp { pattern, group } => {
                let s = input
                    .as_str()
                    .ok_or(TransformError::StringInputNotAString)?;
                let re = regex::Regex::new(pattern).map_err(|e| TransformError::BadRegex {
                    pattern: pattern.clone(),
                    source: Box::new(e),
                })?;
                let captures =
                    re.captures(s)
                        .ok_or_else(|| TransformError::RegexNoMatch {
                            pattern: pattern.clone(),
                        })?;
                let group = group.unwrap_or(0);
                let matched =
                    captures
                        .get(group)
                        .ok_or_else(|| TransformError::RegexNoSuchGroup {
                            pattern: pattern.clone(),
                            group,
                        })?;
                Ok(Value::String(matched.as_str().to_string()))
            }
        }
    }
}

/// Decode base64, surfacing the cleanly-decoded prefix on failure.
fn decode_base64_with_partial(input: &str) -> Result<Vec<u8>, TransformError> {
    match BASE64.decode(input) {
        Ok(bytes) => Ok(bytes),
        Err(err) => {
            // Re-decode the longest prefix aligned to a 4-byte quantum that
            // precedes the failure, so the error carries partial output.
            let cut = match err {
                base64::DecodeError::InvalidByte(offset, _)
                | base64::DecodeError::InvalidLastSymbol(offset, _) => offset - offset % 4,
                base64::DecodeError::InvalidLength(len) => len - len % 4,
                base64::DecodeError::InvalidPadding => input.len().saturating_sub(4),
            };
            let prefix = input.get(..cut).unwrap_or("");
            let partial = BASE64.decode(prefix).unwrap_or_default();
            Err(TransformError::Base64Decode {
                reason: err.to_string(),
                partial: String::from_utf8_lossy(&partial).into_owned(),
            })
        }
    }
}

/// Target types for [`ConvertTransform`].
///
/// `int` and `int64` are aliases for the same 64-bit integer type.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ConvertType {
    /// UTF-8 string.
    String,
    /// 64-bit signed integer (alias of `int64`).
    #[serde(alias = "int64")]
    Int,
    /// 64-bit float.
    Float64,
    /// Boolean.
    Bool,
}

impl ConvertType {
    fn name(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Int => "int64",
            Self::Float64 => "float64",
            Self::Bool => "bool",
        }
    }
}

/// Coerce the input to a target scalar type.
///
/// Same-type conversions are no-ops. Unsupported pairs fail explicitly;
/// there is no silent truncation. `int` to `string` is base-10;
/// `bool` and numbers map `true` to 1 and `false` to 0; `float64` to
/// `bool` compares to 1 and 0 exactly.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConvertTransform {
    /// The type to convert to.
    pub to_type: ConvertType,
}

impl ConvertTransform {
    /// Resolve the conversion.
    ///
    /// # Errors
    ///
    /// Returns [`TransformError::Convert`] for unsupported pairs, parse
    /// failures, and non-representable numeric conversions.
    pub fn resolve(&self, input: &Value) -> Result<Value, TransformError> {
        let fail = |from: &'static str, reason: String| TransformError::Convert {
            from,
            to: self.to_type.name(),
            reason,
        };

        match (input, self.to_type) {
            // Same-type conversions are no-ops.
            (Value::String(_), ConvertType::String)
            | (Value::Bool(_), ConvertType::Bool) => Ok(input.clone()),
            (Value::Number(n), ConvertType::Int) if n.is_i64() => Ok(input.clone()),
            (Value::Number(n), ConvertType::Float64) if n.is_f64() => Ok(input.clone()),

            (Value::String(s), ConvertType::Int) => s
                .parse::<i64>()
                .map(Value::from)
                .map_err(|e| fail("string", e.to_string())),
            (Value::String(s), ConvertType::Float64) => s
                .parse::<f64>()
                .map(Value::from)
                .map_err(|e| fail("string", e.to_string())),
            (Value::String(s), ConvertType::Bool) => s
                .parse::<bool>()
                .map(Value::from)
                .map_err(|e| fail("string", e.to_string())),

            (Value::Number(n), ConvertType::String) => Ok(Value::String(n.to_string())),
            (Value::Number(n), ConvertType::Int) => {
                // Float input: refuse non-representable values instead of
                // truncating.
                let f = n.as_f64().ok_or_else(|| {
                    fail("float64", "not representable as f64".to_string())
                })?;
                if f.fract() != 0.0 || f < i64::MIN as f64 || f > i64::MAX as f64 {
                    return Err(fail("float64", format!("{f} is not an integer")));
                }
                Ok(Value::from(f as i64))
            }
            (Value::Number(n), ConvertType::Float64) => {
                let f = n
                    .as_f64()
                    .ok_or_else(|| fail("int64", "not representable as f64".to_string()))?;
                Ok(Value::from(f))
            }
            (Value::Number(n), ConvertType::Bool) => {
                if let Some(i) = n.as_i64() {
                    match i {
                        1 => Ok(Value::Bool(true)),
                        0 => Ok(Value::Bool(false)),
                        other => Err(fail("int64", format!("{other} is neither 0 nor 1"))),
                    }
                } else {
                    let f = n.as_f64().unwrap_or(f64::NAN);
                    if f == 1.0 {
                        Ok(Value::Bool(true))
                    } else if f == 0.0 {
                        Ok(Value::Bool(false))
                    } else {
                        Err(fail("float64", format!("{f} is neither 0 nor 1")))
                    }
                }
            }

            (Value::Bool(b), ConvertType::String) => Ok(Value::String(b.to_string())),
            (Value::Bool(b), ConvertType::Int) => Ok(Value::from(i64::from(*b))),
            (Value::Bool(b), ConvertType::Float64) => {
                Ok(Value::from(if *b { 1.0 } else { 0.0 }))
            }

            (Value::Null, _) => Err(fail("null", "unsupported input type".to_string())),
            (Value::Array(_), _) => Err(fail("array", "unsupported input type".to_string())),
            (Value::Object(_), _) => Err(fail("object", "unsupported input type".to_string())),
        }
    }
}

/// Apply a printf-style format string over a list of values.
///
/// Supported verbs: `%s` (any scalar, stringified), `%d` (integer), `%f`
/// (float), and `%%` for a literal percent. Used both by the `Format`
/// string transform (one value) and the `string` combine strategy (many).
///
/// # Errors
///
/// Returns [`TransformError::Format`] when the format consumes more
/// arguments than supplied, ends in a bare `%`, or a verb does not fit the
/// argument type.
pub fn format_values(fmt: &str, args: &[Value]) -> Result<String, TransformError> {
    let format_err = |reason: String| TransformError::Format {
        fmt: fmt.to_string(),
        reason,
    };

    let mut out = String::with_capacity(fmt.len());
    let mut chars = fmt.chars();
    let mut next_arg = 0usize;

    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        let verb = chars
            .next()
            .ok_or_else(|| format_err("dangling '%' at end of format".to_string()))?;
        if verb == '%' {
            out.push('%');
            continue;
        }
        let arg = args
            .get(next_arg)
            .ok_or_else(|| format_err(format!("missing argument for verb %{verb}")))?;
        next_arg += 1;
        match verb {
            's' => match arg {
                Value::String(s) => out.push_str(s),
                Value::Number(n) => out.push_str(&n.to_string()),
                Value::Bool(b) => out.push_str(&b.to_string()),
                Value::Null => out.push_str("null"),
                other => out.push_str(&other.to_string()),
            },
            'd' => {
                let n = arg
                    .as_i64()
                    .ok_or_else(|| format_err(format!("%d needs an integer, got {arg}")))?;
                out.push_str(&n.to_string());
            }
            'f' => {
                let f = arg
                    .as_f64()
                    .ok_or_else(|| format_err(format!("%f needs a number, got {arg}")))?;
                out.push_str(&f.to_string());
            }
            other => return Err(format_err(format!("unsupported verb %{other}"))),
        }
    }

    Ok(out)
}

#[cfg(test)]
#[path = "transforms_tests.rs"]
mod transforms_tests;
