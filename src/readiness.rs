// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Readiness evaluation for composed resources.
//!
//! Each composed-resource template may declare any number of readiness
//! checks; all must pass for the resource to be considered ready. When no
//! checks are declared, the resource is ready iff it carries a standard
//! `Ready` condition with status `True`.

use crate::fieldpath::{self, FieldPathError};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One readiness check against an observed composed resource.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum ReadinessCheck {
    /// The field path resolves to a non-empty value.
    NonEmpty {
        /// The path to inspect.
        field_path: String,
    },

    /// The field value equals the given string.
    MatchString {
        /// The path to inspect.
        field_path: String,
        /// The string the value must equal.
        match_string: String,
    },

    /// The field value equals the given 64-bit integer.
    ///
    /// Only integer-valued observed numbers match; a floating-point
    /// observation never does.
    MatchInteger {
        /// The path to inspect.
        field_path: String,
        /// The integer the value must equal.
        match_integer: i64,
    },

    /// Always false. Declaring this disables the default condition check
    /// and pins the resource to never-ready.
    None,
}

impl ReadinessCheck {
    /// Evaluate this check against an observed composed resource.
    ///
    /// # Errors
    ///
    /// Returns a [`FieldPathError`] when the declared path does not parse.
    pub fn passes(&self, observed: &Value) -> Result<bool, FieldPathError> {
        match self {
            Self::NonEmpty { field_path } => {
                let value = fieldpath::get(observed, field_path)?;
                Ok(value.is_some_and(|v| !is_empty(v)))
            }
            Self::MatchString {
                field_path,
                match_string,
            } => {
                let value = fieldpath::get(observed, field_path)?;
                Ok(value.and_then(Value::as_str) == Some(match_string.as_str()))
            }
            Self::MatchInteger {
                field_path,
                match_integer,
            } => {
                let value = fieldpath::get(observed, field_path)?;
                Ok(value.and_then(Value::as_i64) == Some(*match_integer))
            }
            Self::None => Ok(false),
        }
    }
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(m) => m.is_empty(),
        Value::Bool(_) | Value::Number(_) => false,
    }
}

/// Decide whether an observed composed resource is ready.
///
/// With no checks declared the default rule applies: the resource is ready
/// iff its status carries a `Ready` condition of `True`. Otherwise every
/// declared check must pass.
///
/// # Errors
///
/// Returns a [`FieldPathError`] when a declared path does not parse.
pub fn is_ready(checks: &[ReadinessCheck], observed: &Value) -> Result<bool, FieldPathError> {
    if checks.is_empty() {
        return Ok(has_ready_condition(observed));
    }
    for check in checks {
        if !check.passes(observed)? {
            return Ok(false);
        }
    }
    Ok(true)
}

/// The default readiness rule: a standard `Ready` condition of `True`.
fn has_ready_condition(observed: &Value) -> bool {
    observed
        .pointer("/status/conditions")
        .and_then(Value::as_array)
        .is_some_and(|conditions| {
            conditions.iter().any(|c| {
                c.get("type").and_then(Value::as_str) == Some("Ready")
                    && c.get("status").and_then(Value::as_str) == Some("True")
            })
        })
}

#[cfg(test)]
#[path = "readiness_tests.rs"]
mod readiness_tests;
