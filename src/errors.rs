// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Engine-visible error types for Loomy.
//!
//! This module provides the error taxonomy used throughout the reconciliation
//! engine:
//! - Transient backing-API failures (conflicts, network blips, watcher lag)
//! - Validation failures on Compositions and composites
//! - Composition-function execution and contract failures
//! - Missing dependencies (Compositions, functions, credentials secrets)
//! - Internal invariant violations
//!
//! These errors provide structured error handling for the reconcile loop,
//! enabling consistent status conditions and retry decisions.

use thiserror::Error;

/// Result type used throughout the engine.
pub type Result<T> = std::result::Result<T, EngineError>;

/// The engine-visible error taxonomy.
///
/// Every error that escapes a reconcile lands as the `Synced=False,
/// Reason=<kind>` condition on the composite and as a queue-level backoff
/// signal. The variant determines whether the reconcile is retried with
/// backoff ([`EngineError::is_transient`]) and which reason string is
/// surfaced ([`EngineError::status_reason`]).
#[derive(Error, Debug)]
pub enum EngineError {
    /// A backing-API conflict, network blip, or watcher lag.
    ///
    /// Retried with backoff; expected to resolve on its own.
    #[error("transient failure during {operation}: {reason}")]
    Transient {
        /// The operation that failed (e.g., "get composite", "apply composed")
        operation: String,
        /// Underlying cause
        reason: String,
    },

    /// A malformed Composition or composite.
    ///
    /// Not retried until the offending spec changes; surfaced via conditions.
    #[error("validation of {subject} failed: {reason}")]
    Validation {
        /// What failed validation (e.g., a Composition name)
        subject: String,
        /// First validation error encountered
        reason: String,
    },

    /// A composition function returned an error or a `Fatal` result.
    ///
    /// The pipeline halts at the failing step.
    #[error("pipeline step {step:?} failed: {reason}")]
    FunctionExecution {
        /// Name of the failing pipeline step
        step: String,
        /// The function error or fatal result message
        reason: String,
    },

    /// A composition function broke its contract with the engine.
    ///
    /// Covers extra-resource requirements that did not stabilize and
    /// malformed responses. Retried with backoff; repeated occurrences
    /// are alertable.
    #[error("pipeline step {step:?} broke the function contract: {reason}")]
    FunctionContract {
        /// Name of the offending pipeline step
        step: String,
        /// What the function did wrong
        reason: String,
    },

    /// A referenced Composition, function, or credentials secret is missing.
    ///
    /// Retried with backoff; the dependency may appear later.
    #[error("missing {kind} {name:?}: {reason}")]
    Dependency {
        /// The kind of dependency (e.g., "Composition", "credentials secret")
        kind: String,
        /// The name of the missing object
        name: String,
        /// Why resolution failed
        reason: String,
    },

    /// An engine bug or invariant violation. Surfaced loudly.
    #[error("internal: {0}")]
    Internal(String),
}

impl EngineError {
    /// Returns true if this error is transient and the reconcile should be
    /// retried with backoff.
    ///
    /// Validation errors are not retried until the spec changes; internal
    /// errors indicate a bug and retrying will not help, but they are still
    /// requeued so the composite is not silently dropped.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transient { .. }
            | Self::FunctionExecution { .. }
            | Self::FunctionContract { .. }
            | Self::Dependency { .. } => true,
            Self::Validation { .. } | Self::Internal(_) => false,
        }
    }

    /// Returns the condition reason code for this error.
    ///
    /// Used as `Reason` on the composite's `Synced=False` condition.
    #[must_use]
    pub fn status_reason(&self) -> &'static str {
        match self {
            Self::Transient { .. } => "Transient",
            Self::Validation { .. } => "Validation",
            Self::FunctionExecution { .. } => "FunctionExecution",
            Self::FunctionContract { .. } => "FunctionContract",
            Self::Dependency { .. } => "Dependency",
            Self::Internal(_) => "Internal",
        }
    }

    /// Wrap a backing-API error as a transient failure of `operation`.
    #[must_use]
    pub fn transient(operation: &str, err: impl std::fmt::Display) -> Self {
        Self::Transient {
            operation: operation.to_string(),
            reason: err.to_string(),
        }
    }

    /// Build the `ExtraResourcesDidNotStabilize` contract failure for `step`.
    #[must_use]
    pub fn extra_resources_did_not_stabilize(step: &str, iterations: u32) -> Self {
        Self::FunctionContract {
            step: step.to_string(),
            reason: format!(
                "extra-resource requirements did not stabilize after {iterations} iterations"
            ),
        }
    }
}

impl From<kube::Error> for EngineError {
    fn from(err: kube::Error) -> Self {
        match &err {
            kube::Error::Api(api_err) if api_err.code == 404 => Self::Dependency {
                kind: "resource".to_string(),
                name: api_err.message.clone(),
                reason: "not found".to_string(),
            },
            _ => Self::Transient {
                operation: "backing API call".to_string(),
                reason: err.to_string(),
            },
        }
    }
}

#[cfg(test)]
#[path = "errors_tests.rs"]
mod errors_tests;
