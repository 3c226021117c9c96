// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Status condition helpers for Loomy-managed resources.
//!
//! Composites carry two engine-owned conditions: `Synced` reports the last
//! reconcile outcome and `Ready` aggregates composed-resource readiness.
//! Composition functions may forward further user-defined conditions, which
//! are validated against the reserved set before landing on the composite.

use crate::crd::Condition;
use chrono::Utc;

/// Condition type reporting the last reconcile outcome.
pub const CONDITION_TYPE_SYNCED: &str = "Synced";

/// Condition type aggregating composed-resource readiness.
pub const CONDITION_TYPE_READY: &str = "Ready";

/// Condition type on definitions whose composite controller is running.
pub const CONDITION_TYPE_ESTABLISHED: &str = "Established";

/// Reason on `Synced=True` after a successful reconcile.
pub const REASON_RECONCILE_SUCCESS: &str = "ReconcileSuccess";

/// Reason on `Ready=True` when all composed resources are ready.
pub const REASON_AVAILABLE: &str = "Available";

/// Reason on `Ready=False` while composed resources are converging.
pub const REASON_UNAVAILABLE: &str = "Unavailable";

/// Reason on `Ready=False` when a pipeline step returned a fatal result.
pub const REASON_FATAL_RESULT: &str = "FatalResult";

/// Reason on `Ready=False` while the composite is being torn down.
pub const REASON_DELETING: &str = "Deleting";

/// Condition types owned by the engine; functions may not forward them.
pub const RESERVED_CONDITION_TYPES: &[&str] = &[CONDITION_TYPE_SYNCED, CONDITION_TYPE_READY];

/// Whether a condition type belongs to the engine's reserved set.
#[must_use]
pub fn is_reserved_condition(condition_type: &str) -> bool {
    RESERVED_CONDITION_TYPES.contains(&condition_type)
}

/// Create a new condition with the current timestamp.
#[must_use]
pub fn create_condition(
    condition_type: &str,
    status: &str,
    reason: &str,
    message: &str,
) -> Condition {
    Condition {
        r#type: condition_type.to_string(),
        status: status.to_string(),
        reason: Some(reason.to_string()),
        message: Some(message.to_string()),
        last_transition_time: Some(Utc::now().to_rfc3339()),
    }
}

/// The `Synced=True` condition after a successful reconcile.
#[must_use]
pub fn synced() -> Condition {
    create_condition(
        CONDITION_TYPE_SYNCED,
        "True",
        REASON_RECONCILE_SUCCESS,
        "Composite resource reconciled",
    )
}

/// The `Synced=False` condition for a failed reconcile.
///
/// The reason carries the error taxonomy kind so operators can alert on
/// repeated contract or dependency failures.
#[must_use]
pub fn sync_failed(reason: &str, message: &str) -> Condition {
    create_condition(CONDITION_TYPE_SYNCED, "False", reason, message)
}

/// The `Ready=True` condition once every composed resource is ready.
#[must_use]
pub fn ready() -> Condition {
    create_condition(
        CONDITION_TYPE_READY,
        "True",
        REASON_AVAILABLE,
        "All composed resources are ready",
    )
}

/// The `Ready=False` condition naming why the composite is not ready.
#[must_use]
pub fn not_ready(reason: &str, message: &str) -> Condition {
    create_condition(CONDITION_TYPE_READY, "False", reason, message)
}

/// Check if a condition has changed compared to the existing status.
///
/// The `reason` and `lastTransitionTime` are not compared; only type,
/// status, and message decide whether an update is worth persisting. This
/// keeps status rewrites from churning watch streams into reconcile loops.
#[must_use]
pub fn condition_changed(existing: &Option<Condition>, new_condition: &Condition) -> bool {
    if let Some(current) = existing {
        current.r#type != new_condition.r#type
            || current.status != new_condition.status
            || current.message != new_condition.message
    } else {
        // No existing condition, so it has changed
        true
    }
}

/// Find a condition by type in a list of conditions.
#[must_use]
pub fn find_condition<'a>(
    conditions: &'a [Condition],
    condition_type: &str,
) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.r#type == condition_type)
}

#[cfg(test)]
#[path = "status_tests.rs"]
mod status_tests;
