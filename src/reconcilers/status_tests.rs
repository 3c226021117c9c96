// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Unit tests for `reconcilers/status.rs`

use crate::reconcilers::status::{
    condition_changed, create_condition, find_condition, is_reserved_condition, not_ready, ready,
    sync_failed, synced, REASON_AVAILABLE, REASON_RECONCILE_SUCCESS, REASON_UNAVAILABLE,
};

#[test]
fn test_create_condition_sets_timestamp() {
    let condition = create_condition("Ready", "True", "Available", "all good");
    assert_eq!(condition.r#type, "Ready");
    assert_eq!(condition.status, "True");
    assert_eq!(condition.reason.as_deref(), Some("Available"));
    assert_eq!(condition.message.as_deref(), Some("all good"));
    assert!(condition.last_transition_time.is_some());
}

#[test]
fn test_engine_condition_builders() {
    let s = synced();
    assert_eq!(s.r#type, "Synced");
    assert_eq!(s.status, "True");
    assert_eq!(s.reason.as_deref(), Some(REASON_RECONCILE_SUCCESS));

    let f = sync_failed("Dependency", "composition not found");
    assert_eq!(f.r#type, "Synced");
    assert_eq!(f.status, "False");
    assert_eq!(f.reason.as_deref(), Some("Dependency"));

    let r = ready();
    assert_eq!(r.r#type, "Ready");
    assert_eq!(r.reason.as_deref(), Some(REASON_AVAILABLE));

    let n = not_ready(REASON_UNAVAILABLE, "waiting");
    assert_eq!(n.status, "False");
}

#[test]
fn test_condition_changed_semantics() {
    let existing = create_condition("Ready", "False", "Pending", "waiting");

    let same = create_condition("Ready", "False", "OtherReason", "waiting");
    // Reason alone does not count as a change.
    assert!(!condition_changed(&Some(existing.clone()), &same));

    let status_flip = create_condition("Ready", "True", "Available", "waiting");
    assert!(condition_changed(&Some(existing.clone()), &status_flip));

    let message_change = create_condition("Ready", "False", "Pending", "still waiting");
    assert!(condition_changed(&Some(existing), &message_change));

    assert!(condition_changed(&None, &same));
}

#[test]
fn test_find_condition() {
    let conditions = vec![
        create_condition("Synced", "True", "ReconcileSuccess", ""),
        create_condition("Ready", "False", "Unavailable", ""),
    ];
    assert_eq!(
        find_condition(&conditions, "Ready").unwrap().status,
        "False"
    );
    assert!(find_condition(&conditions, "Established").is_none());
}

#[test]
fn test_reserved_condition_types() {
    assert!(is_reserved_condition("Ready"));
    assert!(is_reserved_condition("Synced"));
    assert!(!is_reserved_condition("DatabaseReady"));
}
