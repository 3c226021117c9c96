// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Unit tests for `readiness.rs`

use crate::readiness::{is_ready, ReadinessCheck};
use serde_json::json;

#[test]
fn test_default_rule_requires_ready_condition() {
    let ready = json!({"status": {"conditions": [
        {"type": "Ready", "status": "True"}
    ]}});
    let not_ready = json!({"status": {"conditions": [
        {"type": "Ready", "status": "False"}
    ]}});
    let no_conditions = json!({"status": {}});

    assert!(is_ready(&[], &ready).unwrap());
    assert!(!is_ready(&[], &not_ready).unwrap());
    assert!(!is_ready(&[], &no_conditions).unwrap());
    assert!(!is_ready(&[], &json!({})).unwrap());
}

#[test]
fn test_default_rule_ignores_other_condition_types() {
    let observed = json!({"status": {"conditions": [
        {"type": "Synced", "status": "True"}
    ]}});
    assert!(!is_ready(&[], &observed).unwrap());
}

#[test]
fn test_non_empty_check() {
    let check = ReadinessCheck::NonEmpty {
        field_path: "status.endpoint".to_string(),
    };
    assert!(check.passes(&json!({"status": {"endpoint": "db:5432"}})).unwrap());
    assert!(!check.passes(&json!({"status": {"endpoint": ""}})).unwrap());
    assert!(!check.passes(&json!({"status": {"endpoint": null}})).unwrap());
    assert!(!check.passes(&json!({"status": {"endpoint": []}})).unwrap());
    assert!(!check.passes(&json!({"status": {}})).unwrap());
    // Zero and false are values, not absences.
    assert!(check.passes(&json!({"status": {"endpoint": 0}})).unwrap());
    assert!(check.passes(&json!({"status": {"endpoint": false}})).unwrap());
}

#[test]
fn test_match_string_check() {
    let check = ReadinessCheck::MatchString {
        field_path: "status.phase".to_string(),
        match_string: "Running".to_string(),
    };
    assert!(check.passes(&json!({"status": {"phase": "Running"}})).unwrap());
    assert!(!check.passes(&json!({"status": {"phase": "Pending"}})).unwrap());
    assert!(!check.passes(&json!({"status": {"phase": 1}})).unwrap());
    assert!(!check.passes(&json!({})).unwrap());
}

#[test]
fn test_match_integer_check() {
    let check = ReadinessCheck::MatchInteger {
        field_path: "status.readyReplicas".to_string(),
        match_integer: 3,
    };
    assert!(check.passes(&json!({"status": {"readyReplicas": 3}})).unwrap());
    assert!(!check.passes(&json!({"status": {"readyReplicas": 2}})).unwrap());
    // Floating-point observations never match.
    assert!(!check.passes(&json!({"status": {"readyReplicas": 3.0}})).unwrap());
    assert!(!check.passes(&json!({"status": {"readyReplicas": "3"}})).unwrap());
}

#[test]
fn test_none_check_pins_never_ready() {
    let observed = json!({"status": {"conditions": [
        {"type": "Ready", "status": "True"}
    ]}});
    assert!(!is_ready(&[ReadinessCheck::None], &observed).unwrap());
}

#[test]
fn test_all_declared_checks_must_pass() {
    let observed = json!({"status": {"phase": "Running", "readyReplicas": 2}});
    let checks = vec![
        ReadinessCheck::MatchString {
            field_path: "status.phase".to_string(),
            match_string: "Running".to_string(),
        },
        ReadinessCheck::MatchInteger {
            field_path: "status.readyReplicas".to_string(),
            match_integer: 3,
        },
    ];
    assert!(!is_ready(&checks, &observed).unwrap());

    let observed = json!({"status": {"phase": "Running", "readyReplicas": 3}});
    assert!(is_ready(&checks, &observed).unwrap());
}

#[test]
fn test_declared_checks_override_default_rule() {
    // No Ready condition, but the declared check passes.
    let observed = json!({"status": {"endpoint": "db:5432"}});
    let checks = vec![ReadinessCheck::NonEmpty {
        field_path: "status.endpoint".to_string(),
    }];
    assert!(is_ready(&checks, &observed).unwrap());
}
