// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Unit tests for `reconcilers/mod.rs`

use crate::reconcilers::should_reconcile;

#[test]
fn test_should_reconcile_when_generation_differs() {
    assert!(should_reconcile(Some(2), Some(1)));
}

#[test]
fn test_should_not_reconcile_when_generation_matches() {
    assert!(!should_reconcile(Some(3), Some(3)));
}

#[test]
fn test_should_reconcile_on_first_observation() {
    assert!(should_reconcile(Some(1), None));
}

#[test]
fn test_should_not_reconcile_without_generation_tracking() {
    assert!(!should_reconcile(None, None));
    assert!(!should_reconcile(None, Some(1)));
}
