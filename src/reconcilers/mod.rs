// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Reconciliation controllers for composite resource management.
//!
//! This module contains the reconciliation logic for all Loomy-managed
//! resources. Each reconciler compares desired state with observed state
//! and converges the backing API toward it.
//!
//! # Reconciliation Architecture
//!
//! Loomy follows the standard Kubernetes controller pattern:
//!
//! 1. **Watch** - Monitor resource changes via the Kubernetes API
//! 2. **Reconcile** - Compare desired state with actual state
//! 3. **Update** - Apply composed resources and composite bookkeeping
//! 4. **Status** - Report reconciliation results back to Kubernetes
//!
//! # Available Reconcilers
//!
//! - [`composite::reconcile_composite`] - the per-composite driver: runs
//!   the Composition pipeline, applies composed resources, aggregates
//!   readiness and connection details
//! - [`composition::reconcile_composition`] - cuts immutable
//!   `CompositionRevision` snapshots and garbage-collects old ones
//! - [`definition::reconcile_definition`] - establishes
//!   `CompositeResourceDefinition`s so composite controllers can start

pub mod composite;
pub mod composition;
pub mod definition;
pub mod finalizers;
pub mod retry;
pub mod status;

#[cfg(test)]
pub mod testing;

pub use composite::{reconcile_composite, Engine, EngineConfig, ReconcileOutcome};
pub use composition::reconcile_composition;
pub use definition::reconcile_definition;

/// Check if a resource's spec has changed by comparing generation with
/// `observed_generation`.
///
/// `metadata.generation` is incremented by the API server only when the
/// spec changes, while `status.observedGeneration` is written by the
/// controller after processing a spec.
///
/// # Returns
///
/// * `true` - Reconciliation is needed (spec changed or first reconciliation)
/// * `false` - No reconciliation needed (spec unchanged, status-only update)
#[must_use]
pub fn should_reconcile(current_generation: Option<i64>, observed_generation: Option<i64>) -> bool {
    match (current_generation, observed_generation) {
        (Some(current), Some(observed)) => current != observed,
        (Some(_), None) => true, // First reconciliation
        _ => false,              // No generation tracking available
    }
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod mod_tests;
