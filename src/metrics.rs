// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Prometheus metrics for the Loomy engine.
//!
//! This module provides metrics collection with the namespace prefix
//! `loomy_firestoned_io_` (prometheus-safe version of "loomy.firestoned.io").
//!
//! # Metrics Categories
//!
//! - **Reconciliation Metrics** - reconcile outcomes and durations per kind
//! - **Pipeline Metrics** - function invocations and stabilization rounds
//! - **Composed-Resource Metrics** - applies, deletes, and orphan handling
//! - **Error Metrics** - failures by taxonomy kind
//!
//! # Example
//!
//! ```rust,no_run
//! use loomy::metrics::record_reconciliation_success;
//!
//! record_reconciliation_success("CompositeResource", std::time::Duration::from_secs(1));
//! ```

use prometheus::{
    CounterVec, Encoder, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use std::sync::LazyLock;
use std::time::Duration;

/// Namespace prefix for all Loomy metrics (prometheus-safe)
const METRICS_NAMESPACE: &str = "loomy_firestoned_io";

/// Global Prometheus metrics registry
///
/// All metrics are registered in this registry and exposed via the
/// `/metrics` endpoint.
pub static METRICS_REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

// ============================================================================
// Reconciliation Metrics
// ============================================================================

/// Total number of reconciliations by resource type and status
///
/// Labels:
/// - `resource_type`: Kind of resource (e.g. `CompositeResource`, `Composition`)
/// - `status`: Outcome (`success`, `error`, `requeue`)
pub static RECONCILIATION_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        format!("{METRICS_NAMESPACE}_reconciliations_total"),
        "Total number of reconciliations by resource type and status",
    );
    let counter = CounterVec::new(opts, &["resource_type", "status"]).unwrap();
    METRICS_REGISTRY
        .register(Box::new(counter.clone()))
        .unwrap();
    counter
});

/// Duration of reconciliations in seconds
///
/// Labels:
/// - `resource_type`: Kind of resource
pub static RECONCILIATION_DURATION_SECONDS: LazyLock<HistogramVec> = LazyLock::new(|| {
    let opts = HistogramOpts::new(
        format!("{METRICS_NAMESPACE}_reconciliation_duration_seconds"),
        "Duration of reconciliations in seconds by resource type",
    )
    .buckets(vec![0.001, 0.01, 0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0]);
    let histogram = HistogramVec::new(opts, &["resource_type"]).unwrap();
    METRICS_REGISTRY
        .register(Box::new(histogram.clone()))
        .unwrap();
    histogram
});

// ============================================================================
// Pipeline Metrics
// ============================================================================

/// Total composition-function invocations by function name and outcome
pub static FUNCTION_INVOCATIONS_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        format!("{METRICS_NAMESPACE}_function_invocations_total"),
        "Total composition function invocations by function and status",
    );
    let counter = CounterVec::new(opts, &["function", "status"]).unwrap();
    METRICS_REGISTRY
        .register(Box::new(counter.clone()))
        .unwrap();
    counter
});

/// Stabilization rounds needed per pipeline step
///
/// A step that never requests extra resources records zero rounds; the
/// alertable tail is steps repeatedly hitting the cap.
pub static STABILIZATION_ROUNDS: LazyLock<HistogramVec> = LazyLock::new(|| {
    let opts = HistogramOpts::new(
        format!("{METRICS_NAMESPACE}_stabilization_rounds"),
        "Extra-resource stabilization rounds per pipeline step",
    )
    .buckets(vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0]);
    let histogram = HistogramVec::new(opts, &["step"]).unwrap();
    METRICS_REGISTRY
        .register(Box::new(histogram.clone()))
        .unwrap();
    histogram
});

// ============================================================================
// Composed-Resource Metrics
// ============================================================================

/// Total composed-resource operations by kind and operation
///
/// Labels:
/// - `resource_type`: Kind of composed resource
/// - `operation`: `apply`, `delete`, `orphan_delete`, `orphan_retain`
pub static COMPOSED_OPERATIONS_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        format!("{METRICS_NAMESPACE}_composed_operations_total"),
        "Total composed-resource operations by kind and operation",
    );
    let counter = CounterVec::new(opts, &["resource_type", "operation"]).unwrap();
    METRICS_REGISTRY
        .register(Box::new(counter.clone()))
        .unwrap();
    counter
});

// ============================================================================
// Error Metrics
// ============================================================================

/// Total errors by resource type and taxonomy kind
///
/// Labels:
/// - `resource_type`: Kind of resource being reconciled
/// - `error_kind`: Taxonomy kind (`Transient`, `Validation`, ...)
pub static ERRORS_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        format!("{METRICS_NAMESPACE}_errors_total"),
        "Total errors by resource type and taxonomy kind",
    );
    let counter = CounterVec::new(opts, &["resource_type", "error_kind"]).unwrap();
    METRICS_REGISTRY
        .register(Box::new(counter.clone()))
        .unwrap();
    counter
});

// ============================================================================
// Helper Functions
// ============================================================================

/// Record a successful reconciliation
pub fn record_reconciliation_success(resource_type: &str, duration: Duration) {
    RECONCILIATION_TOTAL
        .with_label_values(&[resource_type, "success"])
        .inc();
    RECONCILIATION_DURATION_SECONDS
        .with_label_values(&[resource_type])
        .observe(duration.as_secs_f64());
}

/// Record a failed reconciliation
pub fn record_reconciliation_error(resource_type: &str, duration: Duration) {
    RECONCILIATION_TOTAL
        .with_label_values(&[resource_type, "error"])
        .inc();
    RECONCILIATION_DURATION_SECONDS
        .with_label_values(&[resource_type])
        .observe(duration.as_secs_f64());
}

/// Record an immediate requeue
pub fn record_reconciliation_requeue(resource_type: &str) {
    RECONCILIATION_TOTAL
        .with_label_values(&[resource_type, "requeue"])
        .inc();
}

/// Record an error by taxonomy kind
pub fn record_error(resource_type: &str, error_kind: &str) {
    ERRORS_TOTAL
        .with_label_values(&[resource_type, error_kind])
        .inc();
}

/// Render all registered metrics in the Prometheus text format.
///
/// # Errors
///
/// Returns an error when encoding fails.
pub fn gather_metrics() -> Result<String, prometheus::Error> {
    let metric_families = METRICS_REGISTRY.gather();
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer).unwrap_or_default())
}

#[cfg(test)]
#[path = "metrics_tests.rs"]
mod metrics_tests;
