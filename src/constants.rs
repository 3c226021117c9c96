// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Global constants for the Loomy engine.
//!
//! This module contains all numeric and string constants used throughout the codebase.
//! Constants are organized by category for easy maintenance.

// ============================================================================
// API Constants
// ============================================================================

/// API group for all Loomy CRDs
pub const API_GROUP: &str = "loomy.firestoned.io";

/// API version for all Loomy CRDs
pub const API_VERSION: &str = "v1alpha1";

/// Fully qualified API version (group/version)
pub const API_GROUP_VERSION: &str = "loomy.firestoned.io/v1alpha1";

/// Kind name for the `CompositeResourceDefinition` resource
pub const KIND_COMPOSITE_RESOURCE_DEFINITION: &str = "CompositeResourceDefinition";

/// Kind name for the `Composition` resource
pub const KIND_COMPOSITION: &str = "Composition";

/// Kind name for the `CompositionRevision` resource
pub const KIND_COMPOSITION_REVISION: &str = "CompositionRevision";

/// Resource-type label value used in metrics for dynamic composite resources
pub const KIND_COMPOSITE: &str = "CompositeResource";

// ============================================================================
// Server-Side Apply
// ============================================================================

/// Field manager identity the engine uses for all server-side applies.
///
/// The engine only claims ownership of the fields it renders under this
/// manager; fields written by users or other controllers are left alone.
pub const FIELD_MANAGER: &str = "loomy-engine";

// ============================================================================
// Reconcile Loop Constants
// ============================================================================

/// Default poll interval between successful reconciles of a composite (60s)
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 60;

/// Default number of concurrent reconcile workers per composite controller
pub const DEFAULT_WORKER_COUNT: usize = 10;

/// Default per-reconcile deadline (3 minutes)
pub const DEFAULT_RECONCILE_DEADLINE_SECS: u64 = 180;

/// Base delay for per-key exponential error backoff (1s)
pub const ERROR_BACKOFF_BASE_SECS: u64 = 1;

/// Cap for per-key exponential error backoff (60s)
pub const ERROR_BACKOFF_CAP_SECS: u64 = 60;

/// Maximum iterations of the extra-resource stabilization loop per pipeline
/// step before the reconcile fails with `ExtraResourcesDidNotStabilize`
pub const STABILIZATION_CAP: u32 = 5;

// ============================================================================
// Composition Revision Constants
// ============================================================================

/// Default number of `CompositionRevision`s to keep per Composition.
///
/// A value of 0 disables revision garbage collection entirely.
pub const DEFAULT_REVISION_HISTORY_LIMIT: u32 = 1;

/// Length of the content-hash prefix appended to generated revision names
pub const REVISION_NAME_HASH_LEN: usize = 7;

// ============================================================================
// Composed Resource Naming
// ============================================================================

/// Length of the random suffix appended to generated composed-resource names
pub const COMPOSED_NAME_SUFFIX_LEN: usize = 5;

/// Maximum length of a generated composed-resource name (DNS subdomain limit)
pub const COMPOSED_NAME_MAX_LEN: usize = 253;

// ============================================================================
// Leader Election Constants
// ============================================================================

/// Default leader election lease duration (15 seconds)
pub const DEFAULT_LEASE_DURATION_SECS: u64 = 15;

/// Default leader election lease grace period (5 seconds)
pub const DEFAULT_LEASE_GRACE_SECS: u64 = 5;

/// Lease name used for leader election
pub const LEASE_NAME: &str = "loomy-engine-lock";

// ============================================================================
// Runtime Constants
// ============================================================================

/// Number of worker threads for the Tokio runtime
pub const TOKIO_WORKER_THREADS: usize = 4;

// ============================================================================
// Metrics Server Constants
// ============================================================================

/// Port for the Prometheus metrics HTTP server
pub const METRICS_SERVER_PORT: u16 = 8080;

/// Path for the Prometheus metrics endpoint
pub const METRICS_SERVER_PATH: &str = "/metrics";

/// Bind address for the metrics HTTP server
pub const METRICS_SERVER_BIND_ADDRESS: &str = "0.0.0.0";
