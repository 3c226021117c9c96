// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Common label and annotation constants used across all reconcilers.
//!
//! This module defines standard Kubernetes labels and Loomy-specific labels/annotations
//! to ensure consistency across all resources created by the engine.

// ============================================================================
// Kubernetes Standard Labels
// https://kubernetes.io/docs/concepts/overview/working-with-objects/common-labels/
// ============================================================================

/// Standard label for the tool being used to manage the operation of an application
pub const K8S_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

/// Standard label for the name of a higher-level application this one is part of
pub const K8S_PART_OF: &str = "app.kubernetes.io/part-of";

/// Value for `app.kubernetes.io/part-of` indicating a resource is part of Loomy
pub const PART_OF_LOOMY: &str = "loomy";

/// Value for `app.kubernetes.io/managed-by` on resources the engine owns
pub const MANAGED_BY_LOOMY: &str = "loomy";

// ============================================================================
// Loomy-Specific Annotations
// ============================================================================

/// Annotation carrying the stable template name of a composed resource.
///
/// The engine associates composition templates to already-existing composed
/// resources by this annotation; the actual API name may be generated.
pub const TEMPLATE_NAME_ANNOTATION: &str = "loomy.firestoned.io/template-name";

/// Annotation carrying the deletion policy stamped onto a composed resource
/// at apply time. Orphan handling reads this after the template has
/// disappeared from the pipeline output.
pub const DELETION_POLICY_ANNOTATION: &str = "loomy.firestoned.io/deletion-policy";

// ============================================================================
// Loomy-Specific Labels
// ============================================================================

/// Label on a `CompositionRevision` naming its parent Composition
pub const REVISION_COMPOSITION_LABEL: &str = "loomy.firestoned.io/composition";

/// Label on a `CompositionRevision` carrying the parent's content hash
pub const REVISION_HASH_LABEL: &str = "loomy.firestoned.io/composition-hash";

/// Label on a composed resource naming the composite that owns it
pub const COMPOSITE_LABEL: &str = "loomy.firestoned.io/composite";

// ============================================================================
// Finalizers
// ============================================================================

/// Finalizer placed on every composite resource the engine manages
pub const FINALIZER_COMPOSITE: &str = "loomy.firestoned.io/composite-finalizer";

// ============================================================================
// Deletion Policy Values
// ============================================================================

/// Deletion-policy value: delete the composed resource when orphaned
pub const DELETION_POLICY_DELETE: &str = "Delete";

/// Deletion-policy value: keep the composed resource but unlink the owner
/// reference when orphaned
pub const DELETION_POLICY_RETAIN: &str = "Retain";
