// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Custom Resource Definitions (CRDs) for composite resource management.
//!
//! This module defines the Kubernetes Custom Resource Definitions used by
//! Loomy to reconcile composite resources declaratively.
//!
//! # Resource Types
//!
//! - [`CompositeResourceDefinition`] - declares a new abstract resource type
//!   (XR); the engine starts a dynamic controller for each established
//!   definition
//! - [`Composition`] - a template pipeline that produces the desired
//!   composed resources for an XR
//! - [`CompositionRevision`] - an immutable, numbered snapshot of a
//!   Composition
//!
//! Composite resources themselves are user-defined types and are handled
//! dynamically (see [`crate::composite`]); they have no static type here.
//!
//! # Example: A Pipeline Composition
//!
//! ```yaml
//! apiVersion: loomy.firestoned.io/v1alpha1
//! kind: Composition
//! metadata:
//!   name: app-with-db
//! spec:
//!   compositeTypeRef:
//!     apiVersion: example.org/v1
//!     kind: App
//!   mode: Pipeline
//!   pipeline:
//!     - step: render
//!       functionRef:
//!         name: template
//!       input:
//!         flavor: standard
//! ```

use crate::connection::ConnectionDetailRule;
use crate::patches::{Patch, PatchSet};
use crate::readiness::ReadinessCheck;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Condition represents an observation of a resource's current state.
///
/// Conditions are used in status subresources to communicate the state of
/// a resource to users and controllers.
#[derive(Clone, Debug, Serialize, Deserialize, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition. Loomy writes `Ready` and `Synced`; composition
    /// functions may forward further user-defined types.
    pub r#type: String,

    /// Status of the condition: True, False, or Unknown.
    pub status: String,

    /// Brief CamelCase reason for the condition's last transition.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Human-readable message indicating details about the transition.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Last time the condition transitioned from one status to another (RFC3339 format).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
}

/// Label selector to match Kubernetes resources.
///
/// The result of matchLabels and matchExpressions are `ANDed`. An empty
/// label selector matches all objects.
#[derive(Clone, Debug, Serialize, Deserialize, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LabelSelector {
    /// Map of {key,value} pairs. All pairs must be present on the target.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub match_labels: Option<BTreeMap<String, String>>,

    /// List of label selector requirements. All requirements must be satisfied.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub match_expressions: Option<Vec<LabelSelectorRequirement>>,
}

/// A label selector requirement is a selector that contains values, a key,
/// and an operator that relates the key and values.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LabelSelectorRequirement {
    /// The label key that the selector applies to.
    pub key: String,

    /// Operator represents a key's relationship to a set of values.
    /// Valid operators are In, `NotIn`, Exists and `DoesNotExist`.
    pub operator: String,

    /// An array of string values. If the operator is In or `NotIn`,
    /// the values array must be non-empty. If the operator is Exists or
    /// `DoesNotExist`, the values array must be empty.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub values: Option<Vec<String>>,
}

impl LabelSelector {
    /// Check whether this selector matches the given labels.
    #[must_use]
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        if let Some(match_labels) = &self.match_labels {
            for (key, value) in match_labels {
                if labels.get(key) != Some(value) {
                    return false;
                }
            }
        }

        if let Some(expressions) = &self.match_expressions {
            for requirement in expressions {
                let value = labels.get(&requirement.key);
                let values = requirement.values.as_deref().unwrap_or_default();
                let ok = match requirement.operator.as_str() {
                    "In" => value.is_some_and(|v| values.contains(v)),
                    "NotIn" => !value.is_some_and(|v| values.contains(v)),
                    "Exists" => value.is_some(),
                    "DoesNotExist" => value.is_none(),
                    _ => false,
                };
                if !ok {
                    return false;
                }
            }
        }

        true
    }
}

/// A reference to a composite resource type by group/version and kind.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TypeReference {
    /// API version (group/version) of the referenced type, e.g. `example.org/v1`.
    pub api_version: String,

    /// Kind of the referenced type.
    pub kind: String,
}

/// A reference to a named secret in a specific namespace.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SecretReference {
    /// Name of the secret.
    pub name: String,

    /// Namespace of the secret.
    pub namespace: String,
}

// ============================================================================
// CompositeResourceDefinition
// ============================================================================

/// Names served by a defined composite resource type.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceNames {
    /// Kind of the defined type, e.g. `App`.
    pub kind: String,

    /// Plural resource name, e.g. `apps`.
    pub plural: String,

    /// Singular resource name; defaults to the lowercased kind.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub singular: Option<String>,

    /// Short names for CLI use.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub short_names: Option<Vec<String>>,
}

/// One served version of a defined composite resource type.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DefinitionVersion {
    /// Version name, e.g. `v1`.
    pub name: String,

    /// Whether this version is served by the API.
    pub served: bool,

    /// Whether Compositions may reference this version.
    pub referenceable: bool,

    /// Optional structural schema for this version (OpenAPI v3 fragment).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<Value>,
}

/// How stored versions are converted.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DefinitionConversion {
    /// Conversion strategy: `None` or `Webhook`.
    pub strategy: String,

    /// Client configuration for the conversion webhook. Required when the
    /// strategy is `Webhook`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_client_config: Option<Value>,
}

/// `CompositeResourceDefinition` (XRD) declares a new abstract resource
/// type whose instances are reconciled by the engine.
///
/// Group, kind, and plural names are immutable after creation; updates that
/// change them are rejected with field-level errors.
#[derive(CustomResource, Clone, Debug, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "loomy.firestoned.io",
    version = "v1alpha1",
    kind = "CompositeResourceDefinition",
    shortname = "xrd",
    shortname = "xrds",
    doc = "CompositeResourceDefinition declares a new abstract resource type (XR). The engine starts a dynamic reconciler for each established definition and synthesizes composed resources for its instances.",
    printcolumn = r#"{"name":"Established","type":"string","jsonPath":".status.conditions[?(@.type=='Established')].status"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[kube(status = "CompositeResourceDefinitionStatus")]
#[serde(rename_all = "camelCase")]
pub struct CompositeResourceDefinitionSpec {
    /// API group of the defined type, e.g. `example.org`. Immutable.
    pub group: String,

    /// Names of the defined composite type. Kind and plural are immutable.
    pub names: ResourceNames,

    /// Names of the namespaced claim type, when claims are enabled.
    /// Claim kind and plural are immutable once set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claim_names: Option<ResourceNames>,

    /// Served versions of the defined type.
    pub versions: Vec<DefinitionVersion>,

    /// Conversion configuration between stored versions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversion: Option<DefinitionConversion>,

    /// Name of a Composition instances of this type default to when they
    /// reference none and no selector matches.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_composition_ref: Option<String>,
}

/// Status of a `CompositeResourceDefinition`.
#[derive(Clone, Debug, Serialize, Deserialize, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CompositeResourceDefinitionStatus {
    /// Current conditions (`Established`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<Condition>>,

    /// Generation most recently processed by the definition controller.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

// ============================================================================
// Composition
// ============================================================================

/// How a Composition computes desired composed resources.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub enum CompositionMode {
    /// Run an ordered pipeline of composition functions.
    #[default]
    Pipeline,

    /// Render a static list of resource templates with patches.
    Resources,
}

/// A reference to a composition function by name.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FunctionReference {
    /// Name of the function.
    pub name: String,
}

/// Where a pipeline step's credentials come from.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub enum CredentialsSource {
    /// The step needs no credentials.
    #[default]
    None,

    /// Credentials are loaded from a named secret.
    Secret,
}

/// Credentials passed to a composition function alongside a step.
///
/// The engine does not interpret the credential data; it loads the bundle
/// and hands it to the function runner opaquely.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FunctionCredentials {
    /// Name the function knows these credentials by. Unique per step.
    pub name: String,

    /// Source of the credential data.
    #[serde(default)]
    pub source: CredentialsSource,

    /// Reference to the secret holding the credentials. Required when
    /// source is `Secret`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<SecretReference>,
}

/// One step of a Composition's function pipeline.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PipelineStep {
    /// Step name, unique within the pipeline.
    pub step: String,

    /// The function this step invokes.
    pub function_ref: FunctionReference,

    /// Opaque input document passed to the function; the schema is defined
    /// by the function itself.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,

    /// Credentials passed to the function for this step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<Vec<FunctionCredentials>>,
}

/// What happens to a composed resource when its template disappears from
/// the pipeline output.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub enum DeletionPolicy {
    /// Delete the composed resource.
    #[default]
    Delete,

    /// Keep the composed resource but unlink its owner reference.
    Retain,
}

/// One composed-resource template of a `Resources`-mode Composition.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ComposedTemplate {
    /// Stable template name. Either all templates in a Composition are
    /// named or none are; anonymous templates bind by positional index.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// The base document of the composed resource.
    pub base: Value,

    /// Patches applied between the composite and this composed resource.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub patches: Vec<Patch>,

    /// Readiness checks; when empty the standard `Ready` condition decides.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub readiness_checks: Option<Vec<ReadinessCheck>>,

    /// Connection-detail rules contributed by this composed resource.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_details: Option<Vec<ConnectionDetailRule>>,

    /// Orphan-handling policy for this template.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_policy: Option<DeletionPolicy>,
}

/// `Composition` describes how to synthesize composed resources for a
/// composite resource type.
///
/// Compositions are snapshotted into immutable [`CompositionRevision`]s;
/// composites bind to a specific revision and re-reconcile when it rotates.
#[derive(CustomResource, Clone, Debug, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "loomy.firestoned.io",
    version = "v1alpha1",
    kind = "Composition",
    shortname = "comp",
    shortname = "comps",
    doc = "Composition describes how composed resources are synthesized for a composite resource type, either through an ordered pipeline of composition functions or a static list of patched resource templates.",
    printcolumn = r#"{"name":"XR-Kind","type":"string","jsonPath":".spec.compositeTypeRef.kind"}"#,
    printcolumn = r#"{"name":"XR-APIVersion","type":"string","jsonPath":".spec.compositeTypeRef.apiVersion"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct CompositionSpec {
    /// The composite resource type this Composition can produce.
    pub composite_type_ref: TypeReference,

    /// How desired state is computed. Defaults to `Pipeline`.
    #[serde(default)]
    pub mode: CompositionMode,

    /// Ordered function pipeline; required in `Pipeline` mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline: Option<Vec<PipelineStep>>,

    /// Resource templates; required in `Resources` mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<Vec<ComposedTemplate>>,

    /// Named patch sets templates may reference via `PatchSet` patches.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch_sets: Option<Vec<PatchSet>>,

    /// Default namespace for composite connection secrets. Stamped onto
    /// composites that declare no connection-secret namespace themselves.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub write_connection_secrets_to_namespace: Option<String>,

    /// How many revisions to keep; 0 disables revision garbage collection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision_history_limit: Option<u32>,
}

// ============================================================================
// CompositionRevision
// ============================================================================

/// `CompositionRevision` is a point-in-time snapshot of a Composition with
/// a monotonically-increasing revision number and a content hash.
///
/// Revisions are immutable once cut; old revisions are garbage-collected
/// keeping the configured history limit.
#[derive(CustomResource, Clone, Debug, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "loomy.firestoned.io",
    version = "v1alpha1",
    kind = "CompositionRevision",
    shortname = "comprev",
    doc = "CompositionRevision is an immutable, numbered snapshot of a Composition. Composite resources bind to a specific revision; rotation triggers a re-reconcile.",
    printcolumn = r#"{"name":"Revision","type":"integer","jsonPath":".spec.revision"}"#,
    printcolumn = r#"{"name":"XR-Kind","type":"string","jsonPath":".spec.compositeTypeRef.kind"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct CompositionRevisionSpec {
    /// The monotonically-increasing revision number within the parent
    /// Composition.
    pub revision: i64,

    /// The composite resource type the snapshot produces.
    pub composite_type_ref: TypeReference,

    /// Snapshot of the Composition's mode.
    #[serde(default)]
    pub mode: CompositionMode,

    /// Snapshot of the function pipeline.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline: Option<Vec<PipelineStep>>,

    /// Snapshot of the resource templates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<Vec<ComposedTemplate>>,

    /// Snapshot of the named patch sets.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch_sets: Option<Vec<PatchSet>>,

    /// Snapshot of the connection-secret namespace default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub write_connection_secrets_to_namespace: Option<String>,
}

// ============================================================================
// Dynamic-object references
// ============================================================================

/// A reference from a composite to one of its composed resources.
///
/// The composite tracks one reference per template name, in insertion
/// order of first appearance.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRef {
    /// API version of the composed resource.
    pub api_version: String,

    /// Kind of the composed resource.
    pub kind: String,

    /// Name of the composed resource (may be engine-generated).
    pub name: String,

    /// Namespace, empty for cluster-scoped composed resources.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// A reference from a composite back to the claim that created it.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ClaimRef {
    /// API version of the claim.
    pub api_version: String,

    /// Kind of the claim.
    pub kind: String,

    /// Name of the claim.
    pub name: String,

    /// Namespace of the claim.
    pub namespace: String,
}

/// A selector for extra resources requested by a composition function.
///
/// Requirement stabilization compares selectors for equality: only a change
/// in declared needs counts as instability, never a change in the fetched
/// result contents.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSelector {
    /// API version of the requested resources.
    pub api_version: String,

    /// Kind of the requested resources.
    pub kind: String,

    /// Select one resource by exact name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_name: Option<String>,

    /// Select resources by labels.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_labels: Option<BTreeMap<String, String>>,

    /// Restrict the lookup to one namespace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

#[cfg(test)]
#[path = "crd_tests.rs"]
mod crd_tests;
