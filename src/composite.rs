// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Typed access to dynamic composite resources.
//!
//! Composite resources (XRs) are instances of user-defined types, so the
//! engine handles them as [`DynamicObject`]s. This module wraps one in a
//! [`Composite`] that exposes the well-known fields of the composite shape:
//! composition references, composed-resource references, the connection
//! secret target, and status conditions.
//!
//! The wrapper keeps the full document available as JSON for the patch
//! engine, which addresses arbitrary field paths across `spec`, `status`,
//! and `metadata`.

use crate::api::{parse_gvk, ResourceKey};
use crate::crd::{ClaimRef, Condition, LabelSelector, ResourceRef, SecretReference};
use crate::errors::{EngineError, Result};
use crate::reconcilers::status::condition_changed;
use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::core::{DynamicObject, GroupVersionKind};
use serde_json::{json, Value};

/// How a composite follows Composition revisions.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum UpdatePolicy {
    /// Track the latest revision; rotation re-reconciles the composite.
    #[default]
    Automatic,
    /// Stay pinned to the referenced revision.
    Manual,
}

/// A composite resource, wrapped for typed access.
#[derive(Clone, Debug)]
pub struct Composite {
    gvk: GroupVersionKind,
    object: DynamicObject,
}

impl Composite {
    /// Wrap a dynamic object, deriving its group/version/kind.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Internal`] when the object carries no type
    /// metadata; the engine only ever loads composites through watches
    /// that set it.
    pub fn from_object(object: DynamicObject) -> Result<Self> {
        let types = object
            .types
            .as_ref()
            .ok_or_else(|| EngineError::Internal("composite without type metadata".to_string()))?;
        let gvk = parse_gvk(&types.api_version, &types.kind)?;
        Ok(Self { gvk, object })
    }

    /// The composite's group/version/kind.
    #[must_use]
    pub fn gvk(&self) -> &GroupVersionKind {
        &self.gvk
    }

    /// The wrapped dynamic object.
    #[must_use]
    pub fn object(&self) -> &DynamicObject {
        &self.object
    }

    /// The composite's name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.object.metadata.name.as_deref().unwrap_or_default()
    }

    /// The composite's namespace; empty for cluster-scoped composites.
    #[must_use]
    pub fn namespace(&self) -> Option<&str> {
        self.object.metadata.namespace.as_deref()
    }

    /// The composite's identity key.
    #[must_use]
    pub fn key(&self) -> ResourceKey {
        ResourceKey::new(self.name(), self.namespace())
    }

    /// The composite's server-assigned resource version.
    #[must_use]
    pub fn resource_version(&self) -> Option<&str> {
        self.object.metadata.resource_version.as_deref()
    }

    /// The composite's metadata generation.
    #[must_use]
    pub fn generation(&self) -> Option<i64> {
        self.object.metadata.generation
    }

    /// Whether the composite is marked for deletion.
    #[must_use]
    pub fn is_deleting(&self) -> bool {
        self.object.metadata.deletion_timestamp.is_some()
    }

    /// Whether the given finalizer is present.
    #[must_use]
    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.object
            .metadata
            .finalizers
            .as_ref()
            .is_some_and(|f| f.iter().any(|x| x == finalizer))
    }

    /// An owner reference pointing at this composite, used on composed
    /// resources and the connection secret.
    #[must_use]
    pub fn owner_reference(&self) -> OwnerReference {
        OwnerReference {
            api_version: self
                .object
                .types
                .as_ref()
                .map(|t| t.api_version.clone())
                .unwrap_or_default(),
            kind: self.gvk.kind.clone(),
            name: self.name().to_string(),
            uid: self.object.metadata.uid.clone().unwrap_or_default(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }
    }

    /// The full composite document as JSON, for patch evaluation.
    #[must_use]
    pub fn to_value(&self) -> Value {
        serde_json::to_value(&self.object).unwrap_or(Value::Null)
    }

    /// Replace the composite document from patched JSON.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Internal`] when the patched document no
    /// longer deserializes as an object.
    pub fn update_from_value(&mut self, value: Value) -> Result<()> {
        self.object = serde_json::from_value(value)
            .map_err(|e| EngineError::Internal(format!("patched composite is malformed: {e}")))?;
        Ok(())
    }

    fn spec_field(&self, field: &str) -> Option<&Value> {
        self.object.data.get("spec").and_then(|s| s.get(field))
    }

    fn set_spec_field(&mut self, field: &str, value: Value) {
        if !self.object.data.is_object() {
            self.object.data = json!({});
        }
        let map = self.object.data.as_object_mut().expect("set above");
        let spec = map
            .entry("spec".to_string())
            .or_insert_with(|| json!({}));
        if let Some(spec) = spec.as_object_mut() {
            spec.insert(field.to_string(), value);
        }
    }

    fn status_mut(&mut self) -> &mut serde_json::Map<String, Value> {
        if !self.object.data.is_object() {
            self.object.data = json!({});
        }
        let map = self.object.data.as_object_mut().expect("set above");
        let status = map
            .entry("status".to_string())
            .or_insert_with(|| json!({}));
        if !status.is_object() {
            *status = json!({});
        }
        status.as_object_mut().expect("set above")
    }

    // ------------------------------------------------------------------
    // Composition selection
    // ------------------------------------------------------------------

    /// The referenced Composition name, if any.
    #[must_use]
    pub fn composition_ref(&self) -> Option<String> {
        self.spec_field("compositionRef")?
            .get("name")?
            .as_str()
            .map(ToString::to_string)
    }

    /// Record the selected Composition on the composite's spec.
    pub fn set_composition_ref(&mut self, name: &str) {
        self.set_spec_field("compositionRef", json!({ "name": name }));
    }

    /// The composition label selector, if any.
    #[must_use]
    pub fn composition_selector(&self) -> Option<LabelSelector> {
        serde_json::from_value(self.spec_field("compositionSelector")?.clone()).ok()
    }

    /// The pinned CompositionRevision name, if any.
    #[must_use]
    pub fn composition_revision_ref(&self) -> Option<String> {
        self.spec_field("compositionRevisionRef")?
            .get("name")?
            .as_str()
            .map(ToString::to_string)
    }

    /// Record the bound CompositionRevision on the composite's spec.
    pub fn set_composition_revision_ref(&mut self, name: &str) {
        self.set_spec_field("compositionRevisionRef", json!({ "name": name }));
    }

    /// How this composite follows revision rotation.
    #[must_use]
    pub fn composition_update_policy(&self) -> UpdatePolicy {
        match self
            .spec_field("compositionUpdatePolicy")
            .and_then(Value::as_str)
        {
            Some("Manual") => UpdatePolicy::Manual,
            _ => UpdatePolicy::Automatic,
        }
    }

    /// The owning claim, when this composite was created by one.
    #[must_use]
    pub fn claim_ref(&self) -> Option<ClaimRef> {
        serde_json::from_value(self.spec_field("claimRef")?.clone()).ok()
    }

    // ------------------------------------------------------------------
    // Composed-resource references
    // ------------------------------------------------------------------

    /// The composed-resource references, in insertion order.
    #[must_use]
    pub fn resource_refs(&self) -> Vec<ResourceRef> {
        self.spec_field("resourceRefs")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default()
    }

    /// Replace the composed-resource references.
    pub fn set_resource_refs(&mut self, refs: &[ResourceRef]) {
        self.set_spec_field(
            "resourceRefs",
            serde_json::to_value(refs).unwrap_or_else(|_| json!([])),
        );
    }

    // ------------------------------------------------------------------
    // Connection secret
    // ------------------------------------------------------------------

    /// The target secret for aggregated connection details, if configured.
    #[must_use]
    pub fn write_connection_secret_to_ref(&self) -> Option<SecretReference> {
        let secret_ref = self.spec_field("writeConnectionSecretToRef")?;
        let name = secret_ref.get("name")?.as_str()?.to_string();
        // A namespaced composite defaults its secret into its own
        // namespace; the configurator may have stamped another one.
        let namespace = secret_ref
            .get("namespace")
            .and_then(Value::as_str)
            .or(self.namespace())?
            .to_string();
        Some(SecretReference { name, namespace })
    }

    /// Default the connection-secret namespace, if a target is declared
    /// without one. Returns true when the spec changed.
    pub fn default_connection_secret_namespace(&mut self, namespace: &str) -> bool {
        let Some(secret_ref) = self.spec_field("writeConnectionSecretToRef") else {
            return false;
        };
        if secret_ref.get("namespace").and_then(Value::as_str).is_some() {
            return false;
        }
        let mut updated = secret_ref.clone();
        if let Some(map) = updated.as_object_mut() {
            map.insert("namespace".to_string(), json!(namespace));
        }
        self.set_spec_field("writeConnectionSecretToRef", updated);
        true
    }

    /// Stamp the time connection details were last published.
    pub fn set_connection_details_published_time(&mut self) {
        let status = self.status_mut();
        let details = status
            .entry("connectionDetails".to_string())
            .or_insert_with(|| json!({}));
        if let Some(map) = details.as_object_mut() {
            map.insert(
                "lastPublishedTime".to_string(),
                json!(Utc::now().to_rfc3339()),
            );
        }
    }

    // ------------------------------------------------------------------
    // Status conditions
    // ------------------------------------------------------------------

    /// The composite's current status conditions.
    #[must_use]
    pub fn conditions(&self) -> Vec<Condition> {
        self.object
            .data
            .get("status")
            .and_then(|s| s.get("conditions"))
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default()
    }

    /// Set a condition, replacing any existing condition of the same type.
    ///
    /// The last transition time is preserved when the condition is
    /// unchanged, so status rewrites do not churn watch streams.
    pub fn set_condition(&mut self, condition: Condition) {
        let mut conditions = self.conditions();
        let existing = conditions
            .iter()
            .position(|c| c.r#type == condition.r#type);

        let mut condition = condition;
        if let Some(idx) = existing {
            if condition_changed(&Some(conditions[idx].clone()), &condition) {
                conditions[idx] = condition;
            } else {
                condition.last_transition_time = conditions[idx].last_transition_time.clone();
                conditions[idx] = condition;
            }
        } else {
            conditions.push(condition);
        }

        let status = self.status_mut();
        status.insert(
            "conditions".to_string(),
            serde_json::to_value(conditions).unwrap_or_else(|_| json!([])),
        );
    }

    /// Record the generation this reconcile observed.
    pub fn set_observed_generation(&mut self, generation: Option<i64>) {
        if let Some(generation) = generation {
            self.status_mut()
                .insert("observedGeneration".to_string(), json!(generation));
        }
    }

    /// Carry another wrapper's in-memory status onto this one.
    ///
    /// Used after a spec persist: the server's response carries the stored
    /// status, not the conditions this reconcile has accumulated.
    pub fn update_status_from(&mut self, other: &Composite) {
        let status = other.status_value();
        if !self.object.data.is_object() {
            self.object.data = json!({});
        }
        if let Some(map) = self.object.data.as_object_mut() {
            map.insert("status".to_string(), status);
        }
    }

    /// The status document sent by `patch_status`.
    #[must_use]
    pub fn status_value(&self) -> Value {
        self.object
            .data
            .get("status")
            .cloned()
            .unwrap_or_else(|| json!({}))
    }
}

#[cfg(test)]
#[path = "composite_tests.rs"]
mod composite_tests;
