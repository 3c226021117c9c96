// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Composed-resource lifecycle: association, rendering, and orphans.
//!
//! The pipeline produces desired composed resources keyed by stable
//! template name; this module maps them to concrete API objects owned by
//! the composite.
//!
//! # Association
//!
//! Every composed resource the engine applies carries its template name in
//! an annotation. Association walks the composite's resource references,
//! reads that annotation off each referenced object, and binds desired
//! templates to existing objects by name. A desired template with no
//! existing binding gets a freshly generated API name; a referenced object
//! whose template has disappeared from the pipeline output becomes an
//! orphan.
//!
//! # Rendering
//!
//! A render starts from the pipeline's base document, applies the
//! composite-to-composed patches, and stamps identity metadata: the
//! generated name, the template-name annotation, the deletion-policy
//! annotation, managed-by labels, and an owner reference to the composite.

use crate::api::{parse_gvk, ResourceKey};
use crate::composite::Composite;
use crate::constants::{COMPOSED_NAME_MAX_LEN, COMPOSED_NAME_SUFFIX_LEN};
use crate::crd::{DeletionPolicy, ResourceRef, SecretReference};
use crate::errors::{EngineError, Result};
use crate::labels::{
    COMPOSITE_LABEL, DELETION_POLICY_ANNOTATION, DELETION_POLICY_RETAIN, K8S_MANAGED_BY,
    MANAGED_BY_LOOMY, TEMPLATE_NAME_ANNOTATION,
};
use crate::patches::apply_all_to_composed;
use crate::pipeline::{DesiredResource, DesiredState};
use kube::core::DynamicObject;
use rand::RngExt;
use serde_json::{json, Value};

/// One resource reference of the composite, resolved against the API.
#[derive(Clone, Debug)]
pub struct ObservedResource {
    /// The reference as recorded on the composite.
    pub resource_ref: ResourceRef,

    /// The referenced object, when it still exists.
    pub object: Option<DynamicObject>,
}

impl ObservedResource {
    /// The template name recorded on the referenced object, if any.
    #[must_use]
    pub fn template_name(&self) -> Option<String> {
        self.object
            .as_ref()
            .and_then(|o| o.metadata.annotations.as_ref())
            .and_then(|a| a.get(TEMPLATE_NAME_ANNOTATION))
            .cloned()
    }

    /// The deletion policy stamped on the referenced object; `Delete`
    /// unless the object carries a `Retain` annotation.
    #[must_use]
    pub fn deletion_policy(&self) -> DeletionPolicy {
        let retain = self
            .object
            .as_ref()
            .and_then(|o| o.metadata.annotations.as_ref())
            .and_then(|a| a.get(DELETION_POLICY_ANNOTATION))
            .is_some_and(|p| p == DELETION_POLICY_RETAIN);
        if retain {
            DeletionPolicy::Retain
        } else {
            DeletionPolicy::Delete
        }
    }
}

/// A desired template bound to a concrete API identity.
#[derive(Clone, Debug)]
pub struct Association {
    /// The stable template name.
    pub template_name: String,

    /// The bound API identity.
    pub resource_ref: ResourceRef,

    /// The currently observed object, when one exists.
    pub observed: Option<DynamicObject>,
}

/// A previously-referenced composed resource absent from the pipeline
/// output.
#[derive(Clone, Debug)]
pub struct Orphan {
    /// The stale reference.
    pub resource_ref: ResourceRef,

    /// How to handle it: delete, or retain and unlink.
    pub policy: DeletionPolicy,
}

/// The outcome of template association.
#[derive(Clone, Debug, Default)]
pub struct AssociationSet {
    /// Desired templates bound to identities, in desired order.
    pub bound: Vec<Association>,

    /// References whose templates are gone from the pipeline output.
    pub orphans: Vec<Orphan>,
}

impl AssociationSet {
    /// The composite's new resource-reference list.
    #[must_use]
    pub fn resource_refs(&self) -> Vec<ResourceRef> {
        self.bound.iter().map(|a| a.resource_ref.clone()).collect()
    }
}

/// Bind desired templates to existing composed resources by template name.
///
/// Observed objects are matched by their template-name annotation. Desired
/// templates with no match are allocated a generated name; observed
/// references with no desired counterpart become orphans.
///
/// # Errors
///
/// Returns [`EngineError::FunctionContract`] when a desired document lacks
/// `apiVersion` or `kind`, since the engine cannot derive an identity for
/// it.
pub fn associate(
    xr: &Composite,
    desired: &DesiredState,
    observed: &[ObservedResource],
) -> Result<AssociationSet> {
    let mut set = AssociationSet::default();
    let mut claimed: Vec<usize> = Vec::new();

    for want in &desired.resources {
        let existing = observed.iter().enumerate().find(|(i, o)| {
            !claimed.contains(i) && o.template_name().as_deref() == Some(want.name.as_str())
        });

        let association = match existing {
            Some((i, o)) => {
                claimed.push(i);
                Association {
                    template_name: want.name.clone(),
                    resource_ref: o.resource_ref.clone(),
                    observed: o.object.clone(),
                }
            }
            None => Association {
                template_name: want.name.clone(),
                resource_ref: new_resource_ref(xr, want)?,
                observed: None,
            },
        };
        set.bound.push(association);
    }

    for (i, o) in observed.iter().enumerate() {
        if !claimed.contains(&i) {
            set.orphans.push(Orphan {
                resource_ref: o.resource_ref.clone(),
                policy: o.deletion_policy(),
            });
        }
    }

    Ok(set)
}

/// Allocate a fresh API identity for a desired template.
fn new_resource_ref(xr: &Composite, want: &DesiredResource) -> Result<ResourceRef> {
    let api_version = want
        .resource
        .get("apiVersion")
        .and_then(Value::as_str)
        .ok_or_else(|| malformed_desired(&want.name, "apiVersion"))?;
    let kind = want
        .resource
        .get("kind")
        .and_then(Value::as_str)
        .ok_or_else(|| malformed_desired(&want.name, "kind"))?;

    // The desired document may pin a namespace; otherwise composed
    // resources land next to their composite.
    let namespace = want
        .resource
        .pointer("/metadata/namespace")
        .and_then(Value::as_str)
        .or(xr.namespace())
        .map(ToString::to_string);

    Ok(ResourceRef {
        api_version: api_version.to_string(),
        kind: kind.to_string(),
        name: generate_name(xr.name()),
        namespace,
    })
}

fn malformed_desired(template: &str, field: &str) -> EngineError {
    EngineError::FunctionContract {
        step: String::new(),
        reason: format!("desired resource {template:?} has no {field}"),
    }
}

/// Generate a stable API name: the composite's name plus a random
/// lowercase-alphanumeric suffix, truncated to the DNS subdomain limit.
#[must_use]
pub fn generate_name(base: &str) -> String {
    const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::rng();
    let suffix: String = (0..COMPOSED_NAME_SUFFIX_LEN)
        .map(|_| CHARSET[rng.random_range(0..CHARSET.len())] as char)
        .collect();

    let max_base = COMPOSED_NAME_MAX_LEN - COMPOSED_NAME_SUFFIX_LEN - 1;
    let base = base.get(..max_base).unwrap_or(base);
    format!("{base}-{suffix}")
}

/// Render the document to apply for one bound template.
///
/// Starts from the pipeline's base document, runs the composite-to-composed
/// patches, then stamps identity metadata. Patch failures carry the
/// template name and patch/transform indices.
///
/// # Errors
///
/// Returns [`EngineError::Validation`] for patch failures and
/// [`EngineError::Internal`] when the rendered document is not an object.
pub fn render(
    xr: &Composite,
    want: &DesiredResource,
    association: &Association,
) -> Result<DynamicObject> {
    let composite_doc = xr.to_value();
    let mut doc = want.resource.clone();

    apply_all_to_composed(&want.patches, &composite_doc, &mut doc).map_err(|e| {
        EngineError::Validation {
            subject: format!("template {:?}", want.name),
            reason: e.to_string(),
        }
    })?;

    stamp_identity(&mut doc, xr, want, association);

    serde_json::from_value(doc)
        .map_err(|e| EngineError::Internal(format!("rendered composed resource: {e}")))
}

/// Stamp the engine-owned identity fields onto a rendered document.
fn stamp_identity(doc: &mut Value, xr: &Composite, want: &DesiredResource, association: &Association) {
    if !doc.is_object() {
        return;
    }
    let map = doc.as_object_mut().expect("checked above");
    map.insert(
        "apiVersion".to_string(),
        json!(association.resource_ref.api_version),
    );
    map.insert("kind".to_string(), json!(association.resource_ref.kind));

    let metadata = map
        .entry("metadata".to_string())
        .or_insert_with(|| json!({}));
    if let Some(metadata) = metadata.as_object_mut() {
        metadata.insert("name".to_string(), json!(association.resource_ref.name));
        if let Some(ns) = &association.resource_ref.namespace {
            metadata.insert("namespace".to_string(), json!(ns));
        }

        let annotations = metadata
            .entry("annotations".to_string())
            .or_insert_with(|| json!({}));
        if let Some(annotations) = annotations.as_object_mut() {
            annotations.insert(
                TEMPLATE_NAME_ANNOTATION.to_string(),
                json!(association.template_name),
            );
            annotations.insert(
                DELETION_POLICY_ANNOTATION.to_string(),
                json!(format!("{:?}", want.deletion_policy)),
            );
        }

        let labels = metadata
            .entry("labels".to_string())
            .or_insert_with(|| json!({}));
        if let Some(labels) = labels.as_object_mut() {
            labels.insert(K8S_MANAGED_BY.to_string(), json!(MANAGED_BY_LOOMY));
            labels.insert(COMPOSITE_LABEL.to_string(), json!(xr.name()));
        }

        metadata.insert(
            "ownerReferences".to_string(),
            json!([xr.owner_reference()]),
        );
    }
}

/// The connection-secret reference a composed resource declares, if any.
#[must_use]
pub fn connection_secret_ref(object: &DynamicObject) -> Option<SecretReference> {
    let secret_ref = object
        .data
        .get("spec")
        .and_then(|s| s.get("writeConnectionSecretToRef"))?;
    let name = secret_ref.get("name")?.as_str()?.to_string();
    let namespace = secret_ref
        .get("namespace")
        .and_then(Value::as_str)
        .or(object.metadata.namespace.as_deref())?
        .to_string();
    Some(SecretReference { name, namespace })
}

/// The identity key of a resource reference.
#[must_use]
pub fn ref_key(resource_ref: &ResourceRef) -> ResourceKey {
    ResourceKey::new(resource_ref.name.as_str(), resource_ref.namespace.as_deref())
}

/// The group/version/kind of a resource reference.
///
/// # Errors
///
/// Returns [`EngineError::Validation`] when the recorded `apiVersion` is
/// malformed.
pub fn ref_gvk(resource_ref: &ResourceRef) -> Result<kube::core::GroupVersionKind> {
    parse_gvk(&resource_ref.api_version, &resource_ref.kind)
}

/// Strip the composite's owner reference from an orphaned object's
/// metadata, producing the merge patch that unlinks it.
#[must_use]
pub fn unlink_patch(object: &DynamicObject, owner_uid: &str) -> Value {
    let remaining: Vec<Value> = object
        .metadata
        .owner_references
        .as_deref()
        .unwrap_or_default()
        .iter()
        .filter(|o| o.uid != owner_uid)
        .filter_map(|o| serde_json::to_value(o).ok())
        .collect();
    json!({ "metadata": { "ownerReferences": remaining } })
}

#[cfg(test)]
#[path = "composed_tests.rs"]
mod composed_tests;
