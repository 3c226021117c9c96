// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Unit tests for `composed.rs`

use crate::composed::{
    associate, connection_secret_ref, generate_name, render, unlink_patch, Association,
    ObservedResource,
};
use crate::composite::Composite;
use crate::crd::{DeletionPolicy, ResourceRef};
use crate::labels::{DELETION_POLICY_ANNOTATION, TEMPLATE_NAME_ANNOTATION};
use crate::patches::{FieldPatch, Patch};
use crate::pipeline::{DesiredResource, DesiredState};
use kube::core::{DynamicObject, GroupVersionKind};
use serde_json::json;
use std::collections::BTreeMap;

fn test_xr() -> Composite {
    let gvk = GroupVersionKind::gvk("example.org", "v1", "App");
    let resource = crate::api::api_resource(&gvk);
    let mut object = DynamicObject::new("a", &resource);
    object.metadata.uid = Some("uid-a".to_string());
    object.data = json!({"spec": {"tier": "small"}});
    Composite::from_object(object).unwrap()
}

fn desired(name: &str) -> DesiredResource {
    DesiredResource {
        name: name.to_string(),
        resource: json!({"apiVersion": "db.example.org/v1", "kind": "DB", "spec": {}}),
        patches: vec![],
        readiness_checks: vec![],
        connection_details: vec![],
        deletion_policy: DeletionPolicy::Delete,
    }
}

fn observed(template: &str, name: &str) -> ObservedResource {
    let gvk = GroupVersionKind::gvk("db.example.org", "v1", "DB");
    let resource = crate::api::api_resource(&gvk);
    let mut object = DynamicObject::new(name, &resource);
    object.metadata.annotations = Some(BTreeMap::from([(
        TEMPLATE_NAME_ANNOTATION.to_string(),
        template.to_string(),
    )]));
    ObservedResource {
        resource_ref: ResourceRef {
            api_version: "db.example.org/v1".to_string(),
            kind: "DB".to_string(),
            name: name.to_string(),
            namespace: None,
        },
        object: Some(object),
    }
}

#[test]
fn test_generate_name_shape() {
    let name = generate_name("my-app");
    assert!(name.starts_with("my-app-"));
    assert_eq!(name.len(), "my-app-".len() + 5);
    assert!(name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-'));
    // Two allocations almost surely differ.
    assert_ne!(generate_name("my-app"), generate_name("my-app"));
}

#[test]
fn test_associate_binds_existing_by_template_name() {
    let xr = test_xr();
    let desired_state = DesiredState {
        resources: vec![desired("db")],
    };
    let existing = vec![observed("db", "a-db-xyz12")];

    let set = associate(&xr, &desired_state, &existing).unwrap();
    assert_eq!(set.bound.len(), 1);
    assert_eq!(set.bound[0].resource_ref.name, "a-db-xyz12");
    assert!(set.bound[0].observed.is_some());
    assert!(set.orphans.is_empty());
}

#[test]
fn test_associate_allocates_new_identity() {
    let xr = test_xr();
    let desired_state = DesiredState {
        resources: vec![desired("db")],
    };

    let set = associate(&xr, &desired_state, &[]).unwrap();
    assert_eq!(set.bound.len(), 1);
    let bound = &set.bound[0];
    assert!(bound.resource_ref.name.starts_with("a-"));
    assert_eq!(bound.resource_ref.kind, "DB");
    assert_eq!(bound.resource_ref.api_version, "db.example.org/v1");
    assert!(bound.observed.is_none());
}

#[test]
fn test_associate_marks_orphans() {
    let xr = test_xr();
    let desired_state = DesiredState {
        resources: vec![desired("db")],
    };
    let existing = vec![observed("db", "a-db-xyz12"), observed("cache", "a-cache-q1w2e")];

    let set = associate(&xr, &desired_state, &existing).unwrap();
    assert_eq!(set.bound.len(), 1);
    assert_eq!(set.orphans.len(), 1);
    assert_eq!(set.orphans[0].resource_ref.name, "a-cache-q1w2e");
    assert_eq!(set.orphans[0].policy, DeletionPolicy::Delete);
}

#[test]
fn test_associate_orphan_honors_retain_annotation() {
    let xr = test_xr();
    let mut retained = observed("cache", "a-cache-q1w2e");
    retained
        .object
        .as_mut()
        .unwrap()
        .metadata
        .annotations
        .as_mut()
        .unwrap()
        .insert(
            DELETION_POLICY_ANNOTATION.to_string(),
            "Retain".to_string(),
        );

    let set = associate(&xr, &DesiredState::default(), &[retained]).unwrap();
    assert_eq!(set.orphans.len(), 1);
    assert_eq!(set.orphans[0].policy, DeletionPolicy::Retain);
}

#[test]
fn test_associate_ref_order_follows_desired_order() {
    let xr = test_xr();
    let desired_state = DesiredState {
        resources: vec![desired("cache"), desired("db")],
    };
    let existing = vec![observed("db", "a-db-1"), observed("cache", "a-cache-1")];

    let set = associate(&xr, &desired_state, &existing).unwrap();
    let names: Vec<_> = set
        .resource_refs()
        .into_iter()
        .map(|r| r.name)
        .collect();
    assert_eq!(names, vec!["a-cache-1", "a-db-1"]);
}

#[test]
fn test_associate_rejects_identity_free_desired() {
    let xr = test_xr();
    let mut bad = desired("db");
    bad.resource = json!({"spec": {}});
    let desired_state = DesiredState {
        resources: vec![bad],
    };
    assert!(associate(&xr, &desired_state, &[]).is_err());
}

#[test]
fn test_render_applies_patches_and_stamps_identity() {
    let xr = test_xr();
    let mut want = desired("db");
    want.patches = vec![Patch::FromComposite(FieldPatch {
        from_field_path: "spec.tier".to_string(),
        to_field_path: Some("spec.size".to_string()),
        transforms: vec![],
        policy: None,
    })];
    let association = Association {
        template_name: "db".to_string(),
        resource_ref: ResourceRef {
            api_version: "db.example.org/v1".to_string(),
            kind: "DB".to_string(),
            name: "a-db-abc12".to_string(),
            namespace: None,
        },
        observed: None,
    };

    let rendered = render(&xr, &want, &association).unwrap();
    assert_eq!(rendered.metadata.name.as_deref(), Some("a-db-abc12"));
    assert_eq!(rendered.data["spec"]["size"], json!("small"));

    let annotations = rendered.metadata.annotations.unwrap();
    assert_eq!(annotations[TEMPLATE_NAME_ANNOTATION], "db");
    assert_eq!(annotations[DELETION_POLICY_ANNOTATION], "Delete");

    let owners = rendered.metadata.owner_references.unwrap();
    assert_eq!(owners.len(), 1);
    assert_eq!(owners[0].uid, "uid-a");
    assert_eq!(owners[0].kind, "App");
}

#[test]
fn test_render_patch_error_names_template_and_indices() {
    let xr = test_xr();
    let mut want = desired("db");
    want.patches = vec![Patch::FromComposite(FieldPatch {
        from_field_path: "spec.tier".to_string(),
        to_field_path: Some("spec.count".to_string()),
        transforms: vec![crate::transforms::Transform::Math(
            crate::transforms::MathTransform { multiply: 2 },
        )],
        policy: None,
    })];
    let association = Association {
        template_name: "db".to_string(),
        resource_ref: ResourceRef {
            api_version: "db.example.org/v1".to_string(),
            kind: "DB".to_string(),
            name: "a-db-abc12".to_string(),
            namespace: None,
        },
        observed: None,
    };

    // spec.tier is the string "small"; the math transform rejects it.
    let err = render(&xr, &want, &association).unwrap_err();
    let message = err.to_string();
    assert!(message.contains("template \"db\""));
    assert!(message.contains("patch 0"));
    assert!(message.contains("transform 0"));
}

#[test]
fn test_render_is_idempotent() {
    let xr = test_xr();
    let mut want = desired("db");
    want.patches = vec![Patch::FromComposite(FieldPatch {
        from_field_path: "spec.tier".to_string(),
        to_field_path: Some("spec.size".to_string()),
        transforms: vec![],
        policy: None,
    })];
    let association = Association {
        template_name: "db".to_string(),
        resource_ref: ResourceRef {
            api_version: "db.example.org/v1".to_string(),
            kind: "DB".to_string(),
            name: "a-db-abc12".to_string(),
            namespace: None,
        },
        observed: None,
    };

    let first = render(&xr, &want, &association).unwrap();
    let second = render(&xr, &want, &association).unwrap();
    assert_eq!(first.data, second.data);
}

#[test]
fn test_connection_secret_ref_of_composed() {
    let gvk = GroupVersionKind::gvk("db.example.org", "v1", "DB");
    let resource = crate::api::api_resource(&gvk);
    let mut object = DynamicObject::new("a-db-1", &resource).within("team-a");
    object.data = json!({"spec": {"writeConnectionSecretToRef": {"name": "db-creds"}}});

    let secret_ref = connection_secret_ref(&object).unwrap();
    assert_eq!(secret_ref.name, "db-creds");
    assert_eq!(secret_ref.namespace, "team-a");

    let bare = DynamicObject::new("a-db-2", &resource);
    assert!(connection_secret_ref(&bare).is_none());
}

#[test]
fn test_unlink_patch_removes_only_our_owner_ref() {
    let gvk = GroupVersionKind::gvk("db.example.org", "v1", "DB");
    let resource = crate::api::api_resource(&gvk);
    let mut object = DynamicObject::new("a-db-1", &resource);
    object.metadata.owner_references = Some(vec![
        k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference {
            api_version: "example.org/v1".to_string(),
            kind: "App".to_string(),
            name: "a".to_string(),
            uid: "uid-a".to_string(),
            ..Default::default()
        },
        k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference {
            api_version: "other.org/v1".to_string(),
            kind: "Other".to_string(),
            name: "x".to_string(),
            uid: "uid-x".to_string(),
            ..Default::default()
        },
    ]);

    let patch = unlink_patch(&object, "uid-a");
    let remaining = patch["metadata"]["ownerReferences"].as_array().unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0]["uid"], json!("uid-x"));
}
