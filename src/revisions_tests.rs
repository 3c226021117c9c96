// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Unit tests for `revisions.rs`

use crate::crd::{
    Composition, CompositionMode, CompositionSpec, FunctionReference, PipelineStep, TypeReference,
};
use crate::labels::{REVISION_COMPOSITION_LABEL, REVISION_HASH_LABEL};
use crate::revisions::{
    content_hash, find_revision_by_hash, latest_revision, latest_revision_number, new_revision,
    revision_name, revisions_to_gc,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::BTreeMap;

fn composition(name: &str) -> Composition {
    Composition {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            uid: Some("uid-comp".to_string()),
            ..ObjectMeta::default()
        },
        spec: CompositionSpec {
            composite_type_ref: TypeReference {
                api_version: "example.org/v1".to_string(),
                kind: "App".to_string(),
            },
            mode: CompositionMode::Pipeline,
            pipeline: Some(vec![PipelineStep {
                step: "render".to_string(),
                function_ref: FunctionReference {
                    name: "template".to_string(),
                },
                input: None,
                credentials: None,
            }]),
            resources: None,
            patch_sets: None,
            write_connection_secrets_to_namespace: None,
            revision_history_limit: None,
        },
    }
}

#[test]
fn test_content_hash_is_stable() {
    let a = composition("app");
    assert_eq!(content_hash(&a), content_hash(&a.clone()));
}

#[test]
fn test_content_hash_tracks_spec_labels_and_annotations() {
    let base = composition("app");
    let base_hash = content_hash(&base);

    let mut spec_changed = composition("app");
    spec_changed.spec.pipeline.as_mut().unwrap()[0].step = "other".to_string();
    assert_ne!(content_hash(&spec_changed), base_hash);

    let mut label_changed = composition("app");
    label_changed.metadata.labels = Some(BTreeMap::from([(
        "tier".to_string(),
        "prod".to_string(),
    )]));
    assert_ne!(content_hash(&label_changed), base_hash);

    // Name changes do not affect the content hash.
    let renamed = composition("renamed");
    assert_eq!(content_hash(&renamed), base_hash);
}

#[test]
fn test_revision_name_uses_hash_prefix() {
    let name = revision_name("app", "abcdef0123456789");
    assert_eq!(name, "app-abcdef0");
}

#[test]
fn test_new_revision_snapshot() {
    let comp = composition("app");
    let hash = content_hash(&comp);
    let revision = new_revision(&comp, 3, &hash);

    assert_eq!(revision.spec.revision, 3);
    assert_eq!(revision.spec.composite_type_ref.kind, "App");
    assert_eq!(
        revision.spec.pipeline.as_ref().unwrap()[0].step,
        "render"
    );

    let labels = revision.metadata.labels.as_ref().unwrap();
    assert_eq!(labels[REVISION_COMPOSITION_LABEL], "app");
    assert_eq!(labels[REVISION_HASH_LABEL], hash);

    let owners = revision.metadata.owner_references.as_ref().unwrap();
    assert_eq!(owners[0].kind, "Composition");
    assert_eq!(owners[0].uid, "uid-comp");
}

#[test]
fn test_revision_lookup_helpers() {
    let comp = composition("app");
    let r1 = new_revision(&comp, 1, "hash-one-0000000");
    let r2 = new_revision(&comp, 2, "hash-two-0000000");
    let revisions = vec![r1, r2];

    assert_eq!(latest_revision_number(&revisions), 2);
    assert_eq!(latest_revision(&revisions).unwrap().spec.revision, 2);
    assert!(find_revision_by_hash(&revisions, "hash-one-0000000").is_some());
    assert!(find_revision_by_hash(&revisions, "absent").is_none());

    assert_eq!(latest_revision_number(&[]), 0);
    assert!(latest_revision(&[]).is_none());
}

#[test]
fn test_gc_keeps_top_n() {
    let comp = composition("app");
    let revisions: Vec<_> = (1..=5)
        .map(|n| new_revision(&comp, n, &format!("hash-{n}-0000000")))
        .collect();

    let doomed = revisions_to_gc(&revisions, 2);
    let mut numbers: Vec<_> = doomed.iter().map(|r| r.spec.revision).collect();
    numbers.sort_unstable();
    assert_eq!(numbers, vec![1, 2, 3]);
}

#[test]
fn test_gc_zero_disables() {
    let comp = composition("app");
    let revisions: Vec<_> = (1..=5)
        .map(|n| new_revision(&comp, n, &format!("hash-{n}-0000000")))
        .collect();
    assert!(revisions_to_gc(&revisions, 0).is_empty());
}

#[test]
fn test_gc_noop_when_under_limit() {
    let comp = composition("app");
    let revisions = vec![new_revision(&comp, 1, "hash-1-0000000")];
    assert!(revisions_to_gc(&revisions, 1).is_empty());
}
