// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Integration tests against a live Kubernetes cluster.
//!
//! These tests require a running cluster with the Loomy CRDs installed
//! (see `cargo run --bin crdgen`) and the operator running.
//!
//! Run with: cargo test --test engine_integration -- --ignored

use kube::api::{DeleteParams, ListParams, PostParams};
use kube::{Api, Client, ResourceExt};
use loomy::crd::{
    Composition, CompositionMode, CompositionRevision, CompositionSpec, FunctionReference,
    PipelineStep, TypeReference,
};
use loomy::labels::REVISION_COMPOSITION_LABEL;
use std::time::Duration;

async fn client_or_skip() -> Option<Client> {
    match Client::try_default().await {
        Ok(client) => Some(client),
        Err(e) => {
            eprintln!("Skipping integration test, no cluster available: {e}");
            None
        }
    }
}

fn test_composition(name: &str) -> Composition {
    Composition {
        metadata: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: CompositionSpec {
            composite_type_ref: TypeReference {
                api_version: "integration.example.org/v1".to_string(),
                kind: "ItestApp".to_string(),
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
            revision_history_limit: Some(2),
        },
    }
}

#[tokio::test]
#[ignore] // Run with: cargo test --test engine_integration -- --ignored
async fn test_composition_revision_is_cut() {
    let Some(client) = client_or_skip().await else {
        return;
    };

    let compositions: Api<Composition> = Api::all(client.clone());
    let revisions: Api<CompositionRevision> = Api::all(client.clone());
    let name = "itest-revision-cut";

    // Clean slate.
    let _ = compositions.delete(name, &DeleteParams::default()).await;
    tokio::time::sleep(Duration::from_secs(1)).await;

    compositions
        .create(&PostParams::default(), &test_composition(name))
        .await
        .expect("create composition");

    // The revision controller should cut revision 1.
    let params = ListParams::default().labels(&format!("{REVISION_COMPOSITION_LABEL}={name}"));
    let mut cut = Vec::new();
    for _ in 0..30 {
        tokio::time::sleep(Duration::from_secs(1)).await;
        cut = revisions.list(&params).await.expect("list revisions").items;
        if !cut.is_empty() {
            break;
        }
    }

    assert_eq!(cut.len(), 1, "expected exactly one cut revision");
    assert_eq!(cut[0].spec.revision, 1);
    assert_eq!(cut[0].spec.composite_type_ref.kind, "ItestApp");

    let _ = compositions.delete(name, &DeleteParams::default()).await;
}

#[tokio::test]
#[ignore]
async fn test_editing_a_composition_rotates_the_revision() {
    let Some(client) = client_or_skip().await else {
        return;
    };

    let compositions: Api<Composition> = Api::all(client.clone());
    let revisions: Api<CompositionRevision> = Api::all(client.clone());
    let name = "itest-revision-rotate";

    let _ = compositions.delete(name, &DeleteParams::default()).await;
    tokio::time::sleep(Duration::from_secs(1)).await;

    let created = compositions
        .create(&PostParams::default(), &test_composition(name))
        .await
        .expect("create composition");

    // Change the pipeline; the content hash changes and revision 2 is cut.
    let mut edited = created.clone();
    edited.spec.pipeline.as_mut().unwrap()[0].step = "render-v2".to_string();
    compositions
        .replace(name, &PostParams::default(), &edited)
        .await
        .expect("update composition");

    let params = ListParams::default().labels(&format!("{REVISION_COMPOSITION_LABEL}={name}"));
    let mut highest = 0;
    for _ in 0..30 {
        tokio::time::sleep(Duration::from_secs(1)).await;
        let cut = revisions.list(&params).await.expect("list revisions").items;
        highest = cut.iter().map(|r| r.spec.revision).max().unwrap_or(0);
        if highest >= 2 {
            break;
        }
    }
    assert!(highest >= 2, "expected a rotated revision, got {highest}");

    let _ = compositions.delete(name, &DeleteParams::default()).await;
}

#[tokio::test]
#[ignore]
async fn test_revision_names_carry_the_hash_prefix() {
    let Some(client) = client_or_skip().await else {
        return;
    };

    let revisions: Api<CompositionRevision> = Api::all(client);
    let all = revisions
        .list(&ListParams::default())
        .await
        .expect("list revisions");

    for revision in all {
        let name = revision.name_any();
        let labels = revision.metadata.labels.clone().unwrap_or_default();
        let parent = labels
            .get(REVISION_COMPOSITION_LABEL)
            .expect("revision without composition label");
        assert!(
            name.starts_with(parent.as_str()),
            "revision {name} does not carry its composition name"
        );
    }
}
