// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Composition revision snapshots.
//!
//! A Composition is mutable; the engine never executes it directly.
//! Instead the revision controller cuts an immutable [`CompositionRevision`]
//! whenever the Composition's content hash changes, and composites bind to
//! a specific revision. Old revisions are garbage-collected keeping the
//! configured history limit (0 disables GC).

use crate::constants::REVISION_NAME_HASH_LEN;
use crate::crd::{Composition, CompositionRevision, CompositionRevisionSpec};
use crate::labels::{REVISION_COMPOSITION_LABEL, REVISION_HASH_LABEL};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::{Resource, ResourceExt};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// A stable digest over a Composition's labels, annotations, and spec.
///
/// The hash decides whether a new revision must be cut: any change to the
/// hashed content rotates the revision and re-reconciles bound composites.
#[must_use]
pub fn content_hash(composition: &Composition) -> String {
    let content = json!({
        "labels": composition.metadata.labels,
        "annotations": composition.metadata.annotations,
        "spec": composition.spec,
    });

    let mut hasher = Sha256::new();
    hasher.update(serde_json::to_vec(&content).unwrap_or_default());
    format!("{:x}", hasher.finalize())
}

/// The name of the revision cut for `composition` at `hash`.
#[must_use]
pub fn revision_name(composition_name: &str, hash: &str) -> String {
    let prefix = &hash[..REVISION_NAME_HASH_LEN.min(hash.len())];
    format!("{composition_name}-{prefix}")
}

/// The highest revision number among the existing revisions, or 0.
#[must_use]
pub fn latest_revision_number(revisions: &[CompositionRevision]) -> i64 {
    revisions.iter().map(|r| r.spec.revision).max().unwrap_or(0)
}

/// The existing revision matching `hash`, if one was already cut.
#[must_use]
pub fn find_revision_by_hash<'a>(
    revisions: &'a [CompositionRevision],
    hash: &str,
) -> Option<&'a CompositionRevision> {
    revisions
        .iter()
        .find(|r| r.labels().get(REVISION_HASH_LABEL).map(String::as_str) == Some(hash))
}

/// The latest (highest-numbered) revision, if any exist.
#[must_use]
pub fn latest_revision(revisions: &[CompositionRevision]) -> Option<&CompositionRevision> {
    revisions.iter().max_by_key(|r| r.spec.revision)
}

/// Snapshot a Composition into a new revision with the given number.
#[must_use]
pub fn new_revision(composition: &Composition, revision: i64, hash: &str) -> CompositionRevision {
    let name = composition.name_any();

    let mut labels: BTreeMap<String, String> =
        composition.metadata.labels.clone().unwrap_or_default();
    labels.insert(REVISION_COMPOSITION_LABEL.to_string(), name.clone());
    labels.insert(REVISION_HASH_LABEL.to_string(), hash.to_string());

    let owner = OwnerReference {
        api_version: Composition::api_version(&()).to_string(),
        kind: Composition::kind(&()).to_string(),
        name: name.clone(),
        uid: composition.metadata.uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    };

    CompositionRevision {
        metadata: ObjectMeta {
            name: Some(revision_name(&name, hash)),
            labels: Some(labels),
            annotations: composition.metadata.annotations.clone(),
            owner_references: Some(vec![owner]),
            ..ObjectMeta::default()
        },
        spec: CompositionRevisionSpec {
            revision,
            composite_type_ref: composition.spec.composite_type_ref.clone(),
            mode: composition.spec.mode,
            pipeline: composition.spec.pipeline.clone(),
            resources: composition.spec.resources.clone(),
            patch_sets: composition.spec.patch_sets.clone(),
            write_connection_secrets_to_namespace: composition
                .spec
                .write_connection_secrets_to_namespace
                .clone(),
        },
    }
}

/// Pick the revisions to garbage-collect: everything below the top
/// `history_limit` by revision number. A limit of 0 disables GC.
#[must_use]
pub fn revisions_to_gc(
    revisions: &[CompositionRevision],
    history_limit: u32,
) -> Vec<&CompositionRevision> {
    if history_limit == 0 || revisions.len() <= history_limit as usize {
        return Vec::new();
    }

    let mut sorted: Vec<&CompositionRevision> = revisions.iter().collect();
    // Highest revision numbers first; the tail gets collected.
    sorted.sort_by_key(|r| std::cmp::Reverse(r.spec.revision));
    sorted.split_off(history_limit as usize)
}

#[cfg(test)]
#[path = "revisions_tests.rs"]
mod revisions_tests;
