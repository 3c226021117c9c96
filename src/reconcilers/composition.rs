// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Composition revision cutting and garbage collection.
//!
//! Whenever a Composition's content hash changes, this reconciler cuts a
//! new immutable [`CompositionRevision`] with the next revision number.
//! Composites bind to revisions, never to the live Composition, so an edit
//! rotates the revision and re-reconciles every bound composite.
//!
//! Old revisions are garbage-collected, keeping the configured history
//! limit per Composition (0 disables GC).

use crate::constants::DEFAULT_REVISION_HISTORY_LIMIT;
use crate::crd::{Composition, CompositionRevision};
use crate::labels::REVISION_COMPOSITION_LABEL;
use crate::revisions::{
    content_hash, find_revision_by_hash, latest_revision_number, new_revision, revisions_to_gc,
};
use anyhow::Result;
use kube::api::{DeleteParams, ListParams, PostParams};
use kube::{Api, Client, ResourceExt};
use tracing::{debug, info, warn};

/// Reconcile one Composition: ensure a revision exists for its current
/// content, then garbage-collect stale revisions.
///
/// # Errors
///
/// Returns an error when listing, creating, or deleting revisions fails;
/// the controller requeues with backoff.
pub async fn reconcile_composition(client: Client, composition: Composition) -> Result<()> {
    let name = composition.name_any();
    debug!(composition = %name, "Reconciling composition");

    let api: Api<CompositionRevision> = Api::all(client.clone());
    let params =
        ListParams::default().labels(&format!("{REVISION_COMPOSITION_LABEL}={name}"));
    let revisions = api.list(&params).await?.items;

    let hash = content_hash(&composition);

    if find_revision_by_hash(&revisions, &hash).is_none() {
        let number = latest_revision_number(&revisions) + 1;
        let revision = new_revision(&composition, number, &hash);
        let revision_name = revision.name_any();

        info!(
            composition = %name,
            revision = number,
            name = %revision_name,
            "Cutting new composition revision"
        );

        match api.create(&PostParams::default(), &revision).await {
            Ok(_) => {}
            // A concurrent worker already cut this revision.
            Err(kube::Error::Api(e)) if e.code == 409 => {
                debug!(revision = %revision_name, "Revision already exists");
            }
            Err(e) => return Err(e.into()),
        }
    }

    garbage_collect(&api, &composition, &revisions, &hash).await?;

    Ok(())
}

/// Delete revisions below the history limit, never the current one.
async fn garbage_collect(
    api: &Api<CompositionRevision>,
    composition: &Composition,
    revisions: &[CompositionRevision],
    current_hash: &str,
) -> Result<()> {
    let limit = composition
        .spec
        .revision_history_limit
        .unwrap_or(DEFAULT_REVISION_HISTORY_LIMIT);
    if limit == 0 {
        return Ok(());
    }

    for doomed in revisions_to_gc(revisions, limit) {
        let doomed_name = doomed.name_any();
        if doomed
            .labels()
            .get(crate::labels::REVISION_HASH_LABEL)
            .map(String::as_str)
            == Some(current_hash)
        {
            // The current content's revision is always kept, whatever its
            // number.
            continue;
        }
        info!(
            composition = %composition.name_any(),
            revision = %doomed_name,
            "Garbage-collecting composition revision"
        );
        match api.delete(&doomed_name, &DeleteParams::default()).await {
            Ok(_) => {}
            Err(kube::Error::Api(e)) if e.code == 404 => {}
            Err(e) => {
                warn!(revision = %doomed_name, error = %e, "Failed to delete revision");
                return Err(e.into());
            }
        }
    }

    Ok(())
}
