// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Finalizer management for dynamic composite resources.
//!
//! The finalizer is the single serialization point for ordered teardown:
//! it holds the composite alive while the connection secret is unpublished
//! and composed children are garbage-collected, and is released only once
//! both have happened.
//!
//! Composites are dynamically typed, so unlike a typed `Api<T>` patch the
//! helpers here work through the [`ResourceClient`] capability.

use crate::api::ResourceClient;
use crate::composite::Composite;
use crate::errors::Result;
use crate::reconcilers::retry::retry_transient;
use serde_json::json;
use tracing::info;

/// Add a finalizer to a composite if not already present.
///
/// Idempotent: a composite that already carries the finalizer is left
/// untouched. The persisting patch is retried through transient API
/// failures, since a composite without a finalizer must not reach the
/// pipeline.
///
/// Returns the freshly persisted object when the finalizer was added, so
/// the caller can keep reconciling against the current resource version.
///
/// # Errors
///
/// Returns an error when the patch cannot be persisted.
pub async fn ensure_finalizer(
    client: &dyn ResourceClient,
    xr: &Composite,
    finalizer: &str,
) -> Result<Option<kube::core::DynamicObject>> {
    if xr.has_finalizer(finalizer) {
        return Ok(None);
    }

    let mut finalizers: Vec<String> = xr
        .object()
        .metadata
        .finalizers
        .clone()
        .unwrap_or_default();
    finalizers.push(finalizer.to_string());

    info!(
        composite = %xr.key(),
        kind = %xr.gvk().kind,
        finalizer = finalizer,
        "Adding finalizer"
    );

    let patch = json!({ "metadata": { "finalizers": finalizers } });
    let key = xr.key();
    let persisted = retry_transient(
        || client.patch_merge(xr.gvk(), &key, &patch),
        "add finalizer",
    )
    .await?;

    Ok(Some(persisted))
}

/// Remove a finalizer from a composite.
///
/// Idempotent: removing an absent finalizer is a no-op. Called only after
/// cleanup succeeded; once the finalizer is gone the API server is free to
/// delete the composite.
///
/// # Errors
///
/// Returns an error when the patch cannot be persisted.
pub async fn remove_finalizer(
    client: &dyn ResourceClient,
    xr: &Composite,
    finalizer: &str,
) -> Result<()> {
    if !xr.has_finalizer(finalizer) {
        return Ok(());
    }

    let finalizers: Vec<String> = xr
        .object()
        .metadata
        .finalizers
        .clone()
        .unwrap_or_default()
        .into_iter()
        .filter(|f| f != finalizer)
        .collect();

    info!(
        composite = %xr.key(),
        kind = %xr.gvk().kind,
        finalizer = finalizer,
        "Removing finalizer"
    );

    let patch = json!({ "metadata": { "finalizers": finalizers } });
    client.patch_merge(xr.gvk(), &xr.key(), &patch).await?;

    Ok(())
}

#[cfg(test)]
#[path = "finalizers_tests.rs"]
mod finalizers_tests;
