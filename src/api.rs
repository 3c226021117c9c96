// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! The backing-API capability the engine reconciles against.
//!
//! Composite and composed resources are user-defined types, so all access
//! goes through [`kube::core::DynamicObject`] keyed by group/version/kind.
//! The engine consumes the backing API through the [`ResourceClient`]
//! capability; production wires [`KubeResourceClient`] while tests use an
//! in-memory double. The engine never holds locks across these calls.

use crate::constants::FIELD_MANAGER;
use crate::crd::ResourceSelector;
use crate::errors::{EngineError, Result};
use async_trait::async_trait;
use kube::api::{DeleteParams, ListParams, Patch, PatchParams};
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use kube::{Api, Client};
use serde_json::Value;

/// The identity of one composite or composed resource within its kind.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey {
    /// Object name.
    pub name: String,
    /// Object namespace; `None` for cluster-scoped resources.
    pub namespace: Option<String>,
}

impl ResourceKey {
    /// Build a key from a name and an optional namespace.
    #[must_use]
    pub fn new(name: &str, namespace: Option<&str>) -> Self {
        Self {
            name: name.to_string(),
            namespace: namespace.map(ToString::to_string),
        }
    }
}

impl std::fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{ns}/{}", self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

/// Cached, watch-driven access to the backing API.
///
/// Reads are snapshot-consistent within a reconcile; writes go through
/// server-side apply under the engine's field-manager identity so that
/// user-owned fields are preserved.
#[async_trait]
pub trait ResourceClient: Send + Sync {
    /// Get one object by kind and key. Absence is `Ok(None)`, not an error.
    async fn get(
        &self,
        gvk: &GroupVersionKind,
        key: &ResourceKey,
    ) -> Result<Option<DynamicObject>>;

    /// List objects of a kind, optionally filtered by namespace and labels.
    async fn list(&self, selector: &ResourceSelector) -> Result<Vec<DynamicObject>>;

    /// Server-side apply an object under the engine's field manager.
    ///
    /// Returns the object as persisted, including the server-assigned
    /// resource version.
    async fn apply(&self, gvk: &GroupVersionKind, obj: &DynamicObject) -> Result<DynamicObject>;

    /// Merge-patch an object's main resource.
    async fn patch_merge(
        &self,
        gvk: &GroupVersionKind,
        key: &ResourceKey,
        patch: &Value,
    ) -> Result<DynamicObject>;

    /// Merge-patch an object's status subresource.
    async fn patch_status(
        &self,
        gvk: &GroupVersionKind,
        key: &ResourceKey,
        patch: &Value,
    ) -> Result<DynamicObject>;

    /// Delete an object. Deleting an already-absent object succeeds.
    async fn delete(&self, gvk: &GroupVersionKind, key: &ResourceKey) -> Result<()>;
}

/// Resolves dynamic lookup dependencies declared by composition functions.
///
/// Given a `(gvk, predicate)` selector, returns the currently matching set
/// from the backing API. Failures surface as pipeline errors.
#[async_trait]
pub trait ExtraResourceFetcher: Send + Sync {
    /// Fetch the resources matching `selector`.
    async fn fetch(&self, selector: &ResourceSelector) -> Result<Vec<DynamicObject>>;
}

/// The production [`ResourceClient`] backed by a kube client.
#[derive(Clone)]
pub struct KubeResourceClient {
    client: Client,
}

impl KubeResourceClient {
    /// Wrap a kube client.
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn dynamic_api(&self, gvk: &GroupVersionKind, namespace: Option<&str>) -> Api<DynamicObject> {
        let resource = api_resource(gvk);
        match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &resource),
            None => Api::all_with(self.client.clone(), &resource),
        }
    }
}

#[async_trait]
impl ResourceClient for KubeResourceClient {
    async fn get(
        &self,
        gvk: &GroupVersionKind,
        key: &ResourceKey,
    ) -> Result<Option<DynamicObject>> {
        let api = self.dynamic_api(gvk, key.namespace.as_deref());
        match api.get(&key.name).await {
            Ok(obj) => Ok(Some(obj)),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(None),
            Err(e) => Err(EngineError::transient("get", e)),
        }
    }

    async fn list(&self, selector: &ResourceSelector) -> Result<Vec<DynamicObject>> {
        let gvk = selector_gvk(selector)?;
        let api = self.dynamic_api(&gvk, selector.namespace.as_deref());

        let mut params = ListParams::default();
        if let Some(labels) = &selector.match_labels {
            let expr = labels
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join(",");
            params = params.labels(&expr);
        }

        let items = api
            .list(&params)
            .await
            .map_err(|e| EngineError::transient("list", e))?
            .items;

        // Exact-name predicates are filtered engine-side; the API has no
        // server-side name selector for arbitrary kinds.
        Ok(match &selector.match_name {
            Some(name) => items
                .into_iter()
                .filter(|o| o.metadata.name.as_deref() == Some(name))
                .collect(),
            None => items,
        })
    }

    async fn apply(&self, gvk: &GroupVersionKind, obj: &DynamicObject) -> Result<DynamicObject> {
        let name = obj
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| EngineError::Internal("apply of unnamed object".to_string()))?;
        let api = self.dynamic_api(gvk, obj.metadata.namespace.as_deref());
        api.patch(
            name,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(obj),
        )
        .await
        .map_err(|e| EngineError::transient("apply", e))
    }

    async fn patch_merge(
        &self,
        gvk: &GroupVersionKind,
        key: &ResourceKey,
        patch: &Value,
    ) -> Result<DynamicObject> {
        let api = self.dynamic_api(gvk, key.namespace.as_deref());
        api.patch(&key.name, &PatchParams::default(), &Patch::Merge(patch))
            .await
            .map_err(|e| EngineError::transient("patch", e))
    }

    async fn patch_status(
        &self,
        gvk: &GroupVersionKind,
        key: &ResourceKey,
        patch: &Value,
    ) -> Result<DynamicObject> {
        let api = self.dynamic_api(gvk, key.namespace.as_deref());
        api.patch_status(&key.name, &PatchParams::default(), &Patch::Merge(patch))
            .await
            .map_err(|e| EngineError::transient("patch status", e))
    }

    async fn delete(&self, gvk: &GroupVersionKind, key: &ResourceKey) -> Result<()> {
        let api = self.dynamic_api(gvk, key.namespace.as_deref());
        match api.delete(&key.name, &DeleteParams::background()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(EngineError::transient("delete", e)),
        }
    }
}

#[async_trait]
impl ExtraResourceFetcher for KubeResourceClient {
    async fn fetch(&self, selector: &ResourceSelector) -> Result<Vec<DynamicObject>> {
        self.list(selector).await
    }
}

/// Build the dynamic [`ApiResource`] for a kind.
///
/// Convert kind to plural resource name (e.g., `"DB"` -> `"dbs"`).
#[must_use]
pub fn api_resource(gvk: &GroupVersionKind) -> ApiResource {
    let plural = format!("{}s", gvk.kind.to_lowercase());
    ApiResource::from_gvk_with_plural(gvk, &plural)
}

/// Parse a selector's `apiVersion` + `kind` into a [`GroupVersionKind`].
///
/// # Errors
///
/// Returns [`EngineError::Validation`] when the `apiVersion` is malformed.
pub fn selector_gvk(selector: &ResourceSelector) -> Result<GroupVersionKind> {
    parse_gvk(&selector.api_version, &selector.kind)
}

/// Parse an `apiVersion` string and kind into a [`GroupVersionKind`].
///
/// # Errors
///
/// Returns [`EngineError::Validation`] when `api_version` has more than one
/// `/`.
pub fn parse_gvk(api_version: &str, kind: &str) -> Result<GroupVersionKind> {
    let (group, version) = match api_version.split_once('/') {
        Some((group, version)) => {
            if version.contains('/') {
                return Err(EngineError::Validation {
                    subject: api_version.to_string(),
                    reason: "apiVersion must be 'group/version' or 'version'".to_string(),
                });
            }
            (group, version)
        }
        // Core-group resources like v1/Secret.
        None => ("", api_version),
    };
    Ok(GroupVersionKind::gvk(group, version, kind))
}

#[cfg(test)]
#[path = "api_tests.rs"]
mod api_tests;
