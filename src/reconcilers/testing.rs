// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! In-memory doubles of the engine's external collaborators.
//!
//! The reconcile driver only talks to the backing API, function runner,
//! extra-resource fetcher, and secret store through capabilities; these
//! fakes implement them over a process-local object store so reconcile
//! behavior is testable end to end without a cluster.

use crate::api::{ExtraResourceFetcher, ResourceClient, ResourceKey};
use crate::composite::Composite;
use crate::connection::{ConnectionDetails, SecretPublisher};
use crate::crd::ResourceSelector;
use crate::errors::{EngineError, Result};
use async_trait::async_trait;
use kube::core::{DynamicObject, GroupVersionKind};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

fn store_key(gvk: &GroupVersionKind, key: &ResourceKey) -> String {
    format!(
        "{}/{}/{}|{}",
        gvk.group,
        gvk.version,
        gvk.kind,
        key
    )
}

/// RFC 7386 merge-patch semantics, as the API server applies them.
fn merge_patch(target: &mut Value, patch: &Value) {
    match patch.as_object() {
        Some(patch_map) => {
            if !target.is_object() {
                *target = json!({});
            }
            let map = target.as_object_mut().expect("set above");
            for (key, value) in patch_map {
                if value.is_null() {
                    map.remove(key);
                } else if value.is_object() {
                    merge_patch(map.entry(key.clone()).or_insert(Value::Null), value);
                } else {
                    map.insert(key.clone(), value.clone());
                }
            }
        }
        None => *target = patch.clone(),
    }
}

/// An in-memory [`ResourceClient`] with API-server-like resource-version
/// bumping: a write that changes nothing keeps the version.
#[derive(Default)]
pub struct FakeClient {
    objects: Mutex<HashMap<String, Value>>,
    version: AtomicU64,
    pub deletes: Mutex<Vec<String>>,
}

impl FakeClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_version(&self) -> String {
        self.version.fetch_add(1, Ordering::SeqCst).to_string()
    }

    /// Seed a typed object into the store under its CRD coordinates.
    pub fn put_typed<T: serde::Serialize>(&self, gvk: &GroupVersionKind, object: &T) {
        let mut value = serde_json::to_value(object).expect("serializable");
        value["apiVersion"] = json!(api_version_of(gvk));
        value["kind"] = json!(gvk.kind.clone());
        let name = value["metadata"]["name"].as_str().expect("named").to_string();
        let namespace = value["metadata"]["namespace"].as_str().map(ToString::to_string);
        self.seed(gvk, &ResourceKey::new(&name, namespace.as_deref()), value);
    }

    /// Seed a raw document into the store.
    pub fn seed(&self, gvk: &GroupVersionKind, key: &ResourceKey, mut value: Value) {
        if value["metadata"]["uid"].is_null() {
            value["metadata"]["uid"] = json!(format!("uid-{key}"));
        }
        value["metadata"]["resourceVersion"] = json!(self.next_version());
        self.objects
            .lock()
            .unwrap()
            .insert(store_key(gvk, key), value);
    }

    /// Read a stored document.
    pub fn stored(&self, gvk: &GroupVersionKind, key: &ResourceKey) -> Option<Value> {
        self.objects
            .lock()
            .unwrap()
            .get(&store_key(gvk, key))
            .cloned()
    }

    /// Mutate a stored document in place (test arrangement only).
    pub fn mutate(
        &self,
        gvk: &GroupVersionKind,
        key: &ResourceKey,
        mutator: impl FnOnce(&mut Value),
    ) {
        let mut objects = self.objects.lock().unwrap();
        if let Some(value) = objects.get_mut(&store_key(gvk, key)) {
            mutator(value);
        }
    }

    /// All stored documents of one kind.
    pub fn all_of(&self, gvk: &GroupVersionKind) -> Vec<Value> {
        let prefix = format!("{}/{}/{}|", gvk.group, gvk.version, gvk.kind);
        self.objects
            .lock()
            .unwrap()
            .iter()
            .filter(|(k, _)| k.starts_with(&prefix))
            .map(|(_, v)| v.clone())
            .collect()
    }

    fn to_object(value: Value) -> Result<DynamicObject> {
        serde_json::from_value(value)
            .map_err(|e| EngineError::Internal(format!("stored object: {e}")))
    }
}

fn api_version_of(gvk: &GroupVersionKind) -> String {
    if gvk.group.is_empty() {
        gvk.version.clone()
    } else {
        format!("{}/{}", gvk.group, gvk.version)
    }
}

#[async_trait]
impl ResourceClient for FakeClient {
    async fn get(
        &self,
        gvk: &GroupVersionKind,
        key: &ResourceKey,
    ) -> Result<Option<DynamicObject>> {
        match self.stored(gvk, key) {
            Some(value) => Ok(Some(Self::to_object(value)?)),
            None => Ok(None),
        }
    }

    async fn list(&self, selector: &ResourceSelector) -> Result<Vec<DynamicObject>> {
        let gvk = crate::api::selector_gvk(selector)?;
        let mut out = Vec::new();
        for value in self.all_of(&gvk) {
            if let Some(labels) = &selector.match_labels {
                let object_labels: BTreeMap<String, String> = value["metadata"]["labels"]
                    .as_object()
                    .map(|m| {
                        m.iter()
                            .filter_map(|(k, v)| Some((k.clone(), v.as_str()?.to_string())))
                            .collect()
                    })
                    .unwrap_or_default();
                if !labels
                    .iter()
                    .all(|(k, v)| object_labels.get(k) == Some(v))
                {
                    continue;
                }
            }
            if let Some(name) = &selector.match_name {
                if value["metadata"]["name"].as_str() != Some(name) {
                    continue;
                }
            }
            out.push(Self::to_object(value)?);
        }
        Ok(out)
    }

    async fn apply(&self, gvk: &GroupVersionKind, obj: &DynamicObject) -> Result<DynamicObject> {
        let name = obj
            .metadata
            .name
            .clone()
            .ok_or_else(|| EngineError::Internal("apply of unnamed object".to_string()))?;
        let key = ResourceKey::new(&name, obj.metadata.namespace.as_deref());
        let mut incoming = serde_json::to_value(obj)
            .map_err(|e| EngineError::Internal(e.to_string()))?;

        let mut objects = self.objects.lock().unwrap();
        let entry = objects.entry(store_key(gvk, &key));
        match entry {
            std::collections::hash_map::Entry::Occupied(mut existing) => {
                let current = existing.get().clone();
                // Server-side apply keeps server-owned metadata.
                incoming["metadata"]["uid"] = current["metadata"]["uid"].clone();
                incoming["metadata"]["resourceVersion"] =
                    current["metadata"]["resourceVersion"].clone();
                if current["status"] != Value::Null && incoming["status"].is_null() {
                    incoming["status"] = current["status"].clone();
                }
                if incoming != current {
                    incoming["metadata"]["resourceVersion"] = json!(self.next_version());
                }
                existing.insert(incoming.clone());
            }
            std::collections::hash_map::Entry::Vacant(vacant) => {
                incoming["metadata"]["uid"] = json!(format!("uid-{key}"));
                incoming["metadata"]["resourceVersion"] = json!(self.next_version());
                vacant.insert(incoming.clone());
            }
        }
        drop(objects);
        Self::to_object(incoming)
    }

    async fn patch_merge(
        &self,
        gvk: &GroupVersionKind,
        key: &ResourceKey,
        patch: &Value,
    ) -> Result<DynamicObject> {
        let mut objects = self.objects.lock().unwrap();
        let value = objects
            .get_mut(&store_key(gvk, key))
            .ok_or_else(|| EngineError::Dependency {
                kind: gvk.kind.clone(),
                name: key.to_string(),
                reason: "not found".to_string(),
            })?;

        let before = value.clone();
        // The status subresource is not reachable through the main patch.
        let mut patch = patch.clone();
        if let Some(map) = patch.as_object_mut() {
            map.remove("status");
        }
        merge_patch(value, &patch);
        if *value != before {
            value["metadata"]["resourceVersion"] = json!(self.next_version());
        }
        Self::to_object(value.clone())
    }

    async fn patch_status(
        &self,
        gvk: &GroupVersionKind,
        key: &ResourceKey,
        patch: &Value,
    ) -> Result<DynamicObject> {
        let mut objects = self.objects.lock().unwrap();
        let value = objects
            .get_mut(&store_key(gvk, key))
            .ok_or_else(|| EngineError::Dependency {
                kind: gvk.kind.clone(),
                name: key.to_string(),
                reason: "not found".to_string(),
            })?;

        let before = value.clone();
        if let Some(status) = patch.get("status") {
            merge_patch(
                value
                    .as_object_mut()
                    .expect("stored objects are objects")
                    .entry("status".to_string())
                    .or_insert(Value::Null),
                status,
            );
        }
        if *value != before {
            value["metadata"]["resourceVersion"] = json!(self.next_version());
        }
        Self::to_object(value.clone())
    }

    async fn delete(&self, gvk: &GroupVersionKind, key: &ResourceKey) -> Result<()> {
        self.objects
            .lock()
            .unwrap()
            .remove(&store_key(gvk, key));
        self.deletes.lock().unwrap().push(store_key(gvk, key));
        Ok(())
    }
}

#[async_trait]
impl ExtraResourceFetcher for FakeClient {
    async fn fetch(&self, selector: &ResourceSelector) -> Result<Vec<DynamicObject>> {
        self.list(selector).await
    }
}

/// A [`crate::pipeline::FunctionRunner`] that returns a fixed response on
/// every invocation.
pub struct StaticRunner {
    pub response: crate::pipeline::RunFunctionResponse,
    pub invocations: AtomicUsize,
}

impl StaticRunner {
    pub fn new(response: crate::pipeline::RunFunctionResponse) -> Self {
        Self {
            response,
            invocations: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl crate::pipeline::FunctionRunner for StaticRunner {
    async fn run_function(
        &self,
        _function_name: &str,
        _step_name: &str,
        _request: crate::pipeline::RunFunctionRequest,
    ) -> Result<crate::pipeline::RunFunctionResponse> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        Ok(self.response.clone())
    }
}

/// A [`SecretPublisher`] recording publishes and unpublishes.
#[derive(Default)]
pub struct FakePublisher {
    pub published: Mutex<Vec<ConnectionDetails>>,
    pub unpublishes: AtomicUsize,
    pub fail_unpublish: std::sync::atomic::AtomicBool,
}

#[async_trait]
impl SecretPublisher for FakePublisher {
    async fn publish(&self, owner: &Composite, details: &ConnectionDetails) -> Result<bool> {
        if owner.write_connection_secret_to_ref().is_none() || details.is_empty() {
            return Ok(false);
        }
        self.published.lock().unwrap().push(details.clone());
        Ok(true)
    }

    async fn unpublish(&self, _owner: &Composite) -> Result<()> {
        if self.fail_unpublish.load(Ordering::SeqCst) {
            return Err(EngineError::transient(
                "unpublish connection secret",
                "backing API unreachable",
            ));
        }
        self.unpublishes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
