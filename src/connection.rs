// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Connection-detail aggregation and secret publication.
//!
//! Composed resources contribute connection details to their composite
//! through declarative rules: forwarding a key from the composed resource's
//! own connection secret, copying a field-path value, or injecting a
//! literal. Details accumulate into a map keyed by final name; later
//! pipeline steps override earlier ones per key.
//!
//! Publication is a separate capability ([`SecretPublisher`]): the engine
//! writes the aggregated map as one secret in a single apply, stamps the
//! composite with the publication time, and unpublishes before releasing
//! the finalizer on deletion.

use crate::composite::Composite;
use crate::constants::FIELD_MANAGER;
use crate::errors::{EngineError, Result};
use crate::fieldpath::{self, FieldPathError};
use crate::labels::{K8S_MANAGED_BY, MANAGED_BY_LOOMY};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::api::{DeleteParams, Patch, PatchParams};
use kube::core::DynamicObject;
use kube::{Api, Client};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Aggregated connection details, keyed by final secret key.
pub type ConnectionDetails = BTreeMap<String, Vec<u8>>;

/// One connection-detail contribution declared for a composed resource.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum ConnectionDetailRule {
    /// Forward a key from the composed resource's connection secret,
    /// optionally renaming it.
    FromConnectionSecretKey {
        /// Final key name; defaults to the source key.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        /// The key to forward from the composed resource's secret.
        from_connection_secret_key: String,
    },

    /// Copy a value from the composed resource's spec or status.
    FromFieldPath {
        /// Final key name.
        name: String,
        /// The field path to copy.
        from_field_path: String,
    },

    /// Inject a literal value.
    FromValue {
        /// Final key name.
        name: String,
        /// The literal value.
        value: String,
    },
}

/// Evaluate one composed resource's detail rules.
///
/// `observed` is the composed resource's current document; `secret` its
/// decoded connection secret, when it has one. Absent secret keys and
/// absent field paths skip their rule silently.
///
/// # Errors
///
/// Returns a [`FieldPathError`] when a declared field path does not parse.
pub fn extract_details(
    rules: &[ConnectionDetailRule],
    observed: &Value,
    secret: Option<&ConnectionDetails>,
) -> std::result::Result<ConnectionDetails, FieldPathError> {
    let mut details = ConnectionDetails::new();

    for rule in rules {
        match rule {
            ConnectionDetailRule::FromConnectionSecretKey {
                name,
                from_connection_secret_key,
            } => {
                if let Some(value) =
                    secret.and_then(|s| s.get(from_connection_secret_key))
                {
                    let key = name
                        .clone()
                        .unwrap_or_else(|| from_connection_secret_key.clone());
                    details.insert(key, value.clone());
                }
            }
            ConnectionDetailRule::FromFieldPath {
                name,
                from_field_path,
            } => {
                if let Some(value) = fieldpath::get(observed, from_field_path)? {
                    details.insert(name.clone(), value_bytes(value));
                }
            }
            ConnectionDetailRule::FromValue { name, value } => {
                details.insert(name.clone(), value.clone().into_bytes());
            }
        }
    }

    Ok(details)
}

/// A field-path value as secret bytes: strings verbatim, everything else
/// as its JSON rendering.
fn value_bytes(value: &Value) -> Vec<u8> {
    match value {
        Value::String(s) => s.clone().into_bytes(),
        other => other.to_string().into_bytes(),
    }
}

/// Merge `from` into `into`; later writers win per key.
pub fn merge_details(into: &mut ConnectionDetails, from: ConnectionDetails) {
    for (key, value) in from {
        into.insert(key, value);
    }
}

/// Decode the base64 `data` map of a secret fetched as a dynamic object.
///
/// Keys with undecodable values are dropped rather than failing the
/// reconcile; the backing API only ever serves valid base64.
#[must_use]
pub fn decode_secret_data(secret: &DynamicObject) -> ConnectionDetails {
    let mut details = ConnectionDetails::new();
    if let Some(data) = secret.data.get("data").and_then(Value::as_object) {
        for (key, value) in data {
            if let Some(encoded) = value.as_str() {
                if let Ok(bytes) = BASE64.decode(encoded) {
                    details.insert(key.clone(), bytes);
                }
            }
        }
    }
    details
}

/// The secret store the engine publishes composite connection details to.
///
/// The publisher owns idempotence: re-publishing identical details is a
/// no-op apply, and unpublishing an already-absent secret succeeds.
#[async_trait]
pub trait SecretPublisher: Send + Sync {
    /// Write the composite's connection secret.
    ///
    /// Returns true when details were published, false when the composite
    /// declares no target or the detail map is empty.
    async fn publish(&self, owner: &Composite, details: &ConnectionDetails) -> Result<bool>;

    /// Remove the composite's connection secret, if any.
    async fn unpublish(&self, owner: &Composite) -> Result<()>;
}

/// The production [`SecretPublisher`] writing v1 Secrets.
#[derive(Clone)]
pub struct SecretStore {
    client: Client,
}

impl SecretStore {
    /// Wrap a kube client.
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SecretPublisher for SecretStore {
    async fn publish(&self, owner: &Composite, details: &ConnectionDetails) -> Result<bool> {
        let Some(target) = owner.write_connection_secret_to_ref() else {
            return Ok(false);
        };
        if details.is_empty() {
            return Ok(false);
        }

        let data: BTreeMap<String, ByteString> = details
            .iter()
            .map(|(k, v)| (k.clone(), ByteString(v.clone())))
            .collect();

        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(target.name.clone()),
                namespace: Some(target.namespace.clone()),
                labels: Some(BTreeMap::from([(
                    K8S_MANAGED_BY.to_string(),
                    MANAGED_BY_LOOMY.to_string(),
                )])),
                owner_references: Some(vec![owner.owner_reference()]),
                ..ObjectMeta::default()
            },
            type_: Some("connection.loomy.firestoned.io/v1alpha1".to_string()),
            data: Some(data),
            ..Secret::default()
        };

        let api: Api<Secret> = Api::namespaced(self.client.clone(), &target.namespace);
        api.patch(
            &target.name,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(&secret),
        )
        .await
        .map_err(|e| EngineError::transient("publish connection secret", e))?;

        Ok(true)
    }

    async fn unpublish(&self, owner: &Composite) -> Result<()> {
        let Some(target) = owner.write_connection_secret_to_ref() else {
            return Ok(());
        };

        let api: Api<Secret> = Api::namespaced(self.client.clone(), &target.namespace);
        match api.delete(&target.name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(EngineError::transient("unpublish connection secret", e)),
        }
    }
}

#[cfg(test)]
#[path = "connection_tests.rs"]
mod connection_tests;
