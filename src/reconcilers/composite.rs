// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! The per-composite reconcile driver.
//!
//! One reconcile loads the composite by key, resolves and validates its
//! Composition, runs the function pipeline, applies the desired composed
//! resources, and aggregates readiness and connection details back onto the
//! composite.
//!
//! # Flow
//!
//! 1. Load the composite; gone means done.
//! 2. Deletion path: unpublish the connection secret, wait for composed
//!    children to be garbage-collected via owner references, release the
//!    finalizer.
//! 3. Ensure the finalizer is present.
//! 4. Select a Composition (reference, selector, claim inheritance, or the
//!    definition default) and bind a CompositionRevision.
//! 5. Validate, configure, run the pipeline with extra-resource
//!    stabilization.
//! 6. Associate templates to composed identities, handle orphans, persist
//!    the composite's references, apply each composed resource.
//! 7. Back-patch composed state onto the composite; if that mutates the
//!    composite, requeue immediately without status writes so the next
//!    iteration starts from the fresh document.
//! 8. Evaluate readiness, publish connection details, write status, and
//!    requeue after the poll interval.
//!
//! Every error lands on the composite as `Synced=False` with the error
//! taxonomy kind as the reason, and surfaces to the queue for per-key
//! backoff.

use crate::api::{ExtraResourceFetcher, ResourceClient, ResourceKey};
use crate::composed::{
    self, associate, connection_secret_ref, ref_gvk, ref_key, unlink_patch, AssociationSet,
    ObservedResource,
};
use crate::composite::{Composite, UpdatePolicy};
use crate::connection::{
    decode_secret_data, extract_details, merge_details, ConnectionDetails, SecretPublisher,
};
use crate::constants::{
    API_GROUP_VERSION, DEFAULT_POLL_INTERVAL_SECS, DEFAULT_RECONCILE_DEADLINE_SECS,
    DEFAULT_WORKER_COUNT, KIND_COMPOSITION, KIND_COMPOSITION_REVISION, STABILIZATION_CAP,
};
use crate::crd::{
    Composition, CompositionRevision, CompositionRevisionSpec, CredentialsSource, DeletionPolicy,
    PipelineStep, ResourceSelector,
};
use crate::errors::{EngineError, Result};
use crate::labels::{FINALIZER_COMPOSITE, REVISION_COMPOSITION_LABEL};
use crate::pipeline::{
    self, CredentialsBundle, FunctionRunner, ObservedComposed, ObservedState, PipelineOutput,
    Severity,
};
use crate::readiness::is_ready;
use crate::reconcilers::finalizers::{ensure_finalizer, remove_finalizer};
use crate::reconcilers::status::{
    is_reserved_condition, not_ready, ready, sync_failed, synced, REASON_DELETING,
    REASON_FATAL_RESULT, REASON_UNAVAILABLE,
};
use crate::revisions;
use crate::validation::validate_composition;
use kube::core::{DynamicObject, GroupVersionKind};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Per-reconciler configuration, injected at construction.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Requeue interval after a successful reconcile.
    pub poll_interval: Duration,

    /// Deadline for one reconcile; enforced by the caller's timeout.
    pub reconcile_deadline: Duration,

    /// Concurrent reconcile workers per composite controller.
    pub worker_count: usize,

    /// Iteration cap for extra-resource stabilization.
    pub stabilization_cap: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            reconcile_deadline: Duration::from_secs(DEFAULT_RECONCILE_DEADLINE_SECS),
            worker_count: DEFAULT_WORKER_COUNT,
            stabilization_cap: STABILIZATION_CAP,
        }
    }
}

/// The capabilities one composite reconciler runs against.
///
/// No global state: everything the driver touches is injected here.
#[derive(Clone)]
pub struct Engine {
    /// Cached, watch-driven backing-API access.
    pub client: Arc<dyn ResourceClient>,

    /// Composition-function invocation.
    pub runner: Arc<dyn FunctionRunner>,

    /// Extra-resource lookups on behalf of functions.
    pub fetcher: Arc<dyn ExtraResourceFetcher>,

    /// Connection-secret publication.
    pub secrets: Arc<dyn SecretPublisher>,

    /// The defining XRD's default Composition, if it declares one.
    pub default_composition: Option<String>,

    /// Loop configuration.
    pub config: EngineConfig,
}

/// What the work queue should do after a reconcile.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Nothing left to do; wait for the next watch event.
    Done,

    /// Re-run immediately, bypassing backoff.
    RequeueNow,

    /// Re-run after the given delay.
    RequeueAfter(Duration),
}

/// Reconcile one composite by key.
///
/// Errors have already been recorded on the composite's `Synced` condition
/// (best effort) when this returns; the caller only needs to requeue with
/// backoff.
///
/// # Errors
///
/// Returns the engine error that aborted the reconcile.
pub async fn reconcile_composite(
    engine: &Engine,
    gvk: &GroupVersionKind,
    key: &ResourceKey,
) -> Result<ReconcileOutcome> {
    // Step 1: load. Gone is done, not an error.
    let Some(object) = engine.client.get(gvk, key).await? else {
        debug!(composite = %key, "Composite is gone");
        return Ok(ReconcileOutcome::Done);
    };
    let mut xr = Composite::from_object(object)?;

    info!(composite = %key, kind = %gvk.kind, "Reconciling composite");

    if xr.is_deleting() {
        return reconcile_deletion(engine, &mut xr).await;
    }

    match reconcile_live(engine, &mut xr).await {
        Ok(outcome) => Ok(outcome),
        Err(e) => {
            // Failure semantics: record the taxonomy kind on Synced and
            // persist best-effort before surfacing to the queue.
            warn!(composite = %key, error = %e, "Reconcile failed");
            xr.set_condition(sync_failed(e.status_reason(), &e.to_string()));
            persist_status_best_effort(engine, &xr).await;
            Err(e)
        }
    }
}

/// The two-phase deletion path.
///
/// Composed children are deleted by owner-reference garbage collection,
/// not by the engine directly; the finalizer waits for them to be gone and
/// for the connection secret to be unpublished.
async fn reconcile_deletion(engine: &Engine, xr: &mut Composite) -> Result<ReconcileOutcome> {
    info!(composite = %xr.key(), "Composite is being deleted");

    if !xr.has_finalizer(FINALIZER_COMPOSITE) {
        return Ok(ReconcileOutcome::Done);
    }

    match engine.secrets.unpublish(xr).await {
        Ok(()) => {}
        Err(e) => {
            xr.set_condition(not_ready(REASON_DELETING, "Composite is being deleted"));
            xr.set_condition(sync_failed(e.status_reason(), &e.to_string()));
            persist_status_best_effort(engine, xr).await;
            return Err(e);
        }
    }

    // Wait for owner-reference GC to reap the children before releasing
    // the finalizer.
    let observed = observe_refs(engine, xr).await?;
    let remaining = observed.iter().filter(|o| o.object.is_some()).count();
    xr.set_condition(not_ready(REASON_DELETING, "Composite is being deleted"));
    xr.set_condition(synced());

    if remaining > 0 {
        debug!(
            composite = %xr.key(),
            remaining = remaining,
            "Waiting for composed resources to be garbage-collected"
        );
        persist_status_best_effort(engine, xr).await;
        return Ok(ReconcileOutcome::RequeueAfter(engine.config.poll_interval));
    }

    persist_status_best_effort(engine, xr).await;
    remove_finalizer(engine.client.as_ref(), xr, FINALIZER_COMPOSITE).await?;
    info!(composite = %xr.key(), "Released composite finalizer");
    Ok(ReconcileOutcome::Done)
}

/// The live (non-deleting) reconcile path, steps 3-11.
async fn reconcile_live(engine: &Engine, xr: &mut Composite) -> Result<ReconcileOutcome> {
    // Step 3: finalizer before anything else mutates the world.
    if let Some(persisted) =
        ensure_finalizer(engine.client.as_ref(), xr, FINALIZER_COMPOSITE).await?
    {
        // Keep reconciling against the freshly persisted document.
        *xr = Composite::from_object(persisted)?;
    }

    // Steps 4-5: composition selection, fetch, validation.
    let composition = select_composition(engine, xr).await?;
    let outcome = validate_composition(&composition.spec);
    for warning in &outcome.warnings {
        warn!(composite = %xr.key(), warning = %warning, "Composition validation warning");
    }
    if outcome.has_errors() {
        return Err(EngineError::Validation {
            subject: composition
                .metadata
                .name
                .clone()
                .unwrap_or_default(),
            reason: outcome.errors.join("; "),
        });
    }

    let revision = resolve_revision(engine, xr, &composition).await?;

    // Step 6: configure the composite from the Composition.
    if let Some(namespace) = &revision.write_connection_secrets_to_namespace {
        xr.default_connection_secret_namespace(namespace);
    }

    // Step 7: observe everything the pipeline needs, then run it.
    let observed_refs = observe_refs(engine, xr).await?;
    let observed_state = build_observed_state(engine, xr, &observed_refs).await?;
    let credentials = load_credentials(engine, revision.pipeline.as_deref().unwrap_or_default()).await?;

    let output = pipeline::run(
        engine.runner.as_ref(),
        engine.fetcher.as_ref(),
        &revision,
        &observed_state,
        &credentials,
        engine.config.stabilization_cap,
    )
    .await?;

    forward_results(xr, &output);

    if let Some(fatal) = &output.fatal {
        // A fatal result is a function speaking, not the engine failing:
        // the reconcile itself succeeded.
        xr.set_condition(not_ready(REASON_FATAL_RESULT, fatal));
        xr.set_condition(synced());
        xr.set_observed_generation(xr.generation());
        persist_status(engine, xr).await?;
        return Ok(ReconcileOutcome::RequeueAfter(engine.config.poll_interval));
    }

    // Step 8: associate templates to identities and reap orphans.
    let associations = associate(xr, &output.desired, &observed_refs)?;
    handle_orphans(engine, xr, &associations).await?;

    // Persist references before applying anything, so a crashed reconcile
    // never loses track of an object it created.
    xr.set_resource_refs(&associations.resource_refs());
    let baseline = persist_spec(engine, xr).await?;

    // Apply every composed resource in association order.
    let mut applied: Vec<(usize, DynamicObject)> = Vec::new();
    for (index, association) in associations.bound.iter().enumerate() {
        let want = &output.desired.resources[index];
        let rendered = composed::render(xr, want, association)?;
        let gvk = ref_gvk(&association.resource_ref)?;
        let persisted = engine.client.apply(&gvk, &rendered).await?;
        crate::metrics::COMPOSED_OPERATIONS_TOTAL
            .with_label_values(&[gvk.kind.as_str(), "apply"])
            .inc();
        applied.push((index, persisted));
    }

    // Step 9: back-patch composed state onto the composite, then early-exit
    // if that mutated it. Always composite-to-composed first, then apply,
    // then composed-to-compose back-patches; never fixed-point iteration
    // inside one reconcile.
    let mut doc = xr.to_value();
    for (index, persisted) in &applied {
        let want = &output.desired.resources[*index];
        let observed_doc = serde_json::to_value(persisted)
            .map_err(|e| EngineError::Internal(format!("applied composed resource: {e}")))?;
        crate::patches::apply_all_to_composite(&want.patches, &observed_doc, &mut doc).map_err(
            |e| EngineError::Validation {
                subject: format!("template {:?}", want.name),
                reason: e.to_string(),
            },
        )?;
    }
    xr.update_from_value(doc)?;

    let bumped = persist_spec(engine, xr).await?;
    if bumped != baseline {
        info!(
            composite = %xr.key(),
            "Composite mutated by composed render, requeueing immediately"
        );
        return Ok(ReconcileOutcome::RequeueNow);
    }

    // Step 10: readiness aggregation.
    let mut all_ready = true;
    let mut waiting = Vec::new();
    for (index, persisted) in &applied {
        let want = &output.desired.resources[*index];
        let observed_doc = serde_json::to_value(persisted).unwrap_or(Value::Null);
        let resource_ready =
            is_ready(&want.readiness_checks, &observed_doc).map_err(|e| {
                EngineError::Validation {
                    subject: format!("template {:?}", want.name),
                    reason: e.to_string(),
                }
            })?;
        if !resource_ready {
            all_ready = false;
            waiting.push(want.name.clone());
        }
    }

    if all_ready {
        xr.set_condition(ready());
    } else {
        xr.set_condition(not_ready(
            REASON_UNAVAILABLE,
            &format!("Waiting for composed resources: {}", waiting.join(", ")),
        ));
    }

    // Step 11: connection details and the secret.
    let details = aggregate_connection_details(engine, &output, &applied).await?;
    if !details.is_empty() && engine.secrets.publish(xr, &details).await? {
        xr.set_connection_details_published_time();
    }

    xr.set_condition(synced());
    xr.set_observed_generation(xr.generation());
    persist_status(engine, xr).await?;

    Ok(ReconcileOutcome::RequeueAfter(engine.config.poll_interval))
}

// ----------------------------------------------------------------------
// Composition selection and revision binding
// ----------------------------------------------------------------------

fn composition_gvk() -> GroupVersionKind {
    GroupVersionKind::gvk("loomy.firestoned.io", "v1alpha1", KIND_COMPOSITION)
}

fn revision_gvk() -> GroupVersionKind {
    GroupVersionKind::gvk("loomy.firestoned.io", "v1alpha1", KIND_COMPOSITION_REVISION)
}

fn as_typed<T: DeserializeOwned>(object: &DynamicObject) -> Result<T> {
    let value = serde_json::to_value(object)
        .map_err(|e| EngineError::Internal(format!("serializing object: {e}")))?;
    serde_json::from_value(value).map_err(|e| EngineError::Validation {
        subject: object.metadata.name.clone().unwrap_or_default(),
        reason: e.to_string(),
    })
}

/// Resolve the Composition for a composite: explicit reference, label
/// selector, claim inheritance, then the definition default.
async fn select_composition(engine: &Engine, xr: &mut Composite) -> Result<Composition> {
    let name = match xr.composition_ref() {
        Some(name) => name,
        None => {
            let selected = select_composition_name(engine, xr).await?;
            xr.set_composition_ref(&selected);
            selected
        }
    };

    let object = engine
        .client
        .get(&composition_gvk(), &ResourceKey::new(&name, None))
        .await?
        .ok_or_else(|| EngineError::Dependency {
            kind: "Composition".to_string(),
            name: name.clone(),
            reason: "not found".to_string(),
        })?;

    let composition: Composition = as_typed(&object)?;

    // The Composition must target this composite's type.
    let type_ref = &composition.spec.composite_type_ref;
    let api_version = format!("{}/{}", xr.gvk().group, xr.gvk().version);
    if type_ref.api_version != api_version || type_ref.kind != xr.gvk().kind {
        return Err(EngineError::Validation {
            subject: name,
            reason: format!(
                "composition targets {}/{}, composite is {}/{}",
                type_ref.api_version,
                type_ref.kind,
                api_version,
                xr.gvk().kind
            ),
        });
    }

    Ok(composition)
}

async fn select_composition_name(engine: &Engine, xr: &Composite) -> Result<String> {
    // By label selector, over compatible Compositions only.
    if let Some(selector) = xr.composition_selector() {
        let all = engine
            .client
            .list(&ResourceSelector {
                api_version: API_GROUP_VERSION.to_string(),
                kind: KIND_COMPOSITION.to_string(),
                match_name: None,
                match_labels: selector.match_labels.clone(),
                namespace: None,
            })
            .await?;

        let api_version = format!("{}/{}", xr.gvk().group, xr.gvk().version);
        let mut compatible: Vec<String> = all
            .iter()
            .filter_map(|o| as_typed::<Composition>(o).ok())
            .filter(|c| {
                c.spec.composite_type_ref.api_version == api_version
                    && c.spec.composite_type_ref.kind == xr.gvk().kind
            })
            .filter_map(|c| c.metadata.name)
            .collect();
        compatible.sort();

        if let Some(first) = compatible.into_iter().next() {
            debug!(composite = %xr.key(), composition = %first, "Selected composition by label selector");
            return Ok(first);
        }
        return Err(EngineError::Dependency {
            kind: "Composition".to_string(),
            name: "<selector>".to_string(),
            reason: "no compatible composition matches the selector".to_string(),
        });
    }

    // Inherit from the owning claim.
    if let Some(claim_ref) = xr.claim_ref() {
        let claim_gvk = crate::api::parse_gvk(&claim_ref.api_version, &claim_ref.kind)?;
        let claim = engine
            .client
            .get(
                &claim_gvk,
                &ResourceKey::new(&claim_ref.name, Some(&claim_ref.namespace)),
            )
            .await?;
        if let Some(name) = claim
            .as_ref()
            .and_then(|c| c.data.pointer("/spec/compositionRef/name"))
            .and_then(Value::as_str)
        {
            debug!(composite = %xr.key(), composition = %name, "Inherited composition from claim");
            return Ok(name.to_string());
        }
    }

    // The defining XRD's default, when it declares one.
    if let Some(default) = &engine.default_composition {
        debug!(composite = %xr.key(), composition = %default, "Using definition default composition");
        return Ok(default.clone());
    }

    Err(EngineError::Dependency {
        kind: "Composition".to_string(),
        name: xr.name().to_string(),
        reason: "composite references no composition and none is selectable".to_string(),
    })
}

/// Bind the composite to a CompositionRevision and return its snapshot.
///
/// Automatic composites track the latest revision; manual ones stay on the
/// revision they reference. The revision controller cuts revisions; a
/// Composition whose revision has not been cut yet is a dependency error
/// retried with backoff.
async fn resolve_revision(
    engine: &Engine,
    xr: &mut Composite,
    composition: &Composition,
) -> Result<CompositionRevisionSpec> {
    let composition_name = composition.metadata.name.clone().unwrap_or_default();

    if xr.composition_update_policy() == UpdatePolicy::Manual {
        if let Some(pinned) = xr.composition_revision_ref() {
            let object = engine
                .client
                .get(&revision_gvk(), &ResourceKey::new(&pinned, None))
                .await?
                .ok_or_else(|| EngineError::Dependency {
                    kind: "CompositionRevision".to_string(),
                    name: pinned.clone(),
                    reason: "not found".to_string(),
                })?;
            let revision: CompositionRevision = as_typed(&object)?;
            return Ok(revision.spec);
        }
    }

    let revision_objects = engine
        .client
        .list(&ResourceSelector {
            api_version: API_GROUP_VERSION.to_string(),
            kind: KIND_COMPOSITION_REVISION.to_string(),
            match_name: None,
            match_labels: Some(BTreeMap::from([(
                REVISION_COMPOSITION_LABEL.to_string(),
                composition_name.clone(),
            )])),
            namespace: None,
        })
        .await?;

    let revisions: Vec<CompositionRevision> = revision_objects
        .iter()
        .filter_map(|o| as_typed(o).ok())
        .collect();

    let latest = revisions::latest_revision(&revisions).ok_or_else(|| EngineError::Dependency {
        kind: "CompositionRevision".to_string(),
        name: composition_name,
        reason: "no revision has been cut yet".to_string(),
    })?;

    let latest_name = latest.metadata.name.clone().unwrap_or_default();
    if xr.composition_revision_ref().as_deref() != Some(latest_name.as_str()) {
        // Revision rotation: rebind and re-reconcile from the new snapshot.
        xr.set_composition_revision_ref(&latest_name);
    }

    Ok(latest.spec.clone())
}

// ----------------------------------------------------------------------
// Observation
// ----------------------------------------------------------------------

/// Resolve every composed-resource reference on the composite.
async fn observe_refs(engine: &Engine, xr: &Composite) -> Result<Vec<ObservedResource>> {
    let mut observed = Vec::new();
    for resource_ref in xr.resource_refs() {
        let gvk = ref_gvk(&resource_ref)?;
        let object = engine.client.get(&gvk, &ref_key(&resource_ref)).await?;
        observed.push(ObservedResource {
            resource_ref,
            object,
        });
    }
    Ok(observed)
}

/// Build the snapshot-consistent observed state every pipeline step sees.
async fn build_observed_state(
    engine: &Engine,
    xr: &Composite,
    observed: &[ObservedResource],
) -> Result<ObservedState> {
    let mut resources = BTreeMap::new();
    for entry in observed {
        let Some(object) = &entry.object else {
            continue;
        };
        let Some(template_name) = entry.template_name() else {
            continue;
        };

        let connection_details = match connection_secret_ref(object) {
            Some(secret_ref) => {
                let secret = engine
                    .client
                    .get(
                        &GroupVersionKind::gvk("", "v1", "Secret"),
                        &ResourceKey::new(&secret_ref.name, Some(&secret_ref.namespace)),
                    )
                    .await?;
                secret.as_ref().map(decode_secret_data).unwrap_or_default()
            }
            None => ConnectionDetails::new(),
        };

        resources.insert(
            template_name,
            ObservedComposed {
                resource: serde_json::to_value(object).unwrap_or(Value::Null),
                connection_details,
            },
        );
    }

    Ok(ObservedState {
        composite: xr.to_value(),
        resources,
    })
}

/// Load the credential bundles every pipeline step declares.
async fn load_credentials(
    engine: &Engine,
    steps: &[PipelineStep],
) -> Result<BTreeMap<String, CredentialsBundle>> {
    let mut bundles: BTreeMap<String, CredentialsBundle> = BTreeMap::new();

    for step in steps {
        for credential in step.credentials.as_deref().unwrap_or_default() {
            if credential.source != CredentialsSource::Secret {
                continue;
            }
            let Some(secret_ref) = &credential.secret_ref else {
                continue; // rejected by validation already
            };
            let secret = engine
                .client
                .get(
                    &GroupVersionKind::gvk("", "v1", "Secret"),
                    &ResourceKey::new(&secret_ref.name, Some(&secret_ref.namespace)),
                )
                .await?
                .ok_or_else(|| EngineError::Dependency {
                    kind: "credentials secret".to_string(),
                    name: format!("{}/{}", secret_ref.namespace, secret_ref.name),
                    reason: format!("referenced by step {:?}", step.step),
                })?;

            bundles
                .entry(step.step.clone())
                .or_default()
                .insert(credential.name.clone(), decode_secret_data(&secret));
        }
    }

    Ok(bundles)
}

// ----------------------------------------------------------------------
// Orphans, persistence, aggregation
// ----------------------------------------------------------------------

/// Delete or unlink composed resources whose templates are gone.
async fn handle_orphans(
    engine: &Engine,
    xr: &Composite,
    associations: &AssociationSet,
) -> Result<()> {
    for orphan in &associations.orphans {
        let gvk = ref_gvk(&orphan.resource_ref)?;
        let key = ref_key(&orphan.resource_ref);
        match orphan.policy {
            DeletionPolicy::Delete => {
                info!(composite = %xr.key(), orphan = %key, "Deleting orphaned composed resource");
                engine.client.delete(&gvk, &key).await?;
                crate::metrics::COMPOSED_OPERATIONS_TOTAL
                    .with_label_values(&[gvk.kind.as_str(), "orphan_delete"])
                    .inc();
            }
            DeletionPolicy::Retain => {
                info!(composite = %xr.key(), orphan = %key, "Retaining orphaned composed resource");
                if let Some(object) = engine.client.get(&gvk, &key).await? {
                    let uid = xr.object().metadata.uid.clone().unwrap_or_default();
                    engine
                        .client
                        .patch_merge(&gvk, &key, &unlink_patch(&object, &uid))
                        .await?;
                }
                crate::metrics::COMPOSED_OPERATIONS_TOTAL
                    .with_label_values(&[gvk.kind.as_str(), "orphan_retain"])
                    .inc();
            }
        }
    }
    Ok(())
}

/// Persist the composite's spec (and label/annotation) side; returns the
/// resulting resource version for mutation detection.
async fn persist_spec(engine: &Engine, xr: &mut Composite) -> Result<String> {
    let doc = xr.to_value();
    let mut patch = json!({});
    if let Some(spec) = doc.get("spec") {
        patch["spec"] = spec.clone();
    }
    if let Some(metadata) = doc.get("metadata") {
        let mut meta_patch = json!({});
        for key in ["labels", "annotations"] {
            if let Some(v) = metadata.get(key) {
                meta_patch[key] = v.clone();
            }
        }
        if meta_patch.as_object().is_some_and(|m| !m.is_empty()) {
            patch["metadata"] = meta_patch;
        }
    }

    let persisted = engine
        .client
        .patch_merge(xr.gvk(), &xr.key(), &patch)
        .await?;
    let version = persisted
        .metadata
        .resource_version
        .clone()
        .unwrap_or_default();

    // Keep reconciling against the persisted document.
    let mut refreshed = Composite::from_object(persisted)?;
    refreshed.update_status_from(xr);
    *xr = refreshed;

    Ok(version)
}

/// Persist the composite's status subresource.
async fn persist_status(engine: &Engine, xr: &Composite) -> Result<()> {
    let patch = json!({ "status": xr.status_value() });
    engine
        .client
        .patch_status(xr.gvk(), &xr.key(), &patch)
        .await?;
    Ok(())
}

async fn persist_status_best_effort(engine: &Engine, xr: &Composite) {
    if let Err(e) = persist_status(engine, xr).await {
        warn!(composite = %xr.key(), error = %e, "Failed to persist composite status");
    }
}

/// Forward user-facing pipeline results: log them, and land any
/// non-reserved conditions on the composite.
fn forward_results(xr: &mut Composite, output: &PipelineOutput) {
    for result in &output.results {
        match result.severity {
            Severity::Normal => {
                info!(composite = %xr.key(), message = %result.message, "Pipeline result");
            }
            Severity::Warning | Severity::Fatal => {
                warn!(composite = %xr.key(), message = %result.message, "Pipeline result");
            }
        }
        if let Some(condition) = &result.condition {
            if is_reserved_condition(&condition.r#type) {
                warn!(
                    composite = %xr.key(),
                    condition = %condition.r#type,
                    "Function tried to write a reserved condition type"
                );
            } else {
                xr.set_condition(condition.clone());
            }
        }
    }
}

/// Aggregate connection details: per-composed rules in association order,
/// then function-computed details, which are later writers and win per key.
async fn aggregate_connection_details(
    engine: &Engine,
    output: &PipelineOutput,
    applied: &[(usize, DynamicObject)],
) -> Result<ConnectionDetails> {
    let mut details = ConnectionDetails::new();

    for (index, persisted) in applied {
        let want = &output.desired.resources[*index];
        if want.connection_details.is_empty() {
            continue;
        }

        let secret = match connection_secret_ref(persisted) {
            Some(secret_ref) => engine
                .client
                .get(
                    &GroupVersionKind::gvk("", "v1", "Secret"),
                    &ResourceKey::new(&secret_ref.name, Some(&secret_ref.namespace)),
                )
                .await?
                .as_ref()
                .map(decode_secret_data),
            None => None,
        };

        let observed_doc = serde_json::to_value(persisted).unwrap_or(Value::Null);
        let contributed = extract_details(
            &want.connection_details,
            &observed_doc,
            secret.as_ref(),
        )
        .map_err(|e| EngineError::Validation {
            subject: format!("template {:?}", want.name),
            reason: e.to_string(),
        })?;
        merge_details(&mut details, contributed);
    }

    merge_details(&mut details, output.connection_details.clone());
    Ok(details)
}

#[cfg(test)]
#[path = "composite_tests.rs"]
mod composite_tests;
