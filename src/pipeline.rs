// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! The Composition pipeline runner.
//!
//! A Composition computes desired composed resources either by invoking an
//! ordered pipeline of composition functions (`Pipeline` mode) or by
//! rendering a static template list (`Resources` mode). This module drives
//! both and produces a [`PipelineOutput`] the composed-resource lifecycle
//! consumes.
//!
//! # Function contract
//!
//! Functions are abstracted behind [`FunctionRunner`]; they may live
//! in-process or behind a remote transport, which is the runner's concern.
//! Each invocation receives the observed composite and composed resources,
//! the desired state accumulated so far, a context map threaded across
//! steps, the step's static input, optional credentials, and any extra
//! resources the same step previously requested.
//!
//! # Stabilization
//!
//! A function may declare extra-resource requirements. The engine fetches
//! them and re-invokes the same step until the declared requirements stop
//! changing - set-equality on selector identity, so fluctuating result
//! contents never count as instability. A step that keeps changing its
//! needs past the cap fails the reconcile.

use crate::api::ExtraResourceFetcher;
use crate::connection::{merge_details, ConnectionDetailRule, ConnectionDetails};
use crate::crd::{
    ComposedTemplate, CompositionMode, CompositionRevisionSpec, Condition, DeletionPolicy,
    PipelineStep, ResourceSelector,
};
use crate::errors::{EngineError, Result};
use crate::patches::{expand_patch_sets, Patch};
use crate::readiness::ReadinessCheck;
use async_trait::async_trait;
use kube::core::DynamicObject;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Credential data loaded for one pipeline step, keyed by credential name.
pub type CredentialsBundle = BTreeMap<String, ConnectionDetails>;

/// An observed composed resource, keyed by template name in
/// [`ObservedState`].
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ObservedComposed {
    /// The composed resource's current document.
    pub resource: Value,

    /// The composed resource's decoded connection secret, when it has one.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub connection_details: ConnectionDetails,
}

/// The observed state passed to every function of one reconcile.
///
/// Snapshot-consistent: the engine does not re-read the composite
/// mid-pipeline, so every step sees the same observation.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ObservedState {
    /// The composite's full document.
    pub composite: Value,

    /// Observed composed resources, keyed by template name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub resources: BTreeMap<String, ObservedComposed>,
}

/// One desired composed resource produced by the pipeline.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DesiredResource {
    /// Stable template name.
    pub name: String,

    /// The rendered base document.
    pub resource: Value,

    /// Patches between the composite and this composed resource.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub patches: Vec<Patch>,

    /// Readiness checks; empty means the standard `Ready` condition rule.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub readiness_checks: Vec<ReadinessCheck>,

    /// Connection-detail rules contributed by this resource.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub connection_details: Vec<ConnectionDetailRule>,

    /// Orphan-handling policy.
    #[serde(default)]
    pub deletion_policy: DeletionPolicy,
}

/// The desired state accumulated across pipeline steps.
///
/// Resources keep the order of first appearance; later steps overwrite
/// same-named entries in place.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DesiredState {
    /// Desired composed resources, ordered by first appearance.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<DesiredResource>,
}

impl DesiredState {
    /// Look up a desired resource by template name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&DesiredResource> {
        self.resources.iter().find(|r| r.name == name)
    }

    fn upsert(&mut self, resource: DesiredResource) {
        match self.resources.iter_mut().find(|r| r.name == resource.name) {
            Some(existing) => *existing = resource,
            None => self.resources.push(resource),
        }
    }
}

/// Severity of a user-facing pipeline result.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum Severity {
    /// Informational.
    Normal,
    /// Something is off but the pipeline continues.
    Warning,
    /// The pipeline halts at this step.
    Fatal,
}

/// A user-facing result emitted by a pipeline step.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionResult {
    /// Result severity.
    pub severity: Severity,

    /// Human-readable message.
    pub message: String,

    /// A user-defined condition to forward onto the composite. Reserved
    /// system types (`Ready`, `Synced`) are rejected with a warning.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Condition>,
}

/// The request handed to one function invocation.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunFunctionRequest {
    /// The observed composite and composed resources.
    pub observed: ObservedState,

    /// Desired state accumulated by earlier steps.
    pub desired: DesiredState,

    /// Context map threaded across steps.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub context: BTreeMap<String, Value>,

    /// The step's static input document.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,

    /// Credentials declared for the step, loaded by the engine.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub credentials: CredentialsBundle,

    /// Extra resources fetched on behalf of this step, keyed by
    /// requirement name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra_resources: BTreeMap<String, Vec<DynamicObject>>,
}

/// The response of one function invocation.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunFunctionResponse {
    /// The function's desired state; merged into the accumulator.
    #[serde(default)]
    pub desired: DesiredState,

    /// Context updates; last writer wins per key.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub context: BTreeMap<String, Value>,

    /// Extra-resource requirements for the next invocation of this step.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub requirements: BTreeMap<String, ResourceSelector>,

    /// User-facing results.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub results: Vec<FunctionResult>,

    /// Connection details computed directly by the function; later steps
    /// win per key.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub connection_details: ConnectionDetails,
}

/// Runs composition functions on behalf of the engine.
///
/// The engine treats in-process and remote functions as one capability;
/// connection pooling, transport encoding, and credential injection are
/// the runner's concern.
#[async_trait]
pub trait FunctionRunner: Send + Sync {
    /// Invoke the function referenced by `function_name` for the named
    /// pipeline step.
    async fn run_function(
        &self,
        function_name: &str,
        step_name: &str,
        request: RunFunctionRequest,
    ) -> Result<RunFunctionResponse>;
}

/// One composition function hosted inside the engine process.
///
/// Functions may be in-process or remote; the engine treats both as the
/// single [`FunctionRunner`] capability. Remote transports implement
/// `FunctionRunner` themselves and live outside this crate.
#[async_trait]
pub trait CompositionFunction: Send + Sync {
    /// Compute a response for one invocation.
    async fn call(&self, request: RunFunctionRequest) -> Result<RunFunctionResponse>;
}

/// A [`FunctionRunner`] dispatching to functions registered in-process.
///
/// Unknown function names are a dependency error, retried with backoff -
/// the function may be registered by the host after the composite appears.
#[derive(Default)]
pub struct InProcessRunner {
    functions: BTreeMap<String, std::sync::Arc<dyn CompositionFunction>>,
}

impl InProcessRunner {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a function under the name Compositions reference it by.
    #[must_use]
    pub fn with_function(
        mut self,
        name: &str,
        function: std::sync::Arc<dyn CompositionFunction>,
    ) -> Self {
        self.functions.insert(name.to_string(), function);
        self
    }
}

#[async_trait]
impl FunctionRunner for InProcessRunner {
    async fn run_function(
        &self,
        function_name: &str,
        step_name: &str,
        request: RunFunctionRequest,
    ) -> Result<RunFunctionResponse> {
        let function =
            self.functions
                .get(function_name)
                .ok_or_else(|| EngineError::Dependency {
                    kind: "function".to_string(),
                    name: function_name.to_string(),
                    reason: format!("referenced by step {step_name:?} but not registered"),
                })?;
        function.call(request).await
    }
}

/// Everything one pipeline run produced.
#[derive(Clone, Debug, Default)]
pub struct PipelineOutput {
    /// The final desired composed resources, ordered by first appearance.
    pub desired: DesiredState,

    /// Connection details aggregated across steps.
    pub connection_details: ConnectionDetails,

    /// User-facing results from all executed steps.
    pub results: Vec<FunctionResult>,

    /// Context as left by the last executed step.
    pub context: BTreeMap<String, Value>,

    /// Set when a step returned a `Fatal` result; names the step and
    /// carries its message. Desired state from the fatal step and any
    /// later step is excluded.
    pub fatal: Option<String>,
}

impl PipelineOutput {
    /// Whether any executed step produced a `Fatal` result.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        self.fatal.is_some()
    }
}

/// Run the Composition revision's pipeline against the observed state.
///
/// `credentials` carries the pre-loaded credential bundles keyed by step
/// name; `cap` bounds the stabilization loop of each step.
///
/// # Errors
///
/// Returns [`EngineError::FunctionExecution`] when a function invocation
/// fails outright, [`EngineError::FunctionContract`] when requirements do
/// not stabilize or a response is malformed, and [`EngineError::Validation`]
/// for template errors in `Resources` mode.
pub async fn run(
    runner: &dyn FunctionRunner,
    fetcher: &dyn ExtraResourceFetcher,
    revision: &CompositionRevisionSpec,
    observed: &ObservedState,
    credentials: &BTreeMap<String, CredentialsBundle>,
    cap: u32,
) -> Result<PipelineOutput> {
    match revision.mode {
        CompositionMode::Resources => {
            desired_from_templates(revision.resources.as_deref().unwrap_or_default(), revision)
        }
        CompositionMode::Pipeline => {
            run_function_pipeline(
                runner,
                fetcher,
                revision.pipeline.as_deref().unwrap_or_default(),
                observed,
                credentials,
                cap,
            )
            .await
        }
    }
}

/// Drive the ordered function pipeline to completion.
async fn run_function_pipeline(
    runner: &dyn FunctionRunner,
    fetcher: &dyn ExtraResourceFetcher,
    steps: &[PipelineStep],
    observed: &ObservedState,
    credentials: &BTreeMap<String, CredentialsBundle>,
    cap: u32,
) -> Result<PipelineOutput> {
    let mut output = PipelineOutput::default();

    for step in steps {
        let step_credentials = credentials.get(&step.step).cloned().unwrap_or_default();

        let build_request = |extras: &BTreeMap<String, Vec<DynamicObject>>,
                             desired: &DesiredState,
                             context: &BTreeMap<String, Value>| {
            RunFunctionRequest {
                observed: observed.clone(),
                desired: desired.clone(),
                context: context.clone(),
                input: step.input.clone(),
                credentials: step_credentials.clone(),
                extra_resources: extras.clone(),
            }
        };

        let mut extras = BTreeMap::new();
        let mut response = invoke(runner, step, build_request(&extras, &output.desired, &output.context)).await?;

        if let Some(fatal) = fatal_message(&response) {
            // The fatal step's desired state never lands; neither do
            // later steps, because the pipeline stops here.
            output.results.extend(response.results);
            output.fatal = Some(format!("step {:?}: {fatal}", step.step));
            return Ok(output);
        }

        // Stabilization: re-invoke this step with fetched extras until the
        // declared requirements stop changing.
        let mut iterations = 0u32;
        while !response.requirements.is_empty() {
            if iterations >= cap {
                return Err(EngineError::extra_resources_did_not_stabilize(
                    &step.step, iterations,
                ));
            }
            let previous = response.requirements.clone();
            extras = fetch_extras(fetcher, &step.step, &previous).await?;
            response =
                invoke(runner, step, build_request(&extras, &output.desired, &output.context)).await?;
            iterations += 1;

            if let Some(fatal) = fatal_message(&response) {
                output.results.extend(response.results);
                output.fatal = Some(format!("step {:?}: {fatal}", step.step));
                return Ok(output);
            }

            if response.requirements == previous {
                debug!(
                    step = %step.step,
                    iterations = iterations,
                    "Extra-resource requirements stabilized"
                );
                break;
            }
        }
        crate::metrics::STABILIZATION_ROUNDS
            .with_label_values(&[step.step.as_str()])
            .observe(f64::from(iterations));

        merge_response(&mut output, &step.step, response)?;
    }

    Ok(output)
}

/// Call the runner, mapping failures to the engine taxonomy.
async fn invoke(
    runner: &dyn FunctionRunner,
    step: &PipelineStep,
    request: RunFunctionRequest,
) -> Result<RunFunctionResponse> {
    debug!(step = %step.step, function = %step.function_ref.name, "Invoking composition function");
    let result = runner
        .run_function(&step.function_ref.name, &step.step, request)
        .await;

    let status = if result.is_ok() { "success" } else { "error" };
    crate::metrics::FUNCTION_INVOCATIONS_TOTAL
        .with_label_values(&[step.function_ref.name.as_str(), status])
        .inc();

    result.map_err(|e| match e {
        // Runner-level dependency failures (unknown function) keep
        // their kind; everything else is a step execution failure.
        EngineError::Dependency { .. } => e,
        other => EngineError::FunctionExecution {
            step: step.step.clone(),
            reason: other.to_string(),
        },
    })
}

/// The first fatal result's message, if any.
fn fatal_message(response: &RunFunctionResponse) -> Option<String> {
    response
        .results
        .iter()
        .find(|r| r.severity == Severity::Fatal)
        .map(|r| r.message.clone())
}

/// Fetch every requirement of one step, keyed by requirement name.
async fn fetch_extras(
    fetcher: &dyn ExtraResourceFetcher,
    step: &str,
    requirements: &BTreeMap<String, ResourceSelector>,
) -> Result<BTreeMap<String, Vec<DynamicObject>>> {
    let mut extras = BTreeMap::new();
    for (name, selector) in requirements {
        debug!(step = %step, requirement = %name, kind = %selector.kind, "Fetching extra resources");
        let items = fetcher.fetch(selector).await?;
        extras.insert(name.clone(), items);
    }
    Ok(extras)
}

/// Merge one step's (non-fatal, stabilized) response into the output.
fn merge_response(
    output: &mut PipelineOutput,
    step: &str,
    response: RunFunctionResponse,
) -> Result<()> {
    // A single response must not name the same template twice.
    let mut seen = std::collections::BTreeSet::new();
    for resource in &response.desired.resources {
        if !seen.insert(resource.name.clone()) {
            return Err(EngineError::FunctionContract {
                step: step.to_string(),
                reason: format!("duplicate template name {:?} in desired output", resource.name),
            });
        }
    }

    for resource in response.desired.resources {
        output.desired.upsert(resource);
    }
    for (key, value) in response.context {
        output.context.insert(key, value);
    }
    merge_details(&mut output.connection_details, response.connection_details);
    for result in &response.results {
        if result.severity == Severity::Warning {
            warn!(step = %step, message = %result.message, "Composition function warning");
        }
    }
    output.results.extend(response.results);
    Ok(())
}

/// Synthesize desired state from a `Resources`-mode template list.
///
/// Templates become desired resources verbatim; the patch engine runs
/// later, during composed-resource rendering. Anonymous templates are
/// keyed by positional index.
fn desired_from_templates(
    templates: &[ComposedTemplate],
    revision: &CompositionRevisionSpec,
) -> Result<PipelineOutput> {
    let patch_sets = revision.patch_sets.as_deref().unwrap_or_default();
    let mut output = PipelineOutput::default();

    for (index, template) in templates.iter().enumerate() {
        let name = template
            .name
            .clone()
            .unwrap_or_else(|| index.to_string());

        let patches = expand_patch_sets(&template.patches, patch_sets).map_err(|e| {
            EngineError::Validation {
                subject: format!("template {name:?}"),
                reason: e.to_string(),
            }
        })?;

        if output.desired.get(&name).is_some() {
            return Err(EngineError::Validation {
                subject: format!("template {name:?}"),
                reason: "duplicate template name".to_string(),
            });
        }

        output.desired.upsert(DesiredResource {
            name,
            resource: template.base.clone(),
            patches,
            readiness_checks: template.readiness_checks.clone().unwrap_or_default(),
            connection_details: template.connection_details.clone().unwrap_or_default(),
            deletion_policy: template.deletion_policy.unwrap_or_default(),
        });
    }

    Ok(output)
}

#[cfg(test)]
#[path = "pipeline_tests.rs"]
mod pipeline_tests;
