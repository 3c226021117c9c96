// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Unit tests for `pipeline.rs`

use crate::api::ExtraResourceFetcher;
use crate::crd::{
    ComposedTemplate, CompositionMode, CompositionRevisionSpec, FunctionReference, PipelineStep,
    ResourceSelector, TypeReference,
};
use crate::errors::{EngineError, Result};
use crate::pipeline::{
    run, DesiredResource, DesiredState, FunctionResult, FunctionRunner, ObservedState,
    RunFunctionRequest, RunFunctionResponse, Severity,
};
use async_trait::async_trait;
use kube::core::DynamicObject;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// A scripted function runner: pops one response per invocation, counting
/// calls per step.
#[derive(Default)]
struct ScriptedRunner {
    responses: Mutex<Vec<RunFunctionResponse>>,
    invocations: AtomicUsize,
    requests: Mutex<Vec<RunFunctionRequest>>,
}

impl ScriptedRunner {
    fn new(responses: Vec<RunFunctionResponse>) -> Self {
        let mut reversed = responses;
        reversed.reverse();
        Self {
            responses: Mutex::new(reversed),
            invocations: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    fn invocation_count(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FunctionRunner for ScriptedRunner {
    async fn run_function(
        &self,
        _function_name: &str,
        _step_name: &str,
        request: RunFunctionRequest,
    ) -> Result<RunFunctionResponse> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request);
        self.responses
            .lock()
            .unwrap()
            .pop()
            .ok_or_else(|| EngineError::Internal("runner script exhausted".to_string()))
    }
}

/// A fetcher returning a fixed item list, counting fetches.
#[derive(Default)]
struct CountingFetcher {
    fetches: AtomicUsize,
}

#[async_trait]
impl ExtraResourceFetcher for CountingFetcher {
    async fn fetch(&self, _selector: &ResourceSelector) -> Result<Vec<DynamicObject>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(vec![])
    }
}

fn revision_with_steps(steps: Vec<PipelineStep>) -> CompositionRevisionSpec {
    CompositionRevisionSpec {
        revision: 1,
        composite_type_ref: TypeReference {
            api_version: "example.org/v1".to_string(),
            kind: "App".to_string(),
        },
        mode: CompositionMode::Pipeline,
        pipeline: Some(steps),
        resources: None,
        patch_sets: None,
        write_connection_secrets_to_namespace: None,
    }
}

fn step(name: &str) -> PipelineStep {
    PipelineStep {
        step: name.to_string(),
        function_ref: FunctionReference {
            name: "template".to_string(),
        },
        input: None,
        credentials: None,
    }
}

fn desired(name: &str, doc: serde_json::Value) -> DesiredResource {
    DesiredResource {
        name: name.to_string(),
        resource: doc,
        patches: vec![],
        readiness_checks: vec![],
        connection_details: vec![],
        deletion_policy: Default::default(),
    }
}

fn response_with(resources: Vec<DesiredResource>) -> RunFunctionResponse {
    RunFunctionResponse {
        desired: DesiredState { resources },
        ..Default::default()
    }
}

fn env_requirement() -> BTreeMap<String, ResourceSelector> {
    BTreeMap::from([(
        "env".to_string(),
        ResourceSelector {
            api_version: "example.org/v1".to_string(),
            kind: "Environment".to_string(),
            match_name: Some("prod".to_string()),
            match_labels: None,
            namespace: None,
        },
    )])
}

#[tokio::test]
async fn test_single_step_no_requirements() {
    let runner = ScriptedRunner::new(vec![response_with(vec![desired(
        "db",
        json!({"kind": "DB", "spec": {"size": "small"}}),
    )])]);
    let fetcher = CountingFetcher::default();
    let revision = revision_with_steps(vec![step("mk")]);

    let output = run(
        &runner,
        &fetcher,
        &revision,
        &ObservedState::default(),
        &BTreeMap::new(),
        5,
    )
    .await
    .unwrap();

    assert_eq!(runner.invocation_count(), 1);
    assert_eq!(fetcher.fetches.load(Ordering::SeqCst), 0);
    assert!(!output.is_fatal());
    assert_eq!(output.desired.resources.len(), 1);
    assert_eq!(output.desired.get("db").unwrap().resource["spec"]["size"], json!("small"));
}

#[tokio::test]
async fn test_stabilization_two_invocations_one_fetch() {
    // First call declares a requirement; the re-run declares the same one
    // plus desired output. Exactly 2 invocations and 1 fetch.
    let first = RunFunctionResponse {
        requirements: env_requirement(),
        ..Default::default()
    };
    let second = RunFunctionResponse {
        requirements: env_requirement(),
        desired: DesiredState {
            resources: vec![desired("db", json!({"kind": "DB"}))],
        },
        ..Default::default()
    };
    let runner = ScriptedRunner::new(vec![first, second]);
    let fetcher = CountingFetcher::default();
    let revision = revision_with_steps(vec![step("mk")]);

    let output = run(
        &runner,
        &fetcher,
        &revision,
        &ObservedState::default(),
        &BTreeMap::new(),
        5,
    )
    .await
    .unwrap();

    assert_eq!(runner.invocation_count(), 2);
    assert_eq!(fetcher.fetches.load(Ordering::SeqCst), 1);
    assert!(output.desired.get("db").is_some());

    // The re-run received the fetched extras under the requirement name.
    let requests = runner.requests.lock().unwrap();
    assert!(requests[0].extra_resources.is_empty());
    assert!(requests[1].extra_resources.contains_key("env"));
}

#[tokio::test]
async fn test_stabilization_cap_fails_the_reconcile() {
    // The function declares a different requirement on every call.
    let mut responses = Vec::new();
    for i in 0..16 {
        responses.push(RunFunctionResponse {
            requirements: BTreeMap::from([(
                "env".to_string(),
                ResourceSelector {
                    api_version: "example.org/v1".to_string(),
                    kind: format!("Cool{i}"),
                    match_name: None,
                    match_labels: None,
                    namespace: None,
                },
            )]),
            ..Default::default()
        });
    }
    let runner = ScriptedRunner::new(responses);
    let fetcher = CountingFetcher::default();
    let revision = revision_with_steps(vec![step("mk")]);

    let err = run(
        &runner,
        &fetcher,
        &revision,
        &ObservedState::default(),
        &BTreeMap::new(),
        5,
    )
    .await
    .unwrap_err();

    assert!(matches!(err, EngineError::FunctionContract { .. }));
    assert!(err.to_string().contains("did not stabilize"));
    // Invocations are bounded by cap + 1.
    assert_eq!(runner.invocation_count(), 6);
}

#[tokio::test]
async fn test_fatal_halts_pipeline_and_discards_desired() {
    // Step one succeeds; step two returns Fatal along with desired state
    // that must never land; step three would panic the script if called.
    let ok = response_with(vec![desired("db", json!({"kind": "DB"}))]);
    let fatal = RunFunctionResponse {
        desired: DesiredState {
            resources: vec![desired("cache", json!({"kind": "Cache"}))],
        },
        results: vec![FunctionResult {
            severity: Severity::Fatal,
            message: "boom".to_string(),
            condition: None,
        }],
        ..Default::default()
    };
    let runner = ScriptedRunner::new(vec![ok, fatal]);
    let fetcher = CountingFetcher::default();
    let revision = revision_with_steps(vec![step("one"), step("two"), step("three")]);

    let output = run(
        &runner,
        &fetcher,
        &revision,
        &ObservedState::default(),
        &BTreeMap::new(),
        5,
    )
    .await
    .unwrap();

    assert!(output.is_fatal());
    assert!(output.fatal.as_deref().unwrap().contains("two"));
    assert!(output.fatal.as_deref().unwrap().contains("boom"));
    // Only step one's desired state survives; step two ran, step three
    // never did.
    assert_eq!(runner.invocation_count(), 2);
    assert!(output.desired.get("db").is_some());
    assert!(output.desired.get("cache").is_none());
}

#[tokio::test]
async fn test_later_steps_overwrite_same_named_entries() {
    let first = response_with(vec![
        desired("db", json!({"kind": "DB", "spec": {"size": "small"}})),
        desired("cache", json!({"kind": "Cache"})),
    ]);
    let second = response_with(vec![desired(
        "db",
        json!({"kind": "DB", "spec": {"size": "large"}}),
    )]);
    let runner = ScriptedRunner::new(vec![first, second]);
    let fetcher = CountingFetcher::default();
    let revision = revision_with_steps(vec![step("one"), step("two")]);

    let output = run(
        &runner,
        &fetcher,
        &revision,
        &ObservedState::default(),
        &BTreeMap::new(),
        5,
    )
    .await
    .unwrap();

    // Overwritten in place: order of first appearance is preserved.
    let names: Vec<_> = output.desired.resources.iter().map(|r| r.name.as_str()).collect();
    assert_eq!(names, vec!["db", "cache"]);
    assert_eq!(
        output.desired.get("db").unwrap().resource["spec"]["size"],
        json!("large")
    );
}

#[tokio::test]
async fn test_context_threads_across_steps_last_writer_wins() {
    let first = RunFunctionResponse {
        context: BTreeMap::from([
            ("region".to_string(), json!("eu-1")),
            ("zone".to_string(), json!("a")),
        ]),
        ..Default::default()
    };
    let second = RunFunctionResponse {
        context: BTreeMap::from([("region".to_string(), json!("us-2"))]),
        ..Default::default()
    };
    let runner = ScriptedRunner::new(vec![first, second]);
    let fetcher = CountingFetcher::default();
    let revision = revision_with_steps(vec![step("one"), step("two")]);

    let output = run(
        &runner,
        &fetcher,
        &revision,
        &ObservedState::default(),
        &BTreeMap::new(),
        5,
    )
    .await
    .unwrap();

    assert_eq!(output.context["region"], json!("us-2"));
    assert_eq!(output.context["zone"], json!("a"));

    // The second step saw the first step's context.
    let requests = runner.requests.lock().unwrap();
    assert_eq!(requests[1].context["region"], json!("eu-1"));
}

#[tokio::test]
async fn test_connection_details_later_steps_win_per_key() {
    let first = RunFunctionResponse {
        connection_details: BTreeMap::from([
            ("host".to_string(), b"old".to_vec()),
            ("user".to_string(), b"admin".to_vec()),
        ]),
        ..Default::default()
    };
    let second = RunFunctionResponse {
        connection_details: BTreeMap::from([("host".to_string(), b"new".to_vec())]),
        ..Default::default()
    };
    let runner = ScriptedRunner::new(vec![first, second]);
    let fetcher = CountingFetcher::default();
    let revision = revision_with_steps(vec![step("one"), step("two")]);

    let output = run(
        &runner,
        &fetcher,
        &revision,
        &ObservedState::default(),
        &BTreeMap::new(),
        5,
    )
    .await
    .unwrap();

    assert_eq!(output.connection_details["host"], b"new".to_vec());
    assert_eq!(output.connection_details["user"], b"admin".to_vec());
}

#[tokio::test]
async fn test_duplicate_template_names_in_one_response_fail() {
    let dup = response_with(vec![
        desired("db", json!({"kind": "DB"})),
        desired("db", json!({"kind": "DB"})),
    ]);
    let runner = ScriptedRunner::new(vec![dup]);
    let fetcher = CountingFetcher::default();
    let revision = revision_with_steps(vec![step("mk")]);

    let err = run(
        &runner,
        &fetcher,
        &revision,
        &ObservedState::default(),
        &BTreeMap::new(),
        5,
    )
    .await
    .unwrap_err();

    assert!(matches!(err, EngineError::FunctionContract { .. }));
    assert!(err.to_string().contains("duplicate template name"));
}

#[tokio::test]
async fn test_resources_mode_renders_templates_without_functions() {
    let revision = CompositionRevisionSpec {
        revision: 1,
        composite_type_ref: TypeReference {
            api_version: "example.org/v1".to_string(),
            kind: "App".to_string(),
        },
        mode: CompositionMode::Resources,
        pipeline: None,
        resources: Some(vec![
            ComposedTemplate {
                name: Some("db".to_string()),
                base: json!({"apiVersion": "db.example.org/v1", "kind": "DB"}),
                patches: vec![],
                readiness_checks: None,
                connection_details: None,
                deletion_policy: None,
            },
            ComposedTemplate {
                name: Some("cache".to_string()),
                base: json!({"apiVersion": "cache.example.org/v1", "kind": "Cache"}),
                patches: vec![],
                readiness_checks: None,
                connection_details: None,
                deletion_policy: None,
            },
        ]),
        patch_sets: None,
        write_connection_secrets_to_namespace: None,
    };

    // The runner must never be called in Resources mode.
    let runner = ScriptedRunner::new(vec![]);
    let fetcher = CountingFetcher::default();

    let output = run(
        &runner,
        &fetcher,
        &revision,
        &ObservedState::default(),
        &BTreeMap::new(),
        5,
    )
    .await
    .unwrap();

    assert_eq!(runner.invocation_count(), 0);
    let names: Vec<_> = output.desired.resources.iter().map(|r| r.name.as_str()).collect();
    assert_eq!(names, vec!["db", "cache"]);
}

#[tokio::test]
async fn test_anonymous_templates_key_by_positional_index() {
    let template = |kind: &str| ComposedTemplate {
        name: None,
        base: json!({"apiVersion": "example.org/v1", "kind": kind}),
        patches: vec![],
        readiness_checks: None,
        connection_details: None,
        deletion_policy: None,
    };
    let revision = CompositionRevisionSpec {
        revision: 1,
        composite_type_ref: TypeReference {
            api_version: "example.org/v1".to_string(),
            kind: "App".to_string(),
        },
        mode: CompositionMode::Resources,
        pipeline: None,
        resources: Some(vec![template("DB"), template("Cache")]),
        patch_sets: None,
        write_connection_secrets_to_namespace: None,
    };

    let runner = ScriptedRunner::new(vec![]);
    let fetcher = CountingFetcher::default();
    let output = run(
        &runner,
        &fetcher,
        &revision,
        &ObservedState::default(),
        &BTreeMap::new(),
        5,
    )
    .await
    .unwrap();

    let names: Vec<_> = output.desired.resources.iter().map(|r| r.name.as_str()).collect();
    assert_eq!(names, vec!["0", "1"]);
}
