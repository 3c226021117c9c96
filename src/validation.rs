// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Validation of Compositions and CompositeResourceDefinitions.
//!
//! A Composition that cannot be safely executed is rejected before the
//! pipeline ever runs. Validation produces two severities: warnings are
//! logged and reconciliation proceeds; errors abort the reconcile and land
//! on the composite as a `Synced=False, Reason=Validation` condition.
//!
//! The same rules back the validation webhook surface; only the transport
//! is external.

use crate::crd::{
    ComposedTemplate, CompositeResourceDefinitionSpec, CompositionMode, CompositionSpec,
    CredentialsSource, PipelineStep,
};
use crate::patches::{CombinePatch, Patch, PatchSet};
use std::collections::BTreeSet;

/// The outcome of validating one object.
#[derive(Clone, Debug, Default)]
pub struct ValidationOutcome {
    /// Non-fatal findings; logged, reconciliation proceeds.
    pub warnings: Vec<String>,

    /// Fatal findings; the reconcile aborts.
    pub errors: Vec<String>,
}

impl ValidationOutcome {
    /// Whether any fatal finding was recorded.
    #[must_use]
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    fn error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }
}

/// Validate a Composition spec.
#[must_use]
pub fn validate_composition(spec: &CompositionSpec) -> ValidationOutcome {
    let mut outcome = ValidationOutcome::default();

    match spec.mode {
        CompositionMode::Pipeline => {
            validate_pipeline(spec.pipeline.as_deref(), &mut outcome);
            if spec.resources.is_some() {
                outcome.warn("resources are ignored in Pipeline mode");
            }
        }
        CompositionMode::Resources => {
            validate_templates(
                spec.resources.as_deref(),
                spec.patch_sets.as_deref().unwrap_or_default(),
                &mut outcome,
            );
            if spec.pipeline.is_some() {
                outcome.warn("pipeline is ignored in Resources mode");
            }
        }
    }

    validate_patch_sets(spec.patch_sets.as_deref().unwrap_or_default(), &mut outcome);

    outcome
}

/// Pipeline-mode rules: a non-empty pipeline, unique step names, and
/// well-formed credentials.
fn validate_pipeline(pipeline: Option<&[PipelineStep]>, outcome: &mut ValidationOutcome) {
    let Some(steps) = pipeline.filter(|p| !p.is_empty()) else {
        outcome.error("pipeline must not be empty in Pipeline mode");
        return;
    };

    let mut names = BTreeSet::new();
    for step in steps {
        if !names.insert(step.step.as_str()) {
            outcome.error(format!("duplicate pipeline step name {:?}", step.step));
        }

        let mut credential_names = BTreeSet::new();
        for credential in step.credentials.as_deref().unwrap_or_default() {
            if !credential_names.insert(credential.name.as_str()) {
                outcome.error(format!(
                    "step {:?}: duplicate credential name {:?}",
                    step.step, credential.name
                ));
            }
            if credential.source == CredentialsSource::Secret && credential.secret_ref.is_none() {
                outcome.error(format!(
                    "step {:?}: credential {:?} has source Secret but no secretRef",
                    step.step, credential.name
                ));
            }
        }
    }
}

/// Resources-mode rules: all-or-none naming, unique names, resolvable
/// patches.
fn validate_templates(
    templates: Option<&[ComposedTemplate]>,
    patch_sets: &[PatchSet],
    outcome: &mut ValidationOutcome,
) {
    let Some(templates) = templates.filter(|t| !t.is_empty()) else {
        outcome.error("resources must not be empty in Resources mode");
        return;
    };

    let named = templates.iter().filter(|t| t.name.is_some()).count();
    if named != 0 && named != templates.len() {
        outcome.error("either all resource templates must be named or none");
    }

    let mut names = BTreeSet::new();
    for (index, template) in templates.iter().enumerate() {
        if let Some(name) = &template.name {
            if !names.insert(name.as_str()) {
                outcome.error(format!("duplicate resource template name {name:?}"));
            }
        }
        for (patch_index, patch) in template.patches.iter().enumerate() {
            let subject = match &template.name {
                Some(name) => format!("template {name:?} patch {patch_index}"),
                None => format!("template {index} patch {patch_index}"),
            };
            validate_patch(patch, patch_sets, &subject, outcome);
        }
    }
}

/// Per-patch rules shared by templates and patch sets.
fn validate_patch(
    patch: &Patch,
    patch_sets: &[PatchSet],
    subject: &str,
    outcome: &mut ValidationOutcome,
) {
    match patch {
        Patch::PatchSet { patch_set_name } => {
            match patch_sets.iter().find(|s| &s.name == patch_set_name) {
                None => outcome.error(format!("{subject}: patch set {patch_set_name:?} is not defined")),
                Some(set) => {
                    if set
                        .patches
                        .iter()
                        .any(|p| matches!(p, Patch::PatchSet { .. }))
                    {
                        outcome.error(format!(
                            "{subject}: patch set {patch_set_name:?} nests another patch set"
                        ));
                    }
                }
            }
        }
        Patch::CombineFromComposite(combine) | Patch::CombineToComposite(combine) => {
            validate_combine(combine, subject, outcome);
        }
        // Single-path patches carry their required fromFieldPath by
        // construction.
        Patch::FromComposite(_) | Patch::ToComposite(_) => {}
    }
}

fn validate_combine(combine: &CombinePatch, subject: &str, outcome: &mut ValidationOutcome) {
    if combine.variables.is_empty() {
        outcome.error(format!("{subject}: combine patch needs at least one variable"));
    }
    if combine.to_field_path.is_empty() {
        outcome.error(format!("{subject}: combine patch needs a toFieldPath"));
    }
}

/// Patch-set-level rules: no nesting, well-formed members.
fn validate_patch_sets(patch_sets: &[PatchSet], outcome: &mut ValidationOutcome) {
    let mut names = BTreeSet::new();
    for set in patch_sets {
        if !names.insert(set.name.as_str()) {
            outcome.error(format!("duplicate patch set name {:?}", set.name));
        }
        for (index, patch) in set.patches.iter().enumerate() {
            match patch {
                Patch::PatchSet { .. } => outcome.error(format!(
                    "patch set {:?}: member {index} is a nested patch-set reference",
                    set.name
                )),
                Patch::CombineFromComposite(combine) | Patch::CombineToComposite(combine) => {
                    validate_combine(
                        combine,
                        &format!("patch set {:?} member {index}", set.name),
                        outcome,
                    );
                }
                Patch::FromComposite(_) | Patch::ToComposite(_) => {}
            }
        }
    }
}

/// Validate a Composition update against its previous spec.
///
/// A Composition that flips its templates between named and anonymous mode
/// would silently rebind composed resources; the update is refused instead.
/// Reordering anonymous templates is refused for the same reason.
#[must_use]
pub fn validate_composition_update(old: &CompositionSpec, new: &CompositionSpec) -> Vec<String> {
    let mut errors = Vec::new();

    let naming = |spec: &CompositionSpec| -> Option<bool> {
        let templates = spec.resources.as_deref()?;
        if templates.is_empty() {
            return None;
        }
        Some(templates.iter().all(|t| t.name.is_some()))
    };

    match (naming(old), naming(new)) {
        (Some(old_named), Some(new_named)) if old_named != new_named => {
            errors.push(
                "cannot switch resource templates between named and anonymous mode".to_string(),
            );
        }
        (Some(false), Some(false)) => {
            // Anonymous mode binds by position; a reorder rebinds silently.
            let kinds = |spec: &CompositionSpec| -> Vec<String> {
                spec.resources
                    .as_deref()
                    .unwrap_or_default()
                    .iter()
                    .map(|t| {
                        t.base
                            .get("kind")
                            .and_then(serde_json::Value::as_str)
                            .unwrap_or_default()
                            .to_string()
                    })
                    .collect()
            };
            let old_kinds = kinds(old);
            let new_kinds = kinds(new);
            let mut old_sorted = old_kinds.clone();
            let mut new_sorted = new_kinds.clone();
            old_sorted.sort();
            new_sorted.sort();
            if old_kinds != new_kinds && old_sorted == new_sorted {
                errors.push("cannot reorder anonymous resource templates".to_string());
            }
        }
        _ => {}
    }

    errors
}

/// Validate a CompositeResourceDefinition at creation time.
#[must_use]
pub fn validate_definition(spec: &CompositeResourceDefinitionSpec) -> ValidationOutcome {
    let mut outcome = ValidationOutcome::default();

    if spec.versions.is_empty() {
        outcome.error("at least one version must be defined");
    }
    if !spec.versions.iter().any(|v| v.referenceable) {
        outcome.warn("no version is referenceable; Compositions cannot target this type");
    }

    if let Some(conversion) = &spec.conversion {
        if conversion.strategy == "Webhook" && conversion.webhook_client_config.is_none() {
            outcome.error(
                "spec.conversion.webhookClientConfig: required when strategy is Webhook",
            );
        }
    }

    outcome
}

/// Validate a CompositeResourceDefinition update against its previous spec.
///
/// Group, kind, and plural names - for both the composite and the claim -
/// are immutable after creation. Returns field-level errors.
#[must_use]
pub fn validate_definition_update(
    old: &CompositeResourceDefinitionSpec,
    new: &CompositeResourceDefinitionSpec,
) -> Vec<String> {
    let mut errors = Vec::new();

    if old.group != new.group {
        errors.push("spec.group: immutable".to_string());
    }
    if old.names.kind != new.names.kind {
        errors.push("spec.names.kind: immutable".to_string());
    }
    if old.names.plural != new.names.plural {
        errors.push("spec.names.plural: immutable".to_string());
    }

    if let (Some(old_claim), Some(new_claim)) = (&old.claim_names, &new.claim_names) {
        if old_claim.kind != new_claim.kind {
            errors.push("spec.claimNames.kind: immutable".to_string());
        }
        if old_claim.plural != new_claim.plural {
            errors.push("spec.claimNames.plural: immutable".to_string());
        }
    }

    if let Some(conversion) = &new.conversion {
        if conversion.strategy == "Webhook" && conversion.webhook_client_config.is_none() {
            errors.push(
                "spec.conversion.webhookClientConfig: required when strategy is Webhook"
                    .to_string(),
            );
        }
    }

    errors
}

#[cfg(test)]
#[path = "validation_tests.rs"]
mod validation_tests;
