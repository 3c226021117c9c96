// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! CompositeResourceDefinition establishment.
//!
//! A definition declares a new composite resource type. This reconciler
//! validates the definition and marks it `Established`; the operator's main
//! loop starts a dynamic composite controller for every established
//! definition. CRD publication to the API server is the responsibility of
//! an external collaborator.

use crate::crd::{CompositeResourceDefinition, Condition};
use crate::reconcilers::status::{create_condition, CONDITION_TYPE_ESTABLISHED};
use crate::validation::validate_definition;
use anyhow::Result;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client, ResourceExt};
use serde_json::json;
use tracing::{debug, info, warn};

/// The group/version/kind a definition serves, for starting its composite
/// controller.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DefinedType {
    /// API version (`group/version`) of the defined type.
    pub api_version: String,

    /// Kind of the defined type.
    pub kind: String,

    /// The definition's default Composition, when declared.
    pub default_composition: Option<String>,
}

/// Reconcile one definition: validate it and report `Established`.
///
/// Returns the defined type when the definition is established, so the
/// caller can ensure a composite controller is running for it.
///
/// # Errors
///
/// Returns an error when the status update fails; the controller requeues
/// with backoff.
pub async fn reconcile_definition(
    client: Client,
    xrd: CompositeResourceDefinition,
) -> Result<Option<DefinedType>> {
    let name = xrd.name_any();
    debug!(definition = %name, "Reconciling composite resource definition");

    // Spec unchanged and already established: skip the status rewrite but
    // still hand the defined type back so its controller is ensured.
    let observed = xrd.status.as_ref().and_then(|s| s.observed_generation);
    if !crate::reconcilers::should_reconcile(xrd.metadata.generation, observed) {
        let established = xrd
            .status
            .as_ref()
            .and_then(|s| s.conditions.as_ref())
            .and_then(|c| {
                crate::reconcilers::status::find_condition(c, CONDITION_TYPE_ESTABLISHED)
            })
            .is_some_and(|c| c.status == "True");
        if established {
            debug!(definition = %name, "Spec unchanged, skipping revalidation");
            return Ok(defined_type(&xrd));
        }
    }

    let outcome = validate_definition(&xrd.spec);
    for warning in &outcome.warnings {
        warn!(definition = %name, warning = %warning, "Definition validation warning");
    }

    let condition = if outcome.has_errors() {
        warn!(
            definition = %name,
            errors = ?outcome.errors,
            "Definition failed validation"
        );
        create_condition(
            CONDITION_TYPE_ESTABLISHED,
            "False",
            "ValidationFailed",
            &outcome.errors.join("; "),
        )
    } else {
        create_condition(
            CONDITION_TYPE_ESTABLISHED,
            "True",
            "EngineRunning",
            "Composite controller can serve this type",
        )
    };

    update_status(&client, &xrd, condition).await?;

    if outcome.has_errors() {
        return Ok(None);
    }

    if let Some(defined) = defined_type(&xrd) {
        info!(definition = %name, kind = %defined.kind, "Definition established");
        return Ok(Some(defined));
    }
    Ok(None)
}

/// The served type of an established definition, preferring the
/// referenceable version.
fn defined_type(xrd: &CompositeResourceDefinition) -> Option<DefinedType> {
    let version = xrd
        .spec
        .versions
        .iter()
        .find(|v| v.referenceable)
        .or_else(|| xrd.spec.versions.first())?;

    Some(DefinedType {
        api_version: format!("{}/{}", xrd.spec.group, version.name),
        kind: xrd.spec.names.kind.clone(),
        default_composition: xrd.spec.default_composition_ref.clone(),
    })
}

/// Write the `Established` condition and observed generation.
async fn update_status(
    client: &Client,
    xrd: &CompositeResourceDefinition,
    condition: Condition,
) -> Result<()> {
    let name = xrd.name_any();
    let api: Api<CompositeResourceDefinition> = Api::all(client.clone());

    // Preserve unrelated condition types already on the definition.
    let mut conditions: Vec<Condition> = xrd
        .status
        .as_ref()
        .and_then(|s| s.conditions.clone())
        .unwrap_or_default();
    conditions.retain(|c| c.r#type != condition.r#type);
    conditions.push(condition);

    let patch = json!({
        "status": {
            "conditions": conditions,
            "observedGeneration": xrd.metadata.generation,
        }
    });

    api.patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
        .await?;

    Ok(())
}
