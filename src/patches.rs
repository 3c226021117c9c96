// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Declarative patches between composite and composed resources.
//!
//! A patch copies a value from a field path on one document to a field path
//! on another, optionally folding it through a transform pipeline on the
//! way. Patches are directional:
//!
//! - `FromComposite` / `CombineFromComposite` flow composite -> composed and
//!   run while rendering a composed resource.
//! - `ToComposite` / `CombineToComposite` flow composed -> composite and run
//!   after the composed resource has been applied and observed.
//! - `PatchSet` is a macro reference expanded against the Composition's
//!   named patch sets before any patch runs. Patch sets cannot reference
//!   other patch sets.
//!
//! Patches default to optional: an absent source path skips the patch
//! silently and leaves the target untouched. Patches marked required fail
//! the render instead.

use crate::fieldpath::{self, FieldPathError};
use crate::transforms::{format_values, Transform, TransformError};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Errors raised while applying a single patch.
#[derive(Error, Debug)]
pub enum PatchError {
    /// A transform in the patch's pipeline failed. The index locates the
    /// failing transform within the patch.
    #[error("transform {index}: {source}")]
    Transform {
        /// Position of the failing transform
        index: usize,
        /// The transform failure
        #[source]
        source: TransformError,
    },

    /// A required source path was absent.
    #[error("required field path {path:?} is absent")]
    RequiredFieldAbsent {
        /// The missing path
        path: String,
    },

    /// A field path failed to parse or traverse.
    #[error(transparent)]
    FieldPath(#[from] FieldPathError),

    /// A combine patch declared no variables.
    #[error("combine patch has no variables")]
    EmptyCombineVariables,

    /// A `PatchSet` reference did not resolve against the Composition.
    #[error("patch set {name:?} is not defined")]
    UnresolvedPatchSet {
        /// The referenced set name
        name: String,
    },

    /// A patch set contained a nested `PatchSet` reference.
    #[error("patch set {name:?} contains a nested patch-set reference")]
    NestedPatchSet {
        /// The offending set name
        name: String,
    },
}

/// A [`PatchError`] wrapped with the index of the patch that raised it.
///
/// Surfaced errors read like `patch 0: transform 0: math transform input is
/// not an integer`; the composed-resource layer adds the template name.
#[derive(Error, Debug)]
#[error("patch {index}: {source}")]
pub struct IndexedPatchError {
    /// Position of the failing patch in the (expanded) patch list
    pub index: usize,
    /// The underlying patch failure
    #[source]
    pub source: PatchError,
}

/// Whether an absent source path skips the patch or fails it.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub enum FromFieldPathPolicy {
    /// Skip the patch silently when the source is absent.
    #[default]
    Optional,
    /// Fail the render when the source is absent.
    Required,
}

/// Per-patch policies.
#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PatchPolicy {
    /// Policy for absent source paths; defaults to `Optional`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_field_path: Option<FromFieldPathPolicy>,
}

impl PatchPolicy {
    fn is_required(&self) -> bool {
        self.from_field_path == Some(FromFieldPathPolicy::Required)
    }
}

/// A single-path patch: copy one field path, transformed, to a destination.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FieldPatch {
    /// Source field path on the patch's source document.
    pub from_field_path: String,

    /// Destination field path; defaults to the source path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_field_path: Option<String>,

    /// Transforms folded over the extracted value, in order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub transforms: Vec<Transform>,

    /// Patch policies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<PatchPolicy>,
}

/// One input of a combine patch.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CombineVariable {
    /// Source field path for this variable.
    pub from_field_path: String,
}

/// How combined variables are merged into one value.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", tag = "strategy")]
pub enum CombineStrategy {
    /// Apply a printf-style format string over the collected inputs.
    String {
        /// The format string; one verb per variable.
        fmt: String,
    },
}

/// A multi-path patch combining several source paths into one destination.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CombinePatch {
    /// The variables to collect, in format-argument order.
    pub variables: Vec<CombineVariable>,

    /// The combine strategy.
    #[serde(flatten)]
    pub strategy: CombineStrategy,

    /// Destination field path. Required; combine patches have no default.
    pub to_field_path: String,

    /// Patch policies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<PatchPolicy>,
}

/// A declarative copy-with-transforms between composite and composed.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum Patch {
    /// Copy a composite field to the composed resource.
    FromComposite(FieldPatch),
    /// Copy a composed field back to the composite.
    ToComposite(FieldPatch),
    /// Combine composite fields into one composed field.
    CombineFromComposite(CombinePatch),
    /// Combine composed fields into one composite field.
    CombineToComposite(CombinePatch),
    /// Expand a named patch set declared on the Composition.
    PatchSet {
        /// Name of the patch set to expand.
        patch_set_name: String,
    },
}

/// A named, reusable list of patches declared once per Composition.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PatchSet {
    /// The name `Patch::PatchSet` references.
    pub name: String,
    /// The patches the reference expands to.
    pub patches: Vec<Patch>,
}

/// Expand `PatchSet` references against the Composition's named sets.
///
/// Expansion is depth-1 only: a set containing another `PatchSet` reference
/// is an error (also rejected by validation).
///
/// # Errors
///
/// Returns [`PatchError::UnresolvedPatchSet`] for unknown names and
/// [`PatchError::NestedPatchSet`] for nested references.
pub fn expand_patch_sets(patches: &[Patch], sets: &[PatchSet]) -> Result<Vec<Patch>, PatchError> {
    let mut expanded = Vec::with_capacity(patches.len());
    for patch in patches {
        if let Patch::PatchSet { patch_set_name } = patch {
            let set = sets
                .iter()
                .find(|s| &s.name == patch_set_name)
                .ok_or_else(|| PatchError::UnresolvedPatchSet {
                    name: patch_set_name.clone(),
                })?;
            for member in &set.patches {
                if matches!(member, Patch::PatchSet { .. }) {
                    return Err(PatchError::NestedPatchSet {
                        name: set.name.clone(),
                    });
                }
                expanded.push(member.clone());
            }
        } else {
            expanded.push(patch.clone());
        }
    }
    Ok(expanded)
}

/// Extract the source value for a single-path patch and fold its transforms.
///
/// Returns `Ok(None)` when the source is absent and the patch is optional.
fn resolve_field_patch(patch: &FieldPatch, source: &Value) -> Result<Option<Value>, PatchError> {
    let Some(found) = fieldpath::get(source, &patch.from_field_path)? else {
        if patch.policy.as_ref().is_some_and(PatchPolicy::is_required) {
            return Err(PatchError::RequiredFieldAbsent {
                path: patch.from_field_path.clone(),
            });
        }
        return Ok(None);
    };

    let mut value = found.clone();
    for (index, transform) in patch.transforms.iter().enumerate() {
        value = transform
            .resolve(&value)
            .map_err(|source| PatchError::Transform { index, source })?;
    }
    Ok(Some(value))
}

/// Collect combine-variable values and apply the combine strategy.
///
/// Returns `Ok(None)` when any variable is absent and the patch is
/// optional; required combine patches fail on the first absent variable.
fn resolve_combine_patch(patch: &CombinePatch, source: &Value) -> Result<Option<Value>, PatchError> {
    if patch.variables.is_empty() {
        return Err(PatchError::EmptyCombineVariables);
    }

    let mut inputs = Vec::with_capacity(patch.variables.len());
    for variable in &patch.variables {
        match fieldpath::get(source, &variable.from_field_path)? {
            Some(v) => inputs.push(v.clone()),
            None => {
                if patch.policy.as_ref().is_some_and(PatchPolicy::is_required) {
                    return Err(PatchError::RequiredFieldAbsent {
                        path: variable.from_field_path.clone(),
                    });
                }
                return Ok(None);
            }
        }
    }

    match &patch.strategy {
        CombineStrategy::String { fmt } => {
            let combined = format_values(fmt, &inputs).map_err(|source| {
                PatchError::Transform { index: 0, source }
            })?;
            Ok(Some(Value::String(combined)))
        }
    }
}

/// Apply one patch in the composite -> composed direction.
///
/// Patches of other directions are skipped silently; rendering a composed
/// resource walks the full patch list and only the `FromComposite` kinds
/// act.
///
/// # Errors
///
/// Propagates field-path, transform, and required-absence failures.
pub fn apply_to_composed(
    patch: &Patch,
    composite: &Value,
    composed: &mut Value,
) -> Result<(), PatchError> {
    match patch {
        Patch::FromComposite(p) => {
            if let Some(value) = resolve_field_patch(p, composite)? {
                let to = p.to_field_path.as_deref().unwrap_or(&p.from_field_path);
                fieldpath::set(composed, to, value)?;
            }
            Ok(())
        }
        Patch::CombineFromComposite(p) => {
            if let Some(value) = resolve_combine_patch(p, composite)? {
                fieldpath::set(composed, &p.to_field_path, value)?;
            }
            Ok(())
        }
        Patch::ToComposite(_) | Patch::CombineToComposite(_) | Patch::PatchSet { .. } => Ok(()),
    }
}

/// Apply one patch in the composed -> composite direction.
///
/// The inverse of [`apply_to_composed`]; only the `ToComposite` kinds act.
///
/// # Errors
///
/// Propagates field-path, transform, and required-absence failures.
pub fn apply_to_composite(
    patch: &Patch,
    composed: &Value,
    composite: &mut Value,
) -> Result<(), PatchError> {
    match patch {
        Patch::ToComposite(p) => {
            if let Some(value) = resolve_field_patch(p, composed)? {
                let to = p.to_field_path.as_deref().unwrap_or(&p.from_field_path);
                fieldpath::set(composite, to, value)?;
            }
            Ok(())
        }
        Patch::CombineToComposite(p) => {
            if let Some(value) = resolve_combine_patch(p, composed)? {
                fieldpath::set(composite, &p.to_field_path, value)?;
            }
            Ok(())
        }
        Patch::FromComposite(_) | Patch::CombineFromComposite(_) | Patch::PatchSet { .. } => {
            Ok(())
        }
    }
}

/// Run every composite -> composed patch in order, wrapping failures with
/// the patch index.
///
/// # Errors
///
/// Returns the first failure as an [`IndexedPatchError`].
pub fn apply_all_to_composed(
    patches: &[Patch],
    composite: &Value,
    composed: &mut Value,
) -> Result<(), IndexedPatchError> {
    for (index, patch) in patches.iter().enumerate() {
        apply_to_composed(patch, composite, composed)
            .map_err(|source| IndexedPatchError { index, source })?;
    }
    Ok(())
}

/// Run every composed -> composite patch in order, wrapping failures with
/// the patch index.
///
/// # Errors
///
/// Returns the first failure as an [`IndexedPatchError`].
pub fn apply_all_to_composite(
    patches: &[Patch],
    composed: &Value,
    composite: &mut Value,
) -> Result<(), IndexedPatchError> {
    for (index, patch) in patches.iter().enumerate() {
        apply_to_composite(patch, composed, composite)
            .map_err(|source| IndexedPatchError { index, source })?;
    }
    Ok(())
}

#[cfg(test)]
#[path = "patches_tests.rs"]
mod patches_tests;
