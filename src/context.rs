// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Shared context for all controllers with reflector stores.
//!
//! All controllers receive an `Arc<Context>` carrying the Kubernetes client
//! and reflector stores for the Loomy CRD types. The stores enable O(1)
//! in-memory lookups - composition selection and revision resolution never
//! have to hit the API from a watch mapper.

use crate::crd::{Composition, CompositionRevision, CompositeResourceDefinition, LabelSelector};
use crate::labels::REVISION_COMPOSITION_LABEL;
use kube::runtime::reflector::Store;
use kube::{Client, ResourceExt};
use std::sync::Arc;

/// Shared context passed to all controllers.
#[derive(Clone)]
pub struct Context {
    /// Kubernetes client for API operations
    pub client: Client,

    /// Reflector stores for the Loomy CRD types
    pub stores: Stores,
}

/// Collection of reflector stores for cross-controller queries.
///
/// Each store is populated by a dedicated reflector task and provides
/// in-memory access to resources without API calls.
#[derive(Clone)]
pub struct Stores {
    /// All composite resource definitions
    pub definitions: Store<CompositeResourceDefinition>,

    /// All Compositions
    pub compositions: Store<Composition>,

    /// All CompositionRevisions
    pub revisions: Store<CompositionRevision>,
}

impl Stores {
    /// Get a Composition by name from the store.
    #[must_use]
    pub fn get_composition(&self, name: &str) -> Option<Arc<Composition>> {
        self.compositions
            .state()
            .iter()
            .find(|c| c.name_any() == name)
            .cloned()
    }

    /// Compositions matching a label selector and targeting the given
    /// composite type.
    #[must_use]
    pub fn compositions_matching(
        &self,
        selector: &LabelSelector,
        api_version: &str,
        kind: &str,
    ) -> Vec<Arc<Composition>> {
        self.compositions
            .state()
            .iter()
            .filter(|c| {
                c.spec.composite_type_ref.api_version == api_version
                    && c.spec.composite_type_ref.kind == kind
                    && selector.matches(c.labels())
            })
            .cloned()
            .collect()
    }

    /// All revisions cut for a Composition, unordered.
    #[must_use]
    pub fn revisions_for(&self, composition_name: &str) -> Vec<Arc<CompositionRevision>> {
        self.revisions
            .state()
            .iter()
            .filter(|r| {
                r.labels().get(REVISION_COMPOSITION_LABEL).map(String::as_str)
                    == Some(composition_name)
            })
            .cloned()
            .collect()
    }

    /// The highest-numbered revision cut for a Composition.
    #[must_use]
    pub fn latest_revision_for(&self, composition_name: &str) -> Option<Arc<CompositionRevision>> {
        self.revisions_for(composition_name)
            .into_iter()
            .max_by_key(|r| r.spec.revision)
    }
}

#[cfg(test)]
#[path = "context_tests.rs"]
mod context_tests;
