// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

#![allow(unexpected_cfgs)]

//! # Loomy - Composite Resource Reconciliation Engine for Kubernetes
//!
//! Loomy reconciles user-defined composite resources: a
//! `CompositeResourceDefinition` declares a new abstract resource type, a
//! `Composition` describes how to synthesize its composed resources, and
//! the engine converges every composite instance toward the pipeline's
//! desired state.
//!
//! ## Overview
//!
//! This library provides the core functionality for the Loomy engine,
//! including:
//!
//! - Custom Resource Definitions for definitions, Compositions, and
//!   revisions
//! - The composition pipeline runner with extra-resource stabilization
//! - The composed-resource lifecycle: association, apply, readiness, and
//!   orphan handling
//! - The patch and transform engine
//! - Connection-detail aggregation and secret publication
//!
//! ## Modules
//!
//! - [`crd`] - Custom Resource Definition types
//! - [`reconcilers`] - reconciliation logic for each resource type
//! - [`pipeline`] - the composition-function pipeline runner
//! - [`patches`] / [`transforms`] - the patch and transform engine
//! - [`composed`] - composed-resource association and rendering
//!
//! ## Example
//!
//! ```rust
//! use loomy::transforms::{MapTransform, Transform};
//! use serde_json::json;
//! use std::collections::BTreeMap;
//!
//! // Map a composite's tier to a concrete instance class.
//! let transform = Transform::Map(MapTransform {
//!     pairs: BTreeMap::from([
//!         ("small".to_string(), json!("db.t3.micro")),
//!         ("large".to_string(), json!("db.m5.xlarge")),
//!     ]),
//! });
//! assert_eq!(transform.resolve(&json!("small")).unwrap(), json!("db.t3.micro"));
//! ```
//!
//! ## Features
//!
//! - **Dynamic Types** - composites are user-defined; the engine serves
//!   them through dynamic controllers started per established definition
//! - **Immutable Revisions** - Compositions are snapshotted; composites
//!   bind to revisions and re-reconcile on rotation
//! - **Pluggable Functions** - in-process or remote, behind one capability
//! - **Status Tracking** - full `Synced`/`Ready` condition reporting

pub mod api;
pub mod composed;
pub mod composite;
pub mod connection;
pub mod constants;
pub mod context;
pub mod crd;
pub mod errors;
pub mod fieldpath;
pub mod labels;
pub mod metrics;
pub mod patches;
pub mod pipeline;
pub mod readiness;
pub mod reconcilers;
pub mod revisions;
pub mod transforms;
pub mod validation;
