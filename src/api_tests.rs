// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Unit tests for `api.rs`

use crate::api::{parse_gvk, selector_gvk, ResourceKey};
use crate::crd::ResourceSelector;

#[test]
fn test_resource_key_display() {
    let namespaced = ResourceKey::new("db", Some("prod"));
    assert_eq!(namespaced.to_string(), "prod/db");

    let cluster_scoped = ResourceKey::new("app", None);
    assert_eq!(cluster_scoped.to_string(), "app");
}

#[test]
fn test_parse_gvk_with_group() {
    let gvk = parse_gvk("example.org/v1", "App").unwrap();
    assert_eq!(gvk.group, "example.org");
    assert_eq!(gvk.version, "v1");
    assert_eq!(gvk.kind, "App");
}

#[test]
fn test_parse_gvk_core_group() {
    let gvk = parse_gvk("v1", "Secret").unwrap();
    assert_eq!(gvk.group, "");
    assert_eq!(gvk.version, "v1");
    assert_eq!(gvk.kind, "Secret");
}

#[test]
fn test_parse_gvk_rejects_extra_slashes() {
    assert!(parse_gvk("a/b/c", "Kind").is_err());
}

#[test]
fn test_selector_gvk() {
    let selector = ResourceSelector {
        api_version: "example.org/v1".to_string(),
        kind: "Environment".to_string(),
        match_name: Some("prod".to_string()),
        match_labels: None,
        namespace: None,
    };
    let gvk = selector_gvk(&selector).unwrap();
    assert_eq!(gvk.kind, "Environment");
}
