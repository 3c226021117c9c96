// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Unit tests for `errors.rs`

use crate::errors::EngineError;

#[test]
fn test_transient_errors_are_retryable() {
    let err = EngineError::transient("get composite", "connection reset");
    assert!(err.is_transient());
    assert_eq!(err.status_reason(), "Transient");
}

#[test]
fn test_validation_errors_are_not_retryable() {
    let err = EngineError::Validation {
        subject: "example-composition".to_string(),
        reason: "pipeline must not be empty".to_string(),
    };
    assert!(!err.is_transient());
    assert_eq!(err.status_reason(), "Validation");
}

#[test]
fn test_function_execution_is_retryable() {
    let err = EngineError::FunctionExecution {
        step: "render".to_string(),
        reason: "function crashed".to_string(),
    };
    assert!(err.is_transient());
    assert_eq!(err.status_reason(), "FunctionExecution");
}

#[test]
fn test_stabilization_failure_is_a_contract_error() {
    let err = EngineError::extra_resources_did_not_stabilize("lookup", 5);
    assert!(err.is_transient());
    assert_eq!(err.status_reason(), "FunctionContract");
    assert!(err.to_string().contains("did not stabilize after 5"));
}

#[test]
fn test_dependency_error_message_names_the_object() {
    let err = EngineError::Dependency {
        kind: "Composition".to_string(),
        name: "app-composition".to_string(),
        reason: "not found".to_string(),
    };
    assert!(err.is_transient());
    assert_eq!(err.status_reason(), "Dependency");
    assert!(err.to_string().contains("app-composition"));
}

#[test]
fn test_internal_errors_are_not_retryable() {
    let err = EngineError::Internal("ref without template name".to_string());
    assert!(!err.is_transient());
    assert_eq!(err.status_reason(), "Internal");
}
