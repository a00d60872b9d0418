// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error type tests for trigflow-platform.

use trigflow_platform::PlatformError;

#[test]
fn test_config_error_display() {
    let err = PlatformError::Config("missing base url".to_string());
    assert!(err.to_string().contains("configuration error"));
    assert!(err.to_string().contains("missing base url"));
}

#[test]
fn test_timeout_error_display() {
    let err = PlatformError::Timeout(5000);
    assert!(err.to_string().contains("timed out"));
    assert!(err.to_string().contains("5000"));
}

#[test]
fn test_server_error_display() {
    let err = PlatformError::Server {
        status: 500,
        message: "Internal error".to_string(),
    };
    let display = err.to_string();
    assert!(display.contains("server error"));
    assert!(display.contains("500"));
    assert!(display.contains("Internal error"));
}

#[test]
fn test_unresolved_reference_display() {
    let err = PlatformError::UnresolvedReference("param:welder:Quantity".to_string());
    assert!(err.to_string().contains("unresolved reference"));
    assert!(err.to_string().contains("param:welder:Quantity"));
}

#[test]
fn test_template_not_found_display() {
    let err = PlatformError::TemplateNotFound("surface-inspection".to_string());
    assert!(err.to_string().contains("template not found"));
    assert!(err.to_string().contains("surface-inspection"));
}

#[test]
fn test_transient_classification() {
    assert!(PlatformError::Connection("reset".to_string()).is_transient());
    assert!(PlatformError::Timeout(100).is_transient());
    assert!(
        PlatformError::Server {
            status: 503,
            message: String::new()
        }
        .is_transient()
    );
    assert!(
        !PlatformError::Server {
            status: 400,
            message: String::new()
        }
        .is_transient()
    );
    assert!(!PlatformError::RunNotFound("wf-1".to_string()).is_transient());
    assert!(!PlatformError::UnresolvedReference("x".to_string()).is_transient());
}

#[test]
fn test_from_serde_json_error() {
    let json_err = serde_json::from_str::<serde_json::Value>("{invalid").unwrap_err();
    let err: PlatformError = json_err.into();
    assert!(matches!(err, PlatformError::Serialization(_)));
}

#[test]
fn test_from_io_error() {
    let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file missing");
    let err: PlatformError = io_err.into();
    assert!(matches!(err, PlatformError::InvalidInput(_)));
    assert!(err.to_string().contains("file missing"));
}
