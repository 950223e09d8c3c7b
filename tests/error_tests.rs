//! Tests for error types.
//!
//! Validates display formatting, configuration classification and the exit
//! code contract.

use ocilaunch::error::LAUNCHER_FAILURE_EXIT_CODE;
use ocilaunch::Error;
use std::path::PathBuf;
use std::time::Duration;

// =============================================================================
// Configuration Error Tests
// =============================================================================

#[test]
fn test_unsupported_options_display() {
    let err = Error::UnsupportedOptions {
        launcher: "oci".to_string(),
        options: vec!["Writable".to_string(), "Boot".to_string()],
    };
    assert_eq!(err.to_string(), "not supported by oci launcher: Writable,Boot");
}

#[test]
fn test_invalid_bind_display() {
    let err = Error::InvalidBind {
        spec: "/a:/b".to_string(),
        reason: "cannot stat bind source /a".to_string(),
    };
    let msg = err.to_string();
    assert!(msg.contains("/a:/b"), "should include the request");
    assert!(msg.contains("cannot stat"), "should include the reason");
}

#[test]
fn test_configuration_classification() {
    let configuration = [
        Error::Configuration("x".to_string()),
        Error::UnsupportedOptions {
            launcher: "oci".to_string(),
            options: vec!["Boot".to_string()],
        },
        Error::InvalidBind {
            spec: "s".to_string(),
            reason: "r".to_string(),
        },
        Error::WorkDirNotFound {
            path: "/w".to_string(),
        },
        Error::InvalidImageReference {
            reference: "x://y".to_string(),
            reason: "r".to_string(),
        },
    ];
    for err in &configuration {
        assert!(err.is_configuration(), "{:?}", err);
    }

    let other = [
        Error::FetchFailed {
            reference: "docker://a".to_string(),
            reason: "r".to_string(),
        },
        Error::BundleBuildFailed("b".to_string()),
        Error::Cancelled("fetch".to_string()),
        Error::Internal("i".to_string()),
    ];
    for err in &other {
        assert!(!err.is_configuration(), "{:?}", err);
    }
}

// =============================================================================
// Image and bundle errors
// =============================================================================

#[test]
fn test_image_too_large_display() {
    let err = Error::ImageTooLarge {
        size: 2048,
        limit: 1024,
    };
    let msg = err.to_string();
    assert!(msg.contains("2048"));
    assert!(msg.contains("1024"));
}

#[test]
fn test_invalid_bundle_display() {
    let err = Error::InvalidBundle {
        path: PathBuf::from("/tmp/oci-bundle-1"),
        reason: "image has not been fetched yet".to_string(),
    };
    assert!(err.to_string().contains("/tmp/oci-bundle-1"));
}

#[test]
fn test_timeout_display() {
    let err = Error::Timeout {
        operation: "pull manifest".to_string(),
        duration: Duration::from_secs(300),
    };
    let msg = err.to_string();
    assert!(msg.contains("pull manifest"));
    assert!(msg.contains("300"));
}

// =============================================================================
// Conversions and exit codes
// =============================================================================

#[test]
fn test_io_error_conversion() {
    let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
    let err: Error = io.into();
    assert!(matches!(err, Error::Io(_)));
}

#[test]
fn test_json_error_conversion() {
    let json = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
    let err: Error = json.into();
    assert!(matches!(err, Error::Serialization(_)));
}

#[test]
fn test_every_error_exits_with_launcher_failure_code() {
    let errors = [
        Error::Configuration("c".to_string()),
        Error::RuntimeExec {
            runtime: "runc".to_string(),
            id: "c1".to_string(),
            reason: "r".to_string(),
        },
        Error::Cancelled("extract".to_string()),
    ];
    for err in &errors {
        assert_eq!(err.exit_code(), LAUNCHER_FAILURE_EXIT_CODE);
    }
    assert_eq!(LAUNCHER_FAILURE_EXIT_CODE, 255);
}

#[test]
fn test_error_is_send_and_sync() {
    fn assert_send_sync<T: Send + Sync>() {}
    assert_send_sync::<Error>();
}
