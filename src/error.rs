//! Error types for the launcher.
//!
//! Every failure is wrapped with the phase that produced it. The container's
//! own exit code is never an error: [`crate::launcher::Launcher::exec`]
//! returns it as `Ok(code)`. Launcher-internal failures map to
//! [`LAUNCHER_FAILURE_EXIT_CODE`] instead.

use std::path::PathBuf;

/// Result type alias for launcher operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Exit code reported when the launcher itself fails (as opposed to the
/// container process exiting non-zero).
pub const LAUNCHER_FAILURE_EXIT_CODE: i32 = 255;

/// Errors that can occur while building and launching a container.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid launch configuration.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The active launcher cannot honour one or more requested options.
    #[error("not supported by {launcher} launcher: {}", options.join(","))]
    UnsupportedOptions {
        launcher: String,
        options: Vec<String>,
    },

    /// Malformed or unusable bind/mount request.
    #[error("invalid bind '{spec}': {reason}")]
    InvalidBind { spec: String, reason: String },

    /// Requested working directory is missing from the rootfs.
    #[error("working directory {path} does not exist in the container")]
    WorkDirNotFound { path: String },

    // =========================================================================
    // Identity Errors
    // =========================================================================
    /// Subordinate ID range missing or too small.
    #[error("subordinate {kind} range for {user}: {reason}")]
    IdentityRange {
        kind: String,
        user: String,
        reason: String,
    },

    // =========================================================================
    // Image Errors
    // =========================================================================
    /// Failed to parse image reference.
    #[error("invalid image reference '{reference}': {reason}")]
    InvalidImageReference { reference: String, reason: String },

    /// Image fetch failed (transport, auth, registry).
    #[error("failed to fetch image '{reference}': {reason}")]
    FetchFailed { reference: String, reason: String },

    /// Layer extraction failed.
    #[error("failed to extract layer {digest}: {reason}")]
    ExtractionFailed { digest: String, reason: String },

    /// Image size exceeded limits.
    #[error("image exceeds size limit: {size} > {limit} bytes")]
    ImageTooLarge { size: u64, limit: u64 },

    /// Path traversal attempt detected in tar archive.
    #[error("path traversal detected in layer: {path}")]
    PathTraversal { path: String },

    // =========================================================================
    // Bundle Errors
    // =========================================================================
    /// Failed to build bundle.
    #[error("failed to build bundle: {0}")]
    BundleBuildFailed(String),

    /// Bundle in an unusable state (missing config.json, image not fetched).
    #[error("invalid bundle at {path}: {reason}")]
    InvalidBundle { path: PathBuf, reason: String },

    /// Runtime spec could not be generated or failed validation.
    #[error("failed to generate OCI spec: {0}")]
    SpecGeneration(String),

    // =========================================================================
    // Runtime Errors
    // =========================================================================
    /// No usable low-level runtime.
    #[error("runtime '{runtime}' not available: {reason}")]
    RuntimeUnavailable { runtime: String, reason: String },

    /// The low-level runtime could not be started or reported a failure
    /// unrelated to the container process.
    #[error("runtime {runtime} failed for container '{id}': {reason}")]
    RuntimeExec {
        runtime: String,
        id: String,
        reason: String,
    },

    /// Invalid container ID.
    #[error("invalid container ID '{id}': {reason}")]
    InvalidContainerId { id: String, reason: String },

    // =========================================================================
    // Control Flow Errors
    // =========================================================================
    /// Launch cancelled while in flight.
    #[error("operation cancelled: {0}")]
    Cancelled(String),

    /// Operation timed out.
    #[error("operation timed out after {duration:?}: {operation}")]
    Timeout {
        operation: String,
        duration: std::time::Duration,
    },

    // =========================================================================
    // I/O Errors
    // =========================================================================
    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Internal error (should not happen).
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Exit code the launcher process should report for this error.
    pub fn exit_code(&self) -> i32 {
        LAUNCHER_FAILURE_EXIT_CODE
    }

    /// Returns true for errors caused by the caller's configuration, which
    /// are always detected before the runtime is started.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::Configuration(_)
                | Self::UnsupportedOptions { .. }
                | Self::InvalidBind { .. }
                | Self::WorkDirNotFound { .. }
                | Self::InvalidImageReference { .. }
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
