//! Low-level runtime interface.
//!
//! The launcher never forks the container itself. It hands a finished bundle
//! to an OCI runtime (runc, crun) and waits for the container process to
//! exit:
//!
//! ```text
//! run(id, bundle) → exit code
//! state(id)       → ContainerState
//! delete(id)
//! ```
//!
//! # Exit codes
//!
//! The container's exit code is returned as-is. A container killed by a
//! signal reports `128 + signal`, the same encoding a shell uses.
//!
//! # OCI Runtime Spec Reference
//!
//! See: https://github.com/opencontainers/runtime-spec/blob/main/runtime.md

use crate::error::Result;
use crate::identity::OuterNamespace;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitStatus;

// =============================================================================
// Container State (OCI Runtime Spec)
// =============================================================================

/// OCI Runtime Spec container status.
///
/// Ref: https://github.com/opencontainers/runtime-spec/blob/main/runtime.md#state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    /// Container is being created.
    Creating,
    /// Container has been created but not started.
    Created,
    /// Container is running.
    Running,
    /// Container is frozen (runc/crun extension).
    Paused,
    /// Container has stopped.
    Stopped,
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Creating => write!(f, "creating"),
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// OCI Runtime Spec container state, as printed by `runc state`.
///
/// Runtimes add their own fields (`rootfs`, `created`, `owner`); those are
/// ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerState {
    /// OCI version of the state schema.
    pub oci_version: String,
    /// Container ID.
    pub id: String,
    /// Container status.
    pub status: ContainerStatus,
    /// Process ID of the container (if running).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// Absolute path to the bundle directory.
    pub bundle: String,
    /// Annotations from the container config.
    #[serde(default)]
    pub annotations: HashMap<String, String>,
}

impl ContainerState {
    /// Returns true if the container is running.
    pub fn is_running(&self) -> bool {
        self.status == ContainerStatus::Running
    }
}

// =============================================================================
// Run Request
// =============================================================================

/// How the runtime manages cgroups.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CgroupsMode {
    /// Direct cgroupfs writes.
    #[default]
    Cgroupfs,
    /// Delegated to systemd (`--systemd-cgroup`).
    Systemd,
}

/// Everything the runtime needs to start one container.
#[derive(Debug, Clone)]
pub struct RunRequest {
    /// Container ID, already validated.
    pub id: String,
    /// Bundle directory holding `config.json` and `rootfs/`.
    pub bundle: PathBuf,
    /// User namespace the runtime itself must run in (unprivileged launches).
    pub outer: Option<OuterNamespace>,
    pub cgroups: CgroupsMode,
}

// =============================================================================
// Runtime Invoker Trait
// =============================================================================

/// Executes bundles with a low-level OCI runtime.
#[async_trait]
pub trait RuntimeInvoker: Send + Sync {
    /// Returns the runtime name.
    fn name(&self) -> &str;

    /// Creates and starts the container, then waits for it to exit.
    ///
    /// Returns the container's exit code. An `Err` means the runtime could
    /// not be started at all.
    async fn run(&self, request: &RunRequest) -> Result<i32>;

    /// Gets the state of a container.
    ///
    /// This corresponds to `state <container-id>`.
    async fn state(&self, id: &str) -> Result<ContainerState>;

    /// Deletes a container.
    ///
    /// The container must be stopped before deletion unless `force` is true.
    /// This corresponds to `delete <container-id>`.
    async fn delete(&self, id: &str, force: bool) -> Result<()>;
}

/// Decodes a wait status into a shell-style exit code.
pub fn exit_code_from_status(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;

    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => 128 + signal,
        (None, None) => crate::error::LAUNCHER_FAILURE_EXIT_CODE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::ExitStatusExt;

    #[test]
    fn test_exit_code_from_status() {
        // Raw wait statuses: exit code in the high byte, signal in the low bits.
        assert_eq!(exit_code_from_status(ExitStatus::from_raw(0)), 0);
        assert_eq!(exit_code_from_status(ExitStatus::from_raw(3 << 8)), 3);
        assert_eq!(exit_code_from_status(ExitStatus::from_raw(libc::SIGKILL)), 137);
        assert_eq!(exit_code_from_status(ExitStatus::from_raw(libc::SIGTERM)), 143);
    }

    #[test]
    fn test_state_from_runc_output() {
        let json = r#"{
            "ociVersion": "1.0.2",
            "id": "abc",
            "pid": 4242,
            "status": "running",
            "bundle": "/tmp/oci-bundle-x",
            "rootfs": "/tmp/oci-bundle-x/rootfs",
            "created": "2024-01-01T00:00:00Z",
            "owner": ""
        }"#;
        let state: ContainerState = serde_json::from_str(json).unwrap();
        assert!(state.is_running());
        assert_eq!(state.pid, Some(4242));
        assert!(state.annotations.is_empty());
    }

    #[test]
    fn test_paused_status() {
        let status: ContainerStatus = serde_json::from_str("\"paused\"").unwrap();
        assert_eq!(status, ContainerStatus::Paused);
        assert_eq!(status.to_string(), "paused");
    }
}
