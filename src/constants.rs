//! # Launcher Constants
//!
//! Resource limits, fixed container paths and default values used while
//! building bundles. These constants are the single source of truth for
//! security-relevant bounds throughout the crate.
//!
//! ## Cross-References
//!
//! - [`crate::extract`]: size limits for layer extraction
//! - [`crate::identity`]: minimum subordinate ID range
//! - [`crate::process`]: library binding directory and host env prefix
//! - [`crate::capabilities`]: default capability set

use std::time::Duration;

// =============================================================================
// Size Limits
// =============================================================================
//
// These limits bound disk and memory use while unpacking untrusted images.
// MAX_ROOTFS_SIZE provides the actual extraction bound.
// =============================================================================

/// Maximum image reference length in bytes.
pub const MAX_IMAGE_REF_LEN: usize = 4096;

/// Maximum size of a single compressed layer (512 MiB).
///
/// **Security**: A malicious registry could serve infinite-length layers.
pub const MAX_LAYER_SIZE: u64 = 512 * 1024 * 1024;

/// Maximum total extracted rootfs size (16 GiB).
///
/// **Security**: Bounds compression bombs (small compressed, huge
/// uncompressed). Accumulated across all layers of one image.
pub const MAX_ROOTFS_SIZE: u64 = 16 * 1024 * 1024 * 1024;

/// Maximum number of layers in an image.
pub const MAX_LAYERS: usize = 128;

/// Maximum manifest / config / index blob size (4 MiB).
pub const MAX_METADATA_SIZE: u64 = 4 * 1024 * 1024;

/// Number of tar entries between cancellation checks during extraction.
pub const EXTRACT_CANCEL_CHECK_INTERVAL: usize = 256;

// =============================================================================
// Identity
// =============================================================================

/// Minimum size of a subordinate UID/GID range.
///
/// The container must be able to map at least IDs 0..65535.
pub const MIN_SUBID_RANGE: u32 = 65536;

/// Default subordinate UID file.
pub const DEFAULT_SUBUID_FILE: &str = "/etc/subuid";

/// Default subordinate GID file.
pub const DEFAULT_SUBGID_FILE: &str = "/etc/subgid";

// =============================================================================
// Container Paths
// =============================================================================

/// Directory always present in `LD_LIBRARY_PATH`. Helper shared libraries
/// are injected here regardless of image or user configuration.
pub const LIBRARY_BIND_DIR: &str = "/.singularity.d/libs";

/// Root filesystem directory name inside a bundle.
pub const BUNDLE_ROOTFS_DIR: &str = "rootfs";

/// Bundle side-tree holding synthesized `/etc` files.
pub const BUNDLE_ETC_DIR: &str = "etc";

/// Runtime spec file name inside a bundle.
pub const BUNDLE_CONFIG_FILE: &str = "config.json";

/// Prefix of temporary bundle directories.
pub const BUNDLE_DIR_PREFIX: &str = "oci-bundle-";

/// Prefix of temporary OCI layout directories used during fetch.
pub const LAYOUT_DIR_PREFIX: &str = "oci-tmp-";

/// Host environment variables carrying this prefix are passed into the
/// container with the prefix stripped.
pub const HOST_ENV_PREFIX: &str = "OCILAUNCHENV_";

/// Environment variable overriding the image cache directory.
pub const CACHE_DIR_ENV: &str = "OCILAUNCH_CACHEDIR";

/// Basic-auth credentials for registry pulls.
pub const REGISTRY_USERNAME_ENV: &str = "OCILAUNCH_DOCKER_USERNAME";
pub const REGISTRY_PASSWORD_ENV: &str = "OCILAUNCH_DOCKER_PASSWORD";

/// Cgroup parent used when a resource descriptor is supplied.
pub const CGROUP_PARENT: &str = "/ocilaunch";

// =============================================================================
// Defaults
// =============================================================================

/// Default size of session tmpfs mounts, in MiB.
pub const DEFAULT_SESSIONDIR_MAX_SIZE_MB: u64 = 64;

/// Timeout for a single registry operation (5 minutes).
pub const IMAGE_PULL_TIMEOUT: Duration = Duration::from_secs(300);

/// OCI Runtime Spec version for generated `config.json`.
pub const OCI_RUNTIME_SPEC_VERSION: &str = "1.0.2";

/// Default capability set granted to a root-equivalent container process.
///
/// Matches the set runc/crun apply for a default container.
pub const DEFAULT_CAPS: &[&str] = &[
    "CAP_CHOWN",
    "CAP_DAC_OVERRIDE",
    "CAP_FSETID",
    "CAP_FOWNER",
    "CAP_MKNOD",
    "CAP_NET_RAW",
    "CAP_SETGID",
    "CAP_SETUID",
    "CAP_SETFCAP",
    "CAP_SETPCAP",
    "CAP_NET_BIND_SERVICE",
    "CAP_SYS_CHROOT",
    "CAP_KILL",
    "CAP_AUDIT_WRITE",
];

/// Paths masked from the container (runc default spec).
pub const DEFAULT_MASKED_PATHS: &[&str] = &[
    "/proc/acpi",
    "/proc/asound",
    "/proc/kcore",
    "/proc/keys",
    "/proc/latency_stats",
    "/proc/timer_list",
    "/proc/timer_stats",
    "/proc/sched_debug",
    "/sys/firmware",
    "/proc/scsi",
];

/// Paths made read-only in the container (runc default spec).
pub const DEFAULT_READONLY_PATHS: &[&str] = &[
    "/proc/bus",
    "/proc/fs",
    "/proc/irq",
    "/proc/sys",
    "/proc/sysrq-trigger",
];

// =============================================================================
// Container ID Validation
// =============================================================================

/// Valid characters for container IDs.
///
/// **Security**: Excludes `/` and `.` which could be used for path traversal
/// when the ID names a runtime state directory.
pub const CONTAINER_ID_VALID_CHARS: &str =
    "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789-_";

/// Maximum container ID length.
pub const MAX_CONTAINER_ID_LEN: usize = 128;

/// Validates a container ID for safety.
///
/// Returns `Err(reason)` when the ID is empty, too long, or contains
/// characters outside [`CONTAINER_ID_VALID_CHARS`].
#[inline]
#[must_use = "validation result must be checked to ensure container ID is safe"]
pub fn validate_container_id(id: &str) -> std::result::Result<(), &'static str> {
    if id.is_empty() {
        return Err("container ID cannot be empty");
    }
    if id.len() > MAX_CONTAINER_ID_LEN {
        return Err("container ID exceeds maximum length");
    }
    if !id.chars().all(|c| CONTAINER_ID_VALID_CHARS.contains(c)) {
        return Err("container ID contains invalid characters");
    }
    Ok(())
}
