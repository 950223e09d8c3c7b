//! Launch options.
//!
//! [`LaunchOptions`] is the immutable snapshot of everything the caller asked
//! for: namespaces, identity, home directory, binds, capability edits,
//! environment overrides and the handful of storage/GPU switches that only
//! some launcher variants honour. It is built once per invocation and only
//! read afterwards.
//!
//! [`LaunchOptions::requested`] reports which named options are set so each
//! launcher can check them against its own supported-options table.

use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// Namespaces explicitly requested by the caller.
///
/// A mount namespace is always created; the user namespace may also be added
/// implicitly when an ID mapping is required.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Namespaces {
    pub user: bool,
    pub pid: bool,
    pub ipc: bool,
    pub uts: bool,
    pub net: bool,
}

/// Home directory request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HomeSpec {
    /// Host directory bound onto `destination`. `None` mounts a tmpfs.
    pub source: Option<PathBuf>,
    /// Home directory path inside the container.
    pub destination: String,
}

impl HomeSpec {
    /// Parses `dest` or `src:dest`.
    pub fn parse(spec: &str) -> Result<Self> {
        let (source, destination) = match spec.split_once(':') {
            Some((src, dest)) => (Some(src), dest),
            None => (None, spec),
        };

        if destination.is_empty() || !destination.starts_with('/') {
            return Err(Error::Configuration(format!(
                "home destination '{}' must be an absolute path",
                destination
            )));
        }

        let source = match source {
            Some(src) if src.is_empty() || !src.starts_with('/') => {
                return Err(Error::Configuration(format!(
                    "home source '{}' must be an absolute path",
                    src
                )));
            }
            Some(src) => Some(PathBuf::from(src)),
            None => None,
        };

        Ok(Self {
            source,
            destination: destination.to_string(),
        })
    }

    /// Returns true when the home directory is bound from the host.
    pub fn is_bind(&self) -> bool {
        self.source.is_some()
    }
}

/// Named launch option, as reported in unsupported-option errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LaunchOption {
    Writable,
    WritableTmpfs,
    OverlayPaths,
    ScratchDirs,
    WorkDir,
    NoHome,
    FuseMount,
    NoMount,
    NvCCLI,
    Nvidia,
    Rocm,
    ContainLibs,
    NoEval,
    Network,
    NetworkArgs,
    Hostname,
    AllowSUID,
    SecurityOpts,
    NoUmask,
    ShellPath,
    Boot,
    NoInit,
    Contain,
    ContainAll,
    AppName,
    SIFFUSE,
}

impl LaunchOption {
    /// Name used in diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Writable => "Writable",
            Self::WritableTmpfs => "WritableTmpfs",
            Self::OverlayPaths => "OverlayPaths",
            Self::ScratchDirs => "ScratchDirs",
            Self::WorkDir => "WorkDir",
            Self::NoHome => "NoHome",
            Self::FuseMount => "FuseMount",
            Self::NoMount => "NoMount",
            Self::NvCCLI => "NvCCLI",
            Self::Nvidia => "Nvidia",
            Self::Rocm => "Rocm",
            Self::ContainLibs => "ContainLibs",
            Self::NoEval => "NoEval",
            Self::Network => "Network (except none)",
            Self::NetworkArgs => "NetworkArgs",
            Self::Hostname => "Hostname",
            Self::AllowSUID => "AllowSUID",
            Self::SecurityOpts => "SecurityOpts",
            Self::NoUmask => "NoUmask",
            Self::ShellPath => "ShellPath",
            Self::Boot => "Boot",
            Self::NoInit => "NoInit",
            Self::Contain => "Contain",
            Self::ContainAll => "ContainAll",
            Self::AppName => "AppName",
            Self::SIFFUSE => "SIFFUSE",
        }
    }
}

impl fmt::Display for LaunchOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Immutable configuration snapshot for one launch.
#[derive(Debug, Clone, Default)]
pub struct LaunchOptions {
    // -------------------------------------------------------------------------
    // Identity
    // -------------------------------------------------------------------------
    /// Appear as root inside the container.
    pub fakeroot: bool,
    /// Namespaces requested on the command line.
    pub namespaces: Namespaces,

    // -------------------------------------------------------------------------
    // Filesystem
    // -------------------------------------------------------------------------
    /// Home directory request. `None` uses the invoking user's home.
    pub home: Option<HomeSpec>,
    /// Skip mounting a home directory.
    pub no_home: bool,
    /// `--bind src[:dest[:opts]]` requests, comma-separated lists allowed.
    pub bind_paths: Vec<String>,
    /// `--mount type=bind,source=...,destination=...` requests.
    pub mounts: Vec<String>,
    /// Paths whose default mounts should be skipped (advisory).
    pub no_mount: Vec<String>,
    /// Container working directory.
    pub cwd: Option<String>,
    pub writable: bool,
    pub writable_tmpfs: bool,
    pub overlay_paths: Vec<String>,
    pub scratch_dirs: Vec<String>,
    /// Host directory backing scratch and tmp directories.
    pub work_dir: Option<String>,
    pub fuse_mount: Vec<String>,
    pub contain_libs: Vec<String>,
    pub contain: bool,
    pub contain_all: bool,
    pub sif_fuse: bool,

    // -------------------------------------------------------------------------
    // Environment
    // -------------------------------------------------------------------------
    /// Explicit `--env` assignments.
    pub env: BTreeMap<String, String>,
    /// `--env-file` path.
    pub env_file: Option<PathBuf>,
    /// Do not pass prefixed host variables into the container.
    pub clean_env: bool,
    pub no_eval: bool,

    // -------------------------------------------------------------------------
    // Network
    // -------------------------------------------------------------------------
    /// Network type; only meaningful with a network namespace.
    pub network: Option<String>,
    pub network_args: Vec<String>,
    pub hostname: Option<String>,
    /// Comma-separated nameserver list.
    pub dns: Option<String>,

    // -------------------------------------------------------------------------
    // Privileges
    // -------------------------------------------------------------------------
    /// Comma-separated capabilities to add.
    pub add_caps: Option<String>,
    /// Comma-separated capabilities to drop.
    pub drop_caps: Option<String>,
    pub allow_suid: bool,
    /// Start from the launcher's own effective capabilities.
    pub keep_privs: bool,
    /// Drop every capability. Overrides all other capability options.
    pub no_privs: bool,
    pub security_opts: Vec<String>,
    pub no_umask: bool,

    // -------------------------------------------------------------------------
    // Devices and resources
    // -------------------------------------------------------------------------
    /// CDI device requests (`vendor/class=name`).
    pub devices: Vec<String>,
    pub nvidia: bool,
    pub nvccli: bool,
    pub rocm: bool,
    /// JSON resource descriptor applied as `linux.resources`.
    pub cgroups_file: Option<PathBuf>,

    // -------------------------------------------------------------------------
    // Launcher behaviour
    // -------------------------------------------------------------------------
    pub shell_path: Option<String>,
    pub boot: bool,
    pub no_init: bool,
    pub app_name: Option<String>,
    /// Fetch directly into a disposable directory instead of the cache.
    pub cache_disabled: bool,
    /// Leave the bundle on disk after the launch.
    pub keep_bundle: bool,
}

impl LaunchOptions {
    /// Returns every named option that is set, in declaration order.
    pub fn requested(&self) -> Vec<LaunchOption> {
        let checks = [
            (self.writable, LaunchOption::Writable),
            (self.writable_tmpfs, LaunchOption::WritableTmpfs),
            (!self.overlay_paths.is_empty(), LaunchOption::OverlayPaths),
            (!self.scratch_dirs.is_empty(), LaunchOption::ScratchDirs),
            (self.work_dir.is_some(), LaunchOption::WorkDir),
            (self.no_home, LaunchOption::NoHome),
            (!self.fuse_mount.is_empty(), LaunchOption::FuseMount),
            (!self.no_mount.is_empty(), LaunchOption::NoMount),
            (self.nvccli, LaunchOption::NvCCLI),
            (self.nvidia, LaunchOption::Nvidia),
            (self.rocm, LaunchOption::Rocm),
            (!self.contain_libs.is_empty(), LaunchOption::ContainLibs),
            (self.no_eval, LaunchOption::NoEval),
            (self.requests_network(), LaunchOption::Network),
            (!self.network_args.is_empty(), LaunchOption::NetworkArgs),
            (self.hostname.is_some(), LaunchOption::Hostname),
            (self.allow_suid, LaunchOption::AllowSUID),
            (!self.security_opts.is_empty(), LaunchOption::SecurityOpts),
            (self.no_umask, LaunchOption::NoUmask),
            (self.shell_path.is_some(), LaunchOption::ShellPath),
            (self.boot, LaunchOption::Boot),
            (self.no_init, LaunchOption::NoInit),
            (self.contain, LaunchOption::Contain),
            (self.contain_all, LaunchOption::ContainAll),
            (self.app_name.is_some(), LaunchOption::AppName),
            (self.sif_fuse, LaunchOption::SIFFUSE),
        ];
        checks
            .into_iter()
            .filter_map(|(set, option)| set.then_some(option))
            .collect()
    }

    /// A network namespace with anything other than isolation.
    fn requests_network(&self) -> bool {
        self.namespaces.net && self.network.as_deref().is_some_and(|n| n != "none")
    }

    /// Nameservers from the DNS override, in order.
    pub fn nameservers(&self) -> Vec<String> {
        self.dns
            .as_deref()
            .map(|dns| {
                dns.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_home_spec_dest_only() {
        let home = HomeSpec::parse("/home/dest").unwrap();
        assert_eq!(home.source, None);
        assert_eq!(home.destination, "/home/dest");
        assert!(!home.is_bind());
    }

    #[test]
    fn test_home_spec_src_dest() {
        let home = HomeSpec::parse("/home/src:/home/dest").unwrap();
        assert_eq!(home.source, Some(PathBuf::from("/home/src")));
        assert_eq!(home.destination, "/home/dest");
        assert!(home.is_bind());
    }

    #[test]
    fn test_home_spec_relative_rejected() {
        assert!(HomeSpec::parse("home").is_err());
        assert!(HomeSpec::parse("src:/home/dest").is_err());
        assert!(HomeSpec::parse("/src:").is_err());
    }

    #[test]
    fn test_requested_empty_by_default() {
        assert!(LaunchOptions::default().requested().is_empty());
    }

    #[test]
    fn test_network_none_is_not_requested() {
        let mut opts = LaunchOptions {
            network: Some("none".to_string()),
            ..Default::default()
        };
        opts.namespaces.net = true;
        assert!(opts.requested().is_empty());

        opts.network = Some("bridge".to_string());
        assert_eq!(opts.requested(), vec![LaunchOption::Network]);
    }

    #[test]
    fn test_requested_in_declaration_order() {
        let opts = LaunchOptions {
            hostname: Some("box".to_string()),
            writable: true,
            boot: true,
            ..Default::default()
        };
        assert_eq!(
            opts.requested(),
            vec![
                LaunchOption::Writable,
                LaunchOption::Hostname,
                LaunchOption::Boot
            ]
        );
    }

    #[test]
    fn test_nameservers() {
        let opts = LaunchOptions {
            dns: Some("1.1.1.1, 8.8.8.8,,".to_string()),
            ..Default::default()
        };
        assert_eq!(opts.nameservers(), vec!["1.1.1.1", "8.8.8.8"]);
    }
}
