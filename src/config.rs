//! # Launcher Configuration
//!
//! Administrative settings that apply to every launch on a host: where the
//! subordinate ID files live, how large session tmpfs mounts may grow, and
//! whether identity files are synthesized.
//!
//! A [`LauncherConfig`] is constructed once at launch start (usually from a
//! TOML file) and shared as an `Arc<LauncherConfig>` with every component
//! that needs it. Nothing below the launcher re-reads configuration files.
//!
//! ## File Format
//!
//! ```toml
//! subuid_file = "/etc/subuid"
//! subgid_file = "/etc/subgid"
//! sessiondir_max_size_mb = 64
//! config_passwd = true
//! config_group = true
//! config_resolv_conf = true
//! user_bind_control = true
//! runtime = ["crun", "runc"]
//! systemd_cgroups = false
//! cdi_spec_dirs = ["/etc/cdi", "/var/run/cdi"]
//! ```
//!
//! Every key is optional; missing keys take the defaults shown above.

use crate::constants::{
    CACHE_DIR_ENV, DEFAULT_SESSIONDIR_MAX_SIZE_MB, DEFAULT_SUBGID_FILE, DEFAULT_SUBUID_FILE,
    MIN_SUBID_RANGE,
};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Host-wide launcher configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LauncherConfig {
    /// Subordinate UID file.
    pub subuid_file: PathBuf,
    /// Subordinate GID file.
    pub subgid_file: PathBuf,
    /// Minimum accepted size of a subordinate ID range.
    pub min_subid_range: u32,
    /// Size bound for `/dev`, `/dev/shm`, `/tmp`, `/var/tmp` and home tmpfs
    /// mounts, in MiB.
    pub sessiondir_max_size_mb: u64,
    /// Synthesize `/etc/passwd` for the container user.
    pub config_passwd: bool,
    /// Synthesize `/etc/group` for the container user.
    pub config_group: bool,
    /// Write `/etc/resolv.conf` into the bundle.
    pub config_resolv_conf: bool,
    /// Allow users to request bind mounts.
    pub user_bind_control: bool,
    /// Image cache directory. `None` selects the per-user default.
    pub cache_dir: Option<PathBuf>,
    /// Low-level runtimes in order of preference.
    pub runtime: Vec<String>,
    /// State directory passed to the low-level runtime with `--root`.
    pub state_dir: Option<PathBuf>,
    /// Let systemd manage container cgroups.
    pub systemd_cgroups: bool,
    /// Directories searched for CDI specifications.
    pub cdi_spec_dirs: Vec<PathBuf>,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            subuid_file: PathBuf::from(DEFAULT_SUBUID_FILE),
            subgid_file: PathBuf::from(DEFAULT_SUBGID_FILE),
            min_subid_range: MIN_SUBID_RANGE,
            sessiondir_max_size_mb: DEFAULT_SESSIONDIR_MAX_SIZE_MB,
            config_passwd: true,
            config_group: true,
            config_resolv_conf: true,
            user_bind_control: true,
            cache_dir: None,
            runtime: vec!["crun".to_string(), "runc".to_string()],
            state_dir: None,
            systemd_cgroups: false,
            cdi_spec_dirs: vec![PathBuf::from("/etc/cdi"), PathBuf::from("/var/run/cdi")],
        }
    }
}

impl LauncherConfig {
    /// Loads configuration from a TOML file.
    ///
    /// A missing file yields the defaults. A file that exists but cannot be
    /// parsed is a configuration error.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "configuration file not found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(Error::Configuration(format!(
                    "failed to read {}: {}",
                    path.display(),
                    e
                )));
            }
        };
        Self::from_toml(&contents)
            .map_err(|e| Error::Configuration(format!("{}: {}", path.display(), e)))
    }

    /// Parses configuration from a TOML string.
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(contents).map_err(|e| Error::Configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.sessiondir_max_size_mb == 0 {
            return Err(Error::Configuration(
                "sessiondir_max_size_mb must be greater than zero".to_string(),
            ));
        }
        if self.runtime.is_empty() {
            return Err(Error::Configuration(
                "at least one runtime must be configured".to_string(),
            ));
        }
        Ok(())
    }

    /// Resolves the image cache directory.
    ///
    /// Precedence: `OCILAUNCH_CACHEDIR`, then `cache_dir`, then
    /// `$XDG_CACHE_HOME/ocilaunch`.
    pub fn resolved_cache_dir(&self) -> PathBuf {
        if let Ok(dir) = std::env::var(CACHE_DIR_ENV)
            && !dir.is_empty()
        {
            return PathBuf::from(dir);
        }
        if let Some(dir) = &self.cache_dir {
            return dir.clone();
        }
        match dirs::cache_dir() {
            Some(dir) => dir.join("ocilaunch"),
            None => std::env::temp_dir().join("ocilaunch-cache"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let temp = TempDir::new().unwrap();
        let config = LauncherConfig::load(&temp.path().join("absent.toml")).unwrap();
        assert_eq!(config, LauncherConfig::default());
        assert_eq!(config.sessiondir_max_size_mb, 64);
        assert_eq!(config.min_subid_range, 65536);
    }

    #[test]
    fn test_partial_file_overrides_defaults() {
        let config = LauncherConfig::from_toml(
            "sessiondir_max_size_mb = 16\nconfig_passwd = false\nruntime = [\"runc\"]\n",
        )
        .unwrap();
        assert_eq!(config.sessiondir_max_size_mb, 16);
        assert!(!config.config_passwd);
        assert!(config.config_group);
        assert_eq!(config.runtime, vec!["runc".to_string()]);
    }

    #[test]
    fn test_malformed_file_is_configuration_error() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("bad.toml");
        std::fs::write(&path, "sessiondir_max_size_mb = \"lots\"").unwrap();
        let err = LauncherConfig::load(&path).unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_unknown_key_rejected() {
        assert!(LauncherConfig::from_toml("no_such_key = 1").is_err());
    }

    #[test]
    fn test_zero_session_size_rejected() {
        assert!(LauncherConfig::from_toml("sessiondir_max_size_mb = 0").is_err());
    }
}
