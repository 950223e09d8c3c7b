//! OCI runtime specification types.
//!
//! Serde structures for the `config.json` consumed by runc and crun. Field
//! names follow the OCI Runtime Specification exactly; only the subset of
//! the schema this launcher produces is modelled, with `linux.resources`
//! carried through untouched apart from the device allow-list.
//!
//! Reference: <https://github.com/opencontainers/runtime-spec/blob/main/config.md>

use crate::cache::write_atomic;
use crate::constants::{
    BUNDLE_ROOTFS_DIR, DEFAULT_MASKED_PATHS, DEFAULT_READONLY_PATHS, MAX_METADATA_SIZE,
    OCI_RUNTIME_SPEC_VERSION,
};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// Root of `config.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeSpec {
    pub oci_version: String,
    pub root: Root,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process: Option<Process>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default)]
    pub mounts: Vec<Mount>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub linux: Option<Linux>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl RuntimeSpec {
    /// Minimal spec with no process: rootfs path, masked and read-only
    /// paths as in runc's default spec, and an empty namespace list.
    pub fn minimal() -> Self {
        Self {
            oci_version: OCI_RUNTIME_SPEC_VERSION.to_string(),
            root: Root {
                path: BUNDLE_ROOTFS_DIR.to_string(),
                readonly: false,
            },
            process: None,
            hostname: None,
            mounts: Vec::new(),
            linux: Some(Linux {
                masked_paths: DEFAULT_MASKED_PATHS.iter().map(|p| p.to_string()).collect(),
                readonly_paths: DEFAULT_READONLY_PATHS.iter().map(|p| p.to_string()).collect(),
                ..Default::default()
            }),
            annotations: BTreeMap::new(),
        }
    }

    /// Returns the Linux section, creating it if absent.
    pub fn linux_mut(&mut self) -> &mut Linux {
        self.linux.get_or_insert_with(Linux::default)
    }

    /// Returns true if a namespace of this type is configured.
    pub fn has_namespace(&self, ns: NamespaceType) -> bool {
        self.linux
            .as_ref()
            .is_some_and(|l| l.namespaces.iter().any(|n| n.ns_type == ns))
    }

    /// Checks the invariants a runtime relies on.
    ///
    /// A spec without a process, or with ID mappings but no user namespace,
    /// is rejected.
    pub fn validate(&self) -> Result<()> {
        let process = self
            .process
            .as_ref()
            .ok_or_else(|| Error::SpecGeneration("spec has no process".to_string()))?;
        if process.args.is_empty() {
            return Err(Error::SpecGeneration(
                "no command to run: image has no entrypoint or cmd and none was given".to_string(),
            ));
        }
        if !process.cwd.starts_with('/') {
            return Err(Error::SpecGeneration(format!(
                "process cwd '{}' is not absolute",
                process.cwd
            )));
        }

        if let Some(linux) = &self.linux {
            let mapped = !linux.uid_mappings.is_empty() || !linux.gid_mappings.is_empty();
            if mapped && !self.has_namespace(NamespaceType::User) {
                return Err(Error::SpecGeneration(
                    "uid/gid mappings present without a user namespace".to_string(),
                ));
            }
            for mappings in [&linux.uid_mappings, &linux.gid_mappings] {
                check_mappings(mappings)?;
            }
        }
        Ok(())
    }

    /// Reads a spec from `config.json`.
    pub fn load(path: &Path) -> Result<Self> {
        let size = fs::metadata(path)?.len();
        if size > MAX_METADATA_SIZE {
            return Err(Error::ImageTooLarge {
                size,
                limit: MAX_METADATA_SIZE,
            });
        }
        let data = fs::read(path)?;
        Ok(serde_json::from_slice(&data)?)
    }

    /// Writes the spec as pretty-printed JSON.
    ///
    /// The file is replaced atomically so a runtime never reads a partial
    /// config.
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(self)?;
        write_atomic(path, &json)?;
        Ok(())
    }
}

fn check_mappings(mappings: &[IdMapping]) -> Result<()> {
    let mut ranges: Vec<(u64, u64)> = mappings
        .iter()
        .map(|m| {
            (
                u64::from(m.container_id),
                u64::from(m.container_id) + u64::from(m.size),
            )
        })
        .collect();
    ranges.sort_unstable();
    for m in mappings {
        if m.size == 0 {
            return Err(Error::SpecGeneration(format!(
                "zero-sized id mapping at container id {}",
                m.container_id
            )));
        }
    }
    for pair in ranges.windows(2) {
        if pair[0].1 > pair[1].0 {
            return Err(Error::SpecGeneration(format!(
                "overlapping id mappings at container id {}",
                pair[1].0
            )));
        }
    }
    Ok(())
}

/// Root filesystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Root {
    pub path: String,
    #[serde(default)]
    pub readonly: bool,
}

/// Container process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Process {
    #[serde(default)]
    pub terminal: bool,
    pub user: User,
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Vec<String>,
    pub cwd: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<LinuxCapabilities>,
    #[serde(default)]
    pub no_new_privileges: bool,
}

/// Process identity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub uid: u32,
    pub gid: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub umask: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub additional_gids: Vec<u32>,
}

/// Capability sets.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinuxCapabilities {
    #[serde(default)]
    pub bounding: Vec<String>,
    #[serde(default)]
    pub effective: Vec<String>,
    #[serde(default)]
    pub inheritable: Vec<String>,
    #[serde(default)]
    pub permitted: Vec<String>,
    #[serde(default)]
    pub ambient: Vec<String>,
}

/// Mount entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    pub destination: String,
    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    pub mount_type: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub source: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
}

impl Mount {
    /// Mount of a named filesystem type.
    pub fn new(destination: &str, mount_type: &str, source: &str, options: &[&str]) -> Self {
        Self {
            destination: destination.to_string(),
            mount_type: mount_type.to_string(),
            source: source.to_string(),
            options: options.iter().map(|o| o.to_string()).collect(),
        }
    }

    /// Returns true if this mount is a bind mount.
    pub fn is_bind(&self) -> bool {
        self.options.iter().any(|o| o == "bind" || o == "rbind")
    }
}

/// Linux-specific configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Linux {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub uid_mappings: Vec<IdMapping>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub gid_mappings: Vec<IdMapping>,
    #[serde(default)]
    pub namespaces: Vec<Namespace>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub devices: Vec<Device>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cgroups_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<Resources>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub masked_paths: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub readonly_paths: Vec<String>,
}

/// One (containerID, hostID, size) mapping triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdMapping {
    #[serde(rename = "containerID")]
    pub container_id: u32,
    #[serde(rename = "hostID")]
    pub host_id: u32,
    pub size: u32,
}

impl IdMapping {
    pub const fn new(container_id: u32, host_id: u32, size: u32) -> Self {
        Self {
            container_id,
            host_id,
            size,
        }
    }
}

/// Namespace kinds understood by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NamespaceType {
    Pid,
    Network,
    Mount,
    Ipc,
    Uts,
    User,
    Cgroup,
}

/// Namespace entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Namespace {
    #[serde(rename = "type")]
    pub ns_type: NamespaceType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl Namespace {
    pub fn new(ns_type: NamespaceType) -> Self {
        Self {
            ns_type,
            path: None,
        }
    }
}

/// Device node created in the container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub path: String,
    #[serde(rename = "type")]
    pub device_type: String,
    pub major: i64,
    pub minor: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_mode: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gid: Option<u32>,
}

/// Cgroup resources.
///
/// Only the device allow-list is typed; every other controller is passed
/// through as supplied.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Resources {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub devices: Vec<DeviceCgroup>,
    #[serde(flatten)]
    pub other: BTreeMap<String, serde_json::Value>,
}

/// Device cgroup rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceCgroup {
    pub allow: bool,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub device_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub major: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub minor: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_process(mut spec: RuntimeSpec) -> RuntimeSpec {
        spec.process = Some(Process {
            terminal: false,
            user: User::default(),
            args: vec!["/bin/true".to_string()],
            env: vec![],
            cwd: "/".to_string(),
            capabilities: None,
            no_new_privileges: true,
        });
        spec
    }

    #[test]
    fn test_field_names_match_runtime_schema() {
        let mut spec = with_process(RuntimeSpec::minimal());
        let linux = spec.linux_mut();
        linux.uid_mappings.push(IdMapping::new(0, 1000, 1));
        linux.namespaces.push(Namespace::new(NamespaceType::User));
        linux.cgroups_path = Some("/ocilaunch/abc".to_string());

        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json["ociVersion"], "1.0.2");
        assert_eq!(json["root"]["path"], "rootfs");
        assert_eq!(json["process"]["noNewPrivileges"], true);
        assert_eq!(json["linux"]["uidMappings"][0]["containerID"], 0);
        assert_eq!(json["linux"]["uidMappings"][0]["hostID"], 1000);
        assert_eq!(json["linux"]["namespaces"][0]["type"], "user");
        assert_eq!(json["linux"]["cgroupsPath"], "/ocilaunch/abc");
        assert!(json["linux"]["maskedPaths"].is_array());
    }

    #[test]
    fn test_validate_requires_process() {
        let err = RuntimeSpec::minimal().validate().unwrap_err();
        assert!(matches!(err, Error::SpecGeneration(_)));
    }

    #[test]
    fn test_validate_mappings_need_user_namespace() {
        let mut spec = with_process(RuntimeSpec::minimal());
        spec.linux_mut().uid_mappings.push(IdMapping::new(0, 1, 10));
        assert!(spec.validate().is_err());

        spec.linux_mut()
            .namespaces
            .push(Namespace::new(NamespaceType::User));
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_overlap() {
        let mut spec = with_process(RuntimeSpec::minimal());
        let linux = spec.linux_mut();
        linux.namespaces.push(Namespace::new(NamespaceType::User));
        linux.uid_mappings = vec![IdMapping::new(0, 1, 10), IdMapping::new(5, 100, 1)];
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_resources_pass_through_unknown_controllers() {
        let json = r#"{"memory":{"limit":1048576},"devices":[{"allow":false,"access":"rwm"}]}"#;
        let resources: Resources = serde_json::from_str(json).unwrap();
        assert_eq!(resources.devices.len(), 1);
        assert!(resources.other.contains_key("memory"));

        let back = serde_json::to_value(&resources).unwrap();
        assert_eq!(back["memory"]["limit"], 1048576);
    }
}
