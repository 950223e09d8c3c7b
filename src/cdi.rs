//! # Container Device Interface
//!
//! Resolves fully-qualified device names (`vendor.com/class=name`) against
//! CDI spec files and merges their container edits into a finalized
//! runtime spec.
//!
//! Spec files are JSON or YAML and are read from each configured directory
//! in order; a device defined in a later directory replaces one of the same
//! name from an earlier directory.
//!
//! ## Edits applied
//!
//! | Edit | Effect |
//! |------|--------|
//! | `env` | set in `process.env`, replacing an existing key |
//! | `deviceNodes` | added to `linux.devices` and allowed in `linux.resources.devices` |
//! | `mounts` | appended to `mounts` |
//!
//! Hooks are not supported and are skipped with a warning.

use crate::error::{Error, Result};
use crate::spec::{Device, DeviceCgroup, Mount, RuntimeSpec};
use nix::sys::stat::{major, minor};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// One CDI spec file.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CdiSpec {
    pub cdi_version: String,
    /// `vendor/class`.
    pub kind: String,
    #[serde(default)]
    pub devices: Vec<CdiDevice>,
    /// Edits applied whenever any device of this spec is requested.
    #[serde(default)]
    pub container_edits: ContainerEdits,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CdiDevice {
    pub name: String,
    #[serde(default)]
    pub container_edits: ContainerEdits,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerEdits {
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub device_nodes: Vec<DeviceNode>,
    #[serde(default)]
    pub mounts: Vec<CdiMount>,
    #[serde(default)]
    pub hooks: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceNode {
    pub path: String,
    pub host_path: Option<String>,
    #[serde(rename = "type")]
    pub device_type: Option<String>,
    pub major: Option<i64>,
    pub minor: Option<i64>,
    pub file_mode: Option<u32>,
    pub permissions: Option<String>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CdiMount {
    pub host_path: String,
    pub container_path: String,
    #[serde(rename = "type")]
    pub mount_type: Option<String>,
    #[serde(default)]
    pub options: Vec<String>,
}

/// Devices known from the configured spec directories.
#[derive(Debug, Default)]
pub struct CdiRegistry {
    /// Keyed by fully-qualified device name.
    devices: BTreeMap<String, (ContainerEdits, ContainerEdits)>,
}

impl CdiRegistry {
    /// Loads every `*.json`, `*.yaml` and `*.yml` file in `dirs`.
    ///
    /// Missing directories are skipped. A malformed spec file is an error.
    pub fn load(dirs: &[PathBuf]) -> Result<Self> {
        let mut registry = Self::default();
        for dir in dirs {
            let entries = match fs::read_dir(dir) {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            let mut paths: Vec<PathBuf> = entries
                .filter_map(|e| e.ok().map(|e| e.path()))
                .filter(|p| {
                    matches!(
                        p.extension().and_then(|e| e.to_str()),
                        Some("json" | "yaml" | "yml")
                    )
                })
                .collect();
            paths.sort();
            for path in paths {
                registry.add(read_spec(&path)?);
            }
        }
        Ok(registry)
    }

    /// Registers the devices of one spec.
    pub fn add(&mut self, spec: CdiSpec) {
        for device in spec.devices {
            let name = format!("{}={}", spec.kind, device.name);
            debug!(device = %name, version = %spec.cdi_version, "registered CDI device");
            self.devices
                .insert(name, (spec.container_edits.clone(), device.container_edits));
        }
    }

    /// Returns true if `name` resolves.
    pub fn contains(&self, name: &str) -> bool {
        self.devices.contains_key(name)
    }

    /// Applies the edits of each requested device to `spec`.
    ///
    /// Every request is resolved before anything is modified.
    pub fn apply(&self, spec: &mut RuntimeSpec, requests: &[String]) -> Result<()> {
        let mut resolved = Vec::with_capacity(requests.len());
        for request in requests {
            if !request.contains('=') || !request.contains('/') {
                return Err(Error::Configuration(format!(
                    "device '{}' is not a fully-qualified CDI name (vendor/class=name)",
                    request
                )));
            }
            let edits = self.devices.get(request).ok_or_else(|| {
                Error::Configuration(format!("CDI device '{}' not found", request))
            })?;
            resolved.push((request, edits));
        }

        let mut applied_common: Vec<&str> = Vec::new();
        for (request, (common, device)) in resolved {
            let kind = request.split('=').next().unwrap_or_default();
            if !applied_common.contains(&kind) {
                apply_edits(spec, common)?;
                applied_common.push(kind);
            }
            apply_edits(spec, device)?;
        }
        Ok(())
    }
}

fn read_spec(path: &Path) -> Result<CdiSpec> {
    let data = fs::read(path)?;
    let parsed = match path.extension().and_then(|e| e.to_str()) {
        Some("json") => serde_json::from_slice(&data).map_err(|e| e.to_string()),
        _ => serde_yaml::from_slice(&data).map_err(|e| e.to_string()),
    };
    parsed.map_err(|reason| {
        Error::Configuration(format!("invalid CDI spec {}: {}", path.display(), reason))
    })
}

fn apply_edits(spec: &mut RuntimeSpec, edits: &ContainerEdits) -> Result<()> {
    if !edits.hooks.is_empty() {
        warn!(count = edits.hooks.len(), "CDI hooks are not supported, skipping");
    }

    if let Some(process) = spec.process.as_mut() {
        for entry in &edits.env {
            let key = entry.split('=').next().unwrap_or_default();
            let prefix = format!("{}=", key);
            process.env.retain(|e| !e.starts_with(&prefix));
            process.env.push(entry.clone());
        }
    }

    for node in &edits.device_nodes {
        let device = resolve_node(node)?;
        let linux = spec.linux_mut();
        let resources = linux.resources.get_or_insert_with(Default::default);
        resources.devices.push(DeviceCgroup {
            allow: true,
            device_type: Some(device.device_type.clone()),
            major: Some(device.major),
            minor: Some(device.minor),
            access: Some(node.permissions.clone().unwrap_or_else(|| "rwm".to_string())),
        });
        linux.devices.retain(|d| d.path != device.path);
        linux.devices.push(device);
    }

    for mount in &edits.mounts {
        spec.mounts.push(Mount {
            destination: mount.container_path.clone(),
            mount_type: mount.mount_type.clone().unwrap_or_else(|| "bind".to_string()),
            source: mount.host_path.clone(),
            options: mount.options.clone(),
        });
    }
    Ok(())
}

/// Fills in type and numbers from the host node when the spec omits them.
fn resolve_node(node: &DeviceNode) -> Result<Device> {
    let (device_type, dev_major, dev_minor) = match (&node.device_type, node.major, node.minor) {
        (Some(t), Some(maj), Some(min)) => (t.clone(), maj, min),
        _ => {
            let host = node.host_path.as_deref().unwrap_or(&node.path);
            let meta = fs::metadata(host).map_err(|e| {
                Error::Configuration(format!("CDI device node {}: {}", host, e))
            })?;
            let file_type = meta.file_type();
            let kind = if file_type.is_char_device() {
                "c"
            } else if file_type.is_block_device() {
                "b"
            } else {
                return Err(Error::Configuration(format!(
                    "CDI device node {} is not a device",
                    host
                )));
            };
            let rdev = meta.rdev();
            (
                node.device_type.clone().unwrap_or_else(|| kind.to_string()),
                node.major.unwrap_or(major(rdev) as i64),
                node.minor.unwrap_or(minor(rdev) as i64),
            )
        }
    };

    Ok(Device {
        path: node.path.clone(),
        device_type,
        major: dev_major,
        minor: dev_minor,
        file_mode: node.file_mode,
        uid: node.uid,
        gid: node.gid,
    })
}
