//! Capability sets for the container process.
//!
//! | Target | Permitted / Effective | Inheritable / Ambient | Bounding |
//! |--------|-----------------------|-----------------------|----------|
//! | uid 0 | (base ∪ add) − drop | empty | (base ∪ add) − drop |
//! | other | add − drop | add − drop | (base ∪ add) − drop |
//!
//! The base set is [`DEFAULT_CAPS`], or the launcher's own effective set when
//! privileges are kept. `no_privs` empties every set and wins over all other
//! capability options.

use crate::constants::DEFAULT_CAPS;
use crate::error::{Error, Result};
use crate::options::LaunchOptions;
use crate::spec::LinuxCapabilities;
use std::fs;
use tracing::debug;

/// Capability names indexed by bit number.
const CAPABILITIES: &[&str] = &[
    "CAP_CHOWN",
    "CAP_DAC_OVERRIDE",
    "CAP_DAC_READ_SEARCH",
    "CAP_FOWNER",
    "CAP_FSETID",
    "CAP_KILL",
    "CAP_SETGID",
    "CAP_SETUID",
    "CAP_SETPCAP",
    "CAP_LINUX_IMMUTABLE",
    "CAP_NET_BIND_SERVICE",
    "CAP_NET_BROADCAST",
    "CAP_NET_ADMIN",
    "CAP_NET_RAW",
    "CAP_IPC_LOCK",
    "CAP_IPC_OWNER",
    "CAP_SYS_MODULE",
    "CAP_SYS_RAWIO",
    "CAP_SYS_CHROOT",
    "CAP_SYS_PTRACE",
    "CAP_SYS_PACCT",
    "CAP_SYS_ADMIN",
    "CAP_SYS_BOOT",
    "CAP_SYS_NICE",
    "CAP_SYS_RESOURCE",
    "CAP_SYS_TIME",
    "CAP_SYS_TTY_CONFIG",
    "CAP_MKNOD",
    "CAP_LEASE",
    "CAP_AUDIT_WRITE",
    "CAP_AUDIT_CONTROL",
    "CAP_SETFCAP",
    "CAP_MAC_OVERRIDE",
    "CAP_MAC_ADMIN",
    "CAP_SYSLOG",
    "CAP_WAKE_ALARM",
    "CAP_BLOCK_SUSPEND",
    "CAP_AUDIT_READ",
    "CAP_PERFMON",
    "CAP_BPF",
    "CAP_CHECKPOINT_RESTORE",
];

/// Canonical form of a capability name: upper case with a `CAP_` prefix.
pub fn normalize(name: &str) -> Result<String> {
    let upper = name.trim().to_ascii_uppercase();
    let canonical = if upper.starts_with("CAP_") {
        upper
    } else {
        format!("CAP_{}", upper)
    };
    if !CAPABILITIES.contains(&canonical.as_str()) {
        return Err(Error::Configuration(format!(
            "unknown capability '{}'",
            name.trim()
        )));
    }
    Ok(canonical)
}

/// Parses a comma-separated capability list, dropping duplicates.
pub fn parse_list(list: Option<&str>) -> Result<Vec<String>> {
    let mut caps: Vec<String> = Vec::new();
    for name in list.unwrap_or("").split(',').filter(|s| !s.trim().is_empty()) {
        let cap = normalize(name)?;
        if !caps.contains(&cap) {
            caps.push(cap);
        }
    }
    Ok(caps)
}

/// Names of the bits set in a capability mask.
pub fn decode_mask(mask: u64) -> Vec<String> {
    CAPABILITIES
        .iter()
        .enumerate()
        .filter(|(bit, _)| mask & (1u64 << bit) != 0)
        .map(|(_, name)| name.to_string())
        .collect()
}

/// Effective capabilities of the current process, from `/proc/self/status`.
pub fn process_effective() -> Result<Vec<String>> {
    let status = fs::read_to_string("/proc/self/status")?;
    let hex = status
        .lines()
        .find_map(|l| l.strip_prefix("CapEff:"))
        .map(str::trim)
        .ok_or_else(|| Error::Internal("CapEff missing from /proc/self/status".to_string()))?;
    let mask = u64::from_str_radix(hex, 16)
        .map_err(|e| Error::Internal(format!("invalid CapEff '{}': {}", hex, e)))?;
    Ok(decode_mask(mask))
}

/// Base set before add/drop are applied.
pub fn base_capabilities(opts: &LaunchOptions) -> Result<Vec<String>> {
    if opts.no_privs {
        return Ok(Vec::new());
    }
    if opts.keep_privs {
        return process_effective();
    }
    Ok(DEFAULT_CAPS.iter().map(|c| c.to_string()).collect())
}

fn without(set: &[String], drop: &[String]) -> Vec<String> {
    set.iter().filter(|c| !drop.contains(c)).cloned().collect()
}

/// Capability sets for a process running as `uid`.
pub fn process_capabilities(opts: &LaunchOptions, uid: u32) -> Result<LinuxCapabilities> {
    if opts.no_privs {
        debug!("all capabilities dropped");
        return Ok(LinuxCapabilities::default());
    }

    let base = base_capabilities(opts)?;
    let add = parse_list(opts.add_caps.as_deref())?;
    let drop = parse_list(opts.drop_caps.as_deref())?;

    let mut bounding = base;
    for cap in &add {
        if !bounding.contains(cap) {
            bounding.push(cap.clone());
        }
    }
    let bounding = without(&bounding, &drop);

    let caps = if uid == 0 {
        LinuxCapabilities {
            effective: bounding.clone(),
            permitted: bounding.clone(),
            bounding,
            inheritable: Vec::new(),
            ambient: Vec::new(),
        }
    } else {
        let granted = without(&add, &drop);
        LinuxCapabilities {
            bounding,
            effective: granted.clone(),
            permitted: granted.clone(),
            inheritable: granted.clone(),
            ambient: granted,
        }
    };
    Ok(caps)
}
