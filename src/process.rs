//! # Process Resolution
//!
//! Computes the container process's argv, environment, working directory and
//! image-declared identity from the image config plus user overrides.
//!
//! ## Argv
//!
//! | process override | args override | Result |
//! |------------------|---------------|--------|
//! | no  | no  | Entrypoint + Cmd |
//! | no  | yes | Entrypoint + args |
//! | yes | no  | process |
//! | yes | yes | process + args |
//!
//! ## Environment
//!
//! Precedence, lowest first: image `Env`, `--env-file`, prefixed host
//! variables (`OCILAUNCHENV_FOO` becomes `FOO`), explicit `--env`. `PATH`,
//! `APPEND_PATH`, `PREPEND_PATH` and `LD_LIBRARY_PATH` are combined rather
//! than copied, and `LD_LIBRARY_PATH` always ends up containing
//! [`LIBRARY_BIND_DIR`].

use crate::constants::{HOST_ENV_PREFIX, LIBRARY_BIND_DIR};
use crate::error::{Error, Result};
use crate::fetch::ImageConfig;
use crate::options::LaunchOptions;
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

const PATH: &str = "PATH";
const APPEND_PATH: &str = "APPEND_PATH";
const PREPEND_PATH: &str = "PREPEND_PATH";
const LD_LIBRARY_PATH: &str = "LD_LIBRARY_PATH";

// =============================================================================
// Argv
// =============================================================================

/// Resolves the process argv.
///
/// An empty `process` string counts as no override.
pub fn process_args(config: &ImageConfig, process: Option<&str>, args: &[String]) -> Vec<String> {
    let process = process.filter(|p| !p.is_empty());

    let mut argv = match process {
        Some(p) => vec![p.to_string()],
        None => config.entrypoint().to_vec(),
    };

    if !args.is_empty() {
        argv.extend(args.iter().cloned());
    } else if process.is_none() {
        argv.extend(config.cmd().iter().cloned());
    }

    argv
}

// =============================================================================
// Environment
// =============================================================================

/// Variables carrying [`HOST_ENV_PREFIX`], with the prefix removed.
pub fn prefixed_env<I>(vars: I) -> BTreeMap<String, String>
where
    I: IntoIterator<Item = (String, String)>,
{
    vars.into_iter()
        .filter_map(|(k, v)| {
            k.strip_prefix(HOST_ENV_PREFIX)
                .filter(|key| !key.is_empty())
                .map(|key| (key.to_string(), v))
        })
        .collect()
}

/// Reads an env-file (quotes and multi-line values allowed).
pub fn env_file_map(path: &Path) -> Result<BTreeMap<String, String>> {
    let iter = dotenvy::from_path_iter(path).map_err(|e| {
        Error::Configuration(format!("while reading env-file {}: {}", path.display(), e))
    })?;

    let mut env = BTreeMap::new();
    for item in iter {
        let (key, value) = item.map_err(|e| {
            Error::Configuration(format!("while parsing env-file {}: {}", path.display(), e))
        })?;
        env.insert(key, value);
    }
    Ok(env)
}

/// Collects user-supplied environment in precedence order.
pub fn user_env<I>(opts: &LaunchOptions, host_vars: I) -> Result<BTreeMap<String, String>>
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut env = match &opts.env_file {
        Some(path) => env_file_map(path)?,
        None => BTreeMap::new(),
    };
    if !opts.clean_env {
        env.extend(prefixed_env(host_vars));
    }
    env.extend(opts.env.iter().map(|(k, v)| (k.clone(), v.clone())));
    Ok(env)
}

fn join_non_empty(parts: &[&str]) -> String {
    parts
        .iter()
        .filter(|p| !p.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join(":")
}

fn split_assignment(entry: &str) -> (&str, &str) {
    entry.split_once('=').unwrap_or((entry, ""))
}

/// Computes the final `KEY=VALUE` list.
///
/// Image variables keep their order; new keys follow in sorted order and
/// `LD_LIBRARY_PATH` is always last. Keys are unique.
pub fn process_env(config: &ImageConfig, user: &BTreeMap<String, String>) -> Vec<String> {
    let mut image_path = None;
    let mut image_ld_path = None;
    let mut ordered: Vec<(String, String)> = Vec::new();
    let mut seen = HashSet::new();

    for entry in config.env() {
        let (key, value) = split_assignment(entry);
        match key {
            LD_LIBRARY_PATH => image_ld_path = Some(value.to_string()),
            _ => {
                if key == PATH {
                    image_path = Some(value.to_string());
                }
                if seen.insert(key.to_string()) {
                    ordered.push((key.to_string(), value.to_string()));
                } else if let Some(slot) = ordered.iter_mut().find(|(k, _)| k == key) {
                    slot.1 = value.to_string();
                }
            }
        }
    }

    for (key, value) in user {
        match key.as_str() {
            PATH | APPEND_PATH | PREPEND_PATH | LD_LIBRARY_PATH => continue,
            _ => {}
        }
        if let Some(slot) = ordered.iter_mut().find(|(k, _)| k == key) {
            slot.1 = value.clone();
        } else {
            ordered.push((key.clone(), value.clone()));
        }
    }

    let base = user.get(PATH).or(image_path.as_ref());
    let prepend = user.get(PREPEND_PATH).map(String::as_str).unwrap_or("");
    let append = user.get(APPEND_PATH).map(String::as_str).unwrap_or("");
    if base.is_some() || !prepend.is_empty() || !append.is_empty() {
        let path = join_non_empty(&[prepend, base.map(String::as_str).unwrap_or(""), append]);
        match ordered.iter_mut().find(|(k, _)| k == PATH) {
            Some(slot) => slot.1 = path,
            None => ordered.push((PATH.to_string(), path)),
        }
    }

    let ld_base = user.get(LD_LIBRARY_PATH).or(image_ld_path.as_ref());
    let ld_path = match ld_base {
        Some(v) if v.split(':').any(|p| p == LIBRARY_BIND_DIR) => v.clone(),
        Some(v) => join_non_empty(&[v, LIBRARY_BIND_DIR]),
        None => LIBRARY_BIND_DIR.to_string(),
    };

    // New keys after the image's own, sorted.
    let image_keys = seen;
    let (mut head, mut tail): (Vec<_>, Vec<_>) = ordered
        .into_iter()
        .partition(|(k, _)| image_keys.contains(k));
    tail.sort_by(|a, b| a.0.cmp(&b.0));
    head.append(&mut tail);
    head.push((LD_LIBRARY_PATH.to_string(), ld_path));

    head.into_iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect()
}

// =============================================================================
// Working directory
// =============================================================================

/// Path of `container_path` inside `rootfs`.
pub fn rootfs_path(rootfs: &Path, container_path: &str) -> PathBuf {
    rootfs.join(container_path.trim_start_matches('/'))
}

/// Resolves the working directory.
///
/// An explicit request must exist in the rootfs; otherwise the image's
/// `WorkingDir` or `/` is used.
pub fn process_cwd(config: &ImageConfig, requested: Option<&str>, rootfs: &Path) -> Result<String> {
    if let Some(cwd) = requested.filter(|c| !c.is_empty()) {
        if !cwd.starts_with('/') {
            return Err(Error::Configuration(format!(
                "working directory '{}' must be absolute",
                cwd
            )));
        }
        if !rootfs_path(rootfs, cwd).is_dir() {
            return Err(Error::WorkDirNotFound {
                path: cwd.to_string(),
            });
        }
        return Ok(cwd.to_string());
    }

    Ok(match config.working_dir() {
        "" => "/".to_string(),
        dir => dir.to_string(),
    })
}

// =============================================================================
// Image USER
// =============================================================================

/// Finds `name` (field 0) or numeric `id` (field 2) in a passwd/group file.
fn lookup_entry(file: &Path, name: Option<&str>, id: Option<u32>) -> Option<Vec<String>> {
    let content = fs::read_to_string(file).ok()?;
    content.lines().find_map(|line| {
        let fields: Vec<String> = line.split(':').map(str::to_string).collect();
        if fields.len() < 3 {
            return None;
        }
        let by_name = name.is_some_and(|n| fields[0] == n);
        let by_id = id.is_some_and(|i| fields[2] == i.to_string());
        (by_name || by_id).then_some(fields)
    })
}

/// Resolves an image `USER` value (`user[:group]`, names or numbers) against
/// the extracted rootfs. Returns `None` when the image sets no user.
pub fn resolve_image_user(user: &str, rootfs: &Path) -> Result<Option<(u32, u32)>> {
    let user = user.trim();
    if user.is_empty() {
        return Ok(None);
    }

    let passwd = rootfs_path(rootfs, "/etc/passwd");
    let group = rootfs_path(rootfs, "/etc/group");
    let (user_part, group_part) = match user.split_once(':') {
        Some((u, g)) => (u, Some(g)),
        None => (user, None),
    };

    let unresolved = |what: &str, name: &str| {
        Error::Configuration(format!(
            "image USER '{}': {} '{}' not found in image",
            user, what, name
        ))
    };

    let (uid, passwd_gid) = match user_part.parse::<u32>() {
        Ok(uid) => {
            let gid = lookup_entry(&passwd, None, Some(uid)).and_then(|f| f.get(3)?.parse().ok());
            (uid, gid)
        }
        Err(_) => {
            let fields = lookup_entry(&passwd, Some(user_part), None)
                .ok_or_else(|| unresolved("user", user_part))?;
            let uid = fields[2]
                .parse::<u32>()
                .map_err(|_| unresolved("user", user_part))?;
            (uid, fields.get(3).and_then(|g| g.parse().ok()))
        }
    };

    let gid = match group_part {
        Some(g) => match g.parse::<u32>() {
            Ok(gid) => gid,
            Err(_) => lookup_entry(&group, Some(g), None)
                .and_then(|f| f[2].parse().ok())
                .ok_or_else(|| unresolved("group", g))?,
        },
        None => passwd_gid.unwrap_or(0),
    };

    debug!(user, uid, gid, "resolved image user");
    Ok(Some((uid, gid)))
}
