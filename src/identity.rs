//! # Identity Mapping
//!
//! Decides which UID/GID the container process runs as and which ID
//! mappings make that identity work for an unprivileged caller.
//!
//! ## Two namespaces
//!
//! An unprivileged launch runs the low-level runtime inside an *outer* user
//! namespace built from the caller's subordinate ID ranges:
//!
//! ```text
//! outer:  0      -> caller's real uid      (size 1)
//!         1..N   -> subordinate range      (size N)
//! ```
//!
//! The container spec then carries an *inner* mapping computed by
//! [`reverse_map_by_range`], which places the target identity on outer ID 0.
//! The container process therefore appears as the target identity while
//! the host sees the caller's real uid, and files extracted by the caller
//! show up as owned by the target.
//!
//! ## Target selection
//!
//! | Caller | fakeroot | Target | Inner mapping |
//! |--------|----------|--------|---------------|
//! | host root | any | image `USER`, else 0 | none |
//! | unprivileged | yes | 0:0 | reverse map with target 0 |
//! | unprivileged | no | image `USER`, else caller | reverse map |

use crate::config::LauncherConfig;
use crate::error::{Error, Result};
use crate::spec::IdMapping;
use nix::unistd::{Gid, Group, Uid, User};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// The invoking user as seen on the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostIdentity {
    pub uid: u32,
    pub gid: u32,
    pub user_name: String,
    pub home: PathBuf,
}

impl HostIdentity {
    /// Identity of the current process.
    pub fn current() -> Result<Self> {
        let uid = Uid::current();
        let gid = Gid::current();
        let user = User::from_uid(uid).map_err(|e| {
            Error::Internal(format!("failed to look up user {}: {}", uid, e))
        })?;
        let (user_name, home) = match user {
            Some(u) => (u.name, u.dir),
            None => (uid.to_string(), PathBuf::from("/")),
        };
        Ok(Self {
            uid: uid.as_raw(),
            gid: gid.as_raw(),
            user_name,
            home,
        })
    }

    /// True when running as host root.
    pub fn is_root(&self) -> bool {
        self.uid == 0
    }

    /// Name of the caller's primary group, if it can be resolved.
    pub fn group_name(&self) -> Option<String> {
        Group::from_gid(Gid::from_raw(self.gid))
            .ok()
            .flatten()
            .map(|g| g.name)
    }
}

/// One subordinate ID range from `/etc/subuid` or `/etc/subgid`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubIdRange {
    pub start: u32,
    pub size: u32,
}

/// Which subordinate file a range came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdKind {
    Uid,
    Gid,
}

impl IdKind {
    fn name(&self) -> &'static str {
        match self {
            Self::Uid => "uid",
            Self::Gid => "gid",
        }
    }
}

/// Reads the first range for `user` (matched by name or numeric id).
///
/// A missing file yields `Ok(None)`.
pub fn read_subid_range(path: &Path, user: &str, id: u32) -> Result<Option<SubIdRange>> {
    let contents = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let id = id.to_string();

    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut fields = line.split(':');
        let (Some(owner), Some(start), Some(size)) = (fields.next(), fields.next(), fields.next())
        else {
            debug!(path = %path.display(), line, "skipping malformed subordinate id entry");
            continue;
        };
        if owner != user && owner != id {
            continue;
        }
        let (Ok(start), Ok(size)) = (start.parse::<u32>(), size.parse::<u32>()) else {
            debug!(path = %path.display(), line, "skipping non-numeric subordinate id entry");
            continue;
        };
        return Ok(Some(SubIdRange { start, size }));
    }
    Ok(None)
}

/// Reverse mapping by range.
///
/// Maps container `target` onto outer ID 0 and shifts the IDs below it off 0:
///
/// - `target < size`: `[0 -> 1, target]`, `[target -> 0, 1]`,
///   `[target+1 -> target+1, size-target-1]`
/// - `target >= size`: `[0 -> 1, size]`, `[target -> 0, 1]`
///
/// Zero-length triples are omitted, so `target == 0` collapses to
/// `[0 -> 0, 1]`, `[1 -> 1, size-1]`.
pub fn reverse_map_by_range(target: u32, size: u32) -> Vec<IdMapping> {
    let triples = if target < size {
        [
            IdMapping::new(0, 1, target),
            IdMapping::new(target, 0, 1),
            IdMapping::new(target + 1, target + 1, size - target - 1),
        ]
        .to_vec()
    } else {
        vec![IdMapping::new(0, 1, size), IdMapping::new(target, 0, 1)]
    };
    triples.into_iter().filter(|m| m.size > 0).collect()
}

/// Mapping for the outer user namespace the runtime runs in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OuterNamespace {
    pub uid_map: Vec<IdMapping>,
    pub gid_map: Vec<IdMapping>,
}

/// Ownership handling during layer extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdMapOptions {
    /// Apply ownership recorded in the layer tarballs. Only possible as
    /// host root; unprivileged extraction leaves files owned by the caller.
    pub preserve_ownership: bool,
}

impl IdMapOptions {
    pub fn for_host(host: &HostIdentity) -> Self {
        Self {
            preserve_ownership: host.is_root(),
        }
    }
}

/// Resolved identity for one launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityPlan {
    /// Container process uid.
    pub uid: u32,
    /// Container process gid.
    pub gid: u32,
    /// Inner mappings written to the runtime spec.
    pub uid_mappings: Vec<IdMapping>,
    pub gid_mappings: Vec<IdMapping>,
    /// Outer namespace for unprivileged launches.
    pub outer: Option<OuterNamespace>,
}

impl IdentityPlan {
    /// The spec must carry a user namespace whenever inner mappings exist.
    pub fn needs_user_namespace(&self) -> bool {
        !self.uid_mappings.is_empty() || !self.gid_mappings.is_empty()
    }
}

/// Selects the target identity and computes the mappings for it.
///
/// `image_user` is the identity declared by the image's `USER`, already
/// resolved against the rootfs.
pub fn plan_identity(
    host: &HostIdentity,
    fakeroot: bool,
    image_user: Option<(u32, u32)>,
    config: &LauncherConfig,
) -> Result<IdentityPlan> {
    if host.is_root() {
        let (uid, gid) = if fakeroot {
            (0, 0)
        } else {
            image_user.unwrap_or((0, 0))
        };
        return Ok(IdentityPlan {
            uid,
            gid,
            uid_mappings: Vec::new(),
            gid_mappings: Vec::new(),
            outer: None,
        });
    }

    let uid_range = required_range(host, IdKind::Uid, config)?;
    let gid_range = required_range(host, IdKind::Gid, config)?;
    let outer = OuterNamespace {
        uid_map: vec![
            IdMapping::new(0, host.uid, 1),
            IdMapping::new(1, uid_range.start, uid_range.size),
        ],
        gid_map: vec![
            IdMapping::new(0, host.gid, 1),
            IdMapping::new(1, gid_range.start, gid_range.size),
        ],
    };

    let (uid, gid) = if fakeroot {
        (0, 0)
    } else {
        image_user.unwrap_or((host.uid, host.gid))
    };

    // The target always lands on outer 0, which is the caller on the host.
    let uid_mappings = reverse_map_by_range(uid, uid_range.size);
    let gid_mappings = reverse_map_by_range(gid, gid_range.size);
    debug!(uid, gid, "reverse mapping target identity onto the caller");

    Ok(IdentityPlan {
        uid,
        gid,
        uid_mappings,
        gid_mappings,
        outer: Some(outer),
    })
}

fn required_range(host: &HostIdentity, kind: IdKind, config: &LauncherConfig) -> Result<SubIdRange> {
    let (path, id) = match kind {
        IdKind::Uid => (&config.subuid_file, host.uid),
        IdKind::Gid => (&config.subgid_file, host.gid),
    };
    let range_error = |reason: String| Error::IdentityRange {
        kind: kind.name().to_string(),
        user: host.user_name.clone(),
        reason,
    };

    let range = read_subid_range(path, &host.user_name, id)?
        .ok_or_else(|| range_error(format!("no entry in {}", path.display())))?;
    if range.size < config.min_subid_range {
        return Err(range_error(format!(
            "range of {} is smaller than the required {}",
            range.size, config.min_subid_range
        )));
    }
    Ok(range)
}
