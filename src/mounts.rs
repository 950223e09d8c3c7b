//! # Mount Assembly
//!
//! Builds the ordered mount list for the runtime spec. The runtime applies
//! mounts in list order and later entries shadow earlier ones, so the order
//! is fixed:
//!
//! 1. pseudo-filesystems: `/proc`, `/sys`, `/dev`, `/dev/pts`, `/dev/shm`,
//!    `/dev/mqueue`
//! 2. session storage: `/tmp`, `/var/tmp`, home
//! 3. user binds from `--bind` and `--mount`
//! 4. synthesized `/etc/passwd`, `/etc/group`, `/etc/resolv.conf`
//!
//! The last group is added once the image has been extracted; see
//! [`synthesize_identity_files`]. Synthesized files live in the bundle's
//! `etc/` side-tree and are bound over the container paths, so the extracted
//! rootfs is never modified.

use crate::config::LauncherConfig;
use crate::error::{Error, Result};
use crate::identity::HostIdentity;
use crate::options::LaunchOptions;
use crate::spec::Mount;
use nix::unistd::Group;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Shell used in synthesized passwd entries.
const DEFAULT_SHELL: &str = "/bin/sh";

/// Host resolver configuration copied when no DNS override is given.
const HOST_RESOLV_CONF: &str = "/etc/resolv.conf";

// =============================================================================
// Bind requests
// =============================================================================

/// A normalized bind request from `--bind` or `--mount`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindRequest {
    pub source: String,
    pub destination: String,
    pub readonly: bool,
    /// Source path inside an image file (`image-src=`).
    pub image_src: Option<String>,
    /// Image partition id (`id=`).
    pub id: Option<String>,
}

impl BindRequest {
    fn new(source: &str, destination: &str) -> Self {
        Self {
            source: source.to_string(),
            destination: destination.to_string(),
            readonly: false,
            image_src: None,
            id: None,
        }
    }

    /// Binds sourced from inside an image file.
    pub fn is_image_bind(&self) -> bool {
        self.image_src.is_some() || self.id.is_some()
    }

    fn apply_option(&mut self, spec: &str, option: &str) -> Result<()> {
        match option.split_once('=') {
            None if option == "ro" => self.readonly = true,
            None if option == "rw" => self.readonly = false,
            Some(("id", v)) => self.id = Some(v.to_string()),
            Some(("img-src" | "image-src", v)) => self.image_src = Some(v.to_string()),
            _ => {
                return Err(Error::InvalidBind {
                    spec: spec.to_string(),
                    reason: format!("unknown bind option '{}'", option),
                });
            }
        }
        Ok(())
    }
}

fn is_bind_option(token: &str) -> bool {
    matches!(token, "ro" | "rw")
        || token.starts_with("id=")
        || token.starts_with("img-src=")
        || token.starts_with("image-src=")
}

/// Parses a `--bind` value: comma-separated `src[:dest[:opts]]` entries.
///
/// A bare option following an entry (`/a:/b:ro,id=2`) belongs to that entry.
pub fn parse_bind_path(spec: &str) -> Result<Vec<BindRequest>> {
    let mut binds: Vec<BindRequest> = Vec::new();

    for token in spec.split(',').map(str::trim).filter(|t| !t.is_empty()) {
        if is_bind_option(token) {
            let Some(last) = binds.last_mut() else {
                return Err(Error::InvalidBind {
                    spec: spec.to_string(),
                    reason: format!("option '{}' without a bind path", token),
                });
            };
            last.apply_option(spec, token)?;
            continue;
        }

        let mut fields = token.splitn(3, ':');
        let source = fields.next().unwrap_or_default();
        if source.is_empty() {
            return Err(Error::InvalidBind {
                spec: spec.to_string(),
                reason: "empty source".to_string(),
            });
        }
        let destination = match fields.next() {
            Some("") | None => source,
            Some(dest) => dest,
        };
        let mut bind = BindRequest::new(source, destination);
        if let Some(options) = fields.next() {
            for option in options.split(':').filter(|o| !o.is_empty()) {
                bind.apply_option(spec, option)?;
            }
        }
        binds.push(bind);
    }

    Ok(binds)
}

/// Parses a `--mount` value such as
/// `type=bind,source=/data,destination=/mnt,ro`.
pub fn parse_mount_string(spec: &str) -> Result<BindRequest> {
    let invalid = |reason: String| Error::InvalidBind {
        spec: spec.to_string(),
        reason,
    };

    let mut mount_type = None;
    let mut source = None;
    let mut destination = None;
    let mut bind = BindRequest::new("", "");

    for field in spec.split(',').map(str::trim).filter(|f| !f.is_empty()) {
        let (key, value) = match field.split_once('=') {
            Some((k, v)) => (k, Some(v)),
            None => (field, None),
        };
        match (key, value) {
            ("type", Some(v)) => mount_type = Some(v),
            ("source" | "src", Some(v)) => source = Some(v),
            ("destination" | "dst" | "target", Some(v)) => destination = Some(v),
            ("ro" | "readonly", None) => bind.readonly = true,
            ("readonly", Some(v)) => {
                bind.readonly = v
                    .parse::<bool>()
                    .map_err(|_| invalid(format!("invalid readonly value '{}'", v)))?
            }
            ("image-src", Some(v)) => bind.image_src = Some(v.to_string()),
            ("id", Some(v)) => bind.id = Some(v.to_string()),
            ("bind-propagation", Some(_)) => {}
            _ => return Err(invalid(format!("unknown mount field '{}'", field))),
        }
    }

    match mount_type {
        Some("bind") => {}
        Some(other) => return Err(invalid(format!("unsupported mount type '{}'", other))),
        None => return Err(invalid("mount type is required".to_string())),
    }
    bind.source = source
        .filter(|s| !s.is_empty())
        .ok_or_else(|| invalid("mount source is required".to_string()))?
        .to_string();
    bind.destination = destination
        .filter(|d| !d.is_empty())
        .ok_or_else(|| invalid("mount destination is required".to_string()))?
        .to_string();
    Ok(bind)
}

// =============================================================================
// Fixed mounts
// =============================================================================

fn size_option(config: &LauncherConfig) -> String {
    format!("size={}m", config.sessiondir_max_size_mb)
}

fn proc_mount() -> Mount {
    Mount::new("/proc", "proc", "proc", &[])
}

/// Fresh sysfs needs privilege; unprivileged launches bind the host tree.
fn sys_mount(host: &HostIdentity) -> Mount {
    if host.is_root() {
        Mount::new("/sys", "sysfs", "sysfs", &["nosuid", "noexec", "nodev", "ro"])
    } else {
        Mount::new(
            "/sys",
            "none",
            "/sys",
            &["rbind", "nosuid", "noexec", "nodev", "ro"],
        )
    }
}

fn dev_mounts(host: &HostIdentity, config: &LauncherConfig) -> Result<Vec<Mount>> {
    let size = size_option(config);

    let mut pts = Mount::new(
        "/dev/pts",
        "devpts",
        "devpts",
        &["nosuid", "noexec", "newinstance", "ptmxmode=0666", "mode=0620"],
    );
    if host.is_root() {
        let tty = Group::from_name("tty")
            .map_err(|e| Error::Internal(format!("while identifying tty gid: {}", e)))?
            .ok_or_else(|| Error::Internal("tty group not found".to_string()))?;
        pts.options.push(format!("gid={}", tty.gid));
    }

    Ok(vec![
        Mount::new(
            "/dev",
            "tmpfs",
            "tmpfs",
            &["nosuid", "strictatime", "mode=755", &size],
        ),
        pts,
        Mount::new(
            "/dev/shm",
            "tmpfs",
            "shm",
            &["nosuid", "noexec", "nodev", "mode=1777", &size],
        ),
        Mount::new("/dev/mqueue", "mqueue", "mqueue", &["nosuid", "noexec", "nodev"]),
    ])
}

fn tmp_mounts(config: &LauncherConfig) -> Vec<Mount> {
    let size = size_option(config);
    ["/tmp", "/var/tmp"]
        .into_iter()
        .map(|dest| Mount::new(dest, "tmpfs", "tmpfs", &["nosuid", "relatime", "mode=777", &size]))
        .collect()
}

/// Home directory destination for this launch, if one is mounted.
pub fn home_destination(opts: &LaunchOptions, host: &HostIdentity) -> Option<String> {
    if opts.no_home {
        return None;
    }
    if opts.fakeroot {
        return Some("/root".to_string());
    }
    Some(match &opts.home {
        Some(home) => home.destination.clone(),
        None => host.home.to_string_lossy().into_owned(),
    })
}

fn home_mount(
    opts: &LaunchOptions,
    host: &HostIdentity,
    config: &LauncherConfig,
) -> Result<Option<Mount>> {
    let Some(destination) = home_destination(opts, host) else {
        debug!("home mount disabled");
        return Ok(None);
    };
    let size = size_option(config);

    if opts.fakeroot {
        return Ok(Some(Mount::new(
            &destination,
            "tmpfs",
            "tmpfs",
            &["nosuid", "relatime", "mode=755", &size],
        )));
    }

    if let Some(source) = opts.home.as_ref().and_then(|h| h.source.as_ref()) {
        let source = absolute_existing(source, &format!("{}:{}", source.display(), destination))?;
        return Ok(Some(Mount::new(
            &destination,
            "none",
            &source.to_string_lossy(),
            &["rbind", "nosuid", "nodev"],
        )));
    }

    Ok(Some(Mount::new(
        &destination,
        "tmpfs",
        "tmpfs",
        &[
            "nosuid",
            "relatime",
            "mode=755",
            &size,
            &format!("uid={}", host.uid),
            &format!("gid={}", host.gid),
        ],
    )))
}

/// Rewrites the `uid=`/`gid=` options of the tmpfs mounted at `destination`.
pub fn set_tmpfs_owner(mounts: &mut [Mount], destination: &str, uid: u32, gid: u32) {
    for mount in mounts
        .iter_mut()
        .filter(|m| m.destination == destination && m.mount_type == "tmpfs")
    {
        for option in mount.options.iter_mut() {
            if option.starts_with("uid=") {
                *option = format!("uid={}", uid);
            } else if option.starts_with("gid=") {
                *option = format!("gid={}", gid);
            }
        }
    }
}

// =============================================================================
// User binds
// =============================================================================

fn absolute_existing(source: &Path, spec: &str) -> Result<PathBuf> {
    let absolute = std::path::absolute(source).map_err(|e| Error::InvalidBind {
        spec: spec.to_string(),
        reason: format!("cannot determine absolute path: {}", e),
    })?;
    fs::metadata(&absolute).map_err(|e| Error::InvalidBind {
        spec: spec.to_string(),
        reason: format!("cannot stat bind source {}: {}", absolute.display(), e),
    })?;
    Ok(absolute)
}

fn bind_mount(bind: &BindRequest, allow_suid: bool) -> Result<Mount> {
    let spec = format!("{}:{}", bind.source, bind.destination);
    if bind.is_image_bind() {
        return Err(Error::InvalidBind {
            spec,
            reason: "image binds are not supported by the OCI runtime".to_string(),
        });
    }
    if !bind.destination.starts_with('/') {
        return Err(Error::InvalidBind {
            spec,
            reason: "destination must be an absolute path".to_string(),
        });
    }

    let source = absolute_existing(Path::new(&bind.source), &spec)?;

    let mut options = vec!["rbind"];
    if !allow_suid {
        options.push("nosuid");
    }
    options.push("nodev");
    if bind.readonly {
        options.push("ro");
    }

    debug!(source = %source.display(), destination = %bind.destination, ?options, "adding bind mount");
    Ok(Mount::new(
        &bind.destination,
        "none",
        &source.to_string_lossy(),
        &options,
    ))
}

/// Resolves every `--bind` and `--mount` request.
///
/// All requests are validated before any is returned, so a failure leaves
/// no partial list behind.
pub fn user_bind_mounts(opts: &LaunchOptions, config: &LauncherConfig) -> Result<Vec<Mount>> {
    let mut binds = Vec::new();
    for spec in &opts.bind_paths {
        binds.extend(parse_bind_path(spec)?);
    }
    for spec in &opts.mounts {
        binds.push(parse_mount_string(spec)?);
    }

    if binds.is_empty() {
        return Ok(Vec::new());
    }
    if !config.user_bind_control {
        warn!(
            count = binds.len(),
            "ignoring bind mount requests: user bind control disabled by system administrator"
        );
        return Ok(Vec::new());
    }

    binds
        .iter()
        .map(|b| bind_mount(b, opts.allow_suid))
        .collect()
}

/// Builds the mounts known before the image is available.
pub fn assemble_mounts(
    opts: &LaunchOptions,
    host: &HostIdentity,
    config: &LauncherConfig,
) -> Result<Vec<Mount>> {
    for path in &opts.no_mount {
        warn!(path = %path, "ignoring --no-mount request: not supported by this launcher");
    }

    let mut mounts = vec![proc_mount(), sys_mount(host)];
    mounts.extend(dev_mounts(host, config)?);
    mounts.extend(tmp_mounts(config));
    if let Some(home) = home_mount(opts, host, config)? {
        mounts.push(home);
    }
    mounts.extend(user_bind_mounts(opts, config)?);
    Ok(mounts)
}

// =============================================================================
// Identity files
// =============================================================================

/// Inputs for identity file synthesis.
#[derive(Debug, Clone)]
pub struct IdentityFileRequest<'a> {
    /// Extracted container rootfs.
    pub rootfs: &'a Path,
    /// Bundle side-tree receiving the generated files.
    pub etc_dir: &'a Path,
    pub uid: u32,
    pub gid: u32,
    pub user_name: &'a str,
    pub group_name: &'a str,
    pub home: &'a str,
    /// Skip passwd/group: host root, fakeroot, or an image `USER`.
    pub skip_user_files: bool,
    pub nameservers: &'a [String],
}

/// Writes passwd, group and resolv.conf into the bundle side-tree and
/// returns bind mounts placing them over the container's `/etc`.
pub fn synthesize_identity_files(
    request: &IdentityFileRequest<'_>,
    config: &LauncherConfig,
) -> Result<Vec<Mount>> {
    fs::create_dir_all(request.etc_dir)?;
    let mut mounts = Vec::new();

    if !request.skip_user_files {
        if config.config_passwd {
            if let Some(path) = write_passwd(request)? {
                mounts.push(etc_bind(&path, "/etc/passwd"));
            }
        } else {
            debug!("passwd synthesis disabled by configuration");
        }
        if config.config_group {
            if let Some(path) = write_group(request)? {
                mounts.push(etc_bind(&path, "/etc/group"));
            }
        } else {
            debug!("group synthesis disabled by configuration");
        }
    }

    if config.config_resolv_conf
        && let Some(path) = write_resolv_conf(request)?
    {
        mounts.push(etc_bind(&path, "/etc/resolv.conf"));
    }

    Ok(mounts)
}

fn etc_bind(source: &Path, destination: &str) -> Mount {
    Mount::new(
        destination,
        "none",
        &source.to_string_lossy(),
        &["bind", "nosuid", "nodev"],
    )
}

fn write_passwd(request: &IdentityFileRequest<'_>) -> Result<Option<PathBuf>> {
    let image_passwd = request.rootfs.join("etc/passwd");
    let Ok(mut content) = fs::read_to_string(&image_passwd) else {
        warn!(path = %image_passwd.display(), "image has no /etc/passwd, skipping passwd synthesis");
        return Ok(None);
    };

    let uid = request.uid.to_string();
    let present = content
        .lines()
        .any(|line| line.split(':').nth(2) == Some(uid.as_str()));
    if !present {
        if !content.is_empty() && !content.ends_with('\n') {
            content.push('\n');
        }
        content.push_str(&format!(
            "{name}:x:{uid}:{gid}:{name}:{home}:{shell}\n",
            name = request.user_name,
            uid = request.uid,
            gid = request.gid,
            home = request.home,
            shell = DEFAULT_SHELL,
        ));
    }

    let path = request.etc_dir.join("passwd");
    fs::write(&path, content)?;
    debug!(path = %path.display(), "wrote passwd");
    Ok(Some(path))
}

fn write_group(request: &IdentityFileRequest<'_>) -> Result<Option<PathBuf>> {
    let image_group = request.rootfs.join("etc/group");
    let Ok(mut content) = fs::read_to_string(&image_group) else {
        warn!(path = %image_group.display(), "image has no /etc/group, skipping group synthesis");
        return Ok(None);
    };

    let gid = request.gid.to_string();
    let present = content
        .lines()
        .any(|line| line.split(':').nth(2) == Some(gid.as_str()));
    if !present {
        if !content.is_empty() && !content.ends_with('\n') {
            content.push('\n');
        }
        content.push_str(&format!(
            "{}:x:{}:{}\n",
            request.group_name, request.gid, request.user_name
        ));
    }

    let path = request.etc_dir.join("group");
    fs::write(&path, content)?;
    debug!(path = %path.display(), "wrote group");
    Ok(Some(path))
}

fn write_resolv_conf(request: &IdentityFileRequest<'_>) -> Result<Option<PathBuf>> {
    let content = if request.nameservers.is_empty() {
        match fs::read_to_string(HOST_RESOLV_CONF) {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "cannot read host resolv.conf, leaving image copy in place");
                return Ok(None);
            }
        }
    } else {
        request
            .nameservers
            .iter()
            .map(|ns| format!("nameserver {}\n", ns))
            .collect()
    };

    let path = request.etc_dir.join("resolv.conf");
    fs::write(&path, content)?;
    Ok(Some(path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bind_path_forms() {
        let binds = parse_bind_path("/a,/b:/c,/d:/e:ro").unwrap();
        assert_eq!(binds.len(), 3);
        assert_eq!(binds[0], BindRequest::new("/a", "/a"));
        assert_eq!(binds[1], BindRequest::new("/b", "/c"));
        assert!(binds[2].readonly);
        assert_eq!(binds[2].destination, "/e");
    }

    #[test]
    fn test_parse_bind_path_trailing_option() {
        let binds = parse_bind_path("/img.sif:/data:ro,image-src=/inner").unwrap();
        assert_eq!(binds.len(), 1);
        assert!(binds[0].readonly);
        assert!(binds[0].is_image_bind());
    }

    #[test]
    fn test_parse_bind_path_unknown_option() {
        assert!(parse_bind_path("/a:/b:bogus").is_err());
        assert!(parse_bind_path("ro").is_err());
    }

    #[test]
    fn test_parse_mount_string() {
        let bind = parse_mount_string("type=bind,source=/opt,destination=/mnt,ro").unwrap();
        assert_eq!(bind.source, "/opt");
        assert_eq!(bind.destination, "/mnt");
        assert!(bind.readonly);

        assert!(parse_mount_string("type=tmpfs,destination=/mnt").is_err());
        assert!(parse_mount_string("source=/opt,destination=/mnt").is_err());
        assert!(parse_mount_string("type=bind,destination=/mnt").is_err());
    }

    #[test]
    fn test_set_tmpfs_owner() {
        let mut mounts = vec![Mount::new(
            "/home/u",
            "tmpfs",
            "tmpfs",
            &["nosuid", "uid=1000", "gid=1000"],
        )];
        set_tmpfs_owner(&mut mounts, "/home/u", 0, 5);
        assert_eq!(mounts[0].options, vec!["nosuid", "uid=0", "gid=5"]);
    }
}
