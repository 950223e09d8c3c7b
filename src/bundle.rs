//! # Bundle Manager
//!
//! Owns one launch's bundle directory from creation to removal:
//!
//! ```text
//! <base>/oci-bundle-<uuid>/
//!   config.json          # runtime spec, rewritten once finalized
//!   rootfs/              # extracted image filesystem
//!   etc/                 # synthesized passwd/group/resolv.conf
//! ```
//!
//! ## Protocol
//!
//! ```text
//! Bundle::new ─► create(spec, image) ─► image_spec() ─► update(spec) ─► delete()
//!                  │
//!                  ├─ write skeleton + initial config.json
//!                  ├─ fetch into a private temporary OCI layout
//!                  ├─ extract layers into rootfs/
//!                  └─ drop the temporary layout
//! ```
//!
//! ## Cleanup
//!
//! The temporary layout is a [`tempfile::TempDir`] and disappears on every
//! exit path. The bundle itself is deleted when the [`Bundle`] is dropped
//! unless it was created with `keep` set, so a failed or cancelled launch
//! never leaves a partial bundle behind.
//!
//! Deleting first detaches anything still mounted under the bundle (read
//! from `/proc/self/mountinfo`). Deleting an absent bundle succeeds.

use crate::constants::{
    BUNDLE_CONFIG_FILE, BUNDLE_DIR_PREFIX, BUNDLE_ETC_DIR, BUNDLE_ROOTFS_DIR, LAYOUT_DIR_PREFIX,
};
use crate::error::{Error, Result};
use crate::extract::RootfsExtractor;
use crate::fetch::{ImageFetcher, ImageSpec};
use crate::identity::IdMapOptions;
use crate::image_ref::ImageReference;
use crate::spec::RuntimeSpec;
use nix::mount::{umount2, MntFlags};
use std::fs;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Where the image comes from and how to unpack it.
pub struct ImageSource<'a> {
    pub reference: &'a ImageReference,
    pub fetcher: &'a dyn ImageFetcher,
    pub extractor: &'a dyn RootfsExtractor,
    pub id_map: IdMapOptions,
}

/// A launch's bundle directory.
#[derive(Debug)]
pub struct Bundle {
    path: PathBuf,
    image_spec: Option<ImageSpec>,
    keep: bool,
}

impl Bundle {
    /// Allocates a fresh, private bundle directory under `base_dir`.
    pub fn new(base_dir: &Path, keep: bool) -> Result<Self> {
        fs::create_dir_all(base_dir).map_err(|e| {
            Error::BundleBuildFailed(format!("cannot create {}: {}", base_dir.display(), e))
        })?;
        let path = base_dir.join(format!(
            "{}{}",
            BUNDLE_DIR_PREFIX,
            uuid::Uuid::now_v7().simple()
        ));
        fs::DirBuilder::new()
            .mode(0o700)
            .create(&path)
            .map_err(|e| {
                Error::BundleBuildFailed(format!("cannot create {}: {}", path.display(), e))
            })?;
        debug!(path = %path.display(), "bundle directory allocated");
        Ok(Self {
            path,
            image_spec: None,
            keep,
        })
    }

    /// Writes the skeleton and initial spec, then fetches and extracts the
    /// image into `rootfs/`.
    pub async fn create(
        &mut self,
        spec: &RuntimeSpec,
        source: ImageSource<'_>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        fs::create_dir_all(self.rootfs())?;
        fs::create_dir_all(self.etc_dir())?;
        self.update(spec)?;

        let layout = tempfile::Builder::new()
            .prefix(LAYOUT_DIR_PREFIX)
            .tempdir()
            .map_err(|e| Error::BundleBuildFailed(format!("cannot create image layout: {}", e)))?;

        if cancel.is_cancelled() {
            return Err(Error::Cancelled("bundle creation".to_string()));
        }
        let fetched = source
            .fetcher
            .fetch(source.reference, layout.path(), cancel)
            .await?;

        if cancel.is_cancelled() {
            return Err(Error::Cancelled("bundle creation".to_string()));
        }
        source
            .extractor
            .extract(&fetched.layout, &self.rootfs(), source.id_map, cancel)
            .await?;

        drop(layout);

        info!(
            path = %self.path.display(),
            image = %source.reference,
            layers = fetched.manifest.layers.len(),
            "bundle created"
        );
        self.image_spec = Some(fetched.spec);
        Ok(())
    }

    /// The image config recorded by [`Bundle::create`].
    pub fn image_spec(&self) -> Result<&ImageSpec> {
        self.image_spec.as_ref().ok_or_else(|| Error::InvalidBundle {
            path: self.path.clone(),
            reason: "image has not been fetched yet".to_string(),
        })
    }

    /// Persists `spec` as `config.json`, returning its path.
    pub fn update(&self, spec: &RuntimeSpec) -> Result<PathBuf> {
        let config_path = self.config_path();
        spec.save(&config_path).map_err(|e| {
            Error::BundleBuildFailed(format!("failed to write {}: {}", config_path.display(), e))
        })?;
        debug!(path = %config_path.display(), "runtime spec written");
        Ok(config_path)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn rootfs(&self) -> PathBuf {
        self.path.join(BUNDLE_ROOTFS_DIR)
    }

    /// Side-tree for synthesized identity files.
    pub fn etc_dir(&self) -> PathBuf {
        self.path.join(BUNDLE_ETC_DIR)
    }

    pub fn config_path(&self) -> PathBuf {
        self.path.join(BUNDLE_CONFIG_FILE)
    }

    pub fn is_kept(&self) -> bool {
        self.keep
    }

    /// Detaches mounts under the bundle and removes it.
    pub fn delete(&self) -> Result<()> {
        for mount_point in mounts_under(&self.path) {
            debug!(mount = %mount_point.display(), "detaching mount under bundle");
            if let Err(e) = umount2(&mount_point, MntFlags::MNT_DETACH) {
                warn!(mount = %mount_point.display(), error = %e, "failed to unmount");
            }
        }

        match fs::remove_dir_all(&self.path) {
            Ok(()) => {
                info!(path = %self.path.display(), "bundle deleted");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::BundleBuildFailed(format!(
                "failed to remove {}: {}",
                self.path.display(),
                e
            ))),
        }
    }
}

impl Drop for Bundle {
    fn drop(&mut self) {
        if self.keep {
            info!(path = %self.path.display(), "keeping bundle");
            return;
        }
        if let Err(e) = self.delete() {
            warn!(path = %self.path.display(), error = %e, "bundle cleanup failed");
        }
    }
}

/// Mount points at or below `root`, deepest first.
fn mounts_under(root: &Path) -> Vec<PathBuf> {
    let Ok(mountinfo) = fs::read_to_string("/proc/self/mountinfo") else {
        return Vec::new();
    };
    let mut points: Vec<PathBuf> = mountinfo
        .lines()
        .filter_map(|line| line.split(' ').nth(4))
        .map(|field| PathBuf::from(unescape_mountinfo(field)))
        .filter(|p| p.starts_with(root))
        .collect();
    points.sort();
    points.dedup();
    points.sort_by_key(|p| std::cmp::Reverse(p.components().count()));
    points
}

/// Decodes the octal escapes (`\040` for space) used in mountinfo paths.
fn unescape_mountinfo(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let escaped = (bytes[i] == b'\\' && i + 3 < bytes.len())
            .then(|| std::str::from_utf8(&bytes[i + 1..i + 4]).ok())
            .flatten()
            .and_then(|digits| u8::from_str_radix(digits, 8).ok());
        match escaped {
            Some(value) => {
                out.push(value);
                i += 4;
            }
            None => {
                out.push(bytes[i]);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_new_bundle_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let temp = TempDir::new().unwrap();
        let bundle = Bundle::new(temp.path(), false).unwrap();
        let mode = fs::metadata(bundle.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
        assert!(bundle
            .path()
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with(BUNDLE_DIR_PREFIX));
    }

    #[test]
    fn test_drop_removes_unless_kept() {
        let temp = TempDir::new().unwrap();
        let dropped = Bundle::new(temp.path(), false).unwrap();
        let dropped_path = dropped.path().to_path_buf();
        drop(dropped);
        assert!(!dropped_path.exists());

        let kept = Bundle::new(temp.path(), true).unwrap();
        let kept_path = kept.path().to_path_buf();
        drop(kept);
        assert!(kept_path.exists());
    }

    #[test]
    fn test_image_spec_before_create() {
        let temp = TempDir::new().unwrap();
        let bundle = Bundle::new(temp.path(), false).unwrap();
        assert!(matches!(
            bundle.image_spec(),
            Err(Error::InvalidBundle { .. })
        ));
    }

    #[test]
    fn test_unescape_mountinfo() {
        assert_eq!(unescape_mountinfo("/tmp/a\\040b"), "/tmp/a b");
        assert_eq!(unescape_mountinfo("/plain"), "/plain");
        assert_eq!(unescape_mountinfo("/trailing\\"), "/trailing\\");
    }
}
