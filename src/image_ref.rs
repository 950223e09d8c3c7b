//! # Image References
//!
//! A launch names its image as `transport:payload`. The accepted transports
//! form a closed set, parsed once at launch start into [`ImageReference`]:
//!
//! | Input | Variant |
//! |-------|---------|
//! | `docker://alpine:3.19` | [`ImageReference::Docker`] |
//! | `docker-archive:/tmp/img.tar` | [`ImageReference::DockerArchive`] |
//! | `docker-daemon:alpine:3.19` | [`ImageReference::DockerDaemon`] |
//! | `oci:/srv/layout[:tag]` | [`ImageReference::OciLayout`] |
//! | `oci-archive:/tmp/layout.tar[:tag]` | [`ImageReference::OciArchive`] |
//! | `oci-sif:/srv/img.sif` | [`ImageReference::OciSif`] |
//! | `/srv/img.sif` | [`ImageReference::BarePath`] |
//!
//! A bare path is resolved by [`ImageReference::normalize`], which sniffs the
//! file header: SIF files become `OciSif`, anything else is rejected.

use crate::constants::MAX_IMAGE_REF_LEN;
use crate::error::{Error, Result};
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Offset and value of the SIF magic, following the launch script header.
const SIF_MAGIC_OFFSET: usize = 32;
const SIF_MAGIC: &[u8] = b"SIF_MAGIC";

/// Squashfs superblock magic at offset 0 (little endian "hsqs").
const SQUASHFS_MAGIC: &[u8] = b"hsqs";

/// ext2/3/4 superblock magic at offset 1080.
const EXT_MAGIC_OFFSET: usize = 1080;
const EXT_MAGIC: &[u8] = &[0x53, 0xEF];

/// A parsed image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageReference {
    /// Registry image, `registry/repo[:tag|@digest]`.
    Docker(String),
    /// Tarball written by `docker save`.
    DockerArchive(PathBuf),
    /// Image held by a local Docker daemon.
    DockerDaemon(String),
    /// OCI image layout directory, optionally selecting a tag.
    OciLayout { path: PathBuf, tag: Option<String> },
    /// Tar archive of an OCI image layout.
    OciArchive { path: PathBuf, tag: Option<String> },
    /// OCI image packaged in a SIF container.
    OciSif(PathBuf),
    /// Unprefixed local path, not yet sniffed.
    BarePath(PathBuf),
}

impl ImageReference {
    /// Parses a `transport:payload` string.
    ///
    /// Parsing is purely syntactic; nothing is read from disk.
    pub fn parse(reference: &str) -> Result<Self> {
        let invalid = |reason: &str| Error::InvalidImageReference {
            reference: reference.to_string(),
            reason: reason.to_string(),
        };

        if reference.is_empty() {
            return Err(invalid("empty reference"));
        }
        if reference.len() > MAX_IMAGE_REF_LEN {
            return Err(invalid(&format!("exceeds {} bytes", MAX_IMAGE_REF_LEN)));
        }

        if let Some(payload) = reference.strip_prefix("docker://") {
            validate_registry_ref(payload).map_err(|r| invalid(r))?;
            return Ok(Self::Docker(payload.to_string()));
        }
        if let Some(payload) = reference.strip_prefix("docker-archive:") {
            return Ok(Self::DockerArchive(non_empty_path(payload).map_err(|r| invalid(r))?));
        }
        if let Some(payload) = reference.strip_prefix("docker-daemon:") {
            validate_registry_ref(payload).map_err(|r| invalid(r))?;
            return Ok(Self::DockerDaemon(payload.to_string()));
        }
        if let Some(payload) = reference.strip_prefix("oci-archive:") {
            let (path, tag) = split_tag(payload);
            return Ok(Self::OciArchive {
                path: non_empty_path(path).map_err(|r| invalid(r))?,
                tag,
            });
        }
        if let Some(payload) = reference.strip_prefix("oci-sif:") {
            return Ok(Self::OciSif(non_empty_path(payload).map_err(|r| invalid(r))?));
        }
        if let Some(payload) = reference.strip_prefix("oci:") {
            let (path, tag) = split_tag(payload);
            return Ok(Self::OciLayout {
                path: non_empty_path(path).map_err(|r| invalid(r))?,
                tag,
            });
        }

        if let Some((scheme, _)) = reference.split_once("://") {
            return Err(invalid(&format!("unsupported transport '{}'", scheme)));
        }

        Ok(Self::BarePath(PathBuf::from(reference)))
    }

    /// Resolves a [`ImageReference::BarePath`] by sniffing the file.
    ///
    /// Other variants are returned unchanged.
    pub fn normalize(self) -> Result<Self> {
        let Self::BarePath(path) = self else {
            return Ok(self);
        };

        match sniff_image_file(&path)? {
            LocalImageKind::Sif => Ok(Self::OciSif(path)),
            LocalImageKind::Squashfs | LocalImageKind::Ext => Err(Error::Configuration(format!(
                "{} is a non-OCI image file; only OCI-SIF local images are supported",
                path.display()
            ))),
            LocalImageKind::Unknown => Err(Error::Configuration(format!(
                "{} is not a recognised image file",
                path.display()
            ))),
        }
    }

    /// Transport name as written in references.
    pub fn transport(&self) -> &'static str {
        match self {
            Self::Docker(_) => "docker",
            Self::DockerArchive(_) => "docker-archive",
            Self::DockerDaemon(_) => "docker-daemon",
            Self::OciLayout { .. } => "oci",
            Self::OciArchive { .. } => "oci-archive",
            Self::OciSif(_) => "oci-sif",
            Self::BarePath(_) => "",
        }
    }

    /// Stable key used to name cache entries for this reference.
    pub fn cache_key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Docker(r) => write!(f, "docker://{}", r),
            Self::DockerArchive(p) => write!(f, "docker-archive:{}", p.display()),
            Self::DockerDaemon(r) => write!(f, "docker-daemon:{}", r),
            Self::OciLayout { path, tag } | Self::OciArchive { path, tag } => {
                write!(f, "{}:{}", self.transport(), path.display())?;
                if let Some(tag) = tag {
                    write!(f, ":{}", tag)?;
                }
                Ok(())
            }
            Self::OciSif(p) => write!(f, "oci-sif:{}", p.display()),
            Self::BarePath(p) => write!(f, "{}", p.display()),
        }
    }
}

impl FromStr for ImageReference {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Registry references: alphanumerics plus `/:.-_@`.
fn validate_registry_ref(payload: &str) -> std::result::Result<(), &'static str> {
    if payload.is_empty() {
        return Err("missing image name");
    }
    if !payload.chars().all(|c| {
        c.is_ascii_alphanumeric() || c == '/' || c == ':' || c == '.' || c == '-' || c == '_' || c == '@'
    }) {
        return Err("contains invalid characters");
    }
    Ok(())
}

fn non_empty_path(payload: &str) -> std::result::Result<PathBuf, &'static str> {
    if payload.is_empty() {
        return Err("missing path");
    }
    Ok(PathBuf::from(payload))
}

/// Splits `path[:tag]`. A trailing segment containing `/` is part of the path.
fn split_tag(payload: &str) -> (&str, Option<String>) {
    match payload.rsplit_once(':') {
        Some((path, tag)) if !tag.is_empty() && !tag.contains('/') && !path.is_empty() => {
            (path, Some(tag.to_string()))
        }
        _ => (payload, None),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LocalImageKind {
    Sif,
    Squashfs,
    Ext,
    Unknown,
}

fn sniff_image_file(path: &Path) -> Result<LocalImageKind> {
    let mut file = File::open(path).map_err(|e| Error::InvalidImageReference {
        reference: path.display().to_string(),
        reason: e.to_string(),
    })?;

    let mut header = Vec::with_capacity(EXT_MAGIC_OFFSET + EXT_MAGIC.len());
    file.by_ref()
        .take((EXT_MAGIC_OFFSET + EXT_MAGIC.len()) as u64)
        .read_to_end(&mut header)?;

    let at = |offset: usize, magic: &[u8]| {
        header
            .get(offset..offset + magic.len())
            .is_some_and(|bytes| bytes == magic)
    };

    Ok(if at(SIF_MAGIC_OFFSET, SIF_MAGIC) {
        LocalImageKind::Sif
    } else if at(0, SQUASHFS_MAGIC) {
        LocalImageKind::Squashfs
    } else if at(EXT_MAGIC_OFFSET, EXT_MAGIC) {
        LocalImageKind::Ext
    } else {
        LocalImageKind::Unknown
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_docker_drops_slashes() {
        assert_eq!(
            ImageReference::parse("docker://alpine:3.19").unwrap(),
            ImageReference::Docker("alpine:3.19".to_string())
        );
    }

    #[test]
    fn test_oci_layout_with_and_without_tag() {
        assert_eq!(
            ImageReference::parse("oci:/srv/layout:v1").unwrap(),
            ImageReference::OciLayout {
                path: PathBuf::from("/srv/layout"),
                tag: Some("v1".to_string())
            }
        );
        assert_eq!(
            ImageReference::parse("oci:/srv/layout").unwrap(),
            ImageReference::OciLayout {
                path: PathBuf::from("/srv/layout"),
                tag: None
            }
        );
    }

    #[test]
    fn test_unknown_scheme_rejected() {
        let err = ImageReference::parse("library://alpine").unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_sif_sniffed_from_bare_path() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("image.sif");
        let mut data = b"#!/usr/bin/env run-singularity\n\0".to_vec();
        data.extend_from_slice(SIF_MAGIC);
        data.resize(2048, 0);
        std::fs::write(&path, data).unwrap();

        let reference = ImageReference::parse(path.to_str().unwrap())
            .unwrap()
            .normalize()
            .unwrap();
        assert_eq!(reference, ImageReference::OciSif(path));
    }

    #[test]
    fn test_squashfs_bare_path_rejected() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("image.sqfs");
        let mut data = SQUASHFS_MAGIC.to_vec();
        data.resize(128, 0);
        std::fs::write(&path, data).unwrap();

        let err = ImageReference::parse(path.to_str().unwrap())
            .unwrap()
            .normalize()
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_display_round_trips() {
        for input in [
            "docker://alpine:3.19",
            "docker-archive:/tmp/a.tar",
            "oci:/srv/layout:v1",
            "oci-archive:/tmp/l.tar",
            "oci-sif:/srv/i.sif",
        ] {
            assert_eq!(ImageReference::parse(input).unwrap().to_string(), input);
        }
    }
}
