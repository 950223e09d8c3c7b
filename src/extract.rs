//! # Rootfs Extraction
//!
//! Applies the layers of an OCI layout, bottom to top, into a bundle's
//! rootfs directory.
//!
//! ## Layer handling
//!
//! | Entry | Action |
//! |-------|--------|
//! | `.wh..wh..opq` | removes what lower layers put in that directory |
//! | `.wh.<name>` | removes `<name>` from lower layers |
//! | device node, unprivileged | skipped (cannot be created without privilege) |
//! | anything else | unpacked with permissions preserved |
//!
//! Compression is detected from the blob header: gzip and plain tar are
//! supported, zstd layers are rejected.
//!
//! ## Security
//!
//! - Entries with absolute paths or `..` components fail with
//!   [`Error::PathTraversal`]; `tar` additionally refuses to write through
//!   symlinks that leave the rootfs.
//! - Compressed layers are bounded by [`MAX_LAYER_SIZE`] and the unpacked
//!   total by [`MAX_ROOTFS_SIZE`].
//! - Ownership recorded in the tarballs is applied only when extracting as
//!   host root. Unprivileged extraction leaves files owned by the caller and
//!   keeps directories owner-writable so later layers can modify them.

use crate::constants::{EXTRACT_CANCEL_CHECK_INTERVAL, MAX_LAYER_SIZE, MAX_ROOTFS_SIZE};
use crate::error::{Error, Result};
use crate::fetch::{Descriptor, read_layout_manifest};
use crate::identity::IdMapOptions;
use async_trait::async_trait;
use flate2::read::GzDecoder;
use std::fs::{self, File};
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};
use tar::{Archive, EntryType};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const WHITEOUT_PREFIX: &str = ".wh.";
const WHITEOUT_OPAQUE: &str = ".wh..wh..opq";

const GZIP_MAGIC: &[u8] = &[0x1f, 0x8b];
const ZSTD_MAGIC: &[u8] = &[0x28, 0xb5, 0x2f, 0xfd];

/// Unpacks an OCI layout into a rootfs.
#[async_trait]
pub trait RootfsExtractor: Send + Sync {
    async fn extract(
        &self,
        layout: &Path,
        rootfs: &Path,
        options: IdMapOptions,
        cancel: &CancellationToken,
    ) -> Result<()>;
}

/// Extractor for gzip and uncompressed tar layers.
#[derive(Debug, Default, Clone, Copy)]
pub struct LayerExtractor;

#[async_trait]
impl RootfsExtractor for LayerExtractor {
    async fn extract(
        &self,
        layout: &Path,
        rootfs: &Path,
        options: IdMapOptions,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let layout = layout.to_path_buf();
        let rootfs = rootfs.to_path_buf();
        let cancel = cancel.clone();
        tokio::task::spawn_blocking(move || extract_layout(&layout, &rootfs, options, &cancel))
            .await
            .map_err(|e| Error::Internal(format!("extraction task failed: {}", e)))?
    }
}

/// Synchronous extraction of every layer in `layout`.
pub fn extract_layout(
    layout: &Path,
    rootfs: &Path,
    options: IdMapOptions,
    cancel: &CancellationToken,
) -> Result<()> {
    let manifest = read_layout_manifest(layout, None)?;
    fs::create_dir_all(rootfs)?;

    let mut total_size = 0u64;
    for layer in &manifest.layers {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled(format!("extraction of {}", layer.digest)));
        }
        debug!(digest = %layer.digest, "extracting layer");
        extract_layer(layout, layer, rootfs, options, cancel, &mut total_size)?;
    }

    info!(
        rootfs = %rootfs.display(),
        layers = manifest.layers.len(),
        bytes = total_size,
        "rootfs extracted"
    );
    Ok(())
}

fn open_layer(layout: &Path, layer: &Descriptor) -> Result<Box<dyn Read>> {
    let failed = |reason: String| Error::ExtractionFailed {
        digest: layer.digest.clone(),
        reason,
    };

    let hex = crate::cache::digest_hex(&layer.digest)?;
    let path = layout.join("blobs").join("sha256").join(hex);
    let mut file = File::open(&path).map_err(|e| failed(format!("missing blob: {}", e)))?;

    let size = file.metadata()?.len();
    if size > MAX_LAYER_SIZE {
        return Err(Error::ImageTooLarge {
            size,
            limit: MAX_LAYER_SIZE,
        });
    }

    let mut magic = [0u8; 4];
    let n = file.read(&mut magic)?;
    file.seek(SeekFrom::Start(0))?;
    let header = &magic[..n];

    if header.starts_with(ZSTD_MAGIC) || layer.media_type.ends_with("+zstd") {
        return Err(failed("zstd compressed layers are not supported".to_string()));
    }
    let reader = BufReader::new(file);
    if header.starts_with(GZIP_MAGIC) {
        Ok(Box::new(GzDecoder::new(reader)))
    } else {
        Ok(Box::new(reader))
    }
}

/// Rejects absolute paths and `..` components.
fn checked_relative(path: &Path) -> Result<PathBuf> {
    let mut clean = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(Error::PathTraversal {
                    path: path.display().to_string(),
                });
            }
        }
    }
    Ok(clean)
}

/// Resolves `relative` under `rootfs` without following symlinks.
///
/// Returns `None` when a component does not exist, so there is nothing to
/// white out. A symlinked component is a traversal attempt: an earlier
/// layer may point it anywhere on the host.
fn resolve_in_rootfs(rootfs: &Path, relative: &Path) -> Result<Option<PathBuf>> {
    let mut resolved = rootfs.to_path_buf();
    for component in relative.components() {
        resolved.push(component);
        match fs::symlink_metadata(&resolved) {
            Ok(meta) if meta.file_type().is_symlink() => {
                return Err(Error::PathTraversal {
                    path: relative.display().to_string(),
                });
            }
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => return Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        }
    }
    Ok(Some(resolved))
}

/// Removes `path` itself. A symlink is unlinked, never followed.
fn remove_path(path: &Path) -> std::io::Result<()> {
    let result = match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) => Err(e),
    };
    match result {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

fn clear_dir(dir: &Path) -> std::io::Result<()> {
    for entry in fs::read_dir(dir)? {
        remove_path(&entry?.path())?;
    }
    Ok(())
}

fn extract_layer(
    layout: &Path,
    layer: &Descriptor,
    rootfs: &Path,
    options: IdMapOptions,
    cancel: &CancellationToken,
    total_size: &mut u64,
) -> Result<()> {
    let failed = |e: std::io::Error| Error::ExtractionFailed {
        digest: layer.digest.clone(),
        reason: e.to_string(),
    };

    let mut archive = Archive::new(open_layer(layout, layer)?);
    archive.set_preserve_permissions(true);
    archive.set_preserve_ownerships(options.preserve_ownership);
    archive.set_unpack_xattrs(false);
    archive.set_overwrite(true);

    for (index, entry) in archive.entries().map_err(failed)?.enumerate() {
        if index % EXTRACT_CANCEL_CHECK_INTERVAL == 0 && cancel.is_cancelled() {
            return Err(Error::Cancelled(format!("extraction of {}", layer.digest)));
        }

        let mut entry = entry.map_err(failed)?;
        let path = checked_relative(&entry.path().map_err(failed)?)?;

        let file_name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        if file_name.starts_with(WHITEOUT_PREFIX) {
            let parent = path.parent().unwrap_or(Path::new(""));
            let Some(dir) = resolve_in_rootfs(rootfs, parent)? else {
                continue;
            };
            if file_name == WHITEOUT_OPAQUE {
                clear_dir(&dir).map_err(failed)?;
                continue;
            }
            let target = &file_name[WHITEOUT_PREFIX.len()..];
            if matches!(target, "" | "." | "..") {
                return Err(Error::PathTraversal {
                    path: path.display().to_string(),
                });
            }
            remove_path(&dir.join(target)).map_err(failed)?;
            continue;
        }

        let entry_type = entry.header().entry_type();
        if !options.preserve_ownership
            && matches!(entry_type, EntryType::Char | EntryType::Block | EntryType::Fifo)
        {
            debug!(path = %path.display(), "skipping special file in unprivileged extraction");
            continue;
        }

        *total_size += entry.size();
        if *total_size > MAX_ROOTFS_SIZE {
            return Err(Error::ImageTooLarge {
                size: *total_size,
                limit: MAX_ROOTFS_SIZE,
            });
        }

        entry.unpack_in(rootfs).map_err(failed)?;

        if !options.preserve_ownership && entry_type == EntryType::Directory {
            let dir = rootfs.join(&path);
            let meta = fs::symlink_metadata(&dir)?;
            let mut perms = meta.permissions();
            if meta.is_dir() && perms.mode() & 0o700 != 0o700 {
                perms.set_mode(perms.mode() | 0o700);
                fs::set_permissions(&dir, perms)?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::{ImageManifest, LayoutWriter, MEDIA_TYPE_LAYER_GZIP, MEDIA_TYPE_LAYER_TAR};
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::io::Write;
    use tempfile::TempDir;

    enum Item<'a> {
        File(&'a str, &'a [u8]),
        Dir(&'a str),
        Symlink(&'a str, &'a Path),
    }

    fn tarball(items: &[Item<'_>]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for item in items {
            let mut header = tar::Header::new_gnu();
            match item {
                Item::File(path, data) => {
                    header.set_entry_type(EntryType::Regular);
                    header.set_size(data.len() as u64);
                    header.set_mode(0o644);
                    builder.append_data(&mut header, path, *data).unwrap();
                }
                Item::Dir(path) => {
                    header.set_entry_type(EntryType::Directory);
                    header.set_size(0);
                    header.set_mode(0o755);
                    builder.append_data(&mut header, path, std::io::empty()).unwrap();
                }
                Item::Symlink(path, target) => {
                    header.set_entry_type(EntryType::Symlink);
                    header.set_size(0);
                    header.set_mode(0o777);
                    header.set_link_name(target).unwrap();
                    builder.append_data(&mut header, path, std::io::empty()).unwrap();
                }
            }
        }
        builder.into_inner().unwrap()
    }

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    fn layout(root: &Path, layers: &[(Vec<u8>, &str)]) {
        let writer = LayoutWriter::create(root).unwrap();
        let config = br#"{"config":{}}"#;
        let config_digest = writer.put_bytes(config).unwrap();
        let layers = layers
            .iter()
            .map(|(data, media_type)| {
                Descriptor::new(media_type, writer.put_bytes(data).unwrap(), data.len() as u64)
            })
            .collect();
        writer
            .finish(&ImageManifest {
                schema_version: 2,
                media_type: None,
                config: Descriptor::new("application/vnd.oci.image.config.v1+json", config_digest, 13),
                layers,
            })
            .unwrap();
    }

    const UNPRIVILEGED: IdMapOptions = IdMapOptions {
        preserve_ownership: false,
    };

    #[test]
    fn test_layers_and_whiteouts() {
        let temp = TempDir::new().unwrap();
        let lower = tarball(&[
            Item::Dir("etc"),
            Item::File("etc/passwd", b"root:x:0:0::/root:/bin/sh\n"),
            Item::File("etc/old", b"old"),
            Item::Dir("data"),
            Item::File("data/a", b"a"),
        ]);
        let upper = tarball(&[
            Item::File("etc/.wh.old", b""),
            Item::File("data/.wh..wh..opq", b""),
            Item::File("data/b", b"b"),
        ]);
        layout(
            temp.path(),
            &[(gzip(&lower), MEDIA_TYPE_LAYER_GZIP), (upper, MEDIA_TYPE_LAYER_TAR)],
        );

        let rootfs = temp.path().join("rootfs");
        extract_layout(temp.path(), &rootfs, UNPRIVILEGED, &CancellationToken::new()).unwrap();

        assert!(rootfs.join("etc/passwd").is_file());
        assert!(!rootfs.join("etc/old").exists());
        assert!(!rootfs.join("data/a").exists());
        assert_eq!(fs::read(rootfs.join("data/b")).unwrap(), b"b");
    }

    /// Host directory with two files an image must never reach.
    fn victim_dir(temp: &TempDir) -> PathBuf {
        let victim = temp.path().join("victim");
        fs::create_dir(&victim).unwrap();
        fs::write(victim.join("precious"), b"keep").unwrap();
        fs::write(victim.join("other"), b"keep").unwrap();
        victim
    }

    #[test]
    fn test_whiteout_through_symlink_rejected() {
        for whiteout in ["evil/.wh.precious", "evil/.wh..wh..opq"] {
            let temp = TempDir::new().unwrap();
            let victim = victim_dir(&temp);
            let image = temp.path().join("image");
            let lower = tarball(&[Item::Symlink("evil", &victim)]);
            let upper = tarball(&[Item::File(whiteout, b"")]);
            layout(
                &image,
                &[(lower, MEDIA_TYPE_LAYER_TAR), (upper, MEDIA_TYPE_LAYER_TAR)],
            );

            let err = extract_layout(
                &image,
                &temp.path().join("rootfs"),
                UNPRIVILEGED,
                &CancellationToken::new(),
            )
            .unwrap_err();
            assert!(matches!(err, Error::PathTraversal { .. }), "{}: {:?}", whiteout, err);
            assert!(victim.join("precious").is_file(), "{}", whiteout);
            assert!(victim.join("other").is_file(), "{}", whiteout);
        }
    }

    #[test]
    fn test_whiteout_of_parent_rejected() {
        let temp = TempDir::new().unwrap();
        let image = temp.path().join("image");
        let layer = tarball(&[Item::Dir("a"), Item::File("a/keep", b"k"), Item::File("a/.wh...", b"")]);
        layout(&image, &[(layer, MEDIA_TYPE_LAYER_TAR)]);

        let rootfs = temp.path().join("rootfs");
        let err = extract_layout(&image, &rootfs, UNPRIVILEGED, &CancellationToken::new()).unwrap_err();
        assert!(matches!(err, Error::PathTraversal { .. }));
        assert!(rootfs.join("a/keep").is_file());
    }

    #[test]
    fn test_whiteout_removes_symlink_not_target() {
        let temp = TempDir::new().unwrap();
        let victim = victim_dir(&temp);
        let image = temp.path().join("image");
        let lower = tarball(&[Item::Symlink("link", &victim)]);
        let upper = tarball(&[Item::File(".wh.link", b""), Item::File("missing/.wh.x", b"")]);
        layout(
            &image,
            &[(lower, MEDIA_TYPE_LAYER_TAR), (upper, MEDIA_TYPE_LAYER_TAR)],
        );

        let rootfs = temp.path().join("rootfs");
        extract_layout(&image, &rootfs, UNPRIVILEGED, &CancellationToken::new()).unwrap();
        assert!(fs::symlink_metadata(rootfs.join("link")).is_err());
        assert!(victim.join("precious").is_file());
    }

    #[test]
    fn test_path_traversal_rejected() {
        assert!(checked_relative(Path::new("../escape")).is_err());
        assert!(checked_relative(Path::new("/abs")).is_err());
        assert_eq!(
            checked_relative(Path::new("./a..b/c")).unwrap(),
            PathBuf::from("a..b/c")
        );
    }

    #[test]
    fn test_zstd_rejected() {
        let temp = TempDir::new().unwrap();
        let mut data = ZSTD_MAGIC.to_vec();
        data.extend_from_slice(b"payload");
        layout(temp.path(), &[(data, "application/vnd.oci.image.layer.v1.tar+zstd")]);

        let err = extract_layout(
            temp.path(),
            &temp.path().join("rootfs"),
            UNPRIVILEGED,
            &CancellationToken::new(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::ExtractionFailed { .. }));
    }

    #[tokio::test]
    async fn test_cancelled_before_first_layer() {
        let temp = TempDir::new().unwrap();
        layout(temp.path(), &[(tarball(&[Item::File("a", b"a")]), MEDIA_TYPE_LAYER_TAR)]);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = LayerExtractor
            .extract(temp.path(), &temp.path().join("rootfs"), UNPRIVILEGED, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled(_)));
        assert!(!temp.path().join("rootfs/a").exists());
    }
}
