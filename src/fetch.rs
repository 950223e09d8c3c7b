//! # Image Fetching
//!
//! Turns an [`ImageReference`] into a private OCI image layout on disk plus
//! the parsed image config. The layout is temporary: the bundle manager
//! extracts it into a rootfs and then deletes it.
//!
//! ## Transports
//!
//! | Transport | Source |
//! |-----------|--------|
//! | `docker` | registry pull through `oci-distribution`, multi-arch index resolved to the host platform |
//! | `oci` | existing layout directory, manifest selected by tag annotation |
//! | `oci-archive` | tar of a layout, unpacked to a scratch directory first |
//! | `docker-archive` | `docker save` tarball, converted from its `manifest.json` |
//! | `docker-daemon`, `oci-sif` | rejected with [`Error::FetchFailed`] |
//!
//! ## Layout written
//!
//! ```text
//! <layout>/
//!   oci-layout
//!   index.json          # one manifest descriptor
//!   blobs/sha256/<hex>  # manifest, config, layers
//! ```
//!
//! ## Security
//!
//! - Every blob is verified against its sha256 digest before it lands in
//!   the layout (or the shared cache).
//! - Layer count and size are bounded by [`MAX_LAYERS`] and
//!   [`MAX_LAYER_SIZE`]; manifests and configs by [`MAX_METADATA_SIZE`].
//! - Registry calls are bounded by [`IMAGE_PULL_TIMEOUT`].
//! - Cancellation is observed before every blob and during every download.

use crate::cache::{BlobCache, digest_hex, sha256_digest, write_atomic};
use crate::constants::{
    IMAGE_PULL_TIMEOUT, LAYOUT_DIR_PREFIX, MAX_LAYER_SIZE, MAX_LAYERS, MAX_METADATA_SIZE,
};
use crate::error::{Error, Result};
use crate::image_ref::ImageReference;
use async_trait::async_trait;
use oci_distribution::client::{ClientConfig, ClientProtocol};
use oci_distribution::manifest::{OciDescriptor, OciManifest};
use oci_distribution::secrets::RegistryAuth;
use oci_distribution::{Client, Reference};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::future::Future;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub const MEDIA_TYPE_OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const MEDIA_TYPE_OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
pub const MEDIA_TYPE_OCI_CONFIG: &str = "application/vnd.oci.image.config.v1+json";
pub const MEDIA_TYPE_LAYER_TAR: &str = "application/vnd.oci.image.layer.v1.tar";
pub const MEDIA_TYPE_LAYER_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";
const MEDIA_TYPE_DOCKER_LIST: &str = "application/vnd.docker.distribution.manifest.list.v2+json";

/// Annotation naming a manifest in a layout index.
pub const ANNOTATION_REF_NAME: &str = "org.opencontainers.image.ref.name";

// =============================================================================
// Image config
// =============================================================================

/// Runtime-relevant part of an image config (`config` in the config blob).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ImageConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cmd: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
}

impl ImageConfig {
    pub fn entrypoint(&self) -> &[String] {
        self.entrypoint.as_deref().unwrap_or_default()
    }

    pub fn cmd(&self) -> &[String] {
        self.cmd.as_deref().unwrap_or_default()
    }

    pub fn env(&self) -> &[String] {
        self.env.as_deref().unwrap_or_default()
    }

    pub fn user(&self) -> &str {
        self.user.as_deref().unwrap_or_default()
    }

    pub fn working_dir(&self) -> &str {
        self.working_dir.as_deref().unwrap_or_default()
    }
}

/// The image config blob.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub architecture: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os: Option<String>,
    /// `null` in some Docker-built images.
    #[serde(default, deserialize_with = "null_as_default")]
    pub config: ImageConfig,
}

fn null_as_default<'de, D>(deserializer: D) -> std::result::Result<ImageConfig, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<ImageConfig>::deserialize(deserializer)?.unwrap_or_default())
}

// =============================================================================
// Layout types
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformSpec {
    pub architecture: String,
    pub os: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

/// Content descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: String,
    pub digest: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<PlatformSpec>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl Descriptor {
    pub fn new(media_type: &str, digest: String, size: u64) -> Self {
        Self {
            media_type: media_type.to_string(),
            digest,
            size,
            platform: None,
            annotations: BTreeMap::new(),
        }
    }

    fn from_oci(desc: &OciDescriptor) -> Self {
        Self::new(&desc.media_type, desc.digest.clone(), desc.size.max(0) as u64)
    }

    fn to_oci(&self) -> OciDescriptor {
        OciDescriptor {
            media_type: self.media_type.clone(),
            digest: self.digest.clone(),
            size: self.size as i64,
            urls: None,
            annotations: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageIndex {
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub manifests: Vec<Descriptor>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageManifest {
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub config: Descriptor,
    pub layers: Vec<Descriptor>,
}

/// Result of a fetch.
#[derive(Debug, Clone)]
pub struct FetchedImage {
    /// Layout directory holding the image.
    pub layout: PathBuf,
    pub manifest: ImageManifest,
    pub spec: ImageSpec,
}

// =============================================================================
// Layout reading and writing
// =============================================================================

fn fetch_error(reference: impl ToString, reason: impl ToString) -> Error {
    Error::FetchFailed {
        reference: reference.to_string(),
        reason: reason.to_string(),
    }
}

fn layout_blob_path(root: &Path, digest: &str) -> Result<PathBuf> {
    Ok(root.join("blobs").join("sha256").join(digest_hex(digest)?))
}

/// Reads a blob from a layout, refusing anything over `limit` bytes.
pub fn read_layout_blob(root: &Path, digest: &str, limit: u64) -> Result<Vec<u8>> {
    let path = layout_blob_path(root, digest)?;
    let size = fs::metadata(&path)
        .map_err(|e| fetch_error(digest, format!("missing blob in {}: {}", root.display(), e)))?
        .len();
    if size > limit {
        return Err(Error::ImageTooLarge { size, limit });
    }
    Ok(fs::read(&path)?)
}

fn parse_json<T: for<'de> Deserialize<'de>>(what: &str, data: &[u8]) -> Result<T> {
    serde_json::from_slice(data).map_err(|e| fetch_error(what, format!("invalid JSON: {}", e)))
}

/// `(os, architecture)` of the host in OCI terms.
pub fn host_platform() -> (&'static str, &'static str) {
    let arch = match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "x86" => "386",
        "powerpc64" => "ppc64le",
        other => other,
    };
    ("linux", arch)
}

fn matches_host(platform: Option<&PlatformSpec>) -> bool {
    let (os, arch) = host_platform();
    platform.is_some_and(|p| p.os == os && p.architecture == arch)
}

/// Resolves the image manifest of a layout.
///
/// With a tag the index entry annotated with that ref name is used;
/// otherwise the index must hold exactly one entry. A nested index is
/// resolved to the host platform.
pub fn read_layout_manifest(root: &Path, tag: Option<&str>) -> Result<ImageManifest> {
    let index_data = fs::read(root.join("index.json"))
        .map_err(|e| fetch_error(root.display(), format!("cannot read index.json: {}", e)))?;
    let index: ImageIndex = parse_json("index.json", &index_data)?;

    let entry = match tag {
        Some(tag) => index
            .manifests
            .iter()
            .find(|m| m.annotations.get(ANNOTATION_REF_NAME).is_some_and(|r| r.as_str() == tag))
            .ok_or_else(|| fetch_error(root.display(), format!("no manifest tagged '{}'", tag)))?,
        None => match index.manifests.as_slice() {
            [only] => only,
            [] => return Err(fetch_error(root.display(), "index.json lists no manifests")),
            _ => return Err(fetch_error(
                root.display(),
                "index.json lists several manifests, a tag is required",
            )),
        },
    };

    let mut descriptor = entry.clone();
    if descriptor.media_type == MEDIA_TYPE_OCI_INDEX || descriptor.media_type == MEDIA_TYPE_DOCKER_LIST {
        let nested: ImageIndex = parse_json(
            &descriptor.digest,
            &read_layout_blob(root, &descriptor.digest, MAX_METADATA_SIZE)?,
        )?;
        descriptor = nested
            .manifests
            .into_iter()
            .find(|m| matches_host(m.platform.as_ref()))
            .ok_or_else(|| {
                let (os, arch) = host_platform();
                fetch_error(root.display(), format!("no manifest for {}/{}", os, arch))
            })?;
    }

    let manifest: ImageManifest = parse_json(
        &descriptor.digest,
        &read_layout_blob(root, &descriptor.digest, MAX_METADATA_SIZE)?,
    )?;
    if manifest.layers.len() > MAX_LAYERS {
        return Err(fetch_error(
            root.display(),
            format!("too many layers: {} > {}", manifest.layers.len(), MAX_LAYERS),
        ));
    }
    Ok(manifest)
}

/// Hashes everything written through it.
struct HashingWriter<W> {
    inner: W,
    hasher: Sha256,
    written: u64,
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Writer for a fresh OCI image layout.
pub struct LayoutWriter {
    root: PathBuf,
}

impl LayoutWriter {
    pub fn create(root: &Path) -> Result<Self> {
        fs::create_dir_all(root.join("blobs").join("sha256"))?;
        fs::write(root.join("oci-layout"), br#"{"imageLayoutVersion":"1.0.0"}"#)?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn blob_path(&self, digest: &str) -> Result<PathBuf> {
        layout_blob_path(&self.root, digest)
    }

    /// Stores `data` under `digest` after verifying it.
    pub fn put_blob(&self, digest: &str, data: &[u8]) -> Result<()> {
        let computed = sha256_digest(data);
        if computed != digest {
            return Err(fetch_error(digest, format!("digest mismatch: computed {}", computed)));
        }
        write_atomic(&self.blob_path(digest)?, data)?;
        Ok(())
    }

    /// Stores `data`, returning its digest.
    pub fn put_bytes(&self, data: &[u8]) -> Result<String> {
        let digest = sha256_digest(data);
        write_atomic(&self.blob_path(&digest)?, data)?;
        Ok(digest)
    }

    /// Streams `src` into the layout, returning its digest and size.
    pub fn put_reader(&self, src: &mut impl Read) -> Result<(String, u64)> {
        let temp = self
            .root
            .join("blobs")
            .join(format!("tmp.{}", uuid::Uuid::now_v7()));
        let mut writer = HashingWriter {
            inner: File::create(&temp)?,
            hasher: Sha256::new(),
            written: 0,
        };
        let copied = io::copy(&mut src.take(MAX_LAYER_SIZE + 1), &mut writer);
        if let Err(e) = copied {
            let _ = fs::remove_file(&temp);
            return Err(e.into());
        }
        if writer.written > MAX_LAYER_SIZE {
            let _ = fs::remove_file(&temp);
            return Err(Error::ImageTooLarge {
                size: writer.written,
                limit: MAX_LAYER_SIZE,
            });
        }
        let digest = format!("sha256:{}", hex::encode(writer.hasher.finalize()));
        fs::rename(&temp, self.blob_path(&digest)?)?;
        Ok((digest, writer.written))
    }

    /// Copies a blob from another layout, verifying its digest.
    pub fn import_blob(&self, source_root: &Path, desc: &Descriptor) -> Result<()> {
        if desc.size > MAX_LAYER_SIZE {
            return Err(Error::ImageTooLarge {
                size: desc.size,
                limit: MAX_LAYER_SIZE,
            });
        }
        let mut src = File::open(layout_blob_path(source_root, &desc.digest)?)
            .map_err(|e| fetch_error(&desc.digest, format!("missing blob: {}", e)))?;
        let (digest, _) = self.put_reader(&mut src)?;
        if digest != desc.digest {
            let _ = fs::remove_file(self.blob_path(&digest)?);
            return Err(fetch_error(&desc.digest, format!("digest mismatch: computed {}", digest)));
        }
        Ok(())
    }

    /// Writes the manifest blob and an `index.json` pointing at it.
    pub fn finish(&self, manifest: &ImageManifest) -> Result<()> {
        let data = serde_json::to_vec(manifest)?;
        let digest = self.put_bytes(&data)?;
        let index = ImageIndex {
            schema_version: 2,
            media_type: Some(MEDIA_TYPE_OCI_INDEX.to_string()),
            manifests: vec![Descriptor::new(MEDIA_TYPE_OCI_MANIFEST, digest, data.len() as u64)],
        };
        write_atomic(&self.root.join("index.json"), &serde_json::to_vec(&index)?)?;
        Ok(())
    }
}

// =============================================================================
// Fetcher
// =============================================================================

/// Produces an OCI layout and image config for a reference.
#[async_trait]
pub trait ImageFetcher: Send + Sync {
    /// Fetches `reference` into the empty directory `layout`.
    async fn fetch(
        &self,
        reference: &ImageReference,
        layout: &Path,
        cancel: &CancellationToken,
    ) -> Result<FetchedImage>;
}

/// Fetcher for the registry and on-disk transports.
pub struct DefaultFetcher {
    cache: Option<Arc<BlobCache>>,
    auth: RegistryAuth,
}

impl DefaultFetcher {
    /// Anonymous registry access; `cache` of `None` bypasses the cache.
    pub fn new(cache: Option<Arc<BlobCache>>) -> Self {
        Self {
            cache,
            auth: RegistryAuth::Anonymous,
        }
    }

    /// Basic-auth registry access.
    pub fn with_auth(cache: Option<Arc<BlobCache>>, username: &str, password: &str) -> Self {
        Self {
            cache,
            auth: RegistryAuth::Basic(username.to_string(), password.to_string()),
        }
    }

    async fn fetch_docker(
        &self,
        image_ref: &str,
        writer: &LayoutWriter,
        cancel: &CancellationToken,
    ) -> Result<ImageManifest> {
        info!(reference = image_ref, "pulling image");

        let reference: Reference = image_ref.parse().map_err(|e| Error::InvalidImageReference {
            reference: image_ref.to_string(),
            reason: format!("{}", e),
        })?;
        let client = Client::new(ClientConfig {
            protocol: ClientProtocol::Https,
            ..Default::default()
        });

        let (manifest, digest) = bounded(
            cancel,
            format!("pull manifest for {}", image_ref),
            client.pull_manifest(&reference, &self.auth),
        )
        .await?
        .map_err(|e| fetch_error(image_ref, e))?;
        debug!(reference = image_ref, %digest, "manifest pulled");

        let (config, layers) = match manifest {
            OciManifest::Image(img) => (img.config, img.layers),
            OciManifest::ImageIndex(index) => {
                let (os, arch) = host_platform();
                let entry = index
                    .manifests
                    .iter()
                    .find(|m| {
                        m.platform
                            .as_ref()
                            .is_some_and(|p| p.os == os && p.architecture == arch)
                    })
                    .ok_or_else(|| {
                        let available: Vec<String> = index
                            .manifests
                            .iter()
                            .filter_map(|m| m.platform.as_ref())
                            .map(|p| format!("{}/{}", p.os, p.architecture))
                            .collect();
                        fetch_error(
                            image_ref,
                            format!(
                                "no manifest for {}/{}. Available: {}",
                                os,
                                arch,
                                available.join(", ")
                            ),
                        )
                    })?;

                let platform_ref: Reference = format!(
                    "{}/{}@{}",
                    reference.registry(),
                    reference.repository(),
                    entry.digest
                )
                .parse()
                .map_err(|e| fetch_error(image_ref, format!("failed to build digest reference: {}", e)))?;

                let (platform_manifest, _) = bounded(
                    cancel,
                    format!("pull platform manifest for {}", image_ref),
                    client.pull_manifest(&platform_ref, &self.auth),
                )
                .await?
                .map_err(|e| fetch_error(image_ref, format!("failed to pull platform manifest: {}", e)))?;

                match platform_manifest {
                    OciManifest::Image(img) => (img.config, img.layers),
                    OciManifest::ImageIndex(_) => {
                        return Err(fetch_error(image_ref, "nested image index not supported"));
                    }
                }
            }
        };

        if layers.len() > MAX_LAYERS {
            return Err(fetch_error(
                image_ref,
                format!("too many layers: {} > {}", layers.len(), MAX_LAYERS),
            ));
        }

        let config = Descriptor::from_oci(&config);
        if config.size > MAX_METADATA_SIZE {
            return Err(Error::ImageTooLarge {
                size: config.size,
                limit: MAX_METADATA_SIZE,
            });
        }
        self.fetch_blob(&client, &reference, &config, writer, cancel)
            .await?;

        let mut descriptors = Vec::with_capacity(layers.len());
        for layer in &layers {
            let desc = Descriptor::from_oci(layer);
            if desc.size > MAX_LAYER_SIZE {
                return Err(Error::ImageTooLarge {
                    size: desc.size,
                    limit: MAX_LAYER_SIZE,
                });
            }
            self.fetch_blob(&client, &reference, &desc, writer, cancel)
                .await?;
            descriptors.push(desc);
        }

        Ok(ImageManifest {
            schema_version: 2,
            media_type: Some(MEDIA_TYPE_OCI_MANIFEST.to_string()),
            config,
            layers: descriptors,
        })
    }

    /// Places one registry blob into the layout, through the cache if enabled.
    async fn fetch_blob(
        &self,
        client: &Client,
        reference: &Reference,
        desc: &Descriptor,
        writer: &LayoutWriter,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled(format!("fetch of {}", reference)));
        }

        let Some(cache) = &self.cache else {
            let data = download(client, reference, desc, cancel).await?;
            return writer.put_blob(&desc.digest, &data);
        };

        let _guard = cache.lock(&desc.digest).await;
        if cache.has_blob(&desc.digest) {
            debug!(digest = %desc.digest, "blob already cached");
        } else {
            let data = download(client, reference, desc, cancel).await?;
            cache.put_blob(&desc.digest, &data)?;
        }
        cache.export_blob(&desc.digest, &writer.blob_path(&desc.digest)?)
    }
}

/// Runs `fut` under the pull timeout, abandoning it on cancellation.
async fn bounded<F, T>(cancel: &CancellationToken, operation: String, fut: F) -> Result<T>
where
    F: Future<Output = T>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled(operation.clone())),
        result = tokio::time::timeout(IMAGE_PULL_TIMEOUT, fut) => result.map_err(|_| Error::Timeout {
            operation,
            duration: IMAGE_PULL_TIMEOUT,
        }),
    }
}

async fn download(
    client: &Client,
    reference: &Reference,
    desc: &Descriptor,
    cancel: &CancellationToken,
) -> Result<Vec<u8>> {
    debug!(digest = %desc.digest, size = desc.size, "pulling blob");
    let oci_desc = desc.to_oci();
    let mut data = Vec::new();
    bounded(
        cancel,
        format!("pull blob {}", desc.digest),
        client.pull_blob(reference, &oci_desc, &mut data),
    )
    .await?
    .map_err(|e| fetch_error(&desc.digest, e))?;

    if data.len() as u64 > MAX_LAYER_SIZE {
        return Err(Error::ImageTooLarge {
            size: data.len() as u64,
            limit: MAX_LAYER_SIZE,
        });
    }
    Ok(data)
}

/// Copies the manifest, config and layers of `source` into `writer`.
fn import_layout(
    source: &Path,
    tag: Option<&str>,
    writer: &LayoutWriter,
    cancel: &CancellationToken,
) -> Result<ImageManifest> {
    let manifest = read_layout_manifest(source, tag)?;
    for desc in std::iter::once(&manifest.config).chain(manifest.layers.iter()) {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled(format!("import of {}", source.display())));
        }
        writer.import_blob(source, desc)?;
    }
    Ok(ImageManifest {
        schema_version: 2,
        media_type: Some(MEDIA_TYPE_OCI_MANIFEST.to_string()),
        config: manifest.config,
        layers: manifest.layers,
    })
}

/// Unpacks an archive into a scratch directory next to the layout.
fn unpack_archive(archive: &Path, layout: &Path) -> Result<tempfile::TempDir> {
    let parent = layout.parent().unwrap_or(Path::new("."));
    let scratch = tempfile::Builder::new()
        .prefix(LAYOUT_DIR_PREFIX)
        .tempdir_in(parent)?;
    let file = File::open(archive)
        .map_err(|e| fetch_error(archive.display(), format!("cannot open archive: {}", e)))?;
    tar::Archive::new(file)
        .unpack(scratch.path())
        .map_err(|e| fetch_error(archive.display(), format!("cannot unpack archive: {}", e)))?;
    Ok(scratch)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DockerArchiveEntry {
    config: String,
    #[serde(default)]
    layers: Vec<String>,
}

/// Converts an unpacked `docker save` tarball.
fn import_docker_archive(
    source: &Path,
    writer: &LayoutWriter,
    cancel: &CancellationToken,
) -> Result<ImageManifest> {
    let entries: Vec<DockerArchiveEntry> = parse_json(
        "manifest.json",
        &fs::read(source.join("manifest.json"))
            .map_err(|e| fetch_error(source.display(), format!("missing manifest.json: {}", e)))?,
    )?;
    let entry = entries
        .first()
        .ok_or_else(|| fetch_error(source.display(), "manifest.json lists no images"))?;
    if entry.layers.len() > MAX_LAYERS {
        return Err(fetch_error(
            source.display(),
            format!("too many layers: {} > {}", entry.layers.len(), MAX_LAYERS),
        ));
    }

    let member = |name: &str| -> Result<PathBuf> {
        let path = Path::new(name);
        if path.is_absolute() || path.components().any(|c| c == std::path::Component::ParentDir) {
            return Err(Error::PathTraversal {
                path: name.to_string(),
            });
        }
        Ok(source.join(path))
    };

    let config_data = fs::read(member(&entry.config)?)?;
    if config_data.len() as u64 > MAX_METADATA_SIZE {
        return Err(Error::ImageTooLarge {
            size: config_data.len() as u64,
            limit: MAX_METADATA_SIZE,
        });
    }
    let config_digest = writer.put_bytes(&config_data)?;
    let config = Descriptor::new(MEDIA_TYPE_OCI_CONFIG, config_digest, config_data.len() as u64);

    let mut layers = Vec::with_capacity(entry.layers.len());
    for name in &entry.layers {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled(format!("import of {}", source.display())));
        }
        let path = member(name)?;
        let media_type = if is_gzip(&path)? {
            MEDIA_TYPE_LAYER_GZIP
        } else {
            MEDIA_TYPE_LAYER_TAR
        };
        let (digest, size) = writer.put_reader(&mut File::open(&path)?)?;
        debug!(layer = %name, %digest, "converted docker archive layer");
        layers.push(Descriptor::new(media_type, digest, size));
    }

    Ok(ImageManifest {
        schema_version: 2,
        media_type: Some(MEDIA_TYPE_OCI_MANIFEST.to_string()),
        config,
        layers,
    })
}

fn is_gzip(path: &Path) -> Result<bool> {
    let mut magic = [0u8; 2];
    let n = File::open(path)?.read(&mut magic)?;
    Ok(n == 2 && magic == [0x1f, 0x8b])
}

#[async_trait]
impl ImageFetcher for DefaultFetcher {
    async fn fetch(
        &self,
        reference: &ImageReference,
        layout: &Path,
        cancel: &CancellationToken,
    ) -> Result<FetchedImage> {
        let writer = LayoutWriter::create(layout)?;

        let manifest = match reference {
            ImageReference::Docker(image_ref) => self.fetch_docker(image_ref, &writer, cancel).await?,
            ImageReference::OciLayout { path, tag } => {
                import_layout(path, tag.as_deref(), &writer, cancel)?
            }
            ImageReference::OciArchive { path, tag } => {
                let scratch = unpack_archive(path, layout)?;
                import_layout(scratch.path(), tag.as_deref(), &writer, cancel)?
            }
            ImageReference::DockerArchive(path) => {
                let scratch = unpack_archive(path, layout)?;
                import_docker_archive(scratch.path(), &writer, cancel)?
            }
            ImageReference::DockerDaemon(_)
            | ImageReference::OciSif(_)
            | ImageReference::BarePath(_) => {
                return Err(fetch_error(
                    reference,
                    format!("unsupported transport '{}'", reference.transport()),
                ));
            }
        };

        writer.finish(&manifest)?;
        let spec: ImageSpec = parse_json(
            &manifest.config.digest,
            &read_layout_blob(layout, &manifest.config.digest, MAX_METADATA_SIZE)?,
        )?;
        info!(
            reference = %reference,
            layers = manifest.layers.len(),
            "image fetched"
        );

        Ok(FetchedImage {
            layout: layout.to_path_buf(),
            manifest,
            spec,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    /// Builds a single-layer layout tagged `v1`.
    fn source_layout(root: &Path) -> ImageManifest {
        let writer = LayoutWriter::create(root).unwrap();
        let config = br#"{"architecture":"amd64","os":"linux","config":{"Cmd":["/bin/sh"],"User":"1000"}}"#;
        let config_digest = writer.put_bytes(config).unwrap();
        let layer_digest = writer.put_bytes(b"not really a tar").unwrap();
        let manifest = ImageManifest {
            schema_version: 2,
            media_type: Some(MEDIA_TYPE_OCI_MANIFEST.to_string()),
            config: Descriptor::new(MEDIA_TYPE_OCI_CONFIG, config_digest, config.len() as u64),
            layers: vec![Descriptor::new(MEDIA_TYPE_LAYER_TAR, layer_digest, 16)],
        };
        let data = serde_json::to_vec(&manifest).unwrap();
        let digest = writer.put_bytes(&data).unwrap();
        let mut entry = Descriptor::new(MEDIA_TYPE_OCI_MANIFEST, digest, data.len() as u64);
        entry
            .annotations
            .insert(ANNOTATION_REF_NAME.to_string(), "v1".to_string());
        let index = ImageIndex {
            schema_version: 2,
            media_type: None,
            manifests: vec![entry],
        };
        fs::write(root.join("index.json"), serde_json::to_vec(&index).unwrap()).unwrap();
        manifest
    }

    #[test]
    fn test_image_config_null_fields() {
        let spec: ImageSpec =
            serde_json::from_str(r#"{"config":{"Entrypoint":null,"Cmd":["sh"],"Env":null}}"#).unwrap();
        assert!(spec.config.entrypoint().is_empty());
        assert_eq!(spec.config.cmd(), ["sh"]);

        let spec: ImageSpec = serde_json::from_str(r#"{"config":null}"#).unwrap();
        assert_eq!(spec.config, ImageConfig::default());
    }

    #[test]
    fn test_read_layout_manifest_by_tag() {
        let temp = TempDir::new().unwrap();
        let manifest = source_layout(temp.path());
        let read = read_layout_manifest(temp.path(), Some("v1")).unwrap();
        assert_eq!(read.layers, manifest.layers);
        assert!(read_layout_manifest(temp.path(), Some("v2")).is_err());
        assert!(read_layout_manifest(temp.path(), None).is_ok());
    }

    #[test]
    fn test_put_blob_verifies_digest() {
        let temp = TempDir::new().unwrap();
        let writer = LayoutWriter::create(temp.path()).unwrap();
        let wrong = format!("sha256:{}", "a".repeat(64));
        assert!(writer.put_blob(&wrong, b"data").is_err());
    }

    #[tokio::test]
    async fn test_fetch_oci_layout() {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("source");
        source_layout(&source);

        let dest = temp.path().join("dest");
        let reference = ImageReference::OciLayout {
            path: source,
            tag: Some("v1".to_string()),
        };
        let fetched = DefaultFetcher::new(None)
            .fetch(&reference, &dest, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(fetched.spec.config.cmd(), ["/bin/sh"]);
        assert_eq!(fetched.spec.config.user(), "1000");
        assert!(dest.join("oci-layout").is_file());
        let read = read_layout_manifest(&dest, None).unwrap();
        assert_eq!(read.layers.len(), 1);
    }

    #[tokio::test]
    async fn test_unsupported_transports() {
        let temp = TempDir::new().unwrap();
        let fetcher = DefaultFetcher::new(None);
        for reference in [
            ImageReference::DockerDaemon("alpine:3.19".to_string()),
            ImageReference::OciSif(temp.path().join("i.sif")),
        ] {
            let err = fetcher
                .fetch(&reference, &temp.path().join("layout"), &CancellationToken::new())
                .await
                .unwrap_err();
            assert!(matches!(err, Error::FetchFailed { .. }));
        }
    }

    #[tokio::test]
    async fn test_cancelled_import() {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("source");
        source_layout(&source);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = DefaultFetcher::new(None)
            .fetch(
                &ImageReference::OciLayout { path: source, tag: None },
                &temp.path().join("dest"),
                &cancel,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled(_)));
    }
}
