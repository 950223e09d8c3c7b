//! # Image Blob Cache
//!
//! Content-addressed store for image blobs (manifests, configs, layers)
//! shared by every launch of the same user.
//!
//! ## Layout
//!
//! ```text
//! $OCILAUNCH_CACHEDIR/
//! └── blobs/
//!     └── sha256/
//!         ├── ab/
//!         │   └── abcd1234...
//!         └── cd/
//!             └── cdef5678...
//! ```
//!
//! ## Security Model
//!
//! - Blobs are verified against their sha256 digest before they are stored,
//!   so a misbehaving registry cannot poison the cache.
//! - Digests are validated before a path is built from them; anything that
//!   is not `sha256:<64 hex>` is rejected.
//! - Writes go to a unique temp file and are renamed into place.
//!
//! ## Concurrency
//!
//! Concurrent launches may fetch the same image. [`BlobCache::lock`] hands
//! out one async lock per digest so a blob is downloaded at most once; the
//! second launch waits and then finds it present.

use crate::error::{Error, Result};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info};

/// Digest of `data` in `sha256:<hex>` form.
pub fn sha256_digest(data: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(data)))
}

/// Splits and validates a `sha256:<hex>` digest, returning the hex part.
pub fn digest_hex(digest: &str) -> Result<&str> {
    let invalid = |reason: &str| Error::FetchFailed {
        reference: digest.to_string(),
        reason: format!("invalid digest: {}", reason),
    };
    let (algo, hash) = digest
        .split_once(':')
        .ok_or_else(|| invalid("missing algorithm"))?;
    if algo != "sha256" {
        return Err(invalid("only sha256 is supported"));
    }
    if hash.len() != 64 || !hash.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(invalid("expected 64 hex characters"));
    }
    Ok(hash)
}

/// Shared content-addressed blob cache.
pub struct BlobCache {
    base_dir: PathBuf,
    inflight: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl BlobCache {
    /// Opens (creating if needed) the cache rooted at `base_dir`.
    pub fn open(base_dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(base_dir.join("blobs")).map_err(|e| {
            Error::Configuration(format!(
                "cannot create image cache at {}: {}",
                base_dir.display(),
                e
            ))
        })?;
        info!(path = %base_dir.display(), "image cache opened");
        Ok(Self {
            base_dir,
            inflight: Mutex::new(HashMap::new()),
        })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Path of a blob, whether or not it exists.
    pub fn blob_path(&self, digest: &str) -> Result<PathBuf> {
        let hash = digest_hex(digest)?;
        Ok(self
            .base_dir
            .join("blobs")
            .join("sha256")
            .join(&hash[..2])
            .join(hash))
    }

    pub fn has_blob(&self, digest: &str) -> bool {
        self.blob_path(digest).is_ok_and(|p| p.is_file())
    }

    pub fn read_blob(&self, digest: &str) -> Result<Vec<u8>> {
        let path = self.blob_path(digest)?;
        fs::read(&path).map_err(|e| Error::FetchFailed {
            reference: digest.to_string(),
            reason: format!("cache read failed: {}", e),
        })
    }

    /// Stores a blob after verifying its digest.
    pub fn put_blob(&self, digest: &str, data: &[u8]) -> Result<()> {
        let path = self.blob_path(digest)?;
        let computed = sha256_digest(data);
        if computed != digest {
            return Err(Error::FetchFailed {
                reference: digest.to_string(),
                reason: format!("digest mismatch: computed {}", computed),
            });
        }
        if path.exists() {
            debug!(digest, "blob already cached");
            return Ok(());
        }
        write_atomic(&path, data)?;
        debug!(digest, bytes = data.len(), "blob cached");
        Ok(())
    }

    /// Copies a cached blob to `dest`, hard-linking when possible.
    pub fn export_blob(&self, digest: &str, dest: &Path) -> Result<()> {
        let path = self.blob_path(digest)?;
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        if fs::hard_link(&path, dest).is_err() {
            fs::copy(&path, dest)?;
        }
        Ok(())
    }

    /// Serialises fetches of one digest across concurrent launches.
    pub async fn lock(&self, digest: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut inflight = self
                .inflight
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            inflight
                .entry(digest.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}

/// Writes `data` to a unique temp file next to `path`, then renames it.
pub fn write_atomic(path: &Path, data: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let temp_path = path.with_extension(format!("tmp.{}", uuid::Uuid::now_v7()));
    fs::write(&temp_path, data)?;
    fs::rename(&temp_path, path).inspect_err(|_| {
        let _ = fs::remove_file(&temp_path);
    })
}
