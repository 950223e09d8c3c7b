//! # ocilaunch
//!
//! **Launch OCI containers from container images with runc or crun**
//!
//! The crate turns an image reference and a set of launch options into an
//! OCI runtime bundle (extracted rootfs plus `config.json`) and hands it to
//! an external low-level runtime. The hard part is the runtime spec: user
//! namespace ID mappings for unprivileged callers, the image's declared
//! `USER`, and the fakeroot illusion all have to agree.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                            ocilaunch                                │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────────────────────────────────────────────────┐    │
//! │  │          Launcher trait (OciLauncher, NativeLauncher)       │    │
//! │  │   option table check → build → fetch/extract → run → clean  │    │
//! │  └─────────────────────────────────────────────────────────────┘    │
//! │                              │                                      │
//! │  ┌───────────────────────────┼───────────────────────────────┐      │
//! │  │                   SpecBuilder                             │      │
//! │  │  PreImage: namespaces │ mounts │ cgroups                  │      │
//! │  │  Finalized: identity │ process │ capabilities │ CDI       │      │
//! │  └───────────────────────────┼───────────────────────────────┘      │
//! │                              │                                      │
//! │  ┌───────────────────────────┼───────────────────────────────┐      │
//! │  │                   Bundle Manager                          │      │
//! │  │  fetch → temp OCI layout → extract rootfs → config.json   │      │
//! │  │  Path traversal protection │ Size limits │ Whiteouts      │      │
//! │  └───────────────────────────┼───────────────────────────────┘      │
//! │                              │                                      │
//! │  ┌───────────────────────────┼───────────────────────────────┐      │
//! │  │               Content-Addressed Blob Cache                │      │
//! │  │  Digest verification │ Deduplication │ Atomic writes      │      │
//! │  └───────────────────────────────────────────────────────────┘      │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │                  RuntimeInvoker: CliRuntime (crun, runc)            │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Identity
//!
//! | Caller | Container process | Mapping |
//! |--------|-------------------|---------|
//! | host root | image `USER`, else root | none |
//! | unprivileged, fakeroot | 0:0 | outer namespace + reverse map of 0 |
//! | unprivileged | image `USER`, else caller | outer namespace + reverse map of the target |
//!
//! See [`identity`] for the mapping algorithm.
//!
//! # Security Model
//!
//! - **Path Traversal Protection**: layer extraction rejects `..` components
//!   and absolute paths, and never follows symlinks out of the rootfs.
//! - **Size Limits**: `MAX_LAYER_SIZE`, `MAX_ROOTFS_SIZE` and `MAX_LAYERS`
//!   bound what an image can make us write.
//! - **Digest Verification**: every blob is checked against its sha256
//!   digest before it is cached or used.
//! - **Capabilities**: non-root container processes get only what was
//!   explicitly added; `no_privs` empties every set.
//! - **Pristine rootfs**: synthesized `/etc` files live in the bundle side-tree
//!   and are bind-mounted, never written into the extracted image.
//!
//! # Example
//!
//! ```rust,ignore
//! use ocilaunch::{CliRuntime, LaunchContext, LaunchOptions, Launcher, LauncherConfig, OciLauncher};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> ocilaunch::Result<()> {
//!     let config = Arc::new(LauncherConfig::default());
//!     let runtime = Arc::new(CliRuntime::detect(&config)?);
//!     let ctx = LaunchContext::new(LaunchOptions::default(), config, runtime)?;
//!     let launcher = OciLauncher::new(ctx)?;
//!     let code = launcher.exec("docker://alpine:3.19", None, &[], None).await?;
//!     std::process::exit(code);
//! }
//! ```

pub mod builder;
pub mod bundle;
pub mod cache;
pub mod capabilities;
pub mod cdi;
pub mod config;
pub mod constants;
pub mod error;
pub mod extract;
pub mod fetch;
pub mod identity;
pub mod image_ref;
pub mod launcher;
pub mod mounts;
pub mod options;
pub mod process;
pub mod runtime;
pub mod spec;

pub mod runtimes;

// Re-exports
pub use builder::{Finalized, PreImage, ProcessRequest, SpecBuilder, Written};
pub use bundle::{Bundle, ImageSource};
pub use cache::BlobCache;
pub use config::LauncherConfig;
pub use constants::*;
pub use error::{Error, Result};
pub use extract::{LayerExtractor, RootfsExtractor};
pub use fetch::{DefaultFetcher, FetchedImage, ImageConfig, ImageFetcher, ImageSpec};
pub use identity::{HostIdentity, IdMapOptions, IdentityPlan};
pub use image_ref::ImageReference;
pub use launcher::{LaunchContext, Launcher, NativeLauncher, OciLauncher};
pub use options::{HomeSpec, LaunchOption, LaunchOptions, Namespaces};
pub use runtime::{CgroupsMode, ContainerState, ContainerStatus, RunRequest, RuntimeInvoker};
pub use runtimes::CliRuntime;
pub use spec::RuntimeSpec;
