//! # Launchers
//!
//! A [`Launcher`] turns an image reference plus [`LaunchOptions`] into a
//! running container and reports its exit code. Two variants share one
//! pipeline and differ only in the options they accept:
//!
//! | Variant | Runtime | Extra options honoured |
//! |---------|---------|------------------------|
//! | [`OciLauncher`] | external runc/crun | none |
//! | [`NativeLauncher`] | external runc/crun | hostname, named network, SUID, no-home, no-init |
//!
//! Each variant owns a static table of options it rejects. Options are
//! checked when the launcher is constructed, and every unsupported option
//! is reported in a single [`Error::UnsupportedOptions`].
//!
//! ## Pipeline
//!
//! ```text
//! parse reference ─► SpecBuilder::new ─► Bundle::create ─► finalize ─► write ─► run
//!                                         (fetch + extract)                      │
//!                                                                                ▼
//!                                                                  bundle dropped (deleted)
//! ```

use crate::builder::{ProcessRequest, SpecBuilder};
use crate::bundle::{Bundle, ImageSource};
use crate::cache::BlobCache;
use crate::config::LauncherConfig;
use crate::constants::{validate_container_id, REGISTRY_PASSWORD_ENV, REGISTRY_USERNAME_ENV};
use crate::error::{Error, Result};
use crate::extract::{LayerExtractor, RootfsExtractor};
use crate::fetch::{DefaultFetcher, ImageFetcher};
use crate::identity::{HostIdentity, IdMapOptions};
use crate::image_ref::ImageReference;
use crate::options::{LaunchOption, LaunchOptions};
use crate::runtime::{CgroupsMode, RunRequest, RuntimeInvoker};
use async_trait::async_trait;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Launches containers from images.
#[async_trait]
pub trait Launcher: Send + Sync {
    /// Launcher name used in diagnostics.
    fn name(&self) -> &'static str;

    /// Runs `image` and waits for it to exit.
    ///
    /// `process` replaces the image entrypoint and `args` the image cmd.
    /// Returns the container's exit code; an `Err` is a launcher failure.
    async fn exec(
        &self,
        image: &str,
        process: Option<&str>,
        args: &[String],
        instance: Option<&str>,
    ) -> Result<i32>;
}

// =============================================================================
// Launch context
// =============================================================================

/// Everything a launch needs from its environment.
#[derive(Clone)]
pub struct LaunchContext {
    pub options: Arc<LaunchOptions>,
    pub config: Arc<LauncherConfig>,
    pub host: HostIdentity,
    pub fetcher: Arc<dyn ImageFetcher>,
    pub extractor: Arc<dyn RootfsExtractor>,
    pub runtime: Arc<dyn RuntimeInvoker>,
    /// Directory that receives bundle directories.
    pub bundle_base: PathBuf,
    pub host_env: Vec<(String, String)>,
    pub terminal: bool,
    pub cancel: CancellationToken,
}

impl LaunchContext {
    /// Context for the current process: real host identity, default fetcher
    /// and extractor, bundles under the system temp directory.
    pub fn new(
        options: LaunchOptions,
        config: Arc<LauncherConfig>,
        runtime: Arc<dyn RuntimeInvoker>,
    ) -> Result<Self> {
        let host = HostIdentity::current()?;
        let fetcher = default_fetcher(&options, &config)?;
        Ok(Self {
            options: Arc::new(options),
            config,
            host,
            fetcher,
            extractor: Arc::new(LayerExtractor),
            runtime,
            bundle_base: std::env::temp_dir(),
            host_env: std::env::vars().collect(),
            terminal: std::io::stdin().is_terminal(),
            cancel: CancellationToken::new(),
        })
    }

    pub fn with_fetcher(mut self, fetcher: Arc<dyn ImageFetcher>) -> Self {
        self.fetcher = fetcher;
        self
    }

    pub fn with_extractor(mut self, extractor: Arc<dyn RootfsExtractor>) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn with_host(mut self, host: HostIdentity) -> Self {
        self.host = host;
        self
    }

    pub fn with_bundle_base(mut self, bundle_base: PathBuf) -> Self {
        self.bundle_base = bundle_base;
        self
    }

    pub fn with_host_env(mut self, host_env: Vec<(String, String)>) -> Self {
        self.host_env = host_env;
        self
    }

    /// Token that aborts in-flight fetches and extractions when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/// Fetcher with the shared cache (unless disabled) and registry
/// credentials from the environment.
fn default_fetcher(
    options: &LaunchOptions,
    config: &LauncherConfig,
) -> Result<Arc<dyn ImageFetcher>> {
    let cache = if options.cache_disabled {
        debug!("image cache disabled");
        None
    } else {
        Some(Arc::new(BlobCache::open(config.resolved_cache_dir())?))
    };
    let fetcher = match (
        std::env::var(REGISTRY_USERNAME_ENV),
        std::env::var(REGISTRY_PASSWORD_ENV),
    ) {
        (Ok(user), Ok(password)) if !user.is_empty() => {
            DefaultFetcher::with_auth(cache, &user, &password)
        }
        _ => DefaultFetcher::new(cache),
    };
    Ok(Arc::new(fetcher))
}

// =============================================================================
// Option tables
// =============================================================================

/// Options the OCI launcher cannot honour.
const OCI_UNSUPPORTED: &[LaunchOption] = &[
    LaunchOption::Writable,
    LaunchOption::WritableTmpfs,
    LaunchOption::OverlayPaths,
    LaunchOption::ScratchDirs,
    LaunchOption::WorkDir,
    LaunchOption::NoHome,
    LaunchOption::FuseMount,
    LaunchOption::NvCCLI,
    LaunchOption::Nvidia,
    LaunchOption::Rocm,
    LaunchOption::ContainLibs,
    LaunchOption::NoEval,
    LaunchOption::Network,
    LaunchOption::NetworkArgs,
    LaunchOption::Hostname,
    LaunchOption::AllowSUID,
    LaunchOption::SecurityOpts,
    LaunchOption::NoUmask,
    LaunchOption::ShellPath,
    LaunchOption::Boot,
    LaunchOption::NoInit,
    LaunchOption::Contain,
    LaunchOption::ContainAll,
    LaunchOption::AppName,
    LaunchOption::SIFFUSE,
];

/// Options the native launcher cannot honour.
const NATIVE_UNSUPPORTED: &[LaunchOption] = &[
    LaunchOption::Writable,
    LaunchOption::WritableTmpfs,
    LaunchOption::OverlayPaths,
    LaunchOption::ScratchDirs,
    LaunchOption::WorkDir,
    LaunchOption::FuseMount,
    LaunchOption::NvCCLI,
    LaunchOption::Nvidia,
    LaunchOption::Rocm,
    LaunchOption::ContainLibs,
    LaunchOption::NoEval,
    LaunchOption::NetworkArgs,
    LaunchOption::SecurityOpts,
    LaunchOption::NoUmask,
    LaunchOption::ShellPath,
    LaunchOption::Boot,
    LaunchOption::Contain,
    LaunchOption::ContainAll,
    LaunchOption::AppName,
    LaunchOption::SIFFUSE,
];

/// Rejects every requested option found in `unsupported`, all at once.
fn check_options(
    launcher: &str,
    unsupported: &[LaunchOption],
    options: &LaunchOptions,
) -> Result<()> {
    let rejected: Vec<String> = options
        .requested()
        .into_iter()
        .filter(|o| unsupported.contains(o))
        .map(|o| o.name().to_string())
        .collect();
    if rejected.is_empty() {
        return Ok(());
    }
    Err(Error::UnsupportedOptions {
        launcher: launcher.to_string(),
        options: rejected,
    })
}

// =============================================================================
// Pipeline
// =============================================================================

async fn launch(
    ctx: &LaunchContext,
    image: &str,
    process: Option<&str>,
    args: &[String],
    instance: Option<&str>,
) -> Result<i32> {
    if let Some(name) = instance {
        return Err(Error::Configuration(format!(
            "instance '{}' requested: instances are not supported",
            name
        )));
    }

    let reference = ImageReference::parse(image)?.normalize()?;

    let container_id = uuid::Uuid::new_v4().to_string();
    validate_container_id(&container_id).map_err(|reason| Error::InvalidContainerId {
        id: container_id.clone(),
        reason: reason.to_string(),
    })?;
    info!(id = %container_id, image = %reference, "launching container");

    let builder = SpecBuilder::new(
        Arc::clone(&ctx.options),
        ctx.host.clone(),
        Arc::clone(&ctx.config),
        &container_id,
    )?;

    let mut bundle = Bundle::new(&ctx.bundle_base, ctx.options.keep_bundle)?;
    let source = ImageSource {
        reference: &reference,
        fetcher: ctx.fetcher.as_ref(),
        extractor: ctx.extractor.as_ref(),
        id_map: IdMapOptions::for_host(&ctx.host),
    };
    bundle.create(builder.spec(), source, &ctx.cancel).await?;

    let request = ProcessRequest {
        process: process.map(str::to_string),
        args: args.to_vec(),
        host_env: ctx.host_env.clone(),
        terminal: ctx.terminal,
    };
    let written = builder
        .finalize(
            bundle.image_spec()?,
            &bundle.rootfs(),
            &bundle.etc_dir(),
            &request,
        )?
        .write(&bundle)?;

    let run = RunRequest {
        id: container_id.clone(),
        bundle: bundle.path().to_path_buf(),
        outer: written.identity().outer.clone(),
        cgroups: if ctx.config.systemd_cgroups {
            CgroupsMode::Systemd
        } else {
            CgroupsMode::Cgroupfs
        },
    };
    let code = ctx.runtime.run(&run).await?;

    if code != 0 {
        warn!(id = %container_id, code, "container exited with non-zero status");
    } else {
        debug!(id = %container_id, "container exited");
    }
    Ok(code)
}

// =============================================================================
// Variants
// =============================================================================

/// Launcher for the external OCI runtime with the strict option table.
pub struct OciLauncher {
    ctx: LaunchContext,
}

impl OciLauncher {
    pub const NAME: &'static str = "oci";

    /// Validates the launch options against this launcher's table.
    pub fn new(ctx: LaunchContext) -> Result<Self> {
        check_options(Self::NAME, OCI_UNSUPPORTED, &ctx.options)?;
        Ok(Self { ctx })
    }
}

#[async_trait]
impl Launcher for OciLauncher {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn exec(
        &self,
        image: &str,
        process: Option<&str>,
        args: &[String],
        instance: Option<&str>,
    ) -> Result<i32> {
        launch(&self.ctx, image, process, args, instance).await
    }
}

/// Launcher that also honours hostname, networking, SUID, no-home and
/// no-init requests.
pub struct NativeLauncher {
    ctx: LaunchContext,
}

impl NativeLauncher {
    pub const NAME: &'static str = "native";

    /// Validates the launch options against this launcher's table.
    pub fn new(ctx: LaunchContext) -> Result<Self> {
        check_options(Self::NAME, NATIVE_UNSUPPORTED, &ctx.options)?;
        if ctx.options.no_init {
            debug!("no-init requested: the runtime's own init is used");
        }
        Ok(Self { ctx })
    }
}

#[async_trait]
impl Launcher for NativeLauncher {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn exec(
        &self,
        image: &str,
        process: Option<&str>,
        args: &[String],
        instance: Option<&str>,
    ) -> Result<i32> {
        launch(&self.ctx, image, process, args, instance).await
    }
}
