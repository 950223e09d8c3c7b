//! # Runtime Spec Builder
//!
//! The runtime spec is built in two phases around image acquisition, and the
//! phase is part of the builder's type:
//!
//! ```text
//! SpecBuilder<PreImage>  ── finalize(image) ──►  SpecBuilder<Finalized>  ── write(bundle) ──►  SpecBuilder<Written>
//!   namespaces                                     process, user
//!   mounts                                         id mappings
//!   cgroups                                        capabilities
//!                                                  identity files, CDI devices
//! ```
//!
//! Before the image is extracted nothing is known about the process, so
//! [`SpecBuilder::process`] and [`SpecBuilder::identity`] only exist on the
//! later phases. There is no way back from `Written`.

use crate::bundle::Bundle;
use crate::capabilities::process_capabilities;
use crate::cdi::CdiRegistry;
use crate::config::LauncherConfig;
use crate::constants::CGROUP_PARENT;
use crate::error::{Error, Result};
use crate::fetch::ImageSpec;
use crate::identity::{plan_identity, HostIdentity, IdentityPlan};
use crate::mounts::{
    assemble_mounts, home_destination, set_tmpfs_owner, synthesize_identity_files,
    IdentityFileRequest,
};
use crate::options::LaunchOptions;
use crate::process::{process_args, process_cwd, process_env, resolve_image_user, user_env};
use crate::spec::{Namespace, NamespaceType, Process, Resources, RuntimeSpec, User};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Namespaces, mounts and cgroups are set; the process is not.
#[derive(Debug)]
pub struct PreImage;

/// Process and identity resolved against the extracted image.
///
/// The process lives here rather than in the spec until it is written.
#[derive(Debug)]
pub struct Finalized {
    identity: IdentityPlan,
    process: Process,
}

/// Persisted to the bundle.
#[derive(Debug)]
pub struct Written {
    identity: IdentityPlan,
    config_path: PathBuf,
}

/// What the caller asked to run.
#[derive(Debug, Clone, Default)]
pub struct ProcessRequest {
    /// Replaces the image entrypoint.
    pub process: Option<String>,
    /// Replaces the image cmd.
    pub args: Vec<String>,
    /// Host environment, scanned for prefixed variables.
    pub host_env: Vec<(String, String)>,
    /// Attach a terminal to the process.
    pub terminal: bool,
}

/// Phase-tagged runtime spec builder.
#[derive(Debug)]
pub struct SpecBuilder<S> {
    spec: RuntimeSpec,
    options: Arc<LaunchOptions>,
    host: HostIdentity,
    config: Arc<LauncherConfig>,
    container_id: String,
    state: S,
}

impl<S> SpecBuilder<S> {
    /// The spec as built so far.
    pub fn spec(&self) -> &RuntimeSpec {
        &self.spec
    }

    pub fn container_id(&self) -> &str {
        &self.container_id
    }
}

impl SpecBuilder<PreImage> {
    /// Builds everything that does not depend on the image.
    pub fn new(
        options: Arc<LaunchOptions>,
        host: HostIdentity,
        config: Arc<LauncherConfig>,
        container_id: &str,
    ) -> Result<Self> {
        let mut spec = RuntimeSpec::minimal();

        let requested = [
            (true, NamespaceType::Mount),
            (options.namespaces.pid, NamespaceType::Pid),
            (options.namespaces.ipc, NamespaceType::Ipc),
            (
                options.namespaces.uts || options.hostname.is_some(),
                NamespaceType::Uts,
            ),
            (options.namespaces.net, NamespaceType::Network),
        ];
        spec.linux_mut().namespaces = requested
            .into_iter()
            .filter_map(|(wanted, ns)| wanted.then(|| Namespace::new(ns)))
            .collect();

        if options.namespaces.user && host.is_root() && !options.fakeroot {
            warn!("user namespace request ignored: running as host root without fakeroot");
        }

        if let Some(hostname) = &options.hostname {
            spec.hostname = Some(hostname.clone());
        }

        spec.mounts = assemble_mounts(&options, &host, &config)?;

        if let Some(path) = &options.cgroups_file {
            let resources = read_resources(path)?;
            let linux = spec.linux_mut();
            linux.resources = Some(resources);
            linux.cgroups_path = Some(format!("{}/{}", CGROUP_PARENT, container_id));
        }

        debug!(
            id = container_id,
            mounts = spec.mounts.len(),
            "pre-image spec built"
        );

        Ok(Self {
            spec,
            options,
            host,
            config,
            container_id: container_id.to_string(),
            state: PreImage,
        })
    }

    /// Resolves the process and identity against the extracted image.
    pub fn finalize(
        mut self,
        image: &ImageSpec,
        rootfs: &Path,
        etc_dir: &Path,
        request: &ProcessRequest,
    ) -> Result<SpecBuilder<Finalized>> {
        let opts = Arc::clone(&self.options);
        let image_config = &image.config;

        let image_user = resolve_image_user(image_config.user(), rootfs)?;
        let identity = plan_identity(&self.host, opts.fakeroot, image_user, &self.config)?;

        if identity.needs_user_namespace() {
            let linux = self.spec.linux_mut();
            linux.namespaces.push(Namespace::new(NamespaceType::User));
            linux.uid_mappings = identity.uid_mappings.clone();
            linux.gid_mappings = identity.gid_mappings.clone();
        }

        let env = user_env(&opts, request.host_env.iter().cloned())?;
        let process = Process {
            terminal: request.terminal,
            user: User {
                uid: identity.uid,
                gid: identity.gid,
                ..Default::default()
            },
            args: process_args(image_config, request.process.as_deref(), &request.args),
            env: process_env(image_config, &env),
            cwd: process_cwd(image_config, opts.cwd.as_deref(), rootfs)?,
            capabilities: Some(process_capabilities(&opts, identity.uid)?),
            no_new_privileges: !opts.allow_suid,
        };
        self.spec.process = Some(process);

        let home = home_destination(&opts, &self.host);
        if let Some(home) = &home {
            set_tmpfs_owner(&mut self.spec.mounts, home, identity.uid, identity.gid);
        }

        let group_name = self
            .host
            .group_name()
            .unwrap_or_else(|| self.host.user_name.clone());
        let nameservers = opts.nameservers();
        let files = IdentityFileRequest {
            rootfs,
            etc_dir,
            uid: identity.uid,
            gid: identity.gid,
            user_name: &self.host.user_name,
            group_name: &group_name,
            home: home.as_deref().unwrap_or("/"),
            skip_user_files: self.host.is_root() || opts.fakeroot || image_user.is_some(),
            nameservers: &nameservers,
        };
        let identity_mounts = synthesize_identity_files(&files, &self.config)?;
        self.spec.mounts.extend(identity_mounts);

        if !opts.devices.is_empty() {
            let registry = CdiRegistry::load(&self.config.cdi_spec_dirs)?;
            registry.apply(&mut self.spec, &opts.devices)?;
        }

        let process = self.spec.process.take().ok_or_else(|| {
            Error::SpecGeneration("process lost while applying device edits".to_string())
        })?;

        info!(
            id = %self.container_id,
            uid = identity.uid,
            gid = identity.gid,
            userns = identity.needs_user_namespace(),
            "runtime spec finalized"
        );

        Ok(SpecBuilder {
            spec: self.spec,
            options: self.options,
            host: self.host,
            config: self.config,
            container_id: self.container_id,
            state: Finalized { identity, process },
        })
    }
}

impl SpecBuilder<Finalized> {
    pub fn identity(&self) -> &IdentityPlan {
        &self.state.identity
    }

    /// The resolved process.
    pub fn process(&self) -> &Process {
        &self.state.process
    }

    /// Mutable access for late adjustments before the spec is written.
    pub fn spec_mut(&mut self) -> &mut RuntimeSpec {
        &mut self.spec
    }

    /// Validates the spec and persists it as the bundle's `config.json`.
    pub fn write(self, bundle: &Bundle) -> Result<SpecBuilder<Written>> {
        let mut spec = self.spec;
        spec.process = Some(self.state.process);
        spec.validate()?;
        let config_path = bundle.update(&spec)?;
        Ok(SpecBuilder {
            spec,
            options: self.options,
            host: self.host,
            config: self.config,
            container_id: self.container_id,
            state: Written {
                identity: self.state.identity,
                config_path,
            },
        })
    }
}

impl SpecBuilder<Written> {
    pub fn identity(&self) -> &IdentityPlan {
        &self.state.identity
    }

    /// Location of the written `config.json`.
    pub fn config_path(&self) -> &Path {
        &self.state.config_path
    }

    pub fn into_spec(self) -> RuntimeSpec {
        self.spec
    }
}

/// Reads an OCI `linux.resources` document.
fn read_resources(path: &Path) -> Result<Resources> {
    let data = fs::read(path).map_err(|e| {
        Error::Configuration(format!("cannot read cgroups file {}: {}", path.display(), e))
    })?;
    serde_json::from_slice(&data).map_err(|e| {
        Error::Configuration(format!("invalid cgroups file {}: {}", path.display(), e))
    })
}
