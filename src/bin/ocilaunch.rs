//! ocilaunch - run OCI images with runc or crun
//!
//! ## Usage
//!
//! ```sh
//! ocilaunch run docker://alpine:3.19
//! ocilaunch exec --fakeroot docker://alpine:3.19 /bin/sh -c 'id'
//! ocilaunch state <container-id>
//! ocilaunch delete <container-id> [--force]
//! ```
//!
//! `run` executes the image's entrypoint and cmd; `exec` replaces the
//! entrypoint with the first argument. The process exits with the
//! container's exit code, or 255 when the launcher itself fails.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use ocilaunch::{
    CliRuntime, HomeSpec, LaunchContext, LaunchOptions, Launcher, LauncherConfig, Namespaces,
    NativeLauncher, OciLauncher, RuntimeInvoker,
};
use ocilaunch::error::LAUNCHER_FAILURE_EXIT_CODE;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::debug;
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG_FILE: &str = "/etc/ocilaunch/ocilaunch.toml";

#[derive(Parser)]
#[command(name = "ocilaunch")]
#[command(about = "Run OCI container images with an external OCI runtime")]
#[command(version)]
struct Cli {
    /// Launcher configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Print debug output
    #[arg(short, long, global = true)]
    debug: bool,

    /// Only print errors
    #[arg(short, long, global = true, conflicts_with = "debug")]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the image's default process
    Run {
        /// Image reference (docker://, oci:, oci-archive:, ...)
        image: String,

        /// Replace the image's cmd
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,

        #[command(flatten)]
        launch: LaunchArgs,
    },

    /// Run a command inside the image
    Exec {
        /// Image reference (docker://, oci:, oci-archive:, ...)
        image: String,

        /// Command and its arguments
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,

        #[command(flatten)]
        launch: LaunchArgs,
    },

    /// Print a container's runtime state as JSON
    State {
        id: String,
    },

    /// Delete a container from the runtime's state
    Delete {
        id: String,

        /// Kill the container first if it is still running
        #[arg(short, long)]
        force: bool,
    },
}

#[derive(Args, Debug, Default)]
struct LaunchArgs {
    /// Use the native launcher, which honours more options
    #[arg(long)]
    native: bool,

    /// Run as root inside a user namespace
    #[arg(short, long)]
    fakeroot: bool,

    /// Request a user namespace
    #[arg(short = 'u', long)]
    userns: bool,

    /// Request a PID namespace
    #[arg(short, long)]
    pid: bool,

    /// Request an IPC namespace
    #[arg(short, long)]
    ipc: bool,

    /// Request a UTS namespace
    #[arg(long)]
    uts: bool,

    /// Request a network namespace
    #[arg(short, long)]
    net: bool,

    /// Bind mount src[:dest[:opts]]
    #[arg(short = 'B', long = "bind", value_name = "SPEC")]
    bind: Vec<String>,

    /// Mount type=bind,source=...,destination=...
    #[arg(long = "mount", value_name = "SPEC")]
    mount: Vec<String>,

    /// Home directory: dest or src:dest
    #[arg(short = 'H', long)]
    home: Option<String>,

    /// Do not mount a home directory
    #[arg(long)]
    no_home: bool,

    /// Skip a default mount
    #[arg(long = "no-mount", value_name = "PATH")]
    no_mount: Vec<String>,

    /// Working directory inside the container
    #[arg(long, alias = "pwd")]
    cwd: Option<String>,

    #[arg(short, long)]
    writable: bool,

    #[arg(long)]
    writable_tmpfs: bool,

    #[arg(short, long = "overlay")]
    overlay: Vec<String>,

    #[arg(short = 'S', long = "scratch")]
    scratch: Vec<String>,

    #[arg(short = 'W', long)]
    workdir: Option<String>,

    #[arg(long = "fusemount")]
    fusemount: Vec<String>,

    #[arg(long = "containlibs")]
    contain_libs: Vec<String>,

    #[arg(short, long)]
    contain: bool,

    #[arg(short = 'C', long)]
    containall: bool,

    #[arg(long)]
    sif_fuse: bool,

    /// Set a container environment variable (KEY=VALUE)
    #[arg(long = "env", value_name = "KEY=VALUE", value_parser = parse_key_val)]
    env: Vec<(String, String)>,

    /// Read container environment variables from a file
    #[arg(long)]
    env_file: Option<PathBuf>,

    /// Do not pass OCILAUNCHENV_ variables from the host
    #[arg(short = 'e', long)]
    cleanenv: bool,

    #[arg(long)]
    no_eval: bool,

    /// Network type (requires --net)
    #[arg(long)]
    network: Option<String>,

    #[arg(long = "network-args")]
    network_args: Vec<String>,

    /// Container hostname
    #[arg(long)]
    hostname: Option<String>,

    /// Comma-separated nameservers for resolv.conf
    #[arg(long)]
    dns: Option<String>,

    /// Comma-separated capabilities to add
    #[arg(long)]
    add_caps: Option<String>,

    /// Comma-separated capabilities to drop
    #[arg(long)]
    drop_caps: Option<String>,

    /// Allow setuid binaries in the container
    #[arg(long)]
    allow_setuid: bool,

    /// Keep the launcher's own capabilities
    #[arg(long)]
    keep_privs: bool,

    /// Drop all capabilities
    #[arg(long)]
    no_privs: bool,

    #[arg(long = "security")]
    security: Vec<String>,

    #[arg(long)]
    no_umask: bool,

    /// CDI device request (vendor/class=name)
    #[arg(long = "device")]
    device: Vec<String>,

    #[arg(long)]
    nv: bool,

    #[arg(long)]
    nvccli: bool,

    #[arg(long)]
    rocm: bool,

    /// JSON file with linux.resources limits
    #[arg(long)]
    apply_cgroups: Option<PathBuf>,

    #[arg(long)]
    shell: Option<String>,

    #[arg(long)]
    boot: bool,

    #[arg(long)]
    no_init: bool,

    #[arg(long)]
    app: Option<String>,

    /// Fetch without using the image cache
    #[arg(long)]
    disable_cache: bool,

    /// Leave the bundle on disk after the container exits
    #[arg(long)]
    keep_bundle: bool,
}

impl LaunchArgs {
    fn into_options(self) -> Result<LaunchOptions> {
        let home = self
            .home
            .as_deref()
            .map(HomeSpec::parse)
            .transpose()
            .context("invalid --home")?;

        Ok(LaunchOptions {
            fakeroot: self.fakeroot,
            namespaces: Namespaces {
                user: self.userns,
                pid: self.pid,
                ipc: self.ipc,
                uts: self.uts,
                net: self.net,
            },
            home,
            no_home: self.no_home,
            bind_paths: self.bind,
            mounts: self.mount,
            no_mount: self.no_mount,
            cwd: self.cwd,
            writable: self.writable,
            writable_tmpfs: self.writable_tmpfs,
            overlay_paths: self.overlay,
            scratch_dirs: self.scratch,
            work_dir: self.workdir,
            fuse_mount: self.fusemount,
            contain_libs: self.contain_libs,
            contain: self.contain,
            contain_all: self.containall,
            sif_fuse: self.sif_fuse,
            env: self.env.into_iter().collect::<BTreeMap<_, _>>(),
            env_file: self.env_file,
            clean_env: self.cleanenv,
            no_eval: self.no_eval,
            network: self.network,
            network_args: self.network_args,
            hostname: self.hostname,
            dns: self.dns,
            add_caps: self.add_caps,
            drop_caps: self.drop_caps,
            allow_suid: self.allow_setuid,
            keep_privs: self.keep_privs,
            no_privs: self.no_privs,
            security_opts: self.security,
            no_umask: self.no_umask,
            devices: self.device,
            nvidia: self.nv,
            nvccli: self.nvccli,
            rocm: self.rocm,
            cgroups_file: self.apply_cgroups,
            shell_path: self.shell,
            boot: self.boot,
            no_init: self.no_init,
            app_name: self.app,
            cache_disabled: self.disable_cache,
            keep_bundle: self.keep_bundle,
        })
    }
}

fn parse_key_val(s: &str) -> std::result::Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{}'", s)),
    }
}

fn init_tracing(debug: bool, quiet: bool) {
    let default = if debug {
        "debug"
    } else if quiet {
        "error"
    } else {
        "warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.debug, cli.quiet);

    match run(cli).await {
        Ok(code) => ExitCode::from(u8::try_from(code).unwrap_or(u8::MAX)),
        Err(e) => {
            eprintln!("error: {:#}", e);
            let code = e
                .downcast_ref::<ocilaunch::Error>()
                .map(|e| e.exit_code())
                .unwrap_or(LAUNCHER_FAILURE_EXIT_CODE);
            ExitCode::from(u8::try_from(code).unwrap_or(u8::MAX))
        }
    }
}

async fn run(cli: Cli) -> Result<i32> {
    let config = Arc::new(
        LauncherConfig::load(&cli.config)
            .with_context(|| format!("loading {}", cli.config.display()))?,
    );
    let runtime = Arc::new(CliRuntime::detect(&config)?);
    debug!(
        runtime = runtime.name(),
        binary = %runtime.binary().display(),
        "runtime selected"
    );

    match cli.command {
        Commands::Run {
            image,
            args,
            launch,
        } => launch_image(config, runtime, launch, &image, None, &args).await,
        Commands::Exec {
            image,
            command,
            launch,
        } => {
            let (process, args) = command
                .split_first()
                .context("exec requires a command")?;
            launch_image(config, runtime, launch, &image, Some(process), args).await
        }
        Commands::State { id } => {
            let state = runtime.state(&id).await?;
            println!("{}", serde_json::to_string_pretty(&state)?);
            Ok(0)
        }
        Commands::Delete { id, force } => {
            runtime.delete(&id, force).await?;
            Ok(0)
        }
    }
}

async fn launch_image(
    config: Arc<LauncherConfig>,
    runtime: Arc<CliRuntime>,
    launch: LaunchArgs,
    image: &str,
    process: Option<&str>,
    args: &[String],
) -> Result<i32> {
    let native = launch.native;
    let options = launch.into_options()?;
    let ctx = LaunchContext::new(options, config, runtime)?;

    let cancel = ctx.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            debug!("interrupt received, cancelling launch");
            cancel.cancel();
        }
    });

    let launcher: Box<dyn Launcher> = if native {
        Box::new(NativeLauncher::new(ctx)?)
    } else {
        Box::new(OciLauncher::new(ctx)?)
    };
    debug!(launcher = launcher.name(), image, "launching");

    Ok(launcher.exec(image, process, args, None).await?)
}
