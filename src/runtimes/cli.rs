//! # Command-Line OCI Runtime
//!
//! Implements [`RuntimeInvoker`] by driving an installed `crun` or `runc`
//! binary. The runtime is the only process that touches namespaces and
//! cgroups; the launcher just prepares the bundle and waits.
//!
//! ## Invocation
//!
//! ```text
//! <runtime> --root <state_dir> [--systemd-cgroup] run --bundle <bundle> <id>
//! ```
//!
//! stdio is inherited so the container talks to the caller's terminal.
//!
//! ## Unprivileged Launches
//!
//! An unprivileged caller cannot write arbitrary ID maps. The runtime is
//! therefore started inside an outer user namespace whose maps are written
//! by the setuid `newuidmap`/`newgidmap` helpers:
//!
//! ```text
//! launcher                           runtime child (pre-exec)
//! ────────                           ────────────────────────
//! spawn ───────────────────────────► unshare(CLONE_NEWUSER)
//!        ◄──────────── ready(pid) ── write pid
//! newuidmap pid 0 uid 1 1 sub N           │ blocked on go pipe
//! newgidmap pid 0 gid 1 1 sub N           │
//! go ──────────────────────────────►      ▼
//!                                    exec runtime (uid 0 in namespace)
//! ```
//!
//! If writing the maps fails the go pipe is closed without a byte, the
//! child aborts before exec, and the error is reported.
//!
//! ## State Storage
//!
//! Runtime state lives in `state_dir` from the configuration, otherwise in
//! `$XDG_RUNTIME_DIR/ocilaunch-runtime`, otherwise `/run/ocilaunch-runtime`
//! (root) or a per-user directory under `/tmp`.

use crate::config::LauncherConfig;
use crate::error::{Error, Result};
use crate::runtime::{exit_code_from_status, CgroupsMode, ContainerState, RunRequest, RuntimeInvoker};
use crate::spec::IdMapping;
use async_trait::async_trait;
use nix::fcntl::OFlag;
use nix::unistd::{pipe2, Uid};
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus};
use tracing::{debug, info, warn};

/// Runtime binaries that understand the runc command line.
const KNOWN_RUNTIMES: &[&str] = &["crun", "runc"];

/// An installed runc-compatible runtime.
#[derive(Debug, Clone)]
pub struct CliRuntime {
    name: String,
    binary: PathBuf,
    state_dir: PathBuf,
    cgroups: CgroupsMode,
}

impl CliRuntime {
    /// Creates a runtime for an explicit binary.
    pub fn new(name: impl Into<String>, binary: PathBuf, state_dir: PathBuf) -> Self {
        Self {
            name: name.into(),
            binary,
            state_dir,
            cgroups: CgroupsMode::default(),
        }
    }

    /// Selects the first configured runtime found on `PATH`.
    pub fn detect(config: &LauncherConfig) -> Result<Self> {
        let mut missing = Vec::new();
        for name in &config.runtime {
            if !KNOWN_RUNTIMES.contains(&name.as_str()) {
                warn!(runtime = %name, "runtime is not runc-compatible, skipping");
                continue;
            }
            match which::which(name) {
                Ok(binary) => {
                    info!(runtime = %name, path = %binary.display(), "using runtime");
                    let mut runtime = Self::new(name.clone(), binary, default_state_dir(config));
                    if config.systemd_cgroups {
                        runtime.cgroups = CgroupsMode::Systemd;
                    }
                    return Ok(runtime);
                }
                Err(e) => missing.push(format!("{}: {}", name, e)),
            }
        }
        Err(Error::RuntimeUnavailable {
            runtime: config.runtime.join(","),
            reason: if missing.is_empty() {
                "no runc-compatible runtime configured".to_string()
            } else {
                missing.join("; ")
            },
        })
    }

    /// Path of the runtime binary.
    pub fn binary(&self) -> &Path {
        &self.binary
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    /// Base command with the global flags every subcommand needs.
    fn command(&self, cgroups: CgroupsMode) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("--root").arg(&self.state_dir);
        if cgroups == CgroupsMode::Systemd {
            cmd.arg("--systemd-cgroup");
        }
        cmd
    }

    fn exec_error(&self, id: &str, reason: impl Into<String>) -> Error {
        Error::RuntimeExec {
            runtime: self.name.clone(),
            id: id.to_string(),
            reason: reason.into(),
        }
    }

    fn run_command(&self, request: &RunRequest) -> Command {
        let cgroups = match (request.cgroups, self.cgroups) {
            (CgroupsMode::Systemd, _) | (_, CgroupsMode::Systemd) => CgroupsMode::Systemd,
            _ => CgroupsMode::Cgroupfs,
        };
        let mut cmd = self.command(cgroups);
        cmd.arg("run")
            .arg("--bundle")
            .arg(&request.bundle)
            .arg(&request.id);
        cmd
    }
}

/// Chooses the runtime state directory.
pub fn default_state_dir(config: &LauncherConfig) -> PathBuf {
    if let Some(dir) = &config.state_dir {
        return dir.clone();
    }
    if let Some(dir) = dirs::runtime_dir() {
        return dir.join("ocilaunch-runtime");
    }
    let uid = Uid::current();
    if uid.is_root() {
        PathBuf::from("/run/ocilaunch-runtime")
    } else {
        std::env::temp_dir().join(format!("ocilaunch-runtime-{}", uid))
    }
}

#[async_trait]
impl RuntimeInvoker for CliRuntime {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, request: &RunRequest) -> Result<i32> {
        std::fs::create_dir_all(&self.state_dir).map_err(|e| {
            self.exec_error(
                &request.id,
                format!("cannot create state dir {}: {}", self.state_dir.display(), e),
            )
        })?;

        let cmd = self.run_command(request);
        info!(
            id = %request.id,
            bundle = %request.bundle.display(),
            runtime = %self.name,
            rootless = request.outer.is_some(),
            "starting container"
        );

        let status = match &request.outer {
            None => tokio::process::Command::from(cmd)
                .status()
                .await
                .map_err(|e| self.exec_error(&request.id, format!("failed to execute: {}", e)))?,
            Some(outer) => {
                run_in_user_namespace(cmd, &outer.uid_map, &outer.gid_map)
                    .await
                    .map_err(|e| self.exec_error(&request.id, e.to_string()))?
            }
        };

        let code = exit_code_from_status(status);
        debug!(id = %request.id, code, "container exited");
        Ok(code)
    }

    async fn state(&self, id: &str) -> Result<ContainerState> {
        let mut cmd = self.command(self.cgroups);
        cmd.arg("state").arg(id);
        let output = tokio::process::Command::from(cmd)
            .output()
            .await
            .map_err(|e| self.exec_error(id, format!("failed to execute: {}", e)))?;
        if !output.status.success() {
            return Err(self.exec_error(id, String::from_utf8_lossy(&output.stderr).trim()));
        }
        serde_json::from_slice(&output.stdout)
            .map_err(|e| Error::Serialization(format!("{} state output: {}", self.name, e)))
    }

    async fn delete(&self, id: &str, force: bool) -> Result<()> {
        let mut cmd = self.command(self.cgroups);
        cmd.arg("delete");
        if force {
            cmd.arg("--force");
        }
        cmd.arg(id);
        let output = tokio::process::Command::from(cmd)
            .output()
            .await
            .map_err(|e| self.exec_error(id, format!("failed to execute: {}", e)))?;
        if !output.status.success() {
            return Err(self.exec_error(id, String::from_utf8_lossy(&output.stderr).trim()));
        }
        info!(id, runtime = %self.name, "container deleted");
        Ok(())
    }
}

// =============================================================================
// Outer user namespace
// =============================================================================

/// Arguments for `newuidmap`/`newgidmap`: `<pid> (<inner> <outer> <count>)...`.
pub fn id_map_args(pid: i32, mappings: &[IdMapping]) -> Vec<String> {
    let mut args = vec![pid.to_string()];
    for m in mappings {
        args.push(m.container_id.to_string());
        args.push(m.host_id.to_string());
        args.push(m.size.to_string());
    }
    args
}

async fn write_id_map(helper: &str, pid: i32, mappings: &[IdMapping]) -> io::Result<()> {
    let binary = which::which(helper)
        .map_err(|e| io::Error::new(io::ErrorKind::NotFound, format!("{}: {}", helper, e)))?;
    let args = id_map_args(pid, mappings);
    debug!(helper, ?args, "writing id map");
    let output = tokio::process::Command::new(&binary)
        .args(&args)
        .output()
        .await?;
    if !output.status.success() {
        return Err(io::Error::other(format!(
            "{} failed: {}",
            helper,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}

/// Runs `cmd` in a new user namespace mapped with the setuid helpers.
async fn run_in_user_namespace(
    mut cmd: Command,
    uid_map: &[IdMapping],
    gid_map: &[IdMapping],
) -> io::Result<ExitStatus> {
    let (ready_r, ready_w): (OwnedFd, OwnedFd) = pipe2(OFlag::O_CLOEXEC)?;
    let (go_r, go_w): (OwnedFd, OwnedFd) = pipe2(OFlag::O_CLOEXEC)?;

    let child_fds = (
        ready_r.as_raw_fd(),
        ready_w.as_raw_fd(),
        go_r.as_raw_fd(),
        go_w.as_raw_fd(),
    );

    // SAFETY: the closure runs between fork and exec and only makes
    // async-signal-safe libc calls on descriptors owned by this function.
    unsafe {
        cmd.pre_exec(move || {
            let (ready_r, ready_w, go_r, go_w) = child_fds;
            libc::close(ready_r);
            libc::close(go_w);
            if libc::unshare(libc::CLONE_NEWUSER) != 0 {
                return Err(io::Error::last_os_error());
            }
            let pid = libc::getpid().to_ne_bytes();
            if libc::write(ready_w, pid.as_ptr().cast(), pid.len()) != pid.len() as isize {
                return Err(io::Error::last_os_error());
            }
            libc::close(ready_w);
            let mut go = [0u8; 1];
            if libc::read(go_r, go.as_mut_ptr().cast(), 1) != 1 {
                return Err(io::Error::from_raw_os_error(libc::ECANCELED));
            }
            Ok(())
        });
    }

    // spawn() returns only once the child has exec'd, which it cannot do
    // before the maps are written, so it runs on a blocking thread.
    let runner = tokio::task::spawn_blocking(move || {
        let child = cmd.spawn();
        drop(ready_w);
        drop(go_r);
        child?.wait()
    });

    let pid = tokio::task::spawn_blocking(move || {
        let mut ready = File::from(ready_r);
        let mut buf = [0u8; 4];
        ready.read_exact(&mut buf).map(|_| i32::from_ne_bytes(buf))
    })
    .await
    .map_err(io::Error::other)?;

    let mapped = match pid {
        Ok(pid) => {
            debug!(pid, "runtime waiting in new user namespace");
            match write_id_map("newuidmap", pid, uid_map).await {
                Ok(()) => write_id_map("newgidmap", pid, gid_map).await,
                Err(e) => Err(e),
            }
        }
        Err(e) => Err(e),
    };

    let mut go = File::from(go_w);
    let released = match &mapped {
        Ok(()) => go.write_all(b"1"),
        Err(_) => Ok(()),
    };
    drop(go);

    let status = runner.await.map_err(io::Error::other)?;
    mapped?;
    released?;
    status
}
