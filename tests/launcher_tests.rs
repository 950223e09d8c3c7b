//! End-to-end tests for the launch pipeline.
//!
//! Each test builds a small OCI layout on disk, launches it through an
//! `OciLauncher` or `NativeLauncher` with a recording runtime, and checks
//! the bundle the runtime was handed.

use async_trait::async_trait;
use ocilaunch::fetch::{
    Descriptor, ImageManifest, LayoutWriter, MEDIA_TYPE_LAYER_GZIP, MEDIA_TYPE_OCI_CONFIG,
};
use ocilaunch::spec::{IdMapping, NamespaceType, RuntimeSpec};
use ocilaunch::{
    ContainerState, DefaultFetcher, Error, HostIdentity, LaunchContext, LaunchOptions, Launcher,
    LauncherConfig, LayerExtractor, NativeLauncher, OciLauncher, Result, RunRequest,
    RuntimeInvoker,
};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

// =============================================================================
// Fixtures
// =============================================================================

/// What the runtime saw when it was asked to run a bundle.
#[derive(Debug, Clone)]
struct Observed {
    request: RunRequest,
    spec: RuntimeSpec,
    rootfs_passwd: bool,
    etc_files: Vec<String>,
}

struct RecordingRuntime {
    code: i32,
    observed: Mutex<Vec<Observed>>,
}

impl RecordingRuntime {
    fn new(code: i32) -> Arc<Self> {
        Arc::new(Self {
            code,
            observed: Mutex::new(Vec::new()),
        })
    }

    fn single(&self) -> Observed {
        let observed = self.observed.lock().unwrap();
        assert_eq!(observed.len(), 1, "runtime should run exactly once");
        observed[0].clone()
    }

    fn runs(&self) -> usize {
        self.observed.lock().unwrap().len()
    }
}

#[async_trait]
impl RuntimeInvoker for RecordingRuntime {
    fn name(&self) -> &str {
        "recording"
    }

    async fn run(&self, request: &RunRequest) -> Result<i32> {
        let spec = RuntimeSpec::load(&request.bundle.join("config.json"))?;
        let mut etc_files: Vec<String> = fs::read_dir(request.bundle.join("etc"))?
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        etc_files.sort();
        self.observed.lock().unwrap().push(Observed {
            request: request.clone(),
            spec,
            rootfs_passwd: request.bundle.join("rootfs/etc/passwd").is_file(),
            etc_files,
        });
        Ok(self.code)
    }

    async fn state(&self, id: &str) -> Result<ContainerState> {
        Err(Error::Internal(format!("no state for {}", id)))
    }

    async fn delete(&self, _id: &str, _force: bool) -> Result<()> {
        Ok(())
    }
}

fn layer(files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for dir in ["etc/", "bin/", "srv/"] {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Directory);
        header.set_size(0);
        header.set_mode(0o755);
        builder
            .append_data(&mut header, dir, std::io::empty())
            .unwrap();
    }
    for (path, data) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        builder.append_data(&mut header, path, *data).unwrap();
    }
    let tar = builder.into_inner().unwrap();

    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(&tar).unwrap();
    encoder.finish().unwrap()
}

/// Writes a one-layer OCI layout whose config carries `image_config`.
fn write_layout(root: &Path, image_config: &str) {
    let writer = LayoutWriter::create(root).unwrap();
    let config = format!(r#"{{"architecture":"amd64","os":"linux","config":{}}}"#, image_config);
    let config_digest = writer.put_bytes(config.as_bytes()).unwrap();

    let layer = layer(&[
        (
            "etc/passwd",
            b"root:x:0:0:root:/root:/bin/sh\ndaemon:x:2:2::/:/bin/sh\n",
        ),
        ("etc/group", b"root:x:0:\ndaemon:x:2:\n"),
        ("bin/sh", b"#!fake shell\n"),
    ]);
    let layer_digest = writer.put_bytes(&layer).unwrap();

    writer
        .finish(&ImageManifest {
            schema_version: 2,
            media_type: None,
            config: Descriptor::new(MEDIA_TYPE_OCI_CONFIG, config_digest, config.len() as u64),
            layers: vec![Descriptor::new(
                MEDIA_TYPE_LAYER_GZIP,
                layer_digest,
                layer.len() as u64,
            )],
        })
        .unwrap();
}

struct Fixture {
    temp: TempDir,
    image: String,
    config: Arc<LauncherConfig>,
}

impl Fixture {
    fn new(image_config: &str) -> Self {
        let temp = TempDir::new().unwrap();
        let layout = temp.path().join("layout");
        write_layout(&layout, image_config);

        let subuid = temp.path().join("subuid");
        let subgid = temp.path().join("subgid");
        fs::write(&subuid, "alice:100000:65536\n").unwrap();
        fs::write(&subgid, "alice:100000:65536\n").unwrap();
        fs::create_dir(temp.path().join("bundles")).unwrap();

        let config = LauncherConfig {
            subuid_file: subuid,
            subgid_file: subgid,
            cdi_spec_dirs: vec![temp.path().join("cdi")],
            ..Default::default()
        };

        Self {
            image: format!("oci:{}", layout.display()),
            config: Arc::new(config),
            temp,
        }
    }

    fn bundles(&self) -> PathBuf {
        self.temp.path().join("bundles")
    }

    fn context(&self, options: LaunchOptions, runtime: Arc<RecordingRuntime>) -> LaunchContext {
        LaunchContext {
            options: Arc::new(options),
            config: Arc::clone(&self.config),
            host: HostIdentity {
                uid: 1000,
                gid: 1000,
                user_name: "alice".to_string(),
                home: PathBuf::from("/home/alice"),
            },
            fetcher: Arc::new(DefaultFetcher::new(None)),
            extractor: Arc::new(LayerExtractor),
            runtime,
            bundle_base: self.bundles(),
            host_env: vec![
                ("OCILAUNCHENV_GREETING".to_string(), "hello".to_string()),
                ("SECRET".to_string(), "hidden".to_string()),
            ],
            terminal: false,
            cancel: CancellationToken::new(),
        }
    }

    fn remaining_bundles(&self) -> usize {
        fs::read_dir(self.bundles()).unwrap().count()
    }
}

const DEFAULT_IMAGE: &str = r#"{"Entrypoint":["/bin/sh"],"Cmd":["-c","true"],"Env":["PATH=/usr/bin:/bin"]}"#;

// =============================================================================
// Happy paths
// =============================================================================

#[test_log::test(tokio::test)]
async fn test_unprivileged_launch_runs_as_caller() {
    let fixture = Fixture::new(DEFAULT_IMAGE);
    let runtime = RecordingRuntime::new(0);
    let launcher =
        OciLauncher::new(fixture.context(LaunchOptions::default(), runtime.clone())).unwrap();

    let code = launcher
        .exec(&fixture.image, None, &[], None)
        .await
        .unwrap();
    assert_eq!(code, 0);

    let observed = runtime.single();
    let process = observed.spec.process.as_ref().unwrap();
    assert_eq!(process.args, ["/bin/sh", "-c", "true"]);
    assert_eq!((process.user.uid, process.user.gid), (1000, 1000));
    assert!(process.env.contains(&"GREETING=hello".to_string()));
    assert!(!process.env.iter().any(|e| e.starts_with("SECRET=")));
    assert!(process.no_new_privileges);
    assert!(process.capabilities.as_ref().unwrap().permitted.is_empty());

    assert!(observed.spec.has_namespace(NamespaceType::User));
    let linux = observed.spec.linux.as_ref().unwrap();
    assert!(linux.uid_mappings.contains(&IdMapping::new(1000, 0, 1)));
    assert!(linux.gid_mappings.contains(&IdMapping::new(1000, 0, 1)));
    let outer = observed.request.outer.as_ref().unwrap();
    assert_eq!(outer.uid_map[0], IdMapping::new(0, 1000, 1));

    assert!(observed.rootfs_passwd);
    assert!(observed.etc_files.contains(&"passwd".to_string()));
    let passwd_mount = observed
        .spec
        .mounts
        .iter()
        .find(|m| m.destination == "/etc/passwd")
        .unwrap();
    assert!(passwd_mount.source.starts_with(fixture.bundles().to_str().unwrap()));

    assert_eq!(fixture.remaining_bundles(), 0, "bundle must be removed");
}

#[test_log::test(tokio::test)]
async fn test_fakeroot_exec_maps_root() {
    let fixture = Fixture::new(DEFAULT_IMAGE);
    let runtime = RecordingRuntime::new(0);
    let options = LaunchOptions {
        fakeroot: true,
        ..Default::default()
    };
    let launcher = OciLauncher::new(fixture.context(options, runtime.clone())).unwrap();

    let args = vec!["-l".to_string()];
    launcher
        .exec(&fixture.image, Some("/bin/ls"), &args, None)
        .await
        .unwrap();

    let observed = runtime.single();
    let process = observed.spec.process.as_ref().unwrap();
    assert_eq!(process.args, ["/bin/ls", "-l"]);
    assert_eq!((process.user.uid, process.user.gid), (0, 0));

    assert!(observed.spec.has_namespace(NamespaceType::User));
    let linux = observed.spec.linux.as_ref().unwrap();
    assert_eq!(
        linux.uid_mappings,
        vec![IdMapping::new(0, 0, 1), IdMapping::new(1, 1, 65535)]
    );
    assert!(observed.request.outer.is_some());
    assert!(!observed.etc_files.contains(&"passwd".to_string()));
    assert!(observed.spec.mounts.iter().any(|m| m.destination == "/root"));
}

#[test_log::test(tokio::test)]
async fn test_image_user_is_honoured() {
    let fixture = Fixture::new(
        r#"{"Cmd":["/bin/sh"],"User":"daemon","WorkingDir":"/srv"}"#,
    );
    let runtime = RecordingRuntime::new(0);
    let launcher =
        OciLauncher::new(fixture.context(LaunchOptions::default(), runtime.clone())).unwrap();

    launcher.exec(&fixture.image, None, &[], None).await.unwrap();

    let observed = runtime.single();
    let process = observed.spec.process.as_ref().unwrap();
    assert_eq!((process.user.uid, process.user.gid), (2, 2));
    assert_eq!(process.cwd, "/srv");
    let linux = observed.spec.linux.as_ref().unwrap();
    assert!(linux.uid_mappings.contains(&IdMapping::new(2, 0, 1)));
    assert!(!observed.etc_files.contains(&"passwd".to_string()));
}

#[test_log::test(tokio::test)]
async fn test_container_exit_code_is_returned() {
    let fixture = Fixture::new(DEFAULT_IMAGE);
    let runtime = RecordingRuntime::new(42);
    let launcher =
        OciLauncher::new(fixture.context(LaunchOptions::default(), runtime.clone())).unwrap();

    let code = launcher.exec(&fixture.image, None, &[], None).await.unwrap();
    assert_eq!(code, 42);
    assert_eq!(fixture.remaining_bundles(), 0);
}

#[test_log::test(tokio::test)]
async fn test_keep_bundle() {
    let fixture = Fixture::new(DEFAULT_IMAGE);
    let runtime = RecordingRuntime::new(0);
    let options = LaunchOptions {
        keep_bundle: true,
        ..Default::default()
    };
    let launcher = OciLauncher::new(fixture.context(options, runtime.clone())).unwrap();
    launcher.exec(&fixture.image, None, &[], None).await.unwrap();

    let bundle = runtime.single().request.bundle;
    assert!(bundle.join("config.json").is_file());
    assert!(bundle.join("rootfs/bin/sh").is_file());
    assert_eq!(fixture.remaining_bundles(), 1);
}

#[test_log::test(tokio::test)]
async fn test_native_launcher_sets_hostname() {
    let fixture = Fixture::new(DEFAULT_IMAGE);
    let runtime = RecordingRuntime::new(0);
    let options = LaunchOptions {
        hostname: Some("box".to_string()),
        ..Default::default()
    };
    let launcher = NativeLauncher::new(fixture.context(options, runtime.clone())).unwrap();
    assert_eq!(launcher.name(), "native");
    launcher.exec(&fixture.image, None, &[], None).await.unwrap();

    let observed = runtime.single();
    assert_eq!(observed.spec.hostname.as_deref(), Some("box"));
    assert!(observed.spec.has_namespace(NamespaceType::Uts));
}

// =============================================================================
// Failures
// =============================================================================

#[test]
fn test_oci_launcher_rejects_unsupported_options() {
    let fixture = Fixture::new(DEFAULT_IMAGE);
    let options = LaunchOptions {
        writable: true,
        boot: true,
        hostname: Some("box".to_string()),
        ..Default::default()
    };
    let err = OciLauncher::new(fixture.context(options, RecordingRuntime::new(0)))
        .err()
        .unwrap();
    match err {
        Error::UnsupportedOptions { launcher, options } => {
            assert_eq!(launcher, "oci");
            assert_eq!(options.len(), 3);
        }
        other => panic!("unexpected error {:?}", other),
    }
}

#[tokio::test]
async fn test_instance_rejected() {
    let fixture = Fixture::new(DEFAULT_IMAGE);
    let runtime = RecordingRuntime::new(0);
    let launcher =
        OciLauncher::new(fixture.context(LaunchOptions::default(), runtime.clone())).unwrap();
    let err = launcher
        .exec(&fixture.image, None, &[], Some("web"))
        .await
        .unwrap_err();
    assert!(err.is_configuration());
    assert_eq!(runtime.runs(), 0);
}

#[tokio::test]
async fn test_missing_workdir_fails_before_run() {
    let fixture = Fixture::new(DEFAULT_IMAGE);
    let runtime = RecordingRuntime::new(0);
    let options = LaunchOptions {
        cwd: Some("/does/not/exist".to_string()),
        ..Default::default()
    };
    let launcher = OciLauncher::new(fixture.context(options, runtime.clone())).unwrap();
    let err = launcher
        .exec(&fixture.image, None, &[], None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::WorkDirNotFound { .. }));
    assert_eq!(runtime.runs(), 0);
    assert_eq!(fixture.remaining_bundles(), 0);
}

#[tokio::test]
async fn test_missing_image_leaves_no_bundle() {
    let fixture = Fixture::new(DEFAULT_IMAGE);
    let runtime = RecordingRuntime::new(0);
    let launcher =
        OciLauncher::new(fixture.context(LaunchOptions::default(), runtime.clone())).unwrap();
    let image = format!("oci:{}", fixture.temp.path().join("absent").display());
    let err = launcher.exec(&image, None, &[], None).await.unwrap_err();
    assert!(matches!(err, Error::FetchFailed { .. }), "{:?}", err);
    assert_eq!(runtime.runs(), 0);
    assert_eq!(fixture.remaining_bundles(), 0);
}

#[tokio::test]
async fn test_cancelled_launch() {
    let fixture = Fixture::new(DEFAULT_IMAGE);
    let runtime = RecordingRuntime::new(0);
    let ctx = fixture.context(LaunchOptions::default(), runtime.clone());
    ctx.cancellation_token().cancel();
    let launcher = OciLauncher::new(ctx).unwrap();

    let err = launcher
        .exec(&fixture.image, None, &[], None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Cancelled(_)), "{:?}", err);
    assert_eq!(runtime.runs(), 0);
    assert_eq!(fixture.remaining_bundles(), 0);
}

#[tokio::test]
async fn test_image_without_command() {
    let fixture = Fixture::new(r#"{"Env":["A=1"]}"#);
    let runtime = RecordingRuntime::new(0);
    let launcher =
        OciLauncher::new(fixture.context(LaunchOptions::default(), runtime.clone())).unwrap();
    let err = launcher
        .exec(&fixture.image, None, &[], None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::SpecGeneration(_)), "{:?}", err);
    assert_eq!(runtime.runs(), 0);
}
