//! Tests for process resolution: argv, environment and working directory.

use ocilaunch::constants::LIBRARY_BIND_DIR;
use ocilaunch::fetch::ImageConfig;
use ocilaunch::process::{process_args, process_cwd, process_env, user_env};
use ocilaunch::{Error, LaunchOptions};
use std::collections::BTreeMap;
use std::fs;
use tempfile::TempDir;

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn image(entrypoint: &[&str], cmd: &[&str]) -> ImageConfig {
    ImageConfig {
        entrypoint: (!entrypoint.is_empty()).then(|| strings(entrypoint)),
        cmd: (!cmd.is_empty()).then(|| strings(cmd)),
        ..Default::default()
    }
}

// =============================================================================
// Argv
// =============================================================================

#[test]
fn test_argv_table() {
    let entrypoints: [&[&str]; 2] = [&[], &["/entry", "-x"]];
    let cmds: [&[&str]; 2] = [&[], &["cmd", "arg"]];
    let processes = [None, Some("/proc")];
    let args_sets: [&[&str]; 2] = [&[], &["a1", "a2"]];

    for entrypoint in entrypoints {
        for cmd in cmds {
            for process in processes {
                for args in args_sets {
                    let config = image(entrypoint, cmd);
                    let args = strings(args);
                    let argv = process_args(&config, process, &args);

                    let mut expected = match process {
                        Some(p) => vec![p.to_string()],
                        None => strings(entrypoint),
                    };
                    if !args.is_empty() {
                        expected.extend(args.clone());
                    } else if process.is_none() {
                        expected.extend(strings(cmd));
                    }

                    assert_eq!(
                        argv, expected,
                        "entrypoint={:?} cmd={:?} process={:?} args={:?}",
                        entrypoint, cmd, process, args
                    );
                }
            }
        }
    }
}

#[test]
fn test_process_override_drops_cmd() {
    let config = image(&["/entry"], &["cmd"]);
    assert_eq!(process_args(&config, Some("/bin/true"), &[]), ["/bin/true"]);
}

#[test]
fn test_empty_process_is_no_override() {
    let config = image(&["/entry"], &["cmd"]);
    assert_eq!(process_args(&config, Some(""), &[]), ["/entry", "cmd"]);
}

// =============================================================================
// Environment
// =============================================================================

fn env_value<'a>(env: &'a [String], key: &str) -> Option<&'a str> {
    env.iter()
        .find_map(|e| e.strip_prefix(key)?.strip_prefix('='))
}

#[test]
fn test_ld_library_path_always_contains_bind_dir() {
    let cases: [(&[&str], &[(&str, &str)]); 4] = [
        (&[], &[]),
        (&["LD_LIBRARY_PATH=/image/lib"], &[]),
        (&[], &[("LD_LIBRARY_PATH", "/user/lib")]),
        (&["LD_LIBRARY_PATH=/image/lib"], &[("LD_LIBRARY_PATH", LIBRARY_BIND_DIR)]),
    ];

    for (image_env, user_vars) in cases {
        let config = ImageConfig {
            env: Some(strings(image_env)),
            ..Default::default()
        };
        let user: BTreeMap<String, String> = user_vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let env = process_env(&config, &user);

        let ld = env_value(&env, "LD_LIBRARY_PATH").unwrap();
        assert_eq!(
            ld.split(':').filter(|p| *p == LIBRARY_BIND_DIR).count(),
            1,
            "{:?}",
            env
        );
        assert!(env.last().unwrap().starts_with("LD_LIBRARY_PATH="));
        let keys: Vec<&str> = env.iter().map(|e| e.split('=').next().unwrap()).collect();
        let mut unique = keys.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(keys.len(), unique.len(), "duplicate keys in {:?}", env);
    }
}

#[test]
fn test_env_precedence() {
    let temp = TempDir::new().unwrap();
    let env_file = temp.path().join("env");
    fs::write(&env_file, "A=file\nB=file\nC=\"quoted value\"\n").unwrap();

    let mut explicit = BTreeMap::new();
    explicit.insert("A".to_string(), "explicit".to_string());
    let opts = LaunchOptions {
        env_file: Some(env_file),
        env: explicit,
        ..Default::default()
    };
    let host = vec![
        ("OCILAUNCHENV_B".to_string(), "host".to_string()),
        ("HOME".to_string(), "/home/alice".to_string()),
    ];

    let user = user_env(&opts, host.clone()).unwrap();
    assert_eq!(user["A"], "explicit");
    assert_eq!(user["B"], "host");
    assert_eq!(user["C"], "quoted value");
    assert!(!user.contains_key("HOME"));

    let clean = LaunchOptions {
        clean_env: true,
        ..opts
    };
    let user = user_env(&clean, host).unwrap();
    assert_eq!(user["B"], "file");
}

#[test]
fn test_missing_env_file_is_configuration_error() {
    let opts = LaunchOptions {
        env_file: Some("/nonexistent/env-file".into()),
        ..Default::default()
    };
    let err = user_env(&opts, Vec::new()).unwrap_err();
    assert!(err.is_configuration());
}

// =============================================================================
// Working directory
// =============================================================================

#[test]
fn test_cwd_resolution() {
    let temp = TempDir::new().unwrap();
    fs::create_dir_all(temp.path().join("srv/app")).unwrap();

    let config = ImageConfig {
        working_dir: Some("/work".to_string()),
        ..Default::default()
    };
    assert_eq!(process_cwd(&config, None, temp.path()).unwrap(), "/work");
    assert_eq!(
        process_cwd(&ImageConfig::default(), None, temp.path()).unwrap(),
        "/"
    );
    assert_eq!(
        process_cwd(&config, Some("/srv/app"), temp.path()).unwrap(),
        "/srv/app"
    );
    assert!(matches!(
        process_cwd(&config, Some("/missing"), temp.path()),
        Err(Error::WorkDirNotFound { .. })
    ));
}
