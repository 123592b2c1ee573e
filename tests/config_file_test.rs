// Integration test for configuration file support

use std::collections::BTreeSet;
use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;
use warden::config::{Config, ProcessSpec};
use warden::process::BackoffStrategy;

fn find<'a>(config: &'a Config, name: &str) -> &'a ProcessSpec {
    config
        .specs
        .iter()
        .find(|spec| spec.name == name)
        .unwrap_or_else(|| panic!("no spec named {}", name))
}

#[test]
fn test_load_documented_toml_example() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("warden.toml");

    let toml_content = r#"
        [daemon]
        socket_path = "/tmp/warden-test.sock"

        [[processes]]
        name = "snapshotter-lite"
        command = "poetry run python -m snapshotter.system_event_detector"
        shell = true
        max_restarts = 3
        min_uptime_ms = 60000
        cron_restart = "0 * * * *"
        env = { NODE_ENV = "development" }
        out_file = "/dev/null"
        error_file = "/dev/null"
    "#;
    fs::write(&config_path, toml_content).unwrap();

    let config = Config::from_file(&config_path).unwrap();
    assert_eq!(config.path, config_path);
    assert_eq!(config.daemon.socket_path, PathBuf::from("/tmp/warden-test.sock"));
    assert!(config.rejected.is_empty());

    let spec = find(&config, "snapshotter-lite");
    assert!(spec.shell);
    assert_eq!(spec.max_restarts, 3);
    assert_eq!(spec.min_uptime_ms, 60_000);
    assert_eq!(spec.cron_restart.as_deref(), Some("0 * * * *"));
    assert_eq!(spec.env.get("NODE_ENV").map(String::as_str), Some("development"));
    assert_eq!(spec.out_file, Some(PathBuf::from("/dev/null")));

    // Untouched fields keep their defaults
    assert_eq!(spec.restart_window_ms, 60_000);
    assert_eq!(spec.kill_timeout_ms, 1_600);
    assert_eq!(spec.stop_signal, "SIGTERM");
    assert!(spec.tree_kill);
    assert!(spec.autorestart);
    assert_eq!(spec.backoff, BackoffStrategy::Fixed);
}

#[test]
fn test_load_json_with_several_processes() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("warden.json");

    let json_content = r#"{
        "processes": [
            { "name": "web", "command": "/usr/bin/node", "args": ["server.js"] },
            {
                "name": "worker",
                "command": "/usr/bin/python3",
                "args": ["worker.py"],
                "clean_exit_codes": [0, 75],
                "backoff": "exponential",
                "restart_delay_ms": 500
            }
        ]
    }"#;
    fs::write(&config_path, json_content).unwrap();

    let config = Config::from_file(&config_path).unwrap();
    assert_eq!(config.specs.len(), 2);

    let worker = find(&config, "worker");
    assert_eq!(worker.clean_exit_codes, BTreeSet::from([0, 75]));
    assert_eq!(worker.backoff, BackoffStrategy::Exponential);
    assert_eq!(worker.restart_delay_ms, 500);
}

#[test]
fn test_bad_cron_rejects_only_that_spec() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("warden.toml");

    let toml_content = r#"
        [[processes]]
        name = "good"
        command = "/bin/true"

        [[processes]]
        name = "bad-cron"
        command = "/bin/true"
        cron_restart = "0 0 31 2 *"
    "#;
    fs::write(&config_path, toml_content).unwrap();

    let config = Config::from_file(&config_path).unwrap();
    assert_eq!(config.specs.len(), 1);
    assert_eq!(config.specs[0].name, "good");
    assert_eq!(config.rejected.len(), 1);
    assert_eq!(config.rejected[0].name, "bad-cron");
    assert_eq!(config.rejected[0].error.exit_code(), 3);
}

#[test]
fn test_file_level_errors_exit_with_three() {
    let temp_dir = TempDir::new().unwrap();

    let broken = temp_dir.path().join("broken.toml");
    fs::write(&broken, "[[processes]\nname = ").unwrap();
    assert_eq!(Config::from_file(&broken).unwrap_err().exit_code(), 3);

    let unknown = temp_dir.path().join("warden.yaml");
    fs::write(&unknown, "processes: []").unwrap();
    assert_eq!(Config::from_file(&unknown).unwrap_err().exit_code(), 3);

    let missing = temp_dir.path().join("missing.toml");
    assert_eq!(Config::from_file(&missing).unwrap_err().exit_code(), 3);
}

#[test]
fn test_env_var_expansion_in_config() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("warden.toml");
    std::env::set_var("WARDEN_CONFIG_TEST_HOME", temp_dir.path());

    let toml_content = r#"
        [[processes]]
        name = "expanded"
        command = "/bin/true"
        cwd = "${WARDEN_CONFIG_TEST_HOME}"
        out_file = "$WARDEN_CONFIG_TEST_HOME/out.log"
    "#;
    fs::write(&config_path, toml_content).unwrap();

    let config = Config::from_file(&config_path).unwrap();
    let spec = find(&config, "expanded");
    assert_eq!(spec.cwd.as_deref(), Some(temp_dir.path()));
    assert_eq!(spec.out_file, Some(temp_dir.path().join("out.log")));
}
