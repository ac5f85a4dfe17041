//! Integration tests for the jinject binary
//!
//! Each run gets its own HOME and working directory so no real config leaks in.

use std::path::Path;
use std::process::{Command, Output};

fn jinject(dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_jinject"))
        .args(args)
        .current_dir(dir)
        .env("HOME", dir)
        .env("USERPROFILE", dir)
        .env_remove("JINJECT_TIMEOUT_MS")
        .env_remove("JINJECT_TARGET_PROCESS")
        .env_remove("JINJECT_LOG_FILE")
        .env_remove("JINJECT_JVM_LIBRARY")
        .env_remove("JINJECT_LOG")
        .output()
        .expect("Failed to execute jinject")
}

// ========== config ==========

#[test]
fn test_config_show_returns_valid_toml() {
    let dir = tempfile::tempdir().unwrap();
    let output = jinject(dir.path(), &["config", "show"]);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(output.status.success());

    let parsed: Result<jinject_config::Config, _> = toml::from_str(&stdout);
    assert!(parsed.is_ok(), "config show should return valid TOML: {:?}", parsed.err());
    let config = parsed.unwrap();
    assert_eq!(config.injector.target_process, "javaw.exe");
    assert_eq!(config.reload.poll_interval_ms, 1000);

    for section in ["[injector]", "[runtime]", "[reload]", "[log]"] {
        assert!(stdout.contains(section), "Missing {section} section");
    }
}

#[test]
fn test_config_show_applies_project_layer() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join(".jinject")).unwrap();
    std::fs::write(
        dir.path().join(".jinject/config.toml"),
        "[injector]\ntarget_process = \"java\"\n",
    )
    .unwrap();

    let output = jinject(dir.path(), &["config", "show"]);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(output.status.success());
    assert!(stdout.contains("target_process = \"java\""));
    // Keys the project file does not set keep their defaults.
    assert!(stdout.contains("remote_timeout_ms = 5000"));
}

#[test]
fn test_config_path_shows_locations() {
    let dir = tempfile::tempdir().unwrap();
    let output = jinject(dir.path(), &["config", "path"]);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(output.status.success());
    assert!(stdout.contains("Global:"));
    assert!(stdout.contains("Project:"));
    assert!(stdout.contains(".jinject/config.toml"));
}

// ========== ps ==========

#[test]
fn test_ps_json_without_matches() {
    let dir = tempfile::tempdir().unwrap();
    let output = jinject(dir.path(), &["ps", "no-such-jvm-process", "--json"]);
    assert!(output.status.success());
    let listed: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(listed, serde_json::json!([]));
}

#[test]
fn test_ps_refuses_critical_names() {
    let dir = tempfile::tempdir().unwrap();
    let output = jinject(dir.path(), &["ps", "lsass.exe"]);
    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("4001"), "unexpected stderr: {stderr}");
}

// ========== inject / eject ==========

#[test]
fn test_inject_rejects_pid_zero() {
    let dir = tempfile::tempdir().unwrap();
    let agent = dir.path().join("agent.so");
    std::fs::write(&agent, b"\x7fELF").unwrap();
    let jar = dir.path().join("app.jar");
    std::fs::write(&jar, b"PK\x03\x04").unwrap();

    let output = jinject(
        dir.path(),
        &[
            "inject",
            jar.to_str().unwrap(),
            "--pid",
            "0",
            "--agent",
            agent.to_str().unwrap(),
        ],
    );
    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("INVALID_PARAMETER"), "unexpected stderr: {stderr}");
}

#[test]
fn test_inject_reports_missing_target() {
    let dir = tempfile::tempdir().unwrap();
    let jar = dir.path().join("app.jar");
    std::fs::write(&jar, b"PK\x03\x04").unwrap();
    let output = jinject(
        dir.path(),
        &[
            "inject",
            jar.to_str().unwrap(),
            "--process",
            "no-such-jvm-process",
            "--agent",
            "agent.so",
        ],
    );
    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("no running process"), "unexpected stderr: {stderr}");
}

#[test]
fn test_eject_requires_pid() {
    let dir = tempfile::tempdir().unwrap();
    let output = jinject(dir.path(), &["eject"]);
    assert!(!output.status.success());
}
