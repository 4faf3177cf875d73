use std::fs;

use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use tempfile::tempdir;

#[test]
fn test_config_path_command() {
    let dir = tempdir().unwrap();

    cargo_bin_cmd!("cadet")
        .env("CADET_HOME", dir.path())
        .args(["config", "path"])
        .assert()
        .success()
        .stdout(predicate::str::contains(
            dir.path().join("config.toml").to_str().unwrap(),
        ));
}

#[test]
fn test_config_init_creates_file() {
    let dir = tempdir().unwrap();
    let config_path = dir.path().join("config.toml");

    cargo_bin_cmd!("cadet")
        .env("CADET_HOME", dir.path())
        .args(["config", "init"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Created config at"));

    let contents = fs::read_to_string(&config_path).unwrap();
    assert!(contents.contains("model = \"gemini-2.0-flash\""));
    assert!(contents.contains("[mcp]"));
}

#[test]
fn test_config_init_fails_if_exists() {
    let dir = tempdir().unwrap();
    let config_path = dir.path().join("config.toml");
    fs::write(&config_path, "# existing config").unwrap();

    cargo_bin_cmd!("cadet")
        .env("CADET_HOME", dir.path())
        .args(["config", "init"])
        .assert()
        .failure();

    assert_eq!(fs::read_to_string(&config_path).unwrap(), "# existing config");
}

#[test]
fn test_invalid_config_is_reported() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("config.toml"), "max_steps = \"many\"").unwrap();

    cargo_bin_cmd!("cadet")
        .env("CADET_HOME", dir.path())
        .args(["checkpoints", "list"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("load config"));
}
