//! CLI smoke tests.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;

fn lxcsmith() -> Command {
    cargo_bin_cmd!("lxcsmith")
}

#[test]
fn test_help() {
    lxcsmith().arg("--help").assert().success();
}

#[test]
fn test_version() {
    lxcsmith().arg("--version").assert().success();
}

#[test]
fn test_validate_accepts_good_config() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("lxcsmith.toml");
    std::fs::write(
        &path,
        r#"
        os_template = "local:vztmpl/debian-12.tar.zst"
        hostname = "smoke-test"

        [connection]
        url = "https://pve.example.org:8006"
        username = "root@pam"
        token = "t"
        node = "pve1"

        [rootfs]
        storage_id = "local-lvm"
        disk_size = "8G"
        "#,
    )
    .unwrap();

    lxcsmith()
        .arg("validate")
        .arg("--config")
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("smoke-test"));
}

#[test]
fn test_validate_rejects_missing_rootfs() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("lxcsmith.toml");
    std::fs::write(
        &path,
        r#"
        os_template = "local:vztmpl/debian-12.tar.zst"

        [connection]
        url = "https://pve.example.org:8006"
        username = "root@pam"
        token = "t"
        node = "pve1"
        "#,
    )
    .unwrap();

    lxcsmith()
        .arg("validate")
        .arg("--config")
        .arg(&path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("rootfs"));
}
