//! 命令行集成测试

use assert_cmd::Command;
use predicates::prelude::*;
use std::path::PathBuf;

const FLEET: &str = r#"
[[devices]]
name = "meter-1"

[devices.channel]
kind = "tcp_client"
address = "127.0.0.1"
port = 9

[devices.instruction_set]
instructions = [{ name = "read", command = 0x02 }]
"#;

fn write_fleet(dir: &tempfile::TempDir, text: &str) -> PathBuf {
    let path = dir.path().join("fleet.toml");
    std::fs::write(&path, text).unwrap();
    path
}

#[test]
fn test_check_valid_fleet() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_fleet(&dir, FLEET);
    Command::cargo_bin("fieldlink-cli")
        .unwrap()
        .arg("run")
        .arg(&path)
        .arg("--check")
        .assert()
        .success()
        .stdout(predicate::str::contains("1 devices OK"))
        .stdout(predicate::str::contains("tcp_client://127.0.0.1:9"));
}

#[test]
fn test_check_rejects_duplicate_devices() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_fleet(&dir, &format!("{FLEET}{FLEET}"));
    Command::cargo_bin("fieldlink-cli")
        .unwrap()
        .arg("run")
        .arg(&path)
        .arg("--check")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Duplicate device name"));
}

#[test]
fn test_send_rejects_bad_hex() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_fleet(&dir, FLEET);
    Command::cargo_bin("fieldlink-cli")
        .unwrap()
        .args(["send", path.to_str().unwrap(), "meter-1", "read", "--payload", "zz"])
        .assert()
        .failure();
}

#[test]
fn test_missing_file() {
    Command::cargo_bin("fieldlink-cli")
        .unwrap()
        .args(["run", "/nonexistent/fleet.toml", "--check"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to read"));
}
