//! `berth init` run as a real subprocess.

use std::path::{Path, PathBuf};

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn sentinel(dir: &Path, env: &[&str]) -> PathBuf {
    let path = dir.join("config.env");
    std::fs::write(&path, serde_json::to_vec(env).unwrap()).unwrap();
    path
}

fn init(env_file: &Path) -> Command {
    let mut cmd = Command::cargo_bin("berth").unwrap();
    cmd.arg("init").arg("--env-file").arg(env_file);
    cmd
}

const BASE_ENV: &[&str] = &["PATH=/usr/local/bin:/usr/bin:/bin", "HOME=/"];

#[test]
fn refuses_to_run_without_a_program() {
    Command::cargo_bin("berth")
        .unwrap()
        .arg("init")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("You should not invoke berth init manually"));
}

#[test]
fn environment_comes_only_from_the_sentinel() {
    let temp = TempDir::new().unwrap();
    let env_file = sentinel(temp.path(), &["PATH=/usr/bin:/bin", "FOO=bar", "EMPTY"]);

    init(&env_file)
        .env("LEAKED", "1")
        .args(["--", "env"])
        .assert()
        .success()
        .stdout(predicate::str::contains("FOO=bar\n"))
        .stdout(predicate::str::contains("EMPTY=\n"))
        .stdout(predicate::str::contains("LEAKED").not());
}

#[test]
fn missing_program_exits_127() {
    let temp = TempDir::new().unwrap();
    let env_file = sentinel(temp.path(), BASE_ENV);

    init(&env_file)
        .args(["--", "berth-no-such-program"])
        .assert()
        .code(127)
        .stderr(predicate::str::contains("Unable to locate berth-no-such-program"));
}

#[test]
fn program_exit_status_passes_through() {
    let temp = TempDir::new().unwrap();
    let env_file = sentinel(temp.path(), BASE_ENV);

    init(&env_file)
        .args(["--", "sh", "-c", "exit 42"])
        .assert()
        .code(42);
}

#[test]
fn workdir_is_entered_before_exec() {
    let temp = TempDir::new().unwrap();
    let env_file = sentinel(temp.path(), BASE_ENV);

    init(&env_file)
        .args(["-w", "/tmp", "--", "pwd"])
        .assert()
        .success()
        .stdout("/tmp\n");
}

#[test]
fn missing_workdir_is_fatal() {
    let temp = TempDir::new().unwrap();
    let env_file = sentinel(temp.path(), BASE_ENV);

    init(&env_file)
        .args(["-w", "/berth/does/not/exist", "--", "pwd"])
        .assert()
        .code(1)
        .stdout(predicate::str::is_empty());
}

#[test]
fn invalid_gateway_is_fatal() {
    let temp = TempDir::new().unwrap();
    let env_file = sentinel(temp.path(), BASE_ENV);

    init(&env_file)
        .args(["-g", "300.1.1.1", "--", "true"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("not a valid IP"));
}

#[test]
fn unreadable_sentinel_is_fatal() {
    let temp = TempDir::new().unwrap();

    init(&temp.path().join("absent.env"))
        .args(["--", "true"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Unable to load environment variables"));
}

#[test]
fn unknown_user_is_fatal() {
    let temp = TempDir::new().unwrap();
    let env_file = sentinel(temp.path(), BASE_ENV);

    init(&env_file)
        .args(["-u", "berth-no-such-user", "--", "true"])
        .assert()
        .code(1);
}

#[test]
fn numeric_user_missing_from_passwd_is_fatal() {
    let temp = TempDir::new().unwrap();
    let env_file = sentinel(temp.path(), BASE_ENV);

    init(&env_file)
        .args(["-u", "4242424", "--", "true"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Unable to find user 4242424"));
}

#[cfg(feature = "integration")]
#[test]
fn numeric_user_drops_privileges() {
    let temp = TempDir::new().unwrap();
    let env_file = sentinel(temp.path(), BASE_ENV);

    init(&env_file)
        .args(["-u", "65534", "--", "id", "-u"])
        .assert()
        .success()
        .stdout("65534\n");
}
