// ABOUTME: Integration tests for the fanout CLI commands.
// ABOUTME: Validates --help output, argument validation, and exit codes.

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;

fn fanout_cmd() -> Command {
    Command::new(assert_cmd::cargo::cargo_bin!("fanout"))
}

#[test]
fn help_shows_commands() {
    fanout_cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("exec"))
        .stdout(predicate::str::contains("interactive"));
}

#[test]
fn exec_requires_targets_and_command() {
    fanout_cmd().arg("exec").assert().failure().code(2);

    fanout_cmd()
        .args(["exec", "web1"])
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("--command"));
}

#[test]
fn invalid_target_uses_batch_error_exit_code() {
    fanout_cmd()
        .args(["exec", "web1:notaport", "-c", "uptime"])
        .assert()
        .failure()
        .code(10)
        .stderr(predicate::str::contains("invalid port"));
}

#[test]
fn winrm_targets_are_rejected() {
    fanout_cmd()
        .args(["exec", "winrm://win1", "-c", "ipconfig"])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("unsupported protocol"));
}

#[test]
fn unknown_host_key_policy_is_rejected() {
    fanout_cmd()
        .args(["exec", "web1", "-c", "uptime", "--host-key", "sometimes"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown host key policy"));
}

#[test]
fn unknown_duplicate_policy_is_rejected() {
    fanout_cmd()
        .args([
            "exec",
            "web1",
            "-c",
            "uptime",
            "--duplicated-hosts",
            "sometimes",
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown duplicate policy"));
}

#[test]
fn password_only_requires_password() {
    fanout_cmd()
        .args(["exec", "web1", "-c", "uptime", "--password-only"])
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("--password"));
}

#[test]
fn sudo_password_requires_sudo() {
    fanout_cmd()
        .args(["exec", "web1", "-c", "uptime", "--sudo-password", "pw"])
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("--sudo"));
}

#[test]
fn broken_config_file_is_reported() {
    let temp_dir = tempfile::tempdir().unwrap();
    fs::write(temp_dir.path().join("fanout.yml"), "concurrency: 0\n").unwrap();

    fanout_cmd()
        .current_dir(temp_dir.path())
        .args(["exec", "web1", "-c", "uptime"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("concurrency"));
}
