//! Smoke tests for the qm CLI.
//!
//! - `qm --version` and `qm --help` work
//! - errors go to stderr with their taxonomy kind and exit code 1

mod common;

use assert_cmd::Command;
use common::TestEnv;
use predicates::prelude::*;

fn qm() -> Command {
    Command::new(env!("CARGO_BIN_EXE_qm"))
}

#[test]
fn test_version_flag() {
    qm().arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("qm"))
        .stdout(predicate::str::contains("0.1.0"));
}

#[test]
fn test_help_lists_subsystems() {
    qm().arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Usage:"))
        .stdout(predicate::str::contains("agent"))
        .stdout(predicate::str::contains("checkpoint"))
        .stdout(predicate::str::contains("knowledge"))
        .stdout(predicate::str::contains("monitor"));
}

#[test]
fn test_subcommand_required() {
    qm().assert().failure();
}

#[test]
fn test_error_json_on_stderr() {
    let env = TestEnv::new();
    env.qm()
        .args(["task", "show", "task_missing"])
        .assert()
        .code(1)
        .stdout(predicate::str::is_empty())
        .stderr(predicate::str::contains("\"kind\":\"NotFound\""))
        .stderr(predicate::str::contains("\"error\":"));
}

#[test]
fn test_error_human_on_stderr() {
    let env = TestEnv::new();
    env.qm()
        .args(["task", "show", "task_missing", "-H"])
        .assert()
        .code(1)
        .stderr(predicate::str::starts_with("Error [NotFound]:"));
}

#[test]
fn test_missing_project_path() {
    let env = TestEnv::new();
    env.qm()
        .args(["-C", "/definitely/not/here", "agent", "list"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("InvalidInput"));
}

#[test]
fn test_state_lives_in_data_dir() {
    let env = TestEnv::new();
    env.register("builder", "build", 1);
    assert!(env.data_path().join("agent_status.json").exists());
    assert!(!env.project_path().join("agent_status.json").exists());
}
