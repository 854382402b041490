//! Integration tests for the task queue via CLI.
//!
//! - `qm task submit` routes by capability and weight
//! - the assigned -> in_progress -> completed/failed lifecycle
//! - ownership and transition errors
//! - distribute, balance and normalize

mod common;

use common::TestEnv;
use predicates::prelude::*;

fn submit(env: &TestEnv, task_type: &str) -> String {
    let task = env.qm_json(&["task", "submit", task_type, "-d", "work"]);
    task["id"].as_str().unwrap().to_string()
}

#[test]
fn test_submit_prefers_capable_agent() {
    let env = TestEnv::new();
    env.register("agent_build", "build", 8);
    env.register("agent_debug", "debug", 9);

    let task = env.qm_json(&["task", "submit", "build"]);
    assert_eq!(task["assigned_agent"], "agent_build");
    assert_eq!(task["status"], "queued");
    assert_eq!(task["action"], "submitted");
}

#[test]
fn test_submit_without_capable_agent_fails() {
    let env = TestEnv::new();
    env.register("agent_debug", "debug", 9);

    env.qm()
        .args(["task", "submit", "deploy"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("NoCapableAgentError"));

    let list = env.qm_json(&["task", "list"]);
    assert_eq!(list["count"], 0);
}

#[test]
fn test_full_lifecycle() {
    let env = TestEnv::new();
    env.register("builder", "build", 1);
    let id = submit(&env, "build");

    let report = env.qm_json(&["task", "distribute"]);
    assert_eq!(report["assigned"].as_array().unwrap().len(), 1);

    let inbox = env.qm_json(&["agent", "inbox", "builder"]);
    assert_eq!(inbox["count"], 1);
    assert_eq!(inbox["notifications"][0]["task_id"], id.as_str());
    // Drained.
    assert_eq!(env.qm_json(&["agent", "inbox", "builder"])["count"], 0);

    let started = env.qm_json(&["task", "start", &id, "--agent", "builder"]);
    assert_eq!(started["status"], "in_progress");

    let agent = env.qm_json(&["agent", "status", "builder"]);
    assert_eq!(agent["current_task_id"], id.as_str());

    let done = env.qm_json(&["task", "complete", &id, "--agent", "builder"]);
    assert_eq!(done["status"], "completed");

    let agent = env.qm_json(&["agent", "status", "builder"]);
    assert_eq!(agent["tasks_completed"], 1);
    assert!(agent["current_task_id"].is_null());

    // Historical tasks are still visible.
    let shown = env.qm_json(&["task", "show", &id]);
    assert_eq!(shown["status"], "completed");
    let active = env.qm_json(&["task", "list", "--status", "in_progress"]);
    assert_eq!(active["count"], 0);
    assert_eq!(env.qm_json(&["task", "list"])["count"], 1);
}

#[test]
fn test_agent_name_from_environment() {
    let env = TestEnv::new();
    env.register("builder", "build", 1);
    let id = submit(&env, "build");
    env.qm_json(&["task", "distribute"]);

    env.qm()
        .args(["task", "start", &id])
        .env("QM_AGENT_NAME", "builder")
        .assert()
        .success()
        .stdout(predicate::str::contains("\"status\":\"in_progress\""));
}

#[test]
fn test_only_owner_can_transition() {
    let env = TestEnv::new();
    env.register("builder", "build", 1);
    env.register("other", "debug", 1);
    let id = submit(&env, "build");
    env.qm_json(&["task", "distribute"]);

    env.qm()
        .args(["task", "start", &id, "--agent", "other"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("NotOwner"));
}

#[test]
fn test_invalid_transition() {
    let env = TestEnv::new();
    env.register("builder", "build", 1);
    let id = submit(&env, "build");

    // Still queued: cannot start before distribution.
    env.qm()
        .args(["task", "start", &id, "--agent", "builder"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("InvalidTransition"));
}

#[test]
fn test_fail_records_reason() {
    let env = TestEnv::new();
    env.register("builder", "build", 1);
    let id = submit(&env, "build");
    env.qm_json(&["task", "distribute"]);

    let failed = env.qm_json(&[
        "task", "fail", &id, "--agent", "builder", "-r", "linker crashed",
    ]);
    assert_eq!(failed["status"], "failed");
    assert_eq!(failed["failure_reason"], "linker crashed");
}

#[test]
fn test_list_filters_and_human_output() {
    let env = TestEnv::new();
    env.register("builder", "build", 1);
    env.register("debugger", "debug", 1);
    submit(&env, "build");
    submit(&env, "debug");

    let list = env.qm_json(&["task", "list", "--agent", "debugger"]);
    assert_eq!(list["count"], 1);
    assert_eq!(list["tasks"][0]["type"], "debug");

    env.qm()
        .args(["task", "list", "-H"])
        .assert()
        .success()
        .stdout(predicate::str::contains("2 task(s)"));
}

#[test]
fn test_balance_and_normalize() {
    let env = TestEnv::new();
    env.register("builder", "build", 1);
    submit(&env, "build");
    submit(&env, "build");

    let balance = env.qm_json(&["task", "balance"]);
    assert_eq!(balance["queue_size"], 2);
    assert_eq!(balance["agents"]["builder"]["queued"], 2);

    let normalized = env.qm_json(&["task", "normalize"]);
    assert_eq!(normalized["duplicates_removed"], 0);
    assert_eq!(normalized["remaining"], 2);
}
