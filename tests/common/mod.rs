//! Common test utilities for qm integration tests.
//!
//! Provides `TestEnv` for isolated test environments that never touch the
//! user's real data or config directories.

#![allow(dead_code)]

use assert_cmd::Command;
use std::path::Path;
pub use tempfile::TempDir;

/// Settings read from the environment that must not leak in from the host.
const SETTING_VARS: &[&str] = &[
    "LOCK_TIMEOUT",
    "MAX_RETRIES",
    "RETRY_DELAY",
    "UNRESPONSIVE_THRESHOLD",
    "SUPERVISE_INTERVAL",
    "SYNC_INTERVAL",
    "MONITOR_INTERVAL",
    "COMPLEXITY_THRESHOLD",
    "COVERAGE_DROP_THRESHOLD",
    "BUILD_TIME_INCREASE_THRESHOLD",
    "ERROR_RATE_THRESHOLD",
    "DEPENDENCY_STALE_DAYS",
    "CHECKPOINT_KEEP",
    "COMMAND_TIMEOUT",
];

/// A test environment with isolated project and data directories.
///
/// - `project_dir`: the project tree agents work on (the command's cwd)
/// - `data_dir`: Quartermaster's state (via `QM_DATA_DIR`), also used as
///   `XDG_CONFIG_HOME` so no system config is picked up
pub struct TestEnv {
    pub project_dir: TempDir,
    pub data_dir: TempDir,
}

impl TestEnv {
    pub fn new() -> Self {
        Self {
            project_dir: TempDir::new().unwrap(),
            data_dir: TempDir::new().unwrap(),
        }
    }

    /// Get a Command for the qm binary with isolated state.
    pub fn qm(&self) -> Command {
        let mut cmd = Command::new(env!("CARGO_BIN_EXE_qm"));
        cmd.current_dir(self.project_dir.path());
        cmd.env("QM_DATA_DIR", self.data_dir.path());
        cmd.env("XDG_CONFIG_HOME", self.data_dir.path().join("xdg"));
        cmd.env_remove("QM_PROJECT");
        cmd.env_remove("QM_AGENT_NAME");
        cmd.env_remove("QM_LOG");
        for var in SETTING_VARS {
            cmd.env_remove(var);
        }
        cmd
    }

    /// Run qm with `args` expecting success, and parse stdout as JSON.
    pub fn qm_json(&self, args: &[&str]) -> serde_json::Value {
        let output = self.qm().args(args).output().unwrap();
        assert!(
            output.status.success(),
            "qm {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr)
        );
        serde_json::from_slice(&output.stdout).unwrap()
    }

    pub fn project_path(&self) -> &Path {
        self.project_dir.path()
    }

    pub fn data_path(&self) -> &Path {
        self.data_dir.path()
    }

    /// Register an agent with the given capabilities.
    pub fn register(&self, name: &str, caps: &str, weight: i64) {
        self.qm()
            .args(["agent", "register", name, "-c", caps, "-w", &weight.to_string()])
            .assert()
            .success();
    }
}

impl Default for TestEnv {
    fn default() -> Self {
        Self::new()
    }
}
