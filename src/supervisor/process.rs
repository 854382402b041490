//! Supervised agent processes.
//!
//! The supervisor never touches PIDs directly; it goes through
//! [`ProcessControl`] so that tests can substitute a fake and the real
//! implementation can reap the children it spawned.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use wait_timeout::ChildExt;

use crate::{Error, Result};

/// Environment variable carrying the agent name into spawned processes.
pub const AGENT_NAME_ENV: &str = "QM_AGENT_NAME";

/// Time to wait after SIGTERM before escalating to SIGKILL.
pub const TERMINATE_GRACE: Duration = Duration::from_secs(5);

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// What the registry recorded about an agent's process.
#[derive(Debug, Clone, Copy)]
pub struct AgentProcess<'a> {
    pub name: &'a str,
    pub pid: u32,
    pub command: &'a [String],
}

/// How a termination request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    /// The process was signalled and has exited
    Terminated,
    /// Nothing was running under the recorded pid
    NotRunning,
    /// The pid now belongs to an unrelated process; it was left alone
    Foreign,
}

/// Spawn, check and terminate agent processes.
pub trait ProcessControl {
    /// Whether the agent's recorded process is still running.
    fn is_running(&mut self, agent: &AgentProcess<'_>) -> bool;

    /// Ask the agent's process to exit, escalating to a forced kill after `grace`.
    ///
    /// Only processes spawned here or verified to still be the agent are
    /// signalled.
    fn terminate(&mut self, agent: &AgentProcess<'_>, grace: Duration) -> Result<Termination>;

    /// Start `command` for agent `name` with output appended to `log_path`.
    fn spawn(&mut self, name: &str, command: &[String], log_path: &Path) -> Result<u32>;

    /// Collect exit statuses of finished children.
    fn reap(&mut self) {}
}

/// Real processes on this host.
#[derive(Debug, Default)]
pub struct SystemProcesses {
    children: HashMap<u32, Child>,
}

impl SystemProcesses {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProcessControl for SystemProcesses {
    fn reap(&mut self) {
        self.children
            .retain(|_, child| matches!(child.try_wait(), Ok(None)));
    }

    fn is_running(&mut self, agent: &AgentProcess<'_>) -> bool {
        if let Some(child) = self.children.get_mut(&agent.pid) {
            return match child.try_wait() {
                Ok(None) => true,
                _ => {
                    self.children.remove(&agent.pid);
                    false
                }
            };
        }
        signal_alive(agent.pid) && is_same_agent(agent)
    }

    fn terminate(&mut self, agent: &AgentProcess<'_>, grace: Duration) -> Result<Termination> {
        let pid = agent.pid;
        if let Some(mut child) = self.children.remove(&pid) {
            if !send_term(pid) {
                let _ = child.kill();
            }
            if child.wait_timeout(grace)?.is_none() {
                tracing::warn!(pid, "grace period expired, killing");
                let _ = child.kill();
                child.wait()?;
            }
            return Ok(Termination::Terminated);
        }

        if !signal_alive(pid) {
            return Ok(Termination::NotRunning);
        }
        if !is_same_agent(agent) {
            tracing::warn!(agent = agent.name, pid, "pid no longer belongs to the agent, not signalling");
            return Ok(Termination::Foreign);
        }
        if !send_term(pid) {
            return Ok(Termination::NotRunning);
        }
        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            thread::sleep(POLL_INTERVAL);
            if !signal_alive(pid) {
                return Ok(Termination::Terminated);
            }
        }
        tracing::warn!(pid, "grace period expired, killing");
        send_kill(pid);
        Ok(Termination::Terminated)
    }

    fn spawn(&mut self, name: &str, command: &[String], log_path: &Path) -> Result<u32> {
        let (program, args) = command.split_first().ok_or_else(|| {
            Error::InvalidInput(format!("Agent {} has no command to spawn", name))
        })?;

        if let Some(parent) = log_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .env(AGENT_NAME_ENV, name)
            .stdin(Stdio::null())
            .stdout(log.try_clone()?)
            .stderr(log);
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            // Own process group so a Ctrl-C aimed at the supervisor does not reach agents.
            cmd.process_group(0);
        }

        let child = cmd
            .spawn()
            .map_err(|e| Error::Other(format!("Failed to spawn {}: {}", program, e)))?;
        let pid = child.id();
        self.children.insert(pid, child);
        tracing::info!(agent = name, pid, "agent process spawned");
        Ok(pid)
    }
}

/// Whether a process we did not spawn is still `agent`.
///
/// Spawned agents carry their name in the environment; otherwise the process
/// arguments must end with the recorded command (an interpreter may precede
/// a script). Without `/proc` identity cannot be shown and the answer is no.
#[cfg(target_os = "linux")]
fn is_same_agent(agent: &AgentProcess<'_>) -> bool {
    let proc_dir = Path::new("/proc").join(agent.pid.to_string());
    let marker = format!("{}={}", AGENT_NAME_ENV, agent.name);
    if let Ok(environ) = fs::read(proc_dir.join("environ")) {
        if environ
            .split(|b| *b == 0)
            .any(|entry| entry == marker.as_bytes())
        {
            return true;
        }
    }
    if agent.command.is_empty() {
        return false;
    }
    let Ok(cmdline) = fs::read(proc_dir.join("cmdline")) else {
        return false;
    };
    let args: Vec<&[u8]> = cmdline
        .split(|b| *b == 0)
        .filter(|arg| !arg.is_empty())
        .collect();
    args.len() >= agent.command.len()
        && args[args.len() - agent.command.len()..]
            .iter()
            .zip(agent.command)
            .all(|(actual, expected)| *actual == expected.as_bytes())
}

#[cfg(not(target_os = "linux"))]
fn is_same_agent(_agent: &AgentProcess<'_>) -> bool {
    false
}

/// Send SIGTERM. Returns false when the process does not exist.
#[cfg(unix)]
fn send_term(pid: u32) -> bool {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;
    kill(Pid::from_raw(pid as i32), Signal::SIGTERM).is_ok()
}

#[cfg(unix)]
fn send_kill(pid: u32) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;
    let _ = kill(Pid::from_raw(pid as i32), Signal::SIGKILL);
}

#[cfg(unix)]
fn signal_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;
    match kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
fn send_term(_pid: u32) -> bool {
    false
}

#[cfg(not(unix))]
fn send_kill(_pid: u32) {}

#[cfg(not(unix))]
fn signal_alive(_pid: u32) -> bool {
    false
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|p| p.to_string()).collect()
    }

    fn agent<'a>(name: &'a str, pid: u32, command: &'a [String]) -> AgentProcess<'a> {
        AgentProcess { name, pid, command }
    }

    #[test]
    fn test_spawn_and_terminate() {
        let temp = TempDir::new().unwrap();
        let log = temp.path().join("logs/agents/sleeper.log");
        let mut procs = SystemProcesses::new();
        let command = argv(&["sleep", "30"]);

        let pid = procs.spawn("sleeper", &command, &log).unwrap();
        assert!(procs.is_running(&agent("sleeper", pid, &command)));
        assert!(log.exists());

        let ended = procs
            .terminate(&agent("sleeper", pid, &command), Duration::from_secs(2))
            .unwrap();
        assert_eq!(ended, Termination::Terminated);
        assert!(!procs.is_running(&agent("sleeper", pid, &command)));
    }

    #[test]
    fn test_spawn_passes_agent_name_and_captures_output() {
        let temp = TempDir::new().unwrap();
        let log = temp.path().join("echo.log");
        let mut procs = SystemProcesses::new();
        let command = argv(&["sh", "-c", "echo hello $QM_AGENT_NAME"]);

        let pid = procs.spawn("agent_echo", &command, &log).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while procs.is_running(&agent("agent_echo", pid, &command)) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(fs::read_to_string(&log).unwrap().trim(), "hello agent_echo");
    }

    #[test]
    fn test_empty_command_is_rejected() {
        let temp = TempDir::new().unwrap();
        let mut procs = SystemProcesses::new();
        let result = procs.spawn("none", &[], &temp.path().join("x.log"));
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_missing_program_is_an_error() {
        let temp = TempDir::new().unwrap();
        let mut procs = SystemProcesses::new();
        let result = procs.spawn(
            "ghost",
            &argv(&["/nonexistent/qm-agent-binary"]),
            &temp.path().join("x.log"),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_terminate_unknown_pid_is_ok() {
        let mut procs = SystemProcesses::new();
        let command = argv(&["agent-bin"]);
        // PIDs near the top of the range are very unlikely to exist.
        let ended = procs
            .terminate(&agent("gone", 4_000_000, &command), Duration::from_millis(100))
            .unwrap();
        assert_eq!(ended, Termination::NotRunning);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_reused_pid_is_not_signalled() {
        let mut unrelated = Command::new("sleep")
            .arg("30")
            .env_remove(AGENT_NAME_ENV)
            .spawn()
            .unwrap();
        let pid = unrelated.id();
        let mut procs = SystemProcesses::new();

        let recorded = argv(&["agent-bin", "--serve"]);
        assert!(!procs.is_running(&agent("agent_build", pid, &recorded)));
        let ended = procs
            .terminate(&agent("agent_build", pid, &recorded), Duration::from_millis(100))
            .unwrap();
        assert_eq!(ended, Termination::Foreign);
        assert!(unrelated.try_wait().unwrap().is_none());

        // Matching arguments identify the process as the agent.
        let matching = argv(&["sleep", "30"]);
        let ended = procs
            .terminate(&agent("agent_build", pid, &matching), Duration::from_secs(2))
            .unwrap();
        assert_eq!(ended, Termination::Terminated);
        unrelated.wait().unwrap();
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_untracked_agent_is_recognised_by_name() {
        let mut child = Command::new("sleep")
            .arg("30")
            .env(AGENT_NAME_ENV, "agent_build")
            .spawn()
            .unwrap();
        let pid = child.id();
        // A fresh supervisor did not spawn it and has no command on record.
        let mut procs = SystemProcesses::new();

        assert!(procs.is_running(&agent("agent_build", pid, &[])));
        assert!(!procs.is_running(&agent("agent_other", pid, &[])));
        let ended = procs
            .terminate(&agent("agent_build", pid, &[]), Duration::from_secs(2))
            .unwrap();
        assert_eq!(ended, Termination::Terminated);
        child.wait().unwrap();
    }
}
