//! Liveness supervision and agent process management.
//!
//! A supervision pass compares each agent's liveness reference (the later of
//! its last heartbeat and its last spawn) with the unresponsive threshold.
//! Stale agents are marked `unresponsive`, their old process is terminated and
//! a fresh one is spawned from the recorded command. The new spawn time makes
//! the agent fresh again, so a repeated pass leaves it alone until it either
//! heartbeats or goes stale a second time.

pub mod process;

pub use process::{AgentProcess, ProcessControl, SystemProcesses, TERMINATE_GRACE, Termination};

use std::time::Duration;

use serde::Serialize;

use crate::events::{self, Severity};
use crate::models::{AgentRecord, AgentRegistry, AgentStatus};
use crate::storage::Store;
use crate::{Error, Result, registry};

/// Path of an agent's output log relative to the data root.
pub fn agent_log_name(agent: &str) -> String {
    format!("logs/agents/{}.log", agent)
}

/// A successful restart.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Restart {
    pub agent: String,
    pub old_pid: Option<u32>,
    pub new_pid: u32,
}

/// A stale agent that could not be restarted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RestartFailure {
    pub agent: String,
    pub reason: String,
}

impl RestartFailure {
    pub fn to_error(&self) -> Error {
        Error::AgentUnresponsive {
            agent: self.agent.clone(),
            reason: self.reason.clone(),
        }
    }
}

/// Outcome of one supervision pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PassReport {
    /// Nothing was changed; `unresponsive` lists what a real pass would restart
    pub dry_run: bool,
    pub checked: usize,
    pub healthy: Vec<String>,
    /// Agents whose liveness reference exceeded the threshold
    pub unresponsive: Vec<String>,
    /// Stopped, failed or never-started agents
    pub skipped: Vec<String>,
    pub restarted: Vec<Restart>,
    pub failed: Vec<RestartFailure>,
}

/// Run one supervision pass at time `now` (epoch seconds).
pub fn check_once(
    store: &Store,
    procs: &mut dyn ProcessControl,
    threshold: Duration,
    now: i64,
) -> Result<PassReport> {
    pass(store, Some(procs), threshold, now)
}

/// Report which agents a pass at `now` would mark unresponsive and restart,
/// without touching the registry or any process.
pub fn preview(store: &Store, threshold: Duration, now: i64) -> Result<PassReport> {
    pass(store, None, threshold, now)
}

fn pass(
    store: &Store,
    mut procs: Option<&mut dyn ProcessControl>,
    threshold: Duration,
    now: i64,
) -> Result<PassReport> {
    if let Some(procs) = procs.as_deref_mut() {
        procs.reap();
    }
    let threshold = threshold.as_secs() as i64;
    let agents: AgentRegistry = store.read()?;
    let mut report = PassReport {
        dry_run: procs.is_none(),
        checked: agents.agents.len(),
        ..Default::default()
    };

    for agent in agents.agents.values() {
        if matches!(agent.status, AgentStatus::Stopped | AgentStatus::Failed)
            || agent.liveness_reference() == 0
        {
            report.skipped.push(agent.name.clone());
            continue;
        }
        if now - agent.liveness_reference() <= threshold {
            report.healthy.push(agent.name.clone());
            continue;
        }
        let Some(procs) = procs.as_deref_mut() else {
            report.unresponsive.push(agent.name.clone());
            continue;
        };

        // A heartbeat may have landed since the snapshot; re-check under the lock.
        let marked = registry::modify(store, &agent.name, now, |record| {
            if now - record.liveness_reference() <= threshold
                || matches!(record.status, AgentStatus::Stopped | AgentStatus::Failed)
            {
                return Ok(None);
            }
            record.status = AgentStatus::Unresponsive;
            Ok(Some(record.clone()))
        });
        let record = match marked {
            Ok(Some(record)) => record,
            Ok(None) => {
                report.healthy.push(agent.name.clone());
                continue;
            }
            Err(Error::NotFound(_)) => continue,
            Err(e) => return Err(e),
        };

        report.unresponsive.push(record.name.clone());
        let age = now - record.liveness_reference();
        events::record(
            store.root(),
            Severity::Warning,
            "agent_unresponsive",
            &format!("Agent {} silent for {}s", record.name, age),
            serde_json::json!({"agent": record.name, "age_secs": age, "pid": record.pid}),
        );

        match restart(store, procs, &record, now) {
            Ok(restart) => report.restarted.push(restart),
            Err(e) => {
                let reason = e.to_string();
                registry::modify(store, &record.name, now, |r| {
                    r.status = AgentStatus::Failed;
                    r.pid = None;
                    Ok(())
                })?;
                events::record(
                    store.root(),
                    Severity::Error,
                    "agent_restart_failed",
                    &format!("Could not restart agent {}: {}", record.name, reason),
                    serde_json::json!({"agent": record.name}),
                );
                report.failed.push(RestartFailure {
                    agent: record.name.clone(),
                    reason,
                });
            }
        }
    }

    Ok(report)
}

/// Terminate the recorded process and spawn a new one, leaving the agent `restarting`.
fn restart(
    store: &Store,
    procs: &mut dyn ProcessControl,
    record: &AgentRecord,
    now: i64,
) -> Result<Restart> {
    if record.command.is_empty() {
        return Err(Error::InvalidInput(format!(
            "Agent {} has no recorded command",
            record.name
        )));
    }
    if let Some(pid) = record.pid {
        let old = AgentProcess {
            name: &record.name,
            pid,
            command: &record.command,
        };
        match procs.terminate(&old, TERMINATE_GRACE) {
            Ok(Termination::Foreign) => events::record(
                store.root(),
                Severity::Warning,
                "agent_pid_reused",
                &format!("Pid {} of agent {} belongs to another process", pid, record.name),
                serde_json::json!({"agent": record.name, "pid": pid}),
            ),
            Ok(_) => {}
            Err(e) => tracing::warn!(agent = %record.name, pid, "terminate failed: {}", e),
        }
    }
    registry::modify(store, &record.name, now, |r| {
        r.pid = None;
        Ok(())
    })?;

    let new_pid = procs.spawn(
        &record.name,
        &record.command,
        &store.path(&agent_log_name(&record.name)),
    )?;
    registry::modify(store, &record.name, now, |r| {
        r.pid = Some(new_pid);
        r.spawned_at = Some(now);
        r.status = AgentStatus::Restarting;
        Ok(())
    })?;

    events::record(
        store.root(),
        Severity::Info,
        "agent_restarted",
        &format!("Restarted agent {}", record.name),
        serde_json::json!({"agent": record.name, "old_pid": record.pid, "new_pid": new_pid}),
    );
    Ok(Restart {
        agent: record.name.clone(),
        old_pid: record.pid,
        new_pid,
    })
}

/// Spawn an agent from its recorded command.
///
/// The agent is `idle` until its first heartbeat.
pub fn start_agent(
    store: &Store,
    procs: &mut dyn ProcessControl,
    name: &str,
    now: i64,
) -> Result<AgentRecord> {
    let record = registry::get(store, name)?;
    if let Some(pid) = record.pid {
        let current = AgentProcess {
            name,
            pid,
            command: &record.command,
        };
        if procs.is_running(&current) {
            return Err(Error::InvalidInput(format!(
                "Agent {} is already running (pid {})",
                name, pid
            )));
        }
    }
    let pid = procs.spawn(name, &record.command, &store.path(&agent_log_name(name)))?;
    registry::modify(store, name, now, |r| {
        r.pid = Some(pid);
        r.spawned_at = Some(now);
        r.status = AgentStatus::Idle;
        Ok(r.clone())
    })
}

/// Terminate an agent's process and mark it `stopped`.
pub fn stop_agent(
    store: &Store,
    procs: &mut dyn ProcessControl,
    name: &str,
    grace: Duration,
    now: i64,
) -> Result<AgentRecord> {
    let record = registry::get(store, name)?;
    if let Some(pid) = record.pid {
        let current = AgentProcess {
            name,
            pid,
            command: &record.command,
        };
        procs.terminate(&current, grace)?;
    }
    let record = registry::modify(store, name, now, |r| {
        r.pid = None;
        r.status = AgentStatus::Stopped;
        Ok(r.clone())
    })?;
    tracing::info!(agent = name, "agent stopped");
    Ok(record)
}

pub fn restart_agent(
    store: &Store,
    procs: &mut dyn ProcessControl,
    name: &str,
    grace: Duration,
    now: i64,
) -> Result<AgentRecord> {
    stop_agent(store, procs, name, grace, now)?;
    start_agent(store, procs, name, now)
}
