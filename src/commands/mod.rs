//! Command implementations for the `qm` CLI.
//!
//! Each function here resolves its inputs against a [`Context`], calls into
//! the library, and returns a value implementing [`Output`] so `main` can
//! render it as JSON (the default) or human-readable text.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;
use serde_json::json;

use crate::checkpoint::{
    self, Alternative, Checkpoint, RestoreOptions, RestoreReport, TerminalConfirm,
    ValidationOutcome, ValidationResult,
};
use crate::config::{ResolvedSettings, Settings, ValueSource, resolve_settings_for};
use crate::knowledge::{self, QueryKind, QueryResult, SyncReport};
use crate::models::{
    AgentRecord, AgentStatus, Alert, CorrelationEntry, ErrorPattern, Measurement, Notification,
    Task, TaskStatus,
};
use crate::monitor::{self, MonitorReport, MonitorStatus};
use crate::registry::{self, Registration};
use crate::scheduler::{self, BalanceReport, DistributeReport, NewTask, NormalizeReport};
use crate::storage::{self, Store};
use crate::supervisor::{self, PassReport, ProcessControl, TERMINATE_GRACE};
use crate::{Error, Result, notify};

/// Command results that can be serialized to JSON or formatted for humans.
pub trait Output {
    /// Serialize to a single-line JSON string.
    fn to_json(&self) -> String;

    /// Format for human-readable output.
    fn to_human(&self) -> String;
}

fn to_json<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|e| json!({ "error": e.to_string() }).to_string())
}

fn epoch_now() -> i64 {
    Utc::now().timestamp()
}

/// Everything a command needs: where the project is and where its state lives.
pub struct Context {
    pub project_root: PathBuf,
    pub resolved: ResolvedSettings,
    pub store: Store,
}

impl Context {
    /// Resolve the data root and settings for `project_root` and open its store.
    pub fn open(project_root: &Path) -> Result<Self> {
        let data_root = storage::data_root_for(project_root)?;
        let resolved = resolve_settings_for(&data_root)?;
        let store = Store::open(&data_root, &resolved.settings)?;
        Ok(Self {
            project_root: project_root.to_path_buf(),
            resolved,
            store,
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.resolved.settings
    }
}

// === Agents ===

/// A single agent record plus what was done to it.
#[derive(Serialize)]
pub struct AgentResult {
    pub action: &'static str,
    #[serde(flatten)]
    pub agent: AgentRecord,
}

impl Output for AgentResult {
    fn to_json(&self) -> String {
        to_json(self)
    }

    fn to_human(&self) -> String {
        let a = &self.agent;
        let mut lines = vec![format!("Agent {} ({}): {}", a.name, self.action, a.status)];
        if !a.capabilities.is_empty() {
            let caps: Vec<&str> = a.capabilities.iter().map(String::as_str).collect();
            lines.push(format!("  Capabilities: {}", caps.join(", ")));
        }
        lines.push(format!("  Weight: {}", a.priority_weight));
        if let Some(pid) = a.pid {
            lines.push(format!("  PID: {}", pid));
        }
        if let Some(task) = &a.current_task_id {
            lines.push(format!("  Current task: {}", task));
        }
        lines.push(format!("  Tasks completed: {}", a.tasks_completed));
        if a.last_seen > 0 {
            lines.push(format!("  Last seen: {}s ago", (epoch_now() - a.last_seen).max(0)));
        }
        lines.join("\n")
    }
}

#[derive(Serialize)]
pub struct AgentList {
    pub count: usize,
    pub agents: Vec<AgentRecord>,
}

impl Output for AgentList {
    fn to_json(&self) -> String {
        to_json(self)
    }

    fn to_human(&self) -> String {
        if self.agents.is_empty() {
            return "No agents registered.".to_string();
        }
        let mut out = format!("{} agent(s):\n", self.count);
        for a in &self.agents {
            let caps: Vec<&str> = a.capabilities.iter().map(String::as_str).collect();
            let _ = writeln!(
                out,
                "  {:<20} {:<12} w={:<3} [{}]{}",
                a.name,
                a.status.to_string(),
                a.priority_weight,
                caps.join(","),
                a.current_task_id
                    .as_deref()
                    .map(|t| format!(" -> {}", t))
                    .unwrap_or_default()
            );
        }
        out.trim_end().to_string()
    }
}

pub fn agent_register(
    ctx: &Context,
    name: &str,
    capabilities: Vec<String>,
    weight: Option<i64>,
    command: Vec<String>,
) -> Result<AgentResult> {
    let capabilities: BTreeSet<String> = capabilities
        .into_iter()
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty())
        .collect();
    let reg = Registration {
        capabilities: (!capabilities.is_empty()).then_some(capabilities),
        priority_weight: weight,
        command: (!command.is_empty()).then_some(command),
    };
    let agent = registry::register(&ctx.store, name, reg, epoch_now())?;
    Ok(AgentResult {
        action: "registered",
        agent,
    })
}

pub fn agent_heartbeat(
    ctx: &Context,
    name: &str,
    pid: Option<u32>,
    status: Option<AgentStatus>,
) -> Result<AgentResult> {
    let agent = registry::heartbeat(&ctx.store, name, pid, status, epoch_now())?;
    Ok(AgentResult {
        action: "heartbeat",
        agent,
    })
}

pub fn agent_status(ctx: &Context, name: &str) -> Result<AgentResult> {
    Ok(AgentResult {
        action: "status",
        agent: registry::get(&ctx.store, name)?,
    })
}

pub fn agent_list(ctx: &Context, status: Option<AgentStatus>) -> Result<AgentList> {
    let agents = registry::list(&ctx.store, status)?;
    Ok(AgentList {
        count: agents.len(),
        agents,
    })
}

pub fn agent_remove(ctx: &Context, name: &str) -> Result<AgentResult> {
    Ok(AgentResult {
        action: "removed",
        agent: registry::remove(&ctx.store, name, epoch_now())?,
    })
}

pub fn agent_start(ctx: &Context, procs: &mut dyn ProcessControl, name: &str) -> Result<AgentResult> {
    Ok(AgentResult {
        action: "started",
        agent: supervisor::start_agent(&ctx.store, procs, name, epoch_now())?,
    })
}

pub fn agent_stop(ctx: &Context, procs: &mut dyn ProcessControl, name: &str) -> Result<AgentResult> {
    Ok(AgentResult {
        action: "stopped",
        agent: supervisor::stop_agent(&ctx.store, procs, name, TERMINATE_GRACE, epoch_now())?,
    })
}

pub fn agent_restart(
    ctx: &Context,
    procs: &mut dyn ProcessControl,
    name: &str,
) -> Result<AgentResult> {
    Ok(AgentResult {
        action: "restarted",
        agent: supervisor::restart_agent(&ctx.store, procs, name, TERMINATE_GRACE, epoch_now())?,
    })
}

#[derive(Serialize)]
pub struct Inbox {
    pub agent: String,
    pub count: usize,
    pub notifications: Vec<Notification>,
}

impl Output for Inbox {
    fn to_json(&self) -> String {
        to_json(self)
    }

    fn to_human(&self) -> String {
        if self.notifications.is_empty() {
            return format!("No notifications for {}.", self.agent);
        }
        let mut out = format!("{} notification(s) for {}:\n", self.count, self.agent);
        for n in &self.notifications {
            let _ = writeln!(
                out,
                "  [{}] {} {}",
                n.timestamp.format("%Y-%m-%d %H:%M:%S"),
                n.notification_type,
                n.task_id
            );
        }
        out.trim_end().to_string()
    }
}

/// Read an agent's notifications, consuming them unless `peek`.
pub fn agent_inbox(ctx: &Context, name: &str, peek: bool) -> Result<Inbox> {
    let notifications = if peek {
        notify::peek(&ctx.store, name)?
    } else {
        notify::drain(&ctx.store, name)?
    };
    Ok(Inbox {
        agent: name.to_string(),
        count: notifications.len(),
        notifications,
    })
}

// === Tasks ===

#[derive(Serialize)]
pub struct TaskResult {
    pub action: &'static str,
    #[serde(flatten)]
    pub task: Task,
}

impl Output for TaskResult {
    fn to_json(&self) -> String {
        to_json(self)
    }

    fn to_human(&self) -> String {
        let t = &self.task;
        let mut lines = vec![
            format!("Task {} ({})", t.id, self.action),
            format!("  Type: {}", t.task_type),
            format!("  Status: {}", t.status),
            format!("  Agent: {}", t.assigned_agent),
            format!("  Priority: {}", t.priority),
        ];
        if !t.description.is_empty() {
            lines.push(format!("  Description: {}", t.description));
        }
        if !t.dependencies.is_empty() {
            lines.push(format!("  Depends on: {}", t.dependencies.join(", ")));
        }
        if let Some(reason) = &t.failure_reason {
            lines.push(format!("  Failure: {}", reason));
        }
        lines.join("\n")
    }
}

#[derive(Serialize)]
pub struct TaskList {
    pub count: usize,
    pub tasks: Vec<Task>,
}

impl Output for TaskList {
    fn to_json(&self) -> String {
        to_json(self)
    }

    fn to_human(&self) -> String {
        if self.tasks.is_empty() {
            return "No tasks found.".to_string();
        }
        let mut out = format!("{} task(s):\n", self.count);
        for t in &self.tasks {
            let _ = writeln!(
                out,
                "  {} [{}] P{} {} -> {}{}",
                t.id,
                t.status,
                t.priority,
                t.task_type,
                t.assigned_agent,
                if t.description.is_empty() {
                    String::new()
                } else {
                    format!(": {}", t.description)
                }
            );
        }
        out.trim_end().to_string()
    }
}

pub fn task_submit(ctx: &Context, new: NewTask) -> Result<TaskResult> {
    let task = scheduler::submit(&ctx.store, &ctx.settings().routing, new, Utc::now())?;
    Ok(TaskResult {
        action: "submitted",
        task,
    })
}

pub fn task_list(ctx: &Context, status: Option<TaskStatus>, agent: Option<&str>) -> Result<TaskList> {
    let tasks = scheduler::list(&ctx.store, status, agent)?;
    Ok(TaskList {
        count: tasks.len(),
        tasks,
    })
}

pub fn task_show(ctx: &Context, id: &str) -> Result<TaskResult> {
    Ok(TaskResult {
        action: "show",
        task: scheduler::show(&ctx.store, id)?,
    })
}

pub fn task_start(ctx: &Context, id: &str, agent: &str) -> Result<TaskResult> {
    Ok(TaskResult {
        action: "started",
        task: scheduler::start(&ctx.store, id, agent, Utc::now())?,
    })
}

pub fn task_complete(ctx: &Context, id: &str, agent: &str) -> Result<TaskResult> {
    Ok(TaskResult {
        action: "completed",
        task: scheduler::complete(&ctx.store, id, agent, Utc::now())?,
    })
}

pub fn task_fail(ctx: &Context, id: &str, agent: &str, reason: Option<String>) -> Result<TaskResult> {
    Ok(TaskResult {
        action: "failed",
        task: scheduler::fail(&ctx.store, id, agent, reason, Utc::now())?,
    })
}

impl Output for DistributeReport {
    fn to_json(&self) -> String {
        to_json(self)
    }

    fn to_human(&self) -> String {
        let mut out = format!(
            "Assigned {} task(s), {} still waiting",
            self.assigned.len(),
            self.waiting
        );
        for t in &self.assigned {
            let _ = write!(out, "\n  {} -> {}", t.id, t.assigned_agent);
        }
        for id in &self.requeued {
            let _ = write!(out, "\n  {} requeued (owner not notified)", id);
        }
        out
    }
}

pub fn task_distribute(ctx: &Context) -> Result<DistributeReport> {
    scheduler::distribute(&ctx.store, Utc::now())
}

impl Output for BalanceReport {
    fn to_json(&self) -> String {
        to_json(self)
    }

    fn to_human(&self) -> String {
        let mut out = format!(
            "Active: {}  Completed: {}  Failed: {}  Drain rate: {:.2}/min",
            self.queue_size, self.completed, self.failed, self.drain_rate_per_min
        );
        for (name, load) in &self.agents {
            let _ = write!(
                out,
                "\n  {:<20} queued={} assigned={} in_progress={} total={}",
                name, load.queued, load.assigned, load.in_progress, load.total
            );
        }
        out
    }
}

pub fn task_balance(ctx: &Context) -> Result<BalanceReport> {
    scheduler::balance(&ctx.store, Utc::now())
}

impl Output for NormalizeReport {
    fn to_json(&self) -> String {
        to_json(self)
    }

    fn to_human(&self) -> String {
        format!(
            "Removed {} duplicate(s) and {} finished task(s); {} remain active",
            self.duplicates_removed, self.finished_removed, self.remaining
        )
    }
}

pub fn task_normalize(ctx: &Context) -> Result<NormalizeReport> {
    scheduler::normalize(&ctx.store)
}

// === Supervision ===

/// A supervision pass together with the work waiting on the agents.
#[derive(Debug, Clone, Serialize)]
pub struct SupervisionResult {
    #[serde(flatten)]
    pub pass: PassReport,
    pub backlog: BalanceReport,
}

impl Output for SupervisionResult {
    fn to_json(&self) -> String {
        to_json(self)
    }

    fn to_human(&self) -> String {
        let p = &self.pass;
        let mut out = format!(
            "{}Checked {} agent(s): {} healthy, {} unresponsive, {} skipped",
            if p.dry_run { "[dry run] " } else { "" },
            p.checked,
            p.healthy.len(),
            p.unresponsive.len(),
            p.skipped.len()
        );
        if p.dry_run {
            for name in &p.unresponsive {
                let _ = write!(out, "\n  would restart {}", name);
            }
        }
        for r in &p.restarted {
            let _ = write!(
                out,
                "\n  restarted {} (pid {} -> {})",
                r.agent,
                r.old_pid.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string()),
                r.new_pid
            );
        }
        for f in &p.failed {
            let _ = write!(out, "\n  FAILED {}: {}", f.agent, f.reason);
        }
        let _ = write!(
            out,
            "\nBacklog: {} active task(s), drain rate {:.2}/min",
            self.backlog.queue_size, self.backlog.drain_rate_per_min
        );
        out
    }
}

/// Run a supervision pass, or only report what it would do when `procs` is `None`.
pub fn supervise_once(
    ctx: &Context,
    procs: Option<&mut dyn ProcessControl>,
) -> Result<SupervisionResult> {
    let threshold = ctx.settings().unresponsive_threshold;
    let pass = match procs {
        Some(procs) => supervisor::check_once(&ctx.store, procs, threshold, epoch_now())?,
        None => supervisor::preview(&ctx.store, threshold, epoch_now())?,
    };
    Ok(SupervisionResult {
        pass,
        backlog: scheduler::balance(&ctx.store, Utc::now())?,
    })
}

// === Checkpoints ===

impl Output for Checkpoint {
    fn to_json(&self) -> String {
        to_json(self)
    }

    fn to_human(&self) -> String {
        let m = &self.metadata;
        let mut out = format!(
            "Checkpoint {}\n  Operation: {}\n  Created: {}\n  Files: {}",
            self.id,
            m.operation_id,
            m.created_at.format("%Y-%m-%d %H:%M:%S"),
            m.files_count
        );
        if let Some(commit) = &m.git_commit {
            let _ = write!(out, "\n  Git commit: {}", commit);
        }
        if m.has_diff {
            out.push_str("\n  Uncommitted diff captured");
        }
        out
    }
}

pub fn checkpoint_create(ctx: &Context, operation_id: &str, paths: &[PathBuf]) -> Result<Checkpoint> {
    let cp = checkpoint::create(
        &ctx.store,
        &ctx.project_root,
        operation_id,
        paths,
        ctx.settings().command_timeout,
        Utc::now(),
    )?;
    let removed = checkpoint::cleanup(&ctx.store, ctx.settings().checkpoint_keep)?;
    if !removed.is_empty() {
        tracing::debug!(count = removed.len(), "pruned old checkpoints");
    }
    Ok(cp)
}

impl Output for RestoreReport {
    fn to_json(&self) -> String {
        to_json(self)
    }

    fn to_human(&self) -> String {
        let mut out = format!(
            "Restored checkpoint {}: {} file(s) restored, {} removed",
            self.checkpoint_id,
            self.restored.len(),
            self.removed.len()
        );
        if self.diff_reversed {
            out.push_str(", uncommitted diff reversed");
        }
        out
    }
}

pub fn checkpoint_restore(
    ctx: &Context,
    id: &str,
    force: bool,
    reverse_diff: bool,
) -> Result<RestoreReport> {
    let cp = checkpoint::load(&ctx.store, id)?;
    let options = RestoreOptions {
        force,
        reverse_diff,
        command_timeout: ctx.settings().command_timeout,
    };
    checkpoint::restore(&ctx.store, &cp, &options, &mut TerminalConfirm)
}

impl Output for ValidationOutcome {
    fn to_json(&self) -> String {
        to_json(self)
    }

    fn to_human(&self) -> String {
        if self.passed {
            return format!("Validation passed for checkpoint {}", self.checkpoint_id);
        }
        let mut out = format!(
            "Validation failed in layer '{}': {}",
            self.failed_layer.as_deref().unwrap_or("overall"),
            self.reason.as_deref().unwrap_or("")
        );
        if let Some(action) = self.action_taken {
            let _ = write!(out, "\n  Action: {}", action);
        }
        if let Some(restore) = &self.restore {
            let _ = write!(out, "\n  {}", restore.to_human());
        }
        out
    }
}

/// Read a validation result from a file, or stdin when `source` is `-`.
pub fn read_validation_result(source: &Path) -> Result<ValidationResult> {
    let raw = if source == Path::new("-") {
        std::io::read_to_string(std::io::stdin())?
    } else {
        std::fs::read_to_string(source)?
    };
    serde_json::from_str(&raw)
        .map_err(|e| Error::InvalidInput(format!("Invalid validation result: {}", e)))
}

pub fn checkpoint_monitor(
    ctx: &Context,
    id: &str,
    result: &ValidationResult,
    auto_rollback: bool,
) -> Result<ValidationOutcome> {
    let cp = checkpoint::load(&ctx.store, id)?;
    checkpoint::monitor_validation(
        &ctx.store,
        result,
        &cp,
        auto_rollback,
        ctx.settings().command_timeout,
        Utc::now(),
    )
}

impl Output for Alternative {
    fn to_json(&self) -> String {
        to_json(self)
    }

    fn to_human(&self) -> String {
        match &self.action {
            Some(action) => format!(
                "Try '{}' for pattern {} ({:.0}% success over {} uses)",
                action,
                self.error_pattern_hash,
                self.success_rate.unwrap_or(0.0) * 100.0,
                self.times_used.unwrap_or(0)
            ),
            None => format!("No known alternative for pattern {}", self.error_pattern_hash),
        }
    }
}

pub fn checkpoint_alternative(
    ctx: &Context,
    operation: &str,
    error_pattern: &str,
    tried: &[String],
) -> Result<Alternative> {
    checkpoint::find_alternative(&ctx.store, operation, error_pattern, tried)
}

#[derive(Serialize)]
pub struct CheckpointSummary {
    pub id: String,
    pub operation_id: String,
    pub created_at: chrono::DateTime<Utc>,
    pub files_count: usize,
    pub git_commit: Option<String>,
    pub has_diff: bool,
}

#[derive(Serialize)]
pub struct CheckpointList {
    pub count: usize,
    pub checkpoints: Vec<CheckpointSummary>,
}

impl Output for CheckpointList {
    fn to_json(&self) -> String {
        to_json(self)
    }

    fn to_human(&self) -> String {
        if self.checkpoints.is_empty() {
            return "No checkpoints.".to_string();
        }
        let mut out = format!("{} checkpoint(s):\n", self.count);
        for c in &self.checkpoints {
            let _ = writeln!(
                out,
                "  {}  {}  {} file(s){}",
                c.id,
                c.created_at.format("%Y-%m-%d %H:%M:%S"),
                c.files_count,
                if c.has_diff { " +diff" } else { "" }
            );
        }
        out.trim_end().to_string()
    }
}

pub fn checkpoint_list(ctx: &Context) -> Result<CheckpointList> {
    let checkpoints: Vec<CheckpointSummary> = checkpoint::list(&ctx.store)?
        .into_iter()
        .map(|c| CheckpointSummary {
            id: c.id,
            operation_id: c.metadata.operation_id,
            created_at: c.metadata.created_at,
            files_count: c.metadata.files_count,
            git_commit: c.metadata.git_commit,
            has_diff: c.metadata.has_diff,
        })
        .collect();
    Ok(CheckpointList {
        count: checkpoints.len(),
        checkpoints,
    })
}

#[derive(Serialize)]
pub struct CleanResult {
    pub kept: usize,
    pub removed: Vec<String>,
}

impl Output for CleanResult {
    fn to_json(&self) -> String {
        to_json(self)
    }

    fn to_human(&self) -> String {
        format!(
            "Removed {} checkpoint(s), kept {}",
            self.removed.len(),
            self.kept
        )
    }
}

pub fn checkpoint_clean(ctx: &Context, keep: Option<usize>) -> Result<CleanResult> {
    let keep = keep.unwrap_or(ctx.settings().checkpoint_keep);
    let removed = checkpoint::cleanup(&ctx.store, keep)?;
    let kept = checkpoint::list(&ctx.store)?.len();
    Ok(CleanResult { kept, removed })
}

// === Knowledge ===

impl Output for SyncReport {
    fn to_json(&self) -> String {
        to_json(self)
    }

    fn to_human(&self) -> String {
        format!(
            "Knowledge synced: {} best practice(s), {} anti-pattern(s), {} global pattern(s); insights for {}",
            self.best_practices,
            self.anti_patterns,
            self.global_patterns,
            if self.broadcast.is_empty() {
                "no categories".to_string()
            } else {
                self.broadcast.join(", ")
            }
        )
    }
}

pub fn knowledge_sync(ctx: &Context) -> Result<SyncReport> {
    knowledge::sync(&ctx.store, &ctx.settings().categories, Utc::now())
}

#[derive(Serialize)]
pub struct QueryOutput {
    pub query: String,
    pub count: usize,
    pub results: QueryResult,
}

impl Output for QueryOutput {
    fn to_json(&self) -> String {
        to_json(self)
    }

    fn to_human(&self) -> String {
        if self.results.is_empty() {
            return format!("No {} recorded.", self.query);
        }
        let mut out = format!("{} {}:\n", self.count, self.query);
        match &self.results {
            QueryResult::Entries(entries) => {
                for e in entries {
                    let _ = writeln!(
                        out,
                        "  {} / {}: {:.0}% over {} use(s)",
                        e.error_pattern_hash,
                        e.action,
                        e.success_rate * 100.0,
                        e.times_used
                    );
                }
            }
            QueryResult::Patterns(patterns) => {
                for p in patterns {
                    let _ = writeln!(
                        out,
                        "  {} [{}] x{}: {}",
                        p.hash, p.category, p.occurrences, p.sample
                    );
                }
            }
            QueryResult::Insights(insights) => {
                for i in insights {
                    let _ = writeln!(out, "  - {}", i);
                }
            }
        }
        out.trim_end().to_string()
    }
}

pub fn knowledge_query(ctx: &Context, kind: QueryKind, raw: &str) -> Result<QueryOutput> {
    let results = knowledge::query(&ctx.store, kind)?;
    Ok(QueryOutput {
        query: raw.to_lowercase().replace('-', "_"),
        count: results.len(),
        results,
    })
}

/// Documents created by an `init` command.
#[derive(Serialize)]
pub struct InitResult {
    pub created: Vec<String>,
}

impl Output for InitResult {
    fn to_json(&self) -> String {
        to_json(self)
    }

    fn to_human(&self) -> String {
        if self.created.is_empty() {
            "Already initialized.".to_string()
        } else {
            format!("Created {}", self.created.join(", "))
        }
    }
}

pub fn knowledge_init(ctx: &Context) -> Result<InitResult> {
    Ok(InitResult {
        created: knowledge::init(&ctx.store)?,
    })
}

/// An observed error and/or a recorded remediation outcome.
#[derive(Serialize)]
pub struct RecordResult {
    pub error_pattern_hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pattern: Option<ErrorPattern>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entry: Option<CorrelationEntry>,
}

impl Output for RecordResult {
    fn to_json(&self) -> String {
        to_json(self)
    }

    fn to_human(&self) -> String {
        let mut lines = vec![format!("Pattern {}", self.error_pattern_hash)];
        if let Some(p) = &self.pattern {
            lines.push(format!("  Seen {} time(s) [{}]", p.occurrences, p.category));
        }
        if let Some(e) = &self.entry {
            lines.push(format!(
                "  '{}': {:.0}% success over {} use(s), {:?}",
                e.action,
                e.success_rate * 100.0,
                e.times_used,
                e.classification()
            ));
        }
        lines.join("\n")
    }
}

/// Remediation outcome reported with `knowledge record`.
pub struct Outcome {
    pub action: String,
    pub success: bool,
    pub duration_ms: f64,
}

/// Record an error sighting and, when given, the outcome of an action taken against it.
///
/// Raw error text counts as an occurrence of its pattern; an existing pattern
/// hash is used as-is.
pub fn knowledge_record(
    ctx: &Context,
    error: &str,
    category: Option<&str>,
    outcome: Option<Outcome>,
) -> Result<RecordResult> {
    let hash = knowledge::pattern_key(error);
    let pattern = if hash == error {
        None
    } else {
        Some(knowledge::observe(&ctx.store, error, category, Utc::now())?)
    };
    let entry = match outcome {
        Some(o) => Some(knowledge::record_outcome(
            &ctx.store,
            &hash,
            &o.action,
            o.success,
            o.duration_ms,
        )?),
        None => None,
    };
    Ok(RecordResult {
        error_pattern_hash: hash,
        pattern,
        entry,
    })
}

#[derive(Serialize)]
pub struct ResetResult {
    pub cleared: usize,
}

impl Output for ResetResult {
    fn to_json(&self) -> String {
        to_json(self)
    }

    fn to_human(&self) -> String {
        format!("Cleared {} correlation entries", self.cleared)
    }
}

pub fn knowledge_reset(ctx: &Context, yes: bool) -> Result<ResetResult> {
    if !yes {
        return Err(Error::ConfirmationRequired(
            "Resetting discards all correlation statistics; pass --yes to proceed".to_string(),
        ));
    }
    Ok(ResetResult {
        cleared: knowledge::reset(&ctx.store)?,
    })
}

// === Monitor ===

impl Output for MonitorReport {
    fn to_json(&self) -> String {
        to_json(self)
    }

    fn to_human(&self) -> String {
        let mut out = String::from("Monitor pass:");
        for c in &self.checks {
            let value = c
                .measurement
                .as_ref()
                .map(|m| format!("{:.1}", m.value))
                .unwrap_or_else(|| "n/a".to_string());
            let flag = if c.breach.is_some() { "  BREACH" } else { "" };
            let _ = write!(out, "\n  {:<14} {}{}", c.check, value, flag);
        }
        for a in &self.raised {
            let _ = write!(out, "\n  new alert {} [{}]: {}", a.id, a.severity, a.message);
        }
        let _ = write!(out, "\n{} active alert(s)", self.active_alerts);
        out
    }
}

pub fn monitor_run(ctx: &Context) -> Result<MonitorReport> {
    monitor::run(&ctx.store, &ctx.project_root, ctx.settings(), Utc::now())
}

pub fn monitor_init(ctx: &Context) -> Result<InitResult> {
    Ok(InitResult {
        created: monitor::init(&ctx.store)?,
    })
}

impl Output for MonitorStatus {
    fn to_json(&self) -> String {
        to_json(self)
    }

    fn to_human(&self) -> String {
        let mut out = format!(
            "Active alerts: {}  Resolved: {}\nLast run: {}",
            self.active_alerts,
            self.resolved_alerts,
            self.last_run
                .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| "never".to_string())
        );
        for (metric, m) in &self.latest {
            let _ = write!(out, "\n  {:<20} {:.2}", metric, m.value);
        }
        out
    }
}

pub fn monitor_status(ctx: &Context) -> Result<MonitorStatus> {
    monitor::status(&ctx.store)
}

#[derive(Serialize)]
pub struct AlertList {
    pub count: usize,
    pub alerts: Vec<Alert>,
}

impl Output for AlertList {
    fn to_json(&self) -> String {
        to_json(self)
    }

    fn to_human(&self) -> String {
        if self.alerts.is_empty() {
            return "No alerts.".to_string();
        }
        let mut out = format!("{} alert(s):\n", self.count);
        for a in &self.alerts {
            let _ = writeln!(
                out,
                "  {} [{}] {}{}: {}",
                a.id,
                a.severity,
                a.alert_type,
                if a.is_active() { "" } else { " (resolved)" },
                a.message
            );
        }
        out.trim_end().to_string()
    }
}

pub fn monitor_alerts(ctx: &Context, all: bool) -> Result<AlertList> {
    let alerts = monitor::alerts(&ctx.store, all)?;
    Ok(AlertList {
        count: alerts.len(),
        alerts,
    })
}

impl Output for Alert {
    fn to_json(&self) -> String {
        to_json(self)
    }

    fn to_human(&self) -> String {
        format!(
            "Alert {} [{}] {} is {}",
            self.id,
            self.severity,
            self.alert_type,
            if self.is_active() { "active" } else { "resolved" }
        )
    }
}

pub fn monitor_resolve(ctx: &Context, id: &str) -> Result<Alert> {
    monitor::resolve(&ctx.store, id, Utc::now())
}

impl Output for Measurement {
    fn to_json(&self) -> String {
        to_json(self)
    }

    fn to_human(&self) -> String {
        format!("Recorded {} = {}", self.metric, self.value)
    }
}

pub fn monitor_report(ctx: &Context, metric: &str, value: f64) -> Result<Measurement> {
    monitor::report_metric(&ctx.store, metric, value, Utc::now())
}

// === Config ===

#[derive(Serialize)]
pub struct ConfigValue {
    pub value: serde_json::Value,
    pub source: String,
}

#[derive(Serialize)]
pub struct ConfigShow {
    pub data_root: PathBuf,
    pub values: BTreeMap<String, ConfigValue>,
}

impl Output for ConfigShow {
    fn to_json(&self) -> String {
        to_json(self)
    }

    fn to_human(&self) -> String {
        let mut out = format!("Data root: {}", self.data_root.display());
        for (key, v) in &self.values {
            let _ = write!(out, "\n  {:<30} {:<20} ({})", key, v.value, v.source);
        }
        out
    }
}

pub fn config_show(ctx: &Context) -> Result<ConfigShow> {
    let s = ctx.settings();
    let scalars = [
        ("lock_timeout", json!(s.lock_timeout.as_secs_f64())),
        ("max_retries", json!(s.max_retries)),
        ("retry_delay", json!(s.retry_delay.as_secs_f64())),
        ("unresponsive_threshold", json!(s.unresponsive_threshold.as_secs_f64())),
        ("supervise_interval", json!(s.supervise_interval.as_secs_f64())),
        ("sync_interval", json!(s.sync_interval.as_secs_f64())),
        ("monitor_interval", json!(s.monitor_interval.as_secs_f64())),
        ("complexity_threshold", json!(s.complexity_threshold)),
        ("coverage_drop_threshold", json!(s.coverage_drop_threshold)),
        ("build_time_increase_threshold", json!(s.build_time_increase_threshold)),
        ("error_rate_threshold", json!(s.error_rate_threshold)),
        ("dependency_stale_days", json!(s.dependency_stale_days)),
        ("checkpoint_keep", json!(s.checkpoint_keep)),
        ("command_timeout", json!(s.command_timeout.as_secs_f64())),
    ];
    let mut values = BTreeMap::new();
    for (key, value) in scalars {
        let source = ctx
            .resolved
            .sources
            .get(key)
            .cloned()
            .unwrap_or(ValueSource::Default);
        values.insert(
            key.to_string(),
            ConfigValue {
                value,
                source: source.to_string(),
            },
        );
    }
    values.insert(
        "categories".to_string(),
        ConfigValue {
            value: json!(s.categories),
            source: "merged".to_string(),
        },
    );
    values.insert(
        "routing".to_string(),
        ConfigValue {
            value: json!(s.routing),
            source: "merged".to_string(),
        },
    );
    Ok(ConfigShow {
        data_root: ctx.store.root().to_path_buf(),
        values,
    })
}
