//! Task scheduler: submission, scoring, distribution and the task lifecycle.
//!
//! Tasks are scored against every registered agent when submitted and carry
//! their chosen owner from then on. `distribute` hands queued tasks to owners
//! that are currently available; owners then drive the task through
//! `in_progress` to `completed` or `failed`, at which point it moves into the
//! queue's append-only history.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::models::{AgentRecord, AgentRegistry, AgentStatus, Task, TaskQueue, TaskStatus};
use crate::storage::{Store, generate_id};
use crate::{Error, Result, notify, registry};

/// Score for declaring the task type as a capability.
pub const CAPABILITY_SCORE: i64 = 10;
/// Bonus for agents that are idle and ready.
pub const AVAILABLE_BONUS: i64 = 5;
/// Penalty for agents already working on something.
pub const BUSY_PENALTY: i64 = 3;

/// Score of `agent` for a task of `task_type`.
pub fn assignment_score(agent: &AgentRecord, task_type: &str) -> i64 {
    let mut score = agent.priority_weight;
    if agent.has_capability(task_type) {
        score += CAPABILITY_SCORE;
    }
    match agent.status {
        AgentStatus::Available => score += AVAILABLE_BONUS,
        AgentStatus::Busy => score -= BUSY_PENALTY,
        _ => {}
    }
    score
}

/// Pick the owner for a task of `task_type`.
///
/// A routing entry for the exact type wins outright. Otherwise the capable
/// agent with the highest score is chosen; ties go to the first name in
/// sorted order.
pub fn select_agent(
    registry: &AgentRegistry,
    task_type: &str,
    routing: &BTreeMap<String, String>,
) -> Result<String> {
    if let Some(target) = routing.get(task_type) {
        if registry.agents.contains_key(target) {
            return Ok(target.clone());
        }
        return Err(Error::NoCapableAgent(format!(
            "{} (routed to unregistered agent '{}')",
            task_type, target
        )));
    }

    let mut best: Option<(&AgentRecord, i64)> = None;
    for agent in registry.agents.values() {
        if !agent.has_capability(task_type) {
            continue;
        }
        let score = assignment_score(agent, task_type);
        if best.is_none_or(|(_, top)| score > top) {
            best = Some((agent, score));
        }
    }

    best.map(|(agent, _)| agent.name.clone())
        .ok_or_else(|| Error::NoCapableAgent(task_type.to_string()))
}

/// Parameters for a new task.
#[derive(Debug, Clone, Default)]
pub struct NewTask {
    pub task_type: String,
    pub description: String,
    pub priority: i64,
    pub dependencies: Vec<String>,
}

/// Queue a task for the best agent.
///
/// Nothing is persisted when no agent qualifies.
pub fn submit(
    store: &Store,
    routing: &BTreeMap<String, String>,
    new: NewTask,
    now: DateTime<Utc>,
) -> Result<Task> {
    if new.task_type.trim().is_empty() {
        return Err(Error::InvalidInput("Task type cannot be empty".to_string()));
    }

    let agents: AgentRegistry = store.read()?;
    let agent = select_agent(&agents, &new.task_type, routing)?;

    let task = store.update(|queue: &mut TaskQueue| {
        let mut id = generate_id("task", &new.task_type);
        while queue.contains(&id) {
            id = generate_id("task", &new.task_type);
        }
        let mut task = Task::new(id, new.task_type.clone(), agent.clone());
        task.description = new.description;
        task.priority = new.priority;
        task.dependencies = new.dependencies;
        task.created_at = now;
        queue.tasks.push(task.clone());
        Ok(task)
    })?;

    tracing::info!(task = %task.id, agent = %task.assigned_agent, "task queued");
    Ok(task)
}

/// Outcome of a distribution pass.
#[derive(Debug, Clone, Serialize)]
pub struct DistributeReport {
    /// Tasks moved to `assigned` in this pass
    pub assigned: Vec<Task>,
    /// Queued tasks whose owner was not available
    pub waiting: usize,
    /// Tasks put back in the queue because their owner could not be notified
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub requeued: Vec<String>,
}

/// Move every queued task whose owner is available to `assigned` and notify the owner.
///
/// Every notification is attempted. A task whose notification could not be
/// delivered goes back to `queued` so the next pass retries it.
pub fn distribute(store: &Store, now: DateTime<Utc>) -> Result<DistributeReport> {
    let agents: AgentRegistry = store.read()?;
    let available = |name: &str| {
        agents
            .agents
            .get(name)
            .is_some_and(|a| a.status == AgentStatus::Available)
    };

    let mut report = store.update(|queue: &mut TaskQueue| {
        let mut assigned = Vec::new();
        let mut waiting = 0;
        for task in queue
            .tasks
            .iter_mut()
            .filter(|t| t.status == TaskStatus::Queued)
        {
            if available(&task.assigned_agent) {
                task.status = TaskStatus::Assigned;
                task.assigned_at = Some(now);
                assigned.push(task.clone());
            } else {
                waiting += 1;
            }
        }
        Ok(DistributeReport {
            assigned,
            waiting,
            requeued: Vec::new(),
        })
    })?;

    let mut undelivered = Vec::new();
    for task in &report.assigned {
        if let Err(e) = notify::deliver(store, &task.assigned_agent, notify::TASK_ASSIGNED, &task.id)
        {
            tracing::warn!(task = %task.id, agent = %task.assigned_agent, error = %e, "notification failed");
            undelivered.push(task.id.clone());
        }
    }

    if !undelivered.is_empty() {
        report.requeued = store.update(|queue: &mut TaskQueue| {
            let mut requeued = Vec::new();
            for task in queue
                .tasks
                .iter_mut()
                .filter(|t| t.status == TaskStatus::Assigned && undelivered.contains(&t.id))
            {
                task.status = TaskStatus::Queued;
                task.assigned_at = None;
                requeued.push(task.id.clone());
            }
            Ok(requeued)
        })?;
        report
            .assigned
            .retain(|t| !report.requeued.contains(&t.id));
        report.waiting += report.requeued.len();
    }

    tracing::info!(
        assigned = report.assigned.len(),
        waiting = report.waiting,
        requeued = report.requeued.len(),
        "distribution pass"
    );
    Ok(report)
}

/// Apply an owner-driven transition to an active task.
fn transition(
    store: &Store,
    id: &str,
    agent: &str,
    to: TaskStatus,
    apply: impl FnOnce(&mut Task),
) -> Result<Task> {
    store.update(|queue: &mut TaskQueue| {
        let Some(index) = queue.tasks.iter().position(|t| t.id == id) else {
            return Err(match queue.find(id) {
                Some(done) => Error::InvalidTransition {
                    task: id.to_string(),
                    from: done.status.to_string(),
                    to: to.to_string(),
                },
                None => Error::NotFound(format!("Task {}", id)),
            });
        };

        let task = &mut queue.tasks[index];
        if task.assigned_agent != agent {
            return Err(Error::NotOwner {
                task: id.to_string(),
                owner: task.assigned_agent.clone(),
                agent: agent.to_string(),
            });
        }
        if !task.status.can_transition_to(to) {
            return Err(Error::InvalidTransition {
                task: id.to_string(),
                from: task.status.to_string(),
                to: to.to_string(),
            });
        }

        task.status = to;
        apply(task);
        let task = task.clone();
        match to {
            TaskStatus::Completed => {
                queue.tasks.remove(index);
                queue.completed.push(task.clone());
            }
            TaskStatus::Failed => {
                queue.tasks.remove(index);
                queue.failed.push(task.clone());
            }
            _ => {}
        }
        Ok(task)
    })
}

/// Update the owner's registry record, tolerating owners that were removed.
fn update_owner(
    store: &Store,
    agent: &str,
    now: DateTime<Utc>,
    f: impl FnOnce(&mut AgentRecord),
) -> Result<()> {
    match registry::modify(store, agent, now.timestamp(), |record| {
        f(record);
        Ok(())
    }) {
        Err(Error::NotFound(_)) => {
            tracing::warn!(agent, "task owner is not registered");
            Ok(())
        }
        other => other,
    }
}

/// Owner begins work on an assigned task.
pub fn start(store: &Store, id: &str, agent: &str, now: DateTime<Utc>) -> Result<Task> {
    let task = transition(store, id, agent, TaskStatus::InProgress, |t| {
        t.started_at = Some(now)
    })?;
    update_owner(store, agent, now, |record| {
        record.status = AgentStatus::Busy;
        record.current_task_id = Some(task.id.clone());
    })?;
    tracing::info!(task = id, agent, "task started");
    Ok(task)
}

/// Owner finishes a task successfully.
pub fn complete(store: &Store, id: &str, agent: &str, now: DateTime<Utc>) -> Result<Task> {
    let task = transition(store, id, agent, TaskStatus::Completed, |t| {
        t.completed_at = Some(now)
    })?;
    update_owner(store, agent, now, |record| {
        record.tasks_completed += 1;
        record.status = AgentStatus::Available;
        record.current_task_id = None;
    })?;
    tracing::info!(task = id, agent, "task completed");
    Ok(task)
}

/// Owner gives up on a task.
pub fn fail(
    store: &Store,
    id: &str,
    agent: &str,
    reason: Option<String>,
    now: DateTime<Utc>,
) -> Result<Task> {
    let task = transition(store, id, agent, TaskStatus::Failed, |t| {
        t.completed_at = Some(now);
        t.failure_reason = reason;
    })?;
    update_owner(store, agent, now, |record| {
        record.status = AgentStatus::Available;
        record.current_task_id = None;
    })?;
    tracing::warn!(task = id, agent, "task failed");
    Ok(task)
}

/// Tasks filtered by status and/or owner, active tasks first then history.
pub fn list(store: &Store, status: Option<TaskStatus>, agent: Option<&str>) -> Result<Vec<Task>> {
    let queue: TaskQueue = store.read()?;
    Ok(queue
        .tasks
        .into_iter()
        .chain(queue.completed)
        .chain(queue.failed)
        .filter(|t| status.is_none_or(|s| t.status == s))
        .filter(|t| agent.is_none_or(|a| t.assigned_agent == a))
        .collect())
}

pub fn show(store: &Store, id: &str) -> Result<Task> {
    let queue: TaskQueue = store.read()?;
    queue
        .find(id)
        .cloned()
        .ok_or_else(|| Error::NotFound(format!("Task {}", id)))
}

/// Active task counts for one agent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AgentLoad {
    pub queued: usize,
    pub assigned: usize,
    pub in_progress: usize,
    pub total: usize,
}

/// Distribution of active work across agents.
#[derive(Debug, Clone, Serialize)]
pub struct BalanceReport {
    /// Number of non-terminal tasks
    pub queue_size: usize,
    pub agents: BTreeMap<String, AgentLoad>,
    pub completed: usize,
    pub failed: usize,
    /// Tasks that reached a terminal state in the hour before the report
    pub drained_last_hour: usize,
    pub drain_rate_per_min: f64,
}

/// Report per-agent load of non-terminal tasks and how fast the queue drains.
///
/// Every registered agent appears, even with no work.
pub fn balance(store: &Store, now: DateTime<Utc>) -> Result<BalanceReport> {
    let queue: TaskQueue = store.read()?;
    let registry: AgentRegistry = store.read()?;

    let mut agents: BTreeMap<String, AgentLoad> = registry
        .agents
        .keys()
        .map(|name| (name.clone(), AgentLoad::default()))
        .collect();
    for task in &queue.tasks {
        let load = agents.entry(task.assigned_agent.clone()).or_default();
        match task.status {
            TaskStatus::Queued => load.queued += 1,
            TaskStatus::Assigned => load.assigned += 1,
            TaskStatus::InProgress => load.in_progress += 1,
            TaskStatus::Completed | TaskStatus::Failed => continue,
        }
        load.total += 1;
    }

    let since = now - chrono::Duration::hours(1);
    let drained_last_hour = queue
        .completed
        .iter()
        .chain(&queue.failed)
        .filter_map(|t| t.completed_at)
        .filter(|at| *at > since && *at <= now)
        .count();

    Ok(BalanceReport {
        queue_size: queue.tasks.len(),
        agents,
        completed: queue.completed.len(),
        failed: queue.failed.len(),
        drained_last_hour,
        drain_rate_per_min: drained_last_hour as f64 / 60.0,
    })
}

/// Result of a queue normalization.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NormalizeReport {
    /// Extra copies of an active task id that were dropped
    pub duplicates_removed: usize,
    /// Active tasks dropped because their id is already in history
    pub finished_removed: usize,
    pub remaining: usize,
}

/// Remove duplicate active tasks and active copies of finished tasks.
///
/// Of several active copies of one id, the most recently touched survives.
pub fn normalize(store: &Store) -> Result<NormalizeReport> {
    let report = store.update(|queue: &mut TaskQueue| {
        let mut keep: HashMap<String, usize> = HashMap::new();
        for (index, task) in queue.tasks.iter().enumerate() {
            match keep.get(&task.id) {
                Some(&best) if queue.tasks[best].last_touched() > task.last_touched() => {}
                _ => {
                    keep.insert(task.id.clone(), index);
                }
            }
        }

        let before = queue.tasks.len();
        let duplicates_removed = before - keep.len();
        let finished = |id: &str| {
            queue.completed.iter().any(|t| t.id == id) || queue.failed.iter().any(|t| t.id == id)
        };
        let kept: Vec<Task> = queue
            .tasks
            .iter()
            .enumerate()
            .filter(|(index, task)| keep.get(&task.id) == Some(index))
            .map(|(_, task)| task.clone())
            .filter(|task| !finished(&task.id))
            .collect();
        let finished_removed = before - duplicates_removed - kept.len();
        queue.tasks = kept;

        Ok(NormalizeReport {
            duplicates_removed,
            finished_removed,
            remaining: queue.tasks.len(),
        })
    })?;
    if report.duplicates_removed + report.finished_removed > 0 {
        tracing::info!(
            duplicates = report.duplicates_removed,
            finished = report.finished_removed,
            "task queue normalized"
        );
    }
    Ok(report)
}
