//! Data models for Quartermaster entities.
//!
//! This module defines the core data structures:
//! - `Task` - Units of work with type, priority, owner and lifecycle status
//! - `AgentRecord` - Registered workers with capabilities and liveness info
//! - `Notification` - Per-agent inbox entries
//! - `CorrelationEntry` / `ErrorPattern` - Remediation outcome statistics
//! - `Alert` / `Measurement` - Proactive monitor output
//! - `FailureRecord` - History of failed validations and what was done

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::storage::Document;

/// Task status in the assignment lifecycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Queued,
    Assigned,
    InProgress,
    Completed,
    Failed,
}

impl TaskStatus {
    /// Terminal statuses never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// Whether the lifecycle allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Queued, Assigned)
                | (Assigned, InProgress)
                | (Assigned, Failed)
                | (InProgress, Completed)
                | (InProgress, Failed)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Assigned => "assigned",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "queued" => Ok(TaskStatus::Queued),
            "assigned" => Ok(TaskStatus::Assigned),
            "in_progress" | "in-progress" => Ok(TaskStatus::InProgress),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            _ => Err(format!("Unknown task status: {}", s)),
        }
    }
}

/// A unit of work routed to one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier (e.g., "task_1767225600000_a1b2")
    pub id: String,

    /// Free-form type tag matched against agent capabilities
    #[serde(rename = "type")]
    pub task_type: String,

    #[serde(default)]
    pub description: String,

    /// Higher is more urgent
    #[serde(default)]
    pub priority: i64,

    /// Owning agent name, empty while unowned
    #[serde(default)]
    pub assigned_agent: String,

    #[serde(default)]
    pub status: TaskStatus,

    /// Task IDs this task depends on (advisory only)
    #[serde(default)]
    pub dependencies: Vec<String>,

    pub created_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

impl Task {
    /// Create a new queued task owned by `agent`.
    pub fn new(id: String, task_type: String, agent: String) -> Self {
        Self {
            id,
            task_type,
            description: String::new(),
            priority: 0,
            assigned_agent: agent,
            status: TaskStatus::Queued,
            dependencies: Vec::new(),
            created_at: Utc::now(),
            assigned_at: None,
            started_at: None,
            completed_at: None,
            failure_reason: None,
        }
    }

    /// Most recent timestamp recorded on the task.
    pub fn last_touched(&self) -> DateTime<Utc> {
        [self.assigned_at, self.started_at, self.completed_at]
            .into_iter()
            .flatten()
            .fold(self.created_at, |latest, t| latest.max(t))
    }
}

/// The shared task queue document.
///
/// Active tasks live in `tasks`; terminal tasks are moved to the append-only
/// `completed` and `failed` histories.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskQueue {
    pub tasks: Vec<Task>,
    pub completed: Vec<Task>,
    pub failed: Vec<Task>,
}

impl Document for TaskQueue {
    const NAME: &'static str = "task_queue.json";
    const REQUIRED: &'static [&'static str] = &["tasks", "completed", "failed"];
}

impl TaskQueue {
    /// Find a task anywhere in the queue or its histories.
    pub fn find(&self, id: &str) -> Option<&Task> {
        self.tasks
            .iter()
            .chain(self.completed.iter())
            .chain(self.failed.iter())
            .find(|t| t.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.find(id).is_some()
    }
}

/// Agent status as seen by the scheduler and supervisor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    #[default]
    Available,
    Busy,
    Idle,
    Stopped,
    Restarting,
    Unresponsive,
    Failed,
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AgentStatus::Available => "available",
            AgentStatus::Busy => "busy",
            AgentStatus::Idle => "idle",
            AgentStatus::Stopped => "stopped",
            AgentStatus::Restarting => "restarting",
            AgentStatus::Unresponsive => "unresponsive",
            AgentStatus::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for AgentStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "available" => Ok(AgentStatus::Available),
            "busy" => Ok(AgentStatus::Busy),
            "idle" => Ok(AgentStatus::Idle),
            "stopped" => Ok(AgentStatus::Stopped),
            "restarting" => Ok(AgentStatus::Restarting),
            "unresponsive" => Ok(AgentStatus::Unresponsive),
            "failed" => Ok(AgentStatus::Failed),
            _ => Err(format!("Unknown agent status: {}", s)),
        }
    }
}

/// A registered worker process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRecord {
    pub name: String,

    /// Task types this agent performs
    #[serde(default)]
    pub capabilities: BTreeSet<String>,

    /// Static bonus added to the assignment score
    #[serde(default)]
    pub priority_weight: i64,

    #[serde(default)]
    pub status: AgentStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,

    /// Epoch seconds of the last heartbeat
    #[serde(default)]
    pub last_seen: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_task_id: Option<String>,

    #[serde(default)]
    pub tasks_completed: u64,

    /// Entry point argv used to (re)spawn the agent
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,

    /// Epoch seconds of the last spawn by the supervisor or `agent start`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spawned_at: Option<i64>,
}

impl AgentRecord {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            capabilities: BTreeSet::new(),
            priority_weight: 0,
            status: AgentStatus::Available,
            pid: None,
            last_seen: 0,
            current_task_id: None,
            tasks_completed: 0,
            command: Vec::new(),
            spawned_at: None,
        }
    }

    pub fn has_capability(&self, task_type: &str) -> bool {
        self.capabilities.contains(task_type)
    }

    /// Liveness reference point: the later of the last heartbeat and last spawn.
    pub fn liveness_reference(&self) -> i64 {
        self.spawned_at.map_or(self.last_seen, |s| s.max(self.last_seen))
    }
}

/// The shared agent registry document, keyed (and iterated) by name.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentRegistry {
    pub agents: BTreeMap<String, AgentRecord>,

    /// Epoch seconds of the last write
    #[serde(default)]
    pub last_update: i64,
}

impl Document for AgentRegistry {
    const NAME: &'static str = "agent_status.json";
    const REQUIRED: &'static [&'static str] = &["agents"];
}

/// An entry in an agent's notification inbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub timestamp: DateTime<Utc>,
    pub notification_type: String,
    pub task_id: String,
}

/// Classification of a correlation entry by its success rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    BestPractice,
    AntiPattern,
    Neutral,
}

/// Outcome statistics for one (error pattern, remediation action) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelationEntry {
    pub error_pattern_hash: String,
    pub action: String,
    #[serde(default)]
    pub successes: u64,
    #[serde(default)]
    pub failures: u64,
    /// Always `successes + failures`
    #[serde(default)]
    pub times_used: u64,
    #[serde(default)]
    pub success_rate: f64,
    /// Running mean, milliseconds
    #[serde(default)]
    pub avg_duration: f64,
    pub last_used: DateTime<Utc>,
}

impl CorrelationEntry {
    /// Minimum success rate for a best practice.
    pub const BEST_PRACTICE_RATE: f64 = 0.8;
    /// Minimum uses for a best practice.
    pub const BEST_PRACTICE_USES: u64 = 3;
    /// Success rate below which an entry is an anti-pattern.
    pub const ANTI_PATTERN_RATE: f64 = 0.3;
    /// Minimum uses for an anti-pattern.
    pub const ANTI_PATTERN_USES: u64 = 2;

    pub fn new(error_pattern_hash: &str, action: &str) -> Self {
        Self {
            error_pattern_hash: error_pattern_hash.to_string(),
            action: action.to_string(),
            successes: 0,
            failures: 0,
            times_used: 0,
            success_rate: 0.0,
            avg_duration: 0.0,
            last_used: Utc::now(),
        }
    }

    /// Key in the fix history document.
    pub fn key(error_pattern_hash: &str, action: &str) -> String {
        format!("{}::{}", error_pattern_hash, action)
    }

    /// Fold one outcome into the statistics.
    pub fn record(&mut self, success: bool, duration_ms: f64) {
        if success {
            self.successes += 1;
        } else {
            self.failures += 1;
        }
        self.times_used = self.successes + self.failures;
        self.success_rate = self.successes as f64 / self.times_used as f64;
        self.avg_duration += (duration_ms - self.avg_duration) / self.times_used as f64;
        self.last_used = Utc::now();
    }

    pub fn classification(&self) -> Classification {
        if self.success_rate >= Self::BEST_PRACTICE_RATE
            && self.times_used >= Self::BEST_PRACTICE_USES
        {
            Classification::BestPractice
        } else if self.success_rate < Self::ANTI_PATTERN_RATE
            && self.times_used >= Self::ANTI_PATTERN_USES
        {
            Classification::AntiPattern
        } else {
            Classification::Neutral
        }
    }
}

/// All correlation entries keyed by `<hash>::<action>`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FixHistory(pub BTreeMap<String, CorrelationEntry>);

impl Document for FixHistory {
    const NAME: &'static str = "knowledge/fix_history.json";
}

/// Pattern category used when none is given.
pub const GENERAL_CATEGORY: &str = "general";

/// A normalized error text seen by one or more agents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPattern {
    pub hash: String,
    /// First raw text observed for this pattern
    pub sample: String,
    #[serde(default = "default_category")]
    pub category: String,
    #[serde(default)]
    pub occurrences: u64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

fn default_category() -> String {
    GENERAL_CATEGORY.to_string()
}

/// Observed error patterns keyed by hash.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorPatterns {
    pub patterns: BTreeMap<String, ErrorPattern>,
}

impl Document for ErrorPatterns {
    const NAME: &'static str = "knowledge/error_patterns.json";
    const REQUIRED: &'static [&'static str] = &["patterns"];
}

/// Alert severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Low,
    Medium,
    High,
}

impl fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AlertSeverity::Low => "low",
            AlertSeverity::Medium => "medium",
            AlertSeverity::High => "high",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertStatus {
    #[default]
    Active,
    Resolved,
}

/// A threshold breach reported by the monitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    #[serde(rename = "type")]
    pub alert_type: String,
    pub severity: AlertSeverity,
    pub message: String,
    #[serde(default)]
    pub details: serde_json::Value,
    #[serde(default)]
    pub status: AlertStatus,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Alert {
    pub fn new(
        alert_type: &str,
        severity: AlertSeverity,
        message: String,
        details: serde_json::Value,
    ) -> Self {
        Self {
            id: format!("alert_{}", &uuid::Uuid::new_v4().simple().to_string()[..8]),
            alert_type: alert_type.to_string(),
            severity,
            message,
            details,
            status: AlertStatus::Active,
            timestamp: Utc::now(),
            resolved_at: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == AlertStatus::Active
    }
}

/// A single metric sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub metric: String,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl Measurement {
    pub fn new(metric: &str, value: f64) -> Self {
        Self {
            metric: metric.to_string(),
            value,
            timestamp: Utc::now(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// What happened after a failed validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionTaken {
    RolledBack,
    ManualInterventionNeeded,
    RollbackFailed,
}

impl fmt::Display for ActionTaken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ActionTaken::RolledBack => "rolled_back",
            ActionTaken::ManualInterventionNeeded => "manual_intervention_needed",
            ActionTaken::RollbackFailed => "rollback_failed",
        };
        write!(f, "{}", s)
    }
}

/// One failed validation and its handling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub timestamp: DateTime<Utc>,
    pub operation_id: String,
    pub checkpoint_id: String,
    pub failed_layer: String,
    pub reason: String,
    pub action_taken: ActionTaken,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FailureHistory {
    pub failures: Vec<FailureRecord>,
}

impl Document for FailureHistory {
    const NAME: &'static str = "failure_history.json";
    const REQUIRED: &'static [&'static str] = &["failures"];
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_status_serialization() {
        let json = serde_json::to_string(&TaskStatus::InProgress).unwrap();
        assert_eq!(json, r#""in_progress""#);
        assert_eq!(
            "in-progress".parse::<TaskStatus>().unwrap(),
            TaskStatus::InProgress
        );
    }

    #[test]
    fn test_lifecycle_transitions() {
        use TaskStatus::*;
        assert!(Queued.can_transition_to(Assigned));
        assert!(Assigned.can_transition_to(InProgress));
        assert!(Assigned.can_transition_to(Failed));
        assert!(InProgress.can_transition_to(Completed));
        assert!(!Queued.can_transition_to(InProgress));
        assert!(!Assigned.can_transition_to(Completed));
        for terminal in [Completed, Failed] {
            for next in [Queued, Assigned, InProgress, Completed, Failed] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_task_type_field_name() {
        let task = Task::new("task_1_abcd".to_string(), "build".to_string(), "a".to_string());
        let value = serde_json::to_value(&task).unwrap();
        assert_eq!(value["type"], "build");
        assert_eq!(value["status"], "queued");
        assert!(value.get("started_at").is_none());
    }

    #[test]
    fn test_last_touched_uses_latest_timestamp() {
        let mut task = Task::new("t".to_string(), "build".to_string(), "a".to_string());
        let later = task.created_at + chrono::Duration::seconds(30);
        task.started_at = Some(later);
        assert_eq!(task.last_touched(), later);
    }

    #[test]
    fn test_agent_record_defaults_from_minimal_json() {
        let record: AgentRecord = serde_json::from_str(r#"{"name":"agent_build"}"#).unwrap();
        assert_eq!(record.status, AgentStatus::Available);
        assert!(record.capabilities.is_empty());
        assert_eq!(record.tasks_completed, 0);
    }

    #[test]
    fn test_liveness_reference_prefers_later_spawn() {
        let mut record = AgentRecord::new("a");
        record.last_seen = 100;
        assert_eq!(record.liveness_reference(), 100);
        record.spawned_at = Some(250);
        assert_eq!(record.liveness_reference(), 250);
        record.last_seen = 300;
        assert_eq!(record.liveness_reference(), 300);
    }

    #[test]
    fn test_correlation_best_practice() {
        let mut entry = CorrelationEntry::new("abc", "clean_build");
        for _ in 0..3 {
            entry.record(true, 100.0);
        }
        assert_eq!(entry.times_used, 3);
        assert_eq!(entry.success_rate, 1.0);
        assert_eq!(entry.classification(), Classification::BestPractice);
    }

    #[test]
    fn test_correlation_anti_pattern() {
        let mut entry = CorrelationEntry::new("abc", "retry");
        entry.record(true, 10.0);
        for _ in 0..3 {
            entry.record(false, 10.0);
        }
        assert_eq!(entry.times_used, 4);
        assert_eq!(entry.success_rate, 0.25);
        assert_eq!(entry.classification(), Classification::AntiPattern);
    }

    #[test]
    fn test_correlation_running_mean_duration() {
        let mut entry = CorrelationEntry::new("abc", "fix");
        entry.record(true, 100.0);
        entry.record(false, 300.0);
        assert_eq!(entry.avg_duration, 200.0);
        assert_eq!(entry.classification(), Classification::Neutral);
    }

    #[test]
    fn test_fix_history_is_a_flat_map() {
        let mut history = FixHistory::default();
        history.0.insert(
            CorrelationEntry::key("abc", "fix"),
            CorrelationEntry::new("abc", "fix"),
        );
        let value = serde_json::to_value(&history).unwrap();
        assert!(value.get("abc::fix").is_some());
    }

    #[test]
    fn test_alert_serialization() {
        let alert = Alert::new(
            "coverage_drop",
            AlertSeverity::High,
            "Coverage dropped".to_string(),
            serde_json::json!({"drop": 7.5}),
        );
        let value = serde_json::to_value(&alert).unwrap();
        assert_eq!(value["type"], "coverage_drop");
        assert_eq!(value["severity"], "high");
        assert_eq!(value["status"], "active");
        assert!(alert.id.starts_with("alert_"));
    }

    #[test]
    fn test_action_taken_serialization() {
        let json = serde_json::to_string(&ActionTaken::ManualInterventionNeeded).unwrap();
        assert_eq!(json, r#""manual_intervention_needed""#);
    }
}
