//! CLI argument definitions for `qm`.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::models::{AgentStatus, TaskStatus};

/// Quartermaster - coordination core for a fleet of agent workers.
///
/// State lives in a per-project data directory shared by every `qm` process;
/// run `qm supervise watch`, `qm knowledge watch` and `qm monitor watch` as
/// long-lived loops and let agents drive the rest.
#[derive(Parser, Debug)]
#[command(name = "qm")]
#[command(author, version, about = "Coordinate agent workers: tasks, supervision, checkpoints and shared knowledge", long_about = None)]
#[command(long_version = concat!(
    env!("CARGO_PKG_VERSION"),
    " (commit ",
    env!("QM_GIT_COMMIT"),
    ", built ",
    env!("QM_BUILD_TIMESTAMP"),
    ")"
))]
pub struct Cli {
    /// Output in human-readable format instead of JSON
    #[arg(short = 'H', long = "human", global = true)]
    pub human_readable: bool,

    /// Run as if qm was started in <path> instead of the current directory.
    /// The path must exist and is used literally (no git root detection).
    #[arg(short = 'C', long = "project", global = true, env = "QM_PROJECT")]
    pub project: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Agent registration, liveness and process control
    Agent {
        #[command(subcommand)]
        command: AgentCommands,
    },

    /// Task queue operations
    Task {
        #[command(subcommand)]
        command: TaskCommands,
    },

    /// Detect and restart unresponsive agents
    Supervise {
        #[command(subcommand)]
        command: SuperviseCommands,
    },

    /// Snapshot and roll back project files around risky operations
    Checkpoint {
        #[command(subcommand)]
        command: CheckpointCommands,
    },

    /// Correlate errors with the fixes that worked
    Knowledge {
        #[command(subcommand)]
        command: KnowledgeCommands,
    },

    /// Project health checks and alerts
    Monitor {
        #[command(subcommand)]
        command: MonitorCommands,
    },

    /// Configuration inspection
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

/// Agent subcommands
#[derive(Subcommand, Debug)]
pub enum AgentCommands {
    /// Register an agent or update its capabilities
    Register {
        /// Agent name (letters, digits, '-', '_', '.')
        name: String,

        /// Task types the agent can handle (comma-separated or repeated)
        #[arg(short = 'c', long = "capability", value_delimiter = ',')]
        capabilities: Vec<String>,

        /// Priority weight added to the assignment score
        #[arg(short = 'w', long)]
        weight: Option<i64>,

        /// Command used to start the agent (after `--`)
        #[arg(last = true)]
        command: Vec<String>,
    },

    /// Report liveness (creates the record on first contact)
    Heartbeat {
        /// Agent name
        #[arg(env = "QM_AGENT_NAME")]
        name: String,

        /// Process ID of the agent
        #[arg(long)]
        pid: Option<u32>,

        /// Explicit status (available, busy, idle, ...)
        #[arg(long)]
        status: Option<AgentStatus>,
    },

    /// Show one agent
    Status {
        /// Agent name
        name: String,
    },

    /// List registered agents
    List {
        /// Only agents with this status
        #[arg(long)]
        status: Option<AgentStatus>,
    },

    /// Remove an agent from the registry
    Rm {
        /// Agent name
        name: String,
    },

    /// Spawn an agent from its registered command
    Start {
        /// Agent name
        name: String,
    },

    /// Terminate an agent's process and mark it stopped
    Stop {
        /// Agent name
        name: String,
    },

    /// Stop then start an agent
    Restart {
        /// Agent name
        name: String,
    },

    /// Read (and by default consume) an agent's notifications
    Inbox {
        /// Agent name
        #[arg(env = "QM_AGENT_NAME")]
        name: String,

        /// Leave notifications in place
        #[arg(long)]
        peek: bool,
    },
}

/// Task subcommands
#[derive(Subcommand, Debug)]
pub enum TaskCommands {
    /// Submit a task and assign it to the best agent
    Submit {
        /// Task type (matched against agent capabilities)
        task_type: String,

        /// What needs doing
        #[arg(short, long, default_value = "")]
        description: String,

        /// Priority (higher first)
        #[arg(short, long, default_value_t = 0)]
        priority: i64,

        /// IDs of tasks this one depends on
        #[arg(long = "depends-on")]
        depends_on: Vec<String>,
    },

    /// List active tasks
    List {
        /// Filter by status
        #[arg(long)]
        status: Option<TaskStatus>,

        /// Filter by assigned agent
        #[arg(long)]
        agent: Option<String>,
    },

    /// Show a task (active or historical)
    Show {
        /// Task ID
        id: String,
    },

    /// Begin work on an assigned task
    Start {
        /// Task ID
        id: String,

        /// Agent claiming the task
        #[arg(long, env = "QM_AGENT_NAME")]
        agent: String,
    },

    /// Mark a task completed
    Complete {
        /// Task ID
        id: String,

        /// Agent that owns the task
        #[arg(long, env = "QM_AGENT_NAME")]
        agent: String,
    },

    /// Mark a task failed
    Fail {
        /// Task ID
        id: String,

        /// Agent that owns the task
        #[arg(long, env = "QM_AGENT_NAME")]
        agent: String,

        /// Why it failed
        #[arg(short, long)]
        reason: Option<String>,
    },

    /// Hand queued tasks to available agents
    Distribute,

    /// Show per-agent load
    Balance,

    /// Drop duplicate and finished entries from the active queue
    Normalize,
}

/// Supervisor subcommands
#[derive(Subcommand, Debug)]
pub enum SuperviseCommands {
    /// Run one supervision pass
    Run {
        /// Only report which agents would be restarted, plus the task backlog
        #[arg(long)]
        dry_run: bool,
    },

    /// Supervise every SUPERVISE_INTERVAL until interrupted
    Watch,
}

/// Checkpoint subcommands
#[derive(Subcommand, Debug)]
pub enum CheckpointCommands {
    /// Snapshot files or directories before an operation
    Create {
        /// Operation the checkpoint guards
        operation_id: String,

        /// Paths to snapshot, relative to the project root
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },

    /// Restore a checkpoint
    Restore {
        /// Checkpoint ID
        id: String,

        /// Skip the confirmation prompt
        #[arg(short, long)]
        force: bool,

        /// Also reverse the uncommitted git diff captured at checkpoint time
        #[arg(long)]
        reverse_diff: bool,
    },

    /// React to a validation result: roll back on failure
    Monitor {
        /// Checkpoint ID guarding the validated step
        id: String,

        /// Validation result JSON file, or '-' for stdin
        #[arg(short, long, default_value = "-")]
        result: PathBuf,

        /// Record the failure without restoring files
        #[arg(long)]
        no_rollback: bool,
    },

    /// Suggest the best untried action for an error pattern
    Alternative {
        /// Operation (action) that just failed
        operation: String,

        /// Error text or pattern hash
        error_pattern: String,

        /// Actions already tried
        #[arg(long = "tried", value_delimiter = ',')]
        tried: Vec<String>,
    },

    /// List checkpoints, newest first
    List,

    /// Delete all but the newest checkpoints
    Clean {
        /// How many to keep (defaults to CHECKPOINT_KEEP)
        #[arg(long)]
        keep: Option<usize>,
    },
}

/// Knowledge subcommands
#[derive(Subcommand, Debug)]
pub enum KnowledgeCommands {
    /// Aggregate outcomes into the hub and broadcast insights once
    Sync,

    /// Sync every SYNC_INTERVAL until interrupted
    Watch,

    /// Read a hub section
    Query {
        /// best_practices, anti_patterns, global_patterns or insights
        query_type: String,
    },

    /// Create empty knowledge documents
    Init,

    /// Record an error sighting and optionally the outcome of a fix
    Record {
        /// Error text, or an existing 12-character pattern hash
        error: String,

        /// Worker category the error came from
        #[arg(long)]
        category: Option<String>,

        /// Remediation action that was tried
        #[arg(short, long)]
        action: Option<String>,

        /// The action fixed the error
        #[arg(long, requires = "action", conflicts_with = "failure")]
        success: bool,

        /// The action did not fix the error
        #[arg(long, requires = "action")]
        failure: bool,

        /// How long the action took
        #[arg(long, default_value_t = 0.0)]
        duration_ms: f64,
    },

    /// Clear all correlation statistics
    Reset {
        /// Confirm the reset
        #[arg(long)]
        yes: bool,
    },
}

/// Monitor subcommands
#[derive(Subcommand, Debug)]
pub enum MonitorCommands {
    /// Create empty monitor documents
    Init,

    /// Run every check once
    Run,

    /// Run checks every MONITOR_INTERVAL until interrupted
    Watch,

    /// Alert counts and latest measurements
    Status,

    /// List active alerts
    Alerts {
        /// Include resolved alerts
        #[arg(long)]
        all: bool,
    },

    /// Resolve an alert
    Resolve {
        /// Alert ID
        id: String,
    },

    /// Report a metric value (coverage percent, build_time seconds)
    Report {
        /// Metric name
        metric: String,

        /// Measured value
        value: f64,
    },
}

/// Config subcommands
#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Show effective settings and where each came from
    Show,
}
