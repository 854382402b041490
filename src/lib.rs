//! Quartermaster - coordination core for a pool of maintenance agents.
//!
//! This library provides the shared state store, agent registry, task
//! scheduler, liveness supervisor, checkpoint/rollback manager, knowledge
//! correlation engine and proactive monitor behind the `qm` CLI.

pub mod checkpoint;
pub mod cli;
pub mod commands;
pub mod config;
pub mod events;
pub mod knowledge;
pub mod models;
pub mod monitor;
pub mod notify;
pub mod poll;
pub mod registry;
pub mod scheduler;
pub mod storage;
pub mod supervisor;


/// Library-level error type for Quartermaster operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Timed out waiting for lock on {document} after {attempts} attempts")]
    LockTimeout { document: String, attempts: u32 },

    #[error("No capable agent for task type '{0}'")]
    NoCapableAgent(String),

    #[error("Agent {agent} is unresponsive and could not be restarted: {reason}")]
    AgentUnresponsive { agent: String, reason: String },

    #[error("Validation failed in layer '{layer}': {reason}")]
    ValidationFailure { layer: String, reason: String },

    #[error("Rollback failed: {0}")]
    RollbackFailure(String),

    #[error("Knowledge sync failed: {0}")]
    KnowledgeSync(String),

    #[error("Document {document} is malformed: {reason}")]
    CorruptDocument { document: String, reason: String },

    #[error("Task {task} cannot move from {from} to {to}")]
    InvalidTransition {
        task: String,
        from: String,
        to: String,
    },

    #[error("Task {task} is owned by {owner}, not {agent}")]
    NotOwner {
        task: String,
        owner: String,
        agent: String,
    },

    #[error("Entity not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Confirmation required: {0}")]
    ConfirmationRequired(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Taxonomy name printed alongside CLI error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Io(_) => "IoError",
            Error::Json(_) => "JsonError",
            Error::LockTimeout { .. } => "LockTimeoutError",
            Error::NoCapableAgent(_) => "NoCapableAgentError",
            Error::AgentUnresponsive { .. } => "AgentUnresponsiveError",
            Error::ValidationFailure { .. } => "ValidationFailure",
            Error::RollbackFailure(_) => "RollbackFailure",
            Error::KnowledgeSync(_) => "KnowledgeSyncError",
            Error::CorruptDocument { .. } => "CorruptDocument",
            Error::InvalidTransition { .. } => "InvalidTransition",
            Error::NotOwner { .. } => "NotOwner",
            Error::NotFound(_) => "NotFound",
            Error::InvalidInput(_) => "InvalidInput",
            Error::ConfirmationRequired(_) => "ConfirmationRequired",
            Error::Config(_) => "ConfigError",
            Error::Other(_) => "Error",
        }
    }
}

/// Result type alias for Quartermaster operations.
pub type Result<T> = std::result::Result<T, Error>;
