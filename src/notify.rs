//! Per-agent notification inboxes.
//!
//! Each agent has an append-only `notifications/<agent>.jsonl` file. The
//! scheduler appends to it; the agent drains it (read + truncate under the
//! inbox lock) when it polls.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use chrono::Utc;

use crate::models::Notification;
use crate::registry::validate_agent_name;
use crate::storage::Store;
use crate::Result;

/// Notification type delivered when a task moves to `assigned`.
pub const TASK_ASSIGNED: &str = "task_assigned";

fn inbox_name(agent: &str) -> Result<String> {
    validate_agent_name(agent)?;
    Ok(format!("notifications/{}.jsonl", agent))
}

fn inbox_path(store: &Store, agent: &str) -> Result<PathBuf> {
    Ok(store.path(&inbox_name(agent)?))
}

/// Append a notification to `agent`'s inbox.
pub fn deliver(store: &Store, agent: &str, notification_type: &str, task_id: &str) -> Result<()> {
    let name = inbox_name(agent)?;
    let path = store.path(&name);
    let entry = Notification {
        timestamp: Utc::now(),
        notification_type: notification_type.to_string(),
        task_id: task_id.to_string(),
    };
    let mut line = serde_json::to_string(&entry)?;
    line.push('\n');

    store.with_lock(&name, || {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        file.write_all(line.as_bytes())?;
        Ok(())
    })?;
    tracing::debug!(agent, notification_type, task_id, "notification delivered");
    Ok(())
}

/// Read pending notifications without consuming them.
pub fn peek(store: &Store, agent: &str) -> Result<Vec<Notification>> {
    let path = inbox_path(store, agent)?;
    match fs::read_to_string(&path) {
        Ok(content) => Ok(parse_lines(&content)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}

/// Read and clear `agent`'s inbox.
pub fn drain(store: &Store, agent: &str) -> Result<Vec<Notification>> {
    let name = inbox_name(agent)?;
    let path = store.path(&name);
    store.with_lock(&name, || {
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        OpenOptions::new().write(true).truncate(true).open(&path)?;
        Ok(parse_lines(&content))
    })
}

fn parse_lines(content: &str) -> Vec<Notification> {
    content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| match serde_json::from_str(line) {
            Ok(n) => Some(n),
            Err(e) => {
                tracing::warn!("Skipping malformed notification: {}", e);
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use crate::test_utils::TestEnv;

    #[test]
    fn test_deliver_then_drain() {
        let env = TestEnv::new();
        let store = env.store();

        deliver(&store, "agent_build", TASK_ASSIGNED, "task_1_aaaa").unwrap();
        deliver(&store, "agent_build", TASK_ASSIGNED, "task_2_bbbb").unwrap();

        assert_eq!(peek(&store, "agent_build").unwrap().len(), 2);

        let drained = drain(&store, "agent_build").unwrap();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].task_id, "task_1_aaaa");
        assert_eq!(drained[1].notification_type, TASK_ASSIGNED);

        assert!(drain(&store, "agent_build").unwrap().is_empty());
    }

    #[test]
    fn test_inboxes_are_per_agent() {
        let env = TestEnv::new();
        let store = env.store();

        deliver(&store, "agent_a", TASK_ASSIGNED, "t1").unwrap();
        assert!(drain(&store, "agent_b").unwrap().is_empty());
        assert_eq!(drain(&store, "agent_a").unwrap().len(), 1);
    }

    #[test]
    fn test_rejects_path_like_agent_names() {
        let env = TestEnv::new();
        let store = env.store();
        assert!(matches!(
            deliver(&store, "../escape", TASK_ASSIGNED, "t1"),
            Err(Error::InvalidInput(_))
        ));
    }
}
