//! Agent registry and heartbeats.
//!
//! Agents appear in `agent_status.json` on their first heartbeat or through
//! explicit registration, and leave it only through [`remove`].

use std::collections::BTreeSet;

use crate::models::{AgentRecord, AgentRegistry, AgentStatus};
use crate::storage::Store;
use crate::{Error, Result};

/// Reject names that are empty or could escape the notifications/log directories.
pub fn validate_agent_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidInput(format!(
            "Invalid agent name {:?}: use letters, digits, '_', '-' or '.'",
            name
        )))
    }
}

/// Fields accepted by [`register`]; `None` keeps an existing value.
#[derive(Debug, Clone, Default)]
pub struct Registration {
    pub capabilities: Option<BTreeSet<String>>,
    pub priority_weight: Option<i64>,
    pub command: Option<Vec<String>>,
}

/// Create or update an agent record.
pub fn register(store: &Store, name: &str, reg: Registration, now: i64) -> Result<AgentRecord> {
    validate_agent_name(name)?;
    let record = store.update(|registry: &mut AgentRegistry| {
        let record = registry
            .agents
            .entry(name.to_string())
            .or_insert_with(|| AgentRecord::new(name));
        if let Some(caps) = reg.capabilities {
            record.capabilities = caps;
        }
        if let Some(weight) = reg.priority_weight {
            record.priority_weight = weight;
        }
        if let Some(command) = reg.command {
            record.command = command;
        }
        let record = record.clone();
        registry.last_update = now;
        Ok(record)
    })?;
    tracing::info!(agent = name, "agent registered");
    Ok(record)
}

/// Record a heartbeat from `name`, creating the record on first contact.
///
/// `last_seen` never moves backwards. Without an explicit status, an agent
/// coming back from `restarting`, `unresponsive`, `idle` or `stopped` becomes
/// `available`.
pub fn heartbeat(
    store: &Store,
    name: &str,
    pid: Option<u32>,
    status: Option<AgentStatus>,
    now: i64,
) -> Result<AgentRecord> {
    validate_agent_name(name)?;
    store.update(|registry: &mut AgentRegistry| {
        let record = registry
            .agents
            .entry(name.to_string())
            .or_insert_with(|| AgentRecord::new(name));
        record.last_seen = record.last_seen.max(now);
        if pid.is_some() {
            record.pid = pid;
        }
        match status {
            Some(status) => record.status = status,
            None => {
                if matches!(
                    record.status,
                    AgentStatus::Restarting
                        | AgentStatus::Unresponsive
                        | AgentStatus::Idle
                        | AgentStatus::Stopped
                ) {
                    record.status = AgentStatus::Available;
                }
            }
        }
        let record = record.clone();
        registry.last_update = now;
        Ok(record)
    })
}

/// Apply `f` to an existing record and persist it.
pub fn modify<T>(
    store: &Store,
    name: &str,
    now: i64,
    f: impl FnOnce(&mut AgentRecord) -> Result<T>,
) -> Result<T> {
    store.update(|registry: &mut AgentRegistry| {
        let record = registry
            .agents
            .get_mut(name)
            .ok_or_else(|| Error::NotFound(format!("Agent {}", name)))?;
        let out = f(record)?;
        registry.last_update = now;
        Ok(out)
    })
}

pub fn set_status(store: &Store, name: &str, status: AgentStatus, now: i64) -> Result<AgentRecord> {
    modify(store, name, now, |record| {
        record.status = status;
        Ok(record.clone())
    })
}

/// Delete an agent record.
pub fn remove(store: &Store, name: &str, now: i64) -> Result<AgentRecord> {
    let removed = store.update(|registry: &mut AgentRegistry| {
        let record = registry
            .agents
            .remove(name)
            .ok_or_else(|| Error::NotFound(format!("Agent {}", name)))?;
        registry.last_update = now;
        Ok(record)
    })?;
    tracing::info!(agent = name, "agent removed");
    Ok(removed)
}

pub fn get(store: &Store, name: &str) -> Result<AgentRecord> {
    store
        .read::<AgentRegistry>()?
        .agents
        .remove(name)
        .ok_or_else(|| Error::NotFound(format!("Agent {}", name)))
}

/// All agents in name order, optionally filtered by status.
pub fn list(store: &Store, status: Option<AgentStatus>) -> Result<Vec<AgentRecord>> {
    Ok(store
        .read::<AgentRegistry>()?
        .agents
        .into_values()
        .filter(|a| status.is_none_or(|s| a.status == s))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::TestEnv;

    fn caps(tags: &[&str]) -> Option<BTreeSet<String>> {
        Some(tags.iter().map(|t| t.to_string()).collect())
    }

    #[test]
    fn test_register_creates_and_updates() {
        let env = TestEnv::new();
        let store = env.store();

        let record = register(
            &store,
            "agent_build",
            Registration {
                capabilities: caps(&["build"]),
                priority_weight: Some(8),
                command: Some(vec!["sleep".to_string(), "60".to_string()]),
            },
            100,
        )
        .unwrap();
        assert_eq!(record.priority_weight, 8);
        assert_eq!(record.status, AgentStatus::Available);

        let updated = register(
            &store,
            "agent_build",
            Registration {
                priority_weight: Some(3),
                ..Default::default()
            },
            101,
        )
        .unwrap();
        assert_eq!(updated.priority_weight, 3);
        assert!(updated.has_capability("build"));
        assert_eq!(updated.command, vec!["sleep", "60"]);
    }

    #[test]
    fn test_heartbeat_creates_record() {
        let env = TestEnv::new();
        let store = env.store();

        let record = heartbeat(&store, "agent_new", Some(42), None, 500).unwrap();
        assert_eq!(record.last_seen, 500);
        assert_eq!(record.pid, Some(42));
        assert_eq!(get(&store, "agent_new").unwrap().last_seen, 500);
    }

    #[test]
    fn test_last_seen_is_monotonic() {
        let env = TestEnv::new();
        let store = env.store();

        heartbeat(&store, "a", None, None, 500).unwrap();
        let record = heartbeat(&store, "a", None, None, 400).unwrap();
        assert_eq!(record.last_seen, 500);
    }

    #[test]
    fn test_heartbeat_revives_restarting_agent() {
        let env = TestEnv::new();
        let store = env.store();

        heartbeat(&store, "a", None, None, 1).unwrap();
        set_status(&store, "a", AgentStatus::Restarting, 2).unwrap();
        let record = heartbeat(&store, "a", None, None, 3).unwrap();
        assert_eq!(record.status, AgentStatus::Available);
    }

    #[test]
    fn test_heartbeat_keeps_busy_and_failed() {
        let env = TestEnv::new();
        let store = env.store();

        heartbeat(&store, "a", None, Some(AgentStatus::Busy), 1).unwrap();
        assert_eq!(
            heartbeat(&store, "a", None, None, 2).unwrap().status,
            AgentStatus::Busy
        );

        set_status(&store, "a", AgentStatus::Failed, 3).unwrap();
        assert_eq!(
            heartbeat(&store, "a", None, None, 4).unwrap().status,
            AgentStatus::Failed
        );
    }

    #[test]
    fn test_remove_and_not_found() {
        let env = TestEnv::new();
        let store = env.store();

        heartbeat(&store, "a", None, None, 1).unwrap();
        remove(&store, "a", 2).unwrap();
        assert!(matches!(get(&store, "a"), Err(Error::NotFound(_))));
        assert!(matches!(remove(&store, "a", 3), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_list_is_name_ordered_and_filtered() {
        let env = TestEnv::new();
        let store = env.store();

        heartbeat(&store, "zeta", None, None, 1).unwrap();
        heartbeat(&store, "alpha", None, Some(AgentStatus::Busy), 1).unwrap();

        let names: Vec<_> = list(&store, None)
            .unwrap()
            .into_iter()
            .map(|a| a.name)
            .collect();
        assert_eq!(names, vec!["alpha", "zeta"]);

        let busy = list(&store, Some(AgentStatus::Busy)).unwrap();
        assert_eq!(busy.len(), 1);
        assert_eq!(busy[0].name, "alpha");
    }

    #[test]
    fn test_invalid_names_rejected() {
        for bad in ["", "../x", ".hidden", "a b"] {
            assert!(validate_agent_name(bad).is_err(), "{:?} accepted", bad);
        }
        assert!(validate_agent_name("agent_build-2.x").is_ok());
    }
}
