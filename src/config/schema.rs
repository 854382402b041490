//! KDL schema for config.kdl.
//!
//! This module provides:
//! - A Rust struct representing the KDL schema
//! - Serialization/deserialization to/from KDL format
//! - Validation
//!
//! Every field is optional so that system and session files can be layered.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;

use kdl::{KdlDocument, KdlEntry, KdlNode, KdlValue};

use crate::{Error, Result};

/// Tunables stored in config.kdl.
///
/// # KDL Schema
///
/// ```kdl
/// lock-timeout 10
/// max-retries 3
/// retry-delay 1
/// unresponsive-threshold 600
/// complexity-threshold 20
/// coverage-drop-threshold 5.0
/// categories "build" "debug" "codegen"
/// routing {
///     security-audit "agent_security"
/// }
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QuartermasterConfig {
    pub lock_timeout_secs: Option<f64>,
    pub max_retries: Option<u32>,
    pub retry_delay_secs: Option<f64>,
    pub unresponsive_threshold_secs: Option<f64>,
    pub supervise_interval_secs: Option<f64>,
    pub sync_interval_secs: Option<f64>,
    pub monitor_interval_secs: Option<f64>,
    pub complexity_threshold: Option<u32>,
    pub coverage_drop_threshold: Option<f64>,
    pub build_time_increase_threshold: Option<f64>,
    pub error_rate_threshold: Option<u32>,
    pub dependency_stale_days: Option<u32>,
    pub checkpoint_keep: Option<u32>,
    pub command_timeout_secs: Option<f64>,
    /// Worker categories that receive knowledge broadcasts
    pub categories: Option<Vec<String>>,
    /// Task type -> agent name overrides
    pub routing: BTreeMap<String, String>,
}

impl QuartermasterConfig {
    /// Create an empty config with no values set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a config file. A missing file yields an empty config.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Self::new()),
            Err(e) => return Err(e.into()),
        };
        let doc: KdlDocument = contents
            .parse()
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        let config = Self::from_kdl(&doc);
        config
            .validate()
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        Ok(config)
    }

    /// Validate the config values.
    ///
    /// Returns an error message if any value is invalid.
    pub fn validate(&self) -> std::result::Result<(), String> {
        let durations = [
            ("lock-timeout", self.lock_timeout_secs),
            ("retry-delay", self.retry_delay_secs),
            ("unresponsive-threshold", self.unresponsive_threshold_secs),
            ("supervise-interval", self.supervise_interval_secs),
            ("sync-interval", self.sync_interval_secs),
            ("monitor-interval", self.monitor_interval_secs),
            ("command-timeout", self.command_timeout_secs),
            ("coverage-drop-threshold", self.coverage_drop_threshold),
            (
                "build-time-increase-threshold",
                self.build_time_increase_threshold,
            ),
        ];
        for (key, value) in durations {
            if let Some(v) = value {
                if !v.is_finite() || v < 0.0 {
                    return Err(format!("{} must be a non-negative number, got {}", key, v));
                }
            }
        }
        if self.max_retries == Some(0) {
            return Err("max-retries must be at least 1".to_string());
        }
        if let Some(ref categories) = self.categories {
            if categories.iter().any(|c| c.trim().is_empty()) {
                return Err("categories must not contain empty names".to_string());
            }
        }
        Ok(())
    }

    /// Parse config from a KDL document.
    pub fn from_kdl(doc: &KdlDocument) -> Self {
        let mut config = Self::new();

        config.lock_timeout_secs = number(doc, "lock-timeout");
        config.max_retries = integer(doc, "max-retries");
        config.retry_delay_secs = number(doc, "retry-delay");
        config.unresponsive_threshold_secs = number(doc, "unresponsive-threshold");
        config.supervise_interval_secs = number(doc, "supervise-interval");
        config.sync_interval_secs = number(doc, "sync-interval");
        config.monitor_interval_secs = number(doc, "monitor-interval");
        config.complexity_threshold = integer(doc, "complexity-threshold");
        config.coverage_drop_threshold = number(doc, "coverage-drop-threshold");
        config.build_time_increase_threshold = number(doc, "build-time-increase-threshold");
        config.error_rate_threshold = integer(doc, "error-rate-threshold");
        config.dependency_stale_days = integer(doc, "dependency-stale-days");
        config.checkpoint_keep = integer(doc, "checkpoint-keep");
        config.command_timeout_secs = number(doc, "command-timeout");

        if let Some(node) = doc.get("categories") {
            let categories: Vec<String> = node
                .entries()
                .iter()
                .filter_map(|entry| entry.value().as_string().map(str::to_string))
                .collect();
            if !categories.is_empty() {
                config.categories = Some(categories);
            }
        }

        if let Some(children) = doc.get("routing").and_then(|node| node.children()) {
            for route in children.nodes() {
                if let Some(agent) = route
                    .entries()
                    .first()
                    .and_then(|entry| entry.value().as_string())
                {
                    config
                        .routing
                        .insert(route.name().value().to_string(), agent.to_string());
                }
            }
        }

        config
    }

    /// Convert config to a KDL document.
    pub fn to_kdl(&self) -> KdlDocument {
        let mut doc = KdlDocument::new();

        push_number(&mut doc, "lock-timeout", self.lock_timeout_secs);
        push_integer(&mut doc, "max-retries", self.max_retries);
        push_number(&mut doc, "retry-delay", self.retry_delay_secs);
        push_number(
            &mut doc,
            "unresponsive-threshold",
            self.unresponsive_threshold_secs,
        );
        push_number(&mut doc, "supervise-interval", self.supervise_interval_secs);
        push_number(&mut doc, "sync-interval", self.sync_interval_secs);
        push_number(&mut doc, "monitor-interval", self.monitor_interval_secs);
        push_integer(&mut doc, "complexity-threshold", self.complexity_threshold);
        push_number(
            &mut doc,
            "coverage-drop-threshold",
            self.coverage_drop_threshold,
        );
        push_number(
            &mut doc,
            "build-time-increase-threshold",
            self.build_time_increase_threshold,
        );
        push_integer(&mut doc, "error-rate-threshold", self.error_rate_threshold);
        push_integer(&mut doc, "dependency-stale-days", self.dependency_stale_days);
        push_integer(&mut doc, "checkpoint-keep", self.checkpoint_keep);
        push_number(&mut doc, "command-timeout", self.command_timeout_secs);

        if let Some(ref categories) = self.categories {
            let mut node = KdlNode::new("categories");
            for category in categories {
                node.push(KdlEntry::new(KdlValue::String(category.clone())));
            }
            doc.nodes_mut().push(node);
        }

        if !self.routing.is_empty() {
            let mut children = KdlDocument::new();
            for (task_type, agent) in &self.routing {
                let mut route = KdlNode::new(task_type.as_str());
                route.push(KdlEntry::new(KdlValue::String(agent.clone())));
                children.nodes_mut().push(route);
            }
            let mut node = KdlNode::new("routing");
            node.set_children(children);
            doc.nodes_mut().push(node);
        }

        doc
    }

    /// Merge another config into this one.
    /// Values from `other` override values in `self` if they are Some.
    /// Routing entries merge per task type.
    pub fn merge(&mut self, other: &QuartermasterConfig) {
        macro_rules! take {
            ($($field:ident),*) => {
                $(if other.$field.is_some() {
                    self.$field = other.$field.clone();
                })*
            };
        }
        take!(
            lock_timeout_secs,
            max_retries,
            retry_delay_secs,
            unresponsive_threshold_secs,
            supervise_interval_secs,
            sync_interval_secs,
            monitor_interval_secs,
            complexity_threshold,
            coverage_drop_threshold,
            build_time_increase_threshold,
            error_rate_threshold,
            dependency_stale_days,
            checkpoint_keep,
            command_timeout_secs,
            categories
        );
        for (task_type, agent) in &other.routing {
            self.routing.insert(task_type.clone(), agent.clone());
        }
    }
}

/// First entry of `key` as a number, accepting integers and floats.
fn number(doc: &KdlDocument, key: &str) -> Option<f64> {
    let value = doc.get(key)?.entries().first()?.value();
    value
        .as_float()
        .or_else(|| value.as_integer().map(|i| i as f64))
}

/// First entry of `key` as a non-negative integer.
fn integer<T: TryFrom<i128>>(doc: &KdlDocument, key: &str) -> Option<T> {
    let value = doc.get(key)?.entries().first()?.value().as_integer()?;
    T::try_from(value).ok()
}

fn push_number(doc: &mut KdlDocument, key: &str, value: Option<f64>) {
    if let Some(v) = value {
        let mut node = KdlNode::new(key);
        if v.fract() == 0.0 {
            node.push(KdlEntry::new(KdlValue::Integer(v as i128)));
        } else {
            node.push(KdlEntry::new(KdlValue::Float(v)));
        }
        doc.nodes_mut().push(node);
    }
}

fn push_integer<T: Into<i128> + Copy>(doc: &mut KdlDocument, key: &str, value: Option<T>) {
    if let Some(v) = value {
        let mut node = KdlNode::new(key);
        node.push(KdlEntry::new(KdlValue::Integer(v.into())));
        doc.nodes_mut().push(node);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn parse(src: &str) -> QuartermasterConfig {
        QuartermasterConfig::from_kdl(&src.parse::<KdlDocument>().unwrap())
    }

    #[test]
    fn test_parse_scalar_settings() {
        let config = parse(
            r#"
            lock-timeout 5
            max-retries 4
            retry-delay 0.5
            complexity-threshold 30
            coverage-drop-threshold 2.5
            "#,
        );
        assert_eq!(config.lock_timeout_secs, Some(5.0));
        assert_eq!(config.max_retries, Some(4));
        assert_eq!(config.retry_delay_secs, Some(0.5));
        assert_eq!(config.complexity_threshold, Some(30));
        assert_eq!(config.coverage_drop_threshold, Some(2.5));
        assert_eq!(config.unresponsive_threshold_secs, None);
    }

    #[test]
    fn test_parse_categories_and_routing() {
        let config = parse(
            r#"
            categories "build" "lint"
            routing {
                security-audit "agent_security"
                release "agent_release"
            }
            "#,
        );
        assert_eq!(
            config.categories,
            Some(vec!["build".to_string(), "lint".to_string()])
        );
        assert_eq!(
            config.routing.get("security-audit").map(String::as_str),
            Some("agent_security")
        );
        assert_eq!(config.routing.len(), 2);
    }

    #[test]
    fn test_negative_integer_is_ignored() {
        let config = parse("max-retries -1\n");
        assert_eq!(config.max_retries, None);
    }

    #[test]
    fn test_validate_rejects_zero_retries() {
        let config = QuartermasterConfig {
            max_retries: Some(0),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_kdl_roundtrip_preserves_routing() {
        let mut config = QuartermasterConfig::new();
        config.lock_timeout_secs = Some(2.5);
        config.checkpoint_keep = Some(4);
        config
            .routing
            .insert("deploy".to_string(), "agent_deploy".to_string());

        let reparsed = QuartermasterConfig::from_kdl(&config.to_kdl());
        assert_eq!(reparsed, config);
    }

    #[test]
    fn test_merge_overrides_and_extends_routing() {
        let mut base = parse("lock-timeout 10\nrouting {\n a \"x\"\n}\n");
        let session = parse("lock-timeout 3\nrouting {\n b \"y\"\n}\n");
        base.merge(&session);

        assert_eq!(base.lock_timeout_secs, Some(3.0));
        assert_eq!(base.routing.len(), 2);
    }

    #[test]
    fn test_load_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let config = QuartermasterConfig::load(&dir.path().join("config.kdl")).unwrap();
        assert_eq!(config, QuartermasterConfig::new());
    }

    #[test]
    fn test_load_invalid_kdl_errors() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.kdl");
        fs::write(&path, "routing {\n").unwrap();
        assert!(matches!(
            QuartermasterConfig::load(&path),
            Err(Error::Config(_))
        ));
    }
}
