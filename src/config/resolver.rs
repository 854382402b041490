//! Unified precedence resolution for settings.
//!
//! ## Precedence (highest to lowest)
//!
//! 1. Environment variable (`LOCK_TIMEOUT`, `MAX_RETRIES`, ...)
//! 2. Session config.kdl (`<data root>/config.kdl`)
//! 3. System config.kdl (`~/.config/quartermaster/config.kdl`)
//! 4. Built-in defaults

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::Serialize;

use crate::config::QuartermasterConfig;
use crate::{Error, Result};

/// Tracks where a resolved value came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueSource {
    /// Value from environment variable
    EnvVar(String),
    /// Value from session-level config
    Session,
    /// Value from system-level config
    System,
    /// Built-in default value
    Default,
}

impl std::fmt::Display for ValueSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValueSource::EnvVar(name) => write!(f, "env:{}", name),
            ValueSource::Session => write!(f, "session"),
            ValueSource::System => write!(f, "system"),
            ValueSource::Default => write!(f, "default"),
        }
    }
}

/// Effective runtime settings.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Settings {
    pub lock_timeout: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub unresponsive_threshold: Duration,
    pub supervise_interval: Duration,
    pub sync_interval: Duration,
    pub monitor_interval: Duration,
    pub complexity_threshold: u32,
    /// Percentage points
    pub coverage_drop_threshold: f64,
    /// Percent over the previous build time
    pub build_time_increase_threshold: f64,
    /// Errors per day
    pub error_rate_threshold: u32,
    pub dependency_stale_days: u32,
    pub checkpoint_keep: usize,
    pub command_timeout: Duration,
    pub categories: Vec<String>,
    pub routing: BTreeMap<String, String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(10),
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
            unresponsive_threshold: Duration::from_secs(600),
            supervise_interval: Duration::from_secs(60),
            sync_interval: Duration::from_secs(300),
            monitor_interval: Duration::from_secs(900),
            complexity_threshold: 20,
            coverage_drop_threshold: 5.0,
            build_time_increase_threshold: 20.0,
            error_rate_threshold: 10,
            dependency_stale_days: 30,
            checkpoint_keep: 10,
            command_timeout: Duration::from_secs(1800),
            categories: vec![
                "build".to_string(),
                "debug".to_string(),
                "codegen".to_string(),
            ],
            routing: BTreeMap::new(),
        }
    }
}

/// Settings plus the source of every scalar value.
#[derive(Debug, Clone)]
pub struct ResolvedSettings {
    pub settings: Settings,
    pub sources: BTreeMap<&'static str, ValueSource>,
}

/// Path of the system-wide config file, if a config directory exists.
pub fn system_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("quartermaster").join("config.kdl"))
}

/// Path of the session config file for a data root.
pub fn session_config_path(data_root: &Path) -> PathBuf {
    data_root.join("config.kdl")
}

/// Load both config layers from disk and resolve them against the process environment.
pub fn resolve_settings_for(data_root: &Path) -> Result<ResolvedSettings> {
    let system = match system_config_path() {
        Some(path) => QuartermasterConfig::load(&path)?,
        None => QuartermasterConfig::new(),
    };
    let session = QuartermasterConfig::load(&session_config_path(data_root))?;
    resolve_settings(&system, &session, |name| std::env::var(name).ok())
}

/// Resolve settings with full precedence chain.
///
/// `env` looks up an environment variable by name; tests pass a closure over a map.
pub fn resolve_settings(
    system: &QuartermasterConfig,
    session: &QuartermasterConfig,
    env: impl Fn(&str) -> Option<String>,
) -> Result<ResolvedSettings> {
    let defaults = Settings::default();
    let mut sources = BTreeMap::new();
    let mut r = Resolver {
        env: &env,
        sources: &mut sources,
    };

    let settings = Settings {
        lock_timeout: secs(r.pick(
            "lock_timeout",
            "LOCK_TIMEOUT",
            session.lock_timeout_secs,
            system.lock_timeout_secs,
            defaults.lock_timeout.as_secs_f64(),
        )?)?,
        max_retries: r.pick(
            "max_retries",
            "MAX_RETRIES",
            session.max_retries,
            system.max_retries,
            defaults.max_retries,
        )?,
        retry_delay: secs(r.pick(
            "retry_delay",
            "RETRY_DELAY",
            session.retry_delay_secs,
            system.retry_delay_secs,
            defaults.retry_delay.as_secs_f64(),
        )?)?,
        unresponsive_threshold: secs(r.pick(
            "unresponsive_threshold",
            "UNRESPONSIVE_THRESHOLD",
            session.unresponsive_threshold_secs,
            system.unresponsive_threshold_secs,
            defaults.unresponsive_threshold.as_secs_f64(),
        )?)?,
        supervise_interval: secs(r.pick(
            "supervise_interval",
            "SUPERVISE_INTERVAL",
            session.supervise_interval_secs,
            system.supervise_interval_secs,
            defaults.supervise_interval.as_secs_f64(),
        )?)?,
        sync_interval: secs(r.pick(
            "sync_interval",
            "SYNC_INTERVAL",
            session.sync_interval_secs,
            system.sync_interval_secs,
            defaults.sync_interval.as_secs_f64(),
        )?)?,
        monitor_interval: secs(r.pick(
            "monitor_interval",
            "MONITOR_INTERVAL",
            session.monitor_interval_secs,
            system.monitor_interval_secs,
            defaults.monitor_interval.as_secs_f64(),
        )?)?,
        complexity_threshold: r.pick(
            "complexity_threshold",
            "COMPLEXITY_THRESHOLD",
            session.complexity_threshold,
            system.complexity_threshold,
            defaults.complexity_threshold,
        )?,
        coverage_drop_threshold: r.pick(
            "coverage_drop_threshold",
            "COVERAGE_DROP_THRESHOLD",
            session.coverage_drop_threshold,
            system.coverage_drop_threshold,
            defaults.coverage_drop_threshold,
        )?,
        build_time_increase_threshold: r.pick(
            "build_time_increase_threshold",
            "BUILD_TIME_INCREASE_THRESHOLD",
            session.build_time_increase_threshold,
            system.build_time_increase_threshold,
            defaults.build_time_increase_threshold,
        )?,
        error_rate_threshold: r.pick(
            "error_rate_threshold",
            "ERROR_RATE_THRESHOLD",
            session.error_rate_threshold,
            system.error_rate_threshold,
            defaults.error_rate_threshold,
        )?,
        dependency_stale_days: r.pick(
            "dependency_stale_days",
            "DEPENDENCY_STALE_DAYS",
            session.dependency_stale_days,
            system.dependency_stale_days,
            defaults.dependency_stale_days,
        )?,
        checkpoint_keep: r.pick(
            "checkpoint_keep",
            "CHECKPOINT_KEEP",
            session.checkpoint_keep.map(|v| v as usize),
            system.checkpoint_keep.map(|v| v as usize),
            defaults.checkpoint_keep,
        )?,
        command_timeout: secs(r.pick(
            "command_timeout",
            "COMMAND_TIMEOUT",
            session.command_timeout_secs,
            system.command_timeout_secs,
            defaults.command_timeout.as_secs_f64(),
        )?)?,
        categories: session
            .categories
            .clone()
            .or_else(|| system.categories.clone())
            .unwrap_or(defaults.categories),
        routing: {
            let mut routing = system.routing.clone();
            routing.extend(session.routing.clone());
            routing
        },
    };

    if settings.max_retries == 0 {
        return Err(Error::Config("MAX_RETRIES must be at least 1".to_string()));
    }

    Ok(ResolvedSettings { settings, sources })
}

struct Resolver<'a, F: Fn(&str) -> Option<String>> {
    env: &'a F,
    sources: &'a mut BTreeMap<&'static str, ValueSource>,
}

impl<F: Fn(&str) -> Option<String>> Resolver<'_, F> {
    fn pick<T: FromStr>(
        &mut self,
        key: &'static str,
        env_name: &str,
        session: Option<T>,
        system: Option<T>,
        default: T,
    ) -> Result<T> {
        if let Some(raw) = (self.env)(env_name).filter(|v| !v.trim().is_empty()) {
            let value = raw.trim().parse::<T>().map_err(|_| {
                Error::Config(format!("{} has an invalid value: {}", env_name, raw))
            })?;
            self.sources
                .insert(key, ValueSource::EnvVar(env_name.to_string()));
            return Ok(value);
        }
        let (value, source) = match (session, system) {
            (Some(v), _) => (v, ValueSource::Session),
            (None, Some(v)) => (v, ValueSource::System),
            (None, None) => (default, ValueSource::Default),
        };
        self.sources.insert(key, source);
        Ok(value)
    }
}

fn secs(value: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(value)
        .map_err(|_| Error::Config(format!("invalid duration: {}", value)))
}
