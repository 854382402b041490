//! Proactive project-health monitor.
//!
//! A monitor pass runs a fixed set of threshold checks against the project
//! tree and the shared state, records one measurement per check in a bounded
//! history, and raises alerts for breaches. At most one active alert exists
//! per alert type; alerts leave the active set only through [`resolve`].

pub mod complexity;

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::config::Settings;
use crate::events::{self, Severity};
use crate::models::{Alert, AlertSeverity, AlertStatus, Measurement, TaskQueue};
use crate::storage::{Document, Store};
use crate::{Error, Result};

/// Entries kept in the metrics history ring.
pub const METRICS_HISTORY_LIMIT: usize = 100;

/// Samples kept per reported metric.
pub const REPORTED_SAMPLES_KEPT: usize = 10;

/// Metric name workers use to report test coverage (percent).
pub const COVERAGE: &str = "coverage";

/// Metric name workers use to report build duration (seconds).
pub const BUILD_TIME: &str = "build_time";

/// Lockfiles whose age stands in for dependency freshness.
pub const LOCKFILES: &[&str] = &[
    "Cargo.lock",
    "package-lock.json",
    "yarn.lock",
    "pnpm-lock.yaml",
    "poetry.lock",
    "Pipfile.lock",
    "uv.lock",
    "go.sum",
    "Gemfile.lock",
    "composer.lock",
];

pub mod alert_types {
    pub const HIGH_COMPLEXITY: &str = "high_complexity";
    pub const COVERAGE_DROP: &str = "coverage_drop";
    pub const BUILD_TIME_REGRESSION: &str = "build_time_regression";
    pub const HIGH_ERROR_RATE: &str = "high_error_rate";
    pub const STALE_DEPENDENCIES: &str = "stale_dependencies";
}

/// Every alert ever raised, active and resolved.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AlertLog {
    pub alerts: Vec<Alert>,
}

impl Document for AlertLog {
    const NAME: &'static str = "monitor/alerts.json";
    const REQUIRED: &'static [&'static str] = &["alerts"];
}

impl AlertLog {
    pub fn active(&self, alert_type: &str) -> Option<&Alert> {
        self.alerts
            .iter()
            .find(|a| a.is_active() && a.alert_type == alert_type)
    }
}

/// Ring of the most recent check measurements, oldest first.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsHistory {
    pub measurements: Vec<Measurement>,
}

impl Document for MetricsHistory {
    const NAME: &'static str = "monitor/metrics_history.json";
    const REQUIRED: &'static [&'static str] = &["measurements"];
}

impl MetricsHistory {
    fn push(&mut self, measurement: Measurement) {
        self.measurements.push(measurement);
        if self.measurements.len() > METRICS_HISTORY_LIMIT {
            let excess = self.measurements.len() - METRICS_HISTORY_LIMIT;
            self.measurements.drain(..excess);
        }
    }
}

/// Values reported by workers, per metric, oldest first.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReportedMetrics {
    pub metrics: BTreeMap<String, Vec<Measurement>>,
}

impl Document for ReportedMetrics {
    const NAME: &'static str = "monitor/reported_metrics.json";
    const REQUIRED: &'static [&'static str] = &["metrics"];
}

impl ReportedMetrics {
    /// The two most recent samples of `metric`, as `(previous, latest)`.
    fn last_two(&self, metric: &str) -> (Option<&Measurement>, Option<&Measurement>) {
        match self.metrics.get(metric).map(Vec::as_slice) {
            Some([.., previous, latest]) => (Some(previous), Some(latest)),
            Some([latest]) => (None, Some(latest)),
            _ => (None, None),
        }
    }
}

/// Outcome of one check.
#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    pub check: String,
    /// `None` when there was nothing to measure yet.
    pub measurement: Option<Measurement>,
    /// The alert this check wants raised, if its threshold was crossed.
    pub breach: Option<Alert>,
}

impl CheckResult {
    fn new(check: &str) -> Self {
        Self {
            check: check.to_string(),
            measurement: None,
            breach: None,
        }
    }
}

fn measurement(
    metric: &str,
    value: f64,
    details: serde_json::Value,
    now: DateTime<Utc>,
) -> Measurement {
    let mut m = Measurement::new(metric, value).with_details(details);
    m.timestamp = now;
    m
}

fn alert(
    alert_type: &str,
    severity: AlertSeverity,
    message: String,
    details: serde_json::Value,
    now: DateTime<Utc>,
) -> Alert {
    let mut alert = Alert::new(alert_type, severity, message, details);
    alert.timestamp = now;
    alert
}

/// Per-file complexity against `threshold`.
pub fn check_complexity(project_root: &Path, threshold: u32, now: DateTime<Utc>) -> CheckResult {
    let mut result = CheckResult::new("complexity");
    let files = complexity::scan_tree(project_root);
    let max = files.first().map(|f| f.complexity.score).unwrap_or(0);
    let over: Vec<_> = files
        .iter()
        .filter(|f| f.complexity.exceeds(threshold))
        .collect();

    result.measurement = Some(measurement(
        "complexity",
        f64::from(max),
        json!({ "files_scanned": files.len(), "over_threshold": over.len() }),
        now,
    ));

    if let Some(worst) = over.first() {
        let severity = if max > threshold.saturating_mul(2) {
            AlertSeverity::High
        } else {
            AlertSeverity::Medium
        };
        result.breach = Some(alert(
            alert_types::HIGH_COMPLEXITY,
            severity,
            format!(
                "{} file(s) exceed complexity threshold {} (worst: {} at {})",
                over.len(),
                threshold,
                worst.path.display(),
                max
            ),
            json!({
                "threshold": threshold,
                "files": over.iter().take(10).collect::<Vec<_>>(),
            }),
            now,
        ));
    }
    result
}

/// Drop in reported coverage, in percentage points.
pub fn check_coverage(reported: &ReportedMetrics, threshold: f64, now: DateTime<Utc>) -> CheckResult {
    let mut result = CheckResult::new("coverage");
    let (previous, latest) = reported.last_two(COVERAGE);
    let Some(latest) = latest else {
        return result;
    };
    let drop = previous.map(|p| p.value - latest.value);
    result.measurement = Some(measurement(
        COVERAGE,
        latest.value,
        json!({ "previous": previous.map(|p| p.value), "drop": drop }),
        now,
    ));

    if let (Some(previous), Some(drop)) = (previous, drop) {
        if drop > threshold {
            result.breach = Some(alert(
                alert_types::COVERAGE_DROP,
                AlertSeverity::High,
                format!(
                    "Coverage dropped {:.1} points ({:.1}% -> {:.1}%)",
                    drop, previous.value, latest.value
                ),
                json!({
                    "previous": previous.value,
                    "latest": latest.value,
                    "drop": drop,
                    "threshold": threshold,
                }),
                now,
            ));
        }
    }
    result
}

/// Increase in reported build time, in percent over the previous report.
pub fn check_build_time(
    reported: &ReportedMetrics,
    threshold: f64,
    now: DateTime<Utc>,
) -> CheckResult {
    let mut result = CheckResult::new("build_time");
    let (previous, latest) = reported.last_two(BUILD_TIME);
    let Some(latest) = latest else {
        return result;
    };
    let increase = previous
        .filter(|p| p.value > 0.0)
        .map(|p| (latest.value - p.value) / p.value * 100.0);
    result.measurement = Some(measurement(
        BUILD_TIME,
        latest.value,
        json!({ "previous": previous.map(|p| p.value), "increase_percent": increase }),
        now,
    ));

    if let (Some(previous), Some(increase)) = (previous, increase) {
        if increase > threshold {
            result.breach = Some(alert(
                alert_types::BUILD_TIME_REGRESSION,
                AlertSeverity::Medium,
                format!(
                    "Build time rose {:.0}% ({:.1}s -> {:.1}s)",
                    increase, previous.value, latest.value
                ),
                json!({
                    "previous": previous.value,
                    "latest": latest.value,
                    "increase_percent": increase,
                    "threshold": threshold,
                }),
                now,
            ));
        }
    }
    result
}

/// Failed tasks plus error-level monitoring events over the last day.
pub fn check_error_rate(store: &Store, threshold: u32, now: DateTime<Utc>) -> Result<CheckResult> {
    let mut result = CheckResult::new("error_rate");
    let since = now - Duration::hours(24);

    let queue: TaskQueue = store.read()?;
    let failed_tasks = queue
        .failed
        .iter()
        .filter(|t| t.last_touched() >= since)
        .count();
    let error_events = events::events_since(store.root(), since)?
        .iter()
        .filter(|e| e.severity.is_error())
        .count();
    let total = failed_tasks + error_events;

    result.measurement = Some(measurement(
        "error_rate",
        total as f64,
        json!({ "failed_tasks": failed_tasks, "error_events": error_events }),
        now,
    ));
    if total > threshold as usize {
        result.breach = Some(alert(
            alert_types::HIGH_ERROR_RATE,
            AlertSeverity::High,
            format!("{} errors in the last 24h (threshold {})", total, threshold),
            json!({
                "failed_tasks": failed_tasks,
                "error_events": error_events,
                "threshold": threshold,
            }),
            now,
        ));
    }
    Ok(result)
}

/// Age of the project's lockfiles against `stale_days`.
pub fn check_dependencies(project_root: &Path, stale_days: u32, now: DateTime<Utc>) -> CheckResult {
    let mut result = CheckResult::new("dependencies");
    let ages: BTreeMap<&str, i64> = LOCKFILES
        .iter()
        .filter_map(|name| {
            let modified = std::fs::metadata(project_root.join(name))
                .and_then(|m| m.modified())
                .ok()?;
            let age = now - DateTime::<Utc>::from(modified);
            Some((*name, age.num_days().max(0)))
        })
        .collect();
    let Some(oldest) = ages.values().copied().max() else {
        return result;
    };

    result.measurement = Some(measurement(
        "dependency_age_days",
        oldest as f64,
        json!({ "lockfiles": ages }),
        now,
    ));
    let stale: Vec<&str> = ages
        .iter()
        .filter(|(_, age)| **age > i64::from(stale_days))
        .map(|(name, _)| *name)
        .collect();
    if !stale.is_empty() {
        result.breach = Some(alert(
            alert_types::STALE_DEPENDENCIES,
            AlertSeverity::Low,
            format!(
                "{} not updated in over {} days",
                stale.join(", "),
                stale_days
            ),
            json!({ "lockfiles": ages, "threshold_days": stale_days }),
            now,
        ));
    }
    result
}

/// Summary of one monitor pass.
#[derive(Debug, Clone, Serialize)]
pub struct MonitorReport {
    pub checks: Vec<CheckResult>,
    /// Alerts created by this pass.
    pub raised: Vec<Alert>,
    /// Breached alert types that already had an active alert.
    pub suppressed: Vec<String>,
    pub active_alerts: usize,
}

/// Run every check once, record measurements and raise new alerts.
pub fn run(
    store: &Store,
    project_root: &Path,
    settings: &Settings,
    now: DateTime<Utc>,
) -> Result<MonitorReport> {
    let reported: ReportedMetrics = store.read()?;
    let checks = vec![
        check_complexity(project_root, settings.complexity_threshold, now),
        check_coverage(&reported, settings.coverage_drop_threshold, now),
        check_build_time(&reported, settings.build_time_increase_threshold, now),
        check_error_rate(store, settings.error_rate_threshold, now)?,
        check_dependencies(project_root, settings.dependency_stale_days, now),
    ];

    store.update(|history: &mut MetricsHistory| {
        for m in checks.iter().filter_map(|c| c.measurement.clone()) {
            history.push(m);
        }
        Ok(())
    })?;

    let (raised, suppressed, active_alerts) = store.update(|log: &mut AlertLog| {
        let mut raised = Vec::new();
        let mut suppressed = Vec::new();
        for breach in checks.iter().filter_map(|c| c.breach.as_ref()) {
            if log.active(&breach.alert_type).is_some() {
                suppressed.push(breach.alert_type.clone());
            } else {
                log.alerts.push(breach.clone());
                raised.push(breach.clone());
            }
        }
        let active = log.alerts.iter().filter(|a| a.is_active()).count();
        Ok((raised, suppressed, active))
    })?;

    for alert in &raised {
        events::record(
            store.root(),
            Severity::Warning,
            "alert_raised",
            &alert.message,
            json!({ "alert_id": alert.id, "type": alert.alert_type, "severity": alert.severity }),
        );
    }
    tracing::debug!(
        raised = raised.len(),
        suppressed = suppressed.len(),
        "monitor pass complete"
    );

    Ok(MonitorReport {
        checks,
        raised,
        suppressed,
        active_alerts,
    })
}

/// Current monitor state.
#[derive(Debug, Clone, Serialize)]
pub struct MonitorStatus {
    pub active_alerts: usize,
    pub resolved_alerts: usize,
    pub last_run: Option<DateTime<Utc>>,
    pub history_size: usize,
    /// Most recent measurement per metric.
    pub latest: BTreeMap<String, Measurement>,
}

pub fn status(store: &Store) -> Result<MonitorStatus> {
    let log: AlertLog = store.read()?;
    let history: MetricsHistory = store.read()?;
    let mut latest = BTreeMap::new();
    for m in &history.measurements {
        latest.insert(m.metric.clone(), m.clone());
    }
    let active_alerts = log.alerts.iter().filter(|a| a.is_active()).count();
    Ok(MonitorStatus {
        active_alerts,
        resolved_alerts: log.alerts.len() - active_alerts,
        last_run: history.measurements.iter().map(|m| m.timestamp).max(),
        history_size: history.measurements.len(),
        latest,
    })
}

/// Active alerts, or every alert when `all` is set. Newest first.
pub fn alerts(store: &Store, all: bool) -> Result<Vec<Alert>> {
    let log: AlertLog = store.read()?;
    let mut alerts: Vec<Alert> = log
        .alerts
        .into_iter()
        .filter(|a| all || a.is_active())
        .collect();
    alerts.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    Ok(alerts)
}

/// Mark an alert resolved.
pub fn resolve(store: &Store, id: &str, now: DateTime<Utc>) -> Result<Alert> {
    let resolved = store.update(|log: &mut AlertLog| {
        let alert = log
            .alerts
            .iter_mut()
            .find(|a| a.id == id)
            .ok_or_else(|| Error::NotFound(format!("alert {}", id)))?;
        if !alert.is_active() {
            return Err(Error::InvalidInput(format!(
                "Alert {} is already resolved",
                id
            )));
        }
        alert.status = AlertStatus::Resolved;
        alert.resolved_at = Some(now);
        Ok(alert.clone())
    })?;
    events::record(
        store.root(),
        Severity::Info,
        "alert_resolved",
        &format!("Resolved {} alert {}", resolved.alert_type, resolved.id),
        json!({ "alert_id": resolved.id }),
    );
    Ok(resolved)
}

/// Record a worker-reported metric value.
pub fn report_metric(
    store: &Store,
    metric: &str,
    value: f64,
    now: DateTime<Utc>,
) -> Result<Measurement> {
    let metric = metric.trim();
    if metric.is_empty() {
        return Err(Error::InvalidInput("Metric name cannot be empty".to_string()));
    }
    if !value.is_finite() || value < 0.0 {
        return Err(Error::InvalidInput(format!(
            "Metric value must be a non-negative number, got {}",
            value
        )));
    }
    let mut sample = Measurement::new(metric, value);
    sample.timestamp = now;
    let stored = sample.clone();
    store.update(move |reported: &mut ReportedMetrics| {
        let samples = reported.metrics.entry(stored.metric.clone()).or_default();
        samples.push(stored);
        if samples.len() > REPORTED_SAMPLES_KEPT {
            let excess = samples.len() - REPORTED_SAMPLES_KEPT;
            samples.drain(..excess);
        }
        Ok(())
    })?;
    Ok(sample)
}

/// Create the monitor's documents if missing. Returns the ones created.
pub fn init(store: &Store) -> Result<Vec<String>> {
    let mut created = Vec::new();
    if !store.path(AlertLog::NAME).exists() {
        store.update(|_: &mut AlertLog| Ok(()))?;
        created.push(AlertLog::NAME.to_string());
    }
    if !store.path(MetricsHistory::NAME).exists() {
        store.update(|_: &mut MetricsHistory| Ok(()))?;
        created.push(MetricsHistory::NAME.to_string());
    }
    if !store.path(ReportedMetrics::NAME).exists() {
        store.update(|_: &mut ReportedMetrics| Ok(()))?;
        created.push(ReportedMetrics::NAME.to_string());
    }
    Ok(created)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Task;
    use crate::test_utils::TestEnv;
    use std::fs;

    fn quiet_settings(env: &TestEnv) -> Settings {
        Settings {
            complexity_threshold: 1000,
            ..env.settings()
        }
    }

    fn busy_source() -> String {
        let mut src = String::from("fn busy(x: u32) {\n");
        for _ in 0..12 {
            src.push_str("    if x > 1 && x < 9 { }\n");
        }
        src.push_str("}\n");
        src
    }

    #[test]
    fn test_init_is_idempotent() {
        let env = TestEnv::new();
        let store = env.store();
        assert_eq!(init(&store).unwrap().len(), 3);
        assert!(init(&store).unwrap().is_empty());
    }

    #[test]
    fn test_clean_project_raises_nothing() {
        let env = TestEnv::new();
        let store = env.store();
        fs::write(env.project_path().join("main.rs"), "fn main() {}\n").unwrap();

        let report = run(&store, env.project_path(), &env.settings(), Utc::now()).unwrap();
        assert!(report.raised.is_empty());
        assert_eq!(report.active_alerts, 0);
        // complexity and error_rate always measure; the rest have no data.
        let history: MetricsHistory = store.read().unwrap();
        assert_eq!(history.measurements.len(), 2);
    }

    #[test]
    fn test_alert_persists_until_resolved() {
        let env = TestEnv::new();
        let store = env.store();
        fs::write(env.project_path().join("busy.rs"), busy_source()).unwrap();
        let settings = env.settings();

        let first = run(&store, env.project_path(), &settings, Utc::now()).unwrap();
        assert_eq!(first.raised.len(), 1);
        assert_eq!(first.raised[0].alert_type, alert_types::HIGH_COMPLEXITY);
        let id = first.raised[0].id.clone();

        // Still breaching: no duplicate, original stays active.
        let second = run(&store, env.project_path(), &settings, Utc::now()).unwrap();
        assert!(second.raised.is_empty());
        assert_eq!(second.suppressed, vec![alert_types::HIGH_COMPLEXITY]);
        assert_eq!(alerts(&store, false).unwrap().len(), 1);

        // Fixing the file does not auto-resolve.
        fs::write(env.project_path().join("busy.rs"), "fn calm() {}\n").unwrap();
        let third = run(&store, env.project_path(), &settings, Utc::now()).unwrap();
        assert!(third.raised.is_empty());
        assert_eq!(third.active_alerts, 1);

        let resolved = resolve(&store, &id, Utc::now()).unwrap();
        assert_eq!(resolved.status, AlertStatus::Resolved);
        assert!(resolved.resolved_at.is_some());
        assert!(alerts(&store, false).unwrap().is_empty());
        assert_eq!(alerts(&store, true).unwrap().len(), 1);

        // A new breach after resolution raises a fresh alert.
        fs::write(env.project_path().join("busy.rs"), busy_source()).unwrap();
        let fourth = run(&store, env.project_path(), &settings, Utc::now()).unwrap();
        assert_eq!(fourth.raised.len(), 1);
        assert_ne!(fourth.raised[0].id, id);
    }

    #[test]
    fn test_resolve_unknown_and_twice() {
        let env = TestEnv::new();
        let store = env.store();
        assert!(matches!(
            resolve(&store, "alert_missing", Utc::now()),
            Err(Error::NotFound(_))
        ));

        fs::write(env.project_path().join("busy.rs"), busy_source()).unwrap();
        let report = run(&store, env.project_path(), &env.settings(), Utc::now()).unwrap();
        let id = report.raised[0].id.clone();
        resolve(&store, &id, Utc::now()).unwrap();
        assert!(matches!(
            resolve(&store, &id, Utc::now()),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_coverage_drop() {
        let env = TestEnv::new();
        let store = env.store();
        let settings = quiet_settings(&env);

        report_metric(&store, COVERAGE, 82.0, Utc::now()).unwrap();
        let report = run(&store, env.project_path(), &settings, Utc::now()).unwrap();
        assert!(report.raised.is_empty());

        // 82 -> 79 is within the 5 point default.
        report_metric(&store, COVERAGE, 79.0, Utc::now()).unwrap();
        let report = run(&store, env.project_path(), &settings, Utc::now()).unwrap();
        assert!(report.raised.is_empty());

        report_metric(&store, COVERAGE, 70.0, Utc::now()).unwrap();
        let report = run(&store, env.project_path(), &settings, Utc::now()).unwrap();
        assert_eq!(report.raised.len(), 1);
        assert_eq!(report.raised[0].alert_type, alert_types::COVERAGE_DROP);
        assert_eq!(report.raised[0].severity, AlertSeverity::High);
    }

    #[test]
    fn test_build_time_regression() {
        let reported = ReportedMetrics {
            metrics: BTreeMap::from([(
                BUILD_TIME.to_string(),
                vec![Measurement::new(BUILD_TIME, 100.0), Measurement::new(BUILD_TIME, 125.0)],
            )]),
        };
        let result = check_build_time(&reported, 20.0, Utc::now());
        let breach = result.breach.unwrap();
        assert_eq!(breach.alert_type, alert_types::BUILD_TIME_REGRESSION);
        assert_eq!(breach.details["increase_percent"], 25.0);

        assert!(check_build_time(&reported, 30.0, Utc::now()).breach.is_none());
    }

    #[test]
    fn test_build_time_from_zero_is_not_a_regression() {
        let reported = ReportedMetrics {
            metrics: BTreeMap::from([(
                BUILD_TIME.to_string(),
                vec![Measurement::new(BUILD_TIME, 0.0), Measurement::new(BUILD_TIME, 40.0)],
            )]),
        };
        let result = check_build_time(&reported, 20.0, Utc::now());
        assert!(result.breach.is_none());
        assert_eq!(result.measurement.unwrap().value, 40.0);
    }

    #[test]
    fn test_error_rate_counts_failures_and_error_events() {
        let env = TestEnv::new();
        let store = env.store();
        let now = Utc::now();

        store
            .update(|queue: &mut TaskQueue| {
                for i in 0..2 {
                    let mut task = Task::new(
                        format!("task_{}", i),
                        "build".to_string(),
                        "a1".to_string(),
                    );
                    task.completed_at = Some(now);
                    queue.failed.push(task);
                }
                let mut old = Task::new(
                    "task_old".to_string(),
                    "build".to_string(),
                    "a1".to_string(),
                );
                old.created_at = now - Duration::days(3);
                old.completed_at = Some(now - Duration::days(2));
                queue.failed.push(old);
                Ok(())
            })
            .unwrap();
        events::record(store.root(), Severity::Error, "boom", "boom", json!(null));
        events::record(store.root(), Severity::Info, "fine", "fine", json!(null));

        let result = check_error_rate(&store, 2, now).unwrap();
        let m = result.measurement.unwrap();
        assert_eq!(m.value, 3.0);
        assert_eq!(m.details.unwrap()["failed_tasks"], 2);
        assert!(result.breach.is_some());

        assert!(check_error_rate(&store, 3, now).unwrap().breach.is_none());
    }

    #[test]
    fn test_stale_lockfile() {
        let env = TestEnv::new();
        fs::write(env.project_path().join("Cargo.lock"), "").unwrap();

        let fresh = check_dependencies(env.project_path(), 30, Utc::now());
        assert!(fresh.breach.is_none());
        assert_eq!(fresh.measurement.unwrap().value, 0.0);

        // Pretend 45 days have passed.
        let later = Utc::now() + Duration::days(45);
        let stale = check_dependencies(env.project_path(), 30, later);
        let breach = stale.breach.unwrap();
        assert_eq!(breach.alert_type, alert_types::STALE_DEPENDENCIES);
        assert!(breach.message.contains("Cargo.lock"));
    }

    #[test]
    fn test_no_lockfiles_measures_nothing() {
        let env = TestEnv::new();
        let result = check_dependencies(env.project_path(), 30, Utc::now());
        assert!(result.measurement.is_none());
        assert!(result.breach.is_none());
    }

    #[test]
    fn test_history_is_bounded() {
        let env = TestEnv::new();
        let store = env.store();
        let settings = quiet_settings(&env);
        for _ in 0..60 {
            run(&store, env.project_path(), &settings, Utc::now()).unwrap();
        }
        let history: MetricsHistory = store.read().unwrap();
        assert_eq!(history.measurements.len(), METRICS_HISTORY_LIMIT);
    }

    #[test]
    fn test_report_metric_validation_and_retention() {
        let env = TestEnv::new();
        let store = env.store();
        assert!(matches!(
            report_metric(&store, " ", 1.0, Utc::now()),
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            report_metric(&store, COVERAGE, f64::NAN, Utc::now()),
            Err(Error::InvalidInput(_))
        ));

        for i in 0..15 {
            report_metric(&store, BUILD_TIME, i as f64, Utc::now()).unwrap();
        }
        let reported: ReportedMetrics = store.read().unwrap();
        let samples = &reported.metrics[BUILD_TIME];
        assert_eq!(samples.len(), REPORTED_SAMPLES_KEPT);
        assert_eq!(samples.last().unwrap().value, 14.0);
    }

    #[test]
    fn test_status_reports_latest_measurements() {
        let env = TestEnv::new();
        let store = env.store();
        let empty = status(&store).unwrap();
        assert!(empty.last_run.is_none());

        report_metric(&store, COVERAGE, 90.0, Utc::now()).unwrap();
        run(&store, env.project_path(), &quiet_settings(&env), Utc::now()).unwrap();
        let current = status(&store).unwrap();
        assert!(current.last_run.is_some());
        assert_eq!(current.latest[COVERAGE].value, 90.0);
        assert!(current.latest.contains_key("error_rate"));
    }
}
