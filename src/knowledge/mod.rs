//! Knowledge correlation: which remediation actions work for which errors.
//!
//! Agents report `(error pattern, action, success, duration)` outcomes. The
//! engine accumulates them per pair in `knowledge/fix_history.json`,
//! classifies pairs into best practices and anti-patterns, finds error
//! patterns that recur across agents, and writes a central hub plus one
//! filtered insights file per worker category.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::events::{self, Severity};
use crate::models::{
    Classification, CorrelationEntry, ErrorPattern, ErrorPatterns, FixHistory, GENERAL_CATEGORY,
};
use crate::storage::{Document, Store};
use crate::{Error, Result};

/// Observations needed before a pattern is treated as global.
pub const GLOBAL_PATTERN_MIN_OCCURRENCES: u64 = 3;

/// Length of a pattern hash in hex characters.
pub const PATTERN_HASH_LEN: usize = 12;

static HEX_ADDR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"0x[0-9a-f]+").expect("Invalid regex"));
static PATH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:[a-z]:)?(?:[./~]?[\w.\-]*[/\\])+[\w.\-]+").expect("Invalid regex"));
static NUMBER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d+").expect("Invalid regex"));
static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("Invalid regex"));

/// Reduce error text to its stable shape.
///
/// Lowercases, masks hex addresses, paths and numbers, and collapses whitespace,
/// so the same failure on different files or lines hashes identically.
pub fn normalize_error(text: &str) -> String {
    let lower = text.to_lowercase();
    let masked = HEX_ADDR.replace_all(&lower, "<addr>");
    let masked = PATH.replace_all(&masked, "<path>");
    let masked = NUMBER.replace_all(&masked, "<n>");
    WHITESPACE.replace_all(masked.trim(), " ").into_owned()
}

/// Pattern hash of raw error text.
pub fn pattern_hash(text: &str) -> String {
    let digest = format!("{:x}", Sha256::digest(normalize_error(text).as_bytes()));
    digest[..PATTERN_HASH_LEN].to_string()
}

/// Accept either an existing pattern hash or raw error text.
pub fn pattern_key(pattern: &str) -> String {
    let is_hash = pattern.len() == PATTERN_HASH_LEN
        && pattern
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c));
    if is_hash {
        pattern.to_string()
    } else {
        pattern_hash(pattern)
    }
}

/// Count one occurrence of an error text.
pub fn observe(
    store: &Store,
    text: &str,
    category: Option<&str>,
    now: DateTime<Utc>,
) -> Result<ErrorPattern> {
    if text.trim().is_empty() {
        return Err(Error::InvalidInput("Error text cannot be empty".to_string()));
    }
    let hash = pattern_hash(text);
    store.update(|doc: &mut ErrorPatterns| {
        let pattern = doc
            .patterns
            .entry(hash.clone())
            .or_insert_with(|| ErrorPattern {
                hash: hash.clone(),
                sample: text.chars().take(500).collect(),
                category: GENERAL_CATEGORY.to_string(),
                occurrences: 0,
                first_seen: now,
                last_seen: now,
            });
        pattern.occurrences += 1;
        pattern.last_seen = pattern.last_seen.max(now);
        if let Some(category) = category {
            pattern.category = category.to_string();
        }
        Ok(pattern.clone())
    })
}

/// Fold one remediation outcome into the statistics for `(hash, action)`.
pub fn record_outcome(
    store: &Store,
    error_pattern_hash: &str,
    action: &str,
    success: bool,
    duration_ms: f64,
) -> Result<CorrelationEntry> {
    if action.trim().is_empty() {
        return Err(Error::InvalidInput("Action cannot be empty".to_string()));
    }
    let key = CorrelationEntry::key(error_pattern_hash, action);
    let entry = store.update(|history: &mut FixHistory| {
        let entry = history
            .0
            .entry(key)
            .or_insert_with(|| CorrelationEntry::new(error_pattern_hash, action));
        entry.record(success, duration_ms.max(0.0));
        Ok(entry.clone())
    })?;
    tracing::debug!(
        pattern = error_pattern_hash,
        action,
        success,
        rate = entry.success_rate,
        "outcome recorded"
    );
    Ok(entry)
}

/// All correlation entries for one pattern, in action order.
pub fn entries_for_pattern(store: &Store, error_pattern_hash: &str) -> Result<Vec<CorrelationEntry>> {
    let history: FixHistory = store.read()?;
    Ok(history
        .0
        .into_values()
        .filter(|e| e.error_pattern_hash == error_pattern_hash)
        .collect())
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HubMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub total_entries: usize,
    #[serde(default)]
    pub total_patterns: usize,
    #[serde(default)]
    pub sync_count: u64,
}

/// Aggregated cross-agent knowledge.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CentralHub {
    pub global_patterns: Vec<ErrorPattern>,
    pub best_practices: Vec<CorrelationEntry>,
    pub anti_patterns: Vec<CorrelationEntry>,
    pub insights: Vec<String>,
    pub metadata: HubMetadata,
}

impl Document for CentralHub {
    const NAME: &'static str = "knowledge/central_hub.json";
    const REQUIRED: &'static [&'static str] = &[
        "global_patterns",
        "best_practices",
        "anti_patterns",
        "insights",
        "metadata",
    ];
}

fn describe(entry: &CorrelationEntry) -> String {
    format!(
        "{:.0}% success over {} uses",
        entry.success_rate * 100.0,
        entry.times_used
    )
}

/// Classify every entry, pick out global patterns and rewrite the hub.
pub fn aggregate(store: &Store, now: DateTime<Utc>) -> Result<CentralHub> {
    let history: FixHistory = store.read()?;
    let patterns: ErrorPatterns = store.read()?;

    let mut best_practices = Vec::new();
    let mut anti_patterns = Vec::new();
    for entry in history.0.values() {
        match entry.classification() {
            Classification::BestPractice => best_practices.push(entry.clone()),
            Classification::AntiPattern => anti_patterns.push(entry.clone()),
            Classification::Neutral => {}
        }
    }
    best_practices.sort_by(|a, b| b.success_rate.total_cmp(&a.success_rate));
    anti_patterns.sort_by(|a, b| a.success_rate.total_cmp(&b.success_rate));

    let mut global_patterns: Vec<ErrorPattern> = patterns
        .patterns
        .values()
        .filter(|p| p.occurrences >= GLOBAL_PATTERN_MIN_OCCURRENCES)
        .cloned()
        .collect();
    global_patterns.sort_by(|a, b| b.occurrences.cmp(&a.occurrences));

    let mut insights = Vec::new();
    for entry in &best_practices {
        insights.push(format!(
            "Use '{}' for pattern {} ({})",
            entry.action,
            entry.error_pattern_hash,
            describe(entry)
        ));
    }
    for entry in &anti_patterns {
        insights.push(format!(
            "Avoid '{}' for pattern {} ({})",
            entry.action,
            entry.error_pattern_hash,
            describe(entry)
        ));
    }
    for pattern in &global_patterns {
        let sample: String = pattern.sample.chars().take(80).collect();
        insights.push(format!(
            "Pattern {} [{}] seen {} times: {}",
            pattern.hash, pattern.category, pattern.occurrences, sample
        ));
    }

    let total_entries = history.0.len();
    let total_patterns = patterns.patterns.len();
    store.update(|hub: &mut CentralHub| {
        *hub = CentralHub {
            global_patterns,
            best_practices,
            anti_patterns,
            insights,
            metadata: HubMetadata {
                generated_at: Some(now),
                total_entries,
                total_patterns,
                sync_count: hub.metadata.sync_count + 1,
            },
        };
        Ok(hub.clone())
    })
}

/// Knowledge pushed to the agents of one category.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CategoryInsights {
    pub category: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generated_at: Option<DateTime<Utc>>,
    pub best_practices: Vec<CorrelationEntry>,
    pub global_patterns: Vec<ErrorPattern>,
}

/// Path of a category's insights file relative to the data root.
pub fn insights_name(category: &str) -> Result<String> {
    let valid = !category.is_empty()
        && category
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-'));
    if !valid {
        return Err(Error::InvalidInput(format!("Invalid category {:?}", category)));
    }
    Ok(format!("knowledge/{}_insights.json", category))
}

fn is_generic(category: &str) -> bool {
    category.is_empty() || category == GENERAL_CATEGORY || category == "unknown"
}

/// Write each category's share of the hub.
///
/// A category receives the best practices and global patterns whose pattern
/// category is its own or generic. Returns the files written.
pub fn broadcast(
    store: &Store,
    hub: &CentralHub,
    categories: &[String],
    now: DateTime<Utc>,
) -> Result<Vec<String>> {
    let patterns: ErrorPatterns = store.read()?;
    let category_of = |hash: &str| -> String {
        patterns
            .patterns
            .get(hash)
            .map(|p| p.category.clone())
            .unwrap_or_default()
    };

    let mut written = Vec::new();
    for category in categories {
        let name = insights_name(category)?;
        let relevant = |pattern_category: &str| {
            pattern_category == category || is_generic(pattern_category)
        };
        let insights = CategoryInsights {
            category: category.clone(),
            generated_at: Some(now),
            best_practices: hub
                .best_practices
                .iter()
                .filter(|e| relevant(&category_of(&e.error_pattern_hash)))
                .cloned()
                .collect(),
            global_patterns: hub
                .global_patterns
                .iter()
                .filter(|p| relevant(&p.category))
                .cloned()
                .collect(),
        };
        store.update_file(&name, &[], |doc: &mut CategoryInsights| {
            *doc = insights;
            Ok(())
        })?;
        written.push(name);
    }
    Ok(written)
}

/// Summary of one sync cycle.
#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub best_practices: usize,
    pub anti_patterns: usize,
    pub global_patterns: usize,
    pub insights: usize,
    pub broadcast: Vec<String>,
}

/// Aggregate then broadcast.
///
/// Failures come back as [`Error::KnowledgeSync`] and are logged; callers
/// running in a loop simply try again next cycle.
pub fn sync(store: &Store, categories: &[String], now: DateTime<Utc>) -> Result<SyncReport> {
    let run = || -> Result<SyncReport> {
        let hub = aggregate(store, now)?;
        let broadcast = broadcast(store, &hub, categories, now)?;
        Ok(SyncReport {
            best_practices: hub.best_practices.len(),
            anti_patterns: hub.anti_patterns.len(),
            global_patterns: hub.global_patterns.len(),
            insights: hub.insights.len(),
            broadcast,
        })
    };

    match run() {
        Ok(report) => {
            tracing::info!(
                best = report.best_practices,
                anti = report.anti_patterns,
                global = report.global_patterns,
                "knowledge synced"
            );
            Ok(report)
        }
        Err(e) => {
            events::record(
                store.root(),
                Severity::Warning,
                "knowledge_sync_failed",
                &format!("Knowledge sync failed: {}", e),
                serde_json::json!({"kind": e.kind()}),
            );
            Err(Error::KnowledgeSync(e.to_string()))
        }
    }
}

/// Hub sections available to `query`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKind {
    BestPractices,
    AntiPatterns,
    GlobalPatterns,
    Insights,
}

impl std::str::FromStr for QueryKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "best_practices" => Ok(QueryKind::BestPractices),
            "anti_patterns" => Ok(QueryKind::AntiPatterns),
            "global_patterns" => Ok(QueryKind::GlobalPatterns),
            "insights" => Ok(QueryKind::Insights),
            _ => Err(format!(
                "Unknown query type: {} (expected best_practices, anti_patterns, global_patterns or insights)",
                s
            )),
        }
    }
}

/// One hub section.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum QueryResult {
    Entries(Vec<CorrelationEntry>),
    Patterns(Vec<ErrorPattern>),
    Insights(Vec<String>),
}

impl QueryResult {
    pub fn len(&self) -> usize {
        match self {
            QueryResult::Entries(v) => v.len(),
            QueryResult::Patterns(v) => v.len(),
            QueryResult::Insights(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Read one section of the last aggregated hub.
pub fn query(store: &Store, kind: QueryKind) -> Result<QueryResult> {
    let hub: CentralHub = store.read()?;
    Ok(match kind {
        QueryKind::BestPractices => QueryResult::Entries(hub.best_practices),
        QueryKind::AntiPatterns => QueryResult::Entries(hub.anti_patterns),
        QueryKind::GlobalPatterns => QueryResult::Patterns(hub.global_patterns),
        QueryKind::Insights => QueryResult::Insights(hub.insights),
    })
}

/// Create empty knowledge documents where none exist. Returns the files created.
pub fn init(store: &Store) -> Result<Vec<String>> {
    let mut created = Vec::new();
    let mut ensure = |name: &str, write: &dyn Fn() -> Result<()>| -> Result<()> {
        if !store.path(name).exists() {
            write()?;
            created.push(name.to_string());
        }
        Ok(())
    };
    ensure(ErrorPatterns::NAME, &|| store.update(|_: &mut ErrorPatterns| Ok(())))?;
    ensure(FixHistory::NAME, &|| store.update(|_: &mut FixHistory| Ok(())))?;
    ensure(CentralHub::NAME, &|| store.update(|_: &mut CentralHub| Ok(())))?;
    Ok(created)
}

/// Clear all correlation statistics. Returns how many entries were dropped.
pub fn reset(store: &Store) -> Result<usize> {
    let cleared = store.update(|history: &mut FixHistory| {
        let count = history.0.len();
        history.0 = BTreeMap::new();
        Ok(count)
    })?;
    events::record(
        store.root(),
        Severity::Info,
        "knowledge_reset",
        &format!("Cleared {} correlation entries", cleared),
        serde_json::Value::Null,
    );
    Ok(cleared)
}
