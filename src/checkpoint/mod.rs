//! Checkpoints and rollback for risky operations.
//!
//! A checkpoint mirrors the byte contents of a set of paths under
//! `checkpoints/<operation>_<timestamp>/files/`, records size and SHA-256 per
//! file, and (inside a git repository) the current revision and uncommitted
//! diff. Paths that did not exist when the checkpoint was taken are recorded
//! too, so restoring removes them again.

pub mod vcs;

use std::collections::BTreeSet;
use std::fs;
use std::io::{BufRead, IsTerminal, Write};
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::events::{self, Severity};
use crate::models::{ActionTaken, FailureHistory, FailureRecord};
use crate::storage::{Store, find_git_root, write_atomic, write_json_atomic};
use crate::{Error, Result, knowledge};

/// Directory under the data root holding all checkpoints.
pub const CHECKPOINTS_DIR: &str = "checkpoints";

const METADATA_FILE: &str = "metadata.json";
const GIT_COMMIT_FILE: &str = "git_commit";
const GIT_DIFF_FILE: &str = "git_diff.patch";

/// Age after which a checkpoint directory without metadata counts as abandoned.
pub const INCOMPLETE_GRACE: Duration = Duration::from_secs(600);

/// One snapshotted path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Absolute path in the project
    pub path: PathBuf,
    /// Mirror location relative to the checkpoint's `files/` directory
    pub snapshot: PathBuf,
    pub existed: bool,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub sha256: String,
}

/// Contents of `metadata.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    pub id: String,
    pub operation_id: String,
    pub created_at: DateTime<Utc>,
    pub project_root: PathBuf,
    pub files: Vec<FileEntry>,
    /// Directories that were walked; restore prunes files added under them
    #[serde(default)]
    pub directories: Vec<PathBuf>,
    pub files_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_commit: Option<String>,
    #[serde(default)]
    pub has_diff: bool,
}

/// Handle on a stored checkpoint.
#[derive(Debug, Clone, Serialize)]
pub struct Checkpoint {
    #[serde(skip)]
    pub id: String,
    pub dir: PathBuf,
    #[serde(flatten)]
    pub metadata: CheckpointMetadata,
}

fn validate_operation_id(operation_id: &str) -> Result<()> {
    let valid = !operation_id.is_empty()
        && operation_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
        && !operation_id.starts_with('.');
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidInput(format!(
            "Invalid operation id {:?}",
            operation_id
        )))
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Where a project path is mirrored inside `files/`.
fn mirror_path(project_root: &Path, path: &Path) -> PathBuf {
    match path.strip_prefix(project_root) {
        Ok(rel) => rel.to_path_buf(),
        Err(_) => {
            let mut mirrored = PathBuf::from("_external");
            for component in path.components() {
                if let Component::Normal(part) = component {
                    mirrored.push(part);
                }
            }
            mirrored
        }
    }
}

fn snapshot_file(files_dir: &Path, project_root: &Path, path: &Path) -> Result<FileEntry> {
    let snapshot = mirror_path(project_root, path);
    let bytes = fs::read(path)?;
    let target = files_dir.join(&snapshot);
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&target, &bytes)?;
    Ok(FileEntry {
        path: path.to_path_buf(),
        snapshot,
        existed: true,
        size: bytes.len() as u64,
        sha256: sha256_hex(&bytes),
    })
}

/// Snapshot `paths` (files or directories, relative to `project_root`) before `operation_id`.
pub fn create(
    store: &Store,
    project_root: &Path,
    operation_id: &str,
    paths: &[PathBuf],
    command_timeout: Duration,
    now: DateTime<Utc>,
) -> Result<Checkpoint> {
    validate_operation_id(operation_id)?;
    if paths.is_empty() {
        return Err(Error::InvalidInput(
            "At least one path is required".to_string(),
        ));
    }
    let project_root = project_root
        .canonicalize()
        .unwrap_or_else(|_| project_root.to_path_buf());

    let base = store.path(CHECKPOINTS_DIR);
    fs::create_dir_all(&base)?;
    let stamp = now.format("%Y%m%d_%H%M%S_%3f").to_string();
    let mut id = format!("{}_{}", operation_id, stamp);
    let mut suffix = 1;
    while base.join(&id).exists() {
        id = format!("{}_{}_{}", operation_id, stamp, suffix);
        suffix += 1;
    }
    let dir = base.join(&id);
    fs::create_dir_all(dir.join("files"))?;

    match populate(&dir, &id, operation_id, &project_root, paths, command_timeout, now) {
        Ok(metadata) => {
            tracing::info!(checkpoint = %id, files = metadata.files_count, "checkpoint created");
            Ok(Checkpoint { id, dir, metadata })
        }
        Err(e) => {
            if let Err(cleanup) = fs::remove_dir_all(&dir) {
                tracing::warn!(checkpoint = %id, error = %cleanup, "failed to remove incomplete checkpoint");
            }
            Err(e)
        }
    }
}

fn populate(
    dir: &Path,
    id: &str,
    operation_id: &str,
    project_root: &Path,
    paths: &[PathBuf],
    command_timeout: Duration,
    now: DateTime<Utc>,
) -> Result<CheckpointMetadata> {
    let files_dir = dir.join("files");
    let mut files = Vec::new();
    let mut directories = Vec::new();
    let mut seen = BTreeSet::new();
    for raw in paths {
        let path = if raw.is_absolute() {
            raw.clone()
        } else {
            project_root.join(raw)
        };
        if path.is_dir() {
            directories.push(path.clone());
            for entry in WalkDir::new(&path)
                .follow_links(false)
                .into_iter()
                .filter_entry(|e| e.file_name() != ".git")
            {
                let entry = entry.map_err(|e| Error::Other(e.to_string()))?;
                if entry.file_type().is_file() && seen.insert(entry.path().to_path_buf()) {
                    files.push(snapshot_file(&files_dir, project_root, entry.path())?);
                }
            }
        } else if path.is_file() {
            if seen.insert(path.clone()) {
                files.push(snapshot_file(&files_dir, project_root, &path)?);
            }
        } else if seen.insert(path.clone()) {
            files.push(FileEntry {
                snapshot: mirror_path(project_root, &path),
                path,
                existed: false,
                size: 0,
                sha256: String::new(),
            });
        }
    }

    let mut git_commit = None;
    let mut has_diff = false;
    if let Some(repo) = find_git_root(project_root) {
        git_commit = vcs::head_revision(&repo, command_timeout)?;
        fs::write(
            dir.join(GIT_COMMIT_FILE),
            git_commit.as_deref().unwrap_or(""),
        )?;
        let diff = vcs::uncommitted_diff(&repo, command_timeout)?;
        has_diff = diff.is_some();
        fs::write(dir.join(GIT_DIFF_FILE), diff.unwrap_or_default())?;
    }

    let metadata = CheckpointMetadata {
        id: id.to_string(),
        operation_id: operation_id.to_string(),
        created_at: now,
        project_root: project_root.to_path_buf(),
        files_count: files.iter().filter(|f| f.existed).count(),
        files,
        directories,
        git_commit,
        has_diff,
    };
    // Metadata last: a checkpoint without it is incomplete and ignored.
    write_json_atomic(&dir.join(METADATA_FILE), &metadata)?;
    Ok(metadata)
}

/// Load a checkpoint by id.
pub fn load(store: &Store, id: &str) -> Result<Checkpoint> {
    validate_operation_id(id)?;
    let dir = store.path(CHECKPOINTS_DIR).join(id);
    let raw = match fs::read_to_string(dir.join(METADATA_FILE)) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(Error::NotFound(format!("Checkpoint {}", id)));
        }
        Err(e) => return Err(e.into()),
    };
    let metadata: CheckpointMetadata =
        serde_json::from_str(&raw).map_err(|e| Error::CorruptDocument {
            document: format!("{}/{}/{}", CHECKPOINTS_DIR, id, METADATA_FILE),
            reason: e.to_string(),
        })?;
    Ok(Checkpoint {
        id: id.to_string(),
        dir,
        metadata,
    })
}

/// All complete checkpoints, newest first.
pub fn list(store: &Store) -> Result<Vec<Checkpoint>> {
    let base = store.path(CHECKPOINTS_DIR);
    let entries = match fs::read_dir(&base) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut checkpoints = Vec::new();
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        match load(store, &name) {
            Ok(checkpoint) => checkpoints.push(checkpoint),
            Err(e) => tracing::debug!(checkpoint = %name, "skipping: {}", e),
        }
    }
    checkpoints.sort_by(|a, b| {
        b.metadata
            .created_at
            .cmp(&a.metadata.created_at)
            .then_with(|| b.id.cmp(&a.id))
    });
    Ok(checkpoints)
}

/// Delete all but the `keep` newest checkpoints. Returns the deleted ids.
///
/// Directories left without metadata by an interrupted `create` are removed
/// too once they are older than [`INCOMPLETE_GRACE`].
pub fn cleanup(store: &Store, keep: usize) -> Result<Vec<String>> {
    let mut removed = remove_incomplete(store)?;
    for checkpoint in list(store)?.into_iter().skip(keep) {
        fs::remove_dir_all(&checkpoint.dir)?;
        removed.push(checkpoint.id);
    }
    if !removed.is_empty() {
        tracing::info!(count = removed.len(), "old checkpoints removed");
    }
    Ok(removed)
}

fn remove_incomplete(store: &Store) -> Result<Vec<String>> {
    let base = store.path(CHECKPOINTS_DIR);
    let entries = match fs::read_dir(&base) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut removed = Vec::new();
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if !entry.file_type()?.is_dir() || path.join(METADATA_FILE).exists() {
            continue;
        }
        // A younger directory may still be filled by a concurrent create.
        let age = entry
            .metadata()?
            .modified()?
            .elapsed()
            .unwrap_or_default();
        if age < INCOMPLETE_GRACE {
            continue;
        }
        fs::remove_dir_all(&path)?;
        let name = entry.file_name().to_string_lossy().to_string();
        tracing::info!(checkpoint = %name, "incomplete checkpoint removed");
        removed.push(name);
    }
    Ok(removed)
}

/// Asks the operator before a destructive restore.
pub trait Confirm {
    fn confirm(&mut self, prompt: &str) -> Result<bool>;
}

/// Prompts on the terminal; declines when stdin is not interactive.
#[derive(Debug, Default)]
pub struct TerminalConfirm;

impl Confirm for TerminalConfirm {
    fn confirm(&mut self, prompt: &str) -> Result<bool> {
        let stdin = std::io::stdin();
        if !stdin.is_terminal() {
            return Ok(false);
        }
        eprint!("{} [y/N] ", prompt);
        std::io::stderr().flush()?;
        let mut answer = String::new();
        stdin.lock().read_line(&mut answer)?;
        Ok(matches!(answer.trim().to_lowercase().as_str(), "y" | "yes"))
    }
}

/// Never confirms; used for non-interactive callers.
#[derive(Debug, Default)]
pub struct Decline;

impl Confirm for Decline {
    fn confirm(&mut self, _prompt: &str) -> Result<bool> {
        Ok(false)
    }
}

/// Options for [`restore`].
#[derive(Debug, Clone, Default)]
pub struct RestoreOptions {
    /// Skip the confirmation prompt
    pub force: bool,
    /// Also reverse-apply the captured uncommitted diff
    pub reverse_diff: bool,
    pub command_timeout: Duration,
}

/// What a restore changed.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RestoreReport {
    pub checkpoint_id: String,
    pub restored: Vec<PathBuf>,
    pub removed: Vec<PathBuf>,
    pub diff_reversed: bool,
}

/// Restore every recorded path to its checkpointed contents.
///
/// Without `force` the operator must confirm. Any failure after that point is
/// a [`Error::RollbackFailure`] and is logged as critical.
pub fn restore(
    store: &Store,
    checkpoint: &Checkpoint,
    options: &RestoreOptions,
    confirm: &mut dyn Confirm,
) -> Result<RestoreReport> {
    if !options.force {
        let prompt = format!(
            "Restore {} file(s) from checkpoint {}?",
            checkpoint.metadata.files.len(),
            checkpoint.id
        );
        if !confirm.confirm(&prompt)? {
            return Err(Error::ConfirmationRequired(format!(
                "restore of {} was not confirmed (use --force)",
                checkpoint.id
            )));
        }
    }

    match restore_files(checkpoint, options) {
        Ok(report) => {
            events::record(
                store.root(),
                Severity::Info,
                "checkpoint_restored",
                &format!("Restored checkpoint {}", checkpoint.id),
                serde_json::json!({
                    "checkpoint": checkpoint.id,
                    "restored": report.restored.len(),
                    "removed": report.removed.len(),
                }),
            );
            Ok(report)
        }
        Err(e) => {
            let message = format!("checkpoint {}: {}", checkpoint.id, e);
            events::record(
                store.root(),
                Severity::Critical,
                "rollback_failed",
                &format!("Rollback failed for {}", message),
                serde_json::json!({"checkpoint": checkpoint.id, "error": e.to_string()}),
            );
            Err(Error::RollbackFailure(message))
        }
    }
}

fn restore_files(checkpoint: &Checkpoint, options: &RestoreOptions) -> Result<RestoreReport> {
    let files_dir = checkpoint.dir.join("files");
    let mut report = RestoreReport {
        checkpoint_id: checkpoint.id.clone(),
        ..Default::default()
    };

    for entry in &checkpoint.metadata.files {
        if entry.existed {
            let bytes = fs::read(files_dir.join(&entry.snapshot))?;
            if sha256_hex(&bytes) != entry.sha256 {
                return Err(Error::Other(format!(
                    "snapshot of {} does not match its recorded checksum",
                    entry.path.display()
                )));
            }
            write_atomic(&entry.path, &bytes)?;
            report.restored.push(entry.path.clone());
        } else if entry.path.is_file() {
            fs::remove_file(&entry.path)?;
            report.removed.push(entry.path.clone());
        }
    }

    let known: BTreeSet<&Path> = checkpoint
        .metadata
        .files
        .iter()
        .map(|f| f.path.as_path())
        .collect();
    for dir in &checkpoint.metadata.directories {
        if !dir.is_dir() {
            continue;
        }
        let added: Vec<PathBuf> = WalkDir::new(dir)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| e.file_name() != ".git")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file() && !known.contains(e.path()))
            .map(|e| e.path().to_path_buf())
            .collect();
        for path in added {
            fs::remove_file(&path)?;
            report.removed.push(path);
        }
    }

    if options.reverse_diff && checkpoint.metadata.has_diff {
        let repo = find_git_root(&checkpoint.metadata.project_root).ok_or_else(|| {
            Error::Other("checkpoint has a diff but the project is no longer a git repository".to_string())
        })?;
        vcs::reverse_apply(
            &repo,
            &checkpoint.dir.join(GIT_DIFF_FILE),
            options.command_timeout,
        )?;
        report.diff_reversed = true;
    }

    Ok(report)
}

/// Per-layer validation result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerResult {
    pub name: String,
    pub passed: bool,
    #[serde(default)]
    pub reason: String,
}

/// Result reported by a validation pipeline after a risky step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub overall_passed: bool,
    #[serde(default)]
    pub layers: Vec<LayerResult>,
    /// Error text or pattern hash the step was remediating
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_pattern: Option<String>,
    /// Remediation action that was attempted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<f64>,
}

impl ValidationResult {
    /// First failing layer and its reason.
    pub fn first_failure(&self) -> (String, String) {
        self.layers
            .iter()
            .find(|l| !l.passed)
            .map(|l| (l.name.clone(), l.reason.clone()))
            .unwrap_or_else(|| ("overall".to_string(), "validation failed".to_string()))
    }
}

/// Outcome of [`monitor_validation`].
#[derive(Debug, Clone, Serialize)]
pub struct ValidationOutcome {
    pub checkpoint_id: String,
    pub passed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_layer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action_taken: Option<ActionTaken>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restore: Option<RestoreReport>,
}

impl ValidationOutcome {
    /// Error to surface when the failure was left for an operator.
    pub fn manual_intervention_error(&self) -> Option<Error> {
        if self.action_taken != Some(ActionTaken::ManualInterventionNeeded) {
            return None;
        }
        Some(Error::ValidationFailure {
            layer: self.failed_layer.clone().unwrap_or_default(),
            reason: self.reason.clone().unwrap_or_default(),
        })
    }
}

/// React to a validation result for the step guarded by `checkpoint`.
///
/// A failure is logged, optionally rolled back, and appended to the failure
/// history. When the result names an error pattern and action the outcome
/// is fed to the correlation engine either way. A failed rollback is
/// surfaced as [`Error::RollbackFailure`] after being recorded.
pub fn monitor_validation(
    store: &Store,
    result: &ValidationResult,
    checkpoint: &Checkpoint,
    auto_rollback: bool,
    command_timeout: Duration,
    now: DateTime<Utc>,
) -> Result<ValidationOutcome> {
    let learn = |success: bool| -> Result<()> {
        if let (Some(pattern), Some(action)) = (&result.error_pattern, &result.action) {
            knowledge::record_outcome(
                store,
                &knowledge::pattern_key(pattern),
                action,
                success,
                result.duration_ms.unwrap_or(0.0),
            )?;
        }
        Ok(())
    };

    if result.overall_passed {
        learn(true)?;
        return Ok(ValidationOutcome {
            checkpoint_id: checkpoint.id.clone(),
            passed: true,
            failed_layer: None,
            reason: None,
            action_taken: None,
            restore: None,
        });
    }

    let (layer, reason) = result.first_failure();
    events::record(
        store.root(),
        Severity::Error,
        "validation_failure",
        &format!("Validation failed in layer '{}': {}", layer, reason),
        serde_json::json!({
            "checkpoint": checkpoint.id,
            "operation": checkpoint.metadata.operation_id,
            "layer": layer,
        }),
    );

    let mut restore_report = None;
    let mut rollback_error = None;
    let action_taken = if auto_rollback {
        let options = RestoreOptions {
            force: true,
            reverse_diff: false,
            command_timeout,
        };
        match restore(store, checkpoint, &options, &mut Decline) {
            Ok(report) => {
                restore_report = Some(report);
                ActionTaken::RolledBack
            }
            Err(e) => {
                rollback_error = Some(e);
                ActionTaken::RollbackFailed
            }
        }
    } else {
        ActionTaken::ManualInterventionNeeded
    };

    let recorded = store
        .update(|history: &mut FailureHistory| {
            history.failures.push(FailureRecord {
                timestamp: now,
                operation_id: checkpoint.metadata.operation_id.clone(),
                checkpoint_id: checkpoint.id.clone(),
                failed_layer: layer.clone(),
                reason: reason.clone(),
                action_taken,
            });
            Ok(())
        })
        .and_then(|()| learn(false));

    // The rollback error outranks bookkeeping failures.
    match (rollback_error, recorded) {
        (Some(e), Err(bookkeeping)) => {
            tracing::warn!(checkpoint = %checkpoint.id, error = %bookkeeping, "failed to record rollback failure");
            return Err(e);
        }
        (Some(e), Ok(())) => return Err(e),
        (None, Err(bookkeeping)) => return Err(bookkeeping),
        (None, Ok(())) => {}
    }
    Ok(ValidationOutcome {
        checkpoint_id: checkpoint.id.clone(),
        passed: false,
        failed_layer: Some(layer),
        reason: Some(reason),
        action_taken: Some(action_taken),
        restore: restore_report,
    })
}

/// Answer from [`find_alternative`].
#[derive(Debug, Clone, Serialize)]
pub struct Alternative {
    pub error_pattern_hash: String,
    /// Best untried action, or `None` when there is no alternative
    pub action: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success_rate: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub times_used: Option<u64>,
}

/// Best-known action for `error_pattern` other than `operation` and `tried`.
pub fn find_alternative(
    store: &Store,
    operation: &str,
    error_pattern: &str,
    tried: &[String],
) -> Result<Alternative> {
    let hash = knowledge::pattern_key(error_pattern);
    let best = knowledge::entries_for_pattern(store, &hash)?
        .into_iter()
        .filter(|e| e.action != operation && !tried.contains(&e.action))
        .fold(None, |best: Option<crate::models::CorrelationEntry>, e| match best {
            Some(b) if b.success_rate >= e.success_rate => Some(b),
            _ => Some(e),
        });

    Ok(Alternative {
        error_pattern_hash: hash,
        success_rate: best.as_ref().map(|e| e.success_rate),
        times_used: best.as_ref().map(|e| e.times_used),
        action: best.map(|e| e.action),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FixHistory;
    use crate::storage::Document;
    use crate::test_utils::TestEnv;

    const TIMEOUT: Duration = Duration::from_secs(30);

    struct Accept;

    impl Confirm for Accept {
        fn confirm(&mut self, _prompt: &str) -> Result<bool> {
            Ok(true)
        }
    }

    fn write(env: &TestEnv, rel: &str, content: &[u8]) -> PathBuf {
        let path = env.project_path().join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, content).unwrap();
        path
    }

    fn failing_result() -> ValidationResult {
        ValidationResult {
            overall_passed: false,
            layers: vec![
                LayerResult {
                    name: "syntax".to_string(),
                    passed: true,
                    reason: String::new(),
                },
                LayerResult {
                    name: "tests".to_string(),
                    passed: false,
                    reason: "3 tests failed".to_string(),
                },
            ],
            ..Default::default()
        }
    }

    #[test]
    fn test_restore_is_byte_identical() {
        let env = TestEnv::new();
        let store = env.store();
        let a = write(&env, "src/a.rs", b"fn a() {}\n");
        let b = write(&env, "data/blob.bin", &[0u8, 159, 146, 150, 255]);

        let cp = create(
            &store,
            env.project_path(),
            "refactor",
            &[PathBuf::from("src/a.rs"), PathBuf::from("data")],
            TIMEOUT,
            Utc::now(),
        )
        .unwrap();
        assert_eq!(cp.metadata.files_count, 2);
        assert!(cp.dir.join("files/src/a.rs").exists());
        assert!(cp.id.starts_with("refactor_"));

        fs::write(&a, "broken").unwrap();
        fs::write(&b, "also broken").unwrap();
        let added = write(&env, "data/new.bin", b"new");

        let options = RestoreOptions {
            force: true,
            ..Default::default()
        };
        let report = restore(&store, &cp, &options, &mut Decline).unwrap();
        assert_eq!(report.restored.len(), 2);

        assert_eq!(fs::read(&a).unwrap(), b"fn a() {}\n");
        assert_eq!(fs::read(&b).unwrap(), vec![0u8, 159, 146, 150, 255]);
        assert!(!added.exists());
    }

    #[test]
    fn test_absent_path_is_removed_on_restore() {
        let env = TestEnv::new();
        let store = env.store();

        let cp = create(
            &store,
            env.project_path(),
            "gen",
            &[PathBuf::from("generated.rs")],
            TIMEOUT,
            Utc::now(),
        )
        .unwrap();
        assert!(!cp.metadata.files[0].existed);

        let generated = write(&env, "generated.rs", b"// generated");
        let options = RestoreOptions {
            force: true,
            ..Default::default()
        };
        restore(&store, &cp, &options, &mut Decline).unwrap();
        assert!(!generated.exists());
    }

    #[test]
    fn test_restore_requires_confirmation() {
        let env = TestEnv::new();
        let store = env.store();
        let a = write(&env, "a.txt", b"original");
        let cp = create(
            &store,
            env.project_path(),
            "op",
            &[PathBuf::from("a.txt")],
            TIMEOUT,
            Utc::now(),
        )
        .unwrap();
        fs::write(&a, "changed").unwrap();

        let result = restore(&store, &cp, &RestoreOptions::default(), &mut Decline);
        assert!(matches!(result, Err(Error::ConfirmationRequired(_))));
        assert_eq!(fs::read(&a).unwrap(), b"changed");

        restore(&store, &cp, &RestoreOptions::default(), &mut Accept).unwrap();
        assert_eq!(fs::read(&a).unwrap(), b"original");
    }

    #[test]
    fn test_corrupted_snapshot_is_rollback_failure() {
        let env = TestEnv::new();
        let store = env.store();
        write(&env, "a.txt", b"original");
        let cp = create(
            &store,
            env.project_path(),
            "op",
            &[PathBuf::from("a.txt")],
            TIMEOUT,
            Utc::now(),
        )
        .unwrap();
        fs::write(cp.dir.join("files/a.txt"), "tampered").unwrap();

        let options = RestoreOptions {
            force: true,
            ..Default::default()
        };
        let result = restore(&store, &cp, &options, &mut Decline);
        assert!(matches!(result, Err(Error::RollbackFailure(_))));

        let logged = events::read_events(store.root()).unwrap();
        let failure = logged.iter().find(|e| e.event == "rollback_failed").unwrap();
        assert_eq!(failure.severity, Severity::Critical);
    }

    #[test]
    fn test_failed_validation_rolls_back_both_files() {
        let env = TestEnv::new();
        let store = env.store();
        let a = write(&env, "a.txt", b"alpha");
        let b = write(&env, "b.txt", b"beta");
        let cp = create(
            &store,
            env.project_path(),
            "fix_build",
            &[PathBuf::from("a.txt"), PathBuf::from("b.txt")],
            TIMEOUT,
            Utc::now(),
        )
        .unwrap();
        fs::write(&a, "mutated a").unwrap();
        fs::write(&b, "mutated b").unwrap();

        let outcome = monitor_validation(
            &store,
            &ValidationResult {
                overall_passed: false,
                ..Default::default()
            },
            &cp,
            true,
            TIMEOUT,
            Utc::now(),
        )
        .unwrap();
        assert_eq!(outcome.action_taken, Some(ActionTaken::RolledBack));
        assert_eq!(fs::read(&a).unwrap(), b"alpha");
        assert_eq!(fs::read(&b).unwrap(), b"beta");

        let history: FailureHistory = store.read().unwrap();
        assert_eq!(history.failures.len(), 1);
        assert_eq!(history.failures[0].action_taken, ActionTaken::RolledBack);
        assert_eq!(history.failures[0].checkpoint_id, cp.id);
    }

    #[test]
    fn test_failed_validation_without_rollback_needs_operator() {
        let env = TestEnv::new();
        let store = env.store();
        let a = write(&env, "a.txt", b"alpha");
        let cp = create(
            &store,
            env.project_path(),
            "op",
            &[PathBuf::from("a.txt")],
            TIMEOUT,
            Utc::now(),
        )
        .unwrap();
        fs::write(&a, "mutated").unwrap();

        let outcome =
            monitor_validation(&store, &failing_result(), &cp, false, TIMEOUT, Utc::now())
                .unwrap();
        assert_eq!(
            outcome.action_taken,
            Some(ActionTaken::ManualInterventionNeeded)
        );
        assert_eq!(outcome.failed_layer.as_deref(), Some("tests"));
        assert!(matches!(
            outcome.manual_intervention_error(),
            Some(Error::ValidationFailure { .. })
        ));
        assert_eq!(fs::read(&a).unwrap(), b"mutated");
    }

    #[test]
    fn test_validation_outcomes_feed_correlation_engine() {
        let env = TestEnv::new();
        let store = env.store();
        write(&env, "a.txt", b"alpha");
        let cp = create(
            &store,
            env.project_path(),
            "op",
            &[PathBuf::from("a.txt")],
            TIMEOUT,
            Utc::now(),
        )
        .unwrap();

        let mut result = failing_result();
        result.error_pattern = Some("abcdef012345".to_string());
        result.action = Some("clear_cache".to_string());
        monitor_validation(&store, &result, &cp, false, TIMEOUT, Utc::now()).unwrap();
        result.overall_passed = true;
        monitor_validation(&store, &result, &cp, false, TIMEOUT, Utc::now()).unwrap();

        let history: FixHistory = store.read().unwrap();
        let entry = &history.0["abcdef012345::clear_cache"];
        assert_eq!(entry.successes, 1);
        assert_eq!(entry.failures, 1);
    }

    #[test]
    fn test_find_alternative_skips_current_and_tried() {
        let env = TestEnv::new();
        let store = env.store();
        let hash = "abcdef012345";
        for (action, success) in [
            ("retry", true),
            ("retry", true),
            ("clean_build", true),
            ("clean_build", false),
            ("bump_deps", false),
        ] {
            knowledge::record_outcome(&store, hash, action, success, 10.0).unwrap();
        }

        let alt = find_alternative(&store, "retry", hash, &[]).unwrap();
        assert_eq!(alt.action.as_deref(), Some("clean_build"));

        let alt = find_alternative(&store, "retry", hash, &["clean_build".to_string()]).unwrap();
        assert_eq!(alt.action.as_deref(), Some("bump_deps"));

        let none = find_alternative(
            &store,
            "retry",
            hash,
            &["clean_build".to_string(), "bump_deps".to_string()],
        )
        .unwrap();
        assert!(none.action.is_none());
    }

    #[test]
    fn test_list_newest_first_and_cleanup() {
        let env = TestEnv::new();
        let store = env.store();
        write(&env, "a.txt", b"x");
        let base = Utc::now();
        for i in 0..4 {
            create(
                &store,
                env.project_path(),
                &format!("op{}", i),
                &[PathBuf::from("a.txt")],
                TIMEOUT,
                base + chrono::Duration::seconds(i),
            )
            .unwrap();
        }

        let all = list(&store).unwrap();
        assert_eq!(all.len(), 4);
        assert_eq!(all[0].metadata.operation_id, "op3");

        let removed = cleanup(&store, 2).unwrap();
        assert_eq!(removed.len(), 2);
        let remaining: Vec<_> = list(&store)
            .unwrap()
            .into_iter()
            .map(|c| c.metadata.operation_id)
            .collect();
        assert_eq!(remaining, vec!["op3", "op2"]);
    }

    fn git(dir: &Path, args: &[&str]) -> bool {
        std::process::Command::new("git")
            .args(args)
            .current_dir(dir)
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    #[test]
    fn test_create_with_non_utf8_uncommitted_change() {
        let env = TestEnv::new();
        let store = env.store();
        let dir = env.project_path();
        let notes = write(&env, "notes.txt", b"caf\xe9\n");
        let ready = git(dir, &["init", "-q"])
            && git(dir, &["config", "user.email", "qm@example.com"])
            && git(dir, &["config", "user.name", "qm"])
            && git(dir, &["add", "."])
            && git(dir, &["commit", "-q", "-m", "init"]);
        // Skip quietly on hosts without git.
        if !ready {
            return;
        }
        fs::write(&notes, b"na\xefve\n").unwrap();

        let cp = create(
            &store,
            dir,
            "encoding",
            &[PathBuf::from("notes.txt")],
            TIMEOUT,
            Utc::now(),
        )
        .unwrap();
        assert!(cp.metadata.has_diff);
        assert!(cp.metadata.git_commit.is_some());
        let patch = fs::read(cp.dir.join(GIT_DIFF_FILE)).unwrap();
        assert!(std::str::from_utf8(&patch).is_err());

        fs::write(&notes, b"changed again").unwrap();
        let options = RestoreOptions {
            force: true,
            ..Default::default()
        };
        restore(&store, &cp, &options, &mut Decline).unwrap();
        assert_eq!(fs::read(&notes).unwrap(), b"na\xefve\n");
    }

    #[test]
    fn test_rollback_error_survives_bookkeeping_failure() {
        let env = TestEnv::new();
        let store = env.store();
        write(&env, "a.txt", b"original");
        let cp = create(
            &store,
            env.project_path(),
            "op",
            &[PathBuf::from("a.txt")],
            TIMEOUT,
            Utc::now(),
        )
        .unwrap();
        fs::write(cp.dir.join("files/a.txt"), "tampered").unwrap();
        let fix_history = store.path(FixHistory::NAME);
        fs::create_dir_all(fix_history.parent().unwrap()).unwrap();
        fs::write(&fix_history, "{ not json").unwrap();

        let mut result = failing_result();
        result.error_pattern = Some("abcdef012345".to_string());
        result.action = Some("clear_cache".to_string());
        let outcome = monitor_validation(&store, &result, &cp, true, TIMEOUT, Utc::now());
        assert!(matches!(outcome, Err(Error::RollbackFailure(_))));

        let history: FailureHistory = store.read().unwrap();
        assert_eq!(history.failures[0].action_taken, ActionTaken::RollbackFailed);
    }

    #[test]
    fn test_cleanup_removes_abandoned_incomplete_checkpoints() {
        let env = TestEnv::new();
        let store = env.store();
        write(&env, "a.txt", b"x");
        create(
            &store,
            env.project_path(),
            "kept",
            &[PathBuf::from("a.txt")],
            TIMEOUT,
            Utc::now(),
        )
        .unwrap();

        let base = store.path(CHECKPOINTS_DIR);
        let abandoned = base.join("crashed_20260101_000000_000");
        let fresh = base.join("inflight_20260101_000000_000");
        fs::create_dir_all(abandoned.join("files")).unwrap();
        fs::create_dir_all(fresh.join("files")).unwrap();
        let old = std::time::SystemTime::now() - INCOMPLETE_GRACE * 2;
        fs::File::open(&abandoned).unwrap().set_modified(old).unwrap();

        let removed = cleanup(&store, 5).unwrap();
        assert_eq!(removed, vec!["crashed_20260101_000000_000".to_string()]);
        assert!(!abandoned.exists());
        assert!(fresh.exists());
        assert_eq!(list(&store).unwrap().len(), 1);
    }

    #[test]
    fn test_failed_create_leaves_no_directory() {
        let env = TestEnv::new();
        let store = env.store();
        // A project file named like the external mirror root makes the
        // second snapshot fail halfway through.
        write(&env, "_external", b"collides");
        let outside = tempfile::TempDir::new().unwrap();
        let external = outside.path().join("shared.txt");
        fs::write(&external, "outside").unwrap();

        let result = create(
            &store,
            env.project_path(),
            "op",
            &[PathBuf::from("_external"), external],
            TIMEOUT,
            Utc::now(),
        );
        assert!(result.is_err());
        let base = store.path(CHECKPOINTS_DIR);
        assert_eq!(fs::read_dir(&base).unwrap().count(), 0);
    }

    #[test]
    fn test_load_unknown_checkpoint() {
        let env = TestEnv::new();
        let store = env.store();
        assert!(matches!(
            load(&store, "missing_20260101"),
            Err(Error::NotFound(_))
        ));
    }
}
