//! Storage layer for Quartermaster state.
//!
//! All shared state lives in JSON documents under one data root:
//! `~/.local/share/quartermaster/<project-hash>/` by default, or `QM_DATA_DIR`.
//!
//! Reads never lock. Writes go through [`Store::update`], which takes the
//! document's advisory lock, applies a read-modify-write closure to the typed
//! document and atomically replaces the file (temp file, fsync, rename), so a
//! reader sees either the old or the new document and never a torn one.

pub mod lock;

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};

use crate::config::Settings;
use crate::events::{self, Severity};
use crate::{Error, Result};

/// Environment variable overriding the data root.
pub const DATA_DIR_ENV: &str = "QM_DATA_DIR";

/// A typed JSON document stored at a fixed path under the data root.
pub trait Document: Serialize + DeserializeOwned + Default {
    /// Path relative to the data root, e.g. `task_queue.json`.
    const NAME: &'static str;

    /// Top-level keys a stored document must carry.
    const REQUIRED: &'static [&'static str] = &[];
}

/// Handle on one project's data root.
#[derive(Debug, Clone)]
pub struct Store {
    root: PathBuf,
    lock_timeout: Duration,
    max_retries: u32,
    retry_delay: Duration,
}

impl Store {
    /// Open (creating if needed) the store at `root`.
    pub fn open(root: &Path, settings: &Settings) -> Result<Self> {
        fs::create_dir_all(root)?;
        Ok(Self {
            root: root.to_path_buf(),
            lock_timeout: settings.lock_timeout,
            max_retries: settings.max_retries,
            retry_delay: settings.retry_delay,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute path of a file under the data root.
    pub fn path(&self, relative: &str) -> PathBuf {
        self.root.join(relative)
    }

    /// Read a document, returning its default when the file does not exist.
    pub fn read<D: Document>(&self) -> Result<D> {
        self.read_file(D::NAME, D::REQUIRED)
    }

    /// Read a document stored at a caller-chosen path.
    pub fn read_file<T: DeserializeOwned + Default>(
        &self,
        relative: &str,
        required: &[&str],
    ) -> Result<T> {
        let path = self.path(relative);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(T::default()),
            Err(e) => return Err(e.into()),
        };
        parse_document(relative, &content, required)
    }

    /// Apply `mutate` to the current document under its lock and persist the result.
    ///
    /// If `mutate` returns an error nothing is written.
    pub fn update<D: Document, T>(&self, mutate: impl FnOnce(&mut D) -> Result<T>) -> Result<T> {
        self.update_file(D::NAME, D::REQUIRED, mutate)
    }

    /// [`Store::update`] for a document stored at a caller-chosen path.
    pub fn update_file<D, T>(
        &self,
        relative: &str,
        required: &[&str],
        mutate: impl FnOnce(&mut D) -> Result<T>,
    ) -> Result<T>
    where
        D: Serialize + DeserializeOwned + Default,
    {
        self.with_lock(relative, || {
            let mut doc: D = self.read_file(relative, required)?;
            let out = mutate(&mut doc)?;
            write_json_atomic(&self.path(relative), &doc)?;
            Ok(out)
        })
    }

    /// Run `f` while holding the advisory lock for `name`.
    ///
    /// Each attempt waits up to the lock timeout; after the last failed attempt
    /// a `lock_timeout` event is logged and [`Error::LockTimeout`] returned.
    pub fn with_lock<T>(&self, name: &str, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let path = lock::lock_path(&self.root, name);
        // One initial attempt plus `max_retries` retries.
        let attempts = self.max_retries.saturating_add(1);
        for attempt in 1..=attempts {
            if let Some(_guard) = lock::acquire(&path, self.lock_timeout)? {
                return f();
            }
            tracing::debug!(document = name, attempt, "lock busy");
            if attempt < attempts {
                thread::sleep(self.retry_delay);
            }
        }

        tracing::warn!(document = name, attempts, "lock timeout");
        events::record(
            &self.root,
            Severity::Error,
            "lock_timeout",
            &format!("Timed out waiting for lock on {}", name),
            serde_json::json!({
                "document": name,
                "attempts": attempts,
                "timeout_secs": self.lock_timeout.as_secs_f64(),
            }),
        );
        Err(Error::LockTimeout {
            document: name.to_string(),
            attempts,
        })
    }
}

/// Parse and validate a stored document.
fn parse_document<T: DeserializeOwned>(name: &str, content: &str, required: &[&str]) -> Result<T> {
    let corrupt = |reason: String| Error::CorruptDocument {
        document: name.to_string(),
        reason,
    };
    let value: serde_json::Value =
        serde_json::from_str(content).map_err(|e| corrupt(e.to_string()))?;
    let object = value
        .as_object()
        .ok_or_else(|| corrupt("top level is not an object".to_string()))?;
    if let Some(missing) = required.iter().find(|key| !object.contains_key(**key)) {
        return Err(corrupt(format!("missing required field '{}'", missing)));
    }
    serde_json::from_value(value).map_err(|e| corrupt(e.to_string()))
}

/// Serialize `value` as pretty JSON and atomically replace `path` with it.
pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let mut bytes = serde_json::to_vec_pretty(value)?;
    bytes.push(b'\n');
    write_atomic(path, &bytes)
}

/// Atomically replace `path` with `bytes`.
///
/// The temp file lives next to the target so the final rename never crosses
/// filesystems.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| Error::Io(e.error))?;
    Ok(())
}

/// Resolve the data root for a project.
///
/// `QM_DATA_DIR` wins; otherwise a hash of the canonical project path selects
/// a directory under the platform data dir.
pub fn data_root_for(project: &Path) -> Result<PathBuf> {
    if let Some(dir) = std::env::var_os(DATA_DIR_ENV).filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir));
    }

    let data_dir = dirs::data_dir()
        .ok_or_else(|| Error::Other("Could not determine data directory".to_string()))?;
    Ok(data_dir.join("quartermaster").join(project_hash(project)?))
}

/// First 12 hex chars of the SHA-256 of the canonical project path.
pub fn project_hash(project: &Path) -> Result<String> {
    let canonical = project
        .canonicalize()
        .map_err(|e| Error::Other(format!("Could not canonicalize project path: {}", e)))?;

    let mut hasher = Sha256::new();
    hasher.update(canonical.to_string_lossy().as_bytes());
    let hash_hex = format!("{:x}", hasher.finalize());
    Ok(hash_hex[..12].to_string())
}

/// Walk up from `start` to the nearest directory containing `.git`.
pub fn find_git_root(start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .find(|dir| dir.join(".git").exists())
        .map(Path::to_path_buf)
}

/// Generate a time-derived identifier: `<prefix>_<epoch millis>_<4 hex chars>`.
pub fn generate_id(prefix: &str, seed: &str) -> String {
    let now = chrono::Utc::now();
    let mut hasher = Sha256::new();
    hasher.update(seed.as_bytes());
    hasher.update(now.timestamp_nanos_opt().unwrap_or(0).to_le_bytes());
    hasher.update(uuid::Uuid::new_v4().as_bytes());
    let hash_hex = format!("{:x}", hasher.finalize());
    format!("{}_{}_{}", prefix, now.timestamp_millis(), &hash_hex[..4])
}
