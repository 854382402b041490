//! Git snapshots for checkpoints.
//!
//! Every git invocation runs under a hard timeout. Output goes to an
//! anonymous temp file instead of a pipe so a large diff can never block the
//! child while we wait on it.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::Duration;

use wait_timeout::ChildExt;

use crate::{Error, Result};

/// Run git in `dir`, returning raw stdout when it exits successfully.
///
/// A non-zero exit yields `Ok(None)`; a timeout kills git and is an error.
/// Output is bytes: diffs carry file contents in whatever encoding they have.
pub fn run_git(dir: &Path, args: &[&str], timeout: Duration) -> Result<Option<Vec<u8>>> {
    let mut stdout: File = tempfile::tempfile()?;
    let mut child = Command::new("git")
        .args(args)
        .current_dir(dir)
        .stdin(Stdio::null())
        .stdout(stdout.try_clone()?)
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| Error::Other(format!("Failed to run git: {}", e)))?;

    let status = match child.wait_timeout(timeout)? {
        Some(status) => status,
        None => {
            let _ = child.kill();
            let _ = child.wait();
            return Err(Error::Other(format!(
                "git {} timed out after {:?}",
                args.join(" "),
                timeout
            )));
        }
    };
    if !status.success() {
        tracing::debug!(?args, %status, "git exited unsuccessfully");
        return Ok(None);
    }

    let mut out = Vec::new();
    stdout.seek(SeekFrom::Start(0))?;
    stdout.read_to_end(&mut out)?;
    Ok(Some(out))
}

/// Current `HEAD` revision, if the repository has one.
pub fn head_revision(repo: &Path, timeout: Duration) -> Result<Option<String>> {
    Ok(run_git(repo, &["rev-parse", "HEAD"], timeout)?
        .map(|s| String::from_utf8_lossy(&s).trim().to_string())
        .filter(|s| !s.is_empty()))
}

/// Diff of uncommitted changes (staged and unstaged) against `HEAD`.
pub fn uncommitted_diff(repo: &Path, timeout: Duration) -> Result<Option<Vec<u8>>> {
    Ok(run_git(repo, &["diff", "HEAD", "--binary"], timeout)?.filter(|s| !s.is_empty()))
}

/// Reverse-apply a patch file to the working tree.
pub fn reverse_apply(repo: &Path, patch: &Path, timeout: Duration) -> Result<()> {
    let patch = patch.to_string_lossy();
    match run_git(repo, &["apply", "-R", patch.as_ref()], timeout)? {
        Some(_) => Ok(()),
        None => Err(Error::Other(format!(
            "git apply -R {} did not apply cleanly",
            patch
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn git(dir: &Path, args: &[&str]) -> bool {
        Command::new("git")
            .args(args)
            .current_dir(dir)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    fn init_repo() -> Option<TempDir> {
        let temp = TempDir::new().unwrap();
        let dir = temp.path();
        let ok = git(dir, &["init", "-q"])
            && git(dir, &["config", "user.email", "qm@example.com"])
            && git(dir, &["config", "user.name", "qm"]);
        if !ok {
            return None;
        }
        fs::write(dir.join("a.txt"), "one\n").unwrap();
        if !(git(dir, &["add", "."]) && git(dir, &["commit", "-q", "-m", "init"])) {
            return None;
        }
        Some(temp)
    }

    #[test]
    fn test_head_and_diff() {
        // Skip quietly on hosts without git.
        let Some(repo) = init_repo() else { return };
        let timeout = Duration::from_secs(30);

        let head = head_revision(repo.path(), timeout).unwrap().unwrap();
        assert_eq!(head.len(), 40);
        assert!(uncommitted_diff(repo.path(), timeout).unwrap().is_none());

        fs::write(repo.path().join("a.txt"), "two\n").unwrap();
        let diff = uncommitted_diff(repo.path(), timeout).unwrap().unwrap();
        assert!(String::from_utf8_lossy(&diff).contains("+two"));

        let patch = repo.path().join("changes.patch");
        fs::write(&patch, &diff).unwrap();
        reverse_apply(repo.path(), &patch, timeout).unwrap();
        assert_eq!(fs::read_to_string(repo.path().join("a.txt")).unwrap(), "one\n");
    }

    #[test]
    fn test_diff_of_non_utf8_file_is_kept_as_bytes() {
        let Some(repo) = init_repo() else { return };
        let timeout = Duration::from_secs(30);
        let notes = repo.path().join("notes.txt");
        fs::write(&notes, b"caf\xe9\n").unwrap();
        assert!(git(repo.path(), &["add", "notes.txt"]));
        assert!(git(repo.path(), &["commit", "-q", "-m", "latin-1"]));

        fs::write(&notes, b"na\xefve\n").unwrap();
        let diff = uncommitted_diff(repo.path(), timeout).unwrap().unwrap();
        assert!(std::str::from_utf8(&diff).is_err());

        let patch = repo.path().join("changes.patch");
        fs::write(&patch, &diff).unwrap();
        reverse_apply(repo.path(), &patch, timeout).unwrap();
        assert_eq!(fs::read(&notes).unwrap(), b"caf\xe9\n");
    }

    #[test]
    fn test_not_a_repository() {
        let temp = TempDir::new().unwrap();
        let result = head_revision(temp.path(), Duration::from_secs(30));
        // Either git is missing (error) or it reports no repository (None).
        assert!(!matches!(result, Ok(Some(_))));
    }
}
