//! Crash-resistant directory removal.
//!
//! Environment trees are full of read-only files, symlinks into foreign
//! prefixes and, on some platforms, files another process still holds open.
//! [`remove_dir_robust`] deletes bottom-up without following links, clears
//! read-only bits when the OS refuses, retries the whole tree a bounded number
//! of times and, as a last resort, renames the directory out of the way so the
//! original name is free again. It never returns an error.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, instrument, trace, warn};
use walkdir::WalkDir;

use crate::identity::{QUARANTINE_INFIX, is_quarantine_name};

/// Retry settings for [`remove_dir_robust`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemovalPolicy {
    /// Whole-tree deletion attempts. Zero is treated as one.
    pub attempts: u32,
    /// Pause between attempts.
    pub delay: Duration,
}

impl Default for RemovalPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_secs(1),
        }
    }
}

/// What happened to a directory handed to [`remove_dir_robust`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemovalOutcome {
    /// Nothing existed at the path.
    Absent,
    /// The tree was deleted.
    Removed,
    /// Deletion kept failing; the tree was renamed to this path.
    Quarantined(PathBuf),
    /// Neither deletion nor rename worked. Logged, not raised.
    Failed,
}

impl RemovalOutcome {
    /// Returns true if the original path is free afterwards.
    #[must_use]
    pub fn path_freed(&self) -> bool {
        !matches!(self, Self::Failed)
    }
}

/// Deletes `path` and everything under it, falling back to quarantine.
#[instrument(skip(policy), fields(path = %path.display()))]
pub async fn remove_dir_robust(path: &Path, policy: RemovalPolicy) -> RemovalOutcome {
    if !entry_exists(path) {
        trace!("Nothing to remove");
        return RemovalOutcome::Absent;
    }

    if remove_with_retries(path, policy).await {
        debug!("Removed directory");
        return RemovalOutcome::Removed;
    }

    let target = path.to_path_buf();
    match tokio::task::spawn_blocking(move || quarantine(&target)).await {
        Ok(Ok(dest)) => {
            warn!(quarantine = %dest.display(), "Could not delete directory, moved aside");
            RemovalOutcome::Quarantined(dest)
        }
        Ok(Err(e)) => {
            error!(error = %e, "Could not delete or rename directory");
            RemovalOutcome::Failed
        }
        Err(e) => {
            error!(error = %e, "Quarantine task panicked");
            RemovalOutcome::Failed
        }
    }
}

/// Deletes quarantined directories left under `base_dir` by earlier runs.
///
/// Returns how many were removed. Directories that still resist deletion are
/// left for the next sweep.
#[instrument(skip(policy), fields(base_dir = %base_dir.display()))]
pub async fn sweep_quarantine(base_dir: &Path, policy: RemovalPolicy) -> usize {
    let entries = match fs::read_dir(base_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return 0,
        Err(e) => {
            warn!(error = %e, "Failed to read base directory for quarantine sweep");
            return 0;
        }
    };

    let stale: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(is_quarantine_name)
        })
        .collect();

    let mut removed = 0;
    for path in stale {
        if remove_with_retries(&path, policy).await {
            removed += 1;
        } else {
            debug!(path = %path.display(), "Quarantined directory still resists deletion");
        }
    }

    if removed > 0 {
        debug!(removed, "Quarantine sweep complete");
    }
    removed
}

async fn remove_with_retries(path: &Path, policy: RemovalPolicy) -> bool {
    let attempts = policy.attempts.max(1);

    for attempt in 1..=attempts {
        let target = path.to_path_buf();
        match tokio::task::spawn_blocking(move || remove_tree(&target)).await {
            Ok(Ok(())) => return true,
            Ok(Err(e)) => warn!(attempt, attempts, error = %e, "Directory removal attempt failed"),
            Err(e) => warn!(attempt, attempts, error = %e, "Directory removal task panicked"),
        }

        if !entry_exists(path) {
            return true;
        }
        if attempt < attempts {
            tokio::time::sleep(policy.delay).await;
        }
    }

    false
}

/// One bottom-up pass over the tree. Keeps going past failures so a retry has
/// less left to do, and reports the last error seen.
fn remove_tree(root: &Path) -> io::Result<()> {
    let mut last_error = None;

    for entry in WalkDir::new(root).follow_links(false).contents_first(true) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                if let Some(path) = e.path() {
                    make_writable(path);
                }
                let io_err = e
                    .into_io_error()
                    .unwrap_or_else(|| io::Error::other("filesystem loop while walking tree"));
                if io_err.kind() != io::ErrorKind::NotFound {
                    last_error = Some(io_err);
                }
                continue;
            }
        };

        let is_dir = entry.file_type().is_dir();
        if let Err(e) = remove_entry(entry.path(), is_dir) {
            trace!(path = %entry.path().display(), error = %e, "Entry removal failed");
            last_error = Some(e);
        }
    }

    match last_error {
        None => Ok(()),
        Some(e) => Err(e),
    }
}

fn remove_entry(path: &Path, is_dir: bool) -> io::Result<()> {
    let remove = |p: &Path| {
        if is_dir {
            fs::remove_dir(p)
        } else {
            fs::remove_file(p)
        }
    };

    match remove(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
            if let Some(parent) = path.parent() {
                make_writable(parent);
            }
            if !is_symlink(path) {
                make_writable(path);
            }
            match remove(path) {
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
                other => other,
            }
        }
        Err(e) => Err(e),
    }
}

/// Clears the read-only state of a path; failures are ignored since the
/// removal that follows reports them.
fn make_writable(path: &Path) {
    let Ok(metadata) = fs::symlink_metadata(path) else {
        return;
    };

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;

        let mode = metadata.permissions().mode();
        let wanted = if metadata.is_dir() {
            mode | 0o700
        } else {
            mode | 0o600
        };
        if wanted != mode {
            let _ = fs::set_permissions(path, fs::Permissions::from_mode(wanted));
        }
    }

    #[cfg(not(unix))]
    {
        let mut permissions = metadata.permissions();
        if permissions.readonly() {
            permissions.set_readonly(false);
            let _ = fs::set_permissions(path, permissions);
        }
    }
}

/// Renames `path` to `<path>_old_<unix seconds>`, bumping the stamp until the
/// name is free.
fn quarantine(path: &Path) -> io::Result<PathBuf> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?;
    let parent = path.parent().unwrap_or_else(|| Path::new("."));

    let mut stamp = Utc::now().timestamp();
    loop {
        let dest = parent.join(format!("{name}{QUARANTINE_INFIX}{stamp}"));
        if !entry_exists(&dest) {
            fs::rename(path, &dest)?;
            return Ok(dest);
        }
        stamp += 1;
    }
}

fn entry_exists(path: &Path) -> bool {
    fs::symlink_metadata(path).is_ok()
}

fn is_symlink(path: &Path) -> bool {
    fs::symlink_metadata(path).is_ok_and(|m| m.file_type().is_symlink())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn quick() -> RemovalPolicy {
        RemovalPolicy {
            attempts: 2,
            delay: Duration::from_millis(5),
        }
    }

    #[tokio::test]
    async fn test_remove_absent_path() {
        let temp = TempDir::new().expect("failed to create temp dir");
        let outcome = remove_dir_robust(&temp.path().join("missing"), quick()).await;
        assert_eq!(outcome, RemovalOutcome::Absent);
        assert!(outcome.path_freed());
    }

    #[tokio::test]
    async fn test_remove_nested_tree() {
        let temp = TempDir::new().expect("failed to create temp dir");
        let root = temp.path().join("tree");
        fs::create_dir_all(root.join("a").join("b")).expect("mkdir");
        fs::write(root.join("a").join("b").join("f.txt"), "x").expect("write");
        fs::write(root.join("top.txt"), "y").expect("write");

        let outcome = remove_dir_robust(&root, quick()).await;
        assert_eq!(outcome, RemovalOutcome::Removed);
        assert!(!root.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_remove_does_not_follow_symlinks() {
        let temp = TempDir::new().expect("failed to create temp dir");
        let outside = temp.path().join("outside");
        fs::create_dir_all(&outside).expect("mkdir");
        fs::write(outside.join("keep.txt"), "keep").expect("write");

        let root = temp.path().join("tree");
        fs::create_dir_all(&root).expect("mkdir");
        std::os::unix::fs::symlink(&outside, root.join("link")).expect("symlink");

        assert_eq!(remove_dir_robust(&root, quick()).await, RemovalOutcome::Removed);
        assert!(outside.join("keep.txt").exists());
    }

    #[test]
    fn test_quarantine_bumps_on_collision() {
        let temp = TempDir::new().expect("failed to create temp dir");
        let a = temp.path().join("box");
        fs::create_dir_all(&a).expect("mkdir");
        let first = quarantine(&a).expect("first quarantine");

        fs::create_dir_all(&a).expect("mkdir again");
        let second = quarantine(&a).expect("second quarantine");

        assert_ne!(first, second);
        assert!(first.exists() && second.exists());
        assert!(!a.exists());
        for dest in [first, second] {
            let name = dest.file_name().and_then(|n| n.to_str()).expect("utf-8 name");
            assert!(is_quarantine_name(name));
        }
    }

    #[tokio::test]
    async fn test_sweep_only_touches_quarantine() {
        let temp = TempDir::new().expect("failed to create temp dir");
        fs::create_dir_all(temp.path().join("shared_env")).expect("mkdir");
        fs::create_dir_all(temp.path().join("shared_env_old_1700000000")).expect("mkdir");
        fs::create_dir_all(temp.path().join("abc_old_1700000001").join("venv")).expect("mkdir");

        let removed = sweep_quarantine(temp.path(), quick()).await;
        assert_eq!(removed, 2);
        assert!(temp.path().join("shared_env").exists());
        assert!(!temp.path().join("shared_env_old_1700000000").exists());
    }
}
