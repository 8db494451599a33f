//! Image artifacts produced by a run.
//!
//! Artifacts are `*.png` files directly in the sandbox's working directory.
//! Stale ones are purged before a run; new ones are read, base64-encoded and
//! deleted after it.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use tracing::{debug, warn};

/// File extension treated as an artifact.
const ARTIFACT_EXTENSION: &str = "png";

/// Deletes leftover artifacts in `dir`. Returns how many were removed.
pub async fn purge_artifacts(dir: &Path) -> usize {
    let mut removed = 0;
    for (path, _) in list_artifacts(dir).await {
        match tokio::fs::remove_file(&path).await {
            Ok(()) => removed += 1,
            Err(e) => debug!(path = %path.display(), error = %e, "Failed to purge stale artifact"),
        }
    }
    removed
}

/// Encodes and deletes every artifact in `dir`.
///
/// Artifacts are returned oldest first. A file that cannot be read is logged
/// and skipped; one that cannot be deleted is still returned.
pub async fn harvest_artifacts(dir: &Path) -> Vec<String> {
    let mut encoded = Vec::new();
    for (path, _) in list_artifacts(dir).await {
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to process image");
                continue;
            }
        };
        encoded.push(STANDARD.encode(&bytes));

        if let Err(e) = tokio::fs::remove_file(&path).await {
            warn!(path = %path.display(), error = %e, "Failed to delete harvested image");
        }
    }

    if !encoded.is_empty() {
        debug!(count = encoded.len(), "Harvested artifacts");
    }
    encoded
}

async fn list_artifacts(dir: &Path) -> Vec<(PathBuf, SystemTime)> {
    let mut found = Vec::new();
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return found;
    };

    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        let is_artifact = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case(ARTIFACT_EXTENSION));
        if !is_artifact {
            continue;
        }
        let Ok(metadata) = entry.metadata().await else {
            continue;
        };
        if metadata.is_file() {
            let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            found.push((path, modified));
        }
    }

    found.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const PNG_MAGIC: &[u8] = b"\x89PNG\r\n\x1a\n";

    #[tokio::test]
    async fn test_harvest_encodes_and_deletes() {
        let temp = TempDir::new().expect("failed to create temp dir");
        std::fs::write(temp.path().join("plot_0001.png"), PNG_MAGIC).expect("write");
        std::fs::write(temp.path().join("notes.txt"), "keep").expect("write");

        let artifacts = harvest_artifacts(temp.path()).await;
        assert_eq!(artifacts.len(), 1);
        assert_eq!(STANDARD.decode(&artifacts[0]).expect("base64"), PNG_MAGIC);
        assert!(!temp.path().join("plot_0001.png").exists());
        assert!(temp.path().join("notes.txt").exists());
    }

    #[tokio::test]
    async fn test_purge_removes_only_images() {
        let temp = TempDir::new().expect("failed to create temp dir");
        std::fs::write(temp.path().join("a.png"), PNG_MAGIC).expect("write");
        std::fs::write(temp.path().join("B.PNG"), PNG_MAGIC).expect("write");
        std::fs::write(temp.path().join("script.py"), "print(1)").expect("write");

        assert_eq!(purge_artifacts(temp.path()).await, 2);
        assert!(temp.path().join("script.py").exists());
        assert!(harvest_artifacts(temp.path()).await.is_empty());
    }

    #[tokio::test]
    async fn test_missing_directory_yields_nothing() {
        let temp = TempDir::new().expect("failed to create temp dir");
        let missing = temp.path().join("nope");
        assert_eq!(purge_artifacts(&missing).await, 0);
        assert!(harvest_artifacts(&missing).await.is_empty());
    }
}
