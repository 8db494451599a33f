//! Readiness marker for the shared template.
//!
//! The marker is a small JSON file written into the template root only after
//! the template has passed its smoke test. Its presence is what clone-time
//! readiness polling waits for.

use std::fs;
use std::io::Write;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::EnvironmentError;
use crate::identity::SandboxId;

/// Proof that a template was verified, persisted as JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadinessMarker {
    /// Template this marker belongs to.
    pub template_id: String,

    /// When the smoke test last passed.
    pub verified_at: DateTime<Utc>,

    /// Libraries the template was seeded with.
    #[serde(default)]
    pub libraries: Vec<String>,
}

impl ReadinessMarker {
    /// Creates a marker stamped with the current time.
    #[must_use]
    pub fn new(template_id: &SandboxId, libraries: &[String]) -> Self {
        Self {
            template_id: template_id.to_string(),
            verified_at: Utc::now(),
            libraries: libraries.to_vec(),
        }
    }

    /// Returns true if a marker file exists at `path`.
    ///
    /// Existence is all readiness polling checks; content is informational.
    #[must_use]
    pub fn is_ready(path: &Path) -> bool {
        path.is_file()
    }

    /// Loads a marker from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns `EnvironmentError::IoError` if reading fails, or
    /// `EnvironmentError::InvalidMarker` if the JSON is malformed.
    pub fn load(path: &Path) -> Result<Self, EnvironmentError> {
        let content = fs::read_to_string(path).map_err(|e| EnvironmentError::IoError {
            context: format!("failed to read marker file: {}", path.display()),
            source: e,
        })?;

        serde_json::from_str(&content).map_err(|e| EnvironmentError::InvalidMarker {
            reason: format!("failed to parse marker JSON: {e}"),
        })
    }

    /// Saves the marker atomically: temp file, fsync, rename.
    ///
    /// # Errors
    ///
    /// Returns `EnvironmentError::IoError` if writing fails.
    pub fn save(&self, path: &Path) -> Result<(), EnvironmentError> {
        let json = serde_json::to_string_pretty(self).map_err(|e| EnvironmentError::IoError {
            context: format!("failed to serialize marker: {e}"),
            source: std::io::Error::new(std::io::ErrorKind::InvalidData, e),
        })?;

        let temp_path = path.with_extension("json.tmp");

        let mut file = fs::File::create(&temp_path).map_err(|e| EnvironmentError::IoError {
            context: format!("failed to create temp marker file: {}", temp_path.display()),
            source: e,
        })?;

        file.write_all(json.as_bytes())
            .map_err(|e| EnvironmentError::IoError {
                context: format!("failed to write marker: {}", temp_path.display()),
                source: e,
            })?;

        file.sync_all().map_err(|e| EnvironmentError::IoError {
            context: "failed to sync marker file".to_string(),
            source: e,
        })?;

        fs::rename(&temp_path, path).map_err(|e| EnvironmentError::IoError {
            context: format!(
                "failed to rename temp file {} to {}",
                temp_path.display(),
                path.display()
            ),
            source: e,
        })?;

        Ok(())
    }

    /// Deletes the marker if present.
    ///
    /// # Errors
    ///
    /// Returns `EnvironmentError::IoError` for anything but a missing file.
    pub fn remove(path: &Path) -> Result<(), EnvironmentError> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(EnvironmentError::IoError {
                context: format!("failed to remove marker: {}", path.display()),
                source: e,
            }),
        }
    }
}
