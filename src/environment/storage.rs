//! Filesystem layout for sandbox storage.
//!
//! This module computes per-sandbox paths and creates the root directories.
//! It performs no deletion; see the cleanup module for that.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::EnvironmentError;
use crate::identity::SandboxId;

/// Directory permissions: owner read/write/execute only (0700).
#[cfg(unix)]
const DIR_PERMISSIONS: u32 = 0o700;

/// Name of the environment directory inside a sandbox root.
pub const ENV_DIR_NAME: &str = "venv";

/// Name of the composed script inside a sandbox root.
pub const SCRIPT_NAME: &str = "script.py";

/// Name of the readiness marker inside the template root.
pub const MARKER_NAME: &str = ".template-ready.json";

/// Paths for one sandbox.
///
/// ```text
/// {base_dir}/{id}/
/// ├── venv/                  # environment
/// │   └── bin/python         # interpreter (Scripts\python.exe on Windows)
/// ├── script.py              # composed script of the last run
/// └── .template-ready.json   # only in the template
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxPaths {
    /// Root directory for this sandbox; also the scratch/working directory.
    pub root: PathBuf,
    /// Virtual environment directory.
    pub env_dir: PathBuf,
    /// The environment's interpreter.
    pub interpreter: PathBuf,
    /// Script written before each run.
    pub script: PathBuf,
    /// Readiness marker (meaningful for the template only).
    pub marker_file: PathBuf,
}

impl SandboxPaths {
    /// Computes the paths for `id` under `base_dir`. Nothing is created.
    #[must_use]
    pub fn new(base_dir: &Path, id: &SandboxId) -> Self {
        let root = base_dir.join(id.as_str());
        let env_dir = root.join(ENV_DIR_NAME);
        Self {
            interpreter: interpreter_path(&env_dir),
            script: root.join(SCRIPT_NAME),
            marker_file: root.join(MARKER_NAME),
            env_dir,
            root,
        }
    }

    /// Returns true if the sandbox root exists.
    #[must_use]
    pub fn exists(&self) -> bool {
        self.root.exists()
    }

    /// Returns true if the environment's interpreter is present.
    ///
    /// This is the only test for "usable": a root or `venv/` without an
    /// interpreter is a leftover from an interrupted build.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.interpreter.exists()
    }

    /// Creates the sandbox root with owner-only permissions.
    ///
    /// # Errors
    ///
    /// Returns `EnvironmentError::IoError` if creation fails.
    pub fn create_root(&self) -> Result<(), EnvironmentError> {
        create_private_dir(&self.root)
    }
}

/// Returns the interpreter path inside an environment directory.
#[must_use]
pub fn interpreter_path(env_dir: &Path) -> PathBuf {
    if cfg!(windows) {
        env_dir.join("Scripts").join("python.exe")
    } else {
        env_dir.join("bin").join("python")
    }
}

/// Returns the directory holding executables and activation scripts.
#[must_use]
pub fn scripts_dir(env_dir: &Path) -> PathBuf {
    if cfg!(windows) {
        env_dir.join("Scripts")
    } else {
        env_dir.join("bin")
    }
}

/// Returns the default base directory for sandbox storage.
///
/// Uses `SANDBOX_PATH` if set, then `XDG_DATA_HOME`, then
/// `~/.sandbox-env-manager/`, then the system temp directory.
#[must_use]
pub fn get_default_base_dir() -> PathBuf {
    if let Ok(path) = std::env::var("SANDBOX_PATH") {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }

    if let Ok(xdg_data) = std::env::var("XDG_DATA_HOME") {
        return PathBuf::from(xdg_data).join("sandbox-env-manager");
    }

    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".sandbox-env-manager");
    }

    // Last resort: use the temp dir
    std::env::temp_dir().join("sandbox-env-manager")
}

/// Ensures the base directory exists.
///
/// # Errors
///
/// Returns `EnvironmentError::IoError` if directory creation fails.
pub fn ensure_base_dir(base_dir: &Path) -> Result<(), EnvironmentError> {
    if base_dir.exists() {
        return Ok(());
    }
    create_private_dir(base_dir)
}

fn create_private_dir(path: &Path) -> Result<(), EnvironmentError> {
    fs::create_dir_all(path).map_err(|e| EnvironmentError::IoError {
        context: format!("failed to create directory: {}", path.display()),
        source: e,
    })?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;

        let permissions = fs::Permissions::from_mode(DIR_PERMISSIONS);
        fs::set_permissions(path, permissions).map_err(|e| EnvironmentError::IoError {
            context: format!("failed to set permissions on: {}", path.display()),
            source: e,
        })?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_sandbox_paths_new() {
        let base_dir = PathBuf::from("/tmp/test-sandboxes");
        let id = SandboxId::parse("abc123").expect("valid id");
        let paths = SandboxPaths::new(&base_dir, &id);

        assert_eq!(paths.root, base_dir.join("abc123"));
        assert_eq!(paths.env_dir, paths.root.join("venv"));
        assert_eq!(paths.script, paths.root.join("script.py"));
        assert_eq!(paths.marker_file, paths.root.join(".template-ready.json"));
        assert!(paths.interpreter.starts_with(&paths.env_dir));
    }

    #[test]
    fn test_root_without_interpreter_is_incomplete() {
        let temp = TempDir::new().expect("failed to create temp dir");
        let id = SandboxId::parse("partial").expect("valid id");
        let paths = SandboxPaths::new(temp.path(), &id);

        assert!(!paths.exists());
        paths.create_root().expect("failed to create root");
        fs::create_dir_all(&paths.env_dir).expect("failed to create env dir");

        assert!(paths.exists());
        assert!(!paths.is_complete());
    }

    #[cfg(unix)]
    #[test]
    fn test_create_root_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let temp = TempDir::new().expect("failed to create temp dir");
        let id = SandboxId::parse("perm").expect("valid id");
        let paths = SandboxPaths::new(temp.path(), &id);
        paths.create_root().expect("failed to create root");

        let mode = fs::metadata(&paths.root)
            .expect("failed to read metadata")
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(mode, DIR_PERMISSIONS);
    }

    #[test]
    fn test_ensure_base_dir_idempotent() {
        let temp = TempDir::new().expect("failed to create temp dir");
        let base = temp.path().join("nested").join("root");
        ensure_base_dir(&base).expect("first call");
        ensure_base_dir(&base).expect("second call");
        assert!(base.is_dir());
    }
}
