//! Environment lifecycle management.
//!
//! This module provides the [`EnvironmentManager`] type for creating, cloning,
//! provisioning, listing and removing sandbox environments.
//!
//! # Cloning
//!
//! A clone is copied into a staging directory next to its final location,
//! relinked so every embedded reference to the template points at the final
//! location, and only then renamed into place. The interpreter path therefore
//! never exists for a half-built clone. The clone is probed after the rename;
//! if it does not answer, it is removed again and a fresh environment is built
//! instead.
//!
//! # Readiness
//!
//! Clones of the shared template wait for its readiness marker first. What
//! happens when the marker never appears is governed by [`ReadinessPolicy`].

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, info, instrument, trace, warn};
use walkdir::WalkDir;

use crate::environment::cleanup::{RemovalOutcome, remove_dir_robust};
use crate::environment::marker::ReadinessMarker;
use crate::environment::storage::{SandboxPaths, ensure_base_dir, scripts_dir};
use crate::environment::{EnvironmentConfig, EnvironmentHandle, EnvironmentOrigin, ReadinessPolicy};
use crate::error::{DependencyInstallError, EnvironmentError};
use crate::identity::{SandboxId, belongs_to_owner, is_quarantine_name};
use crate::system::{RuntimeLocator, probe_runtime};

/// Suffix of the directory a clone is assembled in before it is renamed.
const STAGING_SUFFIX: &str = ".staging";

/// Name of the venv configuration file.
const PYVENV_CFG: &str = "pyvenv.cfg";

/// Characters of tool output kept in error diagnostics.
const DIAGNOSTIC_TAIL: usize = 4000;

/// Manages the lifecycle of sandbox environments.
///
/// The `EnvironmentManager` is responsible for:
/// - Building fresh environments from a host interpreter
/// - Cloning environments from a template and relinking them
/// - Waiting for the shared template's readiness marker
/// - Installing packages into an environment
/// - Listing, evicting and removing sandboxes
///
/// # Example
///
/// ```no_run
/// use sandbox_env_manager::environment::{EnvironmentConfig, EnvironmentManager};
/// use sandbox_env_manager::identity::{SandboxId, resolve_id};
///
/// # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
/// let manager = EnvironmentManager::new(EnvironmentConfig::default());
/// let id = resolve_id("42", "Linear Regression");
///
/// let handle = manager.ensure(&id, Some(&SandboxId::shared_template())).await?;
/// manager.install(&id, &["requests".to_string()]).await?;
/// println!("interpreter at {}", handle.runtime_path().display());
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct EnvironmentManager {
    config: EnvironmentConfig,
    locator: RuntimeLocator,
}

impl EnvironmentManager {
    /// Creates a manager; the runtime strategy is picked from the config.
    #[must_use]
    pub fn new(config: EnvironmentConfig) -> Self {
        let locator = RuntimeLocator::from_config(config.python.clone(), config.probe_timeout);
        Self { config, locator }
    }

    /// Returns a reference to the configuration.
    #[must_use]
    pub fn config(&self) -> &EnvironmentConfig {
        &self.config
    }

    /// Returns the runtime locator used for bootstraps and fallbacks.
    #[must_use]
    pub fn locator(&self) -> &RuntimeLocator {
        &self.locator
    }

    /// Computes the paths of a sandbox.
    #[must_use]
    pub fn paths(&self, id: &SandboxId) -> SandboxPaths {
        SandboxPaths::new(&self.config.base_dir, id)
    }

    /// Makes sure `id` has a complete environment.
    ///
    /// A complete environment is returned untouched. Otherwise, when a
    /// template is given and complete, the environment is cloned from it;
    /// clone failures and missing templates fall through to a fresh build.
    /// Building the shared template first deletes its readiness marker, so
    /// cloners never trust a marker from an earlier build.
    ///
    /// # Errors
    ///
    /// - `EnvironmentError::IoError` if the sandbox root cannot be created
    ///   or a stale readiness marker cannot be deleted
    /// - `EnvironmentError::TemplateNotReady` under a strict readiness policy
    /// - `EnvironmentError::RuntimeUnavailable` if no interpreter exists for
    ///   a fresh build
    /// - `EnvironmentError::BootstrapFailed` if the fresh build fails
    #[instrument(skip(self), fields(id = %id, template = ?template.map(SandboxId::as_str)))]
    pub async fn ensure(
        &self,
        id: &SandboxId,
        template: Option<&SandboxId>,
    ) -> Result<EnvironmentHandle, EnvironmentError> {
        let paths = self.paths(id);
        let template = template.filter(|t| *t != id);
        let handle = |origin| EnvironmentHandle {
            id: id.clone(),
            paths: paths.clone(),
            template_id: template.cloned(),
            origin,
        };

        if paths.is_complete() {
            trace!("Environment already complete");
            return Ok(handle(EnvironmentOrigin::Existing));
        }

        ensure_base_dir(&self.config.base_dir)?;
        paths.create_root()?;
        if *id == self.config.template_id {
            // A marker left from an earlier build must not vouch for this one.
            ReadinessMarker::remove(&paths.marker_file)?;
        }

        if let Some(template) = template {
            if *template == self.config.template_id {
                self.wait_for_template_ready().await?;
            }

            if self.paths(template).is_complete() {
                info!("Cloning sandbox from template");
                match self.clone_from_template(&paths, id, template).await {
                    Ok(()) => {
                        info!("Sandbox cloned successfully");
                        return Ok(handle(EnvironmentOrigin::Cloned));
                    }
                    Err(e) => warn!(error = %e, "Clone failed, falling back to fresh install"),
                }
            } else {
                warn!("Template not found, creating fresh");
            }
        }

        info!("Creating new sandbox environment");
        self.bootstrap_fresh(&paths).await?;
        info!("Virtual environment created");
        Ok(handle(EnvironmentOrigin::Fresh))
    }

    /// Polls for the shared template's readiness marker.
    ///
    /// Checks `readiness_poll_attempts` times, `readiness_poll_interval`
    /// apart, then once more. Returns whether the marker was seen.
    ///
    /// # Errors
    ///
    /// Returns `EnvironmentError::TemplateNotReady` if the marker never
    /// appears and the policy is [`ReadinessPolicy::Strict`].
    #[instrument(skip(self), fields(template = %self.config.template_id))]
    pub async fn wait_for_template_ready(&self) -> Result<bool, EnvironmentError> {
        let marker = self.paths(&self.config.template_id).marker_file;
        let attempts = self.config.readiness_poll_attempts;

        for attempt in 1..=attempts {
            if ReadinessMarker::is_ready(&marker) {
                return Ok(true);
            }
            debug!(attempt, attempts, "Template not ready yet");
            tokio::time::sleep(self.config.readiness_poll_interval).await;
        }
        if ReadinessMarker::is_ready(&marker) {
            return Ok(true);
        }

        match self.config.readiness_policy {
            ReadinessPolicy::Optimistic => {
                warn!(attempts, "Template never became ready, proceeding anyway");
                Ok(false)
            }
            ReadinessPolicy::Strict => Err(EnvironmentError::TemplateNotReady {
                template: self.config.template_id.to_string(),
                attempts,
            }),
        }
    }

    /// Copies the template's environment into `paths`, relinks it and
    /// verifies the copied interpreter. Leaves nothing behind on failure.
    async fn clone_from_template(
        &self,
        paths: &SandboxPaths,
        id: &SandboxId,
        template: &SandboxId,
    ) -> Result<(), EnvironmentError> {
        let clone_failed = |reason: String| EnvironmentError::CloneFailed {
            template: template.to_string(),
            id: id.to_string(),
            reason,
        };

        let staging = staging_dir(&paths.env_dir);
        for leftover in [&paths.env_dir, &staging] {
            if !self.remove_tree(leftover).await.path_freed() {
                return Err(clone_failed(format!(
                    "could not clear partial directory {}",
                    leftover.display()
                )));
            }
        }

        let source = self.paths(template).env_dir;
        let target = paths.env_dir.clone();
        let stage = staging.clone();
        let assembled = tokio::task::spawn_blocking(move || -> io::Result<usize> {
            copy_tree(&source, &stage)?;
            let rewritten = relink_environment(&stage, &source, &target)?;
            fs::rename(&stage, &target)?;
            Ok(rewritten)
        })
        .await;

        let failure = match assembled {
            Ok(Ok(rewritten)) => {
                trace!(rewritten, "Relinked cloned environment");
                if probe_runtime(&paths.interpreter, self.config.probe_timeout)
                    .await
                    .is_some()
                {
                    return Ok(());
                }
                "cloned interpreter did not answer its version probe".to_string()
            }
            Ok(Err(e)) => e.to_string(),
            Err(e) => format!("clone task failed: {e}"),
        };

        self.remove_tree(&staging).await;
        self.remove_tree(&paths.env_dir).await;
        Err(clone_failed(failure))
    }

    /// Builds a new environment with a host interpreter.
    ///
    /// The interpreter runs `-m venv` as a subprocess; if that fails (commonly
    /// because `ensurepip` is missing) it is retried once without pip.
    async fn bootstrap_fresh(&self, paths: &SandboxPaths) -> Result<(), EnvironmentError> {
        let runtime = self.locator.find_runtime().await.ok_or_else(|| {
            warn!("No Python runtime available, sandbox left absent");
            EnvironmentError::RuntimeUnavailable
        })?;
        debug!(runtime = %runtime.path.display(), version = %runtime.version, "Bootstrapping with host runtime");

        let bootstrap_failed = |reason: String| EnvironmentError::BootstrapFailed {
            path: paths.env_dir.clone(),
            reason,
        };

        let mut last_failure = String::new();
        for without_pip in [false, true] {
            if !self.remove_tree(&paths.env_dir).await.path_freed() {
                return Err(bootstrap_failed(
                    "could not clear partial environment directory".to_string(),
                ));
            }

            let mut args: Vec<&std::ffi::OsStr> = vec!["-m".as_ref(), "venv".as_ref()];
            if self.config.inherit_system_packages {
                args.push("--system-site-packages".as_ref());
            }
            if without_pip {
                args.push("--without-pip".as_ref());
            }
            args.push(paths.env_dir.as_os_str());

            match run_tool(&runtime.path, &args, self.config.provision_timeout).await {
                Ok(output) if output.status.success() && paths.is_complete() => {
                    if without_pip {
                        warn!("Environment created without pip; installs will fail");
                    }
                    return Ok(());
                }
                Ok(output) => {
                    last_failure = diagnostic_text(&output);
                    debug!(without_pip, failure = %last_failure, "venv bootstrap failed");
                }
                Err(e) => {
                    last_failure = e.to_string();
                    debug!(without_pip, error = %e, "venv bootstrap did not run");
                }
            }
        }

        self.remove_tree(&paths.env_dir).await;
        Err(bootstrap_failed(last_failure))
    }

    /// Installs packages with the environment's own package manager.
    ///
    /// An empty list is a no-op.
    ///
    /// # Errors
    ///
    /// - `DependencyInstallError::EnvironmentUnavailable` if `id` has no
    ///   complete environment
    /// - `DependencyInstallError::Spawn` if the installer cannot start
    /// - `DependencyInstallError::InstallFailed` with the installer's output
    ///   if it exits unsuccessfully or exceeds the provisioning timeout
    #[instrument(skip(self), fields(id = %id))]
    pub async fn install(
        &self,
        id: &SandboxId,
        packages: &[String],
    ) -> Result<(), DependencyInstallError> {
        if packages.is_empty() {
            return Ok(());
        }

        let joined = packages.join(" ");
        if let Some(bad) = packages.iter().find(|p| p.starts_with('-') || p.trim().is_empty()) {
            return Err(DependencyInstallError::InstallFailed {
                packages: joined,
                exit_code: None,
                diagnostic: format!("refusing package name {bad:?}"),
            });
        }

        let paths = self.paths(id);
        if !paths.is_complete() {
            return Err(DependencyInstallError::EnvironmentUnavailable { id: id.to_string() });
        }

        info!(packages = %joined, "Installing dependencies");
        let mut args: Vec<&std::ffi::OsStr> = vec![
            "-m".as_ref(),
            "pip".as_ref(),
            "install".as_ref(),
            "--disable-pip-version-check".as_ref(),
        ];
        args.extend(packages.iter().map(|p| std::ffi::OsStr::new(p.as_str())));

        let output = match run_tool(&paths.interpreter, &args, self.config.provision_timeout).await {
            Ok(output) => output,
            Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                return Err(DependencyInstallError::InstallFailed {
                    packages: joined,
                    exit_code: None,
                    diagnostic: e.to_string(),
                });
            }
            Err(e) => return Err(DependencyInstallError::Spawn(e)),
        };

        if output.status.success() {
            info!("Dependencies installed");
            Ok(())
        } else {
            let diagnostic = diagnostic_text(&output);
            warn!(exit_code = ?output.status.code(), "Dependency install failed");
            Err(DependencyInstallError::InstallFailed {
                packages: joined,
                exit_code: output.status.code(),
                diagnostic,
            })
        }
    }

    /// Lists sandbox ids under the base directory, sorted.
    ///
    /// Quarantined directories, staging directories and stray files are
    /// skipped. Roots without an interpreter are listed too: they are
    /// scratch-only sandboxes (a run happened before any environment was
    /// built, or a build failed), and eviction must still reclaim them. Use
    /// [`SandboxPaths::is_complete`] to tell them apart.
    ///
    /// # Errors
    ///
    /// Returns `EnvironmentError::IoError` if the directory cannot be read.
    #[instrument(skip(self))]
    pub fn list_sandboxes(&self) -> Result<Vec<SandboxId>, EnvironmentError> {
        let base_dir = &self.config.base_dir;
        if !base_dir.exists() {
            return Ok(Vec::new());
        }

        let entries = fs::read_dir(base_dir).map_err(|e| EnvironmentError::IoError {
            context: format!("failed to read base directory: {}", base_dir.display()),
            source: e,
        })?;

        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| EnvironmentError::IoError {
                context: "failed to read directory entry".to_string(),
                source: e,
            })?;

            if !entry.file_type().is_ok_and(|t| t.is_dir()) {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if is_quarantine_name(name) {
                    continue;
                }
                if let Ok(id) = SandboxId::parse(name) {
                    ids.push(id);
                }
            }
        }

        ids.sort();
        trace!(count = ids.len(), "Found sandboxes");
        Ok(ids)
    }

    /// Removes every sandbox of `owner` except `keep` and the shared template.
    ///
    /// Returns how many sandboxes were freed. Failures are logged.
    #[instrument(skip(self, owner), fields(keep = %keep))]
    pub async fn evict_owner(&self, owner: &str, keep: &SandboxId) -> usize {
        let ids = match self.list_sandboxes() {
            Ok(ids) => ids,
            Err(e) => {
                warn!(error = %e, "Failed to list sandboxes for eviction");
                return 0;
            }
        };

        let mut evicted = 0;
        for id in ids {
            if id == *keep || id == self.config.template_id || !belongs_to_owner(id.as_str(), owner) {
                continue;
            }
            info!(sandbox = %id, "Cleaning up inactive sandbox");
            if self.remove(&id).await.path_freed() {
                evicted += 1;
            }
        }
        evicted
    }

    /// Removes a sandbox's whole directory. Never fails; see [`RemovalOutcome`].
    #[instrument(skip(self), fields(id = %id))]
    pub async fn remove(&self, id: &SandboxId) -> RemovalOutcome {
        let paths = self.paths(id);
        // A crashed clone can leave its staging tree behind.
        self.remove_tree(&staging_dir(&paths.env_dir)).await;
        self.remove_tree(&paths.root).await
    }

    async fn remove_tree(&self, path: &Path) -> RemovalOutcome {
        remove_dir_robust(path, self.config.removal_policy()).await
    }
}

fn staging_dir(env_dir: &Path) -> PathBuf {
    let mut name = env_dir.as_os_str().to_owned();
    name.push(STAGING_SUFFIX);
    PathBuf::from(name)
}

/// Runs a provisioning tool with captured output under a timeout.
///
/// A timeout is reported as `io::ErrorKind::TimedOut`; the child is killed.
async fn run_tool(
    program: &Path,
    args: &[&std::ffi::OsStr],
    timeout: Duration,
) -> io::Result<Output> {
    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .env("PYTHONIOENCODING", "utf-8")
        .kill_on_drop(true)
        .output();

    match tokio::time::timeout(timeout, child).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            format!(
                "{} did not finish within {}s",
                program.display(),
                timeout.as_secs()
            ),
        )),
    }
}

/// Tool output for error messages: stderr, else stdout, trimmed to its tail.
fn diagnostic_text(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let text = if stderr.trim().is_empty() {
        String::from_utf8_lossy(&output.stdout).into_owned()
    } else {
        stderr.into_owned()
    };
    let text = text.trim();

    let mut start = text.len().saturating_sub(DIAGNOSTIC_TAIL);
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_string()
}

/// Copies a directory tree, recreating symbolic links instead of following them.
fn copy_tree(src: &Path, dst: &Path) -> io::Result<()> {
    for entry in WalkDir::new(src).follow_links(false) {
        let entry = entry.map_err(io::Error::other)?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(io::Error::other)?;
        let target = dst.join(relative);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
        } else if file_type.is_symlink() {
            let link = fs::read_link(entry.path())?;
            make_symlink(&link, &target, entry.path())?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn make_symlink(link: &Path, at: &Path, _original: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(link, at)
}

#[cfg(windows)]
fn make_symlink(link: &Path, at: &Path, original: &Path) -> io::Result<()> {
    if fs::metadata(original).is_ok_and(|m| m.is_dir()) {
        std::os::windows::fs::symlink_dir(link, at)
    } else {
        std::os::windows::fs::symlink_file(link, at)
    }
}

#[cfg(not(any(unix, windows)))]
fn make_symlink(_link: &Path, at: &Path, original: &Path) -> io::Result<()> {
    fs::copy(original, at).map(|_| ())
}

/// Rewrites references to `from` into references to `to` inside `env_dir`.
///
/// Covers `pyvenv.cfg`, text files in the scripts directory (activation
/// scripts and console-script shebangs) and absolute symlinks pointing under
/// `from`. Binary files are left alone. Running it again changes nothing.
/// Returns how many files and links were rewritten.
///
/// # Errors
///
/// Returns the first I/O error hit while reading or writing.
pub fn relink_environment(env_dir: &Path, from: &Path, to: &Path) -> io::Result<usize> {
    let from_text = from.to_string_lossy();
    let to_text = to.to_string_lossy();
    if from_text == to_text {
        return Ok(0);
    }

    let mut text_files = vec![env_dir.join(PYVENV_CFG)];
    let bin = scripts_dir(env_dir);
    if bin.is_dir() {
        for entry in fs::read_dir(&bin)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                text_files.push(entry.path());
            }
        }
    }

    let mut rewritten = 0;
    for path in text_files {
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e),
        };
        let Ok(text) = String::from_utf8(bytes) else {
            continue;
        };
        if text.contains(&*from_text) {
            fs::write(&path, text.replace(&*from_text, &to_text))?;
            rewritten += 1;
        }
    }

    for entry in WalkDir::new(env_dir).follow_links(false) {
        let entry = entry.map_err(io::Error::other)?;
        if !entry.path_is_symlink() {
            continue;
        }
        let link = fs::read_link(entry.path())?;
        if let Ok(rest) = link.strip_prefix(from) {
            let original = entry.path().to_path_buf();
            fs::remove_file(&original)?;
            make_symlink(&to.join(rest), &original, &original)?;
            rewritten += 1;
        }
    }

    Ok(rewritten)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_manager(base: &Path) -> EnvironmentManager {
        EnvironmentManager::new(
            EnvironmentConfig::default()
                .with_base_dir(base)
                .with_readiness_polling(Duration::from_millis(10), 3)
                .with_cleanup_retries(2, Duration::from_millis(5)),
        )
    }

    /// Lays out something shaped like a venv without running Python.
    fn fake_env(env_dir: &Path) {
        let bin = scripts_dir(env_dir);
        fs::create_dir_all(&bin).expect("mkdir bin");
        fs::write(
            env_dir.join(PYVENV_CFG),
            format!(
                "home = /usr/bin\ncommand = /usr/bin/python3 -m venv {}\n",
                env_dir.display()
            ),
        )
        .expect("write cfg");
        fs::write(
            bin.join("activate"),
            format!("VIRTUAL_ENV=\"{}\"\nexport VIRTUAL_ENV\n", env_dir.display()),
        )
        .expect("write activate");
        fs::write(
            bin.join("pip"),
            format!("#!{}/bin/python\nimport pip\n", env_dir.display()),
        )
        .expect("write pip");
        fs::write(crate::environment::interpreter_path(env_dir), b"\x7fELF").expect("write python");
    }

    #[test]
    fn test_relink_rewrites_and_is_idempotent() {
        let temp = TempDir::new().expect("failed to create temp dir");
        let from = temp.path().join("shared_env").join("venv");
        let to = temp.path().join("clone").join("venv");
        fake_env(&from);
        copy_tree(&from, &to).expect("copy");

        let first = relink_environment(&to, &from, &to).expect("relink");
        assert_eq!(first, 3);

        let activate = fs::read_to_string(scripts_dir(&to).join("activate")).expect("read");
        assert!(activate.contains(&to.display().to_string()));
        assert!(!activate.contains(&from.display().to_string()));

        let second = relink_environment(&to, &from, &to).expect("relink again");
        assert_eq!(second, 0);
    }

    #[cfg(unix)]
    #[test]
    fn test_copy_preserves_and_relinks_symlinks() {
        let temp = TempDir::new().expect("failed to create temp dir");
        let from = temp.path().join("t").join("venv");
        let to = temp.path().join("c").join("venv");
        fake_env(&from);
        let bin = scripts_dir(&from);
        std::os::unix::fs::symlink("python", bin.join("python3")).expect("relative link");
        std::os::unix::fs::symlink(bin.join("python"), bin.join("python3.12")).expect("abs link");

        copy_tree(&from, &to).expect("copy");
        relink_environment(&to, &from, &to).expect("relink");

        let to_bin = scripts_dir(&to);
        assert_eq!(
            fs::read_link(to_bin.join("python3")).expect("read link"),
            PathBuf::from("python")
        );
        assert_eq!(
            fs::read_link(to_bin.join("python3.12")).expect("read link"),
            to_bin.join("python")
        );
    }

    #[tokio::test]
    async fn test_ensure_existing_is_noop() {
        let temp = TempDir::new().expect("failed to create temp dir");
        let manager = test_manager(temp.path());
        let id = SandboxId::parse("complete").expect("valid id");
        fake_env(&manager.paths(&id).env_dir);

        let handle = manager.ensure(&id, None).await.expect("ensure");
        assert_eq!(handle.origin, EnvironmentOrigin::Existing);
        assert!(handle.runtime_path().exists());
    }

    #[tokio::test]
    async fn test_strict_readiness_fails_fast() {
        let temp = TempDir::new().expect("failed to create temp dir");
        let manager = EnvironmentManager::new(
            EnvironmentConfig::default()
                .with_base_dir(temp.path())
                .with_readiness_polling(Duration::from_millis(5), 2)
                .with_readiness_policy(ReadinessPolicy::Strict),
        );

        let err = manager
            .wait_for_template_ready()
            .await
            .expect_err("should not be ready");
        assert!(matches!(
            err,
            EnvironmentError::TemplateNotReady { attempts: 2, .. }
        ));
    }

    #[tokio::test]
    async fn test_readiness_seen_when_marker_exists() {
        let temp = TempDir::new().expect("failed to create temp dir");
        let manager = test_manager(temp.path());
        let template = manager.paths(&SandboxId::shared_template());
        template.create_root().expect("create root");
        ReadinessMarker::new(&SandboxId::shared_template(), &[])
            .save(&template.marker_file)
            .expect("save marker");

        assert!(manager.wait_for_template_ready().await.expect("ready"));
    }

    #[tokio::test]
    async fn test_template_rebuild_clears_stale_marker_first() {
        let temp = TempDir::new().expect("failed to create temp dir");
        let manager = EnvironmentManager::new(
            EnvironmentConfig::default()
                .with_base_dir(temp.path())
                .with_python("/definitely/not/python3"),
        );
        let template = SandboxId::shared_template();
        let paths = manager.paths(&template);
        paths.create_root().expect("create root");
        ReadinessMarker::new(&template, &[])
            .save(&paths.marker_file)
            .expect("save marker");

        let err = manager.ensure(&template, None).await.expect_err("no runtime");
        assert!(matches!(err, EnvironmentError::RuntimeUnavailable));
        assert!(!ReadinessMarker::is_ready(&paths.marker_file));
    }

    #[tokio::test]
    async fn test_complete_template_keeps_its_marker() {
        let temp = TempDir::new().expect("failed to create temp dir");
        let manager = test_manager(temp.path());
        let template = SandboxId::shared_template();
        let paths = manager.paths(&template);
        fake_env(&paths.env_dir);
        ReadinessMarker::new(&template, &[])
            .save(&paths.marker_file)
            .expect("save marker");

        let handle = manager.ensure(&template, None).await.expect("ensure");
        assert_eq!(handle.origin, EnvironmentOrigin::Existing);
        assert!(ReadinessMarker::is_ready(&paths.marker_file));
    }

    #[tokio::test]
    async fn test_install_requires_environment() {
        let temp = TempDir::new().expect("failed to create temp dir");
        let manager = test_manager(temp.path());
        let id = SandboxId::parse("empty").expect("valid id");

        manager.install(&id, &[]).await.expect("empty install is a no-op");
        let err = manager
            .install(&id, &["numpy".to_string()])
            .await
            .expect_err("no environment");
        assert!(matches!(
            err,
            DependencyInstallError::EnvironmentUnavailable { .. }
        ));
    }

    #[tokio::test]
    async fn test_install_rejects_option_like_names() {
        let temp = TempDir::new().expect("failed to create temp dir");
        let manager = test_manager(temp.path());
        let id = SandboxId::parse("opts").expect("valid id");

        let err = manager
            .install(&id, &["--index-url=http://evil".to_string()])
            .await
            .expect_err("rejected");
        assert!(matches!(err, DependencyInstallError::InstallFailed { .. }));
    }

    #[tokio::test]
    async fn test_list_and_evict_owner() {
        let temp = TempDir::new().expect("failed to create temp dir");
        let manager = test_manager(temp.path());

        let keep = crate::identity::resolve_id("alice", "pandas");
        let stale = crate::identity::resolve_id("alice", "numpy");
        let other = crate::identity::resolve_id("bob", "numpy");
        for id in [&keep, &stale, &other, &SandboxId::shared_template()] {
            manager.paths(id).create_root().expect("create root");
        }
        fs::create_dir_all(temp.path().join("x_old_1700000000")).expect("mkdir");

        let listed = manager.list_sandboxes().expect("list");
        assert_eq!(listed.len(), 4);

        let evicted = manager.evict_owner("alice", &keep).await;
        assert_eq!(evicted, 1);
        assert!(manager.paths(&keep).exists());
        assert!(!manager.paths(&stale).exists());
        assert!(manager.paths(&other).exists());
        assert!(manager.paths(&SandboxId::shared_template()).exists());
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let temp = TempDir::new().expect("failed to create temp dir");
        let manager = test_manager(temp.path());
        let id = SandboxId::parse("gone").expect("valid id");
        fake_env(&manager.paths(&id).env_dir);

        assert_eq!(manager.remove(&id).await, RemovalOutcome::Removed);
        assert_eq!(manager.remove(&id).await, RemovalOutcome::Absent);
    }

    #[test]
    fn test_diagnostic_keeps_tail() {
        #[cfg(unix)]
        use std::os::unix::process::ExitStatusExt;
        #[cfg(windows)]
        use std::os::windows::process::ExitStatusExt;

        let output = Output {
            status: std::process::ExitStatus::from_raw(1),
            stdout: b"collected".to_vec(),
            stderr: format!("{}ERROR: boom", "x".repeat(DIAGNOSTIC_TAIL)).into_bytes(),
        };
        let text = diagnostic_text(&output);
        assert!(text.ends_with("ERROR: boom"));
        assert_eq!(text.len(), DIAGNOSTIC_TAIL);
    }
}
