//! Process-wide sandbox manager.
//!
//! [`SandboxManager`] is the facade collaborators use. It is cheap to clone
//! and shares one environment manager, one script runner, one background task
//! tracker and one activation registry between all clones.
//!
//! Error surfacing follows one rule: only [`SandboxManager::install_dependencies`]
//! returns an error to the caller. Runs report failures in-band, cleanup and
//! background activation log them.

mod registry;

pub use registry::ActivationRegistry;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, debug, error, info, info_span, instrument, warn};

use crate::environment::{
    EnvironmentConfig, EnvironmentHandle, EnvironmentManager, ReadinessMarker, RemovalOutcome,
    sweep_quarantine,
};
use crate::error::{DependencyInstallError, EnvironmentError};
use crate::identity::{self, SandboxId};
use crate::sandbox::{ExecutionConfig, ExecutionResult, ScriptRunner};

/// stderr of a run for which no interpreter could be found.
pub const RUNTIME_UNAVAILABLE: &str =
    "Python runtime unavailable: no interpreter found for this sandbox.";

/// Line the template smoke test prints on success.
const SMOKE_OK: &str = "Libs OK";

/// Shared, cloneable handle to the sandbox subsystem.
///
/// # Example
///
/// ```no_run
/// use sandbox_env_manager::{EnvironmentConfig, ExecutionConfig, SandboxManager};
///
/// # async fn demo() {
/// let manager = SandboxManager::new(EnvironmentConfig::from_env(), ExecutionConfig::from_env());
/// manager.ensure_shared_template_ready().await;
///
/// let id = manager.init_active_sandbox("42", "Linear Regression");
/// let result = manager.run(&id, "x = 2 + 2").await;
/// println!("{}", result.stdout);
///
/// manager.shutdown().await;
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct SandboxManager {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    environments: EnvironmentManager,
    runner: ScriptRunner,
    tasks: TaskTracker,
    shutdown: CancellationToken,
    activations: ActivationRegistry,
    /// Template each sandbox was last ensured against.
    declared_templates: Mutex<HashMap<SandboxId, SandboxId>>,
}

impl SandboxManager {
    /// Creates a manager. Nothing touches the filesystem until first use.
    #[must_use]
    pub fn new(environment: EnvironmentConfig, execution: ExecutionConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                environments: EnvironmentManager::new(environment),
                runner: ScriptRunner::new(execution),
                tasks: TaskTracker::new(),
                shutdown: CancellationToken::new(),
                activations: ActivationRegistry::new(),
                declared_templates: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// The underlying environment manager.
    #[must_use]
    pub fn environments(&self) -> &EnvironmentManager {
        &self.inner.environments
    }

    /// The environment configuration.
    #[must_use]
    pub fn config(&self) -> &EnvironmentConfig {
        self.inner.environments.config()
    }

    /// Maps an `(owner, topic)` pair to its sandbox id.
    #[must_use]
    pub fn resolve_id(&self, owner: &str, topic: &str) -> SandboxId {
        identity::resolve_id(owner, topic)
    }

    /// Makes sure `id` has a complete environment, cloning from `template`
    /// when possible. Idempotent.
    ///
    /// # Errors
    ///
    /// See [`EnvironmentManager::ensure`].
    pub async fn ensure(
        &self,
        id: &SandboxId,
        template: Option<&SandboxId>,
    ) -> Result<EnvironmentHandle, EnvironmentError> {
        if let Some(template) = template {
            self.declared().insert(id.clone(), template.clone());
        }
        self.inner.environments.ensure(id, template).await
    }

    /// Builds the environment if needed, then installs `packages` into it.
    ///
    /// # Errors
    ///
    /// Returns a [`DependencyInstallError`] carrying the installer's
    /// diagnostic text. This is the one operation whose failure is raised.
    #[instrument(skip(self), fields(id = %id))]
    pub async fn install_dependencies(
        &self,
        id: &SandboxId,
        packages: &[String],
    ) -> Result<(), DependencyInstallError> {
        let template = self.declared_template(id);
        if let Err(e) = self.ensure(id, template.as_ref()).await {
            error!(error = %e, "Cannot install without an environment");
            return Err(DependencyInstallError::EnvironmentUnavailable { id: id.to_string() });
        }
        self.inner.environments.install(id, packages).await
    }

    /// Runs `code` in the sandbox. Never fails; problems land in `stderr`.
    ///
    /// The interpreter is the sandbox's own if built, else its declared
    /// template's, else one discovered on the host. The sandbox root is
    /// created as a working directory even when no environment exists; such
    /// a scratch-only sandbox shows up in listings and is evicted like any
    /// other.
    #[instrument(skip(self, code), fields(id = %id))]
    pub async fn run(&self, id: &SandboxId, code: &str) -> ExecutionResult {
        info!("Preparing to run code");
        let paths = self.inner.environments.paths(id);
        if let Err(e) = paths.create_root() {
            error!(error = %e, "Cannot prepare sandbox directory");
            return ExecutionResult::failure(e.to_string());
        }

        let Some(interpreter) = self.resolve_interpreter(id).await else {
            warn!("No interpreter for sandbox");
            return ExecutionResult::failure(RUNTIME_UNAVAILABLE);
        };

        self.inner.runner.run(&interpreter, &paths.root, code).await
    }

    async fn resolve_interpreter(&self, id: &SandboxId) -> Option<PathBuf> {
        let environments = &self.inner.environments;

        let own = environments.paths(id);
        if own.is_complete() {
            return Some(own.interpreter);
        }

        if let Some(template) = self.declared_template(id) {
            let template = environments.paths(&template);
            if template.is_complete() {
                debug!("Sandbox not built yet, using its template's interpreter");
                return Some(template.interpreter);
            }
        }

        debug!("Falling back to host runtime discovery");
        environments
            .locator()
            .find_runtime()
            .await
            .map(|runtime| runtime.path)
    }

    /// Removes a sandbox. Never fails; the outcome is informational.
    #[instrument(skip(self), fields(id = %id))]
    pub async fn cleanup(&self, id: &SandboxId) -> RemovalOutcome {
        info!("Cleaning up sandbox");
        self.declared().remove(id);
        self.inner.environments.remove(id).await
    }

    /// Starts activating the `(owner, topic)` sandbox in the background and
    /// returns its id immediately.
    ///
    /// The task evicts the owner's other sandboxes, then ensures the target,
    /// cloning from the shared template. Its failures are logged only. A
    /// newer activation for the same owner cancels this one.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn init_active_sandbox(&self, owner: &str, topic: &str) -> SandboxId {
        let id = identity::resolve_id(owner, topic);
        let (token, generation) = self
            .inner
            .activations
            .insert(owner, &id, &self.inner.shutdown);

        let manager = self.clone();
        let owner = owner.to_string();
        let target = id.clone();
        let span = info_span!("activation", sandbox = %id);

        self.inner.tasks.spawn(
            async move {
                tokio::select! {
                    () = token.cancelled() => debug!("Activation cancelled"),
                    () = manager.activate(&owner, &target) => {}
                }
                manager.inner.activations.finish(&owner, generation);
            }
            .instrument(span),
        );

        id
    }

    async fn activate(&self, owner: &str, target: &SandboxId) {
        info!("Initializing sandbox from shared template");

        let evicted = self.inner.environments.evict_owner(owner, target).await;
        if evicted > 0 {
            debug!(evicted, "Evicted inactive sandboxes");
        }

        let template = self.config().template_id.clone();
        match self.ensure(target, Some(&template)).await {
            Ok(handle) => info!(origin = %handle.origin, "Sandbox ready"),
            Err(e) => error!(error = %e, "Failed to initialize sandbox"),
        }
    }

    /// Builds or validates the shared template. Idempotent startup hook.
    ///
    /// The template is smoke-tested by importing the configured modules. If
    /// that fails, the marker is removed, the preinstalled libraries are
    /// installed and the test is repeated. The marker is written only after a
    /// passing test. Returns whether the template ended up ready.
    #[instrument(skip(self), fields(template = %self.config().template_id))]
    pub async fn ensure_shared_template_ready(&self) -> bool {
        let config = self.config();
        let template = config.template_id.clone();
        info!("Checking shared sandbox");

        let handle = match self.inner.environments.ensure(&template, None).await {
            Ok(handle) => handle,
            Err(e) => {
                error!(error = %e, "Shared template could not be built");
                return false;
            }
        };
        let marker = &handle.paths.marker_file;

        if self.smoke_test(&handle).await {
            info!("Shared sandbox libraries verified");
        } else {
            if let Err(e) = ReadinessMarker::remove(marker) {
                warn!(error = %e, "Failed to clear stale readiness marker");
            }
            info!(libraries = ?config.preinstalled_libs, "Shared sandbox missing libraries, installing");
            if let Err(e) = self
                .inner
                .environments
                .install(&template, &config.preinstalled_libs)
                .await
            {
                error!(error = %e, "Failed to install shared libs");
                return false;
            }
            if !self.smoke_test(&handle).await {
                error!("Shared sandbox still fails its import check after install");
                return false;
            }
            info!("Shared sandbox libraries installed successfully");
        }

        if ReadinessMarker::is_ready(marker) {
            return true;
        }
        match ReadinessMarker::new(&template, &config.preinstalled_libs).save(marker) {
            Ok(()) => true,
            Err(e) => {
                error!(error = %e, "Failed to write readiness marker");
                false
            }
        }
    }

    async fn smoke_test(&self, handle: &EnvironmentHandle) -> bool {
        let script = smoke_script(&self.config().smoke_imports);
        let result = self
            .inner
            .runner
            .run(handle.runtime_path(), &handle.paths.root, &script)
            .await;
        let passed = result.stdout.contains(SMOKE_OK);
        if !passed {
            debug!(stderr = %result.stderr.trim(), "Template smoke test failed");
        }
        passed
    }

    /// Cancels the in-flight activation of `owner`. Returns whether one existed.
    pub fn cancel_activation(&self, owner: &str) -> bool {
        self.inner.activations.cancel(owner)
    }

    /// Sandbox currently being activated for `owner`, if any.
    #[must_use]
    pub fn pending_activation(&self, owner: &str) -> Option<SandboxId> {
        self.inner.activations.active(owner)
    }

    /// Waits for every background activation started so far to finish.
    pub async fn wait_for_background(&self) {
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
        self.inner.tasks.reopen();
    }

    /// Cancels all background work and waits for it to stop.
    pub async fn shutdown(&self) {
        debug!(pending = self.inner.tasks.len(), "Shutting down sandbox manager");
        self.inner.shutdown.cancel();
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
    }

    /// Lists sandbox ids under the root, scratch-only ones included.
    ///
    /// See [`EnvironmentManager::list_sandboxes`].
    ///
    /// # Errors
    ///
    /// Returns `EnvironmentError::IoError` if the root cannot be read.
    pub fn list_sandboxes(&self) -> Result<Vec<SandboxId>, EnvironmentError> {
        self.inner.environments.list_sandboxes()
    }

    /// Deletes quarantined directories left by earlier runs.
    pub async fn sweep_quarantine(&self) -> usize {
        let config = self.config();
        sweep_quarantine(&config.base_dir, config.removal_policy()).await
    }

    fn declared_template(&self, id: &SandboxId) -> Option<SandboxId> {
        self.declared().get(id).cloned()
    }

    fn declared(&self) -> std::sync::MutexGuard<'_, HashMap<SandboxId, SandboxId>> {
        self.inner
            .declared_templates
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

fn smoke_script(imports: &[String]) -> String {
    let mut script: String = imports.iter().map(|m| format!("import {m}; ")).collect();
    script.push_str(&format!("print('{SMOKE_OK}')"));
    script
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    fn test_manager(base: &std::path::Path) -> SandboxManager {
        SandboxManager::new(
            EnvironmentConfig::default()
                .with_base_dir(base)
                .with_python("/definitely/not/python3")
                .with_readiness_polling(Duration::from_millis(5), 2)
                .with_cleanup_retries(1, Duration::from_millis(1)),
            ExecutionConfig::default(),
        )
    }

    #[test]
    fn test_smoke_script() {
        let imports = vec!["numpy".to_string(), "pandas".to_string(), "matplotlib".to_string()];
        assert_eq!(
            smoke_script(&imports),
            "import numpy; import pandas; import matplotlib; print('Libs OK')"
        );
        assert_eq!(smoke_script(&[]), "print('Libs OK')");
    }

    #[tokio::test]
    async fn test_run_without_runtime_is_in_band() {
        let temp = TempDir::new().expect("failed to create temp dir");
        let manager = test_manager(temp.path());
        let id = manager.resolve_id("alice", "pandas");

        let result = manager.run(&id, "print('hi')").await;
        assert!(result.stdout.is_empty());
        assert_eq!(result.stderr, RUNTIME_UNAVAILABLE);
        assert!(result.artifacts.is_empty());
    }

    #[tokio::test]
    async fn test_install_without_runtime_is_raised() {
        let temp = TempDir::new().expect("failed to create temp dir");
        let manager = test_manager(temp.path());
        let id = manager.resolve_id("alice", "pandas");

        let err = manager
            .install_dependencies(&id, &["numpy".to_string()])
            .await
            .expect_err("no runtime");
        assert!(matches!(
            err,
            DependencyInstallError::EnvironmentUnavailable { .. }
        ));
    }

    #[tokio::test]
    async fn test_background_activation_evicts_and_never_raises() {
        let temp = TempDir::new().expect("failed to create temp dir");
        let manager = test_manager(temp.path());
        let stale = manager.resolve_id("alice", "numpy");
        manager
            .environments()
            .paths(&stale)
            .create_root()
            .expect("create root");

        let id = manager.init_active_sandbox("alice", "pandas");
        assert_eq!(id, manager.resolve_id("alice", "pandas"));
        manager.wait_for_background().await;

        assert!(!manager.environments().paths(&stale).exists());
        // No runtime: the target stays incomplete but nothing panicked.
        assert!(!manager.environments().paths(&id).is_complete());
        assert!(manager.pending_activation("alice").is_none());
    }

    #[tokio::test]
    async fn test_cleanup_never_raises() {
        let temp = TempDir::new().expect("failed to create temp dir");
        let manager = test_manager(temp.path());
        let id = manager.resolve_id("bob", "scipy");

        assert_eq!(manager.cleanup(&id).await, RemovalOutcome::Absent);
        manager.environments().paths(&id).create_root().expect("create root");
        assert_eq!(manager.cleanup(&id).await, RemovalOutcome::Removed);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_background() {
        let temp = TempDir::new().expect("failed to create temp dir");
        let manager = SandboxManager::new(
            EnvironmentConfig::default()
                .with_base_dir(temp.path())
                .with_python("/definitely/not/python3")
                .with_readiness_polling(Duration::from_secs(60), 10),
            ExecutionConfig::default(),
        );

        manager.init_active_sandbox("carol", "seaborn");
        tokio::time::timeout(Duration::from_secs(5), manager.shutdown())
            .await
            .expect("shutdown should not wait for the readiness poll");
    }
}
