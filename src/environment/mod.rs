//! Environment lifecycle for sandboxes.
//!
//! Every sandbox is a directory under one configured root holding a private
//! Python virtual environment plus a scratch area for the current script and
//! transient image artifacts. Environments are built fresh from a host
//! interpreter or cloned from the shared template and then repaired so that
//! no path inside them still points at the template.
//!
//! # Storage Layout
//!
//! ```text
//! {base_dir}/
//! ├── shared_env/
//! │   ├── venv/                    # template environment (clone source)
//! │   └── .template-ready.json     # readiness marker
//! ├── 3f2a9c10_9b1e44d07a3c52f1/
//! │   ├── venv/                    # per-owner environment
//! │   ├── script.py                # last composed script
//! │   └── plot_1a2b3c4d.png        # transient artifact
//! └── 3f2a9c10_77aa01c3e9d2b4f0_old_1760700000/   # quarantined
//! ```
//!
//! A sandbox is usable only once its interpreter exists. A root directory
//! without one is "absent" as far as callers are concerned, and anything left
//! over from an interrupted build is removed before the next one starts.

mod cleanup;
mod lifecycle;
mod marker;
mod storage;

pub use cleanup::{RemovalOutcome, RemovalPolicy, remove_dir_robust, sweep_quarantine};
pub use lifecycle::{EnvironmentManager, relink_environment};
pub use marker::ReadinessMarker;
pub use storage::{
    ENV_DIR_NAME, MARKER_NAME, SCRIPT_NAME, SandboxPaths, ensure_base_dir, get_default_base_dir,
    interpreter_path,
};

use std::path::PathBuf;
use std::time::Duration;

use crate::identity::SandboxId;

/// Libraries the shared template is seeded with.
pub const DEFAULT_PREINSTALLED_LIBS: &[&str] = &["numpy", "pandas", "matplotlib", "scipy", "seaborn"];

/// Modules the template smoke test imports.
pub const DEFAULT_SMOKE_IMPORTS: &[&str] = &["numpy", "pandas", "matplotlib"];

/// What `ensure` does when the shared template never becomes ready.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReadinessPolicy {
    /// Clone anyway once the polling bound is exhausted.
    #[default]
    Optimistic,
    /// Fail the `ensure` call instead of cloning an unverified template.
    Strict,
}

/// How an [`EnvironmentHandle`] came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvironmentOrigin {
    /// It was already complete; nothing was touched.
    Existing,
    /// Copied from a template and relinked.
    Cloned,
    /// Bootstrapped from a host interpreter.
    Fresh,
}

impl std::fmt::Display for EnvironmentOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Existing => write!(f, "existing"),
            Self::Cloned => write!(f, "cloned"),
            Self::Fresh => write!(f, "fresh"),
        }
    }
}

/// A complete, usable environment.
#[derive(Debug, Clone)]
pub struct EnvironmentHandle {
    /// Sandbox identifier.
    pub id: SandboxId,
    /// Filesystem paths for this sandbox.
    pub paths: SandboxPaths,
    /// Template this sandbox was declared against, if any.
    pub template_id: Option<SandboxId>,
    /// Whether this call reused, cloned or built the environment.
    pub origin: EnvironmentOrigin,
}

impl EnvironmentHandle {
    /// Path of the environment's own interpreter.
    #[must_use]
    pub fn runtime_path(&self) -> &std::path::Path {
        &self.paths.interpreter
    }
}

/// Configuration for environment management.
///
/// # Example
///
/// ```
/// use sandbox_env_manager::environment::{EnvironmentConfig, ReadinessPolicy};
/// use std::time::Duration;
///
/// let config = EnvironmentConfig::default()
///     .with_base_dir("/var/lib/sandboxes")
///     .with_readiness_polling(Duration::from_secs(2), 5)
///     .with_readiness_policy(ReadinessPolicy::Strict);
/// ```
#[derive(Debug, Clone)]
pub struct EnvironmentConfig {
    /// Root directory owning every sandbox.
    pub base_dir: PathBuf,

    /// Id of the shared template.
    pub template_id: SandboxId,

    /// Libraries installed into the template.
    pub preinstalled_libs: Vec<String>,

    /// Modules the template smoke test must import.
    pub smoke_imports: Vec<String>,

    /// Delay between readiness-marker checks.
    ///
    /// Defaults to 5 seconds.
    pub readiness_poll_interval: Duration,

    /// Number of readiness-marker checks before giving up.
    ///
    /// Defaults to 10.
    pub readiness_poll_attempts: u32,

    /// Behaviour once the readiness bound is exhausted.
    pub readiness_policy: ReadinessPolicy,

    /// Whole-tree deletion attempts before quarantining.
    pub cleanup_attempts: u32,

    /// Delay between deletion attempts.
    pub cleanup_delay: Duration,

    /// Timeout for `--version` probes and post-clone checks.
    pub probe_timeout: Duration,

    /// Upper bound for `venv` bootstraps and package installs.
    pub provision_timeout: Duration,

    /// Interpreter to use instead of searching the host.
    pub python: Option<PathBuf>,

    /// Let fresh environments see the host's site-packages.
    pub inherit_system_packages: bool,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            base_dir: get_default_base_dir(),
            template_id: SandboxId::shared_template(),
            preinstalled_libs: DEFAULT_PREINSTALLED_LIBS
                .iter()
                .map(ToString::to_string)
                .collect(),
            smoke_imports: DEFAULT_SMOKE_IMPORTS.iter().map(ToString::to_string).collect(),
            readiness_poll_interval: Duration::from_secs(5),
            readiness_poll_attempts: 10,
            readiness_policy: ReadinessPolicy::Optimistic,
            cleanup_attempts: 3,
            cleanup_delay: Duration::from_secs(1),
            probe_timeout: crate::system::DEFAULT_PROBE_TIMEOUT,
            provision_timeout: Duration::from_secs(30 * 60),
            python: None,
            inherit_system_packages: false,
        }
    }
}

impl EnvironmentConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a configuration from `SANDBOX_PATH`, `SANDBOX_PREINSTALLED_LIBS`
    /// and `SANDBOX_PYTHON`, falling back to defaults.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(libs) = std::env::var("SANDBOX_PREINSTALLED_LIBS") {
            let libs: Vec<String> = libs
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(ToString::to_string)
                .collect();
            if !libs.is_empty() {
                config.preinstalled_libs = libs;
            }
        }
        if let Ok(python) = std::env::var("SANDBOX_PYTHON") {
            if !python.trim().is_empty() {
                config.python = Some(PathBuf::from(python));
            }
        }
        config
    }

    /// Sets the base directory for sandbox storage.
    #[must_use]
    pub fn with_base_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.base_dir = path.into();
        self
    }

    /// Sets the shared template id.
    #[must_use]
    pub fn with_template_id(mut self, id: SandboxId) -> Self {
        self.template_id = id;
        self
    }

    /// Sets the libraries installed into the template.
    #[must_use]
    pub fn with_preinstalled_libs<I, S>(mut self, libs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.preinstalled_libs = libs.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the modules the template smoke test imports.
    #[must_use]
    pub fn with_smoke_imports<I, S>(mut self, modules: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.smoke_imports = modules.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the readiness polling interval and attempt count.
    #[must_use]
    pub fn with_readiness_polling(mut self, interval: Duration, attempts: u32) -> Self {
        self.readiness_poll_interval = interval;
        self.readiness_poll_attempts = attempts;
        self
    }

    /// Sets the readiness policy.
    #[must_use]
    pub fn with_readiness_policy(mut self, policy: ReadinessPolicy) -> Self {
        self.readiness_policy = policy;
        self
    }

    /// Sets the cleanup retry count and delay.
    #[must_use]
    pub fn with_cleanup_retries(mut self, attempts: u32, delay: Duration) -> Self {
        self.cleanup_attempts = attempts;
        self.cleanup_delay = delay;
        self
    }

    /// Sets the probe timeout.
    #[must_use]
    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    /// Sets the bootstrap/install timeout.
    #[must_use]
    pub fn with_provision_timeout(mut self, timeout: Duration) -> Self {
        self.provision_timeout = timeout;
        self
    }

    /// Pins the interpreter used for bootstraps and fallbacks.
    #[must_use]
    pub fn with_python(mut self, python: impl Into<PathBuf>) -> Self {
        self.python = Some(python.into());
        self
    }

    /// Lets fresh environments inherit host site-packages.
    #[must_use]
    pub fn with_inherit_system_packages(mut self, inherit: bool) -> Self {
        self.inherit_system_packages = inherit;
        self
    }

    /// Removal policy derived from the cleanup settings.
    #[must_use]
    pub fn removal_policy(&self) -> RemovalPolicy {
        RemovalPolicy {
            attempts: self.cleanup_attempts,
            delay: self.cleanup_delay,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_config_default() {
        let config = EnvironmentConfig::default();
        assert_eq!(config.template_id.as_str(), "shared_env");
        assert_eq!(config.readiness_poll_interval, Duration::from_secs(5));
        assert_eq!(config.readiness_poll_attempts, 10);
        assert_eq!(config.cleanup_attempts, 3);
        assert_eq!(config.readiness_policy, ReadinessPolicy::Optimistic);
        assert_eq!(
            config.preinstalled_libs,
            vec!["numpy", "pandas", "matplotlib", "scipy", "seaborn"]
        );
        assert!(config.python.is_none());
    }

    #[test]
    fn test_environment_config_builder() {
        let config = EnvironmentConfig::new()
            .with_base_dir("/tmp/test-sandboxes")
            .with_readiness_polling(Duration::from_millis(10), 3)
            .with_readiness_policy(ReadinessPolicy::Strict)
            .with_cleanup_retries(5, Duration::from_millis(1))
            .with_preinstalled_libs(["requests"])
            .with_python("/usr/bin/python3");

        assert_eq!(config.base_dir, PathBuf::from("/tmp/test-sandboxes"));
        assert_eq!(config.readiness_poll_attempts, 3);
        assert_eq!(config.readiness_policy, ReadinessPolicy::Strict);
        assert_eq!(config.removal_policy().attempts, 5);
        assert_eq!(config.preinstalled_libs, vec!["requests"]);
        assert_eq!(config.python, Some(PathBuf::from("/usr/bin/python3")));
    }

    #[test]
    fn test_origin_display() {
        assert_eq!(EnvironmentOrigin::Existing.to_string(), "existing");
        assert_eq!(EnvironmentOrigin::Cloned.to_string(), "cloned");
        assert_eq!(EnvironmentOrigin::Fresh.to_string(), "fresh");
    }
}
