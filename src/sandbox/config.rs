//! Configuration for code execution.

use std::collections::HashMap;
use std::time::Duration;

/// Default wall-clock limit for one run.
pub const DEFAULT_EXEC_TIMEOUT: Duration = Duration::from_secs(600);

/// Configuration for running code in a sandbox.
///
/// Use the builder methods to customize execution.
///
/// # Example
///
/// ```
/// use sandbox_env_manager::sandbox::ExecutionConfig;
/// use std::time::Duration;
///
/// let config = ExecutionConfig::default()
///     .with_env("OMP_NUM_THREADS", "1")
///     .with_timeout(Duration::from_secs(60));
/// ```
#[derive(Debug, Clone)]
pub struct ExecutionConfig {
    /// Environment variables set for the interpreter, on top of the host's.
    pub env_vars: HashMap<String, String>,

    /// Maximum time allowed for one run.
    pub timeout: Duration,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            env_vars: HashMap::new(),
            timeout: DEFAULT_EXEC_TIMEOUT,
        }
    }
}

impl ExecutionConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads `SANDBOX_EXEC_TIMEOUT_SECS`; unparsable or zero values keep the default.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(secs) = std::env::var("SANDBOX_EXEC_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .filter(|secs| *secs > 0)
        {
            config.timeout = Duration::from_secs(secs);
        }
        config
    }

    /// Adds an environment variable.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_vars.insert(key.into(), value.into());
        self
    }

    /// Adds multiple environment variables from an iterator.
    #[must_use]
    pub fn with_envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (k, v) in vars {
            self.env_vars.insert(k.into(), v.into());
        }
        self
    }

    /// Sets the execution timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}
