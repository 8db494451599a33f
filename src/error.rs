//! Error types for the sandbox environment manager.
//!
//! Uses thiserror for deriving std::error::Error and miette for rich diagnostics.
//!
//! Only two families of errors ever reach callers of the public facade:
//! [`DependencyInstallError`] (installs must interrupt the caller) and the
//! [`Error`] wrapper returned by the server and startup paths. Environment
//! and execution errors are recovered or folded into in-band results inside
//! the manager.

use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

/// Top-level error type for the application.
#[derive(Error, Debug, Diagnostic)]
pub enum Error {
    /// Environment lifecycle error
    #[error("Environment error")]
    #[diagnostic(code(sem::environment))]
    Environment(#[from] EnvironmentError),

    /// Dependency installation error
    #[error("Dependency installation error")]
    #[diagnostic(code(sem::install))]
    Install(#[from] DependencyInstallError),

    /// MCP server error
    #[error("MCP server error")]
    #[diagnostic(code(sem::server))]
    Server(#[from] ServerError),

    /// I/O error
    #[error("I/O error: {0}")]
    #[diagnostic(code(sem::io))]
    Io(#[from] std::io::Error),
}

/// Errors raised while creating, cloning or inspecting an environment.
#[derive(Error, Debug, Diagnostic)]
pub enum EnvironmentError {
    /// No interpreter could be located or validated.
    #[error("No usable Python runtime found")]
    #[diagnostic(
        code(sem::environment::runtime_unavailable),
        help("Install Python 3 or point SANDBOX_PYTHON at an interpreter")
    )]
    RuntimeUnavailable,

    /// Copying or repairing a template clone failed.
    #[error("Failed to clone template {template} into {id}: {reason}")]
    #[diagnostic(code(sem::environment::clone))]
    CloneFailed {
        template: String,
        id: String,
        reason: String,
    },

    /// Bootstrapping a fresh environment failed.
    #[error("Failed to bootstrap environment at {}: {reason}", path.display())]
    #[diagnostic(code(sem::environment::bootstrap))]
    BootstrapFailed { path: PathBuf, reason: String },

    /// The shared template never became ready (strict readiness only).
    #[error("Template {template} was not ready after {attempts} checks")]
    #[diagnostic(
        code(sem::environment::template_not_ready),
        help("Run the shared template startup hook before activating sandboxes")
    )]
    TemplateNotReady { template: String, attempts: u32 },

    /// A caller-supplied id is not a safe directory name.
    #[error("Invalid sandbox id {id:?}: {reason}")]
    #[diagnostic(
        code(sem::environment::invalid_id),
        help("Ids may contain ASCII letters, digits, '_' and '-' only")
    )]
    InvalidId { id: String, reason: String },

    /// The readiness marker exists but cannot be parsed.
    #[error("Invalid readiness marker: {reason}")]
    #[diagnostic(code(sem::environment::marker))]
    InvalidMarker { reason: String },

    /// Generic I/O failure with context.
    #[error("I/O error: {context}")]
    #[diagnostic(code(sem::environment::io))]
    IoError {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

/// Errors surfaced by dependency installation.
#[derive(Error, Debug, Diagnostic)]
pub enum DependencyInstallError {
    /// The environment could not be built before installing.
    #[error("Sandbox {id} has no usable environment")]
    #[diagnostic(
        code(sem::install::environment_unavailable),
        help("Check that a Python runtime with the venv module is installed")
    )]
    EnvironmentUnavailable { id: String },

    /// The package manager could not be spawned.
    #[error("Failed to launch package installer: {0}")]
    #[diagnostic(code(sem::install::spawn))]
    Spawn(#[source] std::io::Error),

    /// The package manager ran and reported failure.
    #[error("Installing {packages} failed (exit code {exit_code:?}): {diagnostic}")]
    #[diagnostic(code(sem::install::failed))]
    InstallFailed {
        packages: String,
        exit_code: Option<i32>,
        diagnostic: String,
    },
}

/// Errors from a single code execution.
///
/// These never escape [`crate::SandboxManager::run`]; they are rendered into
/// the stderr field of an [`crate::ExecutionResult`].
#[derive(Error, Debug, Diagnostic)]
pub enum ExecutionError {
    /// Failed to write the composed script.
    #[error("failed to write script {}: {source}", path.display())]
    #[diagnostic(code(sem::execution::script))]
    ScriptWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Failed to spawn the interpreter.
    #[error("failed to spawn {}: {source}", program.display())]
    #[diagnostic(code(sem::execution::spawn))]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Wall-clock timeout exceeded.
    #[error("Execution timed out.")]
    #[diagnostic(code(sem::execution::timeout))]
    Timeout { timeout_seconds: u64 },

    /// Waiting on the child failed.
    #[error("failed to wait for interpreter: {0}")]
    #[diagnostic(code(sem::execution::wait))]
    Wait(#[source] std::io::Error),
}

/// Errors related to the MCP server.
#[derive(Error, Debug, Diagnostic)]
pub enum ServerError {
    /// Failed to initialize server
    #[error("Failed to initialize MCP server: {0}")]
    #[diagnostic(code(sem::server::init))]
    InitializationFailed(String),

    /// Transport error
    #[error("Transport error: {0}")]
    #[diagnostic(code(sem::server::transport))]
    Transport(String),
}

/// Result type alias for this crate.
pub type Result<T> = std::result::Result<T, Error>;
