//! Code execution inside a sandbox.
//!
//! Submitted code is wrapped by [`compose_script`], written to the sandbox's
//! working directory and run by a [`ScriptRunner`] under a wall-clock limit.
//! Images the run leaves behind come back as base64 artifacts.
//!
//! # Example
//!
//! ```no_run
//! use sandbox_env_manager::sandbox::{ExecutionConfig, ScriptRunner};
//! use std::path::Path;
//!
//! # async fn demo() {
//! let runner = ScriptRunner::new(ExecutionConfig::default());
//! let result = runner
//!     .run(Path::new("/data/sandbox/abc/venv/bin/python"), Path::new("/data/sandbox/abc"), "x = 2 + 2")
//!     .await;
//!
//! assert_eq!(result.stdout.trim(), "x = 4");
//! # }
//! ```

mod artifacts;
mod config;
mod runner;
mod shim;

pub use artifacts::{harvest_artifacts, purge_artifacts};
pub use config::{DEFAULT_EXEC_TIMEOUT, ExecutionConfig};
pub use runner::{ExecutionResult, ScriptRunner};
pub use shim::{PLOT_SHIM, auto_display_targets, compose_script};
