//! Sandbox Environment Manager - per-owner Python sandboxes.
//!
//! Each `(owner, topic)` pair gets a private Python virtual environment under
//! one storage root. Environments are cloned from a shared template that is
//! pre-seeded with heavy data-science libraries, so activating a topic does
//! not reinstall them. Code runs as a subprocess with a wall-clock timeout;
//! plots are captured as base64 PNG artifacts.
//!
//! This is not a security boundary: isolation is a private environment
//! directory plus a process timeout.
//!
//! # Example
//!
//! ```no_run
//! use sandbox_env_manager::{EnvironmentConfig, ExecutionConfig, SandboxManager, server};
//!
//! #[tokio::main]
//! async fn main() -> miette::Result<()> {
//!     let manager = SandboxManager::new(EnvironmentConfig::from_env(), ExecutionConfig::from_env());
//!
//!     // Build and verify the shared template
//!     manager.ensure_shared_template_ready().await;
//!
//!     // Start MCP server
//!     server::run(manager).await?;
//!
//!     Ok(())
//! }
//! ```

pub mod environment;
pub mod error;
pub mod identity;
pub mod manager;
pub mod sandbox;
pub mod server;
pub mod system;

// Re-export commonly used types
pub use environment::{EnvironmentConfig, EnvironmentHandle, ReadinessPolicy, RemovalOutcome};
pub use error::{DependencyInstallError, EnvironmentError, Error, ExecutionError, Result};
pub use identity::{SandboxId, resolve_id};
pub use manager::SandboxManager;
pub use sandbox::{ExecutionConfig, ExecutionResult};
