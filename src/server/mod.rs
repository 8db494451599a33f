//! MCP server implementation.
//!
//! This module exposes the sandbox manager as MCP tools over stdio.

mod handler;

pub use handler::{InstallRequest, RunRequest, SandboxRequest, SandboxServer, TopicRequest, run};
