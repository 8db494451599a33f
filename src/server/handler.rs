//! MCP server handler implementation.

use rmcp::{
    ErrorData as McpError, ServiceExt,
    handler::server::{router::tool::ToolRouter, wrapper::Parameters},
    model::{CallToolResult, Content, ServerCapabilities, ServerInfo},
    tool, tool_handler, tool_router,
    transport::stdio,
};
use serde::Deserialize;
use tracing::{debug, info};

use crate::environment::RemovalOutcome;
use crate::error::ServerError;
use crate::identity::SandboxId;
use crate::manager::SandboxManager;

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct TopicRequest {
    /// Owner of the sandbox, e.g. a user id.
    pub owner: String,
    /// Topic label the sandbox is for.
    pub topic: String,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct InstallRequest {
    /// Sandbox id as returned by `resolve_sandbox_id` or `activate_topic`.
    pub sandbox_id: String,
    /// Package names understood by pip.
    pub packages: Vec<String>,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct RunRequest {
    /// Sandbox id as returned by `resolve_sandbox_id` or `activate_topic`.
    pub sandbox_id: String,
    /// Python source to execute.
    pub code: String,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct SandboxRequest {
    /// Sandbox id as returned by `resolve_sandbox_id` or `activate_topic`.
    pub sandbox_id: String,
}

/// The MCP server for sandbox operations.
#[derive(Clone)]
pub struct SandboxServer {
    manager: SandboxManager,
    tool_router: ToolRouter<Self>,
}

impl SandboxServer {
    /// Create a new sandbox server around a manager.
    #[must_use]
    pub fn new(manager: SandboxManager) -> Self {
        Self {
            manager,
            tool_router: Self::tool_router(),
        }
    }
}

fn parse_id(raw: &str) -> Result<SandboxId, McpError> {
    SandboxId::parse(raw).map_err(|e| McpError::invalid_params(e.to_string(), None))
}

#[tool_router]
impl SandboxServer {
    #[tool(description = "Return the deterministic sandbox id for an owner and topic")]
    async fn resolve_sandbox_id(
        &self,
        Parameters(req): Parameters<TopicRequest>,
    ) -> Result<CallToolResult, McpError> {
        let id = self.manager.resolve_id(&req.owner, &req.topic);
        Ok(CallToolResult::success(vec![Content::text(id.to_string())]))
    }

    #[tool(
        description = "Make a topic the owner's active sandbox. Returns its id at once; the owner's other sandboxes are removed and this one is prepared in the background"
    )]
    async fn activate_topic(
        &self,
        Parameters(req): Parameters<TopicRequest>,
    ) -> Result<CallToolResult, McpError> {
        let id = self.manager.init_active_sandbox(&req.owner, &req.topic);
        Ok(CallToolResult::success(vec![Content::text(id.to_string())]))
    }

    #[tool(description = "Install Python packages into a sandbox, creating it first if needed")]
    async fn install_dependencies(
        &self,
        Parameters(req): Parameters<InstallRequest>,
    ) -> Result<CallToolResult, McpError> {
        let id = parse_id(&req.sandbox_id)?;
        match self.manager.install_dependencies(&id, &req.packages).await {
            Ok(()) => Ok(CallToolResult::success(vec![Content::text(format!(
                "Installed: {}",
                req.packages.join(", ")
            ))])),
            Err(e) => Ok(CallToolResult::error(vec![Content::text(e.to_string())])),
        }
    }

    #[tool(
        description = "Run Python code in a sandbox. Returns stdout, stderr and any plots as PNG images"
    )]
    async fn run_code(
        &self,
        Parameters(req): Parameters<RunRequest>,
    ) -> Result<CallToolResult, McpError> {
        let id = parse_id(&req.sandbox_id)?;
        let result = self.manager.run(&id, &req.code).await;

        let summary = serde_json::json!({
            "stdout": result.stdout,
            "stderr": result.stderr,
            "exit_code": result.exit_code,
            "timed_out": result.timed_out,
            "artifacts": result.artifacts.len(),
        });
        let mut content = vec![Content::text(summary.to_string())];
        content.extend(
            result
                .artifacts
                .into_iter()
                .map(|image| Content::image(image, "image/png")),
        );
        Ok(CallToolResult::success(content))
    }

    #[tool(description = "Delete a sandbox and its environment")]
    async fn cleanup_sandbox(
        &self,
        Parameters(req): Parameters<SandboxRequest>,
    ) -> Result<CallToolResult, McpError> {
        let id = parse_id(&req.sandbox_id)?;
        let message = match self.manager.cleanup(&id).await {
            RemovalOutcome::Absent => format!("{id} did not exist"),
            RemovalOutcome::Removed => format!("{id} removed"),
            RemovalOutcome::Quarantined(path) => {
                format!("{id} could not be deleted and was moved to {}", path.display())
            }
            RemovalOutcome::Failed => format!("{id} could not be removed; see server logs"),
        };
        Ok(CallToolResult::success(vec![Content::text(message)]))
    }
}

#[tool_handler]
impl rmcp::ServerHandler for SandboxServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            instructions: Some(
                "Per-owner Python sandboxes. Call activate_topic when a user opens a topic, \
                 install_dependencies before relying on extra packages, then run_code. \
                 Empty stdout with non-empty stderr means the run did not succeed."
                    .into(),
            ),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            ..Default::default()
        }
    }
}

/// Run the MCP server.
///
/// This function starts the server with stdio transport and waits for it to
/// complete, then stops the manager's background work.
///
/// # Errors
///
/// Returns error if server initialization or transport fails.
pub async fn run(manager: SandboxManager) -> crate::error::Result<()> {
    info!("Starting sandbox environment server");
    debug!("Using stdio transport");

    let server = SandboxServer::new(manager.clone());

    let service = server
        .serve(stdio())
        .await
        .map_err(|e| ServerError::InitializationFailed(e.to_string()))?;

    info!("Server initialized, waiting for requests");

    let waited = service
        .waiting()
        .await
        .map_err(|e| ServerError::Transport(e.to_string()));

    manager.shutdown().await;
    waited?;

    info!("Server shutdown complete");
    Ok(())
}
