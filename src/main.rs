//! Sandbox Environment Manager - Entry Point
//!
//! This is the main entry point for the MCP server binary.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use miette::{IntoDiagnostic, Result};
use tracing::{Level, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use sandbox_env_manager::{
    EnvironmentConfig, ExecutionConfig, ReadinessPolicy, SandboxManager, server,
};

/// Sandbox Environment Manager - per-owner Python sandboxes over MCP.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Root directory holding every sandbox
    #[arg(long, env = "SANDBOX_PATH")]
    root: Option<PathBuf>,

    /// Wall-clock limit for one code run, in seconds
    #[arg(long, env = "SANDBOX_EXEC_TIMEOUT_SECS", default_value_t = 600)]
    timeout_secs: u64,

    /// Interpreter used to build environments instead of searching the host
    #[arg(long, env = "SANDBOX_PYTHON")]
    python: Option<PathBuf>,

    /// Libraries the shared template is seeded with
    #[arg(long, env = "SANDBOX_PREINSTALLED_LIBS", value_delimiter = ',')]
    preinstalled_libs: Vec<String>,

    /// Fail activations instead of cloning a template that never became ready
    #[arg(long, default_value = "false")]
    strict_readiness: bool,

    /// Let fresh environments see the host's site-packages
    #[arg(long, default_value = "false")]
    inherit_system_packages: bool,

    /// Do not build or verify the shared template at startup
    #[arg(long, default_value = "false")]
    skip_template: bool,

    /// Enable verbose logging
    #[arg(short, long, default_value = "false")]
    verbose: bool,
}

impl Args {
    fn environment_config(&self) -> EnvironmentConfig {
        let mut config = EnvironmentConfig::default()
            .with_inherit_system_packages(self.inherit_system_packages)
            .with_readiness_policy(if self.strict_readiness {
                ReadinessPolicy::Strict
            } else {
                ReadinessPolicy::Optimistic
            });

        if let Some(root) = &self.root {
            config = config.with_base_dir(root);
        }
        if let Some(python) = &self.python {
            config = config.with_python(python);
        }
        let libs: Vec<&str> = self
            .preinstalled_libs
            .iter()
            .map(|l| l.trim())
            .filter(|l| !l.is_empty())
            .collect();
        if !libs.is_empty() {
            config = config.with_preinstalled_libs(libs);
        }
        config
    }

    fn execution_config(&self) -> ExecutionConfig {
        ExecutionConfig::default().with_timeout(Duration::from_secs(self.timeout_secs.max(1)))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize tracing
    // MCP requires that logs go to stderr (stdout is for JSON-RPC)
    let filter = if args.verbose {
        EnvFilter::from_default_env().add_directive(Level::DEBUG.into())
    } else {
        EnvFilter::from_default_env().add_directive(Level::INFO.into())
    };

    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    info!("Sandbox Environment Manager v{}", env!("CARGO_PKG_VERSION"));

    let environment = args.environment_config();
    info!(root = %environment.base_dir.display(), "Using sandbox root");
    let manager = SandboxManager::new(environment, args.execution_config());

    let swept = manager.sweep_quarantine().await;
    if swept > 0 {
        info!(swept, "Removed quarantined sandboxes from earlier runs");
    }

    if args.skip_template {
        warn!("Skipping shared template setup (--skip-template); activations will build fresh environments");
    } else if !manager.ensure_shared_template_ready().await {
        warn!("Shared template is not ready; activations will wait for it and then proceed per the readiness policy");
    }

    // Run the MCP server
    server::run(manager).await.into_diagnostic()
}
