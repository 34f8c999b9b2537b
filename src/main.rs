//! tiered-sandbox daemon
//!
//! MCP server that runs untrusted code on the strongest isolation tier
//! available on this host.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tiered_sandbox::{config::Config, mcp, FallbackSelector};

#[derive(Parser, Debug)]
#[command(name = "tiered-sandbox-daemon")]
#[command(about = "MCP server for tiered sandboxed code execution")]
struct Args {
    /// Run in stdio mode (for MCP clients)
    #[arg(long)]
    stdio: bool,

    /// Print host capabilities as JSON and exit
    #[arg(long, conflicts_with = "stdio")]
    probe: bool,

    /// Path to a JSON configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging (stderr so stdout is free for MCP protocol)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = Config::load(args.config.as_deref()).context("Failed to load configuration")?;

    info!(
        workspace_root = %config.workspace_root.display(),
        disabled = ?config.disabled_backends,
        "Loaded configuration"
    );

    let selector = Arc::new(FallbackSelector::from_config(&config));

    if args.probe {
        let capabilities = selector.capabilities().await;
        println!("{}", serde_json::to_string_pretty(&*capabilities)?);
        return Ok(());
    }

    if args.stdio {
        // Probe up front so the first request does not pay for it.
        let capabilities = selector.capabilities().await;
        let usable: Vec<_> = capabilities
            .iter()
            .filter(|c| c.available)
            .map(|c| c.backend.as_str())
            .collect();
        info!(usable = ?usable, "Host capabilities");

        mcp::serve_stdio(selector).await?;
    } else {
        anyhow::bail!("Use --stdio to serve MCP or --probe to inspect the host");
    }

    Ok(())
}
