//! Manifold — MCP aggregation gateway with forensic traffic capture.
//!
//! `manifold serve` discovers every configured downstream server, then
//! exposes them behind `ALL /mcp/{serverName}` with session multiplexing
//! and per-exchange audit capture.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use manifold::{Gateway, ManifoldConfig, TracingAuditSink};
use tracing_subscriber::EnvFilter;

/// Manifold — MCP aggregation gateway with forensic traffic capture.
#[derive(Parser)]
#[command(
    name = "manifold",
    version,
    about = "Manifold — MCP aggregation gateway with forensic traffic capture"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Discover all configured servers and serve the aggregated endpoint
    Serve {
        /// Path to manifold.toml config file [default: ./manifold.toml or ~/.config/manifold/manifold.toml]
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// HTTP port to listen on
        #[arg(short, long, default_value = "3000")]
        port: u16,
        /// Bind address
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // RUST_LOG controls verbosity; logs go to stderr so stdout stays clean
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { config, port, host } => {
            let config = resolve_config(config)?;
            run_serve(config, host, port).await?;
        }
    }

    Ok(())
}

/// Discover all configured servers, start the gateway, and block until
/// ctrl-c triggers a graceful stop.
async fn run_serve(config_path: PathBuf, host: String, port: u16) -> Result<()> {
    let config = load_config(&config_path).await?;

    // Audit events are emitted as structured log records until a storage
    // service is wired in as the sink.
    let sink = Arc::new(TracingAuditSink::new());
    let gateway = Gateway::discover(config, sink)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to start Manifold gateway: {}", e))?;

    let addr = format!("{}:{}", host, port);
    let handle = gateway
        .serve(&addr)
        .await
        .map_err(|e| anyhow::anyhow!("Manifold gateway error: {}", e))?;

    tracing::info!(
        "Connect MCP clients to http://{}/mcp/{{serverName}}",
        handle.local_addr()
    );

    tokio::signal::ctrl_c().await.ok();
    tracing::info!("Shutting down Manifold...");
    handle.stop().await;

    Ok(())
}

/// Resolve config file path: explicit flag → ./manifold.toml → ~/.config/manifold/manifold.toml.
fn resolve_config(explicit: Option<PathBuf>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(path);
    }

    let local = Path::new("manifold.toml");
    if local.exists() {
        return Ok(local.to_path_buf());
    }

    if let Some(config_dir) = dirs::config_dir() {
        let xdg = config_dir.join("manifold").join("manifold.toml");
        if xdg.exists() {
            return Ok(xdg);
        }
    }

    Err(anyhow::anyhow!(
        "No manifold.toml found. Searched ./manifold.toml and ~/.config/manifold/manifold.toml. \
         Use --config to specify a path."
    ))
}

/// Load and parse a manifold.toml config file.
async fn load_config(config_path: &PathBuf) -> Result<ManifoldConfig> {
    let content = tokio::fs::read_to_string(config_path)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to read config file {:?}: {}", config_path, e))?;
    let config: ManifoldConfig = toml::from_str(&content)
        .map_err(|e| anyhow::anyhow!("Failed to parse config file {:?}: {}", config_path, e))?;
    Ok(config)
}
