//! Bastion SSH Gateway
//!
//! An SSH bastion that runs every user session inside a per-account Docker
//! sandbox, records it for replay, and lets sandboxes reach target hosts
//! only through grants.

mod auth;
mod config;
mod directory;
mod docker;
mod error;
mod grant;
mod keys;
mod recorder;
mod relay;
mod replay;
mod request;
mod sandbox;
mod session;
mod ssh;
mod state;
mod tunnel;

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;

use crate::config::GatewayConfig;
use crate::directory::{Directory, NodeService};
use crate::docker::DockerRuntime;
use crate::sandbox::SandboxManager;
use crate::state::{FileReplayStore, LocalDirectory};
use crate::tunnel::SshConnector;

/// Bastion SSH Gateway - sandboxed, recorded SSH access to target hosts
#[derive(Parser, Debug)]
#[command(name = "bastion-gateway", version, about)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/bastion/gateway.toml")]
    config: PathBuf,

    /// Generate default configuration and exit
    #[arg(long)]
    generate_config: bool,

    /// Override listen address
    #[arg(short, long)]
    listen: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Play back a recorded session and exit
    #[arg(long, value_name = "SESSION_ID")]
    replay: Option<i64>,

    /// Install the gateway's client keys on every key-managed node and exit
    #[arg(long)]
    override_keys: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new(Level::DEBUG.to_string())
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(Level::INFO.to_string()))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    // Handle --generate-config
    if cli.generate_config {
        let config = GatewayConfig::default();
        let content = toml::to_string_pretty(&config)?;
        println!("{}", content);
        return Ok(());
    }

    // Load configuration
    let mut config = GatewayConfig::load_or_default(&cli.config)
        .with_context(|| format!("Failed to load config from {}", cli.config.display()))?;

    // Apply CLI overrides
    if let Some(listen) = cli.listen {
        config.listen_addr = listen;
    }

    if let Some(session_id) = cli.replay {
        return replay_session(&config, session_id).await;
    }

    // Ensure required directories exist
    config.ensure_dirs()?;

    let store = Arc::new(
        LocalDirectory::load(config.state_file.clone())
            .await
            .context("Failed to load state")?,
    );
    info!("State loaded from {}", config.state_file.display());

    let client_keys = keys::load_client_keys(&config.client_key_paths).await?;
    let connector = Arc::new(SshConnector::new(client_keys, config.target_user.clone()));

    if cli.override_keys {
        return override_keys(store.as_ref(), &connector).await;
    }

    info!("Starting bastion-gateway");
    info!("  Listen address: {}", config.listen_addr);
    info!("  Sandbox image: {}", config.sandbox_image);
    info!("  Sandbox directory: {}", config.sandbox_dir.display());
    info!("  Sandbox egress: {}", config.sandbox_egress);

    let config = Arc::new(config);
    let replays = Arc::new(FileReplayStore::new(config.replay_dir.clone()));
    let directory = Directory::from_store(store, replays);

    // Initialize Docker sandbox runtime
    let runtime = Arc::new(
        DockerRuntime::connect()
            .await
            .context("Failed to initialize Docker sandbox runtime")?,
    );
    let sandboxes = Arc::new(SandboxManager::new(runtime, &config)?);

    let gateway = Arc::new(ssh::Gateway::new(config, directory, sandboxes, connector)?);

    tokio::select! {
        result = ssh::run_server(gateway) => result?,
        _ = shutdown_signal() => info!("Shutting down"),
    }

    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// Play a recorded session to the terminal.
async fn replay_session(config: &GatewayConfig, session_id: i64) -> Result<()> {
    let path = FileReplayStore::new(config.replay_dir.clone()).path_for(session_id);
    let file = tokio::fs::File::open(&path)
        .await
        .with_context(|| format!("No replay for session {} at {}", session_id, path.display()))?;

    let mut reader = tokio::io::BufReader::new(file);
    let mut stdout = tokio::io::stdout();
    let mut stderr = tokio::io::stderr();
    let played = replay::play(&mut reader, session_id, &mut stdout, &mut stderr)
        .await
        .with_context(|| format!("Failed to play {}", path.display()))?;

    info!("Played {} frames of session {}", played, session_id);
    Ok(())
}

/// Replace `authorized_keys` on every key-managed node. Per-node failures
/// are logged and skipped.
async fn override_keys(nodes: &dyn NodeService, connector: &SshConnector) -> Result<()> {
    let nodes = nodes.list_nodes().await?;
    let mut failed = 0;
    for node in nodes.iter().filter(|node| node.key_managed) {
        match connector.override_authorized_keys(&node.address).await {
            Ok(()) => info!(hostname = %node.hostname, "Keys overridden"),
            Err(e) => {
                failed += 1;
                warn!(hostname = %node.hostname, "Failed to override keys: {:#}", e);
            }
        }
    }
    info!("Key override finished, {} node(s) failed", failed);
    Ok(())
}
