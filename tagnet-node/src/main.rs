// Tagnet daemon: launch a peer, optionally sweep the LAN, then serve until shutdown.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tagnet_node::{config, PeerProcess, PeerQuery};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "tagnet", version, about = "Run a tagnet peer")]
struct Cli {
    /// Config file; replaces the default search paths.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Group to join.
    #[arg(long)]
    group: Option<String>,

    /// Advertise this peer as a hub.
    #[arg(long)]
    hub: bool,

    /// First port to try.
    #[arg(long)]
    port: Option<u16>,

    /// Number of ports to try after `--port`.
    #[arg(long)]
    port_range: Option<u16>,

    /// Sweep for peers after launch and print what was found.
    #[arg(long)]
    scan: bool,

    /// Restrict the sweep to this host.
    #[arg(long, requires = "scan")]
    on_host: bool,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("tagnet=info,tagnet_node=info,tagnet_core=info")),
        )
        .init();

    let cli = Cli::parse();
    let mut cfg = match &cli.config {
        Some(path) => {
            let mut c = config::load_from(path)?;
            config::apply_env(&mut c, |key| std::env::var(key).ok());
            c
        }
        None => config::load(),
    };
    if let Some(group) = cli.group {
        cfg.group = group;
    }
    if cli.hub {
        cfg.hub = true;
    }
    if let Some(port) = cli.port {
        cfg.port_start = port;
    }
    if let Some(range) = cli.port_range {
        cfg.port_range = range;
    }

    let peer = PeerProcess::launch(cfg).context("failed to launch peer")?;

    if cli.scan {
        let mut query = PeerQuery::new().group(peer.identity().group.clone());
        if cli.on_host {
            query = query.on_host();
        }
        let found = peer.get_peers(&query);
        println!("{}", serde_json::to_string_pretty(&found)?);
    }

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    rt.block_on(shutdown_signal())?;
    tracing::info!(peer = %peer.id(), "shutting down");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix). The server threads exit with the process.
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
