//! tokendb-gateway - Token-authenticated database gateway
//!
//! This binary runs the gateway as a standalone process:
//! - One listener per configured protocol port
//! - Credentials resolved per connection through the control plane
//! - Sessions relayed and recorded until the process is stopped

use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info};

use tokendb_gateway::config::{self, ControlPlaneConfig};
use tokendb_gateway::{spawn_heartbeat, DatabaseProtocol, Gateway, Listener, Result};

#[derive(Parser)]
#[command(name = "tokendb-gateway")]
#[command(version)]
#[command(about = "Token-authenticated MySQL/PostgreSQL gateway")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: PathBuf,

    /// Override listen address
    #[arg(long)]
    listen_address: Option<String>,

    /// Override MySQL listen port
    #[arg(long)]
    mysql_port: Option<u16>,

    /// Override PostgreSQL listen port
    #[arg(long)]
    postgres_port: Option<u16>,

    /// Enable verbose/debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = config::load_config(&cli.config)?;

    // Priority: --verbose flag, then RUST_LOG env var, then config, then "info"
    let mut log_level = if cli.verbose {
        "debug".to_string()
    } else {
        std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone())
    };
    if config.logging.protocol_debug {
        log_level.push_str(",tokendb_gateway::wire=trace");
    }
    tracing_subscriber::fmt().with_env_filter(&log_level).init();

    info!("Starting tokendb-gateway v{}", env!("CARGO_PKG_VERSION"));
    info!("Loaded configuration from {:?}", cli.config);

    // Apply CLI overrides
    if let Some(addr) = cli.listen_address {
        config.server.listen_address = addr;
    }
    if cli.mysql_port.is_some() {
        config.server.mysql_port = cli.mysql_port;
    }
    if cli.postgres_port.is_some() {
        config.server.postgres_port = cli.postgres_port;
    }

    let heartbeat_interval = match &config.control_plane {
        ControlPlaneConfig::Http(http) if http.heartbeat_interval_secs > 0 => {
            Some(Duration::from_secs(http.heartbeat_interval_secs))
        }
        _ => None,
    };
    let ports = [
        (DatabaseProtocol::MySql, config.server.mysql_port),
        (DatabaseProtocol::Postgres, config.server.postgres_port),
    ];

    let gateway = Arc::new(Gateway::from_config(config).await?);

    // Create shutdown channel
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let mut listener_handles = Vec::new();
    let mut stats = Vec::new();
    for (protocol, port) in ports {
        let Some(port) = port else { continue };
        let listener =
            Listener::bind(Arc::clone(&gateway), protocol, port, shutdown_tx.subscribe()).await?;
        stats.push(listener.stats());
        listener_handles.push(tokio::spawn(async move {
            if let Err(e) = listener.run().await {
                error!("{} listener error: {}", protocol, e);
            }
        }));
    }

    let heartbeat = heartbeat_interval.map(|interval| {
        spawn_heartbeat(
            Arc::clone(gateway.control_plane()),
            Arc::clone(gateway.registry()),
            interval,
            shutdown_tx.subscribe(),
        )
    });

    info!("Gateway ready");

    // Wait for shutdown signal
    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Received Ctrl+C, initiating shutdown...");
        }
        _ = async {
            #[cfg(unix)]
            {
                let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
                    .expect("Failed to install SIGTERM handler");
                sigterm.recv().await;
            }
            #[cfg(not(unix))]
            {
                std::future::pending::<()>().await;
            }
        } => {
            info!("Received SIGTERM, initiating shutdown...");
        }
    }

    // Send shutdown signal
    let _ = shutdown_tx.send(());

    for handle in listener_handles {
        let _ = handle.await;
    }
    if let Some(heartbeat) = heartbeat {
        let _ = heartbeat.await;
    }

    let total: u64 = stats
        .iter()
        .map(|s| s.connections_accepted.load(Ordering::Relaxed))
        .sum();
    info!(
        "Shutdown complete. Total connections handled: {}, sessions still active: {}",
        total,
        gateway.registry().len()
    );

    Ok(())
}
