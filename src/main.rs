//! Room Broker
//!
//! WebSocket broker for room-based chat. Clients join named rooms and every
//! message sent to a room is fanned out to all of its current members.

mod config;
mod connection;
mod room;
mod server;

use std::path::PathBuf;

use clap::Parser;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use config::{BrokerConfig, CONFIG_FILE};
use server::Broker;

/// Room Broker
///
/// WebSocket broker for room-based chat
#[derive(Parser, Debug)]
#[command(name = "room-broker")]
#[command(version, about, long_about = None)]
struct Args {
    /// Configuration file
    #[arg(short, long, default_value = CONFIG_FILE)]
    config: PathBuf,

    /// Port to listen on (overrides the config file)
    #[arg(short, long)]
    port: Option<u16>,

    /// Bind address (overrides the config file)
    #[arg(long)]
    bind: Option<String>,

    /// WebSocket endpoint path (overrides the config file)
    #[arg(long)]
    path: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging; RUST_LOG wins over --verbose
    let default_level = if args.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    info!("Room Broker v{}", env!("CARGO_PKG_VERSION"));

    let config = BrokerConfig::load(&args.config)?
        .with_bind(args.bind)
        .with_port(args.port)
        .with_path(args.path);

    if config.announce_membership {
        info!("Membership announcements enabled");
    }

    // Create and start the broker
    let broker = Broker::new(config);
    let broker_handle = broker.clone();

    // Spawn shutdown signal handler
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Initiating graceful shutdown...");
        broker_handle.shutdown();
    });

    // Run the broker
    broker.run().await?;

    info!("Broker shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C)");
        }
        _ = terminate => {
            info!("Received SIGTERM");
        }
    }
}
