//! Shroud router daemon
//!
//! Loads configuration, seeds the routing database from static peers
//! and runs the UDP transport until interrupted.

use clap::Parser;
use shroud::{ChannelRouter, Config, MemoryNetDb, Server};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, warn, Level};
use tracing_subscriber::{fmt, EnvFilter};

/// Shroud secure UDP transport daemon
#[derive(Parser, Debug)]
#[command(name = "shroud", version, about)]
struct Args {
    /// Path to configuration file (overrides default search paths)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();

    fmt().with_env_filter(filter).with_target(true).init();

    let args = Args::parse();

    info!("Shroud starting");

    let (config, loaded_paths) = if let Some(config_path) = &args.config {
        match Config::load_file(config_path) {
            Ok(config) => (config, vec![config_path.clone()]),
            Err(e) => {
                error!("Failed to load configuration from {}: {}", config_path.display(), e);
                std::process::exit(1);
            }
        }
    } else {
        match Config::load() {
            Ok(result) => result,
            Err(e) => {
                error!("Failed to load configuration: {}", e);
                std::process::exit(1);
            }
        }
    };

    if loaded_paths.is_empty() {
        info!("No config files found, using defaults");
    } else {
        for path in &loaded_paths {
            info!(path = %path.display(), "Loaded config file");
        }
    }

    if config.has_identity() {
        info!("Using configured identity");
    } else {
        warn!("No identity configured, generating ephemeral keypair");
    }

    let netdb = Arc::new(MemoryNetDb::new());
    for peer in &config.peers {
        match peer.to_router_info() {
            Ok(info) => netdb.insert(info),
            Err(e) => warn!(pubkey = %peer.pubkey, error = %e, "Skipping invalid static peer"),
        }
    }
    info!(peers = netdb.len(), "Routing database seeded");

    let (message_router, mut delivered) = ChannelRouter::new();
    tokio::spawn(async move {
        while let Some((from, message)) = delivered.recv().await {
            debug!(from = %from.short(), len = message.len(), "Message delivered");
        }
    });

    let mut server = match Server::new(&config, netdb, Arc::new(message_router)) {
        Ok(server) => server,
        Err(e) => {
            error!("Failed to create server: {}", e);
            std::process::exit(1);
        }
    };

    info!(
        state = %server.state(),
        status = %server.context().status(),
        ident = %server.context().ident_hash(),
        "Server created"
    );

    if let Err(e) = server.start().await {
        error!("Failed to start server: {}", e);
        std::process::exit(1);
    }

    info!("Shroud running, press Ctrl+C to exit");

    tokio::select! {
        result = server.run_rx_loop() => {
            if let Err(e) = result {
                error!("Receive loop failed: {}", e);
            }
        }
        signal = tokio::signal::ctrl_c() => match signal {
            Ok(()) => info!("Shutdown signal received"),
            Err(e) => error!("Failed to listen for shutdown signal: {}", e),
        },
    }

    info!("Shroud shutting down");

    if let Err(e) = server.stop().await {
        warn!("Error during shutdown: {}", e);
    }

    info!("Shroud shutdown complete");
}
