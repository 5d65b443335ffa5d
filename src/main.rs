//! WebSocket relay server
//!
//! Speaks the WebSocket wire protocol directly over TCP: answers the upgrade
//! handshake, decodes client frames and relays each message to every other
//! connected peer.

mod config;
mod connection;
#[allow(dead_code)]
mod frame;
mod server;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use config::{FileConfig, RelayConfig, DEFAULT_BIND, DEFAULT_PORT};
use server::WebSocketServer;

/// WebSocket relay server
///
/// Relays every message a client sends to all other connected clients
#[derive(Parser, Debug)]
#[command(name = "ws-relay")]
#[command(version, about, long_about = None)]
struct Args {
    /// Port to listen on [default: 3000]
    #[arg(short, long)]
    port: Option<u16>,

    /// Bind address [default: 0.0.0.0]
    #[arg(long)]
    bind: Option<String>,

    /// Document served for plain `GET /` requests
    #[arg(long)]
    document: Option<PathBuf>,

    /// TOML file with server settings
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    /// Build the relay configuration: defaults, then the file, then flags
    fn relay_config(&self) -> anyhow::Result<RelayConfig> {
        let mut config = RelayConfig::new(DEFAULT_BIND, DEFAULT_PORT);

        if let Some(path) = &self.config {
            config = config.merge_file(FileConfig::load(path)?);
            info!("Loaded settings from {}", path.display());
        }
        if let Some(bind) = &self.bind {
            config.bind = bind.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(document) = &self.document {
            config = config.with_document(document);
        }

        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .compact()
        .init();

    // A panicking connection task is dropped by the runtime; keep a record of it
    std::panic::set_hook(Box::new(|panic_info| {
        error!("Unhandled panic: {}", panic_info);
    }));

    info!("ws-relay v{}", env!("CARGO_PKG_VERSION"));

    let config = args.relay_config()?;
    info!("Serving {} for plain HTTP requests", config.document.display());

    let server = Arc::new(WebSocketServer::new(config));
    let server_handle = Arc::clone(&server);

    // Spawn shutdown signal handler
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Initiating graceful shutdown...");
        server_handle.shutdown();
    });

    server.run().await?;

    info!("Server shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
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
