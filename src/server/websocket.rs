//! WebSocket relay server
//!
//! Listens on a configurable address and gives every accepted socket its own
//! connection session.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::config::RelayConfig;
use crate::connection::{
    ConnectionRegistry, ConnectionSession, SessionError, SessionOutcome,
};

/// WebSocket server relaying messages between connected peers
pub struct WebSocketServer {
    config: Arc<RelayConfig>,
    registry: Arc<ConnectionRegistry>,
    shutdown_tx: broadcast::Sender<()>,
}

impl WebSocketServer {
    /// Create a new server with an empty registry
    pub fn new(config: RelayConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config: Arc::new(config),
            registry: Arc::new(ConnectionRegistry::new()),
            shutdown_tx,
        }
    }

    /// The registry shared by all sessions
    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        Arc::clone(&self.registry)
    }

    /// Get a shutdown signal receiver
    pub fn shutdown_signal(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Trigger server shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Bind the configured address
    pub async fn bind(&self) -> anyhow::Result<TcpListener> {
        let addr = self.config.socket_addr();
        let listener = TcpListener::bind(&addr).await?;
        info!("Relay listening on ws://{}/", listener.local_addr()?);
        Ok(listener)
    }

    /// Bind and serve until shutdown
    pub async fn run(&self) -> anyhow::Result<()> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Accept connections on `listener` until shutdown
    ///
    /// A failing connection is logged and never stops the loop.
    pub async fn serve(&self, listener: TcpListener) -> anyhow::Result<()> {
        let mut shutdown_rx = self.shutdown_signal();

        loop {
            tokio::select! {
                // Accept new connections
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let registry = Arc::clone(&self.registry);
                            let config = Arc::clone(&self.config);
                            let shutdown_rx = self.shutdown_signal();

                            tokio::spawn(async move {
                                handle_connection(stream, peer_addr, registry, config, shutdown_rx).await;
                            });
                        }
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                        }
                    }
                }
                // Handle shutdown signal
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received, stopping server");
                    break;
                }
            }
        }

        let open = self.registry.len().await;
        if open > 0 {
            info!("Closing {} open connections", open);
        }

        Ok(())
    }
}

/// Run one session and log how it ended
async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    registry: Arc<ConnectionRegistry>,
    config: Arc<RelayConfig>,
    shutdown_rx: broadcast::Receiver<()>,
) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("Failed to set TCP_NODELAY for {}: {}", peer_addr, e);
    }

    let mut session = ConnectionSession::new(peer_addr, registry, config).with_shutdown(shutdown_rx);
    let id = session.id();
    debug!("New connection {} from {}", id, peer_addr);

    match session.run(stream).await {
        Ok(SessionOutcome::Closed(reason)) => {
            info!("Connection {} from {} closed: {:?}", id, peer_addr, reason);
        }
        Ok(SessionOutcome::Rejected) => {
            warn!("Rejected upgrade from {}: missing Sec-WebSocket-Key", peer_addr);
        }
        Ok(SessionOutcome::Document(outcome)) => {
            debug!("Plain HTTP request from {}: {:?}", peer_addr, outcome);
        }
        Err(SessionError::Protocol(e)) => {
            warn!("Closing connection {} from {}: {}", id, peer_addr, e);
        }
        Err(SessionError::Io(e)) => {
            info!("Connection {} from {} dropped: {}", id, peer_addr, e);
        }
        Err(e) => {
            error!("Connection error from {}: {}", peer_addr, e);
        }
    }
}
