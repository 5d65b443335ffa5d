//! Connection session
//!
//! Drives one accepted stream through its whole life: request head,
//! upgrade, relaying frames, teardown.

use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use std::io::Cursor;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;
use tracing::{debug, trace};
use uuid::Uuid;

use super::{ConnectionHandle, ConnectionId, ConnectionRegistry};
use crate::config::RelayConfig;
use crate::frame::{encode_frame, Frame, FrameCodec, FrameError, Opcode};
use crate::server::{
    read_request_head, respond, serve_document, DocumentOutcome, HandshakeError,
    HandshakeOutcome,
};

/// Errors that end a session abnormally
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("Protocol violation: {0}")]
    Protocol(#[from] FrameError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for session operations
pub type SessionResult<T> = Result<T, SessionError>;

/// Lifecycle of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for the request head
    Handshaking,
    /// Upgraded and registered
    Open,
    /// Torn down
    Closed,
}

/// Why an open session ended without error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The peer ended the stream
    PeerClosed,
    /// The peer sent a close frame
    CloseFrame,
    /// The registry dropped this connection as a slow consumer
    Evicted,
    /// The outbound writer stopped
    OutboundClosed,
    /// The server is shutting down
    Shutdown,
}

/// How a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// A plain HTTP request was answered
    Document(DocumentOutcome),
    /// The upgrade request had no key; 400 was sent
    Rejected,
    /// An upgraded connection closed
    Closed(CloseReason),
}

/// Per-connection driver
///
/// The session owns the read side of its stream. The write side belongs to a
/// writer task draining the connection's outbound queue, which is the only
/// thing the registry can reach.
pub struct ConnectionSession {
    id: ConnectionId,
    peer_addr: SocketAddr,
    registry: Arc<ConnectionRegistry>,
    config: Arc<RelayConfig>,
    state: SessionState,
    shutdown_rx: Option<broadcast::Receiver<()>>,
}

impl ConnectionSession {
    /// Create a session for a freshly accepted stream
    pub fn new(
        peer_addr: SocketAddr,
        registry: Arc<ConnectionRegistry>,
        config: Arc<RelayConfig>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            peer_addr,
            registry,
            config,
            state: SessionState::Handshaking,
            shutdown_rx: None,
        }
    }

    /// Close the session when the server shuts down
    pub fn with_shutdown(mut self, shutdown_rx: broadcast::Receiver<()>) -> Self {
        self.shutdown_rx = Some(shutdown_rx);
        self
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    fn transition(&mut self, next: SessionState) {
        trace!("Session {}: {:?} -> {:?}", self.id, self.state, next);
        self.state = next;
    }

    /// Drive `stream` until it closes
    ///
    /// An upgraded connection is registered before the `101` response goes
    /// out and deregistered exactly once when the session ends, whatever the
    /// cause.
    pub async fn run<S>(&mut self, mut stream: S) -> SessionResult<SessionOutcome>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut buf = BytesMut::with_capacity(1024);
        let head = match tokio::time::timeout(
            self.config.handshake_timeout,
            read_request_head(&mut stream, &mut buf, self.config.max_request_bytes),
        )
        .await
        {
            Ok(head) => head,
            Err(_) => Err(HandshakeError::Timeout),
        };
        let head = match head {
            Ok(head) => head,
            Err(e) => {
                self.transition(SessionState::Closed);
                return Err(e.into());
            }
        };

        if !head.is_upgrade() {
            self.transition(SessionState::Closed);
            let outcome = serve_document(&mut stream, &head, &self.config.document).await?;
            return Ok(SessionOutcome::Document(outcome));
        }

        let outcome = respond(&head);
        if outcome == HandshakeOutcome::Reject {
            debug!("Rejecting upgrade from {}: missing key", self.peer_addr);
            self.transition(SessionState::Closed);
            stream.write_all(&outcome.response()).await?;
            let _ = stream.shutdown().await;
            return Ok(SessionOutcome::Rejected);
        }

        let (handle, outbound_rx) =
            ConnectionHandle::new(self.id, self.peer_addr, self.config.outbound_queue_capacity);
        let eviction = handle.eviction();
        self.registry.add(handle).await;
        self.transition(SessionState::Open);

        let result = self
            .drive(stream, buf, outcome.response(), outbound_rx, eviction)
            .await;

        self.registry.remove(self.id).await;
        self.transition(SessionState::Closed);
        result.map(SessionOutcome::Closed)
    }

    /// Relay frames until the connection closes
    async fn drive<S>(
        &mut self,
        stream: S,
        leftover: BytesMut,
        response: Vec<u8>,
        outbound_rx: mpsc::Receiver<Bytes>,
        eviction: Arc<Notify>,
    ) -> SessionResult<CloseReason>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (read_half, mut write_half) = tokio::io::split(stream);

        write_half.write_all(&response).await?;
        write_half.flush().await?;

        let mut writer = spawn_writer(write_half, outbound_rx);

        // Bytes that followed the request head are decoded before the socket
        let reader = Cursor::new(leftover).chain(read_half);
        let codec = FrameCodec::with_max_payload_size(self.config.max_payload_size);
        let mut frames = FramedRead::new(reader, codec);

        let mut shutdown_rx = self.shutdown_rx.take();
        let registry = Arc::clone(&self.registry);
        let id = self.id;

        let result = loop {
            tokio::select! {
                frame = frames.next() => match frame {
                    Some(Ok(frame)) => {
                        if let Some(reason) = dispatch(&registry, id, frame).await {
                            break Ok(reason);
                        }
                    }
                    // Read failures and truncated frames are stream faults
                    Some(Err(FrameError::Io(e))) => break Err(SessionError::Io(e)),
                    Some(Err(e)) => break Err(SessionError::Protocol(e)),
                    None => break Ok(CloseReason::PeerClosed),
                },
                _ = eviction.notified() => break Ok(CloseReason::Evicted),
                joined = &mut writer => match joined {
                    Ok(Ok(())) => break Ok(CloseReason::OutboundClosed),
                    Ok(Err(e)) => break Err(e.into()),
                    Err(_) => break Ok(CloseReason::OutboundClosed),
                },
                _ = wait_for_shutdown(&mut shutdown_rx) => break Ok(CloseReason::Shutdown),
            }
        };

        writer.abort();
        result
    }
}

/// Act on one decoded frame
///
/// Returns a reason when the frame ends the session.
async fn dispatch(
    registry: &ConnectionRegistry,
    id: ConnectionId,
    frame: Frame,
) -> Option<CloseReason> {
    if frame.opcode.is_data() {
        if frame.opcode == Opcode::Text {
            debug!("Text from {}: {}", id, String::from_utf8_lossy(&frame.payload));
        } else {
            debug!("Binary from {} ({} bytes)", id, frame.payload.len());
        }

        let report = registry
            .broadcast_except(id, encode_frame(&frame.payload))
            .await;
        trace!(
            "Relayed {} bytes from {} to {} peers ({} evicted)",
            frame.payload.len(),
            id,
            report.delivered,
            report.evicted.len()
        );
        return None;
    }

    if frame.opcode == Opcode::Close {
        return Some(CloseReason::CloseFrame);
    }

    trace!("Ignoring {:?} frame from {}", frame.opcode, id);
    None
}

/// Drain the outbound queue onto the socket
fn spawn_writer<W>(
    mut writer: W,
    mut outbound_rx: mpsc::Receiver<Bytes>,
) -> JoinHandle<std::io::Result<()>>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            writer.write_all(&frame).await?;
            writer.flush().await?;
        }
        writer.shutdown().await
    })
}

async fn wait_for_shutdown(shutdown_rx: &mut Option<broadcast::Receiver<()>>) {
    match shutdown_rx {
        Some(rx) => {
            let _ = rx.recv().await;
        }
        None => std::future::pending().await,
    }
}
