//! Connection registry
//!
//! Tracks every upgraded connection so that messages from one peer can be
//! relayed to all the others. Access goes through an async `RwLock`, since
//! sessions run on the multi-threaded runtime.

use bytes::Bytes;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, Notify, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

/// Unique identity of a connection
pub type ConnectionId = Uuid;

/// Errors that can occur when handing a frame to a connection
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("Outbound queue is full")]
    QueueFull,

    #[error("Connection writer has closed")]
    Closed,
}

/// Registry-side handle to a live connection
///
/// Holds the sending end of the connection's bounded outbound queue. The
/// connection's writer task drains the other end onto the socket.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    peer_addr: SocketAddr,
    outbound: mpsc::Sender<Bytes>,
    eviction: Arc<Notify>,
}

impl ConnectionHandle {
    /// Create a handle and the receiving end of its outbound queue
    pub fn new(
        id: ConnectionId,
        peer_addr: SocketAddr,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<Bytes>) {
        let (outbound, outbound_rx) = mpsc::channel(capacity);
        let handle = Self {
            id,
            peer_addr,
            outbound,
            eviction: Arc::new(Notify::new()),
        };
        (handle, outbound_rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Queue an encoded frame without waiting
    pub fn try_send(&self, frame: Bytes) -> Result<(), DeliveryError> {
        self.outbound.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DeliveryError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }

    /// Signal the owning session to close
    pub fn evict(&self) {
        self.eviction.notify_one();
    }

    /// Signal the owning session waits on for eviction
    pub fn eviction(&self) -> Arc<Notify> {
        Arc::clone(&self.eviction)
    }
}

/// Result of relaying one frame
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Connections the frame was queued for
    pub delivered: usize,
    /// Connections dropped from the registry while delivering
    pub evicted: Vec<ConnectionId>,
}

/// Set of currently upgraded connections
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<ConnectionId, ConnectionHandle>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
        }
    }

    /// Admit a connection
    ///
    /// Returns `false` if a connection with the same id is already present.
    pub async fn add(&self, handle: ConnectionHandle) -> bool {
        let mut connections = self.connections.write().await;
        match connections.entry(handle.id()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(entry) => {
                debug!("Registered connection {} ({})", handle.id(), handle.peer_addr());
                entry.insert(handle);
                true
            }
        }
    }

    /// Drop a connection
    ///
    /// Returns `false` if it was not registered.
    pub async fn remove(&self, id: ConnectionId) -> bool {
        let removed = self.connections.write().await.remove(&id);
        if removed.is_some() {
            debug!("Deregistered connection {}", id);
        }
        removed.is_some()
    }

    pub async fn contains(&self, id: ConnectionId) -> bool {
        self.connections.read().await.contains_key(&id)
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }

    /// Apply `f` to every connection other than `except`
    ///
    /// A failure on one connection does not stop the walk; failures are
    /// collected and returned.
    pub async fn for_each_except<F>(
        &self,
        except: ConnectionId,
        mut f: F,
    ) -> Vec<(ConnectionHandle, DeliveryError)>
    where
        F: FnMut(&ConnectionHandle) -> Result<(), DeliveryError>,
    {
        let connections = self.connections.read().await;
        let mut failures = Vec::new();

        for handle in connections.values().filter(|h| h.id() != except) {
            if let Err(e) = f(handle) {
                failures.push((handle.clone(), e));
            }
        }

        failures
    }

    /// Queue `frame` for every connection other than `except`
    ///
    /// Connections whose queue is full are slow consumers: they are removed
    /// and told to close. Connections whose writer is gone are removed.
    pub async fn broadcast_except(&self, except: ConnectionId, frame: Bytes) -> BroadcastReport {
        let mut delivered = 0;
        let failures = self
            .for_each_except(except, |handle| {
                handle.try_send(frame.clone())?;
                delivered += 1;
                Ok(())
            })
            .await;

        let mut report = BroadcastReport {
            delivered,
            evicted: Vec::with_capacity(failures.len()),
        };
        if failures.is_empty() {
            return report;
        }

        let mut connections = self.connections.write().await;
        for (handle, error) in failures {
            if connections.remove(&handle.id()).is_none() {
                continue;
            }
            match error {
                DeliveryError::QueueFull => {
                    warn!(
                        "Evicting slow connection {} ({}): outbound queue full",
                        handle.id(),
                        handle.peer_addr()
                    );
                    handle.evict();
                }
                DeliveryError::Closed => {
                    debug!("Dropping connection {} with closed writer", handle.id());
                }
            }
            report.evicted.push(handle.id());
        }

        report
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> SocketAddr {
        "127.0.0.1:50000".parse().unwrap()
    }

    fn handle(capacity: usize) -> (ConnectionHandle, mpsc::Receiver<Bytes>) {
        ConnectionHandle::new(Uuid::new_v4(), peer(), capacity)
    }

    #[tokio::test]
    async fn test_registry_new() {
        let registry = ConnectionRegistry::new();
        assert!(registry.is_empty().await);
        assert_eq!(registry.len().await, 0);
    }

    #[tokio::test]
    async fn test_add_is_idempotent() {
        let registry = ConnectionRegistry::new();
        let (a, _rx) = handle(4);

        assert!(registry.add(a.clone()).await);
        assert!(!registry.add(a.clone()).await);
        assert_eq!(registry.len().await, 1);
        assert!(registry.contains(a.id()).await);
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let registry = ConnectionRegistry::new();
        let (a, _rx) = handle(4);
        registry.add(a.clone()).await;

        assert!(registry.remove(a.id()).await);
        assert!(!registry.remove(a.id()).await);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_broadcast_skips_sender() {
        let registry = ConnectionRegistry::new();
        let (a, mut a_rx) = handle(4);
        let (b, mut b_rx) = handle(4);
        let (c, mut c_rx) = handle(4);
        for h in [&a, &b, &c] {
            registry.add(h.clone()).await;
        }

        let frame = Bytes::from_static(b"\x81\x02hi");
        let report = registry.broadcast_except(a.id(), frame.clone()).await;

        assert_eq!(report.delivered, 2);
        assert!(report.evicted.is_empty());
        assert_eq!(b_rx.try_recv().unwrap(), frame);
        assert_eq!(c_rx.try_recv().unwrap(), frame);
        assert!(a_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_for_each_except_isolates_failures() {
        let registry = ConnectionRegistry::new();
        let (a, _a_rx) = handle(4);
        let (b, _b_rx) = handle(4);
        let (c, _c_rx) = handle(4);
        for h in [&a, &b, &c] {
            registry.add(h.clone()).await;
        }

        let mut visited = Vec::new();
        let failures = registry
            .for_each_except(a.id(), |h| {
                visited.push(h.id());
                if h.id() == b.id() {
                    Err(DeliveryError::Closed)
                } else {
                    Ok(())
                }
            })
            .await;

        assert_eq!(visited.len(), 2);
        assert!(visited.contains(&b.id()));
        assert!(visited.contains(&c.id()));
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0.id(), b.id());
    }

    #[tokio::test]
    async fn test_slow_consumer_evicted() {
        let registry = ConnectionRegistry::new();
        let (a, _a_rx) = handle(4);
        let (slow, _slow_rx) = handle(1);
        let (fast, mut fast_rx) = handle(4);
        for h in [&a, &slow, &fast] {
            registry.add(h.clone()).await;
        }
        let eviction = slow.eviction();

        let first = registry
            .broadcast_except(a.id(), Bytes::from_static(b"one"))
            .await;
        assert_eq!(first.delivered, 2);

        // The slow connection never drains its single slot
        let second = registry
            .broadcast_except(a.id(), Bytes::from_static(b"two"))
            .await;
        assert_eq!(second.delivered, 1);
        assert_eq!(second.evicted, vec![slow.id()]);

        assert!(!registry.contains(slow.id()).await);
        assert!(registry.contains(fast.id()).await);
        assert_eq!(fast_rx.try_recv().unwrap(), Bytes::from_static(b"one"));
        assert_eq!(fast_rx.try_recv().unwrap(), Bytes::from_static(b"two"));

        // Notify stores the permit for a later waiter
        tokio::time::timeout(std::time::Duration::from_secs(1), eviction.notified())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_closed_writer_removed() {
        let registry = ConnectionRegistry::new();
        let (a, _a_rx) = handle(4);
        let (gone, gone_rx) = handle(4);
        registry.add(a.clone()).await;
        registry.add(gone.clone()).await;
        drop(gone_rx);

        let report = registry
            .broadcast_except(a.id(), Bytes::from_static(b"x"))
            .await;

        assert_eq!(report.delivered, 0);
        assert_eq!(report.evicted, vec![gone.id()]);
        assert!(!registry.contains(gone.id()).await);
        assert!(registry.contains(a.id()).await);
    }
}
