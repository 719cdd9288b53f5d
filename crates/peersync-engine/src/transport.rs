//! Transport abstraction for the sync protocol.
//!
//! The engine produces and consumes opaque message bytes. Delivering them is
//! the transport's job: implementations may use WebSockets, a relay, or any
//! other channel. Sequence numbers travel inside the message, so transports
//! that reorder or duplicate are expected to filter on them.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;
use crate::peer::PeerId;

/// Transport trait for sending and receiving sync messages.
///
/// Implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a message to a specific peer.
    ///
    /// `Ok` means the transport accepted the message; only then does the
    /// engine commit its send bookkeeping.
    async fn send(&self, peer: &PeerId, message: Bytes) -> Result<()>;

    /// Receive the next message from any peer.
    ///
    /// Returns the sender and the message bytes.
    async fn recv(&self) -> Result<(PeerId, Bytes)>;

    /// Receive with timeout.
    ///
    /// Returns None if timeout expires before a message arrives.
    async fn recv_timeout(&self, timeout: Duration) -> Result<Option<(PeerId, Bytes)>>;

    /// Get the local peer's identity.
    fn local_peer_id(&self) -> PeerId;

    /// List currently connected peers.
    async fn connected_peers(&self) -> Result<Vec<PeerId>>;
}

/// A simple in-memory transport for testing.
///
/// Uses channels to simulate message passing between peers.
pub mod memory {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;

    use tokio::sync::{mpsc, Mutex, RwLock};

    use crate::error::EngineError;

    #[derive(Debug)]
    struct Envelope {
        from: PeerId,
        message: Bytes,
    }

    /// Shared routing table for a set of memory transports.
    #[derive(Default)]
    pub struct MemoryNetwork {
        senders: RwLock<HashMap<PeerId, mpsc::Sender<Envelope>>>,
    }

    impl MemoryNetwork {
        /// Create a new memory network.
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        /// Create a transport connected to this network.
        pub async fn create_transport(self: &Arc<Self>, peer_id: PeerId) -> MemoryTransport {
            let (tx, rx) = mpsc::channel(1000);
            self.senders.write().await.insert(peer_id.clone(), tx);

            MemoryTransport {
                peer_id,
                network: Arc::clone(self),
                receiver: Mutex::new(rx),
            }
        }

        /// Remove a peer from the network. Sends to it fail from now on.
        pub async fn disconnect(&self, peer_id: &PeerId) -> bool {
            self.senders.write().await.remove(peer_id).is_some()
        }
    }

    /// In-memory transport implementation.
    pub struct MemoryTransport {
        peer_id: PeerId,
        network: Arc<MemoryNetwork>,
        receiver: Mutex<mpsc::Receiver<Envelope>>,
    }

    #[async_trait]
    impl Transport for MemoryTransport {
        async fn send(&self, peer: &PeerId, message: Bytes) -> Result<()> {
            let sender = self
                .network
                .senders
                .read()
                .await
                .get(peer)
                .cloned()
                .ok_or_else(|| EngineError::Transport(format!("peer not found: {peer}")))?;

            let envelope = Envelope {
                from: self.peer_id.clone(),
                message,
            };
            sender
                .send(envelope)
                .await
                .map_err(|_| EngineError::Transport("peer disconnected".into()))
        }

        async fn recv(&self) -> Result<(PeerId, Bytes)> {
            let mut rx = self.receiver.lock().await;
            match rx.recv().await {
                Some(envelope) => Ok((envelope.from, envelope.message)),
                None => Err(EngineError::Transport("channel closed".into())),
            }
        }

        async fn recv_timeout(&self, timeout: Duration) -> Result<Option<(PeerId, Bytes)>> {
            let mut rx = self.receiver.lock().await;
            match tokio::time::timeout(timeout, rx.recv()).await {
                Ok(Some(envelope)) => Ok(Some((envelope.from, envelope.message))),
                Ok(None) => Err(EngineError::Transport("channel closed".into())),
                Err(_) => Ok(None),
            }
        }

        fn local_peer_id(&self) -> PeerId {
            self.peer_id.clone()
        }

        async fn connected_peers(&self) -> Result<Vec<PeerId>> {
            let senders = self.network.senders.read().await;
            let mut peers: Vec<PeerId> = senders
                .keys()
                .filter(|id| **id != self.peer_id)
                .cloned()
                .collect();
            peers.sort();
            Ok(peers)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::memory::MemoryNetwork;
    use super::*;
    use crate::error::EngineError;

    #[tokio::test]
    async fn test_memory_transport_send_recv() {
        let network = MemoryNetwork::new();
        let a = network.create_transport(PeerId::from("a")).await;
        let b = network.create_transport(PeerId::from("b")).await;

        a.send(&PeerId::from("b"), Bytes::from_static(b"hello"))
            .await
            .unwrap();

        let (from, message) = b.recv().await.unwrap();
        assert_eq!(from, PeerId::from("a"));
        assert_eq!(&message[..], b"hello");
    }

    #[tokio::test]
    async fn test_recv_timeout_expires() {
        let network = MemoryNetwork::new();
        let a = network.create_transport(PeerId::from("a")).await;

        let received = a.recv_timeout(Duration::from_millis(10)).await.unwrap();
        assert!(received.is_none());
    }

    #[tokio::test]
    async fn test_send_to_unknown_peer_fails() {
        let network = MemoryNetwork::new();
        let a = network.create_transport(PeerId::from("a")).await;
        let _b = network.create_transport(PeerId::from("b")).await;

        assert!(network.disconnect(&PeerId::from("b")).await);
        let result = a.send(&PeerId::from("b"), Bytes::new()).await;
        assert!(matches!(result, Err(EngineError::Transport(_))));
    }

    #[tokio::test]
    async fn test_connected_peers_excludes_self() {
        let network = MemoryNetwork::new();
        let a = network.create_transport(PeerId::from("a")).await;
        let _c = network.create_transport(PeerId::from("c")).await;
        let _b = network.create_transport(PeerId::from("b")).await;

        assert_eq!(a.local_peer_id(), PeerId::from("a"));
        assert_eq!(
            a.connected_peers().await.unwrap(),
            vec![PeerId::from("b"), PeerId::from("c")]
        );
    }
}
