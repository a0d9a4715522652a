//! Registry of clients that asked to be told about session changes.

use dashmap::DashMap;

use crate::rpc::{Endpoint, Outbound, PeerHandle, PeerId};

#[derive(Debug, Default)]
pub struct ClientRegistry {
    clients: DashMap<PeerId, PeerHandle>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if the client was already registered.
    pub fn register(&self, peer: PeerHandle) -> bool {
        self.clients.insert(peer.id(), peer).is_none()
    }

    pub fn unregister(&self, id: PeerId) -> bool {
        self.clients.remove(&id).is_some()
    }

    pub fn contains(&self, id: PeerId) -> bool {
        self.clients.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Send a copy of a message to every client, dropping those that are gone.
    ///
    /// Returns how many clients were pruned.
    pub fn broadcast<F>(&self, endpoint: &Endpoint, make: F) -> usize
    where
        F: Fn() -> Outbound,
    {
        // Collect first so no shard lock is held while sending.
        let peers: Vec<PeerHandle> = self.clients.iter().map(|e| e.value().clone()).collect();
        let mut pruned = 0;
        for peer in peers {
            if endpoint.send_to(&peer, make()).is_err() {
                self.unregister(peer.id());
                tracing::debug!(peer = %peer.id(), "pruned unreachable client");
                pruned += 1;
            }
        }
        pruned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::Opcode;

    #[test]
    fn test_register_twice() {
        let registry = ClientRegistry::new();
        let (peer, _rx) = PeerHandle::channel();
        assert!(registry.register(peer.clone()));
        assert!(!registry.register(peer.clone()));
        assert_eq!(registry.len(), 1);
        assert!(registry.unregister(peer.id()));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_broadcast_prunes_dead_clients() {
        let endpoint = Endpoint::new("broker");
        endpoint.start();
        let registry = ClientRegistry::new();

        let (alive, mut alive_rx) = PeerHandle::channel();
        let (dead, dead_rx) = PeerHandle::channel();
        registry.register(alive.clone());
        registry.register(dead.clone());
        drop(dead_rx);

        let pruned = registry.broadcast(&endpoint, || Outbound::new(Opcode::SESSIONS_CHANGED));
        assert_eq!(pruned, 1);
        assert!(registry.contains(alive.id()));
        assert!(!registry.contains(dead.id()));

        let got = alive_rx.recv().await.unwrap();
        assert_eq!(got.opcode(), Opcode::SESSIONS_CHANGED);
    }
}
