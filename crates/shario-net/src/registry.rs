//! Session registry: deduplicates the set of known remote nodes across
//! simultaneous connections (dual-stack dials, reconnect churn) and emits
//! connected/disconnected events exactly once per logical peer.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use libp2p::{Multiaddr, PeerId};
use parking_lot::RwLock;
use tracing::debug;

/// Metadata for one logical peer, keyed by its node identifier.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub peer_id: PeerId,
    /// Best-effort placeholder (first 8 chars of the identifier) until the
    /// remote sends a nickname update.
    pub nickname: String,
    pub connected_at: DateTime<Utc>,
    /// Remote addresses by which the peer is currently reachable.
    pub addresses: Vec<Multiaddr>,
}

/// Subscriber interface for registry events. Implementations must not
/// block; fire work onto a task if it suspends.
pub trait RegistryObserver: Send + Sync {
    fn on_peer_connected(&self, peer: &PeerInfo);
    fn on_peer_disconnected(&self, peer_id: &PeerId);
}

/// Peer table plus its subscribers. The table has a single writer at a
/// time; events are emitted outside the table lock.
#[derive(Default)]
pub struct PeerRegistry {
    peers: RwLock<HashMap<PeerId, PeerInfo>>,
    observers: RwLock<Vec<Arc<dyn RegistryObserver>>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber. Observers are set up once at construction
    /// and never removed.
    pub fn subscribe(&self, observer: Arc<dyn RegistryObserver>) {
        self.observers.write().push(observer);
    }

    /// Handle a connection-opened notification from the transport.
    ///
    /// Returns `true` if this created a new logical peer (and emitted a
    /// connected event); an additional connection to a known peer only
    /// extends its address set.
    pub fn connection_opened(&self, peer_id: PeerId, address: Multiaddr) -> bool {
        let new_peer = {
            let mut peers = self.peers.write();
            match peers.get_mut(&peer_id) {
                Some(existing) => {
                    if !existing.addresses.contains(&address) {
                        existing.addresses.push(address.clone());
                    }
                    debug!(peer = %peer_id, addr = %address, "Additional connection to known peer");
                    None
                }
                None => {
                    let info = PeerInfo {
                        peer_id,
                        nickname: placeholder_nickname(&peer_id),
                        connected_at: Utc::now(),
                        addresses: vec![address.clone()],
                    };
                    peers.insert(peer_id, info.clone());
                    Some(info)
                }
            }
        };

        match new_peer {
            Some(info) => {
                debug!(peer = %peer_id, addr = %address, "Peer connected");
                for observer in self.observers.read().iter() {
                    observer.on_peer_connected(&info);
                }
                true
            }
            None => false,
        }
    }

    /// Handle a connection-closed notification from the transport.
    ///
    /// `remaining` is the number of connections still open to the peer.
    /// Returns `true` if the logical peer was removed (and a disconnected
    /// event emitted).
    pub fn connection_closed(&self, peer_id: PeerId, remaining: u32) -> bool {
        if remaining > 0 {
            debug!(peer = %peer_id, remaining, "Connection closed, peer still reachable");
            return false;
        }

        let removed = self.peers.write().remove(&peer_id).is_some();
        if removed {
            debug!(peer = %peer_id, "Peer disconnected");
            for observer in self.observers.read().iter() {
                observer.on_peer_disconnected(&peer_id);
            }
        }
        removed
    }

    /// Update a peer's nickname. Returns `false` for unknown peers.
    pub fn set_nickname(&self, peer_id: &PeerId, nickname: &str) -> bool {
        match self.peers.write().get_mut(peer_id) {
            Some(info) => {
                info.nickname = nickname.to_string();
                true
            }
            None => false,
        }
    }

    pub fn nickname(&self, peer_id: &PeerId) -> Option<String> {
        self.peers.read().get(peer_id).map(|p| p.nickname.clone())
    }

    pub fn get(&self, peer_id: &PeerId) -> Option<PeerInfo> {
        self.peers.read().get(peer_id).cloned()
    }

    pub fn peers(&self) -> Vec<PeerInfo> {
        self.peers.read().values().cloned().collect()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_connected(&self, peer_id: &PeerId) -> bool {
        self.peers.read().contains_key(peer_id)
    }
}

fn placeholder_nickname(peer_id: &PeerId) -> String {
    let base58 = peer_id.to_base58();
    base58.chars().take(8).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingObserver {
        connected: AtomicUsize,
        disconnected: AtomicUsize,
    }

    impl RegistryObserver for CountingObserver {
        fn on_peer_connected(&self, _peer: &PeerInfo) {
            self.connected.fetch_add(1, Ordering::SeqCst);
        }

        fn on_peer_disconnected(&self, _peer_id: &PeerId) {
            self.disconnected.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn test_addr(port: u16) -> Multiaddr {
        format!("/ip4/127.0.0.1/tcp/{port}").parse().unwrap()
    }

    #[test]
    fn test_connect_disconnect_emits_once() {
        let registry = PeerRegistry::new();
        let observer = Arc::new(CountingObserver::default());
        registry.subscribe(observer.clone());

        let peer = PeerId::random();
        assert!(registry.connection_opened(peer, test_addr(4001)));
        assert!(registry.connection_closed(peer, 0));

        assert_eq!(observer.connected.load(Ordering::SeqCst), 1);
        assert_eq!(observer.disconnected.load(Ordering::SeqCst), 1);
        assert!(!registry.is_connected(&peer));
    }

    #[test]
    fn test_dual_stack_connections_deduplicate() {
        let registry = PeerRegistry::new();
        let observer = Arc::new(CountingObserver::default());
        registry.subscribe(observer.clone());

        let peer = PeerId::random();
        // IPv4 + IPv6 connections to the same logical peer
        assert!(registry.connection_opened(peer, test_addr(4001)));
        assert!(!registry.connection_opened(peer, test_addr(4002)));
        assert_eq!(observer.connected.load(Ordering::SeqCst), 1);
        assert_eq!(registry.get(&peer).unwrap().addresses.len(), 2);

        // Closing one of two connections keeps the logical peer
        assert!(!registry.connection_closed(peer, 1));
        assert_eq!(observer.disconnected.load(Ordering::SeqCst), 0);
        assert!(registry.is_connected(&peer));

        // Closing the last one removes it
        assert!(registry.connection_closed(peer, 0));
        assert_eq!(observer.disconnected.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_event_counts_match_distinct_identifiers() {
        let registry = PeerRegistry::new();
        let observer = Arc::new(CountingObserver::default());
        registry.subscribe(observer.clone());

        let a = PeerId::random();
        let b = PeerId::random();

        registry.connection_opened(a, test_addr(1));
        registry.connection_opened(a, test_addr(2));
        registry.connection_opened(b, test_addr(3));
        registry.connection_closed(a, 1);
        registry.connection_closed(a, 0);
        registry.connection_closed(b, 0);

        assert_eq!(observer.connected.load(Ordering::SeqCst), 2);
        assert_eq!(observer.disconnected.load(Ordering::SeqCst), 2);
        assert_eq!(registry.peer_count(), 0);
    }

    #[test]
    fn test_close_for_unknown_peer_is_silent() {
        let registry = PeerRegistry::new();
        let observer = Arc::new(CountingObserver::default());
        registry.subscribe(observer.clone());

        assert!(!registry.connection_closed(PeerId::random(), 0));
        assert_eq!(observer.disconnected.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_placeholder_nickname_prefix() {
        let registry = PeerRegistry::new();
        let peer = PeerId::random();
        registry.connection_opened(peer, test_addr(4001));

        let info = registry.get(&peer).unwrap();
        assert_eq!(info.nickname.len(), 8);
        assert!(peer.to_base58().starts_with(&info.nickname));
    }

    #[test]
    fn test_nickname_update() {
        let registry = PeerRegistry::new();
        let peer = PeerId::random();
        assert!(!registry.set_nickname(&peer, "Alice"));

        registry.connection_opened(peer, test_addr(4001));
        assert!(registry.set_nickname(&peer, "Alice"));
        assert_eq!(registry.nickname(&peer).as_deref(), Some("Alice"));
    }
}
