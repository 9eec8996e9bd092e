//! Composed libp2p `NetworkBehaviour` for Shario nodes.
//!
//! Combines two request-response protocols (chat and file transfer, one
//! framed JSON message per substream), mDNS (link-local discovery),
//! Kademlia (DHT discovery under the service tag), and Identify (address
//! exchange for the routing table).

use libp2p::{
    identify,
    kad::{self, store::MemoryStore},
    mdns, request_response,
    swarm::{behaviour::toggle::Toggle, NetworkBehaviour},
};

use shario_shared::protocol::{Ack, ChatEnvelope, TransferEnvelope};

/// Composed network behaviour for Shario nodes.
///
/// All sub-behaviours are driven by the single swarm event loop.
/// Construction is handled by [`super::transport::build_swarm`] via
/// `SwarmBuilder`.
#[derive(NetworkBehaviour)]
#[behaviour(to_swarm = "SharioEvent")]
pub struct SharioBehaviour {
    /// One framed chat message per substream on `/shario/chat/1.0.0`
    pub chat: request_response::json::Behaviour<ChatEnvelope, Ack>,
    /// One framed transfer message per substream on `/shario/transfer/1.0.0`
    pub transfer: request_response::json::Behaviour<TransferEnvelope, Ack>,
    /// Link-local multicast peer discovery. Disabled (not fatal) when the
    /// multicast socket cannot be bound.
    pub mdns: Toggle<mdns::tokio::Behaviour>,
    /// Distributed hash table for wide-area peer discovery
    pub kademlia: kad::Behaviour<MemoryStore>,
    /// Protocol identification and listen-address exchange
    pub identify: identify::Behaviour,
}

/// Events emitted by the composed behaviour, one variant per sub-behaviour.
#[derive(Debug)]
pub enum SharioEvent {
    Chat(request_response::Event<ChatEnvelope, Ack>),
    Transfer(request_response::Event<TransferEnvelope, Ack>),
    Mdns(mdns::Event),
    Kademlia(kad::Event),
    Identify(identify::Event),
}

impl From<request_response::Event<ChatEnvelope, Ack>> for SharioEvent {
    fn from(event: request_response::Event<ChatEnvelope, Ack>) -> Self {
        SharioEvent::Chat(event)
    }
}

impl From<request_response::Event<TransferEnvelope, Ack>> for SharioEvent {
    fn from(event: request_response::Event<TransferEnvelope, Ack>) -> Self {
        SharioEvent::Transfer(event)
    }
}

impl From<mdns::Event> for SharioEvent {
    fn from(event: mdns::Event) -> Self {
        SharioEvent::Mdns(event)
    }
}

impl From<kad::Event> for SharioEvent {
    fn from(event: kad::Event) -> Self {
        SharioEvent::Kademlia(event)
    }
}

impl From<identify::Event> for SharioEvent {
    fn from(event: identify::Event) -> Self {
        SharioEvent::Identify(event)
    }
}
