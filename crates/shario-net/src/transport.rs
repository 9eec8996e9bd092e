use libp2p::identity::Keypair;
use tracing::{info, warn};

/// Build the Shario swarm: TCP (IPv4/IPv6) with a mandatory Noise
/// handshake and Yamux multiplexing. The handshake binds every session to
/// the remote's peer ID; plaintext sessions are not possible.
pub fn build_swarm(
    keypair: Keypair,
) -> anyhow::Result<libp2p::Swarm<super::behaviour::SharioBehaviour>> {
    use std::time::Duration;

    use libp2p::kad::{self, store::MemoryStore};
    use libp2p::request_response::{self, ProtocolSupport};
    use libp2p::swarm::behaviour::toggle::Toggle;
    use libp2p::{identify, mdns, noise, tcp, yamux, StreamProtocol, SwarmBuilder};

    use shario_shared::constants::{
        CHAT_PROTOCOL, IDLE_CONNECTION_TIMEOUT, PROTOCOL_VERSION, TRANSFER_PROTOCOL,
    };

    let swarm = SwarmBuilder::with_existing_identity(keypair)
        .with_tokio()
        .with_tcp(
            tcp::Config::default().nodelay(true),
            noise::Config::new,
            yamux::Config::default,
        )?
        .with_behaviour(|key| -> std::result::Result<super::behaviour::SharioBehaviour, Box<dyn std::error::Error + Send + Sync>> {
            let local_peer_id = key.public().to_peer_id();

            let chat = request_response::json::Behaviour::new(
                [(StreamProtocol::new(CHAT_PROTOCOL), ProtocolSupport::Full)],
                request_response::Config::default(),
            );

            let transfer = request_response::json::Behaviour::new(
                [(StreamProtocol::new(TRANSFER_PROTOCOL), ProtocolSupport::Full)],
                request_response::Config::default(),
            );

            // A multicast bind failure only disables link-local discovery.
            let mdns = match mdns::tokio::Behaviour::new(mdns::Config::default(), local_peer_id)
            {
                Ok(mdns) => Toggle::from(Some(mdns)),
                Err(e) => {
                    warn!(error = %e, "mDNS unavailable, link-local discovery disabled");
                    Toggle::from(None)
                }
            };

            let store = MemoryStore::new(local_peer_id);
            let mut kademlia = kad::Behaviour::new(local_peer_id, store);
            kademlia.set_mode(Some(kad::Mode::Server));

            let identify_config = identify::Config::new(PROTOCOL_VERSION.to_string(), key.public())
                .with_push_listen_addr_updates(true)
                .with_interval(Duration::from_secs(60));
            let identify = identify::Behaviour::new(identify_config);

            Ok(super::behaviour::SharioBehaviour {
                chat,
                transfer,
                mdns,
                kademlia,
                identify,
            })
        })?
        .with_swarm_config(|cfg| cfg.with_idle_connection_timeout(IDLE_CONNECTION_TIMEOUT))
        .build();

    info!(
        peer_id = %swarm.local_peer_id(),
        "Built Shario swarm with TCP + Noise + Yamux transport"
    );

    Ok(swarm)
}
