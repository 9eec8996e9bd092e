//! Main swarm orchestration with tokio mpsc command/notification pattern.
//!
//! The swarm event loop runs in a dedicated tokio task and owns the
//! transport, both discovery loops, and the request-response plumbing.
//! External code communicates with it through typed command and
//! notification channels, keeping the networking layer fully asynchronous
//! and decoupled.

use std::collections::HashMap;

use futures::StreamExt;
use libp2p::{
    identify, kad,
    multiaddr::Protocol,
    request_response::{self, OutboundRequestId},
    swarm::{dial_opts::DialOpts, SwarmEvent},
    mdns, Multiaddr, PeerId,
};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use shario_shared::constants::{
    DISCOVERY_INTERVAL, HEALTH_CHECK_GRACE, HEALTH_CHECK_INTERVAL, SERVICE_TAG,
};
use shario_shared::protocol::{Ack, ChatEnvelope, TransferEnvelope};

use crate::behaviour::SharioEvent;
use crate::transport::build_swarm;

// ---------------------------------------------------------------------------
// Command / notification types
// ---------------------------------------------------------------------------

/// Commands sent *into* the swarm task.
#[derive(Debug)]
pub enum SwarmCommand {
    /// Dial a remote peer. The multiaddr must carry a `/p2p/` suffix so
    /// the handshake can be checked against the dialed identifier.
    Dial {
        addr: Multiaddr,
        reply: oneshot::Sender<anyhow::Result<()>>,
    },
    /// Send one framed chat message. Best-effort: a failing message is
    /// dropped and logged, connection state is unchanged.
    SendChat {
        peer: PeerId,
        envelope: ChatEnvelope,
    },
    /// Send one framed transfer message. When `reply` is set it resolves
    /// once the remote has acked the substream (or with the failure).
    SendTransfer {
        peer: PeerId,
        envelope: TransferEnvelope,
        reply: Option<oneshot::Sender<anyhow::Result<()>>>,
    },
    /// Request the current listen addresses, `/p2p/` suffix included.
    ListenAddrs {
        reply: oneshot::Sender<Vec<Multiaddr>>,
    },
    /// Gracefully shut down the swarm and close all listeners.
    Shutdown,
}

/// Notifications sent *from* the swarm task to the application.
///
/// Connection events are reported per underlying connection; the session
/// registry performs the logical-peer deduplication.
#[derive(Debug)]
pub enum SwarmNotification {
    ConnectionOpened {
        peer_id: PeerId,
        address: Multiaddr,
        /// Connections now established to this peer, including this one.
        established: u32,
    },
    ConnectionClosed {
        peer_id: PeerId,
        /// Connections still remaining to this peer.
        remaining: u32,
    },
    InboundChat {
        peer_id: PeerId,
        envelope: ChatEnvelope,
    },
    InboundTransfer {
        peer_id: PeerId,
        envelope: TransferEnvelope,
    },
}

/// Configuration for spawning the swarm.
pub struct SwarmConfig {
    /// Addresses to listen on. Defaults to ephemeral TCP ports on all
    /// IPv4 and IPv6 interfaces.
    pub listen_addrs: Vec<Multiaddr>,
    /// Multiaddrs dialed at startup to seed the Kademlia routing table.
    pub bootstrap_peers: Vec<Multiaddr>,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            listen_addrs: vec![
                "/ip4/0.0.0.0/tcp/0".parse().expect("valid multiaddr"),
                "/ip6/::/tcp/0".parse().expect("valid multiaddr"),
            ],
            bootstrap_peers: Vec::new(),
        }
    }
}

/// Spawn the libp2p swarm in a background tokio task.
///
/// Returns channels for sending commands and receiving notifications,
/// plus the local `PeerId`.
pub async fn spawn_swarm(
    keypair: libp2p::identity::Keypair,
    config: SwarmConfig,
) -> anyhow::Result<(
    mpsc::Sender<SwarmCommand>,
    mpsc::Receiver<SwarmNotification>,
    PeerId,
)> {
    let mut swarm = build_swarm(keypair)?;
    let local_peer_id = *swarm.local_peer_id();

    for addr in &config.listen_addrs {
        swarm.listen_on(addr.clone())?;
    }

    info!(peer_id = %local_peer_id, "Swarm listening");

    // Dial bootstrap peers and seed the routing table
    for addr in &config.bootstrap_peers {
        if let Some(peer_id) = extract_peer_id(addr) {
            swarm
                .behaviour_mut()
                .kademlia
                .add_address(&peer_id, addr.clone());
        }
        if let Err(e) = swarm.dial(addr.clone()) {
            warn!(addr = %addr, error = %e, "Failed to dial bootstrap peer");
        } else {
            debug!(addr = %addr, "Dialing bootstrap peer");
        }
    }

    if !config.bootstrap_peers.is_empty() {
        if let Err(e) = swarm.behaviour_mut().kademlia.bootstrap() {
            warn!(error = %e, "Kademlia bootstrap failed to start");
        }
    }

    let (cmd_tx, mut cmd_rx) = mpsc::channel::<SwarmCommand>(256);
    let (notif_tx, notif_rx) = mpsc::channel::<SwarmNotification>(256);

    tokio::spawn(async move {
        let provider_key = kad::RecordKey::new(&SERVICE_TAG);
        let mut listen_addrs: Vec<Multiaddr> = Vec::new();
        let mut pending_dials: HashMap<PeerId, Vec<oneshot::Sender<anyhow::Result<()>>>> =
            HashMap::new();
        let mut pending_transfers: HashMap<
            OutboundRequestId,
            oneshot::Sender<anyhow::Result<()>>,
        > = HashMap::new();

        let mut discovery_tick = tokio::time::interval(DISCOVERY_INTERVAL);
        let mut health_tick = tokio::time::interval(HEALTH_CHECK_INTERVAL);
        let mut empty_health_checks: u32 = 0;

        loop {
            tokio::select! {
                // --- Incoming commands ---
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(SwarmCommand::Dial { addr, reply }) => {
                            handle_dial(&mut swarm, local_peer_id, addr, reply, &mut pending_dials);
                        }
                        Some(SwarmCommand::SendChat { peer, envelope }) => {
                            swarm.behaviour_mut().chat.send_request(&peer, envelope);
                        }
                        Some(SwarmCommand::SendTransfer { peer, envelope, reply }) => {
                            let request_id =
                                swarm.behaviour_mut().transfer.send_request(&peer, envelope);
                            if let Some(reply) = reply {
                                pending_transfers.insert(request_id, reply);
                            }
                        }
                        Some(SwarmCommand::ListenAddrs { reply }) => {
                            let addrs = listen_addrs
                                .iter()
                                .cloned()
                                .map(|a| a.with(Protocol::P2p(local_peer_id)))
                                .collect();
                            let _ = reply.send(addrs);
                        }
                        Some(SwarmCommand::Shutdown) => {
                            info!("Swarm shutdown requested");
                            break;
                        }
                        None => {
                            info!("Command channel closed, shutting down swarm");
                            break;
                        }
                    }
                }

                // --- DHT advertise + find round ---
                _ = discovery_tick.tick() => {
                    if let Err(e) = swarm
                        .behaviour_mut()
                        .kademlia
                        .start_providing(provider_key.clone())
                    {
                        debug!(error = %e, "DHT advertise not available yet");
                    }
                    swarm
                        .behaviour_mut()
                        .kademlia
                        .get_providers(provider_key.clone());
                }

                // --- Discovery health check ---
                _ = health_tick.tick() => {
                    let connected = swarm.network_info().num_peers();
                    if connected == 0 {
                        empty_health_checks += 1;
                        debug!(checks = empty_health_checks, "Health check: no peers discovered yet");
                        if empty_health_checks >= HEALTH_CHECK_GRACE {
                            warn!(
                                seconds = empty_health_checks * HEALTH_CHECK_INTERVAL.as_secs() as u32,
                                "No peers discovered; consider a manual dial or bootstrap peers"
                            );
                        }
                    } else {
                        empty_health_checks = 0;
                        debug!(peers = connected, "Health check");
                    }
                }

                // --- Swarm events ---
                event = swarm.select_next_some() => {
                    handle_swarm_event(
                        &mut swarm,
                        local_peer_id,
                        event,
                        &notif_tx,
                        &mut listen_addrs,
                        &mut pending_dials,
                        &mut pending_transfers,
                    )
                    .await;
                }
            }
        }

        info!("Swarm event loop terminated");
    });

    Ok((cmd_tx, notif_rx, local_peer_id))
}

fn handle_dial(
    swarm: &mut libp2p::Swarm<crate::behaviour::SharioBehaviour>,
    local_peer_id: PeerId,
    addr: Multiaddr,
    reply: oneshot::Sender<anyhow::Result<()>>,
    pending_dials: &mut HashMap<PeerId, Vec<oneshot::Sender<anyhow::Result<()>>>>,
) {
    let Some(peer_id) = extract_peer_id(&addr) else {
        let _ = reply.send(Err(anyhow::anyhow!(
            "address must include a /p2p/ peer identifier: {addr}"
        )));
        return;
    };
    if peer_id == local_peer_id {
        let _ = reply.send(Err(anyhow::anyhow!("refusing to dial self")));
        return;
    }
    match swarm.dial(addr.clone()) {
        Ok(()) => {
            pending_dials.entry(peer_id).or_default().push(reply);
        }
        Err(e) => {
            error!(addr = %addr, error = %e, "Dial failed");
            let _ = reply.send(Err(e.into()));
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_swarm_event(
    swarm: &mut libp2p::Swarm<crate::behaviour::SharioBehaviour>,
    local_peer_id: PeerId,
    event: SwarmEvent<SharioEvent>,
    notif_tx: &mpsc::Sender<SwarmNotification>,
    listen_addrs: &mut Vec<Multiaddr>,
    pending_dials: &mut HashMap<PeerId, Vec<oneshot::Sender<anyhow::Result<()>>>>,
    pending_transfers: &mut HashMap<OutboundRequestId, oneshot::Sender<anyhow::Result<()>>>,
) {
    match event {
        // ------------------------------------------------------------------
        // Application substreams
        // ------------------------------------------------------------------
        SwarmEvent::Behaviour(SharioEvent::Chat(request_response::Event::Message {
            peer,
            message,
            ..
        })) => match message {
            request_response::Message::Request {
                request, channel, ..
            } => {
                if swarm
                    .behaviour_mut()
                    .chat
                    .send_response(channel, Ack)
                    .is_err()
                {
                    debug!(peer = %peer, "Chat substream closed before ack");
                }
                let _ = notif_tx
                    .send(SwarmNotification::InboundChat {
                        peer_id: peer,
                        envelope: request,
                    })
                    .await;
            }
            request_response::Message::Response { .. } => {}
        },

        SwarmEvent::Behaviour(SharioEvent::Chat(request_response::Event::OutboundFailure {
            peer,
            error,
            ..
        })) => {
            // Chat messages are best-effort; the failing message is dropped.
            debug!(peer = %peer, error = %error, "Chat message dropped");
        }

        SwarmEvent::Behaviour(SharioEvent::Transfer(request_response::Event::Message {
            peer,
            message,
            ..
        })) => match message {
            request_response::Message::Request {
                request, channel, ..
            } => {
                if swarm
                    .behaviour_mut()
                    .transfer
                    .send_response(channel, Ack)
                    .is_err()
                {
                    debug!(peer = %peer, "Transfer substream closed before ack");
                }
                let _ = notif_tx
                    .send(SwarmNotification::InboundTransfer {
                        peer_id: peer,
                        envelope: request,
                    })
                    .await;
            }
            request_response::Message::Response { request_id, .. } => {
                if let Some(reply) = pending_transfers.remove(&request_id) {
                    let _ = reply.send(Ok(()));
                }
            }
        },

        SwarmEvent::Behaviour(SharioEvent::Transfer(
            request_response::Event::OutboundFailure {
                peer,
                request_id,
                error,
                ..
            },
        )) => {
            debug!(peer = %peer, error = %error, "Transfer message failed");
            if let Some(reply) = pending_transfers.remove(&request_id) {
                let _ = reply.send(Err(anyhow::anyhow!("transfer send failed: {error}")));
            }
        }

        SwarmEvent::Behaviour(SharioEvent::Chat(_))
        | SwarmEvent::Behaviour(SharioEvent::Transfer(_)) => {}

        // ------------------------------------------------------------------
        // Discovery
        // ------------------------------------------------------------------
        SwarmEvent::Behaviour(SharioEvent::Mdns(mdns::Event::Discovered(peers))) => {
            for (peer_id, addr) in peers {
                if peer_id == local_peer_id {
                    continue;
                }
                debug!(peer = %peer_id, addr = %addr, "mDNS discovered peer");
                swarm
                    .behaviour_mut()
                    .kademlia
                    .add_address(&peer_id, addr.clone());
                let opts = DialOpts::peer_id(peer_id).addresses(vec![addr]).build();
                if let Err(e) = swarm.dial(opts) {
                    debug!(peer = %peer_id, error = %e, "mDNS dial skipped");
                }
            }
        }

        SwarmEvent::Behaviour(SharioEvent::Mdns(mdns::Event::Expired(peers))) => {
            for (peer_id, _) in peers {
                debug!(peer = %peer_id, "mDNS record expired");
            }
        }

        SwarmEvent::Behaviour(SharioEvent::Kademlia(kad::Event::OutboundQueryProgressed {
            result,
            ..
        })) => match result {
            kad::QueryResult::GetProviders(Ok(kad::GetProvidersOk::FoundProviders {
                providers,
                ..
            })) => {
                for peer_id in providers {
                    if peer_id == local_peer_id || swarm.is_connected(&peer_id) {
                        continue;
                    }
                    debug!(peer = %peer_id, "DHT discovered peer");
                    if let Err(e) = swarm.dial(DialOpts::peer_id(peer_id).build()) {
                        debug!(peer = %peer_id, error = %e, "DHT dial skipped");
                    }
                }
            }
            kad::QueryResult::GetProviders(Ok(
                kad::GetProvidersOk::FinishedWithNoAdditionalRecord { .. },
            )) => {}
            kad::QueryResult::GetProviders(Err(e)) => {
                debug!(error = %e, "DHT provider query failed");
            }
            kad::QueryResult::StartProviding(Ok(_)) => {
                debug!("Advertised service on DHT");
            }
            kad::QueryResult::StartProviding(Err(e)) => {
                // Expected until the routing table is populated.
                debug!(error = %e, "DHT advertise failed");
            }
            other => {
                debug!(result = ?other, "Kademlia query progressed");
            }
        },

        SwarmEvent::Behaviour(SharioEvent::Kademlia(_)) => {}

        SwarmEvent::Behaviour(SharioEvent::Identify(identify::Event::Received {
            peer_id,
            info,
            ..
        })) => {
            debug!(
                peer = %peer_id,
                protocol = %info.protocol_version,
                "Identify: received info from peer"
            );
            for addr in &info.listen_addrs {
                swarm
                    .behaviour_mut()
                    .kademlia
                    .add_address(&peer_id, addr.clone());
            }
        }

        SwarmEvent::Behaviour(SharioEvent::Identify(_)) => {}

        // ------------------------------------------------------------------
        // Connection lifecycle
        // ------------------------------------------------------------------
        SwarmEvent::ConnectionEstablished {
            peer_id,
            endpoint,
            num_established,
            ..
        } => {
            let addr = endpoint.get_remote_address().clone();
            info!(peer = %peer_id, addr = %addr, "Connection established");
            if let Some(replies) = pending_dials.remove(&peer_id) {
                for reply in replies {
                    let _ = reply.send(Ok(()));
                }
            }
            let _ = notif_tx
                .send(SwarmNotification::ConnectionOpened {
                    peer_id,
                    address: addr,
                    established: num_established.get(),
                })
                .await;
        }

        SwarmEvent::ConnectionClosed {
            peer_id,
            num_established,
            ..
        } => {
            debug!(peer = %peer_id, remaining = num_established, "Connection closed");
            let _ = notif_tx
                .send(SwarmNotification::ConnectionClosed {
                    peer_id,
                    remaining: num_established,
                })
                .await;
        }

        SwarmEvent::OutgoingConnectionError { peer_id, error, .. } => {
            warn!(peer = ?peer_id, error = %error, "Outgoing connection error");
            if let Some(peer_id) = peer_id {
                if let Some(replies) = pending_dials.remove(&peer_id) {
                    for reply in replies {
                        let _ = reply.send(Err(anyhow::anyhow!("dial failed: {error}")));
                    }
                }
            }
        }

        SwarmEvent::IncomingConnectionError { error, .. } => {
            warn!(error = %error, "Incoming connection error");
        }

        SwarmEvent::NewListenAddr { address, .. } => {
            info!(addr = %address, "Listening on new address");
            listen_addrs.push(address);
        }

        SwarmEvent::ExpiredListenAddr { address, .. } => {
            debug!(addr = %address, "Listen address expired");
            listen_addrs.retain(|a| a != &address);
        }

        _ => {}
    }
}

/// Extract a `PeerId` from a multiaddr, if one is present.
fn extract_peer_id(addr: &Multiaddr) -> Option<PeerId> {
    addr.iter().find_map(|p| {
        if let Protocol::P2p(peer_id) = p {
            Some(peer_id)
        } else {
            None
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_peer_id() {
        let peer_id = PeerId::random();
        let addr: Multiaddr = format!("/ip4/127.0.0.1/tcp/4001/p2p/{peer_id}")
            .parse()
            .unwrap();
        assert_eq!(extract_peer_id(&addr), Some(peer_id));

        let bare: Multiaddr = "/ip4/127.0.0.1/tcp/4001".parse().unwrap();
        assert_eq!(extract_peer_id(&bare), None);
    }

    #[test]
    fn test_default_config_listens_dual_stack() {
        let config = SwarmConfig::default();
        assert_eq!(config.listen_addrs.len(), 2);
        let rendered: Vec<String> =
            config.listen_addrs.iter().map(|a| a.to_string()).collect();
        assert!(rendered.iter().any(|a| a.starts_with("/ip4/")));
        assert!(rendered.iter().any(|a| a.starts_with("/ip6/")));
    }
}
