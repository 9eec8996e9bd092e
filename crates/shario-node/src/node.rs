//! The running node: identity + swarm + registry + protocols.

use std::path::PathBuf;
use std::sync::Arc;

use libp2p::{Multiaddr, PeerId};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use shario_chat::ChatManager;
use shario_net::{
    spawn_swarm, PeerRegistry, SwarmCommand, SwarmConfig, SwarmNotification,
};
use shario_shared::constants::DIAL_TIMEOUT;
use shario_shared::IdentityStore;
use shario_transfer::{TransferEvents, TransferManager};

/// Node configuration. Every field has a sensible default; tests override
/// the directories and listen addresses.
#[derive(Default)]
pub struct NodeConfig {
    /// Where the identity file lives. Defaults to `~/.shario`.
    pub config_dir: Option<PathBuf>,
    /// Where accepted files are written. Defaults to `~/Downloads/Shario`.
    pub downloads_dir: Option<PathBuf>,
    /// Listen addresses; empty means ephemeral TCP on all IPv4 and IPv6
    /// interfaces.
    pub listen_addrs: Vec<Multiaddr>,
    /// Multiaddrs used to seed the DHT routing table.
    pub bootstrap_peers: Vec<Multiaddr>,
    /// Identity file discriminator. Defaults to the process id so
    /// co-resident instances get distinct identities.
    pub process_tag: Option<u32>,
}

/// A running Shario node.
///
/// Construction order follows the dependency graph: identity first (the
/// only fatal failure point), then the transport host, then the registry
/// and the two protocol components, which subscribe to the registry by
/// handle — no component holds a back-reference to another.
pub struct Node {
    identity: Mutex<IdentityStore>,
    peer_id: PeerId,
    registry: Arc<PeerRegistry>,
    chat: Arc<ChatManager>,
    transfer: Arc<TransferManager>,
    cmd_tx: mpsc::Sender<SwarmCommand>,
}

impl Node {
    pub async fn start(config: NodeConfig) -> anyhow::Result<Arc<Self>> {
        let config_dir = config.config_dir.unwrap_or_else(default_config_dir);
        let process_tag = config.process_tag.unwrap_or_else(std::process::id);
        let identity = IdentityStore::open(&config_dir, process_tag)?;
        let downloads_dir = config.downloads_dir.unwrap_or_else(default_downloads_dir);

        let mut swarm_config = SwarmConfig {
            bootstrap_peers: config.bootstrap_peers,
            ..SwarmConfig::default()
        };
        if !config.listen_addrs.is_empty() {
            swarm_config.listen_addrs = config.listen_addrs;
        }

        let (cmd_tx, mut notif_rx, peer_id) =
            spawn_swarm(identity.keypair().clone(), swarm_config).await?;

        let registry = Arc::new(PeerRegistry::new());
        let chat = Arc::new(ChatManager::new(
            peer_id,
            identity.nickname().to_string(),
            cmd_tx.clone(),
            registry.clone(),
        ));
        let transfer = Arc::new(TransferManager::new(cmd_tx.clone(), downloads_dir));

        registry.subscribe(chat.clone());
        registry.subscribe(Arc::new(TransferEvents(transfer.clone())));

        chat.start();

        // Bridge swarm notifications into the registry and the protocol
        // state machines. Chunk writes happen on this task, so per-stream
        // ordering carries straight through to the file.
        let dispatch_registry = registry.clone();
        let dispatch_chat = chat.clone();
        let dispatch_transfer = transfer.clone();
        tokio::spawn(async move {
            while let Some(notification) = notif_rx.recv().await {
                match notification {
                    SwarmNotification::ConnectionOpened {
                        peer_id, address, ..
                    } => {
                        dispatch_registry.connection_opened(peer_id, address);
                    }
                    SwarmNotification::ConnectionClosed { peer_id, remaining } => {
                        dispatch_registry.connection_closed(peer_id, remaining);
                    }
                    SwarmNotification::InboundChat { peer_id, envelope } => {
                        dispatch_chat.handle_envelope(peer_id, envelope).await;
                    }
                    SwarmNotification::InboundTransfer { peer_id, envelope } => {
                        dispatch_transfer.handle_envelope(peer_id, envelope).await;
                    }
                }
            }
            debug!("Notification channel closed, dispatcher stopping");
        });

        info!(peer_id = %peer_id, "Shario node started");

        Ok(Arc::new(Self {
            identity: Mutex::new(identity),
            peer_id,
            registry,
            chat,
            transfer,
            cmd_tx,
        }))
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn nickname(&self) -> String {
        self.identity.lock().nickname().to_string()
    }

    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    pub fn chat(&self) -> &Arc<ChatManager> {
        &self.chat
    }

    pub fn transfer(&self) -> &Arc<TransferManager> {
        &self.transfer
    }

    /// Current listen addresses, `/p2p/` suffix included. Idempotent.
    pub async fn listen_addrs(&self) -> anyhow::Result<Vec<Multiaddr>> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(SwarmCommand::ListenAddrs { reply: tx })
            .await
            .map_err(|_| anyhow::anyhow!("network layer is shut down"))?;
        rx.await
            .map_err(|_| anyhow::anyhow!("network layer is shut down"))
    }

    /// Dial a peer at a multiaddr carrying its `/p2p/` identifier. Resolves
    /// once the session is authenticated, or fails with the dial error; a
    /// handshake that reveals a different identifier fails the dial.
    pub async fn dial(&self, addr: Multiaddr) -> anyhow::Result<()> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(SwarmCommand::Dial { addr, reply: tx })
            .await
            .map_err(|_| anyhow::anyhow!("network layer is shut down"))?;
        match tokio::time::timeout(DIAL_TIMEOUT, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(anyhow::anyhow!("network layer is shut down")),
            Err(_) => Err(anyhow::anyhow!(
                "dial timed out after {}s",
                DIAL_TIMEOUT.as_secs()
            )),
        }
    }

    /// Change the local nickname: persist it to the identity file, then
    /// broadcast it to every connected peer.
    pub async fn set_nickname(&self, nickname: &str) -> anyhow::Result<()> {
        let persisted = {
            let mut identity = self.identity.lock();
            identity.set_nickname(nickname)?;
            identity.nickname().to_string()
        };
        self.chat.set_nickname(&persisted).await;
        Ok(())
    }

    /// Export the identity for backup.
    pub fn export_identity(&self) -> anyhow::Result<Vec<u8>> {
        Ok(self.identity.lock().export()?)
    }

    /// Stop the node: cancel all open transfers, then shut the swarm down
    /// (closing every listener and session).
    pub async fn shutdown(&self) {
        self.transfer.cancel_all().await;
        let _ = self.cmd_tx.send(SwarmCommand::Shutdown).await;
        info!(peer_id = %self.peer_id, "Shario node stopped");
    }
}

fn default_config_dir() -> PathBuf {
    directories::BaseDirs::new()
        .map(|dirs| dirs.home_dir().join(".shario"))
        .unwrap_or_else(|| PathBuf::from(".shario"))
}

fn default_downloads_dir() -> PathBuf {
    directories::UserDirs::new()
        .and_then(|dirs| dirs.download_dir().map(|d| d.join("Shario")))
        .unwrap_or_else(|| PathBuf::from("Downloads/Shario"))
}
