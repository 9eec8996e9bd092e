//! Chat protocol state machine.
//!
//! Owns the room graph, fans outbound messages out to room participants,
//! and reacts to registry events (peers joining and leaving the global
//! room). Cross-component references are by peer identifier only; the
//! network layer is reached through the swarm command channel.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use libp2p::PeerId;
use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use shario_net::{PeerInfo, PeerRegistry, RegistryObserver, SwarmCommand};
use shario_shared::constants::GLOBAL_ROOM_ID;
use shario_shared::protocol::{
    ChatEnvelope, JoinPayload, LeavePayload, MessageKind, NicknameChangePayload, RoomType,
    SystemPayload, TextPayload, TypingPayload,
};

use crate::room::{direct_room_id, Message, Room, RoomSummary};

#[derive(Error, Debug)]
pub enum ChatError {
    #[error("room not found: {0}")]
    RoomNotFound(String),
}

type MessageHandler = Arc<dyn Fn(&Message) + Send + Sync>;
type RoomUpdateHandler = Arc<dyn Fn(&RoomSummary) + Send + Sync>;
type TypingHandler = Arc<dyn Fn(&str, &PeerId, bool) + Send + Sync>;

/// Chat component. One per node; subscribe it to the session registry at
/// construction time.
pub struct ChatManager {
    local_peer: PeerId,
    nickname: RwLock<String>,
    cmd_tx: mpsc::Sender<SwarmCommand>,
    registry: Arc<PeerRegistry>,
    rooms: RwLock<HashMap<String, Arc<RwLock<Room>>>>,

    on_message: RwLock<Option<MessageHandler>>,
    on_room_update: RwLock<Option<RoomUpdateHandler>>,
    on_typing: RwLock<Option<TypingHandler>>,
}

impl ChatManager {
    pub fn new(
        local_peer: PeerId,
        nickname: String,
        cmd_tx: mpsc::Sender<SwarmCommand>,
        registry: Arc<PeerRegistry>,
    ) -> Self {
        Self {
            local_peer,
            nickname: RwLock::new(nickname),
            cmd_tx,
            registry,
            rooms: RwLock::new(HashMap::new()),
            on_message: RwLock::new(None),
            on_room_update: RwLock::new(None),
            on_typing: RwLock::new(None),
        }
    }

    /// Create the global room with the local node as its only participant
    /// and a welcome system message.
    pub fn start(&self) {
        let nickname = self.nickname.read().clone();
        let mut room = Room::new(
            GLOBAL_ROOM_ID.to_string(),
            "Global Chat".to_string(),
            RoomType::Global,
        );
        room.participants.insert(self.local_peer, nickname.clone());

        let welcome = Message::system(
            format!("Welcome to Shario! {nickname} joined the global chat."),
            GLOBAL_ROOM_ID.to_string(),
        );
        room.push_message(welcome.clone());
        let summary = room.summary();

        self.rooms
            .write()
            .insert(GLOBAL_ROOM_ID.to_string(), Arc::new(RwLock::new(room)));
        debug!("Created global chat room");

        self.notify_message(&welcome);
        self.notify_room_update(&summary);
    }

    // -----------------------------------------------------------------------
    // Subscriptions
    // -----------------------------------------------------------------------

    pub fn set_message_handler(&self, handler: impl Fn(&Message) + Send + Sync + 'static) {
        *self.on_message.write() = Some(Arc::new(handler));
    }

    pub fn set_room_update_handler(
        &self,
        handler: impl Fn(&RoomSummary) + Send + Sync + 'static,
    ) {
        *self.on_room_update.write() = Some(Arc::new(handler));
    }

    pub fn set_typing_handler(
        &self,
        handler: impl Fn(&str, &PeerId, bool) + Send + Sync + 'static,
    ) {
        *self.on_typing.write() = Some(Arc::new(handler));
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn nickname(&self) -> String {
        self.nickname.read().clone()
    }

    pub fn rooms(&self) -> Vec<RoomSummary> {
        self.rooms
            .read()
            .values()
            .map(|room| room.read().summary())
            .collect()
    }

    pub fn room(&self, room_id: &str) -> Option<RoomSummary> {
        self.rooms
            .read()
            .get(room_id)
            .map(|room| room.read().summary())
    }

    pub fn global_room(&self) -> Option<RoomSummary> {
        self.room(GLOBAL_ROOM_ID)
    }

    /// Full message log of a room, oldest first.
    pub fn messages(&self, room_id: &str) -> Vec<Message> {
        self.rooms
            .read()
            .get(room_id)
            .map(|room| room.read().messages.clone())
            .unwrap_or_default()
    }

    // -----------------------------------------------------------------------
    // Operations
    // -----------------------------------------------------------------------

    /// Send a text message to a room, fanning it out to every remote
    /// participant. Local-test rooms never touch the network.
    pub async fn send_message(
        &self,
        room_id: &str,
        content: &str,
    ) -> Result<Message, ChatError> {
        let room = self
            .room_handle(room_id)
            .ok_or_else(|| ChatError::RoomNotFound(room_id.to_string()))?;

        let message = Message::text(
            content.to_string(),
            self.nickname(),
            self.local_peer,
            room_id.to_string(),
        );

        let (summary, recipients) = {
            let mut room = room.write();
            room.push_message(message.clone());
            let recipients: Vec<PeerId> = if room.room_type == RoomType::LocalTest {
                Vec::new()
            } else {
                room.participants
                    .keys()
                    .filter(|id| **id != self.local_peer)
                    .copied()
                    .collect()
            };
            (room.summary(), recipients)
        };

        let envelope = ChatEnvelope::Text(TextPayload {
            id: message.id.clone(),
            content: message.content.clone(),
            sender: message.sender.clone(),
            sender_id: self.local_peer.to_base58(),
            timestamp: message.timestamp.timestamp(),
            room_id: room_id.to_string(),
            kind: MessageKind::Text,
        });
        for peer in recipients {
            self.send_envelope(peer, envelope.clone()).await;
        }

        self.notify_message(&message);
        self.notify_room_update(&summary);
        Ok(message)
    }

    /// Send a typing indicator to every remote participant of a room.
    pub async fn send_typing(&self, room_id: &str, is_typing: bool) {
        let Some(room) = self.room_handle(room_id) else {
            return;
        };
        let recipients: Vec<PeerId> = {
            let room = room.read();
            if room.room_type == RoomType::LocalTest {
                return;
            }
            room.participants
                .keys()
                .filter(|id| **id != self.local_peer)
                .copied()
                .collect()
        };

        let envelope = ChatEnvelope::Typing(TypingPayload {
            room_id: room_id.to_string(),
            is_typing,
        });
        for peer in recipients {
            self.send_envelope(peer, envelope.clone()).await;
        }
    }

    /// Create (or return) the direct room with a peer. The room identifier
    /// is a deterministic function of both identifiers, so either end may
    /// create it first. A `join` message introduces the room to the peer.
    pub async fn create_direct_room(&self, peer_id: PeerId) -> RoomSummary {
        let room_id = direct_room_id(&self.local_peer, &peer_id);
        if let Some(existing) = self.room(&room_id) {
            return existing;
        }

        let peer_nickname = self
            .registry
            .nickname(&peer_id)
            .unwrap_or_else(|| short_id(&peer_id));

        let mut room = Room::new(room_id.clone(), peer_nickname.clone(), RoomType::Direct);
        room.participants.insert(self.local_peer, self.nickname());
        room.participants.insert(peer_id, peer_nickname);
        let summary = room.summary();

        self.rooms
            .write()
            .entry(room_id.clone())
            .or_insert_with(|| Arc::new(RwLock::new(room)));

        let envelope = ChatEnvelope::Join(JoinPayload {
            room_id: summary.id.clone(),
            room_name: summary.name.clone(),
            room_type: summary.room_type,
            created_at: summary.created_at.timestamp(),
            participants: summary
                .participants
                .iter()
                .map(|(id, nick)| (id.to_base58(), nick.clone()))
                .collect(),
        });
        self.send_envelope(peer_id, envelope).await;

        self.notify_room_update(&summary);
        summary
    }

    /// Create a local-only room for exercising the chat UI without any
    /// network traffic.
    pub fn create_local_test_room(&self, name: &str) -> RoomSummary {
        let room_id = format!("local_test_{}", Uuid::new_v4());
        let mut room = Room::new(room_id.clone(), name.to_string(), RoomType::LocalTest);
        room.participants.insert(self.local_peer, self.nickname());
        room.push_message(Message::system(
            "Welcome to the test room! Messages here stay on this machine.".to_string(),
            room_id.clone(),
        ));
        let summary = room.summary();

        self.rooms
            .write()
            .insert(room_id, Arc::new(RwLock::new(room)));
        self.notify_room_update(&summary);
        summary
    }

    pub fn mark_room_read(&self, room_id: &str) {
        let Some(room) = self.room_handle(room_id) else {
            return;
        };
        let summary = {
            let mut room = room.write();
            room.unread_count = 0;
            room.summary()
        };
        self.notify_room_update(&summary);
    }

    /// Adopt a new local nickname and broadcast the change to every
    /// connected peer.
    pub async fn set_nickname(&self, new_nickname: &str) {
        let old_nickname = {
            let mut nickname = self.nickname.write();
            std::mem::replace(&mut *nickname, new_nickname.to_string())
        };
        if old_nickname == new_nickname {
            return;
        }

        self.update_nickname_in_rooms(&self.local_peer.clone(), new_nickname);

        let envelope = ChatEnvelope::NicknameChange(NicknameChangePayload {
            old_nickname,
            new_nickname: new_nickname.to_string(),
            peer_id: self.local_peer.to_base58(),
        });
        for peer in self.registry.peers() {
            self.send_envelope(peer.peer_id, envelope.clone()).await;
        }
    }

    // -----------------------------------------------------------------------
    // Inbound protocol handling
    // -----------------------------------------------------------------------

    /// Dispatch one framed message received on the chat substream.
    pub async fn handle_envelope(&self, from: PeerId, envelope: ChatEnvelope) {
        match envelope {
            ChatEnvelope::Text(payload) => self.handle_text(from, payload),
            ChatEnvelope::System(payload) => self.handle_system(payload),
            ChatEnvelope::Join(payload) => self.handle_join(from, payload),
            ChatEnvelope::Leave(payload) => self.handle_leave(from, payload),
            ChatEnvelope::Typing(payload) => {
                if let Some(handler) = self.on_typing.read().clone() {
                    handler(&payload.room_id, &from, payload.is_typing);
                }
            }
            ChatEnvelope::NicknameChange(payload) => self.handle_nickname_change(from, payload),
        }
    }

    fn handle_text(&self, from: PeerId, payload: TextPayload) {
        let sender_id: PeerId = match payload.sender_id.parse() {
            Ok(id) => id,
            Err(e) => {
                debug!(error = %e, "Dropping text message with invalid sender id");
                return;
            }
        };

        // Stale-nickname resolution: render the nickname currently in the
        // registry, never the snapshot stamped into the message. Only a
        // nickname_change message may rewrite the registry.
        let sender = self
            .registry
            .nickname(&sender_id)
            .unwrap_or_else(|| short_id(&sender_id));

        let message = Message {
            id: payload.id,
            content: payload.content,
            sender: sender.clone(),
            sender_id: Some(sender_id),
            timestamp: DateTime::from_timestamp(payload.timestamp, 0).unwrap_or_else(Utc::now),
            room_id: payload.room_id.clone(),
            kind: payload.kind,
        };

        let room = {
            let mut rooms = self.rooms.write();
            rooms
                .entry(payload.room_id.clone())
                .or_insert_with(|| {
                    let mut room = Room::new(
                        payload.room_id.clone(),
                        sender.clone(),
                        RoomType::Direct,
                    );
                    room.participants.insert(self.local_peer, self.nickname());
                    room.participants.insert(from, sender.clone());
                    Arc::new(RwLock::new(room))
                })
                .clone()
        };

        let summary = {
            let mut room = room.write();
            room.push_message(message.clone());
            room.unread_count += 1;
            room.summary()
        };

        self.notify_message(&message);
        self.notify_room_update(&summary);
    }

    fn handle_system(&self, payload: SystemPayload) {
        let Some(room) = self.room_handle(&payload.room_id) else {
            debug!(room = %payload.room_id, "Dropping system message for unknown room");
            return;
        };
        let message = Message {
            id: payload.id,
            content: payload.content,
            sender: "System".to_string(),
            sender_id: None,
            timestamp: DateTime::from_timestamp(payload.timestamp, 0).unwrap_or_else(Utc::now),
            room_id: payload.room_id,
            kind: MessageKind::System,
        };
        let summary = {
            let mut room = room.write();
            room.push_message(message.clone());
            room.summary()
        };
        self.notify_message(&message);
        self.notify_room_update(&summary);
    }

    fn handle_join(&self, from: PeerId, payload: JoinPayload) {
        if payload.room_id == GLOBAL_ROOM_ID {
            if let Some(peer) = self.registry.get(&from) {
                self.add_peer_to_global_room(&peer);
            }
            return;
        }

        let mut room = Room::new(payload.room_id.clone(), payload.room_name, payload.room_type);
        room.created_at = DateTime::from_timestamp(payload.created_at, 0).unwrap_or_else(Utc::now);
        for (id, nickname) in payload.participants {
            match id.parse::<PeerId>() {
                Ok(peer_id) => {
                    room.participants.insert(peer_id, nickname);
                }
                Err(e) => debug!(id = %id, error = %e, "Skipping invalid participant id"),
            }
        }
        room.participants
            .entry(self.local_peer)
            .or_insert_with(|| self.nickname());

        let peer_nickname = room
            .participants
            .get(&from)
            .cloned()
            .unwrap_or_else(|| short_id(&from));
        let system = Message::system(
            format!("Joined chat with {peer_nickname}"),
            payload.room_id.clone(),
        );
        room.push_message(system.clone());
        let summary = room.summary();

        self.rooms
            .write()
            .entry(payload.room_id)
            .or_insert_with(|| Arc::new(RwLock::new(room)));

        self.notify_message(&system);
        self.notify_room_update(&summary);
    }

    fn handle_leave(&self, from: PeerId, payload: LeavePayload) {
        let Some(room) = self.room_handle(&payload.room_id) else {
            return;
        };
        let (message, summary) = {
            let mut room = room.write();
            let Some(nickname) = room.participants.remove(&from) else {
                return;
            };
            let message =
                Message::system(format!("{nickname} left the chat"), payload.room_id.clone());
            room.push_message(message.clone());
            (message, room.summary())
        };
        self.notify_message(&message);
        self.notify_room_update(&summary);
    }

    fn handle_nickname_change(&self, from: PeerId, payload: NicknameChangePayload) {
        debug!(
            peer = %from,
            old = %payload.old_nickname,
            new = %payload.new_nickname,
            "Nickname change received"
        );

        self.registry.set_nickname(&from, &payload.new_nickname);
        self.update_nickname_in_rooms(&from, &payload.new_nickname);

        // A no-op "change" is just the announcement a peer sends right
        // after connecting, replacing our placeholder; no system message.
        if payload.old_nickname == payload.new_nickname {
            return;
        }

        if let Some(room) = self.room_handle(GLOBAL_ROOM_ID) {
            let message = Message::system(
                format!(
                    "{} changed their nickname to {}",
                    payload.old_nickname, payload.new_nickname
                ),
                GLOBAL_ROOM_ID.to_string(),
            );
            let summary = {
                let mut room = room.write();
                room.push_message(message.clone());
                room.summary()
            };
            self.notify_message(&message);
            self.notify_room_update(&summary);
        }
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn room_handle(&self, room_id: &str) -> Option<Arc<RwLock<Room>>> {
        self.rooms.read().get(room_id).cloned()
    }

    fn add_peer_to_global_room(&self, peer: &PeerInfo) {
        let Some(room) = self.room_handle(GLOBAL_ROOM_ID) else {
            return;
        };
        let joined = {
            let mut room = room.write();
            if room.participants.contains_key(&peer.peer_id) {
                None
            } else {
                room.participants
                    .insert(peer.peer_id, peer.nickname.clone());
                let message = Message::system(
                    format!("{} joined the global chat", peer.nickname),
                    GLOBAL_ROOM_ID.to_string(),
                );
                room.push_message(message.clone());
                Some((message, room.summary()))
            }
        };

        if let Some((message, summary)) = joined {
            self.notify_message(&message);
            self.notify_room_update(&summary);
        }
    }

    /// Rewrite a peer's nickname in every room it participates in.
    fn update_nickname_in_rooms(&self, peer_id: &PeerId, new_nickname: &str) {
        let rooms: Vec<Arc<RwLock<Room>>> = self.rooms.read().values().cloned().collect();
        for room in rooms {
            let summary = {
                let mut room = room.write();
                match room.participants.get_mut(peer_id) {
                    Some(nickname) => {
                        *nickname = new_nickname.to_string();
                        Some(room.summary())
                    }
                    None => None,
                }
            };
            if let Some(summary) = summary {
                self.notify_room_update(&summary);
            }
        }
    }

    async fn send_envelope(&self, peer: PeerId, envelope: ChatEnvelope) {
        if self
            .cmd_tx
            .send(SwarmCommand::SendChat { peer, envelope })
            .await
            .is_err()
        {
            warn!(peer = %peer, "Network layer is gone, chat message dropped");
        }
    }

    fn notify_message(&self, message: &Message) {
        if let Some(handler) = self.on_message.read().clone() {
            handler(message);
        }
    }

    fn notify_room_update(&self, summary: &RoomSummary) {
        if let Some(handler) = self.on_room_update.read().clone() {
            handler(summary);
        }
    }
}

impl RegistryObserver for ChatManager {
    fn on_peer_connected(&self, peer: &PeerInfo) {
        debug!(peer = %peer.peer_id, "Chat: peer connected");
        self.add_peer_to_global_room(peer);

        // Announce our nickname so the peer can replace the placeholder it
        // derived from our identifier.
        let nickname = self.nickname();
        let envelope = ChatEnvelope::NicknameChange(NicknameChangePayload {
            old_nickname: nickname.clone(),
            new_nickname: nickname,
            peer_id: self.local_peer.to_base58(),
        });
        let cmd_tx = self.cmd_tx.clone();
        let peer_id = peer.peer_id;
        tokio::spawn(async move {
            let _ = cmd_tx
                .send(SwarmCommand::SendChat {
                    peer: peer_id,
                    envelope,
                })
                .await;
        });
    }

    fn on_peer_disconnected(&self, peer_id: &PeerId) {
        debug!(peer = %peer_id, "Chat: peer disconnected");
        let rooms: Vec<Arc<RwLock<Room>>> = self.rooms.read().values().cloned().collect();
        for room in rooms {
            let appended = {
                let mut room = room.write();
                match room.participants.get(peer_id).cloned() {
                    Some(nickname) => {
                        let message = Message::system(
                            format!("{nickname} has disconnected"),
                            room.id.clone(),
                        );
                        room.push_message(message.clone());
                        Some((message, room.summary()))
                    }
                    None => None,
                }
            };
            if let Some((message, summary)) = appended {
                self.notify_message(&message);
                self.notify_room_update(&summary);
            }
        }
    }
}

fn short_id(peer_id: &PeerId) -> String {
    peer_id.to_base58().chars().take(8).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Harness {
        manager: Arc<ChatManager>,
        registry: Arc<PeerRegistry>,
        cmd_rx: mpsc::Receiver<SwarmCommand>,
        local_peer: PeerId,
    }

    fn harness(nickname: &str) -> Harness {
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let registry = Arc::new(PeerRegistry::new());
        let local_peer = PeerId::random();
        let manager = Arc::new(ChatManager::new(
            local_peer,
            nickname.to_string(),
            cmd_tx,
            registry.clone(),
        ));
        manager.start();
        Harness {
            manager,
            registry,
            cmd_rx,
            local_peer,
        }
    }

    fn connect_peer(registry: &PeerRegistry, nickname: &str) -> PeerId {
        let peer = PeerId::random();
        registry.connection_opened(peer, "/ip4/127.0.0.1/tcp/4001".parse().unwrap());
        registry.set_nickname(&peer, nickname);
        peer
    }

    #[test]
    fn test_global_room_created_with_welcome() {
        let h = harness("Alice");
        let global = h.manager.global_room().unwrap();
        assert_eq!(global.room_type, RoomType::Global);
        assert_eq!(global.participants[&h.local_peer], "Alice");
        assert_eq!(global.message_count, 1);
        assert_eq!(
            global.last_message.unwrap().kind,
            MessageKind::System
        );
    }

    /// Drain every envelope currently queued on the command channel.
    fn drain(cmd_rx: &mut mpsc::Receiver<SwarmCommand>) -> Vec<(PeerId, ChatEnvelope)> {
        let mut sent = Vec::new();
        while let Ok(cmd) = cmd_rx.try_recv() {
            if let SwarmCommand::SendChat { peer, envelope } = cmd {
                sent.push((peer, envelope));
            }
        }
        sent
    }

    #[tokio::test]
    async fn test_send_message_fans_out_to_participants() {
        let mut h = harness("Alice");
        let bob = connect_peer(&h.registry, "Bob");
        h.manager.on_peer_connected(&h.registry.get(&bob).unwrap());

        let message = h.manager.send_message(GLOBAL_ROOM_ID, "hello").await.unwrap();
        assert_eq!(message.kind, MessageKind::Text);

        let sent = drain(&mut h.cmd_rx);
        let text = sent
            .iter()
            .find_map(|(peer, envelope)| match envelope {
                ChatEnvelope::Text(payload) => Some((*peer, payload)),
                _ => None,
            })
            .expect("text envelope sent");
        assert_eq!(text.0, bob);
        assert_eq!(text.1.content, "hello");
        assert_eq!(text.1.sender, "Alice");
        assert_eq!(text.1.room_id, GLOBAL_ROOM_ID);
    }

    #[tokio::test]
    async fn test_send_message_to_unknown_room_fails() {
        let h = harness("Alice");
        assert!(matches!(
            h.manager.send_message("nope", "hello").await,
            Err(ChatError::RoomNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_local_test_room_never_sends() {
        let mut h = harness("Alice");
        let room = h.manager.create_local_test_room("scratch");
        assert_eq!(room.room_type, RoomType::LocalTest);

        h.manager.send_message(&room.id, "only local").await.unwrap();
        assert!(h.cmd_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_peer_connected_joins_global_room() {
        let h = harness("Alice");
        let bob = connect_peer(&h.registry, "Bob");
        h.manager.on_peer_connected(&h.registry.get(&bob).unwrap());

        let global = h.manager.global_room().unwrap();
        assert_eq!(global.participants[&bob], "Bob");
        assert!(global
            .last_message
            .unwrap()
            .content
            .contains("joined the global chat"));

        // A reconnect must not produce a second join message
        let count_before = h.manager.global_room().unwrap().message_count;
        h.manager.on_peer_connected(&h.registry.get(&bob).unwrap());
        assert_eq!(h.manager.global_room().unwrap().message_count, count_before);
    }

    #[tokio::test]
    async fn test_inbound_text_uses_registry_nickname() {
        let h = harness("Alice");
        let bob = connect_peer(&h.registry, "Bobby");

        let payload = TextPayload {
            id: "m1".into(),
            content: "hi".into(),
            sender: "Bob".into(), // stale snapshot
            sender_id: bob.to_base58(),
            timestamp: Utc::now().timestamp(),
            room_id: GLOBAL_ROOM_ID.into(),
            kind: MessageKind::Text,
        };
        h.manager.handle_envelope(bob, ChatEnvelope::Text(payload)).await;

        let messages = h.manager.messages(GLOBAL_ROOM_ID);
        let text = messages.last().unwrap();
        assert_eq!(text.sender, "Bobby");
        assert_eq!(h.manager.global_room().unwrap().unread_count, 1);
    }

    #[tokio::test]
    async fn test_text_from_placeholder_peer_keeps_placeholder() {
        let h = harness("Alice");
        // Connected, but no nickname_change received yet: the registry
        // still holds the placeholder derived from the identifier.
        let bob = PeerId::random();
        h.registry
            .connection_opened(bob, "/ip4/127.0.0.1/tcp/4001".parse().unwrap());
        let placeholder = h.registry.nickname(&bob).unwrap();
        assert_eq!(placeholder, short_id(&bob));

        let payload = TextPayload {
            id: "m1".into(),
            content: "hi".into(),
            sender: "Mallory".into(),
            sender_id: bob.to_base58(),
            timestamp: Utc::now().timestamp(),
            room_id: GLOBAL_ROOM_ID.into(),
            kind: MessageKind::Text,
        };
        h.manager.handle_envelope(bob, ChatEnvelope::Text(payload)).await;

        // The registry value is displayed, and the stamped sender must
        // not have written through to the registry.
        let messages = h.manager.messages(GLOBAL_ROOM_ID);
        assert_eq!(messages.last().unwrap().sender, placeholder);
        assert_eq!(h.registry.nickname(&bob).unwrap(), placeholder);
    }

    #[tokio::test]
    async fn test_inbound_text_creates_direct_room() {
        let h = harness("Alice");
        let bob = connect_peer(&h.registry, "Bob");
        let room_id = direct_room_id(&h.local_peer, &bob);

        let payload = TextPayload {
            id: "m1".into(),
            content: "psst".into(),
            sender: "Bob".into(),
            sender_id: bob.to_base58(),
            timestamp: Utc::now().timestamp(),
            room_id: room_id.clone(),
            kind: MessageKind::Text,
        };
        h.manager.handle_envelope(bob, ChatEnvelope::Text(payload)).await;

        let room = h.manager.room(&room_id).unwrap();
        assert_eq!(room.room_type, RoomType::Direct);
        assert_eq!(room.participants.len(), 2);
        assert_eq!(room.unread_count, 1);
    }

    #[tokio::test]
    async fn test_nickname_change_updates_registry_and_rooms() {
        let h = harness("Alice");
        let bob = connect_peer(&h.registry, "Bob");
        h.manager.on_peer_connected(&h.registry.get(&bob).unwrap());

        let payload = NicknameChangePayload {
            old_nickname: "Bob".into(),
            new_nickname: "Robert".into(),
            peer_id: bob.to_base58(),
        };
        h.manager.handle_envelope(bob, ChatEnvelope::NicknameChange(payload)).await;

        assert_eq!(h.registry.nickname(&bob).as_deref(), Some("Robert"));
        let global = h.manager.global_room().unwrap();
        assert_eq!(global.participants[&bob], "Robert");
        assert!(global
            .last_message
            .unwrap()
            .content
            .contains("Bob changed their nickname to Robert"));
    }

    #[tokio::test]
    async fn test_set_nickname_broadcasts_to_peers() {
        let mut h = harness("Alice");
        let bob = connect_peer(&h.registry, "Bob");
        h.manager.on_peer_connected(&h.registry.get(&bob).unwrap());

        h.manager.set_nickname("Alicia").await;
        assert_eq!(h.manager.nickname(), "Alicia");
        assert_eq!(
            h.manager.global_room().unwrap().participants[&h.local_peer],
            "Alicia"
        );

        let sent = drain(&mut h.cmd_rx);
        let change = sent
            .iter()
            .find_map(|(peer, envelope)| match envelope {
                ChatEnvelope::NicknameChange(payload)
                    if payload.old_nickname != payload.new_nickname =>
                {
                    Some((*peer, payload))
                }
                _ => None,
            })
            .expect("nickname change broadcast");
        assert_eq!(change.0, bob);
        assert_eq!(change.1.old_nickname, "Alice");
        assert_eq!(change.1.new_nickname, "Alicia");
    }

    #[tokio::test]
    async fn test_peer_disconnect_adds_system_message() {
        let h = harness("Alice");
        let bob = connect_peer(&h.registry, "Bob");
        h.manager.on_peer_connected(&h.registry.get(&bob).unwrap());

        h.manager.on_peer_disconnected(&bob);
        let global = h.manager.global_room().unwrap();
        assert!(global
            .last_message
            .unwrap()
            .content
            .contains("Bob has disconnected"));
    }

    #[tokio::test]
    async fn test_leave_removes_participant() {
        let h = harness("Alice");
        let bob = connect_peer(&h.registry, "Bob");
        h.manager.on_peer_connected(&h.registry.get(&bob).unwrap());

        h.manager.handle_envelope(
            bob,
            ChatEnvelope::Leave(LeavePayload {
                room_id: GLOBAL_ROOM_ID.into(),
            }),
        ).await;

        let global = h.manager.global_room().unwrap();
        assert!(!global.participants.contains_key(&bob));
        assert!(global.last_message.unwrap().content.contains("left the chat"));
    }

    #[tokio::test]
    async fn test_mark_room_read_resets_unread() {
        let h = harness("Alice");
        let bob = connect_peer(&h.registry, "Bob");
        let payload = TextPayload {
            id: "m1".into(),
            content: "hi".into(),
            sender: "Bob".into(),
            sender_id: bob.to_base58(),
            timestamp: Utc::now().timestamp(),
            room_id: GLOBAL_ROOM_ID.into(),
            kind: MessageKind::Text,
        };
        h.manager.handle_envelope(bob, ChatEnvelope::Text(payload)).await;
        assert_eq!(h.manager.global_room().unwrap().unread_count, 1);

        h.manager.mark_room_read(GLOBAL_ROOM_ID);
        assert_eq!(h.manager.global_room().unwrap().unread_count, 0);
    }

    #[tokio::test]
    async fn test_message_subscriber_sees_inbound_text() {
        let h = harness("Alice");
        let bob = connect_peer(&h.registry, "Bob");
        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        h.manager.set_message_handler(move |message| {
            sink.lock().unwrap().push(message.content.clone());
        });

        let payload = TextPayload {
            id: "m1".into(),
            content: "observed".into(),
            sender: "Bob".into(),
            sender_id: bob.to_base58(),
            timestamp: Utc::now().timestamp(),
            room_id: GLOBAL_ROOM_ID.into(),
            kind: MessageKind::Text,
        };
        h.manager.handle_envelope(bob, ChatEnvelope::Text(payload)).await;

        assert_eq!(seen.lock().unwrap().as_slice(), ["observed".to_string()]);
    }
}
