//! In-memory room and message model.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use libp2p::PeerId;
use uuid::Uuid;

use shario_shared::protocol::{MessageKind, RoomType};

/// A chat message. System messages carry no sender identifier.
#[derive(Debug, Clone)]
pub struct Message {
    /// Unique within the session
    pub id: String,
    pub content: String,
    /// Nickname snapshot at creation time
    pub sender: String,
    pub sender_id: Option<PeerId>,
    pub timestamp: DateTime<Utc>,
    pub room_id: String,
    pub kind: MessageKind,
}

impl Message {
    pub fn text(
        content: String,
        sender: String,
        sender_id: PeerId,
        room_id: String,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            content,
            sender,
            sender_id: Some(sender_id),
            timestamp: Utc::now(),
            room_id,
            kind: MessageKind::Text,
        }
    }

    pub fn system(content: String, room_id: String) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            content,
            sender: "System".to_string(),
            sender_id: None,
            timestamp: Utc::now(),
            room_id,
            kind: MessageKind::System,
        }
    }
}

/// A chat room. The participants map always contains the local node.
#[derive(Debug)]
pub struct Room {
    pub id: String,
    pub name: String,
    pub room_type: RoomType,
    /// node identifier -> nickname
    pub participants: HashMap<PeerId, String>,
    pub messages: Vec<Message>,
    pub created_at: DateTime<Utc>,
    pub last_message: Option<Message>,
    pub unread_count: u32,
}

impl Room {
    pub fn new(id: String, name: String, room_type: RoomType) -> Self {
        Self {
            id,
            name,
            room_type,
            participants: HashMap::new(),
            messages: Vec::new(),
            created_at: Utc::now(),
            last_message: None,
            unread_count: 0,
        }
    }

    /// Append a message and refresh the last-message cache. Messages are
    /// never reordered.
    pub fn push_message(&mut self, message: Message) {
        debug_assert_eq!(message.room_id, self.id);
        self.last_message = Some(message.clone());
        self.messages.push(message);
    }

    pub fn summary(&self) -> RoomSummary {
        RoomSummary {
            id: self.id.clone(),
            name: self.name.clone(),
            room_type: self.room_type,
            participants: self.participants.clone(),
            message_count: self.messages.len(),
            last_message: self.last_message.clone(),
            unread_count: self.unread_count,
            created_at: self.created_at,
        }
    }
}

/// Cheap snapshot handed to room-update subscribers; the message log stays
/// inside the room.
#[derive(Debug, Clone)]
pub struct RoomSummary {
    pub id: String,
    pub name: String,
    pub room_type: RoomType,
    pub participants: HashMap<PeerId, String>,
    pub message_count: usize,
    pub last_message: Option<Message>,
    pub unread_count: u32,
    pub created_at: DateTime<Utc>,
}

/// Deterministic identifier for a direct room: the same for both ends,
/// independent of who creates it.
pub fn direct_room_id(a: &PeerId, b: &PeerId) -> String {
    let (a, b) = (a.to_base58(), b.to_base58());
    if a < b {
        format!("direct_{a}_{b}")
    } else {
        format!("direct_{b}_{a}")
    }
}
