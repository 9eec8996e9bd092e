// Real-time P2P chat: the room/message model and the chat protocol
// state machine layered on the network layer's substreams.

pub mod manager;
pub mod room;

pub use manager::{ChatError, ChatManager};
pub use room::{direct_room_id, Message, Room, RoomSummary};
