//! JSON wire protocol shared by the chat and transfer substreams.
//!
//! Every substream carries exactly one UTF-8 JSON object shaped as
//! `{ "type": <string>, "data": <object> }` and is closed afterwards.
//! Each message kind is a distinct variant of a sum type; the envelope
//! decodes the `type` discriminator and dispatches to the variant-specific
//! payload, which preserves the wire format of the dynamic original.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::constants::MAX_ENVELOPE_SIZE;
use crate::error::ProtocolError;

/// Kind of a chat [`Message`](crate::protocol::MessageKind) as it appears
/// both in the room model and in the `type` field of a text payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    System,
    Join,
    Leave,
    NicknameChange,
    Typing,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MessageKind::Text => "text",
            MessageKind::System => "system",
            MessageKind::Join => "join",
            MessageKind::Leave => "leave",
            MessageKind::NicknameChange => "nickname_change",
            MessageKind::Typing => "typing",
        };
        write!(f, "{s}")
    }
}

/// Room category. Direct rooms carry exactly two participants and a
/// deterministic identifier; local-test rooms never cause network traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomType {
    Global,
    Direct,
    LocalTest,
}

impl fmt::Display for RoomType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RoomType::Global => "global",
            RoomType::Direct => "direct",
            RoomType::LocalTest => "local_test",
        };
        write!(f, "{s}")
    }
}

/// Empty response closing a request-response exchange. Receipt of the ack
/// is the signal that the framed payload was fully written on the remote,
/// which is what serialises chunk emission on the transfer protocol.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Ack;

// ---------------------------------------------------------------------------
// Chat protocol
// ---------------------------------------------------------------------------

/// A single framed message on the `/shario/chat/1.0.0` substream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ChatEnvelope {
    Text(TextPayload),
    System(SystemPayload),
    Join(JoinPayload),
    Leave(LeavePayload),
    Typing(TypingPayload),
    NicknameChange(NicknameChangePayload),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextPayload {
    pub id: String,
    pub content: String,
    /// Nickname snapshot at send time. Receivers prefer the registry value.
    pub sender: String,
    pub sender_id: String,
    /// Unix seconds
    pub timestamp: i64,
    pub room_id: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemPayload {
    pub id: String,
    pub content: String,
    pub timestamp: i64,
    pub room_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinPayload {
    pub room_id: String,
    pub room_name: String,
    pub room_type: RoomType,
    /// Unix seconds
    pub created_at: i64,
    /// node identifier -> nickname
    pub participants: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeavePayload {
    pub room_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypingPayload {
    pub room_id: String,
    pub is_typing: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NicknameChangePayload {
    pub old_nickname: String,
    pub new_nickname: String,
    pub peer_id: String,
}

// ---------------------------------------------------------------------------
// Transfer protocol
// ---------------------------------------------------------------------------

/// A single framed message on the `/shario/transfer/1.0.0` substream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum TransferEnvelope {
    Offer(OfferPayload),
    Accept(AcceptPayload),
    Reject(RejectPayload),
    Data(DataPayload),
    Complete(CompletePayload),
    Cancel(CancelPayload),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfferPayload {
    pub transfer_id: String,
    /// Basename only, never a path
    pub filename: String,
    pub size: u64,
    /// SHA-256 of the full file contents, lowercase hex
    pub checksum: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcceptPayload {
    pub transfer_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RejectPayload {
    pub transfer_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataPayload {
    pub transfer_id: String,
    /// Strictly monotone starting at 0
    pub chunk_index: u64,
    /// Standard base64 of at most `CHUNK_SIZE` raw bytes
    pub data: String,
    pub is_last: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletePayload {
    pub transfer_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelPayload {
    pub transfer_id: String,
}

/// Serialize an envelope, enforcing the single-message size ceiling.
pub fn encode_envelope<T: Serialize>(envelope: &T) -> Result<Vec<u8>, ProtocolError> {
    let bytes = serde_json::to_vec(envelope)?;
    if bytes.len() > MAX_ENVELOPE_SIZE {
        return Err(ProtocolError::PayloadTooLarge {
            size: bytes.len(),
            limit: MAX_ENVELOPE_SIZE,
        });
    }
    Ok(bytes)
}
