// Shared building blocks for Shario nodes: cryptographic identity,
// the JSON wire protocol, and protocol-wide constants.

pub mod constants;
pub mod error;
pub mod identity;
pub mod protocol;

pub use error::{IdentityError, ProtocolError, SharioError};
pub use identity::{IdentityRecord, IdentityStore};
pub use protocol::{Ack, ChatEnvelope, MessageKind, RoomType, TransferEnvelope};
