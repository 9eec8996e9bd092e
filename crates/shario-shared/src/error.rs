use thiserror::Error;

#[derive(Error, Debug)]
pub enum SharioError {
    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("failed to read identity file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse identity file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("failed to decode key material: {0}")]
    KeyDecode(String),

    #[error("failed to generate keypair: {0}")]
    Generation(String),

    #[error("peer ID mismatch: expected {expected}, derived {derived}")]
    PeerIdMismatch { expected: String, derived: String },

    #[error("nickname must not be empty")]
    EmptyNickname,

    #[error("signing failed: {0}")]
    Signing(String),
}

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("payload of {size} bytes exceeds the {limit} byte envelope ceiling")]
    PayloadTooLarge { size: usize, limit: usize },
}
