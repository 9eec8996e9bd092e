use std::time::Duration;

/// Protocol version string for libp2p identify
pub const PROTOCOL_VERSION: &str = "/shario/1.0.0";

/// Substream protocol for chat messages
pub const CHAT_PROTOCOL: &str = "/shario/chat/1.0.0";

/// Substream protocol for file transfer messages
pub const TRANSFER_PROTOCOL: &str = "/shario/transfer/1.0.0";

/// Service tag advertised by both discovery mechanisms
pub const SERVICE_TAG: &str = "shario-p2p";

/// Fixed payload size of a transfer chunk. Base64 expansion (4/3) plus the
/// JSON envelope must stay well under `MAX_ENVELOPE_SIZE`.
pub const CHUNK_SIZE: usize = 1024;

/// Upper bound for a single framed wire message (64 KiB)
pub const MAX_ENVELOPE_SIZE: usize = 64 * 1024;

/// Maximum file transfer size in bytes (1 GiB)
pub const MAX_FILE_SIZE: u64 = 1024 * 1024 * 1024;

/// Nickname assigned to a freshly generated identity
pub const DEFAULT_NICKNAME: &str = "Anonymous";

/// Room identifier of the implicit global chat room
pub const GLOBAL_ROOM_ID: &str = "global";

/// How long a dial may take before it is reported as timed out
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(30);

/// Interval between DHT advertise/find rounds
pub const DISCOVERY_INTERVAL: Duration = Duration::from_secs(5);

/// Interval between discovery health checks
pub const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(15);

/// Number of empty health checks before a warning is surfaced
pub const HEALTH_CHECK_GRACE: u32 = 4;

/// Idle timeout after which an unused connection is dropped
pub const IDLE_CONNECTION_TIMEOUT: Duration = Duration::from_secs(60);
