//! Transfer model: the per-transfer record and its status machine.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use libp2p::PeerId;

/// Status of a transfer. `Completed`, `Failed` and `Cancelled` are
/// terminal: once reached, the status is never revised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Pending,
    Active,
    Completed,
    Failed,
    Cancelled,
}

impl TransferStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferStatus::Completed | TransferStatus::Failed | TransferStatus::Cancelled
        )
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransferStatus::Pending => "pending",
            TransferStatus::Active => "active",
            TransferStatus::Completed => "completed",
            TransferStatus::Failed => "failed",
            TransferStatus::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    Send,
    Receive,
}

/// One file transfer, sent or received. Snapshots of this record are what
/// subscribers observe; file handles are owned by the manager and never
/// leave it.
#[derive(Debug, Clone)]
pub struct Transfer {
    pub id: String,
    /// Basename only, never a path
    pub filename: String,
    /// Declared size in bytes
    pub size: u64,
    /// Bytes transferred so far; monotonically non-decreasing
    pub transferred: u64,
    pub status: TransferStatus,
    pub direction: TransferDirection,
    pub peer_id: PeerId,
    pub file_path: PathBuf,
    /// SHA-256 of the file contents, lowercase hex
    pub checksum: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl Transfer {
    pub fn new(
        id: String,
        filename: String,
        size: u64,
        direction: TransferDirection,
        peer_id: PeerId,
        file_path: PathBuf,
        checksum: String,
    ) -> Self {
        Self {
            id,
            filename,
            size,
            transferred: 0,
            status: TransferStatus::Pending,
            direction,
            peer_id,
            file_path,
            checksum,
            started_at: Utc::now(),
            ended_at: None,
            error: None,
        }
    }

    /// Progress percentage in [0, 100], derived from bytes transferred.
    pub fn progress(&self) -> f64 {
        if self.status == TransferStatus::Completed {
            return 100.0;
        }
        if self.size == 0 {
            return 0.0;
        }
        (self.transferred as f64 * 100.0 / self.size as f64).clamp(0.0, 100.0)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Move to a new status, stamping the end time on terminal
    /// transitions. Returns `false` (and changes nothing) if the transfer
    /// is already terminal.
    pub(crate) fn transition(&mut self, status: TransferStatus) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = status;
        if status.is_terminal() {
            self.ended_at = Some(Utc::now());
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transfer(size: u64) -> Transfer {
        Transfer::new(
            "t-1".into(),
            "file.bin".into(),
            size,
            TransferDirection::Send,
            PeerId::random(),
            "/tmp/file.bin".into(),
            String::new(),
        )
    }

    #[test]
    fn test_progress_is_derived_and_clamped() {
        let mut t = transfer(200);
        assert_eq!(t.progress(), 0.0);

        t.transferred = 50;
        assert_eq!(t.progress(), 25.0);

        t.transferred = 200;
        assert!(t.progress() <= 100.0);
    }

    #[test]
    fn test_progress_is_100_only_when_completed() {
        let mut t = transfer(0);
        assert_eq!(t.progress(), 0.0);
        assert!(t.transition(TransferStatus::Completed));
        assert_eq!(t.progress(), 100.0);
    }

    #[test]
    fn test_state_machine_follows_lifecycle() {
        let mut t = transfer(10);
        assert_eq!(t.status, TransferStatus::Pending);
        assert!(t.transition(TransferStatus::Active));
        assert!(t.transition(TransferStatus::Completed));
        assert!(t.ended_at.is_some());
    }

    #[test]
    fn test_terminal_states_are_never_revised() {
        for terminal in [
            TransferStatus::Completed,
            TransferStatus::Failed,
            TransferStatus::Cancelled,
        ] {
            let mut t = transfer(10);
            assert!(t.transition(terminal));
            for next in [
                TransferStatus::Pending,
                TransferStatus::Active,
                TransferStatus::Completed,
                TransferStatus::Failed,
                TransferStatus::Cancelled,
            ] {
                assert!(!t.transition(next));
                assert_eq!(t.status, terminal);
            }
        }
    }
}
