//! Transfer protocol state machine.
//!
//! The sender streams a file in fixed 1 KiB chunks, one framed message
//! per substream, and does not emit the next chunk until the previous one
//! has been acked — combined with per-connection ordering this guarantees
//! in-order arrival. The receiver hashes incrementally and verifies the
//! whole-file digest against the offer before reporting completion.
//!
//! Failures are local to one transfer: any decode, I/O or digest error
//! moves that transfer to `failed` and touches nothing else.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use libp2p::PeerId;
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use shario_net::{PeerInfo, RegistryObserver, SwarmCommand};
use shario_shared::constants::{CHUNK_SIZE, MAX_FILE_SIZE};
use shario_shared::protocol::{
    AcceptPayload, CancelPayload, CompletePayload, DataPayload, OfferPayload, RejectPayload,
    TransferEnvelope,
};

use crate::transfer::{Transfer, TransferDirection, TransferStatus};

#[derive(Error, Debug)]
pub enum TransferError {
    #[error("transfer not found: {0}")]
    NotFound(String),

    #[error("not a regular file: {0}")]
    NotAFile(PathBuf),

    #[error("file too large: {size} bytes (max {max})")]
    FileTooLarge { size: u64, max: u64 },

    #[error("transfer {0} is not an incoming transfer")]
    WrongDirection(String),

    #[error("transfer {id} is {status}, expected {expected}")]
    InvalidState {
        id: String,
        status: TransferStatus,
        expected: TransferStatus,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("network error: {0}")]
    Network(String),
}

type UpdateHandler = Arc<dyn Fn(&Transfer) + Send + Sync>;
type OfferHandler = Arc<dyn Fn(Transfer) -> bool + Send + Sync>;

/// Open destination file plus the incremental digest over everything
/// written so far. Dropped (and thereby closed) on every terminal
/// transition.
struct ReceiveSink {
    file: File,
    hasher: Sha256,
    next_chunk: u64,
}

/// Transfer component. One per node; bridge it to the session registry
/// with [`TransferEvents`].
pub struct TransferManager {
    cmd_tx: mpsc::Sender<SwarmCommand>,
    downloads_dir: PathBuf,
    max_file_size: u64,
    transfers: RwLock<HashMap<String, Transfer>>,
    sinks: Mutex<HashMap<String, ReceiveSink>>,

    on_update: RwLock<Option<UpdateHandler>>,
    on_offer: RwLock<Option<OfferHandler>>,
}

impl TransferManager {
    pub fn new(cmd_tx: mpsc::Sender<SwarmCommand>, downloads_dir: PathBuf) -> Self {
        Self {
            cmd_tx,
            downloads_dir,
            max_file_size: MAX_FILE_SIZE,
            transfers: RwLock::new(HashMap::new()),
            sinks: Mutex::new(HashMap::new()),
            on_update: RwLock::new(None),
            on_offer: RwLock::new(None),
        }
    }

    // -----------------------------------------------------------------------
    // Subscriptions
    // -----------------------------------------------------------------------

    /// Called after every state or progress change. Must not block.
    pub fn set_update_handler(&self, handler: impl Fn(&Transfer) + Send + Sync + 'static) {
        *self.on_update.write() = Some(Arc::new(handler));
    }

    /// Called for each inbound offer; return `true` to accept. The call
    /// may block; it stalls only that transfer.
    pub fn set_offer_handler(
        &self,
        handler: impl Fn(Transfer) -> bool + Send + Sync + 'static,
    ) {
        *self.on_offer.write() = Some(Arc::new(handler));
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn transfers(&self) -> Vec<Transfer> {
        self.transfers.read().values().cloned().collect()
    }

    pub fn get(&self, transfer_id: &str) -> Option<Transfer> {
        self.transfers.read().get(transfer_id).cloned()
    }

    /// Number of transfers still pending or active.
    pub fn active_count(&self) -> usize {
        self.transfers
            .read()
            .values()
            .filter(|t| !t.is_terminal())
            .count()
    }

    pub fn downloads_dir(&self) -> &Path {
        &self.downloads_dir
    }

    // -----------------------------------------------------------------------
    // Operations
    // -----------------------------------------------------------------------

    /// Offer a file to a peer. The transfer starts in `pending` and moves
    /// to `active` once the peer accepts.
    pub async fn send_file(
        self: &Arc<Self>,
        peer_id: PeerId,
        path: impl AsRef<Path>,
    ) -> Result<Transfer, TransferError> {
        let path = path.as_ref().to_path_buf();
        let metadata = tokio::fs::metadata(&path).await?;
        if !metadata.is_file() {
            return Err(TransferError::NotAFile(path));
        }
        let size = metadata.len();
        if size > self.max_file_size {
            return Err(TransferError::FileTooLarge {
                size,
                max: self.max_file_size,
            });
        }

        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| TransferError::NotAFile(path.clone()))?;
        let checksum = file_checksum(&path).await?;

        let transfer = Transfer::new(
            format!("transfer_{}", Uuid::new_v4()),
            filename,
            size,
            TransferDirection::Send,
            peer_id,
            path,
            checksum,
        );
        let id = transfer.id.clone();
        info!(transfer = %id, peer = %peer_id, size, "Offering file");

        self.transfers.write().insert(id.clone(), transfer.clone());
        self.notify(&transfer);

        let offer = TransferEnvelope::Offer(OfferPayload {
            transfer_id: id.clone(),
            filename: transfer.filename.clone(),
            size,
            checksum: transfer.checksum.clone(),
        });
        if let Err(e) = self.send_acked(peer_id, offer).await {
            self.fail(&id, format!("failed to send offer: {e}")).await;
            return Err(TransferError::Network(e.to_string()));
        }

        Ok(self.get(&id).unwrap_or(transfer))
    }

    /// Accept an incoming transfer: open the destination file under the
    /// downloads directory and tell the sender to start streaming.
    pub async fn accept(self: &Arc<Self>, transfer_id: &str) -> Result<(), TransferError> {
        let transfer = self
            .get(transfer_id)
            .ok_or_else(|| TransferError::NotFound(transfer_id.to_string()))?;
        if transfer.direction != TransferDirection::Receive {
            return Err(TransferError::WrongDirection(transfer_id.to_string()));
        }
        if transfer.status != TransferStatus::Pending {
            return Err(TransferError::InvalidState {
                id: transfer_id.to_string(),
                status: transfer.status,
                expected: TransferStatus::Pending,
            });
        }

        tokio::fs::create_dir_all(&self.downloads_dir).await?;
        let file_path = self.downloads_dir.join(&transfer.filename);
        let file = match File::create(&file_path).await {
            Ok(file) => file,
            Err(e) => {
                self.fail(transfer_id, format!("failed to create file: {e}"))
                    .await;
                self.send_best_effort(
                    transfer.peer_id,
                    TransferEnvelope::Cancel(CancelPayload {
                        transfer_id: transfer_id.to_string(),
                    }),
                )
                .await;
                return Err(e.into());
            }
        };

        self.sinks.lock().await.insert(
            transfer_id.to_string(),
            ReceiveSink {
                file,
                hasher: Sha256::new(),
                next_chunk: 0,
            },
        );

        let mut transitioned = false;
        let snapshot = self.update(transfer_id, |t| {
            transitioned = t.transition(TransferStatus::Active);
            if transitioned {
                t.file_path = file_path.clone();
            }
        });
        if !transitioned {
            // Cancelled while the file was being opened.
            self.sinks.lock().await.remove(transfer_id);
            return Ok(());
        }

        info!(transfer = %transfer_id, path = %file_path.display(), "Accepted transfer");
        self.send_best_effort(
            transfer.peer_id,
            TransferEnvelope::Accept(AcceptPayload {
                transfer_id: transfer_id.to_string(),
            }),
        )
        .await;

        if let Some(snapshot) = snapshot {
            self.notify(&snapshot);
        }
        Ok(())
    }

    /// Reject an incoming transfer.
    pub async fn reject(&self, transfer_id: &str) -> Result<(), TransferError> {
        let transfer = self
            .get(transfer_id)
            .ok_or_else(|| TransferError::NotFound(transfer_id.to_string()))?;
        if transfer.direction != TransferDirection::Receive {
            return Err(TransferError::WrongDirection(transfer_id.to_string()));
        }

        let mut transitioned = false;
        let snapshot = self.update(transfer_id, |t| {
            transitioned = t.transition(TransferStatus::Cancelled);
        });

        self.send_best_effort(
            transfer.peer_id,
            TransferEnvelope::Reject(RejectPayload {
                transfer_id: transfer_id.to_string(),
            }),
        )
        .await;

        if let (true, Some(snapshot)) = (transitioned, snapshot) {
            self.notify(&snapshot);
        }
        Ok(())
    }

    /// Cancel a transfer in any non-terminal state. The cancel message to
    /// the peer is best-effort; local state moves regardless.
    pub async fn cancel(&self, transfer_id: &str) -> Result<(), TransferError> {
        let transfer = self
            .get(transfer_id)
            .ok_or_else(|| TransferError::NotFound(transfer_id.to_string()))?;

        let mut transitioned = false;
        let snapshot = self.update(transfer_id, |t| {
            transitioned = t.transition(TransferStatus::Cancelled);
        });
        let Some(snapshot) = snapshot else {
            return Ok(());
        };
        if !transitioned {
            // Already terminal before we got here.
            return Ok(());
        }

        self.sinks.lock().await.remove(transfer_id);
        info!(transfer = %transfer_id, "Transfer cancelled");

        self.send_best_effort(
            transfer.peer_id,
            TransferEnvelope::Cancel(CancelPayload {
                transfer_id: transfer_id.to_string(),
            }),
        )
        .await;

        self.notify(&snapshot);
        Ok(())
    }

    /// Cancel every non-terminal transfer; used on shutdown.
    pub async fn cancel_all(&self) {
        let ids: Vec<String> = self
            .transfers
            .read()
            .values()
            .filter(|t| !t.is_terminal())
            .map(|t| t.id.clone())
            .collect();
        for id in ids {
            let _ = self.cancel(&id).await;
        }
    }

    /// Cancel every non-terminal transfer with a vanished peer. No cancel
    /// message is sent; there is nobody left to read it.
    pub async fn handle_peer_disconnected(&self, peer_id: PeerId) {
        let ids: Vec<String> = self
            .transfers
            .read()
            .values()
            .filter(|t| t.peer_id == peer_id && !t.is_terminal())
            .map(|t| t.id.clone())
            .collect();

        for id in ids {
            debug!(transfer = %id, peer = %peer_id, "Cancelling transfer, peer gone");
            let mut transitioned = false;
            let snapshot = self.update(&id, |t| {
                transitioned = t.transition(TransferStatus::Cancelled);
            });
            self.sinks.lock().await.remove(&id);
            if let (true, Some(snapshot)) = (transitioned, snapshot) {
                self.notify(&snapshot);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Inbound protocol handling
    // -----------------------------------------------------------------------

    /// Dispatch one framed message received on the transfer substream.
    pub async fn handle_envelope(self: &Arc<Self>, from: PeerId, envelope: TransferEnvelope) {
        match envelope {
            TransferEnvelope::Offer(payload) => self.handle_offer(from, payload),
            TransferEnvelope::Accept(payload) => self.handle_accept(from, payload),
            TransferEnvelope::Reject(payload) => self.handle_reject(from, payload).await,
            TransferEnvelope::Data(payload) => self.handle_data(from, payload).await,
            TransferEnvelope::Complete(payload) => self.handle_complete(from, payload).await,
            TransferEnvelope::Cancel(payload) => self.handle_cancel(from, payload).await,
        }
    }

    fn handle_offer(self: &Arc<Self>, from: PeerId, payload: OfferPayload) {
        if self.transfers.read().contains_key(&payload.transfer_id) {
            debug!(transfer = %payload.transfer_id, "Duplicate offer ignored");
            return;
        }

        // Never trust a path from the wire; keep the basename only.
        let filename = Path::new(&payload.filename)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| payload.transfer_id.clone());

        let transfer = Transfer::new(
            payload.transfer_id.clone(),
            filename,
            payload.size,
            TransferDirection::Receive,
            from,
            self.downloads_dir.clone(),
            payload.checksum,
        );
        info!(
            transfer = %transfer.id,
            peer = %from,
            file = %transfer.filename,
            size = transfer.size,
            "Received transfer offer"
        );

        self.transfers
            .write()
            .insert(transfer.id.clone(), transfer.clone());
        self.notify(&transfer);

        let too_large = transfer.size > self.max_file_size;
        let handler = self.on_offer.read().clone();
        let manager = Arc::clone(self);
        let id = transfer.id.clone();

        // The offer handler may block (it is typically a user prompt); run
        // the decision off the dispatch path so it stalls only this
        // transfer.
        tokio::spawn(async move {
            let accepted = if too_large {
                warn!(transfer = %id, "Offer exceeds the size limit, rejecting");
                false
            } else {
                match handler {
                    Some(handler) => {
                        let snapshot = transfer.clone();
                        tokio::task::spawn_blocking(move || handler(snapshot))
                            .await
                            .unwrap_or(false)
                    }
                    None => {
                        warn!(transfer = %id, "No offer handler registered, rejecting");
                        false
                    }
                }
            };

            let result = if accepted {
                manager.accept(&id).await
            } else {
                manager.reject(&id).await
            };
            if let Err(e) = result {
                debug!(transfer = %id, error = %e, "Offer decision could not be applied");
            }
        });
    }

    fn handle_accept(self: &Arc<Self>, from: PeerId, payload: AcceptPayload) {
        let id = payload.transfer_id;
        {
            let transfers = self.transfers.read();
            let Some(transfer) = transfers.get(&id) else {
                debug!(transfer = %id, "Accept for unknown transfer");
                return;
            };
            if transfer.peer_id != from
                || transfer.direction != TransferDirection::Send
                || transfer.status != TransferStatus::Pending
            {
                debug!(transfer = %id, "Ignoring unexpected accept");
                return;
            }
        }

        let mut transitioned = false;
        let snapshot = self.update(&id, |t| {
            transitioned = t.transition(TransferStatus::Active);
        });
        if !transitioned {
            return;
        }
        if let Some(snapshot) = snapshot {
            info!(transfer = %id, "Transfer accepted, streaming");
            self.notify(&snapshot);
        }

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            manager.run_sender(id).await;
        });
    }

    async fn handle_reject(&self, from: PeerId, payload: RejectPayload) {
        let id = payload.transfer_id;
        if !self.peer_owns(&id, from) {
            return;
        }
        let mut transitioned = false;
        let snapshot = self.update(&id, |t| {
            transitioned = t.transition(TransferStatus::Cancelled);
        });
        if let (true, Some(snapshot)) = (transitioned, snapshot) {
            info!(transfer = %id, "Transfer rejected by peer");
            self.notify(&snapshot);
        }
    }

    async fn handle_cancel(&self, from: PeerId, payload: CancelPayload) {
        let id = payload.transfer_id;
        if !self.peer_owns(&id, from) {
            return;
        }
        let mut transitioned = false;
        let snapshot = self.update(&id, |t| {
            transitioned = t.transition(TransferStatus::Cancelled);
        });
        self.sinks.lock().await.remove(&id);
        if let (true, Some(snapshot)) = (transitioned, snapshot) {
            info!(transfer = %id, "Transfer cancelled by peer");
            self.notify(&snapshot);
        }
    }

    async fn handle_complete(&self, from: PeerId, payload: CompletePayload) {
        let id = payload.transfer_id;
        if !self.peer_owns(&id, from) {
            return;
        }
        let mut transitioned = false;
        let snapshot = self.update(&id, |t| {
            transitioned = t.transition(TransferStatus::Completed);
            if transitioned {
                t.transferred = t.size;
            }
        });
        if let (true, Some(snapshot)) = (transitioned, snapshot) {
            self.notify(&snapshot);
        }
    }

    async fn handle_data(&self, from: PeerId, payload: DataPayload) {
        let id = payload.transfer_id.clone();
        {
            let transfers = self.transfers.read();
            let Some(transfer) = transfers.get(&id) else {
                debug!(transfer = %id, "Chunk for unknown transfer");
                return;
            };
            if transfer.peer_id != from || transfer.status != TransferStatus::Active {
                debug!(transfer = %id, "Chunk for inactive transfer dropped");
                return;
            }
        }

        let bytes = match STANDARD.decode(&payload.data) {
            Ok(bytes) => bytes,
            Err(e) => {
                self.fail(&id, format!("chunk decode error: {e}")).await;
                return;
            }
        };
        if bytes.len() > CHUNK_SIZE {
            self.fail(&id, format!("oversized chunk of {} bytes", bytes.len()))
                .await;
            return;
        }

        let mut sinks = self.sinks.lock().await;
        let Some(sink) = sinks.get_mut(&id) else {
            debug!(transfer = %id, "Chunk without an open file handle");
            return;
        };

        if payload.chunk_index != sink.next_chunk {
            let expected = sink.next_chunk;
            sinks.remove(&id);
            drop(sinks);
            self.fail(
                &id,
                format!(
                    "chunk {} arrived out of order (expected {expected})",
                    payload.chunk_index
                ),
            )
            .await;
            return;
        }

        let declared = self.get(&id).map(|t| (t.transferred, t.size));
        if let Some((transferred, size)) = declared {
            if transferred + bytes.len() as u64 > size {
                sinks.remove(&id);
                drop(sinks);
                self.fail(&id, "received more bytes than declared".to_string())
                    .await;
                return;
            }
        }

        if let Err(e) = sink.file.write_all(&bytes).await {
            sinks.remove(&id);
            drop(sinks);
            self.fail(&id, format!("write error: {e}")).await;
            return;
        }
        sink.hasher.update(&bytes);
        sink.next_chunk += 1;

        let digest = if payload.is_last {
            if let Err(e) = sink.file.flush().await {
                sinks.remove(&id);
                drop(sinks);
                self.fail(&id, format!("flush error: {e}")).await;
                return;
            }
            let sink = sinks.remove(&id).expect("sink present");
            Some(hex::encode(sink.hasher.finalize()))
        } else {
            None
        };
        drop(sinks);

        let snapshot = self.update(&id, |t| {
            t.transferred += bytes.len() as u64;
            if let Some(ref digest) = digest {
                if *digest == t.checksum {
                    t.transition(TransferStatus::Completed);
                } else {
                    t.error = Some(format!(
                        "integrity check failed: expected {}, got {digest}",
                        t.checksum
                    ));
                    t.transition(TransferStatus::Failed);
                }
            }
        });

        let Some(snapshot) = snapshot else { return };
        self.notify(&snapshot);

        if snapshot.status == TransferStatus::Completed {
            info!(
                transfer = %id,
                bytes = snapshot.transferred,
                "Transfer completed, digest verified"
            );
            self.send_best_effort(
                from,
                TransferEnvelope::Complete(CompletePayload { transfer_id: id }),
            )
            .await;
        } else if snapshot.status == TransferStatus::Failed {
            warn!(
                transfer = %id,
                error = snapshot.error.as_deref().unwrap_or(""),
                "Transfer failed"
            );
        }
    }

    // -----------------------------------------------------------------------
    // Sender task
    // -----------------------------------------------------------------------

    /// Stream the file chunk by chunk. Each chunk is a fresh substream and
    /// the next one is not opened until the previous one was acked, so
    /// chunks arrive in index order.
    async fn run_sender(self: Arc<Self>, id: String) {
        let Some(transfer) = self.get(&id) else { return };
        let (peer_id, path, size) = (transfer.peer_id, transfer.file_path, transfer.size);

        let mut file = match File::open(&path).await {
            Ok(file) => file,
            Err(e) => {
                self.fail(&id, format!("failed to open file: {e}")).await;
                return;
            }
        };

        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut sent: u64 = 0;
        let mut chunk_index: u64 = 0;

        loop {
            // Stop quietly if the transfer left the active state (local
            // cancel, peer cancel, peer gone).
            match self.get(&id).map(|t| t.status) {
                Some(TransferStatus::Active) => {}
                _ => return,
            }

            let read = match file.read(&mut buf).await {
                Ok(read) => read,
                Err(e) => {
                    self.fail(&id, format!("read error: {e}")).await;
                    return;
                }
            };

            // Zero-length files still need one (empty) closing chunk.
            if read == 0 && chunk_index > 0 {
                // Only reachable when the file shrank under us.
                self.fail(&id, "file ended before the declared size".to_string())
                    .await;
                return;
            }
            let is_last = sent + read as u64 >= size;

            let envelope = TransferEnvelope::Data(DataPayload {
                transfer_id: id.clone(),
                chunk_index,
                data: STANDARD.encode(&buf[..read]),
                is_last,
            });
            if let Err(e) = self.send_acked(peer_id, envelope).await {
                // A cancel that raced the send already made us terminal;
                // only report a failure if we were still active.
                if self.get(&id).map(|t| t.status) == Some(TransferStatus::Active) {
                    self.fail(&id, format!("chunk {chunk_index} failed: {e}"))
                        .await;
                }
                return;
            }

            sent += read as u64;
            chunk_index += 1;

            let snapshot = self.update(&id, |t| {
                t.transferred = sent;
                if is_last {
                    t.transition(TransferStatus::Completed);
                }
            });
            if let Some(snapshot) = snapshot {
                self.notify(&snapshot);
            }

            if is_last {
                info!(transfer = %id, bytes = sent, chunks = chunk_index, "File sent");
                return;
            }
        }
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn peer_owns(&self, transfer_id: &str, peer_id: PeerId) -> bool {
        match self.transfers.read().get(transfer_id) {
            Some(transfer) if transfer.peer_id == peer_id => true,
            Some(_) => {
                debug!(transfer = %transfer_id, peer = %peer_id, "Message from wrong peer");
                false
            }
            None => {
                debug!(transfer = %transfer_id, "Message for unknown transfer");
                false
            }
        }
    }

    /// Apply a mutation under the table lock and return a snapshot.
    fn update(&self, transfer_id: &str, f: impl FnOnce(&mut Transfer)) -> Option<Transfer> {
        let mut transfers = self.transfers.write();
        let transfer = transfers.get_mut(transfer_id)?;
        f(transfer);
        Some(transfer.clone())
    }

    async fn fail(&self, transfer_id: &str, error: String) {
        self.sinks.lock().await.remove(transfer_id);
        let mut transitioned = false;
        let snapshot = self.update(transfer_id, |t| {
            transitioned = t.transition(TransferStatus::Failed);
            if transitioned {
                t.error = Some(error.clone());
            }
        });
        if let (true, Some(snapshot)) = (transitioned, snapshot) {
            warn!(transfer = %transfer_id, error = %error, "Transfer failed");
            self.notify(&snapshot);
        }
    }

    /// Send an envelope and wait until the remote acked the substream.
    async fn send_acked(
        &self,
        peer: PeerId,
        envelope: TransferEnvelope,
    ) -> anyhow::Result<()> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(SwarmCommand::SendTransfer {
                peer,
                envelope,
                reply: Some(tx),
            })
            .await
            .map_err(|_| anyhow::anyhow!("network layer is shut down"))?;
        rx.await
            .map_err(|_| anyhow::anyhow!("network layer is shut down"))?
    }

    /// Send an envelope without waiting; failures are logged only.
    async fn send_best_effort(&self, peer: PeerId, envelope: TransferEnvelope) {
        if self
            .cmd_tx
            .send(SwarmCommand::SendTransfer {
                peer,
                envelope,
                reply: None,
            })
            .await
            .is_err()
        {
            debug!(peer = %peer, "Network layer is gone, transfer message dropped");
        }
    }

    fn notify(&self, transfer: &Transfer) {
        if let Some(handler) = self.on_update.read().clone() {
            handler(transfer);
        }
    }
}

/// Bridges registry events to the transfer manager. Disconnect handling
/// closes file handles, which suspends, so it runs on its own task.
pub struct TransferEvents(pub Arc<TransferManager>);

impl RegistryObserver for TransferEvents {
    fn on_peer_connected(&self, _peer: &PeerInfo) {}

    fn on_peer_disconnected(&self, peer_id: &PeerId) {
        let manager = Arc::clone(&self.0);
        let peer_id = *peer_id;
        tokio::spawn(async move {
            manager.handle_peer_disconnected(peer_id).await;
        });
    }
}

/// SHA-256 of a file's contents, lowercase hex.
pub async fn file_checksum(path: &Path) -> std::io::Result<String> {
    let mut file = File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buf).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as SyncMutex;
    use std::time::Duration;

    struct Harness {
        manager: Arc<TransferManager>,
        sent: Arc<SyncMutex<Vec<(PeerId, TransferEnvelope)>>>,
        updates: Arc<SyncMutex<Vec<Transfer>>>,
        dir: tempfile::TempDir,
    }

    /// Manager wired to an "ack pump" standing in for the swarm task: it
    /// records every outbound envelope and acks it immediately.
    fn harness() -> Harness {
        let (cmd_tx, mut cmd_rx) = mpsc::channel::<SwarmCommand>(64);
        let dir = tempfile::tempdir().unwrap();
        let manager = Arc::new(TransferManager::new(cmd_tx, dir.path().join("downloads")));

        let sent: Arc<SyncMutex<Vec<(PeerId, TransferEnvelope)>>> = Arc::default();
        let sink = sent.clone();
        tokio::spawn(async move {
            while let Some(cmd) = cmd_rx.recv().await {
                if let SwarmCommand::SendTransfer {
                    peer,
                    envelope,
                    reply,
                } = cmd
                {
                    sink.lock().push((peer, envelope));
                    if let Some(reply) = reply {
                        let _ = reply.send(Ok(()));
                    }
                }
            }
        });

        let updates: Arc<SyncMutex<Vec<Transfer>>> = Arc::default();
        let update_sink = updates.clone();
        manager.set_update_handler(move |t| update_sink.lock().push(t.clone()));

        Harness {
            manager,
            sent,
            updates,
            dir,
        }
    }

    async fn wait_for<T>(mut probe: impl FnMut() -> Option<T>) -> T {
        for _ in 0..200 {
            if let Some(value) = probe() {
                return value;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached within 2s");
    }

    fn data_envelope(id: &str, index: u64, bytes: &[u8], is_last: bool) -> TransferEnvelope {
        TransferEnvelope::Data(DataPayload {
            transfer_id: id.to_string(),
            chunk_index: index,
            data: STANDARD.encode(bytes),
            is_last,
        })
    }

    fn offer_envelope(id: &str, filename: &str, size: u64, checksum: &str) -> TransferEnvelope {
        TransferEnvelope::Offer(OfferPayload {
            transfer_id: id.to_string(),
            filename: filename.to_string(),
            size,
            checksum: checksum.to_string(),
        })
    }

    const HELLO_SHA256: &str =
        "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    #[tokio::test]
    async fn test_small_receive_completes_with_verified_digest() {
        let h = harness();
        let peer = PeerId::random();
        h.manager.set_offer_handler(|_| true);

        h.manager
            .handle_envelope(peer, offer_envelope("t-1", "hello.txt", 5, HELLO_SHA256))
            .await;

        // The accept decision runs off the dispatch path.
        wait_for(|| {
            h.sent
                .lock()
                .iter()
                .find(|(_, e)| matches!(e, TransferEnvelope::Accept(_)))
                .map(|_| ())
        })
        .await;

        h.manager
            .handle_envelope(peer, data_envelope("t-1", 0, b"hello", true))
            .await;

        let transfer = h.manager.get("t-1").unwrap();
        assert_eq!(transfer.status, TransferStatus::Completed);
        assert_eq!(transfer.transferred, 5);
        assert_eq!(transfer.progress(), 100.0);

        let written = std::fs::read(h.dir.path().join("downloads/hello.txt")).unwrap();
        assert_eq!(written, b"hello");

        assert!(h
            .sent
            .lock()
            .iter()
            .any(|(_, e)| matches!(e, TransferEnvelope::Complete(_))));
    }

    #[tokio::test]
    async fn test_declined_offer_is_rejected() {
        let h = harness();
        let peer = PeerId::random();
        h.manager.set_offer_handler(|_| false);

        h.manager
            .handle_envelope(peer, offer_envelope("t-1", "hello.txt", 5, HELLO_SHA256))
            .await;

        wait_for(|| {
            (h.manager.get("t-1").unwrap().status == TransferStatus::Cancelled).then_some(())
        })
        .await;

        assert!(h
            .sent
            .lock()
            .iter()
            .any(|(_, e)| matches!(e, TransferEnvelope::Reject(_))));
        assert!(!h
            .sent
            .lock()
            .iter()
            .any(|(_, e)| matches!(e, TransferEnvelope::Accept(_))));
    }

    #[tokio::test]
    async fn test_digest_mismatch_fails_the_transfer() {
        let h = harness();
        let peer = PeerId::random();
        h.manager.set_offer_handler(|_| true);

        let bogus = "0".repeat(64);
        h.manager
            .handle_envelope(peer, offer_envelope("t-1", "hello.txt", 5, &bogus))
            .await;
        wait_for(|| {
            h.sent
                .lock()
                .iter()
                .find(|(_, e)| matches!(e, TransferEnvelope::Accept(_)))
                .map(|_| ())
        })
        .await;

        h.manager
            .handle_envelope(peer, data_envelope("t-1", 0, b"hello", true))
            .await;

        let transfer = h.manager.get("t-1").unwrap();
        assert_eq!(transfer.status, TransferStatus::Failed);
        assert!(transfer.error.unwrap().contains("integrity"));
    }

    #[tokio::test]
    async fn test_out_of_order_chunk_fails_the_transfer() {
        let h = harness();
        let peer = PeerId::random();
        h.manager.set_offer_handler(|_| true);

        h.manager
            .handle_envelope(peer, offer_envelope("t-1", "big.bin", 2048, HELLO_SHA256))
            .await;
        wait_for(|| {
            h.sent
                .lock()
                .iter()
                .find(|(_, e)| matches!(e, TransferEnvelope::Accept(_)))
                .map(|_| ())
        })
        .await;

        h.manager
            .handle_envelope(peer, data_envelope("t-1", 1, &[0u8; 1024], false))
            .await;

        let transfer = h.manager.get("t-1").unwrap();
        assert_eq!(transfer.status, TransferStatus::Failed);
        assert!(transfer.error.unwrap().contains("out of order"));
    }

    #[tokio::test]
    async fn test_overflowing_chunk_fails_the_transfer() {
        let h = harness();
        let peer = PeerId::random();
        h.manager.set_offer_handler(|_| true);

        h.manager
            .handle_envelope(peer, offer_envelope("t-1", "tiny.bin", 3, HELLO_SHA256))
            .await;
        wait_for(|| {
            h.sent
                .lock()
                .iter()
                .find(|(_, e)| matches!(e, TransferEnvelope::Accept(_)))
                .map(|_| ())
        })
        .await;

        h.manager
            .handle_envelope(peer, data_envelope("t-1", 0, &[0u8; 1024], false))
            .await;

        let transfer = h.manager.get("t-1").unwrap();
        assert_eq!(transfer.status, TransferStatus::Failed);
        assert!(transfer.error.unwrap().contains("more bytes than declared"));
    }

    #[tokio::test]
    async fn test_cancel_mid_receive_is_terminal() {
        let h = harness();
        let peer = PeerId::random();
        h.manager.set_offer_handler(|_| true);

        h.manager
            .handle_envelope(peer, offer_envelope("t-1", "big.bin", 4096, HELLO_SHA256))
            .await;
        wait_for(|| {
            h.sent
                .lock()
                .iter()
                .find(|(_, e)| matches!(e, TransferEnvelope::Accept(_)))
                .map(|_| ())
        })
        .await;

        h.manager
            .handle_envelope(peer, data_envelope("t-1", 0, &[7u8; 1024], false))
            .await;
        h.manager.cancel("t-1").await.unwrap();

        let transfer = h.manager.get("t-1").unwrap();
        assert_eq!(transfer.status, TransferStatus::Cancelled);
        assert_eq!(transfer.transferred, 1024);
        assert!(h
            .sent
            .lock()
            .iter()
            .any(|(_, e)| matches!(e, TransferEnvelope::Cancel(_))));

        // Late chunks and a late complete must not revive the transfer.
        let updates_before = h.updates.lock().len();
        h.manager
            .handle_envelope(peer, data_envelope("t-1", 1, &[7u8; 1024], false))
            .await;
        h.manager
            .handle_envelope(
                peer,
                TransferEnvelope::Complete(CompletePayload {
                    transfer_id: "t-1".into(),
                }),
            )
            .await;

        let transfer = h.manager.get("t-1").unwrap();
        assert_eq!(transfer.status, TransferStatus::Cancelled);
        assert_eq!(transfer.transferred, 1024);
        assert_eq!(h.updates.lock().len(), updates_before);
    }

    #[tokio::test]
    async fn test_send_file_streams_in_order_and_completes() {
        let h = harness();
        let peer = PeerId::random();

        let path = h.dir.path().join("payload.bin");
        let content: Vec<u8> = (0u32..2500).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, &content).unwrap();

        let transfer = h.manager.send_file(peer, &path).await.unwrap();
        assert_eq!(transfer.status, TransferStatus::Pending);
        assert_eq!(transfer.size, 2500);

        let offer_checksum = match &h.sent.lock()[0].1 {
            TransferEnvelope::Offer(offer) => offer.checksum.clone(),
            other => panic!("expected offer first, got {other:?}"),
        };
        assert_eq!(offer_checksum, file_checksum(&path).await.unwrap());

        h.manager
            .handle_envelope(
                peer,
                TransferEnvelope::Accept(AcceptPayload {
                    transfer_id: transfer.id.clone(),
                }),
            )
            .await;

        wait_for(|| {
            (h.manager.get(&transfer.id).unwrap().status == TransferStatus::Completed)
                .then_some(())
        })
        .await;

        // 2500 bytes => chunks of 1024 + 1024 + 452, indices 0..=2
        let sent = h.sent.lock();
        let chunks: Vec<&DataPayload> = sent
            .iter()
            .filter_map(|(_, e)| match e {
                TransferEnvelope::Data(d) => Some(d),
                _ => None,
            })
            .collect();
        assert_eq!(chunks.len(), 3);
        let mut reassembled = Vec::new();
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.chunk_index, i as u64);
            assert_eq!(chunk.is_last, i == 2);
            reassembled.extend(STANDARD.decode(&chunk.data).unwrap());
        }
        assert_eq!(reassembled, content);

        // Progress is monotonically non-decreasing and ends at 100.
        let updates = h.updates.lock();
        let transferred: Vec<u64> = updates
            .iter()
            .filter(|t| t.id == transfer.id)
            .map(|t| t.transferred)
            .collect();
        assert!(transferred.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(h.manager.get(&transfer.id).unwrap().progress(), 100.0);
    }

    #[tokio::test]
    async fn test_zero_byte_file_completes() {
        let h = harness();
        let peer = PeerId::random();

        let path = h.dir.path().join("empty.bin");
        std::fs::write(&path, b"").unwrap();

        let transfer = h.manager.send_file(peer, &path).await.unwrap();
        h.manager
            .handle_envelope(
                peer,
                TransferEnvelope::Accept(AcceptPayload {
                    transfer_id: transfer.id.clone(),
                }),
            )
            .await;

        wait_for(|| {
            (h.manager.get(&transfer.id).unwrap().status == TransferStatus::Completed)
                .then_some(())
        })
        .await;

        let sent = h.sent.lock();
        let last_chunk = sent
            .iter()
            .filter_map(|(_, e)| match e {
                TransferEnvelope::Data(d) => Some(d),
                _ => None,
            })
            .last()
            .unwrap();
        assert!(last_chunk.is_last);
        assert!(last_chunk.data.is_empty());
        assert_eq!(h.manager.get(&transfer.id).unwrap().progress(), 100.0);
    }

    #[tokio::test]
    async fn test_reject_cancels_the_sender() {
        let h = harness();
        let peer = PeerId::random();

        let path = h.dir.path().join("payload.bin");
        std::fs::write(&path, b"some bytes").unwrap();

        let transfer = h.manager.send_file(peer, &path).await.unwrap();
        h.manager
            .handle_envelope(
                peer,
                TransferEnvelope::Reject(RejectPayload {
                    transfer_id: transfer.id.clone(),
                }),
            )
            .await;

        let transfer = h.manager.get(&transfer.id).unwrap();
        assert_eq!(transfer.status, TransferStatus::Cancelled);
        assert!(transfer.ended_at.is_some());
    }

    #[tokio::test]
    async fn test_peer_disconnect_cancels_open_transfers() {
        let h = harness();
        let peer = PeerId::random();
        let other_peer = PeerId::random();

        let path = h.dir.path().join("payload.bin");
        std::fs::write(&path, b"some bytes").unwrap();
        let to_lost = h.manager.send_file(peer, &path).await.unwrap();
        let to_kept = h.manager.send_file(other_peer, &path).await.unwrap();

        h.manager.handle_peer_disconnected(peer).await;

        assert_eq!(
            h.manager.get(&to_lost.id).unwrap().status,
            TransferStatus::Cancelled
        );
        // Transfers with other peers are untouched.
        assert_eq!(
            h.manager.get(&to_kept.id).unwrap().status,
            TransferStatus::Pending
        );

        // Exactly one terminal update for the cancelled transfer.
        let terminal_updates = h
            .updates
            .lock()
            .iter()
            .filter(|t| t.id == to_lost.id && t.is_terminal())
            .count();
        assert_eq!(terminal_updates, 1);
    }

    #[tokio::test]
    async fn test_offer_from_wrong_peer_cannot_touch_transfer() {
        let h = harness();
        let peer = PeerId::random();
        let imposter = PeerId::random();
        h.manager.set_offer_handler(|_| true);

        h.manager
            .handle_envelope(peer, offer_envelope("t-1", "hello.txt", 5, HELLO_SHA256))
            .await;
        wait_for(|| {
            h.sent
                .lock()
                .iter()
                .find(|(_, e)| matches!(e, TransferEnvelope::Accept(_)))
                .map(|_| ())
        })
        .await;

        h.manager
            .handle_envelope(
                imposter,
                TransferEnvelope::Cancel(CancelPayload {
                    transfer_id: "t-1".into(),
                }),
            )
            .await;
        assert_eq!(
            h.manager.get("t-1").unwrap().status,
            TransferStatus::Active
        );
    }

    #[tokio::test]
    async fn test_offered_path_is_reduced_to_basename() {
        let h = harness();
        let peer = PeerId::random();
        h.manager.set_offer_handler(|_| true);

        h.manager
            .handle_envelope(
                peer,
                offer_envelope("t-1", "../../etc/passwd", 5, HELLO_SHA256),
            )
            .await;

        let transfer = h.manager.get("t-1").unwrap();
        assert_eq!(transfer.filename, "passwd");
    }

    #[tokio::test]
    async fn test_file_checksum_known_vector() {
        let h = harness();
        let path = h.dir.path().join("hello.txt");
        std::fs::write(&path, b"hello").unwrap();
        assert_eq!(file_checksum(&path).await.unwrap(), HELLO_SHA256);
    }
}

