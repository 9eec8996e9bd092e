//! Durable cryptographic identity.
//!
//! The keypair doubles as the node's authenticated name (the `PeerId` is
//! derived from the public key) and as the key material for the transport
//! handshake. Identity files are per-process (`identity_<pid>.json`) so
//! co-resident instances never share an identity, and are persisted with
//! 0600 permissions.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use libp2p::identity::{Keypair, PublicKey};
use libp2p::PeerId;
use rand::rngs::OsRng;
use rsa::pkcs8::EncodePrivateKey;
use rsa::RsaPrivateKey;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::constants::DEFAULT_NICKNAME;
use crate::error::IdentityError;

const RSA_KEY_BITS: usize = 2048;

/// On-disk schema of an identity file. Key material is the libp2p
/// protobuf encoding, base64'd, matching the original file format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityRecord {
    pub nickname: String,
    pub public_key: String,
    pub private_key: String,
    pub peer_id: String,
}

/// Loads, creates and persists the node identity.
#[derive(Debug)]
pub struct IdentityStore {
    path: PathBuf,
    keypair: Keypair,
    peer_id: PeerId,
    record: IdentityRecord,
}

impl IdentityStore {
    /// Load the identity file for this process tag, or generate a fresh
    /// RSA-2048 identity and persist it.
    pub fn open(config_dir: &Path, process_tag: u32) -> Result<Self, IdentityError> {
        fs::create_dir_all(config_dir)?;
        let path = config_dir.join(format!("identity_{process_tag}.json"));

        if path.exists() {
            let store = Self::load(path)?;
            info!(peer_id = %store.peer_id, "Loaded existing identity");
            Ok(store)
        } else {
            let keypair = generate_keypair()?;
            let store = Self::create_at(path, keypair, DEFAULT_NICKNAME.to_string())?;
            info!(peer_id = %store.peer_id, "Generated new identity");
            Ok(store)
        }
    }

    /// Persist the given keypair as the identity for this process tag.
    /// Overwrites any existing file.
    pub fn create(
        config_dir: &Path,
        process_tag: u32,
        keypair: Keypair,
        nickname: String,
    ) -> Result<Self, IdentityError> {
        fs::create_dir_all(config_dir)?;
        let path = config_dir.join(format!("identity_{process_tag}.json"));
        Self::create_at(path, keypair, nickname)
    }

    fn create_at(
        path: PathBuf,
        keypair: Keypair,
        nickname: String,
    ) -> Result<Self, IdentityError> {
        let peer_id = keypair.public().to_peer_id();
        let record = encode_record(&keypair, &peer_id, nickname)?;
        write_atomically(&path, &record)?;
        Ok(Self {
            path,
            keypair,
            peer_id,
            record,
        })
    }

    fn load(path: PathBuf) -> Result<Self, IdentityError> {
        let data = fs::read(&path)?;
        let record: IdentityRecord = serde_json::from_slice(&data)?;
        let (keypair, peer_id) = decode_record(&record)?;
        Ok(Self {
            path,
            keypair,
            peer_id,
            record,
        })
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn nickname(&self) -> &str {
        &self.record.nickname
    }

    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    pub fn record(&self) -> &IdentityRecord {
        &self.record
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Update the nickname and rewrite the identity file atomically.
    /// The nickname is trimmed; empty nicknames are rejected.
    pub fn set_nickname(&mut self, nickname: &str) -> Result<(), IdentityError> {
        let nickname = nickname.trim();
        if nickname.is_empty() {
            return Err(IdentityError::EmptyNickname);
        }
        self.record.nickname = nickname.to_string();
        write_atomically(&self.path, &self.record)?;
        debug!(nickname, "Persisted nickname change");
        Ok(())
    }

    /// Serialize the identity for backup.
    pub fn export(&self) -> Result<Vec<u8>, IdentityError> {
        Ok(serde_json::to_vec_pretty(&self.record)?)
    }

    /// Restore an identity from an [`export`](Self::export)ed blob. The
    /// node identifier is re-derived from the private key and must match
    /// the stored one.
    pub fn import(&mut self, data: &[u8]) -> Result<(), IdentityError> {
        let record: IdentityRecord = serde_json::from_slice(data)?;
        let (keypair, peer_id) = decode_record(&record)?;
        write_atomically(&self.path, &record)?;
        self.keypair = keypair;
        self.peer_id = peer_id;
        self.record = record;
        info!(peer_id = %self.peer_id, "Imported identity");
        Ok(())
    }

    pub fn sign(&self, data: &[u8]) -> Result<Vec<u8>, IdentityError> {
        self.keypair
            .sign(data)
            .map_err(|e| IdentityError::Signing(e.to_string()))
    }

    pub fn verify(&self, data: &[u8], signature: &[u8], public_key: &PublicKey) -> bool {
        public_key.verify(data, signature)
    }

    /// Check that a peer's claimed identifier matches its public key.
    pub fn verify_peer_identity(
        peer_id: &PeerId,
        public_key: &PublicKey,
    ) -> Result<(), IdentityError> {
        let derived = public_key.to_peer_id();
        if derived != *peer_id {
            return Err(IdentityError::PeerIdMismatch {
                expected: peer_id.to_base58(),
                derived: derived.to_base58(),
            });
        }
        Ok(())
    }
}

fn generate_keypair() -> Result<Keypair, IdentityError> {
    let private = RsaPrivateKey::new(&mut OsRng, RSA_KEY_BITS)
        .map_err(|e| IdentityError::Generation(e.to_string()))?;
    let document = private
        .to_pkcs8_der()
        .map_err(|e| IdentityError::Generation(e.to_string()))?;
    let mut der = document.as_bytes().to_vec();
    Keypair::rsa_from_pkcs8(&mut der).map_err(|e| IdentityError::Generation(e.to_string()))
}

fn encode_record(
    keypair: &Keypair,
    peer_id: &PeerId,
    nickname: String,
) -> Result<IdentityRecord, IdentityError> {
    let private = keypair
        .to_protobuf_encoding()
        .map_err(|e| IdentityError::KeyDecode(e.to_string()))?;
    let public = keypair.public().encode_protobuf();
    Ok(IdentityRecord {
        nickname,
        public_key: STANDARD.encode(public),
        private_key: STANDARD.encode(private),
        peer_id: peer_id.to_base58(),
    })
}

/// Decode a record and re-derive the node identifier, failing if the file
/// was tampered with (stored id no longer matches the private key).
fn decode_record(record: &IdentityRecord) -> Result<(Keypair, PeerId), IdentityError> {
    let private = STANDARD
        .decode(&record.private_key)
        .map_err(|e| IdentityError::KeyDecode(e.to_string()))?;
    let keypair = Keypair::from_protobuf_encoding(&private)
        .map_err(|e| IdentityError::KeyDecode(e.to_string()))?;
    let peer_id = keypair.public().to_peer_id();
    if peer_id.to_base58() != record.peer_id {
        return Err(IdentityError::PeerIdMismatch {
            expected: record.peer_id.clone(),
            derived: peer_id.to_base58(),
        });
    }
    Ok((keypair, peer_id))
}

/// Write to a sibling temp file, fsync, then rename over the target.
fn write_atomically(path: &Path, record: &IdentityRecord) -> Result<(), IdentityError> {
    let data = serde_json::to_vec_pretty(record)?;
    let tmp = path.with_extension("json.tmp");
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(&data)?;
        file.sync_all()?;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&tmp, fs::Permissions::from_mode(0o600))?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}
