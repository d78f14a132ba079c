//! Trusted peer store.
//!
//! Devices that complete a transfer are remembered by their Ed25519
//! identity key. Trust is keyed on the public key rather than the device
//! id or name, since those travel in the clear and can be spoofed.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// A remembered peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustedPeer {
    /// The peer's stable device id
    pub device_id: Uuid,
    /// Display name at the time of the last transfer
    pub device_name: String,
    /// Base64-encoded Ed25519 identity public key
    pub public_key: String,
    /// When the peer was first trusted
    pub trusted_at: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct TrustFile {
    version: u32,
    peers: Vec<TrustedPeer>,
}

/// JSON-backed store of trusted peers, keyed by identity public key.
pub struct TrustStore {
    path: PathBuf,
    peers: Mutex<HashMap<String, TrustedPeer>>,
}

impl TrustStore {
    /// Open the store at the given path, starting empty if the file does
    /// not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing file cannot be read or parsed.
    pub fn open(path: PathBuf) -> Result<Self> {
        let peers = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            let file: TrustFile = serde_json::from_str(&content)
                .map_err(|e| Error::Serialization(format!("trust store: {e}")))?;
            file.peers
                .into_iter()
                .map(|p| (p.public_key.clone(), p))
                .collect()
        } else {
            HashMap::new()
        };

        Ok(Self {
            path,
            peers: Mutex::new(peers),
        })
    }

    /// Remember a peer after a successful transfer. Updates the stored
    /// name if the peer was already trusted.
    pub fn record(&self, device_id: Uuid, device_name: &str, public_key: &str) {
        {
            let mut peers = self
                .peers
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            peers
                .entry(public_key.to_string())
                .and_modify(|p| {
                    p.device_name = device_name.to_string();
                })
                .or_insert_with(|| TrustedPeer {
                    device_id,
                    device_name: device_name.to_string(),
                    public_key: public_key.to_string(),
                    trusted_at: Utc::now(),
                });
        }

        if let Err(e) = self.save() {
            tracing::warn!("failed to persist trust store: {}", e);
        }
    }

    /// Whether the given identity key belongs to a trusted peer.
    #[must_use]
    pub fn is_trusted(&self, public_key: &str) -> bool {
        self.peers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .contains_key(public_key)
    }

    /// Look up a trusted peer by identity key.
    #[must_use]
    pub fn lookup(&self, public_key: &str) -> Option<TrustedPeer> {
        self.peers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(public_key)
            .cloned()
    }

    /// Number of trusted peers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.peers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn save(&self) -> Result<()> {
        let file = {
            let peers = self
                .peers
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            TrustFile {
                version: 1,
                peers: peers.values().cloned().collect(),
            }
        };

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(&file)
            .map_err(|e| Error::Serialization(e.to_string()))?;
        std::fs::write(&self.path, content)?;
        Ok(())
    }

    /// Default store location under a data directory.
    #[must_use]
    pub fn path_in(data_dir: &Path) -> PathBuf {
        data_dir.join("trusted_peers.json")
    }
}
