//! Device identity.
//!
//! Each device carries a long-lived Ed25519 key pair. The public key is
//! presented during transfer handshakes and signed challenges prove the
//! peer actually holds the matching secret key. The device id is derived
//! from the public key hash, so it stays stable across sessions and cannot
//! be spoofed without the key.
//!
//! The identity is stored as JSON with the secret key base64-encoded.

use std::fs;
use std::path::{Path, PathBuf};

use base64::prelude::*;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// A device's Ed25519 identity key pair.
#[derive(Debug)]
pub struct DeviceIdentity {
    signing_key: SigningKey,
    device_id: Uuid,
}

/// Serializable representation of the identity for storage.
#[derive(Debug, Serialize, Deserialize)]
struct IdentityFile {
    /// Version for future compatibility
    version: u32,
    /// Base64-encoded secret key bytes
    secret_key: String,
    /// Device ID (cached for convenience)
    device_id: Uuid,
}

impl DeviceIdentity {
    /// Generate a new random device identity.
    #[must_use]
    pub fn generate() -> Self {
        let mut csprng = rand::rngs::OsRng;
        let signing_key = SigningKey::generate(&mut csprng);
        let device_id = derive_device_id(&signing_key.verifying_key());

        Self {
            signing_key,
            device_id,
        }
    }

    /// Load a device identity from a file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or the stored
    /// device id does not match the key.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            Error::ConfigError(format!("failed to read identity file {}: {e}", path.display()))
        })?;

        let file: IdentityFile = serde_json::from_str(&content)
            .map_err(|e| Error::ConfigError(format!("failed to parse identity file: {e}")))?;

        let secret_bytes = BASE64_STANDARD
            .decode(&file.secret_key)
            .map_err(|e| Error::ConfigError(format!("failed to decode secret key: {e}")))?;

        let secret_array: [u8; 32] = secret_bytes
            .try_into()
            .map_err(|_| Error::ConfigError("invalid secret key length".to_string()))?;

        let signing_key = SigningKey::from_bytes(&secret_array);
        let derived_id = derive_device_id(&signing_key.verifying_key());

        if derived_id != file.device_id {
            return Err(Error::ConfigError(
                "device id mismatch in identity file".to_string(),
            ));
        }

        Ok(Self {
            signing_key,
            device_id: file.device_id,
        })
    }

    /// Load the identity from a file, or generate and save a new one if the
    /// file does not exist.
    pub fn load_or_generate(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load_from(path)
        } else {
            let identity = Self::generate();
            identity.save_to(path)?;
            Ok(identity)
        }
    }

    /// Save the identity to a file, creating parent directories as needed.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = IdentityFile {
            version: 1,
            secret_key: BASE64_STANDARD.encode(self.signing_key.to_bytes()),
            device_id: self.device_id,
        };

        let content = serde_json::to_string_pretty(&file)
            .map_err(|e| Error::Serialization(e.to_string()))?;
        fs::write(path, content)?;

        Ok(())
    }

    /// Default identity file location under a data directory.
    #[must_use]
    pub fn path_in(data_dir: &Path) -> PathBuf {
        data_dir.join("identity.json")
    }

    /// Sign data, returning the signature base64-encoded for transmission
    /// in protocol messages.
    #[must_use]
    pub fn sign(&self, data: &[u8]) -> String {
        BASE64_STANDARD.encode(self.signing_key.sign(data).to_bytes())
    }

    /// Verify a base64-encoded signature against a base64-encoded public
    /// key, as both appear on the wire.
    #[must_use]
    pub fn verify(public_key_b64: &str, data: &[u8], signature_b64: &str) -> bool {
        let Ok(key_bytes) = BASE64_STANDARD.decode(public_key_b64) else {
            return false;
        };
        let Ok(key_array): std::result::Result<[u8; 32], _> = key_bytes.try_into() else {
            return false;
        };
        let Ok(verifying_key) = VerifyingKey::from_bytes(&key_array) else {
            return false;
        };

        let Ok(sig_bytes) = BASE64_STANDARD.decode(signature_b64) else {
            return false;
        };
        let Ok(sig_array): std::result::Result<[u8; 64], _> = sig_bytes.try_into() else {
            return false;
        };

        let signature = Signature::from_bytes(&sig_array);
        verifying_key.verify(data, &signature).is_ok()
    }

    /// Get the public key as a base64-encoded string.
    #[must_use]
    pub fn public_key_b64(&self) -> String {
        BASE64_STANDARD.encode(self.signing_key.verifying_key().to_bytes())
    }

    /// Get the stable device ID derived from the public key.
    #[must_use]
    pub const fn device_id(&self) -> Uuid {
        self.device_id
    }
}

/// Derive a stable device ID from a public key.
///
/// Uses SHA-256 of the public key bytes, then takes the first 16 bytes to
/// form a UUID (with version/variant bits set).
fn derive_device_id(verifying_key: &VerifyingKey) -> Uuid {
    use sha2::{Digest, Sha256};

    let mut hasher = Sha256::new();
    hasher.update(b"lanbooth:device_id:");
    hasher.update(verifying_key.as_bytes());
    let hash = hasher.finalize();

    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&hash[..16]);

    bytes[6] = (bytes[6] & 0x0f) | 0x40;
    bytes[8] = (bytes[8] & 0x3f) | 0x80;

    Uuid::from_bytes(bytes)
}
