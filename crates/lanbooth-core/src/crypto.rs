//! Session cryptography.
//!
//! Each transfer connection performs an ephemeral X25519 key exchange, then
//! derives two independent ChaCha20-Poly1305 keys via HKDF-SHA256, one per
//! direction. Every chunk is sealed with a fresh nonce built from a
//! monotonically increasing counter, so both sides must stay in lockstep on
//! chunk sequence numbers for decryption to succeed.
//!
//! Forward secrecy comes from the ephemeral keys: compromising a device's
//! long-lived identity key never exposes past transfer contents.

use chacha20poly1305::aead::Aead;
use chacha20poly1305::{ChaCha20Poly1305, Key, KeyInit, Nonce};
use hkdf::Hkdf;
use sha2::{Digest, Sha256};
use x25519_dalek::{EphemeralSecret, PublicKey};

use crate::error::{Error, Result};

/// HKDF info string for the initiator-to-responder key.
const INFO_INITIATOR: &[u8] = b"lanbooth/v1/initiator";

/// HKDF info string for the responder-to-initiator key.
const INFO_RESPONDER: &[u8] = b"lanbooth/v1/responder";

/// Which side of the handshake this device is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Opened the connection (the sender).
    Initiator,
    /// Accepted the connection (the receiver).
    Responder,
}

/// An ephemeral X25519 key pair, generated fresh for every connection.
pub struct EphemeralKeyPair {
    secret: EphemeralSecret,
    public: PublicKey,
}

impl EphemeralKeyPair {
    /// Generate a new ephemeral key pair.
    #[must_use]
    pub fn generate() -> Self {
        let secret = EphemeralSecret::random_from_rng(rand::rngs::OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// The public half, as sent in the handshake frame.
    #[must_use]
    pub fn public_bytes(&self) -> [u8; 32] {
        self.public.to_bytes()
    }
}

/// Directional session keys derived from the X25519 shared secret.
pub struct SessionKeys {
    send_key: [u8; 32],
    recv_key: [u8; 32],
}

impl SessionKeys {
    /// Run the key exchange and derive both directional keys.
    ///
    /// Consumes the ephemeral key pair; the shared secret never outlives
    /// this call.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Handshake`] if the peer's public key is malformed
    /// or the exchange produces a non-contributory (all-zero) secret.
    pub fn derive(keypair: EphemeralKeyPair, peer_public: &[u8], role: Role) -> Result<Self> {
        let peer_array: [u8; 32] = peer_public
            .try_into()
            .map_err(|_| Error::Handshake("peer public key must be 32 bytes".to_string()))?;
        let peer_key = PublicKey::from(peer_array);

        let shared = keypair.secret.diffie_hellman(&peer_key);
        if !shared.was_contributory() {
            return Err(Error::Handshake(
                "key exchange produced a weak shared secret".to_string(),
            ));
        }

        let hkdf = Hkdf::<Sha256>::new(None, shared.as_bytes());
        let mut initiator_key = [0u8; 32];
        let mut responder_key = [0u8; 32];
        hkdf.expand(INFO_INITIATOR, &mut initiator_key)
            .map_err(|_| Error::Internal("HKDF expand failed".to_string()))?;
        hkdf.expand(INFO_RESPONDER, &mut responder_key)
            .map_err(|_| Error::Internal("HKDF expand failed".to_string()))?;

        Ok(match role {
            Role::Initiator => Self {
                send_key: initiator_key,
                recv_key: responder_key,
            },
            Role::Responder => Self {
                send_key: responder_key,
                recv_key: initiator_key,
            },
        })
    }

    /// Split into a sealing cipher and an opening cipher.
    #[must_use]
    pub fn into_ciphers(self) -> (SessionCipher, SessionCipher) {
        (
            SessionCipher::new(&self.send_key),
            SessionCipher::new(&self.recv_key),
        )
    }
}

/// A one-directional AEAD cipher with a counter-derived nonce.
///
/// The counter starts at zero and advances by one per sealed or opened
/// chunk. Both sides advance in lockstep because chunks are strictly
/// sequenced, so a reordered or replayed chunk fails authentication.
pub struct SessionCipher {
    cipher: ChaCha20Poly1305,
    counter: u64,
}

impl SessionCipher {
    fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(key)),
            counter: 0,
        }
    }

    /// Encrypt and authenticate a chunk, advancing the nonce counter.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Internal`] if encryption fails (should not happen).
    pub fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = self.next_nonce();
        self.cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| Error::Internal("chunk encryption failed".to_string()))
    }

    /// Decrypt and verify a chunk, advancing the nonce counter.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IntegrityFailure`] if the ciphertext or its tag was
    /// tampered with, or the counters have diverged.
    pub fn open(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let nonce = self.next_nonce();
        self.cipher
            .decrypt(&nonce, ciphertext)
            .map_err(|_| Error::IntegrityFailure)
    }

    fn next_nonce(&mut self) -> Nonce {
        let mut bytes = [0u8; 12];
        bytes[4..].copy_from_slice(&self.counter.to_be_bytes());
        self.counter = self.counter.wrapping_add(1);
        Nonce::from(bytes)
    }
}

/// SHA-256 digest of a byte slice.
#[must_use]
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Lowercase hex encoding.
#[must_use]
pub fn to_hex(bytes: &[u8]) -> String {
    use std::fmt::Write;

    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = write!(out, "{byte:02x}");
    }
    out
}
