//! Error types for Lanbooth.
//!
//! This module provides a unified error type for all Lanbooth operations,
//! with specific error variants for different failure modes.

use std::io;

use thiserror::Error;

/// A specialized `Result` type for Lanbooth operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The main error type for Lanbooth.
#[derive(Error, Debug)]
pub enum Error {
    /// Connection lost during transfer
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// Operation timeout
    #[error("operation timed out after {0} seconds")]
    Timeout(u64),

    /// Key exchange or peer verification failed
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// AEAD authentication failed on a received chunk
    #[error("chunk failed authenticated decryption")]
    IntegrityFailure,

    /// Invalid protocol message
    #[error("invalid protocol message: {0}")]
    ProtocolError(String),

    /// Unexpected message type
    #[error("unexpected message type: expected {expected}, got {actual}")]
    UnexpectedMessage {
        /// Expected message type
        expected: String,
        /// Actual message type received
        actual: String,
    },

    /// Unsupported protocol version
    #[error("unsupported protocol version: {major}.{minor}")]
    UnsupportedVersion {
        /// Major version
        major: u8,
        /// Minor version
        minor: u8,
    },

    /// Whole-file hash mismatch after transfer completion
    #[error("file checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// Hash announced by the sender
        expected: String,
        /// Hash computed by the receiver
        actual: String,
    },

    /// Signature verification failed
    #[error("signature verification failed")]
    SignatureInvalid,

    /// Command not valid in the transfer's current state
    #[error("cannot {command} a transfer in state '{state}'")]
    InvalidState {
        /// The command that was attempted
        command: &'static str,
        /// The transfer's current state
        state: String,
    },

    /// No transfer registered under the given id
    #[error("transfer not found: {0}")]
    TransferNotFound(uuid::Uuid),

    /// No known peer with the given device id
    #[error("peer not found: {0}")]
    PeerNotFound(uuid::Uuid),

    /// File not found
    #[error("file not found: {0}")]
    FileNotFound(String),

    /// Transfer was cancelled
    #[error("transfer cancelled")]
    TransferCancelled,

    /// Resume state doesn't match the file on disk
    #[error("resume mismatch: {0}")]
    ResumeMismatch(String),

    /// Source file changed on disk while it was being sent
    #[error("source file changed during transfer: {0}")]
    SourceChanged(String),

    /// Configuration file error
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Internal error (should not happen)
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Returns whether this error is recoverable (the transfer can be
    /// resumed from its last checkpoint).
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::ConnectionLost(_) | Self::Timeout(_))
    }
}
