//! LBTP (Lanbooth Transfer Protocol) wire protocol implementation.
//!
//! Transfers run over a plain TCP connection; confidentiality comes from
//! per-chunk AEAD, not from the transport.
//!
//! ## Frame Format
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                      LBTP Frame                            │
//! ├────────────┬────────────┬────────────┬─────────────────────┤
//! │   Magic    │  Version   │    Type    │      Length         │
//! │  4 bytes   │  2 bytes   │   1 byte   │      4 bytes        │
//! ├────────────┴────────────┴────────────┴─────────────────────┤
//! │                        Payload                             │
//! │                    (variable length)                       │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! - Magic: `0x4C 0x42 0x54 0x50` ("LBTP")
//! - Version: `0x01 0x00` (1.0)
//! - Type: Message type byte
//! - Length: Payload length in bytes (big-endian)
//!
//! Control payloads are JSON; the `Handshake` payload is a raw 32-byte
//! X25519 public key and `Chunk` payloads are binary.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::timeout;

use crate::error::{Error, Result};

/// Protocol magic bytes: "LBTP"
pub const MAGIC: [u8; 4] = [0x4C, 0x42, 0x54, 0x50];

/// Frame header size in bytes
pub const HEADER_SIZE: usize = 11;

/// Maximum payload size (16 MB)
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Message types in the LBTP protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    /// Ephemeral public key exchange
    Handshake = 0x01,
    /// File metadata offer from the sender
    TransferOffer = 0x02,
    /// Receiver accepted, includes resume offset
    TransferAccept = 0x03,
    /// Receiver declined
    TransferReject = 0x04,
    /// Encrypted file chunk
    Chunk = 0x10,
    /// Pause request (either direction)
    Pause = 0x20,
    /// Resume request (either direction)
    Resume = 0x21,
    /// Cancel, terminal (either direction)
    Cancel = 0x22,
    /// Sender finished, includes whole-file hash
    Complete = 0x30,
    /// Fatal error report
    Error = 0xFF,
}

impl MessageType {
    /// Parse a message type from a byte.
    pub const fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::Handshake),
            0x02 => Some(Self::TransferOffer),
            0x03 => Some(Self::TransferAccept),
            0x04 => Some(Self::TransferReject),
            0x10 => Some(Self::Chunk),
            0x20 => Some(Self::Pause),
            0x21 => Some(Self::Resume),
            0x22 => Some(Self::Cancel),
            0x30 => Some(Self::Complete),
            0xFF => Some(Self::Error),
            _ => None,
        }
    }

    /// Human-readable name for error reporting.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Handshake => "handshake",
            Self::TransferOffer => "transfer_offer",
            Self::TransferAccept => "transfer_accept",
            Self::TransferReject => "transfer_reject",
            Self::Chunk => "chunk",
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Cancel => "cancel",
            Self::Complete => "complete",
            Self::Error => "error",
        }
    }
}

/// A protocol frame header.
#[derive(Debug, Clone)]
pub struct FrameHeader {
    /// Protocol version (major, minor)
    pub version: (u8, u8),
    /// Message type
    pub message_type: MessageType,
    /// Payload length
    pub payload_length: u32,
}

impl FrameHeader {
    /// Encode the header to bytes.
    #[must_use]
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&MAGIC);
        buf[4] = self.version.0;
        buf[5] = self.version.1;
        buf[6] = self.message_type as u8;
        buf[7..11].copy_from_slice(&self.payload_length.to_be_bytes());
        buf
    }

    /// Decode a header from bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the header is invalid.
    pub fn decode(buf: &[u8; HEADER_SIZE]) -> Result<Self> {
        if buf[0..4] != MAGIC {
            return Err(Error::ProtocolError("invalid magic bytes".to_string()));
        }

        let version = (buf[4], buf[5]);
        if version.0 != crate::PROTOCOL_VERSION.0 {
            return Err(Error::UnsupportedVersion {
                major: version.0,
                minor: version.1,
            });
        }

        let message_type = MessageType::from_byte(buf[6])
            .ok_or_else(|| Error::ProtocolError(format!("unknown message type: {:#x}", buf[6])))?;

        let payload_length = u32::from_be_bytes([buf[7], buf[8], buf[9], buf[10]]);

        if payload_length as usize > MAX_PAYLOAD_SIZE {
            return Err(Error::ProtocolError(format!(
                "payload too large: {payload_length} bytes"
            )));
        }

        Ok(Self {
            version,
            message_type,
            payload_length,
        })
    }
}

/// Transfer offer payload.
///
/// Sent by the sender once the handshake completes. The identity signature
/// covers the transfer id string, proving the offer comes from the holder
/// of the announced identity key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfferPayload {
    /// Unique transfer identifier
    pub transfer_id: uuid::Uuid,
    /// File name (no path components)
    pub file_name: String,
    /// Total file size in bytes
    pub file_size: u64,
    /// Sender's stable device id
    pub sender_device_id: uuid::Uuid,
    /// Sender's display name
    pub sender_device_name: String,
    /// Base64-encoded Ed25519 identity public key
    pub identity_public_key: String,
    /// Base64-encoded signature of the transfer id string
    pub identity_signature: String,
}

/// Transfer accept payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcceptPayload {
    /// Byte offset the sender should start from (0 for a fresh transfer)
    pub resume_offset: u64,
    /// Receiver's display name
    pub device_name: String,
    /// Base64-encoded Ed25519 identity public key
    pub identity_public_key: String,
    /// Base64-encoded signature of the transfer id string
    pub identity_signature: String,
}

/// Transfer reject payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RejectPayload {
    /// Why the transfer was declined
    pub reason: String,
}

/// Transfer complete payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletePayload {
    /// Hex-encoded SHA-256 of the whole file
    pub sha256_hex: String,
}

/// Error payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Error code
    pub code: String,
    /// Error message
    pub message: String,
}

/// Chunk payload (binary).
///
/// Format: seq (8 bytes) | offset (8 bytes) | ciphertext
///
/// The ciphertext includes the AEAD tag; `seq` and `offset` travel in the
/// clear so the receiver can enforce strict sequencing before attempting
/// decryption.
#[derive(Debug, Clone)]
pub struct ChunkPayload {
    /// Chunk sequence number within this session, starting at 0
    pub seq: u64,
    /// Byte offset of the plaintext within the file
    pub offset: u64,
    /// AEAD-sealed chunk data
    pub ciphertext: Vec<u8>,
}

/// Encode a Chunk payload (binary format).
#[must_use]
pub fn encode_chunk(payload: &ChunkPayload) -> Vec<u8> {
    let mut buf = Vec::with_capacity(16 + payload.ciphertext.len());
    buf.extend_from_slice(&payload.seq.to_be_bytes());
    buf.extend_from_slice(&payload.offset.to_be_bytes());
    buf.extend_from_slice(&payload.ciphertext);
    buf
}

/// Decode a Chunk payload (binary format).
///
/// # Errors
///
/// Returns an error if the payload is too short.
pub fn decode_chunk(data: &[u8]) -> Result<ChunkPayload> {
    if data.len() < 16 {
        return Err(Error::ProtocolError("chunk payload too short".to_string()));
    }

    let seq = u64::from_be_bytes([
        data[0], data[1], data[2], data[3], data[4], data[5], data[6], data[7],
    ]);
    let offset = u64::from_be_bytes([
        data[8], data[9], data[10], data[11], data[12], data[13], data[14], data[15],
    ]);
    let ciphertext = data[16..].to_vec();

    Ok(ChunkPayload {
        seq,
        offset,
        ciphertext,
    })
}

/// Encode a message payload to JSON bytes.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode_payload<T: Serialize>(payload: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(payload).map_err(|e| Error::Serialization(e.to_string()))
}

/// Decode a message payload from JSON bytes.
///
/// # Errors
///
/// Returns an error if deserialization fails.
pub fn decode_payload<T: for<'de> Deserialize<'de>>(data: &[u8]) -> Result<T> {
    serde_json::from_slice(data).map_err(|e| Error::Serialization(e.to_string()))
}

/// Read a complete frame from a stream.
///
/// # Errors
///
/// Returns an error if reading fails or the frame is invalid.
pub async fn read_frame<R>(reader: &mut R) -> Result<(FrameHeader, Vec<u8>)>
where
    R: tokio::io::AsyncReadExt + Unpin,
{
    let mut header_buf = [0u8; HEADER_SIZE];
    reader.read_exact(&mut header_buf).await?;

    let header = FrameHeader::decode(&header_buf)?;

    let mut payload = vec![0u8; header.payload_length as usize];
    if header.payload_length > 0 {
        reader.read_exact(&mut payload).await?;
    }

    Ok((header, payload))
}

/// Write a complete frame to a stream.
///
/// # Errors
///
/// Returns an error if writing fails.
pub async fn write_frame<W>(writer: &mut W, message_type: MessageType, payload: &[u8]) -> Result<()>
where
    W: tokio::io::AsyncWriteExt + Unpin,
{
    #[allow(clippy::cast_possible_truncation)]
    let header = FrameHeader {
        version: crate::PROTOCOL_VERSION,
        message_type,
        payload_length: payload.len() as u32,
    };

    writer.write_all(&header.encode()).await?;
    if !payload.is_empty() {
        writer.write_all(payload).await?;
    }
    writer.flush().await?;

    Ok(())
}

/// Read a complete frame from a stream with a timeout.
///
/// # Errors
///
/// Returns `Error::Timeout` if the operation exceeds the specified duration.
/// Returns an error if reading fails or the frame is invalid.
pub async fn read_frame_with_timeout<R>(
    reader: &mut R,
    duration: Duration,
) -> Result<(FrameHeader, Vec<u8>)>
where
    R: tokio::io::AsyncReadExt + Unpin,
{
    timeout(duration, read_frame(reader))
        .await
        .map_err(|_| Error::Timeout(duration.as_secs()))?
}

/// Write a complete frame to a stream with a timeout.
///
/// # Errors
///
/// Returns `Error::Timeout` if the operation exceeds the specified duration.
/// Returns an error if writing fails.
pub async fn write_frame_with_timeout<W>(
    writer: &mut W,
    message_type: MessageType,
    payload: &[u8],
    duration: Duration,
) -> Result<()>
where
    W: tokio::io::AsyncWriteExt + Unpin,
{
    timeout(duration, write_frame(writer, message_type, payload))
        .await
        .map_err(|_| Error::Timeout(duration.as_secs()))?
}

/// Incremental frame parser for callers that read from a raw byte stream.
///
/// Bytes are pushed in as they arrive; [`FrameDecoder::next_frame`] yields a
/// complete frame once the buffer holds one, or `None` if more bytes are
/// needed. A malformed header poisons the stream and is returned as an
/// error.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    /// Create an empty decoder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes received from the stream.
    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Try to extract the next complete frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the buffered header is invalid.
    pub fn next_frame(&mut self) -> Result<Option<(FrameHeader, Vec<u8>)>> {
        if self.buf.len() < HEADER_SIZE {
            return Ok(None);
        }

        let mut header_buf = [0u8; HEADER_SIZE];
        header_buf.copy_from_slice(&self.buf[..HEADER_SIZE]);
        let header = FrameHeader::decode(&header_buf)?;

        let total = HEADER_SIZE + header.payload_length as usize;
        if self.buf.len() < total {
            return Ok(None);
        }

        let payload = self.buf[HEADER_SIZE..total].to_vec();
        self.buf.drain(..total);

        Ok(Some((header, payload)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_header_encode_decode() {
        let header = FrameHeader {
            version: (1, 0),
            message_type: MessageType::TransferOffer,
            payload_length: 256,
        };

        let encoded = header.encode();
        let decoded = FrameHeader::decode(&encoded).expect("decode");

        assert_eq!(decoded.version, (1, 0));
        assert_eq!(decoded.message_type, MessageType::TransferOffer);
        assert_eq!(decoded.payload_length, 256);
    }

    #[test]
    fn test_bad_magic_rejected() {
        let header = FrameHeader {
            version: (1, 0),
            message_type: MessageType::Chunk,
            payload_length: 0,
        };
        let mut encoded = header.encode();
        encoded[0] = b'X';

        assert!(FrameHeader::decode(&encoded).is_err());
    }

    #[test]
    fn test_unknown_type_rejected() {
        let header = FrameHeader {
            version: (1, 0),
            message_type: MessageType::Chunk,
            payload_length: 0,
        };
        let mut encoded = header.encode();
        encoded[6] = 0x7E;

        assert!(FrameHeader::decode(&encoded).is_err());
    }

    #[test]
    fn test_unsupported_version_rejected() {
        let header = FrameHeader {
            version: (1, 0),
            message_type: MessageType::Chunk,
            payload_length: 0,
        };
        let mut encoded = header.encode();
        encoded[4] = 9;

        assert!(matches!(
            FrameHeader::decode(&encoded),
            Err(Error::UnsupportedVersion { major: 9, minor: 0 })
        ));
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let mut encoded = [0u8; HEADER_SIZE];
        encoded[0..4].copy_from_slice(&MAGIC);
        encoded[4] = 1;
        encoded[6] = MessageType::Chunk as u8;
        #[allow(clippy::cast_possible_truncation)]
        let too_big = (MAX_PAYLOAD_SIZE as u32) + 1;
        encoded[7..11].copy_from_slice(&too_big.to_be_bytes());

        assert!(FrameHeader::decode(&encoded).is_err());
    }

    #[test]
    fn test_chunk_encode_decode() {
        let payload = ChunkPayload {
            seq: 42,
            offset: 42 * 131_072,
            ciphertext: vec![1, 2, 3, 4, 5],
        };

        let encoded = encode_chunk(&payload);
        let decoded = decode_chunk(&encoded).expect("decode");

        assert_eq!(decoded.seq, payload.seq);
        assert_eq!(decoded.offset, payload.offset);
        assert_eq!(decoded.ciphertext, payload.ciphertext);
    }

    #[test]
    fn test_chunk_decode_too_short() {
        let data = vec![0u8; 10];
        assert!(decode_chunk(&data).is_err());
    }

    #[tokio::test]
    async fn test_read_write_frame() {
        let mut buffer = Vec::new();

        let payload = b"test payload";
        write_frame(&mut buffer, MessageType::TransferOffer, payload)
            .await
            .expect("write frame");

        let mut cursor = std::io::Cursor::new(buffer);
        let (header, read_payload) = read_frame(&mut cursor).await.expect("read frame");

        assert_eq!(header.message_type, MessageType::TransferOffer);
        assert_eq!(read_payload, payload);
    }

    #[tokio::test]
    async fn test_read_frame_with_timeout_expires() {
        struct NeverReadyReader;

        impl tokio::io::AsyncRead for NeverReadyReader {
            fn poll_read(
                self: std::pin::Pin<&mut Self>,
                _cx: &mut std::task::Context<'_>,
                _buf: &mut tokio::io::ReadBuf<'_>,
            ) -> std::task::Poll<std::io::Result<()>> {
                std::task::Poll::Pending
            }
        }

        let mut reader = NeverReadyReader;
        let result = read_frame_with_timeout(&mut reader, Duration::from_millis(50)).await;

        assert!(matches!(result, Err(Error::Timeout(_))));
    }

    #[test]
    fn test_decoder_handles_partial_feeds() {
        let header = FrameHeader {
            version: (1, 0),
            message_type: MessageType::Pause,
            payload_length: 4,
        };
        let mut wire = header.encode().to_vec();
        wire.extend_from_slice(&[9, 8, 7, 6]);

        let mut decoder = FrameDecoder::new();
        for byte in &wire[..wire.len() - 1] {
            decoder.push(&[*byte]);
            assert!(decoder.next_frame().expect("no error").is_none());
        }
        decoder.push(&wire[wire.len() - 1..]);

        let (header, payload) = decoder
            .next_frame()
            .expect("no error")
            .expect("complete frame");
        assert_eq!(header.message_type, MessageType::Pause);
        assert_eq!(payload, vec![9, 8, 7, 6]);

        assert!(decoder.next_frame().expect("no error").is_none());
    }

    #[test]
    fn test_decoder_yields_back_to_back_frames() {
        let mut wire = Vec::new();
        for message_type in [MessageType::Pause, MessageType::Resume] {
            let header = FrameHeader {
                version: (1, 0),
                message_type,
                payload_length: 0,
            };
            wire.extend_from_slice(&header.encode());
        }

        let mut decoder = FrameDecoder::new();
        decoder.push(&wire);

        let (first, _) = decoder.next_frame().expect("ok").expect("frame");
        let (second, _) = decoder.next_frame().expect("ok").expect("frame");
        assert_eq!(first.message_type, MessageType::Pause);
        assert_eq!(second.message_type, MessageType::Resume);
    }

    #[test]
    fn test_offer_payload_serialization() {
        let payload = OfferPayload {
            transfer_id: uuid::Uuid::new_v4(),
            file_name: "photo.jpg".to_string(),
            file_size: 1_048_576,
            sender_device_id: uuid::Uuid::new_v4(),
            sender_device_name: "Laptop".to_string(),
            identity_public_key: "base64_key".to_string(),
            identity_signature: "base64_sig".to_string(),
        };

        let encoded = encode_payload(&payload).expect("encode");
        let decoded: OfferPayload = decode_payload(&encoded).expect("decode");

        assert_eq!(decoded.transfer_id, payload.transfer_id);
        assert_eq!(decoded.file_name, payload.file_name);
        assert_eq!(decoded.file_size, payload.file_size);
    }
}
