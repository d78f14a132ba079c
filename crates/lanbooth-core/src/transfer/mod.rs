//! File transfer engine.
//!
//! Each transfer runs as an independent task driving one TCP connection
//! through the wire flow: handshake, offer, accept/reject, encrypted
//! chunks, completion. Pause, resume, and cancel arrive from two
//! directions at once (local commands and peer control frames), so every
//! transfer carries a watch channel holding the combined control state;
//! the task reconciles both sides between chunks.
//!
//! Progress events are throttled to avoid flooding subscribers on fast
//! local networks.

pub mod checkpoint;
pub mod manager;

use std::collections::VecDeque;
use std::io::SeekFrom;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use sha2::{Digest, Sha256};
use socket2::{SockRef, TcpKeepalive};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, oneshot, watch, Semaphore};
use uuid::Uuid;

use crate::crypto::{EphemeralKeyPair, Role, SessionCipher, SessionKeys};
use crate::error::{Error, Result};
use crate::event::{Event, Notification};
use crate::identity::DeviceIdentity;
use crate::protocol::{
    self, AcceptPayload, ChunkPayload, CompletePayload, ErrorPayload, MessageType, OfferPayload,
    RejectPayload,
};
use crate::trust::TrustStore;

use checkpoint::{Checkpoint, CheckpointStore};

/// How long to wait for the peer's half of the key exchange.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// How long an offer waits for an accept/reject before it is treated as
/// rejected.
pub const OFFER_DECISION_TIMEOUT: Duration = Duration::from_secs(60);

/// Default time the receiver waits for the next frame while transferring.
/// The clock stops while the transfer is paused.
pub const CHUNK_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Connection attempts before giving up on a peer.
pub const CONNECT_ATTEMPTS: u32 = 3;

/// Delay between connection attempts.
pub const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Minimum interval between progress events per transfer.
pub const PROGRESS_EMIT_INTERVAL: Duration = Duration::from_millis(200);

/// Bytes between receiver checkpoints.
pub const CHECKPOINT_BYTES: u64 = 4 * 1024 * 1024;

/// Minimum time between receiver checkpoints.
pub const CHECKPOINT_INTERVAL: Duration = Duration::from_secs(2);

/// Rolling window for speed estimation.
const SPEED_WINDOW: Duration = Duration::from_secs(2);

/// Configure TCP keep-alive on a transfer connection.
///
/// Keeps NAT and firewall state alive across long pauses:
/// - Start probing after 10 seconds of idle time
/// - Send probes every 5 seconds
fn configure_tcp_keepalive(stream: &TcpStream) -> Result<()> {
    let socket_ref = SockRef::from(stream);

    let keepalive = TcpKeepalive::new()
        .with_time(Duration::from_secs(10))
        .with_interval(Duration::from_secs(5));

    socket_ref
        .set_tcp_keepalive(&keepalive)
        .map_err(|e| Error::Io(std::io::Error::other(e)))?;

    Ok(())
}

/// Transfer direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferDirection {
    /// Sending a file
    Sending,
    /// Receiving a file
    Receiving,
}

/// Transfer state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferState {
    /// Queued, waiting for a per-peer slot
    Pending,
    /// Offer delivered, waiting for the receiver's decision
    AwaitingAcceptance,
    /// Establishing the TCP connection
    Connecting,
    /// Chunks are flowing
    Transferring,
    /// Halted by either side, resumable
    Paused,
    /// All bytes delivered and verified
    Completed,
    /// Terminal failure
    Failed,
    /// Cancelled by either side
    Cancelled,
    /// Declined by the receiver (or timed out awaiting a decision)
    Rejected,
}

impl TransferState {
    /// State name for errors and logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::AwaitingAcceptance => "awaiting_acceptance",
            Self::Connecting => "connecting",
            Self::Transferring => "transferring",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Rejected => "rejected",
        }
    }

    /// Whether the transfer has reached a final state.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Rejected
        )
    }
}

/// Snapshot of a transfer, as carried by events and query APIs.
#[derive(Debug, Clone, Serialize)]
pub struct TransferInfo {
    /// Unique transfer identifier
    pub transfer_id: Uuid,
    /// Sending or receiving
    pub direction: TransferDirection,
    /// The other device's stable id
    pub peer_device_id: Uuid,
    /// The other device's display name
    pub peer_device_name: String,
    /// File name (no path components)
    pub file_name: String,
    /// Total file size in bytes
    pub file_size: u64,
    /// Bytes transferred so far
    pub transferred_bytes: u64,
    /// Current state
    pub state: TransferState,
    /// When paused, whether the peer owns the pause
    pub paused_by_peer: bool,
    /// Current throughput in bytes per second
    pub speed_bps: f64,
    /// Percent complete (0.0 to 100.0)
    pub progress_percent: f64,
    /// Estimated seconds remaining, when the speed is known
    pub eta_seconds: Option<u64>,
    /// Failure message when the transfer failed
    pub error_message: Option<String>,
}

impl TransferInfo {
    fn new(
        transfer_id: Uuid,
        direction: TransferDirection,
        peer_device_id: Uuid,
        peer_device_name: String,
        file_name: String,
        file_size: u64,
    ) -> Self {
        Self {
            transfer_id,
            direction,
            peer_device_id,
            peer_device_name,
            file_name,
            file_size,
            transferred_bytes: 0,
            state: TransferState::Pending,
            paused_by_peer: false,
            speed_bps: 0.0,
            progress_percent: 0.0,
            eta_seconds: None,
            error_message: None,
        }
    }
}

/// What the local side wants the transfer to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Desired {
    /// Keep transferring
    Running,
    /// Hold at the next chunk boundary
    Paused,
    /// Stop for good
    Cancelled,
}

/// What the peer last told us via control frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteState {
    /// Peer is transferring
    Running,
    /// Peer asked to pause
    Paused,
    /// Peer cancelled
    Cancelled,
    /// Peer reported an error or the connection broke
    Failed,
}

/// Combined control state observed by a transfer task.
#[derive(Debug, Clone, Copy)]
pub struct Control {
    /// Local command state
    pub local: Desired,
    /// Peer-reported state
    pub remote: RemoteState,
}

impl Control {
    const fn initial() -> Self {
        Self {
            local: Desired::Running,
            remote: RemoteState::Running,
        }
    }
}

/// The receiver's decision on an inbound offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Accept the file
    Accept,
    /// Decline the file
    Reject,
    /// Cancel before deciding
    Cancel,
}

/// Shared handle to a live transfer: its snapshot, its control channel,
/// and the engine's event sink.
pub struct TransferShared {
    info: StdMutex<TransferInfo>,
    control: watch::Sender<Control>,
    events: broadcast::Sender<Event>,
}

impl TransferShared {
    /// Create the shared handle and the control receiver its task will
    /// watch.
    #[must_use]
    pub fn new(
        info: TransferInfo,
        events: broadcast::Sender<Event>,
    ) -> (Arc<Self>, watch::Receiver<Control>) {
        let (control, control_rx) = watch::channel(Control::initial());
        (
            Arc::new(Self {
                info: StdMutex::new(info),
                control,
                events,
            }),
            control_rx,
        )
    }

    fn lock_info(&self) -> std::sync::MutexGuard<'_, TransferInfo> {
        self.info
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Current snapshot.
    #[must_use]
    pub fn snapshot(&self) -> TransferInfo {
        self.lock_info().clone()
    }

    /// The transfer's id.
    #[must_use]
    pub fn transfer_id(&self) -> Uuid {
        self.lock_info().transfer_id
    }

    /// Move to a new state and publish it. Terminal states also produce a
    /// notification.
    pub fn set_state(&self, state: TransferState) {
        let info = {
            let mut info = self.lock_info();
            if info.state == state {
                return;
            }
            info.state = state;
            if state != TransferState::Paused {
                info.paused_by_peer = false;
            }
            info.clone()
        };

        tracing::info!(
            transfer_id = %info.transfer_id,
            state = state.as_str(),
            "transfer state changed"
        );
        let _ = self.events.send(Event::TransferState(info.clone()));

        let notification = match state {
            TransferState::Completed => Some(Notification::success(format!(
                "'{}' transferred successfully",
                info.file_name
            ))),
            TransferState::Failed => Some(Notification::error(format!(
                "'{}' transfer failed: {}",
                info.file_name,
                info.error_message.as_deref().unwrap_or("unknown error")
            ))),
            TransferState::Rejected => Some(Notification::warning(format!(
                "'{}' was declined by {}",
                info.file_name, info.peer_device_name
            ))),
            TransferState::Cancelled => Some(Notification::info(format!(
                "'{}' transfer cancelled",
                info.file_name
            ))),
            _ => None,
        };
        if let Some(notification) = notification {
            let _ = self.events.send(Event::Notification(notification));
        }
    }

    /// Move to `Paused`, recording which side owns the pause.
    pub fn set_paused(&self, by_peer: bool) {
        let info = {
            let mut info = self.lock_info();
            if info.state == TransferState::Paused && info.paused_by_peer == by_peer {
                return;
            }
            info.state = TransferState::Paused;
            info.paused_by_peer = by_peer;
            info.clone()
        };

        tracing::info!(
            transfer_id = %info.transfer_id,
            by_peer,
            "transfer paused"
        );
        let _ = self.events.send(Event::TransferState(info));
    }

    /// Record a failure message and move to `Failed`.
    pub fn fail(&self, error: &Error) {
        {
            let mut info = self.lock_info();
            info.error_message = Some(error.to_string());
        }
        self.set_state(TransferState::Failed);
    }

    /// Update byte counters and publish a progress event.
    #[allow(clippy::cast_precision_loss)]
    pub fn update_progress(&self, transferred: u64, speed_bps: f64, eta_seconds: Option<u64>) {
        let info = {
            let mut info = self.lock_info();
            info.transferred_bytes = transferred;
            info.speed_bps = speed_bps;
            info.eta_seconds = eta_seconds;
            info.progress_percent = if info.file_size == 0 {
                100.0
            } else {
                (transferred as f64 / info.file_size as f64) * 100.0
            };
            info.clone()
        };

        let _ = self.events.send(Event::TransferProgress(info));
    }

    /// Change the local command state.
    pub fn signal_local(&self, desired: Desired) {
        self.control.send_modify(|c| c.local = desired);
    }

    /// Record what the peer told us.
    pub fn signal_remote(&self, remote: RemoteState) {
        self.control.send_modify(|c| c.remote = remote);
    }

    /// Current control state.
    #[must_use]
    pub fn control_state(&self) -> Control {
        *self.control.borrow()
    }

    /// A fresh control receiver for auxiliary tasks.
    #[must_use]
    pub fn watch_control(&self) -> watch::Receiver<Control> {
        self.control.subscribe()
    }
}

/// Rolling-window throughput estimator.
pub struct SpeedTracker {
    window: Duration,
    samples: VecDeque<(Instant, u64)>,
    total: u64,
}

impl SpeedTracker {
    /// Create a tracker with the given averaging window.
    #[must_use]
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            samples: VecDeque::new(),
            total: 0,
        }
    }

    /// Record bytes moved at `now`.
    pub fn record(&mut self, bytes: u64, now: Instant) {
        self.samples.push_back((now, bytes));
        self.total += bytes;
        self.evict(now);
    }

    fn evict(&mut self, now: Instant) {
        while let Some((t, bytes)) = self.samples.front() {
            if now.duration_since(*t) > self.window {
                self.total -= bytes;
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// Current throughput in bytes per second.
    #[allow(clippy::cast_precision_loss)]
    pub fn speed_bps(&mut self, now: Instant) -> f64 {
        self.evict(now);
        let Some((earliest, _)) = self.samples.front() else {
            return 0.0;
        };
        let elapsed = now.duration_since(*earliest).max(Duration::from_millis(100));
        self.total as f64 / elapsed.as_secs_f64()
    }

    /// Estimated seconds until `remaining` bytes are done.
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn eta_seconds(&mut self, remaining: u64, now: Instant) -> Option<u64> {
        let speed = self.speed_bps(now);
        if speed <= 0.0 {
            return None;
        }
        Some((remaining as f64 / speed).ceil() as u64)
    }
}

/// Wait until the control state demands a stop.
async fn wait_for_cancel(rx: &mut watch::Receiver<Control>) {
    loop {
        {
            let c = *rx.borrow_and_update();
            if c.local == Desired::Cancelled || c.remote == RemoteState::Cancelled {
                return;
            }
        }
        if rx.changed().await.is_err() {
            // Control channel gone; never resolves.
            std::future::pending::<()>().await;
        }
    }
}

/// Initiator half of the key exchange. Returns (sealing, opening) ciphers.
async fn handshake_initiator(stream: &mut TcpStream) -> Result<(SessionCipher, SessionCipher)> {
    let keypair = EphemeralKeyPair::generate();
    protocol::write_frame_with_timeout(
        stream,
        MessageType::Handshake,
        &keypair.public_bytes(),
        HANDSHAKE_TIMEOUT,
    )
    .await?;

    let (header, payload) = protocol::read_frame_with_timeout(stream, HANDSHAKE_TIMEOUT).await?;
    if header.message_type != MessageType::Handshake {
        return Err(Error::UnexpectedMessage {
            expected: MessageType::Handshake.name().to_string(),
            actual: header.message_type.name().to_string(),
        });
    }

    let keys = SessionKeys::derive(keypair, &payload, Role::Initiator)?;
    Ok(keys.into_ciphers())
}

/// Responder half of the key exchange. Returns (sealing, opening) ciphers.
async fn handshake_responder(stream: &mut TcpStream) -> Result<(SessionCipher, SessionCipher)> {
    let (header, payload) = protocol::read_frame_with_timeout(stream, HANDSHAKE_TIMEOUT).await?;
    if header.message_type != MessageType::Handshake {
        return Err(Error::UnexpectedMessage {
            expected: MessageType::Handshake.name().to_string(),
            actual: header.message_type.name().to_string(),
        });
    }

    let keypair = EphemeralKeyPair::generate();
    protocol::write_frame_with_timeout(
        stream,
        MessageType::Handshake,
        &keypair.public_bytes(),
        HANDSHAKE_TIMEOUT,
    )
    .await?;

    let keys = SessionKeys::derive(keypair, &payload, Role::Responder)?;
    Ok(keys.into_ciphers())
}

async fn connect_with_retry(addr: SocketAddr) -> Result<TcpStream> {
    let mut last_err = None;
    for attempt in 1..=CONNECT_ATTEMPTS {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                tracing::warn!(
                    addr = %addr,
                    attempt,
                    error = %e,
                    "connection attempt failed"
                );
                last_err = Some(e);
                if attempt < CONNECT_ATTEMPTS {
                    tokio::time::sleep(CONNECT_RETRY_DELAY).await;
                }
            }
        }
    }
    Err(Error::ConnectionLost(format!(
        "could not connect to {addr}: {}",
        last_err.map_or_else(|| "unknown".to_string(), |e| e.to_string())
    )))
}

/// Outbound transfer task.
pub(crate) struct SenderJob {
    pub shared: Arc<TransferShared>,
    pub control_rx: watch::Receiver<Control>,
    pub peer_addr: SocketAddr,
    pub peer_device_id: Uuid,
    pub expected_peer_key: String,
    pub file_path: PathBuf,
    pub device_name: String,
    pub identity: Arc<DeviceIdentity>,
    pub trust: Arc<TrustStore>,
    pub chunk_size: usize,
    pub slots: Arc<Semaphore>,
}

impl SenderJob {
    pub(crate) async fn run(mut self) {
        let shared = Arc::clone(&self.shared);
        match self.drive().await {
            Ok(()) => {}
            Err(Error::TransferCancelled) => shared.set_state(TransferState::Cancelled),
            Err(e) => {
                if !shared.snapshot().state.is_terminal() {
                    tracing::warn!(
                        transfer_id = %shared.transfer_id(),
                        error = %e,
                        "outbound transfer failed"
                    );
                    shared.fail(&e);
                }
            }
        }
    }

    async fn drive(&mut self) -> Result<()> {
        // Hold a per-peer slot for the whole transfer.
        let _permit = tokio::select! {
            permit = Arc::clone(&self.slots).acquire_owned() => {
                permit.map_err(|_| Error::Internal("transfer slots closed".to_string()))?
            }
            () = wait_for_cancel(&mut self.control_rx) => return Err(Error::TransferCancelled),
        };

        let file_size = self.shared.snapshot().file_size;
        let transfer_id = self.shared.transfer_id();

        self.shared.set_state(TransferState::Connecting);
        let mut stream = connect_with_retry(self.peer_addr).await?;
        configure_tcp_keepalive(&stream)?;

        let (mut seal, _open) = handshake_initiator(&mut stream).await?;

        let id_string = transfer_id.to_string();
        let offer = OfferPayload {
            transfer_id,
            file_name: self.shared.snapshot().file_name,
            file_size,
            sender_device_id: self.identity.device_id(),
            sender_device_name: self.device_name.clone(),
            identity_public_key: self.identity.public_key_b64(),
            identity_signature: self.identity.sign(id_string.as_bytes()),
        };
        protocol::write_frame(
            &mut stream,
            MessageType::TransferOffer,
            &protocol::encode_payload(&offer)?,
        )
        .await?;
        self.shared.set_state(TransferState::AwaitingAcceptance);

        // The receiver has a human in the loop; a silent minute counts as no.
        let decision = tokio::select! {
            frame = protocol::read_frame_with_timeout(&mut stream, OFFER_DECISION_TIMEOUT) => frame,
            () = wait_for_cancel(&mut self.control_rx) => {
                let _ = protocol::write_frame(&mut stream, MessageType::Cancel, &[]).await;
                return Err(Error::TransferCancelled);
            }
        };

        let (header, payload) = match decision {
            Ok(pair) => pair,
            Err(Error::Timeout(_)) => {
                tracing::info!(transfer_id = %transfer_id, "offer timed out, treating as rejected");
                self.shared.set_state(TransferState::Rejected);
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let resume_offset = match header.message_type {
            MessageType::TransferAccept => {
                let accept: AcceptPayload = protocol::decode_payload(&payload)?;
                if !DeviceIdentity::verify(
                    &accept.identity_public_key,
                    id_string.as_bytes(),
                    &accept.identity_signature,
                ) {
                    return Err(Error::SignatureInvalid);
                }
                if accept.identity_public_key != self.expected_peer_key {
                    return Err(Error::Handshake(
                        "peer identity does not match its announcement".to_string(),
                    ));
                }
                if accept.resume_offset > file_size {
                    return Err(Error::ProtocolError(format!(
                        "resume offset {} beyond file size {file_size}",
                        accept.resume_offset
                    )));
                }
                accept.resume_offset
            }
            MessageType::TransferReject => {
                let reject: RejectPayload = protocol::decode_payload(&payload)?;
                tracing::info!(transfer_id = %transfer_id, reason = %reject.reason, "offer rejected");
                self.shared.set_state(TransferState::Rejected);
                return Ok(());
            }
            MessageType::Cancel => return Err(Error::TransferCancelled),
            MessageType::Error => {
                let err: ErrorPayload = protocol::decode_payload(&payload)?;
                return Err(Error::ConnectionLost(format!(
                    "peer error: {}",
                    err.message
                )));
            }
            other => {
                return Err(Error::UnexpectedMessage {
                    expected: MessageType::TransferAccept.name().to_string(),
                    actual: other.name().to_string(),
                })
            }
        };

        let (read_half, mut write_half) = stream.into_split();
        let monitor = spawn_control_monitor(read_half, Arc::clone(&self.shared));

        let result = self
            .stream_chunks(&mut write_half, &mut seal, resume_offset, file_size)
            .await;
        monitor.abort();
        result
    }

    async fn stream_chunks(
        &mut self,
        write_half: &mut OwnedWriteHalf,
        seal: &mut SessionCipher,
        resume_offset: u64,
        file_size: u64,
    ) -> Result<()> {
        let mut file = fs::File::open(&self.file_path).await?;
        let mut buf = vec![0u8; self.chunk_size];
        let mut hasher = Sha256::new();

        // The whole-file hash must cover the bytes the receiver already
        // holds, so re-read the skipped prefix through the hasher.
        let mut remaining = resume_offset;
        while remaining > 0 {
            #[allow(clippy::cast_possible_truncation)]
            let want = remaining.min(buf.len() as u64) as usize;
            let n = file.read(&mut buf[..want]).await?;
            if n == 0 {
                return Err(Error::ResumeMismatch(
                    "file is shorter than the agreed resume offset".to_string(),
                ));
            }
            hasher.update(&buf[..n]);
            remaining -= n as u64;
        }

        let mut offset = resume_offset;
        let mut seq: u64 = 0;
        let mut tracker = SpeedTracker::new(SPEED_WINDOW);
        let mut last_emit = Instant::now() - PROGRESS_EMIT_INTERVAL;
        let mut pause_announced = false;

        self.shared.set_state(TransferState::Transferring);
        self.shared.update_progress(offset, 0.0, None);

        while offset < file_size {
            self.reconcile_control(write_half, &mut pause_announced)
                .await?;

            // Never read past the size the receiver accepted.
            #[allow(clippy::cast_possible_truncation)]
            let want = (file_size - offset).min(buf.len() as u64) as usize;
            let n = file.read(&mut buf[..want]).await?;
            if n == 0 {
                return Err(Error::SourceChanged(
                    "file shrank while transferring".to_string(),
                ));
            }
            hasher.update(&buf[..n]);

            let ciphertext = seal.seal(&buf[..n])?;
            let chunk = ChunkPayload {
                seq,
                offset,
                ciphertext,
            };
            protocol::write_frame(write_half, MessageType::Chunk, &protocol::encode_chunk(&chunk))
                .await
                .map_err(map_write_error)?;

            offset += n as u64;
            seq += 1;

            let now = Instant::now();
            tracker.record(n as u64, now);
            if now.duration_since(last_emit) >= PROGRESS_EMIT_INTERVAL {
                let eta = tracker.eta_seconds(file_size - offset, now);
                self.shared
                    .update_progress(offset, tracker.speed_bps(now), eta);
                last_emit = now;
            }
        }

        // The offer promised exactly file_size bytes; a file that grew no
        // longer matches what the receiver will verify.
        let n = file.read(&mut buf[..1]).await?;
        if n != 0 {
            return Err(Error::SourceChanged(
                "file grew while transferring".to_string(),
            ));
        }

        let digest = hasher.finalize();
        let complete = CompletePayload {
            sha256_hex: crate::crypto::to_hex(&digest),
        };
        protocol::write_frame(
            write_half,
            MessageType::Complete,
            &protocol::encode_payload(&complete)?,
        )
        .await
        .map_err(map_write_error)?;

        let peer = self.shared.snapshot();
        self.trust
            .record(self.peer_device_id, &peer.peer_device_name, &self.expected_peer_key);

        self.shared.update_progress(file_size, 0.0, Some(0));
        self.shared.set_state(TransferState::Completed);

        Ok(())
    }

    /// Apply the current control state at a chunk boundary, blocking while
    /// paused. Announces local pause/resume transitions to the peer.
    async fn reconcile_control(
        &mut self,
        write_half: &mut OwnedWriteHalf,
        pause_announced: &mut bool,
    ) -> Result<()> {
        loop {
            let c = *self.control_rx.borrow_and_update();

            if c.local == Desired::Cancelled {
                let _ = protocol::write_frame(write_half, MessageType::Cancel, &[]).await;
                return Err(Error::TransferCancelled);
            }
            match c.remote {
                RemoteState::Cancelled => return Err(Error::TransferCancelled),
                RemoteState::Failed => {
                    return Err(Error::ConnectionLost(
                        "peer closed the connection".to_string(),
                    ))
                }
                RemoteState::Running | RemoteState::Paused => {}
            }

            let local_paused = c.local == Desired::Paused;
            let remote_paused = c.remote == RemoteState::Paused;

            if local_paused != *pause_announced {
                let msg = if local_paused {
                    MessageType::Pause
                } else {
                    MessageType::Resume
                };
                protocol::write_frame(write_half, msg, &[])
                    .await
                    .map_err(map_write_error)?;
                *pause_announced = local_paused;
            }

            if local_paused || remote_paused {
                // A peer pause outranks a local one for resume ownership.
                self.shared.set_paused(remote_paused);
                self.control_rx
                    .changed()
                    .await
                    .map_err(|_| Error::Internal("control channel closed".to_string()))?;
                continue;
            }

            if self.shared.snapshot().state == TransferState::Paused {
                self.shared.set_state(TransferState::Transferring);
            }
            return Ok(());
        }
    }
}

fn map_write_error(e: Error) -> Error {
    match e {
        Error::Io(io_err) => Error::ConnectionLost(io_err.to_string()),
        other => other,
    }
}

/// Watch the sender's read half for receiver control frames.
///
/// Control frames are small and may arrive packed together, so the raw
/// bytes go through an incremental decoder instead of one blocking read
/// per frame.
fn spawn_control_monitor(
    mut read_half: OwnedReadHalf,
    shared: Arc<TransferShared>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut decoder = protocol::FrameDecoder::new();
        let mut buf = [0u8; 1024];
        loop {
            loop {
                let (header, payload) = match decoder.next_frame() {
                    Ok(Some(frame)) => frame,
                    Ok(None) => break,
                    Err(_) => {
                        shared.signal_remote(RemoteState::Failed);
                        return;
                    }
                };
                match header.message_type {
                    MessageType::Pause => shared.signal_remote(RemoteState::Paused),
                    MessageType::Resume => shared.signal_remote(RemoteState::Running),
                    MessageType::Cancel => {
                        shared.signal_remote(RemoteState::Cancelled);
                        return;
                    }
                    MessageType::Error => {
                        if let Ok(err) = protocol::decode_payload::<ErrorPayload>(&payload) {
                            tracing::warn!(
                                transfer_id = %shared.transfer_id(),
                                code = %err.code,
                                message = %err.message,
                                "peer reported an error"
                            );
                        }
                        shared.signal_remote(RemoteState::Failed);
                        return;
                    }
                    other => {
                        tracing::debug!(
                            frame = other.name(),
                            "ignoring unexpected frame from receiver"
                        );
                    }
                }
            }
            match read_half.read(&mut buf).await {
                Ok(0) | Err(_) => {
                    shared.signal_remote(RemoteState::Failed);
                    return;
                }
                Ok(n) => decoder.push(&buf[..n]),
            }
        }
    })
}

/// Registers an inbound transfer with the manager, yielding the channel
/// the accept/reject decision arrives on. Fails on duplicate transfer ids.
pub(crate) type RegisterFn =
    Box<dyn FnOnce(Arc<TransferShared>) -> Result<oneshot::Receiver<Decision>> + Send + Sync>;

/// Inbound transfer task, driving one accepted connection.
pub(crate) struct ReceiverJob {
    pub stream: Option<TcpStream>,
    pub save_dir: PathBuf,
    pub device_name: String,
    pub identity: Arc<DeviceIdentity>,
    pub trust: Arc<TrustStore>,
    pub checkpoints: Arc<CheckpointStore>,
    pub events: broadcast::Sender<Event>,
    pub keep_partial_on_cancel: bool,
    pub idle_timeout: Duration,
    pub register: Option<RegisterFn>,

    shared: Option<Arc<TransferShared>>,
    dest_path: Option<PathBuf>,
}

impl ReceiverJob {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        stream: TcpStream,
        save_dir: PathBuf,
        device_name: String,
        identity: Arc<DeviceIdentity>,
        trust: Arc<TrustStore>,
        checkpoints: Arc<CheckpointStore>,
        events: broadcast::Sender<Event>,
        keep_partial_on_cancel: bool,
        idle_timeout: Duration,
        register: RegisterFn,
    ) -> Self {
        Self {
            stream: Some(stream),
            save_dir,
            device_name,
            identity,
            trust,
            checkpoints,
            events,
            keep_partial_on_cancel,
            idle_timeout,
            register: Some(register),
            shared: None,
            dest_path: None,
        }
    }

    pub(crate) async fn run(mut self) {
        match self.drive().await {
            Ok(()) => {}
            Err(Error::TransferCancelled) => self.finish_cancelled().await,
            Err(e) => {
                if let Some(shared) = &self.shared {
                    if !shared.snapshot().state.is_terminal() {
                        tracing::warn!(
                            transfer_id = %shared.transfer_id(),
                            error = %e,
                            "inbound transfer failed"
                        );
                        // Checkpoint stays on disk so the sender can retry.
                        shared.fail(&e);
                    }
                } else {
                    tracing::warn!(error = %e, "inbound connection rejected");
                }
            }
        }
    }

    async fn finish_cancelled(&self) {
        let Some(shared) = &self.shared else { return };
        shared.set_state(TransferState::Cancelled);
        let _ = self.checkpoints.delete(&shared.transfer_id()).await;
        if !self.keep_partial_on_cancel {
            if let Some(dest) = &self.dest_path {
                let _ = fs::remove_file(dest).await;
            }
        }
    }

    async fn drive(&mut self) -> Result<()> {
        let mut stream = self
            .stream
            .take()
            .ok_or_else(|| Error::Internal("receiver already consumed its stream".to_string()))?;

        configure_tcp_keepalive(&stream)?;
        let (_seal, mut open) = handshake_responder(&mut stream).await?;

        let (header, payload) =
            protocol::read_frame_with_timeout(&mut stream, HANDSHAKE_TIMEOUT).await?;
        if header.message_type != MessageType::TransferOffer {
            return Err(Error::UnexpectedMessage {
                expected: MessageType::TransferOffer.name().to_string(),
                actual: header.message_type.name().to_string(),
            });
        }
        let offer: OfferPayload = protocol::decode_payload(&payload)?;

        let id_string = offer.transfer_id.to_string();
        if !DeviceIdentity::verify(
            &offer.identity_public_key,
            id_string.as_bytes(),
            &offer.identity_signature,
        ) {
            send_error(&mut stream, "signature", "offer signature verification failed").await;
            return Err(Error::SignatureInvalid);
        }

        // Strip any path components the sender may have smuggled in.
        let file_name = std::path::Path::new(&offer.file_name)
            .file_name()
            .and_then(|n| n.to_str())
            .map(ToString::to_string)
            .ok_or_else(|| Error::ProtocolError("offer has no usable file name".to_string()))?;

        let info = TransferInfo::new(
            offer.transfer_id,
            TransferDirection::Receiving,
            offer.sender_device_id,
            offer.sender_device_name.clone(),
            file_name.clone(),
            offer.file_size,
        );
        let (shared, mut control_rx) = TransferShared::new(info, self.events.clone());

        let register = self
            .register
            .take()
            .ok_or_else(|| Error::Internal("receiver already registered".to_string()))?;
        let decision_rx = match register(Arc::clone(&shared)) {
            Ok(rx) => rx,
            Err(e) => {
                send_error(&mut stream, "duplicate", &e.to_string()).await;
                return Err(e);
            }
        };
        self.shared = Some(Arc::clone(&shared));

        // The offer is now in front of the local user; accept/reject are
        // only valid from here until a decision is made.
        shared.set_state(TransferState::AwaitingAcceptance);
        let _ = self.events.send(Event::TransferRequest(shared.snapshot()));

        let decision = tokio::select! {
            decision = decision_rx => decision.unwrap_or(Decision::Reject),
            () = wait_for_cancel(&mut control_rx) => Decision::Cancel,
            () = tokio::time::sleep(OFFER_DECISION_TIMEOUT) => {
                tracing::info!(
                    transfer_id = %offer.transfer_id,
                    "no decision within timeout, declining"
                );
                Decision::Reject
            }
        };

        match decision {
            Decision::Reject => {
                let reject = RejectPayload {
                    reason: "declined by receiver".to_string(),
                };
                let _ = protocol::write_frame(
                    &mut stream,
                    MessageType::TransferReject,
                    &protocol::encode_payload(&reject)?,
                )
                .await;
                shared.set_state(TransferState::Rejected);
                return Ok(());
            }
            Decision::Cancel => {
                let _ = protocol::write_frame(&mut stream, MessageType::Cancel, &[]).await;
                return Err(Error::TransferCancelled);
            }
            Decision::Accept => {}
        }

        fs::create_dir_all(&self.save_dir).await?;
        let dest = self.save_dir.join(&file_name);
        self.dest_path = Some(dest.clone());

        let (resume_offset, mut hasher) = self
            .resolve_resume(&dest, offer.file_size, offer.transfer_id)
            .await?;

        let mut file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&dest)
            .await?;
        // Drop any bytes past the confirmed prefix.
        file.set_len(resume_offset).await?;
        file.seek(SeekFrom::Start(resume_offset)).await?;

        let accept = AcceptPayload {
            resume_offset,
            device_name: self.device_name.clone(),
            identity_public_key: self.identity.public_key_b64(),
            identity_signature: self.identity.sign(id_string.as_bytes()),
        };
        protocol::write_frame(
            &mut stream,
            MessageType::TransferAccept,
            &protocol::encode_payload(&accept)?,
        )
        .await?;

        shared.set_state(TransferState::Transferring);
        shared.update_progress(resume_offset, 0.0, None);

        self.receive_chunks(
            stream,
            &shared,
            &mut control_rx,
            &mut open,
            &mut hasher,
            &mut file,
            &offer,
            resume_offset,
        )
        .await
    }

    /// Decide where to start writing. A valid checkpoint whose hash matches
    /// the partial file on disk resumes from its confirmed offset; anything
    /// else starts from zero with a fresh hasher.
    async fn resolve_resume(
        &self,
        dest: &std::path::Path,
        file_size: u64,
        transfer_id: Uuid,
    ) -> Result<(u64, Sha256)> {
        let Some(cp) = self.checkpoints.find_by_file(dest, file_size).await? else {
            return Ok((0, Sha256::new()));
        };

        match hash_file_prefix(dest, cp.bytes_confirmed).await {
            Ok(Some(hasher)) => {
                let digest_hex = crate::crypto::to_hex(&hasher.clone().finalize());
                if digest_hex == cp.content_hash {
                    tracing::info!(
                        transfer_id = %transfer_id,
                        resume_offset = cp.bytes_confirmed,
                        "resuming from checkpoint"
                    );
                    // Re-key the checkpoint to this attempt so completion
                    // cleans it up.
                    if cp.transfer_id != transfer_id {
                        let migrated = Checkpoint {
                            transfer_id,
                            ..cp.clone()
                        };
                        self.checkpoints.save(&migrated).await?;
                        let _ = self.checkpoints.delete(&cp.transfer_id).await;
                    }
                    return Ok((cp.bytes_confirmed, hasher));
                }
                tracing::warn!(
                    transfer_id = %transfer_id,
                    "partial file does not match checkpoint, restarting"
                );
            }
            Ok(None) => {
                tracing::warn!(
                    transfer_id = %transfer_id,
                    "partial file missing or too short, restarting"
                );
            }
            Err(e) => {
                tracing::warn!(
                    transfer_id = %transfer_id,
                    error = %e,
                    "could not read partial file, restarting"
                );
            }
        }

        let _ = self.checkpoints.delete(&cp.transfer_id).await;
        Ok((0, Sha256::new()))
    }

    #[allow(clippy::too_many_arguments, clippy::too_many_lines)]
    async fn receive_chunks(
        &mut self,
        stream: TcpStream,
        shared: &Arc<TransferShared>,
        control_rx: &mut watch::Receiver<Control>,
        open: &mut SessionCipher,
        hasher: &mut Sha256,
        file: &mut fs::File,
        offer: &OfferPayload,
        resume_offset: u64,
    ) -> Result<()> {
        let (mut read_half, write_half) = stream.into_split();
        let writer = Arc::new(tokio::sync::Mutex::new(write_half));

        let forwarder = spawn_control_forwarder(
            Arc::clone(&writer),
            Arc::clone(shared),
            shared.watch_control(),
        );

        let mut offset = resume_offset;
        let mut expected_seq: u64 = 0;
        let mut tracker = SpeedTracker::new(SPEED_WINDOW);
        let mut last_emit = Instant::now() - PROGRESS_EMIT_INTERVAL;
        let mut bytes_since_checkpoint: u64 = 0;
        let mut last_checkpoint = Instant::now();
        let mut was_paused = false;
        let mut control_open = true;

        let result = 'transfer: loop {
            // A partially read frame must never be dropped, so the read
            // future stays alive while control changes and the idle clock
            // are handled alongside it.
            let read_fut = protocol::read_frame(&mut read_half);
            tokio::pin!(read_fut);
            let idle = tokio::time::sleep(self.idle_timeout);
            tokio::pin!(idle);

            let frame = loop {
                let c = *control_rx.borrow_and_update();
                if c.local == Desired::Cancelled || c.remote == RemoteState::Cancelled {
                    let mut w = writer.lock().await;
                    let _ = protocol::write_frame(&mut *w, MessageType::Cancel, &[]).await;
                    break 'transfer Err(Error::TransferCancelled);
                }
                let paused = c.local == Desired::Paused || c.remote == RemoteState::Paused;

                // Entering a pause persists everything confirmed so far; a
                // paused transfer must survive a crash.
                if paused && !was_paused && bytes_since_checkpoint > 0 {
                    if let Err(e) = self.write_checkpoint(file, offer, offset, hasher).await {
                        tracing::warn!(
                            transfer_id = %offer.transfer_id,
                            error = %e,
                            "failed to write checkpoint"
                        );
                    } else {
                        bytes_since_checkpoint = 0;
                        last_checkpoint = Instant::now();
                    }
                }
                was_paused = paused;

                // In-flight chunks keep arriving after a pause request; the
                // sender stops at its next chunk boundary. The idle clock
                // only runs while not paused.
                tokio::select! {
                    frame = &mut read_fut => break frame,
                    () = idle.as_mut(), if !paused => {
                        break 'transfer Err(Error::Timeout(self.idle_timeout.as_secs()));
                    }
                    changed = control_rx.changed(), if control_open => {
                        if changed.is_ok() {
                            idle.as_mut()
                                .reset(tokio::time::Instant::now() + self.idle_timeout);
                        } else {
                            control_open = false;
                        }
                    }
                }
            };

            let (header, payload) = match frame {
                Ok(pair) => pair,
                Err(Error::Io(e)) => break Err(Error::ConnectionLost(e.to_string())),
                Err(e) => break Err(e),
            };

            match header.message_type {
                MessageType::Chunk => {
                    let chunk = match protocol::decode_chunk(&payload) {
                        Ok(chunk) => chunk,
                        Err(e) => break Err(e),
                    };
                    if chunk.seq != expected_seq || chunk.offset != offset {
                        break Err(Error::ProtocolError(format!(
                            "chunk out of order: got seq {} at offset {}, expected seq {} at offset {}",
                            chunk.seq, chunk.offset, expected_seq, offset
                        )));
                    }

                    let plaintext = match open.open(&chunk.ciphertext) {
                        Ok(plaintext) => plaintext,
                        Err(e) => {
                            self.send_error_via(&writer, "integrity", "chunk failed authentication")
                                .await;
                            break Err(e);
                        }
                    };

                    if offset + plaintext.len() as u64 > offer.file_size {
                        break Err(Error::ProtocolError(
                            "chunk extends past the offered file size".to_string(),
                        ));
                    }

                    if let Err(e) = file.write_all(&plaintext).await {
                        break Err(Error::Io(e));
                    }
                    hasher.update(&plaintext);
                    offset += plaintext.len() as u64;
                    expected_seq += 1;

                    let now = Instant::now();
                    tracker.record(plaintext.len() as u64, now);
                    if now.duration_since(last_emit) >= PROGRESS_EMIT_INTERVAL {
                        let eta = tracker.eta_seconds(offer.file_size - offset, now);
                        shared.update_progress(offset, tracker.speed_bps(now), eta);
                        last_emit = now;
                    }

                    bytes_since_checkpoint += plaintext.len() as u64;
                    if bytes_since_checkpoint >= CHECKPOINT_BYTES
                        || (bytes_since_checkpoint > 0
                            && last_checkpoint.elapsed() >= CHECKPOINT_INTERVAL)
                    {
                        if let Err(e) = self
                            .write_checkpoint(file, offer, offset, hasher)
                            .await
                        {
                            tracing::warn!(
                                transfer_id = %offer.transfer_id,
                                error = %e,
                                "failed to write checkpoint"
                            );
                        }
                        bytes_since_checkpoint = 0;
                        last_checkpoint = Instant::now();
                    }
                }
                MessageType::Pause => {
                    shared.signal_remote(RemoteState::Paused);
                    shared.set_paused(true);
                }
                MessageType::Resume => {
                    shared.signal_remote(RemoteState::Running);
                    let c = *control_rx.borrow();
                    if c.local == Desired::Paused {
                        // Pause ownership passes to the local side.
                        shared.set_paused(false);
                    } else {
                        shared.set_state(TransferState::Transferring);
                    }
                }
                MessageType::Cancel => break Err(Error::TransferCancelled),
                MessageType::Error => {
                    let message = protocol::decode_payload::<ErrorPayload>(&payload)
                        .map_or_else(|_| "unknown".to_string(), |e| e.message);
                    break Err(Error::ConnectionLost(format!("peer error: {message}")));
                }
                MessageType::Complete => {
                    let complete: CompletePayload = match protocol::decode_payload(&payload) {
                        Ok(complete) => complete,
                        Err(e) => break Err(e),
                    };
                    if offset != offer.file_size {
                        break Err(Error::ProtocolError(format!(
                            "completion at {offset} bytes, expected {}",
                            offer.file_size
                        )));
                    }

                    let digest_hex = crate::crypto::to_hex(&hasher.clone().finalize());
                    if digest_hex != complete.sha256_hex {
                        self.send_error_via(&writer, "checksum", "file hash mismatch")
                            .await;
                        break Err(Error::ChecksumMismatch {
                            expected: complete.sha256_hex,
                            actual: digest_hex,
                        });
                    }

                    if let Err(e) = file.sync_all().await {
                        break Err(Error::Io(e));
                    }
                    let _ = self.checkpoints.delete(&offer.transfer_id).await;
                    self.trust.record(
                        offer.sender_device_id,
                        &offer.sender_device_name,
                        &offer.identity_public_key,
                    );

                    shared.update_progress(offer.file_size, 0.0, Some(0));
                    shared.set_state(TransferState::Completed);
                    break Ok(());
                }
                other => {
                    break Err(Error::UnexpectedMessage {
                        expected: MessageType::Chunk.name().to_string(),
                        actual: other.name().to_string(),
                    })
                }
            }
        };

        forwarder.abort();
        result
    }

    async fn write_checkpoint(
        &self,
        file: &mut fs::File,
        offer: &OfferPayload,
        offset: u64,
        hasher: &Sha256,
    ) -> Result<()> {
        // Data must hit the disk before the checkpoint claims it.
        file.flush().await?;
        file.sync_data().await?;

        let dest = self
            .dest_path
            .clone()
            .ok_or_else(|| Error::Internal("checkpoint before destination set".to_string()))?;

        self.checkpoints
            .save(&Checkpoint {
                transfer_id: offer.transfer_id,
                file_path: dest,
                file_size: offer.file_size,
                bytes_confirmed: offset,
                content_hash: crate::crypto::to_hex(&hasher.clone().finalize()),
                updated_at: chrono::Utc::now(),
            })
            .await
    }

    async fn send_error_via(
        &self,
        writer: &Arc<tokio::sync::Mutex<OwnedWriteHalf>>,
        code: &str,
        message: &str,
    ) {
        let payload = ErrorPayload {
            code: code.to_string(),
            message: message.to_string(),
        };
        if let Ok(bytes) = protocol::encode_payload(&payload) {
            let mut w = writer.lock().await;
            let _ = protocol::write_frame(&mut *w, MessageType::Error, &bytes).await;
        }
    }
}

/// Forward local pause/resume commands to the sender as control frames.
fn spawn_control_forwarder(
    writer: Arc<tokio::sync::Mutex<OwnedWriteHalf>>,
    shared: Arc<TransferShared>,
    mut rx: watch::Receiver<Control>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut announced = false;
        loop {
            if rx.changed().await.is_err() {
                break;
            }
            let c = *rx.borrow_and_update();
            if c.local == Desired::Cancelled {
                // The main loop sends the Cancel frame.
                break;
            }

            let want = c.local == Desired::Paused;
            if want == announced {
                continue;
            }

            let msg = if want {
                MessageType::Pause
            } else {
                MessageType::Resume
            };
            {
                let mut w = writer.lock().await;
                if protocol::write_frame(&mut *w, msg, &[]).await.is_err() {
                    break;
                }
            }
            announced = want;

            if want {
                if c.remote != RemoteState::Paused {
                    shared.set_paused(false);
                }
            } else if c.remote == RemoteState::Paused {
                shared.set_paused(true);
            } else {
                shared.set_state(TransferState::Transferring);
            }
        }
    })
}

async fn send_error(stream: &mut TcpStream, code: &str, message: &str) {
    let payload = ErrorPayload {
        code: code.to_string(),
        message: message.to_string(),
    };
    if let Ok(bytes) = protocol::encode_payload(&payload) {
        let _ = protocol::write_frame(stream, MessageType::Error, &bytes).await;
    }
}

/// Hash the first `len` bytes of a file. Returns `None` if the file does
/// not exist or is shorter than `len`.
async fn hash_file_prefix(path: &std::path::Path, len: u64) -> Result<Option<Sha256>> {
    let Ok(metadata) = fs::metadata(path).await else {
        return Ok(None);
    };
    if metadata.len() < len {
        return Ok(None);
    }

    let mut file = fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    let mut remaining = len;

    while remaining > 0 {
        #[allow(clippy::cast_possible_truncation)]
        let want = remaining.min(buf.len() as u64) as usize;
        let n = file.read(&mut buf[..want]).await?;
        if n == 0 {
            return Ok(None);
        }
        hasher.update(&buf[..n]);
        remaining -= n as u64;
    }

    Ok(Some(hasher))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_speed_tracker_window() {
        let mut tracker = SpeedTracker::new(Duration::from_secs(2));
        let start = Instant::now();

        tracker.record(1_000_000, start);
        tracker.record(1_000_000, start + Duration::from_secs(1));

        let speed = tracker.speed_bps(start + Duration::from_secs(1));
        assert!(speed > 0.0);

        // Both samples fall out of the window.
        let later = start + Duration::from_secs(10);
        assert!((tracker.speed_bps(later) - 0.0).abs() < f64::EPSILON);
        assert!(tracker.eta_seconds(1_000_000, later).is_none());
    }

    #[test]
    fn test_transfer_state_terminality() {
        assert!(TransferState::Completed.is_terminal());
        assert!(TransferState::Failed.is_terminal());
        assert!(TransferState::Cancelled.is_terminal());
        assert!(TransferState::Rejected.is_terminal());

        assert!(!TransferState::Pending.is_terminal());
        assert!(!TransferState::Transferring.is_terminal());
        assert!(!TransferState::Paused.is_terminal());
    }

    #[test]
    fn test_shared_state_transitions_emit_events() {
        let (events, mut rx) = broadcast::channel(16);
        let info = TransferInfo::new(
            Uuid::new_v4(),
            TransferDirection::Sending,
            Uuid::new_v4(),
            "Peer".to_string(),
            "file.bin".to_string(),
            1024,
        );
        let (shared, _control_rx) = TransferShared::new(info, events);

        shared.set_state(TransferState::Connecting);
        match rx.try_recv().expect("state event") {
            Event::TransferState(info) => assert_eq!(info.state, TransferState::Connecting),
            other => panic!("expected state event, got {other:?}"),
        }

        // Same state again is not re-emitted.
        shared.set_state(TransferState::Connecting);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_set_paused_tracks_ownership() {
        let (events, _rx) = broadcast::channel(16);
        let info = TransferInfo::new(
            Uuid::new_v4(),
            TransferDirection::Receiving,
            Uuid::new_v4(),
            "Peer".to_string(),
            "file.bin".to_string(),
            1024,
        );
        let (shared, _control_rx) = TransferShared::new(info, events);

        shared.set_paused(true);
        let snap = shared.snapshot();
        assert_eq!(snap.state, TransferState::Paused);
        assert!(snap.paused_by_peer);

        shared.set_paused(false);
        assert!(!shared.snapshot().paused_by_peer);

        shared.set_state(TransferState::Transferring);
        assert!(!shared.snapshot().paused_by_peer);
    }

    #[test]
    fn test_control_signals() {
        let (events, _rx) = broadcast::channel(16);
        let info = TransferInfo::new(
            Uuid::new_v4(),
            TransferDirection::Sending,
            Uuid::new_v4(),
            "Peer".to_string(),
            "file.bin".to_string(),
            1024,
        );
        let (shared, mut control_rx) = TransferShared::new(info, events);

        shared.signal_local(Desired::Paused);
        let c = *control_rx.borrow_and_update();
        assert_eq!(c.local, Desired::Paused);
        assert_eq!(c.remote, RemoteState::Running);

        shared.signal_remote(RemoteState::Cancelled);
        let c = *control_rx.borrow_and_update();
        assert_eq!(c.local, Desired::Paused);
        assert_eq!(c.remote, RemoteState::Cancelled);
    }

    #[tokio::test]
    async fn test_handshake_over_loopback() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.expect("accept");
            handshake_responder(&mut stream).await.expect("responder")
        });

        let mut client = TcpStream::connect(addr).await.expect("connect");
        let (mut seal, _open) = handshake_initiator(&mut client).await.expect("initiator");
        let (_peer_seal, mut peer_open) = server.await.expect("join");

        let sealed = seal.seal(b"hello").expect("seal");
        assert_eq!(peer_open.open(&sealed).expect("open"), b"hello");
    }
}
