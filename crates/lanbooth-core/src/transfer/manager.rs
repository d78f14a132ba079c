//! Transfer orchestration.
//!
//! The manager owns the inbound TCP listener, the registry of live and
//! finished transfers, and the per-peer concurrency slots. Commands
//! (accept, reject, pause, resume, cancel) are validated against the
//! transfer's current state here and delivered to the transfer task
//! through its control channel.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::net::TcpListener;
use tokio::sync::{broadcast, oneshot, Semaphore};
use uuid::Uuid;

use crate::config::Settings;
use crate::discovery::Peer;
use crate::error::{Error, Result};
use crate::event::Event;
use crate::identity::DeviceIdentity;
use crate::trust::TrustStore;

use super::checkpoint::CheckpointStore;
use super::{
    Decision, Desired, ReceiverJob, RegisterFn, SenderJob, TransferDirection, TransferInfo,
    TransferShared, TransferState,
};

struct TransferEntry {
    shared: Arc<TransferShared>,
    /// Present while an inbound offer awaits an accept/reject decision.
    decision_tx: Option<oneshot::Sender<Decision>>,
}

struct ManagerInner {
    registry: StdMutex<HashMap<Uuid, TransferEntry>>,
    peer_slots: StdMutex<HashMap<Uuid, Arc<Semaphore>>>,
    settings: Arc<StdMutex<Settings>>,
    identity: Arc<DeviceIdentity>,
    trust: Arc<TrustStore>,
    checkpoints: Arc<CheckpointStore>,
    events: broadcast::Sender<Event>,
}

impl ManagerInner {
    fn lock_registry(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, TransferEntry>> {
        self.registry
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn settings_snapshot(&self) -> Settings {
        self.settings
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Slot semaphore for a peer, created on first use. Capacity is fixed
    /// when the semaphore is created; a later settings change applies to
    /// peers seen after it.
    fn peer_slots(&self, peer_id: Uuid, capacity: usize) -> Arc<Semaphore> {
        let mut slots = self
            .peer_slots
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Arc::clone(
            slots
                .entry(peer_id)
                .or_insert_with(|| Arc::new(Semaphore::new(capacity))),
        )
    }

    fn register_inbound(&self, shared: Arc<TransferShared>) -> Result<oneshot::Receiver<Decision>> {
        let id = shared.transfer_id();
        let mut registry = self.lock_registry();
        if registry.contains_key(&id) {
            return Err(Error::ProtocolError(format!(
                "transfer {id} is already registered"
            )));
        }

        let (tx, rx) = oneshot::channel();
        registry.insert(
            id,
            TransferEntry {
                shared,
                decision_tx: Some(tx),
            },
        );
        Ok(rx)
    }
}

/// Owns all transfers, inbound and outbound.
pub struct TransferManager {
    inner: Arc<ManagerInner>,
    local_addr: SocketAddr,
    shutdown_tx: broadcast::Sender<()>,
}

impl TransferManager {
    /// Bind the transfer listener and start accepting inbound connections.
    ///
    /// # Errors
    ///
    /// Returns an error if the transfer port cannot be bound.
    pub async fn start(
        settings: Arc<StdMutex<Settings>>,
        identity: Arc<DeviceIdentity>,
        trust: Arc<TrustStore>,
        checkpoints: Arc<CheckpointStore>,
        events: broadcast::Sender<Event>,
    ) -> Result<Self> {
        let port = settings
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .transfer_port;
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!(addr = %local_addr, "transfer listener started");

        let inner = Arc::new(ManagerInner {
            registry: StdMutex::new(HashMap::new()),
            peer_slots: StdMutex::new(HashMap::new()),
            settings,
            identity,
            trust,
            checkpoints,
            events,
        });

        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);

        let accept_inner = Arc::clone(&inner);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, peer_addr)) => {
                                tracing::debug!(peer = %peer_addr, "inbound transfer connection");
                                spawn_receiver(&accept_inner, stream);
                            }
                            Err(e) => {
                                tracing::warn!(error = %e, "failed to accept connection");
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        tracing::info!("transfer listener stopped");
                        break;
                    }
                }
            }
        });

        Ok(Self {
            inner,
            local_addr,
            shutdown_tx,
        })
    }

    /// The address the transfer listener is bound to.
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Queue a file to send to a peer. The transfer starts as soon as one
    /// of the peer's slots frees up.
    ///
    /// # Errors
    ///
    /// Returns an error if the path does not name a readable file.
    pub async fn send_file(&self, peer: &Peer, path: PathBuf) -> Result<TransferInfo> {
        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(|_| Error::FileNotFound(path.display().to_string()))?;
        if !metadata.is_file() {
            return Err(Error::FileNotFound(path.display().to_string()));
        }
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(ToString::to_string)
            .ok_or_else(|| Error::FileNotFound(path.display().to_string()))?;

        let settings = self.inner.settings_snapshot();
        let info = TransferInfo::new(
            Uuid::new_v4(),
            TransferDirection::Sending,
            peer.device_id,
            peer.device_name.clone(),
            file_name,
            metadata.len(),
        );
        let (shared, control_rx) = TransferShared::new(info, self.inner.events.clone());

        {
            let mut registry = self.inner.lock_registry();
            registry.insert(
                shared.transfer_id(),
                TransferEntry {
                    shared: Arc::clone(&shared),
                    decision_tx: None,
                },
            );
        }

        let job = SenderJob {
            shared: Arc::clone(&shared),
            control_rx,
            peer_addr: peer.transfer_addr(),
            peer_device_id: peer.device_id,
            expected_peer_key: peer.public_key.clone(),
            file_path: path,
            device_name: settings.device_name,
            identity: Arc::clone(&self.inner.identity),
            trust: Arc::clone(&self.inner.trust),
            chunk_size: settings.chunk_size,
            slots: self
                .inner
                .peer_slots(peer.device_id, settings.max_concurrent_per_peer),
        };

        let snapshot = shared.snapshot();
        let _ = self.inner.events.send(Event::TransferState(snapshot.clone()));
        tokio::spawn(job.run());

        Ok(snapshot)
    }

    /// Queue several files to the same peer.
    ///
    /// # Errors
    ///
    /// Fails on the first path that does not name a readable file; files
    /// queued before it keep going.
    pub async fn send_files(&self, peer: &Peer, paths: Vec<PathBuf>) -> Result<Vec<TransferInfo>> {
        let mut transfers = Vec::with_capacity(paths.len());
        for path in paths {
            transfers.push(self.send_file(peer, path).await?);
        }
        Ok(transfers)
    }

    /// Accept an inbound transfer that is awaiting a decision.
    ///
    /// # Errors
    ///
    /// Returns an error if the transfer is unknown or not awaiting a
    /// decision.
    pub fn accept(&self, transfer_id: Uuid) -> Result<()> {
        self.decide(transfer_id, Decision::Accept, "accept")
    }

    /// Reject an inbound transfer that is awaiting a decision.
    ///
    /// # Errors
    ///
    /// Returns an error if the transfer is unknown or not awaiting a
    /// decision.
    pub fn reject(&self, transfer_id: Uuid) -> Result<()> {
        self.decide(transfer_id, Decision::Reject, "reject")
    }

    fn decide(&self, transfer_id: Uuid, decision: Decision, command: &'static str) -> Result<()> {
        let mut registry = self.inner.lock_registry();
        let entry = registry
            .get_mut(&transfer_id)
            .ok_or(Error::TransferNotFound(transfer_id))?;

        // Only an inbound offer sitting in front of the user can be
        // decided; the same state on the sending side carries no decision
        // channel.
        let state = entry.shared.snapshot().state;
        if state != TransferState::AwaitingAcceptance {
            return Err(Error::InvalidState {
                command,
                state: state.as_str().to_string(),
            });
        }
        let tx = entry.decision_tx.take().ok_or(Error::InvalidState {
            command,
            state: state.as_str().to_string(),
        })?;

        tx.send(decision).map_err(|_| Error::InvalidState {
            command,
            state: state.as_str().to_string(),
        })
    }

    /// Pause an active transfer.
    ///
    /// # Errors
    ///
    /// Returns an error if the transfer is unknown or not transferring.
    pub fn pause(&self, transfer_id: Uuid) -> Result<()> {
        let shared = self.lookup(transfer_id)?;
        let snapshot = shared.snapshot();
        if snapshot.state != TransferState::Transferring {
            return Err(Error::InvalidState {
                command: "pause",
                state: snapshot.state.as_str().to_string(),
            });
        }
        shared.signal_local(Desired::Paused);
        Ok(())
    }

    /// Resume a transfer this side paused. A pause owned by the peer can
    /// only be lifted by the peer.
    ///
    /// # Errors
    ///
    /// Returns an error if the transfer is unknown, not paused, or paused
    /// by the peer.
    pub fn resume(&self, transfer_id: Uuid) -> Result<()> {
        let shared = self.lookup(transfer_id)?;
        let snapshot = shared.snapshot();
        if snapshot.state != TransferState::Paused {
            return Err(Error::InvalidState {
                command: "resume",
                state: snapshot.state.as_str().to_string(),
            });
        }
        if snapshot.paused_by_peer {
            return Err(Error::InvalidState {
                command: "resume",
                state: "paused by peer".to_string(),
            });
        }
        shared.signal_local(Desired::Running);
        Ok(())
    }

    /// Cancel a transfer in any non-terminal state.
    ///
    /// # Errors
    ///
    /// Returns an error if the transfer is unknown or already finished.
    pub fn cancel(&self, transfer_id: Uuid) -> Result<()> {
        let decision_tx = {
            let mut registry = self.inner.lock_registry();
            let entry = registry
                .get_mut(&transfer_id)
                .ok_or(Error::TransferNotFound(transfer_id))?;

            let state = entry.shared.snapshot().state;
            if state.is_terminal() {
                return Err(Error::InvalidState {
                    command: "cancel",
                    state: state.as_str().to_string(),
                });
            }

            entry.shared.signal_local(Desired::Cancelled);
            entry.decision_tx.take()
        };

        // An undecided inbound offer is parked on the decision channel.
        if let Some(tx) = decision_tx {
            let _ = tx.send(Decision::Cancel);
        }
        Ok(())
    }

    fn lookup(&self, transfer_id: Uuid) -> Result<Arc<TransferShared>> {
        self.inner
            .lock_registry()
            .get(&transfer_id)
            .map(|entry| Arc::clone(&entry.shared))
            .ok_or(Error::TransferNotFound(transfer_id))
    }

    /// Snapshot of every known transfer, live and finished.
    #[must_use]
    pub fn transfers(&self) -> Vec<TransferInfo> {
        self.inner
            .lock_registry()
            .values()
            .map(|entry| entry.shared.snapshot())
            .collect()
    }

    /// Snapshot of one transfer.
    #[must_use]
    pub fn transfer(&self, transfer_id: Uuid) -> Option<TransferInfo> {
        self.inner
            .lock_registry()
            .get(&transfer_id)
            .map(|entry| entry.shared.snapshot())
    }

    /// Stop the listener and cancel every transfer still running.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(());

        let pending: Vec<_> = {
            let mut registry = self.inner.lock_registry();
            registry
                .values_mut()
                .filter(|entry| !entry.shared.snapshot().state.is_terminal())
                .map(|entry| {
                    entry.shared.signal_local(Desired::Cancelled);
                    entry.decision_tx.take()
                })
                .collect()
        };
        for tx in pending.into_iter().flatten() {
            let _ = tx.send(Decision::Cancel);
        }
    }
}

fn spawn_receiver(inner: &Arc<ManagerInner>, stream: tokio::net::TcpStream) {
    let settings = inner.settings_snapshot();
    let idle_timeout = settings.chunk_idle_timeout();

    let register_inner = Arc::clone(inner);
    let register: RegisterFn = Box::new(move |shared| register_inner.register_inbound(shared));

    let job = ReceiverJob::new(
        stream,
        settings.save_dir,
        settings.device_name,
        Arc::clone(&inner.identity),
        Arc::clone(&inner.trust),
        Arc::clone(&inner.checkpoints),
        inner.events.clone(),
        settings.keep_partial_on_cancel,
        idle_timeout,
        register,
    );
    tokio::spawn(job.run());
}
