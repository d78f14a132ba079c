//! The engine ties discovery, transfers, identity, and settings together
//! behind one handle.
//!
//! Frontends drive it with commands (send, accept, pause, ...) and observe
//! it through a broadcast event stream, so any number of UIs can watch the
//! same engine.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::broadcast;
use uuid::Uuid;

use crate::config::Settings;
use crate::discovery::{Announcement, DiscoveryService, Peer};
use crate::error::{Error, Result};
use crate::event::Event;
use crate::identity::DeviceIdentity;
use crate::transfer::checkpoint::{Checkpoint, CheckpointStore};
use crate::transfer::manager::TransferManager;
use crate::transfer::TransferInfo;
use crate::trust::TrustStore;

/// Event channel capacity. Slow subscribers lag rather than block the
/// engine.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// A running Lanbooth engine.
pub struct Engine {
    settings: Arc<StdMutex<Settings>>,
    settings_path: PathBuf,
    identity: Arc<DeviceIdentity>,
    discovery: DiscoveryService,
    manager: TransferManager,
    checkpoints: Arc<CheckpointStore>,
    events: broadcast::Sender<Event>,
}

impl Engine {
    /// Start the engine with settings loaded from the default locations.
    ///
    /// # Errors
    ///
    /// Returns an error if settings, identity, or state files cannot be
    /// read, or if the network sockets cannot be bound.
    pub async fn start() -> Result<Self> {
        let settings_path = Settings::default_path()?;
        let settings = Settings::load_from(&settings_path)?;
        let data_dir = Self::default_data_dir()?;
        Self::start_in(settings, settings_path, &data_dir).await
    }

    /// Start the engine with explicit settings and directories.
    ///
    /// # Errors
    ///
    /// Returns an error if identity or state files cannot be read, or if
    /// the network sockets cannot be bound.
    pub async fn start_in(
        settings: Settings,
        settings_path: PathBuf,
        data_dir: &Path,
    ) -> Result<Self> {
        tokio::fs::create_dir_all(data_dir).await?;

        let identity = Arc::new(DeviceIdentity::load_or_generate(&DeviceIdentity::path_in(
            data_dir,
        ))?);
        let trust = Arc::new(TrustStore::open(TrustStore::path_in(data_dir))?);
        let checkpoints = Arc::new(CheckpointStore::open(CheckpointStore::path_in(data_dir)).await?);

        tracing::info!(
            device_id = %identity.device_id(),
            device_name = %settings.device_name,
            "starting engine"
        );

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let settings = Arc::new(StdMutex::new(settings));

        let manager = TransferManager::start(
            Arc::clone(&settings),
            Arc::clone(&identity),
            Arc::clone(&trust),
            Arc::clone(&checkpoints),
            events.clone(),
        )
        .await?;

        let (device_name, discovery_port, broadcast_interval, peer_timeout) = {
            let s = settings
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            (
                s.device_name.clone(),
                s.discovery_port,
                s.broadcast_interval(),
                s.peer_timeout(),
            )
        };

        // Announce the port the listener actually got, not the configured
        // one, which may have been 0.
        let announcement = Announcement::new(
            identity.device_id(),
            &device_name,
            &identity.public_key_b64(),
            manager.local_addr().port(),
        );
        let discovery = DiscoveryService::start(
            announcement,
            discovery_port,
            broadcast_interval,
            peer_timeout,
            Arc::clone(&trust),
            events.clone(),
        )
        .await?;

        let cleanup_store = Arc::clone(&checkpoints);
        tokio::spawn(async move {
            match cleanup_store.cleanup_expired().await {
                Ok(0) => {}
                Ok(n) => tracing::info!(count = n, "removed expired checkpoints"),
                Err(e) => tracing::warn!(error = %e, "checkpoint cleanup failed"),
            }
        });

        Ok(Self {
            settings,
            settings_path,
            identity,
            discovery,
            manager,
            checkpoints,
            events,
        })
    }

    fn default_data_dir() -> Result<PathBuf> {
        let dirs = directories::ProjectDirs::from("", "", "lanbooth")
            .ok_or_else(|| Error::ConfigError("could not determine data directory".into()))?;
        Ok(dirs.data_dir().to_path_buf())
    }

    /// Subscribe to the engine's event stream.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    /// This device's stable identifier.
    #[must_use]
    pub fn device_id(&self) -> Uuid {
        self.identity.device_id()
    }

    /// Peers currently visible on the network.
    #[must_use]
    pub fn list_devices(&self) -> Vec<Peer> {
        self.discovery.peers()
    }

    /// Look up a visible peer.
    #[must_use]
    pub fn device(&self, device_id: Uuid) -> Option<Peer> {
        self.discovery.peer(device_id)
    }

    /// All known transfers, live and finished.
    #[must_use]
    pub fn list_transfers(&self) -> Vec<TransferInfo> {
        self.manager.transfers()
    }

    /// One transfer's snapshot.
    #[must_use]
    pub fn transfer(&self, transfer_id: Uuid) -> Option<TransferInfo> {
        self.manager.transfer(transfer_id)
    }

    /// Send files to a currently visible peer.
    ///
    /// # Errors
    ///
    /// Returns an error if the peer is not visible or a path does not name
    /// a readable file.
    pub async fn send_files(
        &self,
        peer_id: Uuid,
        paths: Vec<PathBuf>,
    ) -> Result<Vec<TransferInfo>> {
        let peer = self
            .discovery
            .peer(peer_id)
            .ok_or(Error::PeerNotFound(peer_id))?;
        self.manager.send_files(&peer, paths).await
    }

    /// Accept an inbound transfer that is awaiting a decision.
    ///
    /// # Errors
    ///
    /// Returns an error if the transfer is unknown or not awaiting a
    /// decision.
    pub fn accept_transfer(&self, transfer_id: Uuid) -> Result<()> {
        self.manager.accept(transfer_id)
    }

    /// Reject an inbound transfer that is awaiting a decision.
    ///
    /// # Errors
    ///
    /// Returns an error if the transfer is unknown or not awaiting a
    /// decision.
    pub fn reject_transfer(&self, transfer_id: Uuid) -> Result<()> {
        self.manager.reject(transfer_id)
    }

    /// Pause an active transfer.
    ///
    /// # Errors
    ///
    /// Returns an error if the transfer is unknown or not transferring.
    pub fn pause_transfer(&self, transfer_id: Uuid) -> Result<()> {
        self.manager.pause(transfer_id)
    }

    /// Resume a transfer this side paused.
    ///
    /// # Errors
    ///
    /// Returns an error if the transfer is unknown, not paused, or paused
    /// by the peer.
    pub fn resume_transfer(&self, transfer_id: Uuid) -> Result<()> {
        self.manager.resume(transfer_id)
    }

    /// Cancel a transfer.
    ///
    /// # Errors
    ///
    /// Returns an error if the transfer is unknown or already finished.
    pub fn cancel_transfer(&self, transfer_id: Uuid) -> Result<()> {
        self.manager.cancel(transfer_id)
    }

    /// Checkpoints of interrupted inbound transfers, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the checkpoint directory cannot be read.
    pub async fn resumable_transfers(&self) -> Result<Vec<Checkpoint>> {
        self.checkpoints.list().await
    }

    /// Current settings.
    #[must_use]
    pub fn settings(&self) -> Settings {
        self.settings
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Persist new settings and apply them to future transfers. Discovery
    /// and the transfer listener keep their current ports until restart.
    ///
    /// # Errors
    ///
    /// Returns an error if the settings file cannot be written.
    pub fn update_settings(&self, new_settings: Settings) -> Result<()> {
        new_settings.save_to(&self.settings_path)?;
        {
            let mut settings = self
                .settings
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            *settings = new_settings;
        }
        tracing::info!("settings updated");
        Ok(())
    }

    /// Stop discovery, close the listener, and cancel running transfers.
    pub fn shutdown(&self) {
        tracing::info!("engine shutting down");
        self.discovery.stop();
        self.manager.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_engine(dir: &Path, discovery_port: u16) -> Engine {
        let mut settings = Settings::default();
        settings.device_name = "test-engine".to_string();
        settings.transfer_port = 0;
        settings.discovery_port = discovery_port;
        settings.save_dir = dir.join("downloads");

        Engine::start_in(settings, dir.join("config.toml"), dir)
            .await
            .expect("engine start")
    }

    #[tokio::test]
    async fn test_engine_starts_and_shuts_down() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = test_engine(dir.path(), 0).await;

        assert!(engine.list_devices().is_empty());
        assert!(engine.list_transfers().is_empty());
        assert!(engine
            .resumable_transfers()
            .await
            .expect("checkpoints")
            .is_empty());

        engine.shutdown();
    }

    #[tokio::test]
    async fn test_send_to_unknown_peer() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = test_engine(dir.path(), 0).await;

        let result = engine
            .send_files(Uuid::new_v4(), vec![dir.path().join("file.bin")])
            .await;
        assert!(matches!(result, Err(Error::PeerNotFound(_))));

        engine.shutdown();
    }

    #[tokio::test]
    async fn test_identity_is_stable_across_restarts() {
        let dir = tempfile::tempdir().expect("tempdir");

        let first = test_engine(dir.path(), 0).await;
        let id = first.device_id();
        first.shutdown();

        let second = test_engine(dir.path(), 0).await;
        assert_eq!(second.device_id(), id);
        second.shutdown();
    }

    #[tokio::test]
    async fn test_update_settings_persists() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = test_engine(dir.path(), 0).await;

        let mut settings = engine.settings();
        settings.device_name = "renamed".to_string();
        engine.update_settings(settings).expect("update");

        assert_eq!(engine.settings().device_name, "renamed");
        let reloaded = Settings::load_from(&dir.path().join("config.toml")).expect("reload");
        assert_eq!(reloaded.device_name, "renamed");

        engine.shutdown();
    }
}
