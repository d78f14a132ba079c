//! Common test utilities for `Lanbooth` integration tests.

use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::broadcast;
use uuid::Uuid;

use lanbooth_core::config::Settings;
use lanbooth_core::discovery::Peer;
use lanbooth_core::event::Event;
use lanbooth_core::identity::DeviceIdentity;
use lanbooth_core::transfer::checkpoint::CheckpointStore;
use lanbooth_core::transfer::manager::TransferManager;
use lanbooth_core::transfer::{TransferInfo, TransferState};
use lanbooth_core::trust::TrustStore;

/// Create a temporary directory for test files.
pub fn create_temp_dir() -> tempfile::TempDir {
    tempfile::tempdir().expect("Failed to create temp directory")
}

/// Create a test file with the given content.
pub fn create_test_file(dir: &std::path::Path, name: &str, content: &[u8]) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, content).expect("Failed to write test file");
    path
}

/// Generate random bytes for testing.
pub fn random_bytes(size: usize) -> Vec<u8> {
    use rand::RngCore;
    let mut bytes = vec![0u8; size];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

/// Assert that two files have identical content.
pub fn assert_files_equal(path1: &std::path::Path, path2: &std::path::Path) {
    let content1 = std::fs::read(path1).expect("Failed to read first file");
    let content2 = std::fs::read(path2).expect("Failed to read second file");
    assert_eq!(content1, content2, "File contents differ");
}

/// One device under test: a transfer manager with its state directories
/// and the handles the engine would normally hold.
pub struct TestNode {
    pub manager: TransferManager,
    pub identity: Arc<DeviceIdentity>,
    pub trust: Arc<TrustStore>,
    pub checkpoints: Arc<CheckpointStore>,
    pub events: broadcast::Sender<Event>,
    pub save_dir: PathBuf,
    pub dir: tempfile::TempDir,
}

impl TestNode {
    /// Describe this node as a peer, the way discovery would.
    pub fn as_peer(&self) -> Peer {
        Peer {
            device_id: self.identity.device_id(),
            device_name: "Test Node".to_string(),
            ip_address: "127.0.0.1".parse().expect("loopback"),
            transfer_port: self.manager.local_addr().port(),
            platform: "test".to_string(),
            public_key: self.identity.public_key_b64(),
            last_seen: chrono::Utc::now(),
            is_trusted: false,
        }
    }
}

/// Start a node on an ephemeral port.
pub async fn start_node() -> TestNode {
    start_node_with(|_| {}).await
}

/// Start a node on an ephemeral port with adjusted settings.
pub async fn start_node_with(configure: impl FnOnce(&mut Settings)) -> TestNode {
    let dir = create_temp_dir();
    let save_dir = dir.path().join("downloads");
    std::fs::create_dir_all(&save_dir).expect("save dir");

    let mut settings = Settings::default();
    settings.transfer_port = 0;
    settings.save_dir = save_dir.clone();
    configure(&mut settings);

    let identity = Arc::new(DeviceIdentity::generate());
    let trust = Arc::new(TrustStore::open(dir.path().join("trust.json")).expect("trust store"));
    let checkpoints = Arc::new(
        CheckpointStore::open(dir.path().join("checkpoints"))
            .await
            .expect("checkpoint store"),
    );
    let (events, _) = broadcast::channel(256);

    let manager = TransferManager::start(
        Arc::new(StdMutex::new(settings)),
        Arc::clone(&identity),
        Arc::clone(&trust),
        Arc::clone(&checkpoints),
        events.clone(),
    )
    .await
    .expect("manager start");

    TestNode {
        manager,
        identity,
        trust,
        checkpoints,
        events,
        save_dir,
        dir,
    }
}

/// Wait until a transfer reaches the given state, panicking if it lands in
/// a different terminal state first.
pub async fn wait_for_state(
    manager: &TransferManager,
    transfer_id: Uuid,
    state: TransferState,
) -> TransferInfo {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let Some(info) = manager.transfer(transfer_id) {
                if info.state == state {
                    return info;
                }
                assert!(
                    !info.state.is_terminal(),
                    "transfer ended as {:?} while waiting for {:?} ({:?})",
                    info.state,
                    state,
                    info.error_message
                );
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for state {state:?}"))
}

/// Wait for an inbound offer to show up awaiting a decision.
pub async fn wait_for_inbound_request(manager: &TransferManager) -> TransferInfo {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let undecided = manager
                .transfers()
                .into_iter()
                .find(|t| t.state == TransferState::AwaitingAcceptance);
            if let Some(info) = undecided {
                return info;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("timed out waiting for an inbound request")
}
