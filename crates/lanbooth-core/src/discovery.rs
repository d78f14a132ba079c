//! Peer discovery over UDP broadcast.
//!
//! Every device periodically broadcasts a small JSON announcement on the
//! discovery port and listens for announcements from others. A peer table
//! tracks who is currently alive; peers that stop announcing are evicted
//! after a silence window and reported exactly once as lost.
//!
//! Announcements carry a protocol version and are decoded leniently, so
//! newer devices can add fields without breaking older ones. Malformed
//! datagrams are dropped silently.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::Result;
use crate::event::Event;
use crate::trust::TrustStore;

/// Announcement datagram broadcast by every device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Announcement {
    /// Application identifier (always "lanbooth")
    pub app: String,
    /// Protocol version string
    pub protocol_version: String,
    /// Unique device identifier
    pub device_id: Uuid,
    /// Device display name
    pub device_name: String,
    /// Operating system name
    pub platform: String,
    /// Base64-encoded Ed25519 identity public key
    pub public_key: String,
    /// Port the device accepts transfer connections on
    pub transfer_port: u16,
}

impl Announcement {
    /// Create a new announcement for this device.
    #[must_use]
    pub fn new(
        device_id: Uuid,
        device_name: &str,
        public_key: &str,
        transfer_port: u16,
    ) -> Self {
        Self {
            app: "lanbooth".to_string(),
            protocol_version: "1.0".to_string(),
            device_id,
            device_name: device_name.to_string(),
            platform: std::env::consts::OS.to_string(),
            public_key: public_key.to_string(),
            transfer_port,
        }
    }

    /// Check whether this announcement came from a compatible device.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.app == "lanbooth" && self.protocol_version.starts_with("1.")
    }
}

/// A peer currently visible on the network.
#[derive(Debug, Clone, Serialize)]
pub struct Peer {
    /// Stable device identifier
    pub device_id: Uuid,
    /// Display name
    pub device_name: String,
    /// Address the peer announced from
    pub ip_address: IpAddr,
    /// Port the peer accepts transfer connections on
    pub transfer_port: u16,
    /// Operating system name
    pub platform: String,
    /// Base64-encoded Ed25519 identity public key
    pub public_key: String,
    /// When the last announcement arrived
    pub last_seen: DateTime<Utc>,
    /// Whether this peer's identity key is in the trust store
    pub is_trusted: bool,
}

impl Peer {
    /// The address to open transfer connections to.
    #[must_use]
    pub const fn transfer_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip_address, self.transfer_port)
    }
}

/// Outcome of applying an announcement to the peer table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// First announcement from this device
    New,
    /// A displayed field changed (name, address, port, trust)
    Updated,
    /// Same as before, only liveness refreshed
    Refreshed,
}

struct PeerEntry {
    peer: Peer,
    seen: Instant,
}

/// In-memory table of live peers.
///
/// Kept separate from the socket plumbing so the liveness semantics can be
/// tested without a network.
#[derive(Default)]
pub struct PeerTable {
    entries: HashMap<Uuid, PeerEntry>,
}

impl PeerTable {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply an announcement, returning whether anything visible changed.
    pub fn upsert(
        &mut self,
        announcement: &Announcement,
        source_ip: IpAddr,
        is_trusted: bool,
        now: Instant,
    ) -> UpsertOutcome {
        let peer = Peer {
            device_id: announcement.device_id,
            device_name: announcement.device_name.clone(),
            ip_address: source_ip,
            transfer_port: announcement.transfer_port,
            platform: announcement.platform.clone(),
            public_key: announcement.public_key.clone(),
            last_seen: Utc::now(),
            is_trusted,
        };

        match self.entries.get_mut(&announcement.device_id) {
            None => {
                self.entries
                    .insert(announcement.device_id, PeerEntry { peer, seen: now });
                UpsertOutcome::New
            }
            Some(entry) => {
                let changed = entry.peer.device_name != peer.device_name
                    || entry.peer.ip_address != peer.ip_address
                    || entry.peer.transfer_port != peer.transfer_port
                    || entry.peer.is_trusted != peer.is_trusted;
                entry.peer = peer;
                entry.seen = now;
                if changed {
                    UpsertOutcome::Updated
                } else {
                    UpsertOutcome::Refreshed
                }
            }
        }
    }

    /// Evict peers silent for longer than `timeout`, returning them.
    pub fn sweep(&mut self, timeout: Duration, now: Instant) -> Vec<Peer> {
        let expired: Vec<Uuid> = self
            .entries
            .iter()
            .filter(|(_, entry)| now.duration_since(entry.seen) > timeout)
            .map(|(id, _)| *id)
            .collect();

        expired
            .into_iter()
            .filter_map(|id| self.entries.remove(&id).map(|e| e.peer))
            .collect()
    }

    /// Snapshot of all live peers.
    #[must_use]
    pub fn peers(&self) -> Vec<Peer> {
        self.entries.values().map(|e| e.peer.clone()).collect()
    }

    /// Look up a peer by device id.
    #[must_use]
    pub fn get(&self, device_id: Uuid) -> Option<Peer> {
        self.entries.get(&device_id).map(|e| e.peer.clone())
    }
}

/// Continuous discovery service: announce, listen, and sweep.
pub struct DiscoveryService {
    table: Arc<Mutex<PeerTable>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl DiscoveryService {
    /// Start announcing and listening.
    ///
    /// Spawns three background tasks (broadcast, receive, sweep) that run
    /// until [`DiscoveryService::stop`] is called.
    ///
    /// # Errors
    ///
    /// Returns an error if the UDP sockets cannot be created.
    pub async fn start(
        announcement: Announcement,
        port: u16,
        interval: Duration,
        peer_timeout: Duration,
        trust: Arc<TrustStore>,
        events: broadcast::Sender<Event>,
    ) -> Result<Self> {
        let send_socket = Self::bind_broadcast_socket()?;
        let recv_socket = Self::bind_listen_socket(port)?;

        let table = Arc::new(Mutex::new(PeerTable::new()));
        let (shutdown_tx, _) = broadcast::channel(1);

        Self::spawn_broadcast_loop(
            send_socket,
            announcement.clone(),
            port,
            interval,
            shutdown_tx.subscribe(),
        );
        Self::spawn_recv_loop(
            recv_socket,
            announcement.device_id,
            Arc::clone(&table),
            trust,
            events.clone(),
            shutdown_tx.subscribe(),
        );
        Self::spawn_sweep_loop(
            Arc::clone(&table),
            peer_timeout,
            events,
            shutdown_tx.subscribe(),
        );

        Ok(Self { table, shutdown_tx })
    }

    fn bind_broadcast_socket() -> Result<UdpSocket> {
        let socket = socket2::Socket::new(
            socket2::Domain::IPV4,
            socket2::Type::DGRAM,
            Some(socket2::Protocol::UDP),
        )?;

        socket.set_broadcast(true)?;
        socket.set_reuse_address(true)?;

        #[cfg(target_os = "macos")]
        socket.set_reuse_port(true)?;

        let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0);
        socket.bind(&addr.into())?;
        socket.set_nonblocking(true)?;

        let std_socket: std::net::UdpSocket = socket.into();
        Ok(UdpSocket::from_std(std_socket)?)
    }

    fn bind_listen_socket(port: u16) -> Result<UdpSocket> {
        let socket = socket2::Socket::new(
            socket2::Domain::IPV4,
            socket2::Type::DGRAM,
            Some(socket2::Protocol::UDP),
        )?;

        socket.set_reuse_address(true)?;

        #[cfg(target_os = "macos")]
        socket.set_reuse_port(true)?;

        let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
        socket.bind(&addr.into())?;
        socket.set_nonblocking(true)?;

        let std_socket: std::net::UdpSocket = socket.into();
        Ok(UdpSocket::from_std(std_socket)?)
    }

    fn spawn_broadcast_loop(
        socket: UdpSocket,
        announcement: Announcement,
        port: u16,
        interval: Duration,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        tokio::spawn(async move {
            let broadcast_addr = SocketAddrV4::new(Ipv4Addr::BROADCAST, port);
            let json = match serde_json::to_vec(&announcement) {
                Ok(json) => json,
                Err(e) => {
                    tracing::error!("failed to serialize announcement: {}", e);
                    return;
                }
            };

            loop {
                if let Err(e) = socket.send_to(&json, broadcast_addr).await {
                    tracing::warn!("failed to send announcement: {}", e);
                }

                tokio::select! {
                    () = tokio::time::sleep(interval) => {}
                    _ = shutdown_rx.recv() => {
                        tracing::debug!("discovery broadcaster shutting down");
                        break;
                    }
                }
            }
        });
    }

    fn spawn_recv_loop(
        socket: UdpSocket,
        own_device_id: Uuid,
        table: Arc<Mutex<PeerTable>>,
        trust: Arc<TrustStore>,
        events: broadcast::Sender<Event>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        tokio::spawn(async move {
            let mut buf = [0u8; 4096];

            loop {
                let (len, source) = tokio::select! {
                    result = socket.recv_from(&mut buf) => match result {
                        Ok(pair) => pair,
                        Err(e) => {
                            tracing::warn!("error receiving announcement: {}", e);
                            continue;
                        }
                    },
                    _ = shutdown_rx.recv() => {
                        tracing::debug!("discovery listener shutting down");
                        break;
                    }
                };

                let Ok(announcement) = serde_json::from_slice::<Announcement>(&buf[..len]) else {
                    tracing::debug!("dropping malformed announcement from {}", source);
                    continue;
                };

                if !announcement.is_valid() || announcement.device_id == own_device_id {
                    continue;
                }

                let is_trusted = trust.is_trusted(&announcement.public_key);
                let outcome = {
                    let mut table = table.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                    table.upsert(&announcement, source.ip(), is_trusted, Instant::now())
                };

                if matches!(outcome, UpsertOutcome::New | UpsertOutcome::Updated) {
                    let peer = {
                        let table =
                            table.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                        table.get(announcement.device_id)
                    };
                    if let Some(peer) = peer {
                        tracing::info!(
                            device_id = %peer.device_id,
                            name = %peer.device_name,
                            "peer discovered"
                        );
                        let _ = events.send(Event::PeerDiscovered(peer));
                    }
                }
            }
        });
    }

    fn spawn_sweep_loop(
        table: Arc<Mutex<PeerTable>>,
        peer_timeout: Duration,
        events: broadcast::Sender<Event>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = tokio::time::sleep(Duration::from_secs(1)) => {}
                    _ = shutdown_rx.recv() => {
                        tracing::debug!("discovery sweeper shutting down");
                        break;
                    }
                }

                let lost = {
                    let mut table =
                        table.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                    table.sweep(peer_timeout, Instant::now())
                };

                for peer in lost {
                    tracing::info!(device_id = %peer.device_id, "peer lost");
                    let _ = events.send(Event::PeerLost(peer));
                }
            }
        });
    }

    /// Snapshot of all live peers.
    #[must_use]
    pub fn peers(&self) -> Vec<Peer> {
        self.table
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .peers()
    }

    /// Look up a live peer by device id.
    #[must_use]
    pub fn peer(&self, device_id: Uuid) -> Option<Peer> {
        self.table
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(device_id)
    }

    /// Stop all discovery tasks.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(());
    }
}
