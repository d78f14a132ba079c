//! Engine events.
//!
//! Every externally observable change in the engine is published as an
//! [`Event`] on a broadcast channel. Frontends subscribe via
//! [`crate::engine::Engine::subscribe`] and render the stream however they
//! like; the engine never blocks on slow consumers.

use serde::Serialize;

use crate::discovery::Peer;
use crate::transfer::TransferInfo;

/// An event emitted by the engine.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Event {
    /// A new peer appeared on the network, or a known peer's displayed
    /// fields changed.
    PeerDiscovered(Peer),
    /// A peer stopped announcing and was evicted from the peer table.
    PeerLost(Peer),
    /// An inbound transfer offer is waiting for an accept/reject decision.
    TransferRequest(TransferInfo),
    /// Byte counters, speed, and ETA for a running transfer.
    TransferProgress(TransferInfo),
    /// A transfer changed state.
    TransferState(TransferInfo),
    /// A human-readable notification.
    Notification(Notification),
}

/// Severity of a [`Notification`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationLevel {
    /// Informational
    Info,
    /// A transfer finished successfully
    Success,
    /// Something degraded but the engine keeps going
    Warning,
    /// A transfer or subsystem failed
    Error,
}

/// A human-readable notification for display to the user.
#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    /// Severity level
    pub level: NotificationLevel,
    /// Message text
    pub message: String,
}

impl Notification {
    /// Create an informational notification.
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            level: NotificationLevel::Info,
            message: message.into(),
        }
    }

    /// Create a success notification.
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            level: NotificationLevel::Success,
            message: message.into(),
        }
    }

    /// Create a warning notification.
    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            level: NotificationLevel::Warning,
            message: message.into(),
        }
    }

    /// Create an error notification.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            level: NotificationLevel::Error,
            message: message.into(),
        }
    }
}
