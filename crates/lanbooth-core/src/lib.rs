//! # Lanbooth Core Library
//!
//! `lanbooth-core` implements serverless file transfer between devices on
//! the same local network.
//!
//! ## Features
//!
//! - **Zero configuration**: Devices find each other via UDP broadcast
//! - **Encrypted transfers**: X25519 key exchange with per-chunk AEAD
//! - **Interruptible**: Transfers pause, resume, and survive crashes via
//!   on-disk checkpoints
//! - **Cross-platform**: Works on Windows, Linux, and macOS
//!
//! ## Modules
//!
//! - [`config`] - Configuration management
//! - [`crypto`] - Session key derivation and chunk encryption
//! - [`discovery`] - Peer discovery via UDP broadcast
//! - [`engine`] - The top-level engine frontends talk to
//! - [`event`] - Events emitted to subscribers
//! - [`identity`] - Persistent Ed25519 device identity
//! - [`protocol`] - LBTP wire protocol implementation
//! - [`transfer`] - File transfer engine
//! - [`trust`] - Trusted devices management
//!
//! ## Example
//!
//! ```rust,ignore
//! use lanbooth_core::{Engine, Event};
//!
//! let engine = Engine::start().await?;
//! let mut events = engine.subscribe();
//!
//! while let Ok(event) = events.recv().await {
//!     if let Event::PeerDiscovered(peer) = event {
//!         engine.send_files(peer.device_id, vec!["file.txt".into()]).await?;
//!     }
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::cast_precision_loss)]

pub mod config;
pub mod crypto;
pub mod discovery;
pub mod engine;
pub mod error;
pub mod event;
pub mod identity;
pub mod protocol;
pub mod transfer;
pub mod trust;

pub use engine::Engine;
pub use error::{Error, Result};
pub use event::Event;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Protocol version for LBTP
pub const PROTOCOL_VERSION: (u8, u8) = (1, 0);

/// Default discovery port (UDP)
pub const DEFAULT_DISCOVERY_PORT: u16 = 47201;

/// Default transfer port (TCP)
pub const DEFAULT_TRANSFER_PORT: u16 = 47210;

/// Default chunk size for file transfers (128 KiB)
pub const DEFAULT_CHUNK_SIZE: usize = 128 * 1024;
