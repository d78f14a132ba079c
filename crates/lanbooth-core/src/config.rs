//! Configuration management for Lanbooth.
//!
//! Settings are persisted as TOML. Every field has a default, so a missing
//! or partial file always produces a usable configuration.
//!
//! ## Configuration File Locations
//!
//! | Platform | Path |
//! |----------|------|
//! | Linux | `~/.config/lanbooth/config.toml` |
//! | macOS | `~/Library/Application Support/Lanbooth/config.toml` |
//! | Windows | `%APPDATA%\Lanbooth\config.toml` |

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Runtime settings for the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Display name announced on the network
    pub device_name: String,
    /// Directory where received files are written
    pub save_dir: PathBuf,
    /// Discovery port (UDP broadcast)
    pub discovery_port: u16,
    /// Preferred transfer port (TCP); 0 picks an ephemeral port
    pub transfer_port: u16,
    /// Seconds between discovery announcements
    pub broadcast_interval_secs: u64,
    /// Seconds of silence before a peer is considered gone
    pub peer_timeout_secs: u64,
    /// Chunk size for file transfers
    pub chunk_size: usize,
    /// Seconds the receiver waits for the next frame of an active
    /// transfer; the clock stops while the transfer is paused
    pub chunk_idle_timeout_secs: u64,
    /// Maximum simultaneous transfers per peer
    pub max_concurrent_per_peer: usize,
    /// Keep the partial file on disk when a transfer is cancelled
    pub keep_partial_on_cancel: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            device_name: hostname::get().map_or_else(
                |_| "Lanbooth Device".to_string(),
                |h| h.to_string_lossy().to_string(),
            ),
            save_dir: directories::UserDirs::new()
                .and_then(|d| d.download_dir().map(Path::to_path_buf))
                .unwrap_or_else(|| PathBuf::from(".")),
            discovery_port: crate::DEFAULT_DISCOVERY_PORT,
            transfer_port: crate::DEFAULT_TRANSFER_PORT,
            broadcast_interval_secs: 3,
            peer_timeout_secs: 10,
            chunk_size: crate::DEFAULT_CHUNK_SIZE,
            chunk_idle_timeout_secs: crate::transfer::CHUNK_IDLE_TIMEOUT.as_secs(),
            max_concurrent_per_peer: 3,
            keep_partial_on_cancel: true,
        }
    }
}

impl Settings {
    /// Returns the default config file path.
    pub fn default_path() -> Result<PathBuf> {
        let dirs = directories::ProjectDirs::from("", "", "lanbooth")
            .ok_or_else(|| Error::ConfigError("could not determine config directory".into()))?;
        Ok(dirs.config_dir().join("config.toml"))
    }

    /// Load settings from the given path, falling back to defaults if the
    /// file does not exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)?;
        toml::from_str(&contents).map_err(|e| Error::ConfigError(e.to_string()))
    }

    /// Save settings to the given path, creating parent directories as
    /// needed.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents =
            toml::to_string_pretty(self).map_err(|e| Error::ConfigError(e.to_string()))?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Interval between discovery announcements.
    #[must_use]
    pub const fn broadcast_interval(&self) -> Duration {
        Duration::from_secs(self.broadcast_interval_secs)
    }

    /// Silence window after which a peer is evicted.
    #[must_use]
    pub const fn peer_timeout(&self) -> Duration {
        Duration::from_secs(self.peer_timeout_secs)
    }

    /// Idle window after which a stalled transfer fails.
    #[must_use]
    pub const fn chunk_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.chunk_idle_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.discovery_port, crate::DEFAULT_DISCOVERY_PORT);
        assert_eq!(settings.chunk_size, crate::DEFAULT_CHUNK_SIZE);
        assert_eq!(settings.max_concurrent_per_peer, 3);
        assert_eq!(settings.chunk_idle_timeout(), Duration::from_secs(30));
        assert!(settings.keep_partial_on_cancel);
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");

        let mut settings = Settings::default();
        settings.device_name = "test-device".to_string();
        settings.broadcast_interval_secs = 7;
        settings.save_to(&path).expect("save");

        let loaded = Settings::load_from(&path).expect("load");
        assert_eq!(loaded.device_name, "test-device");
        assert_eq!(loaded.broadcast_interval(), Duration::from_secs(7));
    }

    #[test]
    fn test_load_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let settings = Settings::load_from(&dir.path().join("nope.toml")).expect("load");
        assert_eq!(settings.discovery_port, crate::DEFAULT_DISCOVERY_PORT);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "device_name = \"laptop\"\n").expect("write");

        let settings = Settings::load_from(&path).expect("load");
        assert_eq!(settings.device_name, "laptop");
        assert_eq!(settings.transfer_port, crate::DEFAULT_TRANSFER_PORT);
    }
}
