//! Checkpoint persistence for interrupted transfers.
//!
//! The receiver periodically records how many bytes it has confirmed to
//! disk, along with a hash of that prefix. After a crash or connection
//! loss, a new offer for the same file resumes from the checkpoint instead
//! of starting over.
//!
//! Checkpoints are written atomically (temp file, fsync, rename) so a crash
//! mid-write never leaves a corrupt checkpoint behind.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use uuid::Uuid;

use crate::error::{Error, Result};

/// File extension for checkpoint files.
pub const CHECKPOINT_FILE_EXTENSION: &str = ".checkpoint";

/// Default expiry for stale checkpoints (7 days).
const DEFAULT_EXPIRY_DAYS: i64 = 7;

/// Persistent state of a partially received file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Transfer this checkpoint belongs to
    pub transfer_id: Uuid,
    /// Destination path of the partial file
    pub file_path: PathBuf,
    /// Expected total size of the file
    pub file_size: u64,
    /// Bytes written and flushed to disk
    pub bytes_confirmed: u64,
    /// Hex-encoded SHA-256 of the first `bytes_confirmed` bytes
    pub content_hash: String,
    /// When the checkpoint was last written
    pub updated_at: DateTime<Utc>,
}

/// Manages persistence of transfer checkpoints in a single directory.
pub struct CheckpointStore {
    checkpoint_dir: PathBuf,
}

impl CheckpointStore {
    /// Open a checkpoint store, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub async fn open(checkpoint_dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&checkpoint_dir).await?;
        Ok(Self { checkpoint_dir })
    }

    fn checkpoint_path(&self, transfer_id: &Uuid) -> PathBuf {
        self.checkpoint_dir
            .join(format!("{transfer_id}{CHECKPOINT_FILE_EXTENSION}"))
    }

    /// Save a checkpoint atomically.
    ///
    /// # Errors
    ///
    /// Returns an error if the checkpoint cannot be serialized or written.
    pub async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        let path = self.checkpoint_path(&checkpoint.transfer_id);

        let json = serde_json::to_string_pretty(checkpoint)
            .map_err(|e| Error::Serialization(e.to_string()))?;

        let temp_path = path.with_extension("tmp");

        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&temp_path, &path).await?;

        tracing::debug!(
            transfer_id = %checkpoint.transfer_id,
            bytes_confirmed = checkpoint.bytes_confirmed,
            "saved checkpoint"
        );

        Ok(())
    }

    /// Load a checkpoint by transfer ID.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing file cannot be read or parsed.
    pub async fn load(&self, transfer_id: &Uuid) -> Result<Option<Checkpoint>> {
        let path = self.checkpoint_path(transfer_id);

        if !path.exists() {
            return Ok(None);
        }

        self.load_from_path(&path).await.map(Some)
    }

    async fn load_from_path(&self, path: &Path) -> Result<Checkpoint> {
        let mut file = fs::File::open(path).await?;
        let mut contents = String::new();
        file.read_to_string(&mut contents).await?;

        serde_json::from_str(&contents)
            .map_err(|e| Error::Serialization(format!("failed to parse checkpoint: {e}")))
    }

    /// Find the most recent checkpoint for a destination path and expected
    /// file size.
    ///
    /// Transfer ids differ between the original attempt and the retry, so
    /// resumption matches on what the receiver actually knows: where the
    /// partial file lives and how big the finished file should be.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be read.
    pub async fn find_by_file(
        &self,
        file_path: &Path,
        file_size: u64,
    ) -> Result<Option<Checkpoint>> {
        let mut best: Option<Checkpoint> = None;
        let mut entries = fs::read_dir(&self.checkpoint_dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();

            let filename = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
            if !filename.ends_with(CHECKPOINT_FILE_EXTENSION) {
                continue;
            }

            if let Ok(checkpoint) = self.load_from_path(&path).await {
                if checkpoint.file_path == file_path && checkpoint.file_size == file_size {
                    let newer = best
                        .as_ref()
                        .is_none_or(|b| checkpoint.updated_at > b.updated_at);
                    if newer {
                        best = Some(checkpoint);
                    }
                }
            }
        }

        Ok(best)
    }

    /// Delete a checkpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be deleted.
    pub async fn delete(&self, transfer_id: &Uuid) -> Result<()> {
        let path = self.checkpoint_path(transfer_id);

        if path.exists() {
            fs::remove_file(&path).await?;
            tracing::debug!(transfer_id = %transfer_id, "deleted checkpoint");
        }

        Ok(())
    }

    /// Remove checkpoints older than the default expiry (7 days).
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be read.
    pub async fn cleanup_expired(&self) -> Result<usize> {
        self.cleanup_older_than(chrono::Duration::days(DEFAULT_EXPIRY_DAYS))
            .await
    }

    /// Remove checkpoints older than `max_age`, returning how many were
    /// removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be read.
    pub async fn cleanup_older_than(&self, max_age: chrono::Duration) -> Result<usize> {
        let cutoff = Utc::now() - max_age;
        let mut cleaned = 0;

        let mut entries = fs::read_dir(&self.checkpoint_dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();

            let filename = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
            if !filename.ends_with(CHECKPOINT_FILE_EXTENSION) {
                continue;
            }

            if let Ok(checkpoint) = self.load_from_path(&path).await {
                if checkpoint.updated_at < cutoff {
                    if let Err(e) = fs::remove_file(&path).await {
                        tracing::warn!(
                            path = %path.display(),
                            error = %e,
                            "failed to delete expired checkpoint"
                        );
                    } else {
                        cleaned += 1;
                    }
                }
            }
        }

        if cleaned > 0 {
            tracing::info!(count = cleaned, "cleaned up expired checkpoints");
        }

        Ok(cleaned)
    }

    /// List all checkpoints, most recently updated first.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be read.
    pub async fn list(&self) -> Result<Vec<Checkpoint>> {
        let mut checkpoints = Vec::new();
        let mut entries = fs::read_dir(&self.checkpoint_dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();

            let filename = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
            if !filename.ends_with(CHECKPOINT_FILE_EXTENSION) {
                continue;
            }

            if let Ok(checkpoint) = self.load_from_path(&path).await {
                checkpoints.push(checkpoint);
            }
        }

        checkpoints.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));

        Ok(checkpoints)
    }

    /// Default checkpoint directory under a data directory.
    #[must_use]
    pub fn path_in(data_dir: &Path) -> PathBuf {
        data_dir.join("checkpoints")
    }
}
