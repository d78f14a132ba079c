//! Tests for checkpoint persistence and recovery.

mod common;

use std::path::Path;

use uuid::Uuid;

use lanbooth_core::transfer::checkpoint::{Checkpoint, CheckpointStore};

use common::create_temp_dir;

fn checkpoint_for(file_path: &Path, file_size: u64, bytes_confirmed: u64) -> Checkpoint {
    Checkpoint {
        transfer_id: Uuid::new_v4(),
        file_path: file_path.to_path_buf(),
        file_size,
        bytes_confirmed,
        content_hash: "aa".repeat(32),
        updated_at: chrono::Utc::now(),
    }
}

/// A saved checkpoint loads back with the same contents.
#[tokio::test]
async fn test_save_and_load_roundtrip() {
    let dir = create_temp_dir();
    let store = CheckpointStore::open(dir.path().join("checkpoints"))
        .await
        .expect("open");

    let checkpoint = checkpoint_for(Path::new("/downloads/video.bin"), 1_000_000, 256_000);
    store.save(&checkpoint).await.expect("save");

    let loaded = store
        .load(&checkpoint.transfer_id)
        .await
        .expect("load")
        .expect("checkpoint exists");

    assert_eq!(loaded.transfer_id, checkpoint.transfer_id);
    assert_eq!(loaded.file_path, checkpoint.file_path);
    assert_eq!(loaded.file_size, 1_000_000);
    assert_eq!(loaded.bytes_confirmed, 256_000);
    assert_eq!(loaded.content_hash, checkpoint.content_hash);
}

/// Loading an unknown transfer id yields nothing.
#[tokio::test]
async fn test_load_missing_checkpoint() {
    let dir = create_temp_dir();
    let store = CheckpointStore::open(dir.path().join("checkpoints"))
        .await
        .expect("open");

    let loaded = store.load(&Uuid::new_v4()).await.expect("load");
    assert!(loaded.is_none());
}

/// Saving twice for the same transfer keeps only the latest state.
#[tokio::test]
async fn test_save_overwrites() {
    let dir = create_temp_dir();
    let store = CheckpointStore::open(dir.path().join("checkpoints"))
        .await
        .expect("open");

    let mut checkpoint = checkpoint_for(Path::new("/downloads/doc.pdf"), 500_000, 100_000);
    store.save(&checkpoint).await.expect("save");

    checkpoint.bytes_confirmed = 400_000;
    store.save(&checkpoint).await.expect("save again");

    let loaded = store
        .load(&checkpoint.transfer_id)
        .await
        .expect("load")
        .expect("checkpoint exists");
    assert_eq!(loaded.bytes_confirmed, 400_000);
    assert_eq!(store.list().await.expect("list").len(), 1);
}

/// Deleted checkpoints stay deleted; deleting twice is fine.
#[tokio::test]
async fn test_delete_checkpoint() {
    let dir = create_temp_dir();
    let store = CheckpointStore::open(dir.path().join("checkpoints"))
        .await
        .expect("open");

    let checkpoint = checkpoint_for(Path::new("/downloads/song.mp3"), 8_000_000, 1_000_000);
    store.save(&checkpoint).await.expect("save");

    store.delete(&checkpoint.transfer_id).await.expect("delete");
    assert!(store
        .load(&checkpoint.transfer_id)
        .await
        .expect("load")
        .is_none());

    store
        .delete(&checkpoint.transfer_id)
        .await
        .expect("idempotent delete");
}

/// Lookup by destination matches on path and size, newest first.
#[tokio::test]
async fn test_find_by_file_picks_newest_match() {
    let dir = create_temp_dir();
    let store = CheckpointStore::open(dir.path().join("checkpoints"))
        .await
        .expect("open");

    let dest = Path::new("/downloads/archive.tar");

    let mut old = checkpoint_for(dest, 2_000_000, 500_000);
    old.updated_at = chrono::Utc::now() - chrono::Duration::hours(2);
    store.save(&old).await.expect("save old");

    let newer = checkpoint_for(dest, 2_000_000, 1_500_000);
    store.save(&newer).await.expect("save newer");

    // Same path, different expected size: not a match.
    store
        .save(&checkpoint_for(dest, 3_000_000, 100_000))
        .await
        .expect("save different size");
    // Different path entirely.
    store
        .save(&checkpoint_for(Path::new("/downloads/other.tar"), 2_000_000, 100_000))
        .await
        .expect("save different path");

    let found = store
        .find_by_file(dest, 2_000_000)
        .await
        .expect("find")
        .expect("match exists");
    assert_eq!(found.transfer_id, newer.transfer_id);
    assert_eq!(found.bytes_confirmed, 1_500_000);

    assert!(store
        .find_by_file(Path::new("/downloads/missing.tar"), 2_000_000)
        .await
        .expect("find")
        .is_none());
}

/// Expiry removes only checkpoints older than the cutoff.
#[tokio::test]
async fn test_cleanup_removes_only_stale_checkpoints() {
    let dir = create_temp_dir();
    let store = CheckpointStore::open(dir.path().join("checkpoints"))
        .await
        .expect("open");

    let mut stale = checkpoint_for(Path::new("/downloads/old.bin"), 1_000, 500);
    stale.updated_at = chrono::Utc::now() - chrono::Duration::days(10);
    store.save(&stale).await.expect("save stale");

    let fresh = checkpoint_for(Path::new("/downloads/new.bin"), 1_000, 500);
    store.save(&fresh).await.expect("save fresh");

    let removed = store.cleanup_expired().await.expect("cleanup");
    assert_eq!(removed, 1);

    assert!(store.load(&stale.transfer_id).await.expect("load").is_none());
    assert!(store.load(&fresh.transfer_id).await.expect("load").is_some());
}

/// Listing returns checkpoints newest first.
#[tokio::test]
async fn test_list_sorted_by_recency() {
    let dir = create_temp_dir();
    let store = CheckpointStore::open(dir.path().join("checkpoints"))
        .await
        .expect("open");

    let mut oldest = checkpoint_for(Path::new("/a"), 100, 10);
    oldest.updated_at = chrono::Utc::now() - chrono::Duration::minutes(30);
    let mut middle = checkpoint_for(Path::new("/b"), 100, 10);
    middle.updated_at = chrono::Utc::now() - chrono::Duration::minutes(10);
    let newest = checkpoint_for(Path::new("/c"), 100, 10);

    store.save(&oldest).await.expect("save");
    store.save(&middle).await.expect("save");
    store.save(&newest).await.expect("save");

    let listed = store.list().await.expect("list");
    assert_eq!(listed.len(), 3);
    assert_eq!(listed[0].transfer_id, newest.transfer_id);
    assert_eq!(listed[2].transfer_id, oldest.transfer_id);
}
