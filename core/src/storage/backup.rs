//! Atomic file-backed persistence for [`StorageSnapshot`].
//!
//! Writes go to a `.tmp` sibling file, are `fsync`'d, then renamed over the
//! real path (and the parent directory is fsync'd too) so a crash never
//! leaves a half-written backup file observable — the same crash-safety
//! contract as a truncate-in-place write, but strictly safer. Reads on a
//! missing or empty file yield an empty snapshot. A read that fails to
//! decode after retries logs the error, deletes the corrupt file, and
//! returns an empty snapshot rather than propagating the error, matching the
//! Go original's `readFromFileRetry` behavior.

use std::path::{Path, PathBuf};

use tokio::fs;

use super::retry::retry;
use super::snapshot::StorageSnapshot;
use crate::errors::StorageError;

pub struct BackupFile {
    path: Option<PathBuf>,
}

impl BackupFile {
    /// `path: None` means no-op store: `write`/`read` succeed trivially.
    pub fn new(path: Option<PathBuf>) -> Self {
        Self { path }
    }

    pub fn is_configured(&self) -> bool {
        self.path.is_some()
    }

    pub async fn write(&self, snapshot: &StorageSnapshot) -> Result<(), StorageError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let encoded = bincode::serialize(snapshot)?;

        retry(|_err: &StorageError| true, || async { write_once(path, &encoded).await }).await
    }

    pub async fn read(&self) -> Result<StorageSnapshot, StorageError> {
        let Some(path) = &self.path else {
            return Ok(StorageSnapshot::default());
        };

        if fs::metadata(path).await.is_err() {
            return Ok(StorageSnapshot::default());
        }

        let result = retry(|_err: &StorageError| true, || async { read_once(path).await }).await;

        match result {
            Ok(snapshot) => Ok(snapshot),
            Err(StorageError::InvalidData(reason)) => {
                tracing::error!(%reason, path = %path.display(), "backup file corrupt after retries, discarding");
                let _ = fs::remove_file(path).await;
                Ok(StorageSnapshot::default())
            }
            Err(other) => Err(other),
        }
    }
}

async fn write_once(path: &Path, encoded: &[u8]) -> Result<(), StorageError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await?;
        }
    }

    let temp_path = path.with_extension("tmp");
    fs::write(&temp_path, encoded).await?;
    sync_file(&temp_path).await?;
    fs::rename(&temp_path, path).await?;
    sync_parent_dir(path).await?;
    Ok(())
}

async fn read_once(path: &Path) -> Result<StorageSnapshot, StorageError> {
    let bytes = fs::read(path).await?;
    if bytes.is_empty() {
        return Ok(StorageSnapshot::default());
    }
    bincode::deserialize(&bytes)
        .map_err(|err| StorageError::InvalidData(err.to_string()))
}

async fn sync_file(path: &Path) -> Result<(), StorageError> {
    let file = fs::File::open(path).await?;
    file.sync_all().await?;
    Ok(())
}

async fn sync_parent_dir(path: &Path) -> Result<(), StorageError> {
    let Some(parent) = path.parent() else {
        return Ok(());
    };
    if parent.as_os_str().is_empty() {
        return Ok(());
    }
    let dir = fs::File::open(parent).await?;
    dir.sync_all().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unconfigured_backup_is_a_no_op() {
        let backup = BackupFile::new(None);
        let snapshot = StorageSnapshot {
            gauges: [("Alloc".to_string(), 1.0)].into(),
            ..Default::default()
        };
        backup.write(&snapshot).await.unwrap();
        assert_eq!(backup.read().await.unwrap(), StorageSnapshot::default());
    }

    #[tokio::test]
    async fn missing_file_reads_as_empty_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let backup = BackupFile::new(Some(dir.path().join("missing.bin")));
        assert_eq!(backup.read().await.unwrap(), StorageSnapshot::default());
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let backup = BackupFile::new(Some(dir.path().join("snap.bin")));
        let snapshot = StorageSnapshot {
            gauges: [("Alloc".to_string(), 42.0)].into(),
            counters: [("PollCount".to_string(), vec![1.0, 1.0, 1.0])].into(),
        };
        backup.write(&snapshot).await.unwrap();
        assert_eq!(backup.read().await.unwrap(), snapshot);
    }

    #[tokio::test]
    async fn corrupt_file_is_discarded_and_reads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snap.bin");
        fs::write(&path, b"not a valid bincode snapshot at all, definitely garbage")
            .await
            .unwrap();
        let backup = BackupFile::new(Some(path.clone()));
        assert_eq!(backup.read().await.unwrap(), StorageSnapshot::default());
        assert!(fs::metadata(&path).await.is_err());
    }
}
