mod backup;
mod memory;
mod relational;
mod retry;
mod snapshot;

pub use backup::BackupFile;
pub use memory::MemoryBackend;
pub use relational::RelationalBackend;
pub use snapshot::{CounterMap, GaugeMap, StorageSnapshot};

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::errors::StorageError;
use crate::model::Metric;

/// Where a running `StorageEngine` keeps its data.
pub enum StorageBackend {
    Memory(Arc<MemoryBackend>),
    Relational(Arc<RelationalBackend>),
}

/// Unifies the in-memory and relational backends behind one facade, and owns
/// the backup loop for the in-memory case. `store_interval == 0` means
/// synchronous mode: every push blocks until its backup write completes.
pub struct StorageEngine {
    backend: StorageBackend,
    backup: Arc<BackupFile>,
    store_interval: Duration,
    flush_tx: tokio::sync::Mutex<Option<mpsc::Sender<()>>>,
}

pub struct StorageConfig {
    pub database_dsn: Option<String>,
    pub file_storage_path: Option<PathBuf>,
    pub store_interval: Duration,
    pub restore: bool,
}

impl StorageEngine {
    pub async fn new(config: StorageConfig) -> Result<Self, StorageError> {
        if let Some(dsn) = config.database_dsn {
            let relational = Arc::new(RelationalBackend::connect(&dsn).await?);
            relational.create_metrics_table().await?;
            return Ok(Self {
                backend: StorageBackend::Relational(relational),
                backup: Arc::new(BackupFile::new(None)),
                store_interval: config.store_interval,
                flush_tx: tokio::sync::Mutex::new(None),
            });
        }

        let backup = Arc::new(BackupFile::new(config.file_storage_path));
        let initial = if config.restore {
            backup.read().await?
        } else {
            StorageSnapshot::default()
        };
        let memory = Arc::new(MemoryBackend::new(initial));

        let flush_tx = if backup.is_configured() && config.store_interval > Duration::ZERO {
            Some(spawn_periodic_flush(
                Arc::clone(&memory),
                Arc::clone(&backup),
                config.store_interval,
            ))
        } else {
            None
        };

        Ok(Self {
            backend: StorageBackend::Memory(memory),
            backup,
            store_interval: config.store_interval,
            flush_tx: tokio::sync::Mutex::new(flush_tx),
        })
    }

    pub async fn push(&self, metric: &Metric) -> Result<(), StorageError> {
        match &self.backend {
            StorageBackend::Memory(memory) => {
                memory.push(metric);
                if self.backup.is_configured() && self.store_interval == Duration::ZERO {
                    self.backup.write(&memory.snapshot()).await?;
                }
                Ok(())
            }
            StorageBackend::Relational(relational) => match metric {
                Metric::Gauge { name, value } => relational.push_replace("gauge", name, *value).await,
                Metric::Counter { name, delta } => {
                    relational.push_add("counter", name, *delta as f64).await
                }
            },
        }
    }

    pub async fn get(&self, kind: &str, name: &str) -> Result<f64, StorageError> {
        match &self.backend {
            StorageBackend::Memory(memory) => memory.get(kind, name),
            StorageBackend::Relational(relational) => relational.get_one_value(kind, name).await,
        }
    }

    pub async fn list(&self) -> Result<Vec<(String, String)>, StorageError> {
        match &self.backend {
            StorageBackend::Memory(memory) => Ok(memory.list()),
            StorageBackend::Relational(relational) => Ok(relational
                .list()
                .await?
                .into_iter()
                .map(|(_, name, value)| (name, value.to_string()))
                .collect()),
        }
    }

    pub async fn ping(&self) -> Result<(), StorageError> {
        match &self.backend {
            StorageBackend::Memory(_) => Ok(()),
            StorageBackend::Relational(relational) => relational.ping().await,
        }
    }

    /// Flushes the in-memory state to the backup file immediately. A no-op
    /// for the relational backend. Called on graceful shutdown, where it also
    /// stops the periodic-flush background task by dropping its sender,
    /// which closes the task's `rx.recv()` loop.
    pub async fn flush(&self) -> Result<(), StorageError> {
        if let StorageBackend::Memory(memory) = &self.backend {
            self.backup.write(&memory.snapshot()).await?;
        }
        self.flush_tx.lock().await.take();
        Ok(())
    }
}

fn spawn_periodic_flush(
    memory: Arc<MemoryBackend>,
    backup: Arc<BackupFile>,
    interval: Duration,
) -> mpsc::Sender<()> {
    let (tx, mut rx) = mpsc::channel::<()>(1);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(error) = backup.write(&memory.snapshot()).await {
                        tracing::error!(%error, "periodic backup flush failed");
                    }
                }
                _ = rx.recv() => break,
            }
        }
    });
    tx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn synchronous_mode_persists_every_push() {
        let dir = tempfile::tempdir().unwrap();
        let engine = StorageEngine::new(StorageConfig {
            database_dsn: None,
            file_storage_path: Some(dir.path().join("snap.bin")),
            store_interval: Duration::ZERO,
            restore: false,
        })
        .await
        .unwrap();

        engine
            .push(&Metric::Gauge { name: "Alloc".into(), value: 7.0 })
            .await
            .unwrap();

        let backup = BackupFile::new(Some(dir.path().join("snap.bin")));
        let snapshot = backup.read().await.unwrap();
        assert_eq!(snapshot.gauges.get("Alloc"), Some(&7.0));
    }

    #[tokio::test]
    async fn restore_reads_prior_backup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snap.bin");
        let backup = BackupFile::new(Some(path.clone()));
        backup
            .write(&StorageSnapshot {
                gauges: [("Alloc".to_string(), 5.0)].into(),
                counters: Default::default(),
            })
            .await
            .unwrap();

        let engine = StorageEngine::new(StorageConfig {
            database_dsn: None,
            file_storage_path: Some(path),
            store_interval: Duration::from_secs(300),
            restore: true,
        })
        .await
        .unwrap();

        assert_eq!(engine.get("gauge", "Alloc").await.unwrap(), 5.0);
    }

    #[tokio::test]
    async fn unconfigured_path_never_persists() {
        let engine = StorageEngine::new(StorageConfig {
            database_dsn: None,
            file_storage_path: None,
            store_interval: Duration::ZERO,
            restore: false,
        })
        .await
        .unwrap();
        engine
            .push(&Metric::Counter { name: "PollCount".into(), delta: 1 })
            .await
            .unwrap();
        assert_eq!(engine.get("counter", "PollCount").await.unwrap(), 1.0);
    }
}
