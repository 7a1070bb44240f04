#![forbid(unsafe_code)]
//! Shared metric model, validation and storage engine for the metrics
//! pipeline, used by both the collection agent and the ingest server.

pub mod errors;
pub mod model;
pub mod storage;

pub use errors::{ModelError, StorageError};
pub use model::{validate_and_convert, Metric, WireMetric, KIND_COUNTER, KIND_GAUGE};
pub use storage::{
    BackupFile, CounterMap, GaugeMap, MemoryBackend, RelationalBackend, StorageConfig,
    StorageEngine, StorageSnapshot,
};
