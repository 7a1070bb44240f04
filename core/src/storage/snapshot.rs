use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub type GaugeMap = BTreeMap<String, f64>;
pub type CounterMap = BTreeMap<String, Vec<f64>>;

/// The full in-memory state, as written to and read from the backup file.
/// Counters keep their full delta sequence rather than a running total, so
/// that [`super::memory::MemoryBackend::get`] and relational storage agree on
/// the same "sum at read time" contract.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StorageSnapshot {
    pub gauges: GaugeMap,
    pub counters: CounterMap,
}

impl StorageSnapshot {
    pub fn is_empty(&self) -> bool {
        self.gauges.is_empty() && self.counters.is_empty()
    }
}
