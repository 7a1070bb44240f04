use std::sync::Mutex;

use crate::errors::StorageError;
use crate::model::Metric;

use super::snapshot::StorageSnapshot;

/// The in-process store: a single mutex guarding both maps, matching the
/// teacher's poison-tolerant locking idiom (a poisoned lock degrades rather
/// than panicking the caller).
pub struct MemoryBackend {
    state: Mutex<StorageSnapshot>,
}

impl MemoryBackend {
    pub fn new(initial: StorageSnapshot) -> Self {
        Self {
            state: Mutex::new(initial),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StorageSnapshot> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn push(&self, metric: &Metric) {
        let mut state = self.lock();
        match metric {
            Metric::Gauge { name, value } => {
                state.gauges.insert(name.clone(), *value);
            }
            Metric::Counter { name, delta } => {
                state
                    .counters
                    .entry(name.clone())
                    .or_default()
                    .push(*delta as f64);
            }
        }
    }

    pub fn get(&self, kind: &str, name: &str) -> Result<f64, StorageError> {
        let state = self.lock();
        match kind {
            crate::model::KIND_GAUGE => {
                state.gauges.get(name).copied().ok_or(StorageError::NotFound)
            }
            crate::model::KIND_COUNTER => state
                .counters
                .get(name)
                .map(|deltas| deltas.iter().sum())
                .ok_or(StorageError::NotFound),
            _ => Err(StorageError::WrongType),
        }
    }

    pub fn list(&self) -> Vec<(String, String)> {
        let state = self.lock();
        let mut entries: Vec<(String, String)> = state
            .gauges
            .iter()
            .map(|(name, value)| (name.clone(), value.to_string()))
            .collect();
        entries.extend(
            state
                .counters
                .iter()
                .map(|(name, deltas)| (name.clone(), deltas.iter().sum::<f64>().to_string())),
        );
        entries.sort();
        entries
    }

    pub fn snapshot(&self) -> StorageSnapshot {
        self.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gauge_push_overwrites_previous_value() {
        let backend = MemoryBackend::new(StorageSnapshot::default());
        backend.push(&Metric::Gauge { name: "Alloc".into(), value: 1.0 });
        backend.push(&Metric::Gauge { name: "Alloc".into(), value: 2.0 });
        assert_eq!(backend.get("gauge", "Alloc").unwrap(), 2.0);
    }

    #[test]
    fn counter_push_sums_deltas() {
        let backend = MemoryBackend::new(StorageSnapshot::default());
        backend.push(&Metric::Counter { name: "PollCount".into(), delta: 1 });
        backend.push(&Metric::Counter { name: "PollCount".into(), delta: 1 });
        assert_eq!(backend.get("counter", "PollCount").unwrap(), 2.0);
    }

    #[test]
    fn get_unknown_metric_is_not_found() {
        let backend = MemoryBackend::new(StorageSnapshot::default());
        assert!(matches!(backend.get("gauge", "Missing"), Err(StorageError::NotFound)));
    }
}
