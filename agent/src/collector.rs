//! Samples two disjoint gauge sources plus one counter, mirroring the Go
//! original's `met_gen.MetGen`: a process/runtime gauge set refreshed every
//! `Renew`, and a `PollCount` counter incremented once per successful
//! refresh. `RandomValue` rides along as a 28th gauge, matching the
//! original's injected-entropy gauge used to prove liveness end to end.

use std::collections::BTreeMap;
use std::time::Duration;

use rand::Rng;
use sysinfo::{CpuRefreshKind, Pid, ProcessRefreshKind, RefreshKind, System};
use tokio::sync::RwLock;

use metrics_core::Metric;

pub(crate) struct Collector {
    system: RwLock<System>,
    gauges: RwLock<BTreeMap<String, f64>>,
    poll_count: std::sync::atomic::AtomicI64,
}

impl Collector {
    pub(crate) fn new() -> Self {
        let refresh = RefreshKind::new()
            .with_cpu(CpuRefreshKind::everything())
            .with_processes(ProcessRefreshKind::everything())
            .with_memory(sysinfo::MemoryRefreshKind::everything());
        Self {
            system: RwLock::new(System::new_with_specifics(refresh)),
            gauges: RwLock::new(BTreeMap::new()),
            poll_count: std::sync::atomic::AtomicI64::new(0),
        }
    }

    /// Resamples both gauge sources and increments `PollCount`. Safe to call
    /// concurrently with [`Self::collect`]. CPU usage is a 1-second average:
    /// `sysinfo` reports meaningful usage only across two refreshes spaced
    /// apart, so this takes a baseline reading, sleeps 1s, then refreshes
    /// again before reading `cpu_usage()`.
    pub(crate) async fn renew(&self) {
        let mut system = self.system.write().await;
        system.refresh_cpu_specifics(CpuRefreshKind::everything());
        tokio::time::sleep(Duration::from_secs(1)).await;
        system.refresh_cpu_specifics(CpuRefreshKind::everything());

        let pid = Pid::from_u32(std::process::id());
        system.refresh_process(pid);
        system.refresh_memory();

        let mut gauges = BTreeMap::new();

        if let Some(process) = system.process(pid) {
            gauges.insert("ResidentMemoryBytes".to_string(), process.memory() as f64);
            gauges.insert("VirtualMemoryBytes".to_string(), process.virtual_memory() as f64);
            gauges.insert("ProcessCpuUsagePercent".to_string(), process.cpu_usage() as f64);
            gauges.insert("ProcessRunTimeSeconds".to_string(), process.run_time() as f64);
            gauges.insert("ProcessStartTimeSeconds".to_string(), process.start_time() as f64);
            let disk = process.disk_usage();
            gauges.insert("DiskReadBytesTotal".to_string(), disk.total_read_bytes as f64);
            gauges.insert("DiskWrittenBytesTotal".to_string(), disk.total_written_bytes as f64);
        }

        gauges.insert("TotalMemoryBytes".to_string(), system.total_memory() as f64);
        gauges.insert("FreeMemoryBytes".to_string(), system.free_memory() as f64);
        gauges.insert("AvailableMemoryBytes".to_string(), system.available_memory() as f64);
        gauges.insert("UsedSwapBytes".to_string(), system.used_swap() as f64);
        gauges.insert("TotalSwapBytes".to_string(), system.total_swap() as f64);
        gauges.insert("CpuCount".to_string(), system.cpus().len() as f64);

        let global_cpu_usage = system.global_cpu_info().cpu_usage() as f64;
        gauges.insert("CpuUsagePercent".to_string(), global_cpu_usage);

        for (index, cpu) in system.cpus().iter().enumerate() {
            gauges.insert(format!("CpuUsagePercent{index}"), cpu.cpu_usage() as f64);
        }

        gauges.insert("RandomValue".to_string(), rand::thread_rng().gen::<f64>());

        *self.gauges.write().await = gauges;
        self.poll_count.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }

    /// Snapshots the currently-held gauges and counter as a flat `Vec` of
    /// metrics ready for dispatch.
    pub(crate) async fn collect(&self) -> Vec<Metric> {
        let gauges = self.gauges.read().await;
        let mut metrics: Vec<Metric> = gauges
            .iter()
            .map(|(name, value)| Metric::Gauge {
                name: name.clone(),
                value: *value,
            })
            .collect();
        metrics.push(Metric::Counter {
            name: "PollCount".to_string(),
            delta: self.poll_count.swap(0, std::sync::atomic::Ordering::Relaxed),
        });
        metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn renew_then_collect_includes_random_value_and_poll_count() {
        let collector = Collector::new();
        collector.renew().await;
        let metrics = collector.collect().await;
        assert!(metrics.iter().any(|m| m.name() == "RandomValue"));
        let poll_count = metrics
            .iter()
            .find(|m| m.name() == "PollCount")
            .expect("PollCount must be present");
        assert!(matches!(poll_count, Metric::Counter { delta, .. } if *delta == 1));
    }

    #[tokio::test]
    async fn collect_without_renew_still_reports_poll_count_zero() {
        let collector = Collector::new();
        let metrics = collector.collect().await;
        let poll_count = metrics
            .iter()
            .find(|m| m.name() == "PollCount")
            .expect("PollCount must be present");
        assert!(matches!(poll_count, Metric::Counter { delta, .. } if *delta == 0));
    }
}
