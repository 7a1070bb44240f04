//! Batched mode (`rate_limit == 0`, a single request per report tick) and
//! worker-pool mode (`rate_limit > 0`, a bounded pool of concurrent senders
//! draining a shared queue) — ported from the Go original's
//! `web_client.SendMetric` fan-in and its gRPC `PushStream` analogue. Each
//! send retries up to three times with the shared `1s, 3s, 5s` backoff.

use std::sync::Arc;
use std::time::Duration;

use metrics_core::WireMetric;
use tokio::sync::{Mutex, Notify};

use crate::client::ReportClient;

const MAX_RETRIES: u32 = 3;

fn backoff(attempt: u32) -> Duration {
    Duration::from_secs(1) + Duration::from_secs(2) * attempt
}

/// Tracks outstanding sends so graceful shutdown can wait for them to drain,
/// mirroring the Go original's `sync.WaitGroup` usage around dispatch.
pub(crate) struct DispatchGroup {
    outstanding: Mutex<usize>,
    idle: Notify,
}

impl DispatchGroup {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            outstanding: Mutex::new(0),
            idle: Notify::new(),
        })
    }

    async fn enter(&self) {
        let mut count = self.outstanding.lock().await;
        *count += 1;
    }

    async fn leave(&self) {
        let mut count = self.outstanding.lock().await;
        *count -= 1;
        if *count == 0 {
            self.idle.notify_waiters();
        }
    }

    pub(crate) async fn wait_idle(&self) {
        loop {
            {
                let count = self.outstanding.lock().await;
                if *count == 0 {
                    return;
                }
            }
            self.idle.notified().await;
        }
    }
}

async fn send_with_retry(client: &ReportClient, metrics: &[WireMetric]) {
    let mut attempt = 0;
    loop {
        match client.send_bulk(&metrics).await {
            Ok(()) => return,
            Err(error) => {
                attempt += 1;
                if attempt >= MAX_RETRIES {
                    tracing::error!(%error, attempt, "giving up on metrics batch after max retries");
                    return;
                }
                tracing::warn!(%error, attempt, "metrics batch send failed, retrying");
                tokio::time::sleep(backoff(attempt - 1)).await;
            }
        }
    }
}

/// Batched mode: the whole snapshot goes out as one request per report
/// tick.
pub(crate) async fn dispatch_batched(
    client: Arc<ReportClient>,
    group: Arc<DispatchGroup>,
    metrics: Vec<WireMetric>,
) {
    if metrics.is_empty() {
        return;
    }
    group.enter().await;
    send_with_retry(&client, &metrics).await;
    group.leave().await;
}

/// Worker-pool mode: a fan-in task feeds every metric, one at a time, into
/// a shared unbuffered channel; `rate_limit` worker tasks drain it
/// concurrently, each encoding its metric as a one-element JSON array and
/// sending it independently with its own retry budget. Bounds the number of
/// simultaneous outbound requests to `rate_limit` regardless of how many
/// metrics are collected in a tick.
pub(crate) async fn dispatch_worker_pool(
    client: Arc<ReportClient>,
    group: Arc<DispatchGroup>,
    metrics: Vec<WireMetric>,
    rate_limit: usize,
) {
    if metrics.is_empty() {
        return;
    }
    let (tx, rx) = tokio::sync::mpsc::channel::<WireMetric>(1);
    let rx = Arc::new(Mutex::new(rx));

    let mut workers = Vec::with_capacity(rate_limit.max(1));
    for _ in 0..rate_limit.max(1) {
        let client = Arc::clone(&client);
        let group = Arc::clone(&group);
        let rx = Arc::clone(&rx);
        workers.push(tokio::spawn(async move {
            loop {
                let metric = {
                    let mut rx = rx.lock().await;
                    rx.recv().await
                };
                let Some(metric) = metric else { break };
                group.enter().await;
                send_with_retry(&client, std::slice::from_ref(&metric)).await;
                group.leave().await;
            }
        }));
    }

    for metric in metrics {
        if tx.send(metric).await.is_err() {
            break;
        }
    }
    drop(tx);

    for worker in workers {
        let _ = worker.await;
    }
}
