use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use metrics_core::StorageEngine;
use rsa::RsaPrivateKey;

use crate::config::AppConfig;

/// Ambient request/operation counters, exported over `/metrics` the way the
/// teacher's `MetricsState` is exported via its prometheus exporter.
#[derive(Debug, Default)]
pub(crate) struct MetricsState {
    pub(crate) http_requests_total: AtomicU64,
    pub(crate) http_requests_in_flight: AtomicU64,
    pub(crate) http_responses_2xx_total: AtomicU64,
    pub(crate) http_responses_4xx_total: AtomicU64,
    pub(crate) http_responses_5xx_total: AtomicU64,
    pub(crate) http_request_duration_us_total: AtomicU64,
    pub(crate) auth_failures_total: AtomicU64,
    pub(crate) trusted_subnet_rejections_total: AtomicU64,
    pub(crate) metrics_pushed_total: AtomicU64,
    pub(crate) storage_errors_total: AtomicU64,
}

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) started_at: Instant,
    pub(crate) config: Arc<AppConfig>,
    pub(crate) storage: Arc<StorageEngine>,
    pub(crate) hmac_key: Option<Arc<Vec<u8>>>,
    pub(crate) crypto_private_key: Option<Arc<RsaPrivateKey>>,
    pub(crate) storage_available: Arc<AtomicBool>,
    pub(crate) metrics: Arc<MetricsState>,
    /// A WaitGroup-style admission counter: incremented when a request is
    /// admitted, decremented when it completes. Graceful shutdown polls it
    /// down to zero before the process exits.
    pub(crate) inflight: Arc<AtomicU64>,
}

impl AppState {
    pub(crate) fn new(
        config: AppConfig,
        storage: StorageEngine,
        hmac_key: Option<Vec<u8>>,
        crypto_private_key: Option<RsaPrivateKey>,
    ) -> Self {
        Self {
            started_at: Instant::now(),
            config: Arc::new(config),
            storage: Arc::new(storage),
            hmac_key: hmac_key.map(Arc::new),
            crypto_private_key: crypto_private_key.map(Arc::new),
            storage_available: Arc::new(AtomicBool::new(true)),
            metrics: Arc::new(MetricsState::default()),
            inflight: Arc::new(AtomicU64::new(0)),
        }
    }
}

impl MetricsState {
    pub(crate) fn record_response(&self, status: axum::http::StatusCode, duration_us: u64) {
        self.http_requests_total.fetch_add(1, Ordering::Relaxed);
        self.http_request_duration_us_total
            .fetch_add(duration_us, Ordering::Relaxed);
        if status.is_success() || status.is_redirection() {
            self.http_responses_2xx_total.fetch_add(1, Ordering::Relaxed);
        } else if status.is_client_error() {
            self.http_responses_4xx_total.fetch_add(1, Ordering::Relaxed);
        } else if status.is_server_error() {
            self.http_responses_5xx_total.fetch_add(1, Ordering::Relaxed);
        }
    }
}
