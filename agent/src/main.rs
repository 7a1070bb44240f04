mod client;
mod collector;
mod config;
mod dispatch;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use metrics_core::WireMetric;
use rsa::pkcs8::DecodePublicKey;
use rsa::RsaPublicKey;

use client::ReportClient;
use collector::Collector;
use config::AgentConfig;
use dispatch::DispatchGroup;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = AgentConfig::load().context("failed to load agent configuration")?;
    let server_url = config.server_url()?;
    let hmac_key = config.hmac_key.clone().map(|key| key.into_bytes());
    let public_key = load_public_key(&config)?;

    tracing::info!(%server_url, "metrics agent starting");

    let client = Arc::new(ReportClient::new(
        server_url,
        hmac_key,
        public_key,
        config.trusted_subnet_source_ip.clone(),
    ));
    let collector = Arc::new(Collector::new());
    let dispatch_group = DispatchGroup::new();

    let poll_interval = config.poll_interval();
    let report_interval = config.report_interval();
    let rate_limit = config.rate_limit;
    let stopping = Arc::new(AtomicBool::new(false));

    let poll_collector = Arc::clone(&collector);
    let poll_handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(poll_interval);
        loop {
            ticker.tick().await;
            poll_collector.renew().await;
        }
    });

    let report_client = Arc::clone(&client);
    let report_collector = Arc::clone(&collector);
    let report_group = Arc::clone(&dispatch_group);
    let report_stopping = Arc::clone(&stopping);
    let report_handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(report_interval);
        loop {
            ticker.tick().await;
            if report_stopping.load(Ordering::SeqCst) {
                break;
            }
            let metrics = report_collector.collect().await;
            let wires: Vec<WireMetric> = metrics.iter().map(WireMetric::from_metric).collect();

            if rate_limit == 0 {
                dispatch::dispatch_batched(
                    Arc::clone(&report_client),
                    Arc::clone(&report_group),
                    wires,
                )
                .await;
            } else {
                dispatch::dispatch_worker_pool(
                    Arc::clone(&report_client),
                    Arc::clone(&report_group),
                    wires,
                    rate_limit,
                )
                .await;
            }
        }
    });

    shutdown_signal().await;
    tracing::info!("shutdown signal received, draining in-flight sends");

    poll_handle.abort();
    stopping.store(true, Ordering::SeqCst);
    let _ = report_handle.await;
    dispatch_group.wait_idle().await;

    tracing::info!("agent shut down cleanly");
    Ok(())
}

fn load_public_key(config: &AgentConfig) -> Result<Option<RsaPublicKey>> {
    let Some(path) = &config.crypto_public_key_path else {
        return Ok(None);
    };
    let pem = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read public key at {}", path.display()))?;
    let key = RsaPublicKey::from_public_key_pem(&pem).context("failed to parse RSA public key")?;
    Ok(Some(key))
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
