mod config;
mod errors;
mod grpc;
mod handlers;
mod middleware;
mod state;

use std::time::Duration;

use anyhow::{Context, Result};
use axum::error_handling::HandleErrorLayer;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::Router;
use metrics_core::{StorageConfig, StorageEngine};
use rsa::pkcs8::DecodePrivateKey;
use rsa::RsaPrivateKey;
use tower::ServiceBuilder;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use config::AppConfig;
use errors::handle_middleware_error;
use state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = AppConfig::from_env().context("failed to load configuration")?;
    let hmac_key = config.hmac_key.clone().map(|key| key.into_bytes());
    let crypto_private_key = load_private_key(&config)?;

    let storage = StorageEngine::new(StorageConfig {
        database_dsn: config.database_dsn.clone(),
        file_storage_path: config.file_storage_path.clone(),
        store_interval: config.store_interval,
        restore: config.restore,
    })
    .await
    .context("failed to initialize storage engine")?;

    let bind = config.bind;
    let state = AppState::new(config, storage, hmac_key, crypto_private_key);

    let app = build_app(state.clone());
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;

    tracing::info!(address = %bind, "metrics server listening");

    let grpc_state = state.clone();
    let grpc_handle = tokio::spawn(async move {
        if let Err(error) = serve_grpc(grpc_state).await {
            tracing::error!(%error, "grpc server exited with error");
        }
    });

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server loop failed")?;

    grpc_handle.abort();
    drain_inflight(&state).await;
    if let Err(error) = state.storage.flush().await {
        tracing::error!(%error, "final storage flush failed on shutdown");
    } else {
        tracing::info!("final storage flush completed");
    }

    Ok(())
}

async fn serve_grpc(state: AppState) -> Result<()> {
    let addr = state.config.grpc_bind;
    let service = grpc::MetricsGrpcService { state };
    tonic::transport::Server::builder()
        .add_service(grpc::proto::metrics_service_server::MetricsServiceServer::new(service))
        .serve(addr)
        .await
        .context("grpc server failed")
}

async fn drain_inflight(state: &AppState) {
    for _ in 0..50 {
        if state.inflight.load(std::sync::atomic::Ordering::SeqCst) == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    tracing::warn!("shutdown proceeding with requests still in flight");
}

fn load_private_key(config: &AppConfig) -> Result<Option<RsaPrivateKey>> {
    let Some(path) = &config.crypto_private_key_path else {
        return Ok(None);
    };
    let pem = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read private key at {}", path.display()))?;
    let key = RsaPrivateKey::from_pkcs8_pem(&pem).context("failed to parse RSA private key")?;
    Ok(Some(key))
}

fn build_app(state: AppState) -> Router {
    let timeout = Duration::from_millis(state.config.request_timeout_ms);
    let max_body_bytes = state.config.max_body_bytes;
    let max_concurrency = state.config.max_concurrency;

    Router::new()
        .route(
            "/update/:kind/:name/:value",
            post(handlers::update_path_form).get(handlers::update_path_form),
        )
        .route("/update/", post(handlers::update_json))
        .route("/updates/", post(handlers::update_json_bulk))
        .route("/value/:kind/:name", get(handlers::value_path_form))
        .route("/value/", post(handlers::value_json))
        .route("/", get(handlers::list_html))
        .route("/ping", get(handlers::ping))
        .layer(
            ServiceBuilder::new()
                .layer(HandleErrorLayer::new(handle_middleware_error))
                .layer(tower::timeout::TimeoutLayer::new(timeout))
                .layer(tower::limit::ConcurrencyLimitLayer::new(max_concurrency))
                .layer(RequestBodyLimitLayer::new(max_body_bytes))
                .layer(TraceLayer::new_for_http())
                .layer(axum::middleware::from_fn_with_state(state.clone(), middleware::admit))
                .layer(axum::middleware::from_fn_with_state(
                    state.clone(),
                    middleware::gzip_encode_response,
                ))
                .layer(axum::middleware::from_fn_with_state(
                    state.clone(),
                    middleware::hmac_authenticate,
                ))
                .layer(axum::middleware::from_fn_with_state(state.clone(), middleware::decrypt))
                .layer(axum::middleware::from_fn_with_state(
                    state.clone(),
                    middleware::log_and_check_subnet,
                ))
                .layer(axum::middleware::from_fn(middleware::decompress))
                .layer(axum::middleware::from_fn(middleware::tag_dispatch_shape)),
        )
        .with_state(state)
        .fallback(|| async { (StatusCode::NOT_FOUND, "not found") })
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

    tracing::info!("shutdown signal received");
}
