//! The gRPC surface, mirroring the HTTP handlers one for one: `PushBulk`,
//! `PushStream`, `Get`, `List`, `Ping` — the same method set as the original
//! agent/server `MetricsService`.

use std::net::IpAddr;
use std::sync::atomic::Ordering;

use tonic::{Request, Response, Status, Streaming};

use metrics_core::{Metric, WireMetric};

use crate::state::AppState;

pub(crate) mod proto {
    tonic::include_proto!("metrics");
}

use proto::metrics_service_server::MetricsService;
use proto::{
    GetRequest, GetResponse, ListRequest, ListResponse, Metric as ProtoMetric, PingRequest,
    PingResponse, PushBulkRequest, PushResponse,
};

pub(crate) struct MetricsGrpcService {
    pub(crate) state: AppState,
}

/// RAII admission guard mirroring the HTTP `admit` middleware's WaitGroup:
/// incremented when a call starts, decremented when the guard drops at the
/// end of the handler, so graceful shutdown can drain gRPC calls the same
/// way it drains HTTP requests.
struct InflightGuard<'a>(&'a std::sync::atomic::AtomicU64);

impl<'a> InflightGuard<'a> {
    fn enter(counter: &'a std::sync::atomic::AtomicU64) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Enforces the trusted-subnet check against the `x-real-ip` call metadata,
/// mirroring `middleware::log_and_check_subnet`'s HTTP header check.
fn check_trusted_subnet<T>(state: &AppState, request: &Request<T>) -> Result<(), Status> {
    let Some(subnet) = state.config.trusted_subnet else {
        return Ok(());
    };
    let allowed = request
        .metadata()
        .get("x-real-ip")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<IpAddr>().ok())
        .map(|ip| subnet.contains(&ip))
        .unwrap_or(false);
    if allowed {
        Ok(())
    } else {
        Err(Status::permission_denied("source not in trusted subnet"))
    }
}

fn proto_to_metric(proto: ProtoMetric) -> Result<Metric, Status> {
    let wire = WireMetric {
        id: proto.id,
        kind: proto.r#type,
        value: proto.value,
        delta: proto.delta,
    };
    Metric::try_from(wire).map_err(|error| Status::invalid_argument(error.to_string()))
}

#[tonic::async_trait]
impl MetricsService for MetricsGrpcService {
    async fn push_bulk(
        &self,
        request: Request<PushBulkRequest>,
    ) -> Result<Response<PushResponse>, Status> {
        check_trusted_subnet(&self.state, &request)?;
        let _admit = InflightGuard::enter(&self.state.inflight);
        for proto_metric in request.into_inner().metrics {
            let metric = proto_to_metric(proto_metric)?;
            self.state
                .storage
                .push(&metric)
                .await
                .map_err(|error| Status::internal(error.to_string()))?;
        }
        Ok(Response::new(PushResponse {
            success: true,
            message: String::new(),
        }))
    }

    async fn push_stream(
        &self,
        request: Request<Streaming<ProtoMetric>>,
    ) -> Result<Response<PushResponse>, Status> {
        check_trusted_subnet(&self.state, &request)?;
        let _admit = InflightGuard::enter(&self.state.inflight);
        let mut stream = request.into_inner();
        while let Some(proto_metric) = stream.message().await? {
            let metric = proto_to_metric(proto_metric)?;
            self.state
                .storage
                .push(&metric)
                .await
                .map_err(|error| Status::internal(error.to_string()))?;
        }
        Ok(Response::new(PushResponse {
            success: true,
            message: String::new(),
        }))
    }

    async fn get(&self, request: Request<GetRequest>) -> Result<Response<GetResponse>, Status> {
        check_trusted_subnet(&self.state, &request)?;
        let _admit = InflightGuard::enter(&self.state.inflight);
        let req = request.into_inner();
        let value = self
            .state
            .storage
            .get(&req.r#type, &req.id)
            .await
            .map_err(|error| match error {
                metrics_core::StorageError::NotFound => Status::not_found(error.to_string()),
                metrics_core::StorageError::WrongType => {
                    Status::invalid_argument(error.to_string())
                }
                other => Status::internal(other.to_string()),
            })?;
        Ok(Response::new(GetResponse {
            value: value.to_string(),
        }))
    }

    async fn list(
        &self,
        request: Request<ListRequest>,
    ) -> Result<Response<ListResponse>, Status> {
        check_trusted_subnet(&self.state, &request)?;
        let _admit = InflightGuard::enter(&self.state.inflight);
        let entries = self
            .state
            .storage
            .list()
            .await
            .map_err(|error| Status::internal(error.to_string()))?;
        Ok(Response::new(ListResponse {
            entries: entries
                .into_iter()
                .map(|(name, value)| format!("{name}: {value}"))
                .collect(),
        }))
    }

    async fn ping(&self, request: Request<PingRequest>) -> Result<Response<PingResponse>, Status> {
        check_trusted_subnet(&self.state, &request)?;
        let _admit = InflightGuard::enter(&self.state.inflight);
        match self.state.storage.ping().await {
            Ok(()) => Ok(Response::new(PingResponse { ok: true })),
            Err(error) => Err(Status::internal(error.to_string())),
        }
    }
}
