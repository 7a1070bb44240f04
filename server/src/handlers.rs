use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{Method, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::Json;
use metrics_core::{validate_and_convert, Metric, WireMetric, KIND_COUNTER, KIND_GAUGE};

use crate::errors::{map_model_error, map_storage_error, ApiError};
use crate::state::AppState;

/// `/update/{kind}/{name}/{value}` and its GET counterpart — a GET coerces
/// the path's value component to `"0"` before validation, matching the
/// original agent-facing contract.
pub(crate) async fn update_path_form(
    State(state): State<AppState>,
    method: Method,
    Path((kind, name, value)): Path<(String, String, String)>,
) -> Response {
    let metric = match validate_and_convert(method == Method::GET, &kind, &name, &value) {
        Ok(metric) => metric,
        Err(error) => return map_model_error(error).into_response(),
    };

    match state.storage.push(&metric).await {
        Ok(()) => (StatusCode::OK, "Success").into_response(),
        Err(error) => map_storage_error(error).into_response(),
    }
}

/// `/update/` — one or more line-delimited JSON-encoded metrics, decoded
/// lazily (one object at a time, not buffered as a whole array) and each
/// echoed back with its stored value (the running sum, for a counter). A
/// single-object body — the common case — replies with a single object
/// rather than a one-element array, matching the original single-metric
/// contract.
pub(crate) async fn update_json(State(state): State<AppState>, body: Bytes) -> Response {
    let wires = match decode_wire_stream(&body) {
        Ok(wires) => wires,
        Err(error) => return ApiError::invalid_argument(error.to_string()).into_response(),
    };
    if wires.is_empty() {
        return ApiError::invalid_argument("request body contained no metrics").into_response();
    }

    let mut echoes = Vec::with_capacity(wires.len());
    for wire in wires {
        match push_and_echo(&state, wire).await {
            Ok(echo) => echoes.push(echo),
            Err(response) => return response,
        }
    }

    if echoes.len() == 1 {
        Json(echoes.into_iter().next().unwrap()).into_response()
    } else {
        Json(echoes).into_response()
    }
}

/// `/updates/` — a JSON array of metrics, applied in order. The response is
/// the same array with each entry's post-write value substituted, so the
/// caller observes the authoritative stored state without a follow-up read.
pub(crate) async fn update_json_bulk(
    State(state): State<AppState>,
    Json(wires): Json<Vec<WireMetric>>,
) -> Response {
    let mut echoes = Vec::with_capacity(wires.len());
    for wire in wires {
        match push_and_echo(&state, wire).await {
            Ok(echo) => echoes.push(echo),
            Err(response) => return response,
        }
    }
    Json(echoes).into_response()
}

/// Decodes a stream of whitespace-separated JSON objects, as produced by a
/// client writing one metric per line. `serde_json`'s `Deserializer` handles
/// this without requiring array brackets.
fn decode_wire_stream(body: &[u8]) -> Result<Vec<WireMetric>, serde_json::Error> {
    serde_json::Deserializer::from_slice(body)
        .into_iter::<WireMetric>()
        .collect()
}

async fn push_and_echo(state: &AppState, wire: WireMetric) -> Result<WireMetric, Response> {
    let metric: Metric = wire.try_into().map_err(|error| map_model_error(error).into_response())?;
    state
        .storage
        .push(&metric)
        .await
        .map_err(|error| map_storage_error(error).into_response())?;

    let value = state
        .storage
        .get(metric.kind(), metric.name())
        .await
        .map_err(|error| map_storage_error(error).into_response())?;
    Ok(to_wire(metric.kind(), metric.name(), value))
}

fn to_wire(kind: &str, name: &str, value: f64) -> WireMetric {
    if kind == KIND_COUNTER {
        WireMetric {
            id: name.to_string(),
            kind: KIND_COUNTER.to_string(),
            value: None,
            delta: Some(value as i64),
        }
    } else {
        WireMetric {
            id: name.to_string(),
            kind: KIND_GAUGE.to_string(),
            value: Some(value),
            delta: None,
        }
    }
}

/// `/value/{kind}/{name}` — plain-text value, 404 if unknown.
pub(crate) async fn value_path_form(
    State(state): State<AppState>,
    Path((kind, name)): Path<(String, String)>,
) -> Response {
    if kind != KIND_GAUGE && kind != KIND_COUNTER {
        return ApiError::invalid_argument("metric type must be gauge or counter").into_response();
    }
    match state.storage.get(&kind, &name).await {
        Ok(value) => value.to_string().into_response(),
        Err(error) => map_storage_error(error).into_response(),
    }
}

/// `/value/` — JSON-form lookup, returning the same shape as `/update/`.
pub(crate) async fn value_json(
    State(state): State<AppState>,
    Json(wire): Json<WireMetric>,
) -> Response {
    if wire.id.is_empty() {
        return ApiError::invalid_argument("metric id must not be empty").into_response();
    }
    if wire.kind != KIND_GAUGE && wire.kind != KIND_COUNTER {
        return ApiError::invalid_argument("metric type must be gauge or counter").into_response();
    }
    match state.storage.get(&wire.kind, &wire.id).await {
        Ok(value) => Json(to_wire(&wire.kind, &wire.id, value)).into_response(),
        Err(error) => map_storage_error(error).into_response(),
    }
}

/// `/` — an HTML page listing every known metric and its current value.
pub(crate) async fn list_html(State(state): State<AppState>) -> Response {
    match state.storage.list().await {
        Ok(entries) => {
            let mut body = String::from("<html><body><ul>");
            for (name, value) in entries {
                body.push_str(&format!("<li>{name}: {value}</li>"));
            }
            body.push_str("</ul></body></html>");
            Html(body).into_response()
        }
        Err(error) => map_storage_error(error).into_response(),
    }
}

/// `/ping` — confirms the configured storage backend is reachable.
pub(crate) async fn ping(State(state): State<AppState>) -> Response {
    match state.storage.ping().await {
        Ok(()) => (StatusCode::OK, "ok").into_response(),
        Err(error) => {
            tracing::error!(%error, "ping failed");
            ApiError::service_unavailable("storage backend unreachable").into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn to_wire_encodes_gauge_as_value() {
        let wire = to_wire(KIND_GAUGE, "Alloc", 12.5);
        assert_eq!(wire.value, Some(12.5));
        assert_eq!(wire.delta, None);
    }

    #[test]
    fn to_wire_encodes_counter_as_delta() {
        let wire = to_wire(KIND_COUNTER, "PollCount", 3.0);
        assert_eq!(wire.delta, Some(3));
        assert_eq!(wire.value, None);
    }

    #[test]
    fn decode_wire_stream_accepts_single_object() {
        let body = br#"{"id":"Alloc","type":"gauge","value":1.5}"#;
        let wires = decode_wire_stream(body).unwrap();
        assert_eq!(wires.len(), 1);
        assert_eq!(wires[0].id, "Alloc");
    }

    #[test]
    fn decode_wire_stream_accepts_line_delimited_objects() {
        let body = b"{\"id\":\"A\",\"type\":\"gauge\",\"value\":1}\n{\"id\":\"B\",\"type\":\"counter\",\"delta\":2}";
        let wires = decode_wire_stream(body).unwrap();
        assert_eq!(wires.len(), 2);
        assert_eq!(wires[1].id, "B");
    }

    #[test]
    fn decode_wire_stream_rejects_garbage() {
        assert!(decode_wire_stream(b"not json at all").is_err());
    }
}
