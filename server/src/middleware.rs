//! The seven-step request pipeline: admit (WaitGroup) -> HMAC authenticate ->
//! decrypt -> log & trusted-subnet check -> decompress -> dispatch-tag ->
//! response gzip-encode. Each step is an `axum::middleware::from_fn` layer,
//! composed in `crate::main::build_app`. Buffering the body once per layer
//! and re-wrapping it for the next mirrors the teacher's `auth.rs` /
//! `http_metrics.rs` pattern of reading `Request<Body>` and constructing a
//! fresh request around the bytes it needs to inspect.

use std::sync::atomic::Ordering;
use std::time::Instant;

use axum::body::{to_bytes, Body};
use axum::extract::State;
use axum::http::{HeaderMap, Request};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use std::io::{Read, Write};

use crate::errors::ApiError;
use crate::state::AppState;

const MAX_BUFFER_BYTES: usize = 64 * 1024 * 1024;

pub(crate) async fn admit(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    state.inflight.fetch_add(1, Ordering::SeqCst);
    let response = next.run(request).await;
    state.inflight.fetch_sub(1, Ordering::SeqCst);
    response
}

pub(crate) async fn hmac_authenticate(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let Some(key) = state.hmac_key.clone() else {
        return next.run(request).await;
    };

    let (parts, body) = request.into_parts();
    let signature = parts
        .headers
        .get("HashSHA256")
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);

    let bytes = match to_bytes(body, MAX_BUFFER_BYTES).await {
        Ok(bytes) => bytes,
        Err(error) => return ApiError::invalid_argument(error.to_string()).into_response(),
    };

    let Some(signature) = signature else {
        state.metrics.auth_failures_total.fetch_add(1, Ordering::Relaxed);
        return ApiError::invalid_argument("missing HashSHA256 header").into_response();
    };

    let mut mac = match Hmac::<Sha256>::new_from_slice(&key) {
        Ok(mac) => mac,
        Err(_) => return ApiError::internal("invalid server hmac key").into_response(),
    };
    mac.update(&bytes);
    let expected = hex::encode(mac.finalize().into_bytes());

    if !constant_time_eq(expected.as_bytes(), signature.as_bytes()) {
        state.metrics.auth_failures_total.fetch_add(1, Ordering::Relaxed);
        return ApiError::invalid_argument("signature mismatch").into_response();
    }

    let request = Request::from_parts(parts, Body::from(bytes));
    next.run(request).await
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[derive(Deserialize)]
struct EncryptedEnvelope {
    data: String,
}

pub(crate) async fn decrypt(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let Some(private_key) = state.crypto_private_key.clone() else {
        return next.run(request).await;
    };

    let (parts, body) = request.into_parts();
    let bytes = match to_bytes(body, MAX_BUFFER_BYTES).await {
        Ok(bytes) => bytes,
        Err(error) => return ApiError::invalid_argument(error.to_string()).into_response(),
    };
    if bytes.is_empty() {
        let request = Request::from_parts(parts, Body::from(bytes));
        return next.run(request).await;
    }

    let envelope: EncryptedEnvelope = match serde_json::from_slice(&bytes) {
        Ok(envelope) => envelope,
        Err(error) => return ApiError::invalid_argument(error.to_string()).into_response(),
    };
    let ciphertext = match BASE64.decode(envelope.data) {
        Ok(ciphertext) => ciphertext,
        Err(_) => return ApiError::invalid_argument("invalid base64 envelope").into_response(),
    };
    let padding = rsa::Oaep::new::<Sha256>();
    let plaintext = match private_key.decrypt(padding, &ciphertext) {
        Ok(plaintext) => plaintext,
        Err(_) => return ApiError::invalid_argument("decryption failed").into_response(),
    };

    let request = Request::from_parts(parts, Body::from(plaintext));
    next.run(request).await
}

pub(crate) async fn log_and_check_subnet(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if let Some(subnet) = state.config.trusted_subnet {
        let real_ip = request
            .headers()
            .get("X-Real-IP")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse().ok());
        let allowed = real_ip.map(|ip| subnet.contains(&ip)).unwrap_or(false);
        if !allowed {
            state
                .metrics
                .trusted_subnet_rejections_total
                .fetch_add(1, Ordering::Relaxed);
            return ApiError::unauthorized("source not in trusted subnet").into_response();
        }
    }

    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let started = Instant::now();

    let response = next.run(request).await;

    let duration_us = started.elapsed().as_micros() as u64;
    let status = response.status();
    state.metrics.record_response(status, duration_us);

    tracing::info!(
        %method,
        %path,
        status = status.as_u16(),
        duration_ms = started.elapsed().as_millis() as u64,
        "request handled"
    );

    response
}

pub(crate) async fn decompress(request: Request<Body>, next: Next) -> Response {
    let is_gzip = request
        .headers()
        .get(axum::http::header::CONTENT_ENCODING)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.eq_ignore_ascii_case("gzip"))
        .unwrap_or(false);

    if !is_gzip {
        return next.run(request).await;
    }

    let (mut parts, body) = request.into_parts();
    let bytes = match to_bytes(body, MAX_BUFFER_BYTES).await {
        Ok(bytes) => bytes,
        Err(error) => return ApiError::invalid_argument(error.to_string()).into_response(),
    };

    let mut decoder = GzDecoder::new(bytes.as_ref());
    let mut decompressed = Vec::new();
    if let Err(error) = decoder.read_to_end(&mut decompressed) {
        return ApiError::invalid_argument(format!("invalid gzip body: {error}")).into_response();
    }

    parts.headers.remove(axum::http::header::CONTENT_ENCODING);
    let request = Request::from_parts(parts, Body::from(decompressed));
    next.run(request).await
}

/// Tags the request with its dispatch shape (single update, JSON stream,
/// bulk array) as a request extension so handlers can branch without
/// re-sniffing headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DispatchShape {
    PathForm,
    JsonSingle,
    JsonBulk,
}

pub(crate) async fn tag_dispatch_shape(mut request: Request<Body>, next: Next) -> Response {
    let shape = if request.uri().path().starts_with("/updates") {
        DispatchShape::JsonBulk
    } else if request
        .headers()
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.starts_with("application/json"))
        .unwrap_or(false)
    {
        DispatchShape::JsonSingle
    } else {
        DispatchShape::PathForm
    };
    request.extensions_mut().insert(shape);
    next.run(request).await
}

pub(crate) async fn gzip_encode_response(
    headers: HeaderMap,
    request: Request<Body>,
    next: Next,
) -> Response {
    let accepts_gzip = headers
        .get(axum::http::header::ACCEPT_ENCODING)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.contains("gzip"))
        .unwrap_or(false);

    let response = next.run(request).await;
    if !accepts_gzip {
        return response;
    }

    let (mut parts, body) = response.into_parts();
    let bytes = match to_bytes(body, MAX_BUFFER_BYTES).await {
        Ok(bytes) => bytes,
        Err(_) => return Response::from_parts(parts, Body::empty()),
    };

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    if let Err(_) = encoder.write_all(&bytes) {
        return Response::from_parts(parts, Body::from(bytes));
    }
    let encoded = match encoder.finish() {
        Ok(encoded) => encoded,
        Err(_) => return Response::from_parts(parts, Body::from(bytes)),
    };

    parts
        .headers
        .insert(axum::http::header::CONTENT_ENCODING, "gzip".parse().unwrap());
    Response::from_parts(parts, Body::from(encoded))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_time_eq_matches_identical_strings() {
        assert!(constant_time_eq(b"abc123", b"abc123"));
    }

    #[test]
    fn constant_time_eq_rejects_different_strings() {
        assert!(!constant_time_eq(b"abc123", b"abc124"));
    }

    #[test]
    fn constant_time_eq_rejects_different_lengths() {
        assert!(!constant_time_eq(b"short", b"much longer string"));
    }

    #[test]
    fn hmac_signature_is_deterministic_for_same_key_and_body() {
        let key = b"shared-secret";
        let body = b"compressed-bytes-go-here";

        let mut mac_a = Hmac::<Sha256>::new_from_slice(key).unwrap();
        mac_a.update(body);
        let sig_a = hex::encode(mac_a.finalize().into_bytes());

        let mut mac_b = Hmac::<Sha256>::new_from_slice(key).unwrap();
        mac_b.update(body);
        let sig_b = hex::encode(mac_b.finalize().into_bytes());

        assert_eq!(sig_a, sig_b);
        assert!(constant_time_eq(sig_a.as_bytes(), sig_b.as_bytes()));
    }
}
