//! HTTP proxy logic: strip hop-by-hop headers, inject configured headers,
//! forward through a provider's `credential_pool::Engine`, and relay the
//! response back unchanged.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::response::{IntoResponse, Response};
use credential_pool::Engine;
use tracing::{info, warn};

use crate::config::HeaderInjection;
use crate::error::{Error, Result};
use crate::metrics;

const MAX_BODY_BYTES: usize = 32 * 1024 * 1024;

/// Headers to strip before forwarding (hop-by-hop, RFC 7230 6.1).
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
];

pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS.iter().any(|h| h.eq_ignore_ascii_case(name))
}

/// Proxy a single incoming request to `upstream_url` through `engine`,
/// injecting `headers_to_inject` and tagging it on the client with
/// `timeout`. Runs the request through the engine's Executor, so account
/// rotation, refresh, and rate-limit handling all happen transparently.
///
/// `request_id` is a per-request correlation id (`req_<uuid>`), generated
/// by the caller and carried through every log line for this request so
/// the proxy's retries/rotations can be traced end to end without it
/// becoming a Prometheus label (unbounded cardinality).
pub async fn proxy_request(
    engine: &Engine,
    provider_label: &str,
    request_id: &str,
    upstream_url: &str,
    headers_to_inject: &[HeaderInjection],
    timeout: Duration,
    client: &reqwest::Client,
    request: axum::http::Request<Body>,
) -> Result<Response> {
    let started = Instant::now();
    let method = request.method().clone();
    let (parts, body) = request.into_parts();

    let body_bytes = axum::body::to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|e| Error::InvalidRequest(format!("could not read request body: {e}")))?;

    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|p| p.as_str())
        .unwrap_or("/");
    let upstream_url = upstream_url.trim_end_matches('/');
    let url = format!("{upstream_url}{path_and_query}");

    let headers = parts.headers.clone();
    let injected = headers_to_inject.to_vec();

    let client = client.clone();
    let method_for_closure = method.clone();
    let url_for_closure = url.clone();
    let build_request = move || -> reqwest::Request {
        let mut builder = client
            .request(method_for_closure.clone(), &url_for_closure)
            .timeout(timeout)
            .body(body_bytes.clone());
        for (name, value) in headers.iter() {
            if is_hop_by_hop(name.as_str()) {
                continue;
            }
            builder = builder.header(name, value);
        }
        for header in &injected {
            builder = builder.header(&header.name, &header.value);
        }
        builder.build().expect("request built from a valid incoming request")
    };

    info!(request_id, provider = provider_label, %method, "proxying request");
    let response = engine.execute(build_request).await;

    let duration_secs = started.elapsed().as_secs_f64();
    match response {
        Ok(response) => {
            let status = response.status().as_u16();
            info!(request_id, status, duration_secs, "proxy request completed");
            metrics::record_request(provider_label, status, method.as_str(), duration_secs);
            Ok(convert_response(response).await)
        }
        Err(e) => {
            warn!(request_id, error = %e, "proxy request failed");
            metrics::record_upstream_error(provider_label, classify_error(&e));
            Err(Error::Pool(e))
        }
    }
}

fn classify_error(error: &credential_pool::Error) -> &'static str {
    match error {
        credential_pool::Error::AllAccountsUnavailable(_) => "no_account",
        credential_pool::Error::RetriesExhausted(_) => "retries_exhausted",
        credential_pool::Error::RefreshFailed(_) => "refresh_failed",
        credential_pool::Error::TransportFailed(_) => "transport_failed",
        _ => "other",
    }
}

async fn convert_response(response: reqwest::Response) -> Response {
    let status = response.status();
    let headers = response.headers().clone();
    let body = response.bytes().await.unwrap_or_default();

    let mut builder = axum::http::Response::builder().status(status);
    for (name, value) in headers.iter() {
        if is_hop_by_hop(name.as_str()) {
            continue;
        }
        builder = builder.header(name, value);
    }
    builder
        .body(Body::from(body))
        .unwrap_or_else(|_| status.into_response())
}

pub fn upstream_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .expect("reqwest client configuration is always valid")
}

pub type SharedEngine = Arc<Engine>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hop_by_hop_detection() {
        assert!(is_hop_by_hop("Connection"));
        assert!(is_hop_by_hop("TRANSFER-ENCODING"));
        assert!(is_hop_by_hop("Host"));
        assert!(!is_hop_by_hop("Content-Type"));
        assert!(!is_hop_by_hop("Authorization"));
    }

    #[test]
    fn classifies_known_pool_errors() {
        assert_eq!(
            classify_error(&credential_pool::Error::AllAccountsUnavailable("none".into())),
            "no_account"
        );
        assert_eq!(classify_error(&credential_pool::Error::RetriesExhausted(3)), "retries_exhausted");
        assert_eq!(
            classify_error(&credential_pool::Error::RefreshFailed("bad".into())),
            "refresh_failed"
        );
        assert_eq!(
            classify_error(&credential_pool::Error::TransportFailed("dns error".into())),
            "transport_failed"
        );
    }
}
