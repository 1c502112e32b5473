use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, Method, Uri};
use axum::response::Response;

use crate::errors::AppError;
use crate::proxy::forwarder::Outcome;
use crate::proxy::upstream::ProxyRequest;
use crate::AppState;

/// Mount point of the proxy; everything below it is relayed upstream.
pub const PROXY_PREFIX: &str = "/api";

/// Relays any request under [`PROXY_PREFIX`] through the credential pool.
#[tracing::instrument(skip(state, headers, body), fields(req_id = %uuid::Uuid::new_v4()))]
pub async fn proxy_handler(
    State(state): State<Arc<AppState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, AppError> {
    let start = Instant::now();

    let path = upstream_path(uri.path());
    let req = ProxyRequest {
        method,
        path,
        query: uri.query().map(String::from),
        headers,
        body,
    };

    let (upstream, outcome) = state.forwarder.handle(req).await?;

    tracing::info!(
        status = upstream.status.as_u16(),
        rejected = outcome == Outcome::AuthRejected,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "proxied request"
    );

    let mut response = Response::builder().status(upstream.status);
    if let Some(h) = response.headers_mut() {
        h.extend(upstream.headers);
    }
    response
        .body(upstream.body)
        .map_err(|e| AppError::Internal(anyhow::anyhow!("response build failed: {}", e)))
}

/// `/api/shodan/host/1.1.1.1` → `/shodan/host/1.1.1.1`; `/api` → `/`.
fn upstream_path(full: &str) -> String {
    let rest = full.strip_prefix(PROXY_PREFIX).unwrap_or(full);
    if rest.starts_with('/') {
        rest.to_string()
    } else {
        format!("/{}", rest)
    }
}
