//! Request routing.
//!
//! A single fallback handler carries the whole proxy surface: `GET`/`HEAD`
//! take the caching path, `PURGE` takes the purge path, and everything else
//! is proxied straight through. Admin endpoints live under `/_ledge/` to
//! stay clear of origin paths.

use axum::{
    body::Body,
    extract::{Request, State},
    http::{header::HOST, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use ledge_core::{
    lifecycle::{ClientRequest, LifecycleError, RequestLifecycle},
    purge::{PurgeCoordinator, PurgeError, PurgeMode},
    store::MetadataStore,
    types::HeaderBag,
    worker::WorkerHeartbeat,
};
use std::sync::Arc;
use tracing::{error, warn};

/// The worker is considered live when it ticked within this window. Well
/// above any sane poll interval, well below an operator's patience.
const WORKER_LIVENESS_WINDOW_SECS: u64 = 30;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub lifecycle: Arc<RequestLifecycle>,
    pub purge: Arc<PurgeCoordinator>,
    pub store: Arc<dyn MetadataStore>,
    pub worker_heartbeat: Arc<WorkerHeartbeat>,
    pub request_body_limit: usize,
}

/// Parses an incoming request into the engine's representation.
async fn parse_request(request: Request, body_limit: usize) -> Result<ClientRequest, Response> {
    let (parts, body) = request.into_parts();

    let host = parts
        .headers
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| parts.uri.host().map(str::to_string))
        .unwrap_or_else(|| "localhost".to_string());

    let mut headers = HeaderBag::new();
    for (name, value) in &parts.headers {
        if let Ok(value) = value.to_str() {
            headers.append(name.as_str(), value);
        }
    }

    let body = match axum::body::to_bytes(body, body_limit).await {
        Ok(bytes) if bytes.is_empty() => None,
        Ok(bytes) => Some(bytes),
        Err(e) => {
            warn!(error = %e, "request body rejected");
            return Err(
                (StatusCode::PAYLOAD_TOO_LARGE, "request body too large".to_string())
                    .into_response(),
            );
        }
    };

    Ok(ClientRequest {
        method: parts.method.as_str().to_string(),
        scheme: "http".to_string(),
        host,
        path: parts.uri.path().to_string(),
        query: parts.uri.query().map(str::to_string),
        headers,
        body,
    })
}

/// The proxy surface: caching for GET/HEAD, purging for PURGE, pass-through
/// for the rest.
pub async fn handle_request(State(state): State<AppState>, request: Request) -> Response {
    let client_request = match parse_request(request, state.request_body_limit).await {
        Ok(parsed) => parsed,
        Err(rejection) => return rejection,
    };

    if client_request.method.eq_ignore_ascii_case("PURGE") {
        return handle_purge(&state, &client_request).await;
    }

    match state.lifecycle.handle(client_request).await {
        Ok(response) => client_response_into_http(response),
        Err(LifecycleError::Origin(e)) => {
            warn!(error = %e, "origin unreachable");
            (StatusCode::BAD_GATEWAY, format!("upstream error: {e}")).into_response()
        }
        Err(e) => {
            error!(error = %e, "request failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string()).into_response()
        }
    }
}

async fn handle_purge(state: &AppState, request: &ClientRequest) -> Response {
    let mode = match PurgeMode::from_header(request.headers.get("X-Purge")) {
        Ok(mode) => mode,
        Err(e) => {
            return (StatusCode::BAD_REQUEST, Json(serde_json::json!({ "error": e.to_string() })))
                .into_response()
        }
    };

    match state.purge.purge(request, mode).await {
        Ok(outcome) => {
            let status = if outcome.result.action_taken() {
                StatusCode::OK
            } else {
                StatusCode::NOT_FOUND
            };
            (status, Json(outcome)).into_response()
        }
        Err(PurgeError::InvalidMode(mode)) => (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": format!("invalid purge mode: {mode}") })),
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "purge failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": "internal error" })),
            )
                .into_response()
        }
    }
}

/// Converts the engine response into an HTTP response, dropping any header
/// that does not survive `http` validation.
fn client_response_into_http(response: ledge_core::lifecycle::ClientResponse) -> Response {
    let status =
        StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut builder = axum::http::Response::builder().status(status);
    for (name, value) in response.headers.iter() {
        match (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(value)) {
            (Ok(name), Ok(value)) => builder = builder.header(name, value),
            _ => warn!(header = name, "dropping unrepresentable header"),
        }
    }
    builder
        .body(Body::from(response.body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Liveness endpoint: reports store reachability and worker liveness.
///
/// An unreachable store is a hard failure (503); a stale worker degrades
/// the status but keeps serving, since the request path still works.
pub async fn handle_health(State(state): State<AppState>) -> impl IntoResponse {
    let store_reachable = state.store.ping().await.is_ok();
    let now = ledge_core::types::unix_now();
    let worker_live = state.worker_heartbeat.is_live(now, WORKER_LIVENESS_WINDOW_SECS);

    let status = if !store_reachable {
        "unhealthy"
    } else if worker_live {
        "healthy"
    } else {
        "degraded"
    };
    let health = serde_json::json!({
        "status": status,
        "store": { "reachable": store_reachable },
        "worker": {
            "live": worker_live,
            "last_tick": state.worker_heartbeat.last_tick(),
        },
        "timestamp": chrono::Utc::now().to_rfc3339(),
    });

    (
        if store_reachable { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE },
        [("content-type", "application/json")],
        serde_json::to_string(&health).unwrap_or_default(),
    )
}

/// Prometheus text exposition endpoint.
pub async fn handle_metrics() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        ledge_core::metrics::render(),
    )
}
