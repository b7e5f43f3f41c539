//! Unified HTTP surface (spec.md §4.7): `/summary/events` (SSE),
//! `/summary/resync`, `/metrics`, `/summary/health`. Router assembly
//! mirrors the backend's `Router::new().merge(...)` + `CorsLayer`
//! bootstrap pattern.

use super::auth::{check_ip_allowlist, check_token, check_ua_allowlist, AuthDecision, ConnectionRateLimiter};
use super::{Publisher, SseEvent};
use crate::config::Settings;
use crate::health::HealthMonitor;
use crate::metrics::Registry;
use crate::panels::read_panel;
use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{HeaderMap, HeaderValue, Request, StatusCode},
    middleware::{self, Next},
    response::sse::{Event, KeepAlive, Sse},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use futures_util::stream::{self, Stream};
use std::collections::VecDeque;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use uuid::Uuid;

/// Bumped whenever the wire shape of SSE payloads changes in a
/// client-visible way (spec.md §4.7 "hello ... with schema_version").
const SSE_SCHEMA_VERSION: u32 = 1;

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub metrics: Arc<Registry>,
    pub publisher: Arc<Publisher>,
    pub health: Arc<HealthMonitor>,
    pub rate_limiter: Arc<ConnectionRateLimiter>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/summary/events", get(events_handler))
        .route("/summary/resync", get(resync_handler))
        .route("/metrics", get(metrics_handler))
        .route("/summary/health", get(health_handler))
        .layer(middleware::from_fn(echo_request_id))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Echoes `X-Request-ID` on every response, generating one if the caller
/// didn't send one (spec.md §4.7 "Echo X-Request-ID back on all responses").
async fn echo_request_id(req: Request<Body>, next: Next) -> Response {
    let rid = request_id(req.headers());
    let mut response = next.run(req).await;
    if let Ok(value) = HeaderValue::from_str(&rid) {
        response.headers_mut().insert("X-Request-ID", value);
    }
    response
}

fn authorize(state: &AppState, headers: &HeaderMap, ip: std::net::IpAddr) -> Result<(), StatusCode> {
    let token = headers.get("X-API-Token").and_then(|v| v.to_str().ok());
    if matches!(check_token(&state.settings.sse_api_token, token), AuthDecision::Unauthorized) {
        return Err(StatusCode::UNAUTHORIZED);
    }
    if matches!(check_ip_allowlist(&state.settings.sse_ip_allowlist, ip), AuthDecision::Forbidden) {
        return Err(StatusCode::FORBIDDEN);
    }
    let ua = headers.get("User-Agent").and_then(|v| v.to_str().ok());
    if matches!(check_ua_allowlist(&state.settings.sse_ua_allow, ua), AuthDecision::Forbidden) {
        return Err(StatusCode::FORBIDDEN);
    }
    Ok(())
}

fn request_id(headers: &HeaderMap) -> String {
    headers
        .get("X-Request-ID")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

async fn events_handler(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, StatusCode> {
    if !state.settings.sse_http {
        return Err(StatusCode::NOT_FOUND);
    }
    authorize(&state, &headers, addr.ip())?;
    let rid = request_id(&headers);

    if !state.rate_limiter.allow(addr.ip()) {
        state.metrics.inc("g6_sse_http_connections_total", &[("result", "rejected_rate")], 1);
        return Err(StatusCode::TOO_MANY_REQUESTS);
    }

    let (client_id, queue) = state.publisher.register(addr.ip());
    tracing::info!(request_id = %rid, client_id = %client_id, ip = %addr.ip(), "sse client connected");

    let (panels, hashes) = panels_and_hashes(&state.settings.panels_dir);
    let hello = SseEvent::Hello {
        client_id: client_id.to_string(),
        schema_version: SSE_SCHEMA_VERSION,
        panel_hashes: serde_json::Value::Object(hashes),
    }
    .render();
    let full_snapshot = SseEvent::FullSnapshot { panels: serde_json::Value::Object(panels) }.render();
    let pending: VecDeque<String> = VecDeque::from([hello, full_snapshot]);

    let guard = UnregisterGuard { publisher: state.publisher.clone(), client_id };

    let stream = stream::unfold((pending, queue, guard), move |(mut pending, queue, guard)| async move {
        let frame = match pending.pop_front() {
            Some(frame) => frame,
            None => queue.pop().await,
        };
        Some((Ok(Event::default().data(frame)), (pending, queue, guard)))
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

/// Unregisters the client from the Publisher registry when the SSE stream
/// is dropped — axum drops the response body's stream once it stops polling
/// it, which is how a client disconnect surfaces here (spec.md §4.7 "client
/// count reflects actually-connected clients").
struct UnregisterGuard {
    publisher: Arc<Publisher>,
    client_id: Uuid,
}

impl Drop for UnregisterGuard {
    fn drop(&mut self) {
        self.publisher.unregister(self.client_id);
    }
}

async fn resync_handler(State(state): State<AppState>, headers: HeaderMap, ConnectInfo(addr): ConnectInfo<SocketAddr>) -> Response {
    if let Err(code) = authorize(&state, &headers, addr.ip()) {
        return code.into_response();
    }
    state.metrics.inc("g6_sse_resync_requests_total", &[], 1);
    let (panels, hashes) = panels_and_hashes(&state.settings.panels_dir);
    axum::Json(serde_json::json!({ "panels": panels, "panel_hashes": hashes })).into_response()
}

/// Reads every known panel and returns its serialized envelopes alongside
/// their content hashes, shared between `/summary/resync` and the SSE
/// `hello`/`full_snapshot` pair so both surfaces agree on panel state.
fn panels_and_hashes(panels_dir: &str) -> (serde_json::Map<String, serde_json::Value>, serde_json::Map<String, serde_json::Value>) {
    let dir = std::path::Path::new(panels_dir);
    let panel_names = ["indices_info", "system", "indices_stream", "alerts"];
    let mut panels = serde_json::Map::new();
    let mut hashes = serde_json::Map::new();
    for name in panel_names {
        if let Ok(envelope) = read_panel(dir, name) {
            let hash = content_hash(&envelope.data);
            hashes.insert(name.to_string(), serde_json::Value::String(hash));
            panels.insert(name.to_string(), serde_json::to_value(&envelope).unwrap());
        }
    }
    (panels, hashes)
}

/// Content hash for `panel_hashes` (spec.md §9 open question): a
/// FNV-1a-style hash over the panel's serialized JSON body, chosen because
/// it depends only on panel content, not on wall-clock time, so an
/// unchanged panel always resyncs with the same hash.
fn content_hash(value: &serde_json::Value) -> String {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    value.to_string().hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

async fn metrics_handler(State(state): State<AppState>) -> Response {
    let body = state.metrics.render();
    (
        StatusCode::OK,
        [("Content-Type", "text/plain; version=0.0.4")],
        body,
    )
        .into_response()
}

async fn health_handler(State(state): State<AppState>) -> Response {
    let snapshot = state.health.snapshot();
    let status = if snapshot.healthy { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status, axum::Json(snapshot)).into_response()
}
