//! Integration tests for the unified HTTP surface (spec.md §4.7):
//! `/summary/health`, `/metrics`, and `/summary/resync` exercised through a
//! real `tower::Service`, not unit-level handler calls.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use g6_collector::config::{PipelineMode, Settings, StreamGateMode};
use g6_collector::domain::IndexParams;
use g6_collector::health::HealthMonitor;
use g6_collector::metrics::Registry;
use g6_collector::panels::PanelsWriter;
use g6_collector::sse::auth::ConnectionRateLimiter;
use g6_collector::sse::http::{build_router, AppState};
use g6_collector::sse::Publisher;
use std::sync::Arc;
use tower::ServiceExt;

fn test_settings(panels_dir: &std::path::Path) -> Arc<Settings> {
    Arc::new(Settings {
        interval_seconds: 60,
        indices: vec![IndexParams {
            symbol: "NIFTY".to_string(),
            enabled: true,
            expiry_rules: vec![],
            strikes_itm: 2,
            strikes_otm: 2,
            strike_step: 50.0,
        }],
        market_hours_only: false,
        min_volume: 0,
        min_oi: 0,
        volume_percentile: 0.0,
        foreign_expiry_salvage: false,
        trace_collector: false,
        quiet_mode: false,
        provider_outage_threshold: 3,
        provider_outage_log_every: 10,
        auto_snapshots: true,
        pipeline_mode: PipelineMode::Legacy,
        stream_gate_mode: StreamGateMode::Auto,
        sse_http: true,
        sse_structured: true,
        sse_struct_max_changes: 40,
        sse_ip_conn_rate: 30,
        sse_ua_allow: vec![],
        sse_api_token: None,
        sse_ip_allowlist: vec![],
        metrics_batch: false,
        metrics_batch_interval_ms: 1000,
        metrics_strict_duplicate: false,
        egress_frozen: false,
        suppress_deprecations: false,
        heartbeat_interval_secs: 10,
        panels_dir: panels_dir.to_string_lossy().to_string(),
        csv_root: panels_dir.join("csv").to_string_lossy().to_string(),
        status_path: panels_dir.join("runtime_status.json").to_string_lossy().to_string(),
        http_bind: "0.0.0.0:9315".to_string(),
        provider_rate_per_sec: 5.0,
        provider_rate_burst: 10.0,
        provider_rate_max_wait_secs: 5.0,
        parity_window: 20,
        parity_drift_threshold_cycles: 3,
        parity_score_threshold: 0.9,
    })
}

fn app_state(dir: &std::path::Path) -> AppState {
    let metrics = Arc::new(Registry::new_for_test());
    let settings = test_settings(dir);
    AppState {
        settings,
        metrics: metrics.clone(),
        publisher: Arc::new(Publisher::new(16, metrics.clone())),
        health: Arc::new(HealthMonitor::new(metrics)),
        rate_limiter: Arc::new(ConnectionRateLimiter::new(30)),
    }
}

#[tokio::test]
async fn health_endpoint_reports_healthy_with_no_checks_registered() {
    let dir = tempfile::tempdir().unwrap();
    let router = build_router(app_state(dir.path()));

    let response = router
        .oneshot(Request::builder().uri("/summary/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers().get("X-Request-ID").is_some(), true);
}

#[tokio::test]
async fn metrics_endpoint_renders_prometheus_text() {
    let dir = tempfile::tempdir().unwrap();
    let router = build_router(app_state(dir.path()));

    let response = router
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.contains("g6_collection_cycles_total"));
}

#[tokio::test]
async fn resync_returns_committed_panels_and_hashes() {
    let dir = tempfile::tempdir().unwrap();
    let writer = PanelsWriter::new(dir.path(), false);
    let mut txn = writer.begin_txn();
    txn.write_panel("indices_info", serde_json::json!({"NIFTY": {"ltp": 20000.0}}));
    txn.commit().unwrap();

    let router = build_router(app_state(dir.path()));
    let mut req = Request::builder().uri("/summary/resync").body(Body::empty()).unwrap();
    req.extensions_mut()
        .insert(axum::extract::ConnectInfo(std::net::SocketAddr::from(([127, 0, 0, 1], 9999))));

    let response = router.oneshot(req).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert!(json["panel_hashes"]["indices_info"].is_string());
    assert!(json["panels"]["indices_info"]["data"]["NIFTY"]["ltp"].as_f64().unwrap() > 0.0);
}

#[tokio::test]
async fn unknown_route_returns_404() {
    let dir = tempfile::tempdir().unwrap();
    let router = build_router(app_state(dir.path()));

    let response = router
        .oneshot(Request::builder().uri("/not/a/route").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
