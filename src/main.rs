//! G6 Collector process entrypoint: hydrate config, stand up the metrics
//! registry, provider, sink, collector, summary loop and HTTP surface, and
//! run them to completion or clean shutdown.

use anyhow::Result;
use g6_collector::collector::Orchestrator;
use g6_collector::config::Settings;
use g6_collector::error::ErrorRouter;
use g6_collector::health::{CollectorLivenessCheck, HealthMonitor};
use g6_collector::metrics::Registry;
use g6_collector::panels::stream_gater::StreamGater;
use g6_collector::panels::PanelsWriter;
use g6_collector::provider::dummy::DummyProvider;
use g6_collector::provider::rate_limit::{RateLimitedProvider, RateLimiter};
use g6_collector::provider::{FallbackProvider, Provider};
use g6_collector::sse::auth::ConnectionRateLimiter;
use g6_collector::sse::http::{build_router, AppState};
use g6_collector::sse::Publisher;
use g6_collector::storage::csv_sink::CsvSink;
use g6_collector::summary_loop::SummaryLoop;
use std::net::SocketAddr;
use std::sync::atomic::AtomicI64;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const SSE_QUEUE_CAPACITY: usize = 256;

/// Process exit codes (spec.md §6.7). Only the codes meaningful to this
/// implementation's scope are used: the dashboard/recording-rule/alert
/// drift codes (6, 8, 9, 10, 11) belong to a companion observability
/// pipeline this crate does not implement.
mod exit_code {
    pub const OK: i32 = 0;
    pub const CONFIG_INVALID: i32 = 2;
}

/// Logs the health matrix once at startup (spec.md §4.10 "Startup banner
/// renders the current matrix"), before the periodic health sweep takes over.
fn log_startup_banner(health_monitor: &HealthMonitor) {
    let snapshot = health_monitor.snapshot();
    for (component, status) in &snapshot.components {
        tracing::info!(component = %component, healthy = status.healthy, "startup.health_check");
    }
    tracing::info!(healthy = snapshot.healthy, components = snapshot.components.len(), "startup.banner");
}

fn init_tracing(quiet: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if quiet { "warn" } else { "info" }));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().json())
        .init();
}

#[tokio::main]
async fn main() {
    let settings = match Settings::hydrate() {
        Ok(s) => s,
        Err(e) => {
            eprintln!("configuration error: {e:#}");
            std::process::exit(exit_code::CONFIG_INVALID);
        }
    };

    init_tracing(settings.quiet_mode);

    if let Err(e) = run(settings).await {
        tracing::error!(error = %e, "fatal error, shutting down");
        std::process::exit(exit_code::CONFIG_INVALID);
    }
    std::process::exit(exit_code::OK);
}

async fn run(settings: Arc<Settings>) -> Result<()> {
    let metrics = Arc::new(Registry::new(settings.metrics_batch, settings.metrics_strict_duplicate));
    let error_router = Arc::new(ErrorRouter::new(metrics.clone()));

    // TODO: swap DummyProvider for the real broker-backed market-data client
    // once one is wired in; the facade trait plus the rate-limit/fallback
    // wrappers around it are provider-agnostic and don't need to change.
    let provider_rate_limiter = RateLimiter::new(settings.provider_rate_per_sec, settings.provider_rate_burst, metrics.clone());
    let rate_limited = RateLimitedProvider::new(DummyProvider::default(), provider_rate_limiter);
    let provider: Arc<dyn Provider> = Arc::new(FallbackProvider::new(rate_limited, metrics.clone()));
    g6_collector::provider::publish_provider_mode(&metrics, provider.mode());
    let sink = Arc::new(CsvSink::new(&settings.csv_root));

    let orchestrator = Arc::new(Orchestrator::new(
        settings.clone(),
        provider.clone(),
        sink.clone(),
        metrics.clone(),
        error_router.clone(),
    ));

    let panels_writer = Arc::new(PanelsWriter::new(&settings.panels_dir, settings.egress_frozen));
    let stream_gater = Arc::new(StreamGater::new(
        std::path::Path::new(&settings.panels_dir).join(".indices_stream_state.json"),
        settings.stream_gate_mode,
        metrics.clone(),
    ));
    let publisher = Arc::new(Publisher::new(SSE_QUEUE_CAPACITY, metrics.clone()));
    let summary_loop = Arc::new(SummaryLoop::new(
        settings.clone(),
        panels_writer,
        stream_gater,
        publisher.clone(),
        metrics.clone(),
    ));

    let last_cycle_unix = Arc::new(AtomicI64::new(0));
    let mut health_monitor = HealthMonitor::new(metrics.clone());
    health_monitor.register(Box::new(CollectorLivenessCheck::new(
        last_cycle_unix.clone(),
        settings.interval_seconds as i64 * 3,
    )));
    health_monitor.run_checks();
    log_startup_banner(&health_monitor);
    let health_monitor = Arc::new(health_monitor);

    let rate_limiter = Arc::new(ConnectionRateLimiter::new(settings.sse_ip_conn_rate));
    let app_state = AppState {
        settings: settings.clone(),
        metrics: metrics.clone(),
        publisher: publisher.clone(),
        health: health_monitor.clone(),
        rate_limiter,
    };

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let mut collector_task = {
        let orchestrator = orchestrator.clone();
        let summary_loop = summary_loop.clone();
        let last_cycle_unix = last_cycle_unix.clone();
        let health_monitor = health_monitor.clone();
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            orchestrator
                .run(shutdown, |stats| {
                    let last_cycle_unix = last_cycle_unix.clone();
                    let health_monitor = health_monitor.clone();
                    let summary_loop = summary_loop.clone();
                    async move {
                        last_cycle_unix.store(chrono::Utc::now().timestamp(), std::sync::atomic::Ordering::SeqCst);
                        health_monitor.run_checks();
                        summary_loop.run_iteration(&stats).await;
                    }
                })
                .await;
        })
    };

    let http_task = {
        let bind = settings.http_bind.clone();
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let addr: SocketAddr = match bind.parse() {
                Ok(a) => a,
                Err(e) => {
                    tracing::error!(error = %e, bind = %bind, "invalid G6_HTTP_BIND address");
                    return;
                }
            };
            let router = build_router(app_state);
            let listener = match tokio::net::TcpListener::bind(addr).await {
                Ok(l) => l,
                Err(e) => {
                    tracing::error!(error = %e, %addr, "failed to bind HTTP listener");
                    return;
                }
            };
            tracing::info!(%addr, "HTTP surface listening");
            let server = axum::serve(
                listener,
                router.into_make_service_with_connect_info::<SocketAddr>(),
            );
            tokio::select! {
                result = server => {
                    if let Err(e) = result {
                        tracing::error!(error = %e, "HTTP server exited with error");
                    }
                }
                _ = shutdown.changed() => {}
            }
        })
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received shutdown signal");
            let _ = shutdown_tx.send(true);
            let _ = tokio::join!(collector_task, http_task);
        }
        result = &mut collector_task => {
            match result {
                Ok(()) => tracing::info!("collector loop exited, shutting down (market-close auto-stop)"),
                Err(e) => tracing::error!(error = %e, "collector task panicked"),
            }
            let _ = shutdown_tx.send(true);
            let _ = http_task.await;
        }
    }
    Ok(())
}
