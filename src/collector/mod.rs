//! Collector Orchestrator (spec.md §4.5): the per-cycle loop over indices,
//! market-hours gating, bounded parallel index dispatch, and status
//! aggregation.

pub mod cycle_stats;

use crate::config::{PipelineMode, Settings};
use crate::domain::{ExpiryState, PipelineStage};
use crate::error::ErrorRouter;
use crate::metrics::Registry;
use crate::pipeline::parity::{score, ParitySignature, ParityTracker};
use crate::pipeline::{run_expiry_pipeline, run_shadow_signature, PipelineContext};
use crate::provider::Provider;
use crate::storage::Sink;
use chrono::{Timelike, Utc};
use cycle_stats::{CycleStats, IndexInfo};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;
use sysinfo::System;
use tracing::{info, warn};

/// `Orchestrator`'s live pipeline mode, distinct from the immutable
/// `Settings.pipeline_mode`: a rollback drill flips this back to `Legacy`
/// without requiring a restart (spec.md §4.4 "Rollback is a one-line flag
/// flip").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum EffectiveMode {
    Legacy = 0,
    Shadow = 1,
    Primary = 2,
}

impl EffectiveMode {
    fn from_settings(mode: PipelineMode) -> Self {
        match mode {
            PipelineMode::Legacy => EffectiveMode::Legacy,
            PipelineMode::Shadow => EffectiveMode::Shadow,
            PipelineMode::Primary => EffectiveMode::Primary,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            1 => EffectiveMode::Shadow,
            2 => EffectiveMode::Primary,
            _ => EffectiveMode::Legacy,
        }
    }
}

pub struct Orchestrator {
    settings: Arc<Settings>,
    provider: Arc<dyn Provider>,
    sink: Arc<dyn Sink>,
    metrics: Arc<Registry>,
    error_router: Arc<ErrorRouter>,
    cycle_counter: AtomicU64,
    effective_mode: Arc<AtomicU8>,
    parity_tracker: Arc<Mutex<ParityTracker>>,
}

/// Market hours window (IST cash-equity session hours: 09:15-15:30). Not
/// configurable per spec.md §4.1 (`market_hours_only` is the only toggle);
/// a real deployment would source this from an exchange calendar.
fn within_market_hours(now: chrono::DateTime<Utc>) -> bool {
    let h = now.hour();
    let m = now.minute();
    let minutes = h * 60 + m;
    (9 * 60 + 15..=15 * 60 + 30).contains(&minutes)
}

/// Scores one expiry's shadow run against its authoritative run, updates the
/// rolling parity average, and — when drift persists while running as
/// `primary` — executes a rollback drill (spec.md §4.4 "Shadow/parity mode",
/// §8 scenario 5 "Parity rollback drill").
fn run_parity_check(
    metrics: &Registry,
    tracker: &Mutex<ParityTracker>,
    effective_mode: &AtomicU8,
    index_symbol: &str,
    authoritative: &ExpiryState,
    shadow: &ExpiryState,
    threshold: f64,
) {
    let auth_sig = ParitySignature::from_state(authoritative);
    let shadow_sig = ParitySignature::from_state(shadow);
    let observed = score(&auth_sig, &shadow_sig);

    let (rolling_avg, drifted) = tracker.lock().record(observed, threshold);
    metrics.set("g6_pipeline_parity_rolling_avg", &[], rolling_avg);
    metrics.set("g6_pipeline_alert_parity_diff", &[], (1.0 - observed).max(0.0));

    if !drifted {
        return;
    }

    warn!(index = index_symbol, rolling_avg, threshold, "pipeline.alert_parity.anomaly");

    let was_primary = effective_mode
        .compare_exchange(
            EffectiveMode::Primary as u8,
            EffectiveMode::Legacy as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        )
        .is_ok();
    if was_primary {
        metrics.inc("g6_pipeline_rollback_drill_total", &[], 1);
        warn!(index = index_symbol, "rollback drill executed: pipeline_mode primary -> legacy");
    }
}

impl Orchestrator {
    pub fn new(
        settings: Arc<Settings>,
        provider: Arc<dyn Provider>,
        sink: Arc<dyn Sink>,
        metrics: Arc<Registry>,
        error_router: Arc<ErrorRouter>,
    ) -> Self {
        let effective_mode = EffectiveMode::from_settings(settings.pipeline_mode);
        let parity_tracker = ParityTracker::new(settings.parity_window, settings.parity_drift_threshold_cycles);
        Self {
            settings,
            provider,
            sink,
            metrics,
            error_router,
            cycle_counter: AtomicU64::new(0),
            effective_mode: Arc::new(AtomicU8::new(effective_mode as u8)),
            parity_tracker: Arc::new(Mutex::new(parity_tracker)),
        }
    }

    /// Long-lived worker: ticks every `interval_seconds`, skipping missed
    /// ticks rather than piling them up (spec.md §5 "no unbounded pileup").
    /// `on_cycle` runs after every completed cycle, before the market-close
    /// gates are checked, so callers can hook health/summary-loop bookkeeping
    /// without the driver loop knowing about them.
    ///
    /// Market-close auto-stop (spec.md §4.5, only when `market_hours_only`):
    /// the loop exits (rather than looping forever) once either gate trips —
    /// (a) the current time is already outside the session window right
    /// after a cycle, or (b) the *next* scheduled collection time would fall
    /// after close.
    pub async fn run<F, Fut>(self: Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>, mut on_cycle: F)
    where
        F: FnMut(CycleStats) -> Fut,
        Fut: std::future::Future<Output = ()>,
    {
        let interval = std::time::Duration::from_secs(self.settings.interval_seconds.max(1));
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let stats = self.run_cycle().await;
                    on_cycle(stats).await;

                    if self.settings.market_hours_only {
                        let now = Utc::now();
                        if !within_market_hours(now) {
                            info!("market-close auto-stop: outside session window after cycle");
                            break;
                        }
                        let next_tick = now + chrono::Duration::seconds(self.settings.interval_seconds.max(1) as i64);
                        if !within_market_hours(next_tick) {
                            info!("market-close auto-stop: next collection time falls after close");
                            break;
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("orchestrator worker shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Runs a single cycle: market-hours gate, bounded parallel per-index
    /// dispatch, aggregation, atomic status write (spec.md §4.5).
    pub async fn run_cycle(&self) -> CycleStats {
        let cycle_number = self.cycle_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let started_at = Utc::now();
        let start = Instant::now();

        if self.settings.market_hours_only && !within_market_hours(started_at) {
            info!(cycle = cycle_number, "skipping cycle: outside market hours");
            let stats = CycleStats {
                cycle_number,
                started_at,
                elapsed_seconds: start.elapsed().as_secs_f64(),
                interval_seconds: self.settings.interval_seconds,
                indices: vec![],
                indices_info: HashMap::new(),
                success_rate_pct: 100.0,
                api_success_rate: 100.0,
                memory_mb: 0.0,
                cpu_pct: 0.0,
                readiness_ok: true,
                readiness_reason: "outside_market_hours".to_string(),
            };
            self.write_status(&stats);
            return stats;
        }

        let enabled: Vec<_> = self.settings.indices.iter().filter(|i| i.enabled).cloned().collect();

        let effective_mode = EffectiveMode::from_u8(self.effective_mode.load(Ordering::SeqCst));
        let score_threshold = self.settings.parity_score_threshold;

        let tasks = enabled.into_iter().map(|index| {
            let settings = self.settings.clone();
            let provider = self.provider.clone();
            let sink = self.sink.clone();
            let metrics = self.metrics.clone();
            let error_router = self.error_router.clone();
            let parity_tracker = self.parity_tracker.clone();
            let effective_mode_cell = self.effective_mode.clone();
            tokio::spawn(async move {
                let ctx = PipelineContext::new(settings, provider, sink, metrics.clone(), error_router);
                let mut ltp_proxy = 0.0;
                let mut options = 0usize;
                let mut any_failed = false;

                for rule in index.expiry_rules.clone() {
                    if any_failed {
                        break;
                    }
                    let state = run_expiry_pipeline(&ctx, &index, rule).await;
                    if let Some(atm) = state.atm {
                        ltp_proxy = atm;
                    }
                    options += state.options_count();
                    if state.stage == PipelineStage::Failed {
                        any_failed = true;
                    }

                    if matches!(effective_mode, EffectiveMode::Shadow | EffectiveMode::Primary) {
                        let shadow_state = run_shadow_signature(&ctx, &index, rule).await;
                        run_parity_check(
                            &metrics,
                            &parity_tracker,
                            &effective_mode_cell,
                            &index.symbol,
                            &state,
                            &shadow_state,
                            score_threshold,
                        );
                    }
                }

                (index.symbol.clone(), ltp_proxy, options)
            })
        });

        let results = futures_util::future::join_all(tasks).await;

        let mut indices = Vec::new();
        let mut indices_info = HashMap::new();
        let mut failures = 0u32;
        let total = results.len().max(1);

        for result in results {
            match result {
                Ok((symbol, ltp, options)) => {
                    indices.push(symbol.clone());
                    indices_info.insert(symbol, IndexInfo { ltp, options });
                }
                Err(e) => {
                    failures += 1;
                    warn!(error = %e, "index dispatch task panicked");
                }
            }
        }

        let success_rate_pct = 100.0 * (total as f64 - failures as f64) / total as f64;
        self.metrics.inc("g6_collection_cycles_total", &[], 1);
        if failures > 0 {
            self.metrics.inc("g6_collection_errors_total", &[], failures as u64);
        } else {
            self.metrics.set(
                "g6_last_success_cycle_unixtime",
                &[],
                Utc::now().timestamp() as f64,
            );
        }

        let mut sys = System::new();
        sys.refresh_memory();
        sys.refresh_cpu_usage();
        let memory_mb = sys.used_memory() as f64 / (1024.0 * 1024.0);
        let cpu_pct = sys.global_cpu_usage() as f64;

        let readiness_ok = failures == 0;
        let readiness_reason = if readiness_ok {
            String::new()
        } else {
            "provider_outage".to_string()
        };

        let stats = CycleStats {
            cycle_number,
            started_at,
            elapsed_seconds: start.elapsed().as_secs_f64(),
            interval_seconds: self.settings.interval_seconds,
            indices,
            indices_info,
            success_rate_pct,
            api_success_rate: success_rate_pct,
            memory_mb,
            cpu_pct,
            readiness_ok,
            readiness_reason,
        };

        self.write_status(&stats);
        stats
    }

    fn write_status(&self, stats: &CycleStats) {
        let path = std::path::Path::new(&self.settings.status_path);
        if let Err(e) = cycle_stats::write_runtime_status(path, stats) {
            warn!(error = %e, "failed to write runtime status file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PipelineMode, StreamGateMode};
    use crate::domain::{ExpiryRule, IndexParams};
    use crate::provider::dummy::DummyProvider;
    use crate::storage::csv_sink::CsvSink;

    fn settings(dir: &std::path::Path) -> Arc<Settings> {
        Arc::new(Settings {
            interval_seconds: 1,
            indices: vec![IndexParams {
                symbol: "NIFTY".to_string(),
                enabled: true,
                expiry_rules: vec![ExpiryRule::ThisWeek],
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
            panels_dir: dir.join("panels").to_string_lossy().to_string(),
            csv_root: dir.join("csv").to_string_lossy().to_string(),
            status_path: dir.join("runtime_status.json").to_string_lossy().to_string(),
            http_bind: "0.0.0.0:9315".to_string(),
            provider_rate_per_sec: 5.0,
            provider_rate_burst: 10.0,
            provider_rate_max_wait_secs: 5.0,
            parity_window: 20,
            parity_drift_threshold_cycles: 3,
            parity_score_threshold: 0.9,
        })
    }

    #[tokio::test]
    async fn happy_cycle_persists_rows_and_writes_status() {
        let dir = tempfile::tempdir().unwrap();
        let metrics = Arc::new(Registry::new_for_test());
        let orchestrator = Orchestrator::new(
            settings(dir.path()),
            Arc::new(DummyProvider::default()),
            Arc::new(CsvSink::new(dir.path().join("csv"))),
            metrics.clone(),
            Arc::new(ErrorRouter::new(metrics)),
        );

        let stats = orchestrator.run_cycle().await;
        assert_eq!(stats.indices, vec!["NIFTY".to_string()]);
        assert_eq!(stats.indices_info["NIFTY"].options, 10);
        assert!(dir.path().join("runtime_status.json").exists());
    }

    #[tokio::test]
    async fn shadow_mode_scores_parity_without_persisting_twice() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = (*settings(dir.path())).clone();
        cfg.pipeline_mode = PipelineMode::Shadow;
        let metrics = Arc::new(Registry::new_for_test());
        let orchestrator = Orchestrator::new(
            Arc::new(cfg),
            Arc::new(DummyProvider::default()),
            Arc::new(CsvSink::new(dir.path().join("csv"))),
            metrics.clone(),
            Arc::new(ErrorRouter::new(metrics.clone())),
        );

        let stats = orchestrator.run_cycle().await;
        assert_eq!(stats.indices_info["NIFTY"].options, 10);

        let rendered = metrics.render();
        assert!(rendered.contains("g6_pipeline_parity_rolling_avg"));
        assert!(rendered.contains("g6_pipeline_alert_parity_diff"));
    }
}
