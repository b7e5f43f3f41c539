//! Expiry Pipeline driver and state machine (spec.md §4.4 "State machine").
//!
//! `INIT → RESOLVED → FETCHED → ENRICHED → VALIDATED → PERSISTED → DONE`,
//! with terminal `ABORTED` (recoverable/abort taxonomy) and `FAILED`
//! (fatal taxonomy). Transitions are unidirectional; salvage never renames
//! the stage, it only sets `flags.salvaged`.

use crate::domain::{ExpiryRule, ExpiryState, IndexParams, PipelineStage};
use crate::error::{PhaseAbortError, PhaseFatalError, PhaseRecoverableError};
use crate::metrics::Registry;
use crate::provider::Provider;
use crate::storage::Sink;
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;

use super::phases;

/// Unifies the three-tier taxonomy so phases return one error type; the
/// driver inspects the variant to decide continue/skip-expiry/skip-index
/// (spec.md §4.4 "Failure semantics").
#[derive(Debug, thiserror::Error)]
pub enum PhaseError {
    #[error(transparent)]
    Recoverable(#[from] PhaseRecoverableError),
    #[error(transparent)]
    Abort(#[from] PhaseAbortError),
    #[error(transparent)]
    Fatal(#[from] PhaseFatalError),
}

/// Shared, read-only handles every phase needs. Cloned cheaply (all fields
/// are `Arc`s) per expiry pipeline invocation.
pub struct PipelineContext {
    pub settings: Arc<crate::config::Settings>,
    pub provider: Arc<dyn Provider>,
    pub sink: Arc<dyn Sink>,
    pub metrics: Arc<Registry>,
    pub error_router: Arc<crate::error::ErrorRouter>,
}

impl PipelineContext {
    pub fn new(
        settings: Arc<crate::config::Settings>,
        provider: Arc<dyn Provider>,
        sink: Arc<dyn Sink>,
        metrics: Arc<Registry>,
        error_router: Arc<crate::error::ErrorRouter>,
    ) -> Self {
        Self {
            settings,
            provider,
            sink,
            metrics,
            error_router,
        }
    }
}

/// Phases get up to this many attempts before a `Recoverable` error is
/// allowed to escalate to the driver.
const PHASE_MAX_ATTEMPTS: u32 = 3;
const PHASE_BACKOFF_BASE: std::time::Duration = std::time::Duration::from_millis(50);
const PHASE_BACKOFF_CAP: std::time::Duration = std::time::Duration::from_millis(800);

/// Runs a phase, retrying on `PhaseRecoverableError` with bounded exponential
/// backoff before letting the error escalate, and records
/// `g6_pipeline_phase_duration_seconds` / `g6_pipeline_phase_outcomes_total` /
/// `g6_pipeline_phase_retry_backoff_seconds` / `g6_pipeline_phase_last_attempts`
/// (spec.md §4.4 "Per-phase contract"). `Abort`/`Fatal` errors never retry.
async fn timed<F, Fut, T>(ctx: &PipelineContext, phase: &'static str, mut make_fut: F) -> Result<T, PhaseError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, PhaseError>>,
{
    let start = Instant::now();
    let mut attempts = 0u32;
    let result = loop {
        attempts += 1;
        match make_fut().await {
            Ok(v) => break Ok(v),
            Err(PhaseError::Recoverable(e)) if attempts < PHASE_MAX_ATTEMPTS => {
                let backoff = (PHASE_BACKOFF_BASE.saturating_mul(1 << (attempts - 1))).min(PHASE_BACKOFF_CAP);
                ctx.metrics
                    .observe("g6_pipeline_phase_retry_backoff_seconds", &[("phase", phase)], backoff.as_secs_f64());
                tracing::debug!(phase, attempts, error = %e, "retrying phase after recoverable error");
                tokio::time::sleep(backoff).await;
            }
            Err(e) => break Err(e),
        }
    };

    ctx.metrics
        .set("g6_pipeline_phase_last_attempts", &[("phase", phase)], attempts as f64);
    let outcome = if result.is_ok() { "ok" } else { "err" };
    ctx.metrics.observe(
        "g6_pipeline_phase_duration_seconds",
        &[("phase", phase), ("final_outcome", outcome)],
        start.elapsed().as_secs_f64(),
    );
    ctx.metrics.inc(
        "g6_pipeline_phase_outcomes_total",
        &[("phase", phase), ("final_outcome", outcome)],
        1,
    );
    result
}

/// Runs the full, ordered phase chain for a single (index, expiry rule),
/// returning the final `ExpiryState` regardless of outcome — callers
/// inspect `state.stage` to tell DONE from ABORTED/FAILED.
pub async fn run_expiry_pipeline(
    ctx: &PipelineContext,
    index: &IndexParams,
    rule: ExpiryRule,
) -> ExpiryState {
    let mut state = ExpiryState::new(index.symbol.clone(), rule);

    match run_phases(ctx, index, &mut state).await {
        Ok(()) => {
            state.stage = PipelineStage::Done;
        }
        Err(PhaseError::Recoverable(e)) => {
            state.stage = PipelineStage::Aborted;
            state.errors.push(e.to_string());
            ctx.error_router.route(
                "pipeline_expiry_recoverable",
                &[("index", json!(index.symbol)), ("reason", json!(e.to_string()))],
            );
        }
        Err(PhaseError::Abort(e)) => {
            state.stage = PipelineStage::Aborted;
            state.errors.push(e.to_string());
        }
        Err(PhaseError::Fatal(e)) => {
            state.stage = PipelineStage::Failed;
            state.errors.push(e.to_string());
            ctx.error_router.route(
                "pipeline_index_fatal",
                &[("index", json!(index.symbol)), ("reason", json!(e.to_string()))],
            );
        }
    }

    state
}

/// Runs a reduced phase chain standing in for the pre-redesign implementation:
/// resolve, fetch, prefilter, enrich, preventive_validate, coverage — no
/// salvage/iv/greeks, and nothing is persisted. Used only to produce a
/// `ParitySignature` for comparison against the authoritative run (spec.md
/// §4.4 "Shadow/parity mode"); never touches the sink or the error router,
/// since it is not itself a collection outcome.
pub async fn run_shadow_signature(ctx: &PipelineContext, index: &IndexParams, rule: ExpiryRule) -> ExpiryState {
    let mut state = ExpiryState::new(index.symbol.clone(), rule);

    let result: Result<(), PhaseError> = async {
        timed(ctx, "shadow_resolve", || phases::resolve(ctx, index, &mut state)).await?;
        state.stage = PipelineStage::Resolved;

        timed(ctx, "shadow_fetch", || phases::fetch(ctx, index, &mut state)).await?;
        state.stage = PipelineStage::Fetched;

        timed(ctx, "shadow_prefilter", || phases::prefilter(ctx, &mut state)).await?;
        timed(ctx, "shadow_enrich", || phases::enrich(ctx, index, &mut state)).await?;
        state.stage = PipelineStage::Enriched;

        timed(ctx, "shadow_preventive_validate", || phases::preventive_validate(ctx, &mut state)).await?;
        timed(ctx, "shadow_coverage", || phases::coverage(ctx, index, &mut state)).await?;
        Ok(())
    }
    .await;

    match result {
        Ok(()) => state.stage = PipelineStage::Validated,
        Err(PhaseError::Recoverable(e)) => {
            state.stage = PipelineStage::Aborted;
            state.errors.push(e.to_string());
        }
        Err(PhaseError::Abort(e)) => {
            state.stage = PipelineStage::Aborted;
            state.errors.push(e.to_string());
        }
        Err(PhaseError::Fatal(e)) => {
            state.stage = PipelineStage::Failed;
            state.errors.push(e.to_string());
        }
    }

    state
}

async fn run_phases(ctx: &PipelineContext, index: &IndexParams, state: &mut ExpiryState) -> Result<(), PhaseError> {
    timed(ctx, "resolve", || phases::resolve(ctx, index, state)).await?;
    state.stage = PipelineStage::Resolved;

    timed(ctx, "fetch", || phases::fetch(ctx, index, state)).await?;
    state.stage = PipelineStage::Fetched;

    timed(ctx, "prefilter", || phases::prefilter(ctx, state)).await?;
    timed(ctx, "enrich", || phases::enrich(ctx, index, state)).await?;
    state.stage = PipelineStage::Enriched;

    timed(ctx, "preventive_validate", || phases::preventive_validate(ctx, state)).await?;

    if ctx.settings.foreign_expiry_salvage {
        timed(ctx, "salvage", || phases::salvage(ctx, index, state)).await?;
    }

    timed(ctx, "coverage", || phases::coverage(ctx, index, state)).await?;
    timed(ctx, "iv", || phases::iv(ctx, state)).await?;
    timed(ctx, "greeks", || phases::greeks(ctx, index, state)).await?;
    state.stage = PipelineStage::Validated;

    timed(ctx, "persist", || phases::persist(ctx, index, state)).await?;
    state.stage = PipelineStage::Persisted;

    timed(ctx, "classify", || phases::classify(ctx, state)).await?;
    timed(ctx, "snapshot", || phases::snapshot(ctx, state)).await?;
    timed(ctx, "summarize", || phases::summarize(ctx, state)).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PipelineMode, Settings, StreamGateMode};
    use crate::domain::IndexParams;
    use crate::error::ErrorRouter;
    use crate::provider::dummy::DummyProvider;
    use crate::storage::csv_sink::CsvSink;

    fn test_settings(csv_root: std::path::PathBuf) -> Arc<Settings> {
        Arc::new(Settings {
            interval_seconds: 60,
            indices: vec![],
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
            panels_dir: "data/panels".to_string(),
            csv_root: csv_root.to_string_lossy().to_string(),
            status_path: "data/runtime_status.json".to_string(),
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
    async fn happy_path_reaches_done_with_rows_for_every_strike() {
        let dir = tempfile::tempdir().unwrap();
        let settings = test_settings(dir.path().to_path_buf());
        let metrics = Arc::new(Registry::new_for_test());
        let ctx = PipelineContext::new(
            settings,
            Arc::new(DummyProvider::default()),
            Arc::new(CsvSink::new(dir.path())),
            metrics.clone(),
            Arc::new(ErrorRouter::new(metrics)),
        );
        let index = IndexParams {
            symbol: "NIFTY".to_string(),
            enabled: true,
            expiry_rules: vec![ExpiryRule::ThisWeek],
            strikes_itm: 2,
            strikes_otm: 2,
            strike_step: 50.0,
        };

        let state = run_expiry_pipeline(&ctx, &index, ExpiryRule::ThisWeek).await;
        assert_eq!(state.stage, PipelineStage::Done);
        assert_eq!(state.options_count(), 10);
    }
}
