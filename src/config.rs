//! Config/Settings Snapshot (spec.md §4.1).
//!
//! `Settings::hydrate()` reads environment variables (plus an optional TOML
//! file, lowest precedence) exactly once and returns an immutable
//! `Arc<Settings>`. Every other component takes a clone of that `Arc` at
//! construction time; nothing re-reads the environment afterward.

use crate::domain::{ExpiryRule, IndexParams};
use serde::Deserialize;
use std::collections::HashSet;
use std::env;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineMode {
    Legacy,
    Shadow,
    Primary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamGateMode {
    Auto,
    Cycle,
    Minute,
    Bucket,
}

impl StreamGateMode {
    pub fn as_str(self) -> &'static str {
        match self {
            StreamGateMode::Auto => "auto",
            StreamGateMode::Cycle => "cycle",
            StreamGateMode::Minute => "minute",
            StreamGateMode::Bucket => "bucket",
        }
    }
}

/// Immutable, process-lifetime configuration snapshot (spec.md §3
/// `CollectorSettings` + §6.6 recognized keys).
#[derive(Debug, Clone)]
pub struct Settings {
    pub interval_seconds: u64,
    pub indices: Vec<IndexParams>,
    pub market_hours_only: bool,
    pub min_volume: u64,
    pub min_oi: u64,
    pub volume_percentile: f64,
    pub foreign_expiry_salvage: bool,
    pub trace_collector: bool,
    pub quiet_mode: bool,
    pub provider_outage_threshold: u32,
    pub provider_outage_log_every: u32,
    pub auto_snapshots: bool,
    pub pipeline_mode: PipelineMode,
    pub stream_gate_mode: StreamGateMode,
    pub sse_http: bool,
    pub sse_structured: bool,
    pub sse_struct_max_changes: usize,
    pub sse_ip_conn_rate: u32,
    pub sse_ua_allow: Vec<String>,
    pub sse_api_token: Option<String>,
    pub sse_ip_allowlist: Vec<String>,
    pub metrics_batch: bool,
    pub metrics_batch_interval_ms: u64,
    pub metrics_strict_duplicate: bool,
    pub egress_frozen: bool,
    pub suppress_deprecations: bool,
    pub heartbeat_interval_secs: u64,
    pub panels_dir: String,
    pub csv_root: String,
    pub status_path: String,
    pub http_bind: String,
    pub provider_rate_per_sec: f64,
    pub provider_rate_burst: f64,
    pub provider_rate_max_wait_secs: f64,
    pub parity_window: usize,
    pub parity_drift_threshold_cycles: u32,
    pub parity_score_threshold: f64,
}

/// Loose, serde-friendly mirror of the TOML config file. All fields optional
/// so a partial file only overrides what it names; the rest falls back to
/// environment variables, then defaults.
#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    interval_seconds: Option<u64>,
    market_hours_only: Option<bool>,
    min_volume: Option<u64>,
    min_oi: Option<u64>,
    volume_percentile: Option<f64>,
    indices: Option<Vec<FileIndexParams>>,
}

#[derive(Debug, Deserialize)]
struct FileIndexParams {
    symbol: String,
    #[serde(default = "default_true")]
    enabled: bool,
    #[serde(default)]
    expiry_rules: Vec<String>,
    #[serde(default)]
    strikes_itm: u32,
    #[serde(default)]
    strikes_otm: u32,
    #[serde(default)]
    strike_step: f64,
}

fn default_true() -> bool {
    true
}

static UNKNOWN_KEY_WARNED: AtomicBool = AtomicBool::new(false);

const RECOGNIZED_ENV_KEYS: &[&str] = &[
    "G6_INTERVAL_SECONDS",
    "G6_MARKET_HOURS_ONLY",
    "G6_MIN_VOLUME",
    "G6_MIN_OI",
    "G6_VOLUME_PERCENTILE",
    "G6_FOREIGN_EXPIRY_SALVAGE",
    "G6_TRACE_COLLECTOR",
    "G6_QUIET_MODE",
    "G6_PROVIDER_OUTAGE_THRESHOLD",
    "G6_PROVIDER_OUTAGE_LOG_EVERY",
    "G6_AUTO_SNAPSHOTS",
    "G6_PIPELINE_MODE",
    "G6_STREAM_GATE_MODE",
    "G6_SSE_HTTP",
    "G6_SSE_STRUCTURED",
    "G6_SSE_STRUCT_MAX_CHANGES",
    "G6_SSE_IP_CONN_RATE",
    "G6_SSE_UA_ALLOW",
    "G6_SSE_API_TOKEN",
    "G6_SSE_IP_ALLOWLIST",
    "G6_METRICS_BATCH",
    "G6_METRICS_BATCH_INTERVAL_MS",
    "G6_METRICS_STRICT_DUPLICATE",
    "G6_EGRESS_FROZEN",
    "G6_SUPPRESS_DEPRECATIONS",
    "G6_HEARTBEAT_INTERVAL_SECS",
    "G6_PANELS_DIR",
    "G6_CSV_ROOT",
    "G6_STATUS_PATH",
    "G6_HTTP_BIND",
    "G6_CONFIG_FILE",
    "G6_PROVIDER_RATE_PER_SEC",
    "G6_PROVIDER_RATE_BURST",
    "G6_PROVIDER_RATE_MAX_WAIT_SECS",
    "G6_PARITY_WINDOW",
    "G6_PARITY_DRIFT_THRESHOLD_CYCLES",
    "G6_PARITY_SCORE_THRESHOLD",
];

fn env_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .ok()
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "on" | "yes"))
        .unwrap_or(default)
}

fn env_num<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_list(key: &str) -> Vec<String> {
    env::var(key)
        .ok()
        .map(|v| v.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
        .unwrap_or_default()
}

impl Settings {
    /// Reads the environment (and optional `G6_CONFIG_FILE` TOML file) once
    /// and returns an immutable snapshot. Emits the one-shot
    /// `collector.settings.summary` structured event.
    pub fn hydrate() -> anyhow::Result<Arc<Settings>> {
        let _ = dotenv::dotenv();
        warn_on_unknown_env_keys();

        let file_cfg = load_file_config();

        let indices = match &file_cfg.indices {
            Some(list) if !list.is_empty() => list
                .iter()
                .map(|i| IndexParams {
                    symbol: i.symbol.clone(),
                    enabled: i.enabled,
                    expiry_rules: i
                        .expiry_rules
                        .iter()
                        .filter_map(|r| ExpiryRule::parse(r))
                        .collect(),
                    strikes_itm: i.strikes_itm,
                    strikes_otm: i.strikes_otm,
                    strike_step: i.strike_step,
                })
                .collect(),
            _ => default_indices(),
        };

        let settings = Settings {
            interval_seconds: file_cfg
                .interval_seconds
                .unwrap_or_else(|| env_num("G6_INTERVAL_SECONDS", 60)),
            indices,
            market_hours_only: file_cfg
                .market_hours_only
                .unwrap_or_else(|| env_bool("G6_MARKET_HOURS_ONLY", false)),
            min_volume: file_cfg.min_volume.unwrap_or_else(|| env_num("G6_MIN_VOLUME", 0)),
            min_oi: file_cfg.min_oi.unwrap_or_else(|| env_num("G6_MIN_OI", 0)),
            volume_percentile: file_cfg
                .volume_percentile
                .unwrap_or_else(|| env_num("G6_VOLUME_PERCENTILE", 0.0)),
            foreign_expiry_salvage: env_bool("G6_FOREIGN_EXPIRY_SALVAGE", false),
            trace_collector: env_bool("G6_TRACE_COLLECTOR", false),
            quiet_mode: env_bool("G6_QUIET_MODE", false),
            provider_outage_threshold: env_num("G6_PROVIDER_OUTAGE_THRESHOLD", 3),
            provider_outage_log_every: env_num("G6_PROVIDER_OUTAGE_LOG_EVERY", 10),
            auto_snapshots: env_bool("G6_AUTO_SNAPSHOTS", true),
            pipeline_mode: parse_pipeline_mode(&env::var("G6_PIPELINE_MODE").unwrap_or_default()),
            stream_gate_mode: parse_gate_mode(&env::var("G6_STREAM_GATE_MODE").unwrap_or_default()),
            sse_http: env_bool("G6_SSE_HTTP", true),
            sse_structured: env_bool("G6_SSE_STRUCTURED", true),
            sse_struct_max_changes: env_num("G6_SSE_STRUCT_MAX_CHANGES", 40),
            sse_ip_conn_rate: env_num("G6_SSE_IP_CONN_RATE", 30),
            sse_ua_allow: env_list("G6_SSE_UA_ALLOW"),
            sse_api_token: env::var("G6_SSE_API_TOKEN").ok(),
            sse_ip_allowlist: env_list("G6_SSE_IP_ALLOWLIST"),
            metrics_batch: env_bool("G6_METRICS_BATCH", true),
            metrics_batch_interval_ms: env_num("G6_METRICS_BATCH_INTERVAL_MS", 1000),
            metrics_strict_duplicate: env_bool("G6_METRICS_STRICT_DUPLICATE", false),
            egress_frozen: env_bool("G6_EGRESS_FROZEN", false),
            suppress_deprecations: env_bool("G6_SUPPRESS_DEPRECATIONS", false),
            heartbeat_interval_secs: env_num("G6_HEARTBEAT_INTERVAL_SECS", 10),
            panels_dir: env::var("G6_PANELS_DIR").unwrap_or_else(|_| "data/panels".to_string()),
            csv_root: env::var("G6_CSV_ROOT").unwrap_or_else(|_| "data/csv".to_string()),
            status_path: env::var("G6_STATUS_PATH")
                .unwrap_or_else(|_| "data/runtime_status.json".to_string()),
            http_bind: env::var("G6_HTTP_BIND").unwrap_or_else(|_| "0.0.0.0:9315".to_string()),
            provider_rate_per_sec: env_num("G6_PROVIDER_RATE_PER_SEC", 5.0),
            provider_rate_burst: env_num("G6_PROVIDER_RATE_BURST", 10.0),
            provider_rate_max_wait_secs: env_num("G6_PROVIDER_RATE_MAX_WAIT_SECS", 5.0),
            parity_window: env_num("G6_PARITY_WINDOW", 20),
            parity_drift_threshold_cycles: env_num("G6_PARITY_DRIFT_THRESHOLD_CYCLES", 3),
            parity_score_threshold: env_num("G6_PARITY_SCORE_THRESHOLD", 0.9),
        };

        info!(
            interval_seconds = settings.interval_seconds,
            indices = settings.indices.len(),
            market_hours_only = settings.market_hours_only,
            foreign_expiry_salvage = settings.foreign_expiry_salvage,
            trace_collector = settings.trace_collector,
            quiet_mode = settings.quiet_mode,
            pipeline_mode = ?settings.pipeline_mode,
            stream_gate_mode = settings.stream_gate_mode.as_str(),
            sse_http = settings.sse_http,
            metrics_batch = settings.metrics_batch,
            egress_frozen = settings.egress_frozen,
            "collector.settings.summary"
        );

        Ok(Arc::new(settings))
    }
}

fn default_indices() -> Vec<IndexParams> {
    vec![
        IndexParams {
            symbol: "NIFTY".to_string(),
            enabled: true,
            expiry_rules: vec![ExpiryRule::ThisWeek],
            strikes_itm: 10,
            strikes_otm: 10,
            strike_step: 50.0,
        },
        IndexParams {
            symbol: "BANKNIFTY".to_string(),
            enabled: true,
            expiry_rules: vec![ExpiryRule::ThisWeek],
            strikes_itm: 10,
            strikes_otm: 10,
            strike_step: 100.0,
        },
    ]
}

fn load_file_config() -> FileConfig {
    let path = env::var("G6_CONFIG_FILE").unwrap_or_else(|_| "config.toml".to_string());
    if !Path::new(&path).exists() {
        return FileConfig::default();
    }
    match std::fs::read_to_string(&path) {
        Ok(raw) => match toml::from_str(&raw) {
            Ok(cfg) => cfg,
            Err(e) => {
                warn!(path = %path, error = %e, "config file parse failure, falling back to env/defaults");
                FileConfig::default()
            }
        },
        Err(e) => {
            warn!(path = %path, error = %e, "config file unreadable, falling back to env/defaults");
            FileConfig::default()
        }
    }
}

fn parse_pipeline_mode(raw: &str) -> PipelineMode {
    match raw {
        "shadow" => PipelineMode::Shadow,
        "primary" => PipelineMode::Primary,
        _ => PipelineMode::Legacy,
    }
}

fn parse_gate_mode(raw: &str) -> StreamGateMode {
    match raw {
        "cycle" => StreamGateMode::Cycle,
        "minute" => StreamGateMode::Minute,
        "bucket" => StreamGateMode::Bucket,
        _ => StreamGateMode::Auto,
    }
}

/// Unknown `G6_*` env vars trigger a single warn-and-ignore pass
/// (spec.md §6.6), gated by `suppress_deprecations` once hydrated once.
fn warn_on_unknown_env_keys() {
    if UNKNOWN_KEY_WARNED.swap(true, Ordering::Relaxed) {
        return;
    }
    let recognized: HashSet<&str> = RECOGNIZED_ENV_KEYS.iter().copied().collect();
    for (key, _) in env::vars() {
        if key.starts_with("G6_") && !recognized.contains(key.as_str()) {
            warn!(key = %key, "unrecognized G6_* configuration key, ignoring");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipeline_mode_parses_known_values_else_legacy() {
        assert_eq!(parse_pipeline_mode("shadow"), PipelineMode::Shadow);
        assert_eq!(parse_pipeline_mode("primary"), PipelineMode::Primary);
        assert_eq!(parse_pipeline_mode("nonsense"), PipelineMode::Legacy);
    }

    #[test]
    fn gate_mode_defaults_to_auto() {
        assert_eq!(parse_gate_mode(""), StreamGateMode::Auto);
        assert_eq!(parse_gate_mode("minute"), StreamGateMode::Minute);
    }
}
