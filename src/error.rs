//! Error taxonomy (spec.md §4.3, §4.4, §7) and the Error Router (spec.md §4.9).
//!
//! The taxonomy is kinds, not a type hierarchy: phases raise one of three
//! `thiserror` enums and the driver inspects the kind to decide
//! continue/skip-expiry/skip-index. Nothing downstream of a phase ever
//! matches on a raw upstream error type.

use crate::metrics::Registry;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Recoverable within a single expiry: log WARNING, count, continue to the
/// next expiry (spec.md §4.4 "Failure semantics").
#[derive(Debug, thiserror::Error)]
pub enum PhaseRecoverableError {
    #[error("transient I/O: {0}")]
    TransientIo(String),
    #[error("data quality: {0}")]
    DataQuality(String),
    #[error("phase deadline exceeded: {phase}")]
    Deadline { phase: &'static str },
}

/// Aborts the remainder of this expiry's phase chain but not the index.
#[derive(Debug, thiserror::Error)]
pub enum PhaseAbortError {
    #[error("preventive validation failed: {0}")]
    PreventiveValidation(String),
    #[error("empty enrichment with salvage disabled")]
    EmptyEnrichment,
}

/// Fatal for the remaining expiries of this index this cycle.
#[derive(Debug, thiserror::Error)]
pub enum PhaseFatalError {
    #[error("persistence failure: {0}")]
    Persistence(String),
    #[error("unclassified failure: {0}")]
    Unclassified(String),
}

/// Provider-facing error taxonomy (spec.md §4.3).
#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    #[error("auth")]
    Auth,
    #[error("network")]
    Network,
    #[error("rate_limit")]
    RateLimit,
    #[error("missing")]
    Missing,
    #[error("no_method")]
    NoMethod,
    #[error("unknown_rule")]
    UnknownRule,
    #[error("empty_future")]
    EmptyFuture,
}

#[derive(Debug, thiserror::Error)]
#[error("provider error: {kind}")]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
}

impl ProviderError {
    pub fn new(kind: ProviderErrorKind) -> Self {
        Self { kind }
    }
}

/// Sink write failure (spec.md §7 "Persistence").
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("csv: {0}")]
    Csv(String),
}

/// Sanitized external error surface (spec.md §7 "never propagated ... as
/// stack traces"): HTTP handlers and status-file writers return this, never
/// a raw Rust error/backtrace.
#[derive(Debug, Clone, serde::Serialize)]
pub struct AppError {
    pub code: &'static str,
    pub message: String,
}

impl AppError {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Registry entry for a known error code (spec.md §3 `ErrorRegistryEntry`).
#[derive(Debug, Clone)]
pub struct ErrorRegistryEntry {
    pub code: &'static str,
    pub log_level: tracing::Level,
    pub metric: Option<&'static str>,
    pub throttle: Option<Duration>,
    pub escalate_env: Option<&'static str>,
}

struct ThrottleState {
    last_emit: Instant,
    count_in_window: u64,
}

/// Centralized classification/logging/metric increment with throttling
/// (spec.md §4.9).
pub struct ErrorRouter {
    registry: HashMap<&'static str, ErrorRegistryEntry>,
    throttles: Mutex<HashMap<&'static str, ThrottleState>>,
    unknown_warned: Mutex<std::collections::HashSet<String>>,
    metrics: Arc<Registry>,
}

impl ErrorRouter {
    pub fn new(metrics: Arc<Registry>) -> Self {
        let mut registry = HashMap::new();
        for entry in default_registry() {
            registry.insert(entry.code, entry);
        }
        Self {
            registry,
            throttles: Mutex::new(HashMap::new()),
            unknown_warned: Mutex::new(std::collections::HashSet::new()),
            metrics,
        }
    }

    /// Route a known or unknown error code. Labels are JSON-safe serialized
    /// (truncated to ~512 chars per field; non-primitive values JSON-encoded;
    /// `<unserializable>` on failure).
    pub fn route(&self, code: &str, labels: &[(&str, Value)]) {
        let entry = match self.registry.get(code) {
            Some(e) => e.clone(),
            None => {
                let mut warned = self.unknown_warned.lock();
                if warned.insert(code.to_string()) {
                    warn!(code, "unrecognized error code routed, treating as generic");
                }
                ErrorRegistryEntry {
                    code: "unknown",
                    log_level: tracing::Level::WARN,
                    metric: Some("g6_error_unknown_total"),
                    throttle: None,
                    escalate_env: None,
                }
            }
        };

        let label_str = serialize_labels(labels);
        let throttled = self.is_throttled(entry.code, entry.throttle);
        let level = self.effective_level(&entry);

        if throttled {
            debug!(code = entry.code, labels = %label_str, "error routed (throttled)");
        } else {
            match level {
                tracing::Level::ERROR => {
                    tracing::error!(code = entry.code, labels = %label_str, "error routed")
                }
                tracing::Level::WARN => {
                    tracing::warn!(code = entry.code, labels = %label_str, "error routed")
                }
                _ => tracing::info!(code = entry.code, labels = %label_str, "error routed"),
            }
        }

        if let Some(metric_name) = entry.metric {
            self.metrics.inc(metric_name, &[("code", entry.code)], 1);
        }
    }

    fn effective_level(&self, entry: &ErrorRegistryEntry) -> tracing::Level {
        if let Some(env_key) = entry.escalate_env {
            if std::env::var(env_key).map(|v| v == "1" || v.to_lowercase() == "true").unwrap_or(false) {
                return bump_level(entry.log_level);
            }
        }
        entry.log_level
    }

    fn is_throttled(&self, code: &'static str, window: Option<Duration>) -> bool {
        let Some(window) = window else { return false };
        let mut throttles = self.throttles.lock();
        let now = Instant::now();
        let state = throttles.entry(code).or_insert(ThrottleState {
            last_emit: now - window,
            count_in_window: 0,
        });
        if now.duration_since(state.last_emit) >= window {
            state.last_emit = now;
            state.count_in_window = 1;
            false
        } else {
            state.count_in_window += 1;
            true
        }
    }
}

fn bump_level(level: tracing::Level) -> tracing::Level {
    match level {
        tracing::Level::TRACE => tracing::Level::DEBUG,
        tracing::Level::DEBUG => tracing::Level::INFO,
        tracing::Level::INFO => tracing::Level::WARN,
        tracing::Level::WARN => tracing::Level::ERROR,
        tracing::Level::ERROR => tracing::Level::ERROR,
    }
}

fn serialize_labels(labels: &[(&str, Value)]) -> String {
    let mut map = serde_json::Map::new();
    for (k, v) in labels {
        let encoded = match v {
            Value::String(s) => {
                if s.len() > 512 {
                    Value::String(s.chars().take(512).collect())
                } else {
                    Value::String(s.clone())
                }
            }
            other => other.clone(),
        };
        map.insert((*k).to_string(), encoded);
    }
    serde_json::to_string(&map).unwrap_or_else(|_| "<unserializable>".to_string())
}

fn default_registry() -> Vec<ErrorRegistryEntry> {
    vec![
        ErrorRegistryEntry {
            code: "provider_outage",
            log_level: tracing::Level::WARN,
            metric: Some("g6_provider_outage_total"),
            throttle: Some(Duration::from_secs(30)),
            escalate_env: None,
        },
        ErrorRegistryEntry {
            code: "pipeline_expiry_recoverable",
            log_level: tracing::Level::WARN,
            metric: Some("g6_pipeline_expiry_recoverable_total"),
            throttle: None,
            escalate_env: None,
        },
        ErrorRegistryEntry {
            code: "pipeline_index_fatal",
            log_level: tracing::Level::ERROR,
            metric: Some("g6_pipeline_index_fatal_total"),
            throttle: None,
            escalate_env: "G6_ESCALATE_FATAL".into(),
        },
        ErrorRegistryEntry {
            code: "stream_state_corruption",
            log_level: tracing::Level::WARN,
            metric: Some("g6_stream_state_persist_errors_total"),
            throttle: Some(Duration::from_secs(60)),
            escalate_env: None,
        },
        ErrorRegistryEntry {
            code: "sse_client_failure",
            log_level: tracing::Level::DEBUG,
            metric: Some("g6_sse_client_failures_total"),
            throttle: None,
            escalate_env: None,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Registry;

    #[test]
    fn repeated_emission_within_window_is_throttled() {
        let router = ErrorRouter::new(Arc::new(Registry::new_for_test()));
        assert!(!router.is_throttled("provider_outage", Some(Duration::from_secs(30))));
        assert!(router.is_throttled("provider_outage", Some(Duration::from_secs(30))));
    }

    #[test]
    fn unknown_code_is_warned_once() {
        let router = ErrorRouter::new(Arc::new(Registry::new_for_test()));
        router.route("totally_unknown_code", &[]);
        router.route("totally_unknown_code", &[]);
        assert_eq!(router.unknown_warned.lock().len(), 1);
    }

    #[test]
    fn label_serialization_truncates_long_strings() {
        let long = "x".repeat(1000);
        let out = serialize_labels(&[("field", Value::String(long))]);
        assert!(out.len() < 1000);
    }
}
