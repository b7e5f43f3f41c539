//! Metrics Registry (spec.md §4.2): a spec-driven catalogue of metric
//! definitions, a cardinality guard, and an adaptive emission batcher,
//! rendering standard Prometheus text exposition.

pub mod batch;
pub mod cardinality;

use batch::{BatcherConfig, EmissionBatcher, LabelTuple};
use cardinality::CardinalityGuard;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Counter,
    Gauge,
    Histogram,
}

/// Compile-time metric definition (spec.md §3 `MetricDef`).
#[derive(Debug, Clone, Copy)]
pub struct MetricDef {
    pub name: &'static str,
    pub kind: MetricKind,
    pub labels: &'static [&'static str],
    pub budget: usize,
    pub help: &'static str,
}

const DEFAULT_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

#[derive(Default, Clone)]
struct HistogramAgg {
    buckets: Vec<u64>,
    sum: f64,
    count: u64,
}

impl HistogramAgg {
    fn new() -> Self {
        Self {
            buckets: vec![0; DEFAULT_BUCKETS.len()],
            sum: 0.0,
            count: 0,
        }
    }

    fn observe(&mut self, v: f64) {
        for (i, le) in DEFAULT_BUCKETS.iter().enumerate() {
            if v <= *le {
                self.buckets[i] += 1;
            }
        }
        self.sum += v;
        self.count += 1;
    }
}

type SeriesKey = (String, Vec<String>);

#[derive(Default)]
struct Series {
    counters: HashMap<SeriesKey, f64>,
    gauges: HashMap<SeriesKey, f64>,
    histograms: HashMap<SeriesKey, HistogramAgg>,
}

/// Handle returned from `Register` — a validated, interned metric name.
#[derive(Debug, Clone, Copy)]
pub struct Handle(pub &'static str);

#[derive(Debug, thiserror::Error)]
pub enum RegisterError {
    #[error("duplicate metric registration for {0} rejected under strict mode")]
    DuplicateStrict(&'static str),
}

pub struct Registry {
    defs: RwLock<HashMap<&'static str, MetricDef>>,
    series: RwLock<Series>,
    cardinality: CardinalityGuard,
    batcher: EmissionBatcher,
    batch_mode: bool,
    strict_duplicate: bool,
    failure_seen: Mutex<std::collections::HashSet<(String, String)>>,
    spec_hash: String,
    build_config_hash: String,
}

impl Registry {
    pub fn new(batch_mode: bool, strict_duplicate: bool) -> Self {
        let registry = Self {
            defs: RwLock::new(HashMap::new()),
            series: RwLock::new(Series::default()),
            cardinality: CardinalityGuard::new(),
            batcher: EmissionBatcher::new(BatcherConfig::default()),
            batch_mode,
            strict_duplicate,
            failure_seen: Mutex::new(std::collections::HashSet::new()),
            spec_hash: content_hash(SPEC_CATALOGUE_VERSION),
            build_config_hash: content_hash(env!("CARGO_PKG_VERSION")),
        };
        for def in catalogue() {
            registry.register(def).ok();
        }
        registry
    }

    #[cfg(test)]
    pub fn new_for_test() -> Self {
        Self::new(false, false)
    }

    /// Validates and inserts a `MetricDef`. Duplicate registration emits
    /// `g6_metric_duplicates_total{name}`, and under the strict flag is
    /// fatal to the caller (returns `Err`); otherwise it is counted and the
    /// existing definition wins.
    pub fn register(&self, def: MetricDef) -> Result<Handle, RegisterError> {
        let mut defs = self.defs.write();
        if defs.contains_key(def.name) {
            drop(defs);
            self.inc_raw("g6_metric_duplicates_total", &[("name", def.name.to_string())], 1.0);
            if self.strict_duplicate {
                return Err(RegisterError::DuplicateStrict(def.name));
            }
            return Ok(Handle(def.name));
        }
        defs.insert(def.name, def);
        Ok(Handle(def.name))
    }

    pub fn inc(&self, name: &'static str, labels: &[(&str, &str)], n: u64) {
        self.safe(name, || self.inc_checked(name, labels, n as f64));
    }

    pub fn set(&self, name: &'static str, labels: &[(&str, &str)], v: f64) {
        self.safe(name, || self.set_checked(name, labels, v));
    }

    pub fn observe(&self, name: &'static str, labels: &[(&str, &str)], v: f64) {
        self.safe(name, || self.observe_checked(name, labels, v));
    }

    fn safe(&self, name: &'static str, f: impl FnOnce()) {
        let result = catch_unwind(AssertUnwindSafe(f));
        if result.is_err() {
            let signature = (name.to_string(), "panic".to_string());
            let mut seen = self.failure_seen.lock().unwrap();
            if seen.insert(signature) {
                self.inc_raw("g6_emission_failure_once_total", &[("metric", name.to_string())], 1.0);
            } else {
                self.inc_raw("g6_emission_failures_total", &[("metric", name.to_string())], 1.0);
            }
        }
    }

    fn label_values(&self, def: &MetricDef, labels: &[(&str, &str)]) -> Vec<String> {
        def.labels
            .iter()
            .map(|name| {
                labels
                    .iter()
                    .find(|(k, _)| k == name)
                    .map(|(_, v)| v.to_string())
                    .unwrap_or_default()
            })
            .collect()
    }

    fn admit(&self, name: &'static str, label_values: &[String]) -> bool {
        let defs = self.defs.read();
        let Some(def) = defs.get(name) else {
            return true;
        };
        let budget = def.budget;
        drop(defs);
        let admitted = self.cardinality.admit(name, label_values, budget);
        if !admitted {
            self.inc_raw("g6_cardinality_rejected_total", &[("metric", name.to_string())], 1.0);
        }
        admitted
    }

    fn inc_checked(&self, name: &'static str, labels: &[(&str, &str)], n: f64) {
        let defs = self.defs.read();
        let Some(def) = defs.get(name).copied() else {
            drop(defs);
            self.inc_raw(name, labels, n);
            return;
        };
        drop(defs);
        let values = self.label_values(&def, labels);
        if !self.admit(name, &values) {
            return;
        }
        if self.batch_mode && def.kind == MetricKind::Counter {
            let tuple: LabelTuple = def
                .labels
                .iter()
                .zip(values.iter())
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect();
            self.batcher.enqueue(name, tuple, n);
        } else {
            let mut series = self.series.write();
            *series.counters.entry((name.to_string(), values)).or_insert(0.0) += n;
        }
    }

    fn inc_raw(&self, name: &str, labels: &[(&str, String)], n: f64) {
        let values: Vec<String> = labels.iter().map(|(_, v)| v.clone()).collect();
        let mut series = self.series.write();
        *series.counters.entry((name.to_string(), values)).or_insert(0.0) += n;
    }

    fn set_checked(&self, name: &'static str, labels: &[(&str, &str)], v: f64) {
        let defs = self.defs.read();
        let Some(def) = defs.get(name).copied() else {
            return;
        };
        drop(defs);
        let values = self.label_values(&def, labels);
        if !self.admit(name, &values) {
            return;
        }
        let mut series = self.series.write();
        series.gauges.insert((name.to_string(), values), v);
    }

    fn observe_checked(&self, name: &'static str, labels: &[(&str, &str)], v: f64) {
        let defs = self.defs.read();
        let Some(def) = defs.get(name).copied() else {
            return;
        };
        drop(defs);
        let values = self.label_values(&def, labels);
        if !self.admit(name, &values) {
            return;
        }
        let mut series = self.series.write();
        series
            .histograms
            .entry((name.to_string(), values))
            .or_insert_with(HistogramAgg::new)
            .observe(v);
    }

    /// Drains the emission batcher into the series store. Called by the
    /// Summary Loop's metrics-emitter plugin on its own cadence.
    pub fn flush_batch(&self) {
        for (name, tuple, value) in self.batcher.flush() {
            let values: Vec<String> = tuple.into_iter().map(|(_, v)| v).collect();
            let mut series = self.series.write();
            *series.counters.entry((name, values)).or_insert(0.0) += value;
        }
    }

    pub fn maybe_force_flush(&self, name: &'static str, labels: LabelTuple, n: f64) {
        if self.batcher.enqueue(name, labels, n) {
            self.flush_batch();
        }
    }

    /// Serializes all metrics, including the registry's own self-metrics, as
    /// Prometheus text exposition.
    pub fn render(&self) -> String {
        self.set(
            "g6_metrics_batch_queue_depth",
            &[],
            self.batcher.queue_depth() as f64,
        );
        self.set(
            "g6_metrics_batch_adaptive_utilization",
            &[],
            self.batcher.utilization(),
        );
        self.set("g6_metrics_batch_dropped_ratio", &[], self.batcher.dropped_ratio());
        for (metric, count) in self.cardinality.all_series_counts() {
            let mut series = self.series.write();
            series
                .gauges
                .insert(("g6_cardinality_series_total".to_string(), vec![metric]), count as f64);
        }
        self.set("g6_spec_hash_info", &[("hash", self.spec_hash.as_str())], 1.0);
        self.set(
            "g6_build_config_hash_info",
            &[("hash", self.build_config_hash.as_str())],
            1.0,
        );

        let defs = self.defs.read();
        let series = self.series.read();
        let mut out = String::new();

        let mut names: Vec<&&'static str> = defs.keys().collect();
        names.sort();
        for name in names {
            let def = defs[name];
            match def.kind {
                MetricKind::Counter => {
                    let _ = writeln!(out, "# HELP {} {}", def.name, def.help);
                    let _ = writeln!(out, "# TYPE {} counter", def.name);
                    for ((n, values), value) in series.counters.iter() {
                        if n != def.name {
                            continue;
                        }
                        write_sample(&mut out, def, values, *value);
                    }
                }
                MetricKind::Gauge => {
                    let _ = writeln!(out, "# HELP {} {}", def.name, def.help);
                    let _ = writeln!(out, "# TYPE {} gauge", def.name);
                    for ((n, values), value) in series.gauges.iter() {
                        if n != def.name {
                            continue;
                        }
                        write_sample(&mut out, def, values, *value);
                    }
                }
                MetricKind::Histogram => {
                    let _ = writeln!(out, "# HELP {} {}", def.name, def.help);
                    let _ = writeln!(out, "# TYPE {} histogram", def.name);
                    for ((n, values), agg) in series.histograms.iter() {
                        if n != def.name {
                            continue;
                        }
                        write_histogram(&mut out, def, values, agg);
                    }
                }
            }
        }
        out
    }
}

fn write_sample(out: &mut String, def: &MetricDef, values: &[String], value: f64) {
    if def.labels.is_empty() {
        let _ = writeln!(out, "{} {}", def.name, value);
    } else {
        let label_str = def
            .labels
            .iter()
            .zip(values.iter())
            .map(|(k, v)| format!("{}=\"{}\"", k, escape(v)))
            .collect::<Vec<_>>()
            .join(",");
        let _ = writeln!(out, "{}{{{}}} {}", def.name, label_str, value);
    }
}

fn write_histogram(out: &mut String, def: &MetricDef, values: &[String], agg: &HistogramAgg) {
    let base_labels = def
        .labels
        .iter()
        .zip(values.iter())
        .map(|(k, v)| format!("{}=\"{}\"", k, escape(v)))
        .collect::<Vec<_>>();

    let mut cumulative = 0u64;
    for (i, le) in DEFAULT_BUCKETS.iter().enumerate() {
        cumulative += agg.buckets[i];
        let mut labels = base_labels.clone();
        labels.push(format!("le=\"{}\"", le));
        let _ = writeln!(out, "{}_bucket{{{}}} {}", def.name, labels.join(","), cumulative);
    }
    let mut inf_labels = base_labels.clone();
    inf_labels.push("le=\"+Inf\"".to_string());
    let _ = writeln!(out, "{}_bucket{{{}}} {}", def.name, inf_labels.join(","), agg.count);

    if base_labels.is_empty() {
        let _ = writeln!(out, "{}_sum {}", def.name, agg.sum);
        let _ = writeln!(out, "{}_count {}", def.name, agg.count);
    } else {
        let label_str = base_labels.join(",");
        let _ = writeln!(out, "{}_sum{{{}}} {}", def.name, label_str, agg.sum);
        let _ = writeln!(out, "{}_count{{{}}} {}", def.name, label_str, agg.count);
    }
}

fn escape(v: &str) -> String {
    v.replace('\\', "\\\\").replace('"', "\\\"")
}

const SPEC_CATALOGUE_VERSION: &str = "g6-collector-metric-catalogue-v1";

fn content_hash(seed: &str) -> String {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    let mut hasher = DefaultHasher::new();
    seed.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

/// Compile-time catalogue of every metric this crate emits. Runtime
/// creation is forbidden outside this function (spec.md §9 "Scattered
/// metric creation").
pub fn catalogue() -> Vec<MetricDef> {
    vec![
        MetricDef { name: "g6_collection_cycles_total", kind: MetricKind::Counter, labels: &[], budget: 1, help: "Total collection cycles run" },
        MetricDef { name: "g6_collection_errors_total", kind: MetricKind::Counter, labels: &[], budget: 1, help: "Total collection cycle errors" },
        MetricDef { name: "g6_last_success_cycle_unixtime", kind: MetricKind::Gauge, labels: &[], budget: 1, help: "Unix time of last successful cycle" },
        MetricDef { name: "g6_pipeline_phase_duration_seconds", kind: MetricKind::Histogram, labels: &["phase", "final_outcome"], budget: 128, help: "Pipeline phase duration" },
        MetricDef { name: "g6_pipeline_phase_outcomes_total", kind: MetricKind::Counter, labels: &["phase", "final_outcome"], budget: 128, help: "Pipeline phase outcome counts" },
        MetricDef { name: "g6_pipeline_phase_retry_backoff_seconds", kind: MetricKind::Histogram, labels: &["phase"], budget: 32, help: "Phase retry backoff durations" },
        MetricDef { name: "g6_pipeline_phase_last_attempts", kind: MetricKind::Gauge, labels: &["phase"], budget: 32, help: "Attempts in the last phase invocation" },
        MetricDef { name: "g6_pipeline_expiry_recoverable_total", kind: MetricKind::Counter, labels: &[], budget: 1, help: "Recoverable expiry failures" },
        MetricDef { name: "g6_pipeline_index_fatal_total", kind: MetricKind::Counter, labels: &[], budget: 1, help: "Fatal index failures" },
        MetricDef { name: "g6_pipeline_parity_rolling_avg", kind: MetricKind::Gauge, labels: &[], budget: 1, help: "Shadow/primary parity rolling average" },
        MetricDef { name: "g6_pipeline_alert_parity_diff", kind: MetricKind::Gauge, labels: &[], budget: 1, help: "Alert parity diff between shadow and primary" },
        MetricDef { name: "g6_pipeline_rollback_drill_total", kind: MetricKind::Counter, labels: &[], budget: 1, help: "Rollback drills executed" },
        MetricDef { name: "g6_iv_estimation_failure_total", kind: MetricKind::Counter, labels: &[], budget: 1, help: "IV solver failures" },
        MetricDef { name: "g6_quote_fallback_total", kind: MetricKind::Counter, labels: &["path"], budget: 8, help: "Quote fallback synthesis events" },
        MetricDef { name: "g6_csv_mixed_expiry_prune_total", kind: MetricKind::Counter, labels: &["index"], budget: 16, help: "Salvaged quotes whose provider-tagged expiry mismatched the requested instrument" },
        MetricDef { name: "g6_quote_missing_field_total", kind: MetricKind::Counter, labels: &["field"], budget: 8, help: "Quotes missing volume/oi" },
        MetricDef { name: "g6_provider_mode", kind: MetricKind::Gauge, labels: &["mode"], budget: 8, help: "Active provider mode" },
        MetricDef { name: "g6_provider_outage_total", kind: MetricKind::Counter, labels: &["code"], budget: 16, help: "Provider outage events" },
        MetricDef { name: "g6_stream_append_total", kind: MetricKind::Counter, labels: &["mode"], budget: 8, help: "indices_stream appends" },
        MetricDef { name: "g6_stream_skipped_total", kind: MetricKind::Counter, labels: &["mode", "reason"], budget: 16, help: "indices_stream skipped appends" },
        MetricDef { name: "g6_stream_gate_mode_info", kind: MetricKind::Gauge, labels: &["mode"], budget: 8, help: "Active stream gate mode" },
        MetricDef { name: "g6_stream_conflict_total", kind: MetricKind::Counter, labels: &[], budget: 1, help: "Concurrent stream-state writer conflicts" },
        MetricDef { name: "g6_stream_state_persist_errors_total", kind: MetricKind::Counter, labels: &[], budget: 1, help: "Stream state persistence errors" },
        MetricDef { name: "g6_sse_http_active_connections", kind: MetricKind::Gauge, labels: &[], budget: 1, help: "Active SSE connections" },
        MetricDef { name: "g6_sse_http_connections_total", kind: MetricKind::Counter, labels: &["result"], budget: 8, help: "SSE connection attempts by result" },
        MetricDef { name: "g6_sse_event_size_bytes", kind: MetricKind::Histogram, labels: &["type"], budget: 16, help: "SSE event size distribution" },
        MetricDef { name: "g6_sse_panel_update_latency_sec", kind: MetricKind::Histogram, labels: &["panel"], budget: 32, help: "Panel update publish latency" },
        MetricDef { name: "g6_sse_connection_duration_sec", kind: MetricKind::Histogram, labels: &[], budget: 1, help: "SSE connection duration" },
        MetricDef { name: "g6_sse_structured_updates_total", kind: MetricKind::Counter, labels: &[], budget: 1, help: "Structured panel diffs sent" },
        MetricDef { name: "g6_sse_resync_requests_total", kind: MetricKind::Counter, labels: &[], budget: 1, help: "Resync endpoint requests" },
        MetricDef { name: "g6_sse_dropped_events_total", kind: MetricKind::Counter, labels: &[], budget: 1, help: "SSE events dropped for backpressure" },
        MetricDef { name: "g6_error_unknown_total", kind: MetricKind::Counter, labels: &["code"], budget: 32, help: "Errors routed under an unrecognized code" },
        MetricDef { name: "g6_sse_client_failures_total", kind: MetricKind::Counter, labels: &["code"], budget: 16, help: "SSE client-facing failures routed through the error router" },
        MetricDef { name: "g6_component_healthy", kind: MetricKind::Gauge, labels: &["component"], budget: 32, help: "Component health (1/0)" },
        MetricDef { name: "g6_last_check_unix", kind: MetricKind::Gauge, labels: &["component"], budget: 32, help: "Last health check unixtime" },
        MetricDef { name: "g6_metric_duplicates_total", kind: MetricKind::Counter, labels: &["name"], budget: 64, help: "Duplicate metric registrations observed" },
        MetricDef { name: "g6_cardinality_rejected_total", kind: MetricKind::Counter, labels: &["metric"], budget: 64, help: "Label tuples rejected by the cardinality guard" },
        MetricDef { name: "g6_cardinality_series_total", kind: MetricKind::Gauge, labels: &["metric"], budget: 64, help: "Distinct label-tuple series per metric" },
        MetricDef { name: "g6_emission_failure_once_total", kind: MetricKind::Counter, labels: &["metric"], budget: 64, help: "First-occurrence emission failures" },
        MetricDef { name: "g6_emission_failures_total", kind: MetricKind::Counter, labels: &["metric"], budget: 64, help: "Subsequent emission failures" },
        MetricDef { name: "g6_metrics_batch_queue_depth", kind: MetricKind::Gauge, labels: &[], budget: 1, help: "Pending emission batch queue depth" },
        MetricDef { name: "g6_metrics_batch_adaptive_utilization", kind: MetricKind::Gauge, labels: &[], budget: 1, help: "Emission batch target utilization" },
        MetricDef { name: "g6_metrics_batch_dropped_ratio", kind: MetricKind::Gauge, labels: &[], budget: 1, help: "Emission batch dropped/merged ratio" },
        MetricDef { name: "g6_spec_hash_info", kind: MetricKind::Gauge, labels: &["hash"], budget: 1, help: "Metric catalogue content hash" },
        MetricDef { name: "g6_build_config_hash_info", kind: MetricKind::Gauge, labels: &["hash"], budget: 1, help: "Build/config content hash" },
        MetricDef { name: "g6_rate_limit_wait_seconds", kind: MetricKind::Histogram, labels: &[], budget: 1, help: "Provider rate limiter wait durations" },
        MetricDef { name: "g6_rate_limit_exhausted_total", kind: MetricKind::Counter, labels: &[], budget: 1, help: "Rate limiter bounded-wait exhaustions that failed the call" },
        MetricDef { name: "g6_summary_loop_plugin_duration_seconds", kind: MetricKind::Histogram, labels: &["plugin"], budget: 8, help: "Summary loop plugin execution duration" },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_registration_counted_and_non_fatal_by_default() {
        let registry = Registry::new(false, false);
        let def = MetricDef { name: "g6_collection_cycles_total", kind: MetricKind::Counter, labels: &[], budget: 1, help: "x" };
        assert!(registry.register(def).is_ok());
        registry.flush_batch();
        let text = registry.render();
        assert!(text.contains("g6_metric_duplicates_total"));
    }

    #[test]
    fn duplicate_registration_fatal_under_strict_mode() {
        let registry = Registry::new(false, true);
        let def = MetricDef { name: "g6_collection_cycles_total", kind: MetricKind::Counter, labels: &[], budget: 1, help: "x" };
        assert!(registry.register(def).is_err());
    }

    #[test]
    fn cardinality_budget_enforced_end_to_end() {
        let registry = Registry::new(false, false);
        registry.register(MetricDef {
            name: "g6_test_budgeted",
            kind: MetricKind::Counter,
            labels: &["tag"],
            budget: 3,
            help: "test",
        }).unwrap();

        for tag in ["a", "b", "c", "d"] {
            registry.inc("g6_test_budgeted", &[("tag", tag)], 1);
        }
        let text = registry.render();
        assert_eq!(text.matches("g6_test_budgeted{").count(), 3);
        assert!(text.contains("g6_cardinality_rejected_total"));
    }

    #[test]
    fn render_includes_self_metrics() {
        let registry = Registry::new(false, false);
        let text = registry.render();
        assert!(text.contains("g6_metrics_batch_queue_depth"));
        assert!(text.contains("g6_spec_hash_info"));
    }
}
