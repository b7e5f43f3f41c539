//! Stream Gater (spec.md §4.6): enforces append cadence for the rolling
//! `indices_stream` panel, backed by a persisted `.indices_stream_state.json`.
//! Runs immediately after the Panels Writer within the unified Summary Loop
//! iteration; panel writes it produces are committed by the caller inside
//! the same transaction as every other panel for that cycle.

use crate::config::StreamGateMode;
use crate::metrics::Registry;
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::warn;

const MAX_STREAM_ITEMS: usize = 50;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamState {
    pub last_cycle: Option<u64>,
    pub last_bucket: Option<String>,
}

pub struct GateOutcome {
    pub appended: bool,
    pub reason: Option<&'static str>,
    pub items: Vec<Value>,
}

struct Inner {
    state: StreamState,
    items: VecDeque<Value>,
}

pub struct StreamGater {
    state_path: PathBuf,
    gate_mode: StreamGateMode,
    metrics: Arc<Registry>,
    inner: Mutex<Inner>,
}

impl StreamGater {
    pub fn new(state_path: impl Into<PathBuf>, gate_mode: StreamGateMode, metrics: Arc<Registry>) -> Self {
        let state_path = state_path.into();
        let state = load_state(&state_path, &metrics);
        metrics.set("g6_stream_gate_mode_info", &[("mode", gate_mode.as_str())], 1.0);
        Self {
            state_path,
            gate_mode,
            metrics,
            inner: Mutex::new(Inner {
                state,
                items: VecDeque::new(),
            }),
        }
    }

    /// Evaluates whether `cycle_item` should be appended to the rolling
    /// stream given the configured gate mode, and updates + persists state
    /// if it does (spec.md §4.6 steps 2-5).
    pub fn process(&self, cur_cycle: u64, cycle_item: Value) -> GateOutcome {
        let cur_bucket = Utc::now().format("%H:%M").to_string();
        let mode = self.gate_mode.as_str();
        let mut inner = self.inner.lock();

        let should_append = match self.gate_mode {
            StreamGateMode::Cycle | StreamGateMode::Auto => inner.state.last_cycle != Some(cur_cycle),
            StreamGateMode::Minute | StreamGateMode::Bucket => inner.state.last_bucket.as_deref() != Some(cur_bucket.as_str()),
        };

        if !should_append {
            self.metrics.inc("g6_stream_skipped_total", &[("mode", mode), ("reason", "no_change")], 1);
            return GateOutcome {
                appended: false,
                reason: Some("no_change"),
                items: inner.items.iter().cloned().collect(),
            };
        }

        inner.items.push_back(cycle_item);
        while inner.items.len() > MAX_STREAM_ITEMS {
            inner.items.pop_front();
        }
        inner.state.last_cycle = Some(cur_cycle);
        inner.state.last_bucket = Some(cur_bucket);

        self.metrics.inc("g6_stream_append_total", &[("mode", mode)], 1);
        let snapshot: Vec<Value> = inner.items.iter().cloned().collect();
        let state_to_persist = inner.state.clone();
        drop(inner);
        self.persist(&state_to_persist);

        GateOutcome {
            appended: true,
            reason: None,
            items: snapshot,
        }
    }

    fn persist(&self, state: &StreamState) {
        let tmp = self.state_path.with_extension("json.tmp");
        let result = (|| -> std::io::Result<()> {
            if let Some(parent) = self.state_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&tmp, serde_json::to_vec(state)?)?;
            std::fs::rename(&tmp, &self.state_path)?;
            Ok(())
        })();
        if let Err(e) = result {
            warn!(error = %e, "failed to persist stream gater state");
            self.metrics.inc("g6_stream_state_persist_errors_total", &[], 1);
        }
    }

    pub fn system_heartbeat_patch(&self, cur_cycle: u64) -> Value {
        serde_json::json!({
            "bridge": {
                "last_publish": Utc::now().to_rfc3339(),
                "cycle": cur_cycle,
            }
        })
    }
}

fn load_state(path: &PathBuf, metrics: &Registry) -> StreamState {
    match std::fs::read_to_string(path) {
        Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|_| {
            metrics.inc("g6_stream_state_persist_errors_total", &[], 1);
            StreamState::default()
        }),
        Err(_) => StreamState::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn cycle_mode_appends_at_most_once_per_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let metrics = Arc::new(Registry::new_for_test());
        let gater = StreamGater::new(dir.path().join(".indices_stream_state.json"), StreamGateMode::Cycle, metrics);

        let first = gater.process(1, json!({"cycle": 1}));
        assert!(first.appended);
        let second = gater.process(1, json!({"cycle": 1}));
        assert!(!second.appended);
        assert_eq!(second.reason, Some("no_change"));
    }

    #[test]
    fn caps_items_at_fifty() {
        let dir = tempfile::tempdir().unwrap();
        let metrics = Arc::new(Registry::new_for_test());
        let gater = StreamGater::new(dir.path().join(".indices_stream_state.json"), StreamGateMode::Cycle, metrics);

        for cycle in 1..=60u64 {
            gater.process(cycle, json!({"cycle": cycle}));
        }
        let outcome = gater.process(60, json!({"cycle": 60}));
        assert!(outcome.items.len() <= 50);
    }

    #[test]
    fn state_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let state_path = dir.path().join(".indices_stream_state.json");
        let metrics = Arc::new(Registry::new_for_test());
        {
            let gater = StreamGater::new(&state_path, StreamGateMode::Cycle, metrics.clone());
            gater.process(1, json!({"cycle": 1}));
        }
        let gater2 = StreamGater::new(&state_path, StreamGateMode::Cycle, metrics);
        let outcome = gater2.process(1, json!({"cycle": 1}));
        assert!(!outcome.appended, "reloaded state should recognize cycle 1 as already appended");
    }
}
