//! Summary Loop (spec.md §4.8): ordered plugin orchestration run once per
//! collector cycle — Panels Writer, Stream Gater, SSE Publisher, Metrics
//! Emitter, in that order, each isolated so a single plugin's failure never
//! aborts the others.

use crate::collector::cycle_stats::CycleStats;
use crate::config::Settings;
use crate::metrics::Registry;
use crate::panels::{PanelsWriter, Txn};
use crate::panels::stream_gater::StreamGater;
use crate::sse::{LineChange, Publisher, SseEvent, StructuredUpdate};
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info};

pub struct SummaryLoop {
    settings: Arc<Settings>,
    panels_writer: Arc<PanelsWriter>,
    stream_gater: Arc<StreamGater>,
    publisher: Arc<Publisher>,
    metrics: Arc<Registry>,
    last_rendered: Mutex<HashMap<String, String>>,
    /// Last time a non-heartbeat event was broadcast. `None` means nothing
    /// has gone out yet, which counts as idle (spec.md §4.7 "heartbeat only
    /// when idle").
    last_activity: Mutex<Option<Instant>>,
}

fn system_panel(stats: &CycleStats) -> serde_json::Value {
    serde_json::json!({
        "cycle": stats.cycle_number,
        "elapsed_seconds": stats.elapsed_seconds,
        "success_rate_pct": stats.success_rate_pct,
        "readiness_ok": stats.readiness_ok,
        "readiness_reason": stats.readiness_reason,
        "memory_mb": stats.memory_mb,
        "cpu_pct": stats.cpu_pct,
    })
}

/// Crude line-oriented diff: positionally compares `old` and `new` split on
/// `\n`. Good enough to bound structured-update size without pulling in a
/// dedicated diff crate the rest of the corpus never reaches for.
fn diff_lines(old: &str, new: &str) -> (usize, usize, Vec<LineChange>) {
    let old_lines: Vec<&str> = old.lines().collect();
    let new_lines: Vec<&str> = new.lines().collect();
    let max_len = old_lines.len().max(new_lines.len());
    let mut changed = Vec::new();
    let mut added = 0;
    let mut removed = 0;
    for i in 0..max_len {
        let o = old_lines.get(i).copied();
        let n = new_lines.get(i).copied();
        if o != n {
            if o.is_none() {
                added += 1;
            } else if n.is_none() {
                removed += 1;
            }
            changed.push(LineChange {
                index: i,
                old: o.map(str::to_string),
                new: n.map(str::to_string),
            });
        }
    }
    (added, removed, changed)
}

impl SummaryLoop {
    pub fn new(
        settings: Arc<Settings>,
        panels_writer: Arc<PanelsWriter>,
        stream_gater: Arc<StreamGater>,
        publisher: Arc<Publisher>,
        metrics: Arc<Registry>,
    ) -> Self {
        Self {
            settings,
            panels_writer,
            stream_gater,
            publisher,
            metrics,
            last_rendered: Mutex::new(HashMap::new()),
            last_activity: Mutex::new(None),
        }
    }

    fn run_plugin(&self, name: &'static str, f: impl FnOnce() + std::panic::UnwindSafe) {
        let start = Instant::now();
        let result = std::panic::catch_unwind(AssertUnwindSafe(f));
        let elapsed = start.elapsed().as_secs_f64();
        self.metrics.observe("g6_summary_loop_plugin_duration_seconds", &[("plugin", name)], elapsed);
        if result.is_err() {
            error!(plugin = name, "summary loop plugin panicked; continuing with remaining plugins");
        }
    }

    /// Runs one full iteration of the plugin chain for a freshly finished
    /// collector cycle.
    pub async fn run_iteration(&self, stats: &CycleStats) {
        if self.panels_writer.egress_frozen() {
            info!(cycle = stats.cycle_number, "egress frozen; skipping summary loop iteration");
            return;
        }

        let iteration_start = Instant::now();
        let txn = Mutex::new(Some(self.panels_writer.begin_txn()));

        self.run_plugin("panels_writer", || {
            if let Some(t) = txn.lock().as_mut() {
                t.write_panel("indices_info", serde_json::to_value(&stats.indices_info).unwrap_or_default());
                t.write_panel("system", system_panel(stats));
            }
        });

        let cycle_item = serde_json::json!({
            "cycle": stats.cycle_number,
            "timestamp": Utc::now().to_rfc3339(),
            "indices": stats.indices,
        });
        let mut stream_items = Vec::new();
        self.run_plugin("stream_gater", || {
            let outcome = self.stream_gater.process(stats.cycle_number, cycle_item.clone());
            stream_items = outcome.items;
            let heartbeat_patch = self.stream_gater.system_heartbeat_patch(stats.cycle_number);
            if let Some(t) = txn.lock().as_mut() {
                t.write_panel("indices_stream", serde_json::json!(stream_items));
                t.write_panel("bridge_heartbeat", heartbeat_patch);
            }
        });

        let committed = match txn.into_inner().expect("mutex not poisoned").take() {
            Some(t) => match t.commit() {
                Ok(panels) => panels,
                Err(e) => {
                    error!(error = %e, "panels transaction commit failed; skipping publish this cycle");
                    return;
                }
            },
            None => return,
        };

        self.run_plugin("sse_publisher", || {
            self.publish_updates(&committed, stats.cycle_number, iteration_start);
        });

        self.run_plugin("metrics_emitter", || {
            self.metrics.flush_batch();
        });
    }

    fn publish_updates(&self, panels: &[String], cycle: u64, iteration_start: Instant) {
        let mut updates = Vec::new();
        let mut fallbacks = Vec::new();
        let mut last = self.last_rendered.lock();

        for panel in panels {
            let dir = std::path::Path::new(&self.settings.panels_dir);
            let Ok(envelope) = crate::panels::read_panel(dir, panel) else { continue };
            self.metrics.observe(
                "g6_sse_panel_update_latency_sec",
                &[("panel", panel.as_str())],
                iteration_start.elapsed().as_secs_f64(),
            );
            let rendered = serde_json::to_string_pretty(&envelope.data).unwrap_or_default();
            let hash = format!("{:016x}", {
                use std::hash::{Hash, Hasher};
                let mut h = std::collections::hash_map::DefaultHasher::new();
                rendered.hash(&mut h);
                h.finish()
            });

            match last.get(panel) {
                Some(prev) if prev != &rendered => {
                    let (added, removed, changed_lines) = diff_lines(prev, &rendered);
                    if changed_lines.len() <= self.settings.sse_struct_max_changes {
                        updates.push(StructuredUpdate {
                            panel: panel.clone(),
                            hash,
                            added,
                            removed,
                            total_lines: rendered.lines().count(),
                            changed_lines,
                        });
                    } else {
                        fallbacks.push((panel.clone(), envelope.data.clone()));
                    }
                }
                Some(_) => {}
                None => fallbacks.push((panel.clone(), envelope.data.clone())),
            }
            last.insert(panel.clone(), rendered);
        }
        drop(last);

        let now = Instant::now();
        let had_activity = !fallbacks.is_empty() || !updates.is_empty();

        let idle = match *self.last_activity.lock() {
            None => true,
            Some(prev) => now.duration_since(prev).as_secs_f64() >= self.settings.heartbeat_interval_secs as f64,
        };

        for (panel, data) in fallbacks {
            self.publisher.broadcast(&SseEvent::PanelUpdate { panel, data });
        }
        if !updates.is_empty() {
            if self.settings.sse_structured {
                self.publisher.broadcast(&SseEvent::PanelUpdateStructured { updates });
            } else {
                for u in updates {
                    if let Ok(envelope) = crate::panels::read_panel(std::path::Path::new(&self.settings.panels_dir), &u.panel) {
                        self.publisher.broadcast(&SseEvent::PanelUpdate { panel: u.panel, data: envelope.data });
                    }
                }
            }
        }

        if had_activity {
            *self.last_activity.lock() = Some(now);
        }
        if idle {
            self.publisher.broadcast(&SseEvent::Heartbeat { cycle });
        }
    }
}
