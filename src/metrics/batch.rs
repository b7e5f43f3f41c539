//! Emission Batcher (spec.md §4.2 "Emission Batcher algorithm"): coalesces
//! per-counter increments keyed by `(metric, label tuple)` and flushes them
//! on a size-or-time boundary with an adaptive target batch size.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

pub type LabelTuple = Vec<(String, String)>;
type EntryKey = (String, LabelTuple);

#[derive(Debug, Clone)]
pub struct BatcherConfig {
    pub initial_target: usize,
    pub max_target: usize,
    pub min_batch: usize,
    pub under_util_threshold: f64,
    pub under_util_consec: u32,
    pub max_wait: Duration,
    pub hard_cap: usize,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            initial_target: 64,
            max_target: 2048,
            min_batch: 8,
            under_util_threshold: 0.25,
            under_util_consec: 3,
            max_wait: Duration::from_millis(2000),
            hard_cap: 8192,
        }
    }
}

struct BatcherState {
    pending: HashMap<EntryKey, f64>,
    insertion_order: VecDeque<EntryKey>,
    target: usize,
    under_util_streak: u32,
    last_activity: Instant,
    last_flush: Instant,
    merged_since_flush: u64,
    merged_total: u64,
    dropped_total: u64,
}

/// Adaptive, size-or-time-bounded counter-increment coalescer.
pub struct EmissionBatcher {
    cfg: BatcherConfig,
    state: Mutex<BatcherState>,
}

impl EmissionBatcher {
    pub fn new(cfg: BatcherConfig) -> Self {
        let now = Instant::now();
        let target = cfg.initial_target;
        Self {
            cfg,
            state: Mutex::new(BatcherState {
                pending: HashMap::new(),
                insertion_order: VecDeque::new(),
                target,
                under_util_streak: 0,
                last_activity: now,
                last_flush: now,
                merged_since_flush: 0,
                merged_total: 0,
                dropped_total: 0,
            }),
        }
    }

    /// Enqueue a counter increment. Returns `true` if this call should
    /// trigger an immediate forced flush (hard cap, or `max_wait` elapsed
    /// with pending entries).
    pub fn enqueue(&self, metric: &str, labels: LabelTuple, value: f64) -> bool {
        let mut state = self.state.lock();
        let key = (metric.to_string(), labels);
        let now = Instant::now();

        if !state.pending.contains_key(&key) {
            state.insertion_order.push_back(key.clone());
        }
        *state.pending.entry(key).or_insert(0.0) += value;
        state.merged_since_flush += 1;
        state.merged_total += 1;
        state.last_activity = now;

        while state.pending.len() > self.cfg.hard_cap {
            if let Some(oldest) = state.insertion_order.pop_front() {
                state.pending.remove(&oldest);
                state.dropped_total += 1;
            } else {
                break;
            }
        }

        let forced_by_wait =
            !state.pending.is_empty() && now.duration_since(state.last_flush) > self.cfg.max_wait;
        forced_by_wait || state.pending.len() >= state.target
    }

    /// Drain all pending entries and adapt the target batch size for the
    /// next window.
    pub fn flush(&self) -> Vec<(String, LabelTuple, f64)> {
        let mut state = self.state.lock();
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_flush).max(Duration::from_millis(1));

        let distinct_entries = state.pending.len();
        let instantaneous_rate = state.merged_since_flush as f64 / elapsed.as_secs_f64();

        if instantaneous_rate >= state.target as f64 {
            state.target = (state.target * 2).min(self.cfg.max_target);
            state.under_util_streak = 0;
        } else {
            let utilization = distinct_entries as f64 / state.target as f64;
            if utilization < self.cfg.under_util_threshold {
                state.under_util_streak += 1;
                if state.under_util_streak >= self.cfg.under_util_consec {
                    state.target = ((state.target as f64 * 0.75) as usize).max(self.cfg.min_batch);
                    state.under_util_streak = 0;
                }
            } else {
                state.under_util_streak = 0;
            }
        }

        let idle_floor = self.cfg.min_batch as f64 / elapsed.as_secs_f64() / 4.0;
        if instantaneous_rate < idle_floor {
            state.target = (state.target / 2).max(self.cfg.min_batch);
        }

        let drained: Vec<(String, LabelTuple, f64)> = state
            .pending
            .drain()
            .map(|((metric, labels), value)| (metric, labels, value))
            .collect();
        state.insertion_order.clear();
        state.merged_since_flush = 0;
        state.last_flush = now;

        drained
    }

    pub fn queue_depth(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn adaptive_target(&self) -> usize {
        self.state.lock().target
    }

    pub fn utilization(&self) -> f64 {
        let state = self.state.lock();
        if state.target == 0 {
            0.0
        } else {
            state.pending.len() as f64 / state.target as f64
        }
    }

    pub fn dropped_ratio(&self) -> f64 {
        let state = self.state.lock();
        if state.merged_total == 0 {
            0.0
        } else {
            state.dropped_total as f64 / state.merged_total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn force_flush_triggers_when_max_wait_elapsed() {
        let cfg = BatcherConfig {
            max_wait: Duration::from_millis(0),
            ..Default::default()
        };
        let batcher = EmissionBatcher::new(cfg);
        std::thread::sleep(Duration::from_millis(2));
        let forced = batcher.enqueue("g6_foo", vec![], 1.0);
        assert!(forced, "single pending entry past max_wait must force a flush");
    }

    #[test]
    fn coalesces_repeated_increments_for_same_label_tuple() {
        let batcher = EmissionBatcher::new(BatcherConfig::default());
        let labels: LabelTuple = vec![("index".into(), "NIFTY".into())];
        batcher.enqueue("g6_collection_cycles_total", labels.clone(), 1.0);
        batcher.enqueue("g6_collection_cycles_total", labels.clone(), 2.0);
        let drained = batcher.flush();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].2, 3.0);
    }

    #[test]
    fn hard_cap_drops_oldest_entries() {
        let cfg = BatcherConfig {
            hard_cap: 2,
            ..Default::default()
        };
        let batcher = EmissionBatcher::new(cfg);
        batcher.enqueue("m", vec![("k".into(), "1".into())], 1.0);
        batcher.enqueue("m", vec![("k".into(), "2".into())], 1.0);
        batcher.enqueue("m", vec![("k".into(), "3".into())], 1.0);
        assert!(batcher.dropped_ratio() > 0.0);
        let drained = batcher.flush();
        assert_eq!(drained.len(), 2);
    }
}
