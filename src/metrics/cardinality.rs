//! Cardinality Guard (spec.md §4.2): rejects label tuples beyond a metric's
//! configured series budget, and reports hourly growth diagnostics.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};
use tracing::info;

#[derive(Default)]
struct MetricCardinality {
    seen: HashSet<Vec<String>>,
    rejected: u64,
    last_growth_log: Option<Instant>,
}

pub struct CardinalityGuard {
    state: Mutex<HashMap<&'static str, MetricCardinality>>,
}

impl CardinalityGuard {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(HashMap::new()),
        }
    }

    /// Returns `true` if `label_values` is admitted for `metric` under
    /// `budget`. A tuple already seen is always admitted (budget bounds
    /// distinct tuples, not repeat increments).
    pub fn admit(&self, metric: &'static str, label_values: &[String], budget: usize) -> bool {
        let mut state = self.state.lock();
        let entry = state.entry(metric).or_default();

        if entry.seen.contains(label_values) {
            return true;
        }

        if entry.seen.len() >= budget {
            entry.rejected += 1;
            return false;
        }

        entry.seen.insert(label_values.to_vec());

        let now = Instant::now();
        let should_log = entry
            .last_growth_log
            .map(|last| now.duration_since(last) >= Duration::from_secs(3600))
            .unwrap_or(true);
        if should_log {
            entry.last_growth_log = Some(now);
            info!(metric, series = entry.seen.len(), budget, "cardinality growth diagnostic");
        }

        true
    }

    pub fn series_count(&self, metric: &str) -> usize {
        self.state.lock().get(metric).map(|m| m.seen.len()).unwrap_or(0)
    }

    pub fn rejected_count(&self, metric: &str) -> u64 {
        self.state.lock().get(metric).map(|m| m.rejected).unwrap_or(0)
    }

    pub fn all_series_counts(&self) -> Vec<(String, usize)> {
        self.state
            .lock()
            .iter()
            .map(|(name, m)| (name.to_string(), m.seen.len()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_beyond_budget_but_allows_repeats() {
        let guard = CardinalityGuard::new();
        assert!(guard.admit("m", &["a".into()], 1));
        assert!(guard.admit("m", &["a".into()], 1), "repeat of seen tuple is always admitted");
        assert!(!guard.admit("m", &["b".into()], 1), "budget of 1 rejects a second distinct tuple");
        assert_eq!(guard.series_count("m"), 1);
        assert_eq!(guard.rejected_count("m"), 1);
    }

    #[test]
    fn budget_of_three_rejects_fourth_distinct_tuple() {
        let guard = CardinalityGuard::new();
        for label in ["a", "b", "c"] {
            assert!(guard.admit("counter", &[label.into()], 3));
        }
        assert!(!guard.admit("counter", &["d".into()], 3));
        assert_eq!(guard.series_count("counter"), 3);
    }
}
