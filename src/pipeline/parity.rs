//! Shadow/parity scoring (spec.md §4.4 "Shadow/parity mode"): compares a
//! shadow pipeline run against the authoritative (legacy or primary) run
//! and maintains a rolling average used to gate promotion/rollback.

use crate::domain::ExpiryState;
use std::collections::VecDeque;

/// Structural signature compared between the two implementations.
#[derive(Debug, Clone, PartialEq)]
pub struct ParitySignature {
    pub option_count: usize,
    pub strike_coverage: f64,
    pub alert_set: Vec<String>,
}

impl ParitySignature {
    pub fn from_state(state: &ExpiryState) -> Self {
        let mut alert_set: Vec<String> = state.errors.clone();
        alert_set.sort();
        Self {
            option_count: state.options_count(),
            strike_coverage: state.strike_coverage,
            alert_set,
        }
    }
}

/// Weighted similarity in `[0, 1]` between a shadow and authoritative
/// signature (spec.md "Score ∈ [0,1]").
pub fn score(authoritative: &ParitySignature, shadow: &ParitySignature) -> f64 {
    let count_score = 1.0
        - ((authoritative.option_count as f64 - shadow.option_count as f64).abs()
            / authoritative.option_count.max(shadow.option_count).max(1) as f64);
    let coverage_score = 1.0 - (authoritative.strike_coverage - shadow.strike_coverage).abs();

    let alert_score = if authoritative.alert_set.is_empty() && shadow.alert_set.is_empty() {
        1.0
    } else {
        let intersection = authoritative
            .alert_set
            .iter()
            .filter(|a| shadow.alert_set.contains(a))
            .count();
        let union = authoritative.alert_set.len() + shadow.alert_set.len() - intersection;
        if union == 0 {
            1.0
        } else {
            intersection as f64 / union as f64
        }
    };

    ((count_score.clamp(0.0, 1.0) + coverage_score.clamp(0.0, 1.0) + alert_score) / 3.0).clamp(0.0, 1.0)
}

/// Rolling window over recent parity scores, used for `g6_pipeline_parity_rolling_avg`
/// and drift detection (consecutive below-threshold windows).
pub struct ParityTracker {
    window: usize,
    drift_threshold_cycles: u32,
    scores: VecDeque<f64>,
    consecutive_below_threshold: u32,
}

impl ParityTracker {
    pub fn new(window: usize, drift_threshold_cycles: u32) -> Self {
        Self {
            window,
            drift_threshold_cycles,
            scores: VecDeque::with_capacity(window),
            consecutive_below_threshold: 0,
        }
    }

    /// Records a score and returns `(rolling_avg, drifted)` — `drifted` is
    /// true once the rolling average has stayed below `threshold` for
    /// `drift_threshold_cycles` consecutive observations.
    pub fn record(&mut self, observed: f64, threshold: f64) -> (f64, bool) {
        if self.scores.len() == self.window {
            self.scores.pop_front();
        }
        self.scores.push_back(observed);

        let avg = self.scores.iter().sum::<f64>() / self.scores.len() as f64;
        if avg < threshold {
            self.consecutive_below_threshold += 1;
        } else {
            self.consecutive_below_threshold = 0;
        }

        let drifted = self.consecutive_below_threshold >= self.drift_threshold_cycles;
        (avg, drifted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_signatures_score_one() {
        let sig = ParitySignature {
            option_count: 20,
            strike_coverage: 1.0,
            alert_set: vec!["stall".to_string()],
        };
        assert_eq!(score(&sig, &sig), 1.0);
    }

    #[test]
    fn divergent_option_counts_lower_score() {
        let a = ParitySignature { option_count: 20, strike_coverage: 1.0, alert_set: vec![] };
        let b = ParitySignature { option_count: 10, strike_coverage: 1.0, alert_set: vec![] };
        assert!(score(&a, &b) < 1.0);
    }

    #[test]
    fn drift_flags_after_consecutive_below_threshold_windows() {
        let mut tracker = ParityTracker::new(3, 2);
        let (_, drifted1) = tracker.record(0.5, 0.9);
        assert!(!drifted1);
        let (_, drifted2) = tracker.record(0.5, 0.9);
        assert!(drifted2, "two consecutive below-threshold windows should flag drift");
    }
}
