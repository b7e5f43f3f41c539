//! Shared data model: the plain-data types that flow between components.
//!
//! Kept deliberately free of behavior beyond small invariant-checking
//! constructors — components own the logic, these are the nouns.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Semantic expiry selector, or an explicit ISO date that short-circuits the
/// provider (spec.md §3 `ExpiryRule`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExpiryRule {
    ThisWeek,
    NextWeek,
    ThisMonth,
    NextMonth,
    Literal(NaiveDate),
}

impl ExpiryRule {
    pub fn as_key(&self) -> String {
        match self {
            ExpiryRule::ThisWeek => "this_week".to_string(),
            ExpiryRule::NextWeek => "next_week".to_string(),
            ExpiryRule::ThisMonth => "this_month".to_string(),
            ExpiryRule::NextMonth => "next_month".to_string(),
            ExpiryRule::Literal(d) => d.format("%Y-%m-%d").to_string(),
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "this_week" => Some(ExpiryRule::ThisWeek),
            "next_week" => Some(ExpiryRule::NextWeek),
            "this_month" => Some(ExpiryRule::ThisMonth),
            "next_month" => Some(ExpiryRule::NextMonth),
            other => NaiveDate::parse_from_str(other, "%Y-%m-%d")
                .ok()
                .map(ExpiryRule::Literal),
        }
    }

    pub fn is_literal(&self) -> bool {
        matches!(self, ExpiryRule::Literal(_))
    }
}

/// Per-index static configuration (spec.md §3 `IndexParams`). Loaded once at
/// startup, never mutated afterward.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexParams {
    pub symbol: String,
    pub enabled: bool,
    pub expiry_rules: Vec<ExpiryRule>,
    pub strikes_itm: u32,
    pub strikes_otm: u32,
    pub strike_step: f64,
}

/// Option/underlying quote (spec.md §3 `Quote`).
///
/// Invariant: `last_price >= 0`. If both `bid` and `ask` are present,
/// `ask >= bid`. Missing `volume`/`oi` does not invalidate the quote; callers
/// are expected to bump `g6_quote_missing_field_total` when absent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quote {
    pub last_price: f64,
    pub volume: Option<u64>,
    pub oi: Option<u64>,
    pub bid: Option<f64>,
    pub ask: Option<f64>,
    pub iv: Option<f64>,
    pub greeks: Option<Greeks>,
    pub timestamp: DateTime<Utc>,
    /// Expiry the provider actually tagged this quote with, when it differs
    /// from the instrument key requested (strike/symbol still align). `None`
    /// means the provider didn't report one, which is the common case.
    pub quote_expiry: Option<NaiveDate>,
}

impl Quote {
    /// Returns `false` if the quote violates a hard invariant (negative
    /// price, or crossed/inverted bid-ask). Used by the `prefilter` phase.
    pub fn is_sane(&self) -> bool {
        if self.last_price < 0.0 {
            return false;
        }
        if let (Some(bid), Some(ask)) = (self.bid, self.ask) {
            if ask < bid {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Greeks {
    pub delta: f64,
    pub gamma: f64,
    pub theta: f64,
    pub vega: f64,
    pub rho: f64,
}

/// An instrument identity as returned by `GetOptionInstruments`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instrument {
    pub symbol: String,
    pub strike: f64,
    pub option_type: OptionType,
    pub expiry: NaiveDate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OptionType {
    Call,
    Put,
}

impl OptionType {
    pub fn as_str(self) -> &'static str {
        match self {
            OptionType::Call => "CE",
            OptionType::Put => "PE",
        }
    }
}

/// Terminal classification assigned by the `classify` phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExpiryStatus {
    Ok,
    Degraded,
    Stall,
    NoData,
    Empty,
}

impl ExpiryStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ExpiryStatus::Ok => "OK",
            ExpiryStatus::Degraded => "DEGRADED",
            ExpiryStatus::Stall => "STALL",
            ExpiryStatus::NoData => "NO_DATA",
            ExpiryStatus::Empty => "EMPTY",
        }
    }
}

/// Pipeline state machine position (spec.md §4.4 "State machine").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PipelineStage {
    Init,
    Resolved,
    Fetched,
    Enriched,
    Validated,
    Persisted,
    Done,
    Aborted,
    Failed,
}

/// Per-(index, expiry), per-cycle working state (spec.md §3 `ExpiryState`).
/// Owned exclusively by the Collector Orchestrator; created at pipeline
/// entry and discarded after the cycle, except for the metrics it emitted.
#[derive(Debug, Clone)]
pub struct ExpiryState {
    pub index: String,
    pub rule: ExpiryRule,
    pub resolved_expiry_date: Option<NaiveDate>,
    pub atm: Option<f64>,
    pub strike_step: f64,
    pub strikes: Vec<f64>,
    pub instruments: Vec<Instrument>,
    pub enriched: HashMap<String, Quote>,
    pub stage: PipelineStage,
    pub status: Option<ExpiryStatus>,
    pub errors: Vec<String>,
    pub flags: ExpiryFlags,
    pub strike_coverage: f64,
    pub field_coverage: f64,
}

#[derive(Debug, Clone, Default)]
pub struct ExpiryFlags {
    pub salvaged: bool,
}

impl ExpiryState {
    pub fn new(index: impl Into<String>, rule: ExpiryRule) -> Self {
        Self {
            index: index.into(),
            rule,
            resolved_expiry_date: None,
            atm: None,
            strike_step: 0.0,
            strikes: Vec::new(),
            instruments: Vec::new(),
            enriched: HashMap::new(),
            stage: PipelineStage::Init,
            status: None,
            errors: Vec::new(),
            flags: ExpiryFlags::default(),
            strike_coverage: 0.0,
            field_coverage: 0.0,
        }
    }

    pub fn options_count(&self) -> usize {
        self.enriched.len()
    }
}

/// ATM strike computation (spec.md §8 "Boundary behaviors"): rounds to the
/// nearest valid strike step, ties breaking to the higher strike.
pub fn atm_strike(spot: f64, step: f64) -> f64 {
    if step <= 0.0 {
        return spot;
    }
    let ratio = spot / step;
    let lower = ratio.floor();
    let frac = ratio - lower;
    let rounded = if frac >= 0.5 { lower + 1.0 } else { lower };
    rounded * step
}

/// Build the strike universe around an ATM strike.
pub fn strike_universe(atm: f64, step: f64, itm: u32, otm: u32) -> Vec<f64> {
    let itm = itm as i64;
    let otm = otm as i64;
    (-itm..=otm).map(|n| atm + (n as f64) * step).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atm_rounds_to_nearest_step_ties_up() {
        assert_eq!(atm_strike(20050.0, 100.0), 20100.0);
        assert_eq!(atm_strike(20049.0, 100.0), 20000.0);
        assert_eq!(atm_strike(20000.0, 100.0), 20000.0);
    }

    #[test]
    fn strike_universe_is_centered() {
        let strikes = strike_universe(20000.0, 100.0, 2, 2);
        assert_eq!(
            strikes,
            vec![19800.0, 19900.0, 20000.0, 20100.0, 20200.0]
        );
    }

    #[test]
    fn quote_sanity_rejects_negative_price_and_crossed_book() {
        let base = Quote {
            last_price: 10.0,
            volume: None,
            oi: None,
            bid: Some(10.0),
            ask: Some(9.0),
            iv: None,
            greeks: None,
            timestamp: Utc::now(),
            quote_expiry: None,
        };
        assert!(!base.is_sane());

        let mut negative = base.clone();
        negative.last_price = -1.0;
        negative.bid = None;
        negative.ask = None;
        assert!(!negative.is_sane());
    }

    #[test]
    fn expiry_rule_parse_round_trips() {
        assert_eq!(ExpiryRule::parse("this_week"), Some(ExpiryRule::ThisWeek));
        assert_eq!(
            ExpiryRule::parse("2025-10-14"),
            Some(ExpiryRule::Literal(
                NaiveDate::from_ymd_opt(2025, 10, 14).unwrap()
            ))
        );
        assert_eq!(ExpiryRule::parse("bogus"), None);
    }
}
