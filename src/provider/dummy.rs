//! `DummyProvider`: deterministic synthetic data source for tests and local
//! runs (spec.md §1 "the real broker integration is out of scope"). Values
//! are a pure function of the input so repeated cycles are reproducible.

use super::{Provider, ProviderMode};
use crate::domain::{ExpiryRule, Greeks, Instrument, OptionType, Quote};
use crate::error::{ProviderError, ProviderErrorKind};
use async_trait::async_trait;
use chrono::{Datelike, DateTime, NaiveDate, Timelike, Utc, Weekday};

/// Session close (IST cash-equity hours, same window as the orchestrator's
/// `within_market_hours`): 15:30.
const MARKET_CLOSE_MINUTES: u32 = 15 * 60 + 30;

pub struct DummyProvider {
    pub base_spot: f64,
}

impl Default for DummyProvider {
    fn default() -> Self {
        Self { base_spot: 20000.0 }
    }
}

fn symbol_seed(symbol: &str) -> f64 {
    symbol.bytes().map(|b| b as f64).sum::<f64>() % 500.0
}

#[async_trait]
impl Provider for DummyProvider {
    async fn get_ltp(&self, symbol: &str) -> Result<f64, ProviderError> {
        Ok(self.base_spot + symbol_seed(symbol))
    }

    async fn get_quote(&self, instrument: &str) -> Result<Quote, ProviderError> {
        let seed = symbol_seed(instrument);
        Ok(Quote {
            last_price: (seed + 1.0).max(0.01),
            volume: Some((seed as u64) * 10 + 1),
            oi: Some((seed as u64) * 100 + 1),
            bid: Some(seed),
            ask: Some(seed + 2.0),
            iv: Some(0.15 + seed / 10_000.0),
            greeks: Some(Greeks {
                delta: 0.5,
                gamma: 0.01,
                theta: -0.02,
                vega: 0.1,
                rho: 0.03,
            }),
            timestamp: Utc::now(),
            quote_expiry: None,
        })
    }

    async fn resolve_expiry(&self, _symbol: &str, rule: &ExpiryRule) -> Result<NaiveDate, ProviderError> {
        let now = Utc::now();
        let today = now.date_naive();
        let date = match rule {
            ExpiryRule::Literal(d) => *d,
            ExpiryRule::ThisWeek => resolve_this_week(today, now)?,
            ExpiryRule::NextWeek => next_weekday(today, Weekday::Thu) + chrono::Duration::weeks(1),
            ExpiryRule::ThisMonth => last_weekday_of_month(today.year(), today.month(), Weekday::Thu),
            ExpiryRule::NextMonth => {
                let (y, m) = next_month(today.year(), today.month());
                last_weekday_of_month(y, m, Weekday::Thu)
            }
        };
        Ok(date)
    }

    async fn get_option_instruments(
        &self,
        symbol: &str,
        expiry: NaiveDate,
        strikes: &[f64],
    ) -> Result<Vec<Instrument>, ProviderError> {
        if strikes.is_empty() {
            return Err(ProviderError::new(ProviderErrorKind::Missing));
        }
        let mut out = Vec::with_capacity(strikes.len() * 2);
        for &strike in strikes {
            for option_type in [OptionType::Call, OptionType::Put] {
                out.push(Instrument {
                    symbol: symbol.to_string(),
                    strike,
                    option_type,
                    expiry,
                });
            }
        }
        Ok(out)
    }

    fn mode(&self) -> ProviderMode {
        ProviderMode::Real
    }
}

/// `this_week` rule (spec.md §8): the next Thursday, skipping today if
/// today is Thursday but the session has already closed. Only looks within
/// the next 7 days — if skipping today pushes the match past that window,
/// the call fails as `empty_future` rather than silently jumping to next
/// week's expiry.
fn resolve_this_week(today: NaiveDate, now: DateTime<Utc>) -> Result<NaiveDate, ProviderError> {
    let today_closed = now.hour() * 60 + now.minute() >= MARKET_CLOSE_MINUTES;
    for offset in 0..7 {
        let d = today + chrono::Duration::days(offset);
        if d.weekday() == Weekday::Thu {
            if offset == 0 && today_closed {
                continue;
            }
            return Ok(d);
        }
    }
    Err(ProviderError::new(ProviderErrorKind::EmptyFuture))
}

fn next_weekday(from: NaiveDate, target: Weekday) -> NaiveDate {
    let mut d = from;
    loop {
        if d.weekday() == target {
            return d;
        }
        d = d.succ_opt().expect("date overflow");
    }
}

fn last_weekday_of_month(year: i32, month: u32, target: Weekday) -> NaiveDate {
    let (next_y, next_m) = next_month(year, month);
    let first_of_next = NaiveDate::from_ymd_opt(next_y, next_m, 1).expect("valid date");
    let mut d = first_of_next.pred_opt().expect("date underflow");
    while d.weekday() != target {
        d = d.pred_opt().expect("date underflow");
    }
    d
}

fn next_month(year: i32, month: u32) -> (i32, u32) {
    if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_ltp_is_deterministic_for_same_symbol() {
        let provider = DummyProvider::default();
        let a = provider.get_ltp("NIFTY").await.unwrap();
        let b = provider.get_ltp("NIFTY").await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn instruments_cover_both_option_types_per_strike() {
        let provider = DummyProvider::default();
        let expiry = NaiveDate::from_ymd_opt(2025, 10, 30).unwrap();
        let instruments = provider
            .get_option_instruments("NIFTY", expiry, &[19900.0, 20000.0])
            .await
            .unwrap();
        assert_eq!(instruments.len(), 4);
    }

    #[tokio::test]
    async fn empty_strikes_is_missing_error() {
        let provider = DummyProvider::default();
        let expiry = NaiveDate::from_ymd_opt(2025, 10, 30).unwrap();
        let err = provider.get_option_instruments("NIFTY", expiry, &[]).await.unwrap_err();
        assert_eq!(err.kind, ProviderErrorKind::Missing);
    }

    #[test]
    fn this_week_skips_today_when_already_closed() {
        let thursday = NaiveDate::from_ymd_opt(2025, 10, 30).unwrap();
        assert_eq!(thursday.weekday(), Weekday::Thu);
        let after_close = thursday.and_hms_opt(16, 0, 0).unwrap().and_utc();
        let err = resolve_this_week(thursday, after_close).unwrap_err();
        assert_eq!(err.kind, ProviderErrorKind::EmptyFuture);
    }

    #[test]
    fn this_week_returns_today_when_still_open() {
        let thursday = NaiveDate::from_ymd_opt(2025, 10, 30).unwrap();
        let before_close = thursday.and_hms_opt(9, 0, 0).unwrap().and_utc();
        let date = resolve_this_week(thursday, before_close).unwrap();
        assert_eq!(date, thursday);
    }

    #[test]
    fn last_weekday_of_month_finds_final_thursday() {
        let d = last_weekday_of_month(2025, 10, Weekday::Thu);
        assert_eq!(d.weekday(), Weekday::Thu);
        assert_eq!(d.month(), 10);
        assert!(d.day() >= 25);
    }
}
