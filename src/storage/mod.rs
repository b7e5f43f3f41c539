//! Storage Sinks (spec.md §4.1 item 4, §6.5): a uniform row contract over
//! one or more persistence backends. This crate ships the CSV partitioned
//! writer; a TSDB sink would implement the same `Sink` trait.

pub mod csv_sink;

use crate::domain::{Instrument, OptionType, Quote};
use crate::error::SinkError;
use async_trait::async_trait;
use chrono::NaiveDate;

/// One persisted row: an enriched quote joined with its instrument identity
/// and position relative to ATM.
#[derive(Debug, Clone)]
pub struct OptionRow {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub index: String,
    pub expiry_key: String,
    pub expiry: NaiveDate,
    pub strike: f64,
    pub option_type: OptionType,
    pub offset_label: String,
    pub quote: Quote,
}

impl OptionRow {
    pub fn new(
        index: impl Into<String>,
        expiry_key: impl Into<String>,
        expiry: NaiveDate,
        instrument: &Instrument,
        offset_label: String,
        quote: Quote,
    ) -> Self {
        Self {
            timestamp: quote.timestamp,
            index: index.into(),
            expiry_key: expiry_key.into(),
            expiry,
            strike: instrument.strike,
            option_type: instrument.option_type,
            offset_label,
            quote,
        }
    }
}

/// Signed strike offset in steps from ATM, rendered as the partition
/// sub-directory name (`ATM`, `ITM1`, `OTM1`, ...).
pub fn offset_label(strike: f64, atm: f64, step: f64) -> String {
    if step <= 0.0 {
        return "ATM".to_string();
    }
    let steps = ((strike - atm) / step).round() as i64;
    match steps.cmp(&0) {
        std::cmp::Ordering::Equal => "ATM".to_string(),
        std::cmp::Ordering::Greater => format!("OTM{}", steps),
        std::cmp::Ordering::Less => format!("ITM{}", steps.abs()),
    }
}

#[async_trait]
pub trait Sink: Send + Sync {
    async fn persist_rows(&self, rows: &[OptionRow]) -> Result<(), SinkError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offset_label_classifies_itm_atm_otm() {
        assert_eq!(offset_label(20000.0, 20000.0, 50.0), "ATM");
        assert_eq!(offset_label(20100.0, 20000.0, 50.0), "OTM2");
        assert_eq!(offset_label(19900.0, 20000.0, 50.0), "ITM2");
    }
}
