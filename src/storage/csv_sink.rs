//! CSV partitioned sink (spec.md §6.5): rows land under
//! `<root>/<INDEX>/<EXPIRY_KEY>/<OFFSET>/<YYYY-MM-DD>.csv`, one file per day,
//! append-only, schema additive. Each write is a single `csv::Writer`
//! `serialize` call followed by an explicit flush, so either the full row
//! lands or none of it does (line-atomic).
//!
//! Per-partition writes are serialized through an in-process lock keyed by
//! path: the spec calls this "best-effort" (no cross-process advisory
//! locking), matching the single-writer-process deployment model.

use super::{OptionRow, Sink};
use crate::error::SinkError;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Serialize)]
struct CsvRecord {
    timestamp: String,
    index: String,
    expiry: String,
    strike: f64,
    option_type: &'static str,
    last_price: f64,
    volume: Option<u64>,
    oi: Option<u64>,
    bid: Option<f64>,
    ask: Option<f64>,
    iv: Option<f64>,
    delta: Option<f64>,
    gamma: Option<f64>,
    theta: Option<f64>,
    vega: Option<f64>,
    rho: Option<f64>,
}

impl From<&OptionRow> for CsvRecord {
    fn from(row: &OptionRow) -> Self {
        let greeks = row.quote.greeks;
        Self {
            timestamp: row.timestamp.to_rfc3339(),
            index: row.index.clone(),
            expiry: row.expiry.format("%Y-%m-%d").to_string(),
            strike: row.strike,
            option_type: row.option_type.as_str(),
            last_price: row.quote.last_price,
            volume: row.quote.volume,
            oi: row.quote.oi,
            bid: row.quote.bid,
            ask: row.quote.ask,
            iv: row.quote.iv,
            delta: greeks.map(|g| g.delta),
            gamma: greeks.map(|g| g.gamma),
            theta: greeks.map(|g| g.theta),
            vega: greeks.map(|g| g.vega),
            rho: greeks.map(|g| g.rho),
        }
    }
}

pub struct CsvSink {
    root: PathBuf,
    locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl CsvSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn partition_path(&self, row: &OptionRow) -> PathBuf {
        self.root
            .join(&row.index)
            .join(&row.expiry_key)
            .join(&row.offset_label)
            .join(format!("{}.csv", row.timestamp.format("%Y-%m-%d")))
    }

    fn partition_lock(&self, path: &Path) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock();
        locks
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn write_one(&self, path: &Path, record: &CsvRecord) -> Result<(), SinkError> {
        let lock = self.partition_lock(path);
        let _guard = lock.lock();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let needs_header = !path.exists();

        let file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
        let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(file);
        if needs_header {
            writer
                .write_record([
                    "timestamp", "index", "expiry", "strike", "option_type", "last_price",
                    "volume", "oi", "bid", "ask", "iv", "delta", "gamma", "theta", "vega", "rho",
                ])
                .map_err(|e| SinkError::Csv(e.to_string()))?;
        }
        writer.serialize(record).map_err(|e| SinkError::Csv(e.to_string()))?;
        writer.flush()?;
        Ok(())
    }
}

#[async_trait]
impl Sink for CsvSink {
    async fn persist_rows(&self, rows: &[OptionRow]) -> Result<(), SinkError> {
        for row in rows {
            let path = self.partition_path(row);
            let record = CsvRecord::from(row);
            self.write_one(&path, &record)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Instrument, OptionType, Quote};
    use chrono::{NaiveDate, Utc};

    fn sample_row(offset_label: &str) -> OptionRow {
        let instrument = Instrument {
            symbol: "NIFTY".to_string(),
            strike: 20000.0,
            option_type: OptionType::Call,
            expiry: NaiveDate::from_ymd_opt(2025, 10, 30).unwrap(),
        };
        let quote = Quote {
            last_price: 123.4,
            volume: Some(10),
            oi: Some(100),
            bid: Some(122.0),
            ask: Some(124.0),
            iv: Some(0.2),
            greeks: None,
            timestamp: Utc::now(),
            quote_expiry: None,
        };
        OptionRow::new("NIFTY", "this_week", instrument.expiry, &instrument, offset_label.to_string(), quote)
    }

    #[tokio::test]
    async fn writes_header_once_and_appends_rows() {
        let dir = tempfile::tempdir().unwrap();
        let sink = CsvSink::new(dir.path());
        sink.persist_rows(&[sample_row("ATM")]).await.unwrap();
        sink.persist_rows(&[sample_row("ATM")]).await.unwrap();

        let path = sink.partition_path(&sample_row("ATM"));
        let contents = std::fs::read_to_string(path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3, "one header + two rows");
        assert!(lines[0].starts_with("timestamp,index,expiry"));
    }

    #[tokio::test]
    async fn different_offsets_land_in_different_partitions() {
        let dir = tempfile::tempdir().unwrap();
        let sink = CsvSink::new(dir.path());
        sink.persist_rows(&[sample_row("ATM"), sample_row("OTM2")]).await.unwrap();

        assert!(sink.partition_path(&sample_row("ATM")).exists());
        assert!(sink.partition_path(&sample_row("OTM2")).exists());
    }
}
