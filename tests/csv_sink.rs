//! Integration test for the CSV sink (spec.md §6.5): partition layout and
//! header-once-then-append semantics through the `Sink` trait, not the
//! writer internals directly.

use chrono::{NaiveDate, Utc};
use g6_collector::domain::{Instrument, OptionType, Quote};
use g6_collector::storage::csv_sink::CsvSink;
use g6_collector::storage::{offset_label, OptionRow, Sink};

fn row(strike: f64, option_type: OptionType) -> OptionRow {
    let expiry = NaiveDate::from_ymd_opt(2026, 7, 30).unwrap();
    let instrument = Instrument {
        symbol: "NIFTY".to_string(),
        strike,
        option_type,
        expiry,
    };
    let quote = Quote {
        last_price: 120.0,
        volume: Some(1000),
        oi: Some(5000),
        bid: Some(119.0),
        ask: Some(121.0),
        iv: Some(0.18),
        greeks: None,
        timestamp: Utc::now(),
        quote_expiry: None,
    };
    OptionRow::new("NIFTY", "2026-W31", expiry, &instrument, offset_label(strike, 20000.0, 50.0), quote)
}

#[tokio::test]
async fn persists_rows_into_partitioned_files_and_appends_on_second_call() {
    let dir = tempfile::tempdir().unwrap();
    let sink = CsvSink::new(dir.path());

    sink.persist_rows(&[row(20000.0, OptionType::Call), row(19900.0, OptionType::Put)])
        .await
        .unwrap();
    sink.persist_rows(&[row(20000.0, OptionType::Call)]).await.unwrap();

    let atm_dir = dir.path().join("NIFTY").join("2026-W31").join("ATM");
    assert!(atm_dir.exists(), "expected an ATM partition directory under {atm_dir:?}");

    let mut files: Vec<_> = std::fs::read_dir(&atm_dir).unwrap().filter_map(|e| e.ok()).collect();
    assert_eq!(files.len(), 1, "one file per day, not one per write");

    let contents = std::fs::read_to_string(files.remove(0).path()).unwrap();
    let lines: Vec<_> = contents.lines().collect();
    assert_eq!(lines.len(), 3, "header + two appended rows");

    let itm_dir = dir.path().join("NIFTY").join("2026-W31").join("ITM2");
    assert!(itm_dir.exists(), "the 19900 strike is two steps ITM of the 20000 ATM");
}
