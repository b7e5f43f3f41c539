//! `CycleStats` (spec.md §3) and the atomic runtime status file writer
//! (spec.md §6.1).

use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Clone, Serialize)]
pub struct IndexInfo {
    pub ltp: f64,
    pub options: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleStats {
    pub cycle_number: u64,
    pub started_at: chrono::DateTime<Utc>,
    pub elapsed_seconds: f64,
    pub interval_seconds: u64,
    pub indices: Vec<String>,
    pub indices_info: HashMap<String, IndexInfo>,
    pub success_rate_pct: f64,
    pub api_success_rate: f64,
    pub memory_mb: f64,
    pub cpu_pct: f64,
    pub readiness_ok: bool,
    pub readiness_reason: String,
}

impl CycleStats {
    pub fn options_last_cycle(&self) -> usize {
        self.indices_info.values().map(|i| i.options).sum()
    }

    pub fn options_per_minute(&self) -> f64 {
        if self.elapsed_seconds <= 0.0 {
            return 0.0;
        }
        self.options_last_cycle() as f64 / self.elapsed_seconds * 60.0
    }
}

#[derive(Serialize)]
struct RuntimeStatusDoc<'a> {
    timestamp: String,
    cycle: u64,
    elapsed: f64,
    interval: u64,
    sleep_sec: f64,
    success_rate_pct: f64,
    options_last_cycle: usize,
    options_per_minute: f64,
    memory_mb: f64,
    cpu_pct: f64,
    readiness_ok: bool,
    readiness_reason: &'a str,
    indices: &'a [String],
    indices_info: &'a HashMap<String, IndexInfo>,
}

/// Writes the runtime status file atomically: serialize to `<path>.tmp`,
/// then rename over `<path>` (spec.md §4.5 step 3, §6.1).
pub fn write_runtime_status(path: &Path, stats: &CycleStats) -> std::io::Result<()> {
    let doc = RuntimeStatusDoc {
        timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        cycle: stats.cycle_number,
        elapsed: stats.elapsed_seconds,
        interval: stats.interval_seconds,
        sleep_sec: (stats.interval_seconds as f64 - stats.elapsed_seconds).max(0.0),
        success_rate_pct: stats.success_rate_pct,
        options_last_cycle: stats.options_last_cycle(),
        options_per_minute: stats.options_per_minute(),
        memory_mb: stats.memory_mb,
        cpu_pct: stats.cpu_pct,
        readiness_ok: stats.readiness_ok,
        readiness_reason: &stats.readiness_reason,
        indices: &stats.indices,
        indices_info: &stats.indices_info,
    };

    let tmp_path = path.with_extension("tmp");
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let serialized = serde_json::to_vec_pretty(&doc)?;
    std::fs::write(&tmp_path, serialized)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_file_is_written_via_tmp_then_rename() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runtime_status.json");

        let mut indices_info = HashMap::new();
        indices_info.insert("NIFTY".to_string(), IndexInfo { ltp: 20000.0, options: 20 });

        let stats = CycleStats {
            cycle_number: 1,
            started_at: Utc::now(),
            elapsed_seconds: 2.5,
            interval_seconds: 60,
            indices: vec!["NIFTY".to_string()],
            indices_info,
            success_rate_pct: 100.0,
            api_success_rate: 100.0,
            memory_mb: 128.0,
            cpu_pct: 5.0,
            readiness_ok: true,
            readiness_reason: String::new(),
        };

        write_runtime_status(&path, &stats).unwrap();
        assert!(path.exists());
        assert!(!path.with_extension("tmp").exists());

        let raw = std::fs::read_to_string(&path).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed["cycle"], 1);
        assert_eq!(parsed["indices_info"]["NIFTY"]["options"], 20);
    }
}
