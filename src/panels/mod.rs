//! Panels Writer (spec.md §4.6): transactional per-panel JSON artifacts,
//! committed via tmp-and-rename, with a `.meta.json` manifest.

pub mod stream_gater;

use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Wrapped panel payload (spec.md §3 `PanelSnapshot`); legacy top-level
/// duplicated fields are never written, only `data`.
#[derive(Debug, Clone, Serialize, serde::Deserialize)]
pub struct PanelEnvelope {
    pub panel: String,
    pub updated_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    pub data: Value,
}

impl PanelEnvelope {
    pub fn new(panel: impl Into<String>, data: Value) -> Self {
        Self {
            panel: panel.into(),
            updated_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            kind: None,
            data,
        }
    }
}

#[derive(Serialize)]
struct Manifest<'a> {
    last_txn_id: u64,
    committed_at: String,
    panels: &'a [String],
}

/// Buffers panel writes for a single cycle; `commit` atomically replaces
/// every target file or none of them (spec.md §8 "all panels commit or
/// none").
pub struct Txn {
    dir: PathBuf,
    txn_id: u64,
    pending: HashMap<String, PanelEnvelope>,
}

pub struct PanelsWriter {
    dir: PathBuf,
    egress_frozen: bool,
    next_txn_id: std::sync::atomic::AtomicU64,
}

impl PanelsWriter {
    pub fn new(dir: impl Into<PathBuf>, egress_frozen: bool) -> Self {
        Self {
            dir: dir.into(),
            egress_frozen,
            next_txn_id: std::sync::atomic::AtomicU64::new(1),
        }
    }

    pub fn begin_txn(&self) -> Txn {
        let txn_id = self.next_txn_id.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Txn {
            dir: self.dir.clone(),
            txn_id,
            pending: HashMap::new(),
        }
    }

    pub fn egress_frozen(&self) -> bool {
        self.egress_frozen
    }
}

impl Txn {
    pub fn write_panel(&mut self, panel: impl Into<String>, data: Value) {
        let panel = panel.into();
        self.pending.insert(panel.clone(), PanelEnvelope::new(panel, data));
    }

    /// Atomically replaces every `<panel>.json` in this transaction, then
    /// writes `.meta.json` recording the committed panel list.
    pub fn commit(self) -> std::io::Result<Vec<String>> {
        std::fs::create_dir_all(&self.dir)?;

        let mut committed = Vec::with_capacity(self.pending.len());
        let mut staged = Vec::with_capacity(self.pending.len());
        for (panel, envelope) in &self.pending {
            let target = self.dir.join(format!("{panel}.json"));
            let tmp = self.dir.join(format!("{panel}.json.tmp"));
            let serialized = serde_json::to_vec_pretty(envelope)?;
            std::fs::write(&tmp, serialized)?;
            staged.push((tmp, target));
        }
        for (tmp, target) in staged {
            std::fs::rename(&tmp, &target)?;
            committed.push(target.file_stem().unwrap().to_string_lossy().to_string());
        }

        let manifest = Manifest {
            last_txn_id: self.txn_id,
            committed_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            panels: &committed,
        };
        let meta_tmp = self.dir.join(".meta.json.tmp");
        let meta_path = self.dir.join(".meta.json");
        std::fs::write(&meta_tmp, serde_json::to_vec_pretty(&manifest)?)?;
        std::fs::rename(&meta_tmp, &meta_path)?;

        Ok(committed)
    }
}

/// Reads a committed panel envelope back from disk, for tests and for the
/// Stream Gater / SSE publisher's resync path.
pub fn read_panel(dir: &Path, panel: &str) -> std::io::Result<PanelEnvelope> {
    let raw = std::fs::read_to_string(dir.join(format!("{panel}.json")))?;
    serde_json::from_str(&raw).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn commit_writes_every_panel_and_a_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let writer = PanelsWriter::new(dir.path(), false);
        let mut txn = writer.begin_txn();
        txn.write_panel("indices_info", json!({"NIFTY": {"ltp": 20000.0}}));
        txn.write_panel("system", json!({"bridge": {"cycle": 1}}));
        let committed = txn.commit().unwrap();

        assert_eq!(committed.len(), 2);
        assert!(dir.path().join("indices_info.json").exists());
        assert!(dir.path().join(".meta.json").exists());

        let envelope = read_panel(dir.path(), "indices_info").unwrap();
        assert_eq!(envelope.panel, "indices_info");
    }

    #[test]
    fn panel_envelope_round_trips_through_json() {
        let envelope = PanelEnvelope::new("system", json!({"ok": true}));
        let raw = serde_json::to_string(&envelope).unwrap();
        let back: PanelEnvelope = serde_json::from_str(&raw).unwrap();
        assert_eq!(back.panel, envelope.panel);
        assert_eq!(back.data, envelope.data);
    }
}
