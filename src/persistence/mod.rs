//! Snapshots and training-data export
//!
//! End-of-day account/learning snapshots as JSON, and a buffered CSV export
//! of decision outcomes for offline model training.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::PersistenceConfig;

/// Per-arm summary persisted at end of day
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArmRecord {
    pub strategy: String,
    pub pulls: u64,
    pub mean_reward: f64,
}

/// End-of-day snapshot of account and learning state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EodSnapshot {
    pub date: NaiveDate,
    pub daily_pnl: f64,
    pub drawdown: f64,
    pub balance: f64,
    pub total_decisions: u64,
    pub arms: Vec<ArmRecord>,
    pub win_rates: HashMap<String, f64>,
}

/// One outcome row in the training export
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingRow {
    pub ts: i64,
    pub symbol: String,
    pub strategy: String,
    pub volatility: f64,
    pub volume_ratio: f64,
    pub rsi: f64,
    pub trend_strength: f64,
    pub pnl: f64,
    pub was_correct: bool,
}

pub struct PersistenceStore {
    cfg: PersistenceConfig,
    export_buffer: Mutex<Vec<TrainingRow>>,
}

impl PersistenceStore {
    pub fn new(cfg: PersistenceConfig) -> Self {
        Self {
            cfg,
            export_buffer: Mutex::new(Vec::new()),
        }
    }

    fn snapshot_path(&self, date: NaiveDate) -> PathBuf {
        Path::new(&self.cfg.data_dir).join(format!("eod_{}.json", date.format("%Y%m%d")))
    }

    fn export_path(&self) -> PathBuf {
        Path::new(&self.cfg.data_dir).join("training_outcomes.csv")
    }

    pub fn write_eod_snapshot(&self, snapshot: &EodSnapshot) -> Result<PathBuf> {
        fs::create_dir_all(&self.cfg.data_dir).context("creating data dir")?;
        let path = self.snapshot_path(snapshot.date);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(snapshot)?)
            .context("writing eod snapshot")?;
        fs::rename(&tmp, &path).context("activating eod snapshot")?;
        info!(path = %path.display(), pnl = snapshot.daily_pnl, "eod snapshot written");
        Ok(path)
    }

    pub fn load_eod_snapshot(&self, date: NaiveDate) -> Result<Option<EodSnapshot>> {
        let path = self.snapshot_path(date);
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&path).context("reading eod snapshot")?;
        Ok(Some(serde_json::from_str(&raw).context("parsing eod snapshot")?))
    }

    /// Buffer one outcome row; flushes to CSV when the buffer reaches the
    /// configured interval.
    pub fn export_outcome(&self, row: TrainingRow) -> Result<()> {
        let should_flush = {
            let mut buffer = self
                .export_buffer
                .lock()
                .map_err(|e| anyhow::anyhow!("export buffer poisoned: {}", e))?;
            buffer.push(row);
            buffer.len() >= self.cfg.export_flush_interval
        };
        if should_flush {
            self.flush_exports()?;
        }
        Ok(())
    }

    /// Append all buffered rows to the training CSV
    pub fn flush_exports(&self) -> Result<usize> {
        let rows: Vec<TrainingRow> = {
            let mut buffer = self
                .export_buffer
                .lock()
                .map_err(|e| anyhow::anyhow!("export buffer poisoned: {}", e))?;
            std::mem::take(&mut *buffer)
        };
        if rows.is_empty() {
            return Ok(0);
        }
        fs::create_dir_all(&self.cfg.data_dir).context("creating data dir")?;
        let path = self.export_path();
        let new_file = !path.exists();
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .context("opening training export")?;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(new_file)
            .from_writer(file);
        let count = rows.len();
        for row in rows {
            writer.serialize(row).context("serializing training row")?;
        }
        writer.flush().context("flushing training export")?;
        debug!(rows = count, path = %path.display(), "training rows exported");
        Ok(count)
    }

    pub fn data_dir(&self) -> &str {
        &self.cfg.data_dir
    }

    pub fn pending_exports(&self) -> usize {
        self.export_buffer.lock().map(|b| b.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(tag: &str) -> PersistenceStore {
        let dir = std::env::temp_dir().join(format!("tradebrain_persistence_{}", tag));
        let _ = fs::remove_dir_all(&dir);
        PersistenceStore::new(PersistenceConfig {
            data_dir: dir.to_string_lossy().to_string(),
            export_flush_interval: 3,
        })
    }

    fn row(symbol: &str) -> TrainingRow {
        TrainingRow {
            ts: 1_700_000_000,
            symbol: symbol.to_string(),
            strategy: "S6".to_string(),
            volatility: 0.012,
            volume_ratio: 1.2,
            rsi: 55.0,
            trend_strength: 0.6,
            pnl: 125.0,
            was_correct: true,
        }
    }

    #[test]
    fn test_eod_snapshot_roundtrip() {
        let store = store("eod");
        let date = NaiveDate::from_ymd_opt(2024, 3, 4).unwrap();
        let snapshot = EodSnapshot {
            date,
            daily_pnl: -150.0,
            drawdown: 400.0,
            balance: 49_600.0,
            total_decisions: 42,
            arms: vec![ArmRecord {
                strategy: "S6".to_string(),
                pulls: 18,
                mean_reward: 0.61,
            }],
            win_rates: HashMap::from([("S6".to_string(), 0.58)]),
        };
        store.write_eod_snapshot(&snapshot).unwrap();
        let loaded = store.load_eod_snapshot(date).unwrap().unwrap();
        assert_eq!(loaded.balance, 49_600.0);
        assert_eq!(loaded.arms.len(), 1);

        let missing = NaiveDate::from_ymd_opt(2024, 3, 5).unwrap();
        assert!(store.load_eod_snapshot(missing).unwrap().is_none());
    }

    #[test]
    fn test_export_flushes_at_interval() {
        let store = store("export");
        store.export_outcome(row("ES")).unwrap();
        store.export_outcome(row("NQ")).unwrap();
        assert_eq!(store.pending_exports(), 2);
        store.export_outcome(row("MES")).unwrap();
        assert_eq!(store.pending_exports(), 0);

        let raw = fs::read_to_string(Path::new(store.data_dir()).join("training_outcomes.csv"))
            .unwrap();
        let lines: Vec<&str> = raw.lines().collect();
        assert_eq!(lines.len(), 4, "header plus three rows");
        assert!(lines[0].contains("symbol"));
        assert!(lines[1].contains("ES"));
    }

    #[test]
    fn test_append_does_not_duplicate_header() {
        let store = store("append");
        for _ in 0..3 {
            store.export_outcome(row("ES")).unwrap();
        }
        for _ in 0..3 {
            store.export_outcome(row("NQ")).unwrap();
        }
        let raw = fs::read_to_string(Path::new(store.data_dir()).join("training_outcomes.csv"))
            .unwrap();
        let headers = raw.lines().filter(|l| l.contains("volatility")).count();
        assert_eq!(headers, 1);
    }
}
