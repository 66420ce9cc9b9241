//! File-backed store.
//!
//! `state.json` holds `{ "sha256": .., "snapshot": .. }` and is replaced via
//! write-to-temp, fsync, rename. Events and trades are JSON lines.

use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use super::{EventRecord, Snapshot, Store, TradeRecord};
use crate::error::StoreError;
use crate::logging::{obj, v_str, warn, Domain};

#[derive(Serialize, Deserialize)]
struct Envelope {
    sha256: String,
    snapshot: Value,
}

fn checksum(body: &str) -> String {
    hex::encode(Sha256::digest(body.as_bytes()))
}

/// Events kept in memory for the per-cycle diagnosis reads.
const RECENT_EVENTS: usize = 1024;

pub struct JsonStore {
    dir: PathBuf,
    /// Newest events, oldest first, capped at `recent_cap`.
    recent: VecDeque<EventRecord>,
    recent_cap: usize,
}

impl JsonStore {
    pub fn open(dir: &Path) -> Result<Self, StoreError> {
        Self::open_with_window(dir, RECENT_EVENTS)
    }

    fn open_with_window(dir: &Path, recent_cap: usize) -> Result<Self, StoreError> {
        fs::create_dir_all(dir)?;
        let events = dir.join("events.jsonl");
        let recent = VecDeque::from(Self::tail::<EventRecord>(&events, recent_cap)?);
        Ok(Self { dir: dir.to_path_buf(), recent, recent_cap })
    }

    pub fn state_path(&self) -> PathBuf {
        self.dir.join("state.json")
    }

    pub fn events_path(&self) -> PathBuf {
        self.dir.join("events.jsonl")
    }

    pub fn trades_path(&self) -> PathBuf {
        self.dir.join("trades.jsonl")
    }

    fn append_line<T: Serialize>(path: &Path, record: &T) -> Result<(), StoreError> {
        let line = serde_json::to_string(record)?;
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        file.flush()?;
        Ok(())
    }

    /// Last `limit` parseable lines; corrupt lines are skipped. Memory stays
    /// bounded by `limit` however long the file is.
    fn tail<T: DeserializeOwned>(path: &Path, limit: usize) -> Result<Vec<T>, StoreError> {
        if !path.exists() || limit == 0 {
            return Ok(Vec::new());
        }
        let reader = BufReader::new(File::open(path)?);
        let mut records = VecDeque::with_capacity(limit.min(RECENT_EVENTS));
        let mut skipped = 0usize;
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<T>(&line) {
                Ok(r) => {
                    if records.len() == limit {
                        records.pop_front();
                    }
                    records.push_back(r);
                }
                Err(_) => skipped += 1,
            }
        }
        if skipped > 0 {
            warn(
                Domain::Store,
                "jsonl_lines_skipped",
                obj(&[
                    ("path", v_str(&path.display().to_string())),
                    ("skipped", serde_json::Value::from(skipped)),
                ]),
            );
        }
        Ok(records.into())
    }
}

impl Store for JsonStore {
    fn load(&self) -> Result<Option<Snapshot>, StoreError> {
        let path = self.state_path();
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&path)?;
        let envelope: Envelope = serde_json::from_str(&raw)
            .map_err(|e| StoreError::Corrupt(format!("unreadable state file: {}", e)))?;
        let body = serde_json::to_string(&envelope.snapshot)?;
        if checksum(&body) != envelope.sha256 {
            return Err(StoreError::Corrupt("snapshot checksum mismatch".to_string()));
        }
        let snapshot = serde_json::from_value(envelope.snapshot)
            .map_err(|e| StoreError::Corrupt(format!("snapshot schema: {}", e)))?;
        Ok(Some(snapshot))
    }

    fn save(&mut self, snapshot: &Snapshot) -> Result<(), StoreError> {
        let value = serde_json::to_value(snapshot)?;
        let body = serde_json::to_string(&value)?;
        let envelope = Envelope { sha256: checksum(&body), snapshot: value };

        let path = self.state_path();
        let tmp = self.dir.join("state.json.tmp");
        {
            let mut file = File::create(&tmp)?;
            file.write_all(serde_json::to_string_pretty(&envelope)?.as_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        if let Ok(dir) = File::open(&self.dir) {
            let _ = dir.sync_all();
        }
        Ok(())
    }

    fn record_event(&mut self, event: &EventRecord) -> Result<(), StoreError> {
        Self::append_line(&self.events_path(), event)?;
        if self.recent_cap > 0 {
            if self.recent.len() == self.recent_cap {
                self.recent.pop_front();
            }
            self.recent.push_back(event.clone());
        }
        Ok(())
    }

    fn record_trade(&mut self, trade: &TradeRecord) -> Result<(), StoreError> {
        Self::append_line(&self.trades_path(), trade)
    }

    fn read_events(&self, limit: usize) -> Result<Vec<EventRecord>, StoreError> {
        if limit > self.recent_cap {
            return Self::tail(&self.events_path(), limit);
        }
        let start = self.recent.len().saturating_sub(limit);
        Ok(self.recent.iter().skip(start).cloned().collect())
    }

    fn read_trades(&self, limit: usize) -> Result<Vec<TradeRecord>, StoreError> {
        Self::tail(&self.trades_path(), limit)
    }
}
