use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;

use super::{EventRecord, Snapshot, Store, TradeRecord};
use crate::error::StoreError;
use crate::logging::{obj, v_str, warn, Domain};

/// SQLite-backed store. The snapshot lives in a single-row table that is
/// replaced inside a transaction.
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut store = Self { conn: Connection::open(path)? };
        store.init()?;
        Ok(store)
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        let mut store = Self { conn: Connection::open_in_memory()? };
        store.init()?;
        Ok(store)
    }

    fn init(&mut self) -> Result<(), StoreError> {
        self.conn.execute_batch(
            "BEGIN;
            CREATE TABLE IF NOT EXISTS snapshot (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                body TEXT NOT NULL,
                updated_at TEXT
            );
            CREATE TABLE IF NOT EXISTS events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                ts TEXT NOT NULL,
                result TEXT NOT NULL,
                body TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS trades (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                ts TEXT NOT NULL,
                symbol TEXT NOT NULL,
                pnl REAL NOT NULL,
                body TEXT NOT NULL
            );
            COMMIT;",
        )?;
        Ok(())
    }

    fn tail<T: DeserializeOwned>(&self, table: &str, limit: usize) -> Result<Vec<T>, StoreError> {
        let sql = format!(
            "SELECT body FROM (SELECT id, body FROM {} ORDER BY id DESC LIMIT ?1) ORDER BY id ASC",
            table
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![limit as i64], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        let mut skipped = 0usize;
        for body in rows {
            match serde_json::from_str(&body?) {
                Ok(record) => out.push(record),
                Err(_) => skipped += 1,
            }
        }
        if skipped > 0 {
            warn(
                Domain::Store,
                "sqlite_rows_skipped",
                obj(&[("table", v_str(table)), ("skipped", serde_json::Value::from(skipped))]),
            );
        }
        Ok(out)
    }
}

impl Store for SqliteStore {
    fn load(&self) -> Result<Option<Snapshot>, StoreError> {
        let body: Option<String> = self
            .conn
            .query_row("SELECT body FROM snapshot WHERE id = 1", [], |row| row.get(0))
            .optional()?;
        match body {
            None => Ok(None),
            Some(body) => serde_json::from_str(&body)
                .map(Some)
                .map_err(|e| StoreError::Corrupt(format!("snapshot row: {}", e))),
        }
    }

    fn save(&mut self, snapshot: &Snapshot) -> Result<(), StoreError> {
        let body = serde_json::to_string(snapshot)?;
        let updated_at = snapshot.updated_at.map(|t| t.to_rfc3339());
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM snapshot", [])?;
        tx.execute(
            "INSERT INTO snapshot (id, body, updated_at) VALUES (1, ?1, ?2)",
            params![body, updated_at],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn record_event(&mut self, event: &EventRecord) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO events (ts, result, body) VALUES (?1, ?2, ?3)",
            params![event.ts.to_rfc3339(), event.result.as_str(), serde_json::to_string(event)?],
        )?;
        Ok(())
    }

    fn record_trade(&mut self, trade: &TradeRecord) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO trades (ts, symbol, pnl, body) VALUES (?1, ?2, ?3, ?4)",
            params![
                trade.ts.to_rfc3339(),
                trade.symbol,
                trade.pnl,
                serde_json::to_string(trade)?
            ],
        )?;
        Ok(())
    }

    fn read_events(&self, limit: usize) -> Result<Vec<EventRecord>, StoreError> {
        self.tail("events", limit)
    }

    fn read_trades(&self, limit: usize) -> Result<Vec<TradeRecord>, StoreError> {
        self.tail("trades", limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::TradeResult;
    use crate::engine::mode::Mode;
    use crate::state_machine::OperatingState;
    use crate::store::EventResult;
    use chrono::Utc;

    #[test]
    fn test_snapshot_replaced_not_appended() {
        let mut store = SqliteStore::in_memory().unwrap();
        assert!(store.load().unwrap().is_none());
        store.save(&Snapshot::new(OperatingState::Idle, Mode::Virtual)).unwrap();
        store.save(&Snapshot::new(OperatingState::InPosition, Mode::Real)).unwrap();

        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded.state, OperatingState::InPosition);
        let rows: i64 = store
            .conn
            .query_row("SELECT COUNT(*) FROM snapshot", [], |r| r.get(0))
            .unwrap();
        assert_eq!(rows, 1);
    }

    #[test]
    fn test_events_in_insertion_order() {
        let mut store = SqliteStore::in_memory().unwrap();
        for result in [EventResult::NoAction, EventResult::Approved, EventResult::Failed] {
            let e = EventRecord::new(Utc::now(), OperatingState::Idle, Mode::Virtual, result);
            store.record_event(&e).unwrap();
        }
        let events = store.read_events(2).unwrap();
        assert_eq!(
            events.iter().map(|e| e.result).collect::<Vec<_>>(),
            vec![EventResult::Approved, EventResult::Failed]
        );
    }

    #[test]
    fn test_corrupt_rows_are_skipped() {
        let mut store = SqliteStore::in_memory().unwrap();
        store
            .record_event(&EventRecord::new(
                Utc::now(),
                OperatingState::Idle,
                Mode::Virtual,
                EventResult::Approved,
            ))
            .unwrap();
        store
            .conn
            .execute(
                "INSERT INTO events (ts, result, body) VALUES ('x', 'x', '{not json')",
                [],
            )
            .unwrap();

        let events = store.read_events(10).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].result, EventResult::Approved);
    }

    #[test]
    fn test_file_backed_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db").join("state.sqlite");
        {
            let mut store = SqliteStore::open(&path).unwrap();
            store.save(&Snapshot::new(OperatingState::PostTrade, Mode::Virtual)).unwrap();
            store
                .record_trade(&TradeRecord {
                    ts: Utc::now(),
                    symbol: "EURUSD".into(),
                    entry_price: 1.0,
                    exit_price: 1.1,
                    qty: 1.0,
                    pnl: 0.1,
                    result: TradeResult::Win,
                    reason: Some("TAKE_PROFIT".into()),
                    mode: Mode::Virtual,
                })
                .unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.load().unwrap().unwrap().state, OperatingState::PostTrade);
        assert_eq!(store.read_trades(10).unwrap().len(), 1);
    }
}
