use std::sync::{Arc, Mutex, MutexGuard};

use super::{EventRecord, Snapshot, Store, TradeRecord};
use crate::error::StoreError;

#[derive(Debug, Default)]
pub struct MemoryInner {
    pub snapshot: Option<Snapshot>,
    pub events: Vec<EventRecord>,
    pub trades: Vec<TradeRecord>,
    pub saves: usize,
    /// When set, every write fails with an io error.
    pub fail_writes: bool,
}

/// In-process store. Clones share the same contents, so a test can keep a
/// handle while the engine owns another.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_snapshot(snapshot: Snapshot) -> Self {
        let store = Self::default();
        store.lock().snapshot = Some(snapshot);
        store
    }

    pub fn lock(&self) -> MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn snapshot(&self) -> Option<Snapshot> {
        self.lock().snapshot.clone()
    }

    pub fn events(&self) -> Vec<EventRecord> {
        self.lock().events.clone()
    }

    pub fn trades(&self) -> Vec<TradeRecord> {
        self.lock().trades.clone()
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.lock().fail_writes = fail;
    }

    fn check_writable(inner: &MemoryInner) -> Result<(), StoreError> {
        if inner.fail_writes {
            return Err(StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "memory store write failure",
            )));
        }
        Ok(())
    }
}

fn tail<T: Clone>(items: &[T], limit: usize) -> Vec<T> {
    items[items.len().saturating_sub(limit)..].to_vec()
}

impl Store for MemoryStore {
    fn load(&self) -> Result<Option<Snapshot>, StoreError> {
        Ok(self.snapshot())
    }

    fn save(&mut self, snapshot: &Snapshot) -> Result<(), StoreError> {
        let mut inner = self.lock();
        Self::check_writable(&inner)?;
        inner.snapshot = Some(snapshot.clone());
        inner.saves += 1;
        Ok(())
    }

    fn record_event(&mut self, event: &EventRecord) -> Result<(), StoreError> {
        let mut inner = self.lock();
        Self::check_writable(&inner)?;
        inner.events.push(event.clone());
        Ok(())
    }

    fn record_trade(&mut self, trade: &TradeRecord) -> Result<(), StoreError> {
        let mut inner = self.lock();
        Self::check_writable(&inner)?;
        inner.trades.push(trade.clone());
        Ok(())
    }

    fn read_events(&self, limit: usize) -> Result<Vec<EventRecord>, StoreError> {
        Ok(tail(&self.lock().events, limit))
    }

    fn read_trades(&self, limit: usize) -> Result<Vec<TradeRecord>, StoreError> {
        Ok(tail(&self.lock().trades, limit))
    }
}
