//! Persistence contract and record types.
//!
//! The snapshot is the only recovery source at boot. Events and trades are
//! append-only logs used for diagnosis, learning and replay.

pub mod json;
pub mod memory;
pub mod sqlite;

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::action::{Action, TradeResult};
use crate::config::StoreKind;
use crate::engine::mode::Mode;
use crate::error::StoreError;
use crate::risk::RiskCounters;
use crate::state_machine::OperatingState;
use crate::world::WorldState;

pub use json::JsonStore;
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

pub const SCHEMA_VERSION: u32 = 2;

fn schema_default() -> u32 {
    1
}

fn mode_default() -> Mode {
    Mode::Paused
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default = "schema_default")]
    pub schema_version: u32,
    pub state: OperatingState,
    #[serde(default)]
    pub world: WorldState,
    #[serde(default)]
    pub strategy: Value,
    #[serde(default = "mode_default")]
    pub mode: Mode,
    /// Mode chosen at boot, restored once health is OK again.
    #[serde(default)]
    pub requested_mode: Option<Mode>,
    #[serde(default)]
    pub risk: RiskCounters,
    #[serde(default)]
    pub pending: Option<Action>,
    #[serde(default)]
    pub confirmed: bool,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Snapshot {
    pub fn new(state: OperatingState, mode: Mode) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            state,
            world: WorldState::default(),
            strategy: Value::Null,
            mode,
            requested_mode: None,
            risk: RiskCounters::default(),
            pending: None,
            confirmed: false,
            updated_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventResult {
    NoAction,
    Approved,
    BlockedByRisk,
    Executed,
    Failed,
    Error,
}

impl EventResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventResult::NoAction => "NO_ACTION",
            EventResult::Approved => "APPROVED",
            EventResult::BlockedByRisk => "BLOCKED_BY_RISK",
            EventResult::Executed => "EXECUTED",
            EventResult::Failed => "FAILED",
            EventResult::Error => "ERROR",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub ts: DateTime<Utc>,
    pub state: OperatingState,
    pub mode: Mode,
    #[serde(default)]
    pub world: BTreeMap<String, f64>,
    #[serde(default)]
    pub action: Option<Action>,
    pub result: EventResult,
    /// Machine-readable tag, e.g. `operator_cancel` or `preflight:no_position_to_sell`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<TradeResult>,
}

impl EventRecord {
    pub fn new(ts: DateTime<Utc>, state: OperatingState, mode: Mode, result: EventResult) -> Self {
        Self {
            ts,
            state,
            mode,
            world: BTreeMap::new(),
            action: None,
            result,
            reason: None,
            detail: None,
            outcome: None,
        }
    }

    pub fn with_world(mut self, prices: BTreeMap<String, f64>) -> Self {
        self.world = prices;
        self
    }

    pub fn with_action(mut self, action: Action) -> Self {
        self.action = Some(action);
        self
    }

    pub fn with_reason(mut self, tag: &str, detail: Option<String>) -> Self {
        self.reason = Some(tag.to_string());
        self.detail = detail;
        self
    }

    pub fn with_outcome(mut self, outcome: TradeResult) -> Self {
        self.outcome = Some(outcome);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub ts: DateTime<Utc>,
    pub symbol: String,
    pub entry_price: f64,
    pub exit_price: f64,
    pub qty: f64,
    pub pnl: f64,
    pub result: TradeResult,
    #[serde(default)]
    pub reason: Option<String>,
    pub mode: Mode,
}

pub trait Store: Send {
    fn load(&self) -> Result<Option<Snapshot>, StoreError>;

    /// Must replace the previous snapshot atomically.
    fn save(&mut self, snapshot: &Snapshot) -> Result<(), StoreError>;

    fn record_event(&mut self, event: &EventRecord) -> Result<(), StoreError>;

    fn record_trade(&mut self, trade: &TradeRecord) -> Result<(), StoreError>;

    /// The most recent `limit` events, oldest first.
    fn read_events(&self, limit: usize) -> Result<Vec<EventRecord>, StoreError>;

    fn read_trades(&self, limit: usize) -> Result<Vec<TradeRecord>, StoreError>;
}

pub fn open_store(kind: StoreKind, dir: &Path) -> Result<Box<dyn Store>, StoreError> {
    match kind {
        StoreKind::Json => Ok(Box::new(JsonStore::open(dir)?)),
        StoreKind::Sqlite => Ok(Box::new(SqliteStore::open(&dir.join("tradegate.sqlite"))?)),
    }
}
