use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::mode::Mode;
use crate::action::Action;
use crate::feedback::Health;
use crate::risk::RiskCounters;
use crate::state_machine::OperatingState;
use crate::strategy::Regime;

/// Read-only view of the engine published after every cycle.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub state: OperatingState,
    pub mode: Mode,
    pub requested_mode: Mode,
    pub health: Health,
    pub regime: Regime,
    pub strategy: String,
    pub prices: BTreeMap<String, f64>,
    pub open_entries: BTreeMap<String, f64>,
    pub pending: Option<Action>,
    pub last_action: Option<Action>,
    pub risk: RiskCounters,
    pub cycles: u64,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Default for StatusReport {
    fn default() -> Self {
        Self {
            state: OperatingState::Boot,
            mode: Mode::Paused,
            requested_mode: Mode::Paused,
            health: Health::NoData,
            regime: Regime::Normal,
            strategy: String::new(),
            prices: BTreeMap::new(),
            open_entries: BTreeMap::new(),
            pending: None,
            last_action: None,
            risk: RiskCounters::default(),
            cycles: 0,
            updated_at: None,
        }
    }
}

/// Shared handle between the engine (single writer) and status readers.
#[derive(Debug, Clone, Default)]
pub struct StatusBoard {
    inner: Arc<RwLock<StatusReport>>,
}

impl StatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn publish(&self, report: StatusReport) {
        match self.inner.write() {
            Ok(mut slot) => *slot = report,
            Err(poisoned) => *poisoned.into_inner() = report,
        }
    }

    pub fn read(&self) -> StatusReport {
        match self.inner.read() {
            Ok(slot) => slot.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}
