//! Execution boundary contract.
//!
//! Every call may fail with a `BrokerError`; callers must tell "nothing
//! there" (`Ok(None)`) apart from "could not ask" (`Err`). Calls are
//! synchronous and bounded by the implementation's own timeout.

pub mod paper;

use serde::{Deserialize, Serialize};

use crate::action::Action;
use crate::error::BrokerError;
use crate::world::WorldFeed;

pub use paper::{FaultProfile, PaperBroker};

/// A position as reported by the broker.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BrokerPosition {
    pub entry_price: f64,
    pub qty: f64,
}

impl BrokerPosition {
    pub fn is_finite(&self) -> bool {
        self.entry_price.is_finite() && self.qty.is_finite()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub price: f64,
    pub qty: f64,
    #[serde(default)]
    pub fee: f64,
    /// Filled on exits when the broker computes realized pnl itself.
    #[serde(default)]
    pub realized_pnl: Option<f64>,
}

impl ExecutionReport {
    /// Price and quantity must be usable numbers; pnl may be absent.
    pub fn is_finite(&self) -> bool {
        self.price.is_finite()
            && self.qty.is_finite()
            && self.realized_pnl.map_or(true, f64::is_finite)
    }
}

pub trait Broker: Send {
    fn name(&self) -> &'static str;

    /// Next market observation. `Ok(None)` means nothing new this cycle.
    fn tick(&mut self) -> Result<Option<WorldFeed>, BrokerError>;

    fn buy(&mut self, action: &Action) -> Result<ExecutionReport, BrokerError>;

    fn sell(&mut self, action: &Action) -> Result<ExecutionReport, BrokerError>;

    fn get_open_position(&mut self, symbol: &str) -> Result<Option<BrokerPosition>, BrokerError>;

    /// Liveness probe.
    fn ping(&mut self) -> Result<bool, BrokerError> {
        Ok(true)
    }
}
