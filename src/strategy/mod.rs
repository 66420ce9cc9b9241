//! Decision port.
//!
//! The engine only ever holds a `Box<dyn Strategy>`. Variants are chosen at
//! startup through `StrategyKind` and share the position book and exit rule
//! defined here.

pub mod always_enter;
pub mod impulse;
pub mod trend;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::action::{Action, Side};
use crate::broker::BrokerPosition;
use crate::config::ExitConfig;
use crate::engine::mode::Mode;
use crate::error::ConfigError;
use crate::feedback::{Diagnosis, Health, SIGNAL_HUMAN_REJECTION, SIGNAL_LOSS_STREAK};
use crate::logging::{error, info, obj, v_str, warn, Domain};
use crate::state_machine::OperatingState;
use crate::store::EventRecord;
use crate::world::WorldView;

pub use always_enter::AlwaysEnterStrategy;
pub use impulse::ImpulseStrategy;
pub use trend::TrendStrategy;

/// Strategy-local aggressiveness, independent of the engine's mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Regime {
    #[default]
    Normal,
    Cautious,
    Defensive,
    Suspended,
}

impl Regime {
    pub fn as_str(&self) -> &'static str {
        match self {
            Regime::Normal => "NORMAL",
            Regime::Cautious => "CAUTIOUS",
            Regime::Defensive => "DEFENSIVE",
            Regime::Suspended => "SUSPENDED",
        }
    }

    /// Regime implied by a diagnosis. `None` when the diagnosis carries no
    /// information, so an empty diagnosis leaves the current regime alone.
    pub fn from_diagnosis(diagnosis: &Diagnosis) -> Option<Regime> {
        match diagnosis.health {
            Health::NoData if diagnosis.signals.is_empty() => None,
            Health::RiskBlocked => Some(Regime::Suspended),
            Health::Unstable => Some(Regime::Defensive),
            _ if diagnosis.has_signal(SIGNAL_LOSS_STREAK) => Some(Regime::Defensive),
            _ if diagnosis.has_signal(SIGNAL_HUMAN_REJECTION) => Some(Regime::Cautious),
            _ => Some(Regime::Normal),
        }
    }

    /// How much stronger an entry signal must be than in NORMAL.
    pub fn strictness(&self) -> f64 {
        match self {
            Regime::Normal => 1.0,
            Regime::Cautious => 2.0,
            Regime::Defensive => 3.0,
            Regime::Suspended => f64::INFINITY,
        }
    }

    pub fn allows_entries(&self) -> bool {
        *self != Regime::Suspended
    }
}

/// Everything besides state and world that a decision may depend on.
#[derive(Debug, Clone, PartialEq)]
pub struct DecisionContext {
    pub mode: Mode,
    pub health: Health,
    pub last_action: Option<Action>,
}

impl DecisionContext {
    pub fn new(mode: Mode) -> Self {
        Self { mode, health: Health::NoData, last_action: None }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub price: f64,
    #[serde(default = "one")]
    pub qty: f64,
}

fn one() -> f64 {
    1.0
}

/// Per-symbol entry prices. Recorded on a BUY fill, cleared once on the
/// matching SELL fill.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PositionBook {
    entries: BTreeMap<String, Entry>,
}

impl PositionBook {
    /// Non-finite entries are refused: they would not survive a snapshot.
    pub fn record(&mut self, symbol: &str, price: f64, qty: f64) -> bool {
        if !price.is_finite() || !qty.is_finite() {
            error(
                Domain::Strategy,
                "entry_rejected",
                obj(&[
                    ("symbol", v_str(symbol)),
                    ("price", v_str(&price.to_string())),
                    ("qty", v_str(&qty.to_string())),
                ]),
            );
            return false;
        }
        self.entries.insert(symbol.to_string(), Entry { price, qty });
        true
    }

    pub fn close(&mut self, symbol: &str) -> Option<Entry> {
        self.entries.remove(symbol)
    }

    pub fn get(&self, symbol: &str) -> Option<&Entry> {
        self.entries.get(symbol)
    }

    pub fn contains(&self, symbol: &str) -> bool {
        self.entries.contains_key(symbol)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn symbols(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Entry)> {
        self.entries.iter()
    }

    pub fn prices(&self) -> BTreeMap<String, f64> {
        self.entries.iter().map(|(s, e)| (s.clone(), e.price)).collect()
    }

    fn apply_fill(&mut self, action: &Action) {
        match action.kind {
            Side::Buy => {
                self.record(&action.symbol, action.price, action.qty);
            }
            Side::Sell => {
                if self.close(&action.symbol).is_none() {
                    warn(
                        Domain::Strategy,
                        "sell_fill_without_entry",
                        obj(&[("symbol", v_str(&action.symbol))]),
                    );
                }
            }
        }
    }
}

pub const EXIT_STOP_LOSS: &str = "STOP_LOSS";
pub const EXIT_TAKE_PROFIT: &str = "TAKE_PROFIT";

/// First tracked symbol whose move from entry crossed a threshold.
pub fn exit_signal(book: &PositionBook, world: &WorldView, exits: &ExitConfig) -> Option<Action> {
    for (symbol, entry) in book.iter() {
        let price = match world.price(symbol) {
            Some(p) => p,
            None => continue,
        };
        if entry.price <= 0.0 {
            continue;
        }
        let change = (price - entry.price) / entry.price * 100.0;
        let reason = if change <= exits.stop_loss_pct {
            EXIT_STOP_LOSS
        } else if change >= exits.take_profit_pct {
            EXIT_TAKE_PROFIT
        } else {
            continue;
        };
        return Some(
            Action::sell(symbol, price)
                .with_qty(entry.qty)
                .with_reason(reason)
                .with_meta("change_pct", Value::from(change))
                .with_meta("entry_price", Value::from(entry.price)),
        );
    }
    None
}

/// Decision capability consumed by the engine.
///
/// `decide` must be free of side effects; anything a strategy wants to
/// remember between cycles goes through `observe`, `on_filled`, `adapt` or
/// `learn`.
pub trait Strategy: Send {
    fn name(&self) -> &'static str;

    /// Per-cycle memory update, called before `decide`.
    fn observe(&mut self, _world: &WorldView) {}

    fn decide(
        &self,
        state: OperatingState,
        world: &WorldView,
        ctx: &DecisionContext,
    ) -> Option<Action>;

    fn adapt(&mut self, diagnosis: &Diagnosis);

    /// Outcome learning, called from POST_TRADE with recent events.
    fn learn(&mut self, _events: &[EventRecord]) {}

    fn regime(&self) -> Regime;

    fn book(&self) -> &PositionBook;

    fn book_mut(&mut self) -> &mut PositionBook;

    fn on_filled(&mut self, action: &Action) {
        self.book_mut().apply_fill(action);
    }

    /// Seeds an entry from a position the broker already holds.
    fn restore_position(&mut self, symbol: &str, position: &BrokerPosition) {
        info(
            Domain::Strategy,
            "position_adopted",
            obj(&[("symbol", v_str(symbol)), ("strategy", v_str(self.name()))]),
        );
        self.book_mut().record(symbol, position.entry_price, position.qty);
    }

    fn open_entries(&self) -> BTreeMap<String, f64> {
        self.book().prices()
    }

    fn export(&self) -> Value;

    fn import(&mut self, state: Value);
}

/// Shape shared by every variant's exported state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct CommonState {
    #[serde(default)]
    pub entries: PositionBook,
    #[serde(default)]
    pub regime: Regime,
}

pub(crate) fn decode<T: Default + for<'de> Deserialize<'de>>(name: &str, state: Value) -> T {
    if state.is_null() {
        return T::default();
    }
    match serde_json::from_value(state) {
        Ok(v) => v,
        Err(e) => {
            warn(
                Domain::Strategy,
                "strategy_state_unreadable",
                obj(&[("strategy", v_str(name)), ("err", v_str(&e.to_string()))]),
            );
            T::default()
        }
    }
}

/// Registry of the decision variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyKind {
    Trend,
    AlwaysEnter,
    Impulse,
}

impl StrategyKind {
    pub fn from_name(name: &str) -> Result<Self, ConfigError> {
        match name.trim().to_lowercase().replace('-', "_").as_str() {
            "trend" | "simple_trend" => Ok(StrategyKind::Trend),
            "always_enter" | "always_buy" => Ok(StrategyKind::AlwaysEnter),
            "impulse" => Ok(StrategyKind::Impulse),
            other => Err(ConfigError::UnknownStrategy(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::Trend => "trend",
            StrategyKind::AlwaysEnter => "always_enter",
            StrategyKind::Impulse => "impulse",
        }
    }

    pub fn build(self, exits: &ExitConfig, symbols: &[String]) -> Box<dyn Strategy> {
        match self {
            StrategyKind::Trend => Box::new(TrendStrategy::new(*exits)),
            StrategyKind::AlwaysEnter => Box::new(AlwaysEnterStrategy::new(*exits)),
            StrategyKind::Impulse => Box::new(ImpulseStrategy::new(*exits, symbols)),
        }
    }
}
