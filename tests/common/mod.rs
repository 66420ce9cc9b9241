//! Shared fixtures: a broker whose answers the test controls, plus a
//! builder that wires it into an engine with a memory store and manual clock.

#![allow(dead_code)]

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{TimeZone, Utc};

use tradegate::action::Action;
use tradegate::broker::{Broker, BrokerPosition, ExecutionReport};
use tradegate::clock::ManualClock;
use tradegate::config::{EngineConfig, Profile};
use tradegate::engine::{Engine, EngineParts, Mode};
use tradegate::error::BrokerError;
use tradegate::feedback::EventDiagnostician;
use tradegate::state_machine::OperatingState;
use tradegate::store::memory::MemoryStore;
use tradegate::store::{EventRecord, EventResult, Store};
use tradegate::strategy::always_enter::AlwaysEnterStrategy;
use tradegate::strategy::Strategy;
use tradegate::world::WorldFeed;

pub const SYM: &str = "EURUSD";

#[derive(Debug)]
pub struct BrokerScript {
    pub positions: BTreeMap<String, BrokerPosition>,
    pub feeds: VecDeque<WorldFeed>,
    pub ping_ok: bool,
    pub query_fails: bool,
    pub buy_fails: bool,
    pub sell_fails: bool,
    /// Overrides the price reported for buy fills.
    pub fill_price: Option<f64>,
    pub buys: Vec<Action>,
    pub sells: Vec<Action>,
    pub queries: usize,
}

impl Default for BrokerScript {
    fn default() -> Self {
        Self {
            positions: BTreeMap::new(),
            feeds: VecDeque::new(),
            ping_ok: true,
            query_fails: false,
            buy_fails: false,
            sell_fails: false,
            fill_price: None,
            buys: Vec::new(),
            sells: Vec::new(),
            queries: 0,
        }
    }
}

/// Fills at the action price. Clones share state so the test keeps a handle.
#[derive(Debug, Clone, Default)]
pub struct ScriptedBroker {
    inner: Arc<Mutex<BrokerScript>>,
}

impl ScriptedBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self) -> MutexGuard<'_, BrokerScript> {
        self.inner.lock().unwrap()
    }

    pub fn hold(&self, symbol: &str, entry_price: f64, qty: f64) {
        self.script()
            .positions
            .insert(symbol.to_string(), BrokerPosition { entry_price, qty });
    }

    pub fn flatten(&self) {
        self.script().positions.clear();
    }

    pub fn buys(&self) -> usize {
        self.script().buys.len()
    }

    pub fn sells(&self) -> usize {
        self.script().sells.len()
    }
}

impl Broker for ScriptedBroker {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn tick(&mut self) -> Result<Option<WorldFeed>, BrokerError> {
        Ok(self.script().feeds.pop_front())
    }

    fn buy(&mut self, action: &Action) -> Result<ExecutionReport, BrokerError> {
        let mut s = self.script();
        if s.buy_fails {
            return Err(BrokerError::Rejected("scripted buy failure".into()));
        }
        let price = s.fill_price.unwrap_or(action.price);
        s.positions.insert(
            action.symbol.clone(),
            BrokerPosition { entry_price: price, qty: action.qty },
        );
        s.buys.push(action.clone());
        Ok(ExecutionReport { price, qty: action.qty, fee: 0.0, realized_pnl: None })
    }

    fn sell(&mut self, action: &Action) -> Result<ExecutionReport, BrokerError> {
        let mut s = self.script();
        if s.sell_fails {
            return Err(BrokerError::Timeout("scripted sell timeout".into()));
        }
        let qty = s.positions.remove(&action.symbol).map(|p| p.qty).unwrap_or(action.qty);
        s.sells.push(action.clone());
        Ok(ExecutionReport { price: action.price, qty, fee: 0.0, realized_pnl: None })
    }

    fn get_open_position(&mut self, symbol: &str) -> Result<Option<BrokerPosition>, BrokerError> {
        let mut s = self.script();
        s.queries += 1;
        if s.query_fails {
            return Err(BrokerError::Unreachable("scripted link down".into()));
        }
        Ok(s.positions.get(symbol).copied())
    }

    fn ping(&mut self) -> Result<bool, BrokerError> {
        Ok(self.script().ping_ok)
    }
}

pub struct Harness {
    pub engine: Engine,
    pub broker: ScriptedBroker,
    pub store: MemoryStore,
    pub clock: ManualClock,
}

pub fn config(mode: Mode) -> EngineConfig {
    let mut cfg = EngineConfig::for_profile(Profile::Conservative, vec![SYM.to_string()]);
    cfg.mode = mode;
    cfg
}

pub fn harness(mode: Mode) -> Harness {
    harness_with(config(mode), ScriptedBroker::new(), MemoryStore::new(), None)
}

pub fn harness_with(
    cfg: EngineConfig,
    broker: ScriptedBroker,
    store: MemoryStore,
    strategy: Option<Box<dyn Strategy>>,
) -> Harness {
    let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap());
    let strategy =
        strategy.unwrap_or_else(|| Box::new(AlwaysEnterStrategy::new(cfg.exits)));
    let parts = EngineParts {
        broker: Box::new(broker.clone()),
        strategy,
        store: Box::new(store.clone()),
        feedback: Box::new(EventDiagnostician),
        clock: Arc::new(clock.clone()),
    };
    Harness { engine: Engine::new(&cfg, parts), broker, store, clock }
}

pub fn price(p: f64) -> WorldFeed {
    WorldFeed::single(SYM, p)
}

/// Appends `n` copies of an event with the given result, as if earlier
/// cycles had produced them.
pub fn seed_events(store: &MemoryStore, result: EventResult, n: usize) {
    let mut store = store.clone();
    for _ in 0..n {
        let e = EventRecord::new(
            Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 0).unwrap(),
            OperatingState::Idle,
            Mode::Virtual,
            result,
        );
        store.record_event(&e).unwrap();
    }
}

/// Reasons recorded in the event log, in order.
pub fn reasons(store: &MemoryStore) -> Vec<String> {
    store.events().into_iter().filter_map(|e| e.reason).collect()
}
