//! Live market view.
//!
//! `World` owns mutable per-symbol state and is fed once per cycle.
//! Decision logic only ever sees the immutable `WorldView` built from it.

use std::collections::{BTreeMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::logging::{debug, obj, v_num, v_str, Domain};

/// One observation from the market feed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorldFeed {
    pub prices: BTreeMap<String, f64>,
    /// Time events such as candle closes (`5M_CLOSED`, `4H_CLOSED`).
    #[serde(default)]
    pub events: Vec<String>,
}

impl WorldFeed {
    pub fn single(symbol: &str, price: f64) -> Self {
        let mut prices = BTreeMap::new();
        prices.insert(symbol.to_string(), price);
        Self { prices, events: Vec::new() }
    }

    pub fn with_price(mut self, symbol: &str, price: f64) -> Self {
        self.prices.insert(symbol.to_string(), price);
        self
    }

    pub fn with_event(mut self, event: &str) -> Self {
        self.events.push(event.to_string());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SymbolState {
    pub last_price: Option<f64>,
    pub prev_price: Option<f64>,
    /// Recent percentage moves, oldest first.
    #[serde(default)]
    pub moves: VecDeque<f64>,
    #[serde(default)]
    pub updates: u64,
}

impl SymbolState {
    fn push(&mut self, price: f64, window: usize) {
        if let Some(last) = self.last_price {
            if last > 0.0 {
                self.moves.push_back((price / last - 1.0) * 100.0);
                while self.moves.len() > window {
                    self.moves.pop_front();
                }
            }
        }
        self.prev_price = self.last_price;
        self.last_price = Some(price);
        self.updates += 1;
    }
}

/// Serialized form of the world inside a snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorldState {
    #[serde(default)]
    pub symbols: BTreeMap<String, SymbolState>,
    #[serde(default)]
    pub cycles: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SymbolView {
    pub price: Option<f64>,
    pub prev_price: Option<f64>,
    pub change_pct: Option<f64>,
    pub moves: Vec<f64>,
    /// Net direction count over the whole window (+1 per up move, -1 per down move).
    pub micro_trend: i32,
    /// Same count excluding the latest move.
    pub prev_trend: i32,
}

impl SymbolView {
    fn from_state(state: &SymbolState) -> Self {
        let moves: Vec<f64> = state.moves.iter().copied().collect();
        let sign = |m: &f64| -> i32 {
            if *m > 0.0 {
                1
            } else if *m < 0.0 {
                -1
            } else {
                0
            }
        };
        let micro_trend = moves.iter().map(sign).sum();
        let prev_trend = moves
            .iter()
            .take(moves.len().saturating_sub(1))
            .map(sign)
            .sum();
        Self {
            price: state.last_price,
            prev_price: state.prev_price,
            change_pct: moves.last().copied(),
            moves,
            micro_trend,
            prev_trend,
        }
    }

    /// Sum of absolute moves over the window.
    pub fn energy(&self) -> f64 {
        self.moves.iter().map(|m| m.abs()).sum()
    }
}

/// Immutable per-cycle snapshot handed to strategies.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WorldView {
    pub symbols: BTreeMap<String, SymbolView>,
    pub events: Vec<String>,
    pub cycle: u64,
}

impl WorldView {
    pub fn price(&self, symbol: &str) -> Option<f64> {
        self.symbols.get(symbol).and_then(|s| s.price)
    }

    pub fn prices(&self) -> BTreeMap<String, f64> {
        self.symbols
            .iter()
            .filter_map(|(sym, view)| view.price.map(|p| (sym.clone(), p)))
            .collect()
    }

    pub fn get(&self, symbol: &str) -> Option<&SymbolView> {
        self.symbols.get(symbol)
    }
}

#[derive(Debug, Clone)]
pub struct World {
    symbols: Vec<String>,
    state: BTreeMap<String, SymbolState>,
    window: usize,
    cycles: u64,
    events: Vec<String>,
}

impl World {
    pub fn new(symbols: &[String], window: usize) -> Self {
        let state = symbols
            .iter()
            .map(|s| (s.clone(), SymbolState::default()))
            .collect();
        Self {
            symbols: symbols.to_vec(),
            state,
            window: window.max(2),
            cycles: 0,
            events: Vec::new(),
        }
    }

    pub fn symbols(&self) -> &[String] {
        &self.symbols
    }

    pub fn update(&mut self, feed: &WorldFeed) {
        for (symbol, price) in &feed.prices {
            if !price.is_finite() || *price <= 0.0 {
                debug(
                    Domain::Engine,
                    "feed_price_ignored",
                    obj(&[("symbol", v_str(symbol)), ("price", v_num(*price))]),
                );
                continue;
            }
            match self.state.get_mut(symbol) {
                Some(state) => state.push(*price, self.window),
                None => debug(
                    Domain::Engine,
                    "feed_symbol_untracked",
                    obj(&[("symbol", v_str(symbol))]),
                ),
            }
        }
        self.events = feed.events.clone();
        self.cycles += 1;
    }

    pub fn snapshot(&self) -> WorldView {
        WorldView {
            symbols: self
                .state
                .iter()
                .map(|(sym, st)| (sym.clone(), SymbolView::from_state(st)))
                .collect(),
            events: self.events.clone(),
            cycle: self.cycles,
        }
    }

    pub fn export(&self) -> WorldState {
        WorldState { symbols: self.state.clone(), cycles: self.cycles }
    }

    /// Restores per-symbol memory for tracked symbols; unknown entries are dropped.
    pub fn import(&mut self, saved: WorldState) {
        for (symbol, mut st) in saved.symbols {
            if let Some(slot) = self.state.get_mut(&symbol) {
                while st.moves.len() > self.window {
                    st.moves.pop_front();
                }
                *slot = st;
            }
        }
        self.cycles = saved.cycles;
    }
}
