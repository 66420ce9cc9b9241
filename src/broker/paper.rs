//! Simulated broker: seeded random-walk prices, slippage and fees on fills,
//! one position per symbol, and optional injected faults.

use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::{Broker, BrokerPosition, ExecutionReport};
use crate::action::Action;
use crate::error::BrokerError;
use crate::logging::{log_execution, obj, v_str, warn, Domain};
use crate::world::WorldFeed;

#[derive(Debug, Clone)]
pub struct FaultProfile {
    pub unreachable_rate: f64,
    pub timeout_rate: f64,
    pub reject_rate: f64,
}

impl FaultProfile {
    pub fn disabled() -> Self {
        Self { unreachable_rate: 0.0, timeout_rate: 0.0, reject_rate: 0.0 }
    }

    pub fn from_env() -> Self {
        let rate = |key: &str| -> f64 {
            std::env::var(key)
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(0.0)
        };
        Self {
            unreachable_rate: rate("PAPER_UNREACHABLE_RATE"),
            timeout_rate: rate("PAPER_TIMEOUT_RATE"),
            reject_rate: rate("PAPER_REJECT_RATE"),
        }
    }
}

pub struct PaperBroker {
    prices: BTreeMap<String, f64>,
    positions: BTreeMap<String, BrokerPosition>,
    rng: StdRng,
    faults: FaultProfile,
    volatility_pct: f64,
    fee_rate: f64,
    slip_rate: f64,
    ticks: u64,
}

impl PaperBroker {
    pub fn new(symbols: &[String], seed: u64) -> Self {
        let prices = symbols.iter().map(|s| (s.clone(), 100.0)).collect();
        Self {
            prices,
            positions: BTreeMap::new(),
            rng: StdRng::seed_from_u64(seed),
            faults: FaultProfile::disabled(),
            volatility_pct: 0.25,
            fee_rate: 0.0002,
            slip_rate: 0.0001,
            ticks: 0,
        }
    }

    pub fn with_faults(mut self, faults: FaultProfile) -> Self {
        self.faults = faults;
        self
    }

    pub fn with_costs(mut self, fee_rate: f64, slip_rate: f64) -> Self {
        self.fee_rate = fee_rate;
        self.slip_rate = slip_rate;
        self
    }

    /// Opens a position outside the engine, as a manual trade would.
    pub fn with_position(mut self, symbol: &str, entry_price: f64, qty: f64) -> Self {
        self.positions.insert(symbol.to_string(), BrokerPosition { entry_price, qty });
        self
    }

    pub fn positions(&self) -> &BTreeMap<String, BrokerPosition> {
        &self.positions
    }

    fn roll(&mut self, rate: f64) -> bool {
        rate > 0.0 && self.rng.gen::<f64>() < rate
    }

    fn check_link(&mut self, op: &str) -> Result<(), BrokerError> {
        if self.roll(self.faults.unreachable_rate) {
            return Err(BrokerError::Unreachable(format!("paper link down during {}", op)));
        }
        if self.roll(self.faults.timeout_rate) {
            return Err(BrokerError::Timeout(op.to_string()));
        }
        Ok(())
    }

    fn market(&self, symbol: &str) -> Result<f64, BrokerError> {
        self.prices
            .get(symbol)
            .copied()
            .ok_or_else(|| BrokerError::Rejected(format!("unknown symbol {}", symbol)))
    }
}

impl Broker for PaperBroker {
    fn name(&self) -> &'static str {
        "paper"
    }

    fn tick(&mut self) -> Result<Option<WorldFeed>, BrokerError> {
        self.check_link("tick")?;
        self.ticks += 1;
        let vol = self.volatility_pct;
        let symbols: Vec<String> = self.prices.keys().cloned().collect();
        let mut feed = WorldFeed::default();
        for symbol in symbols {
            let step = self.rng.gen_range(-vol..=vol) / 100.0;
            if let Some(price) = self.prices.get_mut(&symbol) {
                *price = (*price * (1.0 + step)).max(0.0001);
                feed.prices.insert(symbol, *price);
            }
        }
        if self.ticks % 5 == 0 {
            feed.events.push("5M_CLOSED".to_string());
        }
        if self.ticks % 240 == 0 {
            feed.events.push("4H_CLOSED".to_string());
        }
        Ok(Some(feed))
    }

    fn buy(&mut self, action: &Action) -> Result<ExecutionReport, BrokerError> {
        self.check_link("buy")?;
        if self.roll(self.faults.reject_rate) {
            return Err(BrokerError::Rejected("paper reject".to_string()));
        }
        if self.positions.contains_key(&action.symbol) {
            return Err(BrokerError::Rejected(format!("already holding {}", action.symbol)));
        }
        let market = self.market(&action.symbol)?;
        let price = market * (1.0 + self.slip_rate);
        let fee = action.qty * price * self.fee_rate;
        self.positions
            .insert(action.symbol.clone(), BrokerPosition { entry_price: price, qty: action.qty });
        log_execution("BUY", &action.symbol, price, "filled");
        Ok(ExecutionReport { price, qty: action.qty, fee, realized_pnl: None })
    }

    fn sell(&mut self, action: &Action) -> Result<ExecutionReport, BrokerError> {
        self.check_link("sell")?;
        if self.roll(self.faults.reject_rate) {
            return Err(BrokerError::Rejected("paper reject".to_string()));
        }
        let Some(position) = self.positions.get(&action.symbol).copied() else {
            warn(
                Domain::Broker,
                "sell_without_position",
                obj(&[("symbol", v_str(&action.symbol))]),
            );
            return Err(BrokerError::Rejected(format!("no position in {}", action.symbol)));
        };
        let market = self.market(&action.symbol)?;
        let price = market * (1.0 - self.slip_rate);
        let fee = position.qty * price * self.fee_rate;
        let pnl = (price - position.entry_price) * position.qty - fee;
        self.positions.remove(&action.symbol);
        log_execution("SELL", &action.symbol, price, "filled");
        Ok(ExecutionReport { price, qty: position.qty, fee, realized_pnl: Some(pnl) })
    }

    fn get_open_position(&mut self, symbol: &str) -> Result<Option<BrokerPosition>, BrokerError> {
        self.check_link("position")?;
        Ok(self.positions.get(symbol).copied())
    }

    fn ping(&mut self) -> Result<bool, BrokerError> {
        Ok(!self.roll(self.faults.unreachable_rate))
    }
}
