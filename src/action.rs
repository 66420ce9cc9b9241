use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A trade proposal. Once emitted it is only ever read or cloned into a new
/// value (`with_fill`, `with_pnl`), never changed in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub kind: Side,
    pub symbol: String,
    pub price: f64,
    #[serde(default = "default_qty")]
    pub qty: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Realized profit/loss, present only on executed exits.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pnl: Option<f64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
}

fn default_qty() -> f64 {
    1.0
}

impl Action {
    pub fn buy(symbol: &str, price: f64) -> Self {
        Self::new(Side::Buy, symbol, price)
    }

    pub fn sell(symbol: &str, price: f64) -> Self {
        Self::new(Side::Sell, symbol, price)
    }

    fn new(kind: Side, symbol: &str, price: f64) -> Self {
        Self {
            kind,
            symbol: symbol.to_string(),
            price,
            qty: default_qty(),
            reason: None,
            pnl: None,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_reason(mut self, reason: &str) -> Self {
        self.reason = Some(reason.to_string());
        self
    }

    pub fn with_qty(mut self, qty: f64) -> Self {
        self.qty = qty;
        self
    }

    pub fn with_meta(mut self, key: &str, value: Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }

    /// Copy carrying the broker's executed price and quantity.
    pub fn with_fill(&self, price: f64, qty: f64) -> Self {
        let mut filled = self.clone();
        filled.price = price;
        filled.qty = qty;
        filled
    }

    pub fn with_pnl(&self, pnl: f64) -> Self {
        let mut closed = self.clone();
        closed.pnl = Some(pnl);
        closed
    }

    pub fn is_buy(&self) -> bool {
        self.kind == Side::Buy
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeResult {
    Win,
    Loss,
}

impl TradeResult {
    /// Flat trades count as losses.
    pub fn classify(pnl: f64) -> Self {
        if pnl > 0.0 {
            TradeResult::Win
        } else {
            TradeResult::Loss
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TradeResult::Win => "WIN",
            TradeResult::Loss => "LOSS",
        }
    }
}
