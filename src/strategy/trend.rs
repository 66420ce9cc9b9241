use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{decode, exit_signal, DecisionContext, PositionBook, Regime, Strategy};
use crate::action::Action;
use crate::config::ExitConfig;
use crate::feedback::{Diagnosis, Health};
use crate::logging::{info, obj, v_str, Domain};
use crate::state_machine::OperatingState;
use crate::world::WorldView;

/// Enters on a fresh upward move, exits on stop loss or take profit.
pub struct TrendStrategy {
    exits: ExitConfig,
    book: PositionBook,
    regime: Regime,
    /// Set while the feed of outcomes shows repeated failures.
    entries_frozen: bool,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct TrendState {
    #[serde(default)]
    entries: PositionBook,
    #[serde(default)]
    regime: Regime,
    #[serde(default)]
    entries_frozen: bool,
}

impl TrendStrategy {
    pub fn new(exits: ExitConfig) -> Self {
        Self { exits, book: PositionBook::default(), regime: Regime::Normal, entries_frozen: false }
    }

    fn entry_threshold(&self) -> f64 {
        self.exits.min_move_pct * self.regime.strictness()
    }
}

impl Strategy for TrendStrategy {
    fn name(&self) -> &'static str {
        "trend"
    }

    fn decide(
        &self,
        state: OperatingState,
        world: &WorldView,
        ctx: &DecisionContext,
    ) -> Option<Action> {
        if !ctx.mode.emits_proposals() {
            return None;
        }
        match state {
            OperatingState::Idle => {
                if !self.regime.allows_entries() || self.entries_frozen {
                    return None;
                }
                let threshold = self.entry_threshold();
                world.symbols.iter().find_map(|(symbol, view)| {
                    if self.book.contains(symbol) {
                        return None;
                    }
                    let price = view.price?;
                    let change = view.change_pct?;
                    if change > 0.0 && change >= threshold {
                        Some(
                            Action::buy(symbol, price)
                                .with_reason("TREND")
                                .with_meta("move_pct", Value::from(change))
                                .with_meta("regime", Value::from(self.regime.as_str())),
                        )
                    } else {
                        None
                    }
                })
            }
            OperatingState::InPosition => exit_signal(&self.book, world, &self.exits),
            _ => None,
        }
    }

    fn adapt(&mut self, diagnosis: &Diagnosis) {
        let Some(next) = Regime::from_diagnosis(diagnosis) else {
            return;
        };
        let frozen = diagnosis.health == Health::Unstable;
        if next != self.regime || frozen != self.entries_frozen {
            info(
                Domain::Strategy,
                "regime_change",
                obj(&[
                    ("strategy", v_str(self.name())),
                    ("from", v_str(self.regime.as_str())),
                    ("to", v_str(next.as_str())),
                    ("health", v_str(diagnosis.health.as_str())),
                ]),
            );
        }
        self.regime = next;
        self.entries_frozen = frozen;
    }

    fn regime(&self) -> Regime {
        self.regime
    }

    fn book(&self) -> &PositionBook {
        &self.book
    }

    fn book_mut(&mut self) -> &mut PositionBook {
        &mut self.book
    }

    fn export(&self) -> Value {
        serde_json::to_value(TrendState {
            entries: self.book.clone(),
            regime: self.regime,
            entries_frozen: self.entries_frozen,
        })
        .unwrap_or(Value::Null)
    }

    fn import(&mut self, state: Value) {
        let saved: TrendState = decode(self.name(), state);
        self.book = saved.entries;
        self.regime = saved.regime;
        self.entries_frozen = saved.entries_frozen;
    }
}
