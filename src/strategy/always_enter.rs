use serde_json::Value;

use super::{decode, exit_signal, CommonState, DecisionContext, PositionBook, Regime, Strategy};
use crate::action::Action;
use crate::config::ExitConfig;
use crate::feedback::Diagnosis;
use crate::state_machine::OperatingState;
use crate::world::WorldView;

/// Buys the first priced symbol whenever flat. Useful to exercise the
/// execution path end to end.
pub struct AlwaysEnterStrategy {
    exits: ExitConfig,
    book: PositionBook,
    regime: Regime,
}

impl AlwaysEnterStrategy {
    pub fn new(exits: ExitConfig) -> Self {
        Self { exits, book: PositionBook::default(), regime: Regime::Normal }
    }
}

impl Strategy for AlwaysEnterStrategy {
    fn name(&self) -> &'static str {
        "always_enter"
    }

    fn decide(
        &self,
        state: OperatingState,
        world: &WorldView,
        _ctx: &DecisionContext,
    ) -> Option<Action> {
        match state {
            OperatingState::Idle if self.regime.allows_entries() => world
                .prices()
                .into_iter()
                .find(|(symbol, _)| !self.book.contains(symbol))
                .map(|(symbol, price)| Action::buy(&symbol, price).with_reason("ALWAYS")),
            OperatingState::InPosition => exit_signal(&self.book, world, &self.exits),
            _ => None,
        }
    }

    fn adapt(&mut self, diagnosis: &Diagnosis) {
        if let Some(regime) = Regime::from_diagnosis(diagnosis) {
            self.regime = regime;
        }
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
        serde_json::to_value(CommonState { entries: self.book.clone(), regime: self.regime })
            .unwrap_or(Value::Null)
    }

    fn import(&mut self, state: Value) {
        let saved: CommonState = decode(self.name(), state);
        self.book = saved.entries;
        self.regime = saved.regime;
    }
}
