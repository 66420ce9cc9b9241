//! Internal belief versus broker truth.

use std::collections::BTreeMap;

use super::Engine;
use crate::broker::BrokerPosition;
use crate::error::ReconcileReason;
use crate::logging::{self, obj, v_str, Domain};
use crate::state_machine::OperatingState;

impl Engine {
    /// Positions the broker reports for every tracked symbol.
    fn broker_positions(&mut self) -> Result<BTreeMap<String, BrokerPosition>, ReconcileReason> {
        let mut held = BTreeMap::new();
        for symbol in self.world.symbols().to_vec() {
            match self.broker.get_open_position(&symbol) {
                Ok(Some(position)) if !position.is_finite() => {
                    return Err(ReconcileReason::InvalidPosition(symbol));
                }
                Ok(Some(position)) => {
                    held.insert(symbol, position);
                }
                Ok(None) => {}
                Err(e) => {
                    return Err(ReconcileReason::BrokerUnreachable(format!("{}: {}", symbol, e)))
                }
            }
        }
        Ok(held)
    }

    /// Compares belief with the broker for the resting states.
    /// Transitional states and ERROR are not compared.
    pub(crate) fn reconcile(&mut self) -> Result<(), ReconcileReason> {
        let state = self.sm.current();
        let expect_flat = matches!(
            state,
            OperatingState::Idle | OperatingState::AwaitConfirmation | OperatingState::PostTrade
        );
        let expect_open = state == OperatingState::InPosition;
        if !expect_flat && !expect_open {
            return Ok(());
        }

        let held: Vec<String> = self.broker_positions()?.into_keys().collect();
        if expect_flat && !held.is_empty() {
            return Err(ReconcileReason::UntrackedPosition(held));
        }
        if expect_open {
            if held.is_empty() {
                return Err(ReconcileReason::PhantomPosition);
            }
            let believed = self.strategy.book().symbols();
            if believed != held {
                return Err(ReconcileReason::SymbolMismatch { believed, actual: held });
            }
        }
        Ok(())
    }

    /// Adopts every position the broker holds into the strategy's book and
    /// resets the risk open set from the book. With `drop_stale`, entries the
    /// broker does not hold are removed. Returns the held symbols.
    pub(crate) fn sync_positions(
        &mut self,
        drop_stale: bool,
    ) -> Result<Vec<String>, ReconcileReason> {
        let held = self.broker_positions()?;

        for stale in self.strategy.book().symbols() {
            if drop_stale && !held.contains_key(&stale) {
                logging::warn(
                    Domain::Reconcile,
                    "stale_entry_dropped",
                    obj(&[("symbol", v_str(&stale))]),
                );
                self.strategy.book_mut().close(&stale);
            }
        }
        for (symbol, position) in &held {
            if !self.strategy.book().contains(symbol) {
                self.strategy.restore_position(symbol, position);
            }
        }

        self.risk.sync_open_positions(self.strategy.book().symbols());
        Ok(held.into_keys().collect())
    }
}
