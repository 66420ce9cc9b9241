//! Per-state handlers.
//!
//! | state              | handler                          | next                          |
//! |--------------------|----------------------------------|-------------------------------|
//! | IDLE               | decide, gate, stage BUY          | ENTERING / AWAIT_CONFIRMATION |
//! | AWAIT_CONFIRMATION | wait for operator                | ENTERING / IDLE               |
//! | ENTERING           | preflight, buy                   | IN_POSITION / ERROR           |
//! | IN_POSITION        | decide, gate, stage SELL         | EXITING                       |
//! | EXITING            | preflight, sell, classify        | POST_TRADE / ERROR            |
//! | POST_TRADE         | learn and adapt                  | IDLE                          |
//! | ERROR              | nothing                          | operator resume               |

use super::{Engine, StepOutcome};
use crate::action::{Action, Side, TradeResult};
use crate::error::EngineError;
use crate::logging::{self, obj, v_num, v_str, Domain};
use crate::state_machine::OperatingState;
use crate::store::{EventResult, TradeRecord};
use crate::world::WorldView;

/// Upper bound on handler hops inside one cycle.
const MAX_HOPS: usize = 4;

impl Engine {
    /// Runs the handler for the current state, then keeps going while the
    /// new state is ENTERING, EXITING or POST_TRADE.
    pub(crate) fn dispatch(
        &mut self,
        view: &WorldView,
        outcome: &mut StepOutcome,
    ) -> Result<(), EngineError> {
        for _ in 0..MAX_HOPS {
            let state = self.sm.current();
            match state {
                OperatingState::Idle => self.handle_idle(view)?,
                OperatingState::Entering => self.handle_entering(outcome)?,
                OperatingState::InPosition => self.handle_in_position(view)?,
                OperatingState::Exiting => self.handle_exiting(outcome)?,
                OperatingState::PostTrade => self.handle_post_trade()?,
                OperatingState::AwaitConfirmation
                | OperatingState::Error
                | OperatingState::Boot
                | OperatingState::Sync => {}
            }
            let next = self.sm.current();
            let chains = matches!(
                next,
                OperatingState::Entering | OperatingState::Exiting | OperatingState::PostTrade
            );
            if next == state || !chains {
                break;
            }
        }
        Ok(())
    }

    fn handle_idle(&mut self, view: &WorldView) -> Result<(), EngineError> {
        let ctx = self.context();
        let Some(action) = self.strategy.decide(OperatingState::Idle, view, &ctx) else {
            return self.record(EventResult::NoAction, None, None, None);
        };
        if !self.gate(OperatingState::Idle, &action)? {
            return Ok(());
        }
        self.stage(action)?;
        let next = if self.mode.requires_confirmation() {
            OperatingState::AwaitConfirmation
        } else {
            OperatingState::Entering
        };
        self.transition(next)
    }

    fn handle_in_position(&mut self, view: &WorldView) -> Result<(), EngineError> {
        let ctx = self.context();
        let Some(action) = self.strategy.decide(OperatingState::InPosition, view, &ctx) else {
            return self.record(EventResult::NoAction, None, None, None);
        };
        if !self.gate(OperatingState::InPosition, &action)? {
            return Ok(());
        }
        self.stage(action)?;
        self.transition(OperatingState::Exiting)
    }

    /// Risk check plus the observe-only rule. `Ok(true)` means the action
    /// may be staged.
    fn gate(&mut self, state: OperatingState, action: &Action) -> Result<bool, EngineError> {
        let now = self.clock.now();
        if let Err(block) = self.risk.check_at(state, Some(action), now) {
            let err = EngineError::RiskRejected(block);
            let tag = format!("risk:{}", block);
            self.record(
                EventResult::BlockedByRisk,
                Some(action),
                Some((tag.as_str(), Some(err.to_string()))),
                None,
            )?;
            return Ok(false);
        }
        if !self.mode.can_execute() {
            self.record(
                EventResult::Approved,
                Some(action),
                Some(("observe_only", Some(format!("mode {}", self.mode)))),
                None,
            )?;
            return Ok(false);
        }
        self.record(EventResult::Approved, Some(action), None, None)?;
        Ok(true)
    }

    fn stage(&mut self, action: Action) -> Result<(), EngineError> {
        logging::info(
            Domain::Engine,
            "action_staged",
            obj(&[
                ("symbol", v_str(&action.symbol)),
                ("side", v_str(action.kind.as_str())),
                ("price", v_num(action.price)),
            ]),
        );
        self.pending = Some(action);
        self.confirmed = false;
        Ok(())
    }

    fn handle_entering(&mut self, outcome: &mut StepOutcome) -> Result<(), EngineError> {
        let action = match self.preflight(Side::Buy) {
            Ok(action) => action,
            Err(reason) => return self.fail_preflight(reason),
        };
        match self.broker.buy(&action) {
            Ok(report) if !report.is_finite() => {
                self.fail_execution(&action, &format!("non-finite fill: {:?}", report))
            }
            Ok(report) => {
                let filled = action.with_fill(report.price, report.qty);
                self.strategy.on_filled(&filled);
                self.risk.on_executed(&filled, self.clock.now());
                self.pending = None;
                self.last_action = Some(filled.clone());
                self.record(EventResult::Executed, Some(&filled), None, None)?;
                outcome.executed.push(filled);
                self.transition(OperatingState::InPosition)
            }
            Err(e) => self.fail_execution(&action, &e.to_string()),
        }
    }

    fn handle_exiting(&mut self, outcome: &mut StepOutcome) -> Result<(), EngineError> {
        let action = match self.preflight(Side::Sell) {
            Ok(action) => action,
            Err(reason) => return self.fail_preflight(reason),
        };
        let entry = self.strategy.book().get(&action.symbol).copied();
        match self.broker.sell(&action) {
            Ok(report) if !report.is_finite() => {
                self.fail_execution(&action, &format!("non-finite fill: {:?}", report))
            }
            Ok(report) => {
                let entry_price = entry.map(|e| e.price).unwrap_or(report.price);
                let pnl = report
                    .realized_pnl
                    .unwrap_or((report.price - entry_price) * report.qty);
                let result = TradeResult::classify(pnl);
                let filled = action.with_fill(report.price, report.qty).with_pnl(pnl);
                let now = self.clock.now();

                self.strategy.on_filled(&filled);
                self.risk.on_executed(&filled, now);
                self.risk.on_trade_result(result, now);
                self.pending = None;
                self.last_action = Some(filled.clone());

                self.store.record_trade(&TradeRecord {
                    ts: now,
                    symbol: filled.symbol.clone(),
                    entry_price,
                    exit_price: filled.price,
                    qty: filled.qty,
                    pnl,
                    result,
                    reason: filled.reason.clone(),
                    mode: self.mode,
                })?;
                self.record(EventResult::Executed, Some(&filled), None, Some(result))?;
                logging::info(
                    Domain::Engine,
                    "trade_closed",
                    obj(&[
                        ("symbol", v_str(&filled.symbol)),
                        ("pnl", v_num(pnl)),
                        ("result", v_str(result.as_str())),
                    ]),
                );
                outcome.executed.push(filled);
                self.transition(OperatingState::PostTrade)
            }
            Err(e) => self.fail_execution(&action, &e.to_string()),
        }
    }

    /// Broker call failed: recorded as FAILED and frozen in ERROR, in every mode.
    fn fail_execution(&mut self, action: &Action, message: &str) -> Result<(), EngineError> {
        let err = EngineError::ExecutionFailed(message.to_string());
        logging::error(
            Domain::Broker,
            "execution_failed",
            obj(&[
                ("symbol", v_str(&action.symbol)),
                ("side", v_str(action.kind.as_str())),
                ("err", v_str(&err.to_string())),
            ]),
        );
        let tag = match action.kind {
            Side::Buy => "execution:buy_failed",
            Side::Sell => "execution:sell_failed",
        };
        self.record(
            EventResult::Failed,
            Some(action),
            Some((tag, Some(message.to_string()))),
            None,
        )?;
        self.pending = None;
        self.confirmed = false;
        self.transition(OperatingState::Error)
    }

    fn handle_post_trade(&mut self) -> Result<(), EngineError> {
        let events = self.store.read_events(self.event_window)?;
        self.strategy.learn(&events);
        self.diagnosis = self.feedback.diagnose(&events);
        self.strategy.adapt(&self.diagnosis);
        let next = if self.strategy.book().is_empty() {
            OperatingState::Idle
        } else {
            OperatingState::InPosition
        };
        self.transition(next)
    }
}
