//! Engine cycle: gating, preflight, reconciliation and the operator gate,
//! driven through a scripted broker.

mod common;

use chrono::Duration;
use serde_json::Value;

use common::{config, harness, harness_with, price, reasons, seed_events, ScriptedBroker, SYM};
use tradegate::action::{Action, TradeResult};
use tradegate::config::Profile;
use tradegate::engine::{Mode, OperatorCommand};
use tradegate::error::EngineError;
use tradegate::feedback::{Diagnosis, Health};
use tradegate::state_machine::OperatingState;
use tradegate::store::memory::MemoryStore;
use tradegate::store::{EventResult, Snapshot};
use tradegate::strategy::{DecisionContext, PositionBook, Regime, Strategy};
use tradegate::world::WorldView;

/// Proposes a BUY on every cycle, whatever the state.
struct GreedyStrategy {
    book: PositionBook,
}

impl Strategy for GreedyStrategy {
    fn name(&self) -> &'static str {
        "greedy"
    }

    fn decide(
        &self,
        _state: OperatingState,
        world: &WorldView,
        _ctx: &DecisionContext,
    ) -> Option<Action> {
        world.price(SYM).map(|p| Action::buy(SYM, p))
    }

    fn adapt(&mut self, _diagnosis: &Diagnosis) {}

    fn regime(&self) -> Regime {
        Regime::Normal
    }

    fn book(&self) -> &PositionBook {
        &self.book
    }

    fn book_mut(&mut self) -> &mut PositionBook {
        &mut self.book
    }

    fn export(&self) -> Value {
        Value::Null
    }

    fn import(&mut self, _state: Value) {}
}

// ---------------------------------------------------------------------------
// Auto mode
// ---------------------------------------------------------------------------

#[test]
fn virtual_round_trip_opens_and_closes_in_two_cycles() {
    let mut h = harness(Mode::Virtual);
    h.engine.boot().unwrap();
    assert_eq!(h.engine.state(), OperatingState::Idle);

    let out = h.engine.step(&price(100.0)).unwrap();
    assert_eq!(out.executed.len(), 1);
    assert_eq!(h.engine.state(), OperatingState::InPosition);
    assert_eq!(h.broker.buys(), 1);
    assert!(h.engine.pending().is_none());

    // +1% crosses the conservative take-profit.
    let out = h.engine.step(&price(101.0)).unwrap();
    assert_eq!(out.executed.len(), 1);
    assert_eq!(out.executed[0].pnl, Some(1.0));
    assert_eq!(h.engine.state(), OperatingState::Idle);
    assert_eq!(h.broker.sells(), 1);
    assert!(h.engine.strategy().book().is_empty());

    let trades = h.store.trades();
    assert_eq!(trades.len(), 1);
    assert_eq!(trades[0].result, TradeResult::Win);
    assert_eq!(trades[0].entry_price, 100.0);

    let executed: Vec<_> = h
        .store
        .events()
        .into_iter()
        .filter(|e| e.result == EventResult::Executed)
        .collect();
    assert_eq!(executed.len(), 2);
    assert_eq!(executed[1].outcome, Some(TradeResult::Win));
}

#[test]
fn every_step_leaves_a_snapshot_matching_the_engine() {
    let mut h = harness(Mode::Virtual);
    h.engine.boot().unwrap();
    for p in [100.0, 100.1, 100.2] {
        h.engine.step(&price(p)).unwrap();
        let snap = h.store.snapshot().unwrap();
        assert_eq!(snap.state, h.engine.state());
        assert_eq!(snap.mode, h.engine.mode());
    }
}

#[test]
fn risk_block_never_reaches_the_broker() {
    let mut cfg = config(Mode::Virtual);
    cfg.risk.armed = false;
    let mut h = harness_with(cfg, ScriptedBroker::new(), MemoryStore::new(), None);
    h.engine.boot().unwrap();

    h.engine.step(&price(100.0)).unwrap();

    assert_eq!(h.engine.state(), OperatingState::Idle);
    assert!(h.engine.pending().is_none());
    assert_eq!(h.broker.buys(), 0);
    let last = h.store.events().pop().unwrap();
    assert_eq!(last.result, EventResult::BlockedByRisk);
    assert_eq!(last.reason.as_deref(), Some("risk:disarmed"));
}

#[test]
fn no_buy_while_in_position() {
    let strategy: Box<dyn Strategy> = Box::new(GreedyStrategy { book: PositionBook::default() });
    let mut h = harness_with(
        config(Mode::Virtual),
        ScriptedBroker::new(),
        MemoryStore::new(),
        Some(strategy),
    );
    h.engine.boot().unwrap();

    h.engine.step(&price(100.0)).unwrap();
    assert_eq!(h.engine.state(), OperatingState::InPosition);

    h.engine.step(&price(100.1)).unwrap();
    assert_eq!(h.engine.state(), OperatingState::InPosition);
    assert_eq!(h.broker.buys(), 1);
    assert_eq!(
        reasons(&h.store).last().map(String::as_str),
        Some("risk:already_in_position")
    );
}

#[test]
fn observe_mode_records_proposals_without_staging() {
    let mut h = harness(Mode::Observe);
    h.engine.boot().unwrap();

    h.engine.step(&price(100.0)).unwrap();

    assert_eq!(h.engine.state(), OperatingState::Idle);
    assert!(h.engine.pending().is_none());
    assert_eq!(h.broker.buys(), 0);
    let last = h.store.events().pop().unwrap();
    assert_eq!(last.result, EventResult::Approved);
    assert_eq!(last.reason.as_deref(), Some("observe_only"));
}

#[test]
fn failed_buy_freezes_in_error_even_in_virtual() {
    let mut h = harness(Mode::Virtual);
    h.engine.boot().unwrap();
    h.broker.script().buy_fails = true;

    h.engine.step(&price(100.0)).unwrap();

    assert_eq!(h.engine.state(), OperatingState::Error);
    assert!(h.engine.pending().is_none());
    let last = h.store.events().pop().unwrap();
    assert_eq!(last.result, EventResult::Failed);
    assert_eq!(last.reason.as_deref(), Some("execution:buy_failed"));

    // ERROR does nothing on its own.
    h.engine.step(&price(100.0)).unwrap();
    assert_eq!(h.engine.state(), OperatingState::Error);
    assert_eq!(h.broker.buys(), 0);

    h.broker.script().buy_fails = false;
    assert!(h.engine.resume().unwrap());
    assert_eq!(h.engine.state(), OperatingState::Idle);
    assert_eq!(h.engine.mode(), Mode::Virtual);
}

#[test]
fn non_finite_fill_is_an_execution_failure() {
    let mut h = harness(Mode::Virtual);
    h.engine.boot().unwrap();
    h.broker.script().fill_price = Some(f64::NAN);

    h.engine.step(&price(100.0)).unwrap();

    assert_eq!(h.engine.state(), OperatingState::Error);
    assert!(h.engine.strategy().book().is_empty());
    assert_eq!(
        reasons(&h.store).last().map(String::as_str),
        Some("execution:buy_failed")
    );
    assert_eq!(h.store.snapshot().unwrap().state, OperatingState::Error);
}

#[test]
fn losing_exit_cools_down_the_next_entry() {
    let mut h = harness(Mode::Virtual);
    h.engine.boot().unwrap();
    h.engine.step(&price(100.0)).unwrap();
    assert_eq!(h.engine.state(), OperatingState::InPosition);

    // -1% crosses the conservative stop.
    let out = h.engine.step(&price(99.0)).unwrap();
    assert_eq!(out.executed[0].pnl, Some(-1.0));
    assert_eq!(h.engine.state(), OperatingState::Idle);
    assert!(h.engine.risk().counters().cooldown_until.is_some());

    h.engine.step(&price(99.0)).unwrap();
    assert_eq!(h.engine.state(), OperatingState::Idle);
    assert_eq!(h.broker.buys(), 1);
    assert_eq!(reasons(&h.store).last().map(String::as_str), Some("risk:cooldown"));

    h.clock.advance(Duration::seconds(599));
    h.engine.step(&price(99.0)).unwrap();
    assert_eq!(h.broker.buys(), 1);

    h.clock.advance(Duration::seconds(1));
    h.engine.step(&price(99.0)).unwrap();
    assert_eq!(h.broker.buys(), 2);
    assert_eq!(h.engine.state(), OperatingState::InPosition);
}

#[test]
fn persistence_failure_is_the_only_error_out_of_step() {
    let mut h = harness(Mode::Virtual);
    h.engine.boot().unwrap();
    h.store.set_fail_writes(true);

    let err = h.engine.step(&price(100.0)).unwrap_err();
    assert!(err.is_fatal());
    assert!(matches!(err, EngineError::Persistence(_)));
    assert_eq!(h.broker.buys(), 0);
}

// ---------------------------------------------------------------------------
// Global mode ritual
// ---------------------------------------------------------------------------

#[test]
fn risk_blocked_history_pauses_then_ok_restores() {
    let mut h = harness(Mode::Virtual);
    h.engine.boot().unwrap();
    seed_events(&h.store, EventResult::BlockedByRisk, 5);

    h.engine.step(&price(100.0)).unwrap();

    assert_eq!(h.engine.diagnosis().health, Health::RiskBlocked);
    assert_eq!(h.engine.mode(), Mode::Paused);
    assert_eq!(h.engine.requested_mode(), Mode::Virtual);
    assert_eq!(h.engine.state(), OperatingState::Idle);
    assert_eq!(h.broker.buys(), 0);

    // Approvals dilute the block ratio below the threshold.
    seed_events(&h.store, EventResult::Approved, 10);
    h.engine.step(&price(100.0)).unwrap();

    assert_eq!(h.engine.diagnosis().health, Health::Ok);
    assert_eq!(h.engine.mode(), Mode::Virtual);
    assert_eq!(h.engine.state(), OperatingState::InPosition);
    assert_eq!(h.broker.buys(), 1);
}

#[test]
fn unstable_history_downgrades_real_to_observe() {
    let mut h = harness(Mode::Real);
    h.engine.boot().unwrap();
    seed_events(&h.store, EventResult::Failed, 3);

    h.engine.step(&price(100.0)).unwrap();

    assert_eq!(h.engine.diagnosis().health, Health::Unstable);
    assert_eq!(h.engine.mode(), Mode::Observe);
    assert_eq!(h.engine.requested_mode(), Mode::Real);
    assert_eq!(h.engine.state(), OperatingState::Idle);
    assert_eq!(h.broker.buys(), 0);
    assert_eq!(reasons(&h.store).last().map(String::as_str), Some("observe_only"));
}

#[test]
fn ok_health_does_not_lift_error() {
    let mut h = harness(Mode::Virtual);
    h.engine.boot().unwrap();
    h.broker.script().ping_ok = false;
    h.engine.step(&price(100.0)).unwrap();
    assert_eq!(h.engine.state(), OperatingState::Error);
    assert_eq!(h.engine.mode(), Mode::Paused);

    h.engine.step(&price(100.0)).unwrap();

    assert_eq!(h.engine.diagnosis().health, Health::Ok);
    assert_eq!(h.engine.state(), OperatingState::Error);
    assert_eq!(h.engine.mode(), Mode::Paused);

    h.broker.script().ping_ok = true;
    assert!(h.engine.resume().unwrap());
    assert_eq!(h.engine.mode(), Mode::Virtual);
}

#[test]
fn downgrade_mid_cycle_stops_a_staged_buy() {
    let mut snap = Snapshot::new(OperatingState::Entering, Mode::Real);
    snap.pending = Some(Action::buy(SYM, 100.0));
    let store = MemoryStore::with_snapshot(snap);
    seed_events(&store, EventResult::Failed, 3);
    let mut h = harness_with(config(Mode::Real), ScriptedBroker::new(), store, None);
    h.engine.boot().unwrap();
    assert_eq!(h.engine.state(), OperatingState::Entering);

    h.engine.step(&price(100.0)).unwrap();

    assert_eq!(h.broker.buys(), 0);
    assert_eq!(h.engine.state(), OperatingState::Error);
    assert_eq!(h.engine.mode(), Mode::Paused);
    let last = h.store.events().pop().unwrap();
    assert_eq!(last.result, EventResult::Error);
    assert_eq!(last.reason.as_deref(), Some("preflight:mode_not_executing"));
}

// ---------------------------------------------------------------------------
// Preflight
// ---------------------------------------------------------------------------

#[test]
fn preflight_rejects_buy_when_broker_already_holds_symbol() {
    let mut h = harness(Mode::Virtual);
    h.engine.boot().unwrap();
    h.broker.hold(SYM, 99.0, 1.0);

    h.engine.step(&price(100.0)).unwrap();

    assert_eq!(h.engine.state(), OperatingState::Error);
    assert_eq!(h.engine.mode(), Mode::Paused);
    assert_eq!(h.broker.buys(), 0);
    let last = h.store.events().pop().unwrap();
    assert_eq!(last.result, EventResult::Error);
    assert_eq!(last.reason.as_deref(), Some("preflight:position_already_open"));
    assert_eq!(last.action.map(|a| a.symbol), Some(SYM.to_string()));
}

#[test]
fn preflight_rejects_sell_when_broker_is_flat() {
    let mut h = harness(Mode::Virtual);
    h.engine.boot().unwrap();
    h.engine.step(&price(100.0)).unwrap();
    assert_eq!(h.engine.state(), OperatingState::InPosition);

    // Closed by hand outside the engine.
    h.broker.flatten();
    h.engine.step(&price(101.0)).unwrap();

    assert_eq!(h.engine.state(), OperatingState::Error);
    assert_eq!(h.engine.mode(), Mode::Paused);
    assert_eq!(h.broker.sells(), 0);
    assert_eq!(
        reasons(&h.store).last().map(String::as_str),
        Some("preflight:no_position_to_sell")
    );
}

#[test]
fn preflight_rejects_when_broker_ping_fails() {
    let mut h = harness(Mode::Virtual);
    h.engine.boot().unwrap();
    h.broker.script().ping_ok = false;

    h.engine.step(&price(100.0)).unwrap();

    assert_eq!(h.engine.state(), OperatingState::Error);
    assert_eq!(h.broker.buys(), 0);
    assert_eq!(
        reasons(&h.store).last().map(String::as_str),
        Some("preflight:broker_unreachable")
    );
}

// ---------------------------------------------------------------------------
// Reconciliation
// ---------------------------------------------------------------------------

#[test]
fn untracked_broker_position_halts_real_mode() {
    let mut h = harness(Mode::Real);
    h.engine.boot().unwrap();
    assert_eq!(h.engine.state(), OperatingState::Idle);

    h.broker.hold(SYM, 100.0, 1.0);
    let out = h.engine.step(&price(100.0)).unwrap();

    assert!(out.halted);
    assert!(out.executed.is_empty());
    assert_eq!(h.engine.state(), OperatingState::Error);
    assert_eq!(h.engine.mode(), Mode::Paused);
    let last = h.store.events().pop().unwrap();
    assert_eq!(last.result, EventResult::Error);
    assert_eq!(last.reason.as_deref(), Some("reconcile:believed_flat_broker_open"));
}

#[test]
fn phantom_position_halts_real_mode() {
    let broker = ScriptedBroker::new();
    broker.hold(SYM, 100.0, 1.0);
    let mut h = harness_with(config(Mode::Real), broker, MemoryStore::new(), None);
    h.engine.boot().unwrap();
    assert_eq!(h.engine.state(), OperatingState::InPosition);

    h.broker.flatten();
    let out = h.engine.step(&price(100.0)).unwrap();

    assert!(out.halted);
    assert_eq!(h.engine.state(), OperatingState::Error);
    assert_eq!(h.engine.mode(), Mode::Paused);
    assert_eq!(
        reasons(&h.store).last().map(String::as_str),
        Some("reconcile:believed_in_position_broker_flat")
    );
}

#[test]
fn unreachable_broker_skips_cycle_without_changing_state() {
    let mut h = harness(Mode::Real);
    h.engine.boot().unwrap();
    h.broker.script().query_fails = true;

    let out = h.engine.step(&price(100.0)).unwrap();

    assert!(out.halted);
    assert_eq!(h.engine.state(), OperatingState::Idle);
    assert_eq!(h.engine.mode(), Mode::Real);
    assert_eq!(h.broker.buys(), 0);
    assert_eq!(
        reasons(&h.store).last().map(String::as_str),
        Some("reconcile:broker_unreachable")
    );
}

#[test]
fn resume_adopts_broker_truth() {
    let mut h = harness(Mode::Real);
    h.engine.boot().unwrap();
    h.broker.hold(SYM, 100.0, 2.0);
    h.engine.step(&price(100.0)).unwrap();
    assert_eq!(h.engine.state(), OperatingState::Error);

    assert!(h.engine.resume().unwrap());

    assert_eq!(h.engine.state(), OperatingState::InPosition);
    assert_eq!(h.engine.mode(), Mode::Real);
    assert_eq!(h.engine.strategy().book().get(SYM).map(|e| e.qty), Some(2.0));
    assert_eq!(reasons(&h.store).last().map(String::as_str), Some("operator_resume"));

    // Belief and truth agree again.
    let out = h.engine.step(&price(100.1)).unwrap();
    assert!(!out.halted);
}

// ---------------------------------------------------------------------------
// Assisted mode
// ---------------------------------------------------------------------------

#[test]
fn assisted_waits_for_confirmation_then_buys() {
    let mut h = harness(Mode::Assisted);
    h.engine.boot().unwrap();

    h.engine.step(&price(100.0)).unwrap();
    assert_eq!(h.engine.state(), OperatingState::AwaitConfirmation);
    assert!(h.engine.pending().is_some());
    assert_eq!(h.broker.buys(), 0);

    // Nothing moves without the operator.
    h.engine.step(&price(100.01)).unwrap();
    assert_eq!(h.engine.state(), OperatingState::AwaitConfirmation);
    assert_eq!(h.broker.buys(), 0);

    assert!(h.engine.confirm().unwrap());
    assert_eq!(h.engine.state(), OperatingState::Entering);

    h.engine.step(&price(100.02)).unwrap();
    assert_eq!(h.engine.state(), OperatingState::InPosition);
    assert_eq!(h.broker.buys(), 1);
    assert!(reasons(&h.store).iter().any(|r| r == "operator_confirm"));
}

#[test]
fn assisted_cancel_discards_the_pending_action() {
    let mut h = harness(Mode::Assisted);
    h.engine.boot().unwrap();
    h.engine.step(&price(100.0)).unwrap();
    assert_eq!(h.engine.state(), OperatingState::AwaitConfirmation);

    assert!(h.engine.cancel(Some("spread too wide")).unwrap());

    assert_eq!(h.engine.state(), OperatingState::Idle);
    assert!(h.engine.pending().is_none());
    let last = h.store.events().pop().unwrap();
    assert_eq!(last.reason.as_deref(), Some("operator_cancel"));
    assert_eq!(last.detail.as_deref(), Some("spread too wide"));
    assert_eq!(h.broker.buys(), 0);
}

#[test]
fn confirm_and_cancel_are_ignored_outside_the_gate() {
    let mut h = harness(Mode::Assisted);
    h.engine.boot().unwrap();
    assert!(!h.engine.confirm().unwrap());
    assert!(!h.engine.cancel(None).unwrap());
    assert!(!h.engine.resume().unwrap());
    assert_eq!(h.engine.state(), OperatingState::Idle);
    assert!(h.store.events().is_empty());
}

#[test]
fn profile_swap_replaces_limits_but_not_the_arm_switch() {
    let mut cfg = config(Mode::Virtual);
    cfg.risk.armed = false;
    let mut h = harness_with(cfg, ScriptedBroker::new(), MemoryStore::new(), None);
    h.engine.boot().unwrap();

    assert!(h.engine.apply(OperatorCommand::Profile(Profile::Aggressive)).unwrap());

    let risk = h.engine.risk().config();
    assert_eq!(risk.max_parallel_positions, 4);
    assert_eq!(risk.cooldown_after_loss_seconds, 60);
    assert!(!risk.armed);
    let last = h.store.events().pop().unwrap();
    assert_eq!(last.reason.as_deref(), Some("operator_profile"));
    assert_eq!(last.detail.as_deref(), Some("aggressive"));

    // Same limits again: nothing to do.
    assert!(!h.engine.select_profile(Profile::Aggressive).unwrap());
    assert_eq!(h.store.events().len(), 1);
}

#[test]
fn cycle_pulls_feeds_from_the_broker() {
    let mut h = harness(Mode::Virtual);
    h.engine.boot().unwrap();
    h.broker.script().feeds.push_back(price(100.0));

    let out = h.engine.cycle().unwrap();
    assert_eq!(out.map(|o| o.executed.len()), Some(1));
    // Feed exhausted: nothing new, no step.
    assert!(h.engine.cycle().unwrap().is_none());
    assert_eq!(h.engine.state(), OperatingState::InPosition);
}

#[test]
fn status_board_follows_the_engine() {
    let mut h = harness(Mode::Virtual);
    let board = h.engine.status_board();
    h.engine.boot().unwrap();
    h.engine.step(&price(100.0)).unwrap();

    let report = board.read();
    assert_eq!(report.state, OperatingState::InPosition);
    assert_eq!(report.mode, Mode::Virtual);
    assert_eq!(report.cycles, 1);
    assert_eq!(report.open_entries.get(SYM), Some(&100.0));
    assert_eq!(report.strategy, "always_enter");
}
