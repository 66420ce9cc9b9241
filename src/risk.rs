//! Risk gate between a strategy proposal and the execution boundary.
//!
//! Rules run in a fixed order: arm switch, structural compatibility,
//! cooldown, then the entry-only ceilings (parallel positions, daily trades,
//! daily loss). Daily counters roll over lazily on the first check or
//! booking of a new UTC day. The first day seen only stamps the date.

use std::collections::BTreeSet;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::action::{Action, Side, TradeResult};
use crate::config::RiskConfig;
use crate::logging::{info, log_risk_check, obj, v_num, v_str, Domain};
use crate::state_machine::OperatingState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RiskBlock {
    NoAction,
    Disarmed,
    AlreadyInPosition,
    NothingToSell,
    Cooldown,
    ParallelLimit,
    DailyTrades,
    DailyLoss,
}

impl RiskBlock {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskBlock::NoAction => "no_action",
            RiskBlock::Disarmed => "disarmed",
            RiskBlock::AlreadyInPosition => "already_in_position",
            RiskBlock::NothingToSell => "nothing_to_sell",
            RiskBlock::Cooldown => "cooldown",
            RiskBlock::ParallelLimit => "parallel_limit",
            RiskBlock::DailyTrades => "daily_trades",
            RiskBlock::DailyLoss => "daily_loss",
        }
    }
}

impl std::fmt::Display for RiskBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RiskCounters {
    #[serde(default)]
    pub day: Option<NaiveDate>,
    #[serde(default)]
    pub trades_today: u32,
    #[serde(default)]
    pub daily_pnl: f64,
    #[serde(default)]
    pub cooldown_until: Option<DateTime<Utc>>,
    /// Symbols with executed, not yet closed entries.
    #[serde(default)]
    pub open_symbols: BTreeSet<String>,
}

pub struct RiskManager {
    cfg: RiskConfig,
    counters: RiskCounters,
}

impl RiskManager {
    pub fn new(cfg: RiskConfig) -> Self {
        Self { cfg, counters: RiskCounters::default() }
    }

    pub fn config(&self) -> &RiskConfig {
        &self.cfg
    }

    /// Operator profile swap. Counters are kept.
    pub fn set_config(&mut self, cfg: RiskConfig) {
        self.cfg = cfg;
    }

    pub fn counters(&self) -> &RiskCounters {
        &self.counters
    }

    /// Wall-clock `allow_at`.
    pub fn allow(&mut self, state: OperatingState, action: Option<&Action>) -> bool {
        self.allow_at(state, action, Utc::now())
    }

    pub fn allow_at(
        &mut self,
        state: OperatingState,
        action: Option<&Action>,
        now: DateTime<Utc>,
    ) -> bool {
        self.check_at(state, action, now).is_ok()
    }

    pub fn check_at(
        &mut self,
        state: OperatingState,
        action: Option<&Action>,
        now: DateTime<Utc>,
    ) -> Result<(), RiskBlock> {
        self.roll_day(now);

        let action = action.ok_or(RiskBlock::NoAction)?;
        let result = self.evaluate(state, action, now);
        if let Err(block) = result {
            info(
                Domain::Risk,
                "risk_blocked",
                obj(&[
                    ("symbol", v_str(&action.symbol)),
                    ("side", v_str(action.kind.as_str())),
                    ("state", v_str(state.name())),
                    ("block", v_str(block.as_str())),
                ]),
            );
        }
        result
    }

    fn evaluate(
        &self,
        state: OperatingState,
        action: &Action,
        now: DateTime<Utc>,
    ) -> Result<(), RiskBlock> {
        if !self.cfg.armed {
            return Err(RiskBlock::Disarmed);
        }

        match action.kind {
            Side::Buy => {
                if state == OperatingState::InPosition
                    || self.counters.open_symbols.contains(&action.symbol)
                {
                    return Err(RiskBlock::AlreadyInPosition);
                }
            }
            Side::Sell => {
                if state == OperatingState::Idle {
                    return Err(RiskBlock::NothingToSell);
                }
            }
        }

        if let Some(until) = self.counters.cooldown_until {
            if now < until {
                log_risk_check(
                    "cooldown",
                    &action.symbol,
                    (until - now).num_seconds() as f64,
                    0.0,
                );
                return Err(RiskBlock::Cooldown);
            }
        }

        if action.is_buy() {
            let open = self.counters.open_symbols.len();
            if open >= self.cfg.max_parallel_positions {
                log_risk_check(
                    "parallel_positions",
                    &action.symbol,
                    open as f64,
                    self.cfg.max_parallel_positions as f64,
                );
                return Err(RiskBlock::ParallelLimit);
            }
            if self.counters.trades_today >= self.cfg.max_daily_trades {
                log_risk_check(
                    "daily_trades",
                    &action.symbol,
                    self.counters.trades_today as f64,
                    self.cfg.max_daily_trades as f64,
                );
                return Err(RiskBlock::DailyTrades);
            }
            if self.counters.daily_pnl <= -self.cfg.max_daily_loss {
                log_risk_check(
                    "daily_loss",
                    &action.symbol,
                    self.counters.daily_pnl,
                    -self.cfg.max_daily_loss,
                );
                return Err(RiskBlock::DailyLoss);
            }
        }

        Ok(())
    }

    fn roll_day(&mut self, now: DateTime<Utc>) {
        let today = now.date_naive();
        match self.counters.day {
            Some(day) if day == today => {}
            None => self.counters.day = Some(today),
            Some(_) => {
                info(
                    Domain::Risk,
                    "daily_reset",
                    obj(&[
                        ("day", v_str(&today.to_string())),
                        ("trades_yesterday", v_num(self.counters.trades_today as f64)),
                        ("pnl_yesterday", v_num(self.counters.daily_pnl)),
                    ]),
                );
                self.counters.day = Some(today);
                self.counters.trades_today = 0;
                self.counters.daily_pnl = 0.0;
            }
        }
    }

    /// Books an executed action. Exits carry their realized pnl.
    pub fn on_executed(&mut self, action: &Action, now: DateTime<Utc>) {
        self.roll_day(now);
        self.counters.trades_today += 1;
        if let Some(pnl) = action.pnl {
            if pnl.is_finite() {
                self.counters.daily_pnl += pnl;
            }
        }
        match action.kind {
            Side::Buy => {
                self.counters.open_symbols.insert(action.symbol.clone());
            }
            Side::Sell => {
                self.counters.open_symbols.remove(&action.symbol);
            }
        }
    }

    pub fn on_trade_result(&mut self, result: TradeResult, now: DateTime<Utc>) {
        self.roll_day(now);
        if result == TradeResult::Loss {
            let until = now + Duration::seconds(self.cfg.cooldown_after_loss_seconds);
            self.counters.cooldown_until = Some(until);
            info(
                Domain::Risk,
                "cooldown_armed",
                obj(&[
                    ("until", v_str(&until.to_rfc3339())),
                    ("seconds", v_num(self.cfg.cooldown_after_loss_seconds as f64)),
                ]),
            );
        }
    }

    /// Replaces the open set with what the broker or strategy actually holds.
    pub fn sync_open_positions<I>(&mut self, symbols: I)
    where
        I: IntoIterator<Item = String>,
    {
        self.counters.open_symbols = symbols.into_iter().collect();
    }

    pub fn export(&self) -> RiskCounters {
        self.counters.clone()
    }

    pub fn restore(&mut self, counters: RiskCounters) {
        self.counters = counters;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn cfg() -> RiskConfig {
        RiskConfig {
            armed: true,
            max_daily_trades: 20,
            max_daily_loss: 100.0,
            max_parallel_positions: 1,
            cooldown_after_loss_seconds: 60,
        }
    }

    fn noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).unwrap()
    }

    fn buy() -> Action {
        Action::buy("EURUSD", 1.1)
    }

    #[test]
    fn test_null_action_rejected() {
        let mut rm = RiskManager::new(cfg());
        assert_eq!(rm.check_at(OperatingState::Idle, None, noon()), Err(RiskBlock::NoAction));
    }

    #[test]
    fn test_disarmed_rejects_everything() {
        let mut rm = RiskManager::new(RiskConfig { armed: false, ..cfg() });
        assert!(!rm.allow(OperatingState::Idle, Some(&buy())));
        assert_eq!(
            rm.check_at(OperatingState::InPosition, Some(&Action::sell("EURUSD", 1.1)), noon()),
            Err(RiskBlock::Disarmed)
        );
    }

    #[test]
    fn test_structural_rules() {
        let mut rm = RiskManager::new(RiskConfig { max_parallel_positions: 10, ..cfg() });
        let sell = Action::sell("EURUSD", 1.1);
        assert_eq!(
            rm.check_at(OperatingState::Idle, Some(&sell), noon()),
            Err(RiskBlock::NothingToSell)
        );
        assert_eq!(
            rm.check_at(OperatingState::InPosition, Some(&buy()), noon()),
            Err(RiskBlock::AlreadyInPosition)
        );
        assert!(rm.allow_at(OperatingState::InPosition, Some(&sell), noon()));
    }

    #[test]
    fn test_cooldown_after_loss() {
        let mut rm = RiskManager::new(cfg());
        rm.on_trade_result(TradeResult::Loss, noon());

        let sell = Action::sell("EURUSD", 1.0);
        for secs in [0, 30, 59] {
            let t = noon() + Duration::seconds(secs);
            assert!(!rm.allow_at(OperatingState::Idle, Some(&buy()), t));
            assert!(!rm.allow_at(OperatingState::InPosition, Some(&sell), t));
        }
        assert!(rm.allow_at(OperatingState::Idle, Some(&buy()), noon() + Duration::seconds(60)));
    }

    #[test]
    fn test_win_does_not_arm_cooldown() {
        let mut rm = RiskManager::new(cfg());
        rm.on_trade_result(TradeResult::Win, noon());
        assert!(rm.counters().cooldown_until.is_none());
    }

    #[test]
    fn test_daily_trade_ceiling() {
        let mut rm = RiskManager::new(RiskConfig {
            max_daily_trades: 2,
            max_parallel_positions: 5,
            ..cfg()
        });
        assert!(rm.allow_at(OperatingState::Idle, Some(&buy()), noon()));
        rm.on_executed(&Action::buy("EURUSD", 1.1), noon());
        rm.on_executed(&Action::buy("GBPUSD", 1.3), noon());
        assert_eq!(
            rm.check_at(OperatingState::Idle, Some(&Action::buy("USDJPY", 150.0)), noon()),
            Err(RiskBlock::DailyTrades)
        );
    }

    #[test]
    fn test_trades_booked_before_first_check_count() {
        let mut rm = RiskManager::new(RiskConfig {
            max_daily_trades: 2,
            max_parallel_positions: 5,
            ..cfg()
        });
        rm.on_executed(&Action::buy("A", 1.0), noon());
        rm.on_executed(&Action::buy("B", 1.0), noon());
        assert!(!rm.allow_at(OperatingState::Idle, Some(&Action::buy("C", 1.0)), noon()));
        assert_eq!(rm.counters().trades_today, 2);
        assert_eq!(rm.counters().day, Some(noon().date_naive()));
    }

    #[test]
    fn test_undated_counters_are_stamped_not_reset() {
        let mut rm = RiskManager::new(RiskConfig { max_daily_trades: 2, ..cfg() });
        rm.restore(RiskCounters { trades_today: 2, daily_pnl: -5.0, ..RiskCounters::default() });
        assert_eq!(
            rm.check_at(OperatingState::Idle, Some(&buy()), noon()),
            Err(RiskBlock::DailyTrades)
        );
        assert_eq!(rm.counters().daily_pnl, -5.0);
    }

    #[test]
    fn test_daily_ceilings_do_not_trap_exits() {
        let mut rm = RiskManager::new(RiskConfig { max_daily_trades: 1, ..cfg() });
        rm.on_executed(&buy(), noon());
        let sell = Action::sell("EURUSD", 1.0);
        assert!(rm.allow_at(OperatingState::InPosition, Some(&sell), noon()));
    }

    #[test]
    fn test_daily_loss_ceiling() {
        let mut rm = RiskManager::new(RiskConfig { max_daily_loss: 10.0, ..cfg() });
        rm.allow_at(OperatingState::Idle, Some(&buy()), noon());
        rm.on_executed(&buy(), noon());
        rm.on_executed(&Action::sell("EURUSD", 1.0).with_pnl(-12.0), noon());
        assert_eq!(rm.counters().daily_pnl, -12.0);
        assert_eq!(
            rm.check_at(OperatingState::Idle, Some(&buy()), noon()),
            Err(RiskBlock::DailyLoss)
        );
    }

    #[test]
    fn test_parallel_ceiling() {
        let mut rm = RiskManager::new(cfg());
        rm.on_executed(&Action::buy("GBPUSD", 1.3), noon());
        assert_eq!(
            rm.check_at(OperatingState::Idle, Some(&buy()), noon()),
            Err(RiskBlock::ParallelLimit)
        );
        rm.on_executed(&Action::sell("GBPUSD", 1.31), noon());
        assert!(rm.allow_at(OperatingState::Idle, Some(&buy()), noon()));
    }

    #[test]
    fn test_day_rollover_resets_once() {
        let mut rm = RiskManager::new(RiskConfig {
            max_daily_trades: 2,
            max_parallel_positions: 5,
            ..cfg()
        });
        rm.allow_at(OperatingState::Idle, Some(&buy()), noon());
        rm.on_executed(&Action::buy("A", 1.0), noon());
        rm.on_executed(&Action::buy("B", 1.0), noon());
        assert!(!rm.allow_at(OperatingState::Idle, Some(&buy()), noon()));

        let tomorrow = noon() + Duration::hours(14);
        assert!(rm.allow_at(OperatingState::Idle, Some(&buy()), tomorrow));
        assert_eq!(rm.counters().trades_today, 0);

        rm.on_executed(&Action::buy("C", 1.0), tomorrow);
        rm.allow_at(OperatingState::Idle, Some(&buy()), tomorrow + Duration::hours(1));
        assert_eq!(rm.counters().trades_today, 1);
    }

    #[test]
    fn test_counters_survive_export_restore() {
        let mut rm = RiskManager::new(cfg());
        rm.allow_at(OperatingState::Idle, Some(&buy()), noon());
        rm.on_executed(&buy(), noon());
        rm.on_trade_result(TradeResult::Loss, noon());
        let json = serde_json::to_string(&rm.export()).unwrap();

        let mut restored = RiskManager::new(cfg());
        restored.restore(serde_json::from_str(&json).unwrap());
        assert_eq!(restored.counters(), rm.counters());
        assert!(!restored.allow_at(OperatingState::Idle, Some(&Action::buy("X", 1.0)), noon()));
    }
}
