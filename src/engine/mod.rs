//! Orchestrator: one decide → gate → execute cycle per tick.
//!
//! ```text
//! ┌─────────┐  feed  ┌─────────┐ view ┌──────────┐ action ┌────────┐
//! │ Broker  │───────►│  World  │─────►│ Strategy │───────►│  Risk  │
//! │ (tick)  │        └─────────┘      └──────────┘        └────────┘
//! └─────────┘                                                 │ approved
//!      ▲            ┌───────────┐   ┌────────────┐            ▼
//!      └────────────│ preflight │◄──│  handlers  │◄──── pending action
//!     buy / sell    └───────────┘   └────────────┘
//!                                         │ every mutation
//!                                         ▼
//!                                     ┌───────┐
//!                                     │ Store │
//!                                     └───────┘
//! ```
//!
//! The engine is the only component that calls the broker with side
//! effects. Every failure except persistence is handled inside the cycle by
//! moving to ERROR and/or PAUSED and recording an event.

pub mod handlers;
pub mod mode;
pub mod operator;
pub mod preflight;
pub mod reconcile;
pub mod status;

use std::sync::Arc;

use serde_json::Value;

use crate::action::{Action, TradeResult};
use crate::broker::Broker;
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::error::{EngineError, ReconcileReason};
use crate::feedback::{Diagnosis, Feedback};
use crate::logging::{self, log_mode_change, obj, v_bool, v_str, Domain};
use crate::risk::RiskManager;
use crate::state_machine::{OperatingState, StateMachine};
use crate::store::{EventRecord, EventResult, Snapshot, Store, SCHEMA_VERSION};
use crate::strategy::{DecisionContext, Strategy};
use crate::world::{World, WorldFeed, WorldView};

pub use mode::Mode;
pub use operator::OperatorCommand;
pub use status::{StatusBoard, StatusReport};

/// Collaborators injected into the engine.
pub struct EngineParts {
    pub broker: Box<dyn Broker>,
    pub strategy: Box<dyn Strategy>,
    pub store: Box<dyn Store>,
    pub feedback: Box<dyn Feedback>,
    pub clock: Arc<dyn Clock>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BootReport {
    pub restored: bool,
    pub state: OperatingState,
    pub mode: Mode,
    /// Symbols the broker reported open during the boot sync.
    pub adopted: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepOutcome {
    /// Broker calls that succeeded during this cycle.
    pub executed: Vec<Action>,
    /// Reconciliation stopped the cycle before dispatch.
    pub halted: bool,
}

pub struct Engine {
    broker: Box<dyn Broker>,
    strategy: Box<dyn Strategy>,
    store: Box<dyn Store>,
    feedback: Box<dyn Feedback>,
    clock: Arc<dyn Clock>,

    world: World,
    risk: RiskManager,
    sm: StateMachine,
    mode: Mode,
    requested_mode: Mode,
    pending: Option<Action>,
    confirmed: bool,
    last_action: Option<Action>,
    diagnosis: Diagnosis,

    event_window: usize,
    status: StatusBoard,
    cycles: u64,
}

impl Engine {
    pub fn new(cfg: &EngineConfig, parts: EngineParts) -> Self {
        Self {
            broker: parts.broker,
            strategy: parts.strategy,
            store: parts.store,
            feedback: parts.feedback,
            clock: parts.clock,
            world: World::new(&cfg.symbols, cfg.world_window),
            risk: RiskManager::new(cfg.risk.clone()),
            sm: StateMachine::new(),
            mode: cfg.mode,
            requested_mode: cfg.mode,
            pending: None,
            confirmed: false,
            last_action: None,
            diagnosis: Diagnosis::empty(),
            event_window: cfg.event_window,
            status: StatusBoard::new(),
            cycles: 0,
        }
    }

    pub fn state(&self) -> OperatingState {
        self.sm.current()
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn requested_mode(&self) -> Mode {
        self.requested_mode
    }

    pub fn pending(&self) -> Option<&Action> {
        self.pending.as_ref()
    }

    pub fn diagnosis(&self) -> &Diagnosis {
        &self.diagnosis
    }

    pub fn risk(&self) -> &RiskManager {
        &self.risk
    }

    pub fn strategy(&self) -> &dyn Strategy {
        self.strategy.as_ref()
    }

    pub fn world_view(&self) -> WorldView {
        self.world.snapshot()
    }

    pub fn status_board(&self) -> StatusBoard {
        self.status.clone()
    }

    /// Restores the last snapshot, syncs real positions in live modes and
    /// persists the result.
    ///
    /// Boot only adopts what the broker holds. Entries the broker does not
    /// confirm are kept so the first reconciliation reports them.
    pub fn boot(&mut self) -> Result<BootReport, EngineError> {
        let restored = match self.store.load() {
            Ok(Some(snapshot)) => {
                self.restore(snapshot);
                true
            }
            Ok(None) => false,
            Err(e) => {
                logging::error(
                    Domain::Store,
                    "snapshot_unreadable",
                    obj(&[("err", v_str(&e.to_string())), ("fallback", v_str("IDLE"))]),
                );
                false
            }
        };
        if self.sm.current() == OperatingState::Boot {
            self.sm.set(OperatingState::Idle);
        }

        let mut adopted = Vec::new();
        if self.mode.is_live() || self.requested_mode.is_live() {
            let resume_state = self.sm.current();
            self.sm.set(OperatingState::Sync);
            match self.sync_positions(false) {
                Ok(held) => {
                    // ERROR survives restarts; adoption only fills the book.
                    let next = if held.is_empty() || resume_state == OperatingState::Error {
                        resume_state
                    } else {
                        OperatingState::InPosition
                    };
                    adopted = held;
                    self.sm.set(next);
                }
                Err(reason) => {
                    self.record(
                        EventResult::Error,
                        None,
                        Some((reason.tag(), Some(reason.detail()))),
                        None,
                    )?;
                    self.set_mode(Mode::Paused, "boot_sync_failed");
                    self.sm.set(OperatingState::Error);
                }
            }
        }

        self.persist()?;
        self.publish();
        logging::info(
            Domain::Engine,
            "boot_complete",
            obj(&[
                ("restored", v_bool(restored)),
                ("state", v_str(self.sm.current().name())),
                ("mode", v_str(self.mode.as_str())),
                ("adopted", Value::from(adopted.clone())),
            ]),
        );
        Ok(BootReport { restored, state: self.sm.current(), mode: self.mode, adopted })
    }

    fn restore(&mut self, snapshot: Snapshot) {
        if snapshot.schema_version != SCHEMA_VERSION {
            logging::warn(
                Domain::Store,
                "snapshot_schema_upgrade",
                obj(&[
                    ("from", Value::from(snapshot.schema_version)),
                    ("to", Value::from(SCHEMA_VERSION)),
                ]),
            );
        }
        self.sm.set(snapshot.state);
        self.world.import(snapshot.world);
        self.strategy.import(snapshot.strategy);
        self.mode = snapshot.mode;
        self.risk.restore(snapshot.risk);
        self.risk.sync_open_positions(self.strategy.book().symbols());
        self.pending = snapshot.pending;
        self.confirmed = snapshot.confirmed;
    }

    /// Pulls one observation from the broker and runs a step with it.
    /// `Ok(None)` means the broker had nothing new.
    pub fn cycle(&mut self) -> Result<Option<StepOutcome>, EngineError> {
        match self.broker.tick() {
            Ok(Some(feed)) => self.step(&feed).map(Some),
            Ok(None) => Ok(None),
            Err(e) => {
                let err = EngineError::BrokerUnreachable(e.to_string());
                logging::warn(
                    Domain::Broker,
                    "tick_failed",
                    obj(&[
                        ("err", v_str(&err.to_string())),
                        ("reachability", v_bool(e.is_reachability())),
                    ]),
                );
                self.record(
                    EventResult::Failed,
                    None,
                    Some(("broker:tick_failed", Some(e.to_string()))),
                    None,
                )?;
                Ok(None)
            }
        }
    }

    /// One full cycle: ritual, reconciliation, dispatch, persist.
    /// Only persistence failures are returned as errors.
    pub fn step(&mut self, feed: &WorldFeed) -> Result<StepOutcome, EngineError> {
        self.cycles += 1;
        let mut outcome = StepOutcome::default();

        self.world.update(feed);
        let view = self.world.snapshot();
        self.strategy.observe(&view);
        let events = self.store.read_events(self.event_window)?;
        self.diagnosis = self.feedback.diagnose(&events);
        self.strategy.adapt(&self.diagnosis);
        let health = self.diagnosis.health;
        let next = mode::govern(self.mode, self.requested_mode, health, self.sm.current());
        self.set_mode(next, health.as_str());

        if self.mode.is_live() {
            if let Err(reason) = self.reconcile() {
                self.on_reconcile_failure(reason)?;
                outcome.halted = true;
                self.persist()?;
                self.publish();
                return Ok(outcome);
            }
        }

        self.dispatch(&view, &mut outcome)?;

        self.persist()?;
        self.publish();
        Ok(outcome)
    }

    fn on_reconcile_failure(&mut self, reason: ReconcileReason) -> Result<(), EngineError> {
        self.record(
            EventResult::Error,
            None,
            Some((reason.tag(), Some(reason.detail()))),
            None,
        )?;
        if !reason.is_divergence() {
            logging::warn(
                Domain::Reconcile,
                "reconcile_skipped",
                obj(&[("reason", v_str(reason.tag()))]),
            );
            return Ok(());
        }
        let err = EngineError::ReconcileFailed { reason };
        logging::error(
            Domain::Reconcile,
            "critical_divergence",
            obj(&[("err", v_str(&err.to_string()))]),
        );
        self.pending = None;
        self.confirmed = false;
        self.set_mode(Mode::Paused, "reconcile_divergence");
        self.transition(OperatingState::Error)
    }

    pub(crate) fn context(&self) -> DecisionContext {
        DecisionContext {
            mode: self.mode,
            health: self.diagnosis.health,
            last_action: self.last_action.clone(),
        }
    }

    /// Replaces the state and persists immediately.
    pub(crate) fn transition(&mut self, next: OperatingState) -> Result<(), EngineError> {
        self.sm.set(next);
        self.persist()
    }

    pub(crate) fn set_mode(&mut self, next: Mode, cause: &str) {
        if next != self.mode {
            log_mode_change(self.mode.as_str(), next.as_str(), cause);
            self.mode = next;
        }
    }

    pub(crate) fn record(
        &mut self,
        result: EventResult,
        action: Option<&Action>,
        reason: Option<(&str, Option<String>)>,
        outcome: Option<TradeResult>,
    ) -> Result<(), EngineError> {
        let mut event = EventRecord::new(self.clock.now(), self.sm.current(), self.mode, result)
            .with_world(self.world.snapshot().prices());
        if let Some(action) = action {
            event = event.with_action(action.clone());
        }
        if let Some((tag, detail)) = reason {
            event = event.with_reason(tag, detail);
        }
        if let Some(outcome) = outcome {
            event = event.with_outcome(outcome);
        }
        self.store.record_event(&event)?;
        Ok(())
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            schema_version: SCHEMA_VERSION,
            state: self.sm.current(),
            world: self.world.export(),
            strategy: self.strategy.export(),
            mode: self.mode,
            requested_mode: Some(self.requested_mode),
            risk: self.risk.export(),
            pending: self.pending.clone(),
            confirmed: self.confirmed,
            updated_at: Some(self.clock.now()),
        }
    }

    /// Writes the current snapshot. Failure here is the only fatal error.
    pub fn persist(&mut self) -> Result<(), EngineError> {
        let snapshot = self.snapshot();
        self.store.save(&snapshot).map_err(|e| {
            logging::error(
                Domain::Store,
                "snapshot_save_failed",
                obj(&[("err", v_str(&e.to_string()))]),
            );
            EngineError::Persistence(e)
        })
    }

    pub(crate) fn publish(&self) {
        let view = self.world.snapshot();
        self.status.publish(StatusReport {
            state: self.sm.current(),
            mode: self.mode,
            requested_mode: self.requested_mode,
            health: self.diagnosis.health,
            regime: self.strategy.regime(),
            strategy: self.strategy.name().to_string(),
            prices: view.prices(),
            open_entries: self.strategy.open_entries(),
            pending: self.pending.clone(),
            last_action: self.last_action.clone(),
            risk: self.risk.export(),
            cycles: self.cycles,
            updated_at: Some(self.clock.now()),
        });
    }
}
