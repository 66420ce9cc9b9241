//! Last-moment re-check before any capital-touching broker call.

use super::Engine;
use crate::action::{Action, Side};
use crate::engine::mode::Mode;
use crate::error::{EngineError, PreflightReason};
use crate::logging::{self, obj, v_str, Domain};
use crate::state_machine::OperatingState;
use crate::store::EventResult;

impl Engine {
    /// Returns the staged action if every check passes. The one-shot
    /// confirmation flag is consumed by the attempt either way.
    pub(crate) fn preflight(&mut self, side: Side) -> Result<Action, PreflightReason> {
        let confirmed = std::mem::take(&mut self.confirmed);

        let action = self.pending.clone().ok_or(PreflightReason::NoPendingAction)?;
        if action.kind != side {
            return Err(PreflightReason::SideMismatch { expected: side, staged: action.kind });
        }

        let expected = match side {
            Side::Buy => OperatingState::Entering,
            Side::Sell => OperatingState::Exiting,
        };
        let state = self.sm.current();
        if state != expected {
            return Err(PreflightReason::WrongState {
                expected: expected.name().to_string(),
                actual: state.name().to_string(),
            });
        }

        if !self.mode.can_execute() {
            return Err(PreflightReason::ModeNotExecuting(self.mode.as_str().to_string()));
        }
        if side == Side::Buy && self.mode.requires_confirmation() && !confirmed {
            return Err(PreflightReason::NotConfirmed);
        }

        let now = self.clock.now();
        self.risk
            .check_at(state, Some(&action), now)
            .map_err(PreflightReason::RiskRejected)?;

        match self.broker.ping() {
            Ok(true) => {}
            Ok(false) => {
                return Err(PreflightReason::BrokerUnreachable("liveness probe failed".into()))
            }
            Err(e) => return Err(PreflightReason::BrokerUnreachable(e.to_string())),
        }

        let position = self
            .broker
            .get_open_position(&action.symbol)
            .map_err(|e| PreflightReason::BrokerUnreachable(e.to_string()))?;
        match (side, position) {
            (Side::Buy, Some(_)) => Err(PreflightReason::PositionAlreadyOpen(action.symbol)),
            (Side::Sell, None) => Err(PreflightReason::NoPositionToSell(action.symbol)),
            _ => Ok(action),
        }
    }

    /// Records the rejection, then freezes: PAUSED and ERROR.
    pub(crate) fn fail_preflight(&mut self, reason: PreflightReason) -> Result<(), EngineError> {
        let action = self.pending.take();
        self.confirmed = false;
        self.record(
            EventResult::Error,
            action.as_ref(),
            Some((reason.tag(), Some(reason.detail()))),
            None,
        )?;
        let err = EngineError::PreflightFailed { reason };
        logging::error(
            Domain::Preflight,
            "preflight_rejected",
            obj(&[("err", v_str(&err.to_string()))]),
        );
        self.set_mode(Mode::Paused, "preflight");
        self.transition(OperatingState::Error)
    }
}
