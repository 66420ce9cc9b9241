//! Out-of-band operator signals: confirm, cancel, resume and profile swaps.

use super::Engine;
use crate::config::{Profile, RiskConfig};
use crate::error::EngineError;
use crate::logging::{self, obj, v_str, Domain};
use crate::state_machine::OperatingState;
use crate::store::EventResult;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperatorCommand {
    Confirm,
    Cancel(Option<String>),
    Resume,
    /// Swaps the risk limits to another profile's.
    Profile(Profile),
}

impl OperatorCommand {
    /// Parses a stdin line such as `confirm`, `cancel too risky`, `resume` or
    /// `profile moderate`.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        let (head, rest) = match line.split_once(char::is_whitespace) {
            Some((head, rest)) => (head, rest.trim()),
            None => (line, ""),
        };
        match head.to_ascii_lowercase().as_str() {
            "confirm" | "y" | "yes" => Some(Self::Confirm),
            "cancel" | "n" | "no" => {
                Some(Self::Cancel((!rest.is_empty()).then(|| rest.to_string())))
            }
            "resume" => Some(Self::Resume),
            "profile" => Profile::from_name(rest).ok().map(Self::Profile),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Confirm => "confirm",
            Self::Cancel(_) => "cancel",
            Self::Resume => "resume",
            Self::Profile(_) => "profile",
        }
    }
}

impl Engine {
    /// Dispatches a command. `Ok(false)` means it had no effect in the
    /// current state.
    pub fn apply(&mut self, cmd: OperatorCommand) -> Result<bool, EngineError> {
        match cmd {
            OperatorCommand::Confirm => self.confirm(),
            OperatorCommand::Cancel(reason) => self.cancel(reason.as_deref()),
            OperatorCommand::Resume => self.resume(),
            OperatorCommand::Profile(profile) => self.select_profile(profile),
        }
    }

    /// Arms the one-shot confirmation flag and moves to ENTERING. The buy
    /// itself happens on the next cycle, after preflight.
    pub fn confirm(&mut self) -> Result<bool, EngineError> {
        if self.sm.current() != OperatingState::AwaitConfirmation || self.pending.is_none() {
            self.ignored("confirm");
            return Ok(false);
        }
        self.confirmed = true;
        let pending = self.pending.clone();
        self.record(
            EventResult::NoAction,
            pending.as_ref(),
            Some(("operator_confirm", None)),
            None,
        )?;
        self.transition(OperatingState::Entering)?;
        self.publish();
        Ok(true)
    }

    pub fn cancel(&mut self, reason: Option<&str>) -> Result<bool, EngineError> {
        if self.sm.current() != OperatingState::AwaitConfirmation {
            self.ignored("cancel");
            return Ok(false);
        }
        let discarded = self.pending.take();
        self.confirmed = false;
        self.record(
            EventResult::NoAction,
            discarded.as_ref(),
            Some(("operator_cancel", reason.map(str::to_string))),
            None,
        )?;
        self.transition(OperatingState::Idle)?;
        self.publish();
        Ok(true)
    }

    /// Leaves ERROR after re-checking real positions. A failed sync keeps
    /// the engine in ERROR.
    pub fn resume(&mut self) -> Result<bool, EngineError> {
        if self.sm.current() != OperatingState::Error {
            self.ignored("resume");
            return Ok(false);
        }
        self.pending = None;
        self.confirmed = false;

        let held = if self.requested_mode.is_live() {
            match self.sync_positions(true) {
                Ok(held) => held,
                Err(reason) => {
                    self.record(
                        EventResult::Error,
                        None,
                        Some((reason.tag(), Some(reason.detail()))),
                        None,
                    )?;
                    self.persist()?;
                    self.publish();
                    return Ok(false);
                }
            }
        } else {
            self.strategy.book().symbols()
        };

        self.set_mode(self.requested_mode, "operator_resume");
        self.record(EventResult::NoAction, None, Some(("operator_resume", None)), None)?;
        let next = if held.is_empty() {
            OperatingState::Idle
        } else {
            OperatingState::InPosition
        };
        self.transition(next)?;
        self.publish();
        Ok(true)
    }

    /// Replaces the risk limits in any state. The arm switch, counters and
    /// exit thresholds are kept; the swap lasts until restart.
    pub fn select_profile(&mut self, profile: Profile) -> Result<bool, EngineError> {
        let risk = RiskConfig { armed: self.risk.config().armed, ..profile.settings().risk };
        if &risk == self.risk.config() {
            self.ignored("profile");
            return Ok(false);
        }
        self.risk.set_config(risk);
        self.record(
            EventResult::NoAction,
            None,
            Some(("operator_profile", Some(profile.as_str().to_string()))),
            None,
        )?;
        self.publish();
        Ok(true)
    }

    fn ignored(&self, command: &str) {
        logging::warn(
            Domain::Operator,
            "command_ignored",
            obj(&[("command", v_str(command)), ("state", v_str(self.sm.current().name()))]),
        );
    }
}
