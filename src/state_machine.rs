//! Current operating state holder.
//!
//! The machine replaces the state unconditionally; which transitions are
//! legal is decided by the engine's handlers, not here.

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::EngineError;
use crate::logging::{log_transition, obj, v_str, warn, Domain};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperatingState {
    Boot,
    Sync,
    Idle,
    Entering,
    AwaitConfirmation,
    InPosition,
    Exiting,
    PostTrade,
    Error,
}

impl OperatingState {
    pub const ALL: [OperatingState; 9] = [
        OperatingState::Boot,
        OperatingState::Sync,
        OperatingState::Idle,
        OperatingState::Entering,
        OperatingState::AwaitConfirmation,
        OperatingState::InPosition,
        OperatingState::Exiting,
        OperatingState::PostTrade,
        OperatingState::Error,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            OperatingState::Boot => "BOOT",
            OperatingState::Sync => "SYNC",
            OperatingState::Idle => "IDLE",
            OperatingState::Entering => "ENTERING",
            OperatingState::AwaitConfirmation => "AWAIT_CONFIRMATION",
            OperatingState::InPosition => "IN_POSITION",
            OperatingState::Exiting => "EXITING",
            OperatingState::PostTrade => "POST_TRADE",
            OperatingState::Error => "ERROR",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|s| s.name() == name)
    }

    /// Import mapping: unknown names fall back to IDLE.
    pub fn from_name_or_idle(name: &str) -> Self {
        match Self::from_name(name) {
            Some(state) => state,
            None => {
                warn(
                    Domain::State,
                    "unknown_state_on_import",
                    obj(&[("name", v_str(name)), ("fallback", v_str("IDLE"))]),
                );
                OperatingState::Idle
            }
        }
    }
}

impl std::fmt::Display for OperatingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl<'de> Deserialize<'de> for OperatingState {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(OperatingState::from_name_or_idle(&raw))
    }
}

#[derive(Debug, Clone)]
pub struct StateMachine {
    state: OperatingState,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    pub fn new() -> Self {
        Self { state: OperatingState::Boot }
    }

    pub fn current(&self) -> OperatingState {
        self.state
    }

    pub fn set(&mut self, new_state: OperatingState) {
        log_transition(self.state.name(), new_state.name());
        self.state = new_state;
    }

    /// Symbolic entry point; rejects names outside the known state set.
    pub fn set_by_name(&mut self, name: &str) -> Result<(), EngineError> {
        let state = OperatingState::from_name(name)
            .ok_or_else(|| EngineError::InvalidState(name.to_string()))?;
        self.set(state);
        Ok(())
    }

    pub fn export(&self) -> &'static str {
        self.state.name()
    }

    pub fn import(&mut self, name: &str) {
        let state = OperatingState::from_name_or_idle(name);
        self.set(state);
    }

    pub fn is_idle(&self) -> bool {
        self.state == OperatingState::Idle
    }

    pub fn in_position(&self) -> bool {
        self.state == OperatingState::InPosition
    }

    pub fn is_error(&self) -> bool {
        self.state == OperatingState::Error
    }
}
