//! Global operating mode and the rules that move it between cycles.
//!
//! | mode     | real broker | executes | needs confirm |
//! |----------|-------------|----------|---------------|
//! | REAL     | yes         | yes      | no            |
//! | ASSISTED | yes         | yes      | yes           |
//! | VIRTUAL  | no          | yes      | no            |
//! | OBSERVE  | -           | no       | -             |
//! | PAUSED   | -           | no       | -             |

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::ConfigError;
use crate::feedback::Health;
use crate::logging::{obj, v_str, warn, Domain};
use crate::state_machine::OperatingState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Mode {
    Real,
    Assisted,
    Virtual,
    Observe,
    Paused,
}

impl Mode {
    pub fn from_name(name: &str) -> Result<Self, ConfigError> {
        match name.trim().to_uppercase().as_str() {
            "REAL" => Ok(Mode::Real),
            "ASSISTED" => Ok(Mode::Assisted),
            "VIRTUAL" | "PAPER" => Ok(Mode::Virtual),
            "OBSERVE" | "OBSERVER" => Ok(Mode::Observe),
            "PAUSED" => Ok(Mode::Paused),
            other => Err(ConfigError::UnknownMode(other.to_string())),
        }
    }

    /// Import mapping: anything unrecognized becomes PAUSED.
    pub fn from_name_or_paused(name: &str) -> Self {
        Self::from_name(name).unwrap_or_else(|_| {
            warn(
                Domain::Engine,
                "unknown_mode_on_import",
                obj(&[("name", v_str(name)), ("fallback", v_str("PAUSED"))]),
            );
            Mode::Paused
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Real => "REAL",
            Mode::Assisted => "ASSISTED",
            Mode::Virtual => "VIRTUAL",
            Mode::Observe => "OBSERVE",
            Mode::Paused => "PAUSED",
        }
    }

    /// Talks to a real broker; reconciliation runs every cycle.
    pub fn is_live(&self) -> bool {
        matches!(self, Mode::Real | Mode::Assisted)
    }

    pub fn can_execute(&self) -> bool {
        matches!(self, Mode::Real | Mode::Assisted | Mode::Virtual)
    }

    pub fn requires_confirmation(&self) -> bool {
        *self == Mode::Assisted
    }

    pub fn emits_proposals(&self) -> bool {
        !matches!(self, Mode::Observe | Mode::Paused)
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Mode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Mode::from_name_or_paused(&raw))
    }
}

/// Mode for the next cycle given the latest health.
///
/// RISK_BLOCKED pauses, UNSTABLE downgrades REAL to OBSERVE, OK restores the
/// requested mode unless the engine sits in ERROR. NO_DATA changes nothing.
pub fn govern(current: Mode, requested: Mode, health: Health, state: OperatingState) -> Mode {
    match health {
        Health::RiskBlocked => Mode::Paused,
        Health::Unstable if current == Mode::Real => Mode::Observe,
        Health::Ok if state != OperatingState::Error => requested,
        _ => current,
    }
}
