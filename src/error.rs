//! Error taxonomy for the engine and its collaborators.

use thiserror::Error;

use crate::action::Side;
use crate::risk::RiskBlock;

/// Why a capital-touching call was refused at the last moment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreflightReason {
    NoPendingAction,
    SideMismatch { expected: Side, staged: Side },
    WrongState { expected: String, actual: String },
    NotConfirmed,
    ModeNotExecuting(String),
    RiskRejected(RiskBlock),
    BrokerUnreachable(String),
    PositionAlreadyOpen(String),
    NoPositionToSell(String),
}

impl PreflightReason {
    /// Machine-readable tag recorded in the event log.
    pub fn tag(&self) -> &'static str {
        match self {
            PreflightReason::NoPendingAction => "preflight:no_pending_action",
            PreflightReason::SideMismatch { .. } => "preflight:side_mismatch",
            PreflightReason::WrongState { .. } => "preflight:wrong_state",
            PreflightReason::NotConfirmed => "preflight:not_confirmed",
            PreflightReason::ModeNotExecuting(_) => "preflight:mode_not_executing",
            PreflightReason::RiskRejected(_) => "preflight:risk_rejected",
            PreflightReason::BrokerUnreachable(_) => "preflight:broker_unreachable",
            PreflightReason::PositionAlreadyOpen(_) => "preflight:position_already_open",
            PreflightReason::NoPositionToSell(_) => "preflight:no_position_to_sell",
        }
    }

    pub fn detail(&self) -> String {
        match self {
            PreflightReason::NoPendingAction => "no staged action".to_string(),
            PreflightReason::SideMismatch { expected, staged } => {
                format!("expected {} but {} is staged", expected, staged)
            }
            PreflightReason::WrongState { expected, actual } => {
                format!("expected {} but state is {}", expected, actual)
            }
            PreflightReason::NotConfirmed => "operator confirmation missing".to_string(),
            PreflightReason::ModeNotExecuting(mode) => format!("mode {} does not execute", mode),
            PreflightReason::RiskRejected(block) => block.to_string(),
            PreflightReason::BrokerUnreachable(msg) => msg.clone(),
            PreflightReason::PositionAlreadyOpen(symbol) => {
                format!("broker already holds {}", symbol)
            }
            PreflightReason::NoPositionToSell(symbol) => format!("broker holds no {}", symbol),
        }
    }
}

impl std::fmt::Display for PreflightReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.tag(), self.detail())
    }
}

/// Internal belief and broker truth disagree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileReason {
    /// Engine is IN_POSITION but the broker reports nothing open.
    PhantomPosition,
    /// Engine believes it is flat but the broker holds positions.
    UntrackedPosition(Vec<String>),
    /// Both sides hold exposure but on different symbols.
    SymbolMismatch { believed: Vec<String>, actual: Vec<String> },
    /// The broker reported a position without a usable price or size.
    InvalidPosition(String),
    BrokerUnreachable(String),
}

impl ReconcileReason {
    pub fn tag(&self) -> &'static str {
        match self {
            ReconcileReason::PhantomPosition => "reconcile:believed_in_position_broker_flat",
            ReconcileReason::UntrackedPosition(_) => "reconcile:believed_flat_broker_open",
            ReconcileReason::SymbolMismatch { .. } => "reconcile:symbol_mismatch",
            ReconcileReason::InvalidPosition(_) => "reconcile:invalid_broker_position",
            ReconcileReason::BrokerUnreachable(_) => "reconcile:broker_unreachable",
        }
    }

    pub fn detail(&self) -> String {
        match self {
            ReconcileReason::PhantomPosition => "no open position at broker".to_string(),
            ReconcileReason::UntrackedPosition(symbols) => {
                format!("broker holds {}", symbols.join(","))
            }
            ReconcileReason::SymbolMismatch { believed, actual } => format!(
                "believed [{}] broker [{}]",
                believed.join(","),
                actual.join(",")
            ),
            ReconcileReason::InvalidPosition(symbol) => {
                format!("non-finite position for {}", symbol)
            }
            ReconcileReason::BrokerUnreachable(msg) => msg.clone(),
        }
    }

    pub fn is_divergence(&self) -> bool {
        !matches!(self, ReconcileReason::BrokerUnreachable(_))
    }
}

impl std::fmt::Display for ReconcileReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.tag(), self.detail())
    }
}

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker unreachable: {0}")]
    Unreachable(String),
    #[error("broker call timed out: {0}")]
    Timeout(String),
    #[error("order rejected: {0}")]
    Rejected(String),
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl BrokerError {
    /// Timeouts count as reachability failures; they are never retried inline.
    pub fn is_reachability(&self) -> bool {
        matches!(self, BrokerError::Unreachable(_) | BrokerError::Timeout(_))
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store io: {0}")]
    Io(#[from] std::io::Error),
    #[error("store json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("store sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("store corrupt: {0}")]
    Corrupt(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown profile: {0} (available: conservative, moderate, aggressive)")]
    UnknownProfile(String),
    #[error("unknown strategy: {0} (available: trend, always_enter, impulse)")]
    UnknownStrategy(String),
    #[error("unknown mode: {0}")]
    UnknownMode(String),
    #[error("unknown store: {0} (available: json, sqlite)")]
    UnknownStore(String),
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("blocked by risk: {0}")]
    RiskRejected(RiskBlock),
    #[error("preflight failed: {reason}")]
    PreflightFailed { reason: PreflightReason },
    #[error("reconcile failed: {reason}")]
    ReconcileFailed { reason: ReconcileReason },
    #[error("broker unreachable: {0}")]
    BrokerUnreachable(String),
    #[error("execution failed: {0}")]
    ExecutionFailed(String),
    #[error("persistence failure: {0}")]
    Persistence(#[from] StoreError),
}

impl EngineError {
    /// The only class that may leave `Engine::step`.
    pub fn is_fatal(&self) -> bool {
        matches!(self, EngineError::Persistence(_))
    }
}
