//! Health diagnosis derived from recent event history.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::action::TradeResult;
use crate::store::{EventRecord, EventResult};

pub const SIGNAL_HUMAN_REJECTION: &str = "HUMAN_REJECTION";
pub const SIGNAL_PREFLIGHT_REJECTIONS: &str = "PREFLIGHT_REJECTIONS";
pub const SIGNAL_LOSS_STREAK: &str = "LOSS_STREAK";

const MIN_DECISIONS_FOR_BLOCK_RATIO: usize = 5;
const BLOCK_RATIO: f64 = 0.6;
const UNSTABLE_FAILURES: usize = 3;
const HUMAN_REJECTIONS: usize = 3;
const PREFLIGHT_REJECTIONS: usize = 2;
const LOSS_STREAK: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Health {
    Ok,
    Unstable,
    RiskBlocked,
    NoData,
}

impl Health {
    pub fn as_str(&self) -> &'static str {
        match self {
            Health::Ok => "OK",
            Health::Unstable => "UNSTABLE",
            Health::RiskBlocked => "RISK_BLOCKED",
            Health::NoData => "NO_DATA",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnosis {
    pub health: Health,
    #[serde(default)]
    pub signals: Vec<String>,
    #[serde(default)]
    pub recommendations: Vec<String>,
}

impl Default for Diagnosis {
    fn default() -> Self {
        Self::empty()
    }
}

impl Diagnosis {
    pub fn empty() -> Self {
        Self { health: Health::NoData, signals: Vec::new(), recommendations: Vec::new() }
    }

    pub fn ok() -> Self {
        Self { health: Health::Ok, ..Self::empty() }
    }

    pub fn has_signal(&self, signal: &str) -> bool {
        self.signals.iter().any(|s| s == signal)
    }
}

/// Source of diagnoses for the engine's global ritual.
pub trait Feedback: Send {
    fn diagnose(&self, events: &[EventRecord]) -> Diagnosis;
}

#[derive(Debug, Clone, Default)]
pub struct EventDiagnostician;

impl Feedback for EventDiagnostician {
    fn diagnose(&self, events: &[EventRecord]) -> Diagnosis {
        if events.is_empty() {
            return Diagnosis::empty();
        }
        let stats = EventStats::from_events(events);

        let mut diagnosis = Diagnosis::ok();
        let decisions = stats.approved + stats.blocked;
        if decisions >= MIN_DECISIONS_FOR_BLOCK_RATIO
            && stats.blocked as f64 / decisions as f64 >= BLOCK_RATIO
        {
            diagnosis.health = Health::RiskBlocked;
            diagnosis
                .recommendations
                .push("review risk limits or wait for cooldown".to_string());
        } else if stats.failures >= UNSTABLE_FAILURES {
            diagnosis.health = Health::Unstable;
            diagnosis
                .recommendations
                .push("check broker connectivity before trading live".to_string());
        }

        if stats.operator_cancels >= HUMAN_REJECTIONS {
            diagnosis.signals.push(SIGNAL_HUMAN_REJECTION.to_string());
            diagnosis
                .recommendations
                .push("operator keeps cancelling; tighten entry criteria".to_string());
        }
        if stats.preflight_rejections >= PREFLIGHT_REJECTIONS {
            diagnosis.signals.push(SIGNAL_PREFLIGHT_REJECTIONS.to_string());
            diagnosis
                .recommendations
                .push("repeated preflight rejections; inspect broker state".to_string());
        }
        if trailing_losses(events) >= LOSS_STREAK {
            diagnosis.signals.push(SIGNAL_LOSS_STREAK.to_string());
            diagnosis
                .recommendations
                .push("consecutive losses; reduce exposure".to_string());
        }
        diagnosis
    }
}

fn trailing_losses(events: &[EventRecord]) -> usize {
    events
        .iter()
        .rev()
        .filter_map(|e| e.outcome)
        .take_while(|o| *o == TradeResult::Loss)
        .count()
}

/// Counters over an event log, shared by the diagnostician and the replay tool.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EventStats {
    pub total: usize,
    pub no_action: usize,
    pub approved: usize,
    pub blocked: usize,
    pub executed: usize,
    pub failures: usize,
    pub operator_confirms: usize,
    pub operator_cancels: usize,
    pub preflight_rejections: usize,
    pub wins: usize,
    pub losses: usize,
    pub states: BTreeMap<String, usize>,
    pub modes: BTreeMap<String, usize>,
    pub sides: BTreeMap<String, usize>,
    pub reasons: BTreeMap<String, usize>,
}

impl EventStats {
    pub fn from_events(events: &[EventRecord]) -> Self {
        let mut stats = EventStats::default();
        for event in events {
            stats.total += 1;
            *stats.states.entry(event.state.name().to_string()).or_insert(0) += 1;
            *stats.modes.entry(event.mode.as_str().to_string()).or_insert(0) += 1;

            match event.result {
                EventResult::NoAction => stats.no_action += 1,
                EventResult::Approved => stats.approved += 1,
                EventResult::BlockedByRisk => stats.blocked += 1,
                EventResult::Executed => stats.executed += 1,
                EventResult::Failed | EventResult::Error => stats.failures += 1,
            }

            match event.reason.as_deref() {
                Some("operator_confirm") => stats.operator_confirms += 1,
                Some("operator_cancel") => stats.operator_cancels += 1,
                Some(r) if r.starts_with("preflight:") => stats.preflight_rejections += 1,
                _ => {}
            }

            if let Some(action) = &event.action {
                *stats.sides.entry(action.kind.as_str().to_string()).or_insert(0) += 1;
                if let Some(reason) = &action.reason {
                    if event.result == EventResult::Executed && !action.is_buy() {
                        *stats.reasons.entry(reason.clone()).or_insert(0) += 1;
                    }
                }
            }

            match event.outcome {
                Some(TradeResult::Win) => stats.wins += 1,
                Some(TradeResult::Loss) => stats.losses += 1,
                None => {}
            }
        }
        stats
    }

    pub fn win_rate(&self) -> Option<f64> {
        let closed = self.wins + self.losses;
        if closed == 0 {
            None
        } else {
            Some(self.wins as f64 / closed as f64)
        }
    }
}
