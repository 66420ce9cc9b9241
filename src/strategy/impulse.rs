//! Pattern-based entries on exhausted down-runs.
//!
//! A setup is a run of down moves followed by an up tick while price sits in
//! the bottom of its recent range. Conviction builds over consecutive cycles
//! showing the setup; an entry needs enough conviction, a fresh candle-close
//! event and a quality score above a floor that rises after losing trades.

use std::collections::{BTreeMap, VecDeque};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{decode, exit_signal, DecisionContext, PositionBook, Regime, Strategy};
use crate::action::{Action, Side, TradeResult};
use crate::config::ExitConfig;
use crate::feedback::Diagnosis;
use crate::logging::{debug, info, obj, v_num, v_str, Domain};
use crate::state_machine::OperatingState;
use crate::store::{EventRecord, EventResult};
use crate::world::{SymbolView, WorldView};

const PATTERN: &str = "bottom_reversal";
const EVENT_5M: &str = "5M_CLOSED";
const EVENT_4H: &str = "4H_CLOSED";

const MIN_MOVES: usize = 4;
const MIN_ENERGY: f64 = 0.2;
const FAST_ENERGY: f64 = 1.0;
const SLOW_ENERGY: f64 = 0.3;
const FAST_TEMPO: i32 = 3;

const QUALITY_MEMORY: usize = 20;
const QUALITY_SAMPLE: usize = 8;
const CONTEXT_SAMPLE: u32 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Zone {
    Bottom,
    Middle,
    Top,
}

impl Zone {
    fn as_str(&self) -> &'static str {
        match self {
            Zone::Bottom => "bottom",
            Zone::Middle => "middle",
            Zone::Top => "top",
        }
    }

    /// Where the latest price sits inside the range walked by the window.
    fn of(moves: &[f64]) -> Zone {
        let mut level = 0.0;
        let (mut lo, mut hi) = (0.0_f64, 0.0_f64);
        for m in moves {
            level += m;
            lo = lo.min(level);
            hi = hi.max(level);
        }
        if hi - lo <= f64::EPSILON {
            return Zone::Middle;
        }
        let pos = (level - lo) / (hi - lo);
        if pos < 1.0 / 3.0 {
            Zone::Bottom
        } else if pos > 2.0 / 3.0 {
            Zone::Top
        } else {
            Zone::Middle
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Rhythm {
    Fast,
    Normal,
    Slow,
}

impl Rhythm {
    fn of(energy: f64) -> Rhythm {
        if energy >= FAST_ENERGY {
            Rhythm::Fast
        } else if energy <= SLOW_ENERGY {
            Rhythm::Slow
        } else {
            Rhythm::Normal
        }
    }

    fn score(&self) -> i32 {
        match self {
            Rhythm::Fast => 2,
            Rhythm::Normal => 1,
            Rhythm::Slow => 0,
        }
    }
}

#[derive(Debug, Clone)]
struct Setup {
    zone: Zone,
    tempo: &'static str,
    rhythm: Rhythm,
    energy: f64,
    threshold: i32,
    triggered: bool,
}

impl Setup {
    fn context_key(&self) -> String {
        format!("{}:{}:{}", PATTERN, self.zone.as_str(), self.tempo)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ContextStats {
    wins: u32,
    losses: u32,
    threshold: i32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct WinLoss {
    wins: u32,
    losses: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct EntryContext {
    quality: i32,
    context: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ImpulseState {
    #[serde(default)]
    entries: PositionBook,
    #[serde(default)]
    regime: Regime,
    #[serde(default)]
    base_threshold: Option<i32>,
    #[serde(default)]
    min_quality: Option<i32>,
    #[serde(default)]
    context_stats: BTreeMap<String, ContextStats>,
    #[serde(default)]
    by_symbol: BTreeMap<String, WinLoss>,
    #[serde(default)]
    quality_memory: VecDeque<(i32, TradeResult)>,
    #[serde(default)]
    open_contexts: BTreeMap<String, EntryContext>,
}

pub struct ImpulseStrategy {
    exits: ExitConfig,
    symbols: Vec<String>,
    book: PositionBook,
    regime: Regime,

    base_threshold: i32,
    conviction_threshold: u32,
    min_quality: i32,
    cooldown_cycles: u64,

    context_stats: BTreeMap<String, ContextStats>,
    by_symbol: BTreeMap<String, WinLoss>,
    quality_memory: VecDeque<(i32, TradeResult)>,
    open_contexts: BTreeMap<String, EntryContext>,
    closed_contexts: Vec<(String, EntryContext)>,

    conviction: BTreeMap<String, u32>,
    cycle: u64,
    last_event: Option<(&'static str, u64)>,
    last_entry_cycle: BTreeMap<String, u64>,
}

impl ImpulseStrategy {
    pub fn new(exits: ExitConfig, symbols: &[String]) -> Self {
        Self {
            exits,
            symbols: symbols.to_vec(),
            book: PositionBook::default(),
            regime: Regime::Normal,
            base_threshold: 2,
            conviction_threshold: 2,
            min_quality: 3,
            cooldown_cycles: 10,
            context_stats: BTreeMap::new(),
            by_symbol: BTreeMap::new(),
            quality_memory: VecDeque::new(),
            open_contexts: BTreeMap::new(),
            closed_contexts: Vec::new(),
            conviction: BTreeMap::new(),
            cycle: 0,
            last_event: None,
            last_entry_cycle: BTreeMap::new(),
        }
    }

    pub fn min_quality(&self) -> i32 {
        self.min_quality
    }

    fn event_window(kind: &str) -> u64 {
        match kind {
            EVENT_4H => 12,
            _ => 3,
        }
    }

    fn context_threshold(&self, key: &str) -> i32 {
        self.context_stats
            .get(key)
            .map(|c| c.threshold)
            .unwrap_or(self.base_threshold)
    }

    /// Good track record lowers the bar, bad one raises it.
    fn symbol_bias(&self, symbol: &str) -> i32 {
        let Some(rec) = self.by_symbol.get(symbol) else {
            return 0;
        };
        let total = rec.wins + rec.losses;
        if total < 5 {
            return 0;
        }
        let rate = rec.wins as f64 / total as f64;
        if rate > 0.65 {
            -1
        } else if rate < 0.35 {
            1
        } else {
            0
        }
    }

    fn regime_penalty(&self) -> i32 {
        match self.regime {
            Regime::Normal => 0,
            Regime::Cautious => 1,
            Regime::Defensive => 2,
            Regime::Suspended => i32::MAX / 2,
        }
    }

    fn read_setup(&self, symbol: &str, view: &SymbolView) -> Option<Setup> {
        if view.moves.len() < MIN_MOVES {
            return None;
        }
        let energy = view.energy();
        if energy < MIN_ENERGY {
            return None;
        }
        let zone = Zone::of(&view.moves);
        let rhythm = Rhythm::of(energy);
        let tempo = if view.micro_trend.abs() >= FAST_TEMPO { "fast" } else { "slow" };
        let mut setup = Setup { zone, tempo, rhythm, energy, threshold: 0, triggered: false };

        let rhythm_penalty = if rhythm == Rhythm::Slow { 1 } else { 0 };
        setup.threshold = self.context_threshold(&setup.context_key())
            + self.symbol_bias(symbol)
            + rhythm_penalty
            + self.regime_penalty();

        let reversal_tick = view.change_pct.map(|c| c > 0.0).unwrap_or(false);
        setup.triggered =
            zone == Zone::Bottom && reversal_tick && view.prev_trend <= -setup.threshold;
        Some(setup)
    }

    fn quality(&self, setup: &Setup, conviction: u32) -> i32 {
        let mut score = setup.rhythm.score();
        // bottom zone on a long setup carries no dissonance
        score += 2;
        if conviction >= self.conviction_threshold {
            score += 1;
        }
        if setup.energy >= FAST_ENERGY {
            score += 1;
        }
        score
    }

    fn event_is_fresh(&self) -> bool {
        match self.last_event {
            Some((kind, at)) => self.cycle.saturating_sub(at) <= Self::event_window(kind),
            None => false,
        }
    }

    fn record_outcome(&mut self, symbol: &str, ctx: EntryContext, result: TradeResult) {
        self.quality_memory.push_back((ctx.quality, result));
        while self.quality_memory.len() > QUALITY_MEMORY {
            self.quality_memory.pop_front();
        }
        if self.quality_memory.len() >= QUALITY_SAMPLE {
            let avg = |want: TradeResult| -> f64 {
                let qs: Vec<i32> = self
                    .quality_memory
                    .iter()
                    .filter(|(_, r)| *r == want)
                    .map(|(q, _)| *q)
                    .collect();
                if qs.is_empty() {
                    0.0
                } else {
                    qs.iter().sum::<i32>() as f64 / qs.len() as f64
                }
            };
            let (avg_win, avg_loss) = (avg(TradeResult::Win), avg(TradeResult::Loss));
            if avg_loss >= avg_win && self.min_quality < 6 {
                self.min_quality += 1;
            } else if avg_win > avg_loss + 1.0 && self.min_quality > 2 {
                self.min_quality -= 1;
            }
        }

        let rec = self.by_symbol.entry(symbol.to_string()).or_default();
        match result {
            TradeResult::Win => rec.wins += 1,
            TradeResult::Loss => rec.losses += 1,
        }

        let base = self.base_threshold;
        let stats = self
            .context_stats
            .entry(ctx.context.clone())
            .or_insert(ContextStats { wins: 0, losses: 0, threshold: base });
        match result {
            TradeResult::Win => stats.wins += 1,
            TradeResult::Loss => stats.losses += 1,
        }
        let total = stats.wins + stats.losses;
        if total >= CONTEXT_SAMPLE {
            let rate = stats.wins as f64 / total as f64;
            if rate < 0.45 {
                stats.threshold = (stats.threshold + 1).min(6);
            } else if rate > 0.6 {
                stats.threshold = (stats.threshold - 1).max(1);
            }
        }

        info(
            Domain::Strategy,
            "impulse_learned",
            obj(&[
                ("symbol", v_str(symbol)),
                ("result", v_str(result.as_str())),
                ("context", v_str(&ctx.context)),
                ("min_quality", v_num(self.min_quality as f64)),
            ]),
        );
    }
}

impl Strategy for ImpulseStrategy {
    fn name(&self) -> &'static str {
        "impulse"
    }

    fn observe(&mut self, world: &WorldView) {
        self.cycle = world.cycle;
        if world.events.iter().any(|e| e == EVENT_4H) {
            self.last_event = Some((EVENT_4H, world.cycle));
        } else if world.events.iter().any(|e| e == EVENT_5M) {
            self.last_event = Some((EVENT_5M, world.cycle));
        }

        for symbol in self.symbols.clone() {
            let triggered = world
                .get(&symbol)
                .and_then(|view| self.read_setup(&symbol, view))
                .map(|s| s.triggered)
                .unwrap_or(false);
            let slot = self.conviction.entry(symbol).or_insert(0);
            *slot = if triggered { *slot + 1 } else { 0 };
        }
    }

    fn decide(
        &self,
        state: OperatingState,
        world: &WorldView,
        _ctx: &DecisionContext,
    ) -> Option<Action> {
        match state {
            OperatingState::InPosition => return exit_signal(&self.book, world, &self.exits),
            OperatingState::Idle => {}
            _ => return None,
        }
        if !self.regime.allows_entries() || !self.event_is_fresh() {
            return None;
        }

        for symbol in &self.symbols {
            if self.book.contains(symbol) {
                continue;
            }
            if let Some(at) = self.last_entry_cycle.get(symbol) {
                if self.cycle.saturating_sub(*at) < self.cooldown_cycles {
                    continue;
                }
            }
            let conviction = self.conviction.get(symbol).copied().unwrap_or(0);
            if conviction < self.conviction_threshold {
                continue;
            }
            let Some(view) = world.get(symbol) else {
                continue;
            };
            let Some(price) = view.price else {
                continue;
            };
            let Some(setup) = self.read_setup(symbol, view) else {
                continue;
            };
            if !setup.triggered {
                continue;
            }
            let quality = self.quality(&setup, conviction);
            if quality < self.min_quality {
                debug(
                    Domain::Strategy,
                    "impulse_low_quality",
                    obj(&[
                        ("symbol", v_str(symbol)),
                        ("quality", v_num(quality as f64)),
                        ("min_quality", v_num(self.min_quality as f64)),
                    ]),
                );
                continue;
            }
            return Some(
                Action::buy(symbol, price)
                    .with_reason("IMPULSE")
                    .with_meta("pattern", Value::from(PATTERN))
                    .with_meta("context", Value::from(setup.context_key()))
                    .with_meta("quality", Value::from(quality))
                    .with_meta("threshold", Value::from(setup.threshold))
                    .with_meta("conviction", Value::from(conviction)),
            );
        }
        None
    }

    fn adapt(&mut self, diagnosis: &Diagnosis) {
        if let Some(regime) = Regime::from_diagnosis(diagnosis) {
            self.regime = regime;
        }
    }

    fn learn(&mut self, events: &[EventRecord]) {
        if self.closed_contexts.is_empty() {
            return;
        }
        for event in events.iter().rev() {
            let (Some(action), Some(outcome)) = (&event.action, event.outcome) else {
                continue;
            };
            if event.result != EventResult::Executed || action.kind != Side::Sell {
                continue;
            }
            if let Some(idx) = self.closed_contexts.iter().position(|(s, _)| *s == action.symbol) {
                let (symbol, ctx) = self.closed_contexts.remove(idx);
                self.record_outcome(&symbol, ctx, outcome);
            }
            if self.closed_contexts.is_empty() {
                break;
            }
        }
    }

    fn on_filled(&mut self, action: &Action) {
        match action.kind {
            Side::Buy => {
                self.book.record(&action.symbol, action.price, action.qty);
                self.last_entry_cycle.insert(action.symbol.clone(), self.cycle);
                self.conviction.insert(action.symbol.clone(), 0);
                let quality = action
                    .metadata
                    .get("quality")
                    .and_then(Value::as_i64)
                    .unwrap_or(0) as i32;
                let context = action
                    .metadata
                    .get("context")
                    .and_then(Value::as_str)
                    .unwrap_or("adopted")
                    .to_string();
                self.open_contexts
                    .insert(action.symbol.clone(), EntryContext { quality, context });
            }
            Side::Sell => {
                self.book.close(&action.symbol);
                if let Some(ctx) = self.open_contexts.remove(&action.symbol) {
                    self.closed_contexts.push((action.symbol.clone(), ctx));
                }
            }
        }
    }

    fn regime(&self) -> Regime {
        self.regime
    }

    fn book(&self) -> &PositionBook {
        &self.book
    }

    fn book_mut(&mut self) -> &mut PositionBook {
        &mut self.book
    }

    fn export(&self) -> Value {
        serde_json::to_value(ImpulseState {
            entries: self.book.clone(),
            regime: self.regime,
            base_threshold: Some(self.base_threshold),
            min_quality: Some(self.min_quality),
            context_stats: self.context_stats.clone(),
            by_symbol: self.by_symbol.clone(),
            quality_memory: self.quality_memory.clone(),
            open_contexts: self.open_contexts.clone(),
        })
        .unwrap_or(Value::Null)
    }

    fn import(&mut self, state: Value) {
        let saved: ImpulseState = decode(self.name(), state);
        self.book = saved.entries;
        self.regime = saved.regime;
        self.base_threshold = saved.base_threshold.unwrap_or(self.base_threshold);
        self.min_quality = saved.min_quality.unwrap_or(self.min_quality);
        self.context_stats = saved.context_stats;
        self.by_symbol = saved.by_symbol;
        self.quality_memory = saved.quality_memory;
        self.open_contexts = saved.open_contexts;
    }
}
