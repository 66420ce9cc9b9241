//! Typed, validated configuration.
//!
//! Profiles are a pure mapping from name to settings; environment variables
//! override individual fields afterwards and `validate` runs last.

use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::engine::mode::Mode;
use crate::error::ConfigError;
use crate::strategy::StrategyKind;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskConfig {
    pub armed: bool,
    pub max_daily_trades: u32,
    pub max_daily_loss: f64,
    pub max_parallel_positions: usize,
    pub cooldown_after_loss_seconds: i64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Profile::Conservative.settings().risk
    }
}

impl RiskConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_daily_trades == 0 {
            return Err(invalid("max_daily_trades", "must be > 0"));
        }
        if !(self.max_daily_loss.is_finite() && self.max_daily_loss > 0.0) {
            return Err(invalid("max_daily_loss", "must be a positive amount"));
        }
        if self.max_parallel_positions == 0 {
            return Err(invalid("max_parallel_positions", "must be > 0"));
        }
        if self.cooldown_after_loss_seconds < 0 {
            return Err(invalid("cooldown_after_loss_seconds", "must be >= 0"));
        }
        Ok(())
    }
}

/// Exit thresholds, as percent change from entry.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExitConfig {
    pub stop_loss_pct: f64,
    pub take_profit_pct: f64,
    /// Minimum last move (percent) the trend strategy needs to enter.
    pub min_move_pct: f64,
}

impl Default for ExitConfig {
    fn default() -> Self {
        Profile::Conservative.settings().exits
    }
}

impl ExitConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.stop_loss_pct < 0.0) {
            return Err(invalid("stop_loss_pct", "must be negative"));
        }
        if !(self.take_profit_pct > 0.0) {
            return Err(invalid("take_profit_pct", "must be positive"));
        }
        if self.min_move_pct < 0.0 {
            return Err(invalid("min_move_pct", "must be >= 0"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProfileSettings {
    pub risk: RiskConfig,
    pub exits: ExitConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Profile {
    Conservative,
    Moderate,
    Aggressive,
}

impl Profile {
    pub fn from_name(name: &str) -> Result<Self, ConfigError> {
        match name.trim().to_lowercase().as_str() {
            "conservative" => Ok(Profile::Conservative),
            "moderate" => Ok(Profile::Moderate),
            "aggressive" => Ok(Profile::Aggressive),
            other => Err(ConfigError::UnknownProfile(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Profile::Conservative => "conservative",
            Profile::Moderate => "moderate",
            Profile::Aggressive => "aggressive",
        }
    }

    pub fn settings(self) -> ProfileSettings {
        let (stop_loss_pct, take_profit_pct, max_parallel_positions, cooldown) = match self {
            Profile::Conservative => (-0.3, 0.6, 1, 600),
            Profile::Moderate => (-0.5, 1.2, 2, 300),
            Profile::Aggressive => (-1.0, 2.5, 4, 60),
        };
        ProfileSettings {
            risk: RiskConfig {
                armed: true,
                max_daily_trades: 20,
                max_daily_loss: 100.0,
                max_parallel_positions,
                cooldown_after_loss_seconds: cooldown,
            },
            exits: ExitConfig {
                stop_loss_pct,
                take_profit_pct,
                min_move_pct: 0.05,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    Json,
    Sqlite,
}

impl StoreKind {
    pub fn from_name(name: &str) -> Result<Self, ConfigError> {
        match name.trim().to_lowercase().as_str() {
            "json" => Ok(StoreKind::Json),
            "sqlite" => Ok(StoreKind::Sqlite),
            other => Err(ConfigError::UnknownStore(other.to_string())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub symbols: Vec<String>,
    pub mode: Mode,
    pub profile: Profile,
    pub strategy: StrategyKind,
    pub risk: RiskConfig,
    pub exits: ExitConfig,
    pub store: StoreKind,
    pub store_dir: PathBuf,
    pub cycle_ms: u64,
    pub status_addr: String,
    /// How many recent events feed the diagnosis.
    pub event_window: usize,
    /// Per-symbol move history kept by the world.
    pub world_window: usize,
    pub paper_seed: u64,
}

impl EngineConfig {
    /// Defaults for a profile, before any environment overrides.
    pub fn for_profile(profile: Profile, symbols: Vec<String>) -> Self {
        let settings = profile.settings();
        Self {
            symbols,
            mode: Mode::Virtual,
            profile,
            strategy: StrategyKind::Trend,
            risk: settings.risk,
            exits: settings.exits,
            store: StoreKind::Json,
            store_dir: PathBuf::from("storage"),
            cycle_ms: 1000,
            status_addr: "127.0.0.1:8001".to_string(),
            event_window: 50,
            world_window: 8,
            paper_seed: 7,
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        let profile = Profile::from_name(&env_str("PROFILE", "conservative"))?;
        let symbols: Vec<String> = env_str("SYMBOLS", "EURUSD,GBPUSD,USDJPY")
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();
        let mut cfg = Self::for_profile(profile, symbols);

        cfg.mode = Mode::from_name(&env_str("MODE", "VIRTUAL"))?;
        cfg.strategy = StrategyKind::from_name(&env_str("STRATEGY", "trend"))?;
        cfg.store = StoreKind::from_name(&env_str("STORE", "json"))?;
        cfg.store_dir = PathBuf::from(env_str("STORE_DIR", "storage"));
        cfg.status_addr = env_str("STATUS_ADDR", &cfg.status_addr);

        if let Some(v) = env_parse("CYCLE_MS") {
            cfg.cycle_ms = v;
        }
        if let Some(v) = env_parse("EVENT_WINDOW") {
            cfg.event_window = v;
        }
        if let Some(v) = env_parse("WORLD_WINDOW") {
            cfg.world_window = v;
        }
        if let Some(v) = env_parse("PAPER_SEED") {
            cfg.paper_seed = v;
        }
        if let Ok(v) = std::env::var("ARMED") {
            cfg.risk.armed = matches!(v.to_lowercase().as_str(), "1" | "true" | "yes");
        }
        if let Some(v) = env_parse("MAX_DAILY_TRADES") {
            cfg.risk.max_daily_trades = v;
        }
        if let Some(v) = env_parse("MAX_DAILY_LOSS") {
            cfg.risk.max_daily_loss = v;
        }
        if let Some(v) = env_parse("MAX_PARALLEL_POSITIONS") {
            cfg.risk.max_parallel_positions = v;
        }
        if let Some(v) = env_parse("COOLDOWN_SECS") {
            cfg.risk.cooldown_after_loss_seconds = v;
        }
        if let Some(v) = env_parse("STOP_LOSS_PCT") {
            cfg.exits.stop_loss_pct = v;
        }
        if let Some(v) = env_parse("TAKE_PROFIT_PCT") {
            cfg.exits.take_profit_pct = v;
        }
        if let Some(v) = env_parse("MIN_MOVE_PCT") {
            cfg.exits.min_move_pct = v;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.symbols.is_empty() {
            return Err(invalid("symbols", "at least one symbol is required"));
        }
        if self.cycle_ms == 0 {
            return Err(invalid("cycle_ms", "must be > 0"));
        }
        if self.event_window == 0 {
            return Err(invalid("event_window", "must be > 0"));
        }
        self.risk.validate()?;
        self.exits.validate()
    }
}

fn invalid(field: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid { field, reason: reason.to_string() }
}

fn env_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
