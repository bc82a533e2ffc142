//! Engine configuration

use crate::error::EngineError;
use crate::Result;
use dotenv::dotenv;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Where signals end up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// Historical replay against a simulation context
    Backtest,
    /// Ledger-backed simulated broker
    Paper,
    /// External broker backend
    Live,
}

impl FromStr for ExecutionMode {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "backtest" => Ok(Self::Backtest),
            "paper" => Ok(Self::Paper),
            "live" => Ok(Self::Live),
            other => Err(EngineError::validation(format!("unknown execution mode: {other}"))),
        }
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Backtest => "backtest",
            Self::Paper => "paper",
            Self::Live => "live",
        };
        f.write_str(label)
    }
}

/// Backoff applied to market data reconnects
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            max_attempts: 8,
        }
    }
}

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Capacity of every per-(strategy, symbol) bar history
    pub max_data_history: usize,
    /// Transitions kept per strategy in the lifecycle audit trail
    pub lifecycle_history_limit: usize,
    pub mode: ExecutionMode,
    /// Directory for warmup bar caches
    pub cache_dir: PathBuf,
    /// Starting cash of the paper / backtest ledger
    pub initial_cash: f64,
    /// Used when a signal carries no quantity
    pub default_order_qty: f64,
    /// Upper bound on a single live broker call
    pub live_timeout_ms: u64,
    pub event_capacity: usize,
    pub reconnect: ReconnectConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_data_history: 500,
            lifecycle_history_limit: 20,
            mode: ExecutionMode::Paper,
            cache_dir: PathBuf::from("./cache"),
            initial_cash: 10_000.0,
            default_order_qty: 1.0,
            live_timeout_ms: 10_000,
            event_capacity: 1024,
            reconnect: ReconnectConfig::default(),
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> Result<T> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| EngineError::validation(format!("{key}: cannot parse {raw:?}"))),
        Err(_) => Ok(default),
    }
}

impl EngineConfig {
    /// Load from `.env` and `DISPATCH_*` variables, falling back to defaults
    pub fn from_env() -> Result<Self> {
        dotenv().ok();
        let defaults = Self::default();

        let config = Self {
            max_data_history: env_or("DISPATCH_MAX_DATA_HISTORY", defaults.max_data_history)?,
            lifecycle_history_limit: env_or(
                "DISPATCH_LIFECYCLE_HISTORY_LIMIT",
                defaults.lifecycle_history_limit,
            )?,
            mode: env_or("DISPATCH_MODE", defaults.mode)?,
            cache_dir: std::env::var("DISPATCH_CACHE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.cache_dir),
            initial_cash: env_or("DISPATCH_INITIAL_CASH", defaults.initial_cash)?,
            default_order_qty: env_or("DISPATCH_DEFAULT_ORDER_QTY", defaults.default_order_qty)?,
            live_timeout_ms: env_or("DISPATCH_LIVE_TIMEOUT_MS", defaults.live_timeout_ms)?,
            event_capacity: env_or("DISPATCH_EVENT_CAPACITY", defaults.event_capacity)?,
            reconnect: ReconnectConfig {
                base_delay_ms: env_or(
                    "DISPATCH_RECONNECT_BASE_DELAY_MS",
                    defaults.reconnect.base_delay_ms,
                )?,
                max_delay_ms: env_or(
                    "DISPATCH_RECONNECT_MAX_DELAY_MS",
                    defaults.reconnect.max_delay_ms,
                )?,
                max_attempts: env_or(
                    "DISPATCH_RECONNECT_MAX_ATTEMPTS",
                    defaults.reconnect.max_attempts,
                )?,
            },
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_data_history == 0 {
            return Err(EngineError::validation("max_data_history must be at least 1"));
        }
        if !(self.initial_cash.is_finite() && self.initial_cash >= 0.0) {
            return Err(EngineError::validation("initial_cash must be a non-negative number"));
        }
        if !(self.default_order_qty.is_finite() && self.default_order_qty > 0.0) {
            return Err(EngineError::validation("default_order_qty must be positive"));
        }
        if self.reconnect.base_delay_ms > self.reconnect.max_delay_ms {
            return Err(EngineError::validation(
                "reconnect base delay exceeds max delay",
            ));
        }
        Ok(())
    }

    pub fn live_timeout(&self) -> Duration {
        Duration::from_millis(self.live_timeout_ms)
    }
}
