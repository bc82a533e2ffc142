//! Dispatch-Core: strategy dispatch and lifecycle engine
//!
//! This crate is the runtime core of the trading node:
//! - ticks are synthesized into fixed-interval bars per (strategy, symbol)
//! - every strategy unit is governed by a lifecycle state machine
//! - units are warmed up from cached history before they receive live ticks
//! - emitted signals are routed to a paper, live or backtest backend with at
//!   most one execution in flight per (strategy, symbol)
//!
//! Technical analysis in the built-in strategies uses
//! [ta-rs](https://github.com/greyblake/ta-rs).
//!
//! # Example
//!
//! ```no_run
//! use dispatch_core::prelude::*;
//! use std::sync::Arc;
//!
//! async fn run(
//!     source: Arc<dyn MarketDataSource>,
//!     provider: Arc<dyn HistoricalDataProvider>,
//! ) -> Result<()> {
//!     let config = EngineConfig::from_env()?;
//!     let broker = Arc::new(PaperBroker::new(config.initial_cash));
//!     let adapter = Arc::new(SignalAdapter::paper(broker, config.default_order_qty));
//!     let engine = Engine::new(config, source, provider, adapter);
//!
//!     let definition: StrategyDefinition = serde_json::from_str(
//!         r#"{ "id": "btc-rsi", "strategy_type": "RSI", "symbols": ["BTC/USDT"],
//!              "timeframe": "1m", "lookback": 100 }"#,
//!     )?;
//!     engine.register_strategy(StrategyRegistry::new().build_unit(definition)?).await?;
//!     engine.start().await?;
//!     engine.distribute(&Tick::new("BTC/USDT", 1_700_000_000_000, 42_000.0, 0.5)).await;
//!     Ok(())
//! }
//! ```

pub mod backtest;
pub mod config;
pub mod data;
pub mod engine;
pub mod error;
pub mod events;
pub mod execution;
pub mod feed;
pub mod lifecycle;
pub mod portfolio;
pub mod strategy;
pub mod warmup;

pub use error::EngineError;

// Re-export commonly used types
pub mod prelude {
    pub use crate::backtest::*;
    pub use crate::config::*;
    pub use crate::data::*;
    pub use crate::engine::*;
    pub use crate::events::*;
    pub use crate::execution::*;
    pub use crate::feed::*;
    pub use crate::lifecycle::*;
    pub use crate::portfolio::*;
    pub use crate::strategy::*;
    pub use crate::warmup::*;

    pub use crate::{EngineError, Result};
}

/// Result type alias
pub type Result<T> = std::result::Result<T, EngineError>;
