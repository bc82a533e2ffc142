//! Strategy trait

use crate::data::{Bar, Tick};
use crate::strategy::{ParamSpec, StrategySignal};
use serde_json::Value;

/// What a strategy sees when a bar closes
#[derive(Debug, Clone, Copy)]
pub struct BarContext<'a> {
    pub symbol: &'a str,
    /// The bar that just closed
    pub bar: &'a Bar,
    /// Retained history, most recent last (includes `bar`)
    pub window: &'a [Bar],
    /// Set while replaying history; anything returned is discarded
    pub warmup: bool,
}

/// Base trait for all trading strategies.
///
/// Implementations keep whatever per-symbol state they need; a unit may
/// subscribe to several symbols.
pub trait Strategy: Send {
    /// Get strategy name
    fn name(&self) -> &str;

    /// Parameters this strategy accepts
    fn param_schema(&self) -> Vec<ParamSpec> {
        Vec::new()
    }

    /// Apply already-validated parameters. Indicator state may be reset.
    fn apply_params(&mut self, _params: &Value) -> anyhow::Result<()> {
        Ok(())
    }

    /// Raw tick hook, called before bar synthesis
    fn on_tick(&mut self, _tick: &Tick) -> anyhow::Result<Option<StrategySignal>> {
        Ok(None)
    }

    /// Process a closed bar and optionally emit a signal
    fn on_bar(&mut self, ctx: &BarContext<'_>) -> anyhow::Result<Option<StrategySignal>>;
}
