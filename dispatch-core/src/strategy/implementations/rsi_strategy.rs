//! RSI Strategy implementation

use crate::strategy::{BarContext, ParamSpec, Strategy, StrategySignal};
use anyhow::{bail, Result};
use serde_json::Value;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use ta::indicators::RelativeStrengthIndex;
use ta::Next;
use tracing::debug;

struct RsiState {
    rsi: RelativeStrengthIndex,
    seen: usize,
    prev: Option<f64>,
}

/// RSI-based trading strategy: enter long when RSI drops into the oversold
/// zone, exit when it rises into the overbought zone
pub struct RsiStrategy {
    period: usize,
    oversold: f64,
    overbought: f64,
    quantity: Option<f64>,
    states: HashMap<String, RsiState>,
}

impl RsiStrategy {
    /// Create new RSI strategy
    pub fn new(period: usize) -> Result<Self> {
        if period < 2 {
            bail!("RSI period must be at least 2, got {period}");
        }
        Ok(Self {
            period,
            oversold: 30.0,
            overbought: 70.0,
            quantity: None,
            states: HashMap::new(),
        })
    }
}

impl Strategy for RsiStrategy {
    fn name(&self) -> &str {
        "RSI"
    }

    fn param_schema(&self) -> Vec<ParamSpec> {
        vec![
            ParamSpec::int("period").range(2.0, 200.0).default_value(14),
            ParamSpec::float("oversold").range(0.0, 100.0).default_value(30.0),
            ParamSpec::float("overbought").range(0.0, 100.0).default_value(70.0),
            ParamSpec::float("quantity").min(0.0),
        ]
    }

    fn apply_params(&mut self, params: &Value) -> Result<()> {
        let oversold = params.get("oversold").and_then(Value::as_f64).unwrap_or(30.0);
        let overbought = params.get("overbought").and_then(Value::as_f64).unwrap_or(70.0);
        if oversold >= overbought {
            bail!("oversold {oversold} must be below overbought {overbought}");
        }
        self.period = params.get("period").and_then(Value::as_u64).unwrap_or(14) as usize;
        self.oversold = oversold;
        self.overbought = overbought;
        self.quantity = params.get("quantity").and_then(Value::as_f64).filter(|q| *q > 0.0);
        self.states.clear();
        Ok(())
    }

    fn on_bar(&mut self, ctx: &BarContext<'_>) -> Result<Option<StrategySignal>> {
        let period = self.period;
        let (oversold, overbought) = (self.oversold, self.overbought);
        let state = match self.states.entry(ctx.symbol.to_string()) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(e) => {
                let rsi = RelativeStrengthIndex::new(period)
                    .map_err(|e| anyhow::anyhow!("Failed to create RSI: {}", e))?;
                e.insert(RsiState { rsi, seen: 0, prev: None })
            }
        };

        let value = state.rsi.next(ctx.bar.close);
        state.seen += 1;
        // Need enough prices for RSI calculation
        if state.seen <= period {
            return Ok(None);
        }

        let prev = state.prev.replace(value);
        debug!(symbol = ctx.symbol, rsi = value, "RSI updated");

        let signal = match prev {
            Some(p) if p >= oversold && value < oversold => StrategySignal::enter_long(),
            Some(p) if p <= overbought && value > overbought => StrategySignal::exit(),
            _ => return Ok(None),
        };
        let signal = signal.at_price(ctx.bar.close);
        Ok(Some(match self.quantity {
            Some(q) => signal.with_quantity(q),
            None => signal,
        }))
    }
}
