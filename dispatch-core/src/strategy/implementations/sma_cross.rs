//! Moving-average crossover

use crate::strategy::{BarContext, ParamSpec, Strategy, StrategySignal};
use anyhow::{bail, Result};
use serde_json::Value;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use ta::indicators::SimpleMovingAverage;
use ta::Next;

struct CrossState {
    fast: SimpleMovingAverage,
    slow: SimpleMovingAverage,
    seen: usize,
    prev_diff: Option<f64>,
}

impl CrossState {
    fn new(fast: usize, slow: usize) -> Result<Self> {
        Ok(Self {
            fast: SimpleMovingAverage::new(fast)
                .map_err(|e| anyhow::anyhow!("Failed to create fast SMA: {}", e))?,
            slow: SimpleMovingAverage::new(slow)
                .map_err(|e| anyhow::anyhow!("Failed to create slow SMA: {}", e))?,
            seen: 0,
            prev_diff: None,
        })
    }
}

/// Enter long when the fast SMA crosses above the slow one. A cross below
/// exits, or flips short when `allow_short` is set.
pub struct SmaCrossStrategy {
    fast_period: usize,
    slow_period: usize,
    allow_short: bool,
    quantity: Option<f64>,
    states: HashMap<String, CrossState>,
}

impl SmaCrossStrategy {
    pub fn new(fast_period: usize, slow_period: usize) -> Result<Self> {
        if fast_period == 0 || fast_period >= slow_period {
            bail!("fast period {fast_period} must be positive and below slow period {slow_period}");
        }
        Ok(Self {
            fast_period,
            slow_period,
            allow_short: false,
            quantity: None,
            states: HashMap::new(),
        })
    }

    fn state(&mut self, symbol: &str) -> Result<&mut CrossState> {
        Ok(match self.states.entry(symbol.to_string()) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(e) => e.insert(CrossState::new(self.fast_period, self.slow_period)?),
        })
    }
}

impl Strategy for SmaCrossStrategy {
    fn name(&self) -> &str {
        "SMA_CROSS"
    }

    fn param_schema(&self) -> Vec<ParamSpec> {
        vec![
            ParamSpec::int("fast").range(1.0, 500.0).default_value(10),
            ParamSpec::int("slow").range(2.0, 500.0).default_value(30),
            ParamSpec::boolean("allow_short").default_value(false),
            ParamSpec::float("quantity").min(0.0),
        ]
    }

    fn apply_params(&mut self, params: &Value) -> Result<()> {
        let fast = params.get("fast").and_then(Value::as_u64).unwrap_or(10) as usize;
        let slow = params.get("slow").and_then(Value::as_u64).unwrap_or(30) as usize;
        if fast >= slow {
            bail!("fast period {fast} must be below slow period {slow}");
        }
        self.fast_period = fast;
        self.slow_period = slow;
        self.allow_short = params
            .get("allow_short")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        self.quantity = params.get("quantity").and_then(Value::as_f64).filter(|q| *q > 0.0);
        self.states.clear();
        Ok(())
    }

    fn on_bar(&mut self, ctx: &BarContext<'_>) -> Result<Option<StrategySignal>> {
        let slow_period = self.slow_period;
        let allow_short = self.allow_short;
        let quantity = self.quantity;
        let close = ctx.bar.close;

        let state = self.state(ctx.symbol)?;
        let fast = state.fast.next(close);
        let slow = state.slow.next(close);
        state.seen += 1;
        if state.seen < slow_period {
            return Ok(None);
        }

        let diff = fast - slow;
        let signal = match state.prev_diff.replace(diff) {
            Some(prev) if prev <= 0.0 && diff > 0.0 => Some(StrategySignal::enter_long()),
            Some(prev) if prev >= 0.0 && diff < 0.0 => Some(if allow_short {
                StrategySignal::enter_short()
            } else {
                StrategySignal::exit()
            }),
            _ => None,
        };

        Ok(signal.map(|s| {
            let s = s.at_price(close);
            match quantity {
                Some(q) => s.with_quantity(q),
                None => s,
            }
        }))
    }
}
