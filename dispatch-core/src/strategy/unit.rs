//! Strategy units and their per-unit runtime

use crate::data::{AggregationReport, Bar, BarAggregator, Tick, Timeframe};
use crate::error::EngineError;
use crate::strategy::{validate_params, BarContext, Signal, Strategy};
use crate::Result;
use serde_json::Value;
use std::any::Any;
use std::collections::HashSet;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::warn;

/// A configured strategy instance: logic plus the symbols it trades
pub struct StrategyUnit {
    pub id: String,
    pub symbols: Vec<String>,
    pub timeframe: Timeframe,
    pub lookback: usize,
    pub params: Value,
    pub logic: Box<dyn Strategy>,
}

impl fmt::Debug for StrategyUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StrategyUnit")
            .field("id", &self.id)
            .field("strategy", &self.logic.name())
            .field("symbols", &self.symbols)
            .field("timeframe", &self.timeframe)
            .field("lookback", &self.lookback)
            .finish()
    }
}

impl StrategyUnit {
    pub fn new(
        id: impl Into<String>,
        symbols: Vec<String>,
        timeframe: Timeframe,
        lookback: usize,
        logic: Box<dyn Strategy>,
    ) -> Self {
        Self {
            id: id.into(),
            symbols,
            timeframe,
            lookback,
            params: Value::Null,
            logic,
        }
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }

    /// Structural checks that do not involve the strategy logic
    pub fn validate(&self, max_history: usize) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(EngineError::validation("strategy id is empty"));
        }
        if self.symbols.is_empty() {
            return Err(EngineError::validation(format!(
                "strategy {} has no symbols",
                self.id
            )));
        }
        if self.symbols.iter().any(|s| s.trim().is_empty()) {
            return Err(EngineError::validation(format!(
                "strategy {} has a blank symbol",
                self.id
            )));
        }
        if self.lookback == 0 || self.lookback > max_history {
            return Err(EngineError::validation(format!(
                "lookback {} outside 1..={max_history}",
                self.lookback
            )));
        }
        Ok(())
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Run strategy code, turning a panic into an ordinary error
pub fn guarded<T>(f: impl FnOnce() -> anyhow::Result<T>) -> anyhow::Result<T> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => Err(anyhow::anyhow!(
            "strategy panicked: {}",
            panic_message(payload)
        )),
    }
}

/// Live state of a registered unit: its logic and one bar series per symbol
pub struct UnitRuntime {
    id: String,
    symbols: Vec<String>,
    params: Value,
    logic: Box<dyn Strategy>,
    aggregator: BarAggregator,
}

impl fmt::Debug for UnitRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnitRuntime")
            .field("id", &self.id)
            .field("strategy", &self.logic.name())
            .field("symbols", &self.symbols)
            .finish()
    }
}

impl UnitRuntime {
    /// Validate the unit and its parameters, then apply them to the logic
    pub fn new(unit: StrategyUnit, max_history: usize) -> Result<Self> {
        unit.validate(max_history)?;
        let StrategyUnit {
            id,
            symbols,
            timeframe,
            lookback,
            params,
            mut logic,
        } = unit;

        let params = validate_params(&logic.param_schema(), &params)?;
        guarded(|| logic.apply_params(&params))
            .map_err(|e| EngineError::validation(format!("{id}: {e:#}")))?;

        let mut seen = HashSet::new();
        let symbols = symbols
            .into_iter()
            .map(|s| s.trim().to_string())
            .filter(|s| seen.insert(s.clone()))
            .collect();

        Ok(Self {
            id,
            symbols,
            params,
            logic,
            aggregator: BarAggregator::new(timeframe, lookback, max_history),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn symbols(&self) -> &[String] {
        &self.symbols
    }

    pub fn timeframe(&self) -> Timeframe {
        self.aggregator.timeframe()
    }

    pub fn lookback(&self) -> usize {
        self.aggregator.lookback()
    }

    pub fn params(&self) -> &Value {
        &self.params
    }

    pub fn strategy_name(&self) -> &str {
        self.logic.name()
    }

    pub fn is_warmed_up(&self, symbol: &str) -> bool {
        self.aggregator.is_warmed_up(symbol)
    }

    pub fn lookback_window(&self, symbol: &str) -> Vec<Bar> {
        self.aggregator.lookback_window(symbol)
    }

    pub fn report(&self, symbol: &str) -> AggregationReport {
        self.aggregator.report(symbol)
    }

    /// Replay historical bars with signals suppressed. Returns bars accepted.
    pub fn prime(&mut self, symbol: &str, bars: &[Bar]) -> anyhow::Result<usize> {
        let mut accepted = 0;
        for bar in bars {
            if self.aggregator.ingest_bar(symbol, *bar) {
                accepted += 1;
                let window = self.aggregator.lookback_window(symbol);
                evaluate(self.logic.as_mut(), symbol, &window, true)?;
            }
        }
        Ok(accepted)
    }

    /// Feed a live tick; returns signals emitted by the tick and bar hooks
    pub fn on_tick(&mut self, tick: &Tick) -> anyhow::Result<Vec<Signal>> {
        let mut signals = Vec::new();
        if let Some(emitted) = self.logic.on_tick(tick)? {
            signals.push(Signal::from_strategy(emitted, &self.id, &tick.symbol, tick.time));
        }

        if self
            .aggregator
            .update_tick(&tick.symbol, tick.time, tick.price, tick.volume)
        {
            let window = self.aggregator.lookback_window(&tick.symbol);
            if let Some(emitted) = evaluate(self.logic.as_mut(), &tick.symbol, &window, false)? {
                signals.push(Signal::from_strategy(emitted, &self.id, &tick.symbol, tick.time));
            }
        }
        Ok(signals)
    }

    /// Feed a pre-closed bar (replay path)
    pub fn on_closed_bar(&mut self, symbol: &str, bar: Bar) -> anyhow::Result<Option<Signal>> {
        if !self.aggregator.ingest_bar(symbol, bar) {
            return Ok(None);
        }
        let window = self.aggregator.lookback_window(symbol);
        let emitted = evaluate(self.logic.as_mut(), symbol, &window, false)?;
        Ok(emitted.map(|s| Signal::from_strategy(s, &self.id, symbol, bar.time)))
    }

    /// Validate and apply new parameters, then re-prime indicators from the
    /// retained windows
    pub fn update_params(&mut self, params: &Value) -> Result<()> {
        let resolved = validate_params(&self.logic.param_schema(), params)?;
        let logic = self.logic.as_mut();
        let windows: Vec<(String, Vec<Bar>)> = self
            .symbols
            .iter()
            .map(|s| (s.clone(), self.aggregator.lookback_window(s)))
            .collect();

        let applied = guarded(|| {
            logic.apply_params(&resolved)?;
            replay(&mut *logic, &windows)
        });
        if let Err(e) = applied {
            // The logic may already hold the rejected params; put the old ones back.
            let previous = &self.params;
            let restored = guarded(|| {
                logic.apply_params(previous)?;
                replay(&mut *logic, &windows)
            });
            if let Err(restore) = restored {
                warn!(strategy_id = %self.id, error = %restore, "restoring previous params failed");
            }
            return Err(EngineError::validation(format!("{}: {e:#}", self.id)));
        }

        self.params = resolved;
        Ok(())
    }

    /// Swap the logic, keeping history. The replacement is parameterised and
    /// primed before it takes over; on failure the old logic stays.
    pub fn replace_logic(&mut self, mut logic: Box<dyn Strategy>) -> Result<()> {
        let resolved = validate_params(&logic.param_schema(), &self.params)?;
        let windows: Vec<(String, Vec<Bar>)> = self
            .symbols
            .iter()
            .map(|s| (s.clone(), self.aggregator.lookback_window(s)))
            .collect();

        guarded(|| {
            logic.apply_params(&resolved)?;
            replay(logic.as_mut(), &windows)
        })
        .map_err(|e| EngineError::validation(format!("{}: {e:#}", self.id)))?;

        self.logic = logic;
        self.params = resolved;
        Ok(())
    }
}

fn evaluate(
    logic: &mut dyn Strategy,
    symbol: &str,
    window: &[Bar],
    warmup: bool,
) -> anyhow::Result<Option<crate::strategy::StrategySignal>> {
    let Some(bar) = window.last() else {
        return Ok(None);
    };
    let ctx = BarContext {
        symbol,
        bar,
        window,
        warmup,
    };
    let emitted = logic.on_bar(&ctx)?;
    Ok(if warmup { None } else { emitted })
}

fn replay(logic: &mut dyn Strategy, windows: &[(String, Vec<Bar>)]) -> anyhow::Result<()> {
    for (symbol, window) in windows {
        for end in 1..=window.len() {
            evaluate(logic, symbol, &window[..end], true)?;
        }
    }
    Ok(())
}
