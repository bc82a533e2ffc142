//! Historical replay through the unlocked adapter path

use crate::config::EngineConfig;
use crate::data::Bar;
use crate::error::EngineError;
use crate::execution::{LedgerSimulation, SignalAdapter, Trade};
use crate::strategy::{guarded, StrategyUnit, UnitRuntime};
use crate::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EquityPoint {
    pub time: i64,
    pub equity: f64,
}

/// Everything a replay produced, ready for external analytics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestOutput {
    pub strategy_id: String,
    pub initial_cash: f64,
    pub final_equity: f64,
    pub bars_replayed: usize,
    pub signals_executed: usize,
    pub signals_rejected: usize,
    pub trades: Vec<Trade>,
    pub equity_curve: Vec<EquityPoint>,
}

/// Consumer of backtest results (metrics, reports, storage)
pub trait AnalyticsSink {
    fn consume(&mut self, output: &BacktestOutput) -> anyhow::Result<()>;
}

/// Replays bars through one unit into a [`LedgerSimulation`]
#[derive(Debug, Clone)]
pub struct BacktestRunner {
    initial_cash: f64,
    default_qty: f64,
    max_history: usize,
}

impl BacktestRunner {
    pub fn new(initial_cash: f64, default_qty: f64) -> Self {
        Self {
            initial_cash,
            default_qty,
            max_history: EngineConfig::default().max_data_history,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            initial_cash: config.initial_cash,
            default_qty: config.default_order_qty,
            max_history: config.max_data_history,
        }
    }

    pub fn with_max_history(mut self, max_history: usize) -> Self {
        self.max_history = max_history;
        self
    }

    /// Run and hand the output to `sink`
    pub fn run_with_sink(
        &self,
        unit: StrategyUnit,
        history: &HashMap<String, Vec<Bar>>,
        sink: &mut dyn AnalyticsSink,
    ) -> Result<BacktestOutput> {
        let output = self.run(unit, history)?;
        sink.consume(&output)
            .map_err(|e| EngineError::Execution(format!("analytics sink failed: {e:#}")))?;
        Ok(output)
    }

    /// Replay `history` (bars per symbol) in time order through `unit`.
    ///
    /// A strategy fault aborts the run; a signal the simulation cannot fill is
    /// counted and skipped.
    pub fn run(&self, unit: StrategyUnit, history: &HashMap<String, Vec<Bar>>) -> Result<BacktestOutput> {
        let mut runtime = UnitRuntime::new(unit, self.max_history)?;
        let sim = Arc::new(Mutex::new(LedgerSimulation::new(self.initial_cash)));
        let adapter = SignalAdapter::backtest(sim.clone(), self.default_qty);

        let mut timeline: Vec<(String, Bar)> = Vec::new();
        for symbol in runtime.symbols() {
            match history.get(symbol) {
                Some(bars) => timeline.extend(bars.iter().map(|b| (symbol.clone(), *b))),
                None => warn!(symbol = %symbol, "no history supplied for symbol"),
            }
        }
        if timeline.is_empty() {
            return Err(EngineError::validation(format!(
                "no history for any symbol of {}",
                runtime.id()
            )));
        }
        timeline.sort_by(|a, b| a.1.time.cmp(&b.1.time).then_with(|| a.0.cmp(&b.0)));

        let mut equity_curve: Vec<EquityPoint> = Vec::new();
        let mut executed = 0;
        let mut rejected = 0;

        for (symbol, bar) in &timeline {
            adapter.mark(symbol, bar.close);
            let signal = guarded(|| runtime.on_closed_bar(symbol, *bar)).map_err(|e| {
                EngineError::Execution(format!("strategy fault at {}: {e:#}", bar.time))
            })?;

            if let Some(signal) = signal {
                match adapter.handle_sync(&signal) {
                    Ok(_) => executed += 1,
                    Err(e) => {
                        warn!(symbol = %symbol, time = bar.time, error = %e, "backtest signal skipped");
                        rejected += 1;
                    }
                }
            }

            let equity = sim.lock().unwrap_or_else(PoisonError::into_inner).equity();
            match equity_curve.last_mut() {
                Some(point) if point.time == bar.time => point.equity = equity,
                _ => equity_curve.push(EquityPoint {
                    time: bar.time,
                    equity,
                }),
            }
        }

        let sim = sim.lock().unwrap_or_else(PoisonError::into_inner);
        let output = BacktestOutput {
            strategy_id: runtime.id().to_string(),
            initial_cash: self.initial_cash,
            final_equity: sim.equity(),
            bars_replayed: timeline.len(),
            signals_executed: executed,
            signals_rejected: rejected,
            trades: sim.trades().to_vec(),
            equity_curve,
        };
        info!(
            strategy_id = %output.strategy_id,
            bars = output.bars_replayed,
            trades = output.trades.len(),
            final_equity = output.final_equity,
            "Backtest finished"
        );
        Ok(output)
    }
}
