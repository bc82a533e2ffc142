//! Backtest report generation

use crate::backtest::{AnalyticsSink, BacktestOutput};
use std::path::PathBuf;
use tracing::info;

/// Plain-text summary of a run
#[derive(Debug)]
pub struct BacktestReport<'a> {
    output: &'a BacktestOutput,
}

impl<'a> BacktestReport<'a> {
    /// Create new report from output
    pub fn new(output: &'a BacktestOutput) -> Self {
        Self { output }
    }

    /// Format report as string
    pub fn format(&self) -> String {
        let out = self.output;
        let net = out.final_equity - out.initial_cash;
        let winners = out.trades.iter().filter(|t| t.pnl > 0.0).count();
        format!(
            r#"
Backtest Results: {}
================
Starting Cash: ${:.2}
Final Equity: ${:.2}
Net Change: ${:.2}
Bars Replayed: {}
Signals Executed: {} ({} rejected)
Closed Trades: {} ({} winners)
"#,
            out.strategy_id,
            out.initial_cash,
            out.final_equity,
            net,
            out.bars_replayed,
            out.signals_executed,
            out.signals_rejected,
            out.trades.len(),
            winners,
        )
    }
}

/// Logs the formatted report
#[derive(Debug, Default)]
pub struct LogSink;

impl AnalyticsSink for LogSink {
    fn consume(&mut self, output: &BacktestOutput) -> anyhow::Result<()> {
        info!("{}", BacktestReport::new(output).format());
        Ok(())
    }
}

/// Writes the raw output as JSON for external analytics
#[derive(Debug)]
pub struct JsonFileSink {
    path: PathBuf,
}

impl JsonFileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl AnalyticsSink for JsonFileSink {
    fn consume(&mut self, output: &BacktestOutput) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, serde_json::to_vec_pretty(output)?)?;
        info!(path = %self.path.display(), "backtest output written");
        Ok(())
    }
}
