use anyhow::{bail, Result};
use dispatch_core::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod feeds;
mod settings;

use feeds::{JsonHistoryProvider, ReplaySource};
use settings::{load_definitions, NodeSettings};

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("DISPATCH_LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json"));
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn build_info() -> String {
    let git_hash = option_env!("GIT_HASH").unwrap_or("unknown");
    let git_branch = option_env!("GIT_BRANCH").unwrap_or("unknown");
    let build_time_raw = option_env!("BUILD_TIME").unwrap_or("unknown");
    let build_time = build_time_raw
        .parse::<i64>()
        .ok()
        .and_then(|epoch| chrono::DateTime::from_timestamp(epoch, 0))
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| build_time_raw.to_string());
    format!(
        "{} ({}@{}, built {})",
        env!("CARGO_PKG_VERSION"),
        git_branch,
        git_hash,
        build_time
    )
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    dotenv::dotenv().ok();
    init_tracing();

    info!(build = %build_info(), "Starting dispatch node...");

    let config = EngineConfig::from_env()?;
    let settings = NodeSettings::from_env();
    let registry = StrategyRegistry::new();
    let definitions = load_definitions(&settings.strategies_file)?;
    info!(
        mode = %config.mode,
        strategies = definitions.len(),
        available = ?registry.get_available_strategies(),
        "Configuration loaded"
    );

    match config.mode {
        ExecutionMode::Backtest => run_backtest(&config, &settings, &registry, definitions).await,
        ExecutionMode::Paper => run_paper(config, &settings, &registry, definitions).await,
        ExecutionMode::Live => {
            bail!("live mode needs a broker integration; this node only ships paper and backtest")
        }
    }
}

/// Replay each definition over its full file history
async fn run_backtest(
    config: &EngineConfig,
    settings: &NodeSettings,
    registry: &StrategyRegistry,
    definitions: Vec<StrategyDefinition>,
) -> Result<()> {
    let runner = BacktestRunner::from_config(config);
    let provider = JsonHistoryProvider::new(&settings.history_dir);

    for definition in definitions {
        let id = definition.id.clone();
        let mut history = HashMap::new();
        for symbol in &definition.symbols {
            let request = HistoryRequest {
                symbol: symbol.clone(),
                interval: definition.timeframe,
                outputsize: usize::MAX,
            };
            history.insert(symbol.clone(), provider.fetch_history(&request).await?);
        }

        let unit = registry.build_unit(definition)?;
        let mut sink: Box<dyn AnalyticsSink> = match &settings.report_dir {
            Some(dir) => Box::new(JsonFileSink::new(dir.join(format!("{id}.json")))),
            None => Box::new(LogSink),
        };
        match runner.run_with_sink(unit, &history, sink.as_mut()) {
            Ok(output) => info!(
                strategy_id = %id,
                final_equity = output.final_equity,
                trades = output.trades.len(),
                "📊 Backtest complete"
            ),
            Err(e) => error!(strategy_id = %id, error = %e, "backtest failed"),
        }
    }
    Ok(())
}

/// Run the engine against recorded ticks with a paper broker
async fn run_paper(
    config: EngineConfig,
    settings: &NodeSettings,
    registry: &StrategyRegistry,
    definitions: Vec<StrategyDefinition>,
) -> Result<()> {
    let source = Arc::new(ReplaySource::new(&settings.ticks_file));
    let provider = Arc::new(JsonHistoryProvider::new(&settings.history_dir));
    let broker = Arc::new(PaperBroker::new(config.initial_cash));
    let adapter = Arc::new(SignalAdapter::from_config(
        ExecutionRoute::Paper(broker.clone()),
        &config,
    ));
    let engine = Engine::new(config, source.clone(), provider, adapter);

    let mut events = engine.subscribe_events();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(json) => info!(event = %json, "engine event"),
                    Err(e) => warn!(error = %e, "unserializable engine event"),
                },
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "event log lagging"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    for definition in definitions {
        let id = definition.id.clone();
        let registered = match registry.build_unit(definition) {
            Ok(unit) => engine.register_strategy(unit).await,
            Err(e) => Err(e),
        };
        if let Err(e) = registered {
            error!(strategy_id = %id, error = %e, "strategy not started");
        }
    }

    engine.start().await?;
    let ticks = source.ticks().await?;
    let delivered = engine.consume(ticks).await;
    engine.stop().await?;

    info!(
        delivered,
        equity = broker.equity(),
        cash = broker.cash(),
        realized_pnl = broker.realized_pnl(),
        "Replay finished"
    );
    for position in broker.positions() {
        info!(
            symbol = %position.symbol,
            side = ?position.side,
            quantity = position.quantity,
            entry = position.avg_entry_price,
            "open position"
        );
    }
    Ok(())
}
