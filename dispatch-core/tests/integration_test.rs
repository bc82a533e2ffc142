//! Integration tests for the dispatch engine

use async_trait::async_trait;
use dispatch_core::prelude::*;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

const TF: i64 = 60_000;
/// Fixed "now": 10s into bucket 1000
const NOW: i64 = 1_000 * TF + 10_000;

/// History provider serving `depth` bars per symbol, ending at the last closed
/// bucket before NOW. Symbols starting with "EMPTY" have no history.
struct FakeProvider {
    depth: usize,
}

#[async_trait]
impl HistoricalDataProvider for FakeProvider {
    async fn fetch_history(&self, request: &HistoryRequest) -> anyhow::Result<Vec<Bar>> {
        if request.symbol.starts_with("EMPTY") {
            return Ok(Vec::new());
        }
        let last_closed = (NOW / TF - 1) * TF;
        Ok((0..self.depth as i64)
            .rev()
            .map(|i| Bar::flat(last_closed - i * TF, 100.0))
            .collect())
    }
}

/// Serves `depth` bars like `FakeProvider`. When gated, each fetch signals
/// `entered` and then waits for `release`.
struct GatedProvider {
    depth: AtomicUsize,
    gated: bool,
    entered: Notify,
    release: Notify,
}

impl GatedProvider {
    fn new(depth: usize, gated: bool) -> Self {
        Self {
            depth: AtomicUsize::new(depth),
            gated,
            entered: Notify::new(),
            release: Notify::new(),
        }
    }
}

#[async_trait]
impl HistoricalDataProvider for GatedProvider {
    async fn fetch_history(&self, request: &HistoryRequest) -> anyhow::Result<Vec<Bar>> {
        if self.gated {
            self.entered.notify_one();
            self.release.notified().await;
        }
        let depth = self.depth.load(Ordering::SeqCst);
        FakeProvider { depth }.fetch_history(request).await
    }
}

#[derive(Default)]
struct FakeSource {
    fail_connect: bool,
    connects: AtomicUsize,
    symbol_updates: Mutex<Vec<Vec<String>>>,
}

impl FakeSource {
    fn last_symbols(&self) -> Vec<String> {
        self.symbol_updates
            .lock()
            .unwrap()
            .last()
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl MarketDataSource for FakeSource {
    async fn update_symbols(&self, symbols: &[String]) -> anyhow::Result<()> {
        self.symbol_updates.lock().unwrap().push(symbols.to_vec());
        Ok(())
    }

    async fn connect(&self) -> anyhow::Result<()> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.fail_connect {
            anyhow::bail!("connection refused");
        }
        Ok(())
    }

    async fn cleanup(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Counts hook calls and never trades
#[derive(Clone, Default)]
struct Recorder {
    ticks: Arc<AtomicUsize>,
}

impl Strategy for Recorder {
    fn name(&self) -> &str {
        "RECORDER"
    }

    fn on_tick(&mut self, _tick: &Tick) -> anyhow::Result<Option<StrategySignal>> {
        self.ticks.fetch_add(1, Ordering::SeqCst);
        Ok(None)
    }

    fn on_bar(&mut self, _ctx: &BarContext<'_>) -> anyhow::Result<Option<StrategySignal>> {
        Ok(None)
    }
}

/// Panics on every live tick
struct Panicker;

impl Strategy for Panicker {
    fn name(&self) -> &str {
        "PANICKER"
    }

    fn on_tick(&mut self, _tick: &Tick) -> anyhow::Result<Option<StrategySignal>> {
        panic!("boom");
    }

    fn on_bar(&mut self, _ctx: &BarContext<'_>) -> anyhow::Result<Option<StrategySignal>> {
        Ok(None)
    }
}

/// Enters long whenever a live bar closes
struct Buyer;

impl Strategy for Buyer {
    fn name(&self) -> &str {
        "BUYER"
    }

    fn on_bar(&mut self, _ctx: &BarContext<'_>) -> anyhow::Result<Option<StrategySignal>> {
        Ok(Some(StrategySignal::enter_long()))
    }
}

fn unit(id: &str, symbols: &[&str], lookback: usize, logic: Box<dyn Strategy>) -> StrategyUnit {
    StrategyUnit::new(
        id,
        symbols.iter().map(|s| s.to_string()).collect(),
        Timeframe::minutes(1),
        lookback,
        logic,
    )
}

fn config() -> EngineConfig {
    EngineConfig {
        max_data_history: 200,
        cache_dir: std::env::temp_dir().join(format!("dispatch-it-{}", uuid::Uuid::new_v4())),
        reconnect: ReconnectConfig {
            base_delay_ms: 1,
            max_delay_ms: 2,
            max_attempts: 2,
        },
        ..EngineConfig::default()
    }
}

fn engine_with(depth: usize, source: Arc<FakeSource>) -> (Engine, Arc<PaperBroker>) {
    engine_from(Arc::new(FakeProvider { depth }), source)
}

fn engine_from(
    provider: Arc<dyn HistoricalDataProvider>,
    source: Arc<FakeSource>,
) -> (Engine, Arc<PaperBroker>) {
    let config = config();
    let broker = Arc::new(PaperBroker::new(config.initial_cash));
    let adapter = Arc::new(SignalAdapter::paper(broker.clone(), 1.0));
    let engine = Engine::new(config, source, provider, adapter).with_clock(|| NOW);
    (engine, broker)
}

fn tick(symbol: &str, time: i64, price: f64) -> Tick {
    Tick::new(symbol, time, price, 1.0)
}

#[tokio::test]
async fn test_warmup_keeps_most_recent_lookback() {
    let source = Arc::new(FakeSource::default());
    let (engine, _) = engine_with(100, source.clone());
    assert!(!engine.is_warmed_up("btc", "BTC/USDT").await);

    engine
        .register_strategy(unit("btc", &["BTC/USDT"], 50, Box::new(Recorder::default())))
        .await
        .unwrap();

    assert_eq!(engine.status("btc"), LifecycleState::Active);
    assert!(engine.is_warmed_up("btc", "BTC/USDT").await);

    let window = engine.lookback_window("btc", "BTC/USDT").await;
    assert_eq!(window.len(), 50);
    assert_eq!(window.last().unwrap().time, 999 * TF);
    assert_eq!(window.first().unwrap().time, 950 * TF);

    let states: Vec<LifecycleState> = engine
        .lifecycle_history("btc")
        .iter()
        .map(|r| r.state)
        .collect();
    assert_eq!(states, vec![LifecycleState::WarmingUp, LifecycleState::Active]);
    assert_eq!(source.last_symbols(), vec!["BTC/USDT".to_string()]);
}

#[tokio::test]
async fn test_only_active_subscribers_receive_ticks() {
    let source = Arc::new(FakeSource::default());
    let (engine, _) = engine_with(20, source);

    let healthy = Recorder::default();
    let broken = Recorder::default();
    engine
        .register_strategy(unit("healthy", &["ETH"], 10, Box::new(healthy.clone())))
        .await
        .unwrap();
    let err = engine
        .register_strategy(unit("broken", &["ETH", "EMPTY-1"], 10, Box::new(broken.clone())))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::WarmupFailed { .. }));
    assert_eq!(engine.status("broken"), LifecycleState::Error);

    // Failed units keep their subscriptions for a retry.
    assert_eq!(engine.subscribers("ETH").await, vec!["broken", "healthy"]);

    engine.start().await.unwrap();
    assert_eq!(engine.distribute(&tick("ETH", NOW, 101.0)).await, 1);
    assert_eq!(healthy.ticks.load(Ordering::SeqCst), 1);
    assert_eq!(broken.ticks.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_fault_is_isolated_to_one_strategy() {
    let source = Arc::new(FakeSource::default());
    let (engine, _) = engine_with(20, source);
    let mut events = engine.subscribe_events();

    let survivor = Recorder::default();
    engine
        .register_strategy(unit("bad", &["SOL"], 10, Box::new(Panicker)))
        .await
        .unwrap();
    engine
        .register_strategy(unit("good", &["SOL"], 10, Box::new(survivor.clone())))
        .await
        .unwrap();
    engine.start().await.unwrap();

    assert_eq!(engine.distribute(&tick("SOL", NOW, 100.0)).await, 1);
    assert_eq!(engine.status("bad"), LifecycleState::Error);
    assert_eq!(engine.status("good"), LifecycleState::Active);

    // Later ticks keep flowing to the healthy unit.
    assert_eq!(engine.distribute(&tick("SOL", NOW + 1_000, 100.5)).await, 1);
    assert_eq!(survivor.ticks.load(Ordering::SeqCst), 2);

    let mut faulted = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let EngineEvent::StrategyFaulted { strategy_id, error } = event {
            faulted.push((strategy_id, error));
        }
    }
    assert_eq!(faulted.len(), 1);
    assert_eq!(faulted[0].0, "bad");
    assert!(faulted[0].1.contains("boom"));
}

#[tokio::test]
async fn test_distribute_is_noop_unless_running() {
    let source = Arc::new(FakeSource::default());
    let (engine, _) = engine_with(20, source);
    let recorder = Recorder::default();
    engine
        .register_strategy(unit("r", &["ADA"], 5, Box::new(recorder.clone())))
        .await
        .unwrap();

    assert_eq!(engine.distribute(&tick("ADA", NOW, 1.0)).await, 0);
    engine.start().await.unwrap();
    assert_eq!(engine.distribute(&tick("ADA", NOW, 1.0)).await, 1);
    engine.stop().await.unwrap();
    assert_eq!(engine.engine_status().await, EngineStatus::Idle);
    assert!(engine.list_active_symbols().await.is_empty());
    assert_eq!(engine.distribute(&tick("ADA", NOW, 1.0)).await, 0);
    assert_eq!(recorder.ticks.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_register_validation() {
    let source = Arc::new(FakeSource::default());
    let (engine, _) = engine_with(20, source);

    let err = engine
        .register_strategy(unit("nosym", &[], 5, Box::new(Recorder::default())))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));

    let err = engine
        .register_strategy(unit("deep", &["X"], 500, Box::new(Recorder::default())))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));

    engine
        .register_strategy(unit("dup", &["X"], 5, Box::new(Recorder::default())))
        .await
        .unwrap();
    let err = engine
        .register_strategy(unit("dup", &["X"], 5, Box::new(Recorder::default())))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::TransitionRejected {
            from: LifecycleState::Active,
            to: LifecycleState::WarmingUp,
            ..
        }
    ));
}

#[tokio::test]
async fn test_unregister_drops_exclusive_symbols() {
    let source = Arc::new(FakeSource::default());
    let (engine, _) = engine_with(20, source.clone());

    engine
        .register_strategy(unit("a", &["S1", "S2"], 5, Box::new(Recorder::default())))
        .await
        .unwrap();
    engine
        .register_strategy(unit("b", &["S2"], 5, Box::new(Recorder::default())))
        .await
        .unwrap();
    assert_eq!(engine.list_active_symbols().await, vec!["S1", "S2"]);

    engine.unregister_strategy("a").await.unwrap();
    assert_eq!(engine.status("a"), LifecycleState::Offline);
    assert_eq!(engine.list_active_symbols().await, vec!["S2"]);
    assert_eq!(source.last_symbols(), vec!["S2".to_string()]);

    let tail: Vec<LifecycleState> = engine
        .lifecycle_history("a")
        .iter()
        .rev()
        .take(2)
        .map(|r| r.state)
        .collect();
    assert_eq!(tail, vec![LifecycleState::Offline, LifecycleState::Stopping]);

    assert!(matches!(
        engine.unregister_strategy("never").await,
        Err(EngineError::UnknownStrategy(_))
    ));
}

#[tokio::test]
async fn test_pause_and_resume_gate_delivery() {
    let source = Arc::new(FakeSource::default());
    let (engine, _) = engine_with(20, source);
    let recorder = Recorder::default();
    engine
        .register_strategy(unit("p", &["DOT"], 5, Box::new(recorder.clone())))
        .await
        .unwrap();
    engine.start().await.unwrap();

    engine.pause("p").await.unwrap();
    assert_eq!(engine.distribute(&tick("DOT", NOW, 5.0)).await, 0);
    assert!(engine.pause("p").await.is_err());

    engine.resume("p").await.unwrap();
    assert_eq!(engine.distribute(&tick("DOT", NOW + 1, 5.0)).await, 1);
    assert_eq!(recorder.ticks.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_closed_bar_signal_reaches_paper_broker() {
    let source = Arc::new(FakeSource::default());
    let (engine, broker) = engine_with(20, source);
    let mut events = engine.subscribe_events();

    engine
        .register_strategy(unit("buyer", &["BTC"], 5, Box::new(Buyer)))
        .await
        .unwrap();
    engine.start().await.unwrap();

    // Warmup signals are suppressed.
    assert!(broker.position("BTC").is_none());

    engine.distribute(&tick("BTC", NOW, 100.0)).await;
    engine.distribute(&tick("BTC", NOW + TF, 101.0)).await;

    let position = broker.position("BTC").unwrap();
    assert_eq!(position.quantity, 1.0);
    assert_eq!(position.avg_entry_price, 101.0);

    let handled = std::iter::from_fn(|| events.try_recv().ok())
        .filter(|e| matches!(e, EngineEvent::SignalHandled { .. }))
        .count();
    assert_eq!(handled, 1);
}

#[tokio::test]
async fn test_stage_then_start() {
    let source = Arc::new(FakeSource::default());
    let (engine, _) = engine_with(20, source);

    engine
        .stage_strategy(unit("st", &["XRP"], 5, Box::new(Recorder::default())))
        .await
        .unwrap();
    assert_eq!(engine.status("st"), LifecycleState::Staged);
    assert!(engine.list_active_symbols().await.is_empty());

    engine.start_strategy("st").await.unwrap();
    assert_eq!(engine.status("st"), LifecycleState::Active);
    assert_eq!(engine.list_active_symbols().await, vec!["XRP"]);

    assert!(matches!(
        engine.start_strategy("st").await,
        Err(EngineError::UnknownStrategy(_))
    ));
}

#[tokio::test]
async fn test_update_params_and_reload_keep_state() {
    let source = Arc::new(FakeSource::default());
    let (engine, _) = engine_with(60, source);
    let registry = StrategyRegistry::new();

    let definition: StrategyDefinition = serde_json::from_value(json!({
        "id": "cross",
        "strategy_type": "SMA_CROSS",
        "symbols": ["LTC"],
        "timeframe": "1m",
        "lookback": 40,
        "params": { "fast": 5, "slow": 20 }
    }))
    .unwrap();
    engine
        .register_strategy(registry.build_unit(definition).unwrap())
        .await
        .unwrap();

    let err = engine
        .update_params("cross", json!({ "fast": 0 }))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));
    engine
        .update_params("cross", json!({ "fast": 3, "slow": 9 }))
        .await
        .unwrap();

    engine
        .reload_strategy("cross", registry.create_strategy("SMA_CROSS", &json!({})).unwrap())
        .await
        .unwrap();
    assert_eq!(engine.status("cross"), LifecycleState::Active);
    assert_eq!(engine.lookback_window("cross", "LTC").await.len(), 40);

    assert!(matches!(
        engine
            .reload_strategy("ghost", Box::new(Recorder::default()))
            .await,
        Err(EngineError::UnknownStrategy(_))
    ));
}

#[tokio::test]
async fn test_start_gives_up_after_reconnect_budget() {
    let source = Arc::new(FakeSource {
        fail_connect: true,
        ..FakeSource::default()
    });
    let (engine, _) = engine_with(20, source.clone());
    let mut events = engine.subscribe_events();

    let err = engine.start().await.unwrap_err();
    assert!(matches!(err, EngineError::BrokerUnavailable(_)));
    assert_eq!(source.connects.load(Ordering::SeqCst), 2);
    assert_eq!(engine.engine_status().await, EngineStatus::Idle);
    assert!(matches!(
        events.try_recv().unwrap(),
        EngineEvent::ConnectionLost { attempts: 2, .. }
    ));
}

#[tokio::test]
async fn test_longer_lookback_does_not_reuse_short_cache() {
    let source = Arc::new(FakeSource::default());
    let (engine, _) = engine_with(100, source);

    engine
        .register_strategy(unit("short", &["BTC"], 10, Box::new(Recorder::default())))
        .await
        .unwrap();
    engine
        .register_strategy(unit("long", &["BTC"], 50, Box::new(Recorder::default())))
        .await
        .unwrap();

    assert_eq!(engine.status("long"), LifecycleState::Active);
    assert!(engine.is_warmed_up("long", "BTC").await);
    let window = engine.lookback_window("long", "BTC").await;
    assert_eq!(window.len(), 50);
    assert_eq!(window.last().unwrap().time, 999 * TF);
    assert_eq!(engine.lookback_window("short", "BTC").await.len(), 10);
}

#[tokio::test]
async fn test_register_while_warming_up_is_rejected() {
    let provider = Arc::new(GatedProvider::new(20, true));
    let (engine, _) = engine_from(provider.clone(), Arc::new(FakeSource::default()));
    let engine = Arc::new(engine);

    let first = tokio::spawn({
        let engine = engine.clone();
        async move {
            engine
                .register_strategy(unit("slow", &["BNB"], 5, Box::new(Recorder::default())))
                .await
        }
    });
    provider.entered.notified().await;
    assert_eq!(engine.status("slow"), LifecycleState::WarmingUp);

    let err = engine
        .register_strategy(unit("slow", &["BNB"], 5, Box::new(Recorder::default())))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::TransitionRejected {
            from: LifecycleState::WarmingUp,
            to: LifecycleState::WarmingUp,
            ..
        }
    ));

    provider.release.notify_one();
    first.await.unwrap().unwrap();
    assert_eq!(engine.status("slow"), LifecycleState::Active);
    assert_eq!(engine.subscribers("BNB").await, vec!["slow"]);
}

#[tokio::test]
async fn test_unregister_during_warmup_wins() {
    let provider = Arc::new(GatedProvider::new(20, true));
    let source = Arc::new(FakeSource::default());
    let (engine, _) = engine_from(provider.clone(), source.clone());
    let engine = Arc::new(engine);

    let pending = tokio::spawn({
        let engine = engine.clone();
        async move {
            engine
                .register_strategy(unit("gone", &["AVAX"], 5, Box::new(Recorder::default())))
                .await
        }
    });
    provider.entered.notified().await;
    assert_eq!(engine.subscribers("AVAX").await, vec!["gone"]);

    engine.unregister_strategy("gone").await.unwrap();
    assert_eq!(engine.status("gone"), LifecycleState::Offline);

    provider.release.notify_one();
    let err = pending.await.unwrap().unwrap_err();
    assert!(matches!(err, EngineError::WarmupFailed { .. }));

    assert_eq!(engine.status("gone"), LifecycleState::Offline);
    assert!(engine.subscribers("AVAX").await.is_empty());
    assert!(engine.list_active_symbols().await.is_empty());
    assert!(engine.lookback_window("gone", "AVAX").await.is_empty());
    assert!(source.last_symbols().is_empty());
}

#[tokio::test]
async fn test_retry_from_error_reaches_active() {
    let provider = Arc::new(GatedProvider::new(0, false));
    let (engine, _) = engine_from(provider.clone(), Arc::new(FakeSource::default()));

    let err = engine
        .register_strategy(unit("retry", &["LINK"], 5, Box::new(Recorder::default())))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::WarmupFailed { .. }));
    assert_eq!(engine.status("retry"), LifecycleState::Error);
    assert_eq!(engine.subscribers("LINK").await, vec!["retry"]);

    provider.depth.store(20, Ordering::SeqCst);
    engine
        .register_strategy(unit("retry", &["LINK"], 5, Box::new(Recorder::default())))
        .await
        .unwrap();

    assert_eq!(engine.status("retry"), LifecycleState::Active);
    assert_eq!(engine.subscribers("LINK").await, vec!["retry"]);
    assert_eq!(engine.lookback_window("retry", "LINK").await.len(), 5);

    let states: Vec<LifecycleState> = engine
        .lifecycle_history("retry")
        .iter()
        .map(|r| r.state)
        .collect();
    assert_eq!(
        states,
        vec![
            LifecycleState::WarmingUp,
            LifecycleState::Error,
            LifecycleState::WarmingUp,
            LifecycleState::Active,
        ]
    );
}
