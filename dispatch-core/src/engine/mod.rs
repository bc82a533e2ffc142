//! Dispatcher: subscriptions, fan-out and strategy orchestration
//!
//! The engine owns the symbol -> unit subscription map and is the only place
//! where units are registered, warmed up, paused or removed. Ticks reach a
//! unit only while the lifecycle controller reports it ACTIVE.

use crate::config::EngineConfig;
use crate::data::{AggregationReport, Bar, BarCache, Tick};
use crate::error::EngineError;
use crate::events::{EngineEvent, EventBus};
use crate::execution::SignalAdapter;
use crate::feed::{connect_with_retry, HistoricalDataProvider, MarketDataSource, ReconnectPolicy};
use crate::lifecycle::{LifecycleController, LifecycleState, TransitionRecord};
use crate::strategy::{guarded, validate_params, Signal, Strategy, StrategyUnit, UnitRuntime};
use crate::warmup::WarmupCacheManager;
use crate::Result;
use futures::{Stream, StreamExt};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EngineStatus {
    Idle,
    Running,
    Stopping,
}

type UnitHandle = Arc<Mutex<UnitRuntime>>;

/// Strategy dispatch and lifecycle engine
pub struct Engine {
    config: EngineConfig,
    source: Arc<dyn MarketDataSource>,
    adapter: Arc<SignalAdapter>,
    warmup: WarmupCacheManager,
    lifecycle: LifecycleController,
    events: EventBus,
    reconnect: ReconnectPolicy,
    status: RwLock<EngineStatus>,
    /// Registered units (ACTIVE, PAUSED, ERROR, or mid-warmup)
    units: RwLock<HashMap<String, UnitHandle>>,
    /// Units parked in STAGED, not yet warmed up
    staged: Mutex<HashMap<String, StrategyUnit>>,
    /// symbol -> subscribed unit ids
    subscriptions: RwLock<BTreeMap<String, BTreeSet<String>>>,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        source: Arc<dyn MarketDataSource>,
        provider: Arc<dyn HistoricalDataProvider>,
        adapter: Arc<SignalAdapter>,
    ) -> Self {
        let events = EventBus::new(config.event_capacity);
        let lifecycle =
            LifecycleController::new(config.lifecycle_history_limit).with_events(events.clone());
        let warmup = WarmupCacheManager::new(provider, BarCache::new(config.cache_dir.clone()));
        let reconnect = ReconnectPolicy::from(&config.reconnect);

        Self {
            config,
            source,
            adapter,
            warmup,
            lifecycle,
            events,
            reconnect,
            status: RwLock::new(EngineStatus::Idle),
            units: RwLock::new(HashMap::new()),
            staged: Mutex::new(HashMap::new()),
            subscriptions: RwLock::new(BTreeMap::new()),
        }
    }

    /// Replace the wall clock used for cache freshness decisions
    pub fn with_clock(mut self, clock: impl Fn() -> i64 + Send + Sync + 'static) -> Self {
        self.warmup = self.warmup.with_clock(clock);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn adapter(&self) -> &Arc<SignalAdapter> {
        &self.adapter
    }

    pub fn lifecycle(&self) -> &LifecycleController {
        &self.lifecycle
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub async fn engine_status(&self) -> EngineStatus {
        *self.status.read().await
    }

    // ----- engine lifecycle -----

    /// Mark the engine RUNNING and connect the market data source
    pub async fn start(&self) -> Result<()> {
        *self.status.write().await = EngineStatus::Running;
        let connected = async {
            self.sync_source().await?;
            connect_with_retry(self.source.as_ref(), &self.reconnect, &self.events).await
        }
        .await;

        match connected {
            Ok(attempts) => {
                info!(attempts, "🚀 Engine running");
                Ok(())
            }
            Err(e) => {
                *self.status.write().await = EngineStatus::Idle;
                Err(e)
            }
        }
    }

    /// Disconnect the source and drop every subscription
    pub async fn stop(&self) -> Result<()> {
        *self.status.write().await = EngineStatus::Stopping;
        if let Err(e) = self.source.cleanup().await {
            warn!(error = %e, "market data cleanup failed");
        }
        self.subscriptions.write().await.clear();
        *self.status.write().await = EngineStatus::Idle;
        info!("🛑 Engine stopped");
        Ok(())
    }

    // ----- registration -----

    /// Validate, warm up and activate a unit.
    ///
    /// A unit that is already warming up is rejected. A failed warmup leaves
    /// the unit in ERROR with its subscriptions in place.
    pub async fn register_strategy(&self, unit: StrategyUnit) -> Result<()> {
        let id = unit.id.clone();
        if let Err(e) = unit.validate(self.config.max_data_history) {
            self.lifecycle
                .commit(&id, LifecycleState::Error, json!({ "reason": e.to_string() }));
            return Err(e);
        }

        self.lifecycle.advance(
            &id,
            LifecycleState::WarmingUp,
            json!({ "symbols": unit.symbols, "timeframe": unit.timeframe }),
        )?;

        let mut runtime = match UnitRuntime::new(unit, self.config.max_data_history) {
            Ok(runtime) => runtime,
            Err(e) => {
                self.lifecycle
                    .commit(&id, LifecycleState::Error, json!({ "reason": e.to_string() }));
                return Err(e);
            }
        };
        self.staged.lock().await.remove(&id);

        let symbols = runtime.symbols().to_vec();
        self.unsubscribe(&id).await;
        self.subscribe(&id, &symbols).await;
        info!(strategy_id = %id, strategy = runtime.strategy_name(), ?symbols, "Warming up strategy");

        let warmed = self.warmup.warm_up(&mut runtime).await;

        if self.lifecycle.status(&id) != LifecycleState::WarmingUp {
            // Unregistered while history was loading.
            self.unsubscribe(&id).await;
            return Err(EngineError::WarmupFailed {
                id,
                reason: "unit left WARMING_UP during warmup".to_string(),
            });
        }
        self.units
            .write()
            .await
            .insert(id.clone(), Arc::new(Mutex::new(runtime)));

        match warmed {
            Ok(bars) => {
                self.lifecycle
                    .commit(&id, LifecycleState::Active, json!({ "bars": bars }));
                self.events.publish(EngineEvent::WarmupCompleted {
                    strategy_id: id.clone(),
                    symbols,
                    bars,
                });
                info!(strategy_id = %id, bars, "✅ Strategy active");

                self.sync_source().await?;
                if self.engine_status().await == EngineStatus::Running {
                    connect_with_retry(self.source.as_ref(), &self.reconnect, &self.events).await?;
                }
                Ok(())
            }
            Err(e) => {
                error!(strategy_id = %id, error = %e, "warmup failed");
                self.lifecycle
                    .commit(&id, LifecycleState::Error, json!({ "reason": e.to_string() }));
                Err(e)
            }
        }
    }

    /// Remove a unit and the symbols only it was subscribed to
    pub async fn unregister_strategy(&self, id: &str) -> Result<()> {
        let known = self.units.read().await.contains_key(id)
            || self.staged.lock().await.contains_key(id)
            || self.lifecycle.status(id) != LifecycleState::Offline;
        if !known {
            return Err(EngineError::UnknownStrategy(id.to_string()));
        }

        if self.lifecycle.status(id).can_transition_to(LifecycleState::Stopping) {
            self.lifecycle
                .commit(id, LifecycleState::Stopping, json!({ "reason": "unregister" }));
        }

        self.units.write().await.remove(id);
        self.staged.lock().await.remove(id);
        self.unsubscribe(id).await;
        self.lifecycle
            .commit(id, LifecycleState::Offline, json!({ "reason": "unregistered" }));
        info!(strategy_id = id, "Strategy unregistered");

        self.sync_source().await
    }

    /// Park a unit in STAGED without touching market data
    pub async fn stage_strategy(&self, unit: StrategyUnit) -> Result<()> {
        unit.validate(self.config.max_data_history)?;
        validate_params(&unit.logic.param_schema(), &unit.params)?;
        self.lifecycle
            .advance(&unit.id, LifecycleState::Staged, json!({ "symbols": unit.symbols }))?;
        info!(strategy_id = %unit.id, "Strategy staged");
        self.staged.lock().await.insert(unit.id.clone(), unit);
        Ok(())
    }

    /// Warm up and activate a staged unit
    pub async fn start_strategy(&self, id: &str) -> Result<()> {
        let unit = self
            .staged
            .lock()
            .await
            .remove(id)
            .ok_or_else(|| EngineError::UnknownStrategy(id.to_string()))?;
        self.register_strategy(unit).await
    }

    // ----- runtime control -----

    pub async fn pause(&self, id: &str) -> Result<()> {
        self.require_state(id, LifecycleState::Active, LifecycleState::Paused)?;
        self.lifecycle
            .advance(id, LifecycleState::Paused, json!({ "reason": "pause" }))?;
        Ok(())
    }

    pub async fn resume(&self, id: &str) -> Result<()> {
        self.require_state(id, LifecycleState::Paused, LifecycleState::Active)?;
        self.lifecycle
            .advance(id, LifecycleState::Active, json!({ "reason": "resume" }))?;
        Ok(())
    }

    fn require_state(&self, id: &str, expected: LifecycleState, to: LifecycleState) -> Result<()> {
        let from = self.lifecycle.status(id);
        if from != expected {
            return Err(EngineError::TransitionRejected {
                id: id.to_string(),
                from,
                to,
            });
        }
        Ok(())
    }

    /// Validate and apply parameters in any lifecycle state
    pub async fn update_params(&self, id: &str, params: Value) -> Result<()> {
        if let Some(unit) = self.unit(id).await {
            unit.lock().await.update_params(&params)?;
        } else {
            let mut staged = self.staged.lock().await;
            let unit = staged
                .get_mut(id)
                .ok_or_else(|| EngineError::UnknownStrategy(id.to_string()))?;
            unit.params = validate_params(&unit.logic.param_schema(), &params)?;
        }
        info!(strategy_id = id, %params, "Parameters updated");
        Ok(())
    }

    /// Swap a unit's logic in place; lifecycle state, bar history and
    /// positions are untouched
    pub async fn reload_strategy(&self, id: &str, logic: Box<dyn Strategy>) -> Result<()> {
        let name = logic.name().to_string();
        if let Some(unit) = self.unit(id).await {
            unit.lock().await.replace_logic(logic)?;
        } else {
            let mut staged = self.staged.lock().await;
            let unit = staged
                .get_mut(id)
                .ok_or_else(|| EngineError::UnknownStrategy(id.to_string()))?;
            unit.params = validate_params(&logic.param_schema(), &unit.params)?;
            unit.logic = logic;
        }
        info!(strategy_id = id, strategy = %name, "🔄 Strategy reloaded");
        Ok(())
    }

    // ----- queries -----

    pub fn status(&self, id: &str) -> LifecycleState {
        self.lifecycle.status(id)
    }

    pub fn lifecycle_history(&self, id: &str) -> Vec<TransitionRecord> {
        self.lifecycle.history(id)
    }

    /// Symbols with at least one subscriber, sorted
    pub async fn list_active_symbols(&self) -> Vec<String> {
        self.subscriptions.read().await.keys().cloned().collect()
    }

    pub async fn subscribers(&self, symbol: &str) -> Vec<String> {
        self.subscriptions
            .read()
            .await
            .get(symbol)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn is_warmed_up(&self, id: &str, symbol: &str) -> bool {
        match self.unit(id).await {
            Some(unit) => unit.lock().await.is_warmed_up(symbol),
            None => false,
        }
    }

    pub async fn lookback_window(&self, id: &str, symbol: &str) -> Vec<Bar> {
        match self.unit(id).await {
            Some(unit) => unit.lock().await.lookback_window(symbol),
            None => Vec::new(),
        }
    }

    pub async fn aggregation_report(&self, id: &str, symbol: &str) -> AggregationReport {
        match self.unit(id).await {
            Some(unit) => unit.lock().await.report(symbol),
            None => AggregationReport::default(),
        }
    }

    // ----- tick path -----

    /// Deliver a tick to every ACTIVE subscriber of its symbol.
    ///
    /// Each unit runs inside its own fault boundary: an error or panic moves
    /// that unit to ERROR and delivery continues. Returns the number of units
    /// that processed the tick successfully.
    pub async fn distribute(&self, tick: &Tick) -> usize {
        if self.engine_status().await != EngineStatus::Running {
            return 0;
        }
        if tick.is_valid() {
            self.adapter.mark(&tick.symbol, tick.price);
        }

        let mut delivered = 0;
        for id in self.subscribers(&tick.symbol).await {
            if !self.lifecycle.is_active(&id) {
                continue;
            }
            let Some(unit) = self.unit(&id).await else {
                continue;
            };

            let result = {
                let mut runtime = unit.lock().await;
                guarded(|| runtime.on_tick(tick))
            };
            match result {
                Ok(signals) => {
                    delivered += 1;
                    for signal in signals {
                        self.route(signal).await;
                    }
                }
                Err(e) => self.fault(&id, e),
            }
        }
        delivered
    }

    /// Distribute ticks until the stream ends or the engine leaves RUNNING
    pub async fn consume<S>(&self, mut ticks: S) -> usize
    where
        S: Stream<Item = Tick> + Unpin,
    {
        let mut delivered = 0;
        while let Some(tick) = ticks.next().await {
            if self.engine_status().await != EngineStatus::Running {
                break;
            }
            delivered += self.distribute(&tick).await;
        }
        delivered
    }

    fn fault(&self, id: &str, err: anyhow::Error) {
        let reason = format!("{err:#}");
        error!(strategy_id = id, %reason, "strategy faulted");
        self.lifecycle
            .commit(id, LifecycleState::Error, json!({ "reason": reason }));
        self.events.publish(EngineEvent::StrategyFaulted {
            strategy_id: id.to_string(),
            error: reason,
        });
    }

    async fn route(&self, signal: Signal) {
        if self.adapter.is_async() {
            let adapter = self.adapter.clone();
            let events = self.events.clone();
            tokio::spawn(async move { execute(&adapter, &events, signal).await });
        } else {
            execute(&self.adapter, &self.events, signal).await;
        }
    }

    // ----- internals -----

    async fn unit(&self, id: &str) -> Option<UnitHandle> {
        self.units.read().await.get(id).cloned()
    }

    async fn subscribe(&self, id: &str, symbols: &[String]) {
        let mut subscriptions = self.subscriptions.write().await;
        for symbol in symbols {
            subscriptions
                .entry(symbol.clone())
                .or_default()
                .insert(id.to_string());
        }
    }

    async fn unsubscribe(&self, id: &str) {
        self.subscriptions.write().await.retain(|_, ids| {
            ids.remove(id);
            !ids.is_empty()
        });
    }

    async fn sync_source(&self) -> Result<()> {
        let symbols = self.list_active_symbols().await;
        debug!(?symbols, "pushing symbol set to market data source");
        self.source
            .update_symbols(&symbols)
            .await
            .map_err(|e| EngineError::BrokerUnavailable(format!("{e:#}")))
    }
}

async fn execute(adapter: &SignalAdapter, events: &EventBus, signal: Signal) {
    match adapter.handle(&signal).await {
        Ok(outcome) => {
            debug!(strategy_id = %signal.strategy_id, symbol = %signal.symbol, ?outcome, "signal handled");
            events.publish(EngineEvent::SignalHandled { signal, outcome });
        }
        Err(e) => {
            warn!(strategy_id = %signal.strategy_id, symbol = %signal.symbol, error = %e, "signal execution failed");
        }
    }
}
