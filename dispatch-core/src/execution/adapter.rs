//! Signal validation, per-key locking and routing to a backend

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::execution::{
    Fill, FillAction, LiveBroker, OrderRequest, PaperBroker, SimulationContext,
};
use crate::strategy::{Side, Signal};
use crate::Result;
use serde::Serialize;
use serde_json::json;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, warn};

/// Result of a handled signal. `Locked` is not an error: the key was busy and
/// the signal was dropped.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum HandleOutcome {
    Executed(Fill),
    Locked,
}

/// Backend selected by the run mode
#[derive(Clone)]
pub enum ExecutionRoute {
    Backtest(Arc<Mutex<dyn SimulationContext>>),
    Paper(Arc<PaperBroker>),
    Live(Arc<dyn LiveBroker>),
}

impl ExecutionRoute {
    pub fn label(&self) -> &'static str {
        match self {
            ExecutionRoute::Backtest(_) => "backtest",
            ExecutionRoute::Paper(_) => "paper",
            ExecutionRoute::Live(_) => "live",
        }
    }
}

type LockKey = (String, String);

/// Releases its key when dropped, on every exit path
struct KeyGuard<'a> {
    keys: &'a Mutex<HashSet<LockKey>>,
    key: LockKey,
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        self.keys
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
    }
}

/// Routes validated signals to the configured backend with at most one call
/// in flight per (strategy, symbol)
pub struct SignalAdapter {
    route: ExecutionRoute,
    in_flight: Mutex<HashSet<LockKey>>,
    default_qty: f64,
    live_timeout: Duration,
}

impl SignalAdapter {
    pub fn new(route: ExecutionRoute, default_qty: f64) -> Self {
        Self {
            route,
            in_flight: Mutex::new(HashSet::new()),
            default_qty,
            live_timeout: Duration::from_secs(10),
        }
    }

    /// Default quantity and live timeout taken from the engine configuration
    pub fn from_config(route: ExecutionRoute, config: &EngineConfig) -> Self {
        Self::new(route, config.default_order_qty).with_live_timeout(config.live_timeout())
    }

    pub fn paper(broker: Arc<PaperBroker>, default_qty: f64) -> Self {
        Self::new(ExecutionRoute::Paper(broker), default_qty)
    }

    pub fn live(broker: Arc<dyn LiveBroker>, default_qty: f64, timeout: Duration) -> Self {
        Self::new(ExecutionRoute::Live(broker), default_qty).with_live_timeout(timeout)
    }

    pub fn backtest(context: Arc<Mutex<dyn SimulationContext>>, default_qty: f64) -> Self {
        Self::new(ExecutionRoute::Backtest(context), default_qty)
    }

    pub fn with_live_timeout(mut self, timeout: Duration) -> Self {
        self.live_timeout = timeout;
        self
    }

    pub fn live_timeout(&self) -> Duration {
        self.live_timeout
    }

    pub fn route(&self) -> &ExecutionRoute {
        &self.route
    }

    /// Live calls await the network; callers should not block tick routing on them
    pub fn is_async(&self) -> bool {
        matches!(self.route, ExecutionRoute::Live(_))
    }

    fn keys(&self) -> MutexGuard<'_, HashSet<LockKey>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn try_lock(&self, key: LockKey) -> Option<KeyGuard<'_>> {
        if !self.keys().insert(key.clone()) {
            return None;
        }
        Some(KeyGuard {
            keys: &self.in_flight,
            key,
        })
    }

    pub fn is_locked(&self, strategy_id: &str, symbol: &str) -> bool {
        self.keys()
            .contains(&(strategy_id.to_string(), symbol.to_string()))
    }

    /// Forward the latest price to backends that value positions
    pub fn mark(&self, symbol: &str, price: f64) {
        match &self.route {
            ExecutionRoute::Paper(broker) => broker.mark(symbol, price),
            ExecutionRoute::Backtest(context) => context
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .mark(symbol, price),
            ExecutionRoute::Live(_) => {}
        }
    }

    fn quantity(&self, signal: &Signal) -> f64 {
        signal.quantity.unwrap_or(self.default_qty)
    }

    /// Validate, lock `(strategy_id, symbol)` and execute. A second call for a
    /// busy key returns [`HandleOutcome::Locked`] immediately.
    pub async fn handle(&self, signal: &Signal) -> Result<HandleOutcome> {
        signal.validate()?;
        let Some(_guard) = self.try_lock(signal.lock_key()) else {
            debug!(strategy_id = %signal.strategy_id, symbol = %signal.symbol, "signal dropped, key locked");
            return Ok(HandleOutcome::Locked);
        };

        let fill = match &self.route {
            ExecutionRoute::Live(broker) => self.execute_live(broker.as_ref(), signal).await?,
            _ => self.execute_local(signal)?,
        };
        Ok(HandleOutcome::Executed(fill))
    }

    /// Unlocked path for single-threaded replay
    pub fn handle_sync(&self, signal: &Signal) -> Result<HandleOutcome> {
        signal.validate()?;
        Ok(HandleOutcome::Executed(self.execute_local(signal)?))
    }

    fn execute_local(&self, signal: &Signal) -> Result<Fill> {
        let quantity = self.quantity(signal);
        match &self.route {
            ExecutionRoute::Backtest(context) => {
                let mut context = context.lock().unwrap_or_else(PoisonError::into_inner);
                let result = if signal.is_close() {
                    context.exit(signal)
                } else {
                    context.enter(signal, quantity)
                };
                result.map_err(|e| EngineError::Execution(format!("{e:#}")))
            }
            ExecutionRoute::Paper(broker) => {
                let price = signal
                    .price
                    .or_else(|| broker.last_price(&signal.symbol))
                    .ok_or_else(|| {
                        EngineError::Execution(format!("no price available for {}", signal.symbol))
                    })?;

                if signal.is_close() {
                    let (closed, realized) = broker.close_position(&signal.symbol, price)?;
                    return Ok(Fill {
                        action: FillAction::Close,
                        quantity: closed,
                        price: Some(price),
                        realized_pnl: realized,
                        order_id: None,
                    });
                }
                let realized = match signal.side {
                    Side::Short => broker.sell(&signal.symbol, quantity, price)?,
                    _ => broker.buy(&signal.symbol, quantity, price)?,
                };
                Ok(Fill {
                    action: FillAction::Open,
                    quantity,
                    price: Some(price),
                    realized_pnl: realized,
                    order_id: None,
                })
            }
            ExecutionRoute::Live(_) => Err(EngineError::Execution(
                "live route requires the async handle".to_string(),
            )),
        }
    }

    async fn execute_live(&self, broker: &dyn LiveBroker, signal: &Signal) -> Result<Fill> {
        let close = signal.is_close();
        let request = OrderRequest {
            symbol: signal.symbol.clone(),
            side: signal.side,
            volume: self.quantity(signal),
            params: json!({
                "strategy_id": signal.strategy_id,
                "price": signal.price,
                "timestamp": signal.timestamp,
            }),
        };
        let volume = request.volume;

        let call = async {
            if close {
                broker.close_position(request).await
            } else {
                broker.open_position(request).await
            }
        };
        let ack = match tokio::time::timeout(self.live_timeout, call).await {
            Ok(Ok(ack)) => ack,
            Ok(Err(e)) => return Err(EngineError::Execution(format!("{e:#}"))),
            Err(_) => {
                warn!(
                    strategy_id = %signal.strategy_id,
                    symbol = %signal.symbol,
                    timeout_ms = self.live_timeout.as_millis() as u64,
                    "live broker call timed out"
                );
                return Err(EngineError::Execution(format!(
                    "live broker timed out after {:?}",
                    self.live_timeout
                )));
            }
        };

        Ok(Fill {
            action: if close { FillAction::Close } else { FillAction::Open },
            quantity: volume,
            price: ack.filled_price.or(signal.price),
            realized_pnl: ack.realized_pnl.unwrap_or(0.0),
            order_id: Some(ack.order_id),
        })
    }
}
