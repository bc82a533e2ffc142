//! Engine notifications

use crate::execution::HandleOutcome;
use crate::lifecycle::LifecycleState;
use crate::strategy::Signal;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

/// Everything observers can hear about
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EngineEvent {
    LifecycleChanged {
        strategy_id: String,
        from: LifecycleState,
        to: LifecycleState,
        meta: Value,
        at: DateTime<Utc>,
    },
    WarmupCompleted {
        strategy_id: String,
        symbols: Vec<String>,
        bars: usize,
    },
    StrategyFaulted {
        strategy_id: String,
        error: String,
    },
    SignalHandled {
        signal: Signal,
        outcome: HandleOutcome,
    },
    /// Reconnect budget exhausted; no further attempts are made
    ConnectionLost {
        attempts: u32,
        reason: String,
    },
}

/// Broadcast fan-out for [`EngineEvent`]s
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Send to all subscribers (ignore errors if no receivers)
    pub fn publish(&self, event: EngineEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
