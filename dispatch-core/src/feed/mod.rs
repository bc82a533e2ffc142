//! Market data collaborators and connection supervision

use crate::config::ReconnectConfig;
use crate::data::{Bar, Timeframe};
use crate::error::EngineError;
use crate::events::{EngineEvent, EventBus};
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, warn};

/// Request for the most recent `outputsize` bars of `symbol`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRequest {
    pub symbol: String,
    pub interval: Timeframe,
    pub outputsize: usize,
}

/// Source of historical bars used for warmup
#[async_trait]
pub trait HistoricalDataProvider: Send + Sync {
    /// Bars in ascending time order
    async fn fetch_history(&self, request: &HistoryRequest) -> anyhow::Result<Vec<Bar>>;
}

/// Real-time tick source. Ticks reach the engine through `Engine::distribute`.
#[async_trait]
pub trait MarketDataSource: Send + Sync {
    /// Replace the subscribed symbol set
    async fn update_symbols(&self, symbols: &[String]) -> anyhow::Result<()>;

    async fn connect(&self) -> anyhow::Result<()>;

    async fn cleanup(&self) -> anyhow::Result<()>;
}

/// Capped exponential backoff
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl ReconnectPolicy {
    /// Delay after the `attempt`-th failure (0-based): `base * 2^attempt`, capped
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

impl From<&ReconnectConfig> for ReconnectPolicy {
    fn from(config: &ReconnectConfig) -> Self {
        Self {
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            max_attempts: config.max_attempts.max(1),
        }
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from(&ReconnectConfig::default())
    }
}

/// Call `connect` until it succeeds or the policy runs out of attempts.
///
/// Exhaustion publishes [`EngineEvent::ConnectionLost`] and returns
/// [`EngineError::BrokerUnavailable`]; nothing retries after that.
pub async fn connect_with_retry(
    source: &dyn MarketDataSource,
    policy: &ReconnectPolicy,
    events: &EventBus,
) -> Result<u32> {
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        match source.connect().await {
            Ok(()) => {
                info!(attempts = attempt + 1, "market data source connected");
                return Ok(attempt + 1);
            }
            Err(err) => {
                attempt += 1;
                if attempt >= max_attempts {
                    let reason = format!("{err:#}");
                    warn!(attempts = attempt, %reason, "giving up on market data source");
                    events.publish(EngineEvent::ConnectionLost {
                        attempts: attempt,
                        reason: reason.clone(),
                    });
                    return Err(EngineError::BrokerUnavailable(reason));
                }
                let backoff = policy.delay_for(attempt - 1);
                warn!(
                    ?err,
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    "market data connect failed; retrying"
                );
                tokio::time::sleep(backoff).await;
            }
        }
    }
}
