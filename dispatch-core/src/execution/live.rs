//! External broker backend

use crate::strategy::Side;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Order handed to a live broker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: Side,
    pub volume: f64,
    /// Broker-specific extras (client ids, price hints)
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderAck {
    pub order_id: String,
    #[serde(default)]
    pub filled_price: Option<f64>,
    #[serde(default)]
    pub realized_pnl: Option<f64>,
}

/// Asynchronous broker connection used in live mode
#[async_trait]
pub trait LiveBroker: Send + Sync {
    async fn open_position(&self, request: OrderRequest) -> anyhow::Result<OrderAck>;

    async fn close_position(&self, request: OrderRequest) -> anyhow::Result<OrderAck>;
}
