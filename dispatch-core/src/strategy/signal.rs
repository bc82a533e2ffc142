//! Trading signals

use crate::error::EngineError;
use crate::portfolio::PositionSide;
use crate::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Open or close exposure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Intent {
    Enter,
    Exit,
}

/// Direction of the exposure a signal asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Long,
    Short,
    Flat,
}

impl Side {
    pub fn position_side(self) -> Option<PositionSide> {
        match self {
            Side::Long => Some(PositionSide::Long),
            Side::Short => Some(PositionSide::Short),
            Side::Flat => None,
        }
    }
}

/// What a strategy hands back; the runtime stamps identity and time onto it
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StrategySignal {
    pub intent: Intent,
    pub side: Side,
    pub quantity: Option<f64>,
    pub price: Option<f64>,
}

impl StrategySignal {
    pub fn enter(side: Side) -> Self {
        Self {
            intent: Intent::Enter,
            side,
            quantity: None,
            price: None,
        }
    }

    pub fn enter_long() -> Self {
        Self::enter(Side::Long)
    }

    pub fn enter_short() -> Self {
        Self::enter(Side::Short)
    }

    pub fn exit() -> Self {
        Self {
            intent: Intent::Exit,
            side: Side::Flat,
            quantity: None,
            price: None,
        }
    }

    pub fn with_quantity(mut self, quantity: f64) -> Self {
        self.quantity = Some(quantity);
        self
    }

    pub fn at_price(mut self, price: f64) -> Self {
        self.price = Some(price);
        self
    }
}

/// Immutable instruction routed to execution exactly once
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub intent: Intent,
    pub side: Side,
    pub symbol: String,
    #[serde(default)]
    pub quantity: Option<f64>,
    #[serde(default)]
    pub price: Option<f64>,
    pub strategy_id: String,
    /// Epoch milliseconds
    pub timestamp: i64,
}

impl Signal {
    pub fn from_strategy(
        emitted: StrategySignal,
        strategy_id: impl Into<String>,
        symbol: impl Into<String>,
        timestamp: i64,
    ) -> Self {
        Self {
            intent: emitted.intent,
            side: emitted.side,
            symbol: symbol.into(),
            quantity: emitted.quantity,
            price: emitted.price,
            strategy_id: strategy_id.into(),
            timestamp,
        }
    }

    /// Decode an externally produced signal; shape errors are schema errors
    pub fn from_json(value: Value) -> Result<Self> {
        let signal: Signal =
            serde_json::from_value(value).map_err(|e| EngineError::invalid_schema(e.to_string()))?;
        signal.validate()?;
        Ok(signal)
    }

    pub fn validate(&self) -> Result<()> {
        if self.strategy_id.trim().is_empty() {
            return Err(EngineError::invalid_schema("strategy_id is empty"));
        }
        if self.symbol.trim().is_empty() {
            return Err(EngineError::invalid_schema("symbol is empty"));
        }
        if let Some(quantity) = self.quantity {
            if !(quantity.is_finite() && quantity > 0.0) {
                return Err(EngineError::invalid_schema(format!(
                    "quantity must be positive, got {quantity}"
                )));
            }
        }
        if let Some(price) = self.price {
            if !(price.is_finite() && price > 0.0) {
                return Err(EngineError::invalid_schema(format!(
                    "price must be positive, got {price}"
                )));
            }
        }
        Ok(())
    }

    /// Exit, or Enter towards Flat
    pub fn is_close(&self) -> bool {
        self.intent == Intent::Exit || self.side == Side::Flat
    }

    pub fn lock_key(&self) -> (String, String) {
        (self.strategy_id.clone(), self.symbol.clone())
    }
}
