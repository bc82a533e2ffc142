//! Position tracking

use serde::{Deserialize, Serialize};

/// Position side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionSide {
    /// Long position
    Long,
    /// Short position
    Short,
}

impl PositionSide {
    /// +1 for long, -1 for short
    pub fn sign(self) -> f64 {
        match self {
            PositionSide::Long => 1.0,
            PositionSide::Short => -1.0,
        }
    }

    pub fn opposite(self) -> Self {
        match self {
            PositionSide::Long => PositionSide::Short,
            PositionSide::Short => PositionSide::Long,
        }
    }
}

/// Open position in one symbol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// Symbol (e.g., "BTC/USDT")
    pub symbol: String,
    /// Position side (Long/Short)
    pub side: PositionSide,
    /// Always positive; closed positions are removed from the ledger
    pub quantity: f64,
    /// Volume-weighted entry price
    pub avg_entry_price: f64,
}

impl Position {
    /// Create new position
    pub fn new(symbol: impl Into<String>, side: PositionSide, quantity: f64, price: f64) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            quantity,
            avg_entry_price: price,
        }
    }

    /// P&L for `quantity` units if closed at `price`
    pub fn pnl_for(&self, quantity: f64, price: f64) -> f64 {
        (price - self.avg_entry_price) * quantity * self.side.sign()
    }

    /// Unrealized P&L at the given mark
    pub fn unrealized_pnl(&self, price: f64) -> f64 {
        self.pnl_for(self.quantity, price)
    }

    /// Get entry value
    pub fn entry_value(&self) -> f64 {
        self.avg_entry_price * self.quantity
    }
}
