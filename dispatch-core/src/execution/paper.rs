//! Ledger-backed paper broker

use crate::portfolio::{Position, PositionLedger, PositionSide};
use crate::Result;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::info;

/// Trade `quantity` on `side` against `ledger`.
///
/// Same side (or flat) grows the position; the opposite side reduces it and
/// flips when the order is larger than the open quantity. Returns realized P&L.
pub fn trade_side(
    ledger: &mut PositionLedger,
    symbol: &str,
    side: PositionSide,
    quantity: f64,
    price: f64,
) -> Result<f64> {
    let opposite = ledger.position(symbol).is_some_and(|p| p.side != side);
    if opposite {
        ledger.reduce(symbol, quantity, price)
    } else {
        ledger.add(symbol, side, quantity, price).map(|_| 0.0)
    }
}

/// Close whatever is open in `symbol`; returns (closed quantity, realized P&L)
pub fn close_all(ledger: &mut PositionLedger, symbol: &str, price: f64) -> Result<(f64, f64)> {
    match ledger.position(symbol).map(|p| p.quantity) {
        Some(quantity) => Ok((quantity, ledger.reduce(symbol, quantity, price)?)),
        None => Ok((0.0, 0.0)),
    }
}

/// Simulated broker with immediate fills at the requested price
#[derive(Debug)]
pub struct PaperBroker {
    ledger: Mutex<PositionLedger>,
    marks: Mutex<HashMap<String, f64>>,
}

impl PaperBroker {
    pub fn new(initial_cash: f64) -> Self {
        Self {
            ledger: Mutex::new(PositionLedger::new(initial_cash)),
            marks: Mutex::new(HashMap::new()),
        }
    }

    fn ledger(&self) -> MutexGuard<'_, PositionLedger> {
        self.ledger.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn marks(&self) -> MutexGuard<'_, HashMap<String, f64>> {
        self.marks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn buy(&self, symbol: &str, quantity: f64, price: f64) -> Result<f64> {
        let realized = trade_side(&mut self.ledger(), symbol, PositionSide::Long, quantity, price)?;
        info!(symbol, quantity, price, realized, "paper buy");
        Ok(realized)
    }

    pub fn sell(&self, symbol: &str, quantity: f64, price: f64) -> Result<f64> {
        let realized = trade_side(&mut self.ledger(), symbol, PositionSide::Short, quantity, price)?;
        info!(symbol, quantity, price, realized, "paper sell");
        Ok(realized)
    }

    /// Returns (closed quantity, realized P&L); flat symbols close nothing
    pub fn close_position(&self, symbol: &str, price: f64) -> Result<(f64, f64)> {
        let (quantity, realized) = close_all(&mut self.ledger(), symbol, price)?;
        if quantity > 0.0 {
            info!(symbol, quantity, price, realized, "paper close");
        }
        Ok((quantity, realized))
    }

    /// Record the latest traded price for valuation
    pub fn mark(&self, symbol: &str, price: f64) {
        if price.is_finite() && price > 0.0 {
            self.marks().insert(symbol.to_string(), price);
        }
    }

    pub fn last_price(&self, symbol: &str) -> Option<f64> {
        self.marks().get(symbol).copied()
    }

    pub fn equity(&self) -> f64 {
        let marks = self.marks().clone();
        self.ledger().equity(&marks)
    }

    pub fn position(&self, symbol: &str) -> Option<Position> {
        self.ledger().position(symbol).cloned()
    }

    pub fn positions(&self) -> Vec<Position> {
        let mut all: Vec<Position> = self.ledger().positions().cloned().collect();
        all.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        all
    }

    pub fn cash(&self) -> f64 {
        self.ledger().cash()
    }

    pub fn realized_pnl(&self) -> f64 {
        self.ledger().realized_pnl()
    }
}
