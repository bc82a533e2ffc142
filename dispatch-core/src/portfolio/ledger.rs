//! Position and realized P&L bookkeeping

use crate::error::EngineError;
use crate::portfolio::{Position, PositionSide};
use crate::Result;
use std::collections::HashMap;
use tracing::debug;

/// Quantities within this distance of zero count as flat
const QTY_EPSILON: f64 = 1e-9;

fn check_fill(quantity: f64, price: f64) -> Result<()> {
    if !(quantity.is_finite() && quantity > 0.0) {
        return Err(EngineError::validation(format!(
            "quantity must be positive, got {quantity}"
        )));
    }
    if !(price.is_finite() && price > 0.0) {
        return Err(EngineError::validation(format!(
            "price must be positive, got {price}"
        )));
    }
    Ok(())
}

/// Per-symbol positions plus the cash they settle into
#[derive(Debug, Clone, Default)]
pub struct PositionLedger {
    positions: HashMap<String, Position>,
    cash: f64,
    realized_pnl: f64,
}

impl PositionLedger {
    pub fn new(initial_cash: f64) -> Self {
        Self {
            positions: HashMap::new(),
            cash: initial_cash,
            realized_pnl: 0.0,
        }
    }

    /// Open or grow a position on `side`.
    ///
    /// Growing recomputes the entry as a volume-weighted average. Adding on the
    /// opposite side of an open position is rejected; use [`Self::reduce`].
    pub fn add(&mut self, symbol: &str, side: PositionSide, quantity: f64, price: f64) -> Result<()> {
        check_fill(quantity, price)?;

        match self.positions.get_mut(symbol) {
            None => {
                self.positions
                    .insert(symbol.to_string(), Position::new(symbol, side, quantity, price));
            }
            Some(position) if position.side == side => {
                let total = position.quantity + quantity;
                position.avg_entry_price =
                    (position.avg_entry_price * position.quantity + price * quantity) / total;
                position.quantity = total;
            }
            Some(position) => {
                return Err(EngineError::validation(format!(
                    "cannot add {side:?} to open {:?} position in {symbol}",
                    position.side
                )));
            }
        }
        debug!(symbol, ?side, quantity, price, "position increased");
        Ok(())
    }

    /// Shrink the open position and return the realized P&L.
    ///
    /// Reducing by more than the open quantity closes it and opens the
    /// remainder on the opposite side at `price`. Reducing a symbol with no
    /// position is a no-op that realizes nothing.
    pub fn reduce(&mut self, symbol: &str, quantity: f64, price: f64) -> Result<f64> {
        check_fill(quantity, price)?;

        let Some(position) = self.positions.get_mut(symbol) else {
            return Ok(0.0);
        };

        let closed_qty = quantity.min(position.quantity);
        let realized = position.pnl_for(closed_qty, price);
        let remaining = position.quantity - quantity;
        let side = position.side;

        if remaining > QTY_EPSILON {
            position.quantity = remaining;
        } else {
            self.positions.remove(symbol);
            if -remaining > QTY_EPSILON {
                self.positions.insert(
                    symbol.to_string(),
                    Position::new(symbol, side.opposite(), -remaining, price),
                );
                debug!(symbol, from = ?side, quantity = -remaining, "position flipped");
            }
        }

        self.realized_pnl += realized;
        self.cash += realized;
        Ok(realized)
    }

    /// Unrealized P&L of the open position at `price`, zero if flat
    pub fn pnl(&self, symbol: &str, price: f64) -> f64 {
        self.positions
            .get(symbol)
            .map_or(0.0, |p| p.unrealized_pnl(price))
    }

    /// Cash plus unrealized P&L. Symbols without a mark are valued at entry.
    pub fn equity(&self, marks: &HashMap<String, f64>) -> f64 {
        let unrealized: f64 = self
            .positions
            .values()
            .map(|p| {
                let mark = marks.get(&p.symbol).copied().unwrap_or(p.avg_entry_price);
                p.unrealized_pnl(mark)
            })
            .sum();
        self.cash + unrealized
    }

    pub fn position(&self, symbol: &str) -> Option<&Position> {
        self.positions.get(symbol)
    }

    pub fn positions(&self) -> impl Iterator<Item = &Position> {
        self.positions.values()
    }

    pub fn cash(&self) -> f64 {
        self.cash
    }

    pub fn realized_pnl(&self) -> f64 {
        self.realized_pnl
    }
}
