//! Synchronous simulation context used by backtest replay

use crate::execution::paper::{close_all, trade_side};
use crate::execution::{Fill, FillAction};
use crate::portfolio::{Position, PositionLedger, PositionSide};
use crate::strategy::Signal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Backend for replayed signals; calls complete before returning
pub trait SimulationContext: Send {
    fn enter(&mut self, signal: &Signal, quantity: f64) -> anyhow::Result<Fill>;

    fn exit(&mut self, signal: &Signal) -> anyhow::Result<Fill>;

    /// Latest price seen for `symbol`
    fn mark(&mut self, _symbol: &str, _price: f64) {}
}

/// A closed (or partially closed) round trip
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub id: Uuid,
    pub strategy_id: String,
    pub symbol: String,
    pub side: PositionSide,
    pub quantity: f64,
    pub entry_price: f64,
    pub exit_price: f64,
    pub entry_time: i64,
    pub exit_time: i64,
    pub pnl: f64,
}

/// [`SimulationContext`] backed by a [`PositionLedger`] that records trades
#[derive(Debug, Default)]
pub struct LedgerSimulation {
    ledger: PositionLedger,
    marks: HashMap<String, f64>,
    opened_at: HashMap<String, i64>,
    trades: Vec<Trade>,
}

impl LedgerSimulation {
    pub fn new(initial_cash: f64) -> Self {
        Self {
            ledger: PositionLedger::new(initial_cash),
            ..Self::default()
        }
    }

    fn price_for(&self, signal: &Signal) -> anyhow::Result<f64> {
        signal
            .price
            .or_else(|| self.marks.get(&signal.symbol).copied())
            .ok_or_else(|| anyhow::anyhow!("no price available for {}", signal.symbol))
    }

    fn record_close(&mut self, signal: &Signal, closed: &Position, quantity: f64, price: f64, pnl: f64) {
        if quantity <= 0.0 {
            return;
        }
        self.trades.push(Trade {
            id: Uuid::new_v4(),
            strategy_id: signal.strategy_id.clone(),
            symbol: signal.symbol.clone(),
            side: closed.side,
            quantity,
            entry_price: closed.avg_entry_price,
            exit_price: price,
            entry_time: self
                .opened_at
                .get(&signal.symbol)
                .copied()
                .unwrap_or(signal.timestamp),
            exit_time: signal.timestamp,
            pnl,
        });
    }

    pub fn trades(&self) -> &[Trade] {
        &self.trades
    }

    pub fn ledger(&self) -> &PositionLedger {
        &self.ledger
    }

    pub fn equity(&self) -> f64 {
        self.ledger.equity(&self.marks)
    }
}

impl SimulationContext for LedgerSimulation {
    fn enter(&mut self, signal: &Signal, quantity: f64) -> anyhow::Result<Fill> {
        let Some(side) = signal.side.position_side() else {
            return self.exit(signal);
        };
        let price = self.price_for(signal)?;
        let symbol = signal.symbol.as_str();
        let before = self.ledger.position(symbol).cloned();
        let realized = trade_side(&mut self.ledger, symbol, side, quantity, price)?;

        match before {
            Some(prev) if prev.side != side => {
                self.record_close(signal, &prev, quantity.min(prev.quantity), price, realized);
                if quantity > prev.quantity {
                    self.opened_at.insert(symbol.to_string(), signal.timestamp);
                }
            }
            Some(_) => {}
            None => {
                self.opened_at.insert(symbol.to_string(), signal.timestamp);
            }
        }

        Ok(Fill {
            action: FillAction::Open,
            quantity,
            price: Some(price),
            realized_pnl: realized,
            order_id: None,
        })
    }

    fn exit(&mut self, signal: &Signal) -> anyhow::Result<Fill> {
        let symbol = signal.symbol.as_str();
        let Some(before) = self.ledger.position(symbol).cloned() else {
            return Ok(Fill {
                action: FillAction::Close,
                quantity: 0.0,
                price: signal.price,
                realized_pnl: 0.0,
                order_id: None,
            });
        };

        let price = self.price_for(signal)?;
        let (quantity, realized) = close_all(&mut self.ledger, symbol, price)?;
        self.record_close(signal, &before, quantity, price, realized);
        self.opened_at.remove(symbol);

        Ok(Fill {
            action: FillAction::Close,
            quantity,
            price: Some(price),
            realized_pnl: realized,
            order_id: None,
        })
    }

    fn mark(&mut self, symbol: &str, price: f64) {
        self.marks.insert(symbol.to_string(), price);
    }
}
