//! Tick and OHLCV bar data structures

use serde::{Deserialize, Serialize};

/// Single price observation from the market-data feed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    /// Symbol (e.g., "BTC/USDT")
    pub symbol: String,
    /// Epoch milliseconds
    pub time: i64,
    /// Trade or quote price
    pub price: f64,
    /// Traded volume, zero for quote-only feeds
    #[serde(default)]
    pub volume: f64,
}

impl Tick {
    /// Create a new tick
    pub fn new(symbol: impl Into<String>, time: i64, price: f64, volume: f64) -> Self {
        Self {
            symbol: symbol.into(),
            time,
            price,
            volume,
        }
    }

    /// Whether the tick can be fed to an aggregator
    pub fn is_valid(&self) -> bool {
        is_valid_observation(self.time, self.price, self.volume)
    }
}

pub(crate) fn is_valid_observation(time: i64, price: f64, volume: f64) -> bool {
    time >= 0 && price.is_finite() && price > 0.0 && volume.is_finite() && volume >= 0.0
}

/// OHLCV bar keyed by the start of its bucket
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    /// Bucket start, epoch milliseconds
    pub time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Bar {
    /// Create a new bar
    pub fn new(time: i64, open: f64, high: f64, low: f64, close: f64, volume: f64) -> Self {
        Self {
            time,
            open,
            high,
            low,
            close,
            volume,
        }
    }

    /// Bar opened by a single observation
    pub fn opening(time: i64, price: f64, volume: f64) -> Self {
        Self::new(time, price, price, price, price, volume)
    }

    /// Synthetic bar for a bucket with no activity
    pub fn flat(time: i64, price: f64) -> Self {
        Self::new(time, price, price, price, price, 0.0)
    }

    /// Fold another observation from the same bucket into the bar
    pub fn absorb(&mut self, price: f64, volume: f64) {
        self.high = self.high.max(price);
        self.low = self.low.min(price);
        self.close = price;
        self.volume += volume;
    }

    /// Check if bar is bullish
    pub fn is_bullish(&self) -> bool {
        self.close > self.open
    }

    /// Get total range (high - low)
    pub fn range(&self) -> f64 {
        self.high - self.low
    }
}
