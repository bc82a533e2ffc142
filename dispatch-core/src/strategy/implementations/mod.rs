//! Built-in strategies

pub mod rsi_strategy;
pub mod sma_cross;

pub use rsi_strategy::*;
pub use sma_cross::*;
