//! Execution backends and the signal adapter in front of them

pub mod adapter;
pub mod live;
pub mod paper;
pub mod simulation;

pub use adapter::*;
pub use live::*;
pub use paper::*;
pub use simulation::*;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FillAction {
    Open,
    Close,
}

/// What a backend reports after acting on a signal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fill {
    pub action: FillAction,
    pub quantity: f64,
    /// Known for simulated backends; live brokers may not report it
    pub price: Option<f64>,
    pub realized_pnl: f64,
    #[serde(default)]
    pub order_id: Option<String>,
}
