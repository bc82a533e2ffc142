//! Backtest replay module
//!
//! Drives historical bars through a strategy unit and a ledger-backed
//! simulation, then hands the results to an analytics sink.

pub mod report;
pub mod runner;

pub use report::*;
pub use runner::*;
