//! Data management module
//!
//! Ticks, bars, bar synthesis, bounded history and the on-disk bar cache.

pub mod aggregator;
pub mod bar;
pub mod cache;
pub mod history;
pub mod timeframe;

pub use aggregator::*;
pub use bar::*;
pub use cache::*;
pub use history::*;
pub use timeframe::*;
