//! Strategy engine module
//!
//! Provides the strategy trait, signals, parameter schemas, the per-unit
//! runtime and the registry of built-in strategies.

pub mod base;
pub mod implementations;
pub mod params;
pub mod registry;
pub mod signal;
pub mod unit;

pub use base::*;
pub use implementations::*;
pub use params::*;
pub use registry::*;
pub use signal::*;
pub use unit::*;
