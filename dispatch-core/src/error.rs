//! Engine error taxonomy

use crate::lifecycle::LifecycleState;
use thiserror::Error;

/// Errors surfaced by engine operations
#[derive(Debug, Error)]
pub enum EngineError {
    /// Rejected input (missing symbols, bad timeframe, out-of-range params)
    #[error("validation error: {0}")]
    Validation(String),

    /// Malformed signal
    #[error("invalid signal schema: {0}")]
    InvalidSchema(String),

    /// An illegal lifecycle edge was requested
    #[error("transition rejected for {id}: {from} -> {to}")]
    TransitionRejected {
        id: String,
        from: LifecycleState,
        to: LifecycleState,
    },

    /// Historical data could not prime a strategy
    #[error("warmup failed for {id}: {reason}")]
    WarmupFailed { id: String, reason: String },

    /// Market data or live broker connection is gone
    #[error("broker unavailable: {0}")]
    BrokerUnavailable(String),

    /// Execution backend reported a failure
    #[error("execution failed: {0}")]
    Execution(String),

    #[error("unknown strategy: {0}")]
    UnknownStrategy(String),

    #[error("cache error: {0}")]
    Cache(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl EngineError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_schema(msg: impl Into<String>) -> Self {
        Self::InvalidSchema(msg.into())
    }
}
