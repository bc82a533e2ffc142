//! Strategy Registry - maps strategy type names to factories

use crate::data::Timeframe;
use crate::error::EngineError;
use crate::strategy::implementations::{RsiStrategy, SmaCrossStrategy};
use crate::strategy::{Strategy, StrategyUnit};
use crate::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

pub type StrategyFactory = Box<dyn Fn(&Value) -> anyhow::Result<Box<dyn Strategy>> + Send + Sync>;

/// Declarative description of a unit, as loaded from a strategies file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyDefinition {
    pub id: String,
    /// Registry key, case-insensitive (e.g. "SMA_CROSS", "rsi")
    pub strategy_type: String,
    pub symbols: Vec<String>,
    pub timeframe: Timeframe,
    pub lookback: usize,
    #[serde(default)]
    pub params: Value,
}

/// Strategy Registry - manages strategy types and their factories
pub struct StrategyRegistry {
    factories: HashMap<String, StrategyFactory>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        let mut registry = Self {
            factories: HashMap::new(),
        };

        // Register built-in strategies
        registry.register_strategy("SMA_CROSS", |params| {
            let fast = params.get("fast").and_then(Value::as_u64).unwrap_or(10) as usize;
            let slow = params.get("slow").and_then(Value::as_u64).unwrap_or(30) as usize;
            Ok(Box::new(SmaCrossStrategy::new(fast, slow)?))
        });

        registry.register_strategy("RSI", |params| {
            let period = params.get("period").and_then(Value::as_u64).unwrap_or(14) as usize;
            Ok(Box::new(RsiStrategy::new(period)?))
        });

        registry
    }

    /// Register a strategy factory
    pub fn register_strategy<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&Value) -> anyhow::Result<Box<dyn Strategy>> + Send + Sync + 'static,
    {
        self.factories.insert(name.to_uppercase(), Box::new(factory));
    }

    /// Create a strategy instance by type name
    pub fn create_strategy(&self, strategy_type: &str, params: &Value) -> Result<Box<dyn Strategy>> {
        let key = strategy_type.to_uppercase();
        let factory = self
            .factories
            .get(&key)
            .ok_or_else(|| EngineError::validation(format!("Unknown strategy type: {key}")))?;

        factory(params).map_err(|e| EngineError::validation(format!("{key}: {e:#}")))
    }

    /// Build a unit from a definition; parameters are validated at registration
    pub fn build_unit(&self, definition: StrategyDefinition) -> Result<StrategyUnit> {
        let logic = self.create_strategy(&definition.strategy_type, &definition.params)?;
        Ok(StrategyUnit::new(
            definition.id,
            definition.symbols,
            definition.timeframe,
            definition.lookback,
            logic,
        )
        .with_params(definition.params))
    }

    /// Get list of available strategy types
    pub fn get_available_strategies(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    /// Check if a strategy type is available
    pub fn has_strategy(&self, strategy_type: &str) -> bool {
        self.factories.contains_key(&strategy_type.to_uppercase())
    }
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn builtins_are_registered() {
        let registry = StrategyRegistry::new();
        assert_eq!(registry.get_available_strategies(), ["RSI", "SMA_CROSS"]);
        assert!(registry.has_strategy("sma_cross"));
    }

    #[test]
    fn builds_unit_from_json_definition() {
        let definition: StrategyDefinition = serde_json::from_value(json!({
            "id": "btc-cross",
            "strategy_type": "sma_cross",
            "symbols": ["BTC/USDT"],
            "timeframe": "5m",
            "lookback": 50,
            "params": { "fast": 5, "slow": 20 }
        }))
        .unwrap();

        let unit = StrategyRegistry::new().build_unit(definition).unwrap();
        assert_eq!(unit.id, "btc-cross");
        assert_eq!(unit.timeframe.as_millis(), 300_000);
        assert_eq!(unit.logic.name(), "SMA_CROSS");
    }

    #[test]
    fn unknown_type_is_a_validation_error() {
        let err = StrategyRegistry::new()
            .create_strategy("MACD", &Value::Null)
            .err()
            .unwrap();
        assert!(matches!(err, EngineError::Validation(_)));
    }
}
